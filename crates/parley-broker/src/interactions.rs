//! Interaction state machine and waiters.
//!
//! `Pending → Resolved | TimedOut | Cancelled`, each transition at most once.
//!
//! Waiters are oneshot senders kept in two FIFO lists: one per interaction
//! and one global list for "any interaction" waits. Settlement happens under
//! the state lock, and a waiter whose own timeout fires removes itself under
//! the same lock, so a waiter is either settled or timed out, never both.
//!
//! Resolve and timeout settle every per-interaction waiter and then at most
//! one global waiter. Close settles only the per-interaction waiters: an
//! administrative cancel is not the user action a global wait is for.
//!
//! Timeout timers and retention GC run on a [`TaskTracker`] and stop when
//! [`InteractionManager::shutdown`] cancels them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use parley_core::errors::ParleyError;
use parley_core::events::BrokerEvent;
use parley_core::ids::{InteractionId, SessionId};
use parley_core::interaction::{Interaction, InteractionResult, InteractionSpec, InteractionStatus};
use parley_core::settings::BrokerSettings;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::events::EventBus;

/// Terminal outcome delivered to waiters.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    /// Interaction that settled.
    pub interaction_id: InteractionId,
    /// Terminal status.
    pub status: InteractionStatus,
    /// Stored result.
    pub result: InteractionResult,
}

/// Manager limits.
#[derive(Clone, Debug)]
pub struct InteractionConfig {
    /// Concurrently pending interactions allowed.
    pub max_active: usize,
    /// How long terminal interactions stay queryable.
    pub retention: Duration,
}

impl InteractionConfig {
    /// Values from broker settings.
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self {
            max_active: settings.max_active_interactions,
            retention: Duration::from_millis(settings.retention_ms),
        }
    }
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self::from_settings(&BrokerSettings::default())
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Settlement>,
}

struct Record {
    interaction: Interaction,
    seq: u64,
    waiters: VecDeque<Waiter>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    records: HashMap<InteractionId, Record>,
    any_waiters: VecDeque<Waiter>,
    next_seq: u64,
    next_waiter: u64,
}

impl State {
    fn active_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.interaction.status == InteractionStatus::Pending)
            .count()
    }
}

/// Owns interaction records, their timers and their waiters.
pub struct InteractionManager {
    config: InteractionConfig,
    state: Mutex<State>,
    events: EventBus,
    cancel: CancellationToken,
    tasks: TaskTracker,
    this: Weak<Self>,
}

impl InteractionManager {
    /// New manager publishing on `events`.
    pub fn new(config: InteractionConfig, events: EventBus) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            state: Mutex::new(State::default()),
            events,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            this: this.clone(),
        })
    }

    /// Create a pending interaction, arming its timeout if the spec has one.
    pub fn create(
        &self,
        requester_id: SessionId,
        responder_id: SessionId,
        spec: InteractionSpec,
    ) -> Result<InteractionId, ParleyError> {
        let id = InteractionId::new();
        let timeout = spec.timeout_ms.map(Duration::from_millis);
        let interaction = Interaction {
            id: id.clone(),
            requester_id: requester_id.clone(),
            responder_id: responder_id.clone(),
            spec,
            status: InteractionStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            result: None,
        };

        {
            let mut state = self.state.lock();
            if state.active_count() >= self.config.max_active {
                counter!("interactions_rejected_total").increment(1);
                return Err(ParleyError::capacity("active interactions", self.config.max_active));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            let timer = timeout.map(|after| self.spawn_timer(id.clone(), after));
            let _ = state.records.insert(
                id.clone(),
                Record {
                    interaction,
                    seq,
                    waiters: VecDeque::new(),
                    timer,
                },
            );
            #[allow(clippy::cast_precision_loss)]
            gauge!("interactions_active").set(state.active_count() as f64);
        }

        counter!("interactions_created_total").increment(1);
        info!(interaction_id = %id, requester_id = %requester_id, responder_id = %responder_id, ?timeout, "interaction created");
        self.events.emit(BrokerEvent::InteractionCreated {
            interaction_id: id.clone(),
            requester_id,
            responder_id,
        });
        Ok(id)
    }

    /// Resolve with a responder's result.
    pub fn resolve(&self, id: &InteractionId, result: InteractionResult) -> Result<(), ParleyError> {
        self.settle(id, InteractionStatus::Resolved, result)
    }

    /// Cancel a pending interaction. Not-pending or unknown ids are logged
    /// and reported as `false`.
    pub fn close(&self, id: &InteractionId) -> bool {
        match self.settle(id, InteractionStatus::Cancelled, InteractionResult::cancelled()) {
            Ok(()) => true,
            Err(e) => {
                debug!(interaction_id = %id, error = %e, "close ignored");
                false
            }
        }
    }

    /// Cancel every pending interaction, optionally scoped to a responder.
    pub fn close_all(&self, responder_id: Option<&SessionId>) -> Vec<InteractionId> {
        let ids: Vec<InteractionId> = self.list_active(responder_id).into_iter().map(|i| i.id).collect();
        ids.into_iter().filter(|id| self.close(id)).collect()
    }

    /// Wait for an interaction's outcome.
    ///
    /// Returns at once if it is already terminal. An interaction that timed
    /// out yields a timeout error; a cancelled one yields its
    /// `{cancelled: true}` result. If `timeout` passes first the waiter is
    /// removed and a timeout error returned, leaving the interaction pending.
    pub async fn wait_for(&self, id: &InteractionId, timeout: Duration) -> Result<InteractionResult, ParleyError> {
        let (waiter_id, mut rx) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let record = state.records.get_mut(id).ok_or_else(|| not_found(id))?;
            if record.interaction.status.is_terminal() {
                return settled_result(&Settlement {
                    interaction_id: id.clone(),
                    status: record.interaction.status,
                    result: record.interaction.result.clone().unwrap_or_default(),
                }, &record.interaction.spec);
            }
            let (tx, rx) = oneshot::channel();
            let waiter_id = state.next_waiter;
            state.next_waiter += 1;
            record.waiters.push_back(Waiter { id: waiter_id, tx });
            (waiter_id, rx)
        };
        let _guard = WaiterGuard {
            manager: self,
            slot: WaiterSlot::Interaction(id),
            waiter_id,
        };

        let settlement = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(settlement)) => settlement,
            Ok(Err(_)) => return Err(ParleyError::system("interaction waiter dropped")),
            Err(_) => {
                let removed = self
                    .state
                    .lock()
                    .records
                    .get_mut(id)
                    .is_some_and(|r| remove_waiter(&mut r.waiters, waiter_id));
                match rx.try_recv() {
                    Ok(settlement) if !removed => settlement,
                    _ => return Err(ParleyError::timeout(format!("wait for interaction {id}"), millis(timeout))),
                }
            }
        };

        let spec = self.get(id).map(|i| i.spec).unwrap_or_default();
        settled_result(&settlement, &spec)
    }

    /// Wait for the next resolve or timeout of any interaction.
    pub async fn wait_for_any(&self, timeout: Duration) -> Result<Settlement, ParleyError> {
        let (waiter_id, mut rx) = {
            let mut state = self.state.lock();
            let (tx, rx) = oneshot::channel();
            let waiter_id = state.next_waiter;
            state.next_waiter += 1;
            state.any_waiters.push_back(Waiter { id: waiter_id, tx });
            (waiter_id, rx)
        };
        let _guard = WaiterGuard {
            manager: self,
            slot: WaiterSlot::Any,
            waiter_id,
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(settlement)) => Ok(settlement),
            Ok(Err(_)) => Err(ParleyError::system("interaction waiter dropped")),
            Err(_) => {
                let removed = remove_waiter(&mut self.state.lock().any_waiters, waiter_id);
                match rx.try_recv() {
                    Ok(settlement) if !removed => Ok(settlement),
                    _ => Err(ParleyError::timeout("wait for any interaction", millis(timeout))),
                }
            }
        }
    }

    /// Pending interactions in creation order, optionally scoped to a responder.
    pub fn list_active(&self, responder_id: Option<&SessionId>) -> Vec<Interaction> {
        let state = self.state.lock();
        let mut records: Vec<&Record> = state
            .records
            .values()
            .filter(|r| r.interaction.status == InteractionStatus::Pending)
            .filter(|r| responder_id.is_none_or(|rid| r.interaction.responder_id == *rid))
            .collect();
        records.sort_by_key(|r| r.seq);
        records.into_iter().map(|r| r.interaction.clone()).collect()
    }

    /// Interaction by id, while tracked.
    pub fn get(&self, id: &InteractionId) -> Option<Interaction> {
        self.state.lock().records.get(id).map(|r| r.interaction.clone())
    }

    /// Number of pending interactions.
    pub fn active_count(&self) -> usize {
        self.state.lock().active_count()
    }

    /// Number of tracked interactions, terminal ones included until GC.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every timeout timer and GC task. Interactions still pending stay
    /// pending; callers close them first.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let _ = self.tasks.close();
    }

    /// Resolves once [`shutdown`](Self::shutdown) ran and every timer and GC
    /// task has exited.
    pub async fn wait_idle(&self) {
        self.tasks.wait().await;
    }

    fn expire(&self, id: &InteractionId) {
        match self.settle(id, InteractionStatus::TimedOut, InteractionResult::timed_out()) {
            Ok(()) => counter!("interactions_timed_out_total").increment(1),
            Err(e) => debug!(interaction_id = %id, error = %e, "timeout after settlement ignored"),
        }
    }

    fn settle(&self, id: &InteractionId, status: InteractionStatus, result: InteractionResult) -> Result<(), ParleyError> {
        let settlement = Settlement {
            interaction_id: id.clone(),
            status,
            result: result.clone(),
        };

        let settled = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let record = state.records.get_mut(id).ok_or_else(|| not_found(id))?;
            if record.interaction.status.is_terminal() {
                return Err(ParleyError::InteractionNotPending {
                    interaction_id: id.to_string(),
                    status: record.interaction.status.to_string(),
                });
            }

            record.interaction.status = status;
            record.interaction.resolved_at = Some(Utc::now());
            record.interaction.result = Some(result);
            if let Some(timer) = record.timer.take() {
                timer.abort();
            }

            let mut settled = 0usize;
            for waiter in record.waiters.drain(..) {
                if waiter.tx.send(settlement.clone()).is_ok() {
                    settled += 1;
                }
            }
            if status != InteractionStatus::Cancelled {
                while let Some(waiter) = state.any_waiters.pop_front() {
                    if waiter.tx.send(settlement.clone()).is_ok() {
                        settled += 1;
                        break;
                    }
                }
            }
            #[allow(clippy::cast_precision_loss)]
            gauge!("interactions_active").set(state.active_count() as f64);
            settled
        };

        self.spawn_gc(id.clone());
        counter!("interactions_settled_total", "status" => status.to_string()).increment(1);
        info!(interaction_id = %id, %status, waiters = settled, "interaction settled");
        self.events.emit(BrokerEvent::InteractionResolved {
            interaction_id: id.clone(),
            status,
        });
        Ok(())
    }

    fn spawn_timer(&self, id: InteractionId, after: Duration) -> JoinHandle<()> {
        let this = self.this.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(after) => {}
                () = cancel.cancelled() => return,
            }
            if let Some(manager) = this.upgrade() {
                manager.expire(&id);
            }
        })
    }

    fn spawn_gc(&self, id: InteractionId) {
        let this = self.this.clone();
        let cancel = self.cancel.clone();
        let retention = self.config.retention;
        let _ = self.tasks.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(retention) => {}
                () = cancel.cancelled() => return,
            }
            let Some(manager) = this.upgrade() else { return };
            let mut state = manager.state.lock();
            if state.records.get(&id).is_some_and(|r| r.interaction.status.is_terminal()) {
                let _ = state.records.remove(&id);
                debug!(interaction_id = %id, "interaction collected");
            }
        });
    }
}

impl std::fmt::Debug for InteractionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

enum WaiterSlot<'a> {
    Interaction(&'a InteractionId),
    Any,
}

/// Unregisters a waiter whose future is dropped before it settles.
struct WaiterGuard<'a> {
    manager: &'a InteractionManager,
    slot: WaiterSlot<'a>,
    waiter_id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.manager.state.lock();
        let _ = match self.slot {
            WaiterSlot::Interaction(id) => state
                .records
                .get_mut(id)
                .is_some_and(|r| remove_waiter(&mut r.waiters, self.waiter_id)),
            WaiterSlot::Any => remove_waiter(&mut state.any_waiters, self.waiter_id),
        };
    }
}

fn not_found(id: &InteractionId) -> ParleyError {
    ParleyError::InteractionNotFound {
        interaction_id: id.to_string(),
    }
}

fn remove_waiter(waiters: &mut VecDeque<Waiter>, waiter_id: u64) -> bool {
    let before = waiters.len();
    waiters.retain(|w| w.id != waiter_id);
    waiters.len() != before
}

fn settled_result(settlement: &Settlement, spec: &InteractionSpec) -> Result<InteractionResult, ParleyError> {
    if settlement.status == InteractionStatus::TimedOut {
        warn!(interaction_id = %settlement.interaction_id, "interaction timed out without a response");
        return Err(ParleyError::timeout(
            format!("interaction {}", settlement.interaction_id),
            spec.timeout_ms.unwrap_or_default(),
        ));
    }
    Ok(settlement.result.clone())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn manager() -> Arc<InteractionManager> {
        InteractionManager::new(InteractionConfig::default(), EventBus::new())
    }

    fn spec(timeout_ms: Option<u64>) -> InteractionSpec {
        InteractionSpec {
            title: "Deploy?".into(),
            message: "Ship it to production".into(),
            timeout_ms,
            ..InteractionSpec::default()
        }
    }

    fn create(m: &InteractionManager, responder: &str) -> InteractionId {
        m.create(SessionId::from("sess_a1"), SessionId::from(responder), spec(None)).unwrap()
    }

    #[tokio::test]
    async fn create_emits_event_and_lists_active() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let m = InteractionManager::new(InteractionConfig::default(), events);
        let id = create(&m, "sess_b1");
        assert_matches!(rx.recv().await.unwrap(), BrokerEvent::InteractionCreated { ref interaction_id, .. } if *interaction_id == id);
        assert_eq!(m.list_active(None).len(), 1);
        assert_eq!(m.get(&id).unwrap().status, InteractionStatus::Pending);
    }

    #[tokio::test]
    async fn transition_happens_at_most_once() {
        let m = manager();
        let id = create(&m, "sess_b1");
        m.resolve(&id, InteractionResult::button("ok")).unwrap();

        assert_matches!(
            m.resolve(&id, InteractionResult::button("cancel")),
            Err(ParleyError::InteractionNotPending { ref status, .. }) if status == "resolved"
        );
        assert!(!m.close(&id));
        m.expire(&id);

        let stored = m.get(&id).unwrap();
        assert_eq!(stored.status, InteractionStatus::Resolved);
        assert_eq!(stored.result.unwrap().button_id.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let m = manager();
        let ghost = InteractionId::from("ix_ghost");
        assert_matches!(m.resolve(&ghost, InteractionResult::dismissed()), Err(ParleyError::InteractionNotFound { .. }));
        assert_matches!(m.wait_for(&ghost, Duration::from_millis(10)).await, Err(ParleyError::InteractionNotFound { .. }));
        assert!(!m.close(&ghost));
    }

    #[tokio::test]
    async fn wait_for_terminal_returns_immediately() {
        let m = manager();
        let id = create(&m, "sess_b1");
        m.resolve(&id, InteractionResult::text("yes")).unwrap();
        let result = m.wait_for(&id, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(result.custom_text.as_deref(), Some("yes"));
    }

    #[tokio::test]
    async fn waiters_settle_in_registration_order() {
        let m = manager();
        let id = create(&m, "sess_b1");
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for n in 0..3 {
            let (m, id, order) = (m.clone(), id.clone(), order.clone());
            handles.push(tokio::spawn(async move {
                let result = m.wait_for(&id, Duration::from_secs(5)).await.unwrap();
                order.lock().push((n, result));
            }));
        }
        tokio::task::yield_now().await;
        assert_eq!(m.state.lock().records[&id].waiters.len(), 3);

        m.resolve(&id, InteractionResult::button("ok")).unwrap();
        for h in handles {
            h.await.unwrap();
        }
        let order = order.lock();
        let seen: Vec<i32> = order.iter().map(|(n, _)| *n).collect();
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(order.iter().all(|(_, r)| r.button_id.as_deref() == Some("ok")));
    }

    #[tokio::test(start_paused = true)]
    async fn close_does_not_satisfy_any_waiter_but_resolve_does() {
        let m = manager();
        let closed = create(&m, "sess_b1");
        let resolved = create(&m, "sess_b1");

        let waiter = {
            let m = m.clone();
            tokio::spawn(async move { m.wait_for_any(Duration::from_secs(10)).await })
        };
        tokio::task::yield_now().await;

        assert!(m.close(&closed));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        m.resolve(&resolved, InteractionResult::button("go")).unwrap();
        let settlement = waiter.await.unwrap().unwrap();
        assert_eq!(settlement.interaction_id, resolved);
        assert_eq!(settlement.status, InteractionStatus::Resolved);
    }

    #[tokio::test]
    async fn resolve_settles_only_oldest_any_waiter() {
        let m = manager();
        let id = create(&m, "sess_b1");
        let first = {
            let m = m.clone();
            tokio::spawn(async move { m.wait_for_any(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        let second = {
            let m = m.clone();
            tokio::spawn(async move { m.wait_for_any(Duration::from_millis(200)).await })
        };
        tokio::task::yield_now().await;

        m.resolve(&id, InteractionResult::dismissed()).unwrap();
        assert!(first.await.unwrap().unwrap().result.dismissed);
        assert_matches!(second.await.unwrap(), Err(ParleyError::Timeout { .. }));
    }

    #[tokio::test]
    async fn close_settles_own_waiters_with_cancelled() {
        let m = manager();
        let id = create(&m, "sess_b1");
        let waiter = {
            let (m, id) = (m.clone(), id.clone());
            tokio::spawn(async move { m.wait_for(&id, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        assert!(m.close(&id));
        assert!(waiter.await.unwrap().unwrap().cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn interaction_timeout_fails_waiter_and_clears_active() {
        let m = manager();
        let id = m
            .create(SessionId::from("sess_a1"), SessionId::from("sess_b1"), spec(Some(500)))
            .unwrap();

        let start = tokio::time::Instant::now();
        let err = m.wait_for(&id, Duration::from_millis(2000)).await.unwrap_err();
        assert_matches!(err, ParleyError::Timeout { after_ms: 500, .. });
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(2000));
        assert!(m.list_active(None).is_empty());
        assert_eq!(m.get(&id).unwrap().status, InteractionStatus::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_interaction_satisfies_any_waiter() {
        let m = manager();
        let id = m
            .create(SessionId::from("sess_a1"), SessionId::from("sess_b1"), spec(Some(100)))
            .unwrap();
        let settlement = m.wait_for_any(Duration::from_secs(1)).await.unwrap();
        assert_eq!(settlement.interaction_id, id);
        assert!(settlement.result.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn own_wait_timeout_removes_waiter_only() {
        let m = manager();
        let id = create(&m, "sess_b1");
        let err = m.wait_for(&id, Duration::from_millis(50)).await.unwrap_err();
        assert_matches!(err, ParleyError::Timeout { after_ms: 50, .. });
        assert!(m.state.lock().records[&id].waiters.is_empty());
        assert_eq!(m.get(&id).unwrap().status, InteractionStatus::Pending);

        let err = m.wait_for_any(Duration::from_millis(50)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(m.state.lock().any_waiters.is_empty());
    }

    #[tokio::test]
    async fn close_all_scoped_to_responder() {
        let m = manager();
        let scoped: Vec<InteractionId> = (0..3).map(|_| create(&m, "sess_b1")).collect();
        let other = create(&m, "sess_b2");

        let closed = m.close_all(Some(&SessionId::from("sess_b1")));
        assert_eq!(closed, scoped);
        let remaining = m.list_active(None);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, other);
    }

    #[tokio::test]
    async fn admission_limit_on_active_interactions() {
        let m = InteractionManager::new(
            InteractionConfig {
                max_active: 2,
                ..InteractionConfig::default()
            },
            EventBus::new(),
        );
        let first = create(&m, "sess_b1");
        let _second = create(&m, "sess_b1");
        let err = m
            .create(SessionId::from("sess_a1"), SessionId::from("sess_b1"), spec(None))
            .unwrap_err();
        assert_matches!(err, ParleyError::Capacity { limit: 2, .. });

        m.resolve(&first, InteractionResult::dismissed()).unwrap();
        let _third = create(&m, "sess_b1");
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_interactions_collected_after_retention() {
        let m = manager();
        let id = create(&m, "sess_b1");
        m.resolve(&id, InteractionResult::dismissed()).unwrap();
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(m.get(&id).is_some());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(m.get(&id).is_none());
        assert!(m.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_gc_and_timers() {
        let m = manager();
        let resolved = create(&m, "sess_b1");
        let timed = m
            .create(SessionId::from("sess_a1"), SessionId::from("sess_b1"), spec(Some(500)))
            .unwrap();
        m.resolve(&resolved, InteractionResult::dismissed()).unwrap();

        m.shutdown();
        tokio::time::timeout(Duration::from_secs(1), m.wait_idle()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(m.get(&resolved).unwrap().status, InteractionStatus::Resolved);
        assert_eq!(m.get(&timed).unwrap().status, InteractionStatus::Pending);
    }

    #[tokio::test]
    async fn dropped_wait_unregisters_its_waiter() {
        let m = manager();
        let id = create(&m, "sess_b1");

        tokio::select! {
            biased;
            _ = m.wait_for(&id, Duration::from_secs(60)) => panic!("wait settled"),
            () = tokio::task::yield_now() => {}
        }
        tokio::select! {
            biased;
            _ = m.wait_for_any(Duration::from_secs(60)) => panic!("wait settled"),
            () = tokio::task::yield_now() => {}
        }

        let state = m.state.lock();
        assert!(state.records[&id].waiters.is_empty());
        assert!(state.any_waiters.is_empty());
    }
}
