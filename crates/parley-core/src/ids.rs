//! Branded ID newtypes.
//!
//! Sessions, pending connections, interactions, correlation tokens and wire
//! messages each get a distinct newtype over `String`, so a session id can
//! never be passed where an interaction id is expected.
//!
//! Generated ids are `<prefix>_<uuid v7>`; v7 keeps them time-ordered and
//! unique for the lifetime of the process.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Prefix used for generated values.
            pub const PREFIX: &'static str = $prefix;

            /// Generate a fresh id.
            #[must_use]
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7().simple()))
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identified peer session (requester or responder).
    SessionId, "sess"
}

branded_id! {
    /// Raw connection that has not yet sent its identify handshake.
    PendingId, "conn"
}

branded_id! {
    /// Interaction handed to a responder.
    InteractionId, "ix"
}

branded_id! {
    /// Token linking a routed request to its response.
    CorrelationId, "corr"
}

branded_id! {
    /// Wire envelope id.
    MessageId, "msg"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_carry_prefix() {
        assert!(SessionId::new().starts_with("sess_"));
        assert!(PendingId::new().starts_with("conn_"));
        assert!(InteractionId::new().starts_with("ix_"));
        assert!(CorrelationId::new().starts_with("corr_"));
        assert!(MessageId::new().starts_with("msg_"));
    }

    #[test]
    fn generated_ids_are_unique() {
        let ids: HashSet<InteractionId> = (0..1000).map(|_| InteractionId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn from_str_preserves_value() {
        let id = SessionId::from("b1");
        assert_eq!(id.as_str(), "b1");
        assert_eq!(id.to_string(), "b1");
        assert_eq!(String::from(id), "b1");
    }

    #[test]
    fn serializes_transparently() {
        let id = CorrelationId::from("corr_x");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"corr_x\"");
        let back: CorrelationId = serde_json::from_str("\"corr_x\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn borrow_allows_str_lookup() {
        let mut set = HashSet::new();
        let _ = set.insert(SessionId::from("a1"));
        assert!(set.contains("a1"));
    }
}
