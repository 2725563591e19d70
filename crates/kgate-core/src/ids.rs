//! Branded ID newtypes.
//!
//! Kernel ids are assigned by the remote gateway, message and comm ids are
//! generated locally. Keeping them as distinct types stops a comm id from
//! being looked up in the pending-request table by accident.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random id: a UUID v4 as 32 hex digits.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4().simple().to_string())
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
    /// Identifier of a kernel on the remote gateway.
    KernelId
}

branded_id! {
    /// Client session identifier carried in every message header.
    SessionId
}

branded_id! {
    /// Unique per-message identifier; the only correlation key between a
    /// request and its reply.
    MsgId
}

branded_id! {
    /// Identifier of a comm (widget sub-channel).
    CommId
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn msg_id_new_is_uuid_v4() {
        let id = MsgId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::Random));
    }

    #[test]
    fn generated_ids_are_plain_hex() {
        let id = SessionId::new();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = MsgId::new();
        let b = MsgId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn kernel_id_from_gateway_string() {
        let id = KernelId::from("6f1c2a4e-0000-4000-8000-000000000001");
        assert_eq!(id.as_str(), "6f1c2a4e-0000-4000-8000-000000000001");
        assert_eq!(id.to_string(), "6f1c2a4e-0000-4000-8000-000000000001");
    }

    #[test]
    fn serde_is_transparent() {
        let id = CommId::from("comm-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"comm-1\"");
        let back: CommId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn map_lookup_by_str() {
        let mut map: HashMap<MsgId, u32> = HashMap::new();
        let _ = map.insert(MsgId::from("abc"), 1);
        assert_eq!(map.get("abc"), Some(&1));
    }
}
