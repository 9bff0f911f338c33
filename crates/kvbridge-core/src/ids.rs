//! Identifier newtypes.
//!
//! Consumer ids are UUID v7 strings, which keeps them unique for the
//! lifetime of the process and sortable by creation time. Request ids are
//! plain counters allocated by the correlator.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation id attached to every outbound datastore request.
///
/// A 64-bit counter; wraparound is treated as unreachable.
pub type RequestId = u64;

/// Identifier of a remote consumer held by the subscriber registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(String);

impl ConsumerId {
    /// Allocate a fresh, time-ordered id.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("consumer_{}", Uuid::now_v7().simple()))
    }

    /// Wrap an existing string.
    #[must_use]
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for ConsumerId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ConsumerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConsumerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConsumerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn new_ids_are_unique() {
        let ids: HashSet<ConsumerId> = (0..1000).map(|_| ConsumerId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn new_ids_carry_prefix() {
        assert!(ConsumerId::new().as_str().starts_with("consumer_"));
    }

    #[test]
    fn ids_sort_by_creation() {
        let a = ConsumerId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = ConsumerId::new();
        assert!(a < b);
    }

    #[test]
    fn serde_is_transparent() {
        let id = ConsumerId::from("consumer_abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"consumer_abc\"");
        let back: ConsumerId = serde_json::from_str("\"consumer_abc\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn deref_and_display() {
        let id = ConsumerId::from("c1");
        assert_eq!(&*id, "c1");
        assert_eq!(id.to_string(), "c1");
    }
}
