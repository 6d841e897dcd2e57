//! Versioned state stamp.

use serde::{Deserialize, Serialize};

/// Authority version and checksum as last seen by a client.
///
/// Both values are opaque beyond ordering (`version`) and equality
/// (`checksum`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVersion {
    pub version: u64,
    pub checksum: String,
}

impl StateVersion {
    pub fn new(version: u64, checksum: impl Into<String>) -> Self {
        Self {
            version,
            checksum: checksum.into(),
        }
    }

    /// True when `version` is strictly older than the held one.
    pub fn is_stale(&self, version: u64) -> bool {
        version < self.version
    }

    /// Advance from an incremental message. Never moves backwards.
    ///
    /// Returns `false` (and changes nothing) for a stale version. A missing
    /// checksum keeps the held one.
    pub fn observe(&mut self, version: u64, checksum: Option<&str>) -> bool {
        if self.is_stale(version) {
            return false;
        }
        self.version = version;
        if let Some(checksum) = checksum {
            self.checksum = checksum.to_string();
        }
        true
    }

    /// Unconditional reset from a full snapshot.
    pub fn reset(&mut self, version: u64, checksum: impl Into<String>) {
        self.version = version;
        self.checksum = checksum.into();
    }

    pub fn matches(&self, version: u64, checksum: &str) -> bool {
        self.version == version && self.checksum == checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_is_monotonic() {
        let mut v = StateVersion::default();
        assert!(v.observe(5, Some("aaaa")));
        assert!(!v.observe(3, Some("bbbb")));
        assert_eq!(v, StateVersion::new(5, "aaaa"));

        assert!(v.observe(5, None));
        assert_eq!(v.checksum, "aaaa");

        assert!(v.observe(6, Some("cccc")));
        assert_eq!(v.version, 6);
    }

    #[test]
    fn test_reset_may_go_back() {
        let mut v = StateVersion::new(10, "ffff");
        v.reset(0, "0000");
        assert!(v.matches(0, "0000"));
    }
}
