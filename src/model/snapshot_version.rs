use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Version of a document as reported by the backend, or assigned locally when
/// a mutation batch is queued. Versions are monotonic per key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SnapshotVersion {
    pub seconds: i64,
    pub nanos: i32,
}

impl SnapshotVersion {
    /// Sentinel for "no version": compares before every real version.
    pub const NONE: SnapshotVersion = SnapshotVersion {
        seconds: 0,
        nanos: 0,
    };

    pub fn new(seconds: i64, nanos: i32) -> Self {
        let mut version = Self { seconds, nanos };
        version.normalize();
        version
    }

    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        Self {
            seconds: duration.as_secs() as i64,
            nanos: duration.subsec_nanos() as i32,
        }
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    fn normalize(&mut self) {
        let extra_seconds = self.nanos.div_euclid(1_000_000_000);
        self.seconds += extra_seconds as i64;
        self.nanos = self.nanos.rem_euclid(1_000_000_000);
    }
}

impl PartialOrd for SnapshotVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SnapshotVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.seconds.cmp(&other.seconds) {
            Ordering::Equal => self.nanos.cmp(&other.nanos),
            ordering => ordering,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_precedes_all_real_versions() {
        assert!(SnapshotVersion::NONE < SnapshotVersion::new(0, 1));
        assert!(SnapshotVersion::NONE < SnapshotVersion::new(1, 0));
    }

    #[test]
    fn normalizes_nanos_overflow() {
        let version = SnapshotVersion::new(1, 1_500_000_000);
        assert_eq!(version.seconds, 2);
        assert_eq!(version.nanos, 500_000_000);
    }
}
