use chrono::NaiveDateTime;
use std::collections::HashMap;

/// Maximum quiet period between two events from one IP before the gap is
/// recorded as server downtime.
pub const DEFAULT_HEARTBEAT_PERIOD_SECS: i64 = 360;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DowntimeTag {
    /// First event ever seen from this IP; tagged with a zero duration.
    FirstSight,
    /// Gap in seconds since the previous event from this IP.
    Gap(i64),
}

impl DowntimeTag {
    pub fn seconds(self) -> i64 {
        match self {
            Self::FirstSight => 0,
            Self::Gap(secs) => secs,
        }
    }
}

/// Per-IP last-seen tracker. Rebuilt fresh each run; never persisted.
#[derive(Debug, Default)]
pub struct DowntimeTracker {
    last_seen: HashMap<String, NaiveDateTime>,
    threshold_secs: i64,
}

impl DowntimeTracker {
    pub fn new(threshold_secs: i64) -> Self {
        Self {
            last_seen: HashMap::new(),
            threshold_secs,
        }
    }

    /// Record an event from `ip` at `at`. The last-seen entry is updated
    /// unconditionally; a tag is returned only on first sight or when the
    /// elapsed gap exceeds the threshold.
    pub fn observe(&mut self, ip: &str, at: NaiveDateTime) -> Option<DowntimeTag> {
        let previous = self.last_seen.insert(ip.to_string(), at);
        match previous {
            None => Some(DowntimeTag::FirstSight),
            Some(prev) => {
                let gap = (at - prev).num_seconds();
                if gap > self.threshold_secs {
                    Some(DowntimeTag::Gap(gap))
                } else {
                    None
                }
            }
        }
    }
}
