//! Human-friendly durations in rule files: `{ minutes = 5 }`, `{ hours = 1, minutes = 30 }`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DurationSpec {
    pub seconds: u64,
    pub minutes: u64,
    pub hours: u64,
    pub days: u64,
}

impl DurationSpec {
    pub fn to_duration(self) -> Duration {
        let secs = self
            .seconds
            .saturating_add(self.minutes.saturating_mul(60))
            .saturating_add(self.hours.saturating_mul(3_600))
            .saturating_add(self.days.saturating_mul(86_400));
        Duration::from_secs(secs)
    }
}

/// Render a duration compactly for logs and the admin API (`90s` → `1m30s`).
pub fn format_duration(d: Duration) -> String {
    let mut secs = d.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)] {
        if secs >= size {
            out.push_str(&format!("{}{}", secs / size, unit));
            secs %= size;
        }
    }
    out
}
