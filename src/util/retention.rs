use std::fmt;

/// Configure how many archives `borg prune` keeps.
///
/// If a value is [None] the corresponding rule isn't passed to borg at all.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct RetentionConfig {
    /// Defines how many daily archives to keep.
    ///
    /// A daily archive is the last archive of the day.
    pub daily: Option<u32>,

    /// Defines how many weekly archives to keep.
    ///
    /// A weekly archive is the last archive of the ISO week.
    pub weekly: Option<u32>,

    /// Defines how many monthly archives to keep.
    pub monthly: Option<u32>,

    /// Defines how many yearly archives to keep.
    pub yearly: Option<u32>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily: Some(7),
            weekly: Some(4),
            monthly: Some(6),
            yearly: Some(2),
        }
    }
}

impl RetentionConfig {
    /// `--keep-*` arguments understood by `borg prune`.
    pub fn prune_args(&self) -> Vec<String> {
        [
            ("daily", self.daily),
            ("weekly", self.weekly),
            ("monthly", self.monthly),
            ("yearly", self.yearly),
        ]
        .into_iter()
        .filter_map(|(interval, keep)| keep.map(|keep| format!("--keep-{interval}={keep}")))
        .collect()
    }

    /// No rule configured, pruning would delete nothing or everything.
    pub fn is_empty(&self) -> bool {
        self.prune_args().is_empty()
    }
}

impl fmt::Display for RetentionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keep = |v: Option<u32>| v.map_or_else(|| "-".to_string(), |v| v.to_string());
        write!(
            f,
            "daily={} weekly={} monthly={} yearly={}",
            keep(self.daily),
            keep(self.weekly),
            keep(self.monthly),
            keep(self.yearly)
        )
    }
}
