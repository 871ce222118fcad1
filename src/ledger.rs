//! Bookkeeping of everything that went wrong during a run.

/// Ordered failure reasons plus the overall outcome of a run.
///
/// Stages never abort the run, they [record](Self::record) a reason and the
/// run continues. Once a reason was recorded the run can't become successful
/// again.
#[derive(Debug, Clone)]
pub struct FailureLedger {
    success: bool,
    reasons: Vec<String>,
}

impl Default for FailureLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureLedger {
    pub fn new() -> Self {
        Self {
            success: true,
            reasons: Vec::new(),
        }
    }

    /// Appends `reason` and marks the run as failed.
    pub fn record(&mut self, reason: impl Into<String>) {
        self.reasons.push(reason.into());
        self.success = false;
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    /// Outcome and reasons for reporting.
    pub fn summary(&self) -> (bool, Vec<String>) {
        (self.success, self.reasons.clone())
    }
}
