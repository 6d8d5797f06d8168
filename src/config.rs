use std::time::Duration;

/// Tuning knobs for the session and store runtime.
///
/// The defaults reproduce the observed production behavior; all of them are
/// policy, not protocol requirements.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Resource string presented to the server on login.
    pub device_name: String,
    /// Duplicate-absorption window when the candidate carries no stanza id.
    pub dedup_window: Duration,
    /// Wider window when a stanza id is available for matching; covers
    /// archive replay and carbon copies arriving long after the original.
    pub dedup_window_stanza_id: Duration,
    /// How long sessions are kept alive after the app is backgrounded.
    pub background_keepalive_budget: Duration,
    /// Slice reserved out of the platform's execution budget so the
    /// disconnect itself still fits before suspension.
    pub budget_safety_margin: Duration,
    /// Bounds for the jittered keepalive ping interval.
    pub keepalive_interval_min: Duration,
    pub keepalive_interval_max: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device_name: "xmpp-rust".to_string(),
            dedup_window: Duration::from_secs(5 * 60),
            dedup_window_stanza_id: Duration::from_secs(60 * 60),
            background_keepalive_budget: Duration::from_secs(180),
            budget_safety_margin: Duration::from_secs(15),
            keepalive_interval_min: Duration::from_secs(20),
            keepalive_interval_max: Duration::from_secs(30),
        }
    }
}

impl RuntimeConfig {
    /// Effective background keepalive window for a given platform budget.
    pub fn background_window(&self, platform_remaining: Duration) -> Duration {
        self.background_keepalive_budget
            .min(platform_remaining.saturating_sub(self.budget_safety_margin))
    }
}
