// ── Runtime gateway configuration ──
//
// These types describe how the engine behaves once started. They never
// touch disk: the binary loads a file through `twinline-config` and
// hands a `GatewayConfig` to `Gateway::start`.

use std::time::Duration;

/// Tuning knobs for a running [`Gateway`](crate::Gateway).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Capacity of the notification broadcast channel. Slow subscribers
    /// that fall further behind than this observe a lag.
    pub notification_capacity: usize,
    /// Prefix for package URIs of models created without an explicit one.
    pub package_uri_prefix: String,
    /// Whether every new provider gets an `admin` service holding its
    /// friendly name and model URI.
    pub admin_service: bool,
    /// Upper bound on a single action invocation. `None` = unbounded.
    pub action_timeout: Option<Duration>,
    /// How long `shutdown` waits for the writer task to drain.
    pub shutdown_timeout: Duration,
    /// Queue depth at which submissions start logging warnings.
    pub queue_warn_threshold: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            notification_capacity: 1024,
            package_uri_prefix: "urn:twinline:model:".into(),
            admin_service: true,
            action_timeout: Some(Duration::from_secs(30)),
            shutdown_timeout: Duration::from_secs(5),
            queue_warn_threshold: 10_000,
        }
    }
}

impl GatewayConfig {
    /// Default package URI for a model name.
    pub fn package_uri(&self, model: &str) -> String {
        format!("{}{model}", self.package_uri_prefix)
    }
}
