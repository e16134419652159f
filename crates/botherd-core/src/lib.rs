use chrono::{DateTime, Utc};

/// Stable bot identifier chosen by the operator (roster key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BotId(pub String);

impl std::fmt::Display for BotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Idle,
    Starting,
    Running,
    Paused,
    Error,
    Crashed,
    Stopped,
    Disconnected,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Idle => "idle",
            BotStatus::Starting => "starting",
            BotStatus::Running => "running",
            BotStatus::Paused => "paused",
            BotStatus::Error => "error",
            BotStatus::Crashed => "crashed",
            BotStatus::Stopped => "stopped",
            BotStatus::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one periodic health evaluation of a running bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Crashed,
    Stuck,
    Disconnected,
    ErrorSpam,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Crashed => "crashed",
            HealthStatus::Stuck => "stuck",
            HealthStatus::Disconnected => "disconnected",
            HealthStatus::ErrorSpam => "error_spam",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Counters extracted from a bot's log stream.
///
/// All fields are monotonic except `xp_per_hour`, a rate derived from
/// `total_xp_gained` and elapsed runtime.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BotMetrics {
    pub xp_per_hour: f64,
    pub items_collected: u64,
    pub deaths: u64,
    pub trades_completed: u64,
    pub total_xp_gained: u64,
    pub profit: u64,
}

impl BotMetrics {
    pub fn update_xp_rate(&mut self, runtime_seconds: u64) {
        if runtime_seconds == 0 {
            return;
        }
        let hours = runtime_seconds as f64 / 3600.0;
        self.xp_per_hour = self.total_xp_gained as f64 / hours;
    }
}

fn default_true() -> bool {
    true
}

/// One roster entry: identity, task, and per-bot recovery policy overrides.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BotConfig {
    #[serde(alias = "id")]
    pub bot_id: String,
    #[serde(alias = "account")]
    pub account_name: String,
    pub username: String,
    pub password: String,
    #[serde(alias = "script")]
    pub script_name: String,
    #[serde(default, alias = "args")]
    pub script_args: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default, alias = "max_runtime")]
    pub max_runtime_hours: Option<f64>,
    #[serde(default)]
    pub health_check_interval: Option<u64>,
    #[serde(default)]
    pub restart_cooldown: Option<u64>,
    #[serde(default)]
    pub max_restart_attempts: Option<u32>,
}

/// Read-only view handed to command surfaces (HTTP/CLI/TUI).
///
/// Deliberately has no password field; credentials never leave the engine.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BotSnapshot {
    pub bot_id: BotId,
    pub account_name: String,
    pub script_name: String,
    pub script_args: Vec<String>,
    pub status: BotStatus,
    pub health_status: HealthStatus,
    pub runtime: String,
    pub pid: Option<u32>,
    pub metrics: BotMetrics,
    pub crash_count: u32,
    pub restart_count: u32,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Counts of bots by current classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub crashed: usize,
    pub error: usize,
}

/// Caller mistakes surfaced to the command surface. Process lifecycle
/// failures are absorbed into bot status and log entries instead.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("bot not found: {0}")]
    NotFound(String),
    #[error("bot already exists: {0}")]
    DuplicateBot(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xp_rate_from_runtime() {
        let mut m = BotMetrics {
            total_xp_gained: 3600,
            ..Default::default()
        };
        m.update_xp_rate(3600);
        assert!((m.xp_per_hour - 3600.0).abs() < f64::EPSILON);
        m.update_xp_rate(7200);
        assert!((m.xp_per_hour - 1800.0).abs() < f64::EPSILON);
    }

    #[test]
    fn xp_rate_zero_runtime_is_untouched() {
        let mut m = BotMetrics {
            total_xp_gained: 100,
            xp_per_hour: 42.0,
            ..Default::default()
        };
        m.update_xp_rate(0);
        assert!((m.xp_per_hour - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn bot_config_accepts_short_roster_keys() {
        let yaml = r#"
id: b1
account: acct
username: user
password: pw
script: FishingBot
args: ["shrimp"]
"#;
        let cfg: BotConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.bot_id, "b1");
        assert_eq!(cfg.account_name, "acct");
        assert_eq!(cfg.script_name, "FishingBot");
        assert_eq!(cfg.script_args, vec!["shrimp".to_string()]);
        assert!(cfg.auto_restart);
        assert!(cfg.max_restart_attempts.is_none());
    }

    #[test]
    fn status_round_trips_snake_case() {
        let s = serde_json::to_string(&BotStatus::Crashed).unwrap();
        assert_eq!(s, "\"crashed\"");
        let s = serde_json::to_string(&HealthStatus::ErrorSpam).unwrap();
        assert_eq!(s, "\"error_spam\"");
    }
}
