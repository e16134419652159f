use std::path::{Path, PathBuf};

use anyhow::Context;
use botherd_core::BotConfig;
use tokio::io::AsyncWriteExt;

/// What to do when a health check reports Disconnected or ErrorSpam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedPolicy {
    /// Mark the bot degraded and leave it for the operator. Default: a
    /// disconnect usually means the account needs attention, not a relaunch.
    ManualIntervention,
    /// Treat degraded health like a crash and restart automatically.
    AutoRestart,
}

fn default_java_path() -> String {
    "java".to_string()
}
fn default_client_jar() -> String {
    "./IdleRSC.jar".to_string()
}
fn default_log_directory() -> String {
    "./logs".to_string()
}
fn default_state_directory() -> String {
    "./state".to_string()
}
fn default_health_check_interval() -> u64 {
    30
}
fn default_restart_cooldown() -> u64 {
    60
}
fn default_max_restart_attempts() -> u32 {
    3
}
fn default_start_stagger_secs() -> u64 {
    1
}
fn default_stuck_threshold_secs() -> u64 {
    300
}
fn default_degraded_policy() -> DegradedPolicy {
    DegradedPolicy::ManualIntervention
}
fn default_position_poll_secs() -> f64 {
    2.5
}

/// System-wide settings (`settings.yaml`). Every field has a default so a
/// missing or partial file still yields a working supervisor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Settings {
    pub java_path: String,
    pub client_jar: String,
    pub log_directory: String,
    pub state_directory: String,
    pub health_check_interval: u64,
    pub restart_cooldown: u64,
    pub max_restart_attempts: u32,
    pub enable_graphics: bool,
    pub show_side_panel: bool,
    pub start_stagger_secs: u64,
    /// Stuck detection depends on the metrics extractor actually attributing
    /// XP; with an untrusted extractor every bot would be flagged Stuck and
    /// enter a no-cooldown restart loop, so it ships disabled.
    pub stuck_detection: bool,
    pub stuck_threshold_secs: u64,
    pub degraded_policy: DegradedPolicy,
    pub position_file: Option<String>,
    pub position_poll_secs: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            java_path: default_java_path(),
            client_jar: default_client_jar(),
            log_directory: default_log_directory(),
            state_directory: default_state_directory(),
            health_check_interval: default_health_check_interval(),
            restart_cooldown: default_restart_cooldown(),
            max_restart_attempts: default_max_restart_attempts(),
            enable_graphics: false,
            show_side_panel: false,
            start_stagger_secs: default_start_stagger_secs(),
            stuck_detection: false,
            stuck_threshold_secs: default_stuck_threshold_secs(),
            degraded_policy: default_degraded_policy(),
            position_file: None,
            position_poll_secs: default_position_poll_secs(),
        }
    }
}

impl Settings {
    pub fn resolve(&self, root: &Path, value: &str) -> PathBuf {
        let p = PathBuf::from(value);
        if p.is_absolute() { p } else { root.join(p) }
    }

    pub fn log_dir(&self, root: &Path) -> PathBuf {
        self.resolve(root, &self.log_directory)
    }

    pub fn state_dir(&self, root: &Path) -> PathBuf {
        self.resolve(root, &self.state_directory)
    }

    pub fn client_jar_path(&self, root: &Path) -> PathBuf {
        self.resolve(root, &self.client_jar)
    }
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct RosterFile {
    #[serde(default)]
    bots: Vec<BotConfig>,
}

/// Loads `settings.yaml`. A missing file yields defaults; a malformed file
/// is a startup error the operator should see.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read settings: {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parse settings: {}", path.display()))
}

/// Loads the roster (`bots.yaml`). A missing file is an empty fleet.
pub fn load_roster(path: &Path) -> anyhow::Result<Vec<BotConfig>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("read roster: {}", path.display()))?;
    let file: RosterFile =
        serde_yaml::from_str(&raw).with_context(|| format!("parse roster: {}", path.display()))?;
    Ok(file.bots)
}

/// Writes the in-memory roster back out, atomically (tmp + rename).
pub async fn save_roster(path: &Path, bots: Vec<BotConfig>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("create config dir")?;
    }
    let data = serde_yaml::to_string(&RosterFile { bots }).context("serialize roster")?;
    let tmp = path.with_extension("yaml.tmp");
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(data.as_bytes()).await.context("write roster")?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_settings_yield_defaults() {
        let s = load_settings(Path::new("/definitely/not/here/settings.yaml")).unwrap();
        assert_eq!(s.java_path, "java");
        assert_eq!(s.health_check_interval, 30);
        assert_eq!(s.restart_cooldown, 60);
        assert_eq!(s.max_restart_attempts, 3);
        assert!(!s.enable_graphics);
        assert!(!s.stuck_detection);
        assert_eq!(s.degraded_policy, DegradedPolicy::ManualIntervention);
    }

    #[test]
    fn partial_settings_keep_defaults_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "restart_cooldown: 5\ndegraded_policy: auto_restart\n").unwrap();
        let s = load_settings(&path).unwrap();
        assert_eq!(s.restart_cooldown, 5);
        assert_eq!(s.degraded_policy, DegradedPolicy::AutoRestart);
        assert_eq!(s.max_restart_attempts, 3);
    }

    #[test]
    fn malformed_settings_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "restart_cooldown: [not a number\n").unwrap();
        assert!(load_settings(&path).is_err());
    }

    #[test]
    fn roster_accepts_short_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bots.yaml");
        std::fs::write(
            &path,
            r#"
bots:
  - id: fisher1
    account: acct1
    username: u1
    password: p1
    script: FishingBot
    args: ["lobster"]
  - id: miner1
    account: acct2
    username: u2
    password: p2
    script: MiningBot
    restart_cooldown: 10
"#,
        )
        .unwrap();
        let bots = load_roster(&path).unwrap();
        assert_eq!(bots.len(), 2);
        assert_eq!(bots[0].bot_id, "fisher1");
        assert_eq!(bots[0].script_args, vec!["lobster".to_string()]);
        assert_eq!(bots[1].restart_cooldown, Some(10));
    }

    #[test]
    fn missing_roster_is_empty() {
        assert!(load_roster(Path::new("/nope/bots.yaml")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_roster_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bots.yaml");
        let bots = vec![BotConfig {
            bot_id: "b1".to_string(),
            account_name: "acct".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            script_name: "FishingBot".to_string(),
            script_args: vec!["shrimp".to_string()],
            auto_restart: false,
            max_runtime_hours: Some(2.0),
            health_check_interval: None,
            restart_cooldown: None,
            max_restart_attempts: Some(5),
        }];
        save_roster(&path, bots).await.unwrap();
        let loaded = load_roster(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].bot_id, "b1");
        assert!(!loaded[0].auto_restart);
        assert_eq!(loaded[0].max_restart_attempts, Some(5));
        // No stray tmp file left behind.
        assert!(!dir.path().join("bots.yaml.tmp").exists());
    }
}
