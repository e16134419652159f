use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    sync::atomic::AtomicBool,
    time::Duration,
};

use botherd_core::{BotConfig, BotSnapshot, BotStatus, StatusSummary, SupervisorError};
use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
    bot::BotRecord,
    capture,
    config::{self, Settings},
    extract::{MetricsExtractor, RegexExtractor},
    health::HealthMonitor,
    pidfile::PidMap,
    positions::{self, PositionListener},
    process::{self, ProcessHandle},
    recovery, util,
};

/// A bot to launch in coordinate mode; missing bots are created on the fly.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CoordinatedTask {
    pub bot: String,
    pub script: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

struct Inner {
    root: PathBuf,
    settings: Settings,
    roster_path: PathBuf,
    registry: Mutex<HashMap<String, Arc<Mutex<BotRecord>>>>,
    monitor: HealthMonitor,
    pids: PidMap,
    extractor: Arc<dyn MetricsExtractor>,
    listeners: std::sync::Mutex<Vec<Arc<dyn PositionListener>>>,
    position_watcher: AtomicBool,
}

/// Top-level owner of the bot registry.
///
/// Cheap to clone; all clones share one registry. Every process mutation in
/// the system goes through here, under the owning record's lock, so per-bot
/// operations are serialized while different bots proceed independently.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Builds a supervisor over `root` (the client install directory) and
    /// reattaches to any still-alive PIDs from a previous invocation.
    pub async fn new(
        root: PathBuf,
        settings: Settings,
        roster: Vec<BotConfig>,
    ) -> anyhow::Result<Self> {
        Self::with_extractor(root, settings, roster, Arc::new(RegexExtractor)).await
    }

    pub async fn with_extractor(
        root: PathBuf,
        settings: Settings,
        roster: Vec<BotConfig>,
        extractor: Arc<dyn MetricsExtractor>,
    ) -> anyhow::Result<Self> {
        let pids = PidMap::new(&settings.state_dir(&root));
        let roster_path = root.join("config").join("bots.yaml");

        let mut registry = HashMap::new();
        for config in roster {
            let id = config.bot_id.clone();
            let record = BotRecord::new(config, &settings);
            registry.insert(id, Arc::new(Mutex::new(record)));
        }

        let reattach = pids.load_live().await;
        for (bot_id, pid) in reattach {
            if let Some(record) = registry.get(&bot_id) {
                let mut rec = record.lock().await;
                rec.external_pid = Some(pid);
                rec.add_log(
                    &format!("Reattached to process {pid} from previous run"),
                    "CONTROLLER",
                );
                tracing::info!(bot_id, pid, "reattached to bot from previous run");
            }
        }

        Ok(Self {
            inner: Arc::new(Inner {
                root,
                settings,
                roster_path,
                registry: Mutex::new(registry),
                monitor: HealthMonitor::default(),
                pids,
                extractor,
                listeners: std::sync::Mutex::new(Vec::new()),
                position_watcher: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn root(&self) -> &Path {
        &self.inner.root
    }

    pub(crate) fn position_watcher_running(&self) -> &AtomicBool {
        &self.inner.position_watcher
    }

    pub(crate) async fn get_record(
        &self,
        bot_id: &str,
    ) -> Result<Arc<Mutex<BotRecord>>, SupervisorError> {
        let reg = self.inner.registry.lock().await;
        reg.get(bot_id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(bot_id.to_string()))
    }

    /// Registry snapshot in stable (sorted) order.
    pub(crate) async fn entries(&self) -> Vec<(String, Arc<Mutex<BotRecord>>)> {
        let reg = self.inner.registry.lock().await;
        let mut out: Vec<_> = reg.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// The launch command is a pure function of bot config and settings, so
    /// the same roster always produces the same argument lists.
    pub fn build_command(&self, config: &BotConfig) -> (String, Vec<String>) {
        let settings = &self.inner.settings;
        let jar = settings.client_jar_path(&self.inner.root);
        let mut args = vec![
            "-jar".to_string(),
            jar.display().to_string(),
            "--auto-start".to_string(),
            "--auto-login".to_string(),
            "--username".to_string(),
            config.username.clone(),
            "--password".to_string(),
            config.password.clone(),
            "--script-name".to_string(),
            config.script_name.clone(),
        ];
        if !config.script_args.is_empty() {
            args.push("--script-arguments".to_string());
            args.push(config.script_args.join(","));
        }
        if !settings.enable_graphics {
            args.push("--disable-gfx".to_string());
        }
        if !settings.show_side_panel {
            args.push("--hide-side-panel".to_string());
        }
        (settings.java_path.clone(), args)
    }

    fn redacted_command(exec: &str, args: &[String]) -> String {
        let mut shown: Vec<String> = Vec::with_capacity(args.len() + 1);
        shown.push(exec.to_string());
        let mut redact_next = false;
        for a in args {
            if redact_next {
                shown.push("<redacted>".to_string());
                redact_next = false;
                continue;
            }
            if a == "--password" {
                redact_next = true;
            }
            shown.push(a.clone());
        }
        shown.join(" ")
    }

    /// Registers a new bot as Idle. The registry stays untouched on a
    /// duplicate id.
    pub async fn add(&self, config: BotConfig) -> Result<BotSnapshot, SupervisorError> {
        let mut reg = self.inner.registry.lock().await;
        if reg.contains_key(&config.bot_id) {
            return Err(SupervisorError::DuplicateBot(config.bot_id));
        }
        let id = config.bot_id.clone();
        let mut record = BotRecord::new(config, &self.inner.settings);
        let snap = record.snapshot();
        reg.insert(id, Arc::new(Mutex::new(record)));
        Ok(snap)
    }

    /// Force-stops and deletes a bot. Returns false if the id is unknown.
    pub async fn remove(&self, bot_id: &str) -> bool {
        let Ok(record) = self.get_record(bot_id).await else {
            return false;
        };
        let running = record.lock().await.is_running();
        if running {
            let _ = self.stop(bot_id, false).await;
        }
        let mut reg = self.inner.registry.lock().await;
        reg.remove(bot_id).is_some()
    }

    /// Launches a bot's client process. Returns Ok(false) when the bot is
    /// already running or the spawn failed (the failure lands in the bot's
    /// status and log, not in an error).
    pub async fn start(&self, bot_id: &str) -> Result<bool, SupervisorError> {
        let record = self.get_record(bot_id).await?;
        let mut rec = record.lock().await;
        if rec.is_running() {
            rec.add_log("Already running", "CONTROLLER");
            return Ok(false);
        }

        let (exec, args) = self.build_command(&rec.config);
        rec.status = BotStatus::Starting;
        rec.add_log(
            &format!("Starting: {}", Self::redacted_command(&exec, &args)),
            "CONTROLLER",
        );

        match ProcessHandle::spawn(&exec, &args, &self.inner.root) {
            Ok(spawned) => {
                let pid = spawned.handle.pid();
                rec.process = Some(spawned.handle);
                rec.external_pid = None;
                rec.status = BotStatus::Running;
                rec.start_time = Some(Utc::now());
                rec.stop_time = None;
                rec.add_log("Started successfully", "CONTROLLER");

                let log_path = self
                    .inner
                    .settings
                    .log_dir(&self.inner.root)
                    .join(format!("{bot_id}.log"));
                capture::start_capture(
                    record.clone(),
                    spawned.stdout,
                    spawned.stderr,
                    self.inner.extractor.clone(),
                    Some(log_path),
                );
                drop(rec);

                self.inner.monitor.start_monitoring(self.clone());
                if let Some(pid) = pid {
                    util::best_effort("record pid", self.inner.pids.record(bot_id, pid).await);
                }
                tracing::info!(bot_id, pid, "bot started");
                Ok(true)
            }
            Err(err) => {
                rec.status = BotStatus::Error;
                rec.process = None;
                rec.add_log(
                    &format!("Failed to start: {}", util::format_error_chain(&err)),
                    "CONTROLLER",
                );
                tracing::warn!(bot_id, error = %util::format_error_chain(&err), "bot spawn failed");
                Ok(false)
            }
        }
    }

    /// Stops a bot. Graceful sends SIGTERM and escalates to SIGKILL after
    /// the 10 s grace; non-graceful kills immediately. For a bot that is not
    /// running, a reattached external PID gets a courtesy SIGTERM.
    pub async fn stop(&self, bot_id: &str, graceful: bool) -> Result<bool, SupervisorError> {
        let record = self.get_record(bot_id).await?;
        let mut rec = record.lock().await;

        if !rec.is_running() {
            if let Some(pid) = rec.external_pid.take() {
                if process::pid_alive(pid) {
                    process::terminate_pid(pid);
                }
                rec.status = BotStatus::Stopped;
                rec.stop_time = Some(Utc::now());
                rec.add_log(
                    &format!("Stopped reattached process {pid}"),
                    "CONTROLLER",
                );
                drop(rec);
                util::best_effort("clear pid", self.inner.pids.clear(bot_id).await);
                return Ok(true);
            }
            rec.add_log("Not running", "CONTROLLER");
            return Ok(false);
        }

        let Some(mut handle) = rec.process.take() else {
            rec.add_log("Not running", "CONTROLLER");
            return Ok(false);
        };

        let mut stop_err: Option<anyhow::Error> = None;
        if graceful {
            rec.add_log("Stopping gracefully...", "CONTROLLER");
            if let Err(err) = handle.terminate() {
                stop_err = Some(err);
            } else if handle.wait_timeout(util::STOP_TIMEOUT).await.is_none() {
                rec.add_log("Graceful shutdown timeout, forcing...", "CONTROLLER");
                if let Err(err) = handle.kill() {
                    stop_err = Some(err);
                } else {
                    let _ = handle.wait_timeout(Duration::from_secs(5)).await;
                }
            }
        } else {
            rec.add_log("Force stopping...", "CONTROLLER");
            if let Err(err) = handle.kill() {
                stop_err = Some(err);
            } else {
                let _ = handle.wait_timeout(Duration::from_secs(5)).await;
            }
        }

        if let Some(err) = stop_err {
            // Keep the handle; the next health cycle re-evaluates the bot in
            // its last known status.
            rec.add_log(
                &format!("Error stopping: {}", util::format_error_chain(&err)),
                "CONTROLLER",
            );
            rec.process = Some(handle);
            tracing::warn!(bot_id, error = %util::format_error_chain(&err), "bot stop failed");
            return Ok(false);
        }

        rec.stop_time = Some(Utc::now());
        rec.finalize_runtime();
        rec.status = BotStatus::Stopped;
        rec.add_log("Stopped", "CONTROLLER");
        drop(rec);

        util::best_effort("clear pid", self.inner.pids.clear(bot_id).await);
        tracing::info!(bot_id, "bot stopped");
        Ok(true)
    }

    /// Stop (if running), count the attempt, start again.
    pub async fn restart(&self, bot_id: &str) -> Result<bool, SupervisorError> {
        let record = self.get_record(bot_id).await?;
        let running = {
            let mut rec = record.lock().await;
            rec.add_log("Restarting...", "CONTROLLER");
            rec.is_running()
        };
        if running {
            let _ = self.stop(bot_id, true).await;
            // Give the OS a moment to release the old client's resources.
            tokio::time::sleep(util::RESTART_SETTLE).await;
        }
        record.lock().await.record_restart();
        self.start(bot_id).await
    }

    /// Starts every bot sequentially with a stagger, so a fleet doesn't
    /// hammer the login server all at once.
    pub async fn start_all(&self) -> usize {
        let stagger = Duration::from_secs(self.inner.settings.start_stagger_secs);
        let mut started = 0;
        for (bot_id, _) in self.entries().await {
            if matches!(self.start(&bot_id).await, Ok(true)) {
                started += 1;
                tokio::time::sleep(stagger).await;
            }
        }
        started
    }

    /// Stops every bot, then halts the health monitor.
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for (bot_id, _) in self.entries().await {
            if matches!(self.stop(&bot_id, true).await, Ok(true)) {
                stopped += 1;
            }
        }
        self.inner.monitor.stop_monitoring().await;
        stopped
    }

    pub fn start_monitoring(&self) {
        self.inner.monitor.start_monitoring(self.clone());
    }

    pub async fn stop_monitoring(&self) {
        self.inner.monitor.stop_monitoring().await;
    }

    pub fn monitoring_active(&self) -> bool {
        self.inner.monitor.is_active()
    }

    /// Restarts every Crashed/Error bot whose policy allows it.
    pub async fn recover_all(&self) -> usize {
        recovery::recover_all(self).await
    }

    /// Counts by classification. "Running" demands a live process, checked
    /// against the OS right now, not a cached status.
    pub async fn status_summary(&self) -> StatusSummary {
        let mut summary = StatusSummary::default();
        for (_, record) in self.entries().await {
            let mut rec = record.lock().await;
            summary.total += 1;
            if rec.is_running() {
                summary.running += 1;
            }
            match rec.status {
                BotStatus::Stopped => summary.stopped += 1,
                BotStatus::Crashed => summary.crashed += 1,
                BotStatus::Error => summary.error += 1,
                _ => {}
            }
        }
        summary
    }

    pub async fn snapshot(&self, bot_id: &str) -> Result<BotSnapshot, SupervisorError> {
        let record = self.get_record(bot_id).await?;
        let mut rec = record.lock().await;
        Ok(rec.snapshot())
    }

    pub async fn snapshots(&self) -> Vec<BotSnapshot> {
        let mut out = Vec::new();
        for (_, record) in self.entries().await {
            out.push(record.lock().await.snapshot());
        }
        out
    }

    /// Recent lines across the fleet, each prefixed with its bot id,
    /// optionally filtered to one bot.
    pub async fn aggregated_logs(&self, bot_id: Option<&str>, tail: usize) -> Vec<String> {
        let mut out = Vec::new();
        for (id, record) in self.entries().await {
            if bot_id.is_some_and(|want| want != id) {
                continue;
            }
            let rec = record.lock().await;
            for line in rec.recent_logs(tail) {
                out.push(format!("[{id}] {line}"));
            }
        }
        out
    }

    pub async fn bot_logs(&self, bot_id: &str, tail: usize) -> Result<Vec<String>, SupervisorError> {
        let record = self.get_record(bot_id).await?;
        let rec = record.lock().await;
        Ok(rec.recent_logs(tail))
    }

    /// Launches `count` throwaway bots running the same script, cycling
    /// through the provided argument variations, with the standard stagger.
    pub async fn swarm_mode(
        &self,
        script: &str,
        args_variations: &[Vec<String>],
        count: usize,
    ) -> usize {
        let stagger = Duration::from_secs(self.inner.settings.start_stagger_secs);
        let stamp = Utc::now().timestamp();
        let mut started = 0;
        for i in 0..count {
            let bot_id = format!("swarm_{script}_{i}_{stamp}");
            let args = if args_variations.is_empty() {
                Vec::new()
            } else {
                args_variations[i % args_variations.len()].clone()
            };
            let config = BotConfig {
                bot_id: bot_id.clone(),
                account_name: format!("swarm_{i}"),
                username: format!("swarm_user_{i}"),
                password: "temp_pass".to_string(),
                script_name: script.to_string(),
                script_args: args,
                auto_restart: true,
                max_runtime_hours: None,
                health_check_interval: None,
                restart_cooldown: None,
                max_restart_attempts: None,
            };
            if self.add(config).await.is_err() {
                continue;
            }
            if matches!(self.start(&bot_id).await, Ok(true)) {
                started += 1;
            }
            tokio::time::sleep(stagger).await;
        }
        started
    }

    /// Starts a set of coordinated tasks, creating any bots the roster
    /// doesn't have yet.
    pub async fn coordinate_mode(&self, tasks: Vec<CoordinatedTask>) -> usize {
        let stagger = Duration::from_secs(self.inner.settings.start_stagger_secs);
        let mut started = 0;
        for task in tasks {
            if self.get_record(&task.bot).await.is_err() {
                let config = BotConfig {
                    bot_id: task.bot.clone(),
                    account_name: task.bot.clone(),
                    username: task.username.unwrap_or_else(|| task.bot.clone()),
                    password: task.password.unwrap_or_else(|| "temp".to_string()),
                    script_name: task.script.clone(),
                    script_args: task.args.clone(),
                    auto_restart: true,
                    max_runtime_hours: None,
                    health_check_interval: None,
                    restart_cooldown: None,
                    max_restart_attempts: None,
                };
                if self.add(config).await.is_err() {
                    continue;
                }
            }
            if matches!(self.start(&task.bot).await, Ok(true)) {
                started += 1;
            }
            tokio::time::sleep(stagger).await;
        }
        started
    }

    /// Writes the current registry back to the roster file.
    pub async fn save_roster(&self) -> anyhow::Result<()> {
        let mut bots = Vec::new();
        for (_, record) in self.entries().await {
            bots.push(record.lock().await.config.clone());
        }
        config::save_roster(&self.inner.roster_path, bots).await
    }

    pub fn register_position_listener(&self, listener: Arc<dyn PositionListener>) {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        listeners.push(listener);
    }

    pub(crate) fn notify_position(&self, bot_id: &str, tile_x: i32, tile_y: i32, layer: &str) {
        let listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for l in listeners.iter() {
            l.position(bot_id, tile_x, tile_y, layer);
        }
    }

    pub fn start_position_watcher(&self) {
        positions::start_watcher(self.clone());
    }

    pub fn stop_position_watcher(&self) {
        self.inner
            .position_watcher
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }
}
