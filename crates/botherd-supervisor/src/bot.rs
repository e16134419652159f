use std::collections::VecDeque;
use std::time::Duration;

use botherd_core::{BotConfig, BotId, BotMetrics, BotSnapshot, BotStatus, HealthStatus};
use chrono::{DateTime, Local, Utc};

use crate::config::Settings;
use crate::process::ProcessHandle;
use crate::util;

/// Fixed-capacity FIFO of recent log lines; oldest evicted first.
#[derive(Debug)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self {
            max_lines: util::log_max_lines(),
            lines: VecDeque::new(),
        }
    }
}

impl LogBuffer {
    pub fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Most recent `count` lines in chronological order.
    pub fn recent(&self, count: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// In-memory state for one supervised bot.
///
/// Owns at most one live [`ProcessHandle`]; the handle is replaced, never
/// aliased, across restarts. `external_pid` is a non-owning reference to a
/// client spawned by a previous supervisor invocation.
#[derive(Debug)]
pub struct BotRecord {
    pub config: BotConfig,
    pub status: BotStatus,
    pub process: Option<ProcessHandle>,
    pub external_pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub runtime_seconds: u64,
    pub logs: LogBuffer,
    pub metrics: BotMetrics,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_status: HealthStatus,
    pub crash_count: u32,
    pub last_crash_time: Option<DateTime<Utc>>,
    pub restart_count: u32,
    // Effective policy: per-bot override, else system default.
    pub health_check_interval: u64,
    pub restart_cooldown: u64,
    pub max_restart_attempts: u32,
}

impl BotRecord {
    pub fn new(config: BotConfig, settings: &Settings) -> Self {
        let health_check_interval = config
            .health_check_interval
            .unwrap_or(settings.health_check_interval);
        let restart_cooldown = config.restart_cooldown.unwrap_or(settings.restart_cooldown);
        let max_restart_attempts = config
            .max_restart_attempts
            .unwrap_or(settings.max_restart_attempts);

        Self {
            config,
            status: BotStatus::Idle,
            process: None,
            external_pid: None,
            start_time: None,
            stop_time: None,
            runtime_seconds: 0,
            logs: LogBuffer::default(),
            metrics: BotMetrics::default(),
            last_health_check: None,
            health_status: HealthStatus::Unknown,
            crash_count: 0,
            last_crash_time: None,
            restart_count: 0,
            health_check_interval,
            restart_cooldown,
            max_restart_attempts,
        }
    }

    /// Running status backed by an actual liveness poll. The handle may have
    /// exited asynchronously, so this re-checks the OS on every call.
    pub fn is_running(&mut self) -> bool {
        self.status == BotStatus::Running
            && self.process.as_mut().is_some_and(|p| p.is_alive())
    }

    pub fn pid(&self) -> Option<u32> {
        self.process
            .as_ref()
            .and_then(|p| p.pid())
            .or(self.external_pid)
    }

    pub fn add_log(&mut self, message: &str, source: &str) {
        let ts = Local::now().format("%H:%M:%S");
        self.logs.push_line(format!("[{ts}] [{source}] {message}"));
    }

    pub fn recent_logs(&self, count: usize) -> Vec<String> {
        self.logs.recent(count)
    }

    pub fn update_runtime(&mut self) {
        if let Some(start) = self.start_time
            && self.is_running()
        {
            let secs = (Utc::now() - start).num_seconds().max(0) as u64;
            self.runtime_seconds = secs;
            self.metrics.update_xp_rate(secs);
        }
    }

    /// Fixes the final runtime from the recorded start/stop pair.
    pub fn finalize_runtime(&mut self) {
        if let Some(start) = self.start_time
            && let Some(stop) = self.stop_time
        {
            let secs = (stop - start).num_seconds().max(0) as u64;
            self.runtime_seconds = secs;
            self.metrics.update_xp_rate(secs);
        }
    }

    pub fn runtime_formatted(&mut self) -> String {
        let Some(start) = self.start_time else {
            return "00:00:00".to_string();
        };
        let secs = if self.is_running() {
            (Utc::now() - start).num_seconds().max(0) as u64
        } else if let Some(stop) = self.stop_time {
            (stop - start).num_seconds().max(0) as u64
        } else {
            self.runtime_seconds
        };
        format!(
            "{:02}:{:02}:{:02}",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        )
    }

    /// Full recovery policy check, including the cooldown term.
    pub fn should_restart(&self) -> bool {
        if !self.config.auto_restart {
            return false;
        }
        if self.restart_count >= self.max_restart_attempts {
            return false;
        }
        if let Some(last) = self.last_crash_time {
            let elapsed = (Utc::now() - last).num_seconds().max(0) as u64;
            if elapsed < self.restart_cooldown {
                return false;
            }
        }
        true
    }

    /// Policy check without the cooldown term. A bot that just crashed is
    /// eligible here and waits out the cooldown before the final
    /// [`should_restart`](Self::should_restart) re-check.
    pub fn restart_eligible(&self) -> bool {
        self.config.auto_restart && self.restart_count < self.max_restart_attempts
    }

    /// Time still to wait before the cooldown from the latest crash elapses.
    pub fn cooldown_remaining(&self) -> Duration {
        let Some(last) = self.last_crash_time else {
            return Duration::ZERO;
        };
        let elapsed = (Utc::now() - last).num_seconds().max(0) as u64;
        Duration::from_secs(self.restart_cooldown.saturating_sub(elapsed))
    }

    pub fn record_crash(&mut self) {
        self.crash_count += 1;
        self.last_crash_time = Some(Utc::now());
        self.status = BotStatus::Crashed;
    }

    pub fn record_restart(&mut self) {
        self.restart_count += 1;
    }

    pub fn snapshot(&mut self) -> BotSnapshot {
        let runtime = self.runtime_formatted();
        BotSnapshot {
            bot_id: BotId(self.config.bot_id.clone()),
            account_name: self.config.account_name.clone(),
            script_name: self.config.script_name.clone(),
            script_args: self.config.script_args.clone(),
            status: self.status,
            health_status: self.health_status,
            runtime,
            pid: self.pid(),
            metrics: self.metrics.clone(),
            crash_count: self.crash_count,
            restart_count: self.restart_count,
            last_health_check: self.last_health_check,
        }
    }
}
