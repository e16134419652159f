use std::{
    sync::Mutex,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use botherd_core::{BotStatus, HealthStatus};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{bot::BotRecord, config::DegradedPolicy, config::Settings, recovery, supervisor::Supervisor};

/// How many recent lines a health check inspects, and how many error-tagged
/// lines among them count as spam.
const RECENT_LOG_WINDOW: usize = 50;
const ERROR_SPAM_THRESHOLD: usize = 10;

/// Periodic health evaluator. One background loop for the whole fleet;
/// `start_monitoring` is idempotent and `stop_monitoring` lets an in-flight
/// cycle finish before joining (bounded).
#[derive(Debug, Default)]
pub struct HealthMonitor {
    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // Synchronous on purpose: `start` (re)invokes this from inside recovery
    // tasks spawned by the monitor itself, so it must not be part of any
    // awaited future chain. It only spawns the loop and stores its handles.
    pub(crate) fn start_monitoring(&self, sup: Supervisor) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = watch::channel(false);
        let interval = Duration::from_secs(sup.settings().health_check_interval.max(1));
        let handle = tokio::spawn(monitor_loop(sup, rx, interval));
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub(crate) async fn stop_monitoring(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let tx = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(true);
        }
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}

async fn monitor_loop(sup: Supervisor, mut rx: watch::Receiver<bool>, interval: Duration) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = rx.changed() => break,
        }
        run_cycle(&sup).await;
    }
}

/// Classifies one running bot. Priority order: liveness beats everything,
/// then error spam, then disconnect text, then the (tunable, default-off)
/// stuck check.
pub(crate) fn classify(rec: &mut BotRecord, settings: &Settings) -> HealthStatus {
    let alive = rec.process.as_mut().is_some_and(|p| p.is_alive());
    if !alive {
        return HealthStatus::Crashed;
    }

    let recent = rec.recent_logs(RECENT_LOG_WINDOW);
    let errors = recent.iter().filter(|l| l.contains("ERROR")).count();
    if errors > ERROR_SPAM_THRESHOLD {
        return HealthStatus::ErrorSpam;
    }
    if recent
        .iter()
        .any(|l| l.to_ascii_lowercase().contains("disconnect"))
    {
        return HealthStatus::Disconnected;
    }

    if settings.stuck_detection
        && let Some(start) = rec.start_time
    {
        let elapsed = (Utc::now() - start).num_seconds().max(0) as u64;
        if elapsed > settings.stuck_threshold_secs
            && rec.metrics.total_xp_gained == 0
            && rec.metrics.xp_per_hour == 0.0
        {
            return HealthStatus::Stuck;
        }
    }

    HealthStatus::Healthy
}

/// One evaluation pass over every Running bot. Exactly one classification
/// per bot per cycle; reactions run on their own tasks so one bot's
/// recovery cooldown never stalls the rest of the fleet.
pub(crate) async fn run_cycle(sup: &Supervisor) {
    for (bot_id, record) in sup.entries().await {
        let health = {
            let mut rec = record.lock().await;
            if rec.status != BotStatus::Running {
                continue;
            }
            let health = classify(&mut rec, sup.settings());
            rec.health_status = health;
            rec.last_health_check = Some(Utc::now());
            health
        };

        match health {
            HealthStatus::Crashed => {
                let sup = sup.clone();
                tokio::spawn(async move { recovery::handle_crash(sup, bot_id).await });
            }
            HealthStatus::Stuck => {
                let sup = sup.clone();
                tokio::spawn(async move { recovery::handle_stuck(sup, bot_id).await });
            }
            HealthStatus::Disconnected => match sup.settings().degraded_policy {
                DegradedPolicy::ManualIntervention => {
                    let mut rec = record.lock().await;
                    rec.status = BotStatus::Disconnected;
                    rec.add_log("Disconnect detected (no auto-restart)", "HEALTH");
                    tracing::warn!(bot_id, "bot disconnected, awaiting operator");
                }
                DegradedPolicy::AutoRestart => {
                    record
                        .lock()
                        .await
                        .add_log("Disconnect detected, restarting", "HEALTH");
                    let sup = sup.clone();
                    tokio::spawn(async move {
                        let _ = sup.restart(&bot_id).await;
                    });
                }
            },
            HealthStatus::ErrorSpam => match sup.settings().degraded_policy {
                DegradedPolicy::ManualIntervention => {
                    let mut rec = record.lock().await;
                    rec.status = BotStatus::Error;
                    rec.add_log("Error spam detected (no auto-restart)", "HEALTH");
                    tracing::warn!(bot_id, "bot in error spam, awaiting operator");
                }
                DegradedPolicy::AutoRestart => {
                    record
                        .lock()
                        .await
                        .add_log("Error spam detected, restarting", "HEALTH");
                    let sup = sup.clone();
                    tokio::spawn(async move {
                        let _ = sup.restart(&bot_id).await;
                    });
                }
            },
            HealthStatus::Healthy | HealthStatus::Unknown => {}
        }
    }
}
