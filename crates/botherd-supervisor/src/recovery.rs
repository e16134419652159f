use botherd_core::BotStatus;

use crate::supervisor::Supervisor;

/// Reactive recovery policy. No scheduling loop of its own: the health
/// monitor invokes these on classification, and every process mutation
/// routes through [`Supervisor`] rather than touching handles directly.
///
/// Crash handling waits out the restart cooldown and then re-checks
/// eligibility, so a bot manually stopped or removed during the wait is
/// left alone.
pub(crate) async fn handle_crash(sup: Supervisor, bot_id: String) {
    let Ok(record) = sup.get_record(&bot_id).await else {
        return;
    };

    let wait = {
        let mut rec = record.lock().await;
        rec.record_crash();
        rec.add_log("Crash recorded", "RECOVERY");
        tracing::warn!(bot_id, crash_count = rec.crash_count, "bot process crashed");
        if !rec.restart_eligible() {
            rec.add_log("Restart skipped (auto-restart off or max attempts)", "RECOVERY");
            return;
        }
        rec.cooldown_remaining()
    };

    if !wait.is_zero() {
        tokio::time::sleep(wait).await;
    }

    let Ok(record) = sup.get_record(&bot_id).await else {
        return;
    };
    let still_eligible = {
        let rec = record.lock().await;
        rec.status == BotStatus::Crashed && rec.should_restart()
    };
    if !still_eligible {
        record
            .lock()
            .await
            .add_log("Restart skipped (state changed during cooldown)", "RECOVERY");
        return;
    }

    match sup.restart(&bot_id).await {
        Ok(true) => record.lock().await.add_log("Restarted after crash", "RECOVERY"),
        Ok(false) | Err(_) => record
            .lock()
            .await
            .add_log("Restart after crash failed", "RECOVERY"),
    }
}

/// Liveness-without-progress fast path: restart immediately, no cooldown.
pub(crate) async fn handle_stuck(sup: Supervisor, bot_id: String) {
    let Ok(record) = sup.get_record(&bot_id).await else {
        return;
    };
    record
        .lock()
        .await
        .add_log("Stuck detected, restarting", "RECOVERY");
    tracing::warn!(bot_id, "bot stuck, restarting");
    let _ = sup.restart(&bot_id).await;
}

/// Batch recovery after operator intervention: restart every Crashed or
/// Error bot whose policy allows it. Individual failures don't halt the
/// scan.
pub async fn recover_all(sup: &Supervisor) -> usize {
    let mut recovered = 0;
    for (bot_id, record) in sup.entries().await {
        let eligible = {
            let rec = record.lock().await;
            matches!(rec.status, BotStatus::Crashed | BotStatus::Error) && rec.should_restart()
        };
        if !eligible {
            continue;
        }
        match sup.restart(&bot_id).await {
            Ok(true) => recovered += 1,
            Ok(false) | Err(_) => {
                record
                    .lock()
                    .await
                    .add_log("Batch recovery restart failed", "RECOVERY");
            }
        }
    }
    recovered
}
