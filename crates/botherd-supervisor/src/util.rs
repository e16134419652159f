use std::time::Duration;

const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn log_max_lines() -> usize {
    env_usize("BOTHERD_LOG_MAX_LINES")
        .map(|v| v.clamp(100, 50_000))
        .unwrap_or(DEFAULT_LOG_MAX_LINES)
}

pub(crate) fn log_file_limits() -> (u64, usize) {
    let max_bytes = env_u64("BOTHERD_LOG_FILE_MAX_BYTES")
        .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
        .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES);
    let max_files = env_usize("BOTHERD_LOG_FILE_MAX_FILES")
        .map(|v| v.clamp(1, 20))
        .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES);
    (max_bytes, max_files)
}

/// Grace period a stopping bot gets between SIGTERM and SIGKILL.
pub(crate) const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Settle time between the stop and start halves of a restart, so the OS can
/// release the old client's resources before the new one logs in.
pub(crate) const RESTART_SETTLE: Duration = Duration::from_secs(2);

/// Flattens an error chain into one `context: context: cause` line for bot
/// log entries. An anyhow context that merely repeats its cause is skipped.
pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut out = String::new();
    for cause in err.chain() {
        let msg = cause.to_string();
        if msg.is_empty() || out.ends_with(&msg) {
            continue;
        }
        if !out.is_empty() {
            out.push_str(": ");
        }
        out.push_str(&msg);
    }
    if out.is_empty() {
        "unknown error".to_string()
    } else {
        out
    }
}

/// Single chokepoint for the non-fatal I/O category (log files, pid map,
/// position file). Failures are logged and dropped; they must never reach
/// the supervising logic.
pub(crate) fn best_effort<T>(what: &str, res: anyhow::Result<T>) -> Option<T> {
    match res {
        Ok(v) => Some(v),
        Err(err) => {
            tracing::debug!(what, error = %format_error_chain(&err), "best-effort io failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_dedupes_adjacent_messages() {
        let inner = anyhow::anyhow!("disk full");
        let err = inner.context("disk full").context("write pid map");
        assert_eq!(format_error_chain(&err), "write pid map: disk full");
    }

    #[test]
    fn best_effort_swallows_errors() {
        let res: anyhow::Result<()> = Err(anyhow::anyhow!("nope"));
        assert!(best_effort("test", res).is_none());
        assert_eq!(best_effort("test", anyhow::Ok(7)), Some(7));
    }
}
