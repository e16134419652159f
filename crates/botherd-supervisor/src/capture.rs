use std::{path::PathBuf, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStderr, ChildStdout},
    sync::{Mutex, mpsc},
};

use crate::{bot::BotRecord, extract::MetricsExtractor, util};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSource {
    Stdout,
    Stderr,
}

impl LineSource {
    fn tag(self) -> &'static str {
        match self {
            LineSource::Stdout => "STDOUT",
            LineSource::Stderr => "STDERR",
        }
    }
}

/// Append-only per-bot log file, capped by rotation.
///
/// Client chatter is unbounded; with `max_files` numbered rotations the
/// per-bot disk footprint stays near `max_bytes * (max_files + 1)`.
struct FileLogWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    bytes: u64,
    file: tokio::fs::File,
}

impl FileLogWriter {
    async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        // Resuming an existing file counts its current size toward the cap.
        let bytes = file.metadata().await.map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            path,
            max_bytes,
            max_files,
            bytes,
            file,
        })
    }

    fn slot(&self, i: usize) -> PathBuf {
        PathBuf::from(format!("{}.{i}", self.path.display()))
    }

    /// Drops the oldest rotation, ages the rest (`<bot>.log.1` is always the
    /// newest), and reopens a fresh current file. Renames onto missing slots
    /// simply fail and are ignored.
    async fn rotate(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush().await;

        let _ = tokio::fs::remove_file(self.slot(self.max_files)).await;
        for i in (1..self.max_files).rev() {
            let _ = tokio::fs::rename(self.slot(i), self.slot(i + 1)).await;
        }
        let _ = tokio::fs::rename(&self.path, self.slot(1)).await;

        self.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.bytes = 0;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let len = line.len() as u64 + 1;
        if self.max_bytes > 0 && self.bytes.saturating_add(len) > self.max_bytes {
            self.rotate().await.ok();
        }

        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.bytes = self.bytes.saturating_add(len);
        Ok(())
    }
}

/// Drains a running bot's stdout/stderr.
///
/// Two reader tasks emit line events onto one channel; a single consumer
/// owns all writes to the record's log buffer and metrics, so readers never
/// contend on the record. Readers exit on end-of-stream (process exited) or
/// a stream error, and never hold anything that could block shutdown.
pub fn start_capture(
    record: Arc<Mutex<BotRecord>>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    extractor: Arc<dyn MetricsExtractor>,
    log_path: Option<PathBuf>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(LineSource, String)>();

    if let Some(out) = stdout {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send((LineSource::Stdout, line)).is_err() {
                    break;
                }
            }
        });
    }
    if let Some(err) = stderr {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send((LineSource::Stderr, line)).is_err() {
                    break;
                }
            }
        });
    }
    // Consumer ends once both readers are done.
    drop(tx);

    let file_tx = log_path.map(|path| {
        let (file_tx, mut file_rx) = mpsc::unbounded_channel::<String>();
        let (max_bytes, max_files) = util::log_file_limits();
        tokio::spawn(async move {
            let Some(mut writer) = util::best_effort(
                "open bot log file",
                FileLogWriter::open(path, max_bytes, max_files)
                    .await
                    .map_err(anyhow::Error::from),
            ) else {
                return;
            };
            while let Some(line) = file_rx.recv().await {
                util::best_effort(
                    "append bot log file",
                    writer.write_line(&line).await.map_err(anyhow::Error::from),
                );
            }
        });
        file_tx
    });

    tokio::spawn(async move {
        while let Some((source, line)) = rx.recv().await {
            if let Some(tx) = &file_tx {
                let _ = tx.send(format!("[{}] {line}", source.tag()));
            }

            // Extraction happens outside the record lock; it is pure text work.
            let delta = match source {
                LineSource::Stdout => extractor.extract(&line),
                LineSource::Stderr => Default::default(),
            };

            let mut rec = record.lock().await;
            rec.add_log(&line, source.tag());
            if !delta.is_empty() {
                rec.metrics.total_xp_gained += delta.xp_gained;
                rec.metrics.items_collected += delta.items_collected;
                rec.metrics.profit += delta.profit;
                rec.metrics.deaths += delta.deaths;
                rec.metrics.trades_completed += delta.trades_completed;
                if delta.xp_gained > 0 {
                    // An XP delta also refreshes the derived xp/hr rate.
                    rec.update_runtime();
                }
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::extract::RegexExtractor;
    use crate::process::ProcessHandle;
    use botherd_core::BotConfig;
    use std::time::Duration;

    fn record() -> Arc<Mutex<BotRecord>> {
        let cfg = BotConfig {
            bot_id: "b1".to_string(),
            account_name: "acct".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            script_name: "FishingBot".to_string(),
            script_args: vec![],
            auto_restart: true,
            max_runtime_hours: None,
            health_check_interval: None,
            restart_cooldown: None,
            max_restart_attempts: None,
        };
        Arc::new(Mutex::new(BotRecord::new(cfg, &Settings::default())))
    }

    #[tokio::test]
    async fn capture_tags_streams_and_feeds_the_extractor() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("b1.log");
        let spawned = ProcessHandle::spawn(
            "/bin/sh",
            &[
                "-c".to_string(),
                "printf 'You gained 10 xp\\nwalking\\n'; printf 'boom\\n' 1>&2".to_string(),
            ],
            dir.path(),
        )
        .unwrap();

        let rec = record();
        start_capture(
            rec.clone(),
            spawned.stdout,
            spawned.stderr,
            Arc::new(RegexExtractor),
            Some(log_path.clone()),
        );

        // Short-lived process; give the drains a moment.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut guard = rec.lock().await;
        let lines = guard.recent_logs(50);
        assert!(lines.iter().any(|l| l.contains("[STDOUT] You gained 10 xp")));
        assert!(lines.iter().any(|l| l.contains("[STDERR] boom")));
        assert_eq!(guard.metrics.total_xp_gained, 10);
        drop(guard);

        let file = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(file.contains("[STDOUT] You gained 10 xp"));
        assert!(file.contains("[STDERR] boom"));
    }

    #[tokio::test]
    async fn stderr_lines_never_feed_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let spawned = ProcessHandle::spawn(
            "/bin/sh",
            &["-c".to_string(), "printf 'gained 99 xp\\n' 1>&2".to_string()],
            dir.path(),
        )
        .unwrap();

        let rec = record();
        start_capture(
            rec.clone(),
            spawned.stdout,
            spawned.stderr,
            Arc::new(RegexExtractor),
            None,
        );
        tokio::time::sleep(Duration::from_millis(400)).await;

        let guard = rec.lock().await;
        assert_eq!(guard.metrics.total_xp_gained, 0);
        assert!(guard.recent_logs(10).iter().any(|l| l.contains("[STDERR]")));
    }

    #[tokio::test]
    async fn log_file_rotation_keeps_the_newest_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b1.log");
        // Tiny cap so every line forces a rotation; two rotation slots.
        let mut w = FileLogWriter::open(path.clone(), 16, 2).await.unwrap();
        for i in 0..4 {
            w.write_line(&format!("line {i} padding....")).await.unwrap();
        }
        w.file.flush().await.unwrap();
        drop(w);

        let current = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(current.contains("line 3"));
        let newest = tokio::fs::read_to_string(dir.path().join("b1.log.1"))
            .await
            .unwrap();
        assert!(newest.contains("line 2"));
        let older = tokio::fs::read_to_string(dir.path().join("b1.log.2"))
            .await
            .unwrap();
        assert!(older.contains("line 1"));
        // The oldest lines aged out entirely.
        assert!(!tokio::fs::try_exists(dir.path().join("b1.log.3"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn missing_log_dir_does_not_break_capture() {
        let dir = tempfile::tempdir().unwrap();
        // Unwritable path: parent is a file, so create_dir_all fails.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let bad_path = blocker.join("sub").join("b1.log");

        let spawned = ProcessHandle::spawn(
            "/bin/sh",
            &["-c".to_string(), "printf 'hello\\n'".to_string()],
            dir.path(),
        )
        .unwrap();

        let rec = record();
        start_capture(
            rec.clone(),
            spawned.stdout,
            spawned.stderr,
            Arc::new(RegexExtractor),
            Some(bad_path),
        );
        tokio::time::sleep(Duration::from_millis(400)).await;

        let guard = rec.lock().await;
        assert!(guard.recent_logs(10).iter().any(|l| l.contains("hello")));
    }
}
