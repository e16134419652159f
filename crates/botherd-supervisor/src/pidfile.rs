use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tokio::io::AsyncWriteExt;

use crate::process::pid_alive;

/// On-disk `bot_id -> pid` map surviving supervisor restarts.
///
/// Written after every successful start, cleared after every successful
/// stop. All writes go through a tmp + rename so a crash mid-write never
/// leaves a truncated map behind.
#[derive(Debug)]
pub struct PidMap {
    path: PathBuf,
    guard: tokio::sync::Mutex<()>,
}

impl PidMap {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("bot_pids.json"),
            guard: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_map(&self) -> HashMap<String, u32> {
        let Ok(raw) = tokio::fs::read_to_string(&self.path).await else {
            return HashMap::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    async fn write_map(&self, map: &HashMap<String, u32>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("create state dir")?;
        }
        let data = serde_json::to_vec_pretty(map).context("serialize pid map")?;
        let tmp = self.path.with_extension("json.tmp");
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(&data).await.context("write pid map")?;
        f.flush().await.ok();
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("persist pid map")?;
        Ok(())
    }

    /// Loads the map, dropping entries whose PID is no longer alive. The
    /// pruned map is written back so stale entries don't accumulate.
    pub async fn load_live(&self) -> HashMap<String, u32> {
        let _g = self.guard.lock().await;
        let mut map = self.read_map().await;
        let before = map.len();
        map.retain(|_, pid| pid_alive(*pid));
        if map.len() != before {
            crate::util::best_effort("prune pid map", self.write_map(&map).await);
        }
        map
    }

    pub async fn record(&self, bot_id: &str, pid: u32) -> anyhow::Result<()> {
        let _g = self.guard.lock().await;
        let mut map = self.read_map().await;
        map.insert(bot_id.to_string(), pid);
        self.write_map(&map).await
    }

    pub async fn clear(&self, bot_id: &str) -> anyhow::Result<()> {
        let _g = self.guard.lock().await;
        let mut map = self.read_map().await;
        if map.remove(bot_id).is_none() {
            return Ok(());
        }
        self.write_map(&map).await
    }
}
