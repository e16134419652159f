use std::{collections::HashMap, path::PathBuf, sync::atomic::Ordering, time::Duration};

use crate::supervisor::Supervisor;

/// Receives best-effort position observations fanned out from the
/// position-file watcher (map rendering stays outside this crate).
pub trait PositionListener: Send + Sync {
    fn position(&self, bot_id: &str, tile_x: i32, tile_y: i32, layer: &str);
}

const LAYERS: [&str; 4] = ["surface", "floor1", "floor2", "dungeon"];

#[derive(Debug, serde::Deserialize)]
struct RawPosition {
    tile_x: Option<i64>,
    tile_y: Option<i64>,
    x: Option<i64>,
    y: Option<i64>,
    layer: Option<String>,
}

/// Parses the watcher file: `bot_id -> {tile_x, tile_y, layer}`. Unknown
/// layers fall back to "surface"; malformed entries are skipped.
fn parse_positions(raw: &str) -> Vec<(String, i32, i32, String)> {
    let Ok(map) = serde_json::from_str::<HashMap<String, RawPosition>>(raw) else {
        return Vec::new();
    };
    let mut out: Vec<(String, i32, i32, String)> = map
        .into_iter()
        .filter_map(|(bot_id, entry)| {
            let x = entry.tile_x.or(entry.x)?;
            let y = entry.tile_y.or(entry.y)?;
            let x = i32::try_from(x).ok()?;
            let y = i32::try_from(y).ok()?;
            let layer = entry
                .layer
                .map(|l| l.to_ascii_lowercase())
                .filter(|l| LAYERS.contains(&l.as_str()))
                .unwrap_or_else(|| "surface".to_string());
            Some((bot_id, x, y, layer))
        })
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

/// Periodically reads the position file (if configured) and notifies the
/// supervisor's listeners. Read errors and malformed JSON are skipped; the
/// watcher keeps polling.
pub(crate) fn start_watcher(sup: Supervisor) {
    let settings = sup.settings();
    let Some(file) = settings.position_file.clone() else {
        return;
    };
    if sup.position_watcher_running().swap(true, Ordering::SeqCst) {
        return;
    }
    let path: PathBuf = settings.resolve(sup.root(), &file);
    let interval = Duration::from_secs_f64(settings.position_poll_secs.max(0.1));

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if !sup.position_watcher_running().load(Ordering::SeqCst) {
                break;
            }
            let Ok(raw) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            for (bot_id, x, y, layer) in parse_positions(&raw) {
                sup.notify_position(&bot_id, x, y, &layer);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tile_coordinates_and_layer() {
        let raw = r#"{"b1": {"tile_x": 120, "tile_y": 450, "layer": "dungeon"}}"#;
        let got = parse_positions(raw);
        assert_eq!(got, vec![("b1".to_string(), 120, 450, "dungeon".to_string())]);
    }

    #[test]
    fn accepts_short_coordinate_keys() {
        let raw = r#"{"b1": {"x": 10, "y": 20}}"#;
        let got = parse_positions(raw);
        assert_eq!(got, vec![("b1".to_string(), 10, 20, "surface".to_string())]);
    }

    #[test]
    fn unknown_layer_falls_back_to_surface() {
        let raw = r#"{"b1": {"tile_x": 1, "tile_y": 2, "layer": "Basement"}}"#;
        assert_eq!(parse_positions(raw)[0].3, "surface");
        let raw = r#"{"b1": {"tile_x": 1, "tile_y": 2, "layer": "FLOOR1"}}"#;
        assert_eq!(parse_positions(raw)[0].3, "floor1");
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let raw = r#"{"b1": {"layer": "surface"}, "b2": {"tile_x": 3, "tile_y": 4}}"#;
        let got = parse_positions(raw);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, "b2");
        assert!(parse_positions("not json").is_empty());
        assert!(parse_positions("[1,2,3]").is_empty());
    }
}
