//! Persisted state snapshot: relay on/off and cover positions, one JSON
//! file under the config directory. Loading is lenient (missing file means
//! empty state); saves are debounced with skip-if-busy semantics and write
//! through a temp file so a power cut never truncates the snapshot.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverStateEntry {
    pub position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tilt: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub relay: HashMap<String, bool>,
    #[serde(default)]
    pub cover: HashMap<String, CoverStateEntry>,
}

pub struct StateManager {
    path: PathBuf,
    state: Mutex<State>,
    save_lock: tokio::sync::Mutex<()>,
}

impl StateManager {
    /// Load the snapshot, or start empty when the file is missing/broken.
    pub fn load(path: &Path) -> Arc<StateManager> {
        let state = match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(state) => {
                    info!("State file found, loading state.");
                    state
                }
                Err(err) => {
                    warn!("State file is corrupted ({err}), starting fresh.");
                    State::default()
                }
            },
            Err(_) => {
                warn!("State file not found, creating new one.");
                State::default()
            }
        };
        Arc::new(StateManager {
            path: path.to_path_buf(),
            state: Mutex::new(state),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn relay_state(&self, relay_id: &str) -> Option<bool> {
        self.state.lock().unwrap().relay.get(relay_id).copied()
    }

    pub fn cover_state(&self, cover_id: &str) -> Option<CoverStateEntry> {
        self.state.lock().unwrap().cover.get(cover_id).cloned()
    }

    pub fn set_relay(self: &Arc<Self>, relay_id: &str, on: bool) {
        self.state
            .lock()
            .unwrap()
            .relay
            .insert(relay_id.to_string(), on);
        self.save();
    }

    pub fn remove_relay(self: &Arc<Self>, relay_id: &str) {
        self.state.lock().unwrap().relay.remove(relay_id);
        self.save();
    }

    pub fn set_cover(self: &Arc<Self>, cover_id: &str, position: i64, tilt: Option<i64>) {
        self.state
            .lock()
            .unwrap()
            .cover
            .insert(cover_id.to_string(), CoverStateEntry { position, tilt });
        self.save();
    }

    /// Schedule an async save; if one is already in flight this request is
    /// dropped (the running save will pick up the newest state soon enough).
    pub fn save(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let Ok(_guard) = manager.save_lock.try_lock() else {
                info!("State file is locked, skipping save.");
                return;
            };
            if let Err(err) = manager.save_now().await {
                warn!("Cannot save state file: {err}");
            }
        });
    }

    async fn save_now(&self) -> std::io::Result<()> {
        let payload = {
            let state = self.state.lock().unwrap();
            serde_json::to_string(&*state).unwrap_or_else(|_| "{}".to_string())
        };
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let manager = StateManager::load(&path);
        manager.set_relay("r1", true);
        manager.set_relay("r2", false);
        manager.set_cover("salon", 40, Some(100));
        manager.set_cover("garaz", 0, None);
        manager.save_now().await.unwrap();

        let reloaded = StateManager::load(&path);
        assert_eq!(reloaded.relay_state("r1"), Some(true));
        assert_eq!(reloaded.relay_state("r2"), Some(false));
        assert_eq!(
            reloaded.cover_state("salon"),
            Some(CoverStateEntry {
                position: 40,
                tilt: Some(100)
            })
        );
        assert_eq!(
            reloaded.cover_state("garaz"),
            Some(CoverStateEntry {
                position: 0,
                tilt: None
            })
        );
        assert_eq!(reloaded.relay_state("unknown"), None);
    }

    #[tokio::test]
    async fn missing_and_corrupt_files_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = StateManager::load(&dir.path().join("nope.json"));
        assert_eq!(missing.relay_state("r1"), None);

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let corrupt = StateManager::load(&path);
        assert_eq!(corrupt.relay_state("r1"), None);
    }

    #[tokio::test]
    async fn tilt_is_omitted_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let manager = StateManager::load(&path);
        manager.set_cover("salon", 40, None);
        manager.save_now().await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("tilt"));
    }
}
