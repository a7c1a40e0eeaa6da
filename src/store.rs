//! Single-document JSON persistence for the item queue and posted archive.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::model::Item;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The whole persisted state: pending queue, posted archive, write stamp.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub queue: Vec<Item>,
    #[serde(default)]
    pub posted: Vec<Item>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Owns the state document and its file path. All mutation goes through
/// methods here so callers cannot forget the dedupe and archive rules.
pub struct StateStore {
    path: PathBuf,
    state: AgentState,
}

impl StateStore {
    /// Load state from `path`, or start empty when the file does not exist.
    /// A present but unreadable document is logged and replaced on next save.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<AgentState>(&content) {
                Ok(state) => {
                    info!(
                        queue = state.queue.len(),
                        posted = state.posted.len(),
                        "loaded agent state"
                    );
                    state
                }
                Err(err) => {
                    warn!(?err, path = %path.display(), "state file unreadable, starting empty");
                    AgentState::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => AgentState::default(),
            Err(err) => {
                warn!(?err, path = %path.display(), "state file unreadable, starting empty");
                AgentState::default()
            }
        };
        Self { path, state }
    }

    /// Persist the full document. Writes to a sibling temp file first and
    /// renames over the target so readers never observe a partial document.
    pub fn save(&mut self) -> Result<(), StoreError> {
        self.state.last_updated = Some(Utc::now());
        let json = serde_json::to_vec_pretty(&self.state)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn queue(&self) -> &[Item] {
        &self.state.queue
    }

    pub fn queue_mut(&mut self) -> &mut Vec<Item> {
        &mut self.state.queue
    }

    pub fn posted(&self) -> &[Item] {
        &self.state.posted
    }

    /// True when the id exists anywhere, queued or already posted.
    pub fn contains(&self, id: &str) -> bool {
        self.state.queue.iter().any(|i| i.id == id) || self.state.posted.iter().any(|i| i.id == id)
    }

    /// Append an item unless its id is already known. Returns whether the
    /// item was added.
    pub fn enqueue(&mut self, item: Item) -> bool {
        if self.contains(&item.id) {
            return false;
        }
        self.state.queue.push(item);
        true
    }

    /// Move a queued item into the posted archive. Returns false when the id
    /// is not in the queue.
    pub fn move_to_posted(&mut self, id: &str) -> bool {
        let Some(pos) = self.state.queue.iter().position(|i| i.id == id) else {
            return false;
        };
        let item = self.state.queue.remove(pos);
        self.state.posted.push(item);
        true
    }

    pub fn ready_count(&self) -> usize {
        self.state
            .queue
            .iter()
            .filter(|i| i.ready_to_publish() && !i.posted)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MediaAsset, MediaKind};
    use tempfile::tempdir;

    fn item(id: &str) -> Item {
        Item::new(id, "trader", format!("text {id}"))
    }

    #[test]
    fn open_missing_file_starts_empty() {
        let td = tempdir().unwrap();
        let store = StateStore::open(td.path().join("agent_state.json"));
        assert!(store.queue().is_empty());
        assert!(store.posted().is_empty());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let td = tempdir().unwrap();
        let path = td.path().join("agent_state.json");

        let mut store = StateStore::open(&path);
        let mut it = item("100");
        it.media
            .push(MediaAsset::new("m-1", MediaKind::Photo, "https://cdn/a.jpg"));
        assert!(store.enqueue(it));
        store.save().unwrap();

        let reloaded = StateStore::open(&path);
        assert_eq!(reloaded.queue().len(), 1);
        assert_eq!(reloaded.queue()[0].id, "100");
        assert_eq!(reloaded.queue()[0].media.len(), 1);
    }

    #[test]
    fn enqueue_rejects_duplicate_ids() {
        let td = tempdir().unwrap();
        let mut store = StateStore::open(td.path().join("s.json"));
        assert!(store.enqueue(item("1")));
        assert!(!store.enqueue(item("1")));
        assert_eq!(store.queue().len(), 1);

        assert!(store.move_to_posted("1"));
        assert!(!store.enqueue(item("1")), "posted ids stay known");
        assert!(store.queue().is_empty());
        assert_eq!(store.posted().len(), 1);
    }

    #[test]
    fn move_to_posted_unknown_id_is_noop() {
        let td = tempdir().unwrap();
        let mut store = StateStore::open(td.path().join("s.json"));
        store.enqueue(item("1"));
        assert!(!store.move_to_posted("2"));
        assert_eq!(store.queue().len(), 1);
        assert!(store.posted().is_empty());
    }

    #[test]
    fn corrupt_state_file_starts_empty() {
        let td = tempdir().unwrap();
        let path = td.path().join("agent_state.json");
        fs::write(&path, "{not json").unwrap();
        let store = StateStore::open(&path);
        assert!(store.queue().is_empty());
    }

    #[test]
    fn save_sets_last_updated_and_leaves_no_temp_file() {
        let td = tempdir().unwrap();
        let path = td.path().join("agent_state.json");
        let mut store = StateStore::open(&path);
        store.enqueue(item("7"));
        store.save().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert!(doc["last_updated"].is_string());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn ready_count_honors_gate() {
        let td = tempdir().unwrap();
        let mut store = StateStore::open(td.path().join("s.json"));
        let mut a = item("a");
        a.rewritten_text = Some("done".into());
        store.enqueue(a);
        store.enqueue(item("b"));
        assert_eq!(store.ready_count(), 1);
    }
}
