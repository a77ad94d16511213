//! Open positions, persisted as one versioned snapshot file
//!
//! The snapshot is rewritten on every mutation through a temp file and a
//! rename, so a crash leaves either the previous snapshot or the new one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{Position, PositionState};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    positions: Vec<Position>,
}

/// Keyed store of open positions. Closed positions are never kept.
///
/// The in-memory map keeps every mutation even when the snapshot write fails;
/// the error then means the file on disk is behind.
pub struct PositionStore {
    path: PathBuf,
    positions: Mutex<HashMap<Uuid, Position>>,
}

impl PositionStore {
    /// Load the snapshot at `path`, or start empty when none exists
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let positions = match fs::read_to_string(path).await {
            Ok(content) => {
                let snapshot: Snapshot = serde_json::from_str(&content).map_err(|e| {
                    StoreError::Corrupt {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    }
                })?;
                if snapshot.version != SNAPSHOT_VERSION {
                    return Err(StoreError::UnsupportedVersion {
                        found: snapshot.version,
                        expected: SNAPSHOT_VERSION,
                    });
                }
                info!(
                    "Loaded {} open positions (snapshot from {})",
                    snapshot.positions.len(),
                    snapshot.saved_at
                );
                snapshot
                    .positions
                    .into_iter()
                    .filter(|p| p.is_open())
                    .map(|p| (p.id, p))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            positions: Mutex::new(positions),
        })
    }

    /// Insert a new position. A duplicate id is logged and ignored.
    pub async fn insert(&self, position: Position) -> Result<bool, StoreError> {
        let mut positions = self.positions.lock().await;
        if positions.contains_key(&position.id) {
            warn!("Position {} already stored, ignoring insert", position.id);
            return Ok(false);
        }

        positions.insert(position.id, position);
        self.persist(&positions).await?;
        Ok(true)
    }

    /// Remove a position. A missing id is logged and returns `None`.
    pub async fn remove(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        let mut positions = self.positions.lock().await;
        let Some(removed) = positions.remove(&id) else {
            warn!("Position {} not found, nothing to remove", id);
            return Ok(None);
        };

        self.persist(&positions).await?;
        Ok(Some(removed))
    }

    /// Replace a stored position with an updated copy
    pub async fn update(&self, position: Position) -> Result<bool, StoreError> {
        let mut positions = self.positions.lock().await;
        if position.state == PositionState::Closed {
            warn!("Refusing to store closed position {}", position.id);
            return Ok(false);
        }
        let Some(slot) = positions.get_mut(&position.id) else {
            warn!("Position {} not found, nothing to update", position.id);
            return Ok(false);
        };
        *slot = position;

        self.persist(&positions).await?;
        Ok(true)
    }

    /// Record the latest processed tick time without rewriting the snapshot
    pub async fn mark_tick(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(position) = self.positions.lock().await.get_mut(&id) {
            position.last_tick_at = Some(at);
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<Position> {
        self.positions.lock().await.get(&id).cloned()
    }

    /// All open positions, oldest entry first
    pub async fn all(&self) -> Vec<Position> {
        let mut all: Vec<Position> = self.positions.lock().await.values().cloned().collect();
        all.sort_by_key(|p| p.entry_time);
        all
    }

    pub async fn for_symbol(&self, symbol: &str) -> Vec<Position> {
        let mut matching: Vec<Position> = self
            .positions
            .lock()
            .await
            .values()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect();
        matching.sort_by_key(|p| p.entry_time);
        matching
    }

    pub async fn len(&self) -> usize {
        self.positions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.positions.lock().await.is_empty()
    }

    /// Write the snapshot atomically. Called with the lock held.
    async fn persist(&self, positions: &HashMap<Uuid, Position>) -> Result<(), StoreError> {
        let mut list: Vec<Position> = positions.values().cloned().collect();
        list.sort_by_key(|p| p.entry_time);

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            positions: list,
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;

        debug!("Persisted {} positions to {}", snapshot.positions.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, TrailingConfig};
    use rust_decimal_macros::dec;

    fn sample(symbol: &str) -> Position {
        Position::open(
            symbol,
            Direction::Long,
            dec!(150),
            dec!(1),
            dec!(148),
            dec!(156),
            Some(TrailingConfig {
                activation_price: dec!(153),
                distance: dec!(1.5),
            }),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_round_trip_through_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");

        let store = PositionStore::open(&path).await.unwrap();
        let mut sol = sample("SOLUSDT");
        let eth = sample("ETHUSDT");
        assert!(store.insert(sol.clone()).await.unwrap());
        assert!(store.insert(eth.clone()).await.unwrap());

        sol.state = PositionState::OpenPartial;
        sol.quantity = dec!(0.5);
        sol.stop_loss = dec!(150);
        sol.trailing_stop = Some(dec!(151.2));
        assert!(store.update(sol.clone()).await.unwrap());

        let reopened = PositionStore::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 2);
        assert_eq!(reopened.get(sol.id).await, Some(sol.clone()));
        assert_eq!(reopened.get(eth.id).await, Some(eth));
        assert_eq!(reopened.for_symbol("SOLUSDT").await, vec![sol]);
        assert!(!dir.path().join("positions.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_duplicate_insert_and_missing_remove_are_noops() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::open(&dir.path().join("positions.json"))
            .await
            .unwrap();

        let pos = sample("SOLUSDT");
        assert!(store.insert(pos.clone()).await.unwrap());
        assert!(!store.insert(pos.clone()).await.unwrap());
        assert_eq!(store.len().await, 1);

        assert!(store.remove(Uuid::new_v4()).await.unwrap().is_none());
        assert!(!store.update(sample("ETHUSDT")).await.unwrap());
        assert_eq!(store.len().await, 1);

        assert_eq!(store.remove(pos.id).await.unwrap(), Some(pos));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_snapshot_write_keeps_the_mutation_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        let store = PositionStore::open(&path).await.unwrap();

        let mut pos = sample("SOLUSDT");
        store.insert(pos.clone()).await.unwrap();

        // A directory where the temp file goes makes every write fail
        std::fs::create_dir(dir.path().join("positions.json.tmp")).unwrap();

        pos.stop_loss = dec!(150);
        assert!(store.update(pos.clone()).await.is_err());
        assert_eq!(store.get(pos.id).await.unwrap().stop_loss, dec!(150));

        assert!(store.remove(pos.id).await.is_err());
        assert!(store.get(pos.id).await.is_none());
        assert!(store.is_empty().await);

        // The file still holds the last good snapshot
        let on_disk = PositionStore::open(&path).await.unwrap();
        assert_eq!(on_disk.get(pos.id).await.unwrap().stop_loss, dec!(148));
    }

    #[tokio::test]
    async fn test_unknown_snapshot_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        std::fs::write(
            &path,
            r#"{"version": 9, "saved_at": "2024-01-01T00:00:00Z", "positions": []}"#,
        )
        .unwrap();

        assert!(matches!(
            PositionStore::open(&path).await,
            Err(StoreError::UnsupportedVersion { found: 9, .. })
        ));
    }

    #[tokio::test]
    async fn test_mark_tick_is_in_memory_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        let store = PositionStore::open(&path).await.unwrap();

        let pos = sample("SOLUSDT");
        store.insert(pos.clone()).await.unwrap();
        let at = Utc::now();
        store.mark_tick(pos.id, at).await;

        assert_eq!(store.get(pos.id).await.unwrap().last_tick_at, Some(at));
        let reopened = PositionStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(pos.id).await.unwrap().last_tick_at, None);
    }
}
