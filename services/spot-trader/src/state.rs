//! State Management - heartbeat file for observability

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Writes `state/now.json` under the data directory
pub struct StateManager {
    state_dir: PathBuf,
}

/// Current status (state/now.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NowState {
    pub timestamp: String,
    pub mode: String,
    pub status: String,
    pub symbols: Vec<String>,
    pub open_positions: usize,
    pub balance: String,
    pub doom_mode: bool,
    pub halted: bool,
    pub sentiment: f64,
    pub mood: String,
    pub last_decision_at: Option<String>,
    pub session_stats: SessionStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub decisions: u64,
    pub entries: u64,
    pub trades_closed: u64,
    pub realized_pnl: String,
}

impl StateManager {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            state_dir: data_dir.join("state"),
        }
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        Ok(())
    }

    pub fn now_path(&self) -> PathBuf {
        self.state_dir.join("now.json")
    }

    pub async fn write_now(&self, state: &NowState) -> anyhow::Result<()> {
        let path = self.now_path();
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&path, json).await?;
        debug!("Wrote state/now.json");
        Ok(())
    }

    pub async fn read_now(&self) -> anyhow::Result<NowState> {
        let content = fs::read_to_string(self.now_path()).await?;
        Ok(serde_json::from_str(&content)?)
    }
}
