//! Headline sources for sentiment analysis

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[async_trait]
pub trait HeadlineSource: Send + Sync {
    /// Latest headlines, most relevant first
    async fn fetch(&self) -> anyhow::Result<Vec<String>>;
}

/// Headlines read from a text file, one per line. The file is re-read on
/// every fetch so an operator or a sidecar can refresh it.
pub struct StaticHeadlines {
    path: PathBuf,
}

impl StaticHeadlines {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

#[async_trait]
impl HeadlineSource for StaticHeadlines {
    async fn fetch(&self) -> anyhow::Result<Vec<String>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Headline file {} not found", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let headlines: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .collect();
        debug!("Read {} headlines from {}", headlines.len(), self.path.display());
        Ok(headlines)
    }
}

/// No headlines at all; sentiment stays neutral
pub struct NoHeadlines;

#[async_trait]
impl HeadlineSource for NoHeadlines {
    async fn fetch(&self) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}
