//! Append-only JSON-lines files shared by the ledger, trade history and audit log

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use crate::error::StoreError;

/// Handle to a file opened in append mode. Rows are never rewritten.
pub struct JsonlFile {
    path: PathBuf,
    file: File,
}

impl JsonlFile {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        repair_tail(path).await?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Append one row and push it to disk before returning
    pub async fn append<T: Serialize>(&mut self, row: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(row)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<(), StoreError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Make the file end on a row boundary before appending to it.
///
/// A final line without its newline is either a whole row (terminated here)
/// or a fragment from a crash mid-write (cut off at the last newline).
async fn repair_tail(path: &Path) -> Result<(), StoreError> {
    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if content.is_empty() || content.ends_with(b"\n") {
        return Ok(());
    }

    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    let tail = &content[keep..];
    let mut file = OpenOptions::new().write(true).open(path).await?;

    if serde_json::from_slice::<serde_json::Value>(tail).is_ok() {
        warn!("Terminating unfinished last row in {}", path.display());
        file.seek(SeekFrom::End(0)).await?;
        file.write_all(b"\n").await?;
    } else {
        warn!(
            "Truncating {} torn bytes at the end of {}",
            tail.len(),
            path.display()
        );
        file.set_len(keep as u64).await?;
    }
    file.sync_all().await?;
    Ok(())
}

/// Read every row of a JSON-lines file. A missing file reads as empty.
///
/// A torn final line (no trailing newline, left by a crash mid-write) is
/// skipped with a warning; any other unparsable line is corruption.
pub async fn read_all<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let complete = content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();
    let mut rows = Vec::with_capacity(lines.len());

    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(row) => rows.push(row),
            Err(e) if !complete && idx + 1 == lines.len() => {
                warn!(
                    "Skipping torn trailing line in {}: {}",
                    path.display(),
                    e
                );
            }
            Err(e) => {
                return Err(StoreError::Corrupt {
                    path: path.display().to_string(),
                    reason: format!("line {}: {}", idx + 1, e),
                });
            }
        }
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        n: u32,
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rows.jsonl");

        let mut file = JsonlFile::open(&path).await.unwrap();
        file.append(&Row { n: 1 }).await.unwrap();
        file.append(&Row { n: 2 }).await.unwrap();

        // Reopening appends after existing rows
        let mut file = JsonlFile::open(&path).await.unwrap();
        file.append(&Row { n: 3 }).await.unwrap();

        let rows: Vec<Row> = read_all(&path).await.unwrap();
        assert_eq!(rows, vec![Row { n: 1 }, Row { n: 2 }, Row { n: 3 }]);
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<Row> = read_all(&dir.path().join("absent.jsonl")).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_torn_tail_is_skipped_but_mid_file_garbage_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");

        std::fs::write(&path, "{\"n\":1}\n{\"n\":").unwrap();
        let rows: Vec<Row> = read_all(&path).await.unwrap();
        assert_eq!(rows, vec![Row { n: 1 }]);

        std::fs::write(&path, "{\"n\":1}\ngarbage\n{\"n\":3}\n").unwrap();
        assert!(matches!(
            read_all::<Row>(&path).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_append_after_torn_tail_keeps_file_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        std::fs::write(&path, "{\"n\":1}\n{\"n\":").unwrap();

        let mut file = JsonlFile::open(&path).await.unwrap();
        file.append(&Row { n: 2 }).await.unwrap();
        drop(file);

        let rows: Vec<Row> = read_all(&path).await.unwrap();
        assert_eq!(rows, vec![Row { n: 1 }, Row { n: 2 }]);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{\"n\":1}\n{\"n\":2}\n"
        );
    }

    #[tokio::test]
    async fn test_whole_row_missing_newline_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        std::fs::write(&path, "{\"n\":1}\n{\"n\":2}").unwrap();

        let mut file = JsonlFile::open(&path).await.unwrap();
        file.append(&Row { n: 3 }).await.unwrap();
        drop(file);

        let rows: Vec<Row> = read_all(&path).await.unwrap();
        assert_eq!(rows, vec![Row { n: 1 }, Row { n: 2 }, Row { n: 3 }]);
    }
}
