// src/file_manager.rs - program files on disk
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum FileManagerError {
    #[error("cannot read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{0}' contains no instructions")]
    Empty(String),
}

/// Resolves job file references and turns them into executable lines.
#[derive(Debug, Clone)]
pub struct FileManager {
    root: PathBuf,
}

impl Default for FileManager {
    fn default() -> Self {
        Self::new(".")
    }
}

impl FileManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub async fn load_program(&self, file: &str) -> Result<Vec<String>, FileManagerError> {
        let path = self.resolve(file);
        tracing::info!("Reading G-code file: {}", path.display());
        let content = fs::read_to_string(&path)
            .await
            .map_err(|source| FileManagerError::Read {
                path: path.display().to_string(),
                source,
            })?;
        let lines = program_lines(&content);
        if lines.is_empty() {
            return Err(FileManagerError::Empty(file.to_string()));
        }
        tracing::info!("Processed {} G-code lines from {}", lines.len(), file);
        Ok(lines)
    }
}

/// Instruction lines of a program: comments and blank lines dropped.
pub fn program_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split(';').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
