//! Hostname blocklist
//!
//! The ingest pipeline maintains a file of known-bad hostnames; this
//! module loads it into a set and answers `blocked(name)`. A config
//! event at `@/updates/dns_blocklist` triggers a reload.

use crate::error::GwctlResult;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Clone)]
pub struct Blocklist {
    path: PathBuf,
    names: Arc<RwLock<HashSet<String>>>,
}

impl Blocklist {
    /// Create an empty blocklist backed by a file that may not exist yet
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            names: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Load (or reload) the backing file; one hostname per line,
    /// `#` starts a comment
    pub async fn reload(&self) -> GwctlResult<usize> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Blocklist {} unreadable: {}; keeping current set", self.path.display(), e);
                return Ok(self.names.read().await.len());
            }
        };

        let mut names = HashSet::new();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            names.insert(line.trim_end_matches('.').to_ascii_lowercase());
        }

        let count = names.len();
        *self.names.write().await = names;
        info!("Blocklist loaded: {} names", count);
        Ok(count)
    }

    /// Whether a queried name, or any parent domain of it, is listed
    pub async fn blocked(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        let names = self.names.read().await;
        let mut candidate = name.as_str();
        loop {
            if names.contains(candidate) {
                return true;
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return false,
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.names.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.names.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn list_from(content: &str) -> Blocklist {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        let blocklist = Blocklist::new(file.path());
        blocklist.reload().await.unwrap();
        // Keep the temp file alive past reload
        std::mem::forget(file);
        blocklist
    }

    #[tokio::test]
    async fn test_exact_and_subdomain_match() {
        let blocklist = list_from("phish.example\nmalware.test # seen 2026-05\n").await;
        assert_eq!(blocklist.len().await, 2);

        assert!(blocklist.blocked("phish.example").await);
        assert!(blocklist.blocked("phish.example.").await);
        assert!(blocklist.blocked("www.phish.example").await);
        assert!(blocklist.blocked("MALWARE.TEST").await);
        assert!(!blocklist.blocked("example").await);
        assert!(!blocklist.blocked("safe.example").await);
    }

    #[tokio::test]
    async fn test_missing_file_keeps_current_set() {
        let blocklist = list_from("phish.example\n").await;
        let moved = Blocklist { path: PathBuf::from("/nonexistent/blocklist"), names: blocklist.names.clone() };
        moved.reload().await.unwrap();
        assert!(moved.blocked("phish.example").await);
    }
}
