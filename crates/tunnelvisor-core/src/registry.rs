//! On-disk registry of supervised processes, one `{prefix}-{name}.pid` file per tunnel.
//!
//! Callers never build these paths themselves; every read and write of the
//! name to PID mapping goes through [`ProcessRegistry`].

use crate::error::{Result, SupervisorError};
use crate::name::TunnelName;
use crate::process::ProcessId;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::{debug, warn};

const RECORD_EXTENSION: &str = "pid";

/// The last known PID for a tunnel
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRecord {
    pub name: TunnelName,
    pub pid: ProcessId,
    /// Modification time of the record file
    pub created_at: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    dir: PathBuf,
    prefix: String,
}

impl ProcessRegistry {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn record_path(&self, name: &TunnelName) -> PathBuf {
        self.dir
            .join(format!("{}-{}.{}", self.prefix, name, RECORD_EXTENSION))
    }

    /// Persist `pid` for `name`, replacing any earlier record.
    ///
    /// The record is written to a sibling temp file and renamed into place,
    /// so unlocked readers see either the old record or the new one.
    pub async fn record_start(&self, name: &TunnelName, pid: ProcessId) -> Result<()> {
        let path = self.record_path(name);
        let staging = self.staging_path(name);

        if let Err(e) = tokio::fs::write(&staging, pid.to_string()).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(SupervisorError::storage(&staging, e));
        }
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(SupervisorError::storage(&path, e));
        }

        debug!("Recorded PID {} for tunnel '{}' at {}", pid, name, path.display());
        Ok(())
    }

    fn staging_path(&self, name: &TunnelName) -> PathBuf {
        self.dir.join(format!(
            ".{}-{}.{}.{}.tmp",
            self.prefix,
            name,
            RECORD_EXTENSION,
            std::process::id()
        ))
    }

    /// Read the record for `name`.
    ///
    /// Unparsable content is deleted and reported as absent.
    pub async fn read_record(&self, name: &TunnelName) -> Result<Option<ProcessRecord>> {
        let path = self.record_path(name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == ErrorKind::InvalidData => String::from("<non-utf8>"),
            Err(e) => return Err(SupervisorError::storage(&path, e)),
        };

        match parse_record(&content) {
            Some(pid) => {
                let created_at = tokio::fs::metadata(&path)
                    .await
                    .ok()
                    .and_then(|meta| meta.modified().ok());
                Ok(Some(ProcessRecord {
                    name: name.clone(),
                    pid,
                    created_at,
                }))
            }
            None => {
                let error = SupervisorError::RegistryCorrupt {
                    name: name.to_string(),
                    path: path.clone(),
                    content,
                };
                warn!("{error}; removing it");
                self.clear_record(name).await?;
                Ok(None)
            }
        }
    }

    /// Remove the record for `name`; absent records are fine
    pub async fn clear_record(&self, name: &TunnelName) -> Result<()> {
        let path = self.record_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Cleared registry record {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SupervisorError::storage(&path, e)),
        }
    }

    /// Names of every tunnel that currently has a record, sorted
    pub async fn names(&self) -> Result<Vec<TunnelName>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SupervisorError::storage(&self.dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SupervisorError::storage(&self.dir, e))?
        {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(name) = self.name_from_file(file_name) {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }

    fn name_from_file(&self, file_name: &str) -> Option<TunnelName> {
        let stem = file_name
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('-')?
            .strip_suffix(RECORD_EXTENSION)?
            .strip_suffix('.')?;
        TunnelName::new(stem).ok()
    }
}

fn parse_record(content: &str) -> Option<ProcessId> {
    match content.trim().parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(pid) => Some(ProcessId(pid)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> TunnelName {
        TunnelName::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_record_roundtrip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path(), "cloudflared");
        let demo = name("demo");

        assert!(registry.read_record(&demo).await.unwrap().is_none());

        registry.record_start(&demo, ProcessId(100)).await.unwrap();
        registry.record_start(&demo, ProcessId(200)).await.unwrap();

        let record = registry.read_record(&demo).await.unwrap().unwrap();
        assert_eq!(record.pid, ProcessId(200));
        assert_eq!(record.name, demo);
        assert!(record.created_at.is_some());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("cloudflared-demo.pid")).unwrap(),
            "200"
        );
    }

    #[tokio::test]
    async fn test_malformed_record_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path(), "cloudflared");
        let demo = name("demo");
        let path = registry.record_path(&demo);

        std::fs::write(&path, "not-a-pid").unwrap();
        assert!(registry.read_record(&demo).await.unwrap().is_none());
        assert!(!path.exists());

        std::fs::write(&path, "0\n").unwrap();
        assert!(registry.read_record(&demo).await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_record_tolerates_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path(), "cloudflared");
        let demo = name("demo");

        std::fs::write(registry.record_path(&demo), " 4242\n").unwrap();
        let record = registry.read_record(&demo).await.unwrap().unwrap();
        assert_eq!(record.pid, ProcessId(4242));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rewrites_are_never_seen_half_written() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path(), "cloudflared");
        let demo = name("demo");
        registry.record_start(&demo, ProcessId(123456)).await.unwrap();

        let writer = {
            let registry = registry.clone();
            let demo = demo.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    registry.record_start(&demo, ProcessId(123456)).await.unwrap();
                }
            })
        };

        loop {
            let record = registry.read_record(&demo).await.unwrap();
            assert_eq!(record.map(|r| r.pid), Some(ProcessId(123456)));
            if writer.is_finished() {
                break;
            }
        }
        writer.await.unwrap();

        assert!(registry.record_path(&demo).exists());
        // no staging files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path(), "cloudflared");
        let demo = name("demo");

        registry.record_start(&demo, ProcessId(1)).await.unwrap();
        registry.clear_record(&demo).await.unwrap();
        registry.clear_record(&demo).await.unwrap();
        assert!(!registry.record_path(&demo).exists());
    }

    #[tokio::test]
    async fn test_names_lists_only_own_records() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path(), "cloudflared");

        registry.record_start(&name("web"), ProcessId(1)).await.unwrap();
        registry.record_start(&name("api"), ProcessId(2)).await.unwrap();
        std::fs::write(dir.path().join("cloudflared-web.log"), "").unwrap();
        std::fs::write(dir.path().join("other-db.pid"), "3").unwrap();

        let names = registry.names().await.unwrap();
        assert_eq!(names, vec![name("api"), name("web")]);
    }

    #[tokio::test]
    async fn test_missing_directory_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path().join("missing"), "cloudflared");

        let error = registry
            .record_start(&name("demo"), ProcessId(1))
            .await
            .unwrap_err();
        assert!(error.is_fatal());
        assert!(registry.names().await.unwrap().is_empty());
    }
}
