use crate::error::{Result, SupervisorError};
use crate::name::TunnelName;
use std::fs::File;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const TAIL_BLOCK_SIZE: u64 = 8 * 1024;

/// Log file bound to one spawn of a tunnel
#[derive(Debug)]
pub struct LogHandle {
    pub name: TunnelName,
    pub path: PathBuf,
    file: File,
}

impl LogHandle {
    /// Hand the open file to the child process
    pub fn into_file(self) -> File {
        self.file
    }
}

/// Where tunnel output goes: `{dir}/{prefix}-{name}.log`
#[derive(Debug, Clone)]
pub struct LogSink {
    dir: PathBuf,
    prefix: String,
}

impl LogSink {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn log_path(&self, name: &TunnelName) -> PathBuf {
        self.dir.join(format!("{}-{}.log", self.prefix, name))
    }

    /// Create the log file for a new spawn, truncating the previous run's output
    pub async fn bind(&self, name: &TunnelName) -> Result<LogHandle> {
        let path = self.log_path(name);
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| SupervisorError::storage(&path, e))?
            .into_std()
            .await;
        Ok(LogHandle {
            name: name.clone(),
            path,
            file,
        })
    }

    /// Last `count` lines of the tunnel's log, oldest first
    pub async fn tail(&self, name: &TunnelName, count: usize) -> Result<Vec<String>> {
        let path = self.log_path(name);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SupervisorError::LogNotFound {
                    name: name.to_string(),
                    path,
                });
            }
            Err(e) => return Err(SupervisorError::storage(&path, e)),
        };
        if count == 0 {
            return Ok(Vec::new());
        }

        let bytes = read_tail_bytes(&mut file, count, &path).await?;
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.lines().collect();
        let skip = lines.len().saturating_sub(count);
        Ok(lines[skip..].iter().map(|line| line.to_string()).collect())
    }

    /// Delete the tunnel's log; returns whether there was one
    pub async fn remove(&self, name: &TunnelName) -> Result<bool> {
        let path = self.log_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SupervisorError::storage(&path, e)),
        }
    }
}

/// Read backwards in blocks until the buffer holds more than `count` line breaks
async fn read_tail_bytes(file: &mut tokio::fs::File, count: usize, path: &Path) -> Result<Vec<u8>> {
    let len = file
        .metadata()
        .await
        .map_err(|e| SupervisorError::storage(path, e))?
        .len();

    let mut buffer: Vec<u8> = Vec::new();
    let mut offset = len;
    while offset > 0 {
        let block = TAIL_BLOCK_SIZE.min(offset);
        offset -= block;

        let mut chunk = vec![0u8; block as usize];
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| SupervisorError::storage(path, e))?;
        file.read_exact(&mut chunk)
            .await
            .map_err(|e| SupervisorError::storage(path, e))?;
        chunk.extend_from_slice(&buffer);
        buffer = chunk;

        // one extra break covers a trailing newline
        let breaks = buffer.iter().filter(|&&b| b == b'\n').count();
        if breaks > count {
            break;
        }
    }
    Ok(buffer)
}
