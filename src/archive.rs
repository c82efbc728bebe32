//! Best-effort shipping of persisted records to a remote FTP archive.
//!
//! The local record is authoritative. Whatever goes wrong here is logged and
//! dropped; nothing is retried and nothing reaches the scan's subscribers.
use std::io::Cursor;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use suppaftp::types::FileType;
use suppaftp::FtpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ArchiveError;

/// An open session on the remote store.
pub trait RemoteSession {
    /// Change the working directory; absolute paths start at the root.
    fn cwd(&mut self, path: &str) -> Result<(), ArchiveError>;
    /// Create a directory relative to the working directory.
    fn mkdir(&mut self, name: &str) -> Result<(), ArchiveError>;
    /// Store one file, as binary, in the working directory.
    fn put(&mut self, filename: &str, bytes: &[u8]) -> Result<u64, ArchiveError>;
    fn quit(&mut self) -> Result<(), ArchiveError>;
}

/// Something that can open sessions on a remote store.
pub trait RemoteStore: Send + Sync {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, ArchiveError>;
    fn endpoint(&self) -> String;
}

/// Anonymous FTP endpoint.
#[derive(Debug, Clone)]
pub struct FtpStore {
    endpoint: String,
    timeout: Duration,
}

impl FtpStore {
    /// `endpoint` is `host` or `host:port`; port 21 is assumed when absent.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let endpoint = endpoint.into();
        let endpoint = if endpoint.contains(':') {
            endpoint
        } else {
            format!("{endpoint}:21")
        };
        Self { endpoint, timeout }
    }

    fn resolve(&self) -> Result<SocketAddr, ArchiveError> {
        self.endpoint
            .to_socket_addrs()
            .map_err(|e| self.connect_err(e))?
            .next()
            .ok_or_else(|| self.connect_err("no address resolved"))
    }

    fn connect_err(&self, reason: impl ToString) -> ArchiveError {
        ArchiveError::Connect {
            endpoint: self.endpoint.clone(),
            reason: reason.to_string(),
        }
    }
}

impl RemoteStore for FtpStore {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, ArchiveError> {
        let addr = self.resolve()?;
        let mut ftp =
            FtpStream::connect_timeout(addr, self.timeout).map_err(|e| self.connect_err(e))?;
        ftp.get_ref()
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| self.connect_err(e))?;
        ftp.get_ref()
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| self.connect_err(e))?;
        ftp.login("anonymous", "anonymous")
            .map_err(|e| self.connect_err(format!("anonymous login refused: {e}")))?;
        ftp.transfer_type(FileType::Binary)
            .map_err(|e| self.connect_err(e))?;
        debug!(endpoint = %self.endpoint, "ftp session open");
        Ok(Box::new(FtpSession { ftp }))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

struct FtpSession {
    ftp: FtpStream,
}

impl RemoteSession for FtpSession {
    fn cwd(&mut self, path: &str) -> Result<(), ArchiveError> {
        self.ftp.cwd(path).map_err(|e| ArchiveError::Directory {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    fn mkdir(&mut self, name: &str) -> Result<(), ArchiveError> {
        self.ftp.mkdir(name).map_err(|e| ArchiveError::Directory {
            path: name.to_string(),
            reason: e.to_string(),
        })
    }

    fn put(&mut self, filename: &str, bytes: &[u8]) -> Result<u64, ArchiveError> {
        let mut reader = Cursor::new(bytes);
        self.ftp
            .put_file(filename, &mut reader)
            .map_err(|e| ArchiveError::Upload {
                filename: filename.to_string(),
                reason: e.to_string(),
            })
    }

    fn quit(&mut self) -> Result<(), ArchiveError> {
        self.ftp.quit().map_err(|e| ArchiveError::Directory {
            path: String::from("<quit>"),
            reason: e.to_string(),
        })
    }
}

/// A directory segment the ensure-path walk could neither enter nor create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSegment {
    pub segment: String,
    pub reason: String,
}

/// What one successful dispatch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub filename: String,
    pub bytes: u64,
    /// Non-empty when the upload landed somewhere other than the configured directory.
    pub skipped: Vec<SkippedSegment>,
}

/// Make `dir` the working directory, creating missing segments on the way.
///
/// `dir` is always taken from the remote root, with or without a leading
/// `/`, never from the login directory. When it cannot be entered directly
/// the walk starts at the root and handles each segment in turn: enter it,
/// or create it and enter it. A segment that fails both ways is recorded and
/// skipped, and the walk carries on from wherever it currently is.
pub fn ensure_remote_dir(session: &mut dyn RemoteSession, dir: &str) -> Vec<SkippedSegment> {
    let dir = dir.trim().trim_matches('/');
    let rooted = format!("/{dir}");
    if session.cwd(&rooted).is_ok() {
        return Vec::new();
    }

    let mut skipped = Vec::new();
    if let Err(e) = session.cwd("/") {
        warn!("cannot enter remote root: {e}");
    }
    for segment in dir.split('/').filter(|s| !s.is_empty()) {
        if session.cwd(segment).is_ok() {
            continue;
        }
        let created = session
            .mkdir(segment)
            .and_then(|_| session.cwd(segment));
        if let Err(e) = created {
            warn!(segment, "skipping remote directory segment: {e}");
            skipped.push(SkippedSegment {
                segment: segment.to_string(),
                reason: e.to_string(),
            });
        }
    }
    skipped
}

/// Ships persisted records to the remote store.
pub struct ArchiveDispatcher {
    remote: Arc<dyn RemoteStore>,
    remote_dir: String,
}

impl ArchiveDispatcher {
    pub fn new(remote: Arc<dyn RemoteStore>, remote_dir: impl Into<String>) -> Self {
        Self {
            remote,
            remote_dir: remote_dir.into(),
        }
    }

    /// Upload one local record. Blocking; see [`ArchiveDispatcher::spawn`].
    pub fn dispatch(&self, local: &Path) -> Result<ArchiveReport, ArchiveError> {
        let filename = local
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| ArchiveError::Io {
                path: local.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
            })?;
        let bytes = std::fs::read(local).map_err(|e| ArchiveError::Io {
            path: local.to_path_buf(),
            source: e,
        })?;

        let mut session = self.remote.connect()?;
        let skipped = ensure_remote_dir(session.as_mut(), &self.remote_dir);
        let uploaded = session.put(&filename, &bytes);
        if let Err(e) = session.quit() {
            debug!("archive session did not close cleanly: {e}");
        }
        let bytes = uploaded?;

        Ok(ArchiveReport {
            filename,
            bytes,
            skipped,
        })
    }

    /// Run [`dispatch`](Self::dispatch) on the blocking pool without waiting
    /// for it. The handle yields whether the upload went through; failures
    /// are logged here and go no further.
    pub fn spawn(self: &Arc<Self>, local: PathBuf) -> JoinHandle<bool> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || match this.dispatch(&local) {
            Ok(report) => {
                info!(
                    file = %report.filename,
                    bytes = report.bytes,
                    endpoint = %this.remote.endpoint(),
                    skipped = report.skipped.len(),
                    "record archived"
                );
                true
            }
            Err(e) => {
                warn!(file = %local.display(), "archive dispatch failed: {e}");
                false
            }
        })
    }
}
