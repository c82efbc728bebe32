//! Durable scan records.
//!
//! One directory holds every record. Each deployment writes a single encoding
//! but reads either, dispatching on the file extension. Records are named
//! `scan_<timestamp>.<ext>`; at day precision a second scan on the same date
//! replaces the first record. Two runs that start within the same second (or
//! day) collide the same way and the later write wins.
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

use time::macros::format_description;
use time::PrimitiveDateTime;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::markup;
use crate::types::{format_timestamp, RecordSummary, ScanResult};

pub const RECORD_PREFIX: &str = "scan_";

/// On-disk encoding of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Pretty-printed JSON document.
    Json,
    /// Tagged markup, see [`crate::markup`].
    Xml,
}

impl Encoding {
    pub fn extension(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Xml => "xml",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Encoding::Json => "application/json",
            Encoding::Xml => "application/xml",
        }
    }

    /// Encoding implied by a record's file name, if any.
    pub fn from_filename(name: &str) -> Option<Self> {
        match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some("json") => Some(Encoding::Json),
            Some("xml") => Some(Encoding::Xml),
            _ => None,
        }
    }

    pub fn encode(&self, result: &ScanResult) -> Result<Vec<u8>, StoreError> {
        match self {
            Encoding::Json => {
                let mut bytes = serde_json::to_vec_pretty(result)?;
                bytes.push(b'\n');
                Ok(bytes)
            }
            Encoding::Xml => markup::encode(result),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Encoding::Json => {
                let result: ScanResult = serde_json::from_slice(bytes)?;
                result
                    .validated()
                    .map_err(|e| StoreError::Invalid(e.to_string()))
            }
            Encoding::Xml => markup::decode(bytes),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | "document" => Ok(Encoding::Json),
            "xml" | "markup" => Ok(Encoding::Xml),
            other => Err(format!("unknown encoding {other:?} (expected json or xml)")),
        }
    }
}

/// Granularity of the timestamp in record names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// `scan_YYYYMMDD_HHMMSS`; one record per second.
    Seconds,
    /// `scan_YYYYMMDD`; one record per day, later scans overwrite.
    Day,
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "seconds" | "second" => Ok(Precision::Seconds),
            "day" | "daily" => Ok(Precision::Day),
            other => Err(format!("unknown precision {other:?} (expected seconds or day)")),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Seconds => f.write_str("seconds"),
            Precision::Day => f.write_str("day"),
        }
    }
}

/// Record name for a scan started at `ts`.
pub fn record_name(ts: PrimitiveDateTime, precision: Precision, encoding: Encoding) -> String {
    let stamp = match precision {
        Precision::Seconds => ts.format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        )),
        Precision::Day => ts.format(format_description!("[year][month][day]")),
    }
    .unwrap_or_else(|_| String::from("00000000"));
    format!("{RECORD_PREFIX}{stamp}.{}", encoding.extension())
}

/// A record's bytes as stored, with the content type of its encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

/// Directory of persisted scan records.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
    encoding: Encoding,
    precision: Precision,
}

impl RecordStore {
    /// Open the store, creating the directory if needed.
    pub async fn open(
        dir: impl Into<PathBuf>,
        encoding: Encoding,
        precision: Precision,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        debug!(dir = %dir.display(), %encoding, %precision, "record store ready");
        Ok(Self {
            dir,
            encoding,
            precision,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn path_of(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// Write `result` in the deployment encoding and return it with its
    /// filename assigned. An existing record of the same name is replaced.
    ///
    /// Each write goes to its own hidden temporary file and is renamed into
    /// place, so readers see either the old record or a complete new one,
    /// even when several writers race for the same name.
    pub async fn persist(&self, result: ScanResult) -> Result<ScanResult, StoreError> {
        self.write(result, Replace::Allow).await
    }

    /// Like [`persist`](Self::persist) but fails with
    /// [`StoreError::AlreadyExists`] instead of replacing a record.
    pub async fn persist_new(&self, result: ScanResult) -> Result<ScanResult, StoreError> {
        self.write(result, Replace::Refuse).await
    }

    async fn write(&self, result: ScanResult, replace: Replace) -> Result<ScanResult, StoreError> {
        let filename = record_name(result.timestamp(), self.precision, self.encoding);
        let stamped = result.with_filename(filename.clone());
        let bytes = self.encoding.encode(&stamped)?;

        let dir = self.dir.clone();
        let final_path = self.path_of(&filename);
        tokio::task::spawn_blocking(move || write_atomic(&dir, &final_path, &bytes, replace))
            .await
            .map_err(|e| StoreError::io(self.path_of(&filename), std::io::Error::other(e)))??;

        info!(file = %filename, hosts = stamped.hosts().len(), "scan record written");
        Ok(stamped)
    }

    /// Read a record back, whichever encoding it was written in.
    pub async fn load(&self, filename: &str) -> Result<ScanResult, StoreError> {
        let raw = self.read_raw(filename).await?;
        let encoding = Encoding::from_filename(filename)
            .ok_or_else(|| StoreError::NotFound(filename.to_string()))?;
        let result = encoding.decode(&raw.bytes).map_err(|e| StoreError::InvalidRecord {
            filename: filename.to_string(),
            reason: e.to_string(),
        })?;
        Ok(result.with_filename(filename.to_string()))
    }

    /// Stored bytes of one record plus its content type.
    pub async fn read_raw(&self, filename: &str) -> Result<RawRecord, StoreError> {
        if !is_record_name(filename) {
            return Err(StoreError::NotFound(filename.to_string()));
        }
        let Some(encoding) = Encoding::from_filename(filename) else {
            return Err(StoreError::NotFound(filename.to_string()));
        };
        let path = self.path_of(filename);
        match fs::read(&path).await {
            Ok(bytes) => Ok(RawRecord {
                filename: filename.to_string(),
                bytes,
                content_type: encoding.content_type(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(filename.to_string()))
            }
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Summaries of every readable record, oldest name first. Records that
    /// fail to decode are logged and skipped.
    pub async fn list(&self) -> Result<Vec<RecordSummary>, StoreError> {
        let mut out = Vec::new();
        for (filename, _) in self.record_files().await? {
            match self.load(&filename).await {
                Ok(r) => out.push(RecordSummary {
                    timestamp: format_timestamp(r.timestamp()),
                    host_count: r.hosts().len(),
                    has_screenshot: r.screenshot().is_some(),
                    filename,
                }),
                Err(e) => warn!(file = %filename, "skipping unreadable record: {e}"),
            }
        }
        out.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(out)
    }

    /// Name of the record created last, by file creation time.
    pub async fn latest_name(&self) -> Result<String, StoreError> {
        self.record_files()
            .await?
            .into_iter()
            .max_by(|(na, ta), (nb, tb)| ta.cmp(tb).then_with(|| na.cmp(nb)))
            .map(|(name, _)| name)
            .ok_or(StoreError::NoRecords)
    }

    pub async fn latest_raw(&self) -> Result<RawRecord, StoreError> {
        let name = self.latest_name().await?;
        self.read_raw(&name).await
    }

    pub async fn latest(&self) -> Result<ScanResult, StoreError> {
        let name = self.latest_name().await?;
        self.load(&name).await
    }

    /// Record files in the directory with their creation time (modification
    /// time where the filesystem does not track creation).
    async fn record_files(&self) -> Result<Vec<(String, SystemTime)>, StoreError> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !is_record_name(&name) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let created = meta
                .created()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((name, created));
        }
        Ok(out)
    }
}

/// A plain file name (no directories) ending in a known record extension.
fn is_record_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && !name.contains("..")
        && Encoding::from_filename(name).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replace {
    Allow,
    Refuse,
}

fn write_atomic(dir: &Path, dest: &Path, bytes: &[u8], replace: Replace) -> Result<(), StoreError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".scan_")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;

    // a failed persist hands the temp file back; dropping it removes it
    let placed = match replace {
        Replace::Allow => tmp.persist(dest),
        Replace::Refuse => tmp.persist_noclobber(dest),
    };
    match placed {
        Ok(_) => Ok(()),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
            let name = dest
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Err(StoreError::AlreadyExists(name))
        }
        Err(e) => Err(StoreError::io(dest, e.error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn names_follow_precision_and_encoding() {
        let ts = datetime!(2024-05-01 09:08:07);
        assert_eq!(
            record_name(ts, Precision::Seconds, Encoding::Json),
            "scan_20240501_090807.json"
        );
        assert_eq!(record_name(ts, Precision::Day, Encoding::Xml), "scan_20240501.xml");
    }

    #[test]
    fn record_names_are_plain_files() {
        assert!(is_record_name("scan_20240501.json"));
        assert!(is_record_name("imported.xml"));
        assert!(!is_record_name("../etc/passwd.json"));
        assert!(!is_record_name("sub/scan.json"));
        assert!(!is_record_name(".scan_20240501.json.tmp"));
        assert!(!is_record_name("notes.txt"));
    }

    #[test]
    fn encoding_parsing() {
        assert_eq!("JSON".parse::<Encoding>().unwrap(), Encoding::Json);
        assert_eq!("markup".parse::<Encoding>().unwrap(), Encoding::Xml);
        assert!("yaml".parse::<Encoding>().is_err());
        assert_eq!("daily".parse::<Precision>().unwrap(), Precision::Day);
    }

    #[test]
    fn both_decoders_enforce_host_invariants() {
        let doc = br#"{"timestamp":"2024-05-01 10:00:00","network":"10.0.0.0/30","hosts":[
            {"ip":"10.0.0.1","hostname":"a","ports":[]},
            {"ip":"10.0.0.1","hostname":"b","ports":[]}]}"#;
        assert!(matches!(Encoding::Json.decode(doc), Err(StoreError::Invalid(_))));

        let markup = b"<scan><metadata><date>2024-05-01 10:00:00</date><network>n</network></metadata>\
            <hosts><host><ip>10.0.0.1</ip><hostname/></host></hosts></scan>";
        assert!(matches!(Encoding::Xml.decode(markup), Err(StoreError::Invalid(_))));

        let empty_name = br#"{"timestamp":"2024-05-01 10:00:00","network":"n","hosts":[
            {"ip":"10.0.0.1","hostname":"","ports":[]}]}"#;
        assert!(matches!(Encoding::Json.decode(empty_name), Err(StoreError::Invalid(_))));
    }
}
