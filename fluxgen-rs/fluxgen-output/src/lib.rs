use chrono::{DateTime, Local, TimeZone};
use log::debug;
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
pub const REQUEST_STEM: &str = "request";
pub const RESULT_STEM: &str = "result";
pub const JSON_EXTENSION: &str = "json";
pub const IMAGE_EXTENSION: &str = "jpg";

const JSON_INDENT: &[u8] = b"    ";

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to create output directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize JSON for {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Directory receiving the artifacts of a run.
#[derive(Debug, Clone)]
pub struct OutputDir {
    path: PathBuf,
    created: bool,
}

impl OutputDir {
    /// Creates `path` and its parents if needed. Existing directories are reused.
    pub fn prepare(path: impl Into<PathBuf>) -> Result<Self, OutputError> {
        let path = path.into();
        let created = !path.is_dir();

        fs::create_dir_all(&path).map_err(|source| OutputError::CreateDir {
            path: path.clone(),
            source,
        })?;

        if created {
            debug!("created output directory {}", path.display());
        }
        Ok(Self { path, created })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether [`OutputDir::prepare`] had to create the directory.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn artifacts(&self, timestamp: &RunTimestamp) -> ArtifactPaths {
        ArtifactPaths::new(&self.path, timestamp)
    }
}

/// Sortable local timestamp shared by every file of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTimestamp(String);

impl RunTimestamp {
    pub fn now() -> Self {
        Self::from_datetime(&Local::now())
    }

    pub fn from_datetime<Tz>(datetime: &DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        Self(datetime.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub request_json: PathBuf,
    pub result_json: PathBuf,
    pub result_image: PathBuf,
}

impl ArtifactPaths {
    pub fn new(dir: &Path, timestamp: &RunTimestamp) -> Self {
        Self {
            request_json: dir.join(file_name(timestamp, REQUEST_STEM, JSON_EXTENSION)),
            result_json: dir.join(file_name(timestamp, RESULT_STEM, JSON_EXTENSION)),
            result_image: dir.join(file_name(timestamp, RESULT_STEM, IMAGE_EXTENSION)),
        }
    }
}

pub fn file_name(timestamp: &RunTimestamp, stem: &str, extension: &str) -> String {
    format!("{timestamp}_{stem}.{extension}")
}

/// Pretty-prints `value` with a four-space indent, leaving non-ASCII text unescaped.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let mut buffer = Vec::new();
    let formatter = PrettyFormatter::with_indent(JSON_INDENT);
    let mut serializer = Serializer::with_formatter(&mut buffer, formatter);
    value.serialize(&mut serializer)?;
    // serde_json only emits valid UTF-8
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

pub fn save_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<(), OutputError> {
    let serialized = to_pretty_json(value).map_err(|source| OutputError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    write_file(path, serialized.as_bytes())
}

/// Writes `bytes` verbatim; the extension of `path` is not checked against the content.
pub fn save_bytes(bytes: &[u8], path: &Path) -> Result<(), OutputError> {
    write_file(path, bytes)
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), OutputError> {
    fs::write(path, contents).map_err(|source| OutputError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("wrote {} bytes to {}", contents.len(), path.display());
    Ok(())
}
