//! Core data types for pairlink

use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Identifier the signaling server assigns to a connected endpoint
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new PeerId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of room two peers share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomType {
    /// Peers behind the same public IP
    Ip,
    /// Paired devices sharing a room secret
    Secret,
    /// Temporary public room joined by id
    PublicId,
}

/// Per-file header announced before the bytes of that file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub name: String,
    pub mime: String,
    pub size: u64,
}

/// A sender's announcement of the files it wants to transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// Headers of all files, in send order
    pub header: Vec<FileHeader>,
    /// Sum of all file sizes
    pub total_size: u64,
    /// Whether every file is an image
    pub images_only: bool,
    /// Optional preview of the first file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_data_url: Option<String>,
}

impl TransferRequest {
    /// Build the request announcing `files`
    pub fn for_files(files: &[OutgoingFile], thumbnail_data_url: Option<String>) -> Self {
        Self {
            header: files.iter().map(OutgoingFile::header).collect(),
            total_size: files.iter().map(|f| f.size).sum(),
            images_only: files.iter().all(OutgoingFile::is_image),
            thumbnail_data_url,
        }
    }
}

/// Protocol state of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Idle,
    Prepare,
    Wait,
    Receive,
    Transfer,
    TextSent,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Prepare => "prepare",
            SessionState::Wait => "wait",
            SessionState::Receive => "receive",
            SessionState::Transfer => "transfer",
            SessionState::TextSent => "text-sent",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status attached to progress reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStatus {
    Prepare,
    Wait,
    Transfer,
    Receive,
    TransferComplete,
}

/// Where the bytes of an outgoing file come from
#[derive(Debug, Clone)]
pub enum FileSource {
    Memory(Bytes),
    Path(PathBuf),
}

/// A file selected for sending
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub source: FileSource,
}

impl OutgoingFile {
    /// Wrap an in-memory buffer
    pub fn from_bytes(name: impl Into<String>, mime: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            mime: mime.into(),
            size: data.len() as u64,
            source: FileSource::Memory(data),
        }
    }

    /// Reference a file on disk; its size is taken from the file metadata
    pub fn from_path(path: &Path, mime: impl Into<String>) -> Result<Self> {
        let size = std::fs::metadata(path)?.len();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            name,
            mime: mime.into(),
            size,
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    pub fn header(&self) -> FileHeader {
        FileHeader {
            name: self.name.clone(),
            mime: self.mime.clone(),
            size: self.size,
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime.split('/').next() == Some("image")
    }
}

/// Where a reassembled file ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    /// Held entirely in memory
    Memory(Bytes),
    /// Streamed to disk by the assembly task
    Disk(PathBuf),
}

/// A fully received file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub content: FileContent,
}

impl ReceivedFile {
    /// Load the file's bytes regardless of where they are stored
    pub async fn bytes(&self) -> Result<Bytes> {
        match &self.content {
            FileContent::Memory(data) => Ok(data.clone()),
            FileContent::Disk(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
        }
    }
}
