//! Reassembly of received files
//!
//! With a download directory the chunks are streamed to disk by a separate
//! task fed over a bounded channel, so only a few chunks are in flight to
//! the writer at once. If that task fails the file is assembled in memory
//! instead. The received chunks are kept until one of the two succeeds.

use crate::error::{Error, Result};
use crate::types::{FileContent, FileHeader, ReceivedFile};
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Files above this size may not fit in memory
pub const MEMORY_WARN_BYTES: u64 = 250_000_000;

/// Chunks queued to the writer task at most
const WRITER_QUEUE: usize = 8;

/// Attempts at finding a free file name
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Assemble `parts` into a file, preferring the streaming path when a
/// download directory is given
pub async fn assemble(
    header: FileHeader,
    parts: Vec<Bytes>,
    download_dir: Option<&Path>,
) -> Result<ReceivedFile> {
    if let Some(dir) = download_dir {
        match stream_to_disk(&header, &parts, dir).await {
            Ok((path, size)) => {
                tracing::debug!("Assembled {} at {}", header.name, path.display());
                return Ok(ReceivedFile {
                    name: header.name,
                    mime: header.mime,
                    size,
                    content: FileContent::Disk(path),
                });
            }
            Err(e) => {
                tracing::warn!(
                    "Streaming assembly of {} failed, assembling in memory: {}",
                    header.name,
                    e
                );
            }
        }
    }

    assemble_in_memory(header, parts)
}

/// Concatenate `parts` in memory
pub fn assemble_in_memory(header: FileHeader, parts: Vec<Bytes>) -> Result<ReceivedFile> {
    if header.size > MEMORY_WARN_BYTES {
        tracing::warn!(
            "Assembling {} ({} bytes) in memory, this may exceed available memory",
            header.name,
            header.size
        );
    }

    let total: usize = parts.iter().map(Bytes::len).sum();
    let mut buffer = BytesMut::with_capacity(total);
    for part in &parts {
        buffer.extend_from_slice(part);
    }

    Ok(ReceivedFile {
        name: header.name,
        mime: header.mime,
        size: total as u64,
        content: FileContent::Memory(buffer.freeze()),
    })
}

async fn stream_to_disk(header: &FileHeader, parts: &[Bytes], dir: &Path) -> Result<(PathBuf, u64)> {
    let (tx, rx) = mpsc::channel::<Bytes>(WRITER_QUEUE);
    let writer = tokio::spawn(write_parts(dir.to_path_buf(), header.name.clone(), rx));

    for part in parts {
        // A closed channel means the writer bailed; its result says why
        if tx.send(part.clone()).await.is_err() {
            break;
        }
    }
    drop(tx);

    writer
        .await
        .map_err(|e| Error::Assembly(format!("writer task failed: {}", e)))?
}

async fn write_parts(dir: PathBuf, name: String, mut rx: mpsc::Receiver<Bytes>) -> Result<(PathBuf, u64)> {
    tokio::fs::create_dir_all(&dir).await?;
    let (path, mut file) = create_unique(&dir, &name).await?;

    let mut written = 0u64;
    let result: Result<()> = async {
        while let Some(part) = rx.recv().await {
            file.write_all(&part).await?;
            written += part.len() as u64;
        }
        file.flush().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&path).await;
        return Err(e);
    }
    Ok((path, written))
}

async fn create_unique(dir: &Path, name: &str) -> Result<(PathBuf, tokio::fs::File)> {
    let name = safe_file_name(name);
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let path = dir.join(numbered_name(&name, attempt));
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Assembly(format!("no free file name for {}", name)))
}

/// Strip directories from a peer-supplied name
fn safe_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("download")
        .to_string()
}

/// "photo.jpg", "photo (1).jpg", "photo (2).jpg", ...
fn numbered_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({}){}", &name[..dot], n, &name[dot..]),
        _ => format!("{} ({})", name, n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn header(name: &str, size: u64) -> FileHeader {
        FileHeader {
            name: name.to_string(),
            mime: "text/plain".to_string(),
            size,
        }
    }

    fn parts() -> Vec<Bytes> {
        vec![Bytes::from_static(b"hello "), Bytes::from_static(b"world")]
    }

    #[tokio::test]
    async fn test_in_memory_assembly() {
        let file = assemble(header("a.txt", 11), parts(), None).await.unwrap();
        assert_eq!(file.size, 11);
        assert_eq!(file.content, FileContent::Memory(Bytes::from_static(b"hello world")));
    }

    #[tokio::test]
    async fn test_streams_to_disk_with_unique_names() {
        let dir = TempDir::new().unwrap();

        let first = assemble(header("a.txt", 11), parts(), Some(dir.path())).await.unwrap();
        let second = assemble(header("a.txt", 11), parts(), Some(dir.path())).await.unwrap();

        assert_eq!(first.content, FileContent::Disk(dir.path().join("a.txt")));
        assert_eq!(second.content, FileContent::Disk(dir.path().join("a (1).txt")));
        assert_eq!(&second.bytes().await.unwrap()[..], b"hello world");
    }

    #[tokio::test]
    async fn test_falls_back_to_memory_when_disk_fails() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let file = assemble(header("a.txt", 11), parts(), Some(&blocker)).await.unwrap();
        assert_eq!(file.content, FileContent::Memory(Bytes::from_static(b"hello world")));
    }

    #[tokio::test]
    async fn test_peer_supplied_directories_are_stripped() {
        let dir = TempDir::new().unwrap();
        let file = assemble(header("../../etc/passwd", 11), parts(), Some(dir.path()))
            .await
            .unwrap();
        assert_eq!(file.content, FileContent::Disk(dir.path().join("passwd")));
    }

    #[test]
    fn test_numbered_name() {
        assert_eq!(numbered_name("photo.jpg", 2), "photo (2).jpg");
        assert_eq!(numbered_name("README", 1), "README (1)");
        assert_eq!(numbered_name(".env", 1), ".env (1)");
    }
}
