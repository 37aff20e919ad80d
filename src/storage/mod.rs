//! On-disk layout for a torrent's content.
//!
//! The torrent's files form one virtual byte stream in announce order;
//! verified pieces are written at their global offset and split across
//! whichever files they touch. Files are created up front at their
//! declared length so pieces can land in any order.
use crate::torrent::TorrentFile;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsafe path component in torrent: {0:?}")]
    UnsafePath(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// One output file and its place in the virtual stream.
struct FileSlot {
    /// Global byte offset where this file begins.
    offset: u64,
    length: u64,
    handle: File,
}

/// Owns the open handles for a torrent's files. Writes go through the
/// scheduler task only, so no locking is needed here.
pub struct Storage {
    slots: Vec<FileSlot>,
    total_length: u64,
}

impl Storage {
    /// Creates the file layout under `root`.
    ///
    /// Single-file torrents become `root/<name>`; multi-file torrents
    /// become a directory `root/<name>/` with each file at its
    /// path components. Every component is checked so a hostile
    /// torrent cannot escape the download root.
    #[tracing::instrument(level = "debug", skip(torrent), fields(name = %torrent.info.name))]
    pub fn create(root: &Path, torrent: &TorrentFile) -> StorageResult<Storage> {
        check_component(&torrent.info.name)?;

        let mut slots = Vec::new();
        if let Some(length) = torrent.info.length {
            let path = root.join(&torrent.info.name);
            slots.push(open_slot(path, 0, length as u64)?);
        } else {
            let dir = root.join(&torrent.info.name);
            std::fs::create_dir_all(&dir)?;
            let mut offset = 0u64;
            for file in &torrent.info.files {
                let mut path = dir.clone();
                for component in &file.path {
                    check_component(component)?;
                    path.push(component);
                }
                if file.path.is_empty() {
                    return Err(StorageError::UnsafePath("empty file path".to_string()));
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                slots.push(open_slot(path, offset, file.length as u64)?);
                offset += file.length as u64;
            }
        }

        let total_length = slots.iter().map(|slot| slot.length).sum();
        tracing::debug!(files = slots.len(), total_length, "storage layout created");
        Ok(Storage {
            slots,
            total_length,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Writes a verified piece at its global byte offset, splitting it
    /// across file boundaries where necessary.
    pub fn write_piece(&mut self, global_offset: u64, data: &[u8]) -> StorageResult<()> {
        let end = global_offset + data.len() as u64;
        for slot in &mut self.slots {
            let slot_end = slot.offset + slot.length;
            if slot.offset >= end || slot_end <= global_offset {
                continue;
            }
            let write_start = global_offset.max(slot.offset);
            let write_end = end.min(slot_end);
            let chunk = &data[(write_start - global_offset) as usize..(write_end - global_offset) as usize];

            slot.handle
                .seek(SeekFrom::Start(write_start - slot.offset))?;
            slot.handle.write_all(chunk)?;
        }
        Ok(())
    }

    /// Flushes every file to disk. Called once on shutdown; pieces are
    /// not individually synced.
    pub fn sync(&mut self) -> StorageResult<()> {
        for slot in &mut self.slots {
            slot.handle.sync_all()?;
        }
        Ok(())
    }
}

fn open_slot(path: PathBuf, offset: u64, length: u64) -> StorageResult<FileSlot> {
    let handle = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    // pre-declare the final size so out-of-order pieces can land
    handle.set_len(length)?;
    tracing::trace!(path = %path.display(), length, "opened output file");
    Ok(FileSlot {
        offset,
        length,
        handle,
    })
}

/// Rejects components a torrent must never dictate: empty names,
/// current/parent directory references, and anything containing a
/// separator.
fn check_component(component: &str) -> StorageResult<()> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
    {
        return Err(StorageError::UnsafePath(component.to_string()));
    }
    Ok(())
}
