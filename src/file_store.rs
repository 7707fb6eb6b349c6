//! Append-only, checksummed log file implementing [`LogStore`].
//!
//! # Format
//!
//! ```text
//! "RCLG" | version: u16 LE | record*
//! record = len: u32 LE | crc32(body): u32 LE | body: bincode(Entry)
//! ```
//!
//! The newest record for an identity wins. Only the final record may be torn:
//! one whose length runs past the end of the file, or whose checksum fails
//! exactly at the end, is cut off at open. Damage followed by a valid record
//! means the file is corrupt, and it is left untouched.
//!
//! File I/O runs on tokio's blocking pool, never on a runtime worker.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use crate::store::{Entry, Identity, LogStore, StoreError};

const LOG_FILE: &str = "recall.log";
const COMPACT_FILE: &str = "recall.log.compact";
const MAGIC: &[u8; 4] = b"RCLG";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: u64 = 6;
const FRAME_HEADER_LEN: u64 = 8;

/// When appended records are forced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// `fsync` after every put. A put that returned is durable.
    #[default]
    Always,
    /// `fsync` only on close (or drop). Faster; a crash may lose recent puts,
    /// but never tears one.
    OnClose,
}

/// Size information about a log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStats {
    /// Distinct identities with an entry.
    pub live: usize,
    /// Records in the file, including superseded ones.
    pub records: u64,
    /// File length in bytes.
    pub bytes: u64,
}

impl LogStats {
    /// Records replaced by a newer record for the same identity.
    pub fn superseded(&self) -> u64 {
        self.records.saturating_sub(self.live as u64)
    }
}

#[derive(Debug, Clone, Copy)]
struct RecordPos {
    offset: u64,
    len: u32,
}

/// How the next append fails. Lets unit tests reach the rollback paths.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteFault {
    /// Half the record reaches the file, then the write errors.
    ShortWrite,
    /// As `ShortWrite`, and cutting the partial record off fails too.
    ShortWriteStuck,
}

#[derive(Debug)]
struct LogFile {
    /// `None` once closed or poisoned.
    file: Option<File>,
    /// Set when a partial record could not be removed.
    poisoned: bool,
    end: u64,
    index: HashMap<Identity, RecordPos>,
    records: u64,
    #[cfg(test)]
    fault: Option<WriteFault>,
}

impl LogFile {
    fn ensure_open(&self) -> Result<(), StoreError> {
        match (&self.file, self.poisoned) {
            (Some(_), _) => Ok(()),
            (None, true) => Err(StoreError::Poisoned),
            (None, false) => Err(StoreError::Closed),
        }
    }

    fn file_mut(&mut self) -> Result<&mut File, StoreError> {
        let poisoned = self.poisoned;
        self.file.as_mut().ok_or(if poisoned {
            StoreError::Poisoned
        } else {
            StoreError::Closed
        })
    }

    /// Append one framed record and return its offset.
    ///
    /// A failed write is cut back off the file. If that fails too, the file
    /// handle is dropped and every later operation returns
    /// [`StoreError::Poisoned`].
    fn append_frame(&mut self, frame: &[u8], sync: SyncMode) -> Result<u64, StoreError> {
        let end = self.end;
        #[cfg(test)]
        let fault = self.fault.take();
        let file = self.file_mut()?;

        #[cfg(test)]
        let written = match fault {
            Some(_) => file
                .write_all(&frame[..frame.len() / 2])
                .and_then(|()| Err(io::Error::other("injected write fault"))),
            None => write_frame(file, frame, sync),
        };
        #[cfg(not(test))]
        let written = write_frame(file, frame, sync);

        let Err(err) = written else {
            self.end += frame.len() as u64;
            self.records += 1;
            return Ok(end);
        };

        #[cfg(test)]
        let rolled_back = match fault {
            Some(WriteFault::ShortWriteStuck) => Err(io::Error::other("injected truncate fault")),
            _ => file.set_len(end),
        };
        #[cfg(not(test))]
        let rolled_back = file.set_len(end);

        if let Err(_rollback) = rolled_back {
            #[cfg(feature = "tracing")]
            tracing::error!(
                offset = end,
                error = %err,
                rollback = %_rollback,
                "partial record could not be removed, log is unusable until reopened"
            );
            self.file = None;
            self.poisoned = true;
        }
        Err(err.into())
    }
}

fn write_frame(file: &mut File, frame: &[u8], sync: SyncMode) -> io::Result<()> {
    file.write_all(frame)?;
    match sync {
        SyncMode::Always => file.sync_data(),
        SyncMode::OnClose => Ok(()),
    }
}

struct Scan {
    index: HashMap<Identity, RecordPos>,
    records: u64,
    end: u64,
}

/// State shared between the store and the blocking tasks doing its I/O.
#[derive(Debug)]
struct SharedLog {
    dir: PathBuf,
    path: PathBuf,
    sync: SyncMode,
    inner: Mutex<LogFile>,
}

/// Log store kept in a single append-only file, `recall.log`, inside a
/// directory.
#[derive(Debug)]
pub struct FileLogStore {
    log: Arc<SharedLog>,
}

impl FileLogStore {
    /// Open or create the log in `dir` with [`SyncMode::Always`].
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(dir, SyncMode::default())
    }

    /// Open or create the log in `dir`.
    ///
    /// Fails with [`StoreError::Corrupt`] if an existing log is unreadable.
    pub fn open_with(dir: impl AsRef<Path>, sync: SyncMode) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE);

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let scan = if is_fresh(&bytes) {
            file.set_len(0)?;
            file.write_all(&header())?;
            file.sync_all()?;
            sync_dir(&dir)?;
            Scan {
                index: HashMap::new(),
                records: 0,
                end: HEADER_LEN,
            }
        } else {
            let scan = scan(&path, &bytes)?;
            if scan.end < bytes.len() as u64 {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    path = %path.display(),
                    valid = scan.end,
                    discarded = bytes.len() as u64 - scan.end,
                    "discarding torn record at end of log"
                );
                file.set_len(scan.end)?;
                file.sync_all()?;
            }
            scan
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            path = %path.display(),
            live = scan.index.len(),
            records = scan.records,
            "log.open"
        );

        Ok(Self {
            log: Arc::new(SharedLog {
                dir,
                path,
                sync,
                inner: Mutex::new(LogFile {
                    file: Some(file),
                    poisoned: false,
                    end: scan.end,
                    index: scan.index,
                    records: scan.records,
                    #[cfg(test)]
                    fault: None,
                }),
            }),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.log.path
    }

    /// Number of identities with an entry.
    pub fn len(&self) -> usize {
        self.log.inner.lock().index.len()
    }

    /// Whether the log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.log.inner.lock().index.is_empty()
    }

    /// Current size information.
    pub fn stats(&self) -> LogStats {
        let inner = self.log.inner.lock();
        LogStats {
            live: inner.index.len(),
            records: inner.records,
            bytes: inner.end,
        }
    }

    /// Rewrite the log keeping only the newest record per identity.
    ///
    /// The new file is written beside the old one and renamed over it, so a
    /// crash leaves either the old or the new log in place. This blocks; it
    /// is meant for open time or a maintenance thread.
    pub fn compact(&self) -> Result<(), StoreError> {
        self.log.compact()
    }

    #[cfg(test)]
    fn fail_next_append(&self, fault: WriteFault) {
        self.log.inner.lock().fault = Some(fault);
    }
}

impl SharedLog {
    fn compact(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut live: Vec<(Identity, RecordPos)> = inner
            .index
            .iter()
            .map(|(identity, pos)| (identity.clone(), *pos))
            .collect();
        live.sort_by_key(|(_, pos)| pos.offset);
        let file = inner.file_mut()?;

        let tmp_path = self.dir.join(COMPACT_FILE);
        let mut out = File::create(&tmp_path)?;
        out.write_all(&header())?;

        let mut index = HashMap::with_capacity(live.len());
        let mut offset = HEADER_LEN;
        for (identity, pos) in live {
            let mut frame = vec![0u8; (FRAME_HEADER_LEN + pos.len as u64) as usize];
            file.seek(SeekFrom::Start(pos.offset))?;
            file.read_exact(&mut frame)?;
            out.write_all(&frame)?;

            index.insert(
                identity,
                RecordPos {
                    offset,
                    len: pos.len,
                },
            );
            offset += frame.len() as u64;
        }
        out.sync_all()?;
        drop(out);

        fs::rename(&tmp_path, &self.path)?;
        sync_dir(&self.dir)?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            path = %self.path.display(),
            before = inner.end,
            after = offset,
            dropped = inner.records - index.len() as u64,
            "log.compact"
        );

        inner.file = Some(OpenOptions::new().read(true).append(true).open(&self.path)?);
        inner.records = index.len() as u64;
        inner.index = index;
        inner.end = offset;
        Ok(())
    }

    fn read_entry(&self, identity: &str) -> Result<Option<Entry>, StoreError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        let Some(pos) = inner.index.get(identity).copied() else {
            return Ok(None);
        };
        let file = inner.file_mut()?;

        let mut frame = vec![0u8; (FRAME_HEADER_LEN + pos.len as u64) as usize];
        file.seek(SeekFrom::Start(pos.offset))?;
        file.read_exact(&mut frame)?;

        let corrupt = |reason: String| StoreError::Corrupt {
            path: self.path.clone(),
            reason,
        };
        let crc = LittleEndian::read_u32(&frame[4..8]);
        let body = &frame[FRAME_HEADER_LEN as usize..];
        if crc32fast::hash(body) != crc {
            return Err(corrupt(format!(
                "checksum mismatch in record at offset {}",
                pos.offset
            )));
        }
        let entry = bincode::deserialize(body).map_err(|err| {
            corrupt(format!(
                "undecodable record at offset {}: {}",
                pos.offset, err
            ))
        })?;
        Ok(Some(entry))
    }

    fn append(&self, entry: &Entry) -> Result<(), StoreError> {
        let encode_error = |message: String| StoreError::Encode {
            identity: entry.identity.clone(),
            message,
        };
        let body = bincode::serialize(entry).map_err(|err| encode_error(err.to_string()))?;
        let len = u32::try_from(body.len()).map_err(|_| {
            encode_error(format!("{} byte record exceeds the format limit", body.len()))
        })?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + body.len());
        frame.write_u32::<LittleEndian>(len)?;
        frame.write_u32::<LittleEndian>(crc32fast::hash(&body))?;
        frame.extend_from_slice(&body);

        let mut inner = self.inner.lock();
        let offset = inner.append_frame(&frame, self.sync)?;
        inner
            .index
            .insert(entry.identity.clone(), RecordPos { offset, len });
        Ok(())
    }

    fn shutdown(&self) -> Result<(), StoreError> {
        if let Some(file) = self.inner.lock().file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for SharedLog {
    fn drop(&mut self) {
        if let Some(file) = self.inner.get_mut().file.take() {
            let _ = file.sync_all();
        }
    }
}

/// Run a file operation on the blocking pool.
async fn blocking<T, F>(op: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| StoreError::Io(Arc::new(io::Error::other(err))))?
}

#[async_trait::async_trait]
impl LogStore for FileLogStore {
    async fn get(&self, identity: &str) -> Result<Option<Entry>, StoreError> {
        let log = self.log.clone();
        let identity = identity.to_string();
        blocking(move || log.read_entry(&identity)).await
    }

    async fn put(&self, entry: Entry) -> Result<(), StoreError> {
        let log = self.log.clone();
        blocking(move || log.append(&entry)).await
    }

    async fn contains(&self, identity: &str) -> Result<bool, StoreError> {
        let inner = self.log.inner.lock();
        inner.ensure_open()?;
        Ok(inner.index.contains_key(identity))
    }

    async fn close(&self) -> Result<(), StoreError> {
        let log = self.log.clone();
        blocking(move || log.shutdown()).await
    }
}

fn header() -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[..4].copy_from_slice(MAGIC);
    header[4..].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header
}

/// An empty file, or one that died while its header was being written.
fn is_fresh(bytes: &[u8]) -> bool {
    bytes.len() < HEADER_LEN as usize && header().starts_with(bytes)
}

fn scan(path: &Path, bytes: &[u8]) -> Result<Scan, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.len() < HEADER_LEN as usize || &bytes[..4] != MAGIC {
        return Err(corrupt("not a recall log (bad magic)".to_string()));
    }
    let mut cursor = Cursor::new(bytes);
    cursor.set_position(4);
    let version = cursor.read_u16::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported format version {}", version)));
    }

    let total = bytes.len() as u64;
    let mut index = HashMap::new();
    let mut records = 0;
    let mut offset = HEADER_LEN;

    while offset < total {
        if total - offset < FRAME_HEADER_LEN {
            break;
        }
        cursor.set_position(offset);
        let len = cursor.read_u32::<LittleEndian>()?;
        let crc = cursor.read_u32::<LittleEndian>()?;

        let body_start = offset + FRAME_HEADER_LEN;
        let body_end = body_start + len as u64;
        if body_end > total {
            // A torn append leaves nothing valid behind it. A damaged length
            // field in the middle of the log does.
            if let Some(next) = next_record(bytes, offset + 1) {
                return Err(corrupt(format!(
                    "record at offset {} runs past the end of the file, \
                     but a valid record follows at offset {}",
                    offset, next
                )));
            }
            break;
        }

        let body = &bytes[body_start as usize..body_end as usize];
        if crc32fast::hash(body) != crc {
            if body_end == total {
                break;
            }
            return Err(corrupt(format!(
                "checksum mismatch in record at offset {}",
                offset
            )));
        }

        let entry: Entry = bincode::deserialize(body).map_err(|err| {
            corrupt(format!("undecodable record at offset {}: {}", offset, err))
        })?;
        index.insert(entry.identity, RecordPos { offset, len });
        records += 1;
        offset = body_end;
    }

    Ok(Scan {
        index,
        records,
        end: offset,
    })
}

/// Offset of the first checksummed, decodable record at or after `from`.
fn next_record(bytes: &[u8], from: u64) -> Option<u64> {
    let total = bytes.len() as u64;
    let mut offset = from;
    while offset + FRAME_HEADER_LEN <= total {
        let at = offset as usize;
        let len = LittleEndian::read_u32(&bytes[at..at + 4]) as u64;
        let crc = LittleEndian::read_u32(&bytes[at + 4..at + 8]);
        let body_start = offset + FRAME_HEADER_LEN;
        if body_start + len <= total {
            let body = &bytes[body_start as usize..(body_start + len) as usize];
            if crc32fast::hash(body) == crc && bincode::deserialize::<Entry>(body).is_ok() {
                return Some(offset);
            }
        }
        offset += 1;
    }
    None
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
