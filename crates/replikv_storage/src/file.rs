//! Journaled file storage backend.
//!
//! The backend keeps the full map in memory and records every applied batch
//! as one checksummed frame in an append-only journal. A batch is visible
//! after restart iff its frame was completely written, which gives the
//! atomic-commit guarantee of [`KvBackend::apply`]. A torn tail frame is
//! discarded on open.

use crate::backend::{BatchOp, KvBackend, WriteBatch};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a replikv journal.
const JOURNAL_MAGIC: [u8; 4] = *b"RKVJ";

/// Current journal format version.
const JOURNAL_VERSION: u16 = 1;

/// Header length: magic + version + reserved.
const HEADER_LEN: u64 = 8;

/// Frame op tags.
const OP_PUT: u8 = 1;
const OP_DEL: u8 = 2;

/// Compaction triggers when the journal holds this many ops beyond twice the
/// live key count.
const COMPACT_SLACK: u64 = 64;

/// A persistent storage backend backed by a single journal file.
///
/// Data survives process restart; [`FileBackend::destroy`] deletes the store.
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    // None once closed.
    inner: RwLock<Option<Inner>>,
}

#[derive(Debug)]
struct Inner {
    file: File,
    map: BTreeMap<String, Vec<u8>>,
    /// Ops recorded in the journal since the last compaction.
    journal_ops: u64,
}

impl FileBackend {
    /// Opens or creates a journal at `path`, creating parent directories if
    /// needed.
    ///
    /// Existing frames are replayed to rebuild the map. A torn tail frame is
    /// truncated away. If the journal has accumulated many dead entries it is
    /// compacted before returning.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the header bytes do not match
    /// this format.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let (map, journal_ops, valid_len) = replay(&mut file)?;

        // Drop any torn tail so appends continue from the last good frame.
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::End(0))?;

        let mut inner = Inner {
            file,
            map,
            journal_ops,
        };

        if inner.journal_ops > 2 * inner.map.len() as u64 + COMPACT_SLACK {
            inner.compact(path)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(Some(inner)),
        })
    }

    /// Deletes the durable store at `path`.
    ///
    /// Deleting a store that does not exist is not an error.
    pub fn destroy(path: &Path) -> StorageResult<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Returns the path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the journal to a single frame holding the live contents.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the backend is closed, or an I/O error.
    pub fn compact(&self) -> StorageResult<()> {
        let mut guard = self.inner.write();
        let inner = guard.as_mut().ok_or(StorageError::Closed)?;
        inner.compact(&self.path)
    }
}

impl Inner {
    fn compact(&mut self, path: &Path) -> StorageResult<()> {
        let tmp_path = path.with_extension("compact");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        write_header(&mut tmp)?;
        let ops: Vec<BatchOp> = self
            .map
            .iter()
            .map(|(k, v)| BatchOp::Put {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        if !ops.is_empty() {
            tmp.write_all(&encode_frame(&ops))?;
        }
        tmp.sync_all()?;

        std::fs::rename(&tmp_path, path)?;
        tmp.seek(SeekFrom::End(0))?;

        self.journal_ops = self.map.len() as u64;
        self.file = tmp;
        Ok(())
    }
}

impl KvBackend for FileBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(inner.map.get(key).cloned())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(inner
            .map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn apply(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut guard = self.inner.write();
        let inner = guard.as_mut().ok_or(StorageError::Closed)?;

        let ops = batch.into_ops();
        if ops.is_empty() {
            return Ok(());
        }

        // Journal first; the in-memory map is only updated once the frame is
        // durable.
        inner.file.write_all(&encode_frame(&ops))?;
        inner.file.sync_data()?;

        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    inner.map.insert(key, value);
                }
                BatchOp::Del { key } => {
                    inner.map.remove(&key);
                }
            }
            inner.journal_ops += 1;
        }
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        let mut guard = self.inner.write();
        if let Some(inner) = guard.take() {
            inner.file.sync_all()?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.read().is_none()
    }
}

fn write_header(file: &mut File) -> StorageResult<()> {
    let mut header = [0u8; HEADER_LEN as usize];
    header[0..4].copy_from_slice(&JOURNAL_MAGIC);
    header[4..6].copy_from_slice(&JOURNAL_VERSION.to_le_bytes());
    file.write_all(&header)?;
    Ok(())
}

/// Encodes one batch as a frame: `len u32 | crc32 u32 | payload`.
///
/// The payload is `count u32` followed by tagged ops, each
/// `tag u8 | key_len u32 | key | (val_len u32 | val)`.
fn encode_frame(ops: &[BatchOp]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(ops.len() as u32).to_le_bytes());
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                payload.push(OP_PUT);
                payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
                payload.extend_from_slice(key.as_bytes());
                payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
                payload.extend_from_slice(value);
            }
            BatchOp::Del { key } => {
                payload.push(OP_DEL);
                payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
                payload.extend_from_slice(key.as_bytes());
            }
        }
    }

    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame
}

fn decode_frame(payload: &[u8], offset: u64) -> StorageResult<Vec<BatchOp>> {
    let mut cursor = Cursor {
        buf: payload,
        pos: 0,
        offset,
    };
    let count = cursor.read_u32()?;
    let mut ops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = cursor.read_u8()?;
        let key = cursor.read_string()?;
        match tag {
            OP_PUT => {
                let len = cursor.read_u32()? as usize;
                let value = cursor.read_bytes(len)?.to_vec();
                ops.push(BatchOp::Put { key, value });
            }
            OP_DEL => ops.push(BatchOp::Del { key }),
            other => {
                return Err(StorageError::corruption(
                    offset,
                    format!("unknown op tag {other}"),
                ))
            }
        }
    }
    Ok(ops)
}

/// Replays the journal, returning the map, the op count, and the length of
/// the valid region.
///
/// An incomplete or checksum-failing tail frame ends the replay silently; a
/// bad frame *followed by* further data is reported as corruption.
fn replay(file: &mut File) -> StorageResult<(BTreeMap<String, Vec<u8>>, u64, u64)> {
    let file_len = file.metadata()?.len();
    file.seek(SeekFrom::Start(0))?;

    if file_len == 0 {
        write_header(file)?;
        return Ok((BTreeMap::new(), 0, HEADER_LEN));
    }
    if file_len < HEADER_LEN {
        return Err(StorageError::invalid_format("journal shorter than header"));
    }

    let mut data = Vec::with_capacity(file_len as usize);
    file.read_to_end(&mut data)?;

    if data[0..4] != JOURNAL_MAGIC {
        return Err(StorageError::invalid_format("bad magic bytes"));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != JOURNAL_VERSION {
        return Err(StorageError::invalid_format(format!(
            "unsupported journal version {version}"
        )));
    }

    let mut map = BTreeMap::new();
    let mut journal_ops = 0u64;
    let mut pos = HEADER_LEN as usize;

    while pos < data.len() {
        let frame_start = pos as u64;
        let at_tail = |end: usize| end > data.len();

        if at_tail(pos + 8) {
            break; // torn length/crc prefix
        }
        let len_bytes: [u8; 4] = data[pos..pos + 4]
            .try_into()
            .map_err(|_| StorageError::corruption(frame_start, "frame length truncated"))?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let crc_bytes: [u8; 4] = data[pos + 4..pos + 8]
            .try_into()
            .map_err(|_| StorageError::corruption(frame_start, "frame checksum truncated"))?;
        let expected_crc = u32::from_le_bytes(crc_bytes);
        if at_tail(pos + 8 + len) {
            break; // torn payload
        }
        let payload = &data[pos + 8..pos + 8 + len];
        if crc32(payload) != expected_crc {
            if pos + 8 + len == data.len() {
                break; // torn write of the final frame
            }
            return Err(StorageError::corruption(frame_start, "checksum mismatch"));
        }

        for op in decode_frame(payload, frame_start)? {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Del { key } => {
                    map.remove(&key);
                }
            }
            journal_ops += 1;
        }
        pos += 8 + len;
    }

    Ok((map, journal_ops, pos as u64))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    offset: u64,
}

impl Cursor<'_> {
    fn read_bytes(&mut self, len: usize) -> StorageResult<&[u8]> {
        if self.pos + len > self.buf.len() {
            return Err(StorageError::corruption(
                self.offset,
                "frame payload truncated",
            ));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn read_u8(&mut self) -> StorageResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> StorageResult<u32> {
        let offset = self.offset;
        let bytes: [u8; 4] = self
            .read_bytes(4)?
            .try_into()
            .map_err(|_| StorageError::corruption(offset, "truncated u32"))?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_string(&mut self) -> StorageResult<String> {
        let len = self.read_u32()? as usize;
        let offset = self.offset;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| StorageError::corruption(offset, "key is not valid UTF-8"))
    }
}

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = crc32_table();

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    crc ^ 0xFFFF_FFFF
}
