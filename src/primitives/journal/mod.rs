#![forbid(unsafe_code)]
//! Write-ahead commit journal.
//!
//! Each committed write transaction appends exactly one record holding the
//! recovery payload of every participating component. A record is only
//! trusted once both its header and body checksums verify; the first record
//! that fails (a torn tail left by a crash) ends replay.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::bytes::buf::Reader;
use crate::primitives::io::FileIo;
use crate::types::{Checksum, ComponentId, Crc32Fast, Result, StoreError, TxnId};

const JOURNAL_MAGIC: [u8; 4] = *b"QJNL";
const JOURNAL_FORMAT_VERSION: u16 = 1;
/// Length of the journal file header.
pub const FILE_HEADER_LEN: usize = 32;
const RECORD_HEADER_LEN: usize = 24;
const ENTRY_HEADER_LEN: usize = ComponentId::LEN + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileHeader {
    salt: u64,
    next_txn_id: u64,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&JOURNAL_MAGIC);
        buf[4..6].copy_from_slice(&JOURNAL_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.salt.to_be_bytes());
        buf[16..24].copy_from_slice(&self.next_txn_id.to_be_bytes());
        let crc = compute_crc32(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(StoreError::Corruption("journal header truncated"));
        }
        if src[0..4] != JOURNAL_MAGIC {
            return Err(StoreError::Corruption("journal magic mismatch"));
        }
        let mut reader = Reader::new(&src[4..FILE_HEADER_LEN], "journal header");
        let version = reader.u16()?;
        if version != JOURNAL_FORMAT_VERSION {
            return Err(StoreError::Corruption("journal format version mismatch"));
        }
        if reader.u16()? != 0 {
            return Err(StoreError::Corruption("journal reserved header bytes non-zero"));
        }
        let salt = reader.u64()?;
        let next_txn_id = reader.u64()?;
        let _reserved = reader.u32()?;
        let stored_crc = reader.u32()?;
        if compute_crc32(&[&src[..28]]) != stored_crc {
            return Err(StoreError::Corruption("journal header crc mismatch"));
        }
        Ok(Self { salt, next_txn_id })
    }
}

#[derive(Clone, Copy, Debug)]
struct RecordHeader {
    txn: u64,
    entry_count: u32,
    body_len: u32,
    body_crc32: u32,
}

impl RecordHeader {
    fn encode(&self, salt: u64) -> [u8; RECORD_HEADER_LEN] {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.txn.to_be_bytes());
        buf[8..12].copy_from_slice(&self.entry_count.to_be_bytes());
        buf[12..16].copy_from_slice(&self.body_len.to_be_bytes());
        buf[16..20].copy_from_slice(&self.body_crc32.to_be_bytes());
        let crc = compute_crc32(&[&salt.to_be_bytes(), &buf[..20]]);
        buf[20..24].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Returns `None` when the header checksum does not verify.
    fn decode(src: &[u8; RECORD_HEADER_LEN], salt: u64) -> Option<Self> {
        let stored = u32::from_be_bytes([src[20], src[21], src[22], src[23]]);
        if compute_crc32(&[&salt.to_be_bytes(), &src[..20]]) != stored {
            return None;
        }
        let mut reader = Reader::new(&src[..20], "journal record header");
        Some(Self {
            txn: reader.u64().ok()?,
            entry_count: reader.u32().ok()?,
            body_len: reader.u32().ok()?,
            body_crc32: reader.u32().ok()?,
        })
    }
}

/// One component's share of a commit record.
#[derive(Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Component the payload belongs to.
    pub component: ComponentId,
    /// Opaque recovery payload produced by the component.
    pub payload: Vec<u8>,
}

impl fmt::Debug for JournalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalEntry")
            .field("component", &self.component)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Atomic commit record for one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalRecord {
    /// Transaction that produced the record.
    pub txn: TxnId,
    /// Component payloads in coordinator order.
    pub entries: Vec<JournalEntry>,
}

impl JournalRecord {
    fn encode_body(&self) -> Result<Vec<u8>> {
        let len = self
            .entries
            .iter()
            .map(|entry| ENTRY_HEADER_LEN + entry.payload.len())
            .sum();
        let mut body = Vec::with_capacity(len);
        for entry in &self.entries {
            let payload_len = u32::try_from(entry.payload.len())
                .map_err(|_| StoreError::Invalid("journal payload exceeds u32::MAX"))?;
            body.extend_from_slice(entry.component.as_bytes());
            body.extend_from_slice(&payload_len.to_be_bytes());
            body.extend_from_slice(&entry.payload);
        }
        if body.len() > u32::MAX as usize {
            return Err(StoreError::Invalid("journal record exceeds u32::MAX"));
        }
        Ok(body)
    }

    fn decode_body(txn: TxnId, entry_count: u32, body: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(body, "journal record body");
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let mut id = [0u8; ComponentId::LEN];
            id.copy_from_slice(reader.take(ComponentId::LEN)?);
            let len = reader.u32()? as usize;
            let payload = reader.take(len)?.to_vec();
            entries.push(JournalEntry {
                component: ComponentId::from_bytes(id),
                payload,
            });
        }
        reader.finish()?;
        Ok(Self { txn, entries })
    }
}

/// Counters describing journal activity since open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JournalStats {
    /// Records appended.
    pub records_appended: u64,
    /// Bytes appended, headers included.
    pub bytes_appended: u64,
    /// fsync calls issued.
    pub syncs: u64,
    /// Checkpoints taken.
    pub checkpoints: u64,
}

struct JournalState {
    header: FileHeader,
    append_offset: u64,
    stats: JournalStats,
}

/// Append-only commit journal over a [`FileIo`].
pub struct Journal {
    io: Arc<dyn FileIo>,
    state: Mutex<JournalState>,
}

impl Journal {
    /// Opens an existing journal or initializes an empty one.
    ///
    /// A file shorter than its header is treated as a journal whose creation
    /// was interrupted and is reinitialized.
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let len = io.len()?;
        let header = if len < FILE_HEADER_LEN as u64 {
            let header = FileHeader {
                salt: rand::random(),
                next_txn_id: 1,
            };
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            io.sync_all()?;
            debug!(salt = header.salt, "journal.create");
            header
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            FileHeader::decode(&buf)?
        };
        let append_offset = io.len()?;
        Ok(Self {
            io,
            state: Mutex::new(JournalState {
                header,
                append_offset,
                stats: JournalStats::default(),
            }),
        })
    }

    /// First transaction id not yet handed out, as of the last checkpoint.
    pub fn next_txn_id(&self) -> TxnId {
        TxnId(self.state.lock().header.next_txn_id)
    }

    /// Appends `record` and forces it to stable storage.
    pub fn append(&self, record: &JournalRecord) -> Result<()> {
        let body = record.encode_body()?;
        let entry_count = u32::try_from(record.entries.len())
            .map_err(|_| StoreError::Invalid("too many journal entries"))?;
        let mut state = self.state.lock();
        let header = RecordHeader {
            txn: record.txn.0,
            entry_count,
            body_len: body.len() as u32,
            body_crc32: compute_crc32(&[&body]),
        };
        let mut frame = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
        frame.extend_from_slice(&header.encode(state.header.salt));
        frame.extend_from_slice(&body);
        self.io.write_at(state.append_offset, &frame)?;
        self.io.sync_all()?;
        state.append_offset += frame.len() as u64;
        state.stats.records_appended += 1;
        state.stats.bytes_appended += frame.len() as u64;
        state.stats.syncs += 1;
        debug!(
            txn = %record.txn,
            entries = record.entries.len(),
            bytes = frame.len(),
            "journal.append"
        );
        Ok(())
    }

    /// Iterates over the records written since the last checkpoint.
    pub fn iter(&self) -> Result<JournalIterator> {
        let state = self.state.lock();
        Ok(JournalIterator {
            io: Arc::clone(&self.io),
            salt: state.header.salt,
            offset: FILE_HEADER_LEN as u64,
            end: self.io.len()?,
            valid_up_to: FILE_HEADER_LEN as u64,
        })
    }

    /// Reads every intact record and cuts off any torn tail.
    pub fn replay(&self) -> Result<Vec<JournalRecord>> {
        let mut iter = self.iter()?;
        let mut records = Vec::new();
        while let Some(record) = iter.next_record()? {
            records.push(record);
        }
        let valid_up_to = iter.valid_up_to();
        let len = self.io.len()?;
        if valid_up_to < len {
            warn!(
                discarded = len - valid_up_to,
                valid_up_to, "journal.recover.truncated_tail"
            );
            self.io.truncate(valid_up_to)?;
            self.io.sync_all()?;
        }
        self.state.lock().append_offset = valid_up_to;
        info!(records = records.len(), "journal.replay");
        Ok(records)
    }

    /// Drops all records and stores `next_txn_id` in the header.
    ///
    /// A fresh salt is chosen so stale bytes past the header can never be
    /// mistaken for records of the new generation.
    pub fn checkpoint(&self, next_txn_id: TxnId) -> Result<()> {
        let mut state = self.state.lock();
        let header = FileHeader {
            salt: rand::random(),
            next_txn_id: next_txn_id.0,
        };
        self.io.write_at(0, &header.encode())?;
        self.io.truncate(FILE_HEADER_LEN as u64)?;
        self.io.sync_all()?;
        state.header = header;
        state.append_offset = FILE_HEADER_LEN as u64;
        state.stats.checkpoints += 1;
        state.stats.syncs += 1;
        debug!(next_txn = next_txn_id.0, "journal.checkpoint");
        Ok(())
    }

    /// Current size of the journal file in bytes.
    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    /// True when no records follow the header.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? <= FILE_HEADER_LEN as u64)
    }

    /// Returns activity counters.
    pub fn stats(&self) -> JournalStats {
        self.state.lock().stats
    }
}

/// Sequential reader over journal records.
pub struct JournalIterator {
    io: Arc<dyn FileIo>,
    salt: u64,
    offset: u64,
    end: u64,
    valid_up_to: u64,
}

impl JournalIterator {
    /// Reads the next record.
    ///
    /// Returns `None` at the end of the file or at the first record that is
    /// truncated or fails its checksums.
    pub fn next_record(&mut self) -> Result<Option<JournalRecord>> {
        if self.offset + RECORD_HEADER_LEN as u64 > self.end {
            self.offset = self.end;
            return Ok(None);
        }
        let mut header_buf = [0u8; RECORD_HEADER_LEN];
        self.io.read_at(self.offset, &mut header_buf)?;
        let header = match RecordHeader::decode(&header_buf, self.salt) {
            Some(header) => header,
            None => {
                self.offset = self.end;
                return Ok(None);
            }
        };
        let body_off = self.offset + RECORD_HEADER_LEN as u64;
        if body_off + u64::from(header.body_len) > self.end {
            self.offset = self.end;
            return Ok(None);
        }
        let mut body = vec![0u8; header.body_len as usize];
        self.io.read_at(body_off, &mut body)?;
        if compute_crc32(&[&body]) != header.body_crc32 {
            self.offset = self.end;
            return Ok(None);
        }
        let record = JournalRecord::decode_body(TxnId(header.txn), header.entry_count, &body)?;
        self.offset = body_off + u64::from(header.body_len);
        self.valid_up_to = self.offset;
        Ok(Some(record))
    }

    /// File offset up to which records have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }
}

fn compute_crc32(chunks: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::{MemFileIo, StdFileIo};
    use tempfile::tempdir;

    fn record(txn: u64, parts: &[(u16, &[u8])]) -> JournalRecord {
        let base = ComponentId::from_bytes([0x11; 16]);
        JournalRecord {
            txn: TxnId(txn),
            entries: parts
                .iter()
                .map(|(disc, payload)| JournalEntry {
                    component: ComponentId::derive(base, *disc),
                    payload: payload.to_vec(),
                })
                .collect(),
        }
    }

    #[test]
    fn journal_append_and_replay_roundtrip() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jrnl");
        let first = record(1, &[(1, b"alpha"), (2, b"")]);
        let second = record(2, &[(3, &[9u8; 100])]);
        {
            let journal = Journal::open(Arc::new(StdFileIo::open(&path)?))?;
            assert!(journal.is_empty()?);
            journal.append(&first)?;
            journal.append(&second)?;
            assert_eq!(journal.stats().records_appended, 2);
        }
        let journal = Journal::open(Arc::new(StdFileIo::open(&path)?))?;
        assert_eq!(journal.replay()?, vec![first, second]);
        Ok(())
    }

    #[test]
    fn torn_tail_is_discarded() -> Result<()> {
        let io = MemFileIo::new();
        let journal = Journal::open(Arc::new(io.clone()))?;
        let kept = record(4, &[(1, b"kept")]);
        journal.append(&kept)?;
        let intact_len = io.len()?;
        journal.append(&record(5, &[(1, b"lost in the crash")]))?;
        io.truncate(io.len()? - 3)?;

        let reopened = Journal::open(Arc::new(io.clone()))?;
        assert_eq!(reopened.replay()?, vec![kept.clone()]);
        assert_eq!(io.len()?, intact_len);

        reopened.append(&record(6, &[(2, b"after")]))?;
        let records = reopened.replay()?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].txn, TxnId(6));
        Ok(())
    }

    #[test]
    fn corrupted_body_stops_replay() -> Result<()> {
        let io = MemFileIo::new();
        let journal = Journal::open(Arc::new(io.clone()))?;
        journal.append(&record(1, &[(1, b"payload")]))?;
        let mut byte = [0u8; 1];
        let off = (FILE_HEADER_LEN + RECORD_HEADER_LEN + 2) as u64;
        io.read_at(off, &mut byte)?;
        io.write_at(off, &[byte[0] ^ 0xFF])?;

        let mut iter = journal.iter()?;
        assert!(iter.next_record()?.is_none());
        assert_eq!(iter.valid_up_to(), FILE_HEADER_LEN as u64);
        Ok(())
    }

    #[test]
    fn checkpoint_resets_and_persists_txn_counter() -> Result<()> {
        let io = MemFileIo::new();
        let journal = Journal::open(Arc::new(io.clone()))?;
        assert_eq!(journal.next_txn_id(), TxnId(1));
        journal.append(&record(1, &[(1, b"x")]))?;
        journal.checkpoint(TxnId(42))?;
        assert!(journal.is_empty()?);

        let reopened = Journal::open(Arc::new(io))?;
        assert_eq!(reopened.next_txn_id(), TxnId(42));
        assert!(reopened.replay()?.is_empty());
        Ok(())
    }

    #[test]
    fn bad_header_is_corruption() -> Result<()> {
        let io = MemFileIo::new();
        Journal::open(Arc::new(io.clone()))?;
        io.write_at(0, b"NOPE")?;
        assert!(matches!(
            Journal::open(Arc::new(io)),
            Err(StoreError::Corruption(_))
        ));
        Ok(())
    }
}
