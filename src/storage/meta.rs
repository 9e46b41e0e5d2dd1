#![forbid(unsafe_code)]
//! Small crash-safe state files.
//!
//! Committed roots and object-file bounds are a few dozen bytes that must be
//! replaced atomically. The file holds two fixed-size slots; each write goes
//! to the slot the previous write did not use, so a torn write can only
//! damage the older copy. Reads pick the intact slot with the highest
//! generation.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::primitives::io::FileIo;
use crate::types::{Checksum, Crc32Fast, Result, StoreError};

const STATE_MAGIC: [u8; 4] = *b"QSTF";
const SLOT_LEN: usize = 128;
const SLOT_HEADER_LEN: usize = 16;
/// Largest payload a state file slot can hold.
pub(crate) const MAX_STATE_PAYLOAD: usize = SLOT_LEN - SLOT_HEADER_LEN - 4;

fn slot_crc(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(bytes);
    hasher.finalize()
}

fn encode_slot(generation: u64, payload: &[u8]) -> [u8; SLOT_LEN] {
    let mut buf = [0u8; SLOT_LEN];
    buf[0..4].copy_from_slice(&STATE_MAGIC);
    buf[4..12].copy_from_slice(&generation.to_be_bytes());
    buf[12..16].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    let end = SLOT_HEADER_LEN + payload.len();
    buf[SLOT_HEADER_LEN..end].copy_from_slice(payload);
    let crc = slot_crc(&buf[..end]);
    buf[end..end + 4].copy_from_slice(&crc.to_be_bytes());
    buf
}

fn decode_slot(buf: &[u8]) -> Option<(u64, Vec<u8>)> {
    if buf.len() < SLOT_LEN || buf[0..4] != STATE_MAGIC {
        return None;
    }
    let generation = u64::from_be_bytes(buf[4..12].try_into().ok()?);
    let len = u32::from_be_bytes(buf[12..16].try_into().ok()?) as usize;
    if len > MAX_STATE_PAYLOAD {
        return None;
    }
    let end = SLOT_HEADER_LEN + len;
    let stored = u32::from_be_bytes(buf[end..end + 4].try_into().ok()?);
    if slot_crc(&buf[..end]) != stored {
        return None;
    }
    Some((generation, buf[SLOT_HEADER_LEN..end].to_vec()))
}

/// Two-slot state file over a [`FileIo`].
pub(crate) struct StateFile {
    io: Arc<dyn FileIo>,
    generation: Mutex<u64>,
}

impl StateFile {
    /// Opens the file and returns the newest intact payload, if any.
    pub(crate) fn open(io: Arc<dyn FileIo>) -> Result<(Self, Option<Vec<u8>>)> {
        let len = io.len()?.min(2 * SLOT_LEN as u64) as usize;
        let mut buf = vec![0u8; len];
        io.read_at(0, &mut buf)?;
        let newest = buf
            .chunks(SLOT_LEN)
            .filter_map(decode_slot)
            .max_by_key(|(generation, _)| *generation);
        if len > 0 && newest.is_none() {
            return Err(StoreError::Corruption("state file has no intact slot"));
        }
        let (generation, payload) = match newest {
            Some((generation, payload)) => (generation, Some(payload)),
            None => (0, None),
        };
        Ok((
            Self {
                io,
                generation: Mutex::new(generation),
            },
            payload,
        ))
    }

    /// Durably replaces the stored payload.
    pub(crate) fn write(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_STATE_PAYLOAD {
            return Err(StoreError::Invalid("state payload too large"));
        }
        let mut generation = self.generation.lock();
        let next = *generation + 1;
        let slot = (next % 2) as u64;
        self.io
            .write_at(slot * SLOT_LEN as u64, &encode_slot(next, payload))?;
        self.io.sync_all()?;
        *generation = next;
        trace!(generation = next, slot, "state_file.write");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;

    #[test]
    fn newest_intact_slot_wins() -> Result<()> {
        let io = MemFileIo::new();
        let (state, initial) = StateFile::open(Arc::new(io.clone()))?;
        assert!(initial.is_none());
        state.write(b"first")?;
        state.write(b"second")?;
        let (_, payload) = StateFile::open(Arc::new(io.clone()))?;
        assert_eq!(payload.as_deref(), Some(&b"second"[..]));

        // damage the newer slot: the previous payload survives
        io.write_at(SLOT_HEADER_LEN as u64, b"XX")?;
        let (reopened, payload) = StateFile::open(Arc::new(io.clone()))?;
        assert_eq!(payload.as_deref(), Some(&b"first"[..]));
        reopened.write(b"third")?;
        let (_, payload) = StateFile::open(Arc::new(io))?;
        assert_eq!(payload.as_deref(), Some(&b"third"[..]));
        Ok(())
    }

    #[test]
    fn garbage_file_is_corruption() {
        let io = MemFileIo::new();
        io.write_at(0, &[0xEE; 40]).unwrap();
        assert!(StateFile::open(Arc::new(io)).is_err());
    }

    #[test]
    fn oversized_payload_is_rejected() -> Result<()> {
        let (state, _) = StateFile::open(Arc::new(MemFileIo::new()))?;
        assert!(state.write(&[0u8; MAX_STATE_PAYLOAD + 1]).is_err());
        Ok(())
    }
}
