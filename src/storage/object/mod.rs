#![forbid(unsafe_code)]
//! Append-only object file.
//!
//! Objects are framed as `len:u32 BE` followed by `len` bytes and addressed
//! by the byte offset of their length prefix.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::primitives::io::FileIo;
use crate::types::{Result, StoreError};

mod trans;

pub use trans::{ObjectTxnState, TransObjectFile};

const FRAME_HEADER_LEN: u64 = 4;

/// Logical end of an object file: byte length and number of objects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct ObjectBounds {
    /// Bytes up to the end of the last object.
    pub length: u64,
    /// Objects stored.
    pub position: u64,
}

impl ObjectBounds {
    pub(crate) fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.length.to_be_bytes());
        buf[8..].copy_from_slice(&self.position.to_be_bytes());
        buf
    }

    pub(crate) fn decode(src: &[u8]) -> Result<Self> {
        if src.len() != 16 {
            return Err(StoreError::Corruption("object bounds have the wrong length"));
        }
        let mut length = [0u8; 8];
        let mut position = [0u8; 8];
        length.copy_from_slice(&src[..8]);
        position.copy_from_slice(&src[8..]);
        Ok(Self {
            length: u64::from_be_bytes(length),
            position: u64::from_be_bytes(position),
        })
    }
}

/// Append-only sequence of byte strings over a [`FileIo`].
///
/// The logical length may be shorter than the physical file: bytes past it
/// are leftovers of an interrupted append and are overwritten by the next
/// write.
pub struct ObjectFile {
    io: Arc<dyn FileIo>,
    bounds: Mutex<ObjectBounds>,
}

impl ObjectFile {
    /// Opens a file whose every byte is a complete object, counting them.
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let file = Self::with_bounds(
            io,
            ObjectBounds {
                length: 0,
                position: 0,
            },
        );
        let physical = file.io.len()?;
        let mut bounds = ObjectBounds::default();
        while bounds.length < physical {
            let len = file.frame_len(bounds.length, physical)?;
            bounds.length += FRAME_HEADER_LEN + len;
            bounds.position += 1;
        }
        *file.bounds.lock() = bounds;
        Ok(file)
    }

    /// Opens a file whose logical end is already known.
    pub fn with_bounds(io: Arc<dyn FileIo>, bounds: ObjectBounds) -> Self {
        Self {
            io,
            bounds: Mutex::new(bounds),
        }
    }

    /// Appends `bytes` and returns their offset.
    pub fn write(&self, bytes: &[u8]) -> Result<u64> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| StoreError::Invalid("object larger than u32::MAX bytes"))?;
        let mut bounds = self.bounds.lock();
        let offset = bounds.length;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + bytes.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(bytes);
        self.io.write_at(offset, &frame)?;
        bounds.length += frame.len() as u64;
        bounds.position += 1;
        Ok(offset)
    }

    /// Reads the object at `offset`.
    pub fn read(&self, offset: u64) -> Result<Vec<u8>> {
        self.read_within(offset, self.length())
    }

    /// Reads the object at `offset`, which must end at or before `limit`.
    pub(crate) fn read_within(&self, offset: u64, limit: u64) -> Result<Vec<u8>> {
        let len = self.frame_len(offset, limit)?;
        let mut buf = vec![0u8; len as usize];
        self.io.read_at(offset + FRAME_HEADER_LEN, &mut buf)?;
        Ok(buf)
    }

    fn frame_len(&self, offset: u64, limit: u64) -> Result<u64> {
        if offset.saturating_add(FRAME_HEADER_LEN) > limit {
            return Err(StoreError::NotFound("object"));
        }
        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        self.io.read_at(offset, &mut header)?;
        let len = u32::from_be_bytes(header) as u64;
        if offset + FRAME_HEADER_LEN + len > limit {
            return Err(StoreError::Corruption("object extends past the end of the file"));
        }
        Ok(len)
    }

    /// Logical length in bytes.
    pub fn length(&self) -> u64 {
        self.bounds.lock().length
    }

    /// Number of objects written.
    pub fn position(&self) -> u64 {
        self.bounds.lock().position
    }

    /// Logical length and object count.
    pub fn bounds(&self) -> ObjectBounds {
        *self.bounds.lock()
    }

    /// Physical file length, including any tail past the logical end.
    pub fn physical_length(&self) -> Result<u64> {
        self.io.len()
    }

    /// Cuts the file back to `bounds`, physically discarding later bytes.
    pub fn truncate(&self, bounds: ObjectBounds) -> Result<()> {
        let mut current = self.bounds.lock();
        self.io.truncate(bounds.length)?;
        *current = bounds;
        Ok(())
    }

    /// Moves the logical end back without touching the file.
    pub(crate) fn rewind(&self, bounds: ObjectBounds) {
        *self.bounds.lock() = bounds;
    }

    /// Forces written objects to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    /// Iterates over `(offset, bytes)` of every object in order.
    pub fn iter(&self) -> ObjectIter<'_> {
        ObjectIter {
            file: self,
            offset: 0,
            end: self.length(),
        }
    }
}

/// Iterator returned by [`ObjectFile::iter`].
pub struct ObjectIter<'a> {
    file: &'a ObjectFile,
    offset: u64,
    end: u64,
}

impl Iterator for ObjectIter<'_> {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }
        let offset = self.offset;
        match self.file.read_within(offset, self.end) {
            Ok(bytes) => {
                self.offset += FRAME_HEADER_LEN + bytes.len() as u64;
                Some(Ok((offset, bytes)))
            }
            Err(err) => {
                self.offset = self.end;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::{MemFileIo, StdFileIo};
    use tempfile::tempdir;

    #[test]
    fn objects_roundtrip_and_iterate() -> Result<()> {
        let file = ObjectFile::open(Arc::new(MemFileIo::new()))?;
        let a = file.write(b"alpha")?;
        let b = file.write(b"")?;
        let c = file.write(&[7u8; 300])?;
        assert_eq!((a, b), (0, 9));
        assert_eq!(file.read(a)?, b"alpha");
        assert!(file.read(b)?.is_empty());
        assert_eq!(file.read(c)?.len(), 300);
        assert_eq!(file.position(), 3);
        assert_eq!(file.length(), 9 + 4 + 304);

        let offsets: Vec<u64> = file.iter().map(|r| r.map(|(off, _)| off)).collect::<Result<_>>()?;
        assert_eq!(offsets, vec![a, b, c]);
        assert!(file.read(file.length()).unwrap_err().is_not_found());
        Ok(())
    }

    #[test]
    fn truncate_discards_later_objects() -> Result<()> {
        let file = ObjectFile::open(Arc::new(MemFileIo::new()))?;
        file.write(b"keep")?;
        let mark = file.bounds();
        let dropped = file.write(b"drop")?;
        file.truncate(mark)?;
        assert_eq!(file.bounds(), mark);
        assert_eq!(file.physical_length()?, mark.length);
        assert!(file.read(dropped).is_err());
        assert_eq!(file.write(b"next")?, dropped);
        Ok(())
    }

    #[test]
    fn reopen_counts_objects() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.obj");
        {
            let file = ObjectFile::open(Arc::new(StdFileIo::open(&path)?))?;
            for word in ["one", "two", "three"] {
                file.write(word.as_bytes())?;
            }
            file.sync()?;
        }
        let file = ObjectFile::open(Arc::new(StdFileIo::open(&path)?))?;
        assert_eq!(file.position(), 3);
        assert_eq!(file.read(7)?, b"two");
        Ok(())
    }

    #[test]
    fn torn_frame_is_corruption() -> Result<()> {
        let io = MemFileIo::new();
        io.write_at(0, &100u32.to_be_bytes())?;
        io.write_at(4, b"short")?;
        assert!(matches!(
            ObjectFile::open(Arc::new(io)),
            Err(StoreError::Corruption(_))
        ));
        Ok(())
    }
}
