#![forbid(unsafe_code)]
//! Encoding and buffer utilities shared across storage layers.

pub mod ord {
    //! Range bounds over big-endian keys.

    /// Smallest byte string of the same length that sorts after every string
    /// starting with `prefix`, or `None` when `prefix` is all `0xFF`.
    pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
        let mut out = prefix.to_vec();
        for idx in (0..out.len()).rev() {
            if out[idx] == u8::MAX {
                out[idx] = 0;
            } else {
                out[idx] += 1;
                return Some(out);
            }
        }
        None
    }
}

pub mod buf {
    //! Fallible slice cursor for decoding persisted structures.

    use core::fmt;

    use crate::types::{Result, StoreError};

    /// Reads big-endian integers and length-prefixed strings from a slice.
    pub struct Reader<'a> {
        buf: &'a [u8],
        off: usize,
        what: &'static str,
    }

    impl<'a> Reader<'a> {
        /// Creates a reader; `what` names the structure in corruption errors.
        pub fn new(buf: &'a [u8], what: &'static str) -> Self {
            Self { buf, off: 0, what }
        }

        /// Takes the next `n` bytes.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or(StoreError::Corruption("cursor offset overflow"))?;
            if end > self.buf.len() {
                return Err(StoreError::CorruptionOwned(format!(
                    "{} truncated: need {} bytes, {} remaining",
                    self.what,
                    n,
                    self.remaining()
                )));
            }
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a big-endian u16.
        pub fn u16(&mut self) -> Result<u16> {
            let mut raw = [0u8; 2];
            raw.copy_from_slice(self.take(2)?);
            Ok(u16::from_be_bytes(raw))
        }

        /// Reads a big-endian u32.
        pub fn u32(&mut self) -> Result<u32> {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(self.take(4)?);
            Ok(u32::from_be_bytes(raw))
        }

        /// Reads a big-endian u64.
        pub fn u64(&mut self) -> Result<u64> {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(self.take(8)?);
            Ok(u64::from_be_bytes(raw))
        }

        /// Reads a `u32`-length-prefixed UTF-8 string.
        pub fn string(&mut self) -> Result<String> {
            let len = self.u32()? as usize;
            let raw = self.take(len)?;
            String::from_utf8(raw.to_vec()).map_err(|_| {
                StoreError::CorruptionOwned(format!("{} holds invalid utf-8", self.what))
            })
        }

        /// Bytes not yet consumed.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// Fails unless every byte was consumed.
        pub fn finish(self) -> Result<()> {
            if self.remaining() != 0 {
                return Err(StoreError::CorruptionOwned(format!(
                    "{} has {} trailing bytes",
                    self.what,
                    self.remaining()
                )));
            }
            Ok(())
        }
    }

    impl fmt::Debug for Reader<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Reader")
                .field("what", &self.what)
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }

    /// Appends a `u32`-length-prefixed UTF-8 string.
    pub fn put_string(dst: &mut Vec<u8>, s: &str) {
        assert!(
            s.len() <= u32::MAX as usize,
            "string too long (>{} bytes)",
            u32::MAX
        );
        dst.extend_from_slice(&(s.len() as u32).to_be_bytes());
        dst.extend_from_slice(s.as_bytes());
    }
}
