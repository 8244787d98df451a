//! Fixed-size block access over seekable byte streams.

use std::io::{self, Read, Seek, SeekFrom};

use crate::error::{Error, IoResultExt, Result};

/// Block size of UDF optical media.
pub const UDF_BLOCK_SIZE: usize = 2048;

/// Random access to a source in [`UDF_BLOCK_SIZE`] blocks.
pub trait BlockInput {
    /// Total number of whole blocks in the source.
    fn size(&self) -> u32;

    /// Reads `nblocks` blocks starting at `lba` into the front of `buf`.
    ///
    /// Returns the number of whole blocks actually read, which is short only
    /// at the end of the source.
    fn read(&mut self, lba: u32, buf: &mut [u8], nblocks: u32) -> Result<u32>;

    /// Releases the underlying source. Later reads fail.
    fn close(&mut self);
}

/// Any seekable byte stream usable as a block source.
pub trait ByteStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> ByteStream for T {}

/// Adapts a `Read + Seek` stream to [`BlockInput`].
#[derive(Debug)]
pub struct StreamBlockInput<S> {
    stream: Option<S>,
    blocks: u32,
}

impl<S: Read + Seek> StreamBlockInput<S> {
    /// Wraps `stream`, measuring its length once.
    pub fn new(mut stream: S) -> Result<Self> {
        let len = stream
            .seek(SeekFrom::End(0))
            .map_err(|source| Error::BlockRead {
                lba: 0,
                count: 0,
                source,
            })?;
        let blocks = u32::try_from(len / UDF_BLOCK_SIZE as u64).unwrap_or(u32::MAX);

        Ok(Self {
            stream: Some(stream),
            blocks,
        })
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

impl<S: Read + Seek> BlockInput for StreamBlockInput<S> {
    fn size(&self) -> u32 {
        self.blocks
    }

    fn read(&mut self, lba: u32, buf: &mut [u8], nblocks: u32) -> Result<u32> {
        let stream = self.stream.as_mut().ok_or(Error::BlockInputClosed)?;

        let wanted = (nblocks as usize * UDF_BLOCK_SIZE).min(buf.len());
        stream
            .seek(SeekFrom::Start(u64::from(lba) * UDF_BLOCK_SIZE as u64))
            .block_read_context(lba, nblocks)?;

        let filled = read_full(stream, &mut buf[..wanted]).block_read_context(lba, nblocks)?;
        Ok((filled / UDF_BLOCK_SIZE) as u32)
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

/// Reads until `buf` is full or the stream ends.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
