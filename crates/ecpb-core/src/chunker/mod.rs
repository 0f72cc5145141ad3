use std::io::Read;

use crate::error::Result;
use crate::types::CHUNK_SIZE;

/// A contiguous slice of a file's original bytes.
#[derive(Debug)]
pub struct Chunk {
    /// 0-based position within the file.
    pub index: u32,
    /// Byte offset of this chunk in the file.
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Walk a reader in fixed windows of [`CHUNK_SIZE`] bytes.
/// The final chunk may be shorter; empty input yields no chunks.
pub fn chunk_reader<R: Read>(reader: R) -> ChunkIter<R> {
    ChunkIter {
        reader,
        index: 0,
        offset: 0,
        done: false,
    }
}

pub struct ChunkIter<R> {
    reader: R,
    index: u32,
    offset: u64,
    done: bool,
}

impl<R: Read> Iterator for ChunkIter<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut data = vec![0u8; CHUNK_SIZE];
        let mut filled = 0;
        // read() may return short counts; fill the window until EOF.
        while filled < CHUNK_SIZE {
            match self.reader.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }

        if filled == 0 {
            self.done = true;
            return None;
        }
        if filled < CHUNK_SIZE {
            data.truncate(filled);
            self.done = true;
        }

        let chunk = Chunk {
            index: self.index,
            offset: self.offset,
            data,
        };
        self.index += 1;
        self.offset += filled as u64;
        Some(Ok(chunk))
    }
}
