//! Media sources: files on disk or encoded bytes held in memory

use crate::error::{DecoderError, Result};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Seek request understood by [`MemoryVideoFile::seek`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Absolute position from the start of the buffer
    Set,
    /// Report the total size without moving
    Size,
    /// Any other backend-specific mode (rejected)
    Other(i32),
}

/// Outcome of a single [`MemoryVideoFile::read`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Bytes(usize),
    Eof,
}

/// Read/seek view over an encoded video held in memory
#[derive(Debug, Clone)]
pub struct MemoryVideoFile {
    data: Arc<[u8]>,
    position: i64,
}

impl MemoryVideoFile {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }

    pub fn size(&self) -> i64 {
        self.data.len() as i64
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn read(&mut self, buffer: &mut [u8]) -> ReadOutcome {
        let left_in_file = self.size() - self.position;
        if self.position < 0 || left_in_file <= 0 {
            return ReadOutcome::Eof;
        }
        let to_read = (left_in_file as usize).min(buffer.len());
        let start = self.position as usize;
        buffer[..to_read].copy_from_slice(&self.data[start..start + to_read]);
        self.position += to_read as i64;
        ReadOutcome::Bytes(to_read)
    }

    pub fn seek(&mut self, new_position: i64, mode: SeekMode) -> Result<i64> {
        match mode {
            SeekMode::Set if new_position < 0 => Err(DecoderError::InvalidPosition(new_position)),
            SeekMode::Set => {
                self.position = new_position;
                Ok(self.position)
            }
            SeekMode::Size => Ok(self.size()),
            SeekMode::Other(raw) => Err(DecoderError::UnsupportedSeekMode(raw)),
        }
    }

    /// Rewind to the start, as done on every session reopen
    pub fn rewind(&mut self) {
        self.position = 0;
    }
}

impl io::Read for MemoryVideoFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match MemoryVideoFile::read(self, buf) {
            ReadOutcome::Bytes(n) => Ok(n),
            ReadOutcome::Eof => Ok(0),
        }
    }
}

impl io::Seek for MemoryVideoFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(p) => p as i64,
            io::SeekFrom::End(off) => self.size() + off,
            io::SeekFrom::Current(off) => self.position + off,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of memory file",
            ));
        }
        MemoryVideoFile::seek(self, target, SeekMode::Set)
            .map(|p| p as u64)
            .map_err(|e| io::Error::new(io::ErrorKind::Unsupported, e.to_string()))
    }
}

/// Where encoded video comes from
#[derive(Debug, Clone)]
pub enum MediaSource {
    File(PathBuf),
    Memory {
        file: MemoryVideoFile,
        source_info: String,
    },
}

impl MediaSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn memory(data: impl Into<Arc<[u8]>>, source_info: impl Into<String>) -> Self {
        Self::Memory {
            file: MemoryVideoFile::new(data),
            source_info: source_info.into(),
        }
    }

    /// Name used in log lines and error messages
    pub fn name(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Memory { source_info, .. } => source_info.clone(),
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory { .. })
    }
}
