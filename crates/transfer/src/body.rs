use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::TransferError;

/// Where a transfer body comes from (upload) or goes to (download).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Stream to or from a file, starting at `offset`.
    ///
    /// For downloads the offset is the resume point: the file is cut to that
    /// length and a range request is issued. For uploads it is the first
    /// byte sent.
    File { path: PathBuf, offset: u64 },
    /// Keep the body in memory. For uploads these are the bytes sent; for
    /// downloads the received bytes are handed back in the outcome.
    Memory(Vec<u8>),
}

impl Body {
    /// File body starting at byte 0.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Body::File {
            path: path.into(),
            offset: 0,
        }
    }

    /// Returns `true` when the body streams directly to or from disk.
    pub fn is_file(&self) -> bool {
        matches!(self, Body::File { .. })
    }

    pub(crate) fn offset(&self) -> u64 {
        match self {
            Body::File { offset, .. } => *offset,
            Body::Memory(_) => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// BodySource
// ---------------------------------------------------------------------------

/// Reads an upload body in caller-sized blocks.
pub(crate) struct BodySource {
    kind: SourceKind,
    offset: u64,
    len: u64,
}

enum SourceKind {
    File { file: File, path: PathBuf },
    Memory(Vec<u8>),
}

impl BodySource {
    /// Opens the body and positions it at its start offset.
    pub(crate) fn open(body: &Body) -> Result<Self, TransferError> {
        match body {
            Body::File { path, offset } => {
                let mut file = File::open(path).map_err(|e| TransferError::local(path, e))?;
                let len = file
                    .metadata()
                    .map_err(|e| TransferError::local(path, e))?
                    .len();
                if *offset > len {
                    return Err(TransferError::local(
                        path,
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            format!("start offset {offset} beyond file size {len}"),
                        ),
                    ));
                }
                file.seek(SeekFrom::Start(*offset))
                    .map_err(|e| TransferError::local(path, e))?;
                Ok(Self {
                    kind: SourceKind::File {
                        file,
                        path: path.clone(),
                    },
                    offset: *offset,
                    len,
                })
            }
            Body::Memory(data) => Ok(Self {
                len: data.len() as u64,
                kind: SourceKind::Memory(data.clone()),
                offset: 0,
            }),
        }
    }

    /// Reads up to `buf.len()` bytes. Returns 0 once the body is exhausted.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        let want = (self.remaining() as usize).min(buf.len());
        if want == 0 {
            return Ok(0);
        }
        let n = match &mut self.kind {
            SourceKind::File { file, path } => {
                let n = file
                    .read(&mut buf[..want])
                    .map_err(|e| TransferError::local(path.as_path(), e))?;
                if n == 0 {
                    return Err(TransferError::local(
                        path.as_path(),
                        std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "file shrank during upload",
                        ),
                    ));
                }
                n
            }
            SourceKind::Memory(data) => {
                let start = self.offset as usize;
                buf[..want].copy_from_slice(&data[start..start + want]);
                want
            }
        };
        self.offset += n as u64;
        Ok(n)
    }

    /// Byte offset of the next byte read.
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// Total body size, including any bytes before the start offset.
    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    /// Bytes still to read.
    pub(crate) fn remaining(&self) -> u64 {
        self.len - self.offset
    }
}

// ---------------------------------------------------------------------------
// BodySink
// ---------------------------------------------------------------------------

/// Writes a download body to disk or memory at a tracked offset.
pub(crate) struct BodySink {
    kind: SinkKind,
    offset: u64,
}

enum SinkKind {
    File { file: File, path: PathBuf },
    Memory(Vec<u8>),
}

impl BodySink {
    /// Opens the destination, cutting any bytes past the resume offset.
    pub(crate) fn open(body: &Body) -> Result<Self, TransferError> {
        match body {
            Body::File { path, offset } => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent).map_err(|e| TransferError::local(path, e))?;
                }
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(false)
                    .open(path)
                    .map_err(|e| TransferError::local(path, e))?;
                let existing = file
                    .metadata()
                    .map_err(|e| TransferError::local(path, e))?
                    .len();
                // Never extend a file with zeros; resume only from bytes we have.
                let offset = (*offset).min(existing);
                file.set_len(offset)
                    .map_err(|e| TransferError::local(path, e))?;
                file.seek(SeekFrom::Start(offset))
                    .map_err(|e| TransferError::local(path, e))?;
                Ok(Self {
                    kind: SinkKind::File {
                        file,
                        path: path.clone(),
                    },
                    offset,
                })
            }
            Body::Memory(_) => Ok(Self {
                kind: SinkKind::Memory(Vec::new()),
                offset: 0,
            }),
        }
    }

    /// Discards everything written so far and starts again at byte 0.
    pub(crate) fn restart(&mut self) -> Result<(), TransferError> {
        match &mut self.kind {
            SinkKind::File { file, path } => {
                file.set_len(0)
                    .map_err(|e| TransferError::local(path.as_path(), e))?;
                file.seek(SeekFrom::Start(0))
                    .map_err(|e| TransferError::local(path.as_path(), e))?;
            }
            SinkKind::Memory(data) => data.clear(),
        }
        self.offset = 0;
        Ok(())
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> Result<(), TransferError> {
        match &mut self.kind {
            SinkKind::File { file, path } => file
                .write_all(data)
                .map_err(|e| TransferError::local(path.as_path(), e))?,
            SinkKind::Memory(buf) => buf.extend_from_slice(data),
        }
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Flushes the file and returns the in-memory body, if any.
    pub(crate) fn finish(self) -> Result<Option<Vec<u8>>, TransferError> {
        match self.kind {
            SinkKind::File { mut file, path } => {
                file.flush().map_err(|e| TransferError::local(&path, e))?;
                file.sync_data().map_err(|e| TransferError::local(&path, e))?;
                Ok(None)
            }
            SinkKind::Memory(buf) => Ok(Some(buf)),
        }
    }

    /// Byte offset of the next byte written.
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }
}

/// Returns the length of an existing partial download, 0 if absent.
pub fn existing_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
