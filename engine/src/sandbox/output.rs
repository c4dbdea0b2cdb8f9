//! Bounded output collection
//!
//! Streams are drained to EOF so a chatty program never blocks on a full pipe,
//! but only the first `limit` bytes are kept. Anything past the limit is
//! counted and replaced with a visible marker.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt};

/// Appended to any stream cut at its byte limit
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

const READ_CHUNK: usize = 8 * 1024;

/// Collected stream contents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
    /// Bytes the program wrote, including the discarded tail
    pub total_bytes: u64,
}

/// Byte-capped accumulator shared by the async reader and the in-process runner
#[derive(Debug)]
pub struct BoundedBuffer {
    bytes: Vec<u8>,
    limit: usize,
    total: u64,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(limit.min(READ_CHUNK)),
            limit,
            total: 0,
        }
    }

    /// Append, keeping at most `limit` bytes. Returns false once the cap is hit.
    pub fn push(&mut self, data: &[u8]) -> bool {
        self.total += data.len() as u64;
        let room = self.limit.saturating_sub(self.bytes.len());
        let take = room.min(data.len());
        self.bytes.extend_from_slice(&data[..take]);
        take == data.len()
    }

    pub fn push_str(&mut self, s: &str) -> bool {
        self.push(s.as_bytes())
    }

    pub fn is_full(&self) -> bool {
        self.bytes.len() >= self.limit
    }

    pub fn is_truncated(&self) -> bool {
        self.total > self.bytes.len() as u64
    }

    pub fn finish(self) -> CapturedOutput {
        let truncated = self.is_truncated();
        // a cut may land inside a multi-byte sequence; lossy decode absorbs it
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        CapturedOutput {
            text,
            truncated,
            total_bytes: self.total,
        }
    }
}

/// Buffer a reader task fills while the runner keeps a handle to it.
/// Whatever arrived survives even when the task has to be aborted.
#[derive(Debug, Clone)]
pub struct SharedBuffer(Arc<Mutex<BoundedBuffer>>);

impl SharedBuffer {
    pub fn new(limit: usize) -> Self {
        Self(Arc::new(Mutex::new(BoundedBuffer::new(limit))))
    }

    pub fn push(&self, data: &[u8]) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(data)
    }

    /// Take everything collected so far, leaving an empty buffer behind
    pub fn take(&self) -> CapturedOutput {
        let mut buffer = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let limit = buffer.limit;
        std::mem::replace(&mut *buffer, BoundedBuffer::new(limit)).finish()
    }
}

/// Drain `reader` to EOF into a shared buffer
pub async fn capture_into<R>(mut reader: R, buffer: SharedBuffer) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.push(&chunk[..n]);
    }
}
