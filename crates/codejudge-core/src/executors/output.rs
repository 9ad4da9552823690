//! Bounded output collection.
//!
//! Submitted programs control how much they print. Both executors push every chunk
//! they read into a `BoundedBuffer`, which keeps the first `limit` bytes and counts
//! the rest, so the stream keeps draining without growing memory.

use tokio::io::{AsyncRead, AsyncReadExt};

pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

#[derive(Debug, Clone)]
pub struct BoundedBuffer {
    data: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        let take = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }

    pub fn is_truncated(&self) -> bool {
        self.dropped > 0
    }

    pub fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.dropped > 0 {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Drain `reader` to EOF into a buffer capped at `limit` bytes
pub async fn collect_bounded<R>(mut reader: R, limit: usize) -> std::io::Result<BoundedBuffer>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BoundedBuffer::new(limit);
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        buffer.push(&chunk[..read]);
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_prefix_and_marks_truncation() {
        let mut buffer = BoundedBuffer::new(5);
        buffer.push(b"abc");
        buffer.push(b"defgh");
        assert!(buffer.is_truncated());
        assert_eq!(buffer.into_string(), format!("abcde{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_exact_fit_is_not_truncated() {
        let mut buffer = BoundedBuffer::new(4);
        buffer.push(b"ab");
        buffer.push(b"cd");
        assert!(!buffer.is_truncated());
        assert_eq!(buffer.into_string(), "abcd");
    }

    #[tokio::test]
    async fn test_collect_drains_whole_reader() {
        let input = vec![b'x'; 20_000];
        let buffer = collect_bounded(&input[..], 100).await.unwrap();
        assert!(buffer.is_truncated());
        let text = buffer.into_string();
        assert!(text.starts_with(&"x".repeat(100)));
        assert!(text.ends_with(TRUNCATION_MARKER));
    }
}
