use std::io::SeekFrom;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::{ProxyError, Result};

/// Bounded write sink that keeps small payloads in memory and spills larger
/// ones to an anonymous temp file. Writes past the total limit mark the
/// buffer as overflowed; the retained prefix is discarded at send time.
pub struct Buffer {
    max_mem_bytes: u64,
    max_bytes: u64,
    mem: Vec<u8>,
    spill: Option<File>,
    len: u64,
    overflowed: bool,
}

/// Everything a buffer retained, ready to be replayed in order.
pub enum BufferedContents {
    Memory(Bytes),
    Spilled(File),
}

impl Buffer {
    pub fn new(max_mem_bytes: u64, max_bytes: u64) -> Self {
        Self {
            max_mem_bytes: max_mem_bytes.min(max_bytes),
            max_bytes,
            mem: Vec::new(),
            spill: None,
            len: 0,
            overflowed: false,
        }
    }

    /// Append a chunk. Crossing the memory limit moves the buffered prefix to
    /// a temp file; crossing the total limit marks the buffer overflowed and
    /// rejects the chunk.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.overflowed || self.len + chunk.len() as u64 > self.max_bytes {
            self.overflowed = true;
            return Err(ProxyError::MaximumSizeExceeded);
        }

        if self.spill.is_none() && self.len + chunk.len() as u64 > self.max_mem_bytes {
            let mut file = File::from_std(tempfile::tempfile()?);
            file.write_all(&self.mem).await?;
            self.mem = Vec::new();
            self.spill = Some(file);
        }

        match &mut self.spill {
            Some(file) => file.write_all(chunk).await?,
            None => self.mem.extend_from_slice(chunk),
        }

        self.len += chunk.len() as u64;
        Ok(())
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn spilled(&self) -> bool {
        self.spill.is_some()
    }

    /// Bytes retained so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Consume the buffer and hand back its contents for replay. Fails fast
    /// when the buffer overflowed. The temp file, if any, is rewound and
    /// released once the returned handle is dropped.
    pub async fn into_contents(self) -> Result<BufferedContents> {
        if self.overflowed {
            return Err(ProxyError::MaximumSizeExceeded);
        }

        match self.spill {
            Some(mut file) => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                Ok(BufferedContents::Spilled(file))
            }
            None => Ok(BufferedContents::Memory(Bytes::from(self.mem))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn contents_to_vec(contents: BufferedContents) -> Vec<u8> {
        match contents {
            BufferedContents::Memory(bytes) => bytes.to_vec(),
            BufferedContents::Spilled(mut file) => {
                let mut out = Vec::new();
                file.read_to_end(&mut out).await.unwrap();
                out
            }
        }
    }

    #[tokio::test]
    async fn test_small_writes_stay_in_memory() {
        let mut buffer = Buffer::new(64, 1024);
        buffer.write(b"hello ").await.unwrap();
        buffer.write(b"world").await.unwrap();

        assert!(!buffer.spilled());
        assert!(!buffer.overflowed());
        assert_eq!(buffer.len(), 11);

        let contents = buffer.into_contents().await.unwrap();
        assert_eq!(contents_to_vec(contents).await, b"hello world");
    }

    #[tokio::test]
    async fn test_crossing_memory_limit_spills_to_disk() {
        let mut buffer = Buffer::new(8, 1024);
        buffer.write(b"aaaa").await.unwrap();
        assert!(!buffer.spilled());

        buffer.write(b"bbbbbb").await.unwrap();
        assert!(buffer.spilled());
        assert_eq!(buffer.len(), 10);

        buffer.write(b"cc").await.unwrap();

        let contents = buffer.into_contents().await.unwrap();
        assert_eq!(contents_to_vec(contents).await, b"aaaabbbbbbcc");
    }

    #[tokio::test]
    async fn test_crossing_total_limit_overflows() {
        let mut buffer = Buffer::new(8, 16);
        buffer.write(&[0u8; 12]).await.unwrap();

        let err = buffer.write(&[0u8; 8]).await.unwrap_err();
        assert!(matches!(err, ProxyError::MaximumSizeExceeded));
        assert!(buffer.overflowed());

        // Later writes keep failing and the contents are no longer sendable.
        assert!(buffer.write(b"x").await.is_err());
        assert!(matches!(
            buffer.into_contents().await,
            Err(ProxyError::MaximumSizeExceeded)
        ));
    }

    #[tokio::test]
    async fn test_memory_limit_clamped_to_total_limit() {
        let mut buffer = Buffer::new(1024, 8);
        buffer.write(&[1u8; 8]).await.unwrap();
        assert!(!buffer.spilled());
        assert!(buffer.write(&[1u8; 1]).await.is_err());
    }
}
