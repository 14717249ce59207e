//! Chunk layout: split a file into fixed-size chunks and read them for sending.

use std::io::SeekFrom;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::config::CHUNK_SIZE_MB_RANGE;
use crate::integrity;
use crate::protocol::{ChecksumAlgo, ChunkData, Message};
use crate::session::SessionId;

const MIB: u32 = 1024 * 1024;

/// Chunk sizes a transfer may use, in bytes.
pub const MIN_CHUNK_SIZE: u32 = CHUNK_SIZE_MB_RANGE.0 * MIB;
pub const MAX_CHUNK_SIZE: u32 = CHUNK_SIZE_MB_RANGE.1 * MIB;
/// Most chunks one transfer may have; bounds the bitmap a peer can make us allocate.
pub const MAX_CHUNK_COUNT: u64 = 1 << 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("chunk size must not be zero")]
    ZeroChunkSize,
    #[error("chunk size of {0} bytes is outside 1..=32 MiB")]
    ChunkSize(u32),
    #[error("{total_bytes} bytes in chunks of {chunk_size} needs too many chunks")]
    TooManyChunks { total_bytes: u64, chunk_size: u32 },
}

/// Fixed-size chunk layout of one file. The last chunk may be shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_bytes: u64,
    chunk_size: u32,
}

impl ChunkPlan {
    /// Any layout whose chunk count fits in a `u32` index.
    pub fn new(total_bytes: u64, chunk_size: u32) -> Result<Self, LayoutError> {
        if chunk_size == 0 {
            return Err(LayoutError::ZeroChunkSize);
        }
        if total_bytes.div_ceil(u64::from(chunk_size)) > u64::from(u32::MAX) {
            return Err(LayoutError::TooManyChunks {
                total_bytes,
                chunk_size,
            });
        }
        Ok(Self {
            total_bytes,
            chunk_size,
        })
    }

    /// Layout for a session: chunk size within `MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE` and at
    /// most `MAX_CHUNK_COUNT` chunks. Applied to local options and to a peer's `Hello`.
    pub fn for_transfer(total_bytes: u64, chunk_size: u32) -> Result<Self, LayoutError> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(LayoutError::ChunkSize(chunk_size));
        }
        if total_bytes.div_ceil(u64::from(chunk_size)) > MAX_CHUNK_COUNT {
            return Err(LayoutError::TooManyChunks {
                total_bytes,
                chunk_size,
            });
        }
        Self::new(total_bytes, chunk_size)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// ceil(total / chunk_size). Fits by construction.
    pub fn chunk_count(&self) -> u32 {
        self.total_bytes.div_ceil(u64::from(self.chunk_size)) as u32
    }

    /// (offset, length) of a chunk, or `None` past the end.
    pub fn range(&self, index: u32) -> Option<(u64, u32)> {
        if index >= self.chunk_count() {
            return None;
        }
        let offset = u64::from(index) * u64::from(self.chunk_size);
        let len = (self.total_bytes - offset).min(u64::from(self.chunk_size));
        Some((offset, len as u32))
    }

    /// Length of a chunk, 0 past the end.
    pub fn chunk_len(&self, index: u32) -> u32 {
        self.range(index).map(|(_, len)| len).unwrap_or(0)
    }
}

/// A chunk in flight. The payload lives only as long as the send attempt.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub session_id: SessionId,
    pub index: u32,
    pub offset: u64,
    pub length: u32,
    pub payload: Vec<u8>,
    pub checksum: Vec<u8>,
}

impl Chunk {
    /// Read chunk `index` of `plan` from `file` and checksum it.
    pub async fn read(
        file: &mut File,
        session_id: SessionId,
        plan: &ChunkPlan,
        index: u32,
        algo: ChecksumAlgo,
    ) -> std::io::Result<Chunk> {
        let (offset, length) = plan.range(index).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("chunk {index} is outside the file"),
            )
        })?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut payload = vec![0u8; length as usize];
        file.read_exact(&mut payload).await?;
        let checksum = integrity::hash_chunk(algo, &payload);
        Ok(Chunk {
            session_id,
            index,
            offset,
            length,
            payload,
            checksum,
        })
    }

    pub fn into_message(self) -> Message {
        Message::ChunkData(ChunkData {
            index: self.index,
            offset: self.offset,
            checksum: self.checksum,
            payload: self.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn last_chunk_is_short() {
        let plan = ChunkPlan::new(100, 30).unwrap();
        assert_eq!(plan.chunk_count(), 4);
        let ranges: Vec<_> = (0..plan.chunk_count()).filter_map(|i| plan.range(i)).collect();
        assert_eq!(ranges, vec![(0, 30), (30, 30), (60, 30), (90, 10)]);
        assert_eq!(ChunkPlan::new(10, 100).unwrap().range(0), Some((0, 10)));
        assert_eq!(ChunkPlan::new(0, 30).unwrap().chunk_count(), 0);
    }

    #[test]
    fn count_that_overflows_an_index_is_rejected() {
        assert_eq!(ChunkPlan::new(10, 0), Err(LayoutError::ZeroChunkSize));
        assert!(matches!(
            ChunkPlan::new(1 << 33, 1),
            Err(LayoutError::TooManyChunks { .. })
        ));
        let widest = ChunkPlan::new(u64::from(u32::MAX), 1).unwrap();
        assert_eq!(widest.chunk_count(), u32::MAX);
    }

    #[test]
    fn transfer_layout_is_bounded() {
        assert!(ChunkPlan::for_transfer(10, MIB as u32).is_ok());
        assert!(ChunkPlan::for_transfer(10 * MIB, MAX_CHUNK_SIZE).is_ok());
        assert_eq!(
            ChunkPlan::for_transfer(10, 1),
            Err(LayoutError::ChunkSize(1))
        );
        assert_eq!(
            ChunkPlan::for_transfer(10, MAX_CHUNK_SIZE + 1),
            Err(LayoutError::ChunkSize(MAX_CHUNK_SIZE + 1))
        );
        let too_long = (MAX_CHUNK_COUNT + 1) * MIB;
        assert!(matches!(
            ChunkPlan::for_transfer(too_long, MIB as u32),
            Err(LayoutError::TooManyChunks { .. })
        ));
        assert!(ChunkPlan::for_transfer(MAX_CHUNK_COUNT * MIB, MIB as u32).is_ok());
    }

    #[test]
    fn three_and_a_half_mib_is_four_chunks() {
        let plan = ChunkPlan::new(3 * MIB + MIB / 2, MIB as u32).unwrap();
        assert_eq!(plan.chunk_count(), 4);
        assert_eq!(plan.range(2), Some((2 * MIB, MIB as u32)));
        assert_eq!(plan.range(3), Some((3 * MIB, (MIB / 2) as u32)));
        assert_eq!(plan.range(4), None);
        assert_eq!(plan.chunk_len(4), 0);
    }

    #[tokio::test]
    async fn read_chunk_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let plan = ChunkPlan::new(100, 30).unwrap();
        let mut file = File::open(&path).await.unwrap();
        let chunk = Chunk::read(&mut file, SessionId::new(), &plan, 3, ChecksumAlgo::Sha256)
            .await
            .unwrap();
        assert_eq!(chunk.offset, 90);
        assert_eq!(chunk.length, 10);
        assert_eq!(chunk.payload, &data[90..]);
        assert!(integrity::verify_chunk(&chunk.payload, &chunk.checksum));

        let err = Chunk::read(&mut file, SessionId::new(), &plan, 4, ChecksumAlgo::Sha256).await;
        assert!(err.is_err());
    }
}
