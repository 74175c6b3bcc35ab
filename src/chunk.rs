/*!
 * Chunk model and planning
 *
 * A chunk is a contiguous byte range of the source file, the unit of
 * parallel transfer and retry. The plan is derived once per task and never
 * changes mid-transfer; across resumes the plan stored in the manifest wins.
 */

use crate::config::{
    TransferConfig, ARIA2_CHUNK_SIZE, ARIA2_MAX_CHUNKS, DEFAULT_CHUNK_SIZE, LARGE_FILE_CHUNK_TARGET,
    LARGE_FILE_THRESHOLD,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl Default for ChunkStatus {
    fn default() -> Self {
        ChunkStatus::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub offset: u64,
    pub size: u64,
    #[serde(default)]
    pub status: ChunkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Chunk {
    pub fn new(index: u32, offset: u64, size: u64) -> Self {
        Self {
            index,
            offset,
            size,
            status: ChunkStatus::Pending,
            sha256: None,
            attempts: 0,
            error: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ChunkStatus::Completed
    }
}

/// Pick the chunk size for a file, honoring the aria2 profile and an
/// explicit `--chunk` override (default mode only).
pub fn chunk_size_for(file_size: u64, config: &TransferConfig) -> u64 {
    if config.aria2 {
        // 1 MiB chunks, but never more than 4096 of them
        let size = ARIA2_CHUNK_SIZE;
        if file_size.div_ceil(size) > ARIA2_MAX_CHUNKS {
            file_size.div_ceil(ARIA2_MAX_CHUNKS)
        } else {
            size
        }
    } else if let Some(explicit) = config.chunk_size {
        explicit
    } else if file_size < DEFAULT_CHUNK_SIZE {
        // Small file: one chunk
        file_size.max(1)
    } else if file_size <= LARGE_FILE_THRESHOLD {
        DEFAULT_CHUNK_SIZE
    } else {
        DEFAULT_CHUNK_SIZE.max(file_size.div_ceil(LARGE_FILE_CHUNK_TARGET))
    }
}

/// Produce the ordered chunk list covering `0..file_size`.
///
/// The list is a contiguous tiling: offsets strictly increase, each chunk
/// begins where the previous one ended and the sizes sum to `file_size`.
/// A zero-byte file yields a single zero-size chunk so the task still
/// round-trips verification.
pub fn plan_chunks(file_size: u64, config: &TransferConfig) -> Vec<Chunk> {
    if file_size == 0 {
        return vec![Chunk::new(0, 0, 0)];
    }

    let chunk_size = chunk_size_for(file_size, config);
    let mut chunks = Vec::with_capacity(file_size.div_ceil(chunk_size) as usize);
    let mut offset = 0u64;
    let mut index = 0u32;

    while offset < file_size {
        let size = chunk_size.min(file_size - offset);
        chunks.push(Chunk::new(index, offset, size));
        offset += size;
        index += 1;
    }

    chunks
}

/// Check the chunk-list invariants: indices 0..N-1, contiguous tiling from
/// zero, sizes summing to `file_size`.
pub fn plan_is_valid(chunks: &[Chunk], file_size: u64) -> bool {
    if chunks.is_empty() {
        return false;
    }
    if file_size == 0 {
        return chunks.len() == 1 && chunks[0].offset == 0 && chunks[0].size == 0;
    }

    let mut expected_offset = 0u64;
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.index as usize != i || chunk.offset != expected_offset || chunk.size == 0 {
            return false;
        }
        expected_offset += chunk.size;
    }
    expected_offset == file_size
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn default_config() -> TransferConfig {
        TransferConfig::default()
    }

    fn aria2_config() -> TransferConfig {
        TransferConfig {
            aria2: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_small_file_single_chunk() {
        let chunks = plan_chunks(1024, &default_config());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[0].size, 1024);
        assert!(plan_is_valid(&chunks, 1024));
    }

    #[test]
    fn test_just_under_threshold_single_chunk() {
        let chunks = plan_chunks(4 * MIB - 1, &default_config());
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_medium_file_4mib_chunks() {
        // 200 MiB → 50 chunks of 4 MiB... sits above the 100 MiB tier,
        // but ceil(200M/256) < 4 MiB so the 4 MiB floor holds
        let size = 200 * MIB;
        let chunks = plan_chunks(size, &default_config());
        assert_eq!(chunks.len(), 50);
        assert!(chunks.iter().all(|c| c.size == 4 * MIB));
        assert!(plan_is_valid(&chunks, size));
    }

    #[test]
    fn test_uneven_tail_chunk() {
        let size = 10 * MIB + 123;
        let chunks = plan_chunks(size, &default_config());
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].size, 2 * MIB + 123);
        assert!(plan_is_valid(&chunks, size));
    }

    #[test]
    fn test_huge_file_scales_chunk_size() {
        // 4 GiB: ceil(S/256) = 16 MiB > 4 MiB floor
        let size = 4 * 1024 * MIB;
        let chunks = plan_chunks(size, &default_config());
        assert_eq!(chunk_size_for(size, &default_config()), 16 * MIB);
        assert_eq!(chunks.len(), 256);
        assert!(plan_is_valid(&chunks, size));
    }

    #[test]
    fn test_explicit_chunk_size_overrides_table() {
        let config = TransferConfig {
            chunk_size: Some(2 * MIB),
            ..Default::default()
        };
        let chunks = plan_chunks(10 * MIB, &config);
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.size == 2 * MIB));
    }

    #[test]
    fn test_aria2_one_mib_chunks() {
        let size = 200 * MIB;
        let chunks = plan_chunks(size, &aria2_config());
        assert_eq!(chunks.len(), 200);
        assert!(chunks.iter().all(|c| c.size == MIB));
        assert!(plan_is_valid(&chunks, size));
    }

    #[test]
    fn test_aria2_chunk_count_cap() {
        // 8 GiB at 1 MiB would be 8192 chunks; cap to 4096
        let size = 8 * 1024 * MIB;
        let chunks = plan_chunks(size, &aria2_config());
        assert_eq!(chunks.len(), 4096);
        assert!(plan_is_valid(&chunks, size));
    }

    #[test]
    fn test_zero_byte_file() {
        let chunks = plan_chunks(0, &default_config());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size, 0);
        assert!(plan_is_valid(&chunks, 0));
    }

    #[test]
    fn test_plan_is_valid_rejects_gaps() {
        let mut chunks = plan_chunks(10 * MIB, &default_config());
        chunks[1].offset += 1;
        assert!(!plan_is_valid(&chunks, 10 * MIB));
    }

    #[test]
    fn test_plan_is_valid_rejects_bad_sum() {
        let chunks = plan_chunks(10 * MIB, &default_config());
        assert!(!plan_is_valid(&chunks, 10 * MIB + 1));
    }

    #[test]
    fn test_status_serialization() {
        let chunk = Chunk {
            status: ChunkStatus::InProgress,
            ..Chunk::new(3, 0, 64)
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains("\"in_progress\""));

        let back: Chunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, ChunkStatus::InProgress);
    }
}
