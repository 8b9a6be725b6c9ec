use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::rolling_hash::RollingHash;
use super::{DeltaEngine, EngineError};

pub const DEFAULT_BLOCK_SIZE: usize = 4096;

const MAGIC: &[u8; 8] = b"TPDELTA1";
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum DeltaOp {
    Copy { offset: u64, length: u64 },
    Insert { data: Vec<u8> },
}

#[derive(Debug, Serialize, Deserialize)]
struct DeltaBody {
    source_len: u64,
    target_len: u64,
    ops: Vec<DeltaOp>,
}

struct BlockSignature {
    weak: u32,
    strong: blake3::Hash,
    offset: usize,
}

/// rsync-style engine: fixed blocks of the old bytes are indexed by a weak
/// rolling hash and confirmed with BLAKE3; the new bytes become a sequence
/// of copies from old plus literal inserts.
///
/// Blob layout: `TPDELTA1` followed by zstd-compressed bincode of the op list.
#[derive(Debug, Clone)]
pub struct BlockEngine {
    block_size: usize,
}

impl Default for BlockEngine {
    fn default() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }
}

impl BlockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    fn compute_ops(&self, old: &[u8], new: &[u8]) -> Vec<DeltaOp> {
        if new.is_empty() {
            return Vec::new();
        }
        if old.len() < self.block_size || new.len() < self.block_size {
            return vec![DeltaOp::Insert { data: new.to_vec() }];
        }

        let signatures = self.signatures(old);
        let mut table: HashMap<u32, Vec<usize>> = HashMap::with_capacity(signatures.len());
        for (idx, sig) in signatures.iter().enumerate() {
            table.entry(sig.weak).or_default().push(idx);
        }

        let bs = self.block_size;
        let mut ops: Vec<DeltaOp> = Vec::new();
        let mut literal: Vec<u8> = Vec::new();
        let mut rolling = RollingHash::over(&new[..bs]);
        let mut pos = 0usize;

        while pos + bs <= new.len() {
            let window = &new[pos..pos + bs];
            let matched = table.get(&rolling.value()).and_then(|candidates| {
                let strong = blake3::hash(window);
                candidates
                    .iter()
                    .map(|&idx| &signatures[idx])
                    .find(|sig| sig.strong == strong)
                    .map(|sig| sig.offset)
            });

            match matched {
                Some(offset) => {
                    if !literal.is_empty() {
                        ops.push(DeltaOp::Insert {
                            data: std::mem::take(&mut literal),
                        });
                    }
                    push_copy(&mut ops, offset as u64, bs as u64);
                    pos += bs;
                    if pos + bs <= new.len() {
                        rolling = RollingHash::over(&new[pos..pos + bs]);
                    }
                }
                None => {
                    literal.push(new[pos]);
                    pos += 1;
                    if pos + bs <= new.len() {
                        rolling.roll(new[pos - 1], new[pos + bs - 1]);
                    }
                }
            }
        }

        literal.extend_from_slice(&new[pos..]);
        if !literal.is_empty() {
            ops.push(DeltaOp::Insert { data: literal });
        }
        ops
    }

    /// Signatures of every full block of `old`. A trailing partial block can
    /// never match a full window, so it is left out.
    fn signatures(&self, old: &[u8]) -> Vec<BlockSignature> {
        old.chunks_exact(self.block_size)
            .enumerate()
            .map(|(i, block)| BlockSignature {
                weak: RollingHash::over(block).value(),
                strong: blake3::hash(block),
                offset: i * self.block_size,
            })
            .collect()
    }
}

/// Append a copy, merging it into the previous one when the ranges touch.
fn push_copy(ops: &mut Vec<DeltaOp>, offset: u64, length: u64) {
    if let Some(DeltaOp::Copy {
        offset: prev_offset,
        length: prev_length,
    }) = ops.last_mut()
    {
        if *prev_offset + *prev_length == offset {
            *prev_length += length;
            return;
        }
    }
    ops.push(DeltaOp::Copy { offset, length });
}

/// Rebuild the target. Output grows with the ops actually applied, never
/// past the declared `target_len`.
fn replay(old: &[u8], body: &DeltaBody) -> Result<Vec<u8>, EngineError> {
    let mut out = Vec::new();
    for op in &body.ops {
        let op_len = match op {
            DeltaOp::Copy { length, .. } => *length,
            DeltaOp::Insert { data } => data.len() as u64,
        };
        if (out.len() as u64).saturating_add(op_len) > body.target_len {
            return Err(EngineError::Malformed(format!(
                "ops overrun the declared {}-byte target",
                body.target_len
            )));
        }
        match op {
            DeltaOp::Copy { offset, length } => {
                let start = *offset as usize;
                let end = start
                    .checked_add(*length as usize)
                    .filter(|&end| end <= old.len())
                    .ok_or_else(|| {
                        EngineError::Malformed(format!(
                            "copy {offset}+{length} exceeds source of {} bytes",
                            old.len()
                        ))
                    })?;
                out.extend_from_slice(&old[start..end]);
            }
            DeltaOp::Insert { data } => out.extend_from_slice(data),
        }
    }
    Ok(out)
}

impl DeltaEngine for BlockEngine {
    fn name(&self) -> &str {
        "block"
    }

    fn diff(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>, EngineError> {
        let body = DeltaBody {
            source_len: old.len() as u64,
            target_len: new.len() as u64,
            ops: self.compute_ops(old, new),
        };
        let encoded =
            bincode::serialize(&body).map_err(|e| EngineError::Malformed(e.to_string()))?;
        let compressed = zstd::bulk::compress(&encoded, ZSTD_LEVEL)?;

        let mut blob = Vec::with_capacity(MAGIC.len() + compressed.len());
        blob.extend_from_slice(MAGIC);
        blob.extend_from_slice(&compressed);
        Ok(blob)
    }

    fn apply(&self, old: &[u8], delta: &[u8]) -> Result<Vec<u8>, EngineError> {
        if delta.len() < MAGIC.len() || &delta[..MAGIC.len()] != MAGIC {
            return Err(EngineError::Malformed("missing TPDELTA1 header".into()));
        }
        let decoder = zstd::Decoder::new(&delta[MAGIC.len()..])?;
        let body: DeltaBody = bincode::deserialize_from(decoder)
            .map_err(|e| EngineError::Malformed(e.to_string()))?;

        if body.source_len != old.len() as u64 {
            return Err(EngineError::Malformed(format!(
                "delta expects a {}-byte source, got {} bytes",
                body.source_len,
                old.len()
            )));
        }
        let out = replay(old, &body)?;
        if out.len() as u64 != body.target_len {
            return Err(EngineError::Malformed(format!(
                "reconstructed {} bytes, delta declares {}",
                out.len(),
                body.target_len
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: usize = 64;

    fn round_trip(old: &[u8], new: &[u8]) -> Vec<DeltaOp> {
        let engine = BlockEngine::with_block_size(BS);
        let blob = engine.diff(old, new).unwrap();
        assert_eq!(engine.apply(old, &blob).unwrap(), new);
        engine.compute_ops(old, new)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 253) as u8).collect()
    }

    #[test]
    fn test_identical_data_is_one_copy() {
        let data = patterned(BS * 5);
        let ops = round_trip(&data, &data);
        assert_eq!(
            ops,
            vec![DeltaOp::Copy {
                offset: 0,
                length: (BS * 5) as u64
            }]
        );
    }

    #[test]
    fn test_completely_different() {
        round_trip(&vec![0u8; BS * 2], &vec![1u8; BS * 2]);
    }

    #[test]
    fn test_prefix_changed_reuses_tail() {
        let old = patterned(BS * 4);
        let mut new = old.clone();
        new[..BS].iter_mut().for_each(|b| *b = 0xFF);
        let ops = round_trip(&old, &new);
        assert!(ops.iter().any(|op| matches!(
            op,
            DeltaOp::Copy { offset, length } if *offset == BS as u64 && *length == (BS * 3) as u64
        )));
    }

    #[test]
    fn test_insertion_in_middle() {
        let old = patterned(BS * 4);
        let mut new = old.clone();
        new.splice(BS * 2..BS * 2, vec![0xAA; 17]);
        let ops = round_trip(&old, &new);
        let copied: u64 = ops
            .iter()
            .map(|op| match op {
                DeltaOp::Copy { length, .. } => *length,
                DeltaOp::Insert { .. } => 0,
            })
            .sum();
        assert_eq!(copied, (BS * 4) as u64);
    }

    #[test]
    fn test_empty_old_rebuilds_from_nothing() {
        let new = patterned(BS * 3 + 5);
        let ops = round_trip(&[], &new);
        assert_eq!(ops, vec![DeltaOp::Insert { data: new }]);
    }

    #[test]
    fn test_empty_new_and_both_empty() {
        round_trip(&patterned(100), &[]);
        let engine = BlockEngine::with_block_size(BS);
        let blob = engine.diff(&[], &[]).unwrap();
        assert!(!blob.is_empty());
        assert!(engine.apply(&[], &blob).unwrap().is_empty());
    }

    #[test]
    fn test_small_files() {
        round_trip(b"Hello, World!", b"Hello, Rust!");
    }

    #[test]
    fn test_wrong_source_is_rejected() {
        let engine = BlockEngine::with_block_size(BS);
        let old = patterned(BS * 2);
        let blob = engine.diff(&old, &patterned(BS * 3)).unwrap();
        assert!(matches!(
            engine.apply(&old[..BS], &blob),
            Err(EngineError::Malformed(_))
        ));
    }

    #[test]
    fn test_garbage_blob_is_rejected() {
        let engine = BlockEngine::new();
        assert!(engine.apply(b"", b"nope").is_err());
        assert!(engine.apply(b"", b"TPDELTA1garbage").is_err());
    }

    #[test]
    fn test_out_of_range_copy_is_error_not_panic() {
        let body = DeltaBody {
            source_len: 4,
            target_len: 8,
            ops: vec![DeltaOp::Copy {
                offset: 2,
                length: 8,
            }],
        };
        assert!(matches!(
            replay(b"abcd", &body),
            Err(EngineError::Malformed(_))
        ));
    }

    #[test]
    fn test_huge_declared_target_is_error_not_abort() {
        let body = DeltaBody {
            source_len: 0,
            target_len: u64::MAX,
            ops: vec![DeltaOp::Insert {
                data: b"tiny".to_vec(),
            }],
        };
        let encoded = bincode::serialize(&body).unwrap();
        let mut blob = MAGIC.to_vec();
        blob.extend_from_slice(&zstd::bulk::compress(&encoded, ZSTD_LEVEL).unwrap());
        assert!(matches!(
            BlockEngine::new().apply(b"", &blob),
            Err(EngineError::Malformed(_))
        ));
    }

    #[test]
    fn test_ops_longer_than_target_are_rejected() {
        let body = DeltaBody {
            source_len: 0,
            target_len: 2,
            ops: vec![DeltaOp::Insert {
                data: b"three".to_vec(),
            }],
        };
        assert!(matches!(replay(b"", &body), Err(EngineError::Malformed(_))));
    }
}
