//! Size-bounded shard files, one writer per entity kind.
//!
//! Records are buffered in insertion order. When the buffer reaches
//! [`SHARD_CAPACITY`] it is written as a pretty-printed JSON array to
//! `<plural>_<NNNNNN>.json` (1-based, zero-padded) and cleared. `close()`
//! flushes whatever is left.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::models::EntityKind;

/// Maximum records per shard file.
pub const SHARD_CAPACITY: usize = 100;

#[derive(Debug)]
pub struct ShardWriter {
    dir: PathBuf,
    prefix: String,
    buffer: Vec<Value>,
    seq: u32,
    written: u64,
}

impl ShardWriter {
    pub fn new(dir: &Path, kind: EntityKind) -> Self {
        Self {
            dir: dir.to_path_buf(),
            prefix: kind.plural(),
            buffer: Vec::with_capacity(SHARD_CAPACITY),
            seq: 0,
            written: 0,
        }
    }

    pub fn add(&mut self, record: Value) -> Result<()> {
        self.buffer.push(record);
        self.written += 1;
        if self.buffer.len() >= SHARD_CAPACITY {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush a non-empty partial buffer.
    pub fn close(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.flush()?;
        }
        Ok(())
    }

    /// Records added so far, flushed or not.
    pub fn records(&self) -> u64 {
        self.written
    }

    /// Shard files written so far.
    pub fn shards(&self) -> u32 {
        self.seq
    }

    /// The sequence number only advances once the shard is on disk.
    fn flush(&mut self) -> Result<()> {
        let seq = self.seq + 1;
        let path = self.dir.join(shard_file_name(&self.prefix, seq));
        let json = serde_json::to_string_pretty(&self.buffer)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write shard: {}", path.display()))?;
        self.seq = seq;
        self.buffer.clear();
        Ok(())
    }
}

pub fn shard_file_name(prefix: &str, seq: u32) -> String {
    format!("{}_{:06}.json", prefix, seq)
}
