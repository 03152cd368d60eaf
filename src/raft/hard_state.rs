//! Persistent `current_term` / `voted_for`
//!
//! Stored as bincode followed by a CRC32, replaced atomically on every change.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::{atomic_write, crc32, Error, Result};

use super::NodeId;

const HARD_STATE_FILE: &str = "hard_state";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

#[derive(Debug)]
pub struct HardStateStore {
    path: PathBuf,
}

impl HardStateStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(HARD_STATE_FILE),
        }
    }

    /// Load the saved state, or the default for a fresh node
    pub fn load(&self) -> Result<HardState> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HardState::default()),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < 4 {
            return Err(Error::Corrupted("hard state too short".into()));
        }
        let (body, checksum) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
        if crc32(body) != stored {
            return Err(Error::Corrupted("hard state checksum mismatch".into()));
        }
        Ok(bincode::deserialize(body)?)
    }

    pub fn save(&self, state: &HardState) -> Result<()> {
        let mut bytes = bincode::serialize(state)?;
        let checksum = crc32(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());
        atomic_write(&self.path, &bytes)
    }
}
