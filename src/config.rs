//! Runtime configuration for a [`crate::CollectiveAllocator`].
//!
//! The engine constructor itself only ever needs a plain `usize` (the
//! purely-local capacity, spec §6); this module is a convenience for callers
//! that would rather keep that number in a JSON config file alongside the
//! rest of their application configuration.

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::CollectiveAllocator`] engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarMallocConfig {
    /// Byte ceiling for the purely-local subspace (spec §4.3's `Custom`
    /// policy ceiling for `PurelyLocalCustom`).
    pub purely_local_capacity_bytes: usize,
}

impl FarMallocConfig {
    /// Parses a config from a JSON string.
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("failed to parse FarMalloc configuration")
    }

    /// Reads and parses a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read FarMalloc config at {}", path.display()))?;
        Self::from_json(&text)
    }

    /// The purely-local capacity this config implies, in bytes.
    #[must_use]
    pub fn into_capacity(self) -> usize {
        self.purely_local_capacity_bytes
    }
}
