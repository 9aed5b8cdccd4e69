//! Allocator configuration
//!
//! Values come from (lowest to highest precedence): built-in defaults, an
//! optional TOML file, and `SLOTHEAP__*` environment variables.
//!
//! ```toml
//! block_capacity = 3145728
//! slot_count = 16384
//! ```

use crate::error::{Error, Result};
use crate::storage::slab::layout::{ALIGNMENT, MIN_SEGMENT_SIZE};
use crate::storage::slab::SLOT_COUNT;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Default usable bytes per block (3 MiB)
pub const DEFAULT_BLOCK_CAPACITY: usize = 3 * 1024 * 1024;

/// Largest accepted block capacity; segment sizes must fit a header word
/// with the three flag bits masked off, and offsets must fit `u32`.
pub const MAX_BLOCK_CAPACITY: usize = 1 << 29;

/// Allocator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Usable bytes per block, excluding the two sentinel words
    pub block_capacity: usize,
    /// Number of hash slots in the slot table
    pub slot_count: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            slot_count: SLOT_COUNT,
        }
    }
}

impl AllocatorConfig {
    /// Configuration with a custom block capacity and the full slot table
    pub fn with_block_capacity(block_capacity: usize) -> Self {
        Self {
            block_capacity,
            ..Self::default()
        }
    }

    /// Load configuration from an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = ?path, "Loading allocator configuration");
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(::config::Environment::with_prefix("SLOTHEAP").separator("__"));

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        debug!(?cfg, "Effective allocator configuration");
        Ok(cfg)
    }

    /// Check the layout constraints the allocator relies on
    pub fn validate(&self) -> Result<()> {
        if self.block_capacity % ALIGNMENT != 0 {
            return Err(Error::InvalidConfig(format!(
                "block_capacity {} is not a multiple of {}",
                self.block_capacity, ALIGNMENT
            )));
        }
        if self.block_capacity < MIN_SEGMENT_SIZE {
            return Err(Error::InvalidConfig(format!(
                "block_capacity {} is below the minimum segment size {}",
                self.block_capacity, MIN_SEGMENT_SIZE
            )));
        }
        if self.block_capacity > MAX_BLOCK_CAPACITY {
            return Err(Error::InvalidConfig(format!(
                "block_capacity {} exceeds {}",
                self.block_capacity, MAX_BLOCK_CAPACITY
            )));
        }
        if self.slot_count == 0 || self.slot_count > SLOT_COUNT {
            return Err(Error::InvalidConfig(format!(
                "slot_count must be within 1..={}, got {}",
                SLOT_COUNT, self.slot_count
            )));
        }
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(format!("Failed to render config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() -> Result<()> {
        let cfg = AllocatorConfig::default();
        cfg.validate()?;
        assert_eq!(cfg.block_capacity, 3_145_728);
        assert_eq!(cfg.slot_count, 16384);
        Ok(())
    }

    #[test]
    fn test_rejects_unaligned_capacity() {
        let cfg = AllocatorConfig::with_block_capacity(130);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_tiny_capacity() {
        let cfg = AllocatorConfig::with_block_capacity(16);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_slot_count() {
        let cfg = AllocatorConfig {
            slot_count: 0,
            ..AllocatorConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = AllocatorConfig {
            slot_count: SLOT_COUNT + 1,
            ..AllocatorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("slotheap_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("slotheap.toml");
        std::fs::write(&path, "block_capacity = 4096\nslot_count = 8\n")?;

        let cfg = AllocatorConfig::load(Some(&path))?;
        assert_eq!(cfg.block_capacity, 4096);
        assert_eq!(cfg.slot_count, 8);

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }

    #[test]
    fn test_toml_round_trip() -> Result<()> {
        let cfg = AllocatorConfig::with_block_capacity(1024);
        let text = cfg.to_toml()?;
        assert!(text.contains("block_capacity = 1024"));
        let parsed: AllocatorConfig = toml::from_str(&text)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        assert_eq!(parsed, cfg);
        Ok(())
    }
}
