use crate::consts::CONFIG_FILE;
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Store tuning, read from `quadra.json` in the store directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Rows the sorter buffers before spilling a run file.
    pub sort_buffer_rows: usize,
    pub bloom_bits: u32,
    pub bloom_k: u32,
    /// fsync segments and the directory on publish.
    pub sync_writes: bool,
    pub compress_backups: bool,
    /// Committed phases kept per participant; at least 2.
    pub retained_phases: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sort_buffer_rows: 64 * 1024,
            bloom_bits: 1 << 20,
            bloom_k: 7,
            sync_writes: true,
            compress_backups: false,
            retained_phases: 2,
        }
    }
}

impl StoreConfig {
    /// Missing file means defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let p = dir.join(CONFIG_FILE);
        if !p.exists() {
            return Ok(Self::default());
        }
        let s = fs::read_to_string(p)?;
        let mut cfg: StoreConfig = serde_json::from_str(&s)?;
        cfg.normalize();
        Ok(cfg)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let p = dir.join(CONFIG_FILE);
        let tmp = dir.join(format!("{CONFIG_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, &p)?;
        Ok(())
    }

    fn normalize(&mut self) {
        self.retained_phases = self.retained_phases.max(2);
        self.sort_buffer_rows = self.sort_buffer_rows.max(1);
        self.bloom_k = self.bloom_k.max(1);
    }
}
