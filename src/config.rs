use std::{
    fs,
    path::{Path, PathBuf},
};

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::GpioError;
use crate::sysfs::SYSFS_GPIO_ROOT;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ControllerConfig {
    /// Root of the kernel's GPIO control filesystem.
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
    /// Pin numbers the host permits allocating.
    #[serde(default)]
    pub valid_pins: FxHashSet<u32>,
    /// Upper bound on one blocking wait, so teardown is observed promptly.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sysfs_root: default_sysfs_root(),
            valid_pins: FxHashSet::default(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

impl ControllerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))
    }
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from(SYSFS_GPIO_ROOT)
}

fn default_wait_timeout_ms() -> u64 {
    1000
}
