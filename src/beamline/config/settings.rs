use std::fs::File;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::beamline::common::{Error, Result};

/// Process-wide defaults applied to newly created beams.
#[derive(Deserialize, Clone, Debug)]
pub struct Settings {
    /// max_buf_size bounds the per-beam send-buffer memory in bytes. 0 means unbounded.
    #[serde(default = "default_max_buf_size")]
    max_buf_size: u64,
    /// timeout_ms bounds each blocking wait on a beam. 0 means wait forever.
    #[serde(default)]
    timeout_ms: u64,
    /// copy_files forces file chunks to be copied instead of borrowed across threads
    #[serde(default)]
    copy_files: bool,
    /// tx_mem_limits accounts transferred chunks by memory footprint instead of length
    #[serde(default)]
    tx_mem_limits: bool,
}

const fn default_max_buf_size() -> u64 {
    64 * 1024
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_buf_size: default_max_buf_size(),
            timeout_ms: 0,
            copy_files: false,
            tx_mem_limits: false,
        }
    }
}

impl Settings {
    pub fn max_buf_size(&self) -> u64 {
        self.max_buf_size
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn copy_files(&self) -> bool {
        self.copy_files
    }

    pub fn tx_mem_limits(&self) -> bool {
        self.tx_mem_limits
    }

    fn validate(&mut self) -> Result<()> {
        if self.max_buf_size > 1024 * 1024 * 1024 {
            return Err(Error::new("max_buf_size cannot be > 1GB"));
        }
        Ok(())
    }
}

/// Load beam settings from a YAML file, e.g. beamline.yaml.
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let file = File::open(path.as_ref())?;
    let mut settings: Settings = serde_yaml::from_reader(file)?;
    settings.validate()?;
    info!(path = %path.as_ref().to_string_lossy(), "loaded beam settings");
    Ok(settings)
}
