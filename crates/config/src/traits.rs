//! Loading and storing configuration files.

use eyre::WrapErr as _;
use serde::{de::DeserializeOwned, Serialize};
use std::{fs, path::Path};
use tracing::debug;

/// Read and write YAML configuration files.
pub trait ConfigTrait: Serialize + DeserializeOwned {
    /// Load `Self` from the YAML file at `path`.
    fn load_from_path<P: AsRef<Path>>(path: P) -> eyre::Result<Self> {
        let path = path.as_ref();
        debug!(target: "config", ?path, "loading config");
        let contents = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .wrap_err_with(|| format!("failed to parse config file {}", path.display()))
    }

    /// Write `self` as YAML to `path`, creating parent directories as needed.
    fn store_path<P: AsRef<Path>>(&self, path: P) -> eyre::Result<()> {
        let path = path.as_ref();
        debug!(target: "config", ?path, "storing config");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_yaml::to_string(self)?;
        fs::write(path, contents)
            .wrap_err_with(|| format!("failed to write config file {}", path.display()))
    }
}

impl ConfigTrait for crate::Parameters {}
