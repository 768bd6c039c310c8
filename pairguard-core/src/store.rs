//! Config directory persistence
//! Loads and saves the system config and the per-machine boundary files written by the
//! boundary training tool.

use crate::config::SystemConfig;
use crate::error::{Error, Result};
use crate::types::MachineId;
use crate::zones::{empty_boundaries, BoundaryMap, ZoneSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// On-disk encoding, picked from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

/// Owns the config file and the boundary files stored next to it
#[derive(Debug, Clone)]
pub struct ConfigStore {
    config_path: PathBuf,
    boundary_dir: PathBuf,
}

impl ConfigStore {
    /// Boundary files live in the same directory as the config file
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        let config_path = config_path.into();
        let boundary_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            config_path,
            boundary_dir,
        }
    }

    pub fn with_boundary_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.boundary_dir = dir.into();
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn boundary_path(&self, machine: MachineId) -> PathBuf {
        self.boundary_dir
            .join(format!("machine{}_boundaries.json", machine.0))
    }

    /// Load the system config. A missing file is replaced by the default configuration,
    /// which is written out and returned.
    pub fn load(&self) -> Result<SystemConfig> {
        if !self.config_path.exists() {
            warn!(
                "Config file {} not found, writing default configuration",
                self.config_path.display()
            );
            let config = SystemConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let text = fs::read_to_string(&self.config_path)?;
        let config: SystemConfig = match ConfigFormat::from_path(&self.config_path) {
            ConfigFormat::Json => serde_json::from_str(&text)?,
            ConfigFormat::Toml => toml::from_str(&text)?,
        };
        config.validate()?;
        info!(
            "Loaded configuration from {} ({} machines)",
            self.config_path.display(),
            config.machines.len()
        );
        Ok(config)
    }

    pub fn save(&self, config: &SystemConfig) -> Result<()> {
        let text = match ConfigFormat::from_path(&self.config_path) {
            ConfigFormat::Json => serde_json::to_string_pretty(config)?,
            ConfigFormat::Toml => toml::to_string_pretty(config)?,
        };
        write_file(&self.config_path, &text)
    }

    /// Raw boundary map for a machine, `None` if no file exists yet
    pub fn load_boundaries(&self, machine: MachineId) -> Result<Option<BoundaryMap>> {
        let path = self.boundary_path(machine);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    pub fn save_boundaries(&self, machine: MachineId, map: &BoundaryMap) -> Result<()> {
        let text = serde_json::to_string_pretty(map)?;
        write_file(&self.boundary_path(machine), &text)?;
        info!("M{}: boundaries saved", machine);
        Ok(())
    }

    /// Load and check a machine's complete zone set. When no boundary file exists an empty
    /// template is written so the training tool has something to fill in.
    pub fn load_zone_set(&self, machine: MachineId, config: &SystemConfig) -> Result<ZoneSet> {
        let keys = config.classes.boundary_keys();
        let map = match self.load_boundaries(machine)? {
            Some(map) => map,
            None => {
                let template = empty_boundaries(config.pairs_per_machine, keys);
                self.save_boundaries(machine, &template)?;
                return Err(Error::InvalidMachine {
                    machine,
                    reason: format!(
                        "no boundaries trained yet, template written to {}",
                        self.boundary_path(machine).display()
                    ),
                });
            }
        };
        ZoneSet::from_boundaries(&map, config.pairs_per_machine, keys).map_err(|e| {
            Error::InvalidMachine {
                machine,
                reason: e.to_string(),
            }
        })
    }

    pub fn save_zone_set(&self, machine: MachineId, zones: &ZoneSet, config: &SystemConfig) -> Result<()> {
        self.save_boundaries(machine, &zones.to_boundaries(config.classes.boundary_keys()))
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    // write to a sibling temp file first so readers never see a half-written file
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
