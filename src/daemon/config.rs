use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use dump_core::config::SectionConfig;

const DEFAULT_CONFIG_FILE: &str = "/etc/profiled/profiled.ini";
const DEFAULT_PINNED_MAPS_PATH: &str = "/sys/fs/bpf/profiled";

/// Section for the settings of the daemon itself.
pub const GENERAL_SECTION: &str = "general";

/// Daemon configuration, parsed from an `INI` file with one section per
/// component.
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    sections: HashMap<String, SectionConfig>,
}

impl DaemonConfig {
    /// Loads the default file. A missing default file means an empty
    /// configuration.
    pub fn new() -> Result<Self> {
        let config_file = Path::new(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            log::debug!("{DEFAULT_CONFIG_FILE} not found, using default configuration");
            return Ok(Self::default());
        }
        Self::from_config_file(config_file)
    }

    /// Loads a custom file, which must exist.
    pub fn with_custom_file(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(config_file)
    }

    fn from_config_file(config_file: &Path) -> Result<Self> {
        let mut sections: HashMap<String, SectionConfig> = HashMap::new();

        let conf = ini::Ini::load_from_file(config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;

        for (section, prop) in &conf {
            if let Some(section) = section {
                let section_config = sections.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    section_config.insert(key.to_string(), value.to_string());
                }
            }
        }

        Ok(Self { sections })
    }

    /// Configuration of a section, empty when the file doesn't have it.
    pub fn section(&self, name: &str) -> SectionConfig {
        self.sections.get(name).cloned().unwrap_or_default()
    }

    /// Directory holding the filter tables pinned by the probes.
    pub fn pinned_maps_path(&self) -> Result<PathBuf> {
        Ok(self
            .section(GENERAL_SECTION)
            .with_default("pinned_maps_path", PathBuf::from(DEFAULT_PINNED_MAPS_PATH))?)
    }
}
