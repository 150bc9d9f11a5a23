use super::types::{ConfigFile, CONFIG_TEMPLATE};
use crate::error::Result;
use std::path::Path;

/// Parse a config.yaml file into a ConfigFile
pub fn parse_config(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse a config YAML string into a ConfigFile
pub fn parse_config_str(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = serde_yaml::from_str(content)?;
    Ok(config)
}

/// Parse the config at `path`, writing the default template there first if
/// the file does not exist yet.
pub fn load_or_init(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, CONFIG_TEMPLATE)?;
        log::info!("Wrote default config to {}", path.display());
    }
    parse_config(path)
}
