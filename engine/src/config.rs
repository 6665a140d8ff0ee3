//! Declarative device table consumed from the control plane.
//!
//! The table is stored as TOML. Each entry names a target id, a LUN and the
//! attach-time options of §6.3; the device type may be given explicitly or
//! derived from the image file extension.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::controller::manager::ControllerManager;
use crate::devices::factory;
use crate::devices::DeviceType;

/// Full emulator configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Devices to attach at startup
    pub devices: Vec<DeviceDefinition>,
}

/// One device table entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceDefinition {
    /// Target id (0..=7)
    pub id: u8,
    /// Logical unit number
    pub lun: u8,
    /// Device type; derived from the file extension when omitted
    #[serde(rename = "type")]
    pub device_type: Option<DeviceType>,
    /// Backing image path (storage devices)
    pub file: Option<PathBuf>,
    /// Sector size override
    pub block_size: Option<u32>,
    /// INQUIRY vendor override
    pub vendor: Option<String>,
    /// INQUIRY product override
    pub product: Option<String>,
    /// INQUIRY revision override
    pub revision: Option<String>,
    /// Additional type-specific options (printer `cmd`, DaynaPort
    /// `interface`, ...)
    pub params: BTreeMap<String, String>,
}

impl Default for DeviceDefinition {
    fn default() -> Self {
        Self {
            id: 0,
            lun: 0,
            device_type: None,
            file: None,
            block_size: None,
            vendor: None,
            product: None,
            revision: None,
            params: BTreeMap::new(),
        }
    }
}

impl DeviceDefinition {
    /// The explicit device type, or the one implied by the image file
    pub fn resolved_type(&self) -> Option<DeviceType> {
        self.device_type
            .or_else(|| self.file.as_deref().and_then(factory::device_type_for_file))
    }

    /// Collapse the definition into the factory's option map
    fn factory_params(&self) -> factory::DeviceParams {
        let mut params = self.params.clone();
        if let Some(file) = &self.file {
            params.insert("file".to_string(), file.to_string_lossy().into_owned());
        }
        if let Some(size) = self.block_size {
            params.insert("block_size".to_string(), size.to_string());
        }
        for (key, value) in [
            ("vendor", &self.vendor),
            ("product", &self.product),
            ("revision", &self.revision),
        ] {
            if let Some(value) = value {
                params.insert(key.to_string(), value.clone());
            }
        }
        params
    }
}

/// Error type for configuration file operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    ReadError(#[from] io::Error),

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Default configuration directory, honoring XDG conventions
pub fn config_dir() -> PathBuf {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config).join("retroscsi")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("retroscsi")
    } else {
        PathBuf::from(".config").join("retroscsi")
    }
}

/// Default configuration file path
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load a configuration; a missing file yields the default configuration
pub fn load_config_from(path: &Path) -> Result<EmulatorConfig, ConfigError> {
    if !path.exists() {
        return Ok(EmulatorConfig::default());
    }

    let contents = std::fs::read_to_string(path)?;
    let config: EmulatorConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Save a configuration, creating the parent directory if needed
pub fn save_config_to(config: &EmulatorConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Create and attach every configured device
pub fn attach_all(config: &EmulatorConfig, manager: &mut ControllerManager) -> Result<()> {
    for definition in &config.devices {
        let device_type = definition.resolved_type().with_context(|| {
            format!(
                "device {}:{} has no type and none can be derived from its file",
                definition.id, definition.lun
            )
        })?;

        let device = factory::create_device(device_type, definition.lun, &definition.factory_params())
            .with_context(|| format!("cannot create device {}:{}", definition.id, definition.lun))?;

        manager.attach(definition.id, device)?;
    }
    Ok(())
}
