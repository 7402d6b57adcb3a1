//! Monitor configuration management

use anyhow::{Context, Result, anyhow};
use bridge::TransferShape;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub monitor: MonitorSettings,
    /// Transfers to run against the device
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub log_level: String,
    /// Device to open, as `0xVVVV:0xPPPP`
    #[serde(default)]
    pub device: Option<String>,
    /// Stop after this many seconds (None = until done or Ctrl-C)
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Control,
    Interrupt,
    Bulk,
}

/// One transfer, submitted `repeat` times in a row
///
/// # Example Configuration
/// ```toml
/// [[jobs]]
/// name = "device-descriptor"
/// kind = "control"
/// request_type = 0x80
/// request = 0x06
/// value = 0x0100
/// length = 18
///
/// [[jobs]]
/// name = "hid-reports"
/// kind = "interrupt"
/// endpoint = 0x81
/// length = 8
/// repeat = 100
/// timeout_ms = 250
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub kind: JobKind,
    /// Endpoint address for interrupt and bulk jobs; bit 7 set means IN
    #[serde(default)]
    pub endpoint: Option<u8>,
    /// Bytes to read for IN transfers; wLength for control
    #[serde(default)]
    pub length: usize,
    /// Payload for OUT transfers
    #[serde(default)]
    pub data: Vec<u8>,
    /// Transfer timeout (0 = no timeout)
    #[serde(default = "JobConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "JobConfig::default_repeat")]
    pub repeat: u32,

    // Control setup fields
    #[serde(default)]
    pub request_type: u8,
    #[serde(default)]
    pub request: u8,
    #[serde(default)]
    pub value: u16,
    #[serde(default)]
    pub index: u16,
}

impl JobConfig {
    fn default_timeout_ms() -> u64 {
        1000
    }

    fn default_repeat() -> u32 {
        1
    }

    pub fn shape(&self) -> TransferShape {
        let endpoint = self.endpoint.unwrap_or(0);
        match self.kind {
            JobKind::Control => TransferShape::Control,
            JobKind::Interrupt => TransferShape::Interrupt { endpoint },
            JobKind::Bulk => TransferShape::Bulk { endpoint },
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn is_in(&self) -> bool {
        match self.kind {
            JobKind::Control => self.request_type & 0x80 != 0,
            JobKind::Interrupt | JobKind::Bulk => self.endpoint.unwrap_or(0) & 0x80 != 0,
        }
    }

    /// Buffer for one submission of this job
    pub fn buffer(&self) -> Vec<u8> {
        match self.kind {
            JobKind::Control => {
                let length = if self.is_in() {
                    self.length
                } else {
                    self.data.len().max(self.length)
                };
                bridge::libusb::control_buffer(
                    self.request_type,
                    self.request,
                    self.value,
                    self.index,
                    u16::try_from(length).unwrap_or(u16::MAX),
                    &self.data,
                )
            }
            JobKind::Interrupt | JobKind::Bulk if self.is_in() => vec![0; self.length],
            JobKind::Interrupt | JobKind::Bulk => self.data.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(anyhow!("Job with empty name"));
        }
        if self.repeat == 0 {
            return Err(anyhow!("Job '{}': repeat must be at least 1", self.name));
        }

        match self.kind {
            JobKind::Control => {
                if self.endpoint.is_some() {
                    return Err(anyhow!(
                        "Job '{}': control jobs use the default pipe, remove 'endpoint'",
                        self.name
                    ));
                }
                if self.length > usize::from(u16::MAX) || self.data.len() > usize::from(u16::MAX) {
                    return Err(anyhow!(
                        "Job '{}': control data stage is limited to 65535 bytes",
                        self.name
                    ));
                }
                if self.is_in() && !self.data.is_empty() {
                    return Err(anyhow!(
                        "Job '{}': IN control request cannot carry 'data'",
                        self.name
                    ));
                }
            }
            JobKind::Interrupt | JobKind::Bulk => {
                let endpoint = self.endpoint.ok_or_else(|| {
                    anyhow!("Job '{}': {:?} jobs need an 'endpoint'", self.name, self.kind)
                })?;
                if endpoint & 0x0f == 0 || endpoint & 0x70 != 0 {
                    return Err(anyhow!(
                        "Job '{}': invalid endpoint address {:#04x}",
                        self.name,
                        endpoint
                    ));
                }
                if self.is_in() {
                    if self.length == 0 {
                        return Err(anyhow!(
                            "Job '{}': IN endpoint {:#04x} needs a non-zero 'length'",
                            self.name,
                            endpoint
                        ));
                    }
                    if !self.data.is_empty() {
                        return Err(anyhow!(
                            "Job '{}': IN endpoint {:#04x} cannot carry 'data'",
                            self.name,
                            endpoint
                        ));
                    }
                } else if self.data.is_empty() {
                    return Err(anyhow!(
                        "Job '{}': OUT endpoint {:#04x} needs 'data'",
                        self.name,
                        endpoint
                    ));
                }
            }
        }

        Ok(())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorSettings {
                log_level: "info".to_string(),
                device: None,
                duration_secs: None,
            },
            jobs: vec![JobConfig {
                name: "device-descriptor".to_string(),
                kind: JobKind::Control,
                endpoint: None,
                length: 18,
                data: Vec::new(),
                timeout_ms: JobConfig::default_timeout_ms(),
                repeat: 1,
                request_type: 0x80,
                request: 0x06,
                value: 0x0100,
                index: 0,
            }],
        }
    }
}

impl MonitorConfig {
    /// Load configuration from file
    ///
    /// Without a path, the default locations are tried in order.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-loop-monitor/monitor.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: MonitorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-loop-monitor").join("monitor.toml")
        } else {
            PathBuf::from(".config/usb-loop-monitor/monitor.toml")
        }
    }

    /// Parsed `monitor.device`, if set
    pub fn device_id(&self) -> Result<Option<(u16, u16)>> {
        self.monitor
            .device
            .as_deref()
            .map(parse_device_id)
            .transpose()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.monitor.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.monitor.log_level,
                valid_levels.join(", ")
            ));
        }

        self.device_id()?;

        if self.monitor.duration_secs == Some(0) {
            return Err(anyhow!("duration_secs must be greater than 0"));
        }

        for job in &self.jobs {
            job.validate()?;
        }
        for (i, job) in self.jobs.iter().enumerate() {
            if self.jobs[..i].iter().any(|other| other.name == job.name) {
                return Err(anyhow!("Duplicate job name '{}'", job.name));
            }
        }

        Ok(())
    }
}

/// Parse a `0xVVVV:0xPPPP` device id
pub fn parse_device_id(id: &str) -> Result<(u16, u16)> {
    let parts: Vec<&str> = id.split(':').collect();
    if parts.len() != 2 {
        return Err(anyhow!(
            "Invalid device '{}', expected VID:PID (e.g., '0x1234:0x5678')",
            id
        ));
    }

    Ok((
        parse_hex_id(parts[0], "VID")?,
        parse_hex_id(parts[1], "PID")?,
    ))
}

fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| {
            anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            )
        })?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}
