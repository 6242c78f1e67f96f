use crate::protocol::TransferProtocol;
use crate::{Result, TransferError};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub transfer: TransferSettings,
    pub storage: StorageSettings,
    pub engine: EngineSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    pub max_simultaneous_downloads: usize,
    pub max_simultaneous_uploads: usize,
    /// Transports to try, most preferred first.
    pub protocol_preference: Vec<TransferProtocol>,
    /// Priority a failed download is requeued at.
    pub requeue_priority: i32,
    pub stall_timeout_secs: u64,
    pub max_stall_retries: u32,
    pub upload_idle_timeout_secs: u64,
    /// Upper bound on buckets handed to one peer per request.
    pub max_segment_buckets: u32,
    pub max_flush_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub download_dir: PathBuf,
    pub container_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    pub command_buffer: usize,
    pub tick_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = ProjectDirs::from("com", "fileshare", "transfer")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            transfer: TransferSettings::default(),
            storage: StorageSettings {
                download_dir: data_dir.join("downloads"),
                container_dir: data_dir.join("containers"),
            },
            engine: EngineSettings {
                command_buffer: 1024,
                tick_interval_ms: 1000,
            },
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_simultaneous_downloads: 3,
            max_simultaneous_uploads: 20,
            protocol_preference: vec![
                TransferProtocol::Basic,
                TransferProtocol::Utp,
                TransferProtocol::Fec,
                TransferProtocol::Failsafe,
            ],
            requeue_priority: 3,
            stall_timeout_secs: 30,
            max_stall_retries: 3,
            upload_idle_timeout_secs: 60,
            max_segment_buckets: 16,
            max_flush_failures: 3,
        }
    }
}

impl TransferSettings {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn upload_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_idle_timeout_secs)
    }
}

impl Settings {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = match config_path {
            Some(path) => PathBuf::from(path),
            None => Self::default_config_path()?,
        };

        let settings = if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| TransferError::Config(format!("Failed to read config: {}", e)))?;
            toml::from_str::<Settings>(&content)?
        } else {
            let settings = Self::default();
            settings.save(Some(&path))?;
            settings
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let path = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                TransferError::Config(format!("Failed to create config dir: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)
            .map_err(|e| TransferError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.transfer;
        if t.max_simultaneous_downloads == 0 || t.max_simultaneous_uploads == 0 {
            return Err(TransferError::Config(
                "slot maxima must be at least 1".to_string(),
            ));
        }
        if t.protocol_preference.is_empty() {
            return Err(TransferError::Config(
                "protocol_preference must name at least one protocol".to_string(),
            ));
        }
        if t.max_segment_buckets == 0 {
            return Err(TransferError::Config(
                "max_segment_buckets must be at least 1".to_string(),
            ));
        }
        if self.engine.command_buffer == 0 {
            return Err(TransferError::Config(
                "command_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "fileshare", "transfer").ok_or_else(|| {
            TransferError::Config("Failed to get project directories".to_string())
        })?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}
