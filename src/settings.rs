//! Operator settings storage.
//!
//! Persists the platform credential and the site database descriptor to
//! `{working_dir}/.sitelink/settings.json`. Environment variables are used as initial
//! defaults when no settings file exists.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::db::DatabaseDescriptor;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("unknown settings key '{0}'")]
    UnknownKey(String),

    #[error("invalid value for '{key}': {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to persist settings: {0}")]
    Io(#[from] std::io::Error),
}

/// Operator-editable settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Bearer credential for the task platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Site database connection parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos_config: Option<DatabaseDescriptor>,
    /// Platform base URL override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_service_url: Option<String>,
}

impl Settings {
    /// Normalize empty strings to absent values.
    pub fn normalized(mut self) -> Self {
        self.api_key = non_empty(self.api_key);
        self.agent_service_url = non_empty(self.agent_service_url);
        self
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// In-memory store for settings with disk persistence.
#[derive(Debug)]
pub struct SettingsStore {
    settings: RwLock<Settings>,
    storage_path: PathBuf,
}

impl SettingsStore {
    /// Create a new settings store, loading from disk if available.
    ///
    /// If no settings file exists, uses environment variables as defaults:
    /// - `SITELINK_API_KEY` - platform credential
    pub async fn new(storage_path: PathBuf) -> Self {
        let settings = if storage_path.exists() {
            match Self::load_from_path(&storage_path).await {
                Ok(s) => {
                    tracing::info!("Loaded settings from {}", storage_path.display());
                    s
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to load settings from {}: {}, using defaults",
                        storage_path.display(),
                        e
                    );
                    Self::defaults_from_env()
                }
            }
        } else {
            tracing::info!(
                "No settings file found at {}, using environment defaults",
                storage_path.display()
            );
            Self::defaults_from_env()
        };

        Self {
            settings: RwLock::new(settings.normalized()),
            storage_path,
        }
    }

    fn defaults_from_env() -> Settings {
        Settings {
            api_key: std::env::var("SITELINK_API_KEY").ok(),
            ..Default::default()
        }
    }

    async fn load_from_path(path: &Path) -> Result<Settings, std::io::Error> {
        let contents = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    async fn save_to_disk(&self, settings: &Settings) -> Result<(), std::io::Error> {
        if let Some(parent) = self.storage_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = serde_json::to_string_pretty(settings)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        // Write then rename so a crash never leaves a half-written file.
        let tmp = self.storage_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.storage_path).await?;
        tracing::debug!("Saved settings to {}", self.storage_path.display());
        Ok(())
    }

    /// Get a clone of the current settings.
    pub async fn get(&self) -> Settings {
        self.settings.read().await.clone()
    }

    pub async fn api_key(&self) -> Option<String> {
        self.settings.read().await.api_key.clone()
    }

    /// Snapshot of the database descriptor; read once per task.
    pub async fn pos_config(&self) -> Option<DatabaseDescriptor> {
        self.settings.read().await.pos_config.clone()
    }

    pub async fn agent_service_url(&self) -> Option<String> {
        self.settings.read().await.agent_service_url.clone()
    }

    /// Replace all settings and persist them.
    pub async fn update(&self, new_settings: Settings) -> Result<(), SettingsError> {
        self.modify(|settings| {
            *settings = new_settings;
            Ok(())
        })
        .await
    }

    /// Edit the settings in place and persist, holding the write lock throughout.
    pub async fn modify<F>(&self, edit: F) -> Result<(), SettingsError>
    where
        F: FnOnce(&mut Settings) -> Result<(), SettingsError>,
    {
        let mut settings = self.settings.write().await;
        let mut next = settings.clone();
        edit(&mut next)?;
        let next = next.normalized();
        // Persist first; memory only changes once the file is written.
        self.save_to_disk(&next).await?;
        *settings = next;
        Ok(())
    }

    /// Read one setting by its wire key (`apiKey`, `posConfig`, `agentServiceUrl`).
    pub async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>, SettingsError> {
        let settings = self.settings.read().await;
        let value = match key {
            "apiKey" => settings.api_key.clone().map(serde_json::Value::String),
            "agentServiceUrl" => settings.agent_service_url.clone().map(serde_json::Value::String),
            "posConfig" => match &settings.pos_config {
                Some(descriptor) => Some(serde_json::to_value(descriptor).map_err(|source| {
                    SettingsError::InvalidValue {
                        key: key.to_string(),
                        source,
                    }
                })?),
                None => None,
            },
            other => return Err(SettingsError::UnknownKey(other.to_string())),
        };
        Ok(value)
    }

    /// Write one setting by its wire key and persist. `null` clears it.
    pub async fn set_value(&self, key: &str, value: serde_json::Value) -> Result<(), SettingsError> {
        let invalid = |source| SettingsError::InvalidValue {
            key: key.to_string(),
            source,
        };

        self.modify(|next| {
            match key {
                "apiKey" => next.api_key = serde_json::from_value(value).map_err(invalid)?,
                "agentServiceUrl" => {
                    next.agent_service_url = serde_json::from_value(value).map_err(invalid)?
                }
                "posConfig" => next.pos_config = serde_json::from_value(value).map_err(invalid)?,
                other => return Err(SettingsError::UnknownKey(other.to_string())),
            }
            Ok(())
        })
        .await
    }
}

/// Shared settings store wrapped in Arc for concurrent access.
pub type SharedSettingsStore = Arc<SettingsStore>;
