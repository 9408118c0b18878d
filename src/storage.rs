//! Flash-resident JSON documents.
//!
//! Three files live in the data directory: `config.json` (network and setup
//! flags), `secrets.json` (client credentials, provisioned at the factory) and
//! `tokens.json` (the rotating refresh token). A corrupt document reads as
//! absent, except for secrets, whose absence is fatal.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::DeviceError;

const CONFIG_FILE: &str = "config.json";
const SECRETS_FILE: &str = "secrets.json";
const TOKENS_FILE: &str = "tokens.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub setup_complete: bool,
    #[serde(default, alias = "spotify_linked")]
    pub account_linked: bool,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secrets {
    #[serde(alias = "spotify_client_id")]
    pub client_id: String,
    #[serde(alias = "spotify_client_secret")]
    pub client_secret: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TokenDocument {
    #[serde(default)]
    refresh_token: String,
}

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Mount the store rooted at `root`, creating the directory if needed.
    ///
    /// Failure here is the one unrecoverable storage error: nothing else can
    /// be persisted, so callers show the failure screen.
    pub fn mount(root: impl Into<PathBuf>) -> Result<Self, DeviceError> {
        let root = root.into();
        if let Err(e) = fs::create_dir_all(&root) {
            error!(path = %root.display(), error = %e, "Storage mount failed");
            return Err(DeviceError::StorageUnavailable(format!(
                "{}: {}",
                root.display(),
                e
            )));
        }
        if !root.is_dir() {
            error!(path = %root.display(), "Storage root is not a directory");
            return Err(DeviceError::StorageUnavailable(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        debug!(path = %root.display(), "Storage mounted");
        Ok(Self { root })
    }

    // --- config.json ---

    /// `None` when the file is missing or corrupt.
    pub fn load_config(&self) -> Option<DeviceConfig> {
        self.read_document(CONFIG_FILE)
    }

    pub fn save_config(&self, config: &DeviceConfig) -> Result<(), DeviceError> {
        self.write_document(CONFIG_FILE, config)?;
        info!("Config saved");
        Ok(())
    }

    /// Load (or default), mutate, save. Lets each owner touch only its fields.
    pub fn update_config<F>(&self, f: F) -> Result<DeviceConfig, DeviceError>
    where
        F: FnOnce(&mut DeviceConfig),
    {
        let mut config = self.load_config().unwrap_or_default();
        f(&mut config);
        self.save_config(&config)?;
        Ok(config)
    }

    pub fn reset_config(&self) -> Result<(), DeviceError> {
        self.remove_document(CONFIG_FILE)
    }

    // --- secrets.json ---

    pub fn load_secrets(&self) -> Result<Secrets, DeviceError> {
        match self.read_document::<Secrets>(SECRETS_FILE) {
            Some(secrets)
                if !secrets.client_id.is_empty() && !secrets.client_secret.is_empty() =>
            {
                debug!("Secrets loaded");
                Ok(secrets)
            }
            Some(_) => {
                error!("secrets.json is missing client credentials");
                Err(DeviceError::SecretsMissing)
            }
            None => {
                error!("secrets.json not found or unreadable");
                Err(DeviceError::SecretsMissing)
            }
        }
    }

    // --- tokens.json ---

    /// Stored refresh token, or an empty string when there is none.
    pub fn load_refresh_token(&self) -> String {
        self.read_document::<TokenDocument>(TOKENS_FILE)
            .map(|doc| doc.refresh_token)
            .unwrap_or_default()
    }

    pub fn save_refresh_token(&self, refresh_token: &str) -> Result<(), DeviceError> {
        self.write_document(
            TOKENS_FILE,
            &TokenDocument {
                refresh_token: refresh_token.to_string(),
            },
        )?;
        debug!("Refresh token saved");
        Ok(())
    }

    pub fn reset_tokens(&self) -> Result<(), DeviceError> {
        self.remove_document(TOKENS_FILE)
    }

    // --- helpers ---

    fn read_document<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.root.join(name);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(file = name, "Document not present");
                return None;
            }
            Err(e) => {
                warn!(file = name, error = %e, "Failed to read document");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!(file = name, error = %e, "Document is corrupt, treating as absent");
                None
            }
        }
    }

    fn write_document<T: Serialize>(&self, name: &str, doc: &T) -> Result<(), DeviceError> {
        let body = serde_json::to_vec_pretty(doc)?;
        // Renamed into place: readers never see a partial document.
        let tmp = self.root.join(format!("{}.tmp", name));
        fs::write(&tmp, body)?;
        fs::rename(&tmp, self.root.join(name))?;
        Ok(())
    }

    fn remove_document(&self, name: &str) -> Result<(), DeviceError> {
        match fs::remove_file(self.root.join(name)) {
            Ok(()) => {
                info!(file = name, "Document removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
