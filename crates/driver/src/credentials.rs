//! Per-driver credential persistence.
//!
//! Credentials are opaque strings (usually cookies) keyed by driver name.
//! The file keeps the layout older CDNDrive builds wrote:
//! `{"Cookie": {"<driver>": "<credential>"}}`.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::driver::Driver;
use crate::error::CredentialError;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(rename = "Cookie", default)]
    cookie: HashMap<String, String>,
}

/// Credential store backed by a JSON file.
///
/// Loaded once; every mutation rewrites the whole file.
pub struct CredentialStore {
    path: PathBuf,
    credentials: RwLock<HashMap<String, String>>,
}

impl CredentialStore {
    /// Opens the store at `path`.
    ///
    /// A missing or unreadable file yields an empty store: uploads to
    /// backends that need no credential must keep working.
    pub fn open(path: PathBuf) -> Self {
        let credentials = match load_credentials(&path) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable credential file");
                HashMap::new()
            }
        };
        Self {
            path,
            credentials: RwLock::new(credentials),
        }
    }

    /// Returns the credential for `driver_name`, or an empty string.
    pub fn get(&self, driver_name: &str) -> String {
        self.credentials
            .read()
            .unwrap()
            .get(driver_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Stores a credential without validating it.
    pub fn set(&self, driver_name: &str, credential: &str) -> Result<(), CredentialError> {
        {
            let mut map = self.credentials.write().unwrap();
            map.insert(driver_name.to_string(), credential.to_string());
        }
        self.persist()
    }

    /// Validates `credential` against the backend, then stores it.
    pub async fn set_checked(
        &self,
        driver: &dyn Driver,
        http: &reqwest::Client,
        credential: &str,
    ) -> Result<(), CredentialError> {
        if !driver.check_credential(http, credential).await? {
            return Err(CredentialError::Rejected(driver.display_name().to_string()));
        }
        self.set(driver.name(), credential)
    }

    /// Removes the credential for `driver_name`.
    pub fn remove(&self, driver_name: &str) -> Result<(), CredentialError> {
        {
            let mut map = self.credentials.write().unwrap();
            map.remove(driver_name);
        }
        self.persist()
    }

    /// Names of all drivers with a stored credential.
    pub fn driver_names(&self) -> Vec<String> {
        self.credentials.read().unwrap().keys().cloned().collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), CredentialError> {
        let file = CredentialFile {
            cookie: self.credentials.read().unwrap().clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_private(&self.path, json.as_bytes())?;
        debug!("persisted {} credential(s) to {:?}", file.cookie.len(), self.path);
        Ok(())
    }
}

fn load_credentials(path: &Path) -> Result<HashMap<String, String>, CredentialError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    if data.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let file: CredentialFile = serde_json::from_str(&data)?;
    debug!("loaded {} credential(s) from {:?}", file.cookie.len(), path);
    Ok(file.cookie)
}

/// Writes `contents` to a sibling file created with mode 0600, then renames
/// it over `path`. The credentials are never readable by other users.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    match std::fs::remove_file(&tmp) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)
}

/// Returns the default credential file path.
pub fn default_credentials_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("cdndrive-go.conf"))
}

/// Returns the platform-specific config directory.
pub fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
