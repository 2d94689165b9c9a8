use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Bearer credential for the remote API. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        ApiKey(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Single-line key file (`~/.tgpt/api`). The key is read once and cached for
/// the life of the instance; later edits to the file are not observed.
#[derive(Debug)]
pub struct ApiKeyFile {
    path: PathBuf,
    cached: Option<ApiKey>,
}

impl ApiKeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ApiKeyFile {
            path: path.into(),
            cached: None,
        }
    }

    /// The key file in its usual place under the user's home directory.
    pub fn default_location() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".tgpt").join("api"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_key(&mut self) -> Result<&ApiKey> {
        let key = match self.cached.take() {
            Some(key) => key,
            None => {
                let contents = std::fs::read_to_string(&self.path).map_err(|e| {
                    if e.kind() == ErrorKind::NotFound {
                        Error::CredentialMissing {
                            path: self.path.clone(),
                            source: e,
                        }
                    } else {
                        Error::file_io(&self.path, e)
                    }
                })?;
                debug!("read API key from {}", self.path.display());
                ApiKey::new(contents.trim())
            }
        };

        Ok(self.cached.insert(key))
    }
}

/// Whether the command line or the environment already carries a key, in
/// which case nobody needs to be asked for one.
pub fn key_supplied(flag: Option<&str>, env_key: Option<&str>) -> bool {
    [flag, env_key]
        .into_iter()
        .flatten()
        .any(|key| !key.trim().is_empty())
}

/// Picks the API key from the first non-empty source: the command line, the
/// config file, the environment, then the key file.
pub fn resolve_api_key(
    flag: Option<&str>,
    configured: &str,
    env_key: Option<String>,
    key_file: &mut ApiKeyFile,
) -> Result<ApiKey> {
    let inline = flag
        .map(str::to_string)
        .into_iter()
        .chain(Some(configured.to_string()))
        .chain(env_key)
        .map(|key| key.trim().to_string())
        .find(|key| !key.is_empty());

    match inline {
        Some(key) => Ok(ApiKey::new(key)),
        None => key_file.get_key().cloned(),
    }
}
