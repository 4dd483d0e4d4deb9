use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::SyncError;

const PREVIOUS_USER_FILE: &str = "prevUser.txt";
const TOKEN_CACHE_FILE: &str = "tokencache.json";

/// Last signed-in account. A missing or empty file means nobody has signed
/// in interactively yet; that is not an error.
pub fn load_previous_user(dir: &Path) -> Option<String> {
    let content = fs::read_to_string(dir.join(PREVIOUS_USER_FILE)).ok()?;
    let username = content.lines().next()?.trim();
    if username.is_empty() {
        None
    } else {
        Some(username.to_string())
    }
}

/// Overwrites the previous-user file after every interactive sign-in.
pub fn save_previous_user(dir: &Path, username: &str) -> Result<(), SyncError> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(PREVIOUS_USER_FILE), format!("{username}\n"))?;
    Ok(())
}

pub fn token_cache_path(dir: &Path) -> PathBuf {
    dir.join(TOKEN_CACHE_FILE)
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CachedAccount {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix epoch seconds after which the access token is stale.
    pub expires_at: i64,
}

#[derive(Serialize, Deserialize, Default)]
pub struct TokenCache {
    accounts: HashMap<String, CachedAccount>,
    #[serde(skip)]
    dirty: bool,
}

impl TokenCache {
    pub fn account(&self, username: &str) -> Option<&CachedAccount> {
        self.accounts.get(username)
    }

    pub fn insert(&mut self, username: &str, account: CachedAccount) {
        self.accounts.insert(username.to_string(), account);
        self.dirty = true;
    }

    pub fn remove(&mut self, username: &str) {
        if self.accounts.remove(username).is_some() {
            self.dirty = true;
        }
    }
}

/// On-disk token cache with a process-wide lock around every
/// read-modify-write cycle. The file is deserialized before each operation
/// (absent file = empty cache) and written back only when the operation
/// changed something.
pub struct TokenCacheStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TokenCacheStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn with_cache<T>(&self, op: impl FnOnce(&mut TokenCache) -> T) -> Result<T, SyncError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| SyncError::Io("token cache lock poisoned".to_string()))?;

        let mut cache = if self.path.exists() {
            let content = fs::read_to_string(&self.path)?;
            serde_json::from_str(&content)
                .map_err(|e| SyncError::Io(format!("corrupt token cache: {e}")))?
        } else {
            TokenCache::default()
        };

        let result = op(&mut cache);

        if cache.dirty {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let content = serde_json::to_string_pretty(&cache)
                .map_err(|e| SyncError::Io(e.to_string()))?;
            fs::write(&self.path, content)?;
        }

        Ok(result)
    }
}
