//! Static user directory.
//!
//! The users file is parsed into an immutable [`UserSnapshot`]. Reloads
//! publish a new snapshot through a `watch` channel; readers always see one
//! complete generation, never a half-applied file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use super::password::check_hash;

#[derive(Debug, thiserror::Error)]
pub enum UsersError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("line {line}: expected `name:hash`")]
    MissingSeparator { line: usize },

    #[error("line {line}: invalid password hash for {user}")]
    InvalidHash { line: usize, user: String },

    #[error("line {line}: duplicate user {user}")]
    Duplicate { line: usize, user: String },
}

/// One generation of the static user table.
#[derive(Debug, Default)]
pub struct UserSnapshot {
    pub version: u64,
    users: HashMap<String, String>,
}

impl UserSnapshot {
    /// Stored PHC hash for `name`, if it is a static user.
    pub fn hash_for(&self, name: &str) -> Option<&str> {
        self.users.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Parse users-file content: one `name:hash` per line, `#` comments and
/// blank lines ignored.
pub fn parse_users(content: &str) -> Result<HashMap<String, String>, UsersError> {
    let mut users = HashMap::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = idx + 1;
        let entry = raw.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }
        let (name, hash) = entry
            .split_once(':')
            .ok_or(UsersError::MissingSeparator { line })?;
        let (name, hash) = (name.trim(), hash.trim());
        if name.is_empty() {
            return Err(UsersError::MissingSeparator { line });
        }
        if check_hash(hash).is_err() {
            return Err(UsersError::InvalidHash {
                line,
                user: name.to_string(),
            });
        }
        if users.insert(name.to_string(), hash.to_string()).is_some() {
            return Err(UsersError::Duplicate {
                line,
                user: name.to_string(),
            });
        }
    }
    Ok(users)
}

/// Read and parse a users file.
pub async fn load_users_file(path: &Path) -> Result<HashMap<String, String>, UsersError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| UsersError::Io {
            path: path.display().to_string(),
            source,
        })?;
    parse_users(&content)
}

/// Single writer for the user table. Hand out receivers with [`subscribe`].
///
/// [`subscribe`]: UserDirectory::subscribe
pub struct UserDirectory {
    tx: watch::Sender<Arc<UserSnapshot>>,
}

impl UserDirectory {
    /// Start at version 1 with the given users.
    pub fn new(users: HashMap<String, String>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(UserSnapshot { version: 1, users }));
        Self { tx }
    }

    /// Replace the table with a new generation and return its version.
    pub fn publish(&self, users: HashMap<String, String>) -> u64 {
        let version = self.tx.borrow().version + 1;
        let count = users.len();
        self.tx
            .send_replace(Arc::new(UserSnapshot { version, users }));
        info!(version, users = count, "Static users published");
        version
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<UserSnapshot>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Arc<UserSnapshot> {
        Arc::clone(&self.tx.borrow())
    }
}

impl Default for UserDirectory {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}
