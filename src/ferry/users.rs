use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::RwLock,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ferry::{
    auth::{self, AuthValidator, PasswordError},
    files,
};

pub const MIN_PASSWORD_LEN: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
    pub enabled: bool,
}

/// A user record without the password hash.
#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub enabled: bool,
}

impl From<&User> for UserInfo {
    fn from(u: &User) -> Self {
        Self {
            username: u.username.clone(),
            created_at: u.created_at,
            last_login: u.last_login,
            enabled: u.enabled,
        }
    }
}

#[derive(Debug, Error)]
pub enum UserDbError {
    #[error("user '{0}' already exists")]
    AlreadyExists(String),
    #[error("user '{0}' does not exist")]
    NotFound(String),
    #[error("username cannot be empty")]
    EmptyUsername,
    #[error("password must be at least 4 characters long")]
    PasswordTooShort,
    #[error("user database {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("user database {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Hash(#[from] PasswordError),
}

/// JSON-file credential store keyed by username.
///
/// Every mutation is written through to disk before it returns.
#[derive(Debug)]
pub struct UserDb {
    path: PathBuf,
    users: RwLock<BTreeMap<String, User>>,
}

impl UserDb {
    /// Opens `path`; a missing or empty file is an empty database.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, UserDbError> {
        let path = path.into();
        let users = match fs::read(&path) {
            Ok(data) if data.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(data) => serde_json::from_slice(&data).map_err(|source| UserDbError::Json {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(UserDbError::Io { path, source }),
        };
        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_user(&self, username: &str, password: &str) -> Result<(), UserDbError> {
        let username = validate_username(username)?;
        validate_password(password)?;
        if self.read().contains_key(username) {
            return Err(UserDbError::AlreadyExists(username.to_string()));
        }

        let password_hash = auth::hash_password(password)?;

        let mut users = self.write();
        if users.contains_key(username) {
            return Err(UserDbError::AlreadyExists(username.to_string()));
        }
        users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                password_hash,
                created_at: Utc::now(),
                last_login: None,
                enabled: true,
            },
        );
        save(&self.path, &users)
    }

    pub fn remove_user(&self, username: &str) -> Result<(), UserDbError> {
        let mut users = self.write();
        if users.remove(username.trim()).is_none() {
            return Err(UserDbError::NotFound(username.trim().to_string()));
        }
        save(&self.path, &users)
    }

    pub fn update_password(&self, username: &str, password: &str) -> Result<(), UserDbError> {
        let username = username.trim();
        validate_password(password)?;
        if !self.read().contains_key(username) {
            return Err(UserDbError::NotFound(username.to_string()));
        }

        let password_hash = auth::hash_password(password)?;

        let mut users = self.write();
        let user = users
            .get_mut(username)
            .ok_or_else(|| UserDbError::NotFound(username.to_string()))?;
        user.password_hash = password_hash;
        save(&self.path, &users)
    }

    pub fn set_enabled(&self, username: &str, enabled: bool) -> Result<(), UserDbError> {
        let mut users = self.write();
        let user = users
            .get_mut(username.trim())
            .ok_or_else(|| UserDbError::NotFound(username.trim().to_string()))?;
        user.enabled = enabled;
        save(&self.path, &users)
    }

    /// True only for an existing, enabled user with a matching password.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let hash = {
            let users = self.read();
            match users.get(username) {
                Some(u) if u.enabled => u.password_hash.clone(),
                _ => return false,
            }
        };

        match auth::verify_password(password, &hash) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => {
                tracing::warn!(user=%username, err=%err, "users: stored hash unusable");
                return false;
            }
        }

        let mut users = self.write();
        if let Some(u) = users.get_mut(username) {
            u.last_login = Some(Utc::now());
            if let Err(err) = save(&self.path, &users) {
                tracing::warn!(user=%username, err=%err, "users: failed to record last login");
            }
        }
        true
    }

    pub fn list_users(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn users(&self) -> Vec<UserInfo> {
        self.read().values().map(UserInfo::from).collect()
    }

    pub fn user_info(&self, username: &str) -> Result<UserInfo, UserDbError> {
        self.read()
            .get(username.trim())
            .map(UserInfo::from)
            .ok_or_else(|| UserDbError::NotFound(username.trim().to_string()))
    }

    /// Writes a snapshot of the database to `dest`.
    pub fn backup(&self, dest: &Path) -> Result<(), UserDbError> {
        let users = self.read();
        save(dest, &users)
    }

    /// Creates `username` unless it already exists. Returns true when created.
    pub fn ensure_user(&self, username: &str, password: &str) -> Result<bool, UserDbError> {
        match self.add_user(username, password) {
            Ok(()) => Ok(true),
            Err(UserDbError::AlreadyExists(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, User>> {
        self.users.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, User>> {
        self.users.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl AuthValidator for UserDb {
    fn validate(&self, username: &str, password: &str) -> bool {
        self.authenticate(username, password)
    }
}

fn validate_username(username: &str) -> Result<&str, UserDbError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(UserDbError::EmptyUsername);
    }
    Ok(username)
}

fn validate_password(password: &str) -> Result<(), UserDbError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(UserDbError::PasswordTooShort);
    }
    Ok(())
}

/// Write to `<path>.tmp`, then rename over `path`.
fn save(path: &Path, users: &BTreeMap<String, User>) -> Result<(), UserDbError> {
    let io_err = |source| UserDbError::Io {
        path: path.to_path_buf(),
        source,
    };

    let data = serde_json::to_vec_pretty(users).map_err(|source| UserDbError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    files::ensure_parent_dir(path).map_err(io_err)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    files::write_private(&tmp, &data).map_err(io_err)?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(err));
    }
    Ok(())
}
