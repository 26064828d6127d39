use std::{fs, io, path::PathBuf, time::Duration};

use anyhow::Context;
use russh::keys::{
    Algorithm, PrivateKey,
    ssh_key::{LineEnding, rand_core::OsRng},
};

use crate::ferry::files;

pub const DEFAULT_SERVER_VERSION: &str = "SSH-2.0-ferry_1.0";
pub const DEFAULT_BANNER: &str = "Welcome to ferry.\n";

/// Everything the engine needs to build its SSH server configuration.
#[derive(Clone)]
pub struct TransportConfig {
    pub host_key: PrivateKey,
    pub server_version: String,
    pub banner: String,
    pub auth_rejection_time: Duration,
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("host_key", &self.host_key.algorithm())
            .field("server_version", &self.server_version)
            .field("banner", &self.banner)
            .field("auth_rejection_time", &self.auth_rejection_time)
            .finish()
    }
}

/// Source of [`TransportConfig`]; consulted once, on first use.
pub trait TransportConfigProvider: Send + Sync {
    fn build(&self) -> anyhow::Result<TransportConfig>;
}

/// Host key persisted in OpenSSH format, generated (Ed25519) on first use.
#[derive(Debug, Clone)]
pub struct HostKeyFile {
    pub path: PathBuf,
    pub server_version: String,
    pub banner: String,
    pub auth_rejection_time: Duration,
}

impl HostKeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            server_version: DEFAULT_SERVER_VERSION.to_string(),
            banner: DEFAULT_BANNER.to_string(),
            auth_rejection_time: Duration::from_secs(1),
        }
    }

    pub fn load_or_generate(&self) -> anyhow::Result<PrivateKey> {
        match fs::read(&self.path) {
            Ok(data) => PrivateKey::from_openssh(&data)
                .with_context(|| format!("hostkey: parse {}", self.path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
                    .context("hostkey: generate ed25519 key")?;
                let pem = key
                    .to_openssh(LineEnding::LF)
                    .context("hostkey: encode key")?;
                files::ensure_parent_dir(&self.path)
                    .with_context(|| format!("hostkey: mkdir for {}", self.path.display()))?;
                files::write_private(&self.path, pem.as_bytes())
                    .with_context(|| format!("hostkey: write {}", self.path.display()))?;
                tracing::info!(path=%self.path.display(), "hostkey: generated new ed25519 host key");
                Ok(key)
            }
            Err(err) => Err(err).with_context(|| format!("hostkey: read {}", self.path.display())),
        }
    }
}

impl TransportConfigProvider for HostKeyFile {
    fn build(&self) -> anyhow::Result<TransportConfig> {
        if !self.server_version.starts_with("SSH-2.0-") {
            anyhow::bail!(
                "hostkey: server version {:?} must start with SSH-2.0-",
                self.server_version
            );
        }
        Ok(TransportConfig {
            host_key: self.load_or_generate()?,
            server_version: self.server_version.clone(),
            banner: self.banner.clone(),
            auth_rejection_time: self.auth_rejection_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ferry::files::temp_dir;

    #[test]
    fn key_is_generated_once_and_reused() {
        let dir = temp_dir("reuse");
        let provider = HostKeyFile::new(dir.join("keys").join("host_key"));

        let first = provider.build().unwrap();
        assert_eq!(first.host_key.algorithm(), Algorithm::Ed25519);
        assert_eq!(first.server_version, DEFAULT_SERVER_VERSION);

        let second = provider.build().unwrap();
        assert_eq!(
            first.host_key.public_key().to_openssh().unwrap(),
            second.host_key.public_key().to_openssh().unwrap()
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_key_file_is_an_error() {
        let dir = temp_dir("corrupt");
        let path = dir.join("host_key");
        std::fs::write(&path, "garbage").unwrap();
        let err = HostKeyFile::new(&path).build().unwrap_err();
        assert!(format!("{err:#}").contains("hostkey: parse"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bad_server_version_is_rejected() {
        let dir = temp_dir("version");
        let mut provider = HostKeyFile::new(dir.join("host_key"));
        provider.server_version = "ferry".to_string();
        assert!(provider.build().is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
