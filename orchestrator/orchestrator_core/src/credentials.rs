//! Cluster credentials at rest.
//!
//! Passwords are generated once per cluster and stored only as age-armored
//! ciphertext ([`SealedSecret`]). The X25519 identity that opens them lives
//! in a key file next to the orchestrator, readable by its owner only.

use std::io::{Read, Write};
use std::path::Path;

use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use orchestrator_shared_types::{ClusterCredentials, OrchestrationError, Result, SealedSecret};

pub const REPLICATION_USER: &str = "repl";
pub const APP_USER: &str = "app";
pub const MONITOR_USER: &str = "monitor";

fn credential_error(context: &str, err: impl std::fmt::Display) -> OrchestrationError {
    OrchestrationError::CredentialError(format!("{}: {}", context, err))
}

/// Random alphanumeric password.
pub fn random_password(length: usize) -> SecretString {
    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    SecretString::new(password)
}

/// Plaintext view of a cluster's credentials, held only while a workflow runs.
#[derive(Debug, Clone)]
pub struct OpenedCredentials {
    pub root_password: SecretString,
    pub replication_user: String,
    pub replication_password: SecretString,
    pub app_user: String,
    pub app_password: SecretString,
    pub monitor_user: String,
    pub monitor_password: SecretString,
    pub router_admin_user: String,
    pub router_admin_password: SecretString,
}

/// Seals and opens cluster secrets with one age identity.
pub struct CredentialVault {
    identity: age::x25519::Identity,
    recipient: age::x25519::Recipient,
}

impl CredentialVault {
    pub fn generate() -> Self {
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public();
        Self { identity, recipient }
    }

    pub fn from_identity_str(identity_str: &str) -> Result<Self> {
        let identity: age::x25519::Identity = identity_str
            .trim()
            .parse()
            .map_err(|e| credential_error("invalid age identity", e))?;
        let recipient = identity.to_public();
        Ok(Self { identity, recipient })
    }

    /// Loads the identity from `path`, creating it (mode 0600) when absent.
    pub async fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let identity_str = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| credential_error("failed to read vault key", e))?;
            return Self::from_identity_str(&identity_str);
        }

        let vault = Self::generate();
        vault.save_identity(path).await?;
        info!(path = %path.display(), "generated new credential vault key");
        Ok(vault)
    }

    async fn save_identity(&self, path: &Path) -> Result<()> {
        let identity_str = self.identity.to_string();
        let io_err = |e: std::io::Error| credential_error("failed to write vault key", e);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let temp_path = path.with_extension("tmp");
            tokio::fs::write(&temp_path, identity_str.expose_secret())
                .await
                .map_err(io_err)?;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&temp_path, perms).await.map_err(io_err)?;
            tokio::fs::rename(&temp_path, path).await.map_err(io_err)?;
        }

        #[cfg(not(unix))]
        {
            tokio::fs::write(path, identity_str.expose_secret())
                .await
                .map_err(io_err)?;
        }

        Ok(())
    }

    pub fn recipient_string(&self) -> String {
        self.recipient.to_string()
    }

    pub fn seal(&self, plaintext: &SecretString) -> Result<SealedSecret> {
        let encryptor = age::Encryptor::with_recipients(vec![Box::new(self.recipient.clone())])
            .ok_or_else(|| OrchestrationError::CredentialError("no recipients".to_string()))?;

        let mut encrypted = vec![];
        let armor_writer =
            age::armor::ArmoredWriter::wrap_output(&mut encrypted, age::armor::Format::AsciiArmor)
                .map_err(|e| credential_error("failed to create armor writer", e))?;
        let mut writer = encryptor
            .wrap_output(armor_writer)
            .map_err(|e| credential_error("failed to wrap output", e))?;
        writer
            .write_all(plaintext.expose_secret().as_bytes())
            .map_err(|e| credential_error("failed to write", e))?;
        let armor_writer = writer
            .finish()
            .map_err(|e| credential_error("failed to finish encryption", e))?;
        armor_writer
            .finish()
            .map_err(|e| credential_error("failed to finish armor", e))?;

        let armored = String::from_utf8(encrypted)
            .map_err(|e| credential_error("invalid UTF-8 in armored output", e))?;
        Ok(SealedSecret::from_armored(armored))
    }

    pub fn open(&self, sealed: &SealedSecret) -> Result<SecretString> {
        let armor_reader = age::armor::ArmoredReader::new(sealed.armored().as_bytes());
        let decryptor = match age::Decryptor::new(armor_reader)
            .map_err(|e| credential_error("failed to create decryptor", e))?
        {
            age::Decryptor::Recipients(d) => d,
            _ => {
                return Err(OrchestrationError::CredentialError(
                    "unexpected decryptor type".to_string(),
                ))
            }
        };

        let mut decrypted = vec![];
        let mut reader = decryptor
            .decrypt(std::iter::once(&self.identity as &dyn age::Identity))
            .map_err(|e| credential_error("failed to decrypt", e))?;
        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| credential_error("failed to read decrypted data", e))?;

        let plaintext =
            String::from_utf8(decrypted).map_err(|e| credential_error("secret is not UTF-8", e))?;
        Ok(SecretString::new(plaintext))
    }

    pub fn open_all(&self, credentials: &ClusterCredentials) -> Result<OpenedCredentials> {
        Ok(OpenedCredentials {
            root_password: self.open(&credentials.root_password)?,
            replication_user: credentials.replication_user.clone(),
            replication_password: self.open(&credentials.replication_password)?,
            app_user: credentials.app_user.clone(),
            app_password: self.open(&credentials.app_password)?,
            monitor_user: credentials.monitor_user.clone(),
            monitor_password: self.open(&credentials.monitor_password)?,
            router_admin_user: credentials.router_admin_user.clone(),
            router_admin_password: self.open(&credentials.router_admin_password)?,
        })
    }

    /// Fresh credentials for a new cluster. `router_admin_user` is the
    /// router's built-in admin account whose password gets rotated.
    pub fn generate_credentials(
        &self,
        router_admin_user: &str,
        password_length: usize,
    ) -> Result<ClusterCredentials> {
        let sealed = || self.seal(&random_password(password_length));
        Ok(ClusterCredentials {
            root_password: sealed()?,
            replication_user: REPLICATION_USER.to_string(),
            replication_password: sealed()?,
            app_user: APP_USER.to_string(),
            app_password: sealed()?,
            monitor_user: MONITOR_USER.to_string(),
            monitor_password: sealed()?,
            router_admin_user: router_admin_user.to_string(),
            router_admin_password: sealed()?,
            router_admin_rotated: false,
        })
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("recipient", &self.recipient_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_seal_and_open() {
        let vault = CredentialVault::generate();
        let sealed = vault.seal(&SecretString::new("s3cret".into())).unwrap();
        assert!(sealed.armored().starts_with("-----BEGIN AGE ENCRYPTED FILE-----"));
        assert!(!sealed.armored().contains("s3cret"));
        assert_eq!(vault.open(&sealed).unwrap().expose_secret(), "s3cret");
    }

    #[test]
    fn test_other_identity_cannot_open() {
        let sealed = CredentialVault::generate()
            .seal(&SecretString::new("s3cret".into()))
            .unwrap();
        let err = CredentialVault::generate().open(&sealed).unwrap_err();
        assert!(matches!(err, OrchestrationError::CredentialError(_)));
    }

    #[test]
    fn test_random_password() {
        let a = random_password(24);
        let b = random_password(24);
        assert_eq!(a.expose_secret().len(), 24);
        assert!(a.expose_secret().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a.expose_secret(), b.expose_secret());
    }

    #[test]
    fn test_generated_credentials_are_sealed() {
        let vault = CredentialVault::generate();
        let creds = vault.generate_credentials("radmin", 16).unwrap();
        assert_eq!(creds.router_admin_user, "radmin");
        assert!(!creds.router_admin_rotated);
        assert_eq!(vault.open(&creds.root_password).unwrap().expose_secret().len(), 16);
        assert_ne!(creds.root_password, creds.replication_password);

        let opened = vault.open_all(&creds).unwrap();
        assert_eq!(opened.replication_user, "repl");
        assert_ne!(
            opened.app_password.expose_secret(),
            opened.monitor_password.expose_secret()
        );
    }

    #[tokio::test]
    async fn test_load_or_create_persists_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("vault.key");

        let first = CredentialVault::load_or_create(&path).await.unwrap();
        let sealed = first.seal(&SecretString::new("pw".into())).unwrap();

        let second = CredentialVault::load_or_create(&path).await.unwrap();
        assert_eq!(first.recipient_string(), second.recipient_string());
        assert_eq!(second.open(&sealed).unwrap().expose_secret(), "pw");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
