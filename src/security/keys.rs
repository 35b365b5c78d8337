//! x25519 key management
//!
//! This module handles secure generation, storage, and usage of the x25519
//! keys used by the control transport and by Warp provisioning.

use crate::error::{CoreError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Length of every x25519 key in bytes
pub const KEY_LEN: usize = 32;

/// x25519 private key
#[derive(Clone)]
pub struct PrivateKey {
    secret: Zeroizing<[u8; KEY_LEN]>,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self {
            secret: Zeroizing::new(secret.to_bytes()),
        }
    }

    /// Create a private key from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            secret: Zeroizing::new(bytes),
        }
    }

    /// Parse a private key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        let decoded = Zeroizing::new(
            BASE64
                .decode(s.trim())
                .map_err(|e| CoreError::Security(format!("Invalid base64 private key: {}", e)))?,
        );

        let bytes: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            CoreError::Security(format!(
                "Invalid private key length: expected {} bytes, got {}",
                KEY_LEN,
                decoded.len()
            ))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Load a private key from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Check file permissions (should be 0600 or stricter)
        #[cfg(unix)]
        {
            let metadata = fs::metadata(path).map_err(|e| {
                CoreError::Security(format!("Failed to read key file {:?}: {}", path, e))
            })?;
            let mode = metadata.permissions().mode();

            if mode & 0o077 != 0 {
                return Err(CoreError::Security(format!(
                    "Private key file {:?} has insecure permissions: {:o} (should be 0600)",
                    path,
                    mode & 0o777
                )));
            }
        }

        let content = Zeroizing::new(fs::read_to_string(path).map_err(|e| {
            CoreError::Security(format!("Failed to read private key file {:?}: {}", path, e))
        })?);

        Self::from_base64(content.trim())
    }

    /// Save the private key to a file with secure permissions (0600)
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let encoded = Zeroizing::new(self.to_base64());

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        // Create file with restricted permissions from the start
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(path).map_err(|e| {
            CoreError::Security(format!("Failed to create key file {:?}: {}", path, e))
        })?;

        file.write_all(encoded.as_bytes()).map_err(|e| {
            CoreError::Security(format!("Failed to write key file {:?}: {}", path, e))
        })?;

        file.write_all(b"\n").map_err(|e| {
            CoreError::Security(format!("Failed to write key file {:?}: {}", path, e))
        })?;

        Ok(())
    }

    /// Convert to base64-encoded string
    pub fn to_base64(&self) -> String {
        BASE64.encode(*self.secret)
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(*self.secret);
        let public = X25519PublicKey::from(&secret);
        PublicKey {
            key: public.to_bytes(),
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

// Ensure private keys are never accidentally logged
impl fmt::Display for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// x25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: [u8; KEY_LEN],
}

impl PublicKey {
    /// Create a public key from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { key: bytes }
    }

    /// Create a public key from a byte slice of exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CoreError::Security(format!(
                "Invalid public key length: expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(key))
    }

    /// Parse a public key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        let decoded = BASE64
            .decode(s.trim())
            .map_err(|e| CoreError::Security(format!("Invalid base64 public key: {}", e)))?;
        Self::from_slice(&decoded)
    }

    /// Convert to base64-encoded string
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// Key pair (private + public)
#[derive(Clone)]
pub struct KeyPair {
    /// Private key
    pub private: PrivateKey,
    /// Public key (derived from private)
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    /// Create a key pair from a private key
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    /// Load the key pair stored at `path`, or generate and store a new one
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Ok(Self::from_private(PrivateKey::from_file(path)?));
        }

        let pair = Self::generate();
        pair.private.save_to_file(path)?;
        Ok(pair)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private", &"[REDACTED]")
            .field("public", &self.public)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_keypair_is_consistent() {
        let keypair = KeyPair::generate();
        assert_eq!(keypair.private.public_key(), keypair.public);
    }

    #[test]
    fn test_private_key_base64() {
        let private = PrivateKey::generate();
        let base64_str = private.to_base64();
        assert_eq!(base64_str.len(), 44); // Base64 of 32 bytes
        let restored = PrivateKey::from_base64(&base64_str).unwrap();
        assert_eq!(private.public_key(), restored.public_key());
    }

    #[test]
    fn test_public_key_from_slice() {
        let public = PrivateKey::generate().public_key();
        let restored = PublicKey::from_slice(public.as_bytes()).unwrap();
        assert_eq!(public, restored);
        assert!(PublicKey::from_slice(&[0u8; 16]).is_err());
        assert!(PublicKey::from_slice(&[]).is_err());
    }

    #[test]
    fn test_private_key_not_logged() {
        let private = PrivateKey::generate();
        let debug_str = format!("{:?}", private);
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains(&private.to_base64()));
        assert_eq!(private.to_string(), "[REDACTED]");
    }

    #[cfg(unix)]
    #[test]
    fn test_load_or_generate_persists_key() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("server.key");

        let first = KeyPair::load_or_generate(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let second = KeyPair::load_or_generate(&path).unwrap();
        assert_eq!(first.public, second.public);
    }

    #[cfg(unix)]
    #[test]
    fn test_insecure_key_file_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("server.key");
        PrivateKey::generate().save_to_file(&path).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        assert!(matches!(
            PrivateKey::from_file(&path),
            Err(CoreError::Security(_))
        ));
    }

    #[test]
    fn test_invalid_base64() {
        assert!(PrivateKey::from_base64("invalid!@#$").is_err());
        assert!(PublicKey::from_base64("invalid!@#$").is_err());
    }

    #[test]
    fn test_invalid_length() {
        let short_key = BASE64.encode([0u8; 16]);
        assert!(PrivateKey::from_base64(&short_key).is_err());
    }
}
