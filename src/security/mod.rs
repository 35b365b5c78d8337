//! Control transport security
//!
//! This module provides:
//! - The server x25519 key pair published to hosts
//! - The registry of client public keys allowed on the control server
//! - Security audit logging

use crate::error::Result;
use std::collections::HashSet;
use std::path::Path;
use std::sync::RwLock;
use tracing::{info, warn};

mod keys;

pub use keys::{KeyPair, PrivateKey, PublicKey, KEY_LEN};

/// Server key pair plus registered client keys
#[derive(Debug)]
pub struct KeyStore {
    server: RwLock<KeyPair>,
    clients: RwLock<HashSet<PublicKey>>,
}

impl KeyStore {
    /// Create a store with an ephemeral server key
    pub fn new() -> Self {
        Self {
            server: RwLock::new(KeyPair::generate()),
            clients: RwLock::new(HashSet::new()),
        }
    }

    /// Replace the server key with the one persisted at `path`, generating
    /// it on first use
    pub fn load_server_key<P: AsRef<Path>>(&self, path: P) -> Result<PublicKey> {
        let pair = KeyPair::load_or_generate(path)?;
        let public = pair.public;
        *self.server.write().unwrap_or_else(|e| e.into_inner()) = pair;
        info!("Control server public key: {}", public);
        Ok(public)
    }

    /// Server public key
    pub fn server_public_key(&self) -> PublicKey {
        self.server.read().unwrap_or_else(|e| e.into_inner()).public
    }

    /// Register a client public key. Returns `false` if it was already
    /// registered.
    pub fn add_client_key(&self, bytes: &[u8]) -> Result<bool> {
        let key = PublicKey::from_slice(bytes)?;
        let added = self
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);

        SecurityEvent::ClientKeyRegistered {
            key: key.to_base64(),
            new: added,
        }
        .log();
        Ok(added)
    }

    /// Whether any client key is registered
    pub fn has_client_keys(&self) -> bool {
        !self.clients.read().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// Whether `key` is registered
    pub fn is_authorized(&self, key: &PublicKey) -> bool {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Security audit event types
#[derive(Debug, Clone)]
pub enum SecurityEvent {
    /// Client key registration
    ClientKeyRegistered {
        /// Base64 public key
        key: String,
        /// Whether the key was not known before
        new: bool,
    },
    /// Authentication attempt on the control server
    AuthenticationAttempt {
        /// Whether authentication succeeded
        success: bool,
        /// Optional reason for failure
        reason: Option<String>,
    },
}

impl SecurityEvent {
    /// Log a security event
    pub fn log(&self) {
        match self {
            Self::ClientKeyRegistered { key, new } => {
                if *new {
                    info!("Security: client key registered: {}", key);
                } else {
                    info!("Security: client key already registered: {}", key);
                }
            }
            Self::AuthenticationAttempt { success, reason } => {
                if *success {
                    info!("Security: Authentication successful");
                } else {
                    warn!(
                        "Security: Authentication failed: {}",
                        reason.as_deref().unwrap_or("unknown reason")
                    );
                }
            }
        }
    }
}
