//! Configuration validation functions
//!
//! This module provides validation for setup parameters, settings, and
//! profile fields: directories, listen addresses, endpoints, ports, tags
//! and secrets.

use crate::error::{CoreError, Result};
use std::net::SocketAddr;
use std::path::Path;

/// Maximum accepted length of an outbound or group tag
const MAX_TAG_LEN: usize = 64;

/// Minimum length of the control server secret
const MIN_SECRET_LEN: usize = 8;

/// Validate that a directory path is non-empty and exists
pub fn validate_existing_dir(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(CoreError::Config("Directory path cannot be empty".to_string()));
    }

    if !path.is_dir() {
        return Err(CoreError::Config(format!(
            "Directory {:?} does not exist",
            path
        )));
    }

    Ok(())
}

/// Validate a directory path, creating it if missing
pub fn ensure_dir(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(CoreError::Config("Directory path cannot be empty".to_string()));
    }

    if path.exists() && !path.is_dir() {
        return Err(CoreError::Config(format!("{:?} is not a directory", path)));
    }

    std::fs::create_dir_all(path).map_err(|e| {
        CoreError::Config(format!("Failed to create directory {:?}: {}", path, e))
    })
}

/// Validate a listen address (`ip:port`, port may be 0 for ephemeral)
pub fn validate_listen_address(listen: &str) -> Result<SocketAddr> {
    if listen.is_empty() {
        return Err(CoreError::Config(
            "Listen address cannot be empty".to_string(),
        ));
    }

    listen.parse::<SocketAddr>().map_err(|_| {
        CoreError::Config(format!(
            "Invalid listen address: {} (expected format: ip:port)",
            listen
        ))
    })
}

/// Validate a non-zero TCP port
pub fn validate_port(port: i64) -> Result<u16> {
    if !(1..=65535).contains(&port) {
        return Err(CoreError::Config(format!(
            "Port {} is out of valid range (1-65535)",
            port
        )));
    }
    Ok(port as u16)
}

/// Validate endpoint format (host:port)
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    let parts: Vec<&str> = endpoint.rsplitn(2, ':').collect();

    if parts.len() != 2 {
        return Err(CoreError::Config(format!(
            "Invalid endpoint format: {} (expected format: host:port)",
            endpoint
        )));
    }

    let port: i64 = parts[0].parse().map_err(|_| {
        CoreError::Config(format!("Invalid port in endpoint: {}", endpoint))
    })?;
    validate_port(port)?;

    // Host validation is lenient (can be hostname or IP)
    if parts[1].is_empty() {
        return Err(CoreError::Config(
            "Host cannot be empty in endpoint".to_string(),
        ));
    }

    Ok(())
}

/// Validate an outbound or group tag
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.trim().is_empty() {
        return Err(CoreError::Config("Tag cannot be empty".to_string()));
    }

    if tag.len() > MAX_TAG_LEN {
        return Err(CoreError::Config(format!(
            "Tag '{}' exceeds maximum length of {} characters",
            tag, MAX_TAG_LEN
        )));
    }

    if tag.chars().any(|c| c.is_control()) {
        return Err(CoreError::Config(format!(
            "Tag '{}' contains control characters",
            tag.escape_debug()
        )));
    }

    Ok(())
}

/// Validate the control server secret
pub fn validate_secret(secret: &str) -> Result<()> {
    if secret.is_empty() {
        return Err(CoreError::Config(
            "Secret is required for authenticated server modes".to_string(),
        ));
    }

    if secret.len() < MIN_SECRET_LEN {
        return Err(CoreError::Config(format!(
            "Secret is too short (minimum {} characters)",
            MIN_SECRET_LEN
        )));
    }

    if secret.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CoreError::Config(
            "Secret cannot contain whitespace".to_string(),
        ));
    }

    Ok(())
}

/// Validate a probe URL (http or https with a host)
pub fn validate_probe_url(url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| {
            CoreError::Config(format!("Probe URL must use http or https: {}", url))
        })?;

    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() {
        return Err(CoreError::Config(format!("Probe URL has no host: {}", url)));
    }

    Ok(())
}
