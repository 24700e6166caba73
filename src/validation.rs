//! Input validation and sanitization
//!
//! Everything crossing a trust boundary (CTL requests, DHCP packets,
//! property-store values) is validated here before use

use crate::error::{GwctlError, GwctlResult};
use std::net::{IpAddr, Ipv4Addr};

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Maximum length for property-store values
const MAX_PROPERTY_VALUE_LEN: usize = 255;

/// Maximum length for a daemon name in the definitions file
const MAX_DAEMON_NAME_LEN: usize = 32;

/// Validate interface name
///
/// Interface names must be alphanumeric with optional dashes, dots and
/// underscores, and no longer than 15 characters (Linux kernel limit)
pub fn validate_interface_name(name: &str) -> GwctlResult<()> {
    if name.is_empty() {
        return Err(GwctlError::InvalidParameter(
            "Interface name cannot be empty".to_string()
        ));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(GwctlError::InvalidParameter(
            format!("Interface name too long (max {} characters)", MAX_INTERFACE_NAME_LEN)
        ));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(GwctlError::InvalidParameter(
                format!("Invalid interface name '{}': contains invalid character '{}'", name, c)
            ));
        }
    }

    if name.starts_with('-') {
        return Err(GwctlError::InvalidParameter(
            "Interface name cannot start with dash".to_string()
        ));
    }

    Ok(())
}

/// Validate IP address
///
/// Uses Rust's built-in IP address parser to ensure valid format
pub fn validate_ip_address(addr: &str) -> GwctlResult<IpAddr> {
    addr.parse::<IpAddr>()
        .map_err(|_| GwctlError::InvalidParameter(
            format!("Invalid IP address: {}", addr)
        ))
}

/// Validate an IPv4 address specifically (DHCP and ring config are v4-only)
pub fn validate_ipv4_address(addr: &str) -> GwctlResult<Ipv4Addr> {
    addr.parse::<Ipv4Addr>()
        .map_err(|_| GwctlError::InvalidParameter(
            format!("Invalid IPv4 address: {}", addr)
        ))
}

/// Validate MAC address format and return the canonical lowercase form
///
/// Accepts standard MAC format: XX:XX:XX:XX:XX:XX (hex digits). MACs are
/// used as property-store path components, so canonicalization matters.
pub fn canonical_mac(mac: &str) -> GwctlResult<String> {
    if mac.len() != 17 {
        return Err(GwctlError::InvalidParameter(
            "MAC address must be in format XX:XX:XX:XX:XX:XX".to_string()
        ));
    }

    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(GwctlError::InvalidParameter(
            "MAC address must have 6 octets separated by colons".to_string()
        ));
    }

    for part in &parts {
        if part.len() != 2 {
            return Err(GwctlError::InvalidParameter(
                "Each MAC address octet must be 2 hex digits".to_string()
            ));
        }

        if !part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(GwctlError::InvalidParameter(
                format!("Invalid hex digit in MAC address: {}", part)
            ));
        }
    }

    Ok(mac.to_ascii_lowercase())
}

/// Validate a ring name
///
/// Ring names come from `@/dhcp/config` and become DHCP handler keys;
/// lowercase alphanumeric only.
pub fn validate_ring_name(name: &str) -> GwctlResult<()> {
    if name.is_empty() {
        return Err(GwctlError::InvalidParameter(
            "Ring name cannot be empty".to_string()
        ));
    }

    if !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(GwctlError::InvalidParameter(
            format!("Invalid ring name: {}", name)
        ));
    }

    Ok(())
}

/// Validate a daemon name from the definitions file
///
/// Daemon names are CTL targets and autostart-file keys
pub fn validate_daemon_name(name: &str) -> GwctlResult<()> {
    if name.is_empty() {
        return Err(GwctlError::InvalidParameter(
            "Daemon name cannot be empty".to_string()
        ));
    }

    if name.len() > MAX_DAEMON_NAME_LEN {
        return Err(GwctlError::InvalidParameter(
            format!("Daemon name too long (max {} characters)", MAX_DAEMON_NAME_LEN)
        ));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(GwctlError::InvalidParameter(
                format!("Invalid daemon name '{}': contains invalid character '{}'", name, c)
            ));
        }
    }

    Ok(())
}

/// Sanitize property-store values before writing them
///
/// Removes or rejects values containing dangerous characters
pub fn sanitize_property_value(value: &str) -> GwctlResult<String> {
    if value.chars().any(|c| c.is_control() && c != '\t') {
        return Err(GwctlError::InvalidParameter(
            "Property value contains invalid control characters".to_string()
        ));
    }

    if value.contains('\0') {
        return Err(GwctlError::InvalidParameter(
            "Property value contains null byte".to_string()
        ));
    }

    if value.len() > MAX_PROPERTY_VALUE_LEN {
        return Err(GwctlError::InvalidParameter(
            format!("Property value too long (max {} characters)", MAX_PROPERTY_VALUE_LEN)
        ));
    }

    Ok(value.to_string())
}

/// Validate hostname (DHCP option 12, DNS names)
pub fn validate_hostname(host: &str) -> GwctlResult<()> {
    if host.is_empty() {
        return Err(GwctlError::InvalidParameter(
            "Hostname cannot be empty".to_string()
        ));
    }

    if host.len() > 253 {
        return Err(GwctlError::InvalidParameter(
            "Hostname too long".to_string()
        ));
    }

    // Try parsing as IP address first
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    // Hostnames can contain alphanumeric, dash, underscore, and dots
    for c in host.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '.' && c != '_' {
            return Err(GwctlError::InvalidParameter(
                format!("Invalid hostname character: {}", c)
            ));
        }
    }

    // No leading/trailing dashes or dots
    if host.starts_with('-') || host.starts_with('.') ||
       host.ends_with('-') || host.ends_with('.') {
        return Err(GwctlError::InvalidParameter(
            "Invalid hostname format".to_string()
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_name_validation() {
        // Valid names
        assert!(validate_interface_name("eth0").is_ok());
        assert!(validate_interface_name("wlan0").is_ok());
        assert!(validate_interface_name("br-lan").is_ok());
        assert!(validate_interface_name("wlan0.100").is_ok());

        // Invalid names - injection attempts
        assert!(validate_interface_name("eth0; rm -rf /").is_err());
        assert!(validate_interface_name("eth0 && echo pwned").is_err());
        assert!(validate_interface_name("wlan0|ls").is_err());
        assert!(validate_interface_name("wlan0\nmalicious").is_err());

        // Invalid - too long
        assert!(validate_interface_name("verylonginterfacename").is_err());

        // Invalid - starts with dash
        assert!(validate_interface_name("-eth0").is_err());

        // Invalid - empty
        assert!(validate_interface_name("").is_err());
    }

    #[test]
    fn test_ip_validation() {
        assert!(validate_ip_address("192.168.1.1").is_ok());
        assert!(validate_ip_address("::1").is_ok());

        assert!(validate_ip_address("256.1.1.1").is_err());
        assert!(validate_ip_address("not_an_ip").is_err());

        // v4-only path rejects v6
        assert!(validate_ipv4_address("10.0.1.1").is_ok());
        assert!(validate_ipv4_address("fe80::1").is_err());
    }

    #[test]
    fn test_mac_canonicalization() {
        assert_eq!(
            canonical_mac("AA:BB:CC:00:11:22").unwrap(),
            "aa:bb:cc:00:11:22"
        );
        assert_eq!(
            canonical_mac("aa:bb:cc:dd:ee:ff").unwrap(),
            "aa:bb:cc:dd:ee:ff"
        );

        // Invalid format
        assert!(canonical_mac("00:11:22:33:44").is_err());
        assert!(canonical_mac("00-11-22-33-44-55").is_err());
        assert!(canonical_mac("invalid").is_err());
        assert!(canonical_mac("00:11:22:33:44:GG").is_err());
    }

    #[test]
    fn test_ring_name_validation() {
        assert!(validate_ring_name("standard").is_ok());
        assert!(validate_ring_name("unenrolled").is_ok());
        assert!(validate_ring_name("setup").is_ok());

        assert!(validate_ring_name("").is_err());
        assert!(validate_ring_name("Standard").is_err());
        assert!(validate_ring_name("ring name").is_err());
    }

    #[test]
    fn test_daemon_name_validation() {
        assert!(validate_daemon_name("dhcp4d").is_ok());
        assert!(validate_daemon_name("configd").is_ok());
        assert!(validate_daemon_name("httpd-dev").is_ok());

        assert!(validate_daemon_name("").is_err());
        assert!(validate_daemon_name("bad name").is_err());
        assert!(validate_daemon_name(&"x".repeat(40)).is_err());
    }

    #[test]
    fn test_hostname_validation() {
        assert!(validate_hostname("example.com").is_ok());
        assert!(validate_hostname("sub.example.com").is_ok());
        assert!(validate_hostname("192.168.1.1").is_ok());
        assert!(validate_hostname("host-name").is_ok());

        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("-invalid").is_err());
        assert!(validate_hostname("invalid-").is_err());
        assert!(validate_hostname(".invalid").is_err());
        assert!(validate_hostname("invalid.").is_err());
        assert!(validate_hostname("host name").is_err());
        assert!(validate_hostname("host;name").is_err());
    }

    #[test]
    fn test_property_value_sanitization() {
        assert!(sanitize_property_value("10.0.1.15").is_ok());
        assert!(sanitize_property_value("laptop-1").is_ok());

        assert!(sanitize_property_value("a\nb").is_err());
        assert!(sanitize_property_value(&"x".repeat(300)).is_err());
    }
}
