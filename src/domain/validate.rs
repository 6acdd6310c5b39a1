//! Allow-list validation for dashboard input.
//!
//! Everything that may later reach an external program (the provisioner) or
//! the scrape configuration passes through here first.

use std::collections::BTreeMap;
use std::net::IpAddr;

use super::error::RegistryError;

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_DISPLAY_NAME_LEN: usize = 100;
const MAX_LABEL_VALUE_LEN: usize = 1024;

/// Labels owned by fleetwatch itself.
pub const RESERVED_LABELS: &[&str] = &["hostname", "os"];

/// Accept an IP literal or an RFC 1123 hostname, returned in canonical form.
///
/// IP literals are re-rendered (`FD00:0::5` becomes `fd00::5`) and hostnames
/// are lowercased, so equivalent spellings map to the same scrape target.
/// Dotted all-numeric names that do not parse as an IP (`010.0.0.5`) are
/// rejected rather than treated as hostnames.
pub fn address(raw: &str) -> Result<String, RegistryError> {
    let address = raw.trim();
    if address.is_empty() {
        return Err(RegistryError::invalid("address must not be empty"));
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }
    if address.len() > MAX_HOSTNAME_LEN {
        return Err(RegistryError::invalid(format!(
            "hostname longer than {MAX_HOSTNAME_LEN} characters"
        )));
    }

    let bytes = address.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_alphanumeric();
    let inner_ok = |b: u8| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.');
    let valid = edge_ok(bytes[0])
        && edge_ok(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| inner_ok(b))
        && !address.contains("..");
    if !valid {
        return Err(RegistryError::invalid(format!(
            "'{address}' is neither an IP address nor a valid hostname"
        )));
    }

    let numeric = address
        .split('.')
        .all(|label| label.bytes().all(|b| b.is_ascii_digit()));
    if numeric {
        return Err(RegistryError::invalid(format!(
            "'{address}' is not a valid IP address"
        )));
    }

    Ok(address.to_ascii_lowercase())
}

pub fn port(value: u16, what: &str) -> Result<u16, RegistryError> {
    if value == 0 {
        return Err(RegistryError::invalid(format!("{what} must be in 1..=65535")));
    }
    Ok(value)
}

/// Letters, digits, space, `.`, `_` and `-`.
pub fn display_name(raw: &str) -> Result<String, RegistryError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(RegistryError::invalid("display name must not be empty"));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(RegistryError::invalid(format!(
            "display name longer than {MAX_DISPLAY_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-'))
    {
        return Err(RegistryError::invalid(format!(
            "display name '{name}' contains unsupported characters"
        )));
    }
    Ok(name.to_string())
}

/// Prometheus label names: `[a-zA-Z_][a-zA-Z0-9_]*`, no `__` prefix, not reserved.
pub fn labels(raw: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>, RegistryError> {
    let mut out = BTreeMap::new();
    for (name, value) in raw {
        if !is_label_name(name) {
            return Err(RegistryError::invalid(format!("invalid label name '{name}'")));
        }
        if name.starts_with("__") {
            return Err(RegistryError::invalid(format!(
                "label '{name}' uses the reserved '__' prefix"
            )));
        }
        if RESERVED_LABELS.contains(&name.as_str()) {
            return Err(RegistryError::invalid(format!(
                "label '{name}' is set by fleetwatch and cannot be overridden"
            )));
        }
        if value.len() > MAX_LABEL_VALUE_LEN || value.chars().any(char::is_control) {
            return Err(RegistryError::invalid(format!(
                "invalid value for label '{name}'"
            )));
        }
        out.insert(name.clone(), value.clone());
    }
    Ok(out)
}

pub fn is_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Job names and prefixes: letters, digits, `_`, `-`, `.`.
pub fn is_job_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
