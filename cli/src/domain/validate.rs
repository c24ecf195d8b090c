//! Pure input validation — no I/O, no async.
//!
//! Every function here is a total classifier over untrusted strings: input
//! either matches a known-safe grammar and comes back in canonical form, or
//! it is rejected with a `ValidationError`. There is deliberately no
//! "sanitize" variant — repairing hostile input and proceeding is how
//! injection bugs survive review.
//!
//! These validators are the last line of defense before values reach the
//! command executor, so the grammars are allow-lists, never deny-lists.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::domain::error::ValidationError;

/// Shell metacharacters and control bytes that no validated value may carry.
/// Checked up front so every grammar rejects them for the same reason.
pub static SHELL_METACHAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Safety: compile-time constant pattern — cannot fail.
    #[allow(clippy::expect_used)]
    Regex::new(r#"[;|&`$()\\<>!#~*?\[\]{}'"[:space:]]"#).expect("valid regex")
});

/// RFC 1123 hostname label: alphanumeric, hyphens inside only, max 63 chars.
static HOSTNAME_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?$").expect("valid regex")
});

/// Linux interface name: starts with a letter, then up to 14 of a small
/// allowed set (IFNAMSIZ is 16 including the NUL terminator).
static INTERFACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9_.:-]{0,14}$").expect("valid regex")
});

/// Interface names that are never a valid target for provisioning.
const RESERVED_INTERFACES: &[&str] = &["lo"];

/// Debian/RPM package name: starts alphanumeric, then alphanumeric plus
/// `+ . _ -`.
static PACKAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9+._-]*$").expect("valid regex")
});

/// MAC address with `:` or `-` separators.
static MAC_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^([0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}$").expect("valid regex")
});

/// WireGuard key: exactly 44 chars of base64 ending in `=` (32 raw bytes).
static WIREGUARD_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[A-Za-z0-9+/]{43}=$").expect("valid regex")
});

/// Reject values carrying shell metacharacters, whitespace, or NUL.
///
/// Every public validator calls this first, so hostile input is refused for
/// a deterministic reason before any grammar-specific parsing runs.
fn reject_metacharacters(field: &'static str, raw: &str) -> Result<(), ValidationError> {
    if raw.contains('\0') {
        return Err(ValidationError::new(field, "contains NUL byte"));
    }
    if SHELL_METACHAR_RE.is_match(raw) {
        return Err(ValidationError::new(
            field,
            "contains shell metacharacters or whitespace",
        ));
    }
    Ok(())
}

/// Validate an RFC 1123 hostname. Returns the hostname lowercased.
///
/// # Errors
///
/// Rejects empty input, overall length > 253, empty labels, labels over 63
/// chars, and any character outside the label grammar.
pub fn hostname(raw: &str) -> Result<String, ValidationError> {
    const FIELD: &str = "hostname";
    reject_metacharacters(FIELD, raw)?;
    if raw.is_empty() {
        return Err(ValidationError::new(FIELD, "empty"));
    }
    if raw.len() > 253 {
        return Err(ValidationError::new(FIELD, "longer than 253 characters"));
    }
    for label in raw.split('.') {
        if label.is_empty() {
            return Err(ValidationError::new(FIELD, "empty label"));
        }
        if label.len() > 63 {
            return Err(ValidationError::new(FIELD, "label longer than 63 characters"));
        }
        if !HOSTNAME_LABEL_RE.is_match(label) {
            return Err(ValidationError::new(FIELD, "label violates RFC 1123"));
        }
    }
    Ok(raw.to_ascii_lowercase())
}

/// Validate an IPv4 or IPv6 address. Returns the canonical form produced by
/// `std::net` re-serialization, defeating non-canonical encodings
/// (`010.0.0.1`, zone tricks, embedded whitespace).
///
/// # Errors
///
/// Rejects anything `std::net` cannot parse.
pub fn ip_address(raw: &str) -> Result<String, ValidationError> {
    const FIELD: &str = "IP address";
    reject_metacharacters(FIELD, raw)?;
    let addr: IpAddr = raw
        .parse()
        .map_err(|_| ValidationError::new(FIELD, "not a valid IP address"))?;
    Ok(addr.to_string())
}

/// Validate an IPv4 address specifically.
///
/// # Errors
///
/// Rejects IPv6 addresses and anything unparseable.
pub fn ipv4_address(raw: &str) -> Result<String, ValidationError> {
    const FIELD: &str = "IPv4 address";
    reject_metacharacters(FIELD, raw)?;
    let addr: Ipv4Addr = raw
        .parse()
        .map_err(|_| ValidationError::new(FIELD, "not a valid IPv4 address"))?;
    Ok(addr.to_string())
}

/// Validate IPv4 CIDR notation. The address and prefix length are parsed
/// separately, host bits are masked off, and the canonical
/// `network/prefix` form is returned — `10.66.66.5/24` becomes
/// `10.66.66.0/24`.
///
/// # Errors
///
/// Rejects missing or out-of-range prefix lengths and unparseable addresses.
pub fn cidr(raw: &str) -> Result<String, ValidationError> {
    const FIELD: &str = "CIDR block";
    reject_metacharacters(FIELD, raw)?;
    let (addr_part, prefix_part) = raw
        .split_once('/')
        .ok_or_else(|| ValidationError::new(FIELD, "missing /prefix"))?;
    let addr: Ipv4Addr = addr_part
        .parse()
        .map_err(|_| ValidationError::new(FIELD, "not a valid IPv4 address"))?;
    let prefix: u32 = prefix_part
        .parse()
        .map_err(|_| ValidationError::new(FIELD, "prefix is not a number"))?;
    if prefix > 32 {
        return Err(ValidationError::new(FIELD, "prefix must be 0-32"));
    }
    let mask: u32 = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    let network = Ipv4Addr::from(u32::from(addr) & mask);
    Ok(format!("{network}/{prefix}"))
}

/// Validate a TCP/UDP port. Returns the canonical decimal form.
///
/// # Errors
///
/// Rejects 0, values over 65535, and non-numeric input.
pub fn port(raw: &str) -> Result<String, ValidationError> {
    const FIELD: &str = "port";
    reject_metacharacters(FIELD, raw)?;
    let value: u16 = raw
        .parse()
        .map_err(|_| ValidationError::new(FIELD, "not a number in 1-65535"))?;
    if value == 0 {
        return Err(ValidationError::new(FIELD, "port 0 is not usable"));
    }
    Ok(value.to_string())
}

/// Validate a MAC address (`:` or `-` separated). Returns the lowercase
/// colon-separated canonical form.
///
/// # Errors
///
/// Rejects anything not matching six hex octet pairs.
pub fn mac_address(raw: &str) -> Result<String, ValidationError> {
    const FIELD: &str = "MAC address";
    reject_metacharacters(FIELD, raw)?;
    if !MAC_RE.is_match(raw) {
        return Err(ValidationError::new(FIELD, "not a valid MAC address"));
    }
    Ok(raw.replace('-', ":").to_ascii_lowercase())
}

/// Validate a network interface name against the kernel grammar and the
/// reserved blocklist.
///
/// # Errors
///
/// Rejects empty names, names over 15 chars, reserved names (`lo`), and any
/// character outside the interface grammar.
pub fn interface_name(raw: &str) -> Result<String, ValidationError> {
    const FIELD: &str = "interface name";
    reject_metacharacters(FIELD, raw)?;
    if raw.is_empty() {
        return Err(ValidationError::new(FIELD, "empty"));
    }
    if !INTERFACE_RE.is_match(raw) {
        return Err(ValidationError::new(
            FIELD,
            "must start with a letter and use only [a-zA-Z0-9_.:-], max 15 chars",
        ));
    }
    if RESERVED_INTERFACES.contains(&raw) {
        return Err(ValidationError::new(FIELD, "reserved interface"));
    }
    Ok(raw.to_string())
}

/// Validate a Debian/RPM package name.
///
/// # Errors
///
/// Rejects empty names, names over 256 chars, and any character outside the
/// package grammar.
pub fn package_name(raw: &str) -> Result<String, ValidationError> {
    const FIELD: &str = "package name";
    reject_metacharacters(FIELD, raw)?;
    if raw.is_empty() {
        return Err(ValidationError::new(FIELD, "empty"));
    }
    if raw.len() > 256 {
        return Err(ValidationError::new(FIELD, "longer than 256 characters"));
    }
    if !PACKAGE_RE.is_match(raw) {
        return Err(ValidationError::new(
            FIELD,
            "must start alphanumeric and use only [a-zA-Z0-9+._-]",
        ));
    }
    Ok(raw.to_string())
}

/// Validate that `raw` names a path confined to `base`.
///
/// Normalization is lexical (no filesystem access): `..` components are
/// resolved against the joined path and the result must still start with
/// `base`. NUL bytes are rejected outright.
///
/// # Errors
///
/// Rejects NUL bytes, `~` expansion attempts, and any path whose normalized
/// form escapes `base`.
pub fn safe_path(raw: &str, base: &Path) -> Result<PathBuf, ValidationError> {
    const FIELD: &str = "path";
    if raw.contains('\0') {
        return Err(ValidationError::new(FIELD, "contains NUL byte"));
    }
    if raw.starts_with('~') {
        return Err(ValidationError::new(FIELD, "home expansion not allowed"));
    }
    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    };
    let normalized = normalize_lexically(&joined);
    let base_norm = normalize_lexically(base);
    if !normalized.starts_with(&base_norm) {
        return Err(ValidationError::new(FIELD, "escapes the allowed directory"));
    }
    Ok(normalized)
}

/// Classify a WireGuard key (44-char base64 of 32 bytes).
///
/// Used both to validate keys read back from `wg genkey` and by the command
/// executor's argv guard to detect secret material where it must not appear.
#[must_use]
pub fn is_wireguard_key(raw: &str) -> bool {
    WIREGUARD_KEY_RE.is_match(raw)
}

/// Resolve `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
