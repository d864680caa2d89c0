use crate::error::{Error, Result};

/// Check an identifier handed in by a caller: 1-63 characters drawn from
/// lowercase letters, digits, and interior hyphens.
pub fn validate_id(id: &str, what: &str) -> Result<()> {
    if !(1..=63).contains(&id.len()) {
        return Err(Error::InvalidInput(format!(
            "{} id {:?} must be between 1 and 63 characters",
            what, id
        )));
    }
    let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
    if let Some(bad) = id.chars().find(|c| !allowed(*c)) {
        return Err(Error::InvalidInput(format!(
            "{} id {:?} contains {:?}; only lowercase letters, digits, and hyphens are accepted",
            what, id, bad
        )));
    }
    if id.starts_with('-') || id.ends_with('-') {
        return Err(Error::InvalidInput(format!(
            "{} id {:?} cannot begin or end with a hyphen",
            what, id
        )));
    }
    Ok(())
}

/// Deterministic MAC address from a tenant private IP.
/// Format: 02:fc:xx:xx:00:xx (locally administered); the three variable
/// octets are the low three IP octets, so distinct IPs get distinct MACs.
pub fn mac_for_ip(ip: std::net::Ipv4Addr) -> String {
    let o = ip.octets();
    format!("02:fc:{:02x}:{:02x}:00:{:02x}", o[1], o[2], o[3])
}

/// Random locally-administered MAC, for CNCI vNICs that carry no tenant IP.
pub fn random_mac() -> String {
    let bytes = uuid::Uuid::new_v4();
    let b = bytes.as_bytes();
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4]
    )
}

/// Hostname handed to the guest: first uuid segment.
pub fn hostname_for(instance_id: &uuid::Uuid) -> String {
    let s = instance_id.to_string();
    s.split('-').next().unwrap_or(&s).to_string()
}
