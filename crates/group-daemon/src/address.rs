//! Parsing `host:port` arguments into members.

use group_core::Member;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("Invalid address {0:?}: expected host:port")]
    Malformed(String),

    #[error("Invalid port in {0:?}")]
    Port(String),
}

/// Parse `host:port`. The member's id is derived from the address, so every
/// node names a given peer the same way.
pub fn parse_member(address: &str) -> Result<Member, AddressError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| AddressError::Malformed(address.to_string()))?;

    if host.is_empty() {
        return Err(AddressError::Malformed(address.to_string()));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| AddressError::Port(address.to_string()))?;

    Ok(Member::from_address(host, port))
}
