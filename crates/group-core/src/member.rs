//! Member identity.
//!
//! A `Member` is identified by `(host, port, unique id)`. Every map and set in
//! the crate keys on that identity; the command marker and other metadata are
//! carried along but never take part in equality or hashing.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use uuid::Uuid;

/// 16-byte identifier used for members and for messages.
///
/// Fragments and retransmissions of one logical message share the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueId([u8; 16]);

impl UniqueId {
    /// Generate a new random id.
    pub fn generate() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derive a stable id from a name (e.g. a configured `host:port`).
    ///
    /// Two FNV-1a passes with different offsets fill the 16 bytes, so the
    /// same name always maps to the same id on every node.
    pub fn derive_from(name: &str) -> Self {
        let hi = fnv1a(name.as_bytes(), 0xcbf29ce484222325);
        let lo = fnv1a(name.as_bytes(), 0x84222325cbf29ce4);
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&hi.to_be_bytes());
        bytes[8..].copy_from_slice(&lo.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Display for UniqueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl FromStr for UniqueId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(*Uuid::parse_str(s)?.as_bytes()))
    }
}

fn fnv1a(data: &[u8], offset: u64) -> u64 {
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = offset;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Command marker a member carries alongside its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MemberCommand {
    /// Regular member, no pending command
    #[default]
    None,
    /// Member is leaving voluntarily (clean shutdown)
    Shutdown,
    /// Command byte we don't interpret
    Other(u8),
}

impl MemberCommand {
    pub fn as_byte(&self) -> u8 {
        match self {
            MemberCommand::None => 0,
            MemberCommand::Shutdown => 1,
            MemberCommand::Other(b) => *b,
        }
    }
}

impl From<u8> for MemberCommand {
    fn from(b: u8) -> Self {
        match b {
            0 => MemberCommand::None,
            1 => MemberCommand::Shutdown,
            other => MemberCommand::Other(other),
        }
    }
}

/// A node participating in the group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    host: String,
    port: u16,
    unique_id: UniqueId,
    command: MemberCommand,
}

impl Member {
    pub fn new(host: impl Into<String>, port: u16, unique_id: UniqueId) -> Self {
        Self {
            host: host.into(),
            port,
            unique_id,
            command: MemberCommand::None,
        }
    }

    /// Member whose id is derived from its address.
    ///
    /// Used for statically configured peers where both ends must agree on
    /// the id without exchanging it first.
    pub fn from_address(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let unique_id = UniqueId::derive_from(&format!("{}:{}", host, port));
        Self::new(host, port, unique_id)
    }

    /// Same member with a command marker attached.
    pub fn with_command(mut self, command: MemberCommand) -> Self {
        self.command = command;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn unique_id(&self) -> &UniqueId {
        &self.unique_id
    }

    pub fn command(&self) -> MemberCommand {
        self.command
    }

    /// True when the member announced a voluntary departure.
    pub fn is_shutdown(&self) -> bool {
        self.command == MemberCommand::Shutdown
    }

    /// `host:port` string suitable for connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.unique_id == other.unique_id && self.port == other.port && self.host == other.host
    }
}

impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.unique_id.hash(state);
    }
}

impl Display for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_ignores_command() {
        let id = UniqueId::from_bytes([7; 16]);
        let a = Member::new("10.0.0.1", 4000, id);
        let b = Member::new("10.0.0.1", 4000, id).with_command(MemberCommand::Shutdown);

        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_equality_uses_identity() {
        let a = Member::new("10.0.0.1", 4000, UniqueId::from_bytes([1; 16]));
        let other_id = Member::new("10.0.0.1", 4000, UniqueId::from_bytes([2; 16]));
        let other_port = Member::new("10.0.0.1", 4001, UniqueId::from_bytes([1; 16]));

        assert_ne!(a, other_id);
        assert_ne!(a, other_port);
    }

    #[test]
    fn test_shutdown_command() {
        let m = Member::from_address("localhost", 4000);
        assert!(!m.is_shutdown());
        assert!(m.with_command(MemberCommand::Shutdown).is_shutdown());
    }

    #[test]
    fn test_command_byte_mapping() {
        assert_eq!(MemberCommand::from(0), MemberCommand::None);
        assert_eq!(MemberCommand::from(1), MemberCommand::Shutdown);
        assert_eq!(MemberCommand::from(9), MemberCommand::Other(9));
        assert_eq!(MemberCommand::Other(9).as_byte(), 9);
    }

    #[test]
    fn test_derived_id_is_stable() {
        let a = Member::from_address("10.0.0.1", 4000);
        let b = Member::from_address("10.0.0.1", 4000);
        let c = Member::from_address("10.0.0.1", 4001);

        assert_eq!(a.unique_id(), b.unique_id());
        assert_ne!(a.unique_id(), c.unique_id());
    }

    #[test]
    fn test_unique_id_display_parse() {
        let id = UniqueId::generate();
        let parsed: UniqueId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_address() {
        let m = Member::from_address("127.0.0.1", 4000);
        assert_eq!(m.address(), "127.0.0.1:4000");
        assert_eq!(m.to_string(), "127.0.0.1:4000");
    }
}
