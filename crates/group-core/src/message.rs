//! Channel messages and their trailing markers.
//!
//! Stages append fixed-width markers to the end of the payload on the way
//! down and strip them in reverse order on the way up:
//!
//! ```text
//! | application bytes | seq (4) | frag index (4) | frag count (4) | is-fragment (1) |
//!                       ^ order    ^ fragmentation ------------------------------^
//! ```
//!
//! Stage order in the chain therefore decides the on-wire layout.

use crate::clock::now_millis;
use crate::error::{ChannelError, Result};
use crate::member::{Member, UniqueId};
use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};

/// Bitmask selecting which stages process a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SendOptions(u32);

impl SendOptions {
    pub const NONE: SendOptions = SendOptions(0);
    pub const BYTE_MESSAGE: SendOptions = SendOptions(0x0001);
    pub const USE_ACK: SendOptions = SendOptions(0x0002);
    pub const SYNCHRONIZED_ACK: SendOptions = SendOptions(0x0004);
    /// Caller returns immediately; the dispatch stage sends in the background
    pub const ASYNCHRONOUS: SendOptions = SendOptions(0x0008);
    pub const MULTICAST: SendOptions = SendOptions(0x0040);
    /// Per-sender FIFO delivery
    pub const ORDERED: SendOptions = SendOptions(0x0080);
    /// May be split when larger than the fragment size
    pub const FRAGMENTABLE: SendOptions = SendOptions(0x0100);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set. An empty mask is always contained.
    pub const fn contains(&self, other: SendOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SendOptions {
    type Output = SendOptions;

    fn bitor(self, rhs: SendOptions) -> SendOptions {
        SendOptions(self.0 | rhs.0)
    }
}

impl BitOrAssign for SendOptions {
    fn bitor_assign(&mut self, rhs: SendOptions) {
        self.0 |= rhs.0;
    }
}

/// One unit of application data travelling through the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    unique_id: UniqueId,
    payload: Vec<u8>,
    options: SendOptions,
    /// Originating member
    address: Member,
    /// Send time (ms since epoch)
    timestamp: u64,
}

impl ChannelMessage {
    /// Create a message with a fresh unique id, stamped with the current time.
    pub fn new(address: Member, payload: Vec<u8>, options: SendOptions) -> Self {
        Self {
            unique_id: UniqueId::generate(),
            payload,
            options,
            address,
            timestamp: now_millis(),
        }
    }

    /// Create a message with an explicit id and timestamp.
    pub fn with_id(
        unique_id: UniqueId,
        address: Member,
        payload: Vec<u8>,
        options: SendOptions,
        timestamp: u64,
    ) -> Self {
        Self {
            unique_id,
            payload,
            options,
            address,
            timestamp,
        }
    }

    pub fn unique_id(&self) -> &UniqueId {
        &self.unique_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn options(&self) -> SendOptions {
        self.options
    }

    pub fn address(&self) -> &Member {
        &self.address
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Independent copy that shares nothing with `self`.
    ///
    /// Stages that keep a message past the call that handed it to them
    /// (queues, reassembly buffers, per-destination fan-out) work on a
    /// detached copy.
    pub fn detached(&self) -> ChannelMessage {
        self.clone()
    }

    /// Copy of the header (id, options, origin, timestamp) with a new payload.
    pub fn with_payload(&self, payload: Vec<u8>) -> ChannelMessage {
        ChannelMessage {
            unique_id: self.unique_id,
            payload,
            options: self.options,
            address: self.address.clone(),
            timestamp: self.timestamp,
        }
    }

    // ==================== Trailing markers ====================

    pub fn push_u32(&mut self, value: u32) {
        self.payload.extend_from_slice(&value.to_be_bytes());
    }

    pub fn pop_u32(&mut self) -> Result<u32> {
        let at = self.trailer_start(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.payload[at..]);
        self.payload.truncate(at);
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn push_bool(&mut self, value: bool) {
        self.payload.push(u8::from(value));
    }

    pub fn pop_bool(&mut self) -> Result<bool> {
        let at = self.trailer_start(1)?;
        let value = self.payload[at] != 0;
        self.payload.truncate(at);
        Ok(value)
    }

    fn trailer_start(&self, needed: usize) -> Result<usize> {
        self.payload
            .len()
            .checked_sub(needed)
            .ok_or(ChannelError::MalformedTrailer {
                needed,
                available: self.payload.len(),
            })
    }

    // ==================== Wire codec ====================

    /// Encode the whole message (header and payload) for a byte transport.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
