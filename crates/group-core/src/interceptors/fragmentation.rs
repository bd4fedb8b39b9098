//! Fragmentation and reassembly of oversized messages.
//!
//! Outbound payloads longer than `max_size` are cut into `ceil(len / max_size)`
//! slices. Each slice travels as its own message carrying the parent's unique
//! id and three trailing markers: fragment index, fragment count and an
//! is-fragment flag. Messages that fit get only the flag (false).
//!
//! Inbound fragments are collected per unique id and released upward only
//! once every slot is filled. Collections older than `expire_ms` are purged
//! on heartbeat; their messages are lost and never partially delivered.

use crate::chain::{ChannelInterceptor, Next, Prev};
use crate::clock::now_millis;
use crate::error::{ChannelError, Result};
use crate::member::{Member, UniqueId};
use crate::message::{ChannelMessage, SendOptions};
use crate::payload::InterceptorPayload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, trace, warn};

/// Configuration for the fragmentation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentationConfig {
    /// Largest payload sent unsplit, in bytes (default: 100 KiB)
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Age after which an incomplete reassembly is discarded (default: 60s)
    #[serde(default = "default_expire_ms")]
    pub expire_ms: u64,
    /// Upper bound on fragments per message, both directions
    #[serde(default = "default_max_fragments")]
    pub max_fragments: u32,
    /// Options a message must carry to be fragmentable
    #[serde(default = "default_option_flag")]
    pub option_flag: SendOptions,
}

fn default_max_size() -> usize {
    1024 * 100
}

fn default_expire_ms() -> u64 {
    60_000
}

fn default_max_fragments() -> u32 {
    65_536
}

fn default_option_flag() -> SendOptions {
    SendOptions::FRAGMENTABLE
}

impl Default for FragmentationConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            expire_ms: default_expire_ms(),
            max_fragments: default_max_fragments(),
            option_flag: default_option_flag(),
        }
    }
}

/// Fragments of one message collected so far.
struct FragCollection {
    /// First fragment seen (ms since epoch)
    received_at: u64,
    /// Header of the parent message, empty payload
    template: ChannelMessage,
    slots: Vec<Option<Vec<u8>>>,
    filled: usize,
}

impl FragCollection {
    fn new(template: ChannelMessage, count: u32, now_ms: u64) -> Self {
        Self {
            received_at: now_ms,
            template,
            slots: vec![None; count as usize],
            filled: 0,
        }
    }

    fn add(&mut self, index: u32, data: Vec<u8>) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            if slot.is_none() {
                self.filled += 1;
            }
            *slot = Some(data);
        }
    }

    fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    fn is_expired(&self, expire_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.received_at) > expire_ms
    }

    fn assemble(self) -> ChannelMessage {
        let size = self.slots.iter().flatten().map(Vec::len).sum();
        let mut payload = Vec::with_capacity(size);
        for slot in self.slots.into_iter().flatten() {
            payload.extend_from_slice(&slot);
        }
        self.template.with_payload(payload)
    }
}

pub struct FragmentationInterceptor {
    config: FragmentationConfig,
    collections: Mutex<HashMap<UniqueId, FragCollection>>,
}

impl FragmentationInterceptor {
    pub fn new(config: FragmentationConfig) -> Self {
        Self {
            config,
            collections: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(FragmentationConfig::default())
    }

    pub fn config(&self) -> &FragmentationConfig {
        &self.config
    }

    /// Split a message into marked fragments, in index order.
    pub fn fragment(&self, msg: &ChannelMessage) -> Result<Vec<ChannelMessage>> {
        let max_size = self.config.max_size.max(1);
        let count = msg.len().div_ceil(max_size);

        if count > self.config.max_fragments as usize {
            return Err(ChannelError::TooManyFragments {
                size: msg.len(),
                fragments: count,
                limit: self.config.max_fragments,
            });
        }

        Ok(msg
            .payload()
            .chunks(max_size)
            .enumerate()
            .map(|(index, chunk)| {
                let mut fragment = msg.with_payload(chunk.to_vec());
                fragment.push_u32(index as u32);
                fragment.push_u32(count as u32);
                fragment.push_bool(true);
                fragment
            })
            .collect())
    }

    /// Store one fragment (is-fragment flag already stripped).
    ///
    /// Returns the reassembled message once the last missing slot arrives.
    pub fn defrag_at(&self, mut msg: ChannelMessage, now_ms: u64) -> Result<Option<ChannelMessage>> {
        let count = msg.pop_u32()?;
        let index = msg.pop_u32()?;

        if count == 0 || index >= count || count > self.config.max_fragments {
            return Err(ChannelError::InvalidFragment { index, count });
        }

        let id = *msg.unique_id();
        let mut collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());

        let collection = collections
            .entry(id)
            .or_insert_with(|| FragCollection::new(msg.with_payload(Vec::new()), count, now_ms));

        if collection.slots.len() != count as usize {
            return Err(ChannelError::InvalidFragment { index, count });
        }

        collection.add(index, msg.into_payload());
        trace!(
            "Fragment {}/{} of {} stored ({} of {} present)",
            index + 1,
            count,
            id,
            collection.filled,
            count
        );

        if !collection.is_complete() {
            return Ok(None);
        }

        Ok(collections.remove(&id).map(FragCollection::assemble))
    }

    /// Drop incomplete collections older than the expiry window.
    ///
    /// Returns how many were dropped.
    pub fn expire_at(&self, now_ms: u64) -> usize {
        let mut collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        let before = collections.len();
        collections.retain(|id, c| {
            let expired = c.is_expired(self.config.expire_ms, now_ms);
            if expired {
                debug!(
                    "Discarding incomplete message {} ({} of {} fragments received)",
                    id,
                    c.filled,
                    c.slots.len()
                );
            }
            !expired
        });
        before - collections.len()
    }

    /// Number of messages currently being reassembled.
    pub fn pending_count(&self) -> usize {
        self.collections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for FragmentationInterceptor {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl ChannelInterceptor for FragmentationInterceptor {
    fn name(&self) -> &'static str {
        "fragmentation"
    }

    fn option_flag(&self) -> SendOptions {
        self.config.option_flag
    }

    async fn send_message(
        &self,
        destinations: &[Member],
        mut msg: ChannelMessage,
        payload: Option<InterceptorPayload>,
        next: Next<'_>,
    ) -> Result<()> {
        if !self.ok_to_process(msg.options()) {
            return next.send_message(destinations, msg, payload).await;
        }

        if msg.len() <= self.config.max_size {
            msg.push_bool(false);
            return next.send_message(destinations, msg, payload).await;
        }

        let fragments = self.fragment(&msg)?;
        debug!(
            "Sending {} as {} fragments ({} bytes)",
            msg.unique_id(),
            fragments.len(),
            msg.len()
        );
        for fragment in fragments {
            next.send_message(destinations, fragment, payload.clone())
                .await?;
        }
        Ok(())
    }

    async fn message_received(&self, mut msg: ChannelMessage, prev: Prev<'_>) {
        if !self.ok_to_process(msg.options()) {
            return prev.message_received(msg).await;
        }

        let is_fragment = match msg.pop_bool() {
            Ok(flag) => flag,
            Err(e) => {
                warn!("Dropping message {} from {}: {}", msg.unique_id(), msg.address(), e);
                return;
            }
        };

        if !is_fragment {
            return prev.message_received(msg).await;
        }

        let id = *msg.unique_id();
        match self.defrag_at(msg, now_millis()) {
            Ok(Some(complete)) => prev.message_received(complete).await,
            Ok(None) => {}
            Err(e) => warn!("Dropping fragment of {}: {}", id, e),
        }
    }

    async fn heartbeat(&self, _next: Next<'_>, _prev: Prev<'_>) -> Result<()> {
        let dropped = self.expire_at(now_millis());
        if dropped > 0 {
            debug!("Expired {} incomplete message(s)", dropped);
        }
        Ok(())
    }
}
