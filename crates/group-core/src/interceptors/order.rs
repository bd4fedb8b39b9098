//! Per-sender FIFO delivery.
//!
//! Every outbound message gets a trailing sequence number taken from a
//! counter kept per destination, so a multi-destination send is stamped once
//! per destination. Inbound, each source has an expected counter starting at
//! 1 and a list of messages that arrived early, sorted by sequence.
//!
//! Pending messages are released early, out of turn, when they wait longer
//! than `expire_ms` or when a source's list grows past `max_queue`. Released
//! messages are forwarded or dropped according to `forward_expired`, and the
//! expected counter jumps past them. A forced release always walks the list
//! in ascending sequence order.
//!
//! Sequence numbers below the expected counter are duplicates and are
//! dropped.

use crate::chain::{ChannelInterceptor, Next, Prev};
use crate::clock::now_millis;
use crate::error::Result;
use crate::member::Member;
use crate::message::{ChannelMessage, SendOptions};
use crate::payload::InterceptorPayload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Configuration for the order stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfig {
    /// How long an early message may wait for its predecessors (default: 3s)
    #[serde(default = "default_expire_ms")]
    pub expire_ms: u64,
    /// Largest pending list per source before it is flushed
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    /// Deliver flushed messages out of order (true) or drop them (false)
    #[serde(default = "default_forward_expired")]
    pub forward_expired: bool,
    /// Options a message must carry to be ordered
    #[serde(default = "default_option_flag")]
    pub option_flag: SendOptions,
}

fn default_expire_ms() -> u64 {
    3_000
}

fn default_max_queue() -> usize {
    i32::MAX as usize
}

fn default_forward_expired() -> bool {
    true
}

fn default_option_flag() -> SendOptions {
    SendOptions::ORDERED
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            expire_ms: default_expire_ms(),
            max_queue: default_max_queue(),
            forward_expired: default_forward_expired(),
            option_flag: default_option_flag(),
        }
    }
}

/// A message that arrived before its turn.
#[derive(Debug)]
struct PendingMessage {
    seq: u32,
    /// Arrival time (ms since epoch)
    received_at: u64,
    msg: ChannelMessage,
}

/// Receive-side state for one source.
#[derive(Debug)]
struct IncomingState {
    /// Next sequence number to deliver
    expected: u32,
    /// Early arrivals, ascending by sequence
    pending: Vec<PendingMessage>,
}

impl IncomingState {
    fn new() -> Self {
        Self {
            expected: 1,
            pending: Vec::new(),
        }
    }

    /// Insert in sorted position. Returns false for a repeated sequence.
    fn insert(&mut self, entry: PendingMessage) -> bool {
        match self.pending.binary_search_by_key(&entry.seq, |p| p.seq) {
            Ok(_) => false,
            Err(pos) => {
                self.pending.insert(pos, entry);
                true
            }
        }
    }

    /// Move every pending message that is now in turn to `ready`.
    fn drain_ready(&mut self, ready: &mut Vec<ChannelMessage>) {
        while let Some(head) = self.pending.first() {
            if head.seq > self.expected {
                break;
            }
            let head = self.pending.remove(0);
            if head.seq == self.expected {
                self.expected = self.expected.wrapping_add(1);
                ready.push(head.msg);
            } else {
                trace!("Dropping stale pending message seq {}", head.seq);
            }
        }
    }

    /// Release the first `count` pending messages out of turn.
    fn release(&mut self, count: usize, forward: bool, ready: &mut Vec<ChannelMessage>) {
        for entry in self.pending.drain(..count) {
            self.expected = self.expected.max(entry.seq.wrapping_add(1));
            if forward {
                ready.push(entry.msg);
            } else {
                debug!(
                    "Dropping message seq {} from {} (waited too long)",
                    entry.seq,
                    entry.msg.address()
                );
            }
        }
    }

    /// Release whatever has expired or overflowed, then drain.
    fn flush(&mut self, config: &OrderConfig, now_ms: u64, ready: &mut Vec<ChannelMessage>) {
        let count = if self.pending.len() > config.max_queue {
            warn!(
                "Pending order queue exceeded {} entries, flushing {}",
                config.max_queue,
                self.pending.len()
            );
            self.pending.len()
        } else {
            // Everything up to the highest-sequence expired entry goes, so
            // lower sequences still waiting are not overtaken.
            self.pending
                .iter()
                .rposition(|p| now_ms.saturating_sub(p.received_at) >= config.expire_ms)
                .map_or(0, |i| i + 1)
        };

        if count > 0 {
            self.release(count, config.forward_expired, ready);
            self.drain_ready(ready);
        }
    }
}

pub struct OrderInterceptor {
    config: OrderConfig,
    /// Last sequence sent per destination
    outgoing: RwLock<HashMap<Member, Arc<AtomicU32>>>,
    /// Receive state per source. Held while delivering so that concurrent
    /// receivers can't interleave one source's messages.
    incoming: Mutex<HashMap<Member, IncomingState>>,
}

impl OrderInterceptor {
    pub fn new(config: OrderConfig) -> Self {
        Self {
            config,
            outgoing: RwLock::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(OrderConfig::default())
    }

    pub fn config(&self) -> &OrderConfig {
        &self.config
    }

    /// Take the next outgoing sequence number for `destination`.
    pub fn next_sequence(&self, destination: &Member) -> u32 {
        let existing = self
            .outgoing
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(destination)
            .cloned();

        let counter = match existing {
            Some(counter) => counter,
            None => self
                .outgoing
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .entry(destination.clone())
                .or_insert_with(|| Arc::new(AtomicU32::new(0)))
                .clone(),
        };

        counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Last sequence number sent to `destination` (0 if none).
    pub fn outgoing_sequence(&self, destination: &Member) -> u32 {
        self.outgoing
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(destination)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    /// Next sequence number expected from `source`, if it has sent anything.
    pub async fn expected_sequence(&self, source: &Member) -> Option<u32> {
        self.incoming.lock().await.get(source).map(|s| s.expected)
    }

    /// Number of early messages waiting from `source`.
    pub async fn pending_len(&self, source: &Member) -> usize {
        self.incoming
            .lock()
            .await
            .get(source)
            .map_or(0, |s| s.pending.len())
    }

    fn accept(
        &self,
        incoming: &mut HashMap<Member, IncomingState>,
        msg: ChannelMessage,
        seq: u32,
        now_ms: u64,
    ) -> Vec<ChannelMessage> {
        let state = incoming
            .entry(msg.address().clone())
            .or_insert_with(IncomingState::new);
        let mut ready = Vec::new();

        if seq < state.expected {
            debug!(
                "Dropping duplicate seq {} from {} (expected {})",
                seq,
                msg.address(),
                state.expected
            );
        } else if seq == state.expected {
            state.expected = state.expected.wrapping_add(1);
            ready.push(msg);
        } else {
            trace!(
                "Holding seq {} from {} (expected {})",
                seq,
                msg.address(),
                state.expected
            );
            let inserted = state.insert(PendingMessage {
                seq,
                received_at: now_ms,
                msg,
            });
            if !inserted {
                debug!("Dropping duplicate pending seq {}", seq);
            }
        }

        state.drain_ready(&mut ready);
        state.flush(&self.config, now_ms, &mut ready);
        ready
    }

    /// Strip the sequence number and return everything now deliverable, in order.
    pub async fn accept_at(&self, mut msg: ChannelMessage, now_ms: u64) -> Result<Vec<ChannelMessage>> {
        let seq = msg.pop_u32()?;
        let mut incoming = self.incoming.lock().await;
        Ok(self.accept(&mut incoming, msg, seq, now_ms))
    }

    /// Release expired pending messages from every source.
    pub async fn expire_at(&self, now_ms: u64) -> Vec<ChannelMessage> {
        let mut incoming = self.incoming.lock().await;
        let mut ready = Vec::new();
        for state in incoming.values_mut() {
            state.flush(&self.config, now_ms, &mut ready);
        }
        ready
    }
}

impl Default for OrderInterceptor {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl ChannelInterceptor for OrderInterceptor {
    fn name(&self) -> &'static str {
        "order"
    }

    fn option_flag(&self) -> SendOptions {
        self.config.option_flag
    }

    async fn send_message(
        &self,
        destinations: &[Member],
        msg: ChannelMessage,
        payload: Option<InterceptorPayload>,
        next: Next<'_>,
    ) -> Result<()> {
        if !self.ok_to_process(msg.options()) {
            return next.send_message(destinations, msg, payload).await;
        }

        let mut first_error = None;
        for destination in destinations {
            let mut copy = msg.detached();
            copy.push_u32(self.next_sequence(destination));

            if let Err(e) = next
                .send_message(std::slice::from_ref(destination), copy, payload.clone())
                .await
            {
                warn!("Ordered send to {} failed: {}", destination, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn message_received(&self, mut msg: ChannelMessage, prev: Prev<'_>) {
        if !self.ok_to_process(msg.options()) {
            return prev.message_received(msg).await;
        }

        let seq = match msg.pop_u32() {
            Ok(seq) => seq,
            Err(e) => {
                warn!("Dropping message {} from {}: {}", msg.unique_id(), msg.address(), e);
                return;
            }
        };

        let mut incoming = self.incoming.lock().await;
        let ready = self.accept(&mut incoming, msg, seq, now_millis());
        for m in ready {
            prev.message_received(m).await;
        }
    }

    async fn member_disappeared(&self, member: Member, prev: Prev<'_>) {
        {
            let mut incoming = self.incoming.lock().await;
            if let Some(mut state) = incoming.remove(&member) {
                let count = state.pending.len();
                if count > 0 {
                    debug!("Flushing {} pending message(s) from departed {}", count, member);
                }
                let mut ready = Vec::new();
                state.release(count, self.config.forward_expired, &mut ready);
                for m in ready {
                    prev.message_received(m).await;
                }
            }
        }

        self.outgoing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&member);

        prev.member_disappeared(member).await
    }

    async fn heartbeat(&self, _next: Next<'_>, prev: Prev<'_>) -> Result<()> {
        let mut incoming = self.incoming.lock().await;
        let mut ready = Vec::new();
        for state in incoming.values_mut() {
            state.flush(&self.config, now_millis(), &mut ready);
        }
        for m in ready {
            prev.message_received(m).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::harness;
    use crate::member::UniqueId;
    use rand::seq::SliceRandom;

    fn source() -> Member {
        Member::from_address("10.0.0.5", 4000)
    }

    fn other_source() -> Member {
        Member::from_address("10.0.0.6", 4000)
    }

    fn ordered(from: &Member, seq: u32, body: &[u8]) -> ChannelMessage {
        let mut msg = ChannelMessage::new(from.clone(), body.to_vec(), SendOptions::ORDERED);
        msg.push_u32(seq);
        msg
    }

    fn bodies(msgs: &[ChannelMessage]) -> Vec<Vec<u8>> {
        msgs.iter().map(|m| m.payload().to_vec()).collect()
    }

    fn stage(expire_ms: u64, max_queue: usize, forward_expired: bool) -> OrderInterceptor {
        OrderInterceptor::new(OrderConfig {
            expire_ms,
            max_queue,
            forward_expired,
            ..Default::default()
        })
    }

    // ==================== Receive ordering ====================

    #[tokio::test]
    async fn test_in_order_delivers_immediately() {
        let order = OrderInterceptor::with_defaults();

        let out = order.accept_at(ordered(&source(), 1, b"a"), 0).await.unwrap();
        assert_eq!(bodies(&out), vec![b"a".to_vec()]);
        assert_eq!(order.expected_sequence(&source()).await, Some(2));
    }

    #[tokio::test]
    async fn test_gap_is_filled_in_order() {
        let order = OrderInterceptor::with_defaults();

        assert!(order.accept_at(ordered(&source(), 3, b"c"), 0).await.unwrap().is_empty());
        assert!(order.accept_at(ordered(&source(), 2, b"b"), 0).await.unwrap().is_empty());
        assert_eq!(order.pending_len(&source()).await, 2);

        let out = order.accept_at(ordered(&source(), 1, b"a"), 0).await.unwrap();
        assert_eq!(bodies(&out), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(order.pending_len(&source()).await, 0);
        assert_eq!(order.expected_sequence(&source()).await, Some(4));
    }

    #[tokio::test]
    async fn test_duplicates_dropped() {
        let order = OrderInterceptor::with_defaults();

        let mut delivered = Vec::new();
        for seq in [1, 1, 3, 3, 2, 2, 1] {
            delivered.extend(
                order
                    .accept_at(ordered(&source(), seq, &[seq as u8]), 0)
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(bodies(&delivered), vec![vec![1], vec![2], vec![3]]);
    }

    #[tokio::test]
    async fn test_sources_are_independent() {
        let order = OrderInterceptor::with_defaults();

        assert!(order.accept_at(ordered(&source(), 2, b"a2"), 0).await.unwrap().is_empty());
        let out = order.accept_at(ordered(&other_source(), 1, b"b1"), 0).await.unwrap();

        assert_eq!(bodies(&out), vec![b"b1".to_vec()]);
        assert_eq!(order.pending_len(&source()).await, 1);
    }

    #[tokio::test]
    async fn test_missing_sequence_dropped() {
        let (pipeline, _, listener) = harness(vec![Arc::new(OrderInterceptor::with_defaults())]);

        let msg = ChannelMessage::new(source(), vec![1], SendOptions::ORDERED);
        pipeline.tail().message_received(msg).await;

        assert!(listener.payloads().is_empty());
    }

    // ==================== Expiry and overflow ====================

    #[tokio::test]
    async fn test_expired_gap_forwarded_out_of_order() {
        let order = stage(3_000, usize::MAX, true);

        let out = order.accept_at(ordered(&source(), 1, b"1"), 10_000).await.unwrap();
        assert_eq!(bodies(&out), vec![b"1".to_vec()]);

        assert!(order.accept_at(ordered(&source(), 3, b"3"), 10_000).await.unwrap().is_empty());
        assert!(order.expire_at(12_999).await.is_empty());

        let out = order.expire_at(13_000).await;
        assert_eq!(bodies(&out), vec![b"3".to_vec()]);
        assert_eq!(order.expected_sequence(&source()).await, Some(4));

        // Late arrival of the skipped message is a duplicate now
        assert!(order.accept_at(ordered(&source(), 2, b"2"), 13_001).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_gap_dropped_when_not_forwarding() {
        let order = stage(3_000, usize::MAX, false);

        order.accept_at(ordered(&source(), 1, b"1"), 0).await.unwrap();
        order.accept_at(ordered(&source(), 3, b"3"), 0).await.unwrap();

        assert!(order.expire_at(5_000).await.is_empty());
        assert_eq!(order.expected_sequence(&source()).await, Some(4));
        assert_eq!(order.pending_len(&source()).await, 0);
    }

    #[tokio::test]
    async fn test_expiry_releases_lower_sequences_first() {
        let order = stage(3_000, usize::MAX, true);

        // seq 4 waits longest, seq 3 arrives later; both behind missing seq 1-2
        order.accept_at(ordered(&source(), 4, b"4"), 0).await.unwrap();
        order.accept_at(ordered(&source(), 3, b"3"), 2_000).await.unwrap();
        order.accept_at(ordered(&source(), 6, b"6"), 2_500).await.unwrap();

        let out = order.expire_at(3_000).await;
        assert_eq!(bodies(&out), vec![b"3".to_vec(), b"4".to_vec()]);
        assert_eq!(order.expected_sequence(&source()).await, Some(5));
        assert_eq!(order.pending_len(&source()).await, 1);
    }

    #[tokio::test]
    async fn test_expiry_on_arrival_then_drains_successors() {
        let order = stage(3_000, usize::MAX, true);

        order.accept_at(ordered(&source(), 3, b"3"), 0).await.unwrap();
        // seq 4 arriving after seq 3 expired pulls both through
        let out = order.accept_at(ordered(&source(), 4, b"4"), 4_000).await.unwrap();

        assert_eq!(bodies(&out), vec![b"3".to_vec(), b"4".to_vec()]);
        assert_eq!(order.expected_sequence(&source()).await, Some(5));
    }

    #[tokio::test]
    async fn test_overflow_flushes_backlog_in_order() {
        let order = stage(u64::MAX, 3, true);

        for seq in [5, 3, 4] {
            assert!(order.accept_at(ordered(&source(), seq, &[seq as u8]), 0).await.unwrap().is_empty());
            assert!(order.pending_len(&source()).await <= 3);
        }

        let out = order.accept_at(ordered(&source(), 7, &[7]), 0).await.unwrap();
        assert_eq!(bodies(&out), vec![vec![3], vec![4], vec![5], vec![7]]);
        assert_eq!(order.pending_len(&source()).await, 0);
        assert_eq!(order.expected_sequence(&source()).await, Some(8));
    }

    // ==================== Send path ====================

    #[tokio::test]
    async fn test_send_stamps_each_destination() {
        let order = Arc::new(OrderInterceptor::with_defaults());
        let (pipeline, wire, _) = harness(vec![order.clone()]);
        let a = Member::from_address("10.0.0.1", 1);
        let b = Member::from_address("10.0.0.2", 2);

        for _ in 0..2 {
            let msg = ChannelMessage::new(source(), b"x".to_vec(), SendOptions::ORDERED);
            pipeline
                .head()
                .send_message(&[a.clone(), b.clone()], msg, None)
                .await
                .unwrap();
        }
        let msg = ChannelMessage::new(source(), b"y".to_vec(), SendOptions::ORDERED);
        pipeline.head().send_message(&[a.clone()], msg, None).await.unwrap();

        let mut per_dest: HashMap<Member, Vec<u32>> = HashMap::new();
        for (dests, mut m) in wire.sent() {
            assert_eq!(dests.len(), 1);
            per_dest
                .entry(dests[0].clone())
                .or_default()
                .push(m.pop_u32().unwrap());
        }

        assert_eq!(per_dest[&a], vec![1, 2, 3]);
        assert_eq!(per_dest[&b], vec![1, 2]);
        assert_eq!(order.outgoing_sequence(&a), 3);
    }

    #[tokio::test]
    async fn test_unordered_passes_through() {
        let (pipeline, wire, listener) = harness(vec![Arc::new(OrderInterceptor::with_defaults())]);
        let a = Member::from_address("10.0.0.1", 1);

        let msg = ChannelMessage::new(source(), b"x".to_vec(), SendOptions::ASYNCHRONOUS);
        pipeline
            .head()
            .send_message(&[a.clone()], msg.clone(), None)
            .await
            .unwrap();
        assert_eq!(wire.sent_messages()[0].payload(), b"x");

        pipeline.tail().message_received(msg).await;
        assert_eq!(listener.payloads(), vec![b"x".to_vec()]);
    }

    // ==================== Pipeline behaviour ====================

    #[tokio::test]
    async fn test_shuffled_duplicated_stream_delivered_in_send_order() {
        let (sender, wire, _) = harness(vec![Arc::new(OrderInterceptor::with_defaults())]);
        let (receiver, _, listener) = harness(vec![Arc::new(OrderInterceptor::with_defaults())]);
        let dest = Member::from_address("10.0.0.9", 9);

        for i in 0..50u8 {
            let msg = ChannelMessage::with_id(
                UniqueId::generate(),
                source(),
                vec![i],
                SendOptions::ORDERED,
                0,
            );
            sender.head().send_message(&[dest.clone()], msg, None).await.unwrap();
        }

        let mut on_wire = wire.sent_messages();
        let dupes: Vec<_> = on_wire.iter().step_by(7).cloned().collect();
        on_wire.extend(dupes);
        on_wire.shuffle(&mut rand::rng());

        for m in on_wire {
            receiver.tail().message_received(m).await;
        }

        let expected: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i]).collect();
        assert_eq!(listener.payloads(), expected);
    }

    #[tokio::test]
    async fn test_departure_flushes_and_resets() {
        let order = Arc::new(OrderInterceptor::with_defaults());
        let (pipeline, _, listener) = harness(vec![order.clone()]);

        pipeline.tail().message_received(ordered(&source(), 1, b"1")).await;
        pipeline.tail().message_received(ordered(&source(), 3, b"3")).await;
        pipeline.tail().message_received(ordered(&source(), 4, b"4")).await;
        assert_eq!(listener.payloads(), vec![b"1".to_vec()]);

        order.next_sequence(&source());
        pipeline.tail().member_disappeared(source()).await;

        assert_eq!(
            listener.payloads(),
            vec![b"1".to_vec(), b"3".to_vec(), b"4".to_vec()]
        );
        assert_eq!(listener.disappeared(), vec![source()]);
        assert_eq!(order.expected_sequence(&source()).await, None);
        assert_eq!(order.outgoing_sequence(&source()), 0);

        // A returning member starts over at 1
        pipeline.tail().message_received(ordered(&source(), 1, b"again")).await;
        assert_eq!(listener.payloads().last(), Some(&b"again".to_vec()));
    }

    #[tokio::test]
    async fn test_departure_drops_when_not_forwarding() {
        let (pipeline, _, listener) = harness(vec![Arc::new(stage(3_000, usize::MAX, false))]);

        pipeline.tail().message_received(ordered(&source(), 2, b"2")).await;
        pipeline.tail().member_disappeared(source()).await;

        assert!(listener.payloads().is_empty());
        assert_eq!(listener.disappeared(), vec![source()]);
    }
}
