//! Interceptor chain.
//!
//! Stages are held in an ordered `Vec`; index 0 sits next to the application
//! and the last stage sits next to the transport. A stage never holds a
//! pointer to its neighbours. Each hook instead receives a cursor (`Next` for
//! the transport-bound direction, `Prev` for the application-bound one)
//! positioned right after it, and the cursor can only move one step.
//!
//! ```text
//!   application  <-- Prev --  [0] [1] ... [n-1]  -- Next -->  transport
//! ```
//!
//! Every hook defaults to a pass-through, so a stage only overrides what it
//! cares about.

use crate::error::Result;
use crate::listener::{ChannelListener, MembershipListener};
use crate::member::{Member, UniqueId};
use crate::message::{ChannelMessage, SendOptions};
use crate::payload::InterceptorPayload;
use crate::transport::ChannelTransport;
use async_trait::async_trait;
use futures::FutureExt;
use std::ops::BitOr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};

/// Services a `start`/`stop` call applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StartFlags(u32);

impl StartFlags {
    /// Receive application data
    pub const SND_RX: StartFlags = StartFlags(0x1);
    /// Send application data
    pub const SND_TX: StartFlags = StartFlags(0x2);
    /// Receive membership information
    pub const MBR_RX: StartFlags = StartFlags(0x4);
    /// Broadcast membership information
    pub const MBR_TX: StartFlags = StartFlags(0x8);
    pub const DEFAULT: StartFlags = StartFlags(0xF);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: StartFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for StartFlags {
    type Output = StartFlags;

    fn bitor(self, rhs: StartFlags) -> StartFlags {
        StartFlags(self.0 | rhs.0)
    }
}

/// A processing stage.
#[async_trait]
pub trait ChannelInterceptor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Options a message must carry for this stage to process it.
    /// The empty mask selects every message.
    fn option_flag(&self) -> SendOptions {
        SendOptions::NONE
    }

    fn ok_to_process(&self, options: SendOptions) -> bool {
        options.contains(self.option_flag())
    }

    async fn send_message(
        &self,
        destinations: &[Member],
        msg: ChannelMessage,
        payload: Option<InterceptorPayload>,
        next: Next<'_>,
    ) -> Result<()> {
        next.send_message(destinations, msg, payload).await
    }

    async fn message_received(&self, msg: ChannelMessage, prev: Prev<'_>) {
        prev.message_received(msg).await
    }

    async fn member_added(&self, member: Member, prev: Prev<'_>) {
        prev.member_added(member).await
    }

    async fn member_disappeared(&self, member: Member, prev: Prev<'_>) {
        prev.member_disappeared(member).await
    }

    /// Periodic maintenance.
    ///
    /// The pipeline calls every stage in turn; a failing or panicking stage
    /// is logged and the tick continues with the next one. `next` is for
    /// membership queries, `prev` for propagating events found during
    /// maintenance.
    async fn heartbeat(&self, _next: Next<'_>, _prev: Prev<'_>) -> Result<()> {
        Ok(())
    }

    async fn start(&self, flags: StartFlags, next: Next<'_>) -> Result<()> {
        next.start(flags).await
    }

    async fn stop(&self, flags: StartFlags, next: Next<'_>) -> Result<()> {
        next.stop(flags).await
    }

    fn has_members(&self, next: Next<'_>) -> bool {
        next.has_members()
    }

    fn members(&self, next: Next<'_>) -> Vec<Member> {
        next.members()
    }

    fn member(&self, unique_id: &UniqueId, next: Next<'_>) -> Option<Member> {
        next.member(unique_id)
    }

    fn local_member(&self, next: Next<'_>) -> Member {
        next.local_member()
    }
}

/// The ordered stage list plus both ends of the chain.
pub struct Pipeline {
    stages: Vec<Arc<dyn ChannelInterceptor>>,
    transport: Arc<dyn ChannelTransport>,
    channel_listeners: RwLock<Vec<Arc<dyn ChannelListener>>>,
    membership_listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
}

impl Pipeline {
    pub fn new(
        stages: Vec<Arc<dyn ChannelInterceptor>>,
        transport: Arc<dyn ChannelTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stages,
            transport,
            channel_listeners: RwLock::new(Vec::new()),
            membership_listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn add_channel_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.channel_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn add_membership_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.membership_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Cursor at the application end, pointing at the first stage.
    pub fn head(self: &Arc<Self>) -> Next<'_> {
        Next {
            pipeline: self,
            index: 0,
        }
    }

    /// Cursor at the transport end, pointing at the last stage.
    pub fn tail(self: &Arc<Self>) -> Prev<'_> {
        Prev {
            pipeline: self,
            index: self.stages.len(),
        }
    }

    /// Run one heartbeat tick through every stage, then the transport.
    pub async fn heartbeat(self: &Arc<Self>) {
        for (index, stage) in self.stages.iter().enumerate() {
            let next = Next {
                pipeline: self,
                index: index + 1,
            };
            let prev = Prev {
                pipeline: self,
                index,
            };

            match AssertUnwindSafe(stage.heartbeat(next, prev))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Heartbeat maintenance failed in {}: {}", stage.name(), e),
                Err(_) => error!("Heartbeat maintenance panicked in {}", stage.name()),
            }
        }
        self.transport.heartbeat().await;
    }

    fn deliver(&self, msg: ChannelMessage) {
        let listeners = self
            .channel_listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut delivered = false;
        for listener in listeners.iter().filter(|l| l.accept(&msg)) {
            listener.message_received(&msg);
            delivered = true;
        }

        if !delivered {
            debug!(
                "No listener accepted message {} from {}",
                msg.unique_id(),
                msg.address()
            );
        }
    }

    fn notify_membership(&self, member: &Member, added: bool) {
        let listeners = self
            .membership_listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for listener in listeners {
            if added {
                listener.member_added(member);
            } else {
                listener.member_disappeared(member);
            }
        }
    }
}

/// Cursor moving toward the transport.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    pipeline: &'a Arc<Pipeline>,
    index: usize,
}

impl<'a> Next<'a> {
    fn stage(&self) -> Option<&'a Arc<dyn ChannelInterceptor>> {
        self.pipeline.stages.get(self.index)
    }

    fn advance(self) -> Next<'a> {
        Next {
            pipeline: self.pipeline,
            index: self.index + 1,
        }
    }

    pub async fn send_message(
        self,
        destinations: &[Member],
        msg: ChannelMessage,
        payload: Option<InterceptorPayload>,
    ) -> Result<()> {
        match self.stage() {
            Some(stage) => {
                stage
                    .send_message(destinations, msg, payload, self.advance())
                    .await
            }
            None => self.pipeline.transport.send_message(destinations, msg).await,
        }
    }

    pub async fn start(self, flags: StartFlags) -> Result<()> {
        match self.stage() {
            Some(stage) => stage.start(flags, self.advance()).await,
            None => self.pipeline.transport.start(flags).await,
        }
    }

    pub async fn stop(self, flags: StartFlags) -> Result<()> {
        match self.stage() {
            Some(stage) => stage.stop(flags, self.advance()).await,
            None => self.pipeline.transport.stop(flags).await,
        }
    }

    pub fn has_members(self) -> bool {
        match self.stage() {
            Some(stage) => stage.has_members(self.advance()),
            None => self.pipeline.transport.has_members(),
        }
    }

    pub fn members(self) -> Vec<Member> {
        match self.stage() {
            Some(stage) => stage.members(self.advance()),
            None => self.pipeline.transport.members(),
        }
    }

    pub fn member(self, unique_id: &UniqueId) -> Option<Member> {
        match self.stage() {
            Some(stage) => stage.member(unique_id, self.advance()),
            None => self.pipeline.transport.member(unique_id),
        }
    }

    pub fn local_member(self) -> Member {
        match self.stage() {
            Some(stage) => stage.local_member(self.advance()),
            None => self.pipeline.transport.local_member(),
        }
    }

    /// Owned cursor that can outlive the current call (e.g. move into a task).
    pub fn detach(self) -> DetachedNext {
        DetachedNext {
            pipeline: Arc::clone(self.pipeline),
            index: self.index,
        }
    }
}

/// A `Next` cursor that owns a handle to the pipeline.
#[derive(Clone)]
pub struct DetachedNext {
    pipeline: Arc<Pipeline>,
    index: usize,
}

impl DetachedNext {
    pub fn as_next(&self) -> Next<'_> {
        Next {
            pipeline: &self.pipeline,
            index: self.index,
        }
    }
}

/// Cursor moving toward the application.
#[derive(Clone, Copy)]
pub struct Prev<'a> {
    pipeline: &'a Arc<Pipeline>,
    /// Number of stages still above this position
    index: usize,
}

impl<'a> Prev<'a> {
    fn step(self) -> Option<(&'a Arc<dyn ChannelInterceptor>, Prev<'a>)> {
        let index = self.index.checked_sub(1)?;
        let stage = self.pipeline.stages.get(index)?;
        Some((
            stage,
            Prev {
                pipeline: self.pipeline,
                index,
            },
        ))
    }

    pub async fn message_received(self, msg: ChannelMessage) {
        match self.step() {
            Some((stage, prev)) => stage.message_received(msg, prev).await,
            None => self.pipeline.deliver(msg),
        }
    }

    pub async fn member_added(self, member: Member) {
        match self.step() {
            Some((stage, prev)) => stage.member_added(member, prev).await,
            None => self.pipeline.notify_membership(&member, true),
        }
    }

    pub async fn member_disappeared(self, member: Member) {
        match self.step() {
            Some((stage, prev)) => stage.member_disappeared(member, prev).await,
            None => self.pipeline.notify_membership(&member, false),
        }
    }
}
