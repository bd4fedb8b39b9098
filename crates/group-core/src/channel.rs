//! Application-facing channel.
//!
//! `GroupChannel` owns the pipeline, turns application sends into
//! `ChannelMessage`s and feeds transport events up the chain. `run` is the
//! event loop: it drains transport events and ticks the heartbeat until
//! shut down.

use crate::chain::{ChannelInterceptor, Pipeline, StartFlags};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use crate::interceptors::{
    FragmentationInterceptor, MessageDispatchInterceptor, OrderInterceptor, TcpFailureDetector,
};
use crate::listener::{ChannelListener, MembershipListener};
use crate::member::{Member, UniqueId};
use crate::message::{ChannelMessage, SendOptions};
use crate::payload::{ErrorHandler, InterceptorPayload};
use crate::transport::ChannelTransport;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Something the transport observed.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(ChannelMessage),
    MemberAdded(Member),
    MemberDisappeared(Member),
}

pub struct GroupChannel {
    pipeline: Arc<Pipeline>,
    heartbeat_interval: Duration,
}

pub struct GroupChannelBuilder {
    stages: Vec<Arc<dyn ChannelInterceptor>>,
    heartbeat_interval: Duration,
}

impl GroupChannelBuilder {
    /// Append a stage below the ones already added (closer to the transport).
    pub fn interceptor(mut self, stage: Arc<dyn ChannelInterceptor>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn build(self, transport: Arc<dyn ChannelTransport>) -> GroupChannel {
        GroupChannel {
            pipeline: Pipeline::new(self.stages, transport),
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}

impl GroupChannel {
    pub fn builder() -> GroupChannelBuilder {
        GroupChannelBuilder {
            stages: Vec::new(),
            heartbeat_interval: Duration::from_millis(5_000),
        }
    }

    /// The standard stack, application end first:
    /// order, dispatch, fragmentation, failure detection.
    ///
    /// Order sits above dispatch so sequence numbers are taken in the order
    /// the application sent. Peers must run the same stack, since stage
    /// order decides the trailer layout on the wire.
    pub fn from_config(config: &ChannelConfig, transport: Arc<dyn ChannelTransport>) -> Self {
        Self::builder()
            .interceptor(Arc::new(OrderInterceptor::new(config.order.clone())))
            .interceptor(Arc::new(MessageDispatchInterceptor::new(
                config.dispatch.clone(),
            )))
            .interceptor(Arc::new(FragmentationInterceptor::new(
                config.fragmentation.clone(),
            )))
            .interceptor(Arc::new(TcpFailureDetector::new(
                config.failure_detector.clone(),
            )))
            .heartbeat_interval(Duration::from_millis(config.heartbeat_interval_ms))
            .build(transport)
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn add_channel_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.pipeline.add_channel_listener(listener);
    }

    pub fn add_membership_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.pipeline.add_membership_listener(listener);
    }

    pub async fn start(&self, flags: StartFlags) -> Result<()> {
        info!("Starting channel ({})", self.pipeline.stage_names().join(" -> "));
        self.pipeline.head().start(flags).await
    }

    pub async fn stop(&self, flags: StartFlags) -> Result<()> {
        info!("Stopping channel");
        self.pipeline.head().stop(flags).await
    }

    /// Send `data` to every destination.
    ///
    /// Returns the id of the new message. For synchronous sends the handler
    /// hears the outcome before this returns; for `ASYNCHRONOUS` ones the
    /// dispatch stage reports it when the background send finishes.
    pub async fn send(
        &self,
        destinations: &[Member],
        data: &[u8],
        options: SendOptions,
        handler: Option<Arc<dyn ErrorHandler>>,
    ) -> Result<UniqueId> {
        if destinations.is_empty() {
            return Err(ChannelError::NoDestination);
        }

        let msg = ChannelMessage::new(self.local_member(), data.to_vec(), options);
        let id = *msg.unique_id();
        let payload = handler.map(InterceptorPayload::new);

        debug!(
            "Sending {} ({} bytes) to {} member(s)",
            id,
            data.len(),
            destinations.len()
        );
        let result = self
            .pipeline
            .head()
            .send_message(destinations, msg, payload.clone())
            .await;

        if !options.contains(SendOptions::ASYNCHRONOUS) {
            if let Some(payload) = &payload {
                payload.report(result.as_ref().map(|_| ()), &id);
            }
        }

        result.map(|()| id)
    }

    /// Feed one transport observation up the chain.
    pub async fn handle_event(&self, event: TransportEvent) {
        let tail = self.pipeline.tail();
        match event {
            TransportEvent::Message(msg) => tail.message_received(msg).await,
            TransportEvent::MemberAdded(member) => tail.member_added(member).await,
            TransportEvent::MemberDisappeared(member) => tail.member_disappeared(member).await,
        }
    }

    pub async fn heartbeat(&self) {
        self.pipeline.heartbeat().await;
    }

    /// Process transport events and heartbeat ticks until `shutdown`
    /// resolves or the event sender is dropped.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<TransportEvent>,
        shutdown: impl Future<Output = ()>,
    ) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Channel event loop shutting down");
                    break;
                }

                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("Transport event stream closed");
                        break;
                    }
                },

                _ = ticker.tick() => {
                    self.heartbeat().await;
                }
            }
        }
    }

    pub fn has_members(&self) -> bool {
        self.pipeline.head().has_members()
    }

    pub fn members(&self) -> Vec<Member> {
        self.pipeline.head().members()
    }

    pub fn member(&self, unique_id: &UniqueId) -> Option<Member> {
        self.pipeline.head().member(unique_id)
    }

    pub fn local_member(&self) -> Member {
        self.pipeline.head().local_member()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{RecordingListener, RecordingTransport};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outcomes(Mutex<Vec<(UniqueId, bool)>>);

    impl ErrorHandler for Outcomes {
        fn handle_completion(&self, message_id: &UniqueId) {
            self.0.lock().unwrap().push((*message_id, true));
        }

        fn handle_error(&self, _error: &ChannelError, message_id: &UniqueId) {
            self.0.lock().unwrap().push((*message_id, false));
        }
    }

    fn peer() -> Member {
        Member::from_address("10.0.0.2", 4000)
    }

    fn bare_channel() -> (GroupChannel, Arc<RecordingTransport>, Arc<RecordingListener>) {
        let transport = RecordingTransport::new();
        let listener = Arc::new(RecordingListener::default());
        let channel = GroupChannel::builder().build(transport.clone());
        channel.add_channel_listener(listener.clone());
        channel.add_membership_listener(listener.clone());
        (channel, transport, listener)
    }

    #[tokio::test]
    async fn test_send_requires_destination() {
        let (channel, _, _) = bare_channel();

        let result = channel.send(&[], b"x", SendOptions::NONE, None).await;
        assert!(matches!(result, Err(ChannelError::NoDestination)));
    }

    #[tokio::test]
    async fn test_send_stamps_local_origin() {
        let (channel, transport, _) = bare_channel();

        let id = channel.send(&[peer()], b"hello", SendOptions::NONE, None).await.unwrap();

        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].unique_id(), &id);
        assert_eq!(sent[0].address(), &transport.local_member());
        assert_eq!(sent[0].payload(), b"hello");
    }

    #[tokio::test]
    async fn test_synchronous_outcome_reported() {
        let (channel, transport, _) = bare_channel();
        let outcomes = Arc::new(Outcomes::default());

        let ok = channel
            .send(&[peer()], b"a", SendOptions::NONE, Some(outcomes.clone()))
            .await
            .unwrap();
        transport.fail_sends(true);
        let failed = channel
            .send(&[peer()], b"b", SendOptions::NONE, Some(outcomes.clone()))
            .await;

        assert!(failed.is_err());
        let recorded = outcomes.0.lock().unwrap().clone();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0], (ok, true));
        assert!(!recorded[1].1);
    }

    #[tokio::test]
    async fn test_events_reach_listeners() {
        let (channel, _, listener) = bare_channel();

        channel
            .handle_event(TransportEvent::Message(ChannelMessage::new(
                peer(),
                b"in".to_vec(),
                SendOptions::NONE,
            )))
            .await;
        channel.handle_event(TransportEvent::MemberAdded(peer())).await;
        channel.handle_event(TransportEvent::MemberDisappeared(peer())).await;

        assert_eq!(listener.payloads(), vec![b"in".to_vec()]);
        assert_eq!(listener.added(), vec![peer()]);
        assert_eq!(listener.disappeared(), vec![peer()]);
    }

    #[tokio::test]
    async fn test_standard_stack_order() {
        let channel = GroupChannel::from_config(&ChannelConfig::default(), RecordingTransport::new());

        assert_eq!(
            channel.pipeline().stage_names(),
            vec!["order", "dispatch", "fragmentation", "failure-detector"]
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (channel, _, listener) = bare_channel();
        let (tx, rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        tx.send(TransportEvent::MemberAdded(peer())).await.unwrap();
        let feeder = async move {
            tokio::task::yield_now().await;
            let _ = stop_tx.send(());
            // Keep the sender alive until shutdown is observed
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(tx);
        };

        let shutdown = async move {
            let _ = stop_rx.await;
        };
        tokio::join!(channel.run(rx, shutdown), feeder);

        assert_eq!(listener.added(), vec![peer()]);
    }

    #[tokio::test]
    async fn test_run_ends_when_transport_closes() {
        let (channel, _, _) = bare_channel();
        let (tx, rx) = mpsc::channel::<TransportEvent>(1);
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), channel.run(rx, std::future::pending()))
            .await
            .unwrap();
    }
}
