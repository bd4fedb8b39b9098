//! Full stack between two channels over an in-memory network that reorders
//! and duplicates traffic.

use async_trait::async_trait;
use group_core::{
    ChannelConfig, ChannelError, ChannelListener, ChannelMessage, ChannelTransport, GroupChannel,
    Member, MembershipListener, SendOptions, StartFlags, TransportEvent,
};
use rand::Rng;
use rand::seq::SliceRandom;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Transport that parks every outgoing message as encoded bytes.
struct OutboxTransport {
    local: Member,
    outbox: Mutex<Vec<Vec<u8>>>,
}

impl OutboxTransport {
    fn new(local: Member) -> Arc<Self> {
        Arc::new(Self {
            local,
            outbox: Mutex::new(Vec::new()),
        })
    }

    fn len(&self) -> usize {
        self.outbox.lock().unwrap().len()
    }

    fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.outbox.lock().unwrap())
    }
}

#[async_trait]
impl ChannelTransport for OutboxTransport {
    async fn send_message(
        &self,
        _destinations: &[Member],
        msg: ChannelMessage,
    ) -> group_core::Result<()> {
        let bytes = msg.encode()?;
        self.outbox.lock().unwrap().push(bytes);
        Ok(())
    }

    fn members(&self) -> Vec<Member> {
        Vec::new()
    }

    fn local_member(&self) -> Member {
        self.local.clone()
    }
}

#[derive(Default)]
struct Inbox {
    payloads: Mutex<Vec<Vec<u8>>>,
    added: Mutex<Vec<Member>>,
    gone: Mutex<Vec<Member>>,
}

impl ChannelListener for Inbox {
    fn message_received(&self, msg: &ChannelMessage) {
        self.payloads.lock().unwrap().push(msg.payload().to_vec());
    }
}

impl MembershipListener for Inbox {
    fn member_added(&self, member: &Member) {
        self.added.lock().unwrap().push(member.clone());
    }

    fn member_disappeared(&self, member: &Member) {
        self.gone.lock().unwrap().push(member.clone());
    }
}

fn config() -> ChannelConfig {
    let mut config = ChannelConfig::default();
    config.fragmentation.max_size = 1024;
    config.failure_detector.connect_timeout_ms = 500;
    config
}

struct Node {
    channel: GroupChannel,
    transport: Arc<OutboxTransport>,
    inbox: Arc<Inbox>,
}

async fn node(port: u16, config: &ChannelConfig) -> Node {
    let transport = OutboxTransport::new(Member::from_address("127.0.0.1", port));
    let channel = GroupChannel::from_config(config, transport.clone());
    let inbox = Arc::new(Inbox::default());
    channel.add_channel_listener(inbox.clone());
    channel.add_membership_listener(inbox.clone());
    channel.start(StartFlags::DEFAULT).await.unwrap();
    Node {
        channel,
        transport,
        inbox,
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_ordered_async_messages_survive_reordering() {
    let config = config();
    let a = node(7001, &config).await;
    let b = node(7002, &config).await;
    let dest = b.channel.local_member();

    let mut rng = rand::rng();
    let payloads: Vec<Vec<u8>> = (0..20)
        .map(|i| {
            let len = if i % 5 == 0 { 0 } else { rng.random_range(1..5000) };
            (0..len).map(|_| rng.random::<u8>()).collect()
        })
        .collect();
    // Each payload carries a 4-byte sequence number when it reaches fragmentation
    let expected_frames: usize = payloads.iter().map(|p| (p.len() + 4).div_ceil(1024)).sum();

    let options = SendOptions::ASYNCHRONOUS | SendOptions::ORDERED | SendOptions::FRAGMENTABLE;
    for payload in &payloads {
        a.channel
            .send(std::slice::from_ref(&dest), payload, options, None)
            .await
            .unwrap();
    }
    wait_for(|| a.transport.len() == expected_frames).await;

    let mut frames = a.transport.take();
    let duplicates: Vec<Vec<u8>> = frames.iter().step_by(3).cloned().collect();
    frames.extend(duplicates);
    frames.shuffle(&mut rng);

    for frame in frames {
        let msg = ChannelMessage::decode(&frame).unwrap();
        b.channel.handle_event(TransportEvent::Message(msg)).await;
    }

    assert_eq!(*b.inbox.payloads.lock().unwrap(), payloads);
}

#[tokio::test]
async fn test_plain_messages_bypass_every_stage() {
    let config = config();
    let a = node(7011, &config).await;
    let b = node(7012, &config).await;
    let dest = b.channel.local_member();

    a.channel
        .send(&[dest], &[9; 4000], SendOptions::NONE, None)
        .await
        .unwrap();

    let frames = a.transport.take();
    assert_eq!(frames.len(), 1);
    let msg = ChannelMessage::decode(&frames[0]).unwrap();
    assert_eq!(msg.len(), 4000);

    b.channel.handle_event(TransportEvent::Message(msg)).await;
    assert_eq!(b.inbox.payloads.lock().unwrap()[0], vec![9; 4000]);
}

#[tokio::test]
async fn test_async_over_budget_rejected() {
    let mut config = config();
    config.dispatch.max_queue_size = 1000;
    config.dispatch.always_send = false;
    let a = node(7021, &config).await;
    let dest = Member::from_address("127.0.0.1", 7022);

    let result = a
        .channel
        .send(&[dest], &[0; 1500], SendOptions::ASYNCHRONOUS, None)
        .await;

    match result {
        Err(ChannelError::QueueFull { destinations, .. }) => {
            assert_eq!(destinations[0].port(), 7022);
        }
        other => panic!("expected QueueFull, got {other:?}"),
    }
    assert_eq!(a.transport.len(), 0);
}

#[tokio::test]
async fn test_membership_follows_probes() {
    let config = config();
    let a = node(7031, &config).await;

    let socket = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    let peer = Member::from_address("127.0.0.1", port);

    // Reported, reachable: admitted
    a.channel.handle_event(TransportEvent::MemberAdded(peer.clone())).await;
    assert_eq!(a.channel.members(), vec![peer.clone()]);

    // Reported gone while still listening: kept
    a.channel
        .handle_event(TransportEvent::MemberDisappeared(peer.clone()))
        .await;
    assert!(a.channel.has_members());
    assert!(a.inbox.gone.lock().unwrap().is_empty());

    // Stops listening: the next check removes it
    drop(socket);
    a.channel.heartbeat().await;

    assert!(!a.channel.has_members());
    assert_eq!(*a.inbox.added.lock().unwrap(), vec![peer.clone()]);
    assert_eq!(*a.inbox.gone.lock().unwrap(), vec![peer]);
}

#[tokio::test]
async fn test_stopped_channel_sends_async_inline() {
    let config = config();
    let a = node(7041, &config).await;
    a.channel.stop(StartFlags::DEFAULT).await.unwrap();
    let dest = Member::from_address("127.0.0.1", 7042);

    a.channel
        .send(&[dest], b"late", SendOptions::ASYNCHRONOUS, None)
        .await
        .unwrap();

    assert_eq!(a.transport.len(), 1);
}
