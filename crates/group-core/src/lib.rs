//! group-core: Composable reliability stages for group messaging.
//!
//! A channel is a stack of interceptors between the application and a
//! transport. This crate provides:
//! - The interceptor chain and its cursors
//! - Fragmentation and reassembly of large messages
//! - Per-sender FIFO ordering
//! - Asynchronous dispatch with a byte budget
//! - Probe-verified membership (failure detection)
//! - `ChannelTransport`/listener traits for plugging in the ends

pub mod chain;
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod interceptors;
pub mod listener;
pub mod member;
pub mod membership;
pub mod message;
pub mod payload;
pub mod transport;
pub mod wire;

pub use chain::{ChannelInterceptor, DetachedNext, Next, Pipeline, Prev, StartFlags};
pub use channel::{GroupChannel, GroupChannelBuilder, TransportEvent};
pub use config::ChannelConfig;
pub use error::{ChannelError, Result};
pub use interceptors::{
    DispatchConfig, FailureDetectorConfig, FragmentationConfig, FragmentationInterceptor,
    MessageDispatchInterceptor, OrderConfig, OrderInterceptor, TcpFailureDetector,
};
pub use listener::{ChannelListener, MembershipListener};
pub use member::{Member, MemberCommand, UniqueId};
pub use membership::Membership;
pub use message::{ChannelMessage, SendOptions};
pub use payload::{ErrorHandler, InterceptorPayload};
pub use transport::ChannelTransport;
