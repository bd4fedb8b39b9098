//! The reliability stages.

pub mod dispatch;
pub mod failure;
pub mod fragmentation;
pub mod order;
pub mod probe;
pub mod worker_pool;

pub use dispatch::{DispatchConfig, MessageDispatchInterceptor};
pub use failure::{FailureDetectorConfig, TcpFailureDetector};
pub use fragmentation::{FragmentationConfig, FragmentationInterceptor};
pub use order::{OrderConfig, OrderInterceptor};
pub use probe::{PROBE_ACK, PROBE_SIGNATURE, Prober, TcpProber};
