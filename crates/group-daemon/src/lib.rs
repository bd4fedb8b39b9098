//! group-daemon library: Exposes the TCP transport for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod address;
pub mod transport;

pub use address::{AddressError, parse_member};
pub use transport::TcpTransport;
