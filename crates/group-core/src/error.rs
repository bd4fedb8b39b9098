//! Error type shared by every stage of the channel.

use crate::member::Member;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("No destination given")]
    NoDestination,

    #[error(
        "Asynchronous queue is full: {size} more bytes would exceed the limit of {limit} bytes \
         (currently queued: {queued}), destination(s): {}",
        member_list(.destinations)
    )]
    QueueFull {
        destinations: Vec<Member>,
        size: usize,
        queued: usize,
        limit: usize,
    },

    #[error("Malformed message trailer: needed {needed} bytes, {available} available")]
    MalformedTrailer { needed: usize, available: usize },

    #[error("Invalid fragment {index} of {count}")]
    InvalidFragment { index: u32, count: u32 },

    #[error("Payload of {size} bytes needs {fragments} fragments, limit is {limit}")]
    TooManyFragments {
        size: usize,
        fragments: usize,
        limit: u32,
    },

    #[error("Dispatch pool is not running")]
    NotRunning,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

fn member_list(members: &[Member]) -> String {
    members
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
