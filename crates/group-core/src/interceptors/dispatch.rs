//! Asynchronous send queue with byte-budget admission control.
//!
//! Messages carrying the dispatch flag are handed to a worker pool and the
//! caller returns immediately. The sum of payload bytes waiting in the pool
//! never exceeds `max_queue_size`; a message that would push it over is
//! either sent inline (`always_send`) or rejected with `QueueFull`.
//!
//! Every outcome of a message this stage processes is reported to the
//! attached `ErrorHandler`, exactly once.

use super::worker_pool::WorkerPool;
use crate::chain::{ChannelInterceptor, Next, StartFlags};
use crate::error::{ChannelError, Result};
use crate::member::Member;
use crate::message::{ChannelMessage, SendOptions};
use crate::payload::InterceptorPayload;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for the dispatch stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Byte budget for queued payloads (default: 64 MiB)
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Send inline instead of failing when the budget is exhausted
    #[serde(default = "default_always_send")]
    pub always_send: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Idle time before an extra worker exits
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
    #[serde(default = "default_option_flag")]
    pub option_flag: SendOptions,
}

fn default_max_queue_size() -> usize {
    64 * 1024 * 1024
}

fn default_always_send() -> bool {
    true
}

fn default_max_workers() -> usize {
    10
}

fn default_min_workers() -> usize {
    2
}

fn default_keep_alive_ms() -> u64 {
    5_000
}

fn default_option_flag() -> SendOptions {
    SendOptions::ASYNCHRONOUS
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            always_send: default_always_send(),
            max_workers: default_max_workers(),
            min_workers: default_min_workers(),
            keep_alive_ms: default_keep_alive_ms(),
            option_flag: default_option_flag(),
        }
    }
}

/// Bytes reserved in the budget, released on drop.
struct QueuedBytes {
    counter: Arc<AtomicUsize>,
    size: usize,
}

impl Drop for QueuedBytes {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.size, Ordering::SeqCst);
    }
}

pub struct MessageDispatchInterceptor {
    config: DispatchConfig,
    queued: Arc<AtomicUsize>,
    pool: WorkerPool,
}

impl MessageDispatchInterceptor {
    pub fn new(config: DispatchConfig) -> Self {
        let pool = WorkerPool::new(
            config.min_workers,
            config.max_workers,
            Duration::from_millis(config.keep_alive_ms),
        );
        Self {
            config,
            queued: Arc::new(AtomicUsize::new(0)),
            pool,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DispatchConfig::default())
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Payload bytes currently waiting for a worker or being sent.
    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.pool.is_running()
    }

    /// Reserve `size` bytes, or return the current total if they don't fit.
    fn reserve(&self, size: usize) -> std::result::Result<QueuedBytes, usize> {
        let limit = self.config.max_queue_size;
        self.queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_add(size).filter(|total| *total <= limit)
            })
            .map(|_| QueuedBytes {
                counter: Arc::clone(&self.queued),
                size,
            })
    }

    /// Send on the caller's task and report the outcome.
    async fn send_now(
        &self,
        destinations: &[Member],
        msg: ChannelMessage,
        payload: Option<InterceptorPayload>,
        next: Next<'_>,
    ) -> Result<()> {
        let id = *msg.unique_id();
        let result = next.send_message(destinations, msg, payload.clone()).await;
        if let Some(payload) = &payload {
            payload.report(result.as_ref().map(|_| ()), &id);
        }
        result
    }
}

impl Default for MessageDispatchInterceptor {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl ChannelInterceptor for MessageDispatchInterceptor {
    fn name(&self) -> &'static str {
        "dispatch"
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

        if !self.pool.is_running() {
            debug!(
                "Dispatch pool not running, sending {} inline",
                msg.unique_id()
            );
            return self.send_now(destinations, msg, payload, next).await;
        }

        let size = msg.len();
        let reserved = match self.reserve(size) {
            Ok(reserved) => reserved,
            Err(queued) if self.config.always_send => {
                warn!(
                    "Dispatch queue full ({} + {} > {} bytes), sending {} inline",
                    queued,
                    size,
                    self.config.max_queue_size,
                    msg.unique_id()
                );
                return self.send_now(destinations, msg, payload, next).await;
            }
            Err(queued) => {
                let err = ChannelError::QueueFull {
                    destinations: destinations.to_vec(),
                    size,
                    queued,
                    limit: self.config.max_queue_size,
                };
                warn!("Rejecting {}: {}", msg.unique_id(), err);
                if let Some(payload) = &payload {
                    payload.report(Err(&err), msg.unique_id());
                }
                return Err(err);
            }
        };

        let id = *msg.unique_id();
        let destinations = destinations.to_vec();
        let next = next.detach();
        let report_to = payload.clone();
        let on_reject = payload.clone();

        let job = async move {
            let _reserved = reserved;
            let result = next
                .as_next()
                .send_message(&destinations, msg, payload)
                .await;

            if let Err(e) = &result {
                warn!("Asynchronous send of {} failed: {}", id, e);
            }
            if let Some(payload) = &report_to {
                payload.report(result.as_ref().map(|_| ()), &id);
            }
        };

        if let Err(e) = self.pool.submit(job.boxed()) {
            warn!("Could not queue {}: {}", id, e);
            if let Some(payload) = &on_reject {
                payload.report(Err(&e), &id);
            }
            return Err(e);
        }

        Ok(())
    }

    async fn start(&self, flags: StartFlags, next: Next<'_>) -> Result<()> {
        if flags.contains(StartFlags::SND_TX) {
            self.pool.start();
        }
        next.start(flags).await
    }

    async fn stop(&self, flags: StartFlags, next: Next<'_>) -> Result<()> {
        if flags.contains(StartFlags::SND_TX) {
            self.pool.shutdown();
        }
        next.stop(flags).await
    }
}
