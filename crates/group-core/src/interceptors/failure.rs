//! Probe-verified membership.
//!
//! The transport's heartbeat-based view of the group is noisy. This stage
//! keeps its own authoritative `Membership` and only lets an add or remove
//! through after a direct probe agrees with it.
//!
//! Two suspect maps track members whose status is provisional:
//!
//! - `remove_suspects`: reported gone by the transport but still answering.
//!   They stay members and are re-probed every check until they either stop
//!   answering or the suspicion times out.
//! - `add_suspects`: reported (or previously known) but not answering. They
//!   are promoted the first time a probe succeeds.
//!
//! Stopping with `MBR_RX` forgets the view and both suspect maps.

use super::probe::{Prober, TcpProber};
use crate::chain::{ChannelInterceptor, Next, Prev, StartFlags};
use crate::clock::now_millis;
use crate::error::Result;
use crate::member::{Member, UniqueId};
use crate::membership::Membership;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Configuration for the failure detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetectorConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Timeout for writing the probe and reading its ack
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// How long a member stays a suspect (default: 5 minutes)
    #[serde(default = "default_remove_suspects_timeout_ms")]
    pub remove_suspects_timeout_ms: u64,
    /// Write the probe signature after connecting
    #[serde(default = "default_perform_send_test")]
    pub perform_send_test: bool,
    /// Wait for the probe ack (implies the send test)
    #[serde(default = "default_perform_read_test")]
    pub perform_read_test: bool,
}

fn default_connect_timeout_ms() -> u64 {
    1_000
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

fn default_remove_suspects_timeout_ms() -> u64 {
    300_000
}

fn default_perform_send_test() -> bool {
    true
}

fn default_perform_read_test() -> bool {
    false
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            remove_suspects_timeout_ms: default_remove_suspects_timeout_ms(),
            perform_send_test: default_perform_send_test(),
            perform_read_test: default_perform_read_test(),
        }
    }
}

/// Clears the in-progress flag when a check ends, however it ends.
struct CheckInProgress<'a>(&'a AtomicBool);

impl Drop for CheckInProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct TcpFailureDetector {
    config: FailureDetectorConfig,
    membership: Membership,
    /// Member -> when the suspicion started (ms since epoch)
    remove_suspects: Mutex<HashMap<Member, u64>>,
    add_suspects: Mutex<HashMap<Member, u64>>,
    prober: Arc<dyn Prober>,
    checking: AtomicBool,
}

impl TcpFailureDetector {
    pub fn new(config: FailureDetectorConfig) -> Self {
        let prober = Arc::new(TcpProber::new(&config));
        Self::with_prober(config, prober)
    }

    pub fn with_prober(config: FailureDetectorConfig, prober: Arc<dyn Prober>) -> Self {
        Self {
            config,
            membership: Membership::new(),
            remove_suspects: Mutex::new(HashMap::new()),
            add_suspects: Mutex::new(HashMap::new()),
            prober,
            checking: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &FailureDetectorConfig {
        &self.config
    }

    /// The authoritative view.
    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn remove_suspects(&self) -> Vec<Member> {
        self.remove_suspects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn add_suspects(&self) -> Vec<Member> {
        self.add_suspects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn suspect_removal(&self, member: Member, now_ms: u64) {
        self.remove_suspects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(member)
            .or_insert(now_ms);
    }

    fn suspect_addition(&self, member: Member, now_ms: u64) {
        self.add_suspects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(member)
            .or_insert(now_ms);
    }

    fn is_removal_suspect(&self, member: &Member) -> bool {
        self.remove_suspects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(member)
    }

    fn clear_removal(&self, member: &Member) -> bool {
        self.remove_suspects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(member)
            .is_some()
    }

    fn clear_addition(&self, member: &Member) -> bool {
        self.add_suspects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(member)
            .is_some()
    }

    fn snapshot(map: &Mutex<HashMap<Member, u64>>) -> Vec<(Member, u64)> {
        map.lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(m, since)| (m.clone(), *since))
            .collect()
    }

    async fn probe_all(&self, members: Vec<Member>) -> Vec<(Member, bool)> {
        let results = join_all(members.iter().map(|m| self.prober.is_reachable(m))).await;
        members.into_iter().zip(results).collect()
    }

    async fn admit(&self, member: Member, prev: Prev<'_>) {
        self.clear_addition(&member);
        if self.membership.member_alive(member.clone()) {
            info!("Member {} verified and added", member);
            prev.member_added(member).await;
        }
    }

    async fn evict(&self, member: Member, now_ms: u64, prev: Prev<'_>) {
        if let Some(removed) = self.membership.remove(&member) {
            info!("Member {} verified unreachable and removed", member);
            self.suspect_addition(member, now_ms);
            prev.member_disappeared(removed).await;
        }
    }

    /// Reconcile the authoritative view with direct probes.
    ///
    /// Probes every member the transport reports, every removal suspect and
    /// every addition suspect, emitting events for each discrepancy. Returns
    /// immediately if another check is still running.
    pub async fn check_members(&self, next: Next<'_>, prev: Prev<'_>) {
        if self.checking.swap(true, Ordering::SeqCst) {
            debug!("Membership check already in progress");
            return;
        }
        let _in_progress = CheckInProgress(&self.checking);
        let now = now_millis();

        // Transport's view
        let reported: Vec<Member> = next
            .members()
            .into_iter()
            .filter(|m| !self.is_removal_suspect(m))
            .collect();
        for (member, alive) in self.probe_all(reported).await {
            let known = self.membership.contains(&member);
            if alive && !known {
                self.admit(member, prev).await;
            } else if alive {
                self.membership.member_alive(member);
            } else if known {
                self.evict(member, now, prev).await;
            } else {
                self.suspect_addition(member, now);
            }
        }

        // Members the transport dropped but that kept answering
        let suspects = Self::snapshot(&self.remove_suspects);
        let members = suspects.iter().map(|(m, _)| m.clone()).collect();
        for ((member, alive), (_, since)) in self.probe_all(members).await.into_iter().zip(suspects) {
            if !alive {
                self.clear_removal(&member);
                self.evict(member, now, prev).await;
            } else if now.saturating_sub(since) >= self.config.remove_suspects_timeout_ms {
                debug!("Dropping removal suspicion of {} after timeout", member);
                self.clear_removal(&member);
            }
        }

        // Members waiting to become reachable
        let suspects = Self::snapshot(&self.add_suspects);
        let members = suspects.iter().map(|(m, _)| m.clone()).collect();
        for ((member, alive), (_, since)) in self.probe_all(members).await.into_iter().zip(suspects) {
            if alive {
                self.admit(member, prev).await;
            } else if now.saturating_sub(since) >= self.config.remove_suspects_timeout_ms {
                debug!("Giving up on unreachable suspect {}", member);
                self.clear_addition(&member);
            }
        }
    }
}

#[async_trait]
impl ChannelInterceptor for TcpFailureDetector {
    fn name(&self) -> &'static str {
        "failure-detector"
    }

    async fn member_added(&self, member: Member, prev: Prev<'_>) {
        if self.clear_removal(&member) {
            debug!("Member {} is back, cancelling removal suspicion", member);
            return self.admit(member, prev).await;
        }

        if self.membership.contains(&member) {
            self.membership.member_alive(member);
            return;
        }

        if self.prober.is_reachable(&member).await {
            self.admit(member, prev).await;
        } else {
            debug!("New member {} not reachable yet, holding as suspect", member);
            self.suspect_addition(member, now_millis());
        }
    }

    async fn member_disappeared(&self, member: Member, prev: Prev<'_>) {
        if member.is_shutdown() {
            info!("Member {} shut down", member);
            self.clear_removal(&member);
            self.clear_addition(&member);
            if self.membership.remove(&member).is_some() {
                prev.member_disappeared(member).await;
            }
            return;
        }

        if self.prober.is_reachable(&member).await {
            warn!(
                "Transport reports {} gone but it answers a direct probe, keeping it",
                member
            );
            self.suspect_removal(member, now_millis());
        } else {
            self.clear_removal(&member);
            self.evict(member, now_millis(), prev).await;
        }
    }

    async fn heartbeat(&self, next: Next<'_>, prev: Prev<'_>) -> Result<()> {
        self.check_members(next, prev).await;
        Ok(())
    }

    async fn stop(&self, flags: StartFlags, next: Next<'_>) -> Result<()> {
        if flags.contains(StartFlags::MBR_RX) {
            self.membership.clear();
            self.remove_suspects.lock().unwrap_or_else(|e| e.into_inner()).clear();
            self.add_suspects.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
        next.stop(flags).await
    }

    fn has_members(&self, _next: Next<'_>) -> bool {
        !self.membership.is_empty()
    }

    fn members(&self, _next: Next<'_>) -> Vec<Member> {
        self.membership.members().to_vec()
    }

    fn member(&self, unique_id: &UniqueId, _next: Next<'_>) -> Option<Member> {
        self.membership.get(unique_id)
    }
}
