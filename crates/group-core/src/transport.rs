//! Transport seam at the bottom of the chain.
//!
//! The transport moves encoded messages between nodes and owns the raw,
//! heartbeat-based view of who is out there. Inbound traffic and membership
//! discovery flow back up through `GroupChannel::handle_event`.

use crate::chain::StartFlags;
use crate::error::Result;
use crate::member::{Member, UniqueId};
use crate::message::ChannelMessage;
use async_trait::async_trait;

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Deliver `msg` to every destination.
    async fn send_message(&self, destinations: &[Member], msg: ChannelMessage) -> Result<()>;

    /// Members the transport currently believes are present.
    fn members(&self) -> Vec<Member>;

    /// Ourselves, as seen by other nodes.
    fn local_member(&self) -> Member;

    fn has_members(&self) -> bool {
        !self.members().is_empty()
    }

    fn member(&self, unique_id: &UniqueId) -> Option<Member> {
        self.members()
            .into_iter()
            .find(|m| m.unique_id() == unique_id)
    }

    async fn start(&self, _flags: StartFlags) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _flags: StartFlags) -> Result<()> {
        Ok(())
    }

    /// Periodic tick, after every stage has run its maintenance.
    async fn heartbeat(&self) {}
}
