//! Application-facing callbacks at the top of the chain.

use crate::member::Member;
use crate::message::ChannelMessage;

/// Receives fully processed messages.
pub trait ChannelListener: Send + Sync {
    /// Whether this listener wants the message. Defaults to everything.
    fn accept(&self, _msg: &ChannelMessage) -> bool {
        true
    }

    fn message_received(&self, msg: &ChannelMessage);
}

/// Receives membership changes that survived every stage.
pub trait MembershipListener: Send + Sync {
    fn member_added(&self, member: &Member);

    fn member_disappeared(&self, member: &Member);
}
