//! Per-send context handed down the chain alongside a message.

use crate::error::ChannelError;
use crate::member::UniqueId;
use std::fmt;
use std::sync::Arc;

/// Receives the outcome of a send that completes after the caller returned.
pub trait ErrorHandler: Send + Sync {
    /// The message was handed to the transport successfully.
    fn handle_completion(&self, message_id: &UniqueId);

    /// The send failed.
    fn handle_error(&self, error: &ChannelError, message_id: &UniqueId);
}

/// Optional extras that travel with a message on the send path.
#[derive(Clone, Default)]
pub struct InterceptorPayload {
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl InterceptorPayload {
    pub fn new(error_handler: Arc<dyn ErrorHandler>) -> Self {
        Self {
            error_handler: Some(error_handler),
        }
    }

    pub fn error_handler(&self) -> Option<&Arc<dyn ErrorHandler>> {
        self.error_handler.as_ref()
    }

    /// Report a send outcome to the attached handler, if any.
    pub fn report(&self, outcome: Result<(), &ChannelError>, message_id: &UniqueId) {
        if let Some(handler) = &self.error_handler {
            match outcome {
                Ok(()) => handler.handle_completion(message_id),
                Err(e) => handler.handle_error(e, message_id),
            }
        }
    }
}

impl fmt::Debug for InterceptorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorPayload")
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}
