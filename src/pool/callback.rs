//! Per-inflight-request bookkeeping, matching the `RequestCallback` entry
//! in the data model: `WRITING → READING → FINISHED`, with the
//! `READ_BEFORE_WRITE` race handled explicitly rather than assumed away.

use std::time::Instant;

use tokio::sync::oneshot;

use crate::{error::Result, protocol::Frame};

/// A decoded response delivered to whichever side (reader or writer task)
/// observes it second.
pub(crate) type CallbackResponse = Result<Frame>;

/// The state of one in-flight request on a connection.
pub(crate) enum CallbackState {
    /// The request has been handed to the writer task but the write has
    /// not yet been confirmed to have been issued.
    Writing,
    /// The write completed; waiting for the response to arrive on the
    /// read side.
    Reading,
    /// The response arrived before the writer task confirmed the write
    /// completed. The writer task is responsible for delivering it.
    ReadBeforeWrite(CallbackResponse),
}

/// Tracks one in-flight request: its state, deadline, and the channel used
/// to deliver the eventual response (or cancellation) to the caller that
/// issued it.
pub(crate) struct RequestCallback {
    pub(crate) state: CallbackState,
    pub(crate) deadline: Option<Instant>,
    sender: Option<oneshot::Sender<CallbackResponse>>,
}

impl RequestCallback {
    pub(crate) fn new(
        deadline: Option<Instant>,
    ) -> (Self, oneshot::Receiver<CallbackResponse>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                state: CallbackState::Writing,
                deadline,
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Delivers the response to the caller, if it hasn't already been
    /// delivered. Invoked exactly once per request, from whichever path
    /// (read or write completion) observes the terminal condition.
    pub(crate) fn complete(mut self, response: CallbackResponse) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(response);
        }
    }
}
