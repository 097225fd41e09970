use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::error::{BrokerError, BrokerResult, ExecutionError};

use super::types::{StreamEvent, SubscriptionId};

/// Outward notification stream of one subscription.
///
/// The first event is always the sequence-0 snapshot. A
/// [`StreamEvent::Closed`] event ends the stream; after it every receive
/// reports `Disconnected`.
#[derive(Debug)]
pub struct NotificationStream {
    subscription_id: SubscriptionId,
    rx: Receiver<StreamEvent>,
}

impl NotificationStream {
    pub(crate) fn new(subscription_id: SubscriptionId, rx: Receiver<StreamEvent>) -> Self {
        Self { subscription_id, rx }
    }

    /// The subscription id backing this stream.
    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> BrokerResult<StreamEvent> {
        self.rx.recv().map_err(|_| disconnected())
    }

    /// Receive the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> BrokerResult<StreamEvent> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => BrokerError::Execution(ExecutionError::timeout(timeout)),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Non-blocking receive; `Ok(None)` when nothing is queued.
    pub fn try_recv(&self) -> BrokerResult<Option<StreamEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(disconnected()),
        }
    }

    /// Number of events waiting to be received.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

fn disconnected() -> BrokerError {
    BrokerError::Execution(ExecutionError::Disconnected {
        path: "notification_stream".to_string(),
    })
}
