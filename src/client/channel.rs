//! Client-side subscription channel.
//!
//! One channel per transport connection. At most one subscribe/unsubscribe
//! request is outstanding at a time:
//!
//! ```text
//! IDLE --send--> PENDING(req) --ack/error--> IDLE
//!                    |
//!                    +--credential expired (first time)--> refresh, re-send
//!                                                          PENDING(req, retried)
//! ```
//!
//! A second expiry on a retried request is terminal. Server messages are fed in
//! through [`ClientSubscriptionChannel::on_message`] and relayed to the
//! application as [`ClientEvent`]s.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::endpoint::GraphScope;
use crate::error::{lock_poisoned, BrokerResult, ExecutionError, TransportError};
use crate::subscription::{Notification, SubscriptionId};

use super::protocol::{ClientRequest, ErrorResponse, ServerMessage};
use super::security::CredentialProvider;

/// Outbound half of a client connection.
pub trait SubscriptionTransport: Send + Sync {
    /// Writes one request to the connection.
    fn send(&self, request: &ClientRequest) -> Result<(), TransportError>;
}

/// Client channel tuning.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Deadline handed to the credential provider on refresh.
    pub refresh_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            refresh_timeout_ms: 5_000,
        }
    }
}

/// What the application sees from a channel.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Subscribed {
        subscription_id: SubscriptionId,
        alias: Option<String>,
    },
    Unsubscribed {
        subscription_id: SubscriptionId,
    },
    /// Sequence-0 snapshot.
    FirstResults(Notification),
    /// Delta notification.
    Results(Notification),
    /// Terminal error for the outstanding request, or an unsolicited one.
    Error(ErrorResponse),
    BrokenConnection {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Idle,
    Pending { request: ClientRequest, retried: bool },
}

#[derive(Debug)]
struct State {
    slot: Slot,
    closed: bool,
    active: HashSet<SubscriptionId>,
}

/// Serializes requests over one connection and retries once past credential expiry.
pub struct ClientSubscriptionChannel {
    cfg: ChannelConfig,
    transport: Arc<dyn SubscriptionTransport>,
    credentials: Arc<dyn CredentialProvider>,
    state: Mutex<State>,
    idle: Condvar,
    events: Sender<ClientEvent>,
}

impl std::fmt::Debug for ClientSubscriptionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSubscriptionChannel")
            .field("cfg", &self.cfg)
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}

impl ClientSubscriptionChannel {
    /// Creates a channel and the receiver for its events.
    #[must_use]
    pub fn new(
        cfg: ChannelConfig,
        transport: Arc<dyn SubscriptionTransport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> (Self, Receiver<ClientEvent>) {
        let (events, rx) = unbounded();
        let channel = Self {
            cfg,
            transport,
            credentials,
            state: Mutex::new(State {
                slot: Slot::Idle,
                closed: false,
                active: HashSet::new(),
            }),
            idle: Condvar::new(),
            events,
        };
        (channel, rx)
    }

    /// Sends a subscribe request once no other request is outstanding.
    ///
    /// Returns when the request is written; the acknowledgement arrives as a
    /// [`ClientEvent`]. Fails with a timeout if the slot stays busy.
    pub fn subscribe(
        &self,
        sparql: impl Into<String>,
        scope: GraphScope,
        alias: Option<String>,
        timeout: Duration,
    ) -> BrokerResult<()> {
        self.submit(ClientRequest::subscribe(sparql, scope, alias), timeout)
    }

    /// Sends an unsubscribe request once no other request is outstanding.
    pub fn unsubscribe(&self, subscription_id: SubscriptionId, timeout: Duration) -> BrokerResult<()> {
        self.submit(ClientRequest::unsubscribe(subscription_id), timeout)
    }

    fn submit(&self, mut request: ClientRequest, timeout: Duration) -> BrokerResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state()?;
        loop {
            if state.closed {
                return Err(TransportError::ConnectionBroken {
                    message: "channel closed".to_string(),
                }
                .into());
            }
            if state.slot == Slot::Idle {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::debug!(kind = request.kind(), "request slot busy; giving up");
                return Err(ExecutionError::timeout(timeout).into());
            }
            state = self
                .idle
                .wait_timeout(state, remaining)
                .map_err(|_| lock_poisoned("channel.state"))?
                .0;
        }

        if let Some(credential) = self.credentials.current_credential() {
            request.set_authorization(credential.authorization_header());
        }
        state.slot = Slot::Pending {
            request: request.clone(),
            retried: false,
        };
        drop(state);

        // Sent outside the lock: an in-process transport may answer synchronously.
        if let Err(e) = self.transport.send(&request) {
            tracing::warn!(kind = request.kind(), error = %e, "request send failed");
            self.clear_slot();
            return Err(e.into());
        }
        tracing::debug!(kind = request.kind(), "request sent");
        Ok(())
    }

    /// Feeds one message received from the broker.
    pub fn on_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Notification(n) => {
                let event = if n.is_initial() {
                    ClientEvent::FirstResults(n)
                } else {
                    ClientEvent::Results(n)
                };
                self.emit(event);
            }
            ServerMessage::Subscribed { subscription_id, alias } => {
                self.complete(ClientEvent::Subscribed { subscription_id, alias }, |active| {
                    active.insert(subscription_id);
                });
            }
            ServerMessage::Unsubscribed { subscription_id } => {
                self.complete(ClientEvent::Unsubscribed { subscription_id }, |active| {
                    active.remove(&subscription_id);
                });
            }
            ServerMessage::Error(error) => self.on_error(error),
        }
    }

    fn on_error(&self, error: ErrorResponse) {
        let retry = {
            let Ok(mut state) = self.lock_state() else {
                self.emit(ClientEvent::Error(error));
                return;
            };
            match &mut state.slot {
                Slot::Pending { request, retried } if !*retried && self.credentials.is_credential_expired(&error) => {
                    // Slot stays occupied through the refresh.
                    *retried = true;
                    Some(request.clone())
                }
                _ => None,
            }
        };

        let Some(mut request) = retry else {
            if self.is_pending() {
                tracing::debug!(status = error.status, error = %error.error, "request failed");
            }
            self.fail(error);
            return;
        };

        let refresh_timeout = Duration::from_millis(self.cfg.refresh_timeout_ms.max(1));
        let credential = match self.credentials.refresh_credential(refresh_timeout) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(kind = request.kind(), error = %e, "credential refresh failed");
                self.fail(error);
                return;
            }
        };
        request.set_authorization(credential.authorization_header());

        {
            let Ok(mut state) = self.lock_state() else {
                self.emit(ClientEvent::Error(error));
                return;
            };
            let closed = state.closed;
            match &mut state.slot {
                Slot::Pending { request: pending, retried: true } if !closed => *pending = request.clone(),
                // Torn down while refreshing.
                _ => return,
            }
        }

        if let Err(e) = self.transport.send(&request) {
            tracing::warn!(kind = request.kind(), error = %e, "re-send after credential refresh failed");
            self.fail(error);
            return;
        }
        tracing::debug!(kind = request.kind(), "request re-sent with refreshed credential");
    }

    /// Connection teardown. Clears the slot and releases blocked callers.
    pub fn on_broken_connection(&self, message: impl Into<String>) {
        let message = message.into();
        self.shutdown();
        tracing::warn!(error = %message, "subscription channel connection broken");
        self.emit(ClientEvent::BrokenConnection { message });
    }

    /// Closes the channel locally; later requests fail.
    pub fn close(&self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.closed = true;
        state.slot = Slot::Idle;
        state.active.clear();
        drop(state);
        self.idle.notify_all();
    }

    /// Blocks until no request is outstanding. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let Ok(state) = self.lock_state() else {
            return false;
        };
        self.idle
            .wait_timeout_while(state, timeout, |s| s.slot != Slot::Idle)
            .map(|(_, res)| !res.timed_out())
            .unwrap_or(false)
    }

    /// True while a request awaits its response.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.slot != Slot::Idle)
            .unwrap_or(false)
    }

    /// True once the channel was closed or its connection broke.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Subscriptions acknowledged and not yet unsubscribed.
    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<SubscriptionId> {
        self.state
            .lock()
            .map(|s| s.active.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Publishes the terminal event, then frees the slot, so a released
    /// caller always finds the event already queued.
    fn complete(&self, event: ClientEvent, f: impl FnOnce(&mut HashSet<SubscriptionId>)) {
        match self.state.lock() {
            Ok(mut state) => {
                f(&mut state.active);
                self.emit(event);
                state.slot = Slot::Idle;
            }
            Err(_) => self.emit(event),
        }
        self.idle.notify_all();
    }

    fn fail(&self, error: ErrorResponse) {
        self.complete(ClientEvent::Error(error), |_| {});
    }

    fn clear_slot(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.slot = Slot::Idle;
        }
        self.idle.notify_all();
    }

    fn emit(&self, event: ClientEvent) {
        // The application may have dropped its receiver.
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> BrokerResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| lock_poisoned("channel.state"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    use crate::bindings::{Delta, ResultSet};
    use crate::client::security::Credential;
    use crate::error::{BrokerError, SecurityError};

    const Q: &str = "SELECT ?x WHERE { ?s ?p ?x }";
    const TIMEOUT: Duration = Duration::from_secs(1);

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<ClientRequest>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<ClientRequest> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl SubscriptionTransport for RecordingTransport {
        fn send(&self, request: &ClientRequest) -> Result<(), TransportError> {
            if self.fail.load(Ordering::Acquire) {
                return Err(TransportError::SendFailed {
                    message: "socket closed".to_string(),
                });
            }
            self.sent.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    struct TokenSource {
        refreshes: AtomicU64,
        refresh_ok: bool,
    }

    impl TokenSource {
        fn new(refresh_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                refreshes: AtomicU64::new(0),
                refresh_ok,
            })
        }
    }

    impl CredentialProvider for TokenSource {
        fn current_credential(&self) -> Option<Credential> {
            Some(Credential::bearer(format!("t{}", self.refreshes.load(Ordering::Acquire))))
        }

        fn refresh_credential(&self, _timeout: Duration) -> Result<Credential, SecurityError> {
            let n = self.refreshes.fetch_add(1, Ordering::AcqRel) + 1;
            if self.refresh_ok {
                Ok(Credential::bearer(format!("t{n}")))
            } else {
                Err(SecurityError::RefreshFailed {
                    message: "token endpoint down".to_string(),
                })
            }
        }
    }

    fn channel(
        refresh_ok: bool,
    ) -> (
        ClientSubscriptionChannel,
        Receiver<ClientEvent>,
        Arc<RecordingTransport>,
        Arc<TokenSource>,
    ) {
        let transport = Arc::new(RecordingTransport::default());
        let tokens = TokenSource::new(refresh_ok);
        let (ch, rx) = ClientSubscriptionChannel::new(ChannelConfig::default(), transport.clone(), tokens.clone());
        (ch, rx, transport, tokens)
    }

    fn expired() -> ServerMessage {
        ServerMessage::Error(ErrorResponse::new(401, "invalid_grant", "token expired"))
    }

    #[test]
    fn subscribe_ack_clears_slot_and_tracks_id() {
        let (ch, rx, transport, _) = channel(true);
        ch.subscribe(Q, GraphScope::all(), Some("a".into()), TIMEOUT).unwrap();
        assert!(ch.is_pending());
        assert_eq!(transport.sent()[0].authorization(), Some("Bearer t0"));

        let id = SubscriptionId::new();
        ch.on_message(ServerMessage::Subscribed {
            subscription_id: id,
            alias: Some("a".into()),
        });
        assert!(!ch.is_pending());
        assert_eq!(ch.active_subscriptions(), vec![id]);
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientEvent::Subscribed {
                subscription_id: id,
                alias: Some("a".into())
            }
        );
    }

    #[test]
    fn second_request_waits_for_first_response() {
        let (ch, _rx, transport, _) = channel(true);
        let ch = Arc::new(ch);
        ch.subscribe(Q, GraphScope::all(), None, TIMEOUT).unwrap();

        let waiter = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.subscribe(Q, GraphScope::all(), None, TIMEOUT))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(transport.sent().len(), 1);

        ch.on_message(ServerMessage::Subscribed {
            subscription_id: SubscriptionId::new(),
            alias: None,
        });
        waiter.join().unwrap().unwrap();
        assert_eq!(transport.sent().len(), 2);
    }

    #[test]
    fn busy_slot_times_out_without_corrupting_it() {
        let (ch, _rx, transport, _) = channel(true);
        ch.subscribe(Q, GraphScope::all(), None, TIMEOUT).unwrap();

        let err = ch
            .unsubscribe(SubscriptionId::new(), Duration::from_millis(20))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(ch.is_pending());

        ch.on_message(ServerMessage::Subscribed {
            subscription_id: SubscriptionId::new(),
            alias: None,
        });
        ch.subscribe(Q, GraphScope::all(), None, TIMEOUT).unwrap();
        assert_eq!(transport.sent().len(), 2);
    }

    #[test]
    fn expired_credential_retries_exactly_once() {
        let (ch, rx, transport, tokens) = channel(true);
        ch.subscribe(Q, GraphScope::all(), None, TIMEOUT).unwrap();

        ch.on_message(expired());
        assert_eq!(tokens.refreshes.load(Ordering::Acquire), 1);
        assert!(ch.is_pending());
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].authorization(), Some("Bearer t1"));
        assert_eq!(sent[0].kind(), sent[1].kind());
        assert!(rx.try_recv().is_err());

        // Second expiry on the retried request is terminal.
        ch.on_message(expired());
        assert_eq!(tokens.refreshes.load(Ordering::Acquire), 1);
        assert_eq!(transport.sent().len(), 2);
        assert!(!ch.is_pending());
        assert!(matches!(rx.try_recv().unwrap(), ClientEvent::Error(e) if e.status == 401));
    }

    #[test]
    fn retried_request_can_still_succeed() {
        let (ch, rx, _transport, _) = channel(true);
        ch.subscribe(Q, GraphScope::all(), None, TIMEOUT).unwrap();
        ch.on_message(expired());

        let id = SubscriptionId::new();
        ch.on_message(ServerMessage::Subscribed {
            subscription_id: id,
            alias: None,
        });
        assert!(!ch.is_pending());
        assert!(matches!(rx.try_recv().unwrap(), ClientEvent::Subscribed { subscription_id, .. } if subscription_id == id));
    }

    #[test]
    fn refresh_failure_surfaces_original_error() {
        let (ch, rx, transport, tokens) = channel(false);
        ch.subscribe(Q, GraphScope::all(), None, TIMEOUT).unwrap();

        ch.on_message(expired());
        assert_eq!(tokens.refreshes.load(Ordering::Acquire), 1);
        assert_eq!(transport.sent().len(), 1);
        assert!(!ch.is_pending());
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientEvent::Error(ErrorResponse::new(401, "invalid_grant", "token expired"))
        );
    }

    #[test]
    fn other_errors_are_terminal_immediately() {
        let (ch, rx, _transport, tokens) = channel(true);
        ch.subscribe(Q, GraphScope::all(), None, TIMEOUT).unwrap();
        ch.on_message(ServerMessage::Error(ErrorResponse::new(400, "malformed_query", "")));
        assert_eq!(tokens.refreshes.load(Ordering::Acquire), 0);
        assert!(!ch.is_pending());
        assert!(matches!(rx.try_recv().unwrap(), ClientEvent::Error(e) if e.status == 400));
    }

    #[test]
    fn send_failure_frees_the_slot() {
        let (ch, _rx, transport, _) = channel(true);
        transport.fail.store(true, Ordering::Release);
        let err = ch.subscribe(Q, GraphScope::all(), None, TIMEOUT).unwrap_err();
        assert!(matches!(err, BrokerError::Transport(TransportError::SendFailed { .. })));
        assert!(!ch.is_pending());
    }

    #[test]
    fn broken_connection_releases_waiters_and_closes() {
        let (ch, rx, _transport, _) = channel(true);
        let ch = Arc::new(ch);
        ch.subscribe(Q, GraphScope::all(), None, TIMEOUT).unwrap();

        let waiter = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.subscribe(Q, GraphScope::all(), None, TIMEOUT))
        };
        thread::sleep(Duration::from_millis(20));
        ch.on_broken_connection("reset by peer");

        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, BrokerError::Transport(TransportError::ConnectionBroken { .. })));
        assert!(ch.is_closed());
        assert!(!ch.is_pending());
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientEvent::BrokenConnection {
                message: "reset by peer".to_string()
            }
        );
    }

    #[test]
    fn notifications_are_relayed_by_sequence() {
        let (ch, rx, _transport, _) = channel(true);
        let id = SubscriptionId::new();
        ch.on_message(ServerMessage::Notification(Notification::snapshot(id, ResultSet::new(["x"]))));
        ch.on_message(ServerMessage::Notification(Notification::delta(id, 1, Delta::default())));

        assert!(matches!(rx.try_recv().unwrap(), ClientEvent::FirstResults(n) if n.sequence == 0));
        assert!(matches!(rx.try_recv().unwrap(), ClientEvent::Results(n) if n.sequence == 1));
    }

    #[test]
    fn wait_idle_tracks_the_slot() {
        let (ch, _rx, _transport, _) = channel(true);
        assert!(ch.wait_idle(Duration::from_millis(1)));
        ch.subscribe(Q, GraphScope::all(), None, TIMEOUT).unwrap();
        assert!(!ch.wait_idle(Duration::from_millis(10)));
    }
}
