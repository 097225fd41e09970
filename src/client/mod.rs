//! Client side of the subscription protocol.

/// Request slot and credential retry.
pub mod channel;
/// Wire messages.
pub mod protocol;
/// Credential collaborator.
pub mod security;

pub use channel::{ChannelConfig, ClientEvent, ClientSubscriptionChannel, SubscriptionTransport};
pub use protocol::{ClientRequest, ErrorResponse, ServerMessage};
pub use security::{Credential, CredentialProvider, NoCredentials};
