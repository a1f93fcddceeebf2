//! Room credential acquisition.
//!
//! Signing the live-room websocket request (ttwid, a_bogus, signature) is
//! upstream-specific and churns often, so it sits behind a capability trait.
//! The relay state machine only sees the resolved endpoint and cookie data.

use crate::error::Result;
use async_trait::async_trait;

/// Credentials for one websocket subscription.
#[derive(Debug, Clone, Default)]
pub struct RoomCredentials {
    /// Websocket endpoint, without the signature query parameters.
    pub endpoint: String,
    pub ttwid: String,
    pub signature: String,
    pub a_bogus: String,
    /// Extra cookie pairs sent verbatim.
    pub cookies: String,
}

/// Capability that produces fresh credentials for a room.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Acquire credentials for the room. Called before every connect, so
    /// implementations may re-sign on each reconnect.
    ///
    /// # Errors
    ///
    /// Returns an error when signing fails; the relay treats it like a
    /// transient connect failure.
    async fn acquire_room_credentials(&self, room_id: &str) -> Result<RoomCredentials>;
}

/// Provider that hands out pre-baked credentials, for tests and for
/// deployments where an external signer refreshes a shared file.
pub struct StaticCredentialProvider {
    credentials: RoomCredentials,
}

impl StaticCredentialProvider {
    pub fn new(credentials: RoomCredentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn acquire_room_credentials(&self, _room_id: &str) -> Result<RoomCredentials> {
        Ok(self.credentials.clone())
    }
}
