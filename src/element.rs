//! Playback element interface.
//!
//! The element is owned elsewhere; a key manager only keeps a weak reference
//! to it and pushes the active session's [`DecryptHandle`] into it.
use std::fmt;

use crate::cdm::SessionId;

/// Opaque handle identifying the CDM session a player decrypts with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecryptHandle {
    key_system: String,
    session_id: SessionId,
}

impl DecryptHandle {
    pub(crate) fn new(key_system: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            key_system: key_system.into(),
            session_id,
        }
    }

    pub fn key_system(&self) -> &str {
        &self.key_system
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

impl fmt::Display for DecryptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.key_system, self.session_id)
    }
}

/// A media element that plays protected content.
pub trait PlaybackElement {
    /// Whether the element currently has a player (render target) to bind.
    fn has_render_target(&self) -> bool;

    /// Bind or clear the player's decrypt handle.
    fn set_decryption_handle(&self, handle: Option<DecryptHandle>);

    /// A key became available; decryption may proceed.
    fn notify_key_available(&self);
}
