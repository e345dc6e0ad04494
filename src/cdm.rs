//! Content Decryption Module abstraction.
//!
//! A [`Cdm`] is owned by exactly one key manager. It reports back through two
//! paths:
//! - synchronous queries on the [`CdmClient`] it was given (the current
//!   playback target),
//! - negotiation results posted as [`CdmEvent`]s on an [`EventSender`], which
//!   the key manager drains on its own control thread.
//!
//! Implementations must never deliver negotiation results synchronously from
//! inside a `Cdm` method; they may post from any thread.
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use uuid::Uuid;

use crate::element::PlaybackElement;
use crate::error::Result;

/// Opaque correlation token for one CDM-level session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random session id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Raw 16 bytes of the id.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

/// Legacy MediaKeyError codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum KeyErrorCode {
    Unknown = 1,
    Client = 2,
    Service = 3,
    Output = 4,
    HardwareChange = 5,
    Domain = 6,
}

impl From<KeyErrorCode> for u16 {
    fn from(code: KeyErrorCode) -> Self {
        code as u16
    }
}

/// A negotiation failure reported by a CDM for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyError {
    pub code: KeyErrorCode,
    /// CDM-specific detail code, 0 when unused.
    pub system_code: u32,
}

impl KeyError {
    pub fn new(code: KeyErrorCode, system_code: u32) -> Self {
        Self { code, system_code }
    }
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (system code {})", self.code, self.system_code)
    }
}

/// Result of CDM negotiation work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdmEventKind {
    /// A message (license request) the application must deliver to a license server.
    KeyMessage {
        message: Vec<u8>,
        destination_url: Option<String>,
    },
    /// A key was provisioned for the session.
    KeyAdded,
    /// Negotiation failed.
    KeyError(KeyError),
}

/// A CDM completion, tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdmEvent {
    pub session_id: SessionId,
    pub kind: CdmEventKind,
}

/// Sending half of a key manager's event channel.
///
/// Cloneable and `Send`, so CDMs can post from worker threads.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: flume::Sender<CdmEvent>,
}

impl EventSender {
    /// Post an event. Returns `false` when the receiving manager is gone.
    pub fn send(&self, session_id: SessionId, kind: CdmEventKind) -> bool {
        self.tx.send(CdmEvent { session_id, kind }).is_ok()
    }
}

/// Create an unbounded event channel.
pub fn event_channel() -> (EventSender, flume::Receiver<CdmEvent>) {
    let (tx, rx) = flume::unbounded();
    (EventSender { tx }, rx)
}

/// Callback interface a CDM uses to reach its owning key manager.
pub trait CdmClient {
    /// A message for the license server was produced for `session_id`.
    fn key_message(&self, session_id: SessionId, message: Vec<u8>, destination_url: Option<String>);
    /// A key was provisioned for `session_id`.
    fn key_added(&self, session_id: SessionId);
    /// Negotiation failed for `session_id`.
    fn key_error(&self, session_id: SessionId, error: KeyError);
    /// The current playback target, if an element with a render target is attached.
    fn media_player(&self) -> Option<Rc<dyn PlaybackElement>>;
}

/// A content decryption module for one key system.
pub trait Cdm {
    /// Key system this CDM was instantiated for.
    fn key_system(&self) -> &str;

    /// Whether the CDM can decrypt content of `mime_type`.
    fn supports_mime_type(&self, mime_type: &str) -> bool;

    /// Register the owning key manager.
    fn set_client(&mut self, client: Weak<dyn CdmClient>);

    /// Allocate CDM-side state for a new session.
    fn open_session(&mut self) -> Result<SessionId>;

    /// Start key negotiation. Results arrive as events for `session_id`.
    fn generate_key_request(&mut self, session_id: SessionId, mime_type: &str, init_data: &[u8]);

    /// Feed a license server response for `session_id`.
    fn update(&mut self, session_id: SessionId, response: &[u8]);

    /// Drop keys and state held for `session_id`.
    fn release_keys(&mut self, session_id: SessionId);

    /// Key material cached for `session_id` under `key_id`.
    fn cached_key_for_key_id(&self, session_id: SessionId, key_id: &[u8]) -> Option<Vec<u8>>;
}

/// Parameters a registry hands to a [`CdmFactory`].
#[derive(Debug, Clone)]
pub struct CdmInit {
    pub key_system: String,
    /// MIME types registered for the key system.
    pub mime_types: Vec<String>,
    pub events: EventSender,
}

/// Constructor for the CDM of a registered key system.
pub type CdmFactory = Arc<dyn Fn(CdmInit) -> Box<dyn Cdm> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_renders_as_hex() {
        let id = SessionId::random();
        let rendered = id.to_string();

        assert_eq!(rendered.len(), 32);
        assert_eq!(rendered, hex::encode(id.as_bytes()));
        assert_ne!(id, SessionId::random());
    }

    #[test]
    fn sender_reports_closed_channel() {
        let (events, rx) = event_channel();
        let id = SessionId::random();

        assert!(events.send(id, CdmEventKind::KeyAdded));
        assert_eq!(
            rx.try_recv().unwrap(),
            CdmEvent {
                session_id: id,
                kind: CdmEventKind::KeyAdded
            }
        );

        drop(rx);
        assert!(!events.send(id, CdmEventKind::KeyAdded));
    }

    #[test]
    fn sender_crosses_threads() {
        let (events, rx) = event_channel();
        let id = SessionId::random();

        std::thread::spawn(move || {
            events.send(
                id,
                CdmEventKind::KeyError(KeyError::new(KeyErrorCode::Service, 7)),
            );
        })
        .join()
        .unwrap();

        let event = rx.recv().unwrap();
        assert_eq!(
            event.kind,
            CdmEventKind::KeyError(KeyError::new(KeyErrorCode::Service, 7))
        );
        assert_eq!(u16::from(KeyErrorCode::Service), 3);
    }
}
