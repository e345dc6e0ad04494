//! Key session module.
//!
//! A [`KeySession`] is one key negotiation against its key manager's CDM. It
//! is shared between the manager and whoever created it, and keeps only a weak
//! back-reference to the manager. Closing releases the CDM-side keys;
//! detaching severs the back-reference so the session stays safe to query
//! after the manager is gone.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::cdm::{KeyError, SessionId};
use crate::element::DecryptHandle;
use crate::error::{Error, Result};
use crate::manager::ManagerInner;

/// Observable lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no key request issued yet.
    Open,
    /// A key request was handed to the CDM.
    KeyRequested,
    /// The CDM reported a key for this session.
    Keyed,
    /// The CDM reported a negotiation error.
    Failed,
    /// Closed; keys released.
    Closed,
    /// No longer attached to a key manager.
    Detached,
}

/// Notification for the script layer, queued in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    KeyMessage {
        message: Vec<u8>,
        destination_url: Option<String>,
    },
    KeyAdded,
    KeyError(KeyError),
}

/// A key session created by a key manager.
#[derive(Debug)]
pub struct KeySession {
    key_system: String,
    mime_type: String,
    id: SessionId,
    owner: RefCell<Option<Weak<ManagerInner>>>,
    negotiation: Cell<SessionState>,
    closed: Cell<bool>,
    error: Cell<Option<KeyError>>,
    events: RefCell<VecDeque<SessionEvent>>,
}

impl KeySession {
    pub(crate) fn new(
        owner: Weak<ManagerInner>,
        key_system: impl Into<String>,
        mime_type: impl Into<String>,
        id: SessionId,
    ) -> Self {
        Self {
            key_system: key_system.into(),
            mime_type: mime_type.into(),
            id,
            owner: RefCell::new(Some(owner)),
            negotiation: Cell::new(SessionState::Open),
            closed: Cell::new(false),
            error: Cell::new(None),
            events: RefCell::new(VecDeque::new()),
        }
    }

    /// Session identifier as lowercase hex.
    pub fn session_id(&self) -> String {
        self.id.to_string()
    }

    /// CDM correlation token of this session.
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key_system(&self) -> &str {
        &self.key_system
    }

    /// MIME type the session was created for.
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn state(&self) -> SessionState {
        if self.is_detached() {
            SessionState::Detached
        } else if self.closed.get() {
            SessionState::Closed
        } else {
            self.negotiation.get()
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn is_detached(&self) -> bool {
        self.owner.borrow().is_none()
    }

    /// Last error reported by the CDM.
    pub fn error(&self) -> Option<KeyError> {
        self.error.get()
    }

    /// Handle a player decrypts with; `None` once closed.
    pub fn decrypt_handle(&self) -> Option<DecryptHandle> {
        if self.closed.get() {
            return None;
        }
        Some(DecryptHandle::new(self.key_system.clone(), self.id))
    }

    /// Take all queued notifications.
    pub fn take_events(&self) -> Vec<SessionEvent> {
        self.events.borrow_mut().drain(..).collect()
    }

    fn owner(&self) -> Option<Rc<ManagerInner>> {
        self.owner.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Owner of a session that may still talk to the CDM.
    fn live_owner(&self) -> Result<Rc<ManagerInner>> {
        if self.closed.get() {
            return Err(Error::InvalidState(format!("Session {} is closed", self.id)));
        }
        self.owner()
            .ok_or_else(|| Error::InvalidState(format!("Session {} is detached", self.id)))
    }

    /// Whether CDM events for this session should still be delivered.
    pub(crate) fn is_live(&self) -> bool {
        !self.closed.get() && self.owner().is_some()
    }

    /// Ask the CDM to start key negotiation for `init_data`.
    ///
    /// The outcome is delivered later as a key message, key added or key
    /// error event on this session.
    pub fn generate_key_request(&self, mime_type: &str, init_data: &[u8]) -> Result<()> {
        if mime_type.is_empty() {
            return Err(Error::InvalidInput("Content type must not be empty".to_string()));
        }
        if init_data.is_empty() {
            return Err(Error::InvalidInput("Init data must not be empty".to_string()));
        }

        let owner = self.live_owner()?;
        self.negotiation.set(SessionState::KeyRequested);
        debug!("Session {} requests keys for {}", self.id, mime_type);
        owner.with_cdm(|cdm| cdm.generate_key_request(self.id, mime_type, init_data));
        Ok(())
    }

    /// Hand a license server response to the CDM.
    pub fn update(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("Key must not be empty".to_string()));
        }

        let owner = self.live_owner()?;
        owner.with_cdm(|cdm| cdm.update(self.id, key));
        Ok(())
    }

    /// Close the session and release its keys. Idempotent.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(owner) = self.owner() {
            owner.with_cdm(|cdm| cdm.release_keys(self.id));
        }
        debug!("Closed session {}", self.id);
    }

    /// Close the session, then sever the link to the key manager. Idempotent.
    ///
    /// Closing first lets the CDM release the session's keys while it is
    /// still reachable.
    pub fn detach_keys(&self) {
        self.close();
        if self.owner.borrow_mut().take().is_some() {
            trace!("Detached session {}", self.id);
        }
    }

    /// Key cached by this session for `key_id`.
    pub fn cached_key_for_key_id(&self, key_id: &[u8]) -> Option<Vec<u8>> {
        if self.closed.get() {
            return None;
        }
        self.owner()?
            .with_cdm_ref(|cdm| cdm.cached_key_for_key_id(self.id, key_id))
    }

    pub(crate) fn handle_key_message(&self, message: Vec<u8>, destination_url: Option<String>) {
        self.events.borrow_mut().push_back(SessionEvent::KeyMessage {
            message,
            destination_url,
        });
    }

    pub(crate) fn handle_key_added(&self) {
        self.negotiation.set(SessionState::Keyed);
        self.events.borrow_mut().push_back(SessionEvent::KeyAdded);
    }

    pub(crate) fn handle_key_error(&self, error: KeyError) {
        self.negotiation.set(SessionState::Failed);
        self.error.set(Some(error));
        self.events.borrow_mut().push_back(SessionEvent::KeyError(error));
    }
}
