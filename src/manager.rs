//! Key manager: the per-document owner of a CDM and its key sessions.
//!
//! The manager owns the CDM exclusively, shares its sessions with callers and
//! holds a weak reference to the playback element it feeds. CDM results are
//! queued on a channel and only acted upon when the control thread calls
//! [`KeyManager::dispatch_pending`] or [`KeyManager::dispatch_next`].
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::cdm::{event_channel, Cdm, CdmClient, CdmEvent, CdmEventKind, KeyError, SessionId};
use crate::element::PlaybackElement;
use crate::error::{Error, Result};
use crate::registry::{self, KeySystemRegistry};
use crate::session::KeySession;

/// Shared state behind a [`KeyManager`]; sessions and the CDM point back here weakly.
pub(crate) struct ManagerInner {
    key_system: String,
    cdm: RefCell<Box<dyn Cdm>>,
    sessions: RefCell<Vec<Rc<KeySession>>>,
    element: RefCell<Option<Weak<dyn PlaybackElement>>>,
    events: flume::Receiver<CdmEvent>,
}

impl ManagerInner {
    pub(crate) fn with_cdm<R>(&self, f: impl FnOnce(&mut dyn Cdm) -> R) -> R {
        let mut cdm = self.cdm.borrow_mut();
        f(&mut **cdm)
    }

    pub(crate) fn with_cdm_ref<R>(&self, f: impl FnOnce(&dyn Cdm) -> R) -> R {
        let cdm = self.cdm.borrow();
        f(&**cdm)
    }

    fn element(&self) -> Option<Rc<dyn PlaybackElement>> {
        self.element.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// The session an event for `session_id` should go to, if it is still live.
    fn live_session(&self, session_id: SessionId) -> Option<Rc<KeySession>> {
        let session = self
            .sessions
            .borrow()
            .iter()
            .find(|s| s.id() == session_id)
            .cloned();
        match session {
            Some(session) if session.is_live() => Some(session),
            _ => {
                trace!("Dropping CDM event for inactive session {}", session_id);
                None
            }
        }
    }

    fn set_media_element(&self, element: Option<&Rc<dyn PlaybackElement>>) {
        // Clear the old binding before the new element can observe a handle.
        if let Some(old) = self.element() {
            if old.has_render_target() {
                old.set_decryption_handle(None);
            }
        }

        *self.element.borrow_mut() = element.map(Rc::downgrade);

        let Some(new) = self.element() else {
            return;
        };
        if !new.has_render_target() {
            return;
        }
        let active = self.sessions.borrow().last().cloned();
        if let Some(session) = active {
            debug!("Binding session {} to playback element", session.id());
            new.set_decryption_handle(session.decrypt_handle());
        }
    }

    fn route(&self, event: CdmEvent) {
        match event.kind {
            CdmEventKind::KeyMessage {
                message,
                destination_url,
            } => self.key_message(event.session_id, message, destination_url),
            CdmEventKind::KeyAdded => self.key_added(event.session_id),
            CdmEventKind::KeyError(error) => self.key_error(event.session_id, error),
        }
    }
}

impl CdmClient for ManagerInner {
    fn key_message(&self, session_id: SessionId, message: Vec<u8>, destination_url: Option<String>) {
        if let Some(session) = self.live_session(session_id) {
            session.handle_key_message(message, destination_url);
        }
    }

    fn key_added(&self, session_id: SessionId) {
        let Some(session) = self.live_session(session_id) else {
            return;
        };
        session.handle_key_added();

        match self.element() {
            Some(element) => element.notify_key_available(),
            None => {
                debug!("Key added for {} with no playback element attached", session_id);
            }
        }
    }

    fn key_error(&self, session_id: SessionId, error: KeyError) {
        if let Some(session) = self.live_session(session_id) {
            warn!("Session {} failed: {}", session_id, error);
            session.handle_key_error(error);
        }
    }

    fn media_player(&self) -> Option<Rc<dyn PlaybackElement>> {
        self.element().filter(|e| e.has_render_target())
    }
}

/// Key management object for one protected-content context.
pub struct KeyManager {
    inner: Rc<ManagerInner>,
}

impl KeyManager {
    /// Create a manager for `key_system` from the process-wide registry.
    pub fn create(key_system: &str) -> Result<Self> {
        // Factories may register key systems, so don't hold the lock across them.
        let registry = registry::global().clone();
        Self::create_with_registry(key_system, &registry)
    }

    /// Create a manager for `key_system` from an explicit registry.
    ///
    /// Either a fully wired manager is returned, or no CDM is created.
    pub fn create_with_registry(key_system: &str, registry: &KeySystemRegistry) -> Result<Self> {
        if key_system.is_empty() {
            return Err(Error::InvalidInput("Key system must not be empty".to_string()));
        }
        if !registry.supports_key_system(key_system) {
            return Err(Error::Unsupported(format!("Key system {}", key_system)));
        }

        let (events, receiver) = event_channel();
        let cdm = registry
            .create_cdm(key_system, events)
            .ok_or_else(|| Error::Unsupported(format!("Key system {}", key_system)))?;

        let inner = Rc::new(ManagerInner {
            key_system: key_system.to_string(),
            cdm: RefCell::new(cdm),
            sessions: RefCell::new(Vec::new()),
            element: RefCell::new(None),
            events: receiver,
        });
        let weak = Rc::downgrade(&inner);
        let client: Weak<dyn CdmClient> = weak;
        inner.with_cdm(|cdm| cdm.set_client(client));

        info!("Created key manager for {}", key_system);
        Ok(Self { inner })
    }

    /// Static capability query, see [`KeySystemRegistry::is_type_supported`].
    #[must_use]
    pub fn is_type_supported(key_system: &str, mime_type: &str) -> bool {
        registry::is_type_supported(key_system, mime_type)
    }

    pub fn key_system(&self) -> &str {
        &self.inner.key_system
    }

    /// Sessions in creation order.
    pub fn sessions(&self) -> Vec<Rc<KeySession>> {
        self.inner.sessions.borrow().clone()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.borrow().len()
    }

    /// The most recently created session.
    pub fn active_session(&self) -> Option<Rc<KeySession>> {
        self.inner.sessions.borrow().last().cloned()
    }

    /// Create a session for `mime_type` and start key negotiation for `init_data`.
    ///
    /// Returns as soon as the request is handed to the CDM; its outcome is
    /// delivered as session events by the dispatch methods. The new session
    /// becomes the active one, but the playback element binding is only
    /// refreshed on the next attach.
    pub fn create_session(&self, mime_type: &str, init_data: &[u8]) -> Result<Rc<KeySession>> {
        if mime_type.is_empty() {
            return Err(Error::InvalidInput("Content type must not be empty".to_string()));
        }
        if init_data.is_empty() {
            return Err(Error::InvalidInput("Init data must not be empty".to_string()));
        }
        if !self.inner.with_cdm_ref(|cdm| cdm.supports_mime_type(mime_type)) {
            return Err(Error::Unsupported(format!(
                "{} does not support {}",
                self.inner.key_system, mime_type
            )));
        }

        let session_id = self.inner.with_cdm(|cdm| cdm.open_session())?;
        let session = Rc::new(KeySession::new(
            Rc::downgrade(&self.inner),
            self.inner.key_system.clone(),
            mime_type,
            session_id,
        ));
        self.inner.sessions.borrow_mut().push(session.clone());
        debug!(
            "Created session {} ({} total)",
            session_id,
            self.session_count()
        );

        session.generate_key_request(mime_type, init_data)?;
        Ok(session)
    }

    /// Attach `element`, replacing any previous one.
    pub fn attach(&self, element: &Rc<dyn PlaybackElement>) {
        self.inner.set_media_element(Some(element));
    }

    /// Detach the current element, clearing its decrypt handle.
    pub fn detach(&self) {
        self.inner.set_media_element(None);
    }

    /// Attach `element`, or detach when `None`.
    pub fn set_media_element(&self, element: Option<&Rc<dyn PlaybackElement>>) {
        self.inner.set_media_element(element);
    }

    /// The attached element, if it is still alive.
    pub fn media_element(&self) -> Option<Rc<dyn PlaybackElement>> {
        self.inner.element()
    }

    /// The playback target a CDM should push decode-time state into.
    pub fn media_player(&self) -> Option<Rc<dyn PlaybackElement>> {
        self.inner.media_player()
    }

    /// Key cached for `key_id` by the oldest session that has one.
    pub fn cached_key_for_key_id(&self, key_id: &[u8]) -> Option<Vec<u8>> {
        let sessions = self.sessions();
        sessions
            .iter()
            .find_map(|session| session.cached_key_for_key_id(key_id))
    }

    /// Route every queued CDM event. Returns how many were taken off the queue.
    pub fn dispatch_pending(&self) -> usize {
        let mut dispatched = 0;
        loop {
            match self.inner.events.try_recv() {
                Ok(event) => {
                    self.inner.route(event);
                    dispatched += 1;
                }
                Err(flume::TryRecvError::Empty) | Err(flume::TryRecvError::Disconnected) => break,
            }
        }
        dispatched
    }

    /// Wait up to `timeout` for one CDM event and route it.
    pub fn dispatch_next(&self, timeout: Duration) -> bool {
        match self.inner.events.recv_timeout(timeout) {
            Ok(event) => {
                self.inner.route(event);
                true
            }
            Err(_) => false,
        }
    }
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        let sessions = self.sessions();
        for session in sessions.iter() {
            session.close();
            session.detach_keys();
        }

        if let Some(element) = self.inner.element() {
            if element.has_render_target() {
                element.set_decryption_handle(None);
            }
        }
        debug!(
            "Tore down key manager for {} ({} session(s))",
            self.inner.key_system,
            sessions.len()
        );
    }
}
