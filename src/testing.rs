//! Test doubles shared by the unit tests.
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cdm::{Cdm, CdmClient, CdmInit, EventSender, SessionId};
use crate::element::{DecryptHandle, PlaybackElement};
use crate::error::Result;
use crate::registry::KeySystemEntry;
use crate::utils::mime_essence;

/// Something a [`RecordingElement`] observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementCall {
    SetHandle(Option<DecryptHandle>),
    KeyAvailable,
}

/// Calls of several elements in global order.
pub type Journal = Rc<RefCell<Vec<(&'static str, ElementCall)>>>;

/// Playback element that records every call.
#[derive(Debug)]
pub struct RecordingElement {
    name: &'static str,
    render_target: Cell<bool>,
    calls: RefCell<Vec<ElementCall>>,
    journal: Option<Journal>,
}

impl RecordingElement {
    pub fn new(render_target: bool) -> Rc<Self> {
        Rc::new(Self {
            name: "element",
            render_target: Cell::new(render_target),
            calls: RefCell::new(Vec::new()),
            journal: None,
        })
    }

    /// An element that also appends its calls to `journal` under `name`.
    pub fn in_journal(name: &'static str, journal: &Journal) -> Rc<Self> {
        Rc::new(Self {
            name,
            render_target: Cell::new(true),
            calls: RefCell::new(Vec::new()),
            journal: Some(journal.clone()),
        })
    }

    pub fn as_dyn(self: &Rc<Self>) -> Rc<dyn PlaybackElement> {
        self.clone()
    }

    pub fn set_render_target(&self, render_target: bool) {
        self.render_target.set(render_target);
    }

    fn record(&self, call: ElementCall) {
        if let Some(journal) = &self.journal {
            journal.borrow_mut().push((self.name, call.clone()));
        }
        self.calls.borrow_mut().push(call);
    }

    pub fn calls(&self) -> Vec<ElementCall> {
        self.calls.borrow().clone()
    }

    pub fn key_available_count(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| **c == ElementCall::KeyAvailable)
            .count()
    }

    /// Most recent handle binding, `None` when never bound.
    pub fn current_handle(&self) -> Option<Option<DecryptHandle>> {
        self.calls.borrow().iter().rev().find_map(|c| match c {
            ElementCall::SetHandle(h) => Some(h.clone()),
            ElementCall::KeyAvailable => None,
        })
    }
}

impl PlaybackElement for RecordingElement {
    fn has_render_target(&self) -> bool {
        self.render_target.get()
    }

    fn set_decryption_handle(&self, handle: Option<DecryptHandle>) {
        self.record(ElementCall::SetHandle(handle));
    }

    fn notify_key_available(&self) {
        self.record(ElementCall::KeyAvailable);
    }
}

/// Observable state of a [`MockCdm`], shared with the test.
#[derive(Debug, Default)]
pub struct MockState {
    pub events: Option<EventSender>,
    pub opened: Vec<SessionId>,
    pub requests: Vec<(SessionId, String, Vec<u8>)>,
    pub updates: Vec<(SessionId, Vec<u8>)>,
    pub released: Vec<SessionId>,
    pub keys: HashMap<(SessionId, Vec<u8>), Vec<u8>>,
    pub has_client: bool,
}

/// Handle the test keeps on a mock key system.
#[derive(Debug, Clone, Default)]
pub struct MockHandle(pub Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn sender(&self) -> EventSender {
        self.0
            .lock()
            .events
            .clone()
            .expect("mock CDM not instantiated")
    }

    pub fn cache_key(&self, session_id: SessionId, key_id: &[u8], key: &[u8]) {
        self.0
            .lock()
            .keys
            .insert((session_id, key_id.to_vec()), key.to_vec());
    }
}

/// A CDM that records calls and never posts events on its own.
pub struct MockCdm {
    key_system: String,
    mime_types: Vec<String>,
    state: MockHandle,
}

impl Cdm for MockCdm {
    fn key_system(&self) -> &str {
        &self.key_system
    }

    fn supports_mime_type(&self, mime_type: &str) -> bool {
        self.mime_types.contains(&mime_essence(mime_type))
    }

    fn set_client(&mut self, client: Weak<dyn CdmClient>) {
        self.state.0.lock().has_client = client.upgrade().is_some();
    }

    fn open_session(&mut self) -> Result<SessionId> {
        let id = SessionId::random();
        self.state.0.lock().opened.push(id);
        Ok(id)
    }

    fn generate_key_request(&mut self, session_id: SessionId, mime_type: &str, init_data: &[u8]) {
        self.state
            .0
            .lock()
            .requests
            .push((session_id, mime_type.to_string(), init_data.to_vec()));
    }

    fn update(&mut self, session_id: SessionId, response: &[u8]) {
        self.state.0.lock().updates.push((session_id, response.to_vec()));
    }

    fn release_keys(&mut self, session_id: SessionId) {
        let mut state = self.state.0.lock();
        state.released.push(session_id);
        state.keys.retain(|(id, _), _| *id != session_id);
    }

    fn cached_key_for_key_id(&self, session_id: SessionId, key_id: &[u8]) -> Option<Vec<u8>> {
        self.state
            .0
            .lock()
            .keys
            .get(&(session_id, key_id.to_vec()))
            .cloned()
    }
}

/// Registry entry backed by a [`MockCdm`].
pub fn mock_entry(key_system: &str, mime_types: &[&str]) -> (KeySystemEntry, MockHandle) {
    let handle = MockHandle::default();
    let shared = handle.clone();
    let entry = KeySystemEntry::new(
        key_system,
        mime_types.iter().copied(),
        Arc::new(move |init: CdmInit| {
            shared.0.lock().events = Some(init.events.clone());
            Box::new(MockCdm {
                key_system: init.key_system,
                mime_types: init.mime_types,
                state: shared.clone(),
            }) as Box<dyn Cdm>
        }),
    );
    (entry, handle)
}
