//! ClearKey CDM.
//!
//! Keys are exchanged in the clear: the license request lists the key ids
//! found in the initialization data, and the license response is a JWK set
//! holding the keys themselves. Every result is posted on the event channel.
use std::collections::HashMap;
use std::rc::Weak;

use serde::Serialize;

use crate::cdm::{
    Cdm, CdmClient, CdmEventKind, CdmInit, EventSender, KeyError, KeyErrorCode, SessionId,
};
use crate::error::{Error, Result};
use crate::initdata::extract_key_ids;
use crate::key::Key;
use crate::utils::{b64url_encode, mime_essence};

/// ClearKey key system identifier.
pub const CLEARKEY_KEY_SYSTEM: &str = "org.w3.clearkey";
/// MIME types the built-in ClearKey entry is registered with.
pub const CLEARKEY_MIME_TYPES: &[&str] = &["video/mp4", "audio/mp4", "video/webm", "audio/webm"];

#[derive(Debug, Serialize)]
struct LicenseRequest {
    kids: Vec<String>,
    #[serde(rename = "type")]
    session_type: &'static str,
}

/// Per-session ClearKey state.
#[derive(Debug)]
struct ClearKeySession {
    /// Session number (1-indexed, counts every session ever opened).
    number: u32,
    /// Key ids requested by the last license request.
    key_ids: Vec<Vec<u8>>,
    /// Keys loaded from license responses.
    keys: Vec<Key>,
}

/// ClearKey Content Decryption Module.
pub struct ClearKeyCdm {
    key_system: String,
    mime_types: Vec<String>,
    events: EventSender,
    sessions: HashMap<SessionId, ClearKeySession>,
    opened: u32,
}

impl ClearKeyCdm {
    /// Maximum number of concurrently opened sessions.
    pub const MAX_NUM_OF_SESSIONS: usize = 16;

    pub fn new(init: CdmInit) -> Self {
        Self {
            key_system: init.key_system,
            mime_types: init.mime_types,
            events: init.events,
            sessions: HashMap::new(),
            opened: 0,
        }
    }

    fn post(&self, session_id: SessionId, kind: CdmEventKind) {
        if !self.events.send(session_id, kind) {
            debug!("Dropping ClearKey event for {}: manager gone", session_id);
        }
    }

    fn post_error(&self, session_id: SessionId, code: KeyErrorCode) {
        self.post(session_id, CdmEventKind::KeyError(KeyError::new(code, 0)));
    }

    fn license_request(key_ids: &[Vec<u8>]) -> Result<Vec<u8>> {
        let request = LicenseRequest {
            kids: key_ids.iter().map(|kid| b64url_encode(kid)).collect(),
            session_type: "temporary",
        };
        Ok(serde_json::to_vec(&request)?)
    }
}

impl Cdm for ClearKeyCdm {
    fn key_system(&self) -> &str {
        &self.key_system
    }

    fn supports_mime_type(&self, mime_type: &str) -> bool {
        let essence = mime_essence(mime_type);
        self.mime_types.iter().any(|m| *m == essence)
    }

    // Results only travel over the event channel; no player state is pushed.
    fn set_client(&mut self, _client: Weak<dyn CdmClient>) {}

    fn open_session(&mut self) -> Result<SessionId> {
        if self.sessions.len() >= Self::MAX_NUM_OF_SESSIONS {
            return Err(Error::TooManySessions {
                max: Self::MAX_NUM_OF_SESSIONS,
            });
        }

        self.opened += 1;
        let session_id = SessionId::random();
        self.sessions.insert(
            session_id,
            ClearKeySession {
                number: self.opened,
                key_ids: Vec::new(),
                keys: Vec::new(),
            },
        );
        debug!("Opened ClearKey session #{} ({})", self.opened, session_id);
        Ok(session_id)
    }

    fn generate_key_request(&mut self, session_id: SessionId, mime_type: &str, init_data: &[u8]) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            self.post_error(session_id, KeyErrorCode::Unknown);
            return;
        };

        let key_ids = match extract_key_ids(mime_type, init_data) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("ClearKey session #{} rejected {} init data: {}", session.number, mime_type, e);
                self.post_error(session_id, KeyErrorCode::Client);
                return;
            }
        };

        let message = match Self::license_request(&key_ids) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to build ClearKey license request: {}", e);
                self.post_error(session_id, KeyErrorCode::Unknown);
                return;
            }
        };

        trace!("ClearKey session #{} requests {} key(s)", session.number, key_ids.len());
        session.key_ids = key_ids;
        self.post(
            session_id,
            CdmEventKind::KeyMessage {
                message,
                destination_url: None,
            },
        );
    }

    fn update(&mut self, session_id: SessionId, response: &[u8]) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            self.post_error(session_id, KeyErrorCode::Unknown);
            return;
        };

        let keys = match Key::parse_jwk_set(response) {
            Ok(keys) if !keys.is_empty() => keys,
            Ok(_) => {
                warn!("ClearKey session #{} got an empty key set", session.number);
                self.post_error(session_id, KeyErrorCode::Client);
                return;
            }
            Err(e) => {
                warn!("ClearKey session #{} got a malformed license: {}", session.number, e);
                self.post_error(session_id, KeyErrorCode::Client);
                return;
            }
        };

        for key in keys {
            if !session.key_ids.is_empty() && !session.key_ids.contains(&key.kid) {
                debug!("ClearKey session #{} loaded unrequested kid {}", session.number, key.kid_hex());
            }
            if let Some(pos) = session.keys.iter().position(|k| k.kid == key.kid) {
                session.keys[pos] = key;
            } else {
                session.keys.push(key);
            }
        }
        debug!("ClearKey session {} holds {} key(s)", session_id, session.keys.len());

        self.post(session_id, CdmEventKind::KeyAdded);
    }

    fn release_keys(&mut self, session_id: SessionId) {
        if self.sessions.remove(&session_id).is_some() {
            debug!("Released ClearKey session {}", session_id);
        }
    }

    fn cached_key_for_key_id(&self, session_id: SessionId, key_id: &[u8]) -> Option<Vec<u8>> {
        self.sessions
            .get(&session_id)?
            .keys
            .iter()
            .find(|k| k.kid == key_id)
            .map(|k| k.key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdm::{event_channel, CdmEvent};
    use crate::initdata::{build_pssh_box, PsshBox, COMMON_SYSTEM_ID};
    use crate::key::keys_to_jwk_set;

    fn cenc_init_data(kid: &[u8]) -> Vec<u8> {
        build_pssh_box(&PsshBox {
            version: 1,
            flags: 0,
            system_id: COMMON_SYSTEM_ID,
            key_ids: vec![kid.to_vec()],
            data: Vec::new(),
        })
    }

    fn cdm() -> (ClearKeyCdm, flume::Receiver<CdmEvent>) {
        let (events, rx) = event_channel();
        let cdm = ClearKeyCdm::new(CdmInit {
            key_system: CLEARKEY_KEY_SYSTEM.to_string(),
            mime_types: vec!["video/mp4".to_string()],
            events,
        });
        (cdm, rx)
    }

    #[test]
    fn key_request_lists_init_data_key_ids() {
        let (mut cdm, rx) = cdm();
        let id = cdm.open_session().unwrap();

        cdm.generate_key_request(id, "video/mp4", &cenc_init_data(&[0x11; 16]));

        let event = rx.try_recv().expect("key message");
        assert_eq!(event.session_id, id);
        match event.kind {
            CdmEventKind::KeyMessage { message, destination_url } => {
                let json: serde_json::Value = serde_json::from_slice(&message).unwrap();
                assert_eq!(json["kids"][0], b64url_encode(&[0x11; 16]));
                assert_eq!(json["type"], "temporary");
                assert!(destination_url.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn update_caches_keys_and_posts_key_added() {
        let (mut cdm, rx) = cdm();
        let id = cdm.open_session().unwrap();
        cdm.generate_key_request(id, "video/mp4", &cenc_init_data(&[0x11; 16]));
        assert!(matches!(
            rx.try_recv().unwrap().kind,
            CdmEventKind::KeyMessage { .. }
        ));

        let license = keys_to_jwk_set(&[Key::new(vec![0x11; 16], vec![0x22; 16])]).unwrap();
        cdm.update(id, license.as_bytes());

        assert_eq!(rx.try_recv().unwrap().kind, CdmEventKind::KeyAdded);
        assert_eq!(cdm.cached_key_for_key_id(id, &[0x11; 16]), Some(vec![0x22; 16]));
        assert_eq!(cdm.cached_key_for_key_id(id, &[0x33; 16]), None);
    }

    #[test]
    fn truncated_pssh_posts_client_error() {
        let (mut cdm, rx) = cdm();
        let id = cdm.open_session().unwrap();
        let init_data = cenc_init_data(&[0x11; 16]);

        cdm.generate_key_request(id, "video/mp4", &init_data[..init_data.len() - 3]);

        assert_eq!(
            rx.try_recv().unwrap().kind,
            CdmEventKind::KeyError(KeyError::new(KeyErrorCode::Client, 0))
        );
    }

    #[test]
    fn webm_init_data_is_the_key_id() {
        let (mut cdm, rx) = cdm();
        let id = cdm.open_session().unwrap();

        cdm.generate_key_request(id, "video/webm", &[0x11; 16]);

        let CdmEventKind::KeyMessage { message, .. } = rx.try_recv().unwrap().kind else {
            panic!("expected key message");
        };
        let json: serde_json::Value = serde_json::from_slice(&message).unwrap();
        assert_eq!(json["kids"][0], b64url_encode(&[0x11; 16]));
    }

    #[test]
    fn malformed_license_posts_client_error() {
        let (mut cdm, rx) = cdm();
        let id = cdm.open_session().unwrap();

        cdm.update(id, b"not json");
        cdm.update(id, br#"{"keys":[]}"#);

        for _ in 0..2 {
            assert_eq!(
                rx.try_recv().unwrap().kind,
                CdmEventKind::KeyError(KeyError::new(KeyErrorCode::Client, 0))
            );
        }
    }

    #[test]
    fn released_session_is_unknown() {
        let (mut cdm, rx) = cdm();
        let id = cdm.open_session().unwrap();
        cdm.release_keys(id);

        cdm.generate_key_request(id, "video/mp4", &[0x11; 16]);
        assert_eq!(
            rx.try_recv().unwrap().kind,
            CdmEventKind::KeyError(KeyError::new(KeyErrorCode::Unknown, 0))
        );
    }

    #[test]
    fn session_limit_is_enforced() {
        let (mut cdm, _rx) = cdm();
        for _ in 0..ClearKeyCdm::MAX_NUM_OF_SESSIONS {
            cdm.open_session().unwrap();
        }
        assert!(matches!(
            cdm.open_session(),
            Err(Error::TooManySessions { max: 16 })
        ));
    }

    #[test]
    fn mime_support_uses_configured_types() {
        let (cdm, _rx) = cdm();
        assert!(cdm.supports_mime_type("video/mp4; codecs=\"avc1\""));
        assert!(!cdm.supports_mime_type("video/webm"));
    }
}
