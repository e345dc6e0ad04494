//! rsmediakeys - legacy media keys (EME v0.1b) session management in Rust.
//!
//! This crate provides:
//! - Key system capability queries backed by a configurable registry.
//! - `KeyManager`: owns a CDM, creates key sessions and binds the active
//!   session to a playback element.
//! - `KeySession`: one key negotiation, correlated with CDM results through an
//!   opaque session id.
//! - A ClearKey CDM and initialization data parsing.
//!
//! Feature flags:
//! - `tracing`: emit logs through `tracing` (default).
//! - `cli`: enable the CLI binary.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// CDM abstraction and event channel.
pub mod cdm;
/// ClearKey CDM.
pub mod clearkey;
/// Playback element interface.
pub mod element;
/// Common error types and Result alias.
pub mod error;
/// Initialization data parsing.
pub mod initdata;
/// Content key representation.
pub mod key;
/// Key manager.
pub mod manager;
/// Key system registry and capability probes.
pub mod registry;
/// Key session.
pub mod session;
/// Shared helper utilities.
pub mod utils;

#[cfg(test)]
mod testing;

pub use cdm::{Cdm, CdmClient, CdmEvent, CdmEventKind, EventSender, KeyError, KeyErrorCode, SessionId};
pub use element::{DecryptHandle, PlaybackElement};
pub use error::{Error, Result};
pub use manager::KeyManager;
pub use registry::{is_type_supported, supports_key_system, KeySystemEntry, KeySystemRegistry};
pub use session::{KeySession, SessionEvent, SessionState};
