//! Key system registry and capability queries.
//!
//! The registry answers "does key system X exist, and does it support MIME
//! type Y?" and constructs the CDM for a key system. A process-wide registry
//! preloaded with ClearKey backs [`supports_key_system`] and
//! [`is_type_supported`]; explicit [`KeySystemRegistry`] values can be built
//! by hand or from YAML configuration.
use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use parking_lot::{RwLock, RwLockReadGuard};
use serde::Deserialize;

use crate::cdm::{Cdm, CdmFactory, CdmInit, EventSender};
use crate::clearkey::{ClearKeyCdm, CLEARKEY_KEY_SYSTEM, CLEARKEY_MIME_TYPES};
use crate::error::{Error, Result};
use crate::utils::mime_essence;

static REGISTRY: LazyLock<RwLock<KeySystemRegistry>> =
    LazyLock::new(|| RwLock::new(KeySystemRegistry::builtin()));

/// A registered key system.
#[derive(Clone)]
pub struct KeySystemEntry {
    key_system: String,
    mime_types: Vec<String>,
    factory: CdmFactory,
}

impl KeySystemEntry {
    /// Create an entry. MIME types are stored as lowercase essences.
    pub fn new<I, S>(key_system: impl Into<String>, mime_types: I, factory: CdmFactory) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            key_system: key_system.into(),
            mime_types: mime_types
                .into_iter()
                .map(|m| mime_essence(m.as_ref()))
                .filter(|m| !m.is_empty())
                .collect(),
            factory,
        }
    }

    /// ClearKey with the given MIME types.
    pub fn clearkey<I, S>(key_system: impl Into<String>, mime_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(
            key_system,
            mime_types,
            Arc::new(|init: CdmInit| Box::new(ClearKeyCdm::new(init)) as Box<dyn Cdm>),
        )
    }

    pub fn key_system(&self) -> &str {
        &self.key_system
    }

    pub fn mime_types(&self) -> &[String] {
        &self.mime_types
    }

    fn supports_mime_type(&self, mime_type: &str) -> bool {
        let essence = mime_essence(mime_type);
        self.mime_types.iter().any(|m| *m == essence)
    }
}

impl fmt::Debug for KeySystemEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySystemEntry")
            .field("key_system", &self.key_system)
            .field("mime_types", &self.mime_types)
            .finish_non_exhaustive()
    }
}

/// Registry configuration loaded from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub key_systems: Vec<KeySystemConfig>,
}

/// One configured key system.
#[derive(Debug, Clone, Deserialize)]
pub struct KeySystemConfig {
    /// Key system identifier, e.g. `org.w3.clearkey`.
    pub name: String,
    /// CDM implementation backing the key system.
    #[serde(default = "default_implementation")]
    pub implementation: String,
    #[serde(default)]
    pub mime_types: Vec<String>,
}

fn default_implementation() -> String {
    "clearkey".to_string()
}

/// Set of known key systems.
#[derive(Debug, Clone, Default)]
pub struct KeySystemRegistry {
    entries: Vec<KeySystemEntry>,
}

impl KeySystemRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in registry: ClearKey for MP4 and WebM.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(KeySystemEntry::clearkey(
            CLEARKEY_KEY_SYSTEM,
            CLEARKEY_MIME_TYPES.iter().copied(),
        ));
        registry
    }

    /// Build a registry from configuration.
    ///
    /// Names must be non-empty and unique; `clearkey` is the only
    /// implementation that can be configured.
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        let mut registry = Self::new();
        for ks in config.key_systems.iter() {
            if ks.name.is_empty() {
                return Err(Error::InvalidConfig("Key system name must not be empty".to_string()));
            }
            if registry.supports_key_system(&ks.name) {
                return Err(Error::InvalidConfig(format!(
                    "Key system {} configured twice",
                    ks.name
                )));
            }
            let entry = match ks.implementation.to_lowercase().as_str() {
                "clearkey" => KeySystemEntry::clearkey(ks.name.clone(), ks.mime_types.iter()),
                other => {
                    return Err(Error::InvalidConfig(format!(
                        "Unknown CDM implementation '{}' for {}",
                        other, ks.name
                    )))
                }
            };
            registry.register(entry);
        }
        Ok(registry)
    }

    /// Parse YAML configuration and build a registry from it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RegistryConfig = serde_yaml::from_str(yaml)?;
        Self::from_config(&config)
    }

    /// Load YAML configuration from a file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Add an entry, replacing any entry with the same key system.
    pub fn register(&mut self, entry: KeySystemEntry) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.key_system == entry.key_system)
        {
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
    }

    pub fn entries(&self) -> &[KeySystemEntry] {
        &self.entries
    }

    fn entry(&self, key_system: &str) -> Option<&KeySystemEntry> {
        if key_system.is_empty() {
            return None;
        }
        self.entries.iter().find(|e| e.key_system == key_system)
    }

    /// Whether `key_system` is registered. Comparison is case-sensitive.
    #[must_use]
    pub fn supports_key_system(&self, key_system: &str) -> bool {
        self.entry(key_system).is_some()
    }

    /// Whether `key_system` is registered with `mime_type`.
    #[must_use]
    pub fn key_system_supports_mime_type(&self, key_system: &str, mime_type: &str) -> bool {
        self.entry(key_system)
            .is_some_and(|e| e.supports_mime_type(mime_type))
    }

    /// Capability query: unknown or empty key systems fail closed; an empty
    /// MIME type only asks whether the key system exists.
    #[must_use]
    pub fn is_type_supported(&self, key_system: &str, mime_type: &str) -> bool {
        if !self.supports_key_system(key_system) {
            return false;
        }
        if mime_type.is_empty() {
            return true;
        }
        self.key_system_supports_mime_type(key_system, mime_type)
    }

    /// Instantiate the CDM for `key_system`.
    pub fn create_cdm(&self, key_system: &str, events: EventSender) -> Option<Box<dyn Cdm>> {
        let entry = self.entry(key_system)?;
        Some((entry.factory)(CdmInit {
            key_system: entry.key_system.clone(),
            mime_types: entry.mime_types.clone(),
            events,
        }))
    }
}

/// Read access to the process-wide registry.
pub fn global() -> RwLockReadGuard<'static, KeySystemRegistry> {
    REGISTRY.read()
}

/// Add or replace a key system in the process-wide registry.
pub fn register_key_system(entry: KeySystemEntry) {
    debug!("Registering key system {}", entry.key_system);
    REGISTRY.write().register(entry);
}

/// Whether `key_system` is known to the process-wide registry.
#[must_use]
pub fn supports_key_system(key_system: &str) -> bool {
    global().supports_key_system(key_system)
}

/// Capability query against the process-wide registry.
///
/// See [`KeySystemRegistry::is_type_supported`].
#[must_use]
pub fn is_type_supported(key_system: &str, mime_type: &str) -> bool {
    global().is_type_supported(key_system, mime_type)
}
