#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Context;
use base64::Engine;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info, warn, Level};

use rsmediakeys::clearkey::CLEARKEY_KEY_SYSTEM;
use rsmediakeys::key::{keys_to_jwk_set, Key};
use rsmediakeys::registry::{self, KeySystemRegistry};
use rsmediakeys::{DecryptHandle, KeyManager, PlaybackElement, SessionEvent};

#[derive(Parser)]
#[command(name = "rsmediakeys", version, disable_version_flag = true, about = "rsmediakeys CLI")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    /// YAML key system registry to use instead of the built-in one.
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Check whether a key system, and optionally a MIME type for it, is supported.
    Probe {
        key_system: String,
        mime_type: Option<String>,
    },
    /// Run a key negotiation against an in-process playback element.
    ///
    /// The init data is base64. Each key is given as `<kid hex>:<key hex>` and
    /// is sent back to the CDM as a ClearKey JWK set license.
    License {
        init_data: String,
        #[arg(short = 'k', long = "key")]
        keys: Vec<String>,
        #[arg(short = 's', long = "key-system", default_value = CLEARKEY_KEY_SYSTEM)]
        key_system: String,
        #[arg(short = 't', long = "type", default_value = "video/mp4")]
        mime_type: String,
    },
}

/// Playback element that logs what the key manager pushes into it.
struct LoggingElement;

impl PlaybackElement for LoggingElement {
    fn has_render_target(&self) -> bool {
        true
    }

    fn set_decryption_handle(&self, handle: Option<DecryptHandle>) {
        match handle {
            Some(handle) => info!("[+] Player bound to session {}", handle),
            None => info!("[+] Player decrypt handle cleared"),
        }
    }

    fn notify_key_available(&self) {
        info!("[+] Player notified: key available");
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .init();

    info!("rsmediakeys version {}", env!("CARGO_PKG_VERSION"));

    if cli.version {
        return Ok(());
    }

    let registry = load_registry(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Probe {
            key_system,
            mime_type,
        }) => run_probe(&registry, &key_system, mime_type.as_deref()),
        Some(Commands::License {
            init_data,
            keys,
            key_system,
            mime_type,
        }) => run_license(&registry, &key_system, &mime_type, &init_data, &keys),
        None => Ok(()),
    }
}

fn load_registry(config: Option<&Path>) -> anyhow::Result<KeySystemRegistry> {
    match config {
        Some(path) => KeySystemRegistry::from_path(path)
            .with_context(|| format!("Failed to load registry config {}", path.display())),
        None => Ok(registry::global().clone()),
    }
}

fn run_probe(
    registry: &KeySystemRegistry,
    key_system: &str,
    mime_type: Option<&str>,
) -> anyhow::Result<()> {
    let supported = registry.supports_key_system(key_system);
    info!("Key system {:?}: {}", key_system, if supported { "supported" } else { "not supported" });

    if let Some(mime_type) = mime_type {
        let supported = registry.is_type_supported(key_system, mime_type);
        info!(
            "{:?} with {:?}: {}",
            key_system,
            mime_type,
            if supported { "supported" } else { "not supported" }
        );
    }
    Ok(())
}

fn run_license(
    registry: &KeySystemRegistry,
    key_system: &str,
    mime_type: &str,
    init_data_b64: &str,
    keys: &[String],
) -> anyhow::Result<()> {
    let init_data = base64::engine::general_purpose::STANDARD
        .decode(init_data_b64.trim())
        .context("Init data is not valid base64")?;
    let keys = keys
        .iter()
        .map(String::as_str)
        .map(parse_key)
        .collect::<anyhow::Result<Vec<_>>>()?;

    let manager = KeyManager::create_with_registry(key_system, registry)
        .with_context(|| format!("Failed to create key manager for {}", key_system))?;
    info!("[+] Loaded key manager for {}", manager.key_system());

    let element: Rc<dyn PlaybackElement> = Rc::new(LoggingElement);
    manager.attach(&element);

    let session = manager.create_session(mime_type, &init_data)?;
    info!("[+] Created session {}", session.session_id());

    manager.dispatch_pending();
    for event in session.take_events() {
        match event {
            SessionEvent::KeyMessage { message, destination_url } => {
                info!("[+] Key message: {}", String::from_utf8_lossy(&message));
                if let Some(url) = destination_url {
                    info!("    destination: {}", url);
                }
            }
            SessionEvent::KeyError(e) => anyhow::bail!("Key request failed: {}", e),
            SessionEvent::KeyAdded => {}
        }
    }

    if keys.is_empty() {
        warn!("No keys given, stopping after the license request");
        return Ok(());
    }

    let license = keys_to_jwk_set(&keys)?;
    session.update(license.as_bytes())?;
    manager.dispatch_pending();
    for event in session.take_events() {
        match event {
            SessionEvent::KeyAdded => info!("[+] Keys added to session"),
            SessionEvent::KeyError(e) => error!("[-] License rejected: {}", e),
            SessionEvent::KeyMessage { .. } => {}
        }
    }

    // Rebind so the player picks up the negotiated session.
    manager.attach(&element);

    for key in keys.iter() {
        match manager.cached_key_for_key_id(&key.kid) {
            Some(value) => info!("[CONTENT] {}:{}", key.kid_hex(), hex::encode(value)),
            None => warn!("[-] Key {} not cached", key.kid_hex()),
        }
    }
    Ok(())
}

fn parse_key(arg: &str) -> anyhow::Result<Key> {
    let (kid, key) = arg
        .split_once(':')
        .with_context(|| format!("Key '{}' must be <kid hex>:<key hex>", arg))?;
    let kid = hex::decode(kid.trim()).with_context(|| format!("Invalid kid hex '{}'", kid))?;
    let key = hex::decode(key.trim()).with_context(|| format!("Invalid key hex '{}'", key))?;
    if kid.is_empty() || key.is_empty() {
        anyhow::bail!("Key '{}' has an empty kid or key", arg);
    }
    Ok(Key::new(kid, key))
}
