//! Initialization data parsing.
//!
//! Media containers hand the CDM opaque initialization data. Three shapes are
//! recognised here:
//! - keyids JSON (`{"kids":["<base64url>", ...]}`).
//! - One or more ISO-BMFF `pssh` boxes (cenc); v1 boxes carry key ids.
//! - A raw WebM key id.
use byteorder::{BigEndian, ByteOrder};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::utils::{b64url_decode, mime_essence};

/// Common PSSH system id defined by ISO/IEC 23001-7.
pub const COMMON_SYSTEM_ID: Uuid = Uuid::from_u128(0x1077efecc0b24d02ace33c1e52e2fb4b);

/// Maximum accepted length of a raw WebM key id.
const MAX_WEBM_KEY_ID_LEN: usize = 512;

#[derive(Debug, Deserialize)]
struct KeyIdsInitData {
    kids: Vec<String>,
}

/// A parsed `pssh` box.
#[derive(Debug, Clone)]
pub struct PsshBox {
    pub version: u8,
    pub flags: u32,
    pub system_id: Uuid,
    pub key_ids: Vec<Vec<u8>>,
    pub data: Vec<u8>,
}

/// Extract the key ids named by initialization data for content of `mime_type`.
///
/// WebM content carries a single raw key id. Any other container may use
/// keyids JSON; MP4 content may also use `pssh` boxes.
pub fn extract_key_ids(mime_type: &str, init_data: &[u8]) -> Result<Vec<Vec<u8>>> {
    if init_data.is_empty() {
        return Err(Error::InvalidInitData("Data must not be empty".to_string()));
    }

    let essence = mime_essence(mime_type);
    let subtype = essence.split_once('/').map(|(_, subtype)| subtype).unwrap_or_default();

    if subtype == "webm" {
        if init_data.len() > MAX_WEBM_KEY_ID_LEN {
            return Err(Error::InvalidInitData(format!(
                "WebM key id longer than {} bytes",
                MAX_WEBM_KEY_ID_LEN
            )));
        }
        return Ok(vec![init_data.to_vec()]);
    }

    if init_data.first() == Some(&b'{') {
        return key_ids_from_json(init_data);
    }

    if subtype != "mp4" {
        return Err(Error::InvalidInitData(format!(
            "No init data format known for {}",
            mime_type
        )));
    }

    let key_ids: Vec<Vec<u8>> = parse_pssh_boxes(init_data)?
        .into_iter()
        .flat_map(|b| b.key_ids)
        .collect();
    if key_ids.is_empty() {
        return Err(Error::InvalidInitData(
            "PSSH boxes carry no key ids".to_string(),
        ));
    }
    Ok(dedup(key_ids))
}

fn key_ids_from_json(data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let parsed: KeyIdsInitData = serde_json::from_slice(data)
        .map_err(|e| Error::InvalidInitData(format!("Failed to parse keyids JSON: {}", e)))?;

    let mut ids = Vec::with_capacity(parsed.kids.len());
    for kid in parsed.kids.iter() {
        let bytes = b64url_decode(kid)
            .map_err(|e| Error::InvalidInitData(format!("Invalid kid {:?}: {}", kid, e)))?;
        if bytes.is_empty() {
            return Err(Error::InvalidInitData("Empty kid".to_string()));
        }
        ids.push(bytes);
    }

    if ids.is_empty() {
        return Err(Error::InvalidInitData("keyids JSON lists no kids".to_string()));
    }
    Ok(dedup(ids))
}

fn dedup(ids: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut out: Vec<Vec<u8>> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

/// Parse a buffer made entirely of consecutive `pssh` boxes.
pub fn parse_pssh_boxes(data: &[u8]) -> Result<Vec<PsshBox>> {
    let mut boxes = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let (pssh, consumed) = parse_pssh_box(rest)?;
        boxes.push(pssh);
        rest = &rest[consumed..];
    }
    Ok(boxes)
}

fn parse_pssh_box(data: &[u8]) -> Result<(PsshBox, usize)> {
    if data.len() < 8 {
        return Err(Error::InvalidInitData("Data too short".to_string()));
    }

    let mut offset = 0;
    let size = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
    offset += 4;
    let box_type = &data[offset..offset + 4];
    offset += 4;

    if box_type != b"pssh" {
        return Err(Error::InvalidInitData("Not a PSSH box".to_string()));
    }

    let mut actual_size = size;
    if size == 1 {
        if data.len() < 16 {
            return Err(Error::InvalidInitData("Data too short".to_string()));
        }
        actual_size = usize::try_from(BigEndian::read_u64(&data[offset..offset + 8]))
            .map_err(|_| Error::InvalidInitData("PSSH size overflow".to_string()))?;
        offset += 8;
    } else if size == 0 {
        actual_size = data.len();
    }

    if actual_size > data.len() || actual_size < offset {
        return Err(Error::InvalidInitData("PSSH size exceeds data length".to_string()));
    }
    let data = &data[..actual_size];

    if data.len() < offset + 4 + 16 {
        return Err(Error::InvalidInitData("PSSH header incomplete".to_string()));
    }

    let version = data[offset];
    let flags = BigEndian::read_u24(&data[offset + 1..offset + 4]);
    offset += 4;

    let system_id = Uuid::from_slice(&data[offset..offset + 16])
        .map_err(|_| Error::InvalidInitData("Invalid system ID".to_string()))?;
    offset += 16;

    let mut key_ids = Vec::new();
    if version == 1 {
        if data.len() < offset + 4 {
            return Err(Error::InvalidInitData("Missing KID count".to_string()));
        }
        let kid_count = usize::try_from(BigEndian::read_u32(&data[offset..offset + 4]))
            .map_err(|_| Error::InvalidInitData("KID count overflow".to_string()))?;
        offset += 4;

        let required = kid_count
            .checked_mul(16)
            .and_then(|n| n.checked_add(offset))
            .ok_or_else(|| Error::InvalidInitData("KID count overflow".to_string()))?;
        if data.len() < required {
            return Err(Error::InvalidInitData("Missing KIDs".to_string()));
        }
        key_ids.extend(data[offset..required].chunks(16).map(<[u8]>::to_vec));
        offset = required;
    }

    if data.len() < offset + 4 {
        return Err(Error::InvalidInitData("Missing init data length".to_string()));
    }
    let data_size = usize::try_from(BigEndian::read_u32(&data[offset..offset + 4]))
        .map_err(|_| Error::InvalidInitData("Init data length overflow".to_string()))?;
    offset += 4;
    let end = offset
        .checked_add(data_size)
        .ok_or_else(|| Error::InvalidInitData("Init data length overflow".to_string()))?;
    if data.len() < end {
        return Err(Error::InvalidInitData("Missing init data".to_string()));
    }

    Ok((
        PsshBox {
            version,
            flags,
            system_id,
            key_ids,
            data: data[offset..end].to_vec(),
        },
        actual_size,
    ))
}

/// Serialize a `pssh` box.
pub fn build_pssh_box(pssh: &PsshBox) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(pssh.version);
    body.extend_from_slice(&pssh.flags.to_be_bytes()[1..]);
    body.extend_from_slice(pssh.system_id.as_bytes());

    if pssh.version == 1 {
        body.extend_from_slice(&(pssh.key_ids.len() as u32).to_be_bytes());
        for kid in pssh.key_ids.iter() {
            body.extend_from_slice(kid);
        }
    }

    body.extend_from_slice(&(pssh.data.len() as u32).to_be_bytes());
    body.extend_from_slice(&pssh.data);

    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(b"pssh");
    out.extend_from_slice(&body);
    out
}
