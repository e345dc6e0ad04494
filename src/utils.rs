//! Miscellaneous helper utilities.
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

use crate::error::Result;

/// Encode bytes as unpadded base64url, the form used by JWK and keyids JSON.
#[must_use]
pub fn b64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode base64url, accepting input with or without `=` padding.
pub fn b64url_decode(data: &str) -> Result<Vec<u8>> {
    let trimmed = data.trim();
    if trimmed.ends_with('=') {
        return Ok(URL_SAFE.decode(trimmed)?);
    }
    Ok(URL_SAFE_NO_PAD.decode(trimmed)?)
}

/// Reduce a MIME type to its lowercase essence (`type/subtype`), dropping parameters.
#[must_use]
pub fn mime_essence(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn b64url_accepts_padding() {
        assert_eq!(b64url_decode("AAE").unwrap(), vec![0x00, 0x01]);
        assert_eq!(b64url_decode("AAE=").unwrap(), vec![0x00, 0x01]);
        assert_eq!(b64url_encode(&[0xfb, 0xff]), "-_8");
    }

    #[test]
    fn mime_essence_drops_parameters() {
        assert_eq!(mime_essence("Video/MP4; codecs=\"avc1.42E01E\""), "video/mp4");
        assert_eq!(mime_essence("audio/webm"), "audio/webm");
    }
}
