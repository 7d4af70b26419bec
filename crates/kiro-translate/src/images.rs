//! Image normalization: everything becomes base64 bytes + media type before
//! it reaches the envelope.
//!
//! URL images are fetched gateway-side with a 10 s timeout and a 20 MB cap;
//! any failure is the client's problem (400), not a retryable upstream one.

use base64::Engine;
use kiro_core::GatewayError;
use std::time::Duration;
use tracing::debug;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    pub media_type: String,
    pub data: String,
}

/// `data:image/png;base64,...` URLs decode locally; everything else is
/// fetched.
pub async fn normalize_url(client: &reqwest::Client, url: &str) -> Result<NormalizedImage, GatewayError> {
    if let Some(rest) = url.strip_prefix("data:") {
        return parse_data_url(rest);
    }
    fetch(client, url).await
}

fn parse_data_url(rest: &str) -> Result<NormalizedImage, GatewayError> {
    let (header, data) = rest.split_once(',').ok_or_else(|| {
        GatewayError::RequestInvalid("malformed data: image URL".to_string())
    })?;
    let media_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| {
            GatewayError::RequestInvalid("data: image URLs must be base64-encoded".to_string())
        })?
        .to_string();

    // validate the payload so the upstream never sees broken base64
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| GatewayError::RequestInvalid(format!("invalid base64 image data: {e}")))?;

    Ok(NormalizedImage {
        media_type: if media_type.is_empty() { "image/png".to_string() } else { media_type },
        data: data.to_string(),
    })
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<NormalizedImage, GatewayError> {
    debug!(url, "fetching image for transcoding");
    let resp = client
        .get(url)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| GatewayError::RequestInvalid(format!("image fetch failed for {url}: {e}")))?;

    if !resp.status().is_success() {
        return Err(GatewayError::RequestInvalid(format!(
            "image fetch for {url} returned {}",
            resp.status()
        )));
    }

    let media_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("image/png")
        .split(';')
        .next()
        .unwrap_or("image/png")
        .to_string();

    if let Some(len) = resp.content_length() {
        if len as usize > MAX_IMAGE_BYTES {
            return Err(GatewayError::RequestInvalid(format!(
                "image at {url} exceeds the {MAX_IMAGE_BYTES} byte limit"
            )));
        }
    }

    let bytes = resp
        .bytes()
        .await
        .map_err(|e| GatewayError::RequestInvalid(format!("image body read failed: {e}")))?;
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(GatewayError::RequestInvalid(format!(
            "image at {url} exceeds the {MAX_IMAGE_BYTES} byte limit"
        )));
    }

    Ok(NormalizedImage {
        media_type,
        data: base64::engine::general_purpose::STANDARD.encode(&bytes),
    })
}

/// "image/png" → "png" for the upstream's format field.
pub fn format_of(media_type: &str) -> String {
    media_type
        .split('/')
        .nth(1)
        .unwrap_or("png")
        .to_string()
}
