//! Cheap stream-type detection: a HEAD request, optionally followed by a
//! small ranged GET and a magic-byte sniff.
//!
//! [`StreamType`] is a tagged variant by design: the Materializer dispatches
//! on the tag, and adding a new type means adding a variant, a probe rule,
//! and a pipeline, with no runtime registry.

use reqwest::{header, Client, StatusCode};
use url::Url;

use crate::{error::InvalidSchemeError, http_client, url_safety};

/// Classification of a stream URL, as determined by [`probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    /// A directly fetchable MP4 (or MP4-family) file.
    DirectMp4,
    /// An HLS playlist (`.m3u8`).
    Hls,
    /// An MPEG transport stream.
    Ts,
    /// Could not be classified from the `Content-Type` header or the first
    /// bytes of the body.
    Unknown,
}

/// Number of bytes sniffed from the start of the body when `Content-Type` is
/// inconclusive.
const SNIFF_RANGE: &str = "bytes=0-8191";
/// Number of leading bytes actually inspected for magic sequences.
const SNIFF_WINDOW: usize = 256;
/// MPEG-TS packet size; a sync byte must recur every `TS_PACKET_SIZE` bytes.
const TS_PACKET_SIZE: usize = 188;

/// Probes `url`, classifying it as [`StreamType::DirectMp4`],
/// [`StreamType::Hls`], [`StreamType::Ts`], or [`StreamType::Unknown`].
///
/// # Errors
///
/// [`InvalidSchemeError`] if `url`'s scheme is not `http`/`https`; no
/// network I/O is performed in that case.
pub async fn probe(url: &Url) -> Result<StreamType, InvalidSchemeError> {
    url_safety::check(url)?;
    let client = http_client::shared();

    if let Some(t) = probe_via_head(&client, url).await {
        return Ok(t);
    }
    Ok(probe_via_sniff(&client, url).await)
}

async fn probe_via_head(client: &Client, url: &Url) -> Option<StreamType> {
    let resp = client.head(url.clone()).send().await.ok()?;
    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())?
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    classify_content_type(&content_type)
}

fn classify_content_type(content_type: &str) -> Option<StreamType> {
    if content_type == "video/mp4"
        || content_type == "video/x-mp4"
        || content_type.ends_with("mp4")
    {
        return Some(StreamType::DirectMp4);
    }
    if content_type == "video/mp2t" {
        return Some(StreamType::Ts);
    }
    if content_type == "application/vnd.apple.mpegurl"
        || content_type == "application/x-mpegurl"
        || content_type.ends_with("mpegurl")
    {
        return Some(StreamType::Hls);
    }
    None
}

async fn probe_via_sniff(client: &Client, url: &Url) -> StreamType {
    let body = match client
        .get(url.clone())
        .header(header::RANGE, SNIFF_RANGE)
        .send()
        .await
    {
        Ok(resp) => match resp.bytes().await {
            Ok(b) => b,
            Err(_) => return StreamType::Unknown,
        },
        Err(_) => return StreamType::Unknown,
    };

    sniff(&body)
}

/// Sniffs the first [`SNIFF_WINDOW`] bytes of `body`, classifying them by
/// magic sequence. Exposed standalone so tests can exercise it without a
/// server.
#[must_use]
pub fn sniff(body: &[u8]) -> StreamType {
    let window = &body[..body.len().min(SNIFF_WINDOW)];

    if window.starts_with(b"#EXTM3U") || window.starts_with(b"#EXT-X-") {
        return StreamType::Hls;
    }

    let mut offset = 0;
    while offset < window.len() {
        if window[offset] == 0x47 {
            return StreamType::Ts;
        }
        offset += TS_PACKET_SIZE;
    }

    if window.len() >= 8 && &window[4..8] == b"ftyp" {
        return StreamType::DirectMp4;
    }

    StreamType::Unknown
}

/// Checks whether `url`'s server advertises byte-range support via
/// `Accept-Ranges: bytes`.
///
/// # Errors
///
/// [`InvalidSchemeError`] for a non-`http(s)` URL.
pub async fn supports_range(url: &Url) -> Result<bool, InvalidSchemeError> {
    url_safety::check(url)?;
    let client = http_client::shared();
    let supports = client
        .head(url.clone())
        .send()
        .await
        .ok()
        .and_then(|resp| {
            resp.headers()
                .get(header::ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("bytes"))
        })
        .unwrap_or(false);
    Ok(supports)
}

/// Returns the `Content-Length` reported by a HEAD request, or `-1` if
/// unknown (absent header, non-numeric, or transport error).
///
/// # Errors
///
/// [`InvalidSchemeError`] for a non-`http(s)` URL.
pub async fn content_length(url: &Url) -> Result<i64, InvalidSchemeError> {
    url_safety::check(url)?;
    let client = http_client::shared();
    let len = client
        .head(url.clone())
        .send()
        .await
        .ok()
        .and_then(|resp| resp.content_length())
        .and_then(|len| i64::try_from(len).ok())
        .unwrap_or(-1);
    Ok(len)
}

/// Returns `true` iff `resp`'s status is the success status expected for a
/// ranged request (`200` whole-body or `206` partial content).
#[must_use]
pub fn is_ranged_success(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_content_types() {
        assert_eq!(
            classify_content_type("video/mp4"),
            Some(StreamType::DirectMp4)
        );
        assert_eq!(
            classify_content_type("video/x-mp4; charset=binary"
                .split(';')
                .next()
                .unwrap()
                .trim()),
            Some(StreamType::DirectMp4)
        );
        assert_eq!(
            classify_content_type("application/something+mp4"),
            Some(StreamType::DirectMp4)
        );
        assert_eq!(classify_content_type("video/mp2t"), Some(StreamType::Ts));
        assert_eq!(
            classify_content_type("application/vnd.apple.mpegurl"),
            Some(StreamType::Hls)
        );
        assert_eq!(
            classify_content_type("application/x-mpegurl"),
            Some(StreamType::Hls)
        );
        assert_eq!(classify_content_type("text/html"), None);
    }

    #[test]
    fn sniffs_hls_playlist() {
        assert_eq!(sniff(b"#EXTM3U\n#EXT-X-VERSION:3\n"), StreamType::Hls);
        assert_eq!(sniff(b"#EXT-X-STREAM-INF:BANDWIDTH=1\n"), StreamType::Hls);
    }

    #[test]
    fn sniffs_mp4_ftyp_box() {
        let mut body = vec![0u8, 0, 0, 0x18];
        body.extend_from_slice(b"ftypmp42");
        assert_eq!(sniff(&body), StreamType::DirectMp4);
    }

    #[test]
    fn sniffs_ts_sync_bytes() {
        let mut body = vec![0u8; 188 * 3];
        body[0] = 0x47;
        body[188] = 0x47;
        body[376] = 0x47;
        assert_eq!(sniff(&body), StreamType::Ts);
    }

    #[test]
    fn sniffs_unknown_garbage() {
        assert_eq!(sniff(b"random garbage bytes here"), StreamType::Unknown);
    }

    #[test]
    fn ranged_success_statuses() {
        assert!(is_ranged_success(StatusCode::OK));
        assert!(is_ranged_success(StatusCode::PARTIAL_CONTENT));
        assert!(!is_ranged_success(StatusCode::NOT_FOUND));
    }
}
