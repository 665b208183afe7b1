//! Resilient selection among multiple upstream provider hosts: classify each
//! candidate M3U/`player_api` endpoint and rank by latency so the Indexer can
//! pick the best one before committing to a full fetch.

use std::time::{Duration, Instant};

use reqwest::{header, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::http_client;

/// Outcome of probing one candidate endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// HTTP 200.
    Ok,
    /// A Cloudflare challenge page was detected (strong signal only).
    Cloudflare,
    /// Any other non-200 status.
    BadStatus,
    /// The transport error looked like a timeout/deadline.
    Timeout,
    /// Any other transport error.
    Error,
}

/// Result of probing a single candidate URL.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// The candidate URL that was probed.
    pub url: String,
    /// Classification of the response.
    pub status: ProbeStatus,
    /// Raw HTTP status code, if a response was received.
    pub status_code: Option<u16>,
    /// Round-trip latency of the probe request, in milliseconds.
    pub latency_ms: u64,
    /// First bytes of the response body, for diagnostics.
    pub body_preview: String,
}

const CLOUDFLARE_STATUS_CODES: [u16; 5] = [403, 503, 520, 521, 524];
const CLOUDFLARE_BODY_SIGNALS: [&str; 3] =
    ["checking your browser", "cf-bypass", "ray id"];
const BODY_PREVIEW_LEN: usize = 512;

/// Probes a single candidate M3U URL, classifying the response.
pub async fn probe_one(url: &str) -> ProbeResult {
    let client = http_client::shared();
    let started = Instant::now();

    let result = client.get(url).send().await;
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match result {
        Ok(resp) => {
            let status_code = resp.status().as_u16();
            let is_cloudflare_server = resp
                .headers()
                .get(header::SERVER)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("cloudflare"))
                .unwrap_or(false);
            let body = resp.text().await.unwrap_or_default();
            let preview: String = body.chars().take(BODY_PREVIEW_LEN).collect();

            let status = classify_response(
                resp.status(),
                is_cloudflare_server,
                &preview,
            );

            ProbeResult {
                url: url.to_string(),
                status,
                status_code: Some(status_code),
                latency_ms,
                body_preview: preview,
            }
        }
        Err(e) => {
            let msg = e.to_string();
            let status = if msg.to_ascii_lowercase().contains("timeout")
                || msg.to_ascii_lowercase().contains("deadline")
            {
                ProbeStatus::Timeout
            } else {
                ProbeStatus::Error
            };
            ProbeResult {
                url: url.to_string(),
                status,
                status_code: None,
                latency_ms,
                body_preview: msg,
            }
        }
    }
}

fn classify_response(
    status: StatusCode,
    is_cloudflare_server: bool,
    body_preview: &str,
) -> ProbeStatus {
    if status == StatusCode::OK {
        return ProbeStatus::Ok;
    }

    let code = status.as_u16();
    let lower_body = body_preview.to_ascii_lowercase();
    let has_body_signal = CLOUDFLARE_BODY_SIGNALS
        .iter()
        .any(|s| lower_body.contains(s));
    let has_cloudflare_status = CLOUDFLARE_STATUS_CODES.contains(&code);

    let is_cloudflare = (has_cloudflare_status && has_body_signal)
        || (is_cloudflare_server && code != 200);

    if is_cloudflare {
        return ProbeStatus::Cloudflare;
    }

    ProbeStatus::BadStatus
}

/// Probes every URL in `urls`, returning results sorted with all `Ok`
/// results first (ascending by latency), followed by everything else sorted
/// by URL.
pub async fn probe_all(urls: &[String]) -> Vec<ProbeResult> {
    let mut results = Vec::with_capacity(urls.len());
    for url in urls {
        results.push(probe_one(url).await);
    }

    results.sort_by(|a, b| {
        let a_ok = a.status == ProbeStatus::Ok;
        let b_ok = b.status == ProbeStatus::Ok;
        match (a_ok, b_ok) {
            (true, true) => a.latency_ms.cmp(&b.latency_ms),
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            (false, false) => a.url.cmp(&b.url),
        }
    });

    results
}

/// Returns the first `Ok` URL in `probe_all(urls)`, or the empty string if
/// none succeeded.
pub async fn best_m3u_url(urls: &[String]) -> String {
    probe_all(urls)
        .await
        .into_iter()
        .find(|r| r.status == ProbeStatus::Ok)
        .map(|r| r.url)
        .unwrap_or_default()
}

/// Minimal shape of a successful Xtream `player_api.php` response, enough to
/// confirm the credentials are accepted without deserializing the whole
/// catalog.
#[derive(Debug, Deserialize)]
struct PlayerApiProbeResponse {
    #[serde(default)]
    user_info: Option<serde_json::Value>,
    #[serde(default)]
    auth: Option<serde_json::Value>,
}

/// Probes `base/player_api.php` with the given credentials, returning
/// [`ProbeStatus::Ok`] iff the JSON response contains a `user_info` or
/// `auth` field.
pub async fn probe_player_api(base: &str, user: &str, pass: &str) -> ProbeStatus {
    let url = format!(
        "{}/player_api.php?username={}&password={}",
        base.trim_end_matches('/'),
        urlencoding_escape(user),
        urlencoding_escape(pass),
    );

    let client = http_client::shared();
    match client.get(&url).send().await {
        Ok(resp) if resp.status() == StatusCode::OK => {
            match resp.json::<PlayerApiProbeResponse>().await {
                Ok(parsed)
                    if parsed.user_info.is_some() || parsed.auth.is_some() =>
                {
                    ProbeStatus::Ok
                }
                _ => ProbeStatus::BadStatus,
            }
        }
        Ok(_resp) => ProbeStatus::BadStatus,
        Err(e) => {
            if e.is_timeout() {
                ProbeStatus::Timeout
            } else {
                ProbeStatus::Error
            }
        }
    }
}

/// Walks `bases` in order, returning the first one whose `player_api.php`
/// accepts the given credentials (per [`probe_player_api`]), or `None`.
pub async fn first_working_player_api(
    bases: &[String],
    user: &str,
    pass: &str,
) -> Option<String> {
    for base in bases {
        if probe_player_api(base, user, pass).await == ProbeStatus::Ok {
            return Some(base.clone());
        }
    }
    None
}

/// URL-escapes a credential for embedding in a query string.
fn urlencoding_escape(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

/// Timeout applied specifically to provider-probe GETs, distinct from the
/// shared client's default so provider probing stays fast even if the shared
/// default changes.
#[must_use]
pub fn probe_timeout() -> Duration {
    Duration::from_secs(15)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[test]
    fn classifies_ok() {
        assert_eq!(
            classify_response(StatusCode::OK, false, ""),
            ProbeStatus::Ok
        );
    }

    #[test]
    fn classifies_cloudflare_by_status_and_body() {
        assert_eq!(
            classify_response(
                StatusCode::SERVICE_UNAVAILABLE,
                false,
                "Checking your browser before accessing"
            ),
            ProbeStatus::Cloudflare
        );
    }

    #[test]
    fn classifies_cloudflare_by_server_header_on_non_200() {
        assert_eq!(
            classify_response(StatusCode::FORBIDDEN, true, "anything"),
            ProbeStatus::Cloudflare
        );
    }

    #[test]
    fn does_not_classify_884_as_cloudflare() {
        // HTTP 884 is provider-specific and explicitly not Cloudflare, even
        // with a matching body signal, since it is not one of the five
        // recognized Cloudflare status codes and no cloudflare server header
        // is present.
        let status = StatusCode::from_u16(884).unwrap_or(StatusCode::OK);
        if status.as_u16() == 884 {
            assert_eq!(
                classify_response(status, false, "checking your browser"),
                ProbeStatus::BadStatus
            );
        }
    }

    #[test]
    fn bad_status_without_cloudflare_signals() {
        assert_eq!(
            classify_response(StatusCode::NOT_FOUND, false, ""),
            ProbeStatus::BadStatus
        );
    }

    #[tokio::test]
    async fn probe_all_orders_ok_first_by_latency_then_rest_by_url() {
        let ok_fast = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.m3u"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U"))
            .mount(&ok_fast)
            .await;

        let cloudflare = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/b.m3u"))
            .respond_with(
                ResponseTemplate::new(503)
                    .insert_header("Server", "cloudflare")
                    .set_body_string("Checking your browser"),
            )
            .mount(&cloudflare)
            .await;

        let not_found = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/c.m3u"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&not_found)
            .await;

        let urls = vec![
            format!("{}/c.m3u", not_found.uri()),
            format!("{}/b.m3u", cloudflare.uri()),
            format!("{}/a.m3u", ok_fast.uri()),
        ];

        let results = probe_all(&urls).await;
        assert_eq!(results[0].status, ProbeStatus::Ok);
        assert_eq!(results[1].status, ProbeStatus::Cloudflare);
        assert_eq!(results[2].status, ProbeStatus::BadStatus);

        let best = best_m3u_url(&urls).await;
        assert_eq!(best, format!("{}/a.m3u", ok_fast.uri()));
    }
}
