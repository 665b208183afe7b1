//! Live-channel gateway: proxies `/stream/<guide_number>` requests from Plex
//! to the best-available upstream URL for that channel, failing over to the
//! next ranked backup while no bytes have yet reached the client.

use actix_web::{get, http::StatusCode, web, HttpResponse};
use futures::TryStreamExt as _;
use tuner_log::log;

use crate::{catalog::Store, http_client, probe, url_safety};

/// Shared state the gateway's actix-web handlers read from.
#[derive(Clone)]
pub struct GatewayState {
    catalog: Store,
}

impl GatewayState {
    #[must_use]
    pub fn new(catalog: Store) -> Self {
        Self { catalog }
    }
}

/// `GET /stream/{guide_number}`: proxies bytes from the best ranked upstream
/// URL for the named channel.
///
/// Iterates `stream_urls` in order. For each candidate: applies the scheme
/// gate, probes briefly, and opens a proxied response. Before any bytes have
/// been delivered, a connection failure advances to the next candidate; once
/// bytes have been sent, a mid-stream failure surfaces as a normal close,
/// with no retry after the first byte.
#[get("/stream/{guide_number}")]
pub async fn stream(
    state: web::Data<GatewayState>,
    guide_number: web::Path<String>,
) -> HttpResponse {
    let guide_number = guide_number.into_inner();
    let snapshot = state.catalog.snapshot();
    let Some(channel) = snapshot.live.iter().find(|c| c.guide_number == guide_number) else {
        log::warn!("gateway: unknown guide number {guide_number}");
        return HttpResponse::NotFound().body("unknown channel");
    };

    let candidates: Vec<&String> = if channel.stream_urls.is_empty() {
        vec![&channel.stream_url]
    } else {
        channel.stream_urls.iter().collect()
    };

    for candidate in candidates {
        let Ok(url) = url_safety::parse_and_check(candidate) else {
            continue;
        };

        // Brief liveness probe; a URL that can't even be classified is
        // unlikely to serve bytes, so move on rather than opening a proxy
        // that will immediately fail.
        if probe::probe(&url).await.is_err() {
            continue;
        }

        let client = http_client::no_timeout();
        match client.get(url.clone()).send().await {
            Ok(resp) if resp.status().is_success() => {
                let status = resp.status().as_u16();
                log::info!(
                    "gateway: streaming channel={} status={}",
                    channel.guide_name,
                    status,
                );
                let content_type = resp
                    .headers()
                    .get(actix_web::http::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("video/mpeg")
                    .to_string();

                let byte_stream = resp
                    .bytes_stream()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));

                return HttpResponse::build(
                    StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                )
                .content_type(content_type)
                .streaming(byte_stream);
            }
            Ok(resp) => {
                log::debug!(
                    "gateway: candidate for channel={} rejected with status={}",
                    channel.guide_name,
                    resp.status(),
                );
            }
            Err(_) => {
                log::debug!(
                    "gateway: candidate for channel={} failed before first byte",
                    channel.guide_name,
                );
            }
        }
    }

    log::warn!("gateway: exhausted all candidates for channel={}", channel.guide_name);
    HttpResponse::BadGateway().body("no working upstream")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::{Catalog, LiveChannel};
    use actix_web::{test, App};

    fn live_channel(guide_number: &str, urls: Vec<&str>) -> LiveChannel {
        LiveChannel {
            channel_id: guide_number.to_string(),
            guide_number: guide_number.to_string(),
            guide_name: format!("Channel {guide_number}"),
            stream_url: urls[0].to_string(),
            stream_urls: urls.into_iter().map(String::from).collect(),
            epg_linked: false,
            tvg_id: String::new(),
        }
    }

    #[actix_web::test]
    async fn unknown_guide_number_is_404() {
        let catalog = Store::new();
        catalog.replace(vec![], vec![], vec![live_channel("1", vec!["http://a"])]);
        let state = web::Data::new(GatewayState::new(catalog));

        let app = test::init_service(App::new().app_data(state).service(stream)).await;
        let req = test::TestRequest::get().uri("/stream/99").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn bad_scheme_candidate_is_skipped_not_proxied() {
        let catalog = Store::new();
        catalog.replace(
            vec![],
            vec![],
            vec![live_channel("1", vec!["file:///etc/passwd"])],
        );
        let state = web::Data::new(GatewayState::new(catalog));

        let app = test::init_service(App::new().app_data(state).service(stream)).await;
        let req = test::TestRequest::get().uri("/stream/1").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
