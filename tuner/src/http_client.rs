//! Shared HTTP client. Per the design notes, the HTTP client (like the
//! logger) is one of the only legitimate process-wide singletons; everything
//! else is passed explicitly.

use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::Client;

/// User-Agent sent on provider/playlist requests; several Xtream-Codes
/// panels gate on this looking like a real browser.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Default per-request timeout for short-lived calls (probes, API calls).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared client with the default timeout, used by Probe and Provider Probe.
static CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(BROWSER_USER_AGENT)
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .expect("failed to build HTTP client")
});

/// Clone with no request timeout at all, for long-running transfers (VOD
/// downloads, live proxying) where the caller drives its own cancellation.
static NO_TIMEOUT_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(BROWSER_USER_AGENT)
        .build()
        .expect("failed to build no-timeout HTTP client")
});

/// Returns the shared, timeout-bounded client.
#[must_use]
pub fn shared() -> Client {
    CLIENT.clone()
}

/// Returns the shared client with no request timeout, for long transfers.
#[must_use]
pub fn no_timeout() -> Client {
    NO_TIMEOUT_CLIENT.clone()
}
