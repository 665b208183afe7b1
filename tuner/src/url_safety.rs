//! Single SSRF gate shared by every ingress point that issues a network
//! request on behalf of an upstream-supplied URL: Probe, the Materializer's
//! downloads, and the Gateway's proxying. Nothing else may open a socket to
//! an upstream-controlled URL without passing through here first.

use url::Url;

use crate::error::InvalidSchemeError;

/// Returns `Ok(())` iff `url`'s scheme is `http` or `https`.
///
/// # Errors
///
/// Returns [`InvalidSchemeError`] for any other scheme (`file`, `ftp`,
/// `gopher`, …), preventing requests to non-HTTP backends.
pub fn check(url: &Url) -> Result<(), InvalidSchemeError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(InvalidSchemeError {
            scheme: other.to_string(),
        }),
    }
}

/// Parses `raw` as a [`Url`] and applies [`check`] in one step.
///
/// # Errors
///
/// [`InvalidSchemeError`] if `raw` fails to parse as a URL (scheme reported
/// as `"<unparseable>"`) or parses to a non-`http(s)` scheme.
pub fn parse_and_check(raw: &str) -> Result<Url, InvalidSchemeError> {
    let url = Url::parse(raw).map_err(|_| InvalidSchemeError {
        scheme: "<unparseable>".to_string(),
    })?;
    check(&url)?;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_and_https() {
        assert!(check(&Url::parse("http://example.com/a").unwrap()).is_ok());
        assert!(check(&Url::parse("https://example.com/a").unwrap()).is_ok());
    }

    #[test]
    fn rejects_other_schemes() {
        for raw in [
            "file:///etc/passwd",
            "ftp://example.com/a",
            "gopher://example.com/a",
        ] {
            let url = Url::parse(raw).unwrap();
            assert!(check(&url).is_err());
        }
    }

    #[test]
    fn parse_and_check_rejects_garbage() {
        assert!(parse_and_check("not a url").is_err());
    }
}
