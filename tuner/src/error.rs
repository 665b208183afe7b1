//! Shared error kinds used across the core, per the error-handling design:
//! transient errors are retried at the provider-selection layer only; every
//! other layer surfaces a typed error so callers can match on kind.

use derive_more::{Display, Error, From};

/// A URL whose scheme is not `http`/`https` was passed to a network-facing
/// operation (Probe, Materializer, Gateway). This is the only SSRF defense
/// and must never be bypassed internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
#[display(fmt = "invalid URL scheme: {}", scheme)]
pub struct InvalidSchemeError {
    /// The offending scheme, lower-cased.
    pub scheme: String,
}

/// A chosen upstream responded with a non-2xx status during a transfer that
/// had already committed to that upstream (i.e. not during provider
/// selection, where non-OK results are simply ranked last).
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
#[display(fmt = "upstream responded with HTTP {}", code)]
pub struct HttpStatusError {
    /// The offending status code.
    pub code: u16,
}

/// Probing a URL (HEAD/GET/sniff) failed at the transport level.
#[derive(Debug, Display, Error)]
#[display(fmt = "probe failed: {}", reason)]
pub struct ProbeError {
    /// Human-readable transport failure reason.
    pub reason: String,
}

/// The external remuxer process failed or could not be spawned.
#[derive(Debug, Display, Error)]
#[display(fmt = "remux failed: {}", reason)]
pub struct RemuxError {
    /// Human-readable failure reason (exit status or spawn error).
    pub reason: String,
}

/// The requested asset is not yet available: either materialization has not
/// completed, or the source is of a type this core declines to materialize
/// (TS/Unknown).
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
#[display(fmt = "asset not ready: {}", asset_id)]
pub struct NotReadyError {
    /// The asset id that is not ready.
    pub asset_id: String,
}

/// The caller's context was cancelled while waiting on an operation.
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
#[display(fmt = "operation cancelled")]
pub struct CancelledError;

/// Malformed configuration, `.env` file, or supervisor JSON file.
#[derive(Debug, Display, Error)]
#[display(fmt = "config error: {}", reason)]
pub struct ConfigError {
    /// Human-readable description of what was malformed.
    pub reason: String,
}

/// Malformed M3U/Xtream-JSON/XMLTV input, with enough location context to be
/// actionable.
#[derive(Debug, Display, Error)]
#[display(fmt = "parse error at {}: {}", location, reason)]
pub struct ParseError {
    /// Where the malformed input was found (e.g. `"line 42"`, a URL).
    pub location: String,
    /// What was wrong with it.
    pub reason: String,
}

/// Unified error type for the Materializer's public `materialize` operation.
#[derive(Debug, Display, Error, From)]
pub enum MaterializeError {
    /// See [`InvalidSchemeError`].
    InvalidScheme(InvalidSchemeError),
    /// See [`HttpStatusError`].
    HttpStatus(HttpStatusError),
    /// See [`ProbeError`].
    Probe(ProbeError),
    /// See [`RemuxError`].
    Remux(RemuxError),
    /// See [`NotReadyError`].
    NotReady(NotReadyError),
    /// See [`CancelledError`].
    Cancelled(CancelledError),
    /// Any other I/O failure while writing/renaming the cache file.
    #[display(fmt = "cache I/O error: {}", _0)]
    Io(std::io::Error),
}
