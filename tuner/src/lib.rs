//! Core of the IPTV-to-Plex bridge: provider probing, catalog indexing,
//! stream-type detection, VOD materialization, the VODFS virtual filesystem,
//! the live-channel gateway, and the embedded process supervisor.
//!
//! HDHomeRun discovery/lineup HTTP handlers, XMLTV generation and EPG-link
//! reporting, Plex database registration, and CLI flag parsing for the
//! tuner-facing surface are treated as external collaborators; this crate
//! exposes the catalog-read seams and deterministic helpers they need.

#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unused_import_braces,
    unused_qualifications
)]

pub mod catalog;
pub mod config;
pub mod envfile;
pub mod epg_link;
pub mod error;
pub mod gateway;
pub mod http_client;
pub mod indexer;
pub mod materializer;
pub mod probe;
pub mod provider_probe;
pub mod supervisor;
pub mod taxonomy;
pub mod url_safety;
pub mod vodfs;

use std::any::Any;

/// Renders a caught panic payload (as produced by `catch_unwind`) as a
/// human-readable string, falling back to a generic message when the panic
/// payload is neither a `&str` nor a `String`.
#[must_use]
pub fn display_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
