//! Tracing setup and secret redaction helpers

use std::fmt;
use tracing_subscriber::{fmt as fmt_layer, prelude::*, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. `format` is
/// `"json"` or anything else for human-readable text.
pub fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt_layer::layer().json().with_current_span(true).with_target(true))
            .try_init()
    } else {
        registry.with(fmt_layer::layer().with_target(true)).try_init()
    };

    if let Err(e) = result {
        eprintln!("Warning: tracing subscriber already installed: {}", e);
    }
}

/// Redacted rendering of a secret: first 8 characters, then `***`
#[derive(Clone, Debug)]
pub struct SensitiveApiKey<'a> {
    inner: &'a str,
}

impl<'a> SensitiveApiKey<'a> {
    pub fn new(key: &'a str) -> Self {
        Self { inner: key }
    }
}

impl<'a> fmt::Display for SensitiveApiKey<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.char_indices().nth(8) {
            Some((idx, _)) => write!(f, "{}***", &self.inner[..idx]),
            // Too short to show any of it
            None => write!(f, "***"),
        }
    }
}
