//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values. The callback
//! token is wrapped in secrecy::SecretString to prevent log leaks.

use std::net::SocketAddr;

use secrecy::SecretString;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    /// Worker loops to run. `PORTER_WORKERS`, default 4.
    pub workers: usize,
    /// Submission API bind address. `PORTER_BIND`, default 127.0.0.1:8080.
    pub bind_addr: SocketAddr,
    /// OTLP endpoint for telemetry export. `OTEL_ENDPOINT`, optional.
    pub otel_endpoint: Option<String>,
    /// `LOG_LEVEL`, default "info".
    pub log_level: String,
    /// Bearer token attached to outbound callbacks.
    /// `PORTER_CALLBACK_TOKEN`, optional.
    pub callback_token: Option<SecretString>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            workers: parsed_var("PORTER_WORKERS", 4)?,
            bind_addr: parsed_var("PORTER_BIND", SocketAddr::from(([127, 0, 0, 1], 8080)))?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            callback_token: std::env::var("PORTER_CALLBACK_TOKEN")
                .ok()
                .map(SecretString::from),
        })
    }
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("bad value for {name}: {e}"))),
        Err(_) => Ok(default),
    }
}
