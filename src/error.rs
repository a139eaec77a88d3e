//! Error kinds named in the design's error-handling policy: transient
//! per-request errors are absorbed inside the middleware that hit them and
//! never bubble up to an endpoint; only `BindError`/`ConfigError` are fatal
//! and propagate to the process entry point.

use thiserror::Error;

/// DHCP packet decode failures. Both variants are drop-silently at the
/// endpoint; `InvalidMagic` is logged at debug, `Truncated` the same.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("magic cookie bytes did not match 63:82:53:63")]
    InvalidMagic,
    #[error("packet truncated before option 255")]
    Truncated,
}

/// Errors from the DHCP address pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no recognized message-type option on packet")]
    UnsupportedMessageType,
    #[error("no free address in pool")]
    PoolExhausted,
}

/// Errors from the DNS forward resolver.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("all upstream resolvers failed or timed out")]
    UpstreamFailure,
}

/// Fatal startup errors, propagated to `main`.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}
