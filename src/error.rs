//! Error types.

use std::net::SocketAddr;
use trust_dns_server::client::rr::{LowerName, RecordType};
use trust_dns_server::proto::error::ProtoError;

/// Error enumerates the possible Chain Crab error states.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Returned when a [`RequestState`][crate::request::RequestState] is built from a message
    /// carrying zero questions. The [`Chain`][crate::plugin::Chain] answers these with `FORMERR`
    /// before any plugin runs.
    #[error("query has no question")]
    NoQuestion,

    /// Returned when a plugin delegates to the rest of the chain but no further plugin is
    /// configured after it. The chain turns this into a `SERVFAIL` reply.
    #[error("no next plugin found after \"{0}\"")]
    NoNextPlugin(&'static str),

    /// Returned by a [`Backend`][crate::backend::Backend] when nothing exists at (or, for
    /// non-exact lookups, below) the queried name.
    #[error("name not found: \"{0}\"")]
    NameNotFound(LowerName),

    /// Returned when a name is looked up by a component that is not authoritative for it.
    #[error("name \"{0}\" is outside of the served zones")]
    OutsideZone(LowerName),

    /// Returned when a [`Backend`][crate::backend::Backend] can't be reached or fails to answer.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Returned when no upstream answered a cross-zone [`Proxy`][crate::resolver::Proxy] lookup
    /// before the configured timeout.
    #[error("upstream {0} timed out")]
    ProxyTimeout(SocketAddr),

    /// Returned when an upstream answered a proxied query with a mismatched message ID.
    #[error("upstream {0} replied with a mismatched message ID")]
    ProxyMismatch(SocketAddr),

    /// Returned when a cross-zone lookup is needed but no upstream is configured.
    #[error("no proxy upstreams configured")]
    NoProxy,

    /// Returned when the request was cancelled, either by server shutdown or because the
    /// request timeout elapsed.
    #[error("request cancelled")]
    Cancelled,

    /// Returned when a non-fully qualified [`LowerName`] is used as a zone or record name.
    #[error("name is not fully qualified: \"{0}\"")]
    NotFQDN(LowerName),

    /// Returned by [`Writable::create`][crate::backend::Writable::create] when the record
    /// already exists.
    #[error("record already exists")]
    RecordExists,

    /// Returned by [`Writable`][crate::backend::Writable] operations that require an existing
    /// record when none matches.
    #[error("record not found")]
    RecordNotFound,

    /// Returned when a dynamic record is neither `A` nor `AAAA`, or its address family does not
    /// match its record type.
    #[error("unsupported record type {0}")]
    UnsupportedRecordType(RecordType),

    /// Returned when a generic IO error occurs.
    #[error("an IO error occurred")]
    IO(#[from] std::io::Error),

    /// Returned when processing JSON from disk (e.g. when
    /// [trying to load a `Config`][crate::config::Config::try_from_file], or
    /// [trying to load a `FileBackend`][crate::backend::file::FileBackend::try_from_file]) fails
    /// due to invalid JSON content.
    #[error("invalid JSON")]
    InvalidJSON(#[from] serde_json::Error),

    /// Returned when the Chain Crab DNS server encounters a generic DNS protocol error.
    #[error("DNS error")]
    DNSError(#[from] ProtoError),
}
