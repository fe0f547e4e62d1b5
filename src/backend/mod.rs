//! Service backends.
//!
//! A [`Backend`] maps query names to [`Service`] definitions. A service either points at a
//! literal address, answered directly with an `A` or `AAAA` record, or at another host name,
//! answered with a `CNAME` that the [resolver][crate::resolver] chases.
//!
//! Two implementations are provided, [`memory::InMemoryBackend`] and [`file::FileBackend`]. The
//! former is not durable across restarts. The latter will write its state to disk for each update
//! and load this state again on startup. Both accept dynamic updates through the [`Writable`]
//! trait.

use crate::error::Error;
use crate::request::RequestState;
use crate::zones::Zones;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use trust_dns_server::client::rr::rdata::TXT;
use trust_dns_server::client::rr::{LowerName, Name, RData, Record, RecordType};

pub mod file;
pub mod memory;

#[allow(clippy::module_name_repetitions)]
pub use file::FileBackend;
#[allow(clippy::module_name_repetitions)]
pub use memory::InMemoryBackend;

/// Longest text a single TXT character-string can hold.
pub const MAX_TXT_LEN: usize = 255;

/// `DynBackend` is a type alias for a [`Backend`] that can be used by multiple read/write
/// consumers that coordinate through an [`Arc`] and a [`RwLock`] wrapping the [`Backend`].
#[allow(clippy::module_name_repetitions)]
pub type DynBackend = Arc<RwLock<dyn Backend + Send + Sync>>;

/// One backend mapping from a name to an address or another host name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub host: String,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

fn default_ttl() -> u32 {
    300
}

/// What a [`Service`] points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Host(Name),
}

impl Service {
    pub fn new(host: impl Into<String>, ttl: u32) -> Self {
        Self {
            host: host.into(),
            ttl,
        }
    }

    /// Classify the service's host. Host names are taken as fully qualified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DNSError`] if the host is neither an IP address nor a valid name.
    pub fn target(&self) -> Result<Target, Error> {
        if let Ok(ip) = IpAddr::from_str(&self.host) {
            return Ok(match ip {
                IpAddr::V4(ip) => Target::V4(ip),
                IpAddr::V6(ip) => Target::V6(ip),
            });
        }
        let host = if self.host.ends_with('.') {
            Cow::Borrowed(self.host.as_str())
        } else {
            Cow::Owned(format!("{}.", self.host))
        };
        Ok(Target::Host(Name::from_str(&host)?))
    }
}

/// A note about how a lookup went, surfaced to clients as a TXT record in debug mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub name: Name,
    pub text: String,
}

impl Diagnostic {
    pub fn new(name: impl Into<Name>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    /// A TXT record owned by the diagnostic's name, its text cut to [`MAX_TXT_LEN`] bytes.
    pub fn to_record(&self) -> Record {
        let mut end = self.text.len().min(MAX_TXT_LEN);
        while !self.text.is_char_boundary(end) {
            end -= 1;
        }
        Record::from_rdata(
            self.name.clone(),
            0,
            RData::TXT(TXT::new(vec![self.text[..end].to_string()])),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupOptions {
    /// Collect [`Diagnostic`]s describing what the backend found.
    pub debug: bool,
}

/// The result of a [`Backend::services`] lookup.
#[derive(Debug, Clone, Default)]
pub struct Services {
    pub records: Vec<Service>,
    pub debug: Vec<Diagnostic>,
}

/// An async trait describing a source of [`Service`] definitions, keyed by the name they should
/// be served for in the [DNS API][crate::dns].
#[async_trait::async_trait]
pub trait Backend {
    /// The services defined for the question of `state`.
    ///
    /// With `exact` only services defined at the name itself are returned. Otherwise a name is
    /// also considered to exist when services are defined below it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NameNotFound`] if the name does not exist, or
    /// [`Error::BackendUnavailable`] if the backend can't be queried.
    async fn services(
        &self,
        state: &RequestState,
        exact: bool,
        opt: &LookupOptions,
    ) -> Result<Services, Error>;

    /// The backend's dynamic update interface, if it has one.
    fn as_writable(&self) -> Option<&dyn Writable> {
        None
    }

    fn as_writable_mut(&mut self) -> Option<&mut dyn Writable> {
        None
    }
}

/// A dynamically added address record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicRecord {
    pub zone: LowerName,
    pub name: LowerName,
    pub record_type: RecordType,
    pub address: IpAddr,
    pub ttl: u32,
}

impl DynamicRecord {
    /// Check the record is fully qualified, inside its zone, and of a type matching its
    /// address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFQDN`], [`Error::OutsideZone`] or [`Error::UnsupportedRecordType`].
    pub fn validate(&self) -> Result<(), Error> {
        if !self.name.is_fqdn() {
            return Err(Error::NotFQDN(self.name.clone()));
        }
        if !self.zone.zone_of(&self.name) {
            return Err(Error::OutsideZone(self.name.clone()));
        }
        match (self.record_type, self.address) {
            (RecordType::A, IpAddr::V4(_)) | (RecordType::AAAA, IpAddr::V6(_)) => Ok(()),
            (record_type, _) => Err(Error::UnsupportedRecordType(record_type)),
        }
    }

    pub fn service(&self) -> Service {
        Service::new(self.address.to_string(), self.ttl)
    }
}

/// Dynamic updates of address records.
#[async_trait::async_trait]
pub trait Writable: Send + Sync {
    /// The zones updates may be made in.
    fn zones(&self) -> &Zones;

    /// Add a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordExists`] if the record already exists, or a validation error.
    async fn create(&mut self, record: DynamicRecord) -> Result<(), Error>;

    /// Replace the records of the same name and type, or add the record if there are none.
    ///
    /// # Errors
    ///
    /// Returns a validation error.
    async fn upsert(&mut self, record: DynamicRecord) -> Result<(), Error>;

    /// Remove a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordNotFound`] if the record does not exist.
    async fn delete(&mut self, record: &DynamicRecord) -> Result<(), Error>;

    /// Replace the records of the same name and type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordNotFound`] if there is no record of that name and type.
    async fn update(&mut self, record: DynamicRecord) -> Result<(), Error>;

    /// True if this exact record exists.
    fn exists(&self, record: &DynamicRecord) -> bool;

    /// True if any service is defined at `name` in `zone`.
    fn exists_by_name(&self, zone: &LowerName, name: &LowerName) -> bool;
}
