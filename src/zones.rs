//! Authoritative zone sets.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use trust_dns_server::client::rr::LowerName;

/// An ordered collection of zone names a component is authoritative for.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Zones(Vec<LowerName>);

impl Zones {
    /// Build a zone set, rejecting zone names that are not fully qualified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFQDN`] for the first zone name that isn't fully qualified.
    pub fn new(zones: Vec<LowerName>) -> Result<Self, Error> {
        let zones = Self(zones);
        zones.validate()?;
        Ok(zones)
    }

    /// Check every zone name is fully qualified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFQDN`] for the first zone name that isn't fully qualified.
    pub fn validate(&self) -> Result<(), Error> {
        match self.0.iter().find(|zone| !zone.is_fqdn()) {
            Some(zone) => Err(Error::NotFQDN(zone.clone())),
            None => Ok(()),
        }
    }

    /// The most specific zone `name` belongs to, or `None` if it is in none of them.
    pub fn matches(&self, name: &LowerName) -> Option<&LowerName> {
        self.0
            .iter()
            .filter(|zone| zone.zone_of(name))
            .max_by_key(|zone| zone.num_labels())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LowerName> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<LowerName>> for Zones {
    fn from(zones: Vec<LowerName>) -> Self {
        Self(zones)
    }
}
