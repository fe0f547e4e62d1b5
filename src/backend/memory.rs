use crate::backend::{
    Backend, Diagnostic, DynamicRecord, LookupOptions, Service, Services, Target, Writable,
};
use crate::error::Error;
use crate::request::RequestState;
use crate::zones::Zones;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use trust_dns_server::client::rr::{LowerName, RecordType};

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryBackend {
    #[serde(skip)]
    zones: Zones,
    services: BTreeMap<LowerName, Vec<Service>>,
}

impl InMemoryBackend {
    pub fn new(zones: Zones, services: BTreeMap<LowerName, Vec<Service>>) -> Self {
        Self { zones, services }
    }

    pub(super) fn set_zones(&mut self, zones: Zones) {
        self.zones = zones;
    }

    fn has_descendants(&self, name: &LowerName) -> bool {
        self.services
            .keys()
            .any(|key| key != name && name.zone_of(key))
    }

    fn same_family(service: &Service, record_type: RecordType) -> bool {
        matches!(
            (service.target(), record_type),
            (Ok(Target::V4(_)), RecordType::A) | (Ok(Target::V6(_)), RecordType::AAAA)
        )
    }

    fn check_zone(&self, record: &DynamicRecord) -> Result<(), Error> {
        record.validate()?;
        if self.zones.iter().any(|zone| *zone == record.zone) {
            Ok(())
        } else {
            Err(Error::OutsideZone(record.zone.clone()))
        }
    }
}

#[async_trait::async_trait]
impl Backend for InMemoryBackend {
    async fn services(
        &self,
        state: &RequestState,
        exact: bool,
        opt: &LookupOptions,
    ) -> Result<Services, Error> {
        let name = state.name();
        let records = match self.services.get(name) {
            Some(records) => records.clone(),
            None if !exact && self.has_descendants(name) => Vec::new(),
            None => return Err(Error::NameNotFound(name.clone())),
        };

        let debug = if opt.debug {
            records
                .iter()
                .map(|service| {
                    let value = serde_json::to_string(service).unwrap_or_default();
                    Diagnostic::new(name, format!("{name} {value}"))
                })
                .collect()
        } else {
            Vec::new()
        };
        Ok(Services { records, debug })
    }

    fn as_writable(&self) -> Option<&dyn Writable> {
        Some(self)
    }

    fn as_writable_mut(&mut self) -> Option<&mut dyn Writable> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Writable for InMemoryBackend {
    fn zones(&self) -> &Zones {
        &self.zones
    }

    async fn create(&mut self, record: DynamicRecord) -> Result<(), Error> {
        self.check_zone(&record)?;
        if self.exists(&record) {
            return Err(Error::RecordExists);
        }
        self.services
            .entry(record.name.clone())
            .or_default()
            .push(record.service());
        Ok(())
    }

    async fn upsert(&mut self, record: DynamicRecord) -> Result<(), Error> {
        self.check_zone(&record)?;
        let services = self.services.entry(record.name.clone()).or_default();
        services.retain(|service| !Self::same_family(service, record.record_type));
        services.push(record.service());
        Ok(())
    }

    async fn delete(&mut self, record: &DynamicRecord) -> Result<(), Error> {
        if !self.exists(record) {
            return Err(Error::RecordNotFound);
        }
        let address = record.address.to_string();
        if let Some(services) = self.services.get_mut(&record.name) {
            services.retain(|service| service.host != address);
            if services.is_empty() {
                self.services.remove(&record.name);
            }
        }
        Ok(())
    }

    async fn update(&mut self, record: DynamicRecord) -> Result<(), Error> {
        self.check_zone(&record)?;
        let Some(services) = self.services.get_mut(&record.name) else {
            return Err(Error::RecordNotFound);
        };
        if !services
            .iter()
            .any(|service| Self::same_family(service, record.record_type))
        {
            return Err(Error::RecordNotFound);
        }
        services.retain(|service| !Self::same_family(service, record.record_type));
        services.push(record.service());
        Ok(())
    }

    fn exists(&self, record: &DynamicRecord) -> bool {
        let address = record.address.to_string();
        self.services
            .get(&record.name)
            .map_or(false, |services| {
                services.iter().any(|service| service.host == address)
            })
    }

    fn exists_by_name(&self, zone: &LowerName, name: &LowerName) -> bool {
        zone.zone_of(name) && self.services.contains_key(name)
    }
}
