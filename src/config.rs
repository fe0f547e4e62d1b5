use crate::backend::file::FileBackend;
use crate::backend::memory::InMemoryBackend;
use crate::backend::{DynBackend, Service};
use crate::error::Error;
use crate::loadbalance::Policy;
use crate::resolver::SoaParams;
use crate::zones::Zones;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use trust_dns_server::client::rr::{LowerName, Name};

pub type SharedConfig = Arc<Config>;

/// The plugins that can be listed in [`Config::plugins`].
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Loadbalance,
    Cache,
    Backend,
}

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub dns_udp_bind_addr: SocketAddr,
    pub dns_tcp_bind_addr: SocketAddr,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub dns_tcp_timeout: Duration,
    /// Requests still being served after this long are cancelled and answered with `SERVFAIL`.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
    pub zones: Zones,
    #[serde(default = "default_plugins")]
    pub plugins: Vec<PluginKind>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub loadbalance: Policy,
    #[serde(default)]
    pub proxy: ProxyConfig,
    pub backend_state_path: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<LowerName, Vec<Service>>,
    /// TTL of the SOA record served at each zone apex.
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    pub ns_domain: LowerName,
    pub ns_admin: String,
}

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct CacheConfig {
    /// Only replies for names within these zones are cached.
    #[serde(default = "root_zone")]
    pub zones: Zones,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_capacity")]
    pub negative_capacity: usize,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_min_ttl")]
    pub min_ttl: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_max_ttl")]
    pub max_ttl: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_negative_max_ttl")]
    pub negative_max_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            zones: root_zone(),
            capacity: default_capacity(),
            negative_capacity: default_capacity(),
            min_ttl: default_min_ttl(),
            max_ttl: default_max_ttl(),
            negative_max_ttl: default_negative_max_ttl(),
        }
    }
}

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct ProxyConfig {
    /// Servers asked, in order, about CNAME targets outside of the served zones.
    #[serde(default)]
    pub upstreams: Vec<SocketAddr>,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_proxy_timeout")]
    pub timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstreams: Vec::default(),
            timeout: default_proxy_timeout(),
        }
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_plugins() -> Vec<PluginKind> {
    vec![
        PluginKind::Loadbalance,
        PluginKind::Cache,
        PluginKind::Backend,
    ]
}

fn default_ttl() -> u32 {
    300
}

fn root_zone() -> Zones {
    Zones::from(vec![LowerName::from(Name::root())])
}

fn default_capacity() -> usize {
    10_000
}

fn default_min_ttl() -> Duration {
    Duration::from_secs(5)
}

fn default_max_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_negative_max_ttl() -> Duration {
    Duration::from_secs(1800)
}

fn default_proxy_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Config {
    pub fn try_from_file(p: impl AsRef<Path>) -> Result<Self, Error> {
        let f = File::open(p)?;
        let reader = BufReader::new(f);
        let conf: Config = serde_json::from_reader(reader)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Check that every configured name is fully qualified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFQDN`] for the first name that isn't.
    pub fn validate(&self) -> Result<(), Error> {
        self.zones.validate()?;
        self.cache.zones.validate()?;
        match self.services.keys().find(|name| !name.is_fqdn()) {
            Some(name) => Err(Error::NotFQDN(name.clone())),
            None => Ok(()),
        }
    }

    pub fn ns_admin(&self) -> Result<Name, Error> {
        Ok(Name::from_str(&self.sanitized_ns_admin())?)
    }

    fn sanitized_ns_admin(&self) -> Cow<str> {
        match self.ns_admin.split_once('@') {
            Some((user, domain)) => {
                let user = user.replace('.', "\\.");
                Cow::Owned(format!("{user}.{domain}"))
            }
            _ => Cow::Borrowed(&self.ns_admin),
        }
    }

    /// The naming of the SOA records served at each zone apex.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DNSError`] if [`Config::ns_admin`] can't be turned into a name.
    pub fn soa(&self) -> Result<SoaParams, Error> {
        Ok(SoaParams {
            ns_domain: self.ns_domain.clone().into(),
            ns_admin: self.ns_admin()?,
            ttl: self.ttl,
        })
    }

    /// Build the service backend: file backed when [`Config::backend_state_path`] is set,
    /// in-memory otherwise. [`Config::services`] seeds the in-memory backend, and the file
    /// backend when its state file doesn't exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend state file can't be read or parsed.
    pub async fn backend(&self) -> Result<DynBackend, Error> {
        let seed = InMemoryBackend::new(self.zones.clone(), self.services.clone());
        let backend: DynBackend = match &self.backend_state_path {
            Some(path) => {
                tracing::debug!("loading backend state from {path}");
                let file = FileBackend::try_from_file(path, self.zones.clone(), &seed).await?;
                Arc::new(RwLock::new(file))
            }
            None => Arc::new(RwLock::new(seed)),
        };
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "dns_udp_bind_addr": "127.0.0.1:5353",
        "dns_tcp_bind_addr": "127.0.0.1:5353",
        "dns_tcp_timeout": 10,
        "zones": ["example.org.", "example.net."],
        "cache": { "capacity": 100, "max_ttl": 60 },
        "loadbalance": "stateful_rotate",
        "proxy": { "upstreams": ["192.0.2.53:53"] },
        "services": {
            "www.example.org.": [ { "host": "192.0.2.1" }, { "host": "192.0.2.2", "ttl": 60 } ]
        },
        "ns_domain": "ns1.example.org.",
        "ns_admin": "dns.admin@example.org."
    }"#;

    fn sample() -> Config {
        serde_json::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse() {
        let config = sample();
        assert_eq!(config.zones.iter().count(), 2);
        assert_eq!(config.plugins, default_plugins());
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.cache.capacity, 100);
        assert_eq!(config.cache.negative_capacity, 10_000);
        assert_eq!(config.cache.max_ttl, Duration::from_secs(60));
        assert_eq!(config.loadbalance, Policy::StatefulRotate);
        assert_eq!(config.proxy.upstreams.len(), 1);
        assert_eq!(config.proxy.timeout, Duration::from_secs(2));
        let www = LowerName::from_str("www.example.org.").unwrap();
        assert_eq!(config.services[&www][0].ttl, 300);
        assert_eq!(config.services[&www][1].ttl, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ns_admin() {
        let config = sample();
        assert_eq!(
            config.ns_admin().unwrap(),
            Name::from_str("dns\\.admin.example.org.").unwrap()
        );
        assert_eq!(config.soa().unwrap().ttl, 300);
    }

    #[test]
    fn test_rejects_relative_service_name() {
        let mut config = sample();
        config.services.insert(
            LowerName::from_str("relative.example").unwrap(),
            vec![Service::new("192.0.2.9", 300)],
        );
        assert!(matches!(config.validate(), Err(Error::NotFQDN(_))));
    }

    #[tokio::test]
    async fn test_backend_is_seeded() {
        let config = sample();
        let backend = config.backend().await.unwrap();
        assert!(backend.read().await.as_writable().is_some());
    }
}
