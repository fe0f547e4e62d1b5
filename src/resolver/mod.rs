//! Backend backed authoritative answers.
//!
//! The [`Authority`] plugin answers questions for names inside its [`Zones`] from a
//! [`Backend`][crate::backend::Backend], chasing CNAMEs as described in [`chase`]. Questions for
//! names outside its zones are passed on to the next plugin.
//!
//! # A/AAAA
//!
//! Address services are answered directly when their family matches the question. Host name
//! services are answered with a `CNAME` followed by the records the target resolves to.
//!
//! # CNAME
//!
//! Host name services defined at the name itself, without chasing them.
//!
//! # SOA
//!
//! At the zone apex, using the
//! [`Config::ns_domain`][`crate::config::Config::ns_domain`] and
//! [`Config::ns_admin`][`crate::config::Config::ns_admin`] settings. The same record is put in
//! the authority section of `NXDOMAIN` and `NODATA` replies.
//!
//! # Debug
//!
//! Prefixing a question with `o-o.debug.` resolves the rest of the name and appends one TXT
//! record per diagnostic to the additional section, e.g.:
//!
//! ```bash
//! ❯ dig @127.0.0.1 -p 5353 o-o.debug.www.example.org A
//! ```

use crate::backend::{Diagnostic, DynBackend, LookupOptions};
use crate::error::Error;
use crate::plugin::{Capability, Context, Next, Outcome, Plugin, ResponseWriter};
use crate::request::RequestState;
use crate::zones::Zones;
use lazy_static::lazy_static;
use std::sync::Arc;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::debug;
use trust_dns_proto::rr::rdata::SOA;
use trust_dns_server::client::op::ResponseCode;
use trust_dns_server::client::rr::{LowerName, Name, RData, Record, RecordType};

pub mod chase;
pub mod proxy;

pub use chase::{Chaser, Resolution, MAX_CNAME_CHAIN};
pub use proxy::{Proxy, UpstreamProxy};

lazy_static! {
    static ref SERIAL_FORMATTER: &'static [time::format_description::FormatItem<'static>] =
        format_description!(version = 2, "[year][month][day]");
}

const DEBUG_PREFIX: [&[u8]; 2] = [b"o-o", b"debug"];

/// Naming for the SOA record served at each zone apex.
#[derive(Debug, Clone)]
pub struct SoaParams {
    pub ns_domain: Name,
    pub ns_admin: Name,
    pub ttl: u32,
}

pub struct Authority {
    zones: Zones,
    backend: DynBackend,
    proxy: Option<Arc<dyn Proxy + Send + Sync>>,
    soa: SoaParams,
    capabilities: Vec<Capability>,
}

impl Authority {
    pub async fn new(
        zones: Zones,
        backend: DynBackend,
        proxy: Option<Arc<dyn Proxy + Send + Sync>>,
        soa: SoaParams,
    ) -> Self {
        let capabilities = if backend.read().await.as_writable().is_some() {
            vec![Capability::Writable]
        } else {
            Vec::new()
        };
        Authority {
            zones,
            backend,
            proxy,
            soa,
            capabilities,
        }
    }

    pub fn zones(&self) -> &Zones {
        &self.zones
    }

    fn soa_record(&self, zone: &LowerName) -> Record {
        let serial: u32 = OffsetDateTime::now_utc()
            .format(&SERIAL_FORMATTER)
            .ok()
            .and_then(|serial| serial.parse().ok())
            .unwrap_or(1);
        // See RIPE 203[0] for recommended values.
        // [0]: https://www.ripe.net/publications/docs/ripe-203
        let soa_rdata = RData::SOA(SOA::new(
            self.soa.ns_domain.clone(),
            self.soa.ns_admin.clone(),
            serial,
            86_400,    // 24 hrs.
            7_200,     // 2 hours.
            3_600_000, // 1000 hours.
            172_800,   // 2 days.
        ));
        Record::from_rdata(zone.into(), self.soa.ttl, soa_rdata)
    }

    async fn resolve(
        &self,
        ctx: &Context,
        state: &RequestState,
        zone: &LowerName,
        opt: LookupOptions,
    ) -> Result<Resolution, Error> {
        let chaser = Chaser {
            backend: &self.backend,
            zones: &self.zones,
            proxy: self.proxy.as_deref(),
            opt,
        };
        match state.query_type() {
            RecordType::A | RecordType::AAAA => {
                chaser.address(ctx, state.clone(), Vec::new()).await
            }
            RecordType::CNAME => chaser.cname(ctx, state).await,
            RecordType::SOA if state.name() == zone => Ok(Resolution {
                records: vec![self.soa_record(zone)],
                diagnostics: Vec::new(),
            }),
            _ => {
                // Only tells NODATA from NXDOMAIN.
                let services = chaser.services(ctx, state, false).await?;
                Ok(Resolution {
                    records: Vec::new(),
                    diagnostics: services.debug,
                })
            }
        }
    }
}

/// The name a debug question is about, if `name` starts with the debug prefix.
fn strip_debug(name: &LowerName) -> Option<LowerName> {
    let name: Name = name.into();
    let labels = usize::from(name.num_labels());
    if labels <= DEBUG_PREFIX.len() {
        return None;
    }
    if !name.iter().zip(DEBUG_PREFIX).all(|(label, prefix)| label == prefix) {
        return None;
    }
    Some(LowerName::from(name.trim_to(labels - DEBUG_PREFIX.len())))
}

#[async_trait::async_trait]
impl Plugin for Authority {
    fn name(&self) -> &'static str {
        "backend"
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn writable_backend(&self) -> Option<DynBackend> {
        self.capabilities
            .contains(&Capability::Writable)
            .then(|| self.backend.clone())
    }

    async fn serve(
        &self,
        ctx: &Context,
        state: &RequestState,
        writer: &mut dyn ResponseWriter,
        next: Next<'_>,
    ) -> Result<Outcome, Error> {
        let stripped = strip_debug(state.name());
        let debug_mode = stripped.is_some();
        let lookup = match &stripped {
            Some(name) => state.with_question(name, state.query_type()),
            None => state.clone(),
        };
        let Some(zone) = self.zones.matches(lookup.name()) else {
            return next.run(ctx, state, writer).await;
        };

        let opt = LookupOptions { debug: debug_mode };
        let (response_code, resolution) = match self.resolve(ctx, &lookup, zone, opt).await {
            Ok(resolution) => (ResponseCode::NoError, resolution),
            Err(Error::NameNotFound(_)) if lookup.name() == zone => {
                (ResponseCode::NoError, Resolution::default())
            }
            Err(Error::NameNotFound(_)) => (ResponseCode::NXDomain, Resolution::default()),
            Err(err) => return Err(err),
        };
        debug!(
            name = %lookup.name(),
            query_type = %lookup.query_type(),
            %response_code,
            answers = resolution.records.len(),
            "resolved"
        );

        let mut reply = state.reply();
        reply
            .set_authoritative(true)
            .set_response_code(response_code);
        if resolution.records.is_empty() {
            reply.add_name_server(self.soa_record(zone));
        }
        reply.insert_answers(resolution.records);
        if debug_mode {
            reply.insert_additionals(
                resolution
                    .diagnostics
                    .iter()
                    .map(Diagnostic::to_record)
                    .collect(),
            );
        }
        writer.write_msg(reply)?;
        Ok(Outcome::Written(response_code))
    }
}
