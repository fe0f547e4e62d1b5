//! CNAME chasing.
//!
//! [`Chaser::address`] turns the services a backend reports for a name into address records.
//! Services pointing at another host name become a `CNAME` followed by whatever the target
//! resolves to: in-zone targets are looked up in the backend again, other targets through the
//! [`Proxy`].
//!
//! Each recursive call receives its own copy of the records collected on the way down. A branch
//! is not expanded once [`MAX_CNAME_CHAIN`] records have been collected, or when its `CNAME`
//! target has already been seen, which keeps every chain finite and acyclic.

use crate::backend::{Diagnostic, DynBackend, LookupOptions, Services, Target};
use crate::error::Error;
use crate::plugin::Context;
use crate::request::RequestState;
use crate::resolver::Proxy;
use crate::zones::Zones;
use std::future::Future;
use std::pin::Pin;
use tracing::debug;
use trust_dns_server::client::rr::{LowerName, Name, RData, Record, RecordType};

/// Branches stop being expanded once this many records were collected above them.
pub const MAX_CNAME_CHAIN: usize = 8;

type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Result<Resolution, Error>> + Send + 'a>>;

/// Records resolved for one question, with notes about branches that failed.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub records: Vec<Record>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Resolves questions against one backend and its zones.
pub struct Chaser<'a> {
    pub backend: &'a DynBackend,
    pub zones: &'a Zones,
    pub proxy: Option<&'a (dyn Proxy + Send + Sync)>,
    pub opt: LookupOptions,
}

impl<'a> Chaser<'a> {
    /// Ask the backend about the question of `state`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the request is cancelled before the backend answers, or
    /// the backend's error.
    pub async fn services(
        &self,
        ctx: &Context,
        state: &RequestState,
        exact: bool,
    ) -> Result<Services, Error> {
        let backend = self.backend.read().await;
        tokio::select! {
            () = ctx.cancelled() => Err(Error::Cancelled),
            res = backend.services(state, exact, &self.opt) => res,
        }
    }

    /// Resolve the `A` or `AAAA` question of `state`, with `previous` holding the records
    /// collected by the calls above this one.
    ///
    /// # Errors
    ///
    /// Only the lookup of `state`'s own name can fail the call. Failures further down a
    /// branch are recorded as diagnostics.
    pub fn address(
        &'a self,
        ctx: &'a Context,
        state: RequestState,
        previous: Vec<Record>,
    ) -> ResolveFuture<'a> {
        Box::pin(async move {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let services = self.services(ctx, &state, false).await?;
            let owner: Name = state.name().into();
            let mut resolution = Resolution {
                records: Vec::new(),
                diagnostics: services.debug,
            };

            for service in &services.records {
                let target = match service.target() {
                    Ok(target) => target,
                    Err(err) => {
                        resolution.diagnostics.push(Diagnostic::new(
                            owner.clone(),
                            format!("invalid host \"{}\": {err}", service.host),
                        ));
                        continue;
                    }
                };

                let host = match (target, state.query_type()) {
                    (Target::V4(ip), RecordType::A) => {
                        resolution.records.push(Record::from_rdata(
                            owner.clone(),
                            service.ttl,
                            RData::A(ip),
                        ));
                        continue;
                    }
                    (Target::V6(ip), RecordType::AAAA) => {
                        resolution.records.push(Record::from_rdata(
                            owner.clone(),
                            service.ttl,
                            RData::AAAA(ip),
                        ));
                        continue;
                    }
                    (Target::Host(host), _) => host,
                    _ => continue,
                };

                let host_lower = LowerName::from(&host);
                if host_lower == *state.name() {
                    debug!(name = %owner, "skipping self-referential CNAME");
                    continue;
                }

                let cname = Record::from_rdata(owner.clone(), service.ttl, RData::CNAME(host.clone()));
                if previous.len() >= MAX_CNAME_CHAIN {
                    debug!(name = %owner, target = %host, "CNAME chain too long");
                    continue;
                }
                if is_duplicate(&host, &previous) {
                    debug!(name = %owner, target = %host, "skipping duplicate CNAME");
                    continue;
                }

                if self.zones.matches(&host_lower).is_some() {
                    let mut seen = previous.clone();
                    seen.push(cname.clone());
                    let next = state.with_question(&host_lower, state.query_type());
                    match self.address(ctx, next, seen).await {
                        Ok(nested) => {
                            resolution.diagnostics.extend(nested.diagnostics);
                            if !nested.records.is_empty() {
                                resolution.records.push(cname);
                                resolution.records.extend(nested.records);
                            }
                        }
                        Err(Error::NameNotFound(_)) => {}
                        Err(Error::Cancelled) => return Err(Error::Cancelled),
                        Err(err) => resolution
                            .diagnostics
                            .push(Diagnostic::new(host, err.to_string())),
                    }
                    continue;
                }

                match self.proxy_lookup(ctx, &state, &host).await {
                    Ok(records) => {
                        resolution.records.push(cname);
                        resolution.records.extend(records);
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(err) => {
                        debug!(name = %owner, target = %host, "cross-zone lookup failed: {err}");
                        resolution
                            .diagnostics
                            .push(Diagnostic::new(host, format!("proxy lookup failed: {err}")));
                    }
                }
            }
            Ok(resolution)
        })
    }

    /// The `CNAME` records for the host name services defined at `state`'s name.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn cname(&self, ctx: &Context, state: &RequestState) -> Result<Resolution, Error> {
        let services = self.services(ctx, state, true).await?;
        let owner: Name = state.name().into();
        let records = services
            .records
            .iter()
            .filter_map(|service| match service.target() {
                Ok(Target::Host(host)) if LowerName::from(&host) != *state.name() => Some(
                    Record::from_rdata(owner.clone(), service.ttl, RData::CNAME(host)),
                ),
                _ => None,
            })
            .collect();
        Ok(Resolution {
            records,
            diagnostics: services.debug,
        })
    }

    async fn proxy_lookup(
        &self,
        ctx: &Context,
        state: &RequestState,
        target: &Name,
    ) -> Result<Vec<Record>, Error> {
        let proxy = self.proxy.ok_or(Error::NoProxy)?;
        let mut reply = proxy.lookup(ctx, state, target, state.query_type()).await?;
        Ok(reply.take_answers())
    }
}

/// True if `target` already appears in the chain above, as the owner or the target of a
/// collected `CNAME`. The owner of the first `CNAME` is the query name itself.
fn is_duplicate(target: &Name, previous: &[Record]) -> bool {
    previous.iter().any(|record| match record.data() {
        Some(RData::CNAME(seen)) => seen == target || record.name() == target,
        _ => false,
    })
}
