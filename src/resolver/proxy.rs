//! Cross-zone lookups.
//!
//! When a CNAME chain leaves the zones a backend owns, the target is resolved through a
//! [`Proxy`]. [`UpstreamProxy`] forwards the question over UDP to a list of upstream servers,
//! trying each in turn until one answers.

use crate::error::Error;
use crate::plugin::Context;
use crate::request::{RequestState, MAX_MSG_SIZE};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};
use trust_dns_server::client::op::{Message, MessageType, OpCode, Query};
use trust_dns_server::client::rr::{Name, RecordType};

/// Resolves names outside of the locally served zones.
#[async_trait::async_trait]
pub trait Proxy {
    /// Look up `target`/`query_type` on behalf of the request described by `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if no answer could be obtained, or [`Error::Cancelled`] if the request
    /// was cancelled first.
    async fn lookup(
        &self,
        ctx: &Context,
        state: &RequestState,
        target: &Name,
        query_type: RecordType,
    ) -> Result<Message, Error>;
}

/// DNS over UDP forwarding to a fixed list of upstreams.
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    upstreams: Vec<SocketAddr>,
    timeout: Duration,
}

impl UpstreamProxy {
    pub fn new(upstreams: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self { upstreams, timeout }
    }

    fn query(state: &RequestState, target: &Name, query_type: RecordType) -> Message {
        let mut query = Message::new();
        query
            .set_id(fastrand::u16(..))
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(target.clone(), query_type));
        if state.edns().is_some() {
            query.set_edns(state.build_opt());
        }
        query
    }

    async fn exchange(upstream: SocketAddr, query: &[u8], id: u16) -> Result<Message, Error> {
        let bind_addr: SocketAddr = if upstream.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(upstream).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; usize::from(MAX_MSG_SIZE)];
        let len = socket.recv(&mut buf).await?;
        let reply = Message::from_vec(&buf[..len])?;
        if reply.id() != id {
            return Err(Error::ProxyMismatch(upstream));
        }
        Ok(reply)
    }
}

#[async_trait::async_trait]
impl Proxy for UpstreamProxy {
    async fn lookup(
        &self,
        ctx: &Context,
        state: &RequestState,
        target: &Name,
        query_type: RecordType,
    ) -> Result<Message, Error> {
        let query = Self::query(state, target, query_type);
        let id = query.id();
        let wire = query.to_vec()?;

        let mut last_err = Error::NoProxy;
        for upstream in &self.upstreams {
            let attempt = tokio::time::timeout(self.timeout, Self::exchange(*upstream, &wire, id));
            tokio::select! {
                () = ctx.cancelled() => return Err(Error::Cancelled),
                res = attempt => match res {
                    Ok(Ok(reply)) => {
                        debug!(%upstream, %target, %query_type, "proxied lookup answered");
                        return Ok(reply);
                    }
                    Ok(Err(err)) => {
                        warn!(%upstream, %target, "proxied lookup failed: {err}");
                        last_err = err;
                    }
                    Err(_) => {
                        warn!(%upstream, %target, "proxied lookup timed out");
                        last_err = Error::ProxyTimeout(*upstream);
                    }
                },
            }
        }
        Err(last_err)
    }
}
