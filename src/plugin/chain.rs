use crate::backend::DynBackend;
use crate::cache::Cache;
use crate::config::{Config, PluginKind};
use crate::error::Error;
use crate::loadbalance::LoadBalance;
use crate::plugin::{Capability, Context, Outcome, Plugin, ResponseWriter};
use crate::request::{RequestState, Transport};
use crate::resolver::{Authority, Proxy, UpstreamProxy};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, trace};
use trust_dns_server::client::op::{Message, ResponseCode};

/// The plugins after the one currently running.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    current: &'static str,
    rest: &'a [Arc<dyn Plugin>],
}

impl<'a> Next<'a> {
    /// Hand the request to the next plugin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the request was cancelled, [`Error::NoNextPlugin`] if no
    /// plugin is left, or whatever the next plugin fails with.
    pub async fn run(
        self,
        ctx: &Context,
        state: &RequestState,
        writer: &mut dyn ResponseWriter,
    ) -> Result<Outcome, Error> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some((plugin, rest)) = self.rest.split_first() else {
            return Err(Error::NoNextPlugin(self.current));
        };
        trace!(plugin = plugin.name(), name = %state.name(), "serving");
        let next = Next {
            current: plugin.name(),
            rest,
        };
        plugin.serve(ctx, state, writer, next).await
    }

    /// True if no plugin is left.
    pub fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }
}

/// An ordered plugin pipeline.
#[derive(Default, Clone)]
pub struct Chain {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Chain {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    /// Build the plugins listed in [`Config::plugins`], in that order.
    ///
    /// # Errors
    ///
    /// Returns an error if the SOA administrator address in the config can't be parsed.
    pub async fn from_config(config: &Config, backend: DynBackend) -> Result<Self, Error> {
        let proxy: Option<Arc<dyn Proxy + Send + Sync>> = if config.proxy.upstreams.is_empty() {
            None
        } else {
            Some(Arc::new(UpstreamProxy::new(
                config.proxy.upstreams.clone(),
                config.proxy.timeout,
            )))
        };

        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::with_capacity(config.plugins.len());
        for kind in &config.plugins {
            let plugin: Arc<dyn Plugin> = match kind {
                PluginKind::Cache => Arc::new(Cache::new(&config.cache)),
                PluginKind::Loadbalance => Arc::new(LoadBalance::new(config.loadbalance)),
                PluginKind::Backend => Arc::new(
                    Authority::new(
                        config.zones.clone(),
                        backend.clone(),
                        proxy.clone(),
                        config.soa()?,
                    )
                    .await,
                ),
            };
            debug!(plugin = plugin.name(), "plugin enabled");
            plugins.push(plugin);
        }
        Ok(Self::new(plugins))
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// The plugins offering `capability`, in chain order.
    pub fn capable(&self, capability: Capability) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins
            .iter()
            .filter(move |plugin| plugin.capabilities().contains(&capability))
    }

    /// Run the chain for one request. A reply is always written to `writer`: requests with an
    /// unsupported EDNS0 version get `BADVERS`, unhandled requests an error reply with the
    /// plugin's response code, and failed requests `SERVFAIL`.
    pub async fn handle(
        &self,
        ctx: &Context,
        state: &RequestState,
        writer: &mut dyn ResponseWriter,
    ) -> Outcome {
        if let Some(reply) = state.bad_version_reply() {
            debug!(name = %state.name(), src = %state.src(), "unsupported EDNS version");
            return write_or_log(writer, reply, ResponseCode::BADVERS);
        }

        let mut tracked = Tracked {
            inner: writer,
            written: false,
        };
        let head = Next {
            current: "chain",
            rest: &self.plugins,
        };
        match head.run(ctx, state, &mut tracked).await {
            Ok(Outcome::Unhandled(response_code)) if !tracked.written => write_or_log(
                tracked.inner,
                state.error_reply(response_code),
                response_code,
            ),
            Ok(outcome) => outcome,
            Err(err) => {
                match err {
                    Error::Cancelled => debug!(name = %state.name(), "request cancelled"),
                    err => error!(
                        name = %state.name(),
                        query_type = %state.query_type(),
                        "error in plugin chain: {err}"
                    ),
                }
                if tracked.written {
                    Outcome::Written(ResponseCode::ServFail)
                } else {
                    write_or_log(
                        tracked.inner,
                        state.error_reply(ResponseCode::ServFail),
                        ResponseCode::ServFail,
                    )
                }
            }
        }
    }

    /// Run the whole pipeline for a raw query and return the reply, shaped to the size the
    /// client negotiated. Messages without a question are answered with `FORMERR`.
    pub async fn serve_message(
        &self,
        ctx: &Context,
        message: Message,
        src: SocketAddr,
        transport: Transport,
    ) -> Message {
        let (id, op_code, recursion_desired) = (
            message.id(),
            message.op_code(),
            message.recursion_desired(),
        );
        let state = match RequestState::new(message, src, transport) {
            Ok(state) => state,
            Err(err) => {
                debug!(%src, "malformed query: {err}");
                let mut reply = Message::error_msg(id, op_code, ResponseCode::FormErr);
                reply.set_recursion_desired(recursion_desired);
                return reply;
            }
        };

        let mut recorder = super::Recorder::default();
        self.handle(ctx, &state, &mut recorder).await;
        let reply = recorder
            .take()
            .unwrap_or_else(|| state.error_reply(ResponseCode::ServFail));
        let (reply, _) = state.shape(reply);
        reply
    }
}

fn write_or_log(
    writer: &mut dyn ResponseWriter,
    reply: Message,
    response_code: ResponseCode,
) -> Outcome {
    if let Err(err) = writer.write_msg(reply) {
        error!("failed to write reply: {err}");
    }
    Outcome::Written(response_code)
}

/// Remembers whether a reply made it to the wrapped writer.
struct Tracked<'a> {
    inner: &'a mut dyn ResponseWriter,
    written: bool,
}

impl ResponseWriter for Tracked<'_> {
    fn write_msg(&mut self, msg: Message) -> Result<(), Error> {
        self.inner.write_msg(msg)?;
        self.written = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Recorder;
    use crate::request::tests::{edns, query_msg, src, state};
    use trust_dns_server::client::rr::RecordType;

    struct Fixed(ResponseCode);

    #[async_trait::async_trait]
    impl Plugin for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn serve(
            &self,
            _ctx: &Context,
            state: &RequestState,
            writer: &mut dyn ResponseWriter,
            _next: Next<'_>,
        ) -> Result<Outcome, Error> {
            writer.write_msg(state.error_reply(self.0))?;
            Ok(Outcome::Written(self.0))
        }
    }

    struct Delegate;

    #[async_trait::async_trait]
    impl Plugin for Delegate {
        fn name(&self) -> &'static str {
            "delegate"
        }

        fn capabilities(&self) -> &[Capability] {
            &[Capability::Writable]
        }

        async fn serve(
            &self,
            ctx: &Context,
            state: &RequestState,
            writer: &mut dyn ResponseWriter,
            next: Next<'_>,
        ) -> Result<Outcome, Error> {
            next.run(ctx, state, writer).await
        }
    }

    struct Refuse;

    #[async_trait::async_trait]
    impl Plugin for Refuse {
        fn name(&self) -> &'static str {
            "refuse"
        }

        async fn serve(
            &self,
            _ctx: &Context,
            _state: &RequestState,
            _writer: &mut dyn ResponseWriter,
            _next: Next<'_>,
        ) -> Result<Outcome, Error> {
            Ok(Outcome::Unhandled(ResponseCode::Refused))
        }
    }

    fn chain(plugins: Vec<Arc<dyn Plugin>>) -> Chain {
        Chain::new(plugins)
    }

    #[tokio::test]
    async fn test_delegates_in_order() {
        let chain = chain(vec![Arc::new(Delegate), Arc::new(Fixed(ResponseCode::NXDomain))]);
        let state = state("www.example.org.", RecordType::A, Transport::Udp);
        let mut recorder = Recorder::default();

        let outcome = chain.handle(&Context::default(), &state, &mut recorder).await;
        assert_eq!(outcome, Outcome::Written(ResponseCode::NXDomain));
        assert_eq!(
            recorder.msg().unwrap().response_code(),
            ResponseCode::NXDomain
        );
    }

    #[tokio::test]
    async fn test_past_the_end_is_servfail() {
        let chain = chain(vec![Arc::new(Delegate)]);
        let state = state("www.example.org.", RecordType::A, Transport::Udp);
        let mut recorder = Recorder::default();

        let outcome = chain.handle(&Context::default(), &state, &mut recorder).await;
        assert_eq!(outcome, Outcome::Written(ResponseCode::ServFail));
        let reply = recorder.msg().unwrap();
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert_eq!(reply.id(), 4242);
        assert_eq!(reply.queries().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_chain_is_servfail() {
        let chain = Chain::default();
        let state = state("www.example.org.", RecordType::A, Transport::Udp);
        let mut recorder = Recorder::default();

        chain.handle(&Context::default(), &state, &mut recorder).await;
        assert_eq!(
            recorder.msg().unwrap().response_code(),
            ResponseCode::ServFail
        );
    }

    #[tokio::test]
    async fn test_unhandled_writes_error_reply() {
        let chain = chain(vec![Arc::new(Refuse)]);
        let state = state("www.example.org.", RecordType::A, Transport::Udp);
        let mut recorder = Recorder::default();

        let outcome = chain.handle(&Context::default(), &state, &mut recorder).await;
        assert_eq!(outcome, Outcome::Written(ResponseCode::Refused));
        assert_eq!(
            recorder.msg().unwrap().response_code(),
            ResponseCode::Refused
        );
    }

    #[tokio::test]
    async fn test_cancelled_is_servfail() {
        let chain = chain(vec![Arc::new(Fixed(ResponseCode::NoError))]);
        let state = state("www.example.org.", RecordType::A, Transport::Udp);
        let ctx = Context::default();
        ctx.cancel();
        let mut recorder = Recorder::default();

        chain.handle(&ctx, &state, &mut recorder).await;
        assert_eq!(
            recorder.msg().unwrap().response_code(),
            ResponseCode::ServFail
        );
    }

    #[tokio::test]
    async fn test_bad_version_skips_plugins() {
        let chain = chain(vec![Arc::new(Fixed(ResponseCode::NoError))]);
        let mut opt = edns(1232, false);
        opt.set_version(2);
        let msg = query_msg("www.example.org.", RecordType::A, Some(opt));

        let reply = chain
            .serve_message(&Context::default(), msg, src(), Transport::Udp)
            .await;
        assert_eq!(reply.response_code(), ResponseCode::BADVERS);
        assert!(reply.queries().is_empty());
        assert!(reply.answers().is_empty());
        assert_eq!(reply.edns().unwrap().version(), 0);
    }

    #[tokio::test]
    async fn test_no_question_is_formerr() {
        let chain = chain(vec![Arc::new(Fixed(ResponseCode::NoError))]);
        let mut msg = Message::new();
        msg.set_id(7);

        let reply = chain
            .serve_message(&Context::default(), msg, src(), Transport::Tcp)
            .await;
        assert_eq!(reply.response_code(), ResponseCode::FormErr);
        assert_eq!(reply.id(), 7);
    }

    #[test]
    fn test_capable() {
        let chain = chain(vec![
            Arc::new(Refuse),
            Arc::new(Delegate),
            Arc::new(Fixed(ResponseCode::NoError)),
        ]);
        let names: Vec<&str> = chain
            .capable(Capability::Writable)
            .map(|plugin| plugin.name())
            .collect();
        assert_eq!(names, vec!["delegate"]);
    }
}
