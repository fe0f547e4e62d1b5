//! The plugin contract.
//!
//! A [`Plugin`] is one stage of the request pipeline. It receives the request's
//! [`RequestState`], a [`ResponseWriter`] to deliver a reply through, and a [`Next`] handle on
//! the remainder of the [`Chain`]. From there a plugin can:
//!
//! * write a reply itself and return [`Outcome::Written`],
//! * delegate with [`Next::run`], optionally wrapping the writer to see (and rewrite) the reply
//!   produced further down the chain, or
//! * return [`Outcome::Unhandled`] and let the chain write an error reply.
//!
//! Optional features a plugin offers are advertised through [`Plugin::capabilities`] and looked
//! up with [`Chain::capable`] rather than by inspecting plugin types.

use crate::backend::DynBackend;
use crate::error::Error;
use crate::request::RequestState;
use tokio_util::sync::CancellationToken;
use trust_dns_server::client::op::{Message, ResponseCode};

pub mod chain;

pub use chain::{Chain, Next};

/// Per-request context shared by every plugin handling the request.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
}

impl Context {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Abort the request. Pending backend and proxy I/O is dropped at its next await point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the request is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// What a plugin did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A reply with this response code was written.
    Written(ResponseCode),
    /// Nothing was written; the chain answers with this response code.
    Unhandled(ResponseCode),
}

/// Sink for the reply to a request.
pub trait ResponseWriter: Send {
    /// Deliver `msg` as the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply can't be delivered.
    fn write_msg(&mut self, msg: Message) -> Result<(), Error>;
}

/// Optional features a plugin can expose to the rest of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// The plugin is backed by a store accepting dynamic updates, available through
    /// [`Plugin::writable_backend`].
    Writable,
}

#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &'static str;

    /// The optional capabilities this plugin offers.
    fn capabilities(&self) -> &[Capability] {
        &[]
    }

    /// The dynamically updatable backend of a plugin offering [`Capability::Writable`].
    fn writable_backend(&self) -> Option<DynBackend> {
        None
    }

    /// Handle one request.
    ///
    /// # Errors
    ///
    /// Any error is turned into a `SERVFAIL` reply by the [`Chain`].
    async fn serve(
        &self,
        ctx: &Context,
        state: &RequestState,
        writer: &mut dyn ResponseWriter,
        next: Next<'_>,
    ) -> Result<Outcome, Error>;
}

/// A [`ResponseWriter`] keeping the last reply written to it.
#[derive(Debug, Default)]
pub struct Recorder {
    msg: Option<Message>,
}

impl Recorder {
    pub fn msg(&self) -> Option<&Message> {
        self.msg.as_ref()
    }

    pub fn take(&mut self) -> Option<Message> {
        self.msg.take()
    }
}

impl ResponseWriter for Recorder {
    fn write_msg(&mut self, msg: Message) -> Result<(), Error> {
        self.msg = Some(msg);
        Ok(())
    }
}
