//! Chain Crab
//!
//! A small authoritative DNS server built as a pipeline of plugins.
//!
//! Every query runs through the [`Chain`] configured in [`Config::plugins`]. The stock plugins
//! are:
//!
//! * [`loadbalance`][crate::loadbalance]: reorders the address records of a reply.
//! * [`cache`][crate::cache]: remembers replies, keeping answers and denials in separate pools.
//! * [`backend`][crate::resolver::Authority]: answers from a [service backend][crate::backend]
//!   for the configured zones, following CNAME chains and asking upstream servers about targets
//!   outside of them.
//!
//! Before a reply leaves the server it is fitted to the message size the client negotiated
//! with EDNS0, see [`RequestState::shape`].
//!
#![warn(clippy::pedantic)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod dns;
pub mod error;
pub mod loadbalance;
pub mod plugin;
pub mod request;
pub mod resolver;
pub mod zones;

pub use backend::{DynBackend, FileBackend, InMemoryBackend};
pub use config::{Config, SharedConfig};
pub use dns::new as new_dns;
pub use plugin::{Capability, Chain, Context, Plugin};
pub use request::RequestState;
pub use zones::Zones;
