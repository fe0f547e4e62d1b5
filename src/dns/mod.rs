//! DNS front end.
//!
//! Queries arriving over UDP or TCP are handed to the configured [`Chain`][crate::plugin::Chain]
//! and the reply it produces is sent back, shaped to the size the client negotiated.
//!
//! # Services
//!
//! Names are answered from the services held by the [backend][crate::backend], within the
//! configured [`Config::zones`][crate::config::Config::zones]. A service whose host is an IP
//! address becomes an `A` or `AAAA` record; any other host becomes a `CNAME` that is followed
//! to its addresses.
//!
//! E.g. with config:
//! ```json
//! {
//!   "zones": [ "example.org." ],
//!   "services": {
//!     "www.example.org.": [ { "host": "192.0.2.1" }, { "host": "192.0.2.2" } ],
//!     "web.example.org.": [ { "host": "www.example.org." } ]
//!   },
//!   ...
//! }
//! ```
//!
//! An `A` query for `web.example.org` would return:
//!
//! ```bash
//! ❯ dig @127.0.0.1 -p 5353 web.example.org +short A
//! www.example.org.
//! 192.0.2.1
//! 192.0.2.2
//! ```
//!
//! With the `loadbalance` plugin enabled the order of the addresses varies between queries.
//!
//! ## SOA
//!
//! Each zone apex answers `SOA` queries using the
//! [`Config::ns_domain`][crate::config::Config::ns_domain] and
//! [`Config::ns_admin`][crate::config::Config::ns_admin] settings. The same record is placed
//! in the authority section of `NXDOMAIN` and empty answers.
//!
//! ```bash
//! ❯ dig @127.0.0.1 -p 5353 example.org +short SOA
//! ns1.example.org. dns-admin.example.org. 20230312 86400 7200 3600000 172800
//! ```
//!
//! _Note: The zone serial (`20230312`) will differ based on the date the query is performed._
//!
//! ## Debug queries
//!
//! Prefixing a name with `o-o.debug.` answers as for the bare name, adding a `TXT` record to
//! the additional section for every service consulted and every lookup that went wrong.
//!
//! ```bash
//! ❯ dig @127.0.0.1 -p 5353 o-o.debug.www.example.org A
//! ```

mod handlers;
pub mod server;

pub use server::new;
