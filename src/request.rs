//! Per-request protocol state.
//!
//! A [`RequestState`] wraps one inbound query together with the facts the pipeline needs about
//! how its reply travels back to the client: the transport, the EDNS0 options the client sent,
//! the negotiated payload size and whether DNSSEC records were requested. Every fact is derived
//! once, when the state is built, and never changes for the lifetime of the request.
//!
//! [`RequestState::shape`] fits a candidate reply into the negotiated size, trimming the
//! additional section first and falling back to setting the truncation (`TC`) flag.

use crate::error::Error;
use std::net::{IpAddr, SocketAddr};
use trust_dns_proto::serialize::binary::BinDecodable;
use trust_dns_server::client::op::{Edns, Header, Message, MessageType, Query, ResponseCode};
use trust_dns_server::client::rr::{DNSClass, LowerName, RecordType};

/// Smallest payload every DNS client must accept over UDP (RFC 1035).
pub const MIN_MSG_SIZE: u16 = 512;

/// Largest payload a length-prefixed TCP DNS message can carry.
pub const MAX_MSG_SIZE: u16 = u16::MAX;

/// How the reply travels back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Connectionless (UDP).
    Udp,
    /// Connection-oriented (TCP).
    Tcp,
}

/// Outcome of [`RequestState::shape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shaped {
    /// The reply already fit and was returned untouched.
    Ignored,
    /// The reply was trimmed, truncated, or both.
    Done,
}

/// Request scoped facts about one inbound query.
#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct RequestState {
    request: Message,
    src: SocketAddr,
    transport: Transport,
    name: LowerName,
    query_type: RecordType,
    query_class: DNSClass,
    edns: Option<Edns>,
    size: u16,
    dnssec_ok: bool,
}

impl RequestState {
    /// Derive the protocol state for `request`, received from `src` over `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoQuestion`] if the message has no question.
    pub fn new(request: Message, src: SocketAddr, transport: Transport) -> Result<Self, Error> {
        let query = request.queries().first().ok_or(Error::NoQuestion)?;
        let name = LowerName::new(query.name());
        let query_type = query.query_type();
        let query_class = query.query_class();
        let edns = request.edns().cloned();
        let size = negotiated_size(transport, edns.as_ref());
        let dnssec_ok = edns.as_ref().map_or(false, Edns::dnssec_ok);
        Ok(Self {
            request,
            src,
            transport,
            name,
            query_type,
            query_class,
            edns,
            size,
            dnssec_ok,
        })
    }

    /// A copy of this state asking `name`/`query_type` instead. Transport, client and EDNS0
    /// facts are carried over unchanged.
    #[must_use]
    pub fn with_question(&self, name: &LowerName, query_type: RecordType) -> Self {
        let mut query = Query::query(name.into(), query_type);
        query.set_query_class(self.query_class);

        let mut request = Message::new();
        request
            .set_id(self.request.id())
            .set_message_type(MessageType::Query)
            .set_op_code(self.request.op_code())
            .set_recursion_desired(self.request.recursion_desired())
            .add_query(query);
        if let Some(edns) = &self.edns {
            request.set_edns(edns.clone());
        }

        Self {
            request,
            name: name.clone(),
            query_type,
            edns: self.edns.clone(),
            ..*self
        }
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn id(&self) -> u16 {
        self.request.id()
    }

    pub fn src(&self) -> SocketAddr {
        self.src
    }

    pub fn ip(&self) -> IpAddr {
        self.src.ip()
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// The lower-cased, fully qualified question name.
    pub fn name(&self) -> &LowerName {
        &self.name
    }

    pub fn query_type(&self) -> RecordType {
        self.query_type
    }

    pub fn query_class(&self) -> DNSClass {
        self.query_class
    }

    /// The EDNS0 options the client sent, if any.
    pub fn edns(&self) -> Option<&Edns> {
        self.edns.as_ref()
    }

    /// The payload size the reply has to fit in: [`MAX_MSG_SIZE`] over TCP, otherwise the
    /// client's advertised EDNS0 UDP size, never less than [`MIN_MSG_SIZE`].
    pub fn size(&self) -> u16 {
        self.size
    }

    /// True iff the client sent EDNS0 with the DO bit set.
    pub fn dnssec_ok(&self) -> bool {
        self.dnssec_ok
    }

    /// A fresh OPT pseudo-record advertising version 0, the negotiated size and the DO bit.
    pub fn build_opt(&self) -> Edns {
        let mut opt = Edns::new();
        opt.set_max_payload(self.size)
            .set_version(0)
            .set_dnssec_ok(self.dnssec_ok);
        opt
    }

    /// An empty reply to this request: same ID, opcode, RD flag and question. An OPT record is
    /// attached when the client used EDNS0.
    pub fn reply(&self) -> Message {
        let mut reply = Message::new();
        reply
            .set_id(self.request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(self.request.op_code())
            .set_recursion_desired(self.request.recursion_desired())
            .add_queries(self.request.queries().iter().cloned());
        if self.edns.is_some() {
            reply.set_edns(self.build_opt());
        }
        reply
    }

    /// An empty reply carrying `response_code`.
    pub fn error_reply(&self, response_code: ResponseCode) -> Message {
        let mut reply = self.reply();
        reply.set_response_code(response_code);
        reply
    }

    /// The `BADVERS` reply owed to a client that sent an EDNS0 version other than 0, or `None`
    /// if the request's EDNS0 version is supported.
    ///
    /// The reply has no question section and no answers; its OPT record advertises version 0
    /// and carries the high bits of the `BADVERS` extended response code.
    pub fn bad_version_reply(&self) -> Option<Message> {
        let edns = self.edns.as_ref()?;
        if edns.version() == 0 {
            return None;
        }

        let mut opt = self.build_opt();
        opt.set_rcode_high(ResponseCode::BADVERS.high());

        let mut reply = Message::new();
        reply
            .set_id(self.request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(self.request.op_code())
            .set_recursion_desired(self.request.recursion_desired())
            .set_response_code(ResponseCode::BADVERS)
            .set_edns(opt);
        Some(reply)
    }

    /// Fit `reply` into [`RequestState::size`].
    ///
    /// 1. A reply that already fits is returned unchanged as [`Shaped::Ignored`].
    /// 2. Otherwise the additional section is dropped and a fresh OPT record re-attached
    ///    (when EDNS0 is in use). If that fits the reply is returned as [`Shaped::Done`].
    /// 3. Otherwise the `TC` flag is set and the reply is returned as [`Shaped::Done`].
    ///
    /// The same policy applies over TCP.
    pub fn shape(&self, mut reply: Message) -> (Message, Shaped) {
        let size = usize::from(self.size);
        if wire_len(&reply) <= size {
            return (reply, Shaped::Ignored);
        }

        let had_opt = reply.edns().is_some();
        reply.take_additionals();
        if had_opt || self.edns.is_some() {
            reply.set_edns(self.build_opt());
        }
        if wire_len(&reply) <= size {
            return (reply, Shaped::Done);
        }

        reply.set_truncated(true);
        (reply, Shaped::Done)
    }
}

fn negotiated_size(transport: Transport, edns: Option<&Edns>) -> u16 {
    match transport {
        Transport::Tcp => MAX_MSG_SIZE,
        Transport::Udp => edns.map_or(MIN_MSG_SIZE, |edns| edns.max_payload().max(MIN_MSG_SIZE)),
    }
}

/// Encoded size of `msg`. Messages the encoder can't represent in full, either because
/// encoding fails or because records were dropped at the 64KiB limit, measure as `usize::MAX`.
fn wire_len(msg: &Message) -> usize {
    let Ok(wire) = msg.to_vec() else {
        return usize::MAX;
    };
    match Header::from_bytes(&wire) {
        Ok(header) if header.truncated() && !msg.truncated() => usize::MAX,
        Ok(_) => wire.len(),
        Err(_) => usize::MAX,
    }
}
