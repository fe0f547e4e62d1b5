use crate::error::Error;
use crate::plugin::{Chain, Context};
use crate::request::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use trust_dns_proto::serialize::binary::BinDecodable;
use trust_dns_server::authority::{MessageRequest, MessageResponseBuilder};
use trust_dns_server::client::op::{Header, Message, MessageType, OpCode, ResponseCode};
use trust_dns_server::server::{Protocol, Request, RequestHandler, ResponseHandler, ResponseInfo};

#[derive(Clone)]
pub struct Handler {
    chain: Arc<Chain>,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl Handler {
    pub(super) fn new(
        chain: Arc<Chain>,
        shutdown: CancellationToken,
        request_timeout: Duration,
    ) -> Self {
        Handler {
            chain,
            shutdown,
            request_timeout,
        }
    }

    async fn dispatch_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response: R,
    ) -> Result<ResponseInfo, Error> {
        // If it isn't a query, return NOTIMPL.
        if request.op_code() != OpCode::Query || request.message_type() != MessageType::Query {
            return self.handle_notimpl(request, response).await;
        }

        let transport = match request.protocol() {
            Protocol::Udp => Transport::Udp,
            _ => Transport::Tcp,
        };
        let query = Self::query_message(request);
        let fallback = Self::servfail(&query);

        // Each request gets its own token so a timeout cancels only this request, while
        // shutting the server down cancels all of them.
        let ctx = Context::new(self.shutdown.child_token());
        let served = self
            .chain
            .serve_message(&ctx, query, request.src(), transport);
        let reply = match tokio::time::timeout(self.request_timeout, served).await {
            Ok(reply) => reply,
            Err(_) => {
                ctx.cancel();
                warn!(src = %request.src(), "request timed out");
                fallback
            }
        };
        Self::send(response, &reply).await
    }

    /// Rebuild the plain [`Message`] the plugin chain works on from the server's request.
    fn query_message(request: &Request) -> Message {
        let mut msg = Message::new();
        msg.set_header(*request.header());
        msg.add_query(request.query().original().clone());
        if let Some(edns) = request.edns() {
            msg.set_edns(edns.clone());
        }
        msg
    }

    fn servfail(query: &Message) -> Message {
        let mut reply = Message::error_msg(query.id(), query.op_code(), ResponseCode::ServFail);
        reply
            .set_recursion_desired(query.recursion_desired())
            .add_queries(query.queries().iter().cloned());
        reply
    }

    async fn handle_notimpl<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> Result<ResponseInfo, Error> {
        let response = MessageResponseBuilder::from_message_request(request);
        Ok(response_handle
            .send_response(response.error_msg(request.header(), ResponseCode::NotImp))
            .await?)
    }

    async fn send<R: ResponseHandler>(
        mut response_handle: R,
        reply: &Message,
    ) -> Result<ResponseInfo, Error> {
        // The response builder takes its question section from a request. Decoding the reply
        // as one keeps the question exactly as the chain left it, including when it was
        // removed for BADVERS.
        let wire = reply.to_vec()?;
        let echoed = MessageRequest::from_bytes(&wire)?;
        let mut builder = MessageResponseBuilder::from_message_request(&echoed);
        if let Some(edns) = reply.edns() {
            builder.edns(edns.clone());
        }
        let response = builder.build(
            *reply.header(),
            reply.answers(),
            reply.name_servers(),
            &[],
            reply.additionals(),
        );
        Ok(response_handle.send_response(response).await?)
    }
}

#[async_trait::async_trait]
impl RequestHandler for Handler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        match self.dispatch_request(request, response_handle).await {
            Ok(info) => info,
            Err(error) => {
                error!("error in RequestHandler: {:?}", error);
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::tests::{edns, query_msg, src};
    use trust_dns_server::client::rr::RecordType;

    #[test]
    fn test_query_message_from_request() {
        let query = query_msg("www.example.org.", RecordType::AAAA, Some(edns(1400, true)));
        let bytes = query.to_vec().unwrap();
        let request = Request::new(
            MessageRequest::from_bytes(&bytes).unwrap(),
            src(),
            Protocol::Udp,
        );

        let msg = Handler::query_message(&request);
        assert_eq!(msg.id(), 4242);
        assert_eq!(msg.queries(), query.queries());
        let opt = msg.edns().unwrap();
        assert_eq!(opt.max_payload(), 1400);
        assert!(opt.dnssec_ok());
    }

    #[test]
    fn test_servfail_keeps_question() {
        let query = query_msg("www.example.org.", RecordType::A, None);
        let reply = Handler::servfail(&query);
        assert_eq!(reply.id(), query.id());
        assert_eq!(reply.message_type(), MessageType::Response);
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert!(reply.recursion_desired());
        assert_eq!(reply.queries(), query.queries());
    }
}
