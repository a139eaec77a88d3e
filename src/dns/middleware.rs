//! Priority-ordered DNS middleware chain (spec.md §4.5/C7), grounded on
//! `original_source/dhns/dns/__init__.py`'s `Handler` — same shape as the
//! DHCP chain but operating on [`DnsMessage`] and with no claimant identity
//! to recover afterward.

use std::sync::Arc;

use async_trait::async_trait;

use super::message::DnsMessage;

pub const PRIORITY_HIGH: i32 = 100;
pub const PRIORITY_NORMAL: i32 = 50;
pub const PRIORITY_LOW: i32 = 0;

#[async_trait]
pub trait DnsMiddleware: Send + Sync {
    /// Returns `true` to claim the query, `false` to pass it on.
    async fn handle_dns_query(&self, query: &DnsMessage, answer: &mut DnsMessage) -> bool;
}

pub struct DnsMiddlewareChain {
    handlers: Vec<(Arc<dyn DnsMiddleware>, i32)>,
}

impl Default for DnsMiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsMiddlewareChain {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn add(&mut self, handler: Arc<dyn DnsMiddleware>, priority: i32) {
        self.handlers.push((handler, priority));
        self.handlers.sort_by(|a, b| b.1.cmp(&a.1));
    }

    /// Builds the reply skeleton and walks the chain, returning the answer
    /// whether or not anything claimed it (an unclaimed query comes back
    /// with an empty answer section, which the endpoint turns into
    /// `NXDOMAIN` or forwards on, per whichever middleware owns that).
    pub async fn dispatch(&self, query: &DnsMessage) -> DnsMessage {
        let mut answer = query.reply();
        for (handler, _priority) in &self.handlers {
            if handler.handle_dns_query(query, &mut answer).await {
                break;
            }
        }
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
    use hickory_proto::rr::RecordType;

    fn sample_query() -> DnsMessage {
        use hickory_proto::serialize::binary::BinEncodable;
        let mut msg = Message::new();
        msg.set_id(7);
        msg.set_message_type(MessageType::Query);
        msg.add_query(Query::query(super::super::message::parse_name("foo.lxcnet"), RecordType::A));
        DnsMessage::parse(&msg.to_bytes().unwrap()).unwrap()
    }

    struct SetRcode(ResponseCode, bool);

    #[async_trait]
    impl DnsMiddleware for SetRcode {
        async fn handle_dns_query(&self, _q: &DnsMessage, answer: &mut DnsMessage) -> bool {
            answer.set_rcode(self.0);
            self.1
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_claimant_stops_chain() {
        let mut chain = DnsMiddlewareChain::new();
        chain.add(Arc::new(SetRcode(ResponseCode::NXDomain, true)), PRIORITY_HIGH);
        chain.add(Arc::new(SetRcode(ResponseCode::ServFail, true)), PRIORITY_NORMAL);

        let answer = chain.dispatch(&sample_query()).await;
        assert_eq!(answer.rcode(), ResponseCode::NXDomain);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unclaimed_query_falls_through_every_handler() {
        let mut chain = DnsMiddlewareChain::new();
        chain.add(Arc::new(SetRcode(ResponseCode::NXDomain, false)), PRIORITY_HIGH);
        chain.add(Arc::new(SetRcode(ResponseCode::NoError, false)), PRIORITY_LOW);

        let answer = chain.dispatch(&sample_query()).await;
        assert_eq!(answer.rcode(), ResponseCode::NoError);
    }
}
