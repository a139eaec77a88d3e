//! Thin adapter over the third-party DNS wire codec (`hickory-proto`).
//!
//! Per spec.md §6, the core treats DNS messages as opaque except for query
//! name/type/class, header rcode, and the answer list with per-record TTLs.
//! Everything else about message framing is delegated to the library.

use std::net::Ipv4Addr;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};

use crate::error::PacketError;

/// A parsed DNS query/response, wrapping a `hickory_proto::op::Message`.
#[derive(Debug, Clone)]
pub struct DnsMessage(Message);

impl DnsMessage {
    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        Message::from_bytes(buf)
            .map(Self)
            .map_err(|_| PacketError::Truncated)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().unwrap_or_default()
    }

    /// The query name, lower-cased with the trailing root dot stripped —
    /// the normalized form used for suffix/glob matching and registry
    /// lookups throughout the DNS middlewares.
    pub fn qname(&self) -> String {
        self.0
            .queries()
            .first()
            .map(|q| {
                let s = q.name().to_string().to_ascii_lowercase();
                s.strip_suffix('.').map(str::to_owned).unwrap_or(s)
            })
            .unwrap_or_default()
    }

    pub fn qtype(&self) -> RecordType {
        self.0
            .queries()
            .first()
            .map(|q| q.query_type())
            .unwrap_or(RecordType::A)
    }

    pub fn qclass(&self) -> DNSClass {
        self.0
            .queries()
            .first()
            .map(|q| q.query_class())
            .unwrap_or(DNSClass::IN)
    }

    pub fn is_a_or_any(&self) -> bool {
        matches!(self.qtype(), RecordType::A | RecordType::ANY)
    }

    pub fn rcode(&self) -> ResponseCode {
        self.0.response_code()
    }

    pub fn set_rcode(&mut self, rcode: ResponseCode) {
        self.0.set_response_code(rcode);
    }

    pub fn answers(&self) -> &[Record] {
        self.0.answers()
    }

    pub fn add_answer(&mut self, record: Record) {
        self.0.add_answer(record);
    }

    /// Builds the base response message for this query: same id and
    /// question section, `QR` bit set, no answers yet. Middlewares append
    /// answers and may adjust the rcode.
    pub fn reply(&self) -> Self {
        let mut reply = Message::new();
        reply.set_id(self.0.id());
        reply.set_message_type(MessageType::Response);
        reply.set_op_code(OpCode::Query);
        reply.set_recursion_desired(self.0.recursion_desired());
        reply.set_recursion_available(true);
        for q in self.0.queries() {
            reply.add_query(q.clone());
        }
        Self(reply)
    }

    /// Cache key per spec.md §3: `"<qname>/<qclass>/<qtype>"`.
    pub fn cache_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.qname(),
            u16::from(self.qclass()),
            u16::from(self.qtype())
        )
    }
}

/// Builds an A record with the given name, ttl and address.
pub fn a_record(name: &str, ttl: u32, addr: Ipv4Addr) -> Record {
    let name = parse_name(name);
    Record::from_rdata(name, ttl, RData::A(A(addr)))
}

pub fn parse_name(name: &str) -> Name {
    Name::from_ascii(name).unwrap_or_else(|_| Name::root())
}

/// Decrements every answer's TTL by `elapsed` seconds, floored at 0, per
/// spec.md §8's cache-hit invariant.
pub fn age_ttls(records: &mut [Record], elapsed: u32) {
    for rr in records.iter_mut() {
        let ttl = rr.ttl().saturating_sub(elapsed);
        rr.set_ttl(ttl);
    }
}

/// Minimum TTL across a set of records, used to decide cache expiry.
pub fn min_ttl(records: &[Record]) -> Option<u32> {
    records.iter().map(|r| r.ttl()).min()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_query(name: &str, qtype: RecordType) -> DnsMessage {
        let mut msg = Message::new();
        msg.set_id(42);
        msg.set_message_type(MessageType::Query);
        msg.add_query(Query::query(parse_name(name), qtype));
        DnsMessage(msg)
    }

    #[test]
    fn parse_to_bytes_round_trips() {
        let q = sample_query("example.com.", RecordType::A);
        let bytes = q.to_bytes();
        let reparsed = DnsMessage::parse(&bytes).unwrap();
        assert_eq!(reparsed.qname(), "example.com");
        assert_eq!(reparsed.qtype(), RecordType::A);
    }

    #[test]
    fn reply_preserves_id_and_question() {
        let q = sample_query("foo.lxcnet.", RecordType::A);
        let reply = q.reply();
        assert_eq!(reply.0.id(), 42);
        assert_eq!(reply.qname(), "foo.lxcnet");
    }

    #[test]
    fn cache_key_shape() {
        let q = sample_query("foo.lxcnet.", RecordType::A);
        assert_eq!(q.cache_key(), "foo.lxcnet/1/1");
    }

    #[test]
    fn age_ttls_floors_at_zero() {
        let mut records = vec![a_record("foo.lxcnet", 10, Ipv4Addr::new(1, 2, 3, 4))];
        age_ttls(&mut records, 100);
        assert_eq!(records[0].ttl(), 0);
    }
}
