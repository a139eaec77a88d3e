//! Static fixed-record table and suffix-forwarder (spec.md §4.10/C11).
//!
//! Grounded on `original_source/dhns/dns/__init__.py`'s `FixHandler` (glob
//! matching, CNAME A-inlining recursion against the local DNS port,
//! shuffled answer order) and `SrvHandler` (always-claims suffix
//! forwarding).

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rand::seq::SliceRandom;
use tokio::net::UdpSocket;

use crate::config::{FixedRecordConfig, SuffixForwardConfig};

use super::message::{a_record, parse_name, DnsMessage};
use super::middleware::DnsMiddleware;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(1);
const FIXED_TTL: u32 = 60;

struct FixedEntry {
    glob: Vec<u8>,
    rtype: RecordType,
    rdata: String,
}

/// Simple `*`/`?` glob over whole-string patterns (dnslib's `matchGlob`
/// equivalent) — no regex crate in the dependency stack, so this is a plain
/// two-pointer wildcard matcher.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut matched) = (usize::MAX, 0usize);

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p].eq_ignore_ascii_case(&text[t])) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = p;
            matched = t;
            p += 1;
        } else if star != usize::MAX {
            p = star + 1;
            matched += 1;
            t = matched;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

pub struct FixedRecords {
    entries: Vec<FixedEntry>,
    dns_port: u16,
}

impl FixedRecords {
    pub fn new(records: &[FixedRecordConfig], dns_port: u16) -> Self {
        let entries = records
            .iter()
            .map(|r| FixedEntry {
                glob: r.name.to_ascii_lowercase().into_bytes(),
                rtype: match r.rtype.to_ascii_uppercase().as_str() {
                    "CNAME" => RecordType::CNAME,
                    _ => RecordType::A,
                },
                rdata: r.rdata.clone(),
            })
            .collect();
        Self { entries, dns_port }
    }

    async fn resolve_cname_as_a(&self, qname: &str, target: &str) -> Vec<Record> {
        use hickory_proto::op::{Message, MessageType, OpCode, Query};
        use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};

        let mut query = Message::new();
        query.set_id(1);
        query.set_message_type(MessageType::Query);
        query.set_op_code(OpCode::Query);
        query.add_query(Query::query(parse_name(target), RecordType::A));

        let Ok(bytes) = query.to_bytes() else { return Vec::new() };
        let addr: SocketAddr = format!("127.0.0.1:{}", self.dns_port).parse().unwrap();

        let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await else { return Vec::new() };
        if socket.connect(addr).await.is_err() {
            return Vec::new();
        }
        if socket.send(&bytes).await.is_err() {
            return Vec::new();
        }

        let mut buf = [0u8; 512];
        let Ok(Ok(len)) = tokio::time::timeout(FORWARD_TIMEOUT, socket.recv(&mut buf)).await else {
            return Vec::new();
        };
        let Ok(reply) = Message::from_bytes(&buf[..len]) else { return Vec::new() };

        reply
            .answers()
            .iter()
            .filter_map(|rr| match rr.data() {
                Some(RData::A(a)) => Some(a_record(qname, rr.ttl(), a.0)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl DnsMiddleware for FixedRecords {
    async fn handle_dns_query(&self, query: &DnsMessage, answer: &mut DnsMessage) -> bool {
        let qname = query.qname();
        let qtype = query.qtype();
        let mut found = false;
        let mut records: Vec<Record> = Vec::new();

        for entry in &self.entries {
            if !glob_match(&entry.glob, qname.as_bytes()) {
                continue;
            }
            found = true;

            if qtype == RecordType::A && entry.rtype == RecordType::CNAME {
                records.extend(self.resolve_cname_as_a(&qname, &entry.rdata).await);
                continue;
            }

            if qtype == RecordType::ANY || qtype == entry.rtype {
                let rdata = match entry.rtype {
                    RecordType::CNAME => {
                        RData::CNAME(hickory_proto::rr::rdata::CNAME(Name::from_ascii(&entry.rdata).unwrap_or_else(|_| Name::root())))
                    }
                    _ => RData::A(hickory_proto::rr::rdata::A(entry.rdata.parse().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED))),
                };
                records.push(Record::from_rdata(parse_name(&qname), FIXED_TTL, rdata));
            }
        }

        records.shuffle(&mut rand::thread_rng());
        for record in records {
            answer.add_answer(record);
        }

        found
    }
}

pub struct SuffixForwarder {
    suffix: String,
    upstream: SocketAddr,
}

impl SuffixForwarder {
    pub fn new(cfg: &SuffixForwardConfig) -> Option<Self> {
        Some(Self { suffix: cfg.suffix.to_ascii_lowercase(), upstream: cfg.resolver.parse().ok()? })
    }
}

#[async_trait]
impl DnsMiddleware for SuffixForwarder {
    async fn handle_dns_query(&self, query: &DnsMessage, answer: &mut DnsMessage) -> bool {
        let qname = query.qname();
        if qname != self.suffix && !qname.ends_with(&format!(".{}", self.suffix)) {
            return false;
        }

        // Always claims, matching the source's `finally: return True` —
        // even when the forward attempt itself fails.
        let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await else { return true };
        if socket.connect(self.upstream).await.is_err() {
            return true;
        }
        if socket.send(&query.to_bytes()).await.is_err() {
            return true;
        }
        let mut buf = [0u8; 512];
        let Ok(Ok(len)) = tokio::time::timeout(FORWARD_TIMEOUT, socket.recv(&mut buf)).await else {
            return true;
        };
        if let Ok(reply) = DnsMessage::parse(&buf[..len]) {
            for record in reply.answers() {
                answer.add_answer(record.clone());
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_star_suffix() {
        assert!(glob_match(b"*.example.com", b"foo.example.com"));
        assert!(!glob_match(b"*.example.com", b"foo.example.org"));
    }

    #[test]
    fn glob_matches_exact_without_wildcard() {
        assert!(glob_match(b"example.com", b"example.com"));
        assert!(!glob_match(b"example.com", b"www.example.com"));
    }

    #[test]
    fn suffix_forwarder_matches_exact_and_subdomain() {
        let cfg = SuffixForwardConfig { suffix: "corp.example".to_string(), resolver: "10.0.0.1:53".to_string() };
        let forwarder = SuffixForwarder::new(&cfg).unwrap();
        assert_eq!(forwarder.suffix, "corp.example");
    }
}
