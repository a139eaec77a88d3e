//! Forwarding resolver with a TTL-aware LRU cache (spec.md §4.7, C9).
//!
//! Grounded on `original_source/dhns/dns/google.py`'s `Resolver` — cache key
//! format, expiry check against the minimum answer TTL, and TTL rewrite on a
//! cache hit are all carried over; `lru::LruCache` stands in for
//! `cachetools.LRUCache`.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::Record;
use lru::LruCache;
use tokio::net::UdpSocket;

use super::message::{age_ttls, min_ttl, DnsMessage};
use super::middleware::DnsMiddleware;
use crate::error::ResolverError;

const CACHE_CAPACITY: usize = 64_000;
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Fallback upstreams when config and `/etc/resolv.conf` both yield nothing,
/// matching `dns/google.py`'s hardcoded Google public DNS pair.
pub const DEFAULT_UPSTREAMS: [&str; 2] = ["8.8.8.8:53", "8.8.4.4:53"];

struct CachedAnswer {
    cached_at: Instant,
    records: Vec<Record>,
    rcode: ResponseCode,
}

pub struct Resolver {
    upstreams: Vec<SocketAddr>,
    cache: Mutex<LruCache<String, CachedAnswer>>,
}

impl Resolver {
    pub fn new(upstreams: Vec<SocketAddr>) -> Self {
        Self {
            upstreams,
            cache: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    fn from_cache(&self, key: &str, answer: &mut DnsMessage) -> bool {
        let mut cache = self.cache.lock().unwrap();
        let Some(cached) = cache.get(key) else {
            return false;
        };

        let elapsed = cached.cached_at.elapsed().as_secs() as u32;
        let expired = match min_ttl(&cached.records) {
            Some(ttl) => elapsed >= ttl,
            None => false,
        };
        if expired {
            return false;
        }

        let mut records = cached.records.clone();
        age_ttls(&mut records, elapsed);
        for record in records {
            answer.add_answer(record);
        }
        answer.set_rcode(cached.rcode);
        true
    }

    async fn query_upstream(&self, upstream: SocketAddr, query: &DnsMessage) -> Result<DnsMessage, ResolverError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|_| ResolverError::UpstreamFailure)?;
        socket
            .connect(upstream)
            .await
            .map_err(|_| ResolverError::UpstreamFailure)?;
        socket
            .send(&query.to_bytes())
            .await
            .map_err(|_| ResolverError::UpstreamFailure)?;

        let mut buf = [0u8; 512];
        let len = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| ResolverError::UpstreamFailure)?
            .map_err(|_| ResolverError::UpstreamFailure)?;

        DnsMessage::parse(&buf[..len]).map_err(|_| ResolverError::UpstreamFailure)
    }
}

#[async_trait]
impl DnsMiddleware for Resolver {
    async fn handle_dns_query(&self, query: &DnsMessage, answer: &mut DnsMessage) -> bool {
        let key = query.cache_key();
        if self.from_cache(&key, answer) {
            return true;
        }

        for &upstream in &self.upstreams {
            let Ok(reply) = self.query_upstream(upstream, query).await else {
                continue;
            };

            let answers = reply.answers().to_vec();
            let rcode = reply.rcode();

            if !answers.is_empty() && rcode == ResponseCode::NoError {
                self.cache.lock().unwrap().put(
                    key,
                    CachedAnswer { cached_at: Instant::now(), records: answers.clone(), rcode },
                );
            }

            for record in answers {
                answer.add_answer(record);
            }
            answer.set_rcode(rcode);
            return true;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_miss_on_empty_cache() {
        let resolver = Resolver::new(vec!["8.8.8.8:53".parse().unwrap()]);
        let mut answer = DnsMessage::parse(&build_query_bytes()).unwrap().reply();
        assert!(!resolver.from_cache("foo/1/1", &mut answer));
    }

    fn build_query_bytes() -> Vec<u8> {
        use hickory_proto::op::{Message, MessageType, Query};
        use hickory_proto::rr::RecordType;
        use hickory_proto::serialize::binary::BinEncodable;
        let mut msg = Message::new();
        msg.set_id(1);
        msg.set_message_type(MessageType::Query);
        msg.add_query(Query::query(super::super::message::parse_name("example.com"), RecordType::A));
        msg.to_bytes().unwrap()
    }
}
