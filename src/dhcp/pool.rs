//! Address pool & lease manager (spec.md §4.6, C8) — the component that
//! claims DHCP packets arriving on its own interface and also answers the
//! DNS-side hostname→IP lookup for its domain.
//!
//! Grounded on `original_source/dhns/dhcp/memory_pool.py`'s `MemoryPool`,
//! followed closely for allocation order, option precedence, and lifecycle;
//! the REDESIGN-FLAGGED pool-size bug from spec.md §9 is fixed rather than
//! replicated.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;
use log::{info, warn};

use crate::config::PoolConfig;
use crate::dhcp::message_type::{
    MessageType, OPT_BROADCAST, OPT_DOMAIN_NAME, OPT_HOSTNAME, OPT_LEASE_TIME, OPT_MESSAGE_TYPE,
    OPT_NAME_SERVERS, OPT_REQUESTED_IP, OPT_ROUTER, OPT_SERVER_ID, OPT_SUBNET_MASK,
};
use crate::dhcp::middleware::DhcpMiddleware;
use crate::dhcp::packet::Packet;
use crate::dns::message::{a_record, DnsMessage};
use crate::dns::middleware::DnsMiddleware;
use crate::error::{PoolError, StartupError};
use crate::persistence::{LeaseRecord, LeaseStore};

const DEFAULT_LEASE_TIME: u32 = 3600;

struct Reservation {
    address: Option<Ipv4Addr>,
    hostname: Option<String>,
    options: HashMap<u8, Vec<u8>>,
}

#[derive(Default)]
struct PoolState {
    offers: HashMap<String, LeaseRecord>,
    leases: HashMap<String, LeaseRecord>,
}

pub struct Pool {
    address: Ipv4Addr,
    netmask: Ipv4Addr,
    broadcast: Ipv4Addr,
    gateway: Option<Ipv4Addr>,
    nameservers: Vec<Ipv4Addr>,
    domain: Option<String>,
    reserved: HashMap<String, Reservation>,
    reserved_addrs: HashSet<Ipv4Addr>,
    state: Mutex<PoolState>,
    store: Option<LeaseStore>,
}

impl Pool {
    pub fn new(cfg: &PoolConfig) -> Result<Self, StartupError> {
        let address = cfg.address;
        let netmask = cfg.netmask;
        let broadcast = Ipv4Addr::from(u32::from(address) | !u32::from(netmask));

        let mut reserved = HashMap::new();
        let mut reserved_addrs = HashSet::new();
        for r in &cfg.reservation {
            let key = r.hwaddr.to_ascii_uppercase();
            if let Some(addr) = r.address {
                reserved_addrs.insert(addr);
            }
            reserved.insert(
                key,
                Reservation {
                    address: r.address,
                    hostname: r.hostname.clone(),
                    options: r.options.clone(),
                },
            );
        }

        let store = match (&cfg.state_dir, &cfg.domain) {
            (Some(dir), Some(domain)) => Some(LeaseStore::open(dir, domain)?),
            _ => None,
        };

        let mut state = PoolState::default();
        if let Some(store) = &store {
            state.offers = store.load_offers();
            state.leases = store.load_leases();
        }

        Ok(Self {
            address,
            netmask,
            broadcast,
            gateway: cfg.gateway,
            nameservers: cfg.nameservers.clone(),
            domain: cfg.domain.clone(),
            reserved,
            reserved_addrs,
            state: Mutex::new(state),
            store,
        })
    }

    fn allocate(&self, state: &PoolState, hwaddr: &str) -> Result<Ipv4Addr, PoolError> {
        if let Some(addr) = self.reserved.get(hwaddr).and_then(|r| r.address) {
            return Ok(addr);
        }

        let start = u32::from(self.address) + 1;
        let end = u32::from(self.broadcast).saturating_sub(1);
        for candidate_u32 in start..end {
            let candidate = Ipv4Addr::from(candidate_u32);
            if candidate == self.address {
                continue;
            }
            if state.offers.values().any(|r| r.addr == candidate) {
                continue;
            }
            if state.leases.values().any(|r| r.addr == candidate) {
                continue;
            }
            if self.reserved_addrs.contains(&candidate) {
                continue;
            }
            return Ok(candidate);
        }

        Err(PoolError::PoolExhausted)
    }

    fn requested_address(query: &Packet) -> Option<Ipv4Addr> {
        let bytes = query.options.get(&OPT_REQUESTED_IP)?;
        if bytes.len() != 4 {
            return None;
        }
        Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
    }

    fn addr_in_network(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & u32::from(self.netmask) == u32::from(self.address) & u32::from(self.netmask)
    }

    /// Picks the address to offer/lease: the client's requested address if
    /// it's free and in-network, else the prior offer's address, else a
    /// fresh allocation.
    fn resolve_address(
        &self,
        state: &PoolState,
        hwaddr: &str,
        requested: Option<Ipv4Addr>,
        prior_offer: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr, PoolError> {
        match requested.or(prior_offer) {
            None => self.allocate(state, hwaddr),
            Some(addr) => {
                let taken = state.offers.values().any(|r| r.addr == addr)
                    || state.leases.values().any(|r| r.addr == addr);
                if taken || !self.addr_in_network(addr) {
                    self.allocate(state, hwaddr)
                } else {
                    Ok(addr)
                }
            }
        }
    }

    fn build_options(&self, hwaddr: &str, query: &Packet) -> HashMap<u8, Vec<u8>> {
        let mut options = HashMap::new();
        options.insert(OPT_SUBNET_MASK, self.netmask.octets().to_vec());
        options.insert(OPT_BROADCAST, self.broadcast.octets().to_vec());
        options.insert(OPT_LEASE_TIME, DEFAULT_LEASE_TIME.to_be_bytes().to_vec());
        if let Some(domain) = &self.domain {
            options.insert(OPT_DOMAIN_NAME, domain.as_bytes().to_vec());
        }
        if let Some(gateway) = self.gateway {
            options.insert(OPT_ROUTER, gateway.octets().to_vec());
        }
        if !self.nameservers.is_empty() {
            let mut buf = Vec::with_capacity(self.nameservers.len() * 4);
            for ns in &self.nameservers {
                buf.extend_from_slice(&ns.octets());
            }
            options.insert(OPT_NAME_SERVERS, buf);
        }

        if let Some(reservation) = self.reserved.get(hwaddr) {
            for (code, value) in &reservation.options {
                options.insert(*code, value.clone());
            }
        }

        let hostname = self
            .reserved
            .get(hwaddr)
            .and_then(|r| r.hostname.clone())
            .map(|h| h.into_bytes())
            .or_else(|| query.options.get(&OPT_HOSTNAME).cloned())
            .unwrap_or_else(|| hwaddr.as_bytes().to_vec());
        options.insert(OPT_HOSTNAME, hostname);

        options
    }

    fn handle_discover(&self, query: &Packet, answer: &mut Packet) {
        let hwaddr = query.hardware_address().canonical_key();
        let mut state = self.state.lock().unwrap();
        state.leases.remove(&hwaddr);
        let prior_offer = state.offers.remove(&hwaddr);

        let requested = Self::requested_address(query);
        let addr = match self.resolve_address(&state, &hwaddr, requested, prior_offer.as_ref().map(|o| o.addr)) {
            Ok(addr) => addr,
            Err(_) => {
                info!("dhcp: pool exhausted for discover from {hwaddr}");
                return;
            }
        };

        let options = self.build_options(&hwaddr, query);
        let record = LeaseRecord { addr, options: options.clone() };
        if let Some(store) = &self.store {
            store.put_offer(&hwaddr, &record);
        }
        state.offers.insert(hwaddr.clone(), record);
        drop(state);

        info!("dhcp: discover - {hwaddr}");
        answer.options.insert(OPT_MESSAGE_TYPE, vec![MessageType::Offer.to_u8()]);
        answer.yiaddr = addr;
        answer.options.extend(options);
    }

    fn handle_request(&self, query: &Packet, answer: &mut Packet) {
        let hwaddr = query.hardware_address().canonical_key();
        let mut state = self.state.lock().unwrap();
        state.leases.remove(&hwaddr);
        let offer = state.offers.remove(&hwaddr);

        let (addr, options) = if let Some(offer) = offer {
            (offer.addr, offer.options)
        } else {
            let requested = Self::requested_address(query);
            let addr = match self.resolve_address(&state, &hwaddr, requested, None) {
                Ok(addr) => addr,
                Err(_) => {
                    info!("dhcp: pool exhausted for request from {hwaddr}");
                    return;
                }
            };
            (addr, self.build_options(&hwaddr, query))
        };

        let record = LeaseRecord { addr, options: options.clone() };
        if let Some(store) = &self.store {
            store.remove_offer(&hwaddr);
            store.put_lease(&hwaddr, &record);
        }
        state.leases.insert(hwaddr.clone(), record);
        drop(state);

        info!("dhcp: request - {hwaddr}");
        // The source always sends DHCPACK, even for a bare request with no
        // prior offer; see spec.md §9 on not replicating a stricter NAK here.
        answer.options.insert(OPT_MESSAGE_TYPE, vec![MessageType::Ack.to_u8()]);
        answer.yiaddr = addr;
        answer.options.extend(options);
    }

    fn handle_decline(&self, query: &Packet, answer: &mut Packet) {
        let hwaddr = query.hardware_address().canonical_key();
        self.clear_client(&hwaddr);
        info!("dhcp: decline - {hwaddr}");
        // Matches the source: DHCPACK here, not DHCPNAK (flagged, not fixed).
        answer.options.insert(OPT_MESSAGE_TYPE, vec![MessageType::Ack.to_u8()]);
    }

    fn handle_release(&self, query: &Packet, answer: &mut Packet) {
        let hwaddr = query.hardware_address().canonical_key();
        self.clear_client(&hwaddr);
        info!("dhcp: release - {hwaddr}");
        answer.options.insert(OPT_MESSAGE_TYPE, vec![MessageType::Ack.to_u8()]);
    }

    fn clear_client(&self, hwaddr: &str) {
        let mut state = self.state.lock().unwrap();
        state.offers.remove(hwaddr);
        state.leases.remove(hwaddr);
        if let Some(store) = &self.store {
            store.remove_offer(hwaddr);
            store.remove_lease(hwaddr);
        }
    }

    /// Linear scan of leases for a client whose hostname option matches, for
    /// the DNS-side hook (spec.md §4.6/§9: cyclic hostname↔pool coupling
    /// expressed as two capability methods on one component, no back-pointer).
    fn get_hostname_ip(&self, hostname: &str) -> Option<Ipv4Addr> {
        let state = self.state.lock().unwrap();
        state
            .leases
            .values()
            .find(|r| r.options.get(&OPT_HOSTNAME).map(|h| h.as_slice()) == Some(hostname.as_bytes()))
            .map(|r| r.addr)
    }
}

#[async_trait]
impl DhcpMiddleware for Pool {
    async fn handle_dhcp_packet(&self, interface: Ipv4Addr, query: &Packet, answer: &mut Packet) -> bool {
        if interface != self.address {
            return false;
        }

        answer.options.insert(OPT_SERVER_ID, self.address.octets().to_vec());

        match query.message_type_byte().and_then(MessageType::from_u8) {
            Some(MessageType::Discover) => self.handle_discover(query, answer),
            Some(MessageType::Request) => self.handle_request(query, answer),
            Some(MessageType::Decline) => self.handle_decline(query, answer),
            Some(MessageType::Release) => self.handle_release(query, answer),
            _ => warn!("dhcp: {}", PoolError::UnsupportedMessageType),
        }

        true
    }

    fn broadcast_addr(&self) -> Option<Ipv4Addr> {
        Some(self.broadcast)
    }
}

#[async_trait]
impl DnsMiddleware for Pool {
    async fn handle_dns_query(&self, query: &DnsMessage, answer: &mut DnsMessage) -> bool {
        let domain = match &self.domain {
            Some(d) => d,
            None => return false,
        };

        let qname = query.qname();
        let remainder = if qname == *domain {
            Some(String::new())
        } else {
            qname.strip_suffix(&format!(".{domain}")).map(str::to_owned)
        };

        let Some(remainder) = remainder else {
            return false;
        };

        if !remainder.is_empty() && query.is_a_or_any() {
            let hostname = remainder.split('.').next_back().unwrap_or(&remainder);
            if let Some(ip) = self.get_hostname_ip(hostname) {
                answer.add_answer(a_record(&qname, DEFAULT_LEASE_TIME, ip));
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReservationConfig;
    use crate::dhcp::hwaddr::HardwareAddress;
    use std::collections::HashMap as Map;

    fn pool_config() -> PoolConfig {
        PoolConfig {
            address: Ipv4Addr::new(10, 3, 2, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: None,
            nameservers: vec![],
            domain: Some("lxcnet".to_string()),
            reservation: vec![ReservationConfig {
                hwaddr: "5254009FCCD0".to_string(),
                address: Some(Ipv4Addr::new(10, 3, 2, 20)),
                hostname: Some("node01".to_string()),
                options: Map::new(),
            }],
            state_dir: None,
        }
    }

    fn discover_packet(mac: [u8; 6]) -> Packet {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);
        let mut options = Map::new();
        options.insert(OPT_MESSAGE_TYPE, vec![MessageType::Discover.to_u8()]);
        Packet {
            op: crate::dhcp::packet::BOOTREQUEST,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: 1,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn discover_then_request_assigns_same_address() {
        let pool = Pool::new(&pool_config()).unwrap();
        let discover = discover_packet([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let mut offer = discover.reply();
        assert!(pool.handle_dhcp_packet(Ipv4Addr::new(10, 3, 2, 1), &discover, &mut offer).await);
        assert_eq!(offer.options.get(&OPT_MESSAGE_TYPE), Some(&vec![MessageType::Offer.to_u8()]));
        let offered_addr = offer.yiaddr;

        let mut request = discover.clone();
        request
            .options
            .insert(OPT_MESSAGE_TYPE, vec![MessageType::Request.to_u8()]);
        let mut ack = request.reply();
        assert!(pool.handle_dhcp_packet(Ipv4Addr::new(10, 3, 2, 1), &request, &mut ack).await);
        assert_eq!(ack.options.get(&OPT_MESSAGE_TYPE), Some(&vec![MessageType::Ack.to_u8()]));
        assert_eq!(ack.yiaddr, offered_addr);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reserved_client_bypasses_allocation() {
        let pool = Pool::new(&pool_config()).unwrap();
        let hw = HardwareAddress::new(
            { let mut raw = [0u8; 16]; raw[..6].copy_from_slice(&[0x52, 0x54, 0x00, 0x9F, 0xCC, 0xD0]); raw },
            6,
        );
        assert_eq!(hw.canonical_key(), "5254009FCCD0");

        let discover = discover_packet([0x52, 0x54, 0x00, 0x9F, 0xCC, 0xD0]);
        let mut offer = discover.reply();
        pool.handle_dhcp_packet(Ipv4Addr::new(10, 3, 2, 1), &discover, &mut offer).await;
        assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 3, 2, 20));
        assert_eq!(offer.options.get(&OPT_HOSTNAME), Some(&b"node01".to_vec()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requested_address_outside_network_is_ignored() {
        let pool = Pool::new(&pool_config()).unwrap();
        let mut discover = discover_packet([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        discover.options.insert(OPT_REQUESTED_IP, vec![192, 168, 0, 5]);
        let mut offer = discover.reply();
        pool.handle_dhcp_packet(Ipv4Addr::new(10, 3, 2, 1), &discover, &mut offer).await;
        assert!(pool.addr_in_network(offer.yiaddr));
        assert_ne!(offer.yiaddr, Ipv4Addr::new(192, 168, 0, 5));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wrong_interface_does_not_claim() {
        let pool = Pool::new(&pool_config()).unwrap();
        let discover = discover_packet([0, 1, 2, 3, 4, 5]);
        let mut offer = discover.reply();
        let claimed = pool.handle_dhcp_packet(Ipv4Addr::new(10, 9, 9, 1), &discover, &mut offer).await;
        assert!(!claimed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hostname_lookup_resolves_after_lease() {
        let pool = Pool::new(&pool_config()).unwrap();
        let discover = discover_packet([1, 2, 3, 4, 5, 6]);
        let mut offer = discover.reply();
        pool.handle_dhcp_packet(Ipv4Addr::new(10, 3, 2, 1), &discover, &mut offer).await;
        let mut request = discover.clone();
        request.options.insert(OPT_MESSAGE_TYPE, vec![MessageType::Request.to_u8()]);
        let mut ack = request.reply();
        pool.handle_dhcp_packet(Ipv4Addr::new(10, 3, 2, 1), &request, &mut ack).await;

        let hwaddr = request.hardware_address().canonical_key();
        let resolved = pool.get_hostname_ip(&hwaddr);
        assert_eq!(resolved, Some(ack.yiaddr));
    }
}
