//! Server assembly (spec.md §4.11, C13).
//!
//! Grounded on `original_source/dhns/__init__.py`'s `DhcpNameserver` —
//! builds the two middleware chains, wires the multiplexer around both
//! endpoints, and exposes `start`/`stop`. Pool instances serve both chains
//! (DHCP allocation and the DNS hostname hook) as the single component
//! spec.md §9 calls for, with no back-pointer between them.

use std::net::SocketAddr;
use std::sync::Arc;

use log::warn;

use crate::config::Config;
use crate::dhcp::endpoint::DhcpEndpoint;
use crate::dhcp::middleware::{DhcpMiddlewareChain, PRIORITY_NORMAL as DHCP_NORMAL};
use crate::dhcp::pool::Pool;
use crate::dns::docker::DockerRegistry;
use crate::dns::endpoint::DnsEndpoint;
use crate::dns::fixed::{FixedRecords, SuffixForwarder};
use crate::dns::middleware::{DnsMiddlewareChain, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_NORMAL};
use crate::dns::resolver::{Resolver, DEFAULT_UPSTREAMS};
use crate::dns::resolvconf;
use crate::error::StartupError;
use crate::mux::Mux;

pub struct DhnsServer {
    mux: Arc<Mux>,
    docker: Option<Arc<DockerRegistry>>,
}

impl DhnsServer {
    pub fn build(config: &Config, dhcp_port: u16, dns_port: u16) -> Result<Self, StartupError> {
        let mut dhcp_chain = DhcpMiddlewareChain::new();
        let mut dns_chain = DnsMiddlewareChain::new();

        for pool_cfg in &config.pool {
            let pool = Arc::new(Pool::new(pool_cfg)?);
            dhcp_chain.add(pool.clone(), DHCP_NORMAL);
            dns_chain.add(pool, PRIORITY_NORMAL);
        }

        if !config.dns.fixed_record.is_empty() {
            dns_chain.add(Arc::new(FixedRecords::new(&config.dns.fixed_record, dns_port)), PRIORITY_HIGH);
        }

        for suffix_cfg in &config.dns.suffix_forward {
            if let Some(forwarder) = SuffixForwarder::new(suffix_cfg) {
                dns_chain.add(Arc::new(forwarder), PRIORITY_NORMAL);
            } else {
                warn!("dns: invalid suffix-forward resolver address: {}", suffix_cfg.resolver);
            }
        }

        let docker = if config.dns.docker_socket.is_some() || config.dns.base_domain.is_some() {
            let registry = Arc::new(DockerRegistry::new());
            dns_chain.add(registry.clone(), PRIORITY_NORMAL);
            Some(registry)
        } else {
            None
        };

        let mut upstreams: Vec<SocketAddr> = config
            .dns
            .upstreams
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        if upstreams.is_empty() {
            upstreams = resolvconf::system_resolvers()
                .into_iter()
                .filter_map(|addr| format!("{addr}:53").parse().ok())
                .collect();
        }
        if upstreams.is_empty() {
            upstreams = DEFAULT_UPSTREAMS.iter().filter_map(|s| s.parse().ok()).collect();
        }
        dns_chain.add(Arc::new(Resolver::new(upstreams)), PRIORITY_LOW);

        let dhcp_chain = Arc::new(dhcp_chain);
        let dns_chain = Arc::new(dns_chain);

        let mut mux = Mux::new();
        mux.add(Arc::new(DhcpEndpoint::bind(dhcp_port, dhcp_chain)?));
        mux.add(Arc::new(DnsEndpoint::bind(dns_port, dns_chain)?));

        Ok(Self { mux: Arc::new(mux), docker })
    }

    pub async fn start(&self, docker_socket: Option<String>, docker_domain: String) {
        if let Some(registry) = &self.docker {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.run(docker_socket, docker_domain).await;
            });
        }
        self.mux.start().await;
    }

    pub fn stop(&self) {
        self.mux.stop();
    }
}
