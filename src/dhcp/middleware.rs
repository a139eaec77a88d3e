//! Priority-ordered DHCP middleware chain (spec.md §4.5/C6).
//!
//! Grounded on `original_source/dhns/dhcp/__init__.py`'s `Handler`:
//! `add_middleware` appends and re-sorts descending by priority,
//! `handle` walks the list and stops at the first handler that claims the
//! packet.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;

use super::packet::Packet;

pub const PRIORITY_HIGH: i32 = 100;
pub const PRIORITY_NORMAL: i32 = 50;
pub const PRIORITY_LOW: i32 = 0;

#[async_trait]
pub trait DhcpMiddleware: Send + Sync {
    /// Returns `true` to claim the query (dispatch stops here), `false` to
    /// pass to the next handler.
    async fn handle_dhcp_packet(&self, interface: Ipv4Addr, query: &Packet, answer: &mut Packet) -> bool;

    /// The broadcast address this middleware's pool serves, if any. The
    /// endpoint needs this from the *claiming* handler to route broadcast
    /// replies (spec.md §4.2); only the address pool overrides it.
    fn broadcast_addr(&self) -> Option<Ipv4Addr> {
        None
    }
}

pub struct DhcpMiddlewareChain {
    handlers: Vec<(Arc<dyn DhcpMiddleware>, i32)>,
}

impl Default for DhcpMiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

impl DhcpMiddlewareChain {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn add(&mut self, handler: Arc<dyn DhcpMiddleware>, priority: i32) {
        self.handlers.push((handler, priority));
        self.handlers.sort_by(|a, b| b.1.cmp(&a.1));
    }

    /// Builds the reply skeleton and walks the chain. Returns the answer
    /// and the claiming handler, or `None` if nothing claimed it (the
    /// endpoint then drops the packet silently).
    pub async fn dispatch(
        &self,
        interface: Ipv4Addr,
        query: &Packet,
    ) -> (Packet, Option<Arc<dyn DhcpMiddleware>>) {
        let mut answer = query.reply();
        for (handler, _priority) in &self.handlers {
            if handler.handle_dhcp_packet(interface, query, &mut answer).await {
                return (answer, Some(handler.clone()));
            }
        }
        (answer, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysClaim(bool);

    #[async_trait]
    impl DhcpMiddleware for AlwaysClaim {
        async fn handle_dhcp_packet(&self, _i: Ipv4Addr, _q: &Packet, _a: &mut Packet) -> bool {
            self.0
        }
    }

    fn blank_query() -> Packet {
        Packet {
            op: super::super::packet::BOOTREQUEST,
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
            chaddr: [0u8; 16],
            sname: [0u8; 64],
            file: [0u8; 128],
            options: Default::default(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_claimant_wins_and_stops_dispatch() {
        let mut chain = DhcpMiddlewareChain::new();
        chain.add(Arc::new(AlwaysClaim(false)), PRIORITY_HIGH);
        chain.add(Arc::new(AlwaysClaim(true)), PRIORITY_NORMAL);
        chain.add(Arc::new(AlwaysClaim(true)), PRIORITY_LOW);

        let (_answer, claimant) = chain.dispatch(Ipv4Addr::UNSPECIFIED, &blank_query()).await;
        assert!(claimant.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn no_claimant_returns_none() {
        let mut chain = DhcpMiddlewareChain::new();
        chain.add(Arc::new(AlwaysClaim(false)), PRIORITY_NORMAL);

        let (_answer, claimant) = chain.dispatch(Ipv4Addr::UNSPECIFIED, &blank_query()).await;
        assert!(claimant.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn higher_priority_runs_first() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        struct Recording(Arc<AtomicUsize>, usize, bool);
        #[async_trait]
        impl DhcpMiddleware for Recording {
            async fn handle_dhcp_packet(&self, _i: Ipv4Addr, _q: &Packet, _a: &mut Packet) -> bool {
                self.0.store(self.1, Ordering::SeqCst);
                self.2
            }
        }
        let order = Arc::new(AtomicUsize::new(0));
        let mut chain = DhcpMiddlewareChain::new();
        chain.add(Arc::new(Recording(order.clone(), 1, false)), PRIORITY_LOW);
        chain.add(Arc::new(Recording(order.clone(), 2, true)), PRIORITY_HIGH);

        chain.dispatch(Ipv4Addr::UNSPECIFIED, &blank_query()).await;
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }
}
