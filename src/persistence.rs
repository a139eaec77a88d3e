//! Optional on-disk offer/lease persistence (spec.md §3a).
//!
//! Grounded on `original_source/dhns/dhcp/memory_pool.py`'s
//! `shelve.open('%s-leases' % domain)` / `'%s-offers' % domain` — one
//! write-through KV file per pool, keyed by domain, holding the same
//! (address, options) tuples the pool keeps in memory. `sled` is the closest
//! real embedded-KV crate to Python's `shelve`; no teacher file covers this,
//! so the pick is recorded rather than assumed.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::error::StartupError;

/// A single offer or lease entry: the allocated address plus the raw
/// option bytes handed out with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub addr: Ipv4Addr,
    pub options: HashMap<u8, Vec<u8>>,
}

impl LeaseRecord {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.options.len() * 3);
        out.extend_from_slice(&self.addr.octets());
        for (code, value) in &self.options {
            out.push(*code);
            out.push(value.len() as u8);
            out.extend_from_slice(value);
        }
        out
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }
        let addr = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
        let mut options = HashMap::new();
        let mut i = 4usize;
        while i < buf.len() {
            let code = buf[i];
            let len = *buf.get(i + 1)? as usize;
            let start = i + 2;
            let end = start + len;
            options.insert(code, buf.get(start..end)?.to_vec());
            i = end;
        }
        Some(Self { addr, options })
    }
}

/// Write-through offer/lease maps backed by a `sled` tree each. Absent when
/// the pool has no `state_dir` configured, in which case the pool keeps
/// purely in-memory state, matching spec.md's "no persistent lease storage"
/// default.
pub struct LeaseStore {
    offers: sled::Tree,
    leases: sled::Tree,
}

impl LeaseStore {
    pub fn open(state_dir: &str, domain: &str) -> Result<Self, StartupError> {
        let path = format!("{state_dir}/{domain}");
        let db = sled::open(&path)
            .map_err(|e| StartupError::Config(format!("opening lease store {path}: {e}")))?;
        let offers = db
            .open_tree("offers")
            .map_err(|e| StartupError::Config(format!("opening offers tree: {e}")))?;
        let leases = db
            .open_tree("leases")
            .map_err(|e| StartupError::Config(format!("opening leases tree: {e}")))?;
        Ok(Self { offers, leases })
    }

    pub fn load_offers(&self) -> HashMap<String, LeaseRecord> {
        Self::load_tree(&self.offers)
    }

    pub fn load_leases(&self) -> HashMap<String, LeaseRecord> {
        Self::load_tree(&self.leases)
    }

    fn load_tree(tree: &sled::Tree) -> HashMap<String, LeaseRecord> {
        tree.iter()
            .filter_map(|entry| entry.ok())
            .filter_map(|(k, v)| {
                let key = String::from_utf8(k.to_vec()).ok()?;
                let record = LeaseRecord::decode(&v)?;
                Some((key, record))
            })
            .collect()
    }

    pub fn put_offer(&self, hwaddr: &str, record: &LeaseRecord) {
        let _ = self.offers.insert(hwaddr, record.encode());
    }

    pub fn remove_offer(&self, hwaddr: &str) {
        let _ = self.offers.remove(hwaddr);
    }

    pub fn put_lease(&self, hwaddr: &str, record: &LeaseRecord) {
        let _ = self.leases.insert(hwaddr, record.encode());
    }

    pub fn remove_lease(&self, hwaddr: &str) {
        let _ = self.leases.remove(hwaddr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_record_round_trips() {
        let mut options = HashMap::new();
        options.insert(12u8, b"node01".to_vec());
        let record = LeaseRecord { addr: Ipv4Addr::new(10, 3, 2, 20), options };
        let encoded = record.encode();
        let decoded = LeaseRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn store_persists_across_reopen() {
        let dir = tempdir();
        {
            let store = LeaseStore::open(&dir, "lxcnet").unwrap();
            let record = LeaseRecord { addr: Ipv4Addr::new(10, 3, 2, 2), options: HashMap::new() };
            store.put_lease("AABBCCDDEEFF", &record);
        }
        let store = LeaseStore::open(&dir, "lxcnet").unwrap();
        let leases = store.load_leases();
        assert_eq!(leases.get("AABBCCDDEEFF").unwrap().addr, Ipv4Addr::new(10, 3, 2, 2));
    }

    fn tempdir() -> String {
        let mut dir = std::env::temp_dir();
        dir.push(format!("dhns-test-{}", std::process::id()));
        dir.push(uuid::Uuid::new_v4().to_string());
        dir.to_string_lossy().into_owned()
    }
}
