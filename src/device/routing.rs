//! Allowed-IP table, longest prefix first

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::RwLock;

pub struct RoutingTable<P> {
    entries: RwLock<Vec<(IpNet, Arc<P>)>>,
}

impl<P> Default for RoutingTable<P> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<P> RoutingTable<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authorise `net` for `peer`, replacing any previous owner of that network
    pub fn insert(&self, net: IpNet, peer: Arc<P>) {
        let net = net.trunc();
        let mut entries = self.entries.write();
        entries.retain(|(existing, _)| *existing != net);
        entries.push((net, peer));
        entries.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
    }

    pub fn lookup(&self, addr: IpAddr) -> Option<Arc<P>> {
        self.entries
            .read()
            .iter()
            .find(|(net, _)| net.contains(&addr))
            .map(|(_, peer)| peer.clone())
    }

    pub fn remove_peer(&self, peer: &Arc<P>) {
        self.entries
            .write()
            .retain(|(_, owner)| !Arc::ptr_eq(owner, peer));
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        let table = RoutingTable::new();
        let wide = Arc::new("wide");
        let narrow = Arc::new("narrow");
        table.insert("0.0.0.0/0".parse().unwrap(), wide.clone());
        table.insert("10.1.0.0/16".parse().unwrap(), narrow.clone());

        let hit = table.lookup("10.1.2.3".parse().unwrap()).unwrap();
        assert!(Arc::ptr_eq(&hit, &narrow));
        let hit = table.lookup("192.0.2.1".parse().unwrap()).unwrap();
        assert!(Arc::ptr_eq(&hit, &wide));

        // An IPv4 default route does not cover IPv6
        assert!(table.lookup("2001:db8::1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_host_bits_are_masked_and_replaced() {
        let table = RoutingTable::new();
        let first = Arc::new("first");
        let second = Arc::new("second");
        table.insert("fd00::1/64".parse().unwrap(), first);
        table.insert("fd00::/64".parse().unwrap(), second.clone());

        assert_eq!(table.len(), 1);
        let hit = table.lookup("fd00::abcd".parse().unwrap()).unwrap();
        assert!(Arc::ptr_eq(&hit, &second));
    }

    #[test]
    fn test_remove_peer() {
        let table = RoutingTable::new();
        let peer = Arc::new("peer");
        table.insert("10.0.0.0/8".parse().unwrap(), peer.clone());
        table.remove_peer(&peer);
        assert!(table.is_empty());
    }
}
