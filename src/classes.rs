//! Peer classes: rate-limit and policy buckets.
//!
//! Every connection is assigned a set of class ids at construction. A
//! class carries one bandwidth bucket per channel plus policy flags; the
//! global class and the owning torrent's class always apply, and filters
//! may add more based on the remote address or the socket kind.

use std::net::IpAddr;
use std::sync::Arc;

use crate::bandwidth::{Bucket, Channel};

/// Index of a peer class in the session registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u16);

/// Socket kinds a class filter can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Tcp,
    Utp,
    TcpSsl,
}

/// A rate-limit class.
pub struct PeerClass {
    pub label: String,
    /// Upload and download buckets, indexed by [`Channel`].
    pub channels: [Arc<Bucket>; 2],
    /// Peers in this class do not consume unchoke slots and are never
    /// choked by the scheduler.
    pub ignore_unchoke_slots: bool,
    /// Percentage applied to the global connection limit for members of
    /// this class; 100 means no adjustment.
    pub connection_limit_factor: u16,
    /// Number of connections currently assigned to this class.
    refs: u32,
}

impl PeerClass {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            channels: [Bucket::new(0), Bucket::new(0)],
            ignore_unchoke_slots: false,
            connection_limit_factor: 100,
            refs: 0,
        }
    }

    pub fn bucket(&self, channel: Channel) -> Arc<Bucket> {
        Arc::clone(&self.channels[channel as usize])
    }
}

/// The session's class registry. Slot reuse is generation-free: a class
/// stays allocated while any connection references it, and `remove` only
/// frees slots with no remaining references.
pub struct ClassRegistry {
    classes: Vec<Option<PeerClass>>,
    /// The class every connection belongs to.
    pub global: ClassId,
}

impl ClassRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            classes: Vec::new(),
            global: ClassId(0),
        };
        registry.global = registry.add("global");
        registry
    }

    pub fn add(&mut self, label: &str) -> ClassId {
        if let Some(slot) = self.classes.iter().position(Option::is_none) {
            self.classes[slot] = Some(PeerClass::new(label));
            ClassId(slot as u16)
        } else {
            self.classes.push(Some(PeerClass::new(label)));
            ClassId((self.classes.len() - 1) as u16)
        }
    }

    pub fn get(&self, id: ClassId) -> Option<&PeerClass> {
        self.classes.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: ClassId) -> Option<&mut PeerClass> {
        self.classes.get_mut(id.0 as usize)?.as_mut()
    }

    /// Marks a class as referenced by one more connection.
    pub fn incref(&mut self, id: ClassId) {
        if let Some(class) = self.get_mut(id) {
            class.refs += 1;
        }
    }

    pub fn decref(&mut self, id: ClassId) {
        if let Some(class) = self.get_mut(id) {
            class.refs = class.refs.saturating_sub(1);
        }
    }

    /// Frees the slot if nothing references it; returns whether it was
    /// removed. The global class is never removed.
    pub fn remove(&mut self, id: ClassId) -> bool {
        if id == self.global {
            return false;
        }
        match self.classes.get_mut(id.0 as usize) {
            Some(slot) => match slot {
                Some(class) if class.refs == 0 => {
                    *slot = None;
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    pub fn set_rate(&mut self, id: ClassId, channel: Channel, rate: u64) {
        if let Some(class) = self.get(id) {
            class.channels[channel as usize].set_rate(rate);
        }
    }

    /// The effective connection-limit factor for a class set: the lowest
    /// factor among the classes, as a percentage.
    pub fn connection_limit_factor(&self, set: &[ClassId]) -> u16 {
        set.iter()
            .filter_map(|&id| self.get(id))
            .map(|c| c.connection_limit_factor)
            .min()
            .unwrap_or(100)
    }

    /// True if any class in the set opts out of unchoke accounting.
    pub fn ignores_unchoke_slots(&self, set: &[ClassId]) -> bool {
        set.iter()
            .filter_map(|&id| self.get(id))
            .any(|c| c.ignore_unchoke_slots)
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One rule of the per-address class filter.
#[derive(Debug, Clone)]
struct IpRule {
    first: IpAddr,
    last: IpAddr,
    class: ClassId,
}

/// Assigns extra classes by remote address range.
#[derive(Default)]
pub struct IpClassFilter {
    rules: Vec<IpRule>,
}

impl IpClassFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an inclusive address range rule. Mixed-family ranges are
    /// ignored at match time.
    pub fn add_rule(&mut self, first: IpAddr, last: IpAddr, class: ClassId) {
        self.rules.push(IpRule { first, last, class });
    }

    pub fn classes_for(&self, addr: IpAddr) -> Vec<ClassId> {
        self.rules
            .iter()
            .filter(|r| in_range(addr, r.first, r.last))
            .map(|r| r.class)
            .collect()
    }
}

fn in_range(addr: IpAddr, first: IpAddr, last: IpAddr) -> bool {
    match (addr, first, last) {
        (IpAddr::V4(a), IpAddr::V4(lo), IpAddr::V4(hi)) => a >= lo && a <= hi,
        (IpAddr::V6(a), IpAddr::V6(lo), IpAddr::V6(hi)) => a >= lo && a <= hi,
        _ => false,
    }
}

/// Assigns extra classes by socket kind.
#[derive(Default)]
pub struct TypeClassFilter {
    tcp: Vec<ClassId>,
    utp: Vec<ClassId>,
    ssl: Vec<ClassId>,
}

impl TypeClassFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: SocketKind, class: ClassId) {
        match kind {
            SocketKind::Tcp => self.tcp.push(class),
            SocketKind::Utp => self.utp.push(class),
            SocketKind::TcpSsl => self.ssl.push(class),
        }
    }

    pub fn classes_for(&self, kind: SocketKind) -> &[ClassId] {
        match kind {
            SocketKind::Tcp => &self.tcp,
            SocketKind::Utp => &self.utp,
            SocketKind::TcpSsl => &self.ssl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn registry_allocates_and_reuses_slots() {
        let mut reg = ClassRegistry::new();
        let a = reg.add("a");
        let b = reg.add("b");
        assert_ne!(a, b);
        assert!(reg.remove(a));
        let c = reg.add("c");
        assert_eq!(a, c); // freed slot reused
        assert!(!reg.remove(reg.global));
    }

    #[test]
    fn refcounted_classes_survive_remove() {
        let mut reg = ClassRegistry::new();
        let id = reg.add("limited");
        reg.incref(id);
        assert!(!reg.remove(id));
        reg.decref(id);
        assert!(reg.remove(id));
    }

    #[test]
    fn connection_limit_factor_takes_minimum() {
        let mut reg = ClassRegistry::new();
        let a = reg.add("a");
        let b = reg.add("b");
        reg.get_mut(a).unwrap().connection_limit_factor = 50;
        reg.get_mut(b).unwrap().connection_limit_factor = 80;
        assert_eq!(reg.connection_limit_factor(&[reg.global, a, b]), 50);
        assert_eq!(reg.connection_limit_factor(&[reg.global]), 100);
    }

    #[test]
    fn ip_filter_matches_ranges() {
        let mut reg = ClassRegistry::new();
        let local = reg.add("local");
        let mut filter = IpClassFilter::new();
        filter.add_rule(
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 0)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 255, 255)),
            local,
        );
        assert_eq!(
            filter.classes_for(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7))),
            vec![local]
        );
        assert!(filter
            .classes_for(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
            .is_empty());
    }

    #[test]
    fn type_filter_by_socket_kind() {
        let mut reg = ClassRegistry::new();
        let utp_class = reg.add("utp");
        let mut filter = TypeClassFilter::new();
        filter.add(SocketKind::Utp, utp_class);
        assert_eq!(filter.classes_for(SocketKind::Utp), &[utp_class]);
        assert!(filter.classes_for(SocketKind::Tcp).is_empty());
    }
}
