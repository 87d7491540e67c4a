//! Port-mapping glue for NAT-PMP and UPnP.
//!
//! The device protocols live outside this crate; the engine talks to
//! them through [`PortMapper`]. What is kept here is the bookkeeping the
//! session needs: one mapping per (protocol, external port), deleting a
//! stale mapping before remapping when the listen port changes, and
//! surfacing results on the listen-socket state and as alerts.

use std::collections::HashMap;

use tracing::{debug, info};

/// Transport protocol of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapProtocol {
    Tcp,
    Udp,
}

/// Identifier a mapper hands back for an established mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingId(pub u32);

/// Result of an add-mapping attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapResult {
    /// The router granted the mapping on this external port.
    Mapped { external_port: u16 },
    /// The device refused or is absent.
    Failed,
}

/// The narrow interface a NAT-PMP or UPnP implementation provides.
pub trait PortMapper: Send {
    /// A short name for logs and alerts ("natpmp", "upnp").
    fn name(&self) -> &'static str;

    /// Requests `external_port` to be forwarded to `local_port`.
    fn add_mapping(
        &mut self,
        protocol: MapProtocol,
        external_port: u16,
        local_port: u16,
    ) -> (MappingId, MapResult);

    /// Releases an earlier mapping.
    fn delete_mapping(&mut self, id: MappingId);
}

/// A port-map outcome the engine converts into an alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortMapUpdate {
    Succeeded {
        mapper: &'static str,
        protocol: MapProtocol,
        external_port: u16,
    },
    Failed {
        mapper: &'static str,
        protocol: MapProtocol,
    },
}

struct ActiveMapping {
    id: MappingId,
    mapper_index: usize,
    external_port: u16,
}

/// Session-side mapping table over any number of mappers.
pub struct PortMapState {
    mappers: Vec<Box<dyn PortMapper>>,
    /// One mapping per (protocol, mapper).
    active: HashMap<(MapProtocol, usize), ActiveMapping>,
}

impl PortMapState {
    pub fn new() -> Self {
        Self {
            mappers: Vec::new(),
            active: HashMap::new(),
        }
    }

    pub fn add_mapper(&mut self, mapper: Box<dyn PortMapper>) {
        self.mappers.push(mapper);
    }

    pub fn has_mappers(&self) -> bool {
        !self.mappers.is_empty()
    }

    /// The external port currently mapped for `protocol`, if any mapper
    /// succeeded.
    pub fn external_port(&self, protocol: MapProtocol) -> Option<u16> {
        self.active
            .iter()
            .find(|((proto, _), _)| *proto == protocol)
            .map(|(_, m)| m.external_port)
    }

    /// (Re)maps `protocol` to `local_port` on every known mapper. Any
    /// prior mapping for the protocol is deleted first, so a port change
    /// never leaves two forwards behind.
    pub fn remap(
        &mut self,
        protocol: MapProtocol,
        local_port: u16,
    ) -> Vec<PortMapUpdate> {
        let mut updates = Vec::new();
        for index in 0..self.mappers.len() {
            if let Some(old) = self.active.remove(&(protocol, index)) {
                debug!(
                    mapper = self.mappers[index].name(),
                    port = old.external_port,
                    "deleting stale mapping"
                );
                self.mappers[index].delete_mapping(old.id);
            }
            let (id, result) = self.mappers[index].add_mapping(protocol, local_port, local_port);
            let name = self.mappers[index].name();
            match result {
                MapResult::Mapped { external_port } => {
                    info!(mapper = name, external_port, "port mapped");
                    self.active.insert(
                        (protocol, index),
                        ActiveMapping {
                            id,
                            mapper_index: index,
                            external_port,
                        },
                    );
                    updates.push(PortMapUpdate::Succeeded {
                        mapper: name,
                        protocol,
                        external_port,
                    });
                }
                MapResult::Failed => {
                    updates.push(PortMapUpdate::Failed {
                        mapper: name,
                        protocol,
                    });
                }
            }
        }
        updates
    }

    /// Deletes every active mapping (session shutdown).
    pub fn clear(&mut self) {
        let active = std::mem::take(&mut self.active);
        for (_, mapping) in active {
            if let Some(mapper) = self.mappers.get_mut(mapping.mapper_index) {
                mapper.delete_mapping(mapping.id);
            }
        }
    }
}

impl Default for PortMapState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FakeMapper {
        grants: bool,
        next_id: u32,
        added: Arc<AtomicU32>,
        deleted: Arc<AtomicU32>,
    }

    impl PortMapper for FakeMapper {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn add_mapping(
            &mut self,
            _protocol: MapProtocol,
            external_port: u16,
            _local_port: u16,
        ) -> (MappingId, MapResult) {
            self.added.fetch_add(1, Ordering::Relaxed);
            self.next_id += 1;
            if self.grants {
                (MappingId(self.next_id), MapResult::Mapped { external_port })
            } else {
                (MappingId(self.next_id), MapResult::Failed)
            }
        }

        fn delete_mapping(&mut self, _id: MappingId) {
            self.deleted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn fake(grants: bool) -> (Box<FakeMapper>, Arc<AtomicU32>, Arc<AtomicU32>) {
        let added = Arc::new(AtomicU32::new(0));
        let deleted = Arc::new(AtomicU32::new(0));
        (
            Box::new(FakeMapper {
                grants,
                next_id: 0,
                added: Arc::clone(&added),
                deleted: Arc::clone(&deleted),
            }),
            added,
            deleted,
        )
    }

    #[test]
    fn successful_map_reports_external_port() {
        let mut state = PortMapState::new();
        let (mapper, _, _) = fake(true);
        state.add_mapper(mapper);

        let updates = state.remap(MapProtocol::Tcp, 6881);
        assert_eq!(
            updates,
            vec![PortMapUpdate::Succeeded {
                mapper: "fake",
                protocol: MapProtocol::Tcp,
                external_port: 6881,
            }]
        );
        assert_eq!(state.external_port(MapProtocol::Tcp), Some(6881));
        assert_eq!(state.external_port(MapProtocol::Udp), None);
    }

    #[test]
    fn remap_deletes_prior_mapping_first() {
        let mut state = PortMapState::new();
        let (mapper, added, deleted) = fake(true);
        state.add_mapper(mapper);

        state.remap(MapProtocol::Tcp, 6881);
        state.remap(MapProtocol::Tcp, 6999);

        assert_eq!(added.load(Ordering::Relaxed), 2);
        assert_eq!(deleted.load(Ordering::Relaxed), 1);
        assert_eq!(state.external_port(MapProtocol::Tcp), Some(6999));
    }

    #[test]
    fn failed_map_reports_failure() {
        let mut state = PortMapState::new();
        let (mapper, _, _) = fake(false);
        state.add_mapper(mapper);

        let updates = state.remap(MapProtocol::Udp, 6881);
        assert_eq!(
            updates,
            vec![PortMapUpdate::Failed {
                mapper: "fake",
                protocol: MapProtocol::Udp,
            }]
        );
        assert_eq!(state.external_port(MapProtocol::Udp), None);
    }

    #[test]
    fn clear_deletes_everything() {
        let mut state = PortMapState::new();
        let (mapper, _, deleted) = fake(true);
        state.add_mapper(mapper);
        state.remap(MapProtocol::Tcp, 6881);
        state.remap(MapProtocol::Udp, 6881);
        state.clear();
        assert_eq!(deleted.load(Ordering::Relaxed), 2);
        assert_eq!(state.external_port(MapProtocol::Tcp), None);
    }
}
