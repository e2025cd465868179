//! Bank node loader
//!
//! Reads a sequence of size-prefixed node parameter blocks and populates the
//! hierarchy. Every node is parsed and registered first; parent links, bus
//! routing and duck targets are wired in a second pass so blocks may appear
//! in any order. A malformed or duplicate node aborts only itself.
//!
//! ```text
//! +------------------------------------------------+
//! | u32 block size                                 |
//! +------------------------------------------------+
//! | u32 id | u8 category | u32 parent | u32 bus    |  0 = none
//! | u8 n   | n × (u8 prop, f32 value, u8 override) |
//! | u16 max instances | u8 kill policy | u8 flags  |  flags: 1 virtual, 2 per object
//! +------------------------------------------------+
//! | Sound      u16 company | u16 plugin | u8 source type | u16 loops
//! |            u16 channels | u32 samples | f32 × samples
//! | Container  u8 kind | u8 continuous | u8 transition | f32 ms
//! |            u16 loops | u32 switch group | u8 n × (u32 switch, u32 child)
//! | Bus        f32 recovery ms | u8 n × u32 fx
//! |            u8 n × (u32 target, f32 db, f32 in ms, f32 out ms, u8 curve, u8 scope)
//! +------------------------------------------------+
//! ```

use vox_core::{BankReader, FadeCurve, KillPolicy, NodeId, VoxError, VoxResult};

use crate::bus::{BusData, DuckScope, DuckTarget};
use crate::containers::{ContainerData, ContainerKind, ContinuousTransition};
use crate::hierarchy::Hierarchy;
use crate::lower::codec::{CodecId, MediaData, SourceType};
use crate::node::{InstanceLimit, Node, NodeCategory, SoundData};
use crate::props::PropId;

const FLAG_VIRTUAL: u8 = 1;
const FLAG_PER_GAME_OBJECT: u8 = 2;

/// A node that failed to load
#[derive(Debug)]
pub struct LoadFailure {
    /// `None` when the block was too damaged to read the id
    pub node: Option<NodeId>,
    pub error: VoxError,
}

/// Outcome of one load call
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<NodeId>,
    pub failed: Vec<LoadFailure>,
}

impl LoadReport {
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail(&mut self, node: Option<NodeId>, error: VoxError) {
        match node {
            Some(id) => log::error!("Bank node {} not loaded: {}", id, error),
            None => log::error!("Bank block not loaded: {}", error),
        }
        self.failed.push(LoadFailure { node, error });
    }
}

/// Links resolved after every node exists
#[derive(Debug, Default)]
struct PendingLinks {
    node: NodeId,
    parent: Option<NodeId>,
    output_bus: Option<NodeId>,
    ducks: Vec<DuckTarget>,
}

pub struct HierarchyLoader;

impl HierarchyLoader {
    /// Load every node block in `bytes` into `hierarchy`
    pub fn load_nodes(hierarchy: &mut Hierarchy, bytes: &[u8]) -> LoadReport {
        let mut report = LoadReport::default();
        let mut links = Vec::new();
        let mut reader = BankReader::new(bytes);

        while !reader.is_empty() {
            let mut block = match reader.read_block() {
                Ok(block) => block,
                Err(e) => {
                    report.fail(None, e);
                    break;
                }
            };
            let id = block.read::<u32>().ok().map(NodeId);
            let parsed = id
                .ok_or(VoxError::BankDataTruncated {
                    needed: 4,
                    remaining: 0,
                })
                .and_then(|id| read_node(id, &mut block))
                .and_then(|(node, link)| {
                    block.expect_consumed()?;
                    Ok((node, link))
                });
            match parsed {
                Ok((node, link)) => match hierarchy.add_node(node) {
                    Ok(()) => {
                        report.loaded.push(link.node);
                        links.push(link);
                    }
                    Err(e) => report.fail(id, e),
                },
                Err(e) => report.fail(id, e),
            }
        }

        for link in links {
            if let Err(e) = Self::link(hierarchy, &link) {
                report.loaded.retain(|n| *n != link.node);
                hierarchy.release(link.node);
                report.fail(Some(link.node), e);
            }
        }

        log::debug!(
            "Loaded {} nodes ({} failed)",
            report.loaded.len(),
            report.failed.len()
        );
        report
    }

    fn link(hierarchy: &mut Hierarchy, link: &PendingLinks) -> VoxResult<()> {
        if let Some(parent) = link.parent {
            hierarchy.add_child(parent, link.node)?;
        }
        if let Some(bus) = link.output_bus {
            hierarchy.set_output_bus(link.node, Some(bus))?;
        }
        for duck in &link.ducks {
            hierarchy.add_duck_target(link.node, *duck)?;
        }
        Ok(())
    }
}

fn optional_id(raw: u32) -> Option<NodeId> {
    (raw != 0).then_some(NodeId(raw))
}

fn read_node(id: NodeId, r: &mut BankReader<'_>) -> VoxResult<(Node, PendingLinks)> {
    let category = NodeCategory::from_index(r.read::<u8>()?)
        .ok_or_else(|| VoxError::InvalidConfig(format!("{}: unknown node category", id)))?;
    let mut link = PendingLinks {
        node: id,
        parent: optional_id(r.read::<u32>()?),
        output_bus: optional_id(r.read::<u32>()?),
        ducks: Vec::new(),
    };

    let prop_count = r.read::<u8>()?;
    let mut props = Vec::with_capacity(prop_count as usize);
    for _ in 0..prop_count {
        let prop = PropId::from_index(r.read::<u8>()?)
            .ok_or_else(|| VoxError::InvalidConfig(format!("{}: unknown property", id)))?;
        let value = r.read::<f32>()?;
        let overridden = r.read_bool()?;
        props.push((prop, value, overridden));
    }

    let max_instances = r.read::<u16>()?;
    let policy = match r.read::<u8>()? {
        1 => KillPolicy::KillNewest,
        _ => KillPolicy::KillOldest,
    };
    let flags = r.read::<u8>()?;

    let mut node = match category {
        NodeCategory::Sound => Node::sound(id, read_sound(r)?),
        NodeCategory::Container => Node::container(id, read_container(r)?),
        NodeCategory::Bus | NodeCategory::AuxBus => {
            let (bus, ducks) = read_bus(r)?;
            link.ducks = ducks;
            if category == NodeCategory::Bus {
                Node::bus(id, bus)
            } else {
                Node::aux_bus(id, bus)
            }
        }
    };

    for (prop, value, overridden) in props {
        node = if overridden {
            node.with_override(prop, value)
        } else {
            node.with_prop(prop, value)
        };
    }
    if max_instances > 0 {
        let mut limit = InstanceLimit::new(max_instances)
            .with_policy(policy)
            .with_virtual(flags & FLAG_VIRTUAL != 0);
        if flags & FLAG_PER_GAME_OBJECT != 0 {
            limit = limit.per_game_object();
        }
        node = node.with_limit(limit);
    }
    Ok((node, link))
}

fn read_sound(r: &mut BankReader<'_>) -> VoxResult<SoundData> {
    let codec = CodecId::new(r.read::<u16>()?, r.read::<u16>()?);
    let source_type = SourceType::from_index(r.read::<u8>()?);
    let loop_count = r.read::<u16>()?;
    let channels = r.read::<u16>()?;
    let count = r.read::<u32>()? as usize;
    if count > r.remaining() / 4 {
        return Err(VoxError::BankDataTruncated {
            needed: count * 4,
            remaining: r.remaining(),
        });
    }
    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        samples.push(r.read::<f32>()?);
    }
    let sound = if count == 0 {
        SoundData::unloaded(codec)
    } else {
        SoundData::new(MediaData::new(samples, channels)).with_codec(codec)
    };
    Ok(sound
        .with_source_type(source_type)
        .with_loop_count(loop_count))
}

fn read_container(r: &mut BankReader<'_>) -> VoxResult<ContainerData> {
    let kind = ContainerKind::from_index(r.read::<u8>()?)
        .ok_or_else(|| VoxError::InvalidConfig("unknown container kind".into()))?;
    let continuous = r.read_bool()?;
    let transition = ContinuousTransition::from_index(r.read::<u8>()?);
    let transition_ms = r.read::<f32>()?;
    let loop_count = r.read::<u16>()?;
    let switch_group = r.read::<u32>()?;

    let mut data = match kind {
        ContainerKind::Random => ContainerData::random(),
        ContainerKind::Sequence => ContainerData::sequence(),
        ContainerKind::Switch => ContainerData::switch(switch_group),
    };
    if continuous {
        data = data.continuous(transition, transition_ms);
    }
    data = data.with_loop_count(loop_count);

    let targets = r.read::<u8>()?;
    for _ in 0..targets {
        let switch_id = r.read::<u32>()?;
        let child = NodeId(r.read::<u32>()?);
        data = data.with_switch_target(switch_id, child);
    }
    Ok(data)
}

fn read_bus(r: &mut BankReader<'_>) -> VoxResult<(BusData, Vec<DuckTarget>)> {
    let mut bus = BusData::new().with_recovery_ms(r.read::<f32>()?);
    let fx_count = r.read::<u8>()?;
    for _ in 0..fx_count {
        bus = bus.with_effect(r.read::<u32>()?);
    }

    let duck_count = r.read::<u8>()?;
    let mut ducks = Vec::with_capacity(duck_count as usize);
    for _ in 0..duck_count {
        let target = NodeId(r.read::<u32>()?);
        let duck_db = r.read::<f32>()?;
        let fade_in = r.read::<f32>()?;
        let fade_out = r.read::<f32>()?;
        let curve = FadeCurve::from_index(r.read::<u8>()?);
        let scope = DuckScope::from_index(r.read::<u8>()?);
        ducks.push(
            DuckTarget::new(target, duck_db)
                .with_fades(fade_in, fade_out)
                .with_curve(curve)
                .with_scope(scope),
        );
    }
    Ok((bus, ducks))
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use vox_core::ByteWriter;

    fn header(w: &mut ByteWriter, id: u32, category: u8, parent: u32, bus: u32) {
        w.u32(id).u8(category).u32(parent).u32(bus);
    }

    fn no_props_no_limit(w: &mut ByteWriter) {
        w.u8(0).u16(0).u8(0).u8(0);
    }

    fn bus_block(w: &mut ByteWriter, id: u32, parent: u32, duck: Option<u32>) {
        w.block(|b| {
            header(b, id, 2, parent, 0);
            no_props_no_limit(b);
            b.f32(200.0).u8(0);
            match duck {
                Some(target) => {
                    b.u8(1).u32(target).f32(-12.0).f32(0.0).f32(50.0).u8(0).u8(0);
                }
                None => {
                    b.u8(0);
                }
            }
        });
    }

    fn sound_block(w: &mut ByteWriter, id: u32, bus: u32) {
        w.block(|b| {
            header(b, id, 0, 0, bus);
            b.u8(1).u8(PropId::Volume as u8).f32(-3.0).u8(0);
            b.u16(2).u8(1).u8(1);
            b.u16(0).u16(1).u8(1).u16(1).u16(1).u32(3);
            b.f32(0.1).f32(0.2).f32(0.3);
        });
    }

    #[test]
    fn test_load_links_in_second_pass() {
        let mut w = ByteWriter::new();
        sound_block(&mut w, 10, 2);
        bus_block(&mut w, 2, 1, None);
        bus_block(&mut w, 1, 0, Some(2));

        let mut h = Hierarchy::new();
        let report = HierarchyLoader::load_nodes(&mut h, w.as_slice());
        assert!(report.is_clean(), "{:?}", report.failed);
        assert_eq!(report.loaded, vec![NodeId(10), NodeId(2), NodeId(1)]);

        assert_eq!(h.effective_output_bus(NodeId(10)), Some(NodeId(2)));
        assert_eq!(h.node(NodeId(2)).unwrap().parent, Some(NodeId(1)));
        let sound = h.node(NodeId(10)).unwrap();
        assert_eq!(sound.props.get(PropId::Volume), Some(-3.0));
        let limit = sound.limit.unwrap();
        assert_eq!(limit.max_instances, 2);
        assert!(limit.use_virtual);
        assert_eq!(sound.sound_data().unwrap().media.as_ref().unwrap().frames(), 3);
        let ducks = &h.node(NodeId(1)).unwrap().bus_data().unwrap().duck_targets;
        assert_eq!(ducks.len(), 1);
        assert_eq!(ducks[0].target, NodeId(2));
    }

    #[test]
    fn test_duplicate_aborts_only_that_node() {
        let mut w = ByteWriter::new();
        bus_block(&mut w, 1, 0, None);
        bus_block(&mut w, 1, 0, None);
        bus_block(&mut w, 3, 0, None);

        let mut h = Hierarchy::new();
        let report = HierarchyLoader::load_nodes(&mut h, w.as_slice());
        assert_eq!(report.loaded, vec![NodeId(1), NodeId(3)]);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].error, VoxError::DuplicateUniqueId(1)));
    }

    #[test]
    fn test_malformed_block_is_skipped() {
        let mut w = ByteWriter::new();
        w.block(|b| {
            header(b, 5, 2, 0, 0);
            no_props_no_limit(b);
            b.f32(0.0).u8(0).u8(0).u8(0xFF);
        });
        w.block(|b| {
            header(b, 6, 9, 0, 0);
        });
        bus_block(&mut w, 7, 0, None);

        let mut h = Hierarchy::new();
        let report = HierarchyLoader::load_nodes(&mut h, w.as_slice());
        assert_eq!(report.loaded, vec![NodeId(7)]);
        assert!(matches!(report.failed[0].error, VoxError::BankSizeMismatch { .. }));
        assert_eq!(report.failed[1].node, Some(NodeId(6)));
        assert!(!h.contains(NodeId(5)));
    }

    #[test]
    fn test_truncated_stream_stops_loading() {
        let mut w = ByteWriter::new();
        bus_block(&mut w, 1, 0, None);
        w.u32(100).u8(1);

        let mut h = Hierarchy::new();
        let report = HierarchyLoader::load_nodes(&mut h, w.as_slice());
        assert_eq!(report.loaded, vec![NodeId(1)]);
        assert_eq!(report.failed[0].node, None);
    }

    #[test]
    fn test_bad_link_releases_node() {
        let mut w = ByteWriter::new();
        sound_block(&mut w, 10, 99);

        let mut h = Hierarchy::new();
        let report = HierarchyLoader::load_nodes(&mut h, w.as_slice());
        assert!(report.loaded.is_empty());
        assert!(matches!(report.failed[0].error, VoxError::IdNotFound(99)));
        assert!(!h.contains(NodeId(10)));
    }
}
