//! Pipeline graph construction.
//!
//! [`build_graph`] is a pure function from a source shape and a set of
//! sink configurations to a [`PipelineGraph`]: a DAG of unit
//! specifications plus a sink-to-terminal route map. It performs no
//! allocation of buffers or threads, so the dispatcher can rebuild and
//! diff configurations cheaply, and tests can assert on the planned
//! topology directly.
//!
//! The layout follows a fixed recipe. Requirements shared by every
//! processed stream (the *common* chain) run once, ordered by ascending
//! bit position; each sink then gets its own chain of per-sink stages,
//! ending in a terminal unit that fills the caller's buffer.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use daggy::{Dag, NodeIndex, Walker};

use crate::buffer::SinkId;
use crate::error::{Error, Result};
use crate::format::{FrameDescriptor, PixelFormat};
use crate::unit::BufferPolicy;
use crate::unit::kinds::UnitKind;

/// Pool size for internal-policy units.
pub const DEFAULT_POOL_BUFFERS: usize = 4;

bitflags! {
    /// Processing a stream needs, one bit per stage kind.
    ///
    /// The low half holds *common* stages, applied once for all streams;
    /// the high half holds *per-sink* stages. Within each half, stages
    /// are chained in ascending bit order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Requirement: u32 {
        /// Lens shading correction (common).
        const LENS_CORRECTION = 1 << 0;
        /// Digital zoom (common).
        const DIGITAL_ZOOM = 1 << 1;

        /// Crop/scale to the sink's shape (per-sink).
        const SCALE = 1 << 16;
        /// JPEG encode (per-sink).
        const ENCODE = 1 << 17;
        /// Raw passthrough (per-sink, excludes everything else).
        const RAW = 1 << 18;
    }
}

impl Requirement {
    /// Mask selecting common-stage bits.
    pub const COMMON_MASK: Requirement = Requirement::LENS_CORRECTION.union(Requirement::DIGITAL_ZOOM);

    /// Mask selecting per-sink bits.
    pub const SINK_MASK: Requirement = Requirement::SCALE
        .union(Requirement::ENCODE)
        .union(Requirement::RAW);

    /// The stages of `self`, lowest bit first.
    fn stages(self) -> impl Iterator<Item = Requirement> {
        (0..u32::BITS).filter_map(move |bit| {
            let flag = Requirement::from_bits_truncate(1 << bit);
            (!flag.is_empty() && self.contains(flag)).then_some(flag)
        })
    }

    fn kind(self) -> Option<UnitKind> {
        match self {
            Requirement::LENS_CORRECTION => Some(UnitKind::LensCorrection),
            Requirement::DIGITAL_ZOOM => Some(UnitKind::DigitalZoom),
            Requirement::SCALE => Some(UnitKind::CopyScale),
            Requirement::ENCODE => Some(UnitKind::JpegEncode),
            Requirement::RAW => Some(UnitKind::RawPassthrough),
            _ => None,
        }
    }
}

/// One requested output stream.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Stream identifier, unique within a configuration.
    pub id: SinkId,
    /// Requested output shape.
    pub descriptor: Arc<FrameDescriptor>,
}

/// Which common stages a configuration enables.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Insert a digital zoom stage ahead of the per-sink chains.
    pub enable_zoom: bool,
    /// Insert software lens shading correction.
    pub enable_lens_correction: bool,
}

/// Planned configuration of one unit.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    /// Unique unit name within the graph.
    pub name: String,
    /// Stage kind.
    pub kind: UnitKind,
    /// How the unit obtains output buffers.
    pub policy: BufferPolicy,
    /// Shape of the frames the unit consumes.
    pub input: Arc<FrameDescriptor>,
    /// Shape of the frames the unit produces.
    pub output: Arc<FrameDescriptor>,
    /// Internal pool size (Internal policy only).
    pub buffer_count: usize,
    /// The sink this unit terminates, if it is a chain's last unit.
    pub terminal_for: Option<SinkId>,
}

/// Node handle within a [`PipelineGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(NodeIndex);

/// The planned pipeline: unit specs, their connections, and the route
/// from each sink to its terminal unit.
pub struct PipelineGraph {
    dag: Dag<UnitSpec, ()>,
    routes: HashMap<SinkId, NodeId>,
}

impl PipelineGraph {
    fn new() -> Self {
        Self {
            dag: Dag::new(),
            routes: HashMap::new(),
        }
    }

    fn add_unit(&mut self, spec: UnitSpec) -> NodeId {
        NodeId(self.dag.add_node(spec))
    }

    fn connect(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        self.dag
            .add_edge(from.0, to.0, ())
            .map(|_| ())
            .map_err(|_| Error::Config("pipeline graph would contain a cycle".into()))
    }

    /// Unit spec for a node.
    pub fn node(&self, id: NodeId) -> &UnitSpec {
        &self.dag[id.0]
    }

    /// Number of units in the graph.
    pub fn node_count(&self) -> usize {
        self.dag.node_count()
    }

    /// All node ids in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.dag.graph().node_indices().map(NodeId)
    }

    /// Units with no upstream: the first level, fed directly with the
    /// pipeline input.
    pub fn entries(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|id| self.parents(*id).is_empty())
            .collect()
    }

    /// Direct downstream units of `id`.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.dag
            .children(id.0)
            .iter(&self.dag)
            .map(|(_, n)| NodeId(n))
            .collect()
    }

    /// Direct upstream units of `id`.
    pub fn parents(&self, id: NodeId) -> Vec<NodeId> {
        self.dag
            .parents(id.0)
            .iter(&self.dag)
            .map(|(_, n)| NodeId(n))
            .collect()
    }

    /// Terminal unit that fills `sink`'s caller buffers.
    pub fn route(&self, sink: SinkId) -> Option<NodeId> {
        self.routes.get(&sink).copied()
    }

    /// The sink routes, terminal unit per sink.
    pub fn routes(&self) -> &HashMap<SinkId, NodeId> {
        &self.routes
    }

    /// Nodes grouped by distance from the entries: level 0 first.
    ///
    /// Used to order drain/stop from the upstream end so no level keeps
    /// feeding a stopped one.
    pub fn levels(&self) -> Vec<Vec<NodeId>> {
        let mut depth: HashMap<NodeId, usize> = HashMap::new();
        let mut frontier = self.entries();
        let mut level = 0usize;

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for id in frontier {
                // A node reachable at several depths lands in its
                // deepest level.
                depth.insert(id, level);
                next.extend(self.children(id));
            }
            frontier = next;
            level += 1;
        }

        let max_level = depth.values().copied().max().unwrap_or(0);
        let mut levels = vec![Vec::new(); max_level + 1];
        for (id, d) in depth {
            levels[d].push(id);
        }
        levels
    }

    /// True when no unit transforms pixel content (pure relay graphs).
    pub fn passthrough(&self) -> bool {
        self.nodes().all(|id| {
            matches!(
                self.node(id).kind,
                UnitKind::Dummy | UnitKind::RawPassthrough
            )
        })
    }
}

/// Classify what one sink needs, given the source shape.
fn classify(source: &FrameDescriptor, sink: &SinkConfig) -> Result<Requirement> {
    let out = &sink.descriptor;

    if out.format.is_raw() {
        if !source.format.is_raw() {
            return Err(Error::Config(format!(
                "{} requests raw output from a {:?} source",
                sink.id, source.format
            )));
        }
        return Ok(Requirement::RAW);
    }

    let mut req = Requirement::empty();

    if out.format == PixelFormat::Jpeg {
        req |= Requirement::ENCODE;
        if out.width != source.width || out.height != source.height {
            req |= Requirement::SCALE;
        }
    } else if out.width != source.width || out.height != source.height {
        req |= Requirement::SCALE;
    } else if out.format != source.format {
        return Err(Error::Config(format!(
            "{} requests unsupported conversion {:?} -> {:?}",
            sink.id, source.format, out.format
        )));
    }

    Ok(req)
}

/// Shape produced by a stage, given its input shape and the sink target.
fn stage_output(
    stage: Requirement,
    input: &Arc<FrameDescriptor>,
    sink: &SinkConfig,
) -> Result<Arc<FrameDescriptor>> {
    Ok(match stage {
        // Common stages preserve the source shape.
        Requirement::LENS_CORRECTION | Requirement::DIGITAL_ZOOM => Arc::clone(input),
        // Scale moves to the sink's dimensions but stays in the source
        // pixel format (encode happens after).
        Requirement::SCALE => {
            let desc = &sink.descriptor;
            if desc.format == PixelFormat::Jpeg {
                Arc::new(FrameDescriptor::new(
                    desc.width,
                    desc.height,
                    input.format,
                )?)
            } else {
                Arc::clone(desc)
            }
        }
        Requirement::ENCODE | Requirement::RAW => Arc::clone(&sink.descriptor),
        other => {
            return Err(Error::Config(format!(
                "no unit maps to requirement {:?}",
                other
            )));
        }
    })
}

/// Plan the pipeline for `source` feeding `sinks`.
///
/// Pure: equal inputs produce an equal plan. Fails on an empty or
/// duplicated sink set and on shape combinations no stage can satisfy.
pub fn build_graph(
    source: &Arc<FrameDescriptor>,
    sinks: &[SinkConfig],
    options: &BuildOptions,
) -> Result<PipelineGraph> {
    if sinks.is_empty() {
        return Err(Error::Config("configuration has no sinks".into()));
    }
    {
        let mut seen = HashMap::new();
        for sink in sinks {
            if seen.insert(sink.id, ()).is_some() {
                return Err(Error::Config(format!("duplicate {}", sink.id)));
            }
        }
    }

    let mut per_sink: Vec<(usize, Requirement)> = Vec::with_capacity(sinks.len());
    for (idx, sink) in sinks.iter().enumerate() {
        per_sink.push((idx, classify(source, sink)?));
    }

    // Raw streams never pass through the common chain.
    let processed: Vec<usize> = per_sink
        .iter()
        .filter(|(_, req)| !req.contains(Requirement::RAW))
        .map(|(idx, _)| *idx)
        .collect();

    let mut common = Requirement::empty();
    if !processed.is_empty() {
        if options.enable_lens_correction {
            common |= Requirement::LENS_CORRECTION;
        }
        if options.enable_zoom {
            common |= Requirement::DIGITAL_ZOOM;
        }
    }

    let mut graph = PipelineGraph::new();

    // The last common unit feeds the caller's buffer directly only when a
    // single processed sink with no per-sink stages remains; otherwise
    // every common unit is an internal relay.
    let single_plain_sink = processed.len() == 1
        && sinks.len() == 1
        && !per_sink[processed[0]].1.intersects(Requirement::SINK_MASK);

    let mut common_tail: Option<NodeId> = None;
    let mut shape = Arc::clone(source);
    let common_stages: Vec<Requirement> = (common & Requirement::COMMON_MASK).stages().collect();

    for (pos, stage) in common_stages.iter().enumerate() {
        let kind = stage
            .kind()
            .ok_or_else(|| Error::Config(format!("no unit maps to requirement {:?}", stage)))?;
        let last = pos + 1 == common_stages.len();
        let terminal = last && single_plain_sink;

        let output = if terminal {
            Arc::clone(&sinks[processed[0]].descriptor)
        } else {
            stage_output(*stage, &shape, &sinks[processed[0]])?
        };

        let spec = UnitSpec {
            name: kind.label().to_string(),
            kind,
            policy: if terminal {
                BufferPolicy::External
            } else {
                kind.base_policy()
            },
            input: Arc::clone(&shape),
            output: Arc::clone(&output),
            buffer_count: DEFAULT_POOL_BUFFERS,
            terminal_for: terminal.then(|| sinks[processed[0]].id),
        };

        let node = graph.add_unit(spec);
        if let Some(prev) = common_tail {
            graph.connect(prev, node)?;
        }
        common_tail = Some(node);
        shape = output;

        if terminal {
            graph.routes.insert(sinks[processed[0]].id, node);
        }
    }

    let fan_out = processed.len() > 1;

    for (idx, req) in &per_sink {
        let sink = &sinks[*idx];
        let is_raw = req.contains(Requirement::RAW);

        if sink.descriptor.format.is_raw() != is_raw {
            return Err(Error::Config(format!("inconsistent raw classification for {}", sink.id)));
        }

        // Single plain sink already terminated inside the common chain.
        if graph.routes.contains_key(&sink.id) {
            continue;
        }

        let mut stages: Vec<Requirement> = (*req & Requirement::SINK_MASK).stages().collect();

        if stages.is_empty() {
            // A sink needing nothing still gets its own terminal unit:
            // with fan-out the shared frame must be copied per sink, and
            // without one the caller buffer still has to be filled.
            stages.push(if fan_out {
                Requirement::SCALE
            } else {
                Requirement::empty()
            });
        }

        let mut upstream = common_tail;
        let mut shape = upstream
            .map(|id| Arc::clone(&graph.node(id).output))
            .unwrap_or_else(|| Arc::clone(source));
        // Raw chains hang straight off the source.
        if is_raw {
            upstream = None;
            shape = Arc::clone(source);
        }

        let count = stages.len();
        for (pos, stage) in stages.into_iter().enumerate() {
            let kind = if stage.is_empty() {
                UnitKind::Dummy
            } else {
                stage.kind().ok_or_else(|| {
                    Error::Config(format!("no unit maps to requirement {:?}", stage))
                })?
            };
            let terminal = pos + 1 == count;

            let output = if stage.is_empty() {
                Arc::clone(&sink.descriptor)
            } else {
                stage_output(stage, &shape, sink)?
            };

            let spec = UnitSpec {
                name: format!("{}-{}", kind.label(), sink.id),
                kind,
                policy: if terminal {
                    BufferPolicy::External
                } else {
                    kind.base_policy()
                },
                input: Arc::clone(&shape),
                output: Arc::clone(&output),
                buffer_count: DEFAULT_POOL_BUFFERS,
                terminal_for: terminal.then_some(sink.id),
            };

            let node = graph.add_unit(spec);
            if let Some(prev) = upstream {
                graph.connect(prev, node)?;
            }
            upstream = Some(node);
            shape = output;

            if terminal {
                graph.routes.insert(sink.id, node);
            }
        }
    }

    debug_assert_eq!(graph.routes.len(), sinks.len());
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nv12(w: u32, h: u32) -> Arc<FrameDescriptor> {
        Arc::new(FrameDescriptor::new(w, h, PixelFormat::Nv12).unwrap())
    }

    fn jpeg(w: u32, h: u32) -> Arc<FrameDescriptor> {
        Arc::new(FrameDescriptor::new(w, h, PixelFormat::Jpeg).unwrap())
    }

    fn sink(id: u32, desc: Arc<FrameDescriptor>) -> SinkConfig {
        SinkConfig {
            id: SinkId(id),
            descriptor: desc,
        }
    }

    #[test]
    fn test_single_passthrough_sink_is_one_unit() {
        let source = nv12(640, 480);
        let graph = build_graph(
            &source,
            &[sink(0, nv12(640, 480))],
            &BuildOptions::default(),
        )
        .unwrap();

        assert_eq!(graph.node_count(), 1);
        let terminal = graph.route(SinkId(0)).unwrap();
        assert_eq!(graph.node(terminal).kind, UnitKind::Dummy);
        assert_eq!(graph.node(terminal).policy, BufferPolicy::External);
        assert!(graph.passthrough());
    }

    #[test]
    fn test_scaling_sink_gets_copy_scale() {
        let source = nv12(1920, 1080);
        let graph = build_graph(
            &source,
            &[sink(0, nv12(640, 480))],
            &BuildOptions::default(),
        )
        .unwrap();

        assert_eq!(graph.node_count(), 1);
        let node = graph.node(graph.route(SinkId(0)).unwrap());
        assert_eq!(node.kind, UnitKind::CopyScale);
        assert_eq!(node.policy, BufferPolicy::External);
        assert!(!graph.passthrough());
    }

    #[test]
    fn test_jpeg_sink_scales_then_encodes() {
        let source = nv12(4000, 3000);
        let graph = build_graph(
            &source,
            &[sink(0, jpeg(1920, 1080))],
            &BuildOptions::default(),
        )
        .unwrap();

        assert_eq!(graph.node_count(), 2);
        let encode = graph.route(SinkId(0)).unwrap();
        assert_eq!(graph.node(encode).kind, UnitKind::JpegEncode);

        let parents = graph.parents(encode);
        assert_eq!(parents.len(), 1);
        let scale = graph.node(parents[0]);
        assert_eq!(scale.kind, UnitKind::CopyScale);
        // Scale output stays YUV at JPEG dimensions.
        assert_eq!(scale.output.format, PixelFormat::Nv12);
        assert_eq!(scale.output.width, 1920);
        assert_eq!(scale.policy, BufferPolicy::Internal);
    }

    #[test]
    fn test_common_chain_feeds_both_sinks() {
        let source = nv12(1920, 1080);
        let graph = build_graph(
            &source,
            &[sink(0, nv12(1280, 720)), sink(1, nv12(640, 480))],
            &BuildOptions {
                enable_zoom: true,
                enable_lens_correction: true,
            },
        )
        .unwrap();

        // lens + zoom common, one scale per sink.
        assert_eq!(graph.node_count(), 4);

        let entries = graph.entries();
        assert_eq!(entries.len(), 1);
        // Lowest bit first: lens correction ahead of zoom.
        assert_eq!(graph.node(entries[0]).kind, UnitKind::LensCorrection);

        let zoom = graph.children(entries[0]);
        assert_eq!(zoom.len(), 1);
        assert_eq!(graph.node(zoom[0]).kind, UnitKind::DigitalZoom);

        // Fan-out happens after the common tail.
        assert_eq!(graph.children(zoom[0]).len(), 2);
        assert_eq!(graph.routes().len(), 2);
    }

    #[test]
    fn test_single_sink_common_tail_takes_caller_buffers() {
        let source = nv12(1920, 1080);
        let graph = build_graph(
            &source,
            &[sink(0, nv12(1920, 1080))],
            &BuildOptions {
                enable_zoom: true,
                enable_lens_correction: false,
            },
        )
        .unwrap();

        // The zoom unit itself terminates the stream.
        assert_eq!(graph.node_count(), 1);
        let node = graph.node(graph.route(SinkId(0)).unwrap());
        assert_eq!(node.kind, UnitKind::DigitalZoom);
        assert_eq!(node.policy, BufferPolicy::External);
    }

    #[test]
    fn test_fan_out_forces_copy_for_plain_sink() {
        let source = nv12(1280, 720);
        let graph = build_graph(
            &source,
            &[sink(0, nv12(1280, 720)), sink(1, nv12(640, 480))],
            &BuildOptions::default(),
        )
        .unwrap();

        // Sink 0 matches the source shape but still needs its own copy
        // unit because the frame fans out.
        let plain = graph.node(graph.route(SinkId(0)).unwrap());
        assert_eq!(plain.kind, UnitKind::CopyScale);
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn test_raw_sink_bypasses_common_chain() {
        let source = Arc::new(FrameDescriptor::new(640, 480, PixelFormat::Raw16).unwrap());
        let graph = build_graph(
            &source,
            &[sink(
                0,
                Arc::new(FrameDescriptor::new(640, 480, PixelFormat::Raw16).unwrap()),
            )],
            &BuildOptions {
                enable_zoom: true,
                enable_lens_correction: true,
            },
        )
        .unwrap();

        // Zoom/lens never apply to raw streams.
        assert_eq!(graph.node_count(), 1);
        assert_eq!(
            graph.node(graph.route(SinkId(0)).unwrap()).kind,
            UnitKind::RawPassthrough
        );
    }

    #[test]
    fn test_rejects_duplicate_and_empty_sinks() {
        let source = nv12(640, 480);
        assert!(build_graph(&source, &[], &BuildOptions::default()).is_err());

        let dup = [sink(0, nv12(640, 480)), sink(0, nv12(320, 240))];
        assert!(build_graph(&source, &dup, &BuildOptions::default()).is_err());
    }

    #[test]
    fn test_build_is_idempotent() {
        let source = nv12(4000, 3000);
        let sinks = [
            sink(0, nv12(1920, 1080)),
            sink(1, nv12(640, 480)),
            sink(2, jpeg(4000, 3000)),
        ];
        let options = BuildOptions {
            enable_zoom: true,
            enable_lens_correction: false,
        };

        let a = build_graph(&source, &sinks, &options).unwrap();
        let b = build_graph(&source, &sinks, &options).unwrap();

        assert_eq!(a.node_count(), b.node_count());
        for (id, node) in a.routes() {
            let other = b.route(*id).unwrap();
            assert_eq!(a.node(*node).name, b.node(other).name);
            assert_eq!(a.node(*node).kind, b.node(other).kind);
        }
    }

    #[test]
    fn test_levels_order_upstream_first() {
        let source = nv12(1920, 1080);
        let graph = build_graph(
            &source,
            &[sink(0, nv12(640, 480)), sink(1, jpeg(1280, 720))],
            &BuildOptions {
                enable_zoom: true,
                enable_lens_correction: false,
            },
        )
        .unwrap();

        let levels = graph.levels();
        assert_eq!(levels[0].len(), 1); // zoom
        assert_eq!(graph.node(levels[0][0]).kind, UnitKind::DigitalZoom);
        // Terminals sit in deeper levels than their parents.
        for (d, level) in levels.iter().enumerate() {
            for id in level {
                for child in graph.children(*id) {
                    let child_level = levels
                        .iter()
                        .position(|l| l.contains(&child))
                        .unwrap();
                    assert!(child_level > d);
                }
            }
        }
    }
}
