//! Stage topology
//!
//! Bookkeeping only: which stages exist, what state they are in and how they
//! are linked. Audio never flows through this structure; it exists so links
//! can be validated and the graph can be dumped for diagnostics.

use std::collections::HashMap;
use std::fmt;

use petgraph::dot::Dot;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::Direction;

use crate::backend::{SlotId, StageId, StageKind, StageState};

#[derive(Debug, Clone)]
pub struct StageNode {
    pub id: StageId,
    pub kind: StageKind,
    pub label: String,
    pub state: StageState,
}

impl fmt::Display for StageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label.is_empty() {
            write!(f, "{} {} [{}]", self.kind, self.id, self.state)
        } else {
            write!(f, "{} {} [{}] {}", self.kind, self.id, self.state, self.label)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Stream,
    /// Converter into a numbered mixer input
    Slot(SlotId),
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => Ok(()),
            Self::Slot(slot) => write!(f, "{}", slot),
        }
    }
}

pub struct Topology {
    inner: StableGraph<StageNode, Link>,
    index_map: HashMap<StageId, NodeIndex>,
    next_id: u64,
    mixer: StageId,
    sink: StageId,
}

impl Topology {
    /// A graph holding just the mixer feeding the output sink.
    pub fn new(sink_label: &str) -> Self {
        let mut topology = Self {
            inner: StableGraph::new(),
            index_map: HashMap::new(),
            next_id: 1,
            mixer: StageId(0),
            sink: StageId(0),
        };
        topology.mixer = topology.add(StageKind::Mixer, "");
        topology.sink = topology.add(StageKind::Sink, sink_label);
        topology.connect(topology.mixer, topology.sink, Link::Stream);
        topology
    }

    pub fn mixer(&self) -> StageId {
        self.mixer
    }

    pub fn sink(&self) -> StageId {
        self.sink
    }

    pub fn add(&mut self, kind: StageKind, label: &str) -> StageId {
        let id = StageId(self.next_id);
        self.next_id += 1;
        let index = self.inner.add_node(StageNode {
            id,
            kind,
            label: label.to_string(),
            state: StageState::Null,
        });
        self.index_map.insert(id, index);
        id
    }

    pub fn remove(&mut self, id: StageId) -> Option<StageNode> {
        let index = self.index_map.remove(&id)?;
        self.inner.remove_node(index)
    }

    pub fn node(&self, id: StageId) -> Option<&StageNode> {
        let index = self.index_map.get(&id)?;
        self.inner.node_weight(*index)
    }

    pub fn kind(&self, id: StageId) -> Option<StageKind> {
        self.node(id).map(|n| n.kind)
    }

    pub fn set_state(&mut self, id: StageId, state: StageState) -> bool {
        let Some(index) = self.index_map.get(&id) else {
            return false;
        };
        match self.inner.node_weight_mut(*index) {
            Some(node) => {
                node.state = state;
                true
            }
            None => false,
        }
    }

    /// Ids of every stage of one kind, in creation order.
    pub fn stages_of(&self, kind: StageKind) -> Vec<StageId> {
        let mut ids: Vec<StageId> = self
            .inner
            .node_weights()
            .filter(|n| n.kind == kind)
            .map(|n| n.id)
            .collect();
        ids.sort();
        ids
    }

    /// Add an edge. Returns false when either end is missing.
    pub fn connect(&mut self, from: StageId, to: StageId, link: Link) -> bool {
        match (self.index_map.get(&from), self.index_map.get(&to)) {
            (Some(a), Some(b)) => {
                self.inner.add_edge(*a, *b, link);
                true
            }
            _ => false,
        }
    }

    pub fn disconnect(&mut self, from: StageId, to: StageId) -> bool {
        let (Some(a), Some(b)) = (self.index_map.get(&from), self.index_map.get(&to)) else {
            return false;
        };
        match self.inner.find_edge(*a, *b) {
            Some(edge) => {
                self.inner.remove_edge(edge);
                true
            }
            None => false,
        }
    }

    pub fn is_linked(&self, from: StageId, to: StageId) -> bool {
        match (self.index_map.get(&from), self.index_map.get(&to)) {
            (Some(a), Some(b)) => self.inner.find_edge(*a, *b).is_some(),
            _ => false,
        }
    }

    /// Whether anything already feeds `id`.
    pub fn has_upstream(&self, id: StageId) -> bool {
        self.index_map
            .get(&id)
            .map(|index| {
                self.inner
                    .edges_directed(*index, Direction::Incoming)
                    .next()
                    .is_some()
            })
            .unwrap_or(false)
    }

    /// Whether `id` already feeds something.
    pub fn has_downstream(&self, id: StageId) -> bool {
        self.index_map
            .get(&id)
            .map(|index| {
                self.inner
                    .edges_directed(*index, Direction::Outgoing)
                    .next()
                    .is_some()
            })
            .unwrap_or(false)
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn to_dot(&self) -> String {
        format!("{}", Dot::new(&self.inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_graph_has_mixer_into_sink() {
        let topology = Topology::new("null");
        assert_eq!(topology.node_count(), 2);
        assert!(topology.is_linked(topology.mixer(), topology.sink()));
        assert_eq!(topology.kind(topology.mixer()), Some(StageKind::Mixer));
    }

    #[test]
    fn test_remove_drops_edges() {
        let mut topology = Topology::new("null");
        let dec = topology.add(StageKind::Decoder, "a.ogg");
        let conv = topology.add(StageKind::Converter, "");
        assert!(topology.connect(dec, conv, Link::Stream));
        assert!(topology.has_upstream(conv));

        topology.remove(dec);
        assert!(!topology.has_upstream(conv));
        assert_eq!(topology.edge_count(), 1);
    }

    #[test]
    fn test_dot_labels_slots() {
        let mut topology = Topology::new("wav");
        let conv = topology.add(StageKind::Converter, "");
        topology.connect(conv, topology.mixer(), Link::Slot(SlotId(3)));
        let dot = topology.to_dot();
        assert!(dot.contains("digraph"));
        assert!(dot.contains("sink_3"));
        assert!(dot.contains("sink stage2 [null] wav"));
    }
}
