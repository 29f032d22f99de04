//! Registry of useful positions and useful nodes for one analysis session

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

use crate::filter::{NodeFilter, QuantaFilter};
use crate::node::{MajorTag, NodeLocation, TagValue, UsefulNode};

/// Flat export record of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub position: usize,
    pub layer: usize,
    pub is_head: bool,
    pub index: usize,
    /// Major tag name to (minor key to value text)
    pub tags: BTreeMap<String, BTreeMap<String, String>>,
}

/// Useful token positions and useful nodes discovered so far
///
/// Owned by one analysis session and passed explicitly to every stage
/// that reads or writes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsefulNodeRegistry {
    positions: BTreeSet<usize>,
    nodes: Vec<UsefulNode>,
}

impl UsefulNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a position known to be used in calculations
    pub fn add_useful_position(&mut self, position: usize) {
        self.positions.insert(position);
    }

    /// Useful positions in ascending order
    pub fn positions(&self) -> Vec<usize> {
        self.positions.iter().copied().collect()
    }

    pub fn min_useful_position(&self) -> Option<usize> {
        self.positions.first().copied()
    }

    pub fn max_useful_position(&self) -> Option<usize> {
        self.positions.last().copied()
    }

    pub fn nodes(&self) -> &[UsefulNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Exact lookup on all four location fields
    pub fn get_node(&self, location: &NodeLocation) -> Option<&UsefulNode> {
        self.nodes.iter().find(|n| n.location() == *location)
    }

    fn get_or_create(&mut self, location: &NodeLocation) -> &mut UsefulNode {
        let idx = match self.nodes.iter().position(|n| n.location() == *location) {
            Some(idx) => idx,
            None => {
                debug!("New useful node {location}");
                self.nodes.push(UsefulNode::new(*location));
                self.nodes.len() - 1
            }
        };
        &mut self.nodes[idx]
    }

    /// Write a tag onto a node, creating the node if needed
    pub fn add_tag(&mut self, location: &NodeLocation, major: MajorTag, minor: &str) {
        self.get_or_create(location).add_tag(major, minor);
    }

    /// Clear one category of tags (or all tags) on every node
    pub fn reset_tags(&mut self, major: Option<MajorTag>) {
        for node in &mut self.nodes {
            node.reset_tags(major);
        }
    }

    /// Forget every position and node
    pub fn reset(&mut self) {
        self.positions.clear();
        self.nodes.clear();
    }

    /// Put nodes into canonical report order
    pub fn sort_nodes(&mut self) {
        self.nodes.sort_by_key(UsefulNode::location);
    }

    /// Heads satisfying every entry of a flat filter list
    pub fn filter_heads(&self, filters: &[QuantaFilter]) -> Vec<&UsefulNode> {
        self.nodes
            .iter()
            .filter(|n| n.is_head() && filters.iter().all(|f| f.matches(n)))
            .collect()
    }

    /// Nodes satisfying a filter tree
    pub fn filter_nodes(&self, filter: &NodeFilter) -> Vec<&UsefulNode> {
        self.nodes.iter().filter(|n| filter.matches(n)).collect()
    }

    /// Locations of the nodes satisfying a filter tree
    pub fn filter_locations(&self, filter: &NodeFilter) -> Vec<NodeLocation> {
        self.nodes
            .iter()
            .filter(|n| filter.matches(n))
            .map(UsefulNode::location)
            .collect()
    }

    pub fn to_records(&self) -> Vec<NodeRecord> {
        self.nodes
            .iter()
            .map(|node| {
                let loc = node.location();
                let tags = node
                    .tags()
                    .iter()
                    .map(|(major, entries)| {
                        let values = entries
                            .iter()
                            .map(|(key, value)| (key.clone(), value.text.clone()))
                            .collect();
                        (major.as_str().to_string(), values)
                    })
                    .collect();
                NodeRecord {
                    position: loc.position,
                    layer: loc.layer,
                    is_head: loc.is_head,
                    index: loc.index,
                    tags,
                }
            })
            .collect()
    }

    /// Rebuild a registry from exported records
    ///
    /// Records for the same location are merged.
    pub fn from_records(records: &[NodeRecord]) -> Result<Self> {
        let mut registry = Self::new();
        for record in records {
            let location =
                NodeLocation::new(record.position, record.layer, record.is_head, record.index);
            let node = registry.get_or_create(&location);
            for (major_name, entries) in &record.tags {
                let major: MajorTag = major_name.parse()?;
                for (key, text) in entries {
                    node.insert_value(major, key.clone(), TagValue::parse(text));
                }
            }
        }
        Ok(registry)
    }

    /// Save node records as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.to_records())?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write nodes to {}", path.display()))?;
        info!("Saved {} useful nodes to {}", self.len(), path.display());
        Ok(())
    }

    /// Load node records saved by [`UsefulNodeRegistry::save`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read nodes from {}", path.display()))?;
        let records: Vec<NodeRecord> = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse nodes from {}", path.display()))?;
        Self::from_records(&records)
    }

    /// Log every node with its tags
    pub fn log_tags(&self) {
        for node in &self.nodes {
            info!("{} {:?}", node.name(), node.tag_strings());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterTarget, QuantaFilterKind};

    fn sample() -> UsefulNodeRegistry {
        let mut registry = UsefulNodeRegistry::new();
        registry.add_tag(&NodeLocation::head(15, 0, 2), MajorTag::Impact, "A5");
        registry.add_tag(&NodeLocation::head(14, 0, 1), MajorTag::Impact, "A653");
        registry.add_tag(&NodeLocation::head(14, 0, 1), MajorTag::Attention, "P3=70");
        registry.add_tag(&NodeLocation::neuron(14, 0, 7), MajorTag::Fail, "3");
        registry
    }

    #[test]
    fn test_add_tag_creates_once() {
        let registry = sample();
        assert_eq!(registry.len(), 3);
        let node = registry.get_node(&NodeLocation::head(14, 0, 1)).unwrap();
        assert_eq!(node.values(MajorTag::Impact).count(), 1);
        assert!(registry.get_node(&NodeLocation::head(14, 0, 3)).is_none());
        assert!(registry.get_node(&NodeLocation::neuron(14, 0, 1)).is_none());
    }

    #[test]
    fn test_tag_idempotence() {
        let mut once = sample();
        let mut twice = sample();
        once.add_tag(&NodeLocation::head(14, 0, 1), MajorTag::Algo, "A3.SC");
        twice.add_tag(&NodeLocation::head(14, 0, 1), MajorTag::Algo, "A3.SC");
        twice.add_tag(&NodeLocation::head(14, 0, 1), MajorTag::Algo, "A3.SC");
        assert_eq!(once, twice);

        twice.add_tag(&NodeLocation::head(14, 0, 1), MajorTag::Impact, "A6");
        let node = twice.get_node(&NodeLocation::head(14, 0, 1)).unwrap();
        assert_eq!(node.summary(MajorTag::Impact).unwrap().text, "A6");
    }

    #[test]
    fn test_sort_nodes() {
        let mut registry = sample();
        registry.sort_nodes();
        let names: Vec<String> = registry.nodes().iter().map(UsefulNode::name).collect();
        assert_eq!(names, ["P14L0M7", "P14L0H1", "P15L0H2"]);
    }

    #[test]
    fn test_positions() {
        let mut registry = UsefulNodeRegistry::new();
        assert_eq!(registry.min_useful_position(), None);
        for p in [17, 9, 14, 9] {
            registry.add_useful_position(p);
        }
        assert_eq!(registry.positions(), vec![9, 14, 17]);
        assert_eq!(registry.min_useful_position(), Some(9));
        assert_eq!(registry.max_useful_position(), Some(17));
        registry.reset();
        assert!(registry.positions().is_empty());
    }

    #[test]
    fn test_filter_heads() {
        let registry = sample();
        let filters = [
            QuantaFilter::new(QuantaFilterKind::Must, FilterTarget::Position, "P14"),
            QuantaFilter::new(
                QuantaFilterKind::Contains,
                FilterTarget::Tag(MajorTag::Impact),
                "A6",
            ),
        ];
        let heads = registry.filter_heads(&filters);
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].name(), "P14L0H1");

        let neurons = registry.filter_nodes(&NodeFilter::Neuron);
        assert_eq!(neurons.len(), 1);
    }

    #[test]
    fn test_reset_tags_keeps_nodes() {
        let mut registry = sample();
        registry.reset_tags(Some(MajorTag::Impact));
        assert_eq!(registry.len(), 3);
        assert!(registry
            .nodes()
            .iter()
            .all(|n| n.summary(MajorTag::Impact).is_none()));
    }

    #[test]
    fn test_records_round_trip() {
        let mut registry = sample();
        registry.add_tag(&NodeLocation::head(14, 0, 1), MajorTag::Algo, "A3.SC");
        let records = registry.to_records();
        let mut reversed = records.clone();
        reversed.reverse();

        let mut restored = UsefulNodeRegistry::from_records(&reversed).unwrap();
        restored.sort_nodes();
        registry.sort_nodes();
        assert_eq!(restored.nodes(), registry.nodes());

        let attn = &records[1].tags["Attn"];
        assert_eq!(attn["P3"], "70");
    }

    #[test]
    fn test_save_and_load() {
        let registry = sample();
        let file = tempfile::NamedTempFile::new().unwrap();
        registry.save(file.path()).unwrap();
        let loaded = UsefulNodeRegistry::load(file.path()).unwrap();
        assert_eq!(loaded.to_records(), registry.to_records());
    }
}
