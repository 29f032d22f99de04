//! Predicates for selecting useful nodes
//!
//! Two forms are supported. [`NodeFilter`] is a composable tree used as
//! sub-task prerequisites. [`QuantaFilter`] is the flat
//! `[kind, target, minor]` list accepted by
//! [`UsefulNodeRegistry::filter_heads`](crate::UsefulNodeRegistry::filter_heads).

use crate::impact::AnswerImpact;
use crate::node::{answer_name_to_int, position_name_to_int, MajorTag, UsefulNode};

/// How a position filter compares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionCondition {
    #[default]
    Exact,
    /// Node position is at or after the named position
    Min,
    /// Node position is at or before the named position
    Max,
}

/// Composable node predicate
#[derive(Debug, Clone, PartialEq)]
pub enum NodeFilter {
    /// Matches every node
    Any,
    And(Vec<NodeFilter>),
    Or(Vec<NodeFilter>),
    Not(Box<NodeFilter>),
    /// Node is an attention head
    Head,
    /// Node is an MLP neuron
    Neuron,
    /// Node position compared against a position name such as `P14`
    Position(String, PositionCondition),
    /// Head attends to the named position
    Attention(String),
    /// Ablating the node affects the named answer digit, e.g. `A3`
    Impact(String),
    /// Some tag of the category contains the text
    Contains(MajorTag, String),
    /// Node carries the algorithm tag
    Algo(String),
}

impl NodeFilter {
    pub fn position(name: impl Into<String>) -> Self {
        Self::Position(name.into(), PositionCondition::Exact)
    }

    pub fn position_min(name: impl Into<String>) -> Self {
        Self::Position(name.into(), PositionCondition::Min)
    }

    pub fn position_max(name: impl Into<String>) -> Self {
        Self::Position(name.into(), PositionCondition::Max)
    }

    pub fn attention(name: impl Into<String>) -> Self {
        Self::Attention(name.into())
    }

    pub fn impact(name: impl Into<String>) -> Self {
        Self::Impact(name.into())
    }

    pub fn contains(major: MajorTag, text: impl Into<String>) -> Self {
        Self::Contains(major, text.into())
    }

    pub fn negate(filter: NodeFilter) -> Self {
        Self::Not(Box::new(filter))
    }

    pub fn matches(&self, node: &UsefulNode) -> bool {
        match self {
            Self::Any => true,
            Self::And(filters) => filters.iter().all(|f| f.matches(node)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(node)),
            Self::Not(filter) => !filter.matches(node),
            Self::Head => node.is_head(),
            Self::Neuron => !node.is_head(),
            Self::Position(name, condition) => match position_name_to_int(name) {
                Some(p) => match condition {
                    PositionCondition::Exact => node.position() == p,
                    PositionCondition::Min => node.position() >= p,
                    PositionCondition::Max => node.position() <= p,
                },
                None => false,
            },
            Self::Attention(name) => node.attends_to(name),
            Self::Impact(name) => {
                let impact: AnswerImpact = node.impact();
                answer_name_to_int(name).is_some_and(|digit| impact.contains(digit))
            }
            Self::Contains(major, text) => node.contains_tag(*major, text),
            Self::Algo(tag) => node.tag(MajorTag::Algo, tag).is_some(),
        }
    }
}

/// How one flat filter entry applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantaFilterKind {
    Must,
    Not,
    Contains,
    /// No effect (documents an optional property)
    May,
    /// No effect on position entries
    MustMay,
}

/// What a flat filter entry inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTarget {
    /// The node's position name
    Position,
    /// Tags of one category
    Tag(MajorTag),
}

/// One entry of a flat filter list, e.g. `[MUST, Position, "P14"]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantaFilter {
    pub kind: QuantaFilterKind,
    pub target: FilterTarget,
    pub minor: String,
}

impl QuantaFilter {
    pub fn new(kind: QuantaFilterKind, target: FilterTarget, minor: impl Into<String>) -> Self {
        Self {
            kind,
            target,
            minor: minor.into(),
        }
    }

    pub fn matches(&self, node: &UsefulNode) -> bool {
        match self.target {
            FilterTarget::Position => {
                let at = position_name_to_int(&self.minor) == Some(node.position());
                match self.kind {
                    QuantaFilterKind::Must | QuantaFilterKind::Contains => at,
                    QuantaFilterKind::Not => !at,
                    QuantaFilterKind::May | QuantaFilterKind::MustMay => true,
                }
            }
            FilterTarget::Tag(major) => {
                let has = node.contains_tag(major, &self.minor);
                match self.kind {
                    QuantaFilterKind::Must | QuantaFilterKind::Contains => has,
                    QuantaFilterKind::Not => !has,
                    QuantaFilterKind::May | QuantaFilterKind::MustMay => true,
                }
            }
        }
    }
}
