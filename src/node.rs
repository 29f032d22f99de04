//! Node locations and their discovered tags

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::impact::AnswerImpact;

/// Token position name, e.g. `P14`
pub fn position_name(position: usize) -> String {
    format!("P{position}")
}

/// Inverse of [`position_name`]
pub fn position_name_to_int(name: &str) -> Option<usize> {
    name.strip_prefix('P')?.parse().ok()
}

/// Answer digit name, e.g. `A3` (the sign is `A{n_digits + 1}`)
pub fn answer_name(digit: usize) -> String {
    format!("A{digit}")
}

/// Inverse of [`answer_name`]
pub fn answer_name_to_int(name: &str) -> Option<usize> {
    name.strip_prefix('A')?.parse().ok()
}

/// Row name within a position: `L0H1` for a head, `L0M3` for a neuron
pub fn row_location_name(layer: usize, is_head: bool, index: usize) -> String {
    if is_head {
        format!("L{layer}H{index}")
    } else {
        format!("L{layer}M{index}")
    }
}

/// Address of one attention head or MLP neuron at one token position
///
/// The derived ordering is the canonical report order:
/// position, layer, neurons before heads, index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeLocation {
    pub position: usize,
    pub layer: usize,
    pub is_head: bool,
    /// Head index when `is_head`, else MLP neuron index
    pub index: usize,
}

impl NodeLocation {
    pub fn new(position: usize, layer: usize, is_head: bool, index: usize) -> Self {
        Self {
            position,
            layer,
            is_head,
            index,
        }
    }

    pub fn head(position: usize, layer: usize, head: usize) -> Self {
        Self::new(position, layer, true, head)
    }

    pub fn neuron(position: usize, layer: usize, neuron: usize) -> Self {
        Self::new(position, layer, false, neuron)
    }

    /// Full name, e.g. `P14L0H1`
    pub fn name(&self) -> String {
        format!(
            "{}{}",
            position_name(self.position),
            row_location_name(self.layer, self.is_head, self.index)
        )
    }
}

impl fmt::Display for NodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Category of a node tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MajorTag {
    /// Percentage of questions failed when the node is ablated
    Fail,
    /// Answer digits affected by ablation
    Impact,
    /// Algorithm sub-task the node was shown to perform
    Algo,
    /// Token positions the head attends to
    Attention,
    /// Addition complexity classes that fail when ablated
    MathAdd,
    /// Non-negative subtraction complexity classes that fail when ablated
    MathSub,
    /// Negative subtraction complexity classes that fail when ablated
    MathNeg,
    /// Interpretable principal components
    Pca,
}

impl MajorTag {
    pub const ALL: [Self; 8] = [
        Self::Fail,
        Self::Impact,
        Self::Algo,
        Self::Attention,
        Self::MathAdd,
        Self::MathSub,
        Self::MathNeg,
        Self::Pca,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fail => "Fail",
            Self::Impact => "Impact",
            Self::Algo => "Algo",
            Self::Attention => "Attn",
            Self::MathAdd => "Math.Add",
            Self::MathSub => "Math.Sub",
            Self::MathNeg => "Math.Neg",
            Self::Pca => "PCA",
        }
    }

    /// Categories that hold one summary value per node
    pub const fn is_summary(self) -> bool {
        matches!(
            self,
            Self::Fail | Self::Impact | Self::MathAdd | Self::MathSub | Self::MathNeg
        )
    }

    /// Split a written minor tag into its store key and value text
    ///
    /// Attention tags `P14=75` key on the position, summaries share the
    /// empty key, other tags key on their own text.
    pub fn split_minor(self, minor: &str) -> (String, String) {
        match self {
            Self::Attention => match minor.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (minor.to_string(), String::new()),
            },
            _ if self.is_summary() => (String::new(), minor.to_string()),
            _ => (minor.to_string(), minor.to_string()),
        }
    }

    /// Inverse of [`MajorTag::split_minor`]
    pub fn join_minor(self, key: &str, value: &TagValue) -> String {
        match self {
            Self::Attention if !value.text.is_empty() => format!("{key}={}", value.text),
            Self::Attention => key.to_string(),
            _ => value.text.clone(),
        }
    }
}

impl fmt::Display for MajorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MajorTag {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown major tag '{s}'"))
    }
}

/// Stored tag value, parsed once when written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagValue {
    /// Leading letters, e.g. `S` in `S234` (empty for plain numbers)
    pub category: String,
    /// Shade of the tag: the number itself for plain numbers, else the
    /// first digit after the category
    pub severity: Option<u32>,
    /// Text as written
    pub text: String,
}

impl TagValue {
    pub fn parse(text: &str) -> Self {
        let split = text
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(text.len());
        let (category, rest) = text.split_at(split);
        let number: String = rest.chars().take_while(char::is_ascii_digit).collect();
        let severity = if category.is_empty() {
            number.parse().ok()
        } else {
            number.chars().next().and_then(|c| c.to_digit(10))
        };
        Self {
            category: category.to_string(),
            severity,
            text: text.to_string(),
        }
    }

    /// Digits following the category, e.g. `[2, 3, 4]` for `S234`
    pub fn digits(&self) -> Vec<u32> {
        self.text[self.category.len()..]
            .chars()
            .map_while(|c| c.to_digit(10))
            .collect()
    }
}

/// A node known to matter, with the facts discovered about it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsefulNode {
    location: NodeLocation,
    tags: BTreeMap<MajorTag, BTreeMap<String, TagValue>>,
}

impl UsefulNode {
    pub fn new(location: NodeLocation) -> Self {
        Self {
            location,
            tags: BTreeMap::new(),
        }
    }

    pub fn location(&self) -> NodeLocation {
        self.location
    }

    pub fn name(&self) -> String {
        self.location.name()
    }

    pub fn is_head(&self) -> bool {
        self.location.is_head
    }

    pub fn position(&self) -> usize {
        self.location.position
    }

    /// Write a tag, replacing any value already held under its key
    pub fn add_tag(&mut self, major: MajorTag, minor: &str) {
        let (key, value) = major.split_minor(minor);
        self.insert_value(major, key, TagValue::parse(&value));
    }

    pub(crate) fn insert_value(&mut self, major: MajorTag, key: String, value: TagValue) {
        self.tags.entry(major).or_default().insert(key, value);
    }

    /// Value stored under an exact key
    pub fn tag(&self, major: MajorTag, key: &str) -> Option<&TagValue> {
        self.tags.get(&major)?.get(key)
    }

    /// Summary value of a summary category
    pub fn summary(&self, major: MajorTag) -> Option<&TagValue> {
        self.tag(major, "")
    }

    /// All `(key, value)` pairs of one category
    pub fn values(&self, major: MajorTag) -> impl Iterator<Item = (&str, &TagValue)> {
        self.tags
            .get(&major)
            .into_iter()
            .flat_map(|entries| entries.iter().map(|(k, v)| (k.as_str(), v)))
    }

    pub fn tags(&self) -> &BTreeMap<MajorTag, BTreeMap<String, TagValue>> {
        &self.tags
    }

    /// True if any written tag of the category contains `text`
    pub fn contains_tag(&self, major: MajorTag, text: &str) -> bool {
        self.values(major)
            .any(|(key, value)| major.join_minor(key, value).contains(text))
    }

    /// Lowest written tag of the category that starts with `prefix`
    pub fn min_tag_suffix(&self, major: MajorTag, prefix: &str) -> Option<String> {
        self.values(major)
            .map(|(key, value)| major.join_minor(key, value))
            .filter(|text| text.starts_with(prefix))
            .min()
    }

    /// Answer digits recorded by the impact summary
    pub fn impact(&self) -> AnswerImpact {
        self.summary(MajorTag::Impact)
            .map(|v| AnswerImpact::from_digits(v.digits().into_iter().map(|d| d as usize)))
            .unwrap_or_default()
    }

    /// True if the head has an attention tag for the named position
    pub fn attends_to(&self, position_name: &str) -> bool {
        self.tag(MajorTag::Attention, position_name).is_some()
    }

    /// Remove one category of tags, or all tags when `major` is `None`
    pub fn reset_tags(&mut self, major: Option<MajorTag>) {
        match major {
            Some(major) => {
                self.tags.remove(&major);
            }
            None => self.tags.clear(),
        }
    }

    /// Tags as `Major:minor` strings, e.g. `Impact:A653`
    pub fn tag_strings(&self) -> Vec<String> {
        self.tags
            .iter()
            .flat_map(|(major, entries)| {
                entries
                    .iter()
                    .map(move |(key, value)| format!("{major}:{}", major.join_minor(key, value)))
            })
            .collect()
    }
}
