//! Question complexity classification
//!
//! Addition questions are graded `S0`..`S5` by how far a carry cascades
//! through digit pairs summing to 9. Subtraction is graded `M0`..`M4`
//! (non-negative answers) or `N1`..`N4` (negative answers) by how far a
//! borrow cascades through equal digit pairs.
//!
//! Cascades are matched longest first. A question whose carry runs
//! through four boundary digits is `S5` even though it also contains
//! shorter runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::codec::tokens_to_unsigned_int;
use crate::config::MathsConfig;
use crate::node::{MajorTag, UsefulNode};
use crate::vocab::{is_digit, tokens_to_string, MathsToken};

/// Prefix of addition complexity tags
pub const ADD_COMPLEXITY_PREFIX: &str = "S";
/// Prefix of non-negative subtraction complexity tags
pub const SUB_COMPLEXITY_PREFIX: &str = "M";
/// Prefix of negative subtraction complexity tags
pub const NEG_COMPLEXITY_PREFIX: &str = "N";

/// Broad category a question falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QuestionCategory {
    Add,
    Sub,
    Neg,
    Unknown,
}

impl QuestionCategory {
    /// Registry category that failures of this kind are tagged under
    pub const fn major_tag(self) -> Option<MajorTag> {
        match self {
            Self::Add => Some(MajorTag::MathAdd),
            Self::Sub => Some(MajorTag::MathSub),
            Self::Neg => Some(MajorTag::MathNeg),
            Self::Unknown => None,
        }
    }

    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Add => ADD_COMPLEXITY_PREFIX,
            Self::Sub => SUB_COMPLEXITY_PREFIX,
            Self::Neg => NEG_COMPLEXITY_PREFIX,
            Self::Unknown => "",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "Math.Add",
            Self::Sub => "Math.Sub",
            Self::Neg => "Math.Neg",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for QuestionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complexity class of a single question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComplexityTag {
    /// No carry
    AddS0,
    /// Carries, none cascading
    AddS1,
    AddS2,
    AddS3,
    AddS4,
    /// Carry cascading through four or more digits
    AddS5,
    /// No borrow
    SubM0,
    /// Borrows, none cascading
    SubM1,
    SubM2,
    SubM3,
    /// Borrow cascading through three or more digits
    SubM4,
    NegN1,
    NegN2,
    NegN3,
    NegN4,
    Unknown,
}

impl ComplexityTag {
    pub const ALL: [Self; 16] = [
        Self::AddS0,
        Self::AddS1,
        Self::AddS2,
        Self::AddS3,
        Self::AddS4,
        Self::AddS5,
        Self::SubM0,
        Self::SubM1,
        Self::SubM2,
        Self::SubM3,
        Self::SubM4,
        Self::NegN1,
        Self::NegN2,
        Self::NegN3,
        Self::NegN4,
        Self::Unknown,
    ];

    pub const fn category(self) -> QuestionCategory {
        match self {
            Self::AddS0 | Self::AddS1 | Self::AddS2 | Self::AddS3 | Self::AddS4 | Self::AddS5 => {
                QuestionCategory::Add
            }
            Self::SubM0 | Self::SubM1 | Self::SubM2 | Self::SubM3 | Self::SubM4 => {
                QuestionCategory::Sub
            }
            Self::NegN1 | Self::NegN2 | Self::NegN3 | Self::NegN4 => QuestionCategory::Neg,
            Self::Unknown => QuestionCategory::Unknown,
        }
    }

    /// Numeric grade within the category
    pub const fn level(self) -> Option<usize> {
        match self {
            Self::AddS0 | Self::SubM0 => Some(0),
            Self::AddS1 | Self::SubM1 | Self::NegN1 => Some(1),
            Self::AddS2 | Self::SubM2 | Self::NegN2 => Some(2),
            Self::AddS3 | Self::SubM3 | Self::NegN3 => Some(3),
            Self::AddS4 | Self::SubM4 | Self::NegN4 => Some(4),
            Self::AddS5 => Some(5),
            Self::Unknown => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AddS0 => "S0",
            Self::AddS1 => "S1",
            Self::AddS2 => "S2",
            Self::AddS3 => "S3",
            Self::AddS4 => "S4",
            Self::AddS5 => "S5",
            Self::SubM0 => "M0",
            Self::SubM1 => "M1",
            Self::SubM2 => "M2",
            Self::SubM3 => "M3",
            Self::SubM4 => "M4",
            Self::NegN1 => "N1",
            Self::NegN2 => "N2",
            Self::NegN3 => "N3",
            Self::NegN4 => "N4",
            Self::Unknown => "Unknown",
        }
    }

    /// Tag for a cascade of `len` boundary digits after a carry or borrow
    fn from_cascade(category: QuestionCategory, len: usize) -> Self {
        match (category, len) {
            (QuestionCategory::Add, 1) => Self::AddS2,
            (QuestionCategory::Add, 2) => Self::AddS3,
            (QuestionCategory::Add, 3) => Self::AddS4,
            (QuestionCategory::Add, _) => Self::AddS5,
            (QuestionCategory::Sub, 1) => Self::SubM2,
            (QuestionCategory::Sub, 2) => Self::SubM3,
            (QuestionCategory::Sub, _) => Self::SubM4,
            (QuestionCategory::Neg, 1) => Self::NegN2,
            (QuestionCategory::Neg, 2) => Self::NegN3,
            (QuestionCategory::Neg, _) => Self::NegN4,
            (QuestionCategory::Unknown, _) => Self::Unknown,
        }
    }
}

impl fmt::Display for ComplexityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-digit carry and boundary flags, least significant digit first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigitVectors {
    /// Digit generates a carry (sum > 9) or borrow (D < D')
    pub carry: Vec<bool>,
    /// Digit propagates an incoming carry (sum == 9) or borrow (D == D')
    pub boundary: Vec<bool>,
}

impl DigitVectors {
    fn new(n_digits: usize) -> Self {
        Self {
            carry: vec![false; n_digits],
            boundary: vec![false; n_digits],
        }
    }

    pub fn any_carry(&self) -> bool {
        self.carry.iter().any(|&c| c)
    }

    pub fn any_boundary(&self) -> bool {
        self.boundary.iter().any(|&b| b)
    }

    /// True if a carry at `dn` is followed by `len` boundary digits
    fn cascade_at(&self, dn: usize, len: usize) -> bool {
        self.carry[dn] && (dn + 1..=dn + len).all(|d| self.boundary[d])
    }

    /// Longest cascade up to `max_len`, checked from the longest down
    pub fn longest_cascade(&self, max_len: usize) -> Option<usize> {
        let n = self.carry.len();
        (1..=max_len)
            .rev()
            .filter(|&len| len < n)
            .find(|&len| (0..n - len).any(|dn| self.cascade_at(dn, len)))
    }

    /// Longest cascade of any length
    pub fn max_cascade_length(&self) -> Option<usize> {
        self.longest_cascade(self.carry.len())
    }
}

/// Operand digit pair for `Dn` and `D'n` (`n` counts from the least significant)
fn digit_pair(cfg: &MathsConfig, question: &[u32], n: usize) -> (i64, i64) {
    (
        i64::from(question[cfg.dn_position(n)]),
        i64::from(question[cfg.ddn_position(n)]),
    )
}

/// Carry (sum > 9) and boundary (sum == 9) flags of an addition
pub fn addition_vectors(cfg: &MathsConfig, question: &[u32]) -> DigitVectors {
    let mut v = DigitVectors::new(cfg.n_digits);
    for n in 0..cfg.n_digits {
        let (d, dd) = digit_pair(cfg, question, n);
        v.carry[n] = d + dd > 9;
        v.boundary[n] = d + dd == 9;
    }
    v
}

/// Borrow (D < D') and boundary (D == D') flags of a subtraction
pub fn subtraction_vectors(cfg: &MathsConfig, question: &[u32]) -> DigitVectors {
    let mut v = DigitVectors::new(cfg.n_digits);
    for n in 0..cfg.n_digits {
        let (d, dd) = digit_pair(cfg, question, n);
        v.carry[n] = d < dd;
        v.boundary[n] = d == dd;
    }
    v
}

/// Highest digit where either operand is non-zero
fn max_question_digit(cfg: &MathsConfig, question: &[u32]) -> usize {
    (0..cfg.n_digits)
        .rev()
        .find(|&n| {
            let (d, dd) = digit_pair(cfg, question, n);
            d > 0 || dd > 0
        })
        .unwrap_or(0)
}

fn operands_are_digits(cfg: &MathsConfig, question: &[u32]) -> bool {
    question.len() >= cfg.num_question_positions()
        && (0..cfg.n_digits).all(|n| {
            is_digit(question[cfg.dn_position(n)]) && is_digit(question[cfg.ddn_position(n)])
        })
}

/// Classify a question by its operand digits
///
/// Never fails: malformed questions and unsupported operators are logged
/// and reported as [`ComplexityTag::Unknown`].
pub fn classify(cfg: &MathsConfig, question: &[u32]) -> (QuestionCategory, ComplexityTag) {
    if !operands_are_digits(cfg, question) {
        warn!(
            "Cannot classify malformed question {}",
            tokens_to_string(question)
        );
        return (QuestionCategory::Unknown, ComplexityTag::Unknown);
    }

    match MathsToken::from_id(question[cfg.op_position()]) {
        Some(MathsToken::Plus) => {
            let v = addition_vectors(cfg, question);
            let tag = if !v.any_carry() {
                ComplexityTag::AddS0
            } else if !v.any_boundary() {
                ComplexityTag::AddS1
            } else {
                v.longest_cascade(4)
                    .map_or(ComplexityTag::AddS1, |len| {
                        ComplexityTag::from_cascade(QuestionCategory::Add, len)
                    })
            };
            (QuestionCategory::Add, tag)
        }
        Some(MathsToken::Minus) => {
            let n = cfg.n_digits;
            let a = tokens_to_unsigned_int(question, 0, n);
            let b = tokens_to_unsigned_int(question, n + 1, n);
            let mut v = subtraction_vectors(cfg, question);
            if a >= b {
                let tag = if !v.any_carry() {
                    ComplexityTag::SubM0
                } else {
                    v.longest_cascade(3)
                        .map_or(ComplexityTag::SubM1, |len| {
                            ComplexityTag::from_cascade(QuestionCategory::Sub, len)
                        })
                };
                return (QuestionCategory::Sub, tag);
            }

            // Equal zero pairs above both operands do not propagate anything
            let max_digit = max_question_digit(cfg, question);
            for boundary in v.boundary.iter_mut().skip(max_digit + 1) {
                *boundary = false;
            }

            if !v.any_carry() {
                warn!(
                    "Negative answer without any borrow in {}",
                    tokens_to_string(question)
                );
                return (QuestionCategory::Unknown, ComplexityTag::Unknown);
            }

            let tag = v
                .longest_cascade(3)
                .map_or(ComplexityTag::NegN1, |len| {
                    ComplexityTag::from_cascade(QuestionCategory::Neg, len)
                });
            (QuestionCategory::Neg, tag)
        }
        _ => {
            warn!(
                "Unsupported operator in question {}",
                tokens_to_string(question)
            );
            (QuestionCategory::Unknown, ComplexityTag::Unknown)
        }
    }
}

/// Operations a node's complexity tags cover, as a 0 to 3 letter string
///
/// A node failing both addition and negative subtraction questions gives `"SN"`.
pub fn node_operation_coverage(node: &UsefulNode) -> String {
    [
        (MajorTag::MathAdd, ADD_COMPLEXITY_PREFIX),
        (MajorTag::MathSub, SUB_COMPLEXITY_PREFIX),
        (MajorTag::MathNeg, NEG_COMPLEXITY_PREFIX),
    ]
    .iter()
    .filter(|(major, prefix)| node.min_tag_suffix(*major, prefix).is_some())
    .map(|(_, prefix)| *prefix)
    .collect()
}

/// Counts of nodes by the operations they cover
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationCoverage {
    pub num_add: usize,
    pub num_sub: usize,
    pub num_neg: usize,
    pub num_triple: usize,
    pub num_double: usize,
    pub num_single: usize,
}

pub fn nodes_operation_coverage<'a>(
    nodes: impl IntoIterator<Item = &'a UsefulNode>,
) -> OperationCoverage {
    let mut coverage = OperationCoverage::default();
    for node in nodes {
        let text = node_operation_coverage(node);
        coverage.num_add += usize::from(text.contains(ADD_COMPLEXITY_PREFIX));
        coverage.num_sub += usize::from(text.contains(SUB_COMPLEXITY_PREFIX));
        coverage.num_neg += usize::from(text.contains(NEG_COMPLEXITY_PREFIX));
        match text.len() {
            3 => coverage.num_triple += 1,
            2 => coverage.num_double += 1,
            1 => coverage.num_single += 1,
            _ => {}
        }
    }
    coverage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::make_question;
    use crate::node::NodeLocation;

    fn classify_ops(cfg: &MathsConfig, a: i64, b: i64, op: MathsToken) -> ComplexityTag {
        let q = make_question(cfg, a, b, op).unwrap();
        classify(cfg, &q).1
    }

    #[test]
    fn test_addition_tiers() {
        let cfg = MathsConfig::default();
        let add = |a, b| classify_ops(&cfg, a, b, MathsToken::Plus);
        assert_eq!(add(222_222, 111_111), ComplexityTag::AddS0);
        assert_eq!(add(5, 5), ComplexityTag::AddS1);
        assert_eq!(add(45, 55), ComplexityTag::AddS2);
        assert_eq!(add(445, 555), ComplexityTag::AddS3);
        assert_eq!(add(4445, 5555), ComplexityTag::AddS4);
        assert_eq!(add(44_445, 55_555), ComplexityTag::AddS5);
        assert_eq!(add(444_445, 555_555), ComplexityTag::AddS5);
    }

    #[test]
    fn test_all_carry_without_boundary_is_s1() {
        let cfg = MathsConfig::default();
        let q = make_question(&cfg, 555_555, 555_555, MathsToken::Plus).unwrap();
        assert_eq!(addition_vectors(&cfg, &q).carry, vec![true; 6]);
        assert_eq!(classify(&cfg, &q), (QuestionCategory::Add, ComplexityTag::AddS1));
    }

    #[test]
    fn test_longest_cascade_wins() {
        let cfg = MathsConfig::default();
        // Cascade of 1 from D0, cascade of 3 from D2
        let q = make_question(&cfg, 444_645, 555_655, MathsToken::Plus).unwrap();
        let v = addition_vectors(&cfg, &q);
        assert_eq!(v.longest_cascade(4), Some(3));
        assert_eq!(classify(&cfg, &q).1, ComplexityTag::AddS4);
    }

    #[test]
    fn test_subtraction_tiers() {
        let cfg = MathsConfig::default();
        let sub = |a, b| classify_ops(&cfg, a, b, MathsToken::Minus);
        assert_eq!(sub(999_999, 111_111), ComplexityTag::SubM0);
        assert_eq!(sub(100_000, 99_999), ComplexityTag::SubM1);
        assert_eq!(sub(21, 12), ComplexityTag::SubM1);
        assert_eq!(sub(321, 222), ComplexityTag::SubM2);
        assert_eq!(sub(3221, 2222), ComplexityTag::SubM3);
        assert_eq!(sub(32_221, 22_222), ComplexityTag::SubM4);
        assert_eq!(sub(322_221, 222_222), ComplexityTag::SubM4);
    }

    #[test]
    fn test_negative_tiers() {
        let cfg = MathsConfig::default();
        let sub = |a, b| classify_ops(&cfg, a, b, MathsToken::Minus);
        assert_eq!(sub(1, 2), ComplexityTag::NegN1);
        assert_eq!(sub(11, 12), ComplexityTag::NegN2);
        assert_eq!(sub(111, 112), ComplexityTag::NegN3);
        assert_eq!(sub(1111, 1112), ComplexityTag::NegN4);
    }

    #[test]
    fn test_negative_ignores_leading_zero_pairs() {
        let cfg = MathsConfig::default();
        let q = make_question(&cfg, 1, 2, MathsToken::Minus).unwrap();
        assert!(subtraction_vectors(&cfg, &q).boundary[5]);
        assert_eq!(classify(&cfg, &q), (QuestionCategory::Neg, ComplexityTag::NegN1));
    }

    #[test]
    fn test_multiplication_is_unknown() {
        let cfg = MathsConfig::default();
        assert_eq!(
            classify_ops(&cfg, 12, 34, MathsToken::Mult),
            ComplexityTag::Unknown
        );
    }

    #[test]
    fn test_malformed_question_is_unknown() {
        let cfg = MathsConfig::with_digits(2);
        assert_eq!(
            classify(&cfg, &[1, 2]),
            (QuestionCategory::Unknown, ComplexityTag::Unknown)
        );
        let mut q = make_question(&cfg, 12, 34, MathsToken::Plus).unwrap();
        q[0] = 42;
        assert_eq!(classify(&cfg, &q).1, ComplexityTag::Unknown);
    }

    #[test]
    fn test_longer_cascade_never_simpler() {
        let cfg = MathsConfig::default();
        let mut prev = None;
        for (a, b) in [(5, 5), (45, 55), (445, 555), (4445, 5555), (44_445, 55_555)] {
            let q = make_question(&cfg, a, b, MathsToken::Plus).unwrap();
            let v = addition_vectors(&cfg, &q);
            let tag = classify(&cfg, &q).1;
            if let Some((prev_len, prev_tag)) = prev {
                assert!(v.max_cascade_length() > prev_len);
                assert!(tag >= prev_tag);
            }
            prev = Some((v.max_cascade_length(), tag));
        }
    }

    #[test]
    fn test_operation_coverage() {
        let loc = NodeLocation::head(14, 0, 1);
        let mut add_only = UsefulNode::new(loc);
        add_only.add_tag(MajorTag::MathAdd, "S23");
        let mut both = UsefulNode::new(NodeLocation::head(15, 0, 1));
        both.add_tag(MajorTag::MathAdd, "S1");
        both.add_tag(MajorTag::MathNeg, "N2");
        let mut all = UsefulNode::new(NodeLocation::head(16, 0, 1));
        all.add_tag(MajorTag::MathAdd, "S1");
        all.add_tag(MajorTag::MathSub, "M0");
        all.add_tag(MajorTag::MathNeg, "N2");

        assert_eq!(node_operation_coverage(&both), "SN");
        let coverage = nodes_operation_coverage([&add_only, &both, &all]);
        assert_eq!(coverage.num_add, 3);
        assert_eq!(coverage.num_sub, 1);
        assert_eq!(coverage.num_neg, 2);
        assert_eq!(coverage.num_triple, 1);
        assert_eq!(coverage.num_double, 1);
        assert_eq!(coverage.num_single, 1);
    }
}
