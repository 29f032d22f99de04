//! Answer-digit impact signatures
//!
//! An impact records which answer digits changed after an intervention.
//! It renders as `A` followed by the digits in descending order (`A653`),
//! or [`NO_IMPACT_TAG`] when nothing changed.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::codec::answer_str_from_tokens;
use crate::config::MathsConfig;

/// Rendering of an empty impact
pub const NO_IMPACT_TAG: &str = "(none)";

/// Set of answer digits affected by a change
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnswerImpact {
    digits: BTreeSet<usize>,
}

impl AnswerImpact {
    pub fn none() -> Self {
        Self::default()
    }

    /// Impact on exactly one answer digit
    pub fn single(digit: usize) -> Self {
        Self::from_digits([digit])
    }

    pub fn from_digits(digits: impl IntoIterator<Item = usize>) -> Self {
        Self {
            digits: digits.into_iter().collect(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.digits.is_empty()
    }

    pub fn contains(&self, digit: usize) -> bool {
        self.digits.contains(&digit)
    }

    /// Affected digits, most significant first
    pub fn digits(&self) -> impl Iterator<Item = usize> + '_ {
        self.digits.iter().rev().copied()
    }

    pub fn len(&self) -> usize {
        self.digits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digits.is_empty()
    }

    pub fn insert(&mut self, digit: usize) {
        self.digits.insert(digit);
    }

    pub fn merge(&mut self, other: &Self) {
        self.digits.extend(other.digits.iter().copied());
    }
}

impl fmt::Display for AnswerImpact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "{NO_IMPACT_TAG}");
        }
        write!(f, "A")?;
        for digit in self.digits() {
            write!(f, "{digit}")?;
        }
        Ok(())
    }
}

impl FromStr for AnswerImpact {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == NO_IMPACT_TAG {
            return Ok(Self::none());
        }
        let digits = s
            .strip_prefix('A')
            .ok_or_else(|| anyhow::anyhow!("Impact '{s}' does not start with 'A'"))?;
        digits
            .chars()
            .map(|c| {
                c.to_digit(10)
                    .map(|d| d as usize)
                    .ok_or_else(|| anyhow::anyhow!("Impact '{s}' has non-digit '{c}'"))
            })
            .collect::<Result<BTreeSet<_>>>()
            .map(|digits| Self { digits })
    }
}

/// Compare two rendered answers character by character
///
/// Character `i` of an `n` character answer is answer digit `n-1-i`, so
/// the sign of `+0888888` is `A7`.
pub fn answer_impact(clean_answer: &str, other_answer: &str) -> AnswerImpact {
    let clean: Vec<char> = clean_answer.chars().collect();
    let other: Vec<char> = other_answer.chars().collect();
    let n = clean.len();
    AnswerImpact::from_digits(
        (0..n)
            .filter(|&i| other.get(i) != Some(&clean[i]))
            .map(|i| n - 1 - i),
    )
}

/// Impact of a predicted answer against the answer embedded in a question
pub fn question_answer_impact(
    cfg: &MathsConfig,
    question: &[u32],
    answer_str: &str,
) -> AnswerImpact {
    answer_impact(&answer_str_from_tokens(cfg, question), answer_str)
}

/// Canonical sorted set of the digit characters in `text`
///
/// `sort_unique_digits("3a5953", true)` gives `"953"`.
pub fn sort_unique_digits(text: &str, reverse: bool) -> String {
    let digits: BTreeSet<char> = text.chars().filter(char::is_ascii_digit).collect();
    if reverse {
        digits.into_iter().rev().collect()
    } else {
        digits.into_iter().collect()
    }
}
