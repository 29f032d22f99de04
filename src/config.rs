//! Question layout and analysis configuration
//!
//! A question with `n_digits = 6` occupies `n_ctx = 22` token positions:
//!
//! ```text
//! P0..P5   P6  P7..P12   P13  P14   P15..P21
//! D5..D0   OP  D'5..D'0  =    sign  A6..A0
//! ```
//!
//! Operand digit `Dn` counts from the least significant digit, so `D0`
//! is the last operand token. Answer digit `A7` is the sign.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::node::position_name;
use crate::vocab::VOCAB_SIZE;

/// Seed used by the held-out correctness run
pub const CORRECTNESS_SEED: u64 = 345_621;

/// Configuration shared by every analysis stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MathsConfig {
    /// Digits per operand
    pub n_digits: usize,
    /// Percentage of generated questions that are additions
    pub perc_add: u32,
    /// Percentage of generated questions that are subtractions
    pub perc_sub: u32,
    /// Percentage of generated questions that are multiplications
    pub perc_mult: u32,
    /// Questions per generated batch
    pub batch_size: usize,
    /// Seed the model was trained with
    pub training_seed: u64,
    /// Seed for analysis batches (must differ from `training_seed`)
    pub analysis_seed: u64,
    /// Model vocabulary size
    pub d_vocab: usize,
}

impl Default for MathsConfig {
    fn default() -> Self {
        Self {
            n_digits: 6,
            perc_add: 100,
            perc_sub: 0,
            perc_mult: 0,
            batch_size: 64,
            training_seed: 372_001,
            analysis_seed: 673_023,
            d_vocab: VOCAB_SIZE,
        }
    }
}

impl MathsConfig {
    /// Default configuration for a given digit width
    pub fn with_digits(n_digits: usize) -> Self {
        Self {
            n_digits,
            ..Default::default()
        }
    }

    /// Set the operation mix (percentages)
    pub fn mix(mut self, perc_add: u32, perc_sub: u32, perc_mult: u32) -> Self {
        self.perc_add = perc_add;
        self.perc_sub = perc_sub;
        self.perc_mult = perc_mult;
        self
    }

    /// Load a configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            (1..=8).contains(&self.n_digits),
            "n_digits must be in 1..=8, got {}",
            self.n_digits
        );
        anyhow::ensure!(
            self.perc_add + self.perc_sub + self.perc_mult == 100,
            "Operation percentages must sum to 100 (add={}, sub={}, mult={})",
            self.perc_add,
            self.perc_sub,
            self.perc_mult
        );
        anyhow::ensure!(self.batch_size > 0, "batch_size must be positive");
        anyhow::ensure!(
            self.d_vocab >= VOCAB_SIZE,
            "d_vocab {} is smaller than the {VOCAB_SIZE}-token vocabulary",
            self.d_vocab
        );
        Ok(())
    }

    /// Tokens per question including the embedded answer
    pub const fn n_ctx(&self) -> usize {
        3 * self.n_digits + 4
    }

    /// Operand, operator and `=` tokens
    pub const fn num_question_positions(&self) -> usize {
        2 * self.n_digits + 2
    }

    /// Sign plus `n_digits + 1` answer digits
    pub const fn num_answer_positions(&self) -> usize {
        self.n_digits + 2
    }

    /// Position of the operator token
    pub const fn op_position(&self) -> usize {
        self.n_digits
    }

    /// Position of the answer sign token
    pub const fn sign_position(&self) -> usize {
        self.num_question_positions()
    }

    /// Exclusive upper bound on operand values
    pub fn operand_limit(&self) -> i64 {
        10_i64.pow(self.n_digits as u32)
    }

    /// Exclusive upper bound on answer magnitudes
    pub fn answer_limit(&self) -> i64 {
        10_i64.pow(self.n_digits as u32 + 1)
    }

    /// `d` repeated across every operand digit, e.g. 222222
    pub fn repeat_digit(&self, d: i64) -> i64 {
        (0..self.n_digits).fold(0, |acc, _| acc * 10 + d)
    }

    /// Token position of operand digit `Dn`
    pub const fn dn_position(&self, n: usize) -> usize {
        self.n_digits - 1 - n
    }

    /// Token position of operand digit `D'n`
    pub const fn ddn_position(&self, n: usize) -> usize {
        2 * self.n_digits - n
    }

    /// Token position of answer digit `An`
    pub const fn an_position(&self, n: usize) -> usize {
        self.n_ctx() - 1 - n
    }

    pub fn dn_to_position_name(&self, n: usize) -> String {
        position_name(self.dn_position(n))
    }

    pub fn ddn_to_position_name(&self, n: usize) -> String {
        position_name(self.ddn_position(n))
    }

    pub fn op_position_name(&self) -> String {
        position_name(self.op_position())
    }

    pub fn an_to_position_name(&self, n: usize) -> String {
        position_name(self.an_position(n))
    }

    /// Meaning of each token position, e.g. `D5`, `OP`, `D'0`, `=`, `A7`
    pub fn token_position_meanings(&self) -> Vec<String> {
        let n = self.n_digits;
        let mut meanings = Vec::with_capacity(self.n_ctx());
        meanings.extend((0..n).rev().map(|d| format!("D{d}")));
        meanings.push("OP".to_string());
        meanings.extend((0..n).rev().map(|d| format!("D'{d}")));
        meanings.push("=".to_string());
        meanings.extend((0..=n + 1).rev().map(|d| format!("A{d}")));
        meanings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_layout_for_six_digits() {
        let cfg = MathsConfig::default();
        assert_eq!(cfg.n_ctx(), 22);
        assert_eq!(cfg.num_question_positions(), 14);
        assert_eq!(cfg.num_answer_positions(), 8);
        assert_eq!(cfg.sign_position(), 14);
        assert_eq!(cfg.an_position(7), cfg.sign_position());
        assert_eq!(cfg.an_position(0), 21);
        assert_eq!(cfg.dn_position(0), 5);
        assert_eq!(cfg.ddn_position(0), 12);
        assert_eq!(cfg.ddn_position(5), 7);
        assert_eq!(cfg.op_position_name(), "P6");
    }

    #[test]
    fn test_repeat_digit() {
        let cfg = MathsConfig::default();
        assert_eq!(cfg.repeat_digit(2), 222_222);
        assert_eq!(cfg.repeat_digit(0), 0);
        assert_eq!(MathsConfig::with_digits(3).repeat_digit(7), 777);
    }

    #[test]
    fn test_position_meanings() {
        let cfg = MathsConfig::with_digits(2);
        assert_eq!(
            cfg.token_position_meanings(),
            vec!["D1", "D0", "OP", "D'1", "D'0", "=", "A3", "A2", "A1", "A0"]
        );
        assert_eq!(cfg.token_position_meanings().len(), cfg.n_ctx());
    }

    #[test]
    fn test_validate_rejects_bad_mix() {
        let cfg = MathsConfig::default().mix(50, 40, 0);
        assert!(cfg.validate().is_err());
        assert!(MathsConfig::default().mix(50, 50, 0).validate().is_ok());
        assert!(MathsConfig::with_digits(9).validate().is_err());
    }

    #[test]
    fn test_load_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"n_digits": 5, "perc_add": 80, "perc_sub": 20}}"#).unwrap();
        let cfg = MathsConfig::load(file.path()).unwrap();
        assert_eq!(cfg.n_digits, 5);
        assert_eq!(cfg.perc_sub, 20);
        assert_eq!(cfg.batch_size, 64);
    }
}
