//! Large-scale correctness run
//!
//! Measures model accuracy on a held-out stream of generated questions,
//! separately for addition and subtraction, and summarises it as a count
//! of nines with a Wilson confidence interval.

use anyhow::Result;
use statrs::distribution::{ContinuousCDF, Normal};
use std::fmt;
use tracing::info;

use crate::ablation::AblationConfig;
use crate::config::{MathsConfig, CORRECTNESS_SEED};
use crate::generator::QuestionGenerator;
use crate::harness::test_questions_by_impact;
use crate::model::MathsBackend;
use crate::vocab::MathsToken;

/// Batches between progress lines
const PROGRESS_INTERVAL: usize = 100;

/// Outcome of a correctness run for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccuracySummary {
    pub operation: MathsToken,
    pub questions: usize,
    pub fails: usize,
}

impl AccuracySummary {
    pub fn successes(&self) -> usize {
        self.questions - self.fails
    }

    pub fn accuracy(&self) -> f64 {
        if self.questions == 0 {
            return 0.0;
        }
        self.successes() as f64 / self.questions as f64
    }

    /// Number of nines the run supports, from six down to two
    ///
    /// With a million questions, at most 1 failure is six nines, at most
    /// 10 five nines and so on. Bands scale with the question count and a
    /// band is only awarded when the count is large enough to resolve it.
    pub fn nines(&self) -> Option<u32> {
        (2..=6u32).rev().find(|&k| {
            let band = self.questions as f64 / 10f64.powi(k as i32);
            band >= 1.0 && self.fails as f64 <= band
        })
    }

    /// 95% Wilson score interval of the accuracy
    pub fn wilson_interval(&self) -> Result<(f64, f64)> {
        anyhow::ensure!(self.questions > 0, "No questions were tested");
        let z = Normal::new(0.0, 1.0)?.inverse_cdf(0.975);
        let n = self.questions as f64;
        let p = self.accuracy();
        let z2 = z * z;
        let denom = 1.0 + z2 / n;
        let centre = (p + z2 / (2.0 * n)) / denom;
        let half = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt() / denom;
        Ok(((centre - half).max(0.0), (centre + half).min(1.0)))
    }
}

impl fmt::Display for AccuracySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.operation {
            MathsToken::Plus => "Addition",
            MathsToken::Minus => "Subtraction",
            _ => "Other",
        };
        write!(
            f,
            "{op}: {} questions, {} successes, {} fails, accuracy {:.6}",
            self.questions,
            self.successes(),
            self.fails,
            self.accuracy()
        )?;
        match self.nines() {
            Some(k) => write!(f, " ({k} nines)"),
            None => write!(f, " (under two nines)"),
        }
    }
}

/// Test the model on about `num_questions` fresh questions per operation
///
/// Addition runs when `perc_add > 0` and subtraction when `perc_sub > 0`.
/// Questions come from a generator seeded with the correctness seed, which
/// must differ from the training seed.
pub fn test_correctness_on_num_questions(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &AblationConfig,
    num_questions: usize,
    enrich: bool,
) -> Result<Vec<AccuracySummary>> {
    anyhow::ensure!(
        CORRECTNESS_SEED != cfg.training_seed,
        "Correctness seed {CORRECTNESS_SEED} must differ from the training seed"
    );

    let mut operations = Vec::new();
    if cfg.perc_add > 0 {
        operations.push((MathsToken::Plus, cfg.clone().mix(100, 0, 0)));
    }
    if cfg.perc_sub > 0 {
        operations.push((MathsToken::Minus, cfg.clone().mix(0, 100, 0)));
    }

    let num_batches = 1 + num_questions / cfg.batch_size;
    let mut summaries = Vec::with_capacity(operations.len());
    for (operation, op_cfg) in operations {
        let mut generator = QuestionGenerator::new(&op_cfg, CORRECTNESS_SEED, enrich)?;
        let mut summary = AccuracySummary {
            operation,
            questions: 0,
            fails: 0,
        };
        for batch_index in 0..num_batches {
            let batch = generator.next_batch()?;
            summary.fails += test_questions_by_impact(model, &op_cfg, acfg, &batch, 0, false)?;
            summary.questions += batch.len();
            if (batch_index + 1) % PROGRESS_INTERVAL == 0 {
                info!(
                    "{operation}: {} batches, {} questions, {} fails",
                    batch_index + 1,
                    summary.questions,
                    summary.fails
                );
            }
        }
        info!("{summary}");
        summaries.push(summary);
    }
    Ok(summaries)
}
