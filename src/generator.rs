//! Seeded generator of question batches
//!
//! Batches are a pure function of the configuration and the seed, so the
//! same generator replays byte-identical batches after [`QuestionGenerator::reset`].
//! With `enrich` set, a share of addition and subtraction questions get a
//! carry (or borrow) cascade spliced in, so evaluation sets are not
//! dominated by `S0`/`M0` questions.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::codec::{make_question, QuestionBatch};
use crate::config::MathsConfig;
use crate::vocab::MathsToken;

/// Share of questions that receive a spliced cascade when enriching
const ENRICH_FRACTION: f64 = 0.4;

/// Endless, restartable stream of question batches
#[derive(Debug, Clone)]
pub struct QuestionGenerator {
    cfg: MathsConfig,
    seed: u64,
    enrich: bool,
    rng: StdRng,
}

impl QuestionGenerator {
    pub fn new(cfg: &MathsConfig, seed: u64, enrich: bool) -> Result<Self> {
        cfg.validate()?;
        debug!(
            "Question generator: seed {seed}, add {}%, sub {}%, mult {}%, enrich {enrich}",
            cfg.perc_add, cfg.perc_sub, cfg.perc_mult
        );
        Ok(Self {
            cfg: cfg.clone(),
            seed,
            enrich,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Restart the stream from the seed
    pub fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
    }

    /// Next batch of `batch_size` questions
    pub fn next_batch(&mut self) -> Result<QuestionBatch> {
        let mut batch = QuestionBatch::new(self.cfg.n_ctx());
        for _ in 0..self.cfg.batch_size {
            let operator = self.sample_operator();
            let (first, second) = self.sample_operands(operator);
            batch.push_row(&make_question(&self.cfg, first, second, operator)?)?;
        }
        Ok(batch)
    }

    fn sample_operator(&mut self) -> MathsToken {
        let r = self.rng.gen_range(0..100);
        if r < self.cfg.perc_add {
            MathsToken::Plus
        } else if r < self.cfg.perc_add + self.cfg.perc_sub {
            MathsToken::Minus
        } else {
            MathsToken::Mult
        }
    }

    fn sample_operands(&mut self, operator: MathsToken) -> (i64, i64) {
        let n = self.cfg.n_digits;
        if operator == MathsToken::Mult {
            // Widths chosen so the product fits in n_digits + 1 digits
            let k = self.rng.gen_range(1..=n);
            let first = self.rng.gen_range(0..10i64.pow(k as u32));
            let second_limit = 10i64.pow((n + 1 - k) as u32).min(self.cfg.operand_limit());
            let second = self.rng.gen_range(0..second_limit);
            return (first, second);
        }

        // Least significant digit first
        let mut a: Vec<i64> = (0..n).map(|_| self.rng.gen_range(0..10)).collect();
        let mut b: Vec<i64> = (0..n).map(|_| self.rng.gen_range(0..10)).collect();
        if self.enrich && n >= 2 && self.rng.gen_bool(ENRICH_FRACTION) {
            self.splice_cascade(operator, &mut a, &mut b);
        }
        (digits_to_int(&a), digits_to_int(&b))
    }

    /// A carry/borrow digit followed by 1..n_digits-1 propagating digits
    fn splice_cascade(&mut self, operator: MathsToken, a: &mut [i64], b: &mut [i64]) {
        let n = a.len();
        let len = self.rng.gen_range(1..n);
        let start = self.rng.gen_range(0..n - len);

        if operator == MathsToken::Plus {
            let d = self.rng.gen_range(1..10);
            a[start] = d;
            b[start] = self.rng.gen_range(10 - d..10);
            for dn in start + 1..=start + len {
                a[dn] = self.rng.gen_range(0..10);
                b[dn] = 9 - a[dn];
            }
        } else {
            let d = self.rng.gen_range(0..9);
            a[start] = d;
            b[start] = self.rng.gen_range(d + 1..10);
            for dn in start + 1..=start + len {
                a[dn] = self.rng.gen_range(0..10);
                b[dn] = a[dn];
            }
        }
    }
}

fn digits_to_int(digits: &[i64]) -> i64 {
    digits.iter().rev().fold(0, |acc, &d| acc * 10 + d)
}

impl Iterator for QuestionGenerator {
    type Item = QuestionBatch;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(batch) => Some(batch),
            Err(e) => {
                warn!("Question generation failed: {e:#}");
                None
            }
        }
    }
}
