//! Deterministic arithmetic oracle with real hook points
//!
//! The oracle computes answers the way a column-wise adder would, with its
//! intermediate values exposed as hookable activations:
//!
//! - `blocks.0.attn.hook_z` `[batch, seq, n_digits, 2]`: head `h` holds the
//!   digit pair `(Dh, D'h)` at every position
//! - `blocks.0.mlp.hook_post` `[batch, seq, n_digits]`: neuron `h` is 1 when
//!   digit pair `h` generates a carry (or borrow), computed from the
//!   patched `hook_z`
//! - `blocks.0.hook_resid_post` `[batch, seq, d_vocab]`: the logits
//!
//! Answer digit `Ak` is predicted at position `n_ctx - 2 - k` from the
//! activations of that position only, so a patch at one position changes
//! at most one answer digit.

#![allow(dead_code)]

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use maths_quanta::{HookCache, HookPoint, HookSpec, MathsBackend, MathsConfig, MathsToken, VOCAB_SIZE};
use std::collections::HashMap;

/// Logit given to the predicted token
const CONFIDENCE: f32 = 10.0;

pub struct OracleModel {
    cfg: MathsConfig,
    device: Device,
}

impl OracleModel {
    pub fn new(cfg: &MathsConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            device: Device::Cpu,
        }
    }

    /// Position whose logits predict answer digit `k`
    pub fn predicting_position(&self, k: usize) -> usize {
        self.cfg.n_ctx() - 2 - k
    }
}

fn to_digit(v: f32) -> i64 {
    v.round().clamp(0.0, 9.0) as i64
}

fn value(digits: &[i64]) -> i64 {
    digits.iter().rev().fold(0, |acc, &d| acc * 10 + d)
}

/// Carry (addition) or borrow (subtraction) generated by each digit pair
fn generated(op: u32, a: &[i64], b: &[i64]) -> Vec<bool> {
    if op == MathsToken::Plus.id() {
        a.iter().zip(b).map(|(x, y)| x + y >= 10).collect()
    } else if op == MathsToken::Minus.id() {
        let (x, y) = if value(a) < value(b) { (b, a) } else { (a, b) };
        x.iter().zip(y).map(|(p, q)| p < q).collect()
    } else {
        vec![false; a.len()]
    }
}

/// Sign token and answer digits `A0..=An` (least significant first)
fn answer(op: u32, a: &[i64], b: &[i64], neurons: &[bool]) -> (u32, Vec<u32>) {
    let n = a.len();
    if op == MathsToken::Plus.id() {
        let mut carry = false;
        let mut digits = Vec::with_capacity(n + 1);
        for j in 0..n {
            let s = a[j] + b[j];
            digits.push(((s + i64::from(carry)) % 10) as u32);
            carry = neurons[j] || (s == 9 && carry);
        }
        digits.push(u32::from(carry));
        (MathsToken::Plus.id(), digits)
    } else if op == MathsToken::Minus.id() {
        let negative = value(a) < value(b);
        let (x, y) = if negative { (b, a) } else { (a, b) };
        let mut borrow = false;
        let mut digits = Vec::with_capacity(n + 1);
        for j in 0..n {
            digits.push((x[j] - y[j] - i64::from(borrow)).rem_euclid(10) as u32);
            borrow = neurons[j] || (x[j] == y[j] && borrow);
        }
        digits.push(0);
        let sign = if negative {
            MathsToken::Minus
        } else {
            MathsToken::Plus
        };
        (sign.id(), digits)
    } else {
        let mut product = value(a) * value(b);
        let digits = (0..=n)
            .map(|_| {
                let d = (product % 10) as u32;
                product /= 10;
                d
            })
            .collect();
        (MathsToken::Plus.id(), digits)
    }
}

impl MathsBackend for OracleModel {
    fn n_layers(&self) -> usize {
        1
    }
    fn n_heads(&self) -> usize {
        self.cfg.n_digits
    }
    fn d_head(&self) -> usize {
        2
    }
    fn d_mlp(&self) -> usize {
        self.cfg.n_digits
    }
    fn d_model(&self) -> usize {
        VOCAB_SIZE
    }
    fn d_vocab(&self) -> usize {
        VOCAB_SIZE
    }
    fn n_ctx(&self) -> usize {
        self.cfg.n_ctx()
    }
    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, tokens: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let cfg = &self.cfg;
        let n = cfg.n_digits;
        let rows: Vec<Vec<u32>> = tokens.to_dtype(DType::U32)?.to_vec2()?;
        let batch = rows.len();
        let seq = cfg.n_ctx();
        let mut captures = HashMap::new();

        let mut z = Vec::with_capacity(batch * seq * n * 2);
        for row in &rows {
            for _ in 0..seq {
                for h in 0..n {
                    z.push(row[cfg.dn_position(h)] as f32);
                    z.push(row[cfg.ddn_position(h)] as f32);
                }
            }
        }
        let z = Tensor::from_vec(z, (batch, seq, n, 2), &self.device)?;
        let z = hooks.run_hook(HookPoint::AttnZ(0), z, &mut captures)?;
        let z: Vec<f32> = z.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

        // Head h splits its attention between Dh and D'h
        let mut pattern = vec![0f32; batch * n * seq * seq];
        for b in 0..batch {
            for h in 0..n {
                for q in 0..seq {
                    let base = ((b * n + h) * seq + q) * seq;
                    pattern[base + cfg.dn_position(h)] = 0.5;
                    pattern[base + cfg.ddn_position(h)] = 0.5;
                }
            }
        }
        let pattern = Tensor::from_vec(pattern, (batch, n, seq, seq), &self.device)?;
        hooks.run_hook(HookPoint::AttnPattern(0), pattern, &mut captures)?;

        let pair = |b: usize, t: usize| -> (Vec<i64>, Vec<i64>) {
            let base = (b * seq + t) * n * 2;
            (
                (0..n).map(|h| to_digit(z[base + 2 * h])).collect(),
                (0..n).map(|h| to_digit(z[base + 2 * h + 1])).collect(),
            )
        };

        let mut mlp = Vec::with_capacity(batch * seq * n);
        for (b, row) in rows.iter().enumerate() {
            let op = row[cfg.op_position()];
            for t in 0..seq {
                let (a, d) = pair(b, t);
                mlp.extend(generated(op, &a, &d).into_iter().map(|g| if g { 1f32 } else { 0f32 }));
            }
        }
        let mlp = Tensor::from_vec(mlp, (batch, seq, n), &self.device)?;
        let mlp = hooks.run_hook(HookPoint::MlpPost(0), mlp, &mut captures)?;
        let mlp: Vec<f32> = mlp.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

        let sign_position = cfg.n_ctx() - cfg.num_answer_positions() - 1;
        let mut resid = vec![0f32; batch * seq * VOCAB_SIZE];
        for (b, row) in rows.iter().enumerate() {
            let op = row[cfg.op_position()];
            for t in sign_position..seq - 1 {
                let (a, d) = pair(b, t);
                let base = (b * seq + t) * n;
                let neurons: Vec<bool> = mlp[base..base + n].iter().map(|&v| v > 0.5).collect();
                let (sign, digits) = answer(op, &a, &d, &neurons);
                let token = if t == sign_position {
                    sign
                } else {
                    digits[seq - 2 - t]
                };
                resid[(b * seq + t) * VOCAB_SIZE + token as usize] = CONFIDENCE;
            }
        }
        let resid = Tensor::from_vec(resid, (batch, seq, VOCAB_SIZE), &self.device)?;
        let logits = hooks.run_hook(HookPoint::ResidPost(0), resid, &mut captures)?;

        Ok(HookCache::with_captures(logits, captures))
    }
}
