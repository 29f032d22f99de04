//! Question codec: operands and answers to and from token rows

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use thiserror::Error;

use crate::config::MathsConfig;
use crate::vocab::{is_digit, tokens_to_string, MathsToken};

/// A token row could not be decoded as a question
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("question has {found} tokens, expected {expected}")]
    WrongLength { expected: usize, found: usize },
    #[error("token {token} at position {position} is not an operator")]
    BadOperator { position: usize, token: u32 },
    #[error("token {token} at position {position} is not '='")]
    BadEquals { position: usize, token: u32 },
    #[error("token {token} at position {position} is not a sign")]
    BadSign { position: usize, token: u32 },
    #[error("token {token} at position {position} is not a digit")]
    BadDigit { position: usize, token: u32 },
}

/// Read `digits` tokens from `offset` as a big-endian decimal number
///
/// Tokens are assumed to be digits already.
pub fn tokens_to_unsigned_int(tokens: &[u32], offset: usize, digits: usize) -> u64 {
    tokens[offset..offset + digits]
        .iter()
        .fold(0, |acc, &t| acc * 10 + u64::from(t))
}

/// Render an answer with an explicit sign, zero padded to `n_digits + 1`
///
/// `6671` with six digit operands becomes `+0006671`.
pub fn int_to_answer_str(cfg: &MathsConfig, value: i64) -> String {
    let sign = if value < 0 { '-' } else { '+' };
    format!("{sign}{:0width$}", value.unsigned_abs(), width = cfg.n_digits + 1)
}

/// The embedded answer of a token row as a string, e.g. `+0333333`
pub fn answer_str_from_tokens(cfg: &MathsConfig, tokens: &[u32]) -> String {
    let start = tokens.len().saturating_sub(cfg.num_answer_positions());
    tokens_to_string(&tokens[start..])
}

fn push_digits(tokens: &mut Vec<u32>, value: u64, digits: usize) {
    let start = tokens.len();
    let mut rest = value;
    for _ in 0..digits {
        tokens.push((rest % 10) as u32);
        rest /= 10;
    }
    tokens[start..].reverse();
}

/// A decoded question
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MathsQuestion {
    pub first: i64,
    pub second: i64,
    pub operator: MathsToken,
    /// Signed answer value
    pub answer: i64,
    /// Sign token as written (kept so `-0` survives a round trip)
    pub sign: MathsToken,
}

impl MathsQuestion {
    /// Build a question and compute its exact answer
    pub fn new(cfg: &MathsConfig, first: i64, second: i64, operator: MathsToken) -> Result<Self> {
        let limit = cfg.operand_limit();
        anyhow::ensure!(
            (0..limit).contains(&first) && (0..limit).contains(&second),
            "Operands {first} and {second} do not fit in {} digits",
            cfg.n_digits
        );
        let answer = match operator {
            MathsToken::Plus => first + second,
            MathsToken::Minus => first - second,
            MathsToken::Mult => first * second,
            MathsToken::Equals => anyhow::bail!("'=' is not an operator"),
        };
        anyhow::ensure!(
            answer.abs() < cfg.answer_limit(),
            "Answer {answer} does not fit in {} digits",
            cfg.n_digits + 1
        );
        let sign = if answer < 0 {
            MathsToken::Minus
        } else {
            MathsToken::Plus
        };
        Ok(Self {
            first,
            second,
            operator,
            answer,
            sign,
        })
    }

    /// Decode a full question row
    pub fn from_tokens(cfg: &MathsConfig, tokens: &[u32]) -> Result<Self, DecodeError> {
        let n = cfg.n_digits;
        if tokens.len() != cfg.n_ctx() {
            return Err(DecodeError::WrongLength {
                expected: cfg.n_ctx(),
                found: tokens.len(),
            });
        }

        let op_pos = cfg.op_position();
        let eq_pos = 2 * n + 1;
        let sign_pos = cfg.sign_position();
        for (position, &token) in tokens.iter().enumerate() {
            if position != op_pos && position != eq_pos && position != sign_pos && !is_digit(token)
            {
                return Err(DecodeError::BadDigit { position, token });
            }
        }

        let operator = MathsToken::from_id(tokens[op_pos])
            .filter(|t| t.is_operator())
            .ok_or(DecodeError::BadOperator {
                position: op_pos,
                token: tokens[op_pos],
            })?;
        if tokens[eq_pos] != MathsToken::Equals.id() {
            return Err(DecodeError::BadEquals {
                position: eq_pos,
                token: tokens[eq_pos],
            });
        }
        let sign = MathsToken::from_id(tokens[sign_pos])
            .filter(|t| t.is_sign())
            .ok_or(DecodeError::BadSign {
                position: sign_pos,
                token: tokens[sign_pos],
            })?;

        let first = tokens_to_unsigned_int(tokens, 0, n) as i64;
        let second = tokens_to_unsigned_int(tokens, n + 1, n) as i64;
        let magnitude = tokens_to_unsigned_int(tokens, sign_pos + 1, n + 1) as i64;
        let answer = if sign == MathsToken::Minus {
            -magnitude
        } else {
            magnitude
        };

        Ok(Self {
            first,
            second,
            operator,
            answer,
            sign,
        })
    }

    /// Encode as a token row of length `n_ctx`
    pub fn to_tokens(&self, cfg: &MathsConfig) -> Vec<u32> {
        let n = cfg.n_digits;
        let mut tokens = Vec::with_capacity(cfg.n_ctx());
        push_digits(&mut tokens, self.first.unsigned_abs(), n);
        tokens.push(self.operator.id());
        push_digits(&mut tokens, self.second.unsigned_abs(), n);
        tokens.push(MathsToken::Equals.id());
        tokens.push(self.sign.id());
        push_digits(&mut tokens, self.answer.unsigned_abs(), n + 1);
        tokens
    }

    /// Answer as rendered by the model, e.g. `+0888888`
    pub fn answer_str(&self, cfg: &MathsConfig) -> String {
        format!(
            "{}{:0width$}",
            self.sign.symbol(),
            self.answer.unsigned_abs(),
            width = cfg.n_digits + 1
        )
    }

    /// Question as text, e.g. `333333+555555=+0888888`
    pub fn to_text(&self, cfg: &MathsConfig) -> String {
        tokens_to_string(&self.to_tokens(cfg))
    }
}

/// Token row for `first OP second` with its exact answer appended
pub fn make_question(
    cfg: &MathsConfig,
    first: i64,
    second: i64,
    operator: MathsToken,
) -> Result<Vec<u32>> {
    Ok(MathsQuestion::new(cfg, first, second, operator)?.to_tokens(cfg))
}

/// Batch of questions built from explicit operand pairs
pub fn make_maths_questions_and_answers(
    cfg: &MathsConfig,
    operator: MathsToken,
    pairs: &[(i64, i64)],
) -> Result<QuestionBatch> {
    let mut batch = QuestionBatch::new(cfg.n_ctx());
    for &(first, second) in pairs {
        batch.push_row(&make_question(cfg, first, second, operator)?)?;
    }
    Ok(batch)
}

/// Rows of question tokens, all of length `n_ctx`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionBatch {
    tokens: Vec<u32>,
    n_ctx: usize,
}

impl QuestionBatch {
    /// Empty batch of rows with `n_ctx` tokens
    pub fn new(n_ctx: usize) -> Self {
        Self {
            tokens: Vec::new(),
            n_ctx,
        }
    }

    /// Batch from owned rows
    pub fn from_rows(n_ctx: usize, rows: &[Vec<u32>]) -> Result<Self> {
        let mut batch = Self::new(n_ctx);
        for row in rows {
            batch.push_row(row)?;
        }
        Ok(batch)
    }

    /// Batch from a `[batch, n_ctx]` integer tensor
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let (_, n_ctx) = tensor.dims2()?;
        let tokens = tensor.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
        Ok(Self { tokens, n_ctx })
    }

    pub fn push_row(&mut self, row: &[u32]) -> Result<()> {
        anyhow::ensure!(
            row.len() == self.n_ctx,
            "Question has {} tokens, expected {}",
            row.len(),
            self.n_ctx
        );
        self.tokens.extend_from_slice(row);
        Ok(())
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    pub fn len(&self) -> usize {
        if self.n_ctx == 0 {
            0
        } else {
            self.tokens.len() / self.n_ctx
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Tokens of question `i`
    pub fn row(&self, i: usize) -> &[u32] {
        &self.tokens[i * self.n_ctx..(i + 1) * self.n_ctx]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u32]> {
        self.tokens.chunks_exact(self.n_ctx.max(1))
    }

    /// Keep the rows whose mask entry is true
    pub fn filter(&self, keep: &[bool]) -> Self {
        let mut out = Self::new(self.n_ctx);
        for (row, _) in self.rows().zip(keep).filter(|(_, k)| **k) {
            out.tokens.extend_from_slice(row);
        }
        out
    }

    /// Append every row of `other`
    pub fn concat(&mut self, other: &Self) -> Result<()> {
        anyhow::ensure!(
            other.n_ctx == self.n_ctx,
            "Cannot join batches with n_ctx {} and {}",
            self.n_ctx,
            other.n_ctx
        );
        self.tokens.extend_from_slice(&other.tokens);
        Ok(())
    }

    /// `[batch, n_ctx]` U32 tensor
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &self.tokens,
            (self.len(), self.n_ctx),
            device,
        )?)
    }
}
