//! Per-answer-position loss and predicted answer tokens

use anyhow::Result;
use candle_core::{DType, Tensor, D};

use crate::config::MathsConfig;
use crate::vocab::tokens_to_string;

/// Model prediction for one question
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionPrediction {
    /// Negative log-likelihood of each embedded answer token
    pub losses: Vec<f32>,
    /// Argmax token at each answer position
    pub answer_tokens: Vec<u32>,
}

impl QuestionPrediction {
    pub fn mean_loss(&self) -> f32 {
        if self.losses.is_empty() {
            return 0.0;
        }
        self.losses.iter().sum::<f32>() / self.losses.len() as f32
    }

    /// Predicted answer as text, e.g. `+0888888`
    pub fn answer_str(&self) -> String {
        tokens_to_string(&self.answer_tokens)
    }
}

/// Score logits `[batch, n_ctx, d_vocab]` against the answers embedded in
/// `tokens` `[batch, n_ctx]`
///
/// The logits at position `t` predict token `t + 1`, so the answer tokens are
/// predicted by positions `n_ctx - n_answer - 1 ..= n_ctx - 2`.
pub fn logits_to_tokens_loss(
    cfg: &MathsConfig,
    logits: &Tensor,
    tokens: &Tensor,
) -> Result<Vec<QuestionPrediction>> {
    let n_ctx = cfg.n_ctx();
    let n_ans = cfg.num_answer_positions();
    let (_, seq, _) = logits.dims3()?;
    anyhow::ensure!(
        seq == n_ctx,
        "Logits cover {seq} positions, expected {n_ctx}"
    );

    let answer_logits = logits.narrow(1, n_ctx - n_ans - 1, n_ans)?.to_dtype(DType::F32)?;
    let log_probs = candle_nn::ops::log_softmax(&answer_logits, D::Minus1)?;
    let targets = tokens
        .narrow(1, n_ctx - n_ans, n_ans)?
        .to_dtype(DType::U32)?
        .contiguous()?
        .unsqueeze(D::Minus1)?;
    let losses: Vec<Vec<f32>> = log_probs
        .gather(&targets, D::Minus1)?
        .squeeze(D::Minus1)?
        .neg()?
        .to_vec2()?;
    let predicted: Vec<Vec<u32>> = answer_logits.argmax(D::Minus1)?.to_vec2()?;

    Ok(losses
        .into_iter()
        .zip(predicted)
        .map(|(losses, answer_tokens)| QuestionPrediction {
            losses,
            answer_tokens,
        })
        .collect())
}

/// Mean of the per-question mean losses
pub fn mean_batch_loss(predictions: &[QuestionPrediction]) -> f32 {
    if predictions.is_empty() {
        return 0.0;
    }
    predictions.iter().map(QuestionPrediction::mean_loss).sum::<f32>() / predictions.len() as f32
}
