//! Attention pattern tagging
//!
//! Records which token positions each useful head attends to, as
//! `Attention` tags `P{k}={perc}` (e.g. `P3=75`).

use anyhow::Result;
use candle_core::{DType, IndexOp};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::codec::QuestionBatch;
use crate::config::MathsConfig;
use crate::hooks::{HookPoint, HookSpec};
use crate::model::MathsBackend;
use crate::node::{position_name, MajorTag, NodeLocation};
use crate::registry::UsefulNodeRegistry;

/// Most attended positions kept per head
const MAX_ATTENDED: usize = 3;

/// Attended positions of one attention row, highest share first
///
/// `row` is the batch-averaged attention of a query position over the key
/// positions. Shares are percentages rounded to whole numbers and only
/// those of at least `min_perc` are kept.
pub fn top_attended_positions(row: &[f32], min_perc: f32) -> Vec<(usize, u32)> {
    let mut shares: Vec<(usize, f32)> = row
        .iter()
        .enumerate()
        .map(|(k, &a)| (k, 100.0 * a))
        .filter(|&(_, perc)| perc >= min_perc)
        .collect();
    shares.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    shares
        .into_iter()
        .take(MAX_ATTENDED)
        .map(|(k, perc)| (k, perc.round() as u32))
        .collect()
}

/// Tag every head in the registry with the positions it attends to
///
/// Runs `questions` once, capturing `attn.hook_pattern` of each layer that
/// holds a useful head. Returns the number of tags written.
pub fn calc_attention_tags(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    registry: &mut UsefulNodeRegistry,
    questions: &QuestionBatch,
    min_perc: f32,
) -> Result<usize> {
    let heads: Vec<NodeLocation> = registry
        .nodes()
        .iter()
        .filter(|n| n.is_head())
        .map(|n| n.location())
        .collect();
    if heads.is_empty() {
        debug!("No useful heads to tag with attention");
        return Ok(0);
    }

    let layers: BTreeSet<usize> = heads.iter().map(|loc| loc.layer).collect();
    let mut hooks = HookSpec::new();
    for &layer in &layers {
        hooks.capture(HookPoint::AttnPattern(layer));
    }
    let cache = model.forward(&questions.to_tensor(model.device())?, &hooks)?;

    registry.reset_tags(Some(MajorTag::Attention));
    let mut num_tags = 0;
    for head in &heads {
        anyhow::ensure!(
            head.position < cfg.n_ctx(),
            "Head {} outside context of {} positions",
            head.name(),
            cfg.n_ctx()
        );
        // [batch, heads, query, key]
        let pattern = cache.require(&HookPoint::AttnPattern(head.layer))?;
        let row: Vec<f32> = pattern
            .to_dtype(DType::F32)?
            .i((.., head.index, head.position, ..))?
            .mean(0)?
            .to_vec1()?;
        for (key, perc) in top_attended_positions(&row, min_perc) {
            registry.add_tag(
                head,
                MajorTag::Attention,
                &format!("{}={perc}", position_name(key)),
            );
            num_tags += 1;
        }
    }
    info!("Wrote {num_tags} attention tags for {} heads", heads.len());
    Ok(num_tags)
}
