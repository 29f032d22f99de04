//! Accuracy and impact test harness
//!
//! Batch-level evaluation of the model, with and without ablation, and the
//! sweeps that discover useful positions and nodes:
//!
//! 1. [`find_useful_positions`] mean-ablates the residual stream at each
//!    position and records the positions whose ablation breaks answers.
//! 2. [`find_useful_nodes`] ablates each head (and optionally each neuron)
//!    at those positions, tagging the node with the failure rate, the
//!    answer digits affected and the complexity of the failing questions.

use anyhow::Result;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::ablation::{AblationConfig, AblationMode, MeanActivations};
use crate::codec::{answer_str_from_tokens, QuestionBatch};
use crate::complexity::{classify, QuestionCategory};
use crate::config::MathsConfig;
use crate::hooks::{HookPoint, HookSpec, Patch};
use crate::impact::{question_answer_impact, sort_unique_digits};
use crate::intervention::{ablation_hooks, predict_questions};
use crate::loss::QuestionPrediction;
use crate::model::MathsBackend;
use crate::node::{position_name, MajorTag, NodeLocation};
use crate::registry::UsefulNodeRegistry;
use crate::vocab::tokens_to_string;

/// Run the unablated model and report accuracy per complexity group
///
/// Sets `acfg.num_varied_questions` / `num_varied_successes` and returns the
/// questions the model answers correctly.
pub fn test_questions_by_complexity(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    questions: &QuestionBatch,
) -> Result<QuestionBatch> {
    let predictions = predict_questions(model, cfg, questions, &HookSpec::new())?;

    let mut groups: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    let mut keep = Vec::with_capacity(questions.len());
    for (row, prediction) in questions.rows().zip(&predictions) {
        let (category, tag) = classify(cfg, row);
        let group = format!("{category}.{tag}");
        let answer = prediction.answer_str();
        let correct = answer == answer_str_from_tokens(cfg, row);

        let counts = groups.entry(group.clone()).or_default();
        if correct {
            counts.0 += 1;
        } else {
            counts.1 += 1;
            if acfg.show_test_failures {
                info!(
                    "Failed: Q&A: {}, ModelAnswer: {answer}, Complexity: {group}",
                    tokens_to_string(row)
                );
            }
        }
        keep.push(correct);
    }

    acfg.num_varied_questions = questions.len();
    acfg.num_varied_successes = keep.iter().filter(|&&k| k).count();

    for (group, (good, bad)) in &groups {
        let total = good + bad;
        info!(
            "{group}: {good}/{total} correct ({:.2}%)",
            100.0 * *good as f64 / total as f64
        );
    }

    let kept = questions.filter(&keep);
    if kept.len() < questions.len() {
        info!(
            "Filtered to {} of {} questions answered correctly",
            kept.len(),
            questions.len()
        );
    }
    Ok(kept)
}

/// Ablation of the layer 0 residual stream at one position
pub fn position_ablation_hooks(acfg: &AblationConfig, position: usize) -> Result<HookSpec> {
    let hook = HookPoint::ResidPost(0);
    let patch = match acfg.mode {
        AblationMode::Zero => Patch::zero(position, None),
        AblationMode::Mean => Patch::from_tensor(position, None, acfg.means()?.require(&hook)?.clone()),
        AblationMode::Store => anyhow::bail!("Position ablation supports zero and mean modes only"),
    };
    let mut hooks = HookSpec::new();
    hooks.patch(hook, patch);
    Ok(hooks)
}

/// Count questions that fail, optionally with `position` ablated
///
/// A question fails when its mean loss exceeds `acfg.threshold` and the
/// predicted answer differs from the embedded answer in some digit.
pub fn test_questions_by_impact(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &AblationConfig,
    questions: &QuestionBatch,
    position: usize,
    ablate: bool,
) -> Result<usize> {
    let hooks = if ablate {
        position_ablation_hooks(acfg, position)?
    } else {
        HookSpec::new()
    };
    let predictions = predict_questions(model, cfg, questions, &hooks)?;

    let mut num_fails = 0;
    for (row, prediction) in questions.rows().zip(&predictions) {
        let loss = prediction.mean_loss();
        if !loss.is_finite() || loss <= acfg.threshold {
            continue;
        }
        let answer = prediction.answer_str();
        let impact = question_answer_impact(cfg, row, &answer);
        if impact.is_none() {
            continue;
        }
        num_fails += 1;
        if acfg.show_test_failures {
            info!(
                "Failed: {}, ModelAnswer: {answer}, Loss: {loss:.4}, Impact: {impact}",
                tokens_to_string(row)
            );
        }
    }
    Ok(num_fails)
}

/// Tag `location` with the failures its ablation caused
///
/// For every question with mean loss above the threshold and a changed
/// answer digit, accumulate the impact and the complexity of the question.
/// When any question failed the node gets:
///
/// - `Fail`: the failure percentage, truncated
/// - `Impact`: `A` plus the affected digits, highest first
/// - one complexity summary per operation with failures, e.g. `S0123`
///
/// Returns the number of failing questions.
pub fn classify_and_tag(
    cfg: &MathsConfig,
    acfg: &AblationConfig,
    registry: &mut UsefulNodeRegistry,
    questions: &QuestionBatch,
    location: &NodeLocation,
    predictions: &[QuestionPrediction],
) -> usize {
    let mut num_fails = 0;
    let mut impacts = String::new();
    let mut complexities: BTreeMap<QuestionCategory, String> = BTreeMap::new();

    for (row, prediction) in questions.rows().zip(predictions) {
        let loss = prediction.mean_loss();
        if !loss.is_finite() {
            warn!("Skipping question with non-finite loss {loss}: {}", tokens_to_string(row));
            continue;
        }
        if loss <= acfg.threshold {
            continue;
        }
        let answer = prediction.answer_str();
        let impact = question_answer_impact(cfg, row, &answer);
        if impact.is_none() {
            continue;
        }

        num_fails += 1;
        impacts.push_str(&impact.to_string());
        let (category, tag) = classify(cfg, row);
        complexities.entry(category).or_default().push_str(tag.as_str());

        if acfg.show_test_failures {
            info!(
                "Failed: {} ablated, {}, ModelAnswer: {answer}, Impact: {impact}, Complexity: {tag}",
                location.name(),
                tokens_to_string(row)
            );
        }
    }

    if num_fails > 0 {
        let perc = 100 * num_fails / questions.len();
        registry.add_tag(location, MajorTag::Fail, &perc.to_string());
        registry.add_tag(
            location,
            MajorTag::Impact,
            &format!("A{}", sort_unique_digits(&impacts, true)),
        );
        for (category, tags) in &complexities {
            if let Some(major) = category.major_tag() {
                let summary = format!("{}{}", category.prefix(), sort_unique_digits(tags, false));
                registry.add_tag(location, major, &summary);
            }
        }
    }
    num_fails
}

/// Ablate one node across the batch and tag it with the failures caused
pub fn test_questions_and_add_useful_node_tags(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    registry: &mut UsefulNodeRegistry,
    questions: &QuestionBatch,
    location: &NodeLocation,
) -> Result<usize> {
    acfg.node_locations = vec![*location];
    let hooks = ablation_hooks(model, acfg)?;
    let predictions = predict_questions(model, cfg, questions, &hooks)?;
    Ok(classify_and_tag(cfg, acfg, registry, questions, location, &predictions))
}

/// Compute mean activations from `questions` if mean ablation needs them
fn ensure_means(
    model: &dyn MathsBackend,
    acfg: &mut AblationConfig,
    questions: &QuestionBatch,
) -> Result<()> {
    if acfg.mode == AblationMode::Mean && acfg.means.is_none() {
        acfg.means = Some(MeanActivations::compute(model, questions)?);
    }
    Ok(())
}

/// Ablate every position in turn and record the ones that matter
pub fn find_useful_positions(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    registry: &mut UsefulNodeRegistry,
    questions: &QuestionBatch,
) -> Result<Vec<usize>> {
    ensure_means(model, acfg, questions)?;
    for position in 0..cfg.n_ctx() {
        let num_fails = test_questions_by_impact(model, cfg, acfg, questions, position, true)?;
        debug!("{}: {num_fails} failures", position_name(position));
        if num_fails > 0 {
            registry.add_useful_position(position);
        }
    }
    let positions = registry.positions();
    info!(
        "Useful positions: {}",
        positions.iter().map(|&p| position_name(p)).collect::<Vec<_>>().join(", ")
    );
    Ok(positions)
}

/// Ablate each head, and each neuron with `include_neurons`, at every
/// useful position and tag the nodes whose ablation breaks answers
///
/// Returns the number of useful nodes found.
pub fn find_useful_nodes(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    registry: &mut UsefulNodeRegistry,
    questions: &QuestionBatch,
    include_neurons: bool,
) -> Result<usize> {
    ensure_means(model, acfg, questions)?;
    let mut num_useful = 0;
    for position in registry.positions() {
        for layer in 0..model.n_layers() {
            let mut locations: Vec<NodeLocation> = (0..model.n_heads())
                .map(|head| NodeLocation::head(position, layer, head))
                .collect();
            if include_neurons {
                locations.extend((0..model.d_mlp()).map(|n| NodeLocation::neuron(position, layer, n)));
            }
            for location in locations {
                let num_fails = test_questions_and_add_useful_node_tags(
                    model, cfg, acfg, registry, questions, &location,
                )?;
                if num_fails > 0 {
                    num_useful += 1;
                }
            }
        }
    }
    acfg.node_locations.clear();
    registry.sort_nodes();
    info!("Found {num_useful} useful nodes at {} positions", registry.positions().len());
    Ok(num_useful)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::make_maths_questions_and_answers;
    use crate::vocab::MathsToken;

    fn prediction(answer: &str, loss: f32) -> QuestionPrediction {
        QuestionPrediction {
            losses: vec![loss; answer.len()],
            answer_tokens: answer
                .chars()
                .map(|c| match c {
                    '+' => MathsToken::Plus.id(),
                    '-' => MathsToken::Minus.id(),
                    d => d.to_digit(10).unwrap(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_classify_and_tag_summaries() {
        let cfg = MathsConfig::default();
        let acfg = AblationConfig::new();
        let questions = make_maths_questions_and_answers(
            &cfg,
            MathsToken::Plus,
            // +0888888 (S0), +0890288 (carry at digit 2 into a 9 sum: S2), +0333333 (S0)
            &[(333_333, 555_555), (334_733, 555_555), (111_111, 222_222)],
        )
        .unwrap();
        let predictions = [
            prediction("+0888388", 2.0),
            prediction("+0850288", 2.0),
            prediction("+0333333", 0.0),
        ];
        let mut registry = UsefulNodeRegistry::new();
        let location = NodeLocation::head(16, 0, 1);
        let fails = classify_and_tag(&cfg, &acfg, &mut registry, &questions, &location, &predictions);
        assert_eq!(fails, 2);

        let node = registry.get_node(&location).unwrap();
        assert_eq!(node.summary(MajorTag::Fail).unwrap().text, "66");
        assert_eq!(node.summary(MajorTag::Impact).unwrap().text, "A42");
        assert_eq!(node.summary(MajorTag::MathAdd).unwrap().text, "S02");
        assert!(node.summary(MajorTag::MathSub).is_none());
    }

    #[test]
    fn test_elevated_loss_without_answer_change_is_not_a_failure() {
        let cfg = MathsConfig::default();
        let acfg = AblationConfig::new();
        let questions =
            make_maths_questions_and_answers(&cfg, MathsToken::Plus, &[(333_333, 555_555)]).unwrap();
        let mut registry = UsefulNodeRegistry::new();
        let location = NodeLocation::head(16, 0, 1);
        let fails = classify_and_tag(
            &cfg,
            &acfg,
            &mut registry,
            &questions,
            &location,
            &[prediction("+0888888", 3.0)],
        );
        assert_eq!(fails, 0);
        assert!(registry.is_empty());

        let skipped = classify_and_tag(
            &cfg,
            &acfg,
            &mut registry,
            &questions,
            &location,
            &[prediction("+0111111", f32::NAN)],
        );
        assert_eq!(skipped, 0);
    }

    #[test]
    fn test_position_ablation_hooks() {
        let acfg = AblationConfig::new().with_mode(AblationMode::Zero);
        let hooks = position_ablation_hooks(&acfg, 5).unwrap();
        let patches = hooks.patches_at(&HookPoint::ResidPost(0));
        assert_eq!(patches.len(), 1);
        assert_eq!((patches[0].position, patches[0].unit), (5, None));

        assert!(position_ablation_hooks(&AblationConfig::new(), 5).is_err());
    }
}
