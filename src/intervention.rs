//! Intervention engine
//!
//! Causal tests of hypotheses about individual nodes. A *store* question is
//! run first and the activations of the target nodes are captured. A
//! *clean* question is then run with those activations patched in, and the
//! patched answer is compared digit by digit against the clean answer.
//!
//! ## Test Modes
//!
//! - **Strong**: the caller predicts the exact patched answer and its
//!   impact; success requires both to match.
//! - **Weak**: success only requires the patch to change the answer.
//!
//! A failed test is evidence, not an error. Failures are logged when
//! `show_test_failures` is set and reported through the return value.
//!
//! ## Example
//!
//! ```ignore
//! use maths_quanta::{AblationConfig, AnswerImpact, MathsConfig, NodeLocation};
//! use maths_quanta::intervention::run_strong_intervention;
//!
//! let cfg = MathsConfig::default();
//! let mut acfg = AblationConfig::new().with_nodes(vec![NodeLocation::head(14, 0, 2)]);
//! let rep = |d| cfg.repeat_digit(d);
//!
//! // Replace the digit 2 pair (5, 4) with (2, 1): answer digit 2 drops by 6
//! let clean = (rep(5), rep(4));
//! let expected = clean.0 + clean.1 - 600;
//! let (ok, _, _) = run_strong_intervention(
//!     model.as_ref(), &cfg, &mut acfg,
//!     (rep(2), rep(1)), clean, AnswerImpact::single(2), expected,
//! )?;
//! ```

use anyhow::Result;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::ablation::{AblationConfig, AblationMode, InterventionStage};
use crate::codec::{int_to_answer_str, make_maths_questions_and_answers, QuestionBatch};
use crate::config::MathsConfig;
use crate::hooks::{HookPoint, HookSpec, Patch};
use crate::impact::{answer_impact, AnswerImpact};
use crate::loss::{logits_to_tokens_loss, QuestionPrediction};
use crate::model::MathsBackend;
use crate::vocab::MathsToken;

/// One hooked forward pass over a batch, scored against the embedded answers
pub fn predict_questions(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    questions: &QuestionBatch,
    hooks: &HookSpec,
) -> Result<Vec<QuestionPrediction>> {
    let tokens = questions.to_tensor(model.device())?;
    let cache = model.forward(&tokens, hooks)?;
    logits_to_tokens_loss(cfg, cache.output(), &tokens)
}

/// Zero or mean patches for every node in `acfg.node_locations`
pub fn ablation_hooks(model: &dyn MathsBackend, acfg: &AblationConfig) -> Result<HookSpec> {
    let mut hooks = HookSpec::new();
    for location in &acfg.node_locations {
        let hook = model.node_hook_point(location);
        let patch = match acfg.mode {
            AblationMode::Zero => Patch::zero(location.position, Some(location.index)),
            AblationMode::Mean => {
                let mean = acfg.means()?.require(&hook)?.clone();
                Patch::from_tensor(location.position, Some(location.index), mean)
            }
            AblationMode::Store => {
                anyhow::bail!("Store ablation needs a paired store run, see run_attention_intervention")
            }
        };
        hooks.patch(hook, patch);
    }
    Ok(hooks)
}

/// Run the store question, patch its node activations into the clean
/// question and record the patched answer and its impact in `acfg`
///
/// Both batches hold a single question. Returns a one-line description of
/// the intervention.
pub fn run_attention_intervention(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    store: &QuestionBatch,
    clean: &QuestionBatch,
    clean_answer_str: &str,
) -> Result<String> {
    anyhow::ensure!(
        !acfg.node_locations.is_empty(),
        "Intervention requested with no node locations"
    );
    anyhow::ensure!(
        store.len() == 1 && clean.len() == 1,
        "Interventions take one store and one clean question, got {} and {}",
        store.len(),
        clean.len()
    );

    // Store run: capture every hook point the nodes live at
    acfg.advance(InterventionStage::StoreRun);
    let mut capture = HookSpec::new();
    let points: Vec<HookPoint> = acfg
        .node_locations
        .iter()
        .map(|loc| model.node_hook_point(loc))
        .collect();
    for point in &points {
        capture.capture(point.clone());
    }
    let store_cache = model.forward(&store.to_tensor(model.device())?, &capture)?;
    let mut stored = HashMap::new();
    for point in points {
        let value = store_cache.require(&point)?.clone();
        stored.insert(point, value);
    }

    // Clean run with the stored activations patched in
    acfg.advance(InterventionStage::CleanRunWithPatch);
    let mut hooks = HookSpec::new();
    for location in &acfg.node_locations {
        let point = model.node_hook_point(location);
        let source = stored
            .get(&point)
            .ok_or_else(|| anyhow::anyhow!("No stored activation for `{point}`"))?
            .clone();
        hooks.patch(
            point,
            Patch::from_tensor(location.position, Some(location.index), source),
        );
    }
    let predictions = predict_questions(model, cfg, clean, &hooks)?;
    let prediction = predictions
        .first()
        .ok_or_else(|| anyhow::anyhow!("Patched run returned no predictions"))?;

    acfg.advance(InterventionStage::Compare);
    acfg.intervened_answer = prediction.answer_str();
    acfg.intervened_impact = answer_impact(clean_answer_str, &acfg.intervened_answer);

    let description = format!(
        "CleanAnswer: {clean_answer_str}, ExpectedAnswer/Impact: {}/{}, AblatedAnswer/Impact: {}/{}",
        acfg.expected_answer, acfg.expected_impact, acfg.intervened_answer, acfg.intervened_impact
    );
    debug!("{description}");
    Ok(description)
}

fn assert_operands(cfg: &MathsConfig, name: &str, (first, second): (i64, i64)) {
    let limit = cfg.operand_limit();
    assert!(
        (0..limit).contains(&first) && (0..limit).contains(&second),
        "{name} operands ({first}, {second}) outside [0, {limit})"
    );
}

/// Build both questions for `acfg.operation`, set the expectation and run
/// the intervention
#[allow(clippy::too_many_arguments)]
pub fn run_intervention_core(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    store: (i64, i64),
    clean: (i64, i64),
    expected_impact: AnswerImpact,
    expected_answer: i64,
    strong: bool,
) -> Result<String> {
    assert_operands(cfg, "Store", store);
    assert_operands(cfg, "Clean", clean);

    let clean_answer = match acfg.operation {
        MathsToken::Plus => clean.0 + clean.1,
        MathsToken::Minus => clean.0 - clean.1,
        other => anyhow::bail!("Interventions support `+` and `-`, not `{other}`"),
    };
    let clean_answer_str = int_to_answer_str(cfg, clean_answer);
    let expected_answer_str = int_to_answer_str(cfg, expected_answer);

    let store_batch = make_maths_questions_and_answers(cfg, acfg.operation, &[store])?;
    let clean_batch = make_maths_questions_and_answers(cfg, acfg.operation, &[clean])?;

    acfg.reset_intervention(&expected_answer_str, expected_impact);
    let run_description =
        run_attention_intervention(model, cfg, acfg, &store_batch, &clean_batch, &clean_answer_str)?;

    let op = acfg.operation.symbol();
    acfg.description = format!(
        "Intervening on {}, {}, Clean = {}{op}{}, Store = {}{op}{}, {run_description}",
        acfg.node_names(),
        if strong { "Strong" } else { "Weak" },
        clean.0,
        clean.1,
        store.0,
        store.1
    );
    Ok(acfg.description.clone())
}

/// Test an exact prediction of the patched answer
///
/// Returns `(success, answer_success, impact_success)`.
#[allow(clippy::too_many_arguments)]
pub fn run_strong_intervention(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    store: (i64, i64),
    clean: (i64, i64),
    expected_impact: AnswerImpact,
    expected_answer: i64,
) -> Result<(bool, bool, bool)> {
    let description = run_intervention_core(
        model,
        cfg,
        acfg,
        store,
        clean,
        expected_impact,
        expected_answer,
        true,
    )?;

    let answer_success = acfg.intervened_answer == acfg.expected_answer;
    let impact_success = acfg.intervened_impact == acfg.expected_impact;
    let success = answer_success && impact_success;
    acfg.advance(InterventionStage::Classified);

    if acfg.show_test_failures && !success {
        info!(
            "Failed: {description}{}{}",
            if answer_success { "" } else { ", AnswerFailure" },
            if impact_success { "" } else { ", ImpactFailure" }
        );
    }
    if acfg.show_test_successes && success {
        info!("Success: {description}");
    }
    Ok((success, answer_success, impact_success))
}

/// Test that patching changes the answer at all
pub fn run_weak_intervention(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    store: (i64, i64),
    clean: (i64, i64),
) -> Result<bool> {
    // The expectation for a weak test is the unpatched answer
    let clean_answer = match acfg.operation {
        MathsToken::Minus => clean.0 - clean.1,
        _ => clean.0 + clean.1,
    };
    let description = run_intervention_core(
        model,
        cfg,
        acfg,
        store,
        clean,
        AnswerImpact::none(),
        clean_answer,
        false,
    )?;

    let success =
        acfg.intervened_answer != acfg.expected_answer && !acfg.intervened_impact.is_none();
    acfg.advance(InterventionStage::Classified);

    if acfg.show_test_failures && !success {
        info!("Failed: Intervention had no impact on the answer. {description}");
    }
    if acfg.show_test_successes && success {
        info!("Success: {description}");
    }
    Ok(success)
}
