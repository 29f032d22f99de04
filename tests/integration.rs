//! Integration tests for maths-quanta
//!
//! Everything here runs against the arithmetic oracle in `common`, whose
//! hook points have exactly predictable effects. Tests marked with
//! #[ignore] require a model download.
//! Run them explicitly with: cargo test --ignored

mod common;

use common::OracleModel;
use maths_quanta::harness::test_questions_and_add_useful_node_tags;
use maths_quanta::intervention::predict_questions;
use maths_quanta::{
    calc_attention_tags, classify, find_useful_nodes, find_useful_positions, load_backend,
    make_maths_questions_and_answers, make_question, run_strong_intervention,
    run_weak_intervention, search_and_tag, test_correctness_on_num_questions,
    test_questions_by_complexity, test_questions_by_impact, AblationConfig, AblationMode,
    AnswerImpact, ComplexityTag, HookSpec, InterventionStage, MajorTag, MathsConfig, MathsToken,
    MeanActivations, NodeLocation, QuestionBatch, QuestionGenerator, SubTask, UsefulNodeRegistry,
};
use tempfile::NamedTempFile;

fn cfg() -> MathsConfig {
    MathsConfig::default()
}

fn analysis_questions(cfg: &MathsConfig, batches: usize) -> QuestionBatch {
    let mut generator = QuestionGenerator::new(cfg, cfg.analysis_seed, true).unwrap();
    let mut questions = QuestionBatch::new(cfg.n_ctx());
    for _ in 0..batches {
        questions.concat(&generator.next_batch().unwrap()).unwrap();
    }
    questions
}

/// Classification of the worked examples
#[test]
fn test_worked_example_classes() {
    let cfg = cfg();
    let class = |a, op, b| classify(&cfg, &make_question(&cfg, a, b, op).unwrap()).1;

    assert_eq!(class(222_222, MathsToken::Plus, 111_111), ComplexityTag::AddS0);
    assert_eq!(class(555_555, MathsToken::Plus, 555_555), ComplexityTag::AddS1);
    assert_eq!(class(999_999, MathsToken::Minus, 111_111), ComplexityTag::SubM0);
    assert_eq!(class(100_000, MathsToken::Minus, 99_999), ComplexityTag::SubM1);
    assert_eq!(class(1, MathsToken::Minus, 2), ComplexityTag::NegN1);
}

/// The oracle answers every generated question correctly
#[test]
fn test_oracle_answers_generated_questions() {
    let cfg = cfg().mix(40, 40, 20);
    let model = OracleModel::new(&cfg);
    let questions = analysis_questions(&cfg, 2);

    let mut acfg = AblationConfig::new();
    let kept = test_questions_by_complexity(&model, &cfg, &mut acfg, &questions).unwrap();
    assert_eq!(kept.len(), questions.len());
    assert_eq!(acfg.num_varied_questions, questions.len());
    assert_eq!(acfg.num_varied_successes, questions.len());

    assert_eq!(test_questions_by_impact(&model, &cfg, &acfg, &questions, 0, false).unwrap(), 0);
}

/// Strong intervention on the digit sum head, then the same pair as a weak test
#[test]
fn test_strong_implies_weak() {
    let cfg = cfg();
    let model = OracleModel::new(&cfg);
    let rep = |d| cfg.repeat_digit(d);

    for digit in 0..cfg.n_digits {
        let head = NodeLocation::head(model.predicting_position(digit), 0, digit);
        let mut acfg = AblationConfig::new().with_nodes(vec![head]);
        let store = (rep(2), rep(1));
        let clean = (rep(5), rep(4));
        let expected = rep(5) + rep(4) - 6 * 10i64.pow(digit as u32);

        let (success, answer_success, impact_success) = run_strong_intervention(
            &model,
            &cfg,
            &mut acfg,
            store,
            clean,
            AnswerImpact::single(digit),
            expected,
        )
        .unwrap();
        assert!(success && answer_success && impact_success, "digit {digit}: {}", acfg.description);
        assert_eq!(acfg.stage, InterventionStage::Classified);

        assert!(run_weak_intervention(&model, &cfg, &mut acfg, store, clean).unwrap());
    }
}

/// Patching a head that is not read at the position changes nothing
#[test]
fn test_intervention_at_unread_position_has_no_impact() {
    let cfg = cfg();
    let model = OracleModel::new(&cfg);
    let rep = |d| cfg.repeat_digit(d);

    // Head 2 at the position predicting A4 only feeds the carry chain, and
    // neither question carries
    let mut acfg =
        AblationConfig::new().with_nodes(vec![NodeLocation::head(model.predicting_position(4), 0, 2)]);
    let success = run_weak_intervention(&model, &cfg, &mut acfg, (rep(2), rep(1)), (rep(5), rep(4))).unwrap();
    assert!(!success);
    assert!(acfg.intervened_impact.is_none());

    let (success, answer_success, _) = run_strong_intervention(
        &model,
        &cfg,
        &mut acfg,
        (rep(2), rep(1)),
        (rep(5), rep(4)),
        AnswerImpact::single(2),
        rep(5) + rep(4) - 600,
    )
    .unwrap();
    assert!(!success && !answer_success);
}

/// Make Carry: the carry neuron of digit 2, read where A3 is predicted,
/// flips exactly A3
#[test]
fn test_make_carry_changes_one_digit() {
    let cfg = cfg();
    let model = OracleModel::new(&cfg);
    let rep = |d| cfg.repeat_digit(d);
    let alter = 2;

    let neuron = NodeLocation::neuron(model.predicting_position(alter + 1), 0, alter);
    let mut acfg = AblationConfig::new().with_nodes(vec![neuron]);
    let store = (rep(2), rep(6) + 3 * 10i64.pow(alter as u32));
    let clean = (rep(3), rep(5));
    let expected = clean.0 + clean.1 + 10i64.pow(alter as u32 + 1);
    assert_eq!(expected, 889_888);

    let (success, _, _) = run_strong_intervention(
        &model,
        &cfg,
        &mut acfg,
        store,
        clean,
        AnswerImpact::single(alter + 1),
        expected,
    )
    .unwrap();
    assert!(success, "{}", acfg.description);
    assert_eq!(acfg.intervened_answer, "+0889888");
    assert_eq!(acfg.intervened_impact.to_string(), "A3");
}

/// Sub-task tests confirm the matching oracle nodes
#[test]
fn test_subtask_tests_on_oracle_nodes() {
    let cfg = cfg();
    let model = OracleModel::new(&cfg);
    let mut acfg = AblationConfig::new();
    let digit = 3;

    let sum_head = NodeLocation::head(model.predicting_position(digit), 0, digit);
    acfg.node_locations = vec![sum_head];
    assert!(SubTask::AddSa.test(&model, &cfg, &mut acfg, digit, true).unwrap());
    assert!(SubTask::SubMd.test(&model, &cfg, &mut acfg, digit, true).unwrap());
    assert!(SubTask::NegNd.test(&model, &cfg, &mut acfg, digit, true).unwrap());
    assert_eq!(acfg.operation, MathsToken::Minus);

    let carry_neuron = NodeLocation::neuron(model.predicting_position(digit), 0, digit - 1);
    acfg.node_locations = vec![carry_neuron];
    assert!(SubTask::AddSc.test(&model, &cfg, &mut acfg, digit, true).unwrap());
    assert!(SubTask::SubMb.test(&model, &cfg, &mut acfg, digit, true).unwrap());
    assert!(SubTask::NegNb.test(&model, &cfg, &mut acfg, digit, true).unwrap());

    // Carry out of digit 1 feeding the 9 sum at digit 2
    let pass_neuron = NodeLocation::neuron(model.predicting_position(digit), 0, digit - 2);
    acfg.node_locations = vec![pass_neuron];
    assert!(SubTask::AddSs.test(&model, &cfg, &mut acfg, digit, true).unwrap());

    // Digits outside the operands are rejected without running
    acfg.node_locations = vec![carry_neuron];
    assert!(!SubTask::AddSc.test(&model, &cfg, &mut acfg, 0, true).unwrap());
    assert!(acfg.expected_answer.is_empty());
    assert!(!SubTask::AddSs.test(&model, &cfg, &mut acfg, 1, true).unwrap());
}

/// Position sweep, node sweep, attention tags and sub-task search
#[test]
fn test_full_analysis_tags_sum_heads() {
    let cfg = cfg();
    let model = OracleModel::new(&cfg);
    let questions = analysis_questions(&cfg, 2);

    let mut acfg = AblationConfig::new();
    let means = MeanActivations::compute(&model, &questions).unwrap();
    assert_eq!(means.len(), 3);
    acfg = acfg.with_means(means);
    let mut registry = UsefulNodeRegistry::new();

    let positions = find_useful_positions(&model, &cfg, &mut acfg, &mut registry, &questions).unwrap();
    for digit in 0..cfg.n_digits {
        assert!(positions.contains(&model.predicting_position(digit)));
    }
    // Only positions whose logits predict an answer digit matter
    assert!(positions
        .iter()
        .all(|&p| p >= cfg.num_question_positions() && p < cfg.n_ctx() - 1));

    let num_useful =
        find_useful_nodes(&model, &cfg, &mut acfg, &mut registry, &questions, false).unwrap();
    assert!(num_useful >= cfg.n_digits);
    for digit in 0..cfg.n_digits {
        let head = NodeLocation::head(model.predicting_position(digit), 0, digit);
        let node = registry.get_node(&head).expect("sum head is useful");
        assert!(node.impact().contains(digit), "{}: {:?}", head.name(), node.tag_strings());
        assert!(node.summary(MajorTag::Fail).is_some());
        assert!(node.summary(MajorTag::MathAdd).is_some());
    }

    let num_attention = calc_attention_tags(&model, &cfg, &mut registry, &questions, 10.0).unwrap();
    assert!(num_attention >= 2 * cfg.n_digits);

    let num_tags =
        search_and_tag(&model, &cfg, &mut acfg, &mut registry, SubTask::AddSa, true, false).unwrap();
    assert!(num_tags >= cfg.n_digits);
    for digit in 0..cfg.n_digits {
        let head = NodeLocation::head(model.predicting_position(digit), 0, digit);
        let node = registry.get_node(&head).unwrap();
        assert!(
            node.tag(MajorTag::Algo, &format!("A{digit}.SA")).is_some(),
            "{}: {:?}",
            head.name(),
            node.tag_strings()
        );
    }
    assert!(acfg.node_locations.is_empty());

    // The export survives a round trip through JSON
    registry.sort_nodes();
    let file = NamedTempFile::new().unwrap();
    registry.save(file.path()).unwrap();
    let mut loaded = UsefulNodeRegistry::load(file.path()).unwrap();
    loaded.sort_nodes();
    assert_eq!(loaded.nodes(), registry.nodes());
}

/// Zero ablation of a sum head tags it through the harness
#[test]
fn test_zero_ablation_tags_node() {
    let cfg = cfg();
    let model = OracleModel::new(&cfg);
    let questions =
        make_maths_questions_and_answers(&cfg, MathsToken::Plus, &[(333_333, 555_555), (123_456, 111_111)])
            .unwrap();
    let mut acfg = AblationConfig::new().with_mode(AblationMode::Zero);
    let mut registry = UsefulNodeRegistry::new();

    let head = NodeLocation::head(model.predicting_position(1), 0, 1);
    let fails = test_questions_and_add_useful_node_tags(
        &model,
        &cfg,
        &mut acfg,
        &mut registry,
        &questions,
        &head,
    )
    .unwrap();
    assert_eq!(fails, 2);
    let node = registry.get_node(&head).unwrap();
    assert_eq!(node.summary(MajorTag::Fail).unwrap().text, "100");
    assert_eq!(node.summary(MajorTag::Impact).unwrap().text, "A1");
    assert_eq!(node.summary(MajorTag::MathAdd).unwrap().text, "S0");
}

/// Hooks are per call: an ablated run leaves the next run untouched
#[test]
fn test_hooks_do_not_leak() {
    let cfg = cfg();
    let model = OracleModel::new(&cfg);
    let questions = analysis_questions(&cfg, 1);
    let acfg = AblationConfig::new()
        .with_mode(AblationMode::Zero)
        .with_nodes(vec![NodeLocation::head(model.predicting_position(0), 0, 0)]);

    let hooks = maths_quanta::intervention::ablation_hooks(&model, &acfg).unwrap();
    let ablated = predict_questions(&model, &cfg, &questions, &hooks).unwrap();
    let clean = predict_questions(&model, &cfg, &questions, &HookSpec::new()).unwrap();
    assert_ne!(ablated, clean);
    assert!(clean.iter().zip(questions.rows()).all(|(p, row)| {
        p.answer_str() == maths_quanta::codec::answer_str_from_tokens(&cfg, row)
    }));
}

/// Correctness run over both operations
#[test]
fn test_correctness_run() {
    let cfg = cfg().mix(50, 50, 0);
    let model = OracleModel::new(&cfg);
    let acfg = AblationConfig::new();

    let summaries = test_correctness_on_num_questions(&model, &cfg, &acfg, 200, true).unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].operation, MathsToken::Plus);
    assert_eq!(summaries[1].operation, MathsToken::Minus);
    for summary in &summaries {
        assert_eq!(summary.questions, 4 * cfg.batch_size);
        assert_eq!(summary.fails, 0);
        assert_eq!(summary.successes(), summary.questions);
    }

    let mut bad = cfg.clone();
    bad.training_seed = maths_quanta::CORRECTNESS_SEED;
    assert!(test_correctness_on_num_questions(&model, &bad, &acfg, 10, false).is_err());
}

/// Same seed and configuration give identical batches
#[test]
fn test_generator_determinism() {
    let cfg = cfg().mix(50, 50, 0);
    let a: Vec<_> = QuestionGenerator::new(&cfg, 12_345, true).unwrap().take(4).collect();
    let b: Vec<_> = QuestionGenerator::new(&cfg, 12_345, true).unwrap().take(4).collect();
    assert_eq!(a, b);
}

/// Load a trained model named by `MATHS_QUANTA_MODEL` and check it answers
#[test]
#[ignore = "requires model download"]
fn test_trained_model_accuracy() {
    let Ok(source) = std::env::var("MATHS_QUANTA_MODEL") else {
        return;
    };
    let cfg = cfg();
    let model = load_backend(&source, true).unwrap();
    let acfg = AblationConfig::new();
    let summaries = test_correctness_on_num_questions(model.as_ref(), &cfg, &acfg, 1000, false).unwrap();
    assert!(summaries[0].accuracy() > 0.9);
}
