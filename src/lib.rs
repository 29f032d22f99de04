// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // MathsConfig in config.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::trivially_copy_pass_by_ref)] // &usize for API consistency
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::unnecessary_wraps)] // Result for future error handling
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! maths-quanta: mechanistic interpretability of arithmetic transformers
//!
//! Finds which attention heads and MLP neurons of a small transformer
//! trained on `D5..D0 OP D'5..D'0 = ±A6..A0` questions implement which
//! parts of the addition and subtraction algorithms.
//!
//! ## Architecture
//!
//! - `config`: Question layout, position names and analysis settings
//! - `vocab`: Fixed token vocabulary
//! - `codec`: Question encoding, decoding and batches
//! - `generator`: Seeded, optionally enriched question batches
//! - `complexity`: Carry/borrow cascade classification of questions
//! - `impact`: Answer-digit impact signatures
//! - `node`: Node locations and structured tags
//! - `filter`: Node predicates
//! - `registry`: Useful-node registry with JSON export
//! - `hooks`: Per-call activation captures and patches
//! - `masks`: Cached causal attention masks
//! - `model`: `MathsBackend` capability trait
//! - `forward_hooked`: TransformerLens-compatible hooked transformer
//! - `loss`: Answer loss and predicted answers
//! - `ablation`: Ablation modes, mean activations and intervention state
//! - `intervention`: Store/clean activation patching with strong and weak tests
//! - `subtasks`: Algorithm sub-task tests and search
//! - `harness`: Accuracy, position and node sweeps with failure tagging
//! - `attention`: Attention pattern tags
//! - `accuracy`: Million-question correctness run

pub mod ablation;
pub mod accuracy;
pub mod attention;
pub mod codec;
pub mod complexity;
pub mod config;
pub mod filter;
pub mod forward_hooked;
pub mod generator;
pub mod harness;
pub mod hooks;
pub mod impact;
pub mod intervention;
pub mod loss;
pub mod masks;
pub mod model;
pub mod node;
pub mod registry;
pub mod subtasks;
pub mod vocab;

pub use ablation::{AblationConfig, AblationMode, InterventionStage, MeanActivations};
pub use accuracy::{test_correctness_on_num_questions, AccuracySummary};
pub use attention::calc_attention_tags;
pub use codec::{
    int_to_answer_str, make_maths_questions_and_answers, make_question, tokens_to_unsigned_int,
    DecodeError, MathsQuestion, QuestionBatch,
};
pub use complexity::{classify, ComplexityTag, QuestionCategory};
pub use config::{MathsConfig, CORRECTNESS_SEED};
pub use filter::{FilterTarget, NodeFilter, PositionCondition, QuantaFilter, QuantaFilterKind};
pub use forward_hooked::{HookedConfig, HookedTransformer};
pub use generator::QuestionGenerator;
pub use harness::{
    classify_and_tag, find_useful_nodes, find_useful_positions, test_questions_by_complexity,
    test_questions_by_impact,
};
pub use hooks::{HookCache, HookPoint, HookSpec, Patch, PatchSource};
pub use impact::{answer_impact, AnswerImpact, NO_IMPACT_TAG};
pub use intervention::{run_strong_intervention, run_weak_intervention};
pub use loss::{logits_to_tokens_loss, QuestionPrediction};
pub use masks::{clear_mask_caches, create_causal_mask};
pub use model::{load_backend, select_device, MathsBackend};
pub use node::{MajorTag, NodeLocation, TagValue, UsefulNode};
pub use registry::{NodeRecord, UsefulNodeRegistry};
pub use subtasks::{search_and_tag, SubTask};
pub use vocab::{MathsToken, VOCAB_SIZE};
