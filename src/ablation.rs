//! Ablation configuration and mean activations
//!
//! [`AblationConfig`] carries both the configuration of an ablation sweep
//! and the state of the intervention currently in flight. It is created per
//! analysis stage and never persisted.

use anyhow::Result;
use candle_core::{DType, Tensor};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::codec::QuestionBatch;
use crate::hooks::{HookPoint, HookSpec};
use crate::impact::AnswerImpact;
use crate::model::MathsBackend;
use crate::node::NodeLocation;
use crate::vocab::MathsToken;

/// Default mean-loss threshold above which a question counts as affected
pub const DEFAULT_THRESHOLD: f32 = 0.01;

/// What replaces an ablated activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AblationMode {
    Zero,
    /// Mean over a sample batch
    #[default]
    Mean,
    /// Value captured from a paired store run
    Store,
}

/// Progress of one intervention call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterventionStage {
    #[default]
    Configured,
    StoreRun,
    CleanRunWithPatch,
    Compare,
    Classified,
}

/// Batch-mean activations used by mean ablation, each `[1, seq, ...]`
#[derive(Clone, Default)]
pub struct MeanActivations {
    means: HashMap<HookPoint, Tensor>,
}

impl MeanActivations {
    /// Average `hook_z`, `mlp.hook_post` and `hook_resid_post` of every
    /// layer over a sample batch
    pub fn compute(model: &dyn MathsBackend, questions: &QuestionBatch) -> Result<Self> {
        anyhow::ensure!(
            !questions.is_empty(),
            "Cannot compute mean activations of an empty batch"
        );
        let mut hooks = HookSpec::new();
        let points: Vec<HookPoint> = (0..model.n_layers())
            .flat_map(|l| [HookPoint::AttnZ(l), HookPoint::MlpPost(l), HookPoint::ResidPost(l)])
            .collect();
        for point in &points {
            hooks.capture(point.clone());
        }

        let tokens = questions.to_tensor(model.device())?;
        let cache = model.forward(&tokens, &hooks)?;

        let mut means = HashMap::with_capacity(points.len());
        for point in points {
            let mean = cache.require(&point)?.to_dtype(DType::F32)?.mean_keepdim(0)?;
            means.insert(point, mean);
        }
        debug!(
            "Computed mean activations over {} questions at {} hook points",
            questions.len(),
            means.len()
        );
        Ok(Self { means })
    }

    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.means.get(hook)
    }

    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.means
            .get(hook)
            .ok_or_else(|| anyhow::anyhow!("No mean activation stored for `{hook}`"))
    }

    pub fn insert(&mut self, hook: HookPoint, mean: Tensor) {
        self.means.insert(hook, mean);
    }

    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }
}

impl fmt::Debug for MeanActivations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.means.keys().map(ToString::to_string).collect();
        names.sort();
        f.debug_struct("MeanActivations")
            .field("hooks", &names)
            .finish()
    }
}

/// Ablation settings plus the state of the current intervention
#[derive(Debug, Clone)]
pub struct AblationConfig {
    /// Operator of the questions built by intervention tests
    pub operation: MathsToken,
    /// Nodes to patch
    pub node_locations: Vec<NodeLocation>,
    pub mode: AblationMode,
    /// Mean loss above which a question counts as affected
    pub threshold: f32,
    pub show_test_failures: bool,
    pub show_test_successes: bool,
    pub means: Option<MeanActivations>,

    pub expected_answer: String,
    pub expected_impact: AnswerImpact,
    pub intervened_answer: String,
    pub intervened_impact: AnswerImpact,
    pub description: String,
    pub stage: InterventionStage,

    pub num_varied_questions: usize,
    pub num_varied_successes: usize,
}

impl Default for AblationConfig {
    fn default() -> Self {
        Self {
            operation: MathsToken::Plus,
            node_locations: Vec::new(),
            mode: AblationMode::default(),
            threshold: DEFAULT_THRESHOLD,
            show_test_failures: false,
            show_test_successes: false,
            means: None,
            expected_answer: String::new(),
            expected_impact: AnswerImpact::none(),
            intervened_answer: String::new(),
            intervened_impact: AnswerImpact::none(),
            description: String::new(),
            stage: InterventionStage::Configured,
            num_varied_questions: 0,
            num_varied_successes: 0,
        }
    }
}

impl AblationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, operation: MathsToken) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_nodes(mut self, nodes: Vec<NodeLocation>) -> Self {
        self.node_locations = nodes;
        self
    }

    pub fn with_mode(mut self, mode: AblationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_show_failures(mut self, show: bool) -> Self {
        self.show_test_failures = show;
        self
    }

    pub fn with_show_successes(mut self, show: bool) -> Self {
        self.show_test_successes = show;
        self
    }

    pub fn with_means(mut self, means: MeanActivations) -> Self {
        self.means = Some(means);
        self
    }

    /// Start a new intervention with the given expectation
    pub fn reset_intervention(&mut self, expected_answer: &str, expected_impact: AnswerImpact) {
        self.expected_answer = expected_answer.to_string();
        self.expected_impact = expected_impact;
        self.intervened_answer.clear();
        self.intervened_impact = AnswerImpact::none();
        self.description.clear();
        self.stage = InterventionStage::Configured;
    }

    /// Forget the current intervention without a new expectation
    pub fn clear_intervention(&mut self) {
        self.reset_intervention("", AnswerImpact::none());
    }

    pub(crate) fn advance(&mut self, stage: InterventionStage) {
        debug!("Intervention {:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }

    /// Names of the patched nodes, e.g. `P14L0H1, P14L0H2`
    pub fn node_names(&self) -> String {
        self.node_locations
            .iter()
            .map(NodeLocation::name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn means(&self) -> Result<&MeanActivations> {
        self.means
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Mean ablation requested but no mean activations are stored"))
    }
}
