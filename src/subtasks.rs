//! Algorithm sub-task tests
//!
//! Each [`SubTask`] names one micro-behaviour that a node may implement,
//! such as "sum digit pair n modulo 10" or "make the carry out of digit
//! n-1". A sub-task provides:
//!
//! - a tag, written under [`MajorTag::Algo`] when the test passes
//! - prerequisites, a [`NodeFilter`] that narrows the candidate nodes using
//!   the tags written by earlier sweeps
//! - a test, one or two interventions with predicted outcomes
//!
//! [`search_and_tag`] runs a sub-task against every candidate at every
//! useful position and tags the nodes that pass.

use anyhow::Result;
use std::fmt;
use tracing::{debug, info};

use crate::ablation::AblationConfig;
use crate::config::MathsConfig;
use crate::filter::NodeFilter;
use crate::impact::AnswerImpact;
use crate::intervention::{run_strong_intervention, run_weak_intervention};
use crate::model::MathsBackend;
use crate::node::{answer_name, position_name, MajorTag, NodeLocation};
use crate::registry::UsefulNodeRegistry;
use crate::vocab::MathsToken;

/// PCA tag text marking an interpretable addition node
pub const ADD_PCA_TAG: &str = "PA";
/// PCA tag text marking an interpretable subtraction node
pub const SUB_PCA_TAG: &str = "PS";

/// Algorithm micro-behaviours that interventions can confirm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubTask {
    /// Addition: base sum of digit pair n
    AddSa,
    /// Addition: carry out of digit pair n-1
    AddSc,
    /// Addition: digit pair n-1 sums to 9 and passes a carry on
    AddSs,
    /// Addition: three-way case of digit pair n (below 9, 9, above 9)
    AddSt,
    /// Subtraction: base difference of digit pair n
    SubMd,
    /// Subtraction: borrow out of digit pair n-1
    SubMb,
    /// Subtraction: three-way case of digit pair n, deciding the answer sign
    SubMt,
    /// Negative subtraction: base difference of digit pair n
    NegNd,
    /// Negative subtraction: borrow out of digit pair n-1
    NegNb,
    /// Attends to the operator
    Opr,
    /// Attends to the answer sign
    Sgn,
}

impl SubTask {
    pub const ALL: [Self; 11] = [
        Self::AddSa,
        Self::AddSc,
        Self::AddSs,
        Self::AddSt,
        Self::SubMd,
        Self::SubMb,
        Self::SubMt,
        Self::NegNd,
        Self::NegNb,
        Self::Opr,
        Self::Sgn,
    ];

    /// Short code used in tags
    pub const fn code(self) -> &'static str {
        match self {
            Self::AddSa => "SA",
            Self::AddSc => "SC",
            Self::AddSs => "SS",
            Self::AddSt => "ST",
            Self::SubMd => "MD",
            Self::SubMb => "MB",
            Self::SubMt => "MT",
            Self::NegNd => "ND",
            Self::NegNb => "NB",
            Self::Opr => "OPR",
            Self::Sgn => "SGN",
        }
    }

    /// Operator the test questions use, `None` when any will do
    pub const fn operation(self) -> Option<MathsToken> {
        match self {
            Self::AddSa | Self::AddSc | Self::AddSs | Self::AddSt => Some(MathsToken::Plus),
            Self::SubMd | Self::SubMb | Self::SubMt | Self::NegNd | Self::NegNb => {
                Some(MathsToken::Minus)
            }
            Self::Opr | Self::Sgn => None,
        }
    }

    /// Algo tag written for a node passing at `digit`, e.g. `A3.SA`
    ///
    /// `None` when the tag would name a digit below `A0`.
    pub fn tag(self, digit: usize) -> Option<String> {
        let tag_digit = match self {
            Self::AddSc | Self::AddSs | Self::SubMb => digit.checked_sub(1)?,
            Self::Opr | Self::Sgn => return Some(self.code().to_string()),
            _ => digit,
        };
        Some(format!("{}.{}", answer_name(tag_digit), self.code()))
    }

    /// Candidate filter for a node at `position` tested at `digit`
    ///
    /// `None` when the digits involved fall outside the operands.
    pub fn prereqs(self, cfg: &MathsConfig, position: usize, digit: usize) -> Option<NodeFilter> {
        match self {
            Self::AddSa | Self::SubMd | Self::NegNd => {
                math_common_prereqs(cfg, position, digit, digit)
            }
            Self::AddSc | Self::SubMb | Self::NegNb => {
                math_common_prereqs(cfg, position, digit.checked_sub(1)?, digit)
            }
            Self::AddSs => math_common_prereqs(cfg, position, digit.checked_sub(2)?, digit),
            Self::AddSt => tricase_prereqs(cfg, position, digit, MajorTag::MathAdd, ADD_PCA_TAG, "S"),
            Self::SubMt => tricase_prereqs(cfg, position, digit, MajorTag::MathSub, SUB_PCA_TAG, "M"),
            Self::Opr => Some(NodeFilter::And(vec![
                NodeFilter::Head,
                NodeFilter::position(position_name(position)),
                NodeFilter::attention(cfg.op_position_name()),
            ])),
            Self::Sgn => Some(NodeFilter::And(vec![
                NodeFilter::Head,
                NodeFilter::position(position_name(position)),
                NodeFilter::attention(cfg.an_to_position_name(cfg.n_digits + 1)),
            ])),
        }
    }

    /// Run the sub-task's interventions on the nodes in `acfg.node_locations`
    pub fn test(
        self,
        model: &dyn MathsBackend,
        cfg: &MathsConfig,
        acfg: &mut AblationConfig,
        digit: usize,
        strong: bool,
    ) -> Result<bool> {
        if let Some(operation) = self.operation() {
            acfg.operation = operation;
        }
        let success = match self {
            Self::AddSa => add_sa_test(model, cfg, acfg, digit, strong)?,
            Self::AddSc => add_sc_test(model, cfg, acfg, digit)?,
            Self::AddSs => add_ss_test(model, cfg, acfg, digit)?,
            Self::AddSt => add_st_test(model, cfg, acfg, digit)?,
            Self::SubMd => sub_md_test(model, cfg, acfg, digit, strong)?,
            Self::SubMb => sub_mb_test(model, cfg, acfg, digit)?,
            Self::SubMt => sub_mt_test(model, cfg, acfg, digit)?,
            Self::NegNd => neg_nd_test(model, cfg, acfg, digit, strong)?,
            Self::NegNb => neg_nb_test(model, cfg, acfg, digit)?,
            Self::Opr | Self::Sgn => true,
        };
        if success {
            info!(
                "Test confirmed {} perform {}{}",
                acfg.node_names(),
                self.tag(digit).unwrap_or_else(|| self.code().to_string()),
                if strong { "" } else { " (weak)" }
            );
        }
        Ok(success)
    }
}

impl fmt::Display for SubTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Shared prerequisites: a head at `position` that attends to Dn and D'n
/// of `attend_digit` and whose ablation impacts `A{impact_digit}`
pub fn math_common_prereqs(
    cfg: &MathsConfig,
    position: usize,
    attend_digit: usize,
    impact_digit: usize,
) -> Option<NodeFilter> {
    if attend_digit >= cfg.n_digits {
        return None;
    }
    Some(NodeFilter::And(vec![
        NodeFilter::Head,
        NodeFilter::position(position_name(position)),
        NodeFilter::attention(cfg.dn_to_position_name(attend_digit)),
        NodeFilter::attention(cfg.ddn_to_position_name(attend_digit)),
        NodeFilter::impact(answer_name(impact_digit)),
    ]))
}

/// Heads between the operator and `=` that attend to digit pair `focus`,
/// carry an interpretable PCA tag and affect the operation's questions
fn tricase_prereqs(
    cfg: &MathsConfig,
    position: usize,
    focus: usize,
    major: MajorTag,
    pca_tag: &str,
    complexity_prefix: &str,
) -> Option<NodeFilter> {
    if focus >= cfg.n_digits {
        return None;
    }
    Some(NodeFilter::And(vec![
        NodeFilter::Head,
        NodeFilter::position_min(position_name(cfg.op_position())),
        NodeFilter::position_max(position_name(cfg.num_question_positions())),
        NodeFilter::attention(cfg.dn_to_position_name(focus)),
        NodeFilter::attention(cfg.ddn_to_position_name(focus)),
        NodeFilter::contains(MajorTag::Pca, pca_tag),
        NodeFilter::contains(major, complexity_prefix),
        NodeFilter::position(position_name(position)),
    ]))
}

fn pow10(digit: usize) -> i64 {
    10i64.pow(digit as u32)
}

/// Digit is outside the operands: forget the intervention and fail
fn reject(acfg: &mut AblationConfig) -> Result<bool> {
    acfg.clear_intervention();
    Ok(false)
}

/// Two strong tests whose store and clean questions differ in every digit
/// but never carry, so only `A{digit}` may change
struct PairedTest {
    store: (i64, i64),
    clean: (i64, i64),
    expected: i64,
}

fn run_paired(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    digit: usize,
    strong: bool,
    tests: [PairedTest; 2],
) -> Result<bool> {
    let mut successes = [false; 2];
    let mut impacts = [false; 2];
    for (i, t) in tests.into_iter().enumerate() {
        let (success, _, impact_success) = run_strong_intervention(
            model,
            cfg,
            acfg,
            t.store,
            t.clean,
            AnswerImpact::single(digit),
            t.expected,
        )?;
        successes[i] = success;
        impacts[i] = impact_success;
    }
    Ok(if strong {
        successes.iter().all(|&s| s)
    } else {
        impacts.iter().all(|&s| s)
    })
}

fn add_sa_test(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    digit: usize,
    strong: bool,
) -> Result<bool> {
    if digit >= cfg.n_digits {
        return reject(acfg);
    }
    let rep = |d| cfg.repeat_digit(d);
    let tests = [
        // 222222+111111 into 555555+444444: +0999999 becomes +0999399 at A2
        PairedTest {
            store: (rep(2), rep(1)),
            clean: (rep(5), rep(4)),
            expected: rep(5) + rep(4) + (3 - 9) * pow10(digit),
        },
        // 222222+666666 into 555555+111111: +0666666 becomes +0666866 at A2
        PairedTest {
            store: (rep(2), rep(6)),
            clean: (rep(5), rep(1)),
            expected: rep(5) + rep(1) + (8 - 6) * pow10(digit),
        },
    ];
    run_paired(model, cfg, acfg, digit, strong, tests)
}

fn add_sc_test(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    impact_digit: usize,
) -> Result<bool> {
    let Some(alter) = impact_digit.checked_sub(1).filter(|&a| a < cfg.n_digits) else {
        return reject(acfg);
    };
    let rep = |d| cfg.repeat_digit(d);
    // 222222+666966 carries out of the altered digit, 333333+555555 does not
    let store = (rep(2), rep(6) + 3 * pow10(alter));
    let clean = (rep(3), rep(5));
    let expected = clean.0 + clean.1 + pow10(alter + 1);
    let (success, _, _) = run_strong_intervention(
        model,
        cfg,
        acfg,
        store,
        clean,
        AnswerImpact::single(impact_digit),
        expected,
    )?;
    Ok(success)
}

fn add_ss_test(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    alter: usize,
) -> Result<bool> {
    if alter < 2 || alter > cfg.n_digits {
        return reject(acfg);
    }
    let rep = |d| cfg.repeat_digit(d);
    // Store 25222+44444 has a 9 sum but no carry into it. Clean
    // 34633+55555 carries through the 9 sum into the altered digit.
    let store = (rep(2) + 3 * pow10(alter - 1), rep(4));
    let clean = (rep(3) + pow10(alter - 1) + 3 * pow10(alter - 2), rep(5));
    let expected = clean.0 + clean.1 - pow10(alter);
    let (success, _, _) = run_strong_intervention(
        model,
        cfg,
        acfg,
        store,
        clean,
        AnswerImpact::single(alter),
        expected,
    )?;
    Ok(success)
}

fn add_st_test(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    focus: usize,
) -> Result<bool> {
    if focus >= cfg.n_digits {
        return reject(acfg);
    }
    let rep = |d| cfg.repeat_digit(d);
    // 222222+777977 carries at the focus digit, 333333+666666 sums to 9 everywhere
    let store = (rep(2), rep(7) + 2 * pow10(focus));
    let clean = (rep(3), rep(6));
    run_weak_intervention(model, cfg, acfg, store, clean)
}

fn sub_md_test(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    digit: usize,
    strong: bool,
) -> Result<bool> {
    if digit >= cfg.n_digits {
        return reject(acfg);
    }
    let rep = |d| cfg.repeat_digit(d);
    let tests = [
        // 333333-111111 into 999999-444444: +0555555 becomes +0555255 at A2
        PairedTest {
            store: (rep(3), rep(1)),
            clean: (rep(9), rep(4)),
            expected: rep(9) - rep(4) + (2 - 5) * pow10(digit),
        },
        // 666666-222222 into 999999-333333: +0666666 becomes +0666466 at A2
        PairedTest {
            store: (rep(6), rep(2)),
            clean: (rep(9), rep(3)),
            expected: rep(9) - rep(3) + (4 - 6) * pow10(digit),
        },
    ];
    run_paired(model, cfg, acfg, digit, strong, tests)
}

fn sub_mb_test(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    impact_digit: usize,
) -> Result<bool> {
    let Some(alter) = impact_digit.checked_sub(1).filter(|&a| a < cfg.n_digits) else {
        return reject(acfg);
    };
    let rep = |d| cfg.repeat_digit(d);
    // 222222-111311 borrows at the altered digit, 777777-444444 does not
    let store = (rep(2), rep(1) + 2 * pow10(alter));
    let clean = (rep(7), rep(4));
    let expected = clean.0 - clean.1 - pow10(alter + 1);
    let (success, _, _) = run_strong_intervention(
        model,
        cfg,
        acfg,
        store,
        clean,
        AnswerImpact::single(impact_digit),
        expected,
    )?;
    Ok(success)
}

fn sub_mt_test(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    focus: usize,
) -> Result<bool> {
    if focus >= cfg.n_digits {
        return reject(acfg);
    }
    let rep = |d| cfg.repeat_digit(d);
    // 555555-000000 is positive, 222222-222422 is negative because of the focus digit
    let store = (rep(5), 0);
    let clean = (rep(2), rep(2) + 2 * pow10(focus));
    run_weak_intervention(model, cfg, acfg, store, clean)
}

fn neg_nd_test(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    digit: usize,
    strong: bool,
) -> Result<bool> {
    if digit >= cfg.n_digits {
        return reject(acfg);
    }
    let rep = |d| cfg.repeat_digit(d);
    let tests = [
        // 033333-111111 into 099999-444444: -0344445 becomes -0347445 at A3
        PairedTest {
            store: (rep(3) / 10, rep(1)),
            clean: (rep(9) / 10, rep(4)),
            expected: rep(9) / 10 - rep(4) - (7 - 4) * pow10(digit),
        },
        // 066666-222222 into 099999-333333: -0233334 becomes -0235334 at A3
        PairedTest {
            store: (rep(6) / 10, rep(2)),
            clean: (rep(9) / 10, rep(3)),
            expected: rep(9) / 10 - rep(3) - (5 - 3) * pow10(digit),
        },
    ];
    run_paired(model, cfg, acfg, digit, strong, tests)
}

fn neg_nb_test(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    impact_digit: usize,
) -> Result<bool> {
    let Some(alter) = impact_digit.checked_sub(1).filter(|&a| a < cfg.n_digits) else {
        return reject(acfg);
    };
    let rep = |d| cfg.repeat_digit(d);
    // 022222-111311 has no borrow at the altered digit, 077777-444444 does
    let store = (rep(2) / 10, rep(1) + 2 * pow10(alter));
    let clean = (rep(7) / 10, rep(4));
    let expected = clean.0 - clean.1 - pow10(alter + 1);
    let (success, _, _) = run_strong_intervention(
        model,
        cfg,
        acfg,
        store,
        clean,
        AnswerImpact::single(impact_digit),
        expected,
    )?;
    Ok(success)
}

/// Test `subtask` on every candidate node and tag the ones that pass
///
/// Candidates are the registry nodes passing the sub-task prerequisites at
/// each useful position and answer digit. With `allow_pairs`, pairs of
/// candidates are tried where no single candidate passes. Returns the
/// number of tags written.
pub fn search_and_tag(
    model: &dyn MathsBackend,
    cfg: &MathsConfig,
    acfg: &mut AblationConfig,
    registry: &mut UsefulNodeRegistry,
    subtask: SubTask,
    strong: bool,
    allow_pairs: bool,
) -> Result<usize> {
    let mut num_tags = 0;
    for position in registry.positions() {
        for digit in 0..cfg.num_answer_positions() {
            let (Some(filter), Some(tag)) =
                (subtask.prereqs(cfg, position, digit), subtask.tag(digit))
            else {
                continue;
            };
            let candidates: Vec<NodeLocation> = registry.filter_locations(&filter);
            if candidates.is_empty() {
                continue;
            }
            debug!(
                "{subtask} at {} digit {digit}: {} candidates",
                position_name(position),
                candidates.len()
            );

            let mut found = false;
            for &candidate in &candidates {
                acfg.node_locations = vec![candidate];
                if subtask.test(model, cfg, acfg, digit, strong)? {
                    registry.add_tag(&candidate, MajorTag::Algo, &tag);
                    num_tags += 1;
                    found = true;
                }
            }

            if allow_pairs && !found {
                for (i, &first) in candidates.iter().enumerate() {
                    for &second in &candidates[i + 1..] {
                        acfg.node_locations = vec![first, second];
                        if subtask.test(model, cfg, acfg, digit, strong)? {
                            registry.add_tag(&first, MajorTag::Algo, &tag);
                            registry.add_tag(&second, MajorTag::Algo, &tag);
                            num_tags += 2;
                        }
                    }
                }
            }
        }
    }
    acfg.node_locations.clear();
    info!("{subtask}: {num_tags} tags written");
    Ok(num_tags)
}
