//! Contextual bandits: model parameters, Falcon scoring and deterministic action selection.
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    eval::EvaluationMode,
    events::{sdk_meta_data, AssignmentEvent, BanditEvent},
    sharder::{bucket, md5_u32},
    ufc::{AssignmentValue, Flag, Timestamp, VariationType},
    Configuration, ContextAttributes, EvaluationError, Result,
};

/// Response of the bandit parameters endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BanditResponse {
    /// Bandit parameters by bandit key.
    pub bandits: HashMap<String, BanditConfiguration>,
    /// When parameters were last updated.
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

impl BanditResponse {
    /// Decode bandit parameters from the raw response body.
    pub fn from_json(json: &[u8]) -> Result<BanditResponse> {
        Ok(serde_json::from_slice(json).map_err(|err| {
            log::warn!(target: "eppo", "failed to parse bandit parameters: {err}");
            err
        })?)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct BanditConfiguration {
    pub bandit_key: String,
    /// Model identifier. Only `"falcon"` is supported.
    pub model_name: String,
    pub model_version: String,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
    pub model_data: BanditModelData,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct BanditModelData {
    pub gamma: f64,
    pub default_action_score: f64,
    pub action_probability_floor: f64,
    #[serde(default)]
    pub coefficients: HashMap<String, BanditCoefficients>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct BanditCoefficients {
    pub action_key: String,
    pub intercept: f64,
    #[serde(default)]
    pub subject_numeric_coefficients: Vec<BanditNumericAttributeCoefficient>,
    #[serde(default)]
    pub subject_categorical_coefficients: Vec<BanditCategoricalAttributeCoefficient>,
    #[serde(default)]
    pub action_numeric_coefficients: Vec<BanditNumericAttributeCoefficient>,
    #[serde(default)]
    pub action_categorical_coefficients: Vec<BanditCategoricalAttributeCoefficient>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct BanditNumericAttributeCoefficient {
    pub attribute_key: String,
    pub coefficient: f64,
    pub missing_value_coefficient: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct BanditCategoricalAttributeCoefficient {
    pub attribute_key: String,
    pub value_coefficients: HashMap<String, f64>,
    pub missing_value_coefficient: f64,
}

/// Bandit model implementations, selected by [`BanditConfiguration::model_name`].
#[derive(Debug, Clone, Copy)]
pub enum BanditModel<'a> {
    /// Falcon: linear scoring with inverse-gap weighting.
    Falcon(&'a BanditModelData),
}

impl BanditConfiguration {
    /// Resolve the model implementation for these parameters.
    pub fn model(&self) -> std::result::Result<BanditModel<'_>, EvaluationError> {
        match self.model_name.as_str() {
            "falcon" => Ok(BanditModel::Falcon(&self.model_data)),
            other => Err(EvaluationError::UnknownBanditModel {
                model_name: other.to_owned(),
            }),
        }
    }
}

impl<'a> BanditModel<'a> {
    /// Compute a probability for every candidate action. Weights are returned sorted by action
    /// key and add up to 1 (within rounding).
    pub fn weigh_actions<'b>(
        &self,
        subject_attributes: &ContextAttributes,
        actions: &'b HashMap<String, ContextAttributes>,
    ) -> std::result::Result<ActionWeights<'b>, EvaluationError> {
        match self {
            BanditModel::Falcon(model) => model.weigh_actions(subject_attributes, actions),
        }
    }
}

/// Output of [`BanditModel::weigh_actions`].
#[derive(Debug, Clone, PartialEq)]
pub struct ActionWeights<'a> {
    /// Score of every action, by action key.
    pub scores: BTreeMap<&'a str, f64>,
    /// Probability of every action, by action key.
    pub weights: BTreeMap<&'a str, f64>,
    /// Action with the highest score. Ties go to the smallest key.
    pub best_action: &'a str,
}

impl ActionWeights<'_> {
    fn best_score(&self) -> f64 {
        self.scores[self.best_action]
    }
}

impl BanditModelData {
    fn weigh_actions<'a>(
        &self,
        subject_attributes: &ContextAttributes,
        actions: &'a HashMap<String, ContextAttributes>,
    ) -> std::result::Result<ActionWeights<'a>, EvaluationError> {
        let scores = actions
            .iter()
            .map(|(key, attributes)| {
                (
                    key.as_str(),
                    self.score_action(key, attributes, subject_attributes),
                )
            })
            .collect::<BTreeMap<_, _>>();

        // BTreeMap iterates in key order and `>` keeps the first maximum, so ties resolve to the
        // smallest key.
        let (best_action, best_score) = scores
            .iter()
            .fold(None, |best: Option<(&str, f64)>, (&key, &score)| match best {
                Some((_, best_score)) if score <= best_score => best,
                _ => Some((key, score)),
            })
            .ok_or(EvaluationError::NoActionsSupplied)?;

        let n_actions = scores.len() as f64;
        // The floor is shared between all actions so that non-best weights never exceed 1.
        let min_probability = self.action_probability_floor / n_actions;
        let mut weights = BTreeMap::new();
        let mut remainder_weight = 1.0;
        for (&action, &score) in &scores {
            if action == best_action {
                continue;
            }
            let weight = round4(
                (1.0 / (n_actions + self.gamma * (best_score - score))).max(min_probability),
            );
            weights.insert(action, weight);
            remainder_weight -= weight;
        }
        weights.insert(best_action, round4(f64::max(remainder_weight, 0.0)));

        Ok(ActionWeights {
            scores,
            weights,
            best_action,
        })
    }

    fn score_action(
        &self,
        action_key: &str,
        action_attributes: &ContextAttributes,
        subject_attributes: &ContextAttributes,
    ) -> f64 {
        let Some(coefficients) = self.coefficients.get(action_key) else {
            return self.default_action_score;
        };

        coefficients.intercept
            + score_attributes(
                action_attributes,
                &coefficients.action_numeric_coefficients,
                &coefficients.action_categorical_coefficients,
            )
            + score_attributes(
                subject_attributes,
                &coefficients.subject_numeric_coefficients,
                &coefficients.subject_categorical_coefficients,
            )
    }
}

fn score_attributes(
    attributes: &ContextAttributes,
    numeric_coefficients: &[BanditNumericAttributeCoefficient],
    categorical_coefficients: &[BanditCategoricalAttributeCoefficient],
) -> f64 {
    numeric_coefficients
        .iter()
        .map(|coef| {
            attributes
                .numeric
                .get(&coef.attribute_key)
                // Infinite/NaN attributes poison the calculation down the line.
                .filter(|n| n.is_finite())
                .map(|value| value * coef.coefficient)
                .unwrap_or(coef.missing_value_coefficient)
        })
        .chain(categorical_coefficients.iter().map(|coef| {
            attributes
                .categorical
                .get(&coef.attribute_key)
                .and_then(|value| coef.value_coefficients.get(value))
                .copied()
                .unwrap_or(coef.missing_value_coefficient)
        }))
        .sum()
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Deterministically pick one action for the subject.
///
/// Actions are shuffled by the hash of `"{subject_key}-{bandit_key}-{action_key}"`, then each one
/// receives a contiguous range of `floor(weight × total_shards)` shards. The last action's range is
/// extended to `total_shards` to absorb rounding. The subject is bucketed the same way flags bucket
/// it, with the flag key as salt.
pub(crate) fn select_action<'a>(
    flag_key: &str,
    subject_key: &str,
    bandit_key: &str,
    total_shards: u64,
    weights: &BTreeMap<&'a str, f64>,
) -> Option<&'a str> {
    let shuffled_actions = {
        let mut shuffled_actions = weights.keys().copied().collect::<Vec<_>>();
        shuffled_actions.sort_by_cached_key(|&action_key| {
            (
                md5_u32(&format!("{subject_key}-{bandit_key}-{action_key}")),
                action_key,
            )
        });
        shuffled_actions
    };

    let subject_bucket = bucket(flag_key, subject_key, total_shards);

    let mut range_start = 0;
    for (i, &action_key) in shuffled_actions.iter().enumerate() {
        let range_end = if i + 1 == shuffled_actions.len() {
            total_shards
        } else {
            range_start + (weights[action_key] * total_shards as f64).floor() as u64
        };
        if range_start <= subject_bucket && subject_bucket < range_end {
            return Some(action_key);
        }
        range_start = range_end;
    }

    None
}

/// Result of evaluating a bandit flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanditResult {
    /// Selected variation from the feature flag.
    pub variation: String,
    /// Selected action, if the variation is controlled by a bandit.
    pub action: Option<String>,
    /// Probability the selected action had.
    pub action_probability: Option<f64>,
    /// Flag assignment event that needs to be logged to analytics storage.
    pub assignment_event: Option<AssignmentEvent>,
    /// Bandit assignment event that needs to be logged to analytics storage.
    pub bandit_event: Option<BanditEvent>,
}

impl BanditResult {
    pub(crate) fn from_default(default_variation: &str) -> BanditResult {
        BanditResult {
            variation: default_variation.to_owned(),
            action: None,
            action_probability: None,
            assignment_event: None,
            bandit_event: None,
        }
    }
}

impl Configuration {
    /// Evaluate the specified string feature flag for the given subject. If resulting variation is
    /// a bandit, evaluate the bandit to return the action.
    #[allow(clippy::too_many_arguments)]
    pub fn get_bandit_action(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &ContextAttributes,
        actions: &HashMap<String, ContextAttributes>,
        default_variation: &str,
        mode: EvaluationMode,
        now: DateTime<Utc>,
    ) -> std::result::Result<BanditResult, EvaluationError> {
        let assignment = self.get_assignment(
            flag_key,
            subject_key,
            &subject_attributes.to_generic_attributes(),
            Some(VariationType::String),
            mode,
            now,
        )?;

        let (variation, assignment_event) = match assignment {
            Some(assignment) => match assignment.value {
                AssignmentValue::String(variation) => (variation, assignment.event),
                other => {
                    return Err(EvaluationError::TypeMismatch {
                        expected: VariationType::String,
                        found: other.variation_type(),
                    })
                }
            },
            None => (default_variation.to_owned(), None),
        };

        let Some(bandit_key) = self.get_bandit_key(flag_key, &variation) else {
            // It's not a bandit variation, just return it.
            return Ok(BanditResult {
                variation,
                action: None,
                action_probability: None,
                assignment_event,
                bandit_event: None,
            });
        };

        let Some(bandit) = self.get_bandit(bandit_key) else {
            log::warn!(target: "eppo", flag_key, bandit_key; "unable to find bandit configuration");
            return Err(EvaluationError::BanditNotFound {
                bandit_key: bandit_key.to_owned(),
            });
        };

        let weights = bandit.model()?.weigh_actions(subject_attributes, actions)?;

        let total_shards = self
            .flags
            .flags
            .get(flag_key)
            .and_then(|flag| Option::<&Flag>::from(flag))
            .map_or(10_000, |flag| flag.total_shards);

        let action_key = select_action(
            flag_key,
            subject_key,
            bandit_key,
            total_shards,
            &weights.weights,
        )
        .ok_or(EvaluationError::NoActionsSupplied)?;

        let action_probability = weights.weights[action_key];
        let optimality_gap = weights.best_score() - weights.scores[action_key];
        let action_attributes = &actions[action_key];

        log::trace!(target: "eppo",
                    flag_key,
                    subject_key,
                    bandit_key,
                    action_key,
                    action_probability;
                    "evaluated a bandit");

        let bandit_event = BanditEvent {
            flag_key: flag_key.to_owned(),
            bandit_key: bandit_key.to_owned(),
            subject: subject_key.to_owned(),
            action: action_key.to_owned(),
            action_probability,
            optimality_gap,
            model_version: bandit.model_version.clone(),
            timestamp: now.to_rfc3339(),
            subject_numeric_attributes: subject_attributes.numeric.clone(),
            subject_categorical_attributes: subject_attributes.categorical.clone(),
            action_numeric_attributes: action_attributes.numeric.clone(),
            action_categorical_attributes: action_attributes.categorical.clone(),
            meta_data: sdk_meta_data(),
        };

        Ok(BanditResult {
            variation,
            action: Some(action_key.to_owned()),
            action_probability: Some(action_probability),
            assignment_event,
            bandit_event: Some(bandit_event),
        })
    }
}
