//! Events that need to be logged to the user's analytics storage.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{ufc::Value, Attributes};

/// Represents an event capturing the assignment of a feature flag to a subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentEvent {
    /// The key of the feature flag being assigned.
    pub feature_flag: String,
    /// The key of the allocation that the subject was assigned to.
    pub allocation: String,
    /// The key of the experiment associated with the assignment (`{flag}-{allocation}`).
    pub experiment: String,
    /// The key of the variation assigned to the subject.
    pub variation: String,
    /// The value of the assigned variation.
    pub variation_value: Value,
    /// The key identifying the subject receiving the assignment.
    pub subject: String,
    /// Attributes of the subject at evaluation time.
    pub subject_attributes: Attributes,
    /// RFC 3339 timestamp of the evaluation.
    pub timestamp: String,
    /// SDK name and version.
    pub meta_data: HashMap<String, String>,
    /// Additional logging fields from the matched split.
    #[serde(flatten)]
    pub extra_logging: HashMap<String, String>,
}

/// Bandit evaluation event that needs to be logged to analytics storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct BanditEvent {
    pub flag_key: String,
    pub bandit_key: String,
    pub subject: String,
    pub action: String,
    pub action_probability: f64,
    /// Distance between the best and the selected action scores.
    pub optimality_gap: f64,
    pub model_version: String,
    pub timestamp: String,
    pub subject_numeric_attributes: HashMap<String, f64>,
    pub subject_categorical_attributes: HashMap<String, String>,
    pub action_numeric_attributes: HashMap<String, f64>,
    pub action_categorical_attributes: HashMap<String, String>,
    pub meta_data: HashMap<String, String>,
}

pub(crate) fn sdk_meta_data() -> HashMap<String, String> {
    HashMap::from([
        ("sdkLanguage".to_owned(), "rust".to_owned()),
        (
            "sdkVersion".to_owned(),
            env!("CARGO_PKG_VERSION").to_owned(),
        ),
    ])
}
