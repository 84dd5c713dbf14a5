//! Universal Flag Configuration: the wire model of the flag configuration endpoint.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{rules::Rule, Result};

/// Instant used for allocation activation windows.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Universal Flag Configuration. This is the response format of the flag configuration endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UniversalFlagConfig {
    /// When configuration was last updated.
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    /// Whether string fields are sent in plain text or base64-encoded.
    #[serde(default)]
    pub format: ConfigurationFormat,
    /// Environment this configuration belongs to.
    #[serde(default)]
    pub environment: Option<Environment>,
    /// Flags configuration.
    ///
    /// Value is wrapped in `TryParse` so that if we fail to parse one flag (e.g., new server
    /// format), we can still serve other flags.
    pub flags: HashMap<String, TryParse<Flag>>,
    /// Connects string flag variations to bandits. Bandit parameters are served separately.
    #[serde(default)]
    pub bandit_references: HashMap<String, BanditReference>,
}

impl UniversalFlagConfig {
    /// Decode configuration from the raw response body, de-obfuscating it if necessary.
    pub fn from_json(json: &[u8]) -> Result<UniversalFlagConfig> {
        let config: UniversalFlagConfig = serde_json::from_slice(json).map_err(|err| {
            log::warn!(target: "eppo", "failed to parse flag configuration: {err}");
            err
        })?;

        Ok(match config.format {
            ConfigurationFormat::Server => config,
            ConfigurationFormat::Client => config.deobfuscate(),
        })
    }

    /// Prepare targeting rules of every decoded flag for evaluation.
    pub(crate) fn compile_rules(&mut self) {
        for flag in self.flags.values_mut() {
            if let TryParse::Parsed(flag) = flag {
                flag.allocations
                    .iter_mut()
                    .flat_map(|allocation| allocation.rules.iter_mut())
                    .for_each(Rule::compile);
            }
        }
    }
}

/// Encoding of string fields in [`UniversalFlagConfig`].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigurationFormat {
    /// Plain text.
    #[default]
    Server,
    /// Obfuscated: every string field is base64-encoded.
    Client,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Environment {
    pub name: String,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Flag {
    pub key: String,
    pub enabled: bool,
    pub variation_type: VariationType,
    pub variations: HashMap<String, Variation>,
    pub allocations: Vec<Allocation>,
    /// Size of the bucketing space. Never zero.
    #[serde(
        default = "default_total_shards",
        deserialize_with = "deserialize_total_shards"
    )]
    pub total_shards: u64,
    /// Forced variation keys by subject key. Checked before anything else.
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

fn default_total_shards() -> u64 {
    10_000
}

fn deserialize_total_shards<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match u64::deserialize(deserializer)? {
        0 => Err(serde::de::Error::invalid_value(
            serde::de::Unexpected::Unsigned(0),
            &"a positive number of shards",
        )),
        total_shards => Ok(total_shards),
    }
}

/// Type of the variation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum VariationType {
    String,
    Integer,
    Numeric,
    Boolean,
    Json,
}

/// Untyped variation value as found on the wire.
///
/// Unlike [`AssignmentValue`], `Value` is untagged, so we don't know the exact type until we
/// combine it with [`VariationType`] from the flag level.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(untagged)]
pub enum Value {
    /// Boolean maps to [`AssignmentValue::Boolean`].
    Boolean(bool),
    /// Number maps to either [`AssignmentValue::Integer`] or [`AssignmentValue::Numeric`].
    Number(f64),
    /// String maps to either [`AssignmentValue::String`] or [`AssignmentValue::Json`].
    String(String),
    /// Only valid for JSON flags.
    StringList(Vec<String>),
    /// Inline JSON. Only valid for JSON flags.
    Json(serde_json::Value),
}

impl Value {
    /// Try to convert `Value` to [`AssignmentValue`] under the given [`VariationType`].
    pub(crate) fn to_assignment_value(&self, ty: VariationType) -> Option<AssignmentValue> {
        Some(match ty {
            VariationType::String => AssignmentValue::String(self.as_string()?.to_owned()),
            VariationType::Integer => AssignmentValue::Integer(self.as_integer()?),
            VariationType::Numeric => AssignmentValue::Numeric(self.as_number()?),
            VariationType::Boolean => AssignmentValue::Boolean(self.as_boolean()?),
            VariationType::Json => AssignmentValue::Json(self.to_json()?),
        })
    }

    /// The string this value is matched by in bandit references.
    pub(crate) fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    fn as_integer(&self) -> Option<i64> {
        let f = self.as_number()?;
        let i = f as i64;
        if i as f64 == f {
            Some(i)
        } else {
            None
        }
    }

    fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Self::String(s) => serde_json::from_str(s).ok(),
            Self::StringList(items) => Some(items.clone().into()),
            Self::Json(value) => Some(value.clone()),
            Self::Boolean(_) | Self::Number(_) => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Variation {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Allocation {
    pub key: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub start_at: Option<Timestamp>,
    #[serde(default)]
    pub end_at: Option<Timestamp>,
    pub splits: Vec<Split>,
    #[serde(default = "default_do_log")]
    pub do_log: bool,
}

fn default_do_log() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Split {
    pub shards: Vec<Shard>,
    pub variation_key: String,
    #[serde(default)]
    pub extra_logging: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Shard {
    pub salt: String,
    pub ranges: Vec<ShardRange>,
}

/// Half-open range of shards: `start` is included, `end` is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct ShardRange {
    pub start: u64,
    pub end: u64,
}

impl ShardRange {
    /// Returns `true` if `v` falls inside the range.
    pub fn contains(&self, v: u64) -> bool {
        self.start <= v && v < self.end
    }
}

/// Bandit reference: which flag variations are controlled by a bandit, and which model version
/// the flag configuration was published against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct BanditReference {
    pub model_version: String,
    #[serde(default)]
    pub flag_variations: Vec<BanditVariation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct BanditVariation {
    /// Bandit key.
    pub key: String,
    pub flag_key: String,
    pub allocation_key: String,
    pub variation_key: String,
    pub variation_value: String,
}

/// Typed assignment value returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[allow(missing_docs)]
pub enum AssignmentValue {
    String(String),
    Integer(i64),
    Numeric(f64),
    Boolean(bool),
    Json(serde_json::Value),
}

#[allow(missing_docs)]
impl AssignmentValue {
    pub fn is_string(&self) -> bool {
        self.as_str().is_some()
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AssignmentValue::String(s) => Some(s),
            _ => None,
        }
    }
    pub fn to_string(self) -> Option<String> {
        match self {
            AssignmentValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        self.as_integer().is_some()
    }
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            AssignmentValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.as_numeric().is_some()
    }
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            Self::Numeric(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_boolean(&self) -> bool {
        self.as_boolean().is_some()
    }
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            AssignmentValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_json(&self) -> bool {
        self.as_json().is_some()
    }
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }
    pub fn to_json(self) -> Option<serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    /// The variation type this value belongs to.
    pub fn variation_type(&self) -> VariationType {
        match self {
            AssignmentValue::String(_) => VariationType::String,
            AssignmentValue::Integer(_) => VariationType::Integer,
            AssignmentValue::Numeric(_) => VariationType::Numeric,
            AssignmentValue::Boolean(_) => VariationType::Boolean,
            AssignmentValue::Json(_) => VariationType::Json,
        }
    }
}
