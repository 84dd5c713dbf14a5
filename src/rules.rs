use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::{
    eval::EvaluationMode, ufc::Value, AttributeValue, Attributes, EvaluationError,
};

/// A set of conditions that must all hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[allow(missing_docs)]
    pub conditions: Vec<Condition>,
}

impl Rule {
    /// AND over conditions. An empty rule matches.
    pub fn eval(
        &self,
        attributes: &Attributes,
        mode: EvaluationMode,
    ) -> Result<bool, EvaluationError> {
        for condition in &self.conditions {
            if !condition.eval(attributes, mode)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Compile regex patterns of this rule's conditions ahead of evaluation.
    pub(crate) fn compile(&mut self) {
        for condition in &mut self.conditions {
            condition.compile();
        }
    }
}

/// Returns `true` if `rules` is empty or at least one of them matches `attributes`.
pub fn matches_any_rule(
    attributes: &Attributes,
    rules: &[Rule],
    mode: EvaluationMode,
) -> Result<bool, EvaluationError> {
    if rules.is_empty() {
        return Ok(true);
    }
    for rule in rules {
        if rule.eval(attributes, mode)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// `Condition` is a check that given user `attribute` matches the condition `value` under the given
/// `operator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Condition {
    pub operator: ConditionOperator,
    pub attribute: String,
    pub value: ConditionValue,
    /// Regex of a `MATCHES`/`NOT_MATCHES` condition, compiled when the configuration snapshot is
    /// built.
    #[serde(skip)]
    pub(crate) compiled: CompiledPattern,
}

/// Compiled form of a condition's regex (or the compilation error).
///
/// It is derived from [`Condition::value`], so it never makes two conditions unequal.
#[derive(Debug, Clone, Default)]
pub(crate) struct CompiledPattern(Option<Result<Regex, EvaluationError>>);

impl PartialEq for CompiledPattern {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl CompiledPattern {
    #[cfg(test)]
    pub(crate) fn is_compiled(&self) -> bool {
        self.0.is_some()
    }
}

impl Condition {
    /// Create a condition checking `attribute` against `value` with `operator`.
    pub fn new(
        operator: ConditionOperator,
        attribute: impl Into<String>,
        value: impl Into<ConditionValue>,
    ) -> Condition {
        Condition {
            operator,
            attribute: attribute.into(),
            value: value.into(),
            compiled: CompiledPattern::default(),
        }
    }

    fn compile(&mut self) {
        if !matches!(
            self.operator,
            ConditionOperator::Matches | ConditionOperator::NotMatches
        ) {
            return;
        }
        let ConditionValue::Single(Value::String(pattern)) = &self.value else {
            return;
        };
        let compiled = compile_regex(pattern);
        if compiled.is_err() {
            log::debug!(target: "eppo", attribute:display = self.attribute; "invalid regex pattern {pattern:?}");
        }
        self.compiled = CompiledPattern(Some(compiled));
    }

    fn eval(&self, attributes: &Attributes, mode: EvaluationMode) -> Result<bool, EvaluationError> {
        match self.operator.try_eval_with(
            &self.attribute,
            attributes.get(&self.attribute),
            &self.value,
            self.compiled.0.as_ref(),
        ) {
            Ok(result) => Ok(result),
            Err(err) if mode == EvaluationMode::Strict => Err(err),
            Err(err) => {
                log::trace!(target: "eppo",
                            attribute:display = self.attribute;
                            "condition failed to evaluate, treating as no match: {err}");
                Ok(false)
            }
        }
    }
}

/// Possible condition types.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOperator {
    /// Full-string regex match. Condition value must be a regex string.
    Matches,
    /// Negation of [`ConditionOperator::Matches`]. Missing attributes fail.
    NotMatches,
    /// Greater than or equal. Numbers or semver strings.
    Gte,
    /// Greater than. Numbers or semver strings.
    Gt,
    /// Less than or equal. Numbers or semver strings.
    Lte,
    /// Less than. Numbers or semver strings.
    Lt,
    /// One of values. Condition value must be a list of strings. Match is case-sensitive.
    OneOf,
    /// Not one of values. Condition value must be a list of strings. Match is case-sensitive.
    ///
    /// Null/absent attributes fail this condition automatically.
    NotOneOf,
    /// Null check. Condition value `true` checks for null, `false` for not null.
    IsNull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum ConditionValue {
    // Must come first: `Value` would happily swallow a list.
    Multiple(Vec<String>),
    Single(Value),
}

impl<T: Into<Value>> From<T> for ConditionValue {
    fn from(value: T) -> Self {
        Self::Single(value.into())
    }
}

impl From<Vec<String>> for ConditionValue {
    fn from(value: Vec<String>) -> Self {
        Self::Multiple(value)
    }
}

impl From<Vec<&str>> for ConditionValue {
    fn from(value: Vec<&str>) -> Self {
        Self::Multiple(value.into_iter().map(str::to_owned).collect())
    }
}

/// Compile `pattern` for a full-string match.
fn compile_regex(pattern: &str) -> Result<Regex, EvaluationError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|_| EvaluationError::InvalidRegex {
        pattern: pattern.to_owned(),
    })
}

impl ConditionOperator {
    #[cfg(test)]
    fn try_eval(
        &self,
        attribute_name: &str,
        attribute: Option<&AttributeValue>,
        condition_value: &ConditionValue,
    ) -> Result<bool, EvaluationError> {
        self.try_eval_with(attribute_name, attribute, condition_value, None)
    }

    /// Applying `Operator` to the values. Returns `Ok(false)` on a plain mismatch or a
    /// misconfigured operand, and `Err` when the attribute cannot be compared the way the operator
    /// requires. Regex operators use `compiled` when present and compile the pattern otherwise.
    fn try_eval_with(
        &self,
        attribute_name: &str,
        attribute: Option<&AttributeValue>,
        condition_value: &ConditionValue,
        compiled: Option<&Result<Regex, EvaluationError>>,
    ) -> Result<bool, EvaluationError> {
        match self {
            Self::Matches | Self::NotMatches => {
                let Some(s) = attribute.and_then(AttributeValue::to_membership_string) else {
                    return Ok(false);
                };
                let ConditionValue::Single(Value::String(pattern)) = condition_value else {
                    return Ok(false);
                };
                let compiled_now;
                let regex = match compiled {
                    Some(compiled) => compiled.as_ref().map_err(Clone::clone)?,
                    None => {
                        compiled_now = compile_regex(pattern)?;
                        &compiled_now
                    }
                };
                let matches = regex.is_match(&s);
                Ok(matches == (*self == Self::Matches))
            }

            Self::OneOf | Self::NotOneOf => {
                let Some(s) = attribute.and_then(AttributeValue::to_membership_string) else {
                    return Ok(false);
                };
                let ConditionValue::Multiple(values) = condition_value else {
                    return Ok(false);
                };
                let is_one_of = values.iter().any(|v| v == &s);
                Ok(is_one_of == (*self == Self::OneOf))
            }

            Self::IsNull => {
                let is_null = attribute.is_none() || attribute == Some(&AttributeValue::Null);
                let ConditionValue::Single(Value::Boolean(expected_null)) = condition_value else {
                    return Ok(false);
                };
                Ok(is_null == *expected_null)
            }

            Self::Gte | Self::Gt | Self::Lte | Self::Lt => {
                let Some(attribute) = attribute.filter(|a| **a != AttributeValue::Null) else {
                    return Ok(false);
                };

                let versions = match (condition_value, attribute) {
                    (ConditionValue::Single(Value::String(c)), AttributeValue::String(a)) => {
                        Version::parse(c).ok().zip(Version::parse(a).ok())
                    }
                    _ => None,
                };
                if let Some((condition_version, attribute_version)) = versions {
                    return Ok(self.compare(&attribute_version, &condition_version));
                }

                let non_numeric = || EvaluationError::NonNumericOperand {
                    attribute: attribute_name.to_owned(),
                };
                let condition_value = match condition_value {
                    ConditionValue::Single(Value::Number(n)) => *n,
                    ConditionValue::Single(Value::String(s)) => {
                        s.trim().parse().map_err(|_| non_numeric())?
                    }
                    _ => return Err(non_numeric()),
                };
                let attribute_value = match attribute {
                    AttributeValue::Number(n) => *n,
                    AttributeValue::String(s) => s.trim().parse().map_err(|_| non_numeric())?,
                    _ => return Err(non_numeric()),
                };

                Ok(self.compare(&attribute_value, &condition_value))
            }
        }
    }

    fn compare<T: PartialOrd>(&self, attribute: &T, condition: &T) -> bool {
        match self {
            Self::Gt => attribute > condition,
            Self::Gte => attribute >= condition,
            Self::Lt => attribute < condition,
            Self::Lte => attribute <= condition,
            _ => false,
        }
    }
}
