use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Key-value attributes of a subject.
///
/// ```
/// # use eppo_evaluator::{Attributes, AttributeValue};
/// let attributes = [
///     ("age".to_owned(), 30.0.into()),
///     ("is_premium_member".to_owned(), true.into()),
///     ("username".to_owned(), "john_doe".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Value of a single subject attribute.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A null value or absence of value.
    Null,
}

impl AttributeValue {
    /// Returns the string if this is a string attribute.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Stringified value used for set membership checks. `None` for nulls.
    pub(crate) fn to_membership_string(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Number(n) => Some(n.to_string()),
            AttributeValue::Boolean(b) => Some(b.to_string()),
            AttributeValue::Null => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// Subject or action attributes split by their semantics, as bandit models expect them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextAttributes {
    /// Numeric attributes are quantitative and define a scale.
    #[serde(default, alias = "numericAttributes")]
    pub numeric: HashMap<String, f64>,
    /// Categorical attributes have a finite set of values that are not directly comparable.
    #[serde(default, alias = "categoricalAttributes")]
    pub categorical: HashMap<String, String>,
}

impl From<Attributes> for ContextAttributes {
    fn from(value: Attributes) -> Self {
        ContextAttributes::from_iter(value)
    }
}

impl FromIterator<(String, AttributeValue)> for ContextAttributes {
    fn from_iter<T: IntoIterator<Item = (String, AttributeValue)>>(iter: T) -> Self {
        iter.into_iter()
            .fold(ContextAttributes::default(), |mut acc, (key, value)| {
                match value {
                    AttributeValue::String(value) => {
                        acc.categorical.insert(key, value);
                    }
                    AttributeValue::Number(value) => {
                        acc.numeric.insert(key, value);
                    }
                    AttributeValue::Boolean(value) => {
                        // Booleans behave as categories so that flag evaluation inside a bandit
                        // sees the same strings as a plain assignment would.
                        acc.categorical.insert(key, value.to_string());
                    }
                    AttributeValue::Null => {
                        // Nulls are missing values.
                    }
                }
                acc
            })
    }
}

impl ContextAttributes {
    /// Convert contextual attributes to generic `Attributes` for targeting rules.
    pub fn to_generic_attributes(&self) -> Attributes {
        let mut result = HashMap::with_capacity(self.numeric.len() + self.categorical.len());
        for (key, value) in &self.numeric {
            result.insert(key.clone(), AttributeValue::Number(*value));
        }
        for (key, value) in &self.categorical {
            result.insert(key.clone(), AttributeValue::String(value.clone()));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_generic_attributes_by_kind() {
        let attributes: Attributes = [
            ("age".to_owned(), 30.0.into()),
            ("premium".to_owned(), true.into()),
            ("country".to_owned(), "FR".into()),
            ("nothing".to_owned(), AttributeValue::Null),
        ]
        .into_iter()
        .collect();

        let context = ContextAttributes::from(attributes);

        assert_eq!(context.numeric, HashMap::from([("age".to_owned(), 30.0)]));
        assert_eq!(
            context.categorical,
            HashMap::from([
                ("premium".to_owned(), "true".to_owned()),
                ("country".to_owned(), "FR".to_owned()),
            ])
        );
    }

    #[test]
    fn membership_string_uses_shortest_number_form() {
        assert_eq!(
            AttributeValue::Number(42.0).to_membership_string().as_deref(),
            Some("42")
        );
        assert_eq!(
            AttributeValue::Number(1.5).to_membership_string().as_deref(),
            Some("1.5")
        );
        assert_eq!(AttributeValue::Null.to_membership_string(), None);
    }
}
