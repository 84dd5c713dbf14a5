//! Decoding of configuration served in [`ConfigurationFormat::Client`] format, where every string
//! field is base64-encoded.
use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::{
    rules::{Condition, ConditionOperator, ConditionValue, Rule},
    ufc::{
        Allocation, BanditReference, BanditVariation, ConfigurationFormat, Flag, Shard, Split,
        TryParse, UniversalFlagConfig, Value, Variation, VariationType,
    },
};

impl UniversalFlagConfig {
    /// Decode all obfuscated fields, turning the configuration into
    /// [`ConfigurationFormat::Server`] format.
    ///
    /// A flag that fails to decode is kept as [`TryParse::ParseFailed`] so that the rest of the
    /// configuration can still be served. Bandit references that fail to decode are dropped.
    pub(crate) fn deobfuscate(self) -> UniversalFlagConfig {
        let flags = self
            .flags
            .into_iter()
            .filter_map(|(key, flag)| {
                let Some(key) = decode(&key) else {
                    log::warn!(target: "eppo", "failed to decode obfuscated flag key, skipping flag");
                    return None;
                };
                let flag = match flag {
                    TryParse::Parsed(flag) => match flag.clone().deobfuscate() {
                        Some(decoded) => TryParse::Parsed(decoded),
                        None => {
                            log::warn!(target: "eppo", flag_key:display = key; "failed to decode obfuscated flag");
                            TryParse::ParseFailed(
                                serde_json::to_value(&flag).unwrap_or(serde_json::Value::Null),
                            )
                        }
                    },
                    failed @ TryParse::ParseFailed(_) => failed,
                };
                Some((key, flag))
            })
            .collect();

        let bandit_references = self
            .bandit_references
            .into_iter()
            .filter_map(|(key, reference)| {
                let decoded = decode(&key).zip(reference.deobfuscate());
                if decoded.is_none() {
                    log::warn!(target: "eppo", "failed to decode obfuscated bandit reference, skipping");
                }
                decoded
            })
            .collect();

        UniversalFlagConfig {
            created_at: self.created_at,
            format: ConfigurationFormat::Server,
            environment: self.environment,
            flags,
            bandit_references,
        }
    }
}

fn decode(value: &str) -> Option<String> {
    let bytes = STANDARD.decode(value).ok()?;
    String::from_utf8(bytes).ok()
}

fn decode_map(map: HashMap<String, String>) -> Option<HashMap<String, String>> {
    map.into_iter()
        .map(|(key, value)| Some((decode(&key)?, decode(&value)?)))
        .collect()
}

fn decode_list(list: Vec<String>) -> Option<Vec<String>> {
    list.iter().map(|item| decode(item)).collect()
}

impl Flag {
    fn deobfuscate(self) -> Option<Flag> {
        let variation_type = self.variation_type;
        Some(Flag {
            key: decode(&self.key)?,
            enabled: self.enabled,
            variation_type,
            variations: self
                .variations
                .into_iter()
                .map(|(key, variation)| {
                    Some((decode(&key)?, variation.deobfuscate(variation_type)?))
                })
                .collect::<Option<_>>()?,
            allocations: self
                .allocations
                .into_iter()
                .map(Allocation::deobfuscate)
                .collect::<Option<_>>()?,
            total_shards: self.total_shards,
            overrides: decode_map(self.overrides)?,
        })
    }
}

impl Variation {
    fn deobfuscate(self, variation_type: VariationType) -> Option<Variation> {
        Some(Variation {
            key: decode(&self.key)?,
            value: self.value.deobfuscate_as(variation_type)?,
        })
    }
}

impl Value {
    fn deobfuscate(self) -> Option<Value> {
        Some(match self {
            Value::String(s) => Value::String(decode(&s)?),
            Value::StringList(items) => Value::StringList(decode_list(items)?),
            other => other,
        })
    }

    /// Decode a variation value. Boolean and numeric values arrive as base64 strings too, so
    /// they are parsed back according to the flag type.
    fn deobfuscate_as(self, variation_type: VariationType) -> Option<Value> {
        Some(match (variation_type, self.deobfuscate()?) {
            (VariationType::Boolean, Value::String(s)) => Value::Boolean(s.trim().parse().ok()?),
            (VariationType::Integer | VariationType::Numeric, Value::String(s)) => {
                Value::Number(s.trim().parse().ok()?)
            }
            (_, value) => value,
        })
    }
}

impl Allocation {
    fn deobfuscate(self) -> Option<Allocation> {
        Some(Allocation {
            key: decode(&self.key)?,
            rules: self
                .rules
                .into_iter()
                .map(Rule::deobfuscate)
                .collect::<Option<_>>()?,
            start_at: self.start_at,
            end_at: self.end_at,
            splits: self
                .splits
                .into_iter()
                .map(Split::deobfuscate)
                .collect::<Option<_>>()?,
            do_log: self.do_log,
        })
    }
}

impl Rule {
    fn deobfuscate(self) -> Option<Rule> {
        Some(Rule {
            conditions: self
                .conditions
                .into_iter()
                .map(Condition::deobfuscate)
                .collect::<Option<_>>()?,
        })
    }
}

impl Condition {
    fn deobfuscate(self) -> Option<Condition> {
        Some(Condition::new(
            self.operator,
            decode(&self.attribute)?,
            match (self.operator, self.value) {
                (_, ConditionValue::Multiple(items)) => {
                    ConditionValue::Multiple(decode_list(items)?)
                }
                (operator, ConditionValue::Single(value)) => {
                    match (operator, value.deobfuscate()?) {
                        (ConditionOperator::IsNull, Value::String(s)) => {
                            ConditionValue::Single(Value::Boolean(s.trim().parse().ok()?))
                        }
                        (_, value) => ConditionValue::Single(value),
                    }
                }
            },
        ))
    }
}

impl Split {
    fn deobfuscate(self) -> Option<Split> {
        Some(Split {
            shards: self
                .shards
                .into_iter()
                .map(Shard::deobfuscate)
                .collect::<Option<_>>()?,
            variation_key: decode(&self.variation_key)?,
            extra_logging: decode_map(self.extra_logging)?,
        })
    }
}

impl Shard {
    fn deobfuscate(self) -> Option<Shard> {
        Some(Shard {
            salt: decode(&self.salt)?,
            ranges: self.ranges,
        })
    }
}

impl BanditReference {
    fn deobfuscate(self) -> Option<BanditReference> {
        Some(BanditReference {
            model_version: decode(&self.model_version)?,
            flag_variations: self
                .flag_variations
                .into_iter()
                .map(BanditVariation::deobfuscate)
                .collect::<Option<_>>()?,
        })
    }
}

impl BanditVariation {
    fn deobfuscate(self) -> Option<BanditVariation> {
        Some(BanditVariation {
            key: decode(&self.key)?,
            flag_key: decode(&self.flag_key)?,
            allocation_key: decode(&self.allocation_key)?,
            variation_key: decode(&self.variation_key)?,
            variation_value: decode(&self.variation_value)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD, Engine};

    use crate::{
        rules::ConditionValue,
        ufc::{ConfigurationFormat, TryParse, UniversalFlagConfig, Value},
    };

    fn b64(s: &str) -> String {
        STANDARD.encode(s)
    }

    fn obfuscated_config() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "format": "CLIENT",
            "flags": {
                b64("color"): {
                    "key": b64("color"),
                    "enabled": true,
                    "variationType": "STRING",
                    "totalShards": 10000,
                    "variations": {
                        b64("red"): {"key": b64("red"), "value": b64("#ff0000")},
                        b64("blue"): {"key": b64("blue"), "value": b64("#0000ff")}
                    },
                    "overrides": {b64("alice"): b64("blue")},
                    "allocations": [{
                        "key": b64("targeted"),
                        "rules": [{"conditions": [
                            {"attribute": b64("country"), "operator": "ONE_OF", "value": [b64("US"), b64("CA")]},
                            {"attribute": b64("age"), "operator": "GTE", "value": 18.0}
                        ]}],
                        "splits": [{
                            "variationKey": b64("red"),
                            "extraLogging": {b64("holdout"): b64("none")},
                            "shards": [{"salt": b64("color-salt"), "ranges": [{"start": 0, "end": 10000}]}]
                        }],
                        "doLog": true
                    }]
                },
                b64("broken"): {
                    "key": "%%% not base64 %%%",
                    "enabled": true,
                    "variationType": "BOOLEAN",
                    "variations": {},
                    "allocations": []
                }
            },
            "banditReferences": {
                b64("banner_bandit"): {
                    "modelVersion": b64("v7"),
                    "flagVariations": [{
                        "key": b64("banner_bandit"),
                        "flagKey": b64("color"),
                        "allocationKey": b64("targeted"),
                        "variationKey": b64("red"),
                        "variationValue": b64("#ff0000")
                    }]
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn decodes_client_format() {
        let ufc = UniversalFlagConfig::from_json(&obfuscated_config()).unwrap();
        assert_eq!(ufc.format, ConfigurationFormat::Server);

        let Some(TryParse::Parsed(flag)) = ufc.flags.get("color") else {
            panic!("color flag should be decoded");
        };
        assert_eq!(flag.key, "color");
        assert_eq!(flag.variations["red"].key, "red");
        assert_eq!(flag.variations["red"].value, Value::from("#ff0000"));
        assert_eq!(flag.overrides["alice"], "blue");

        let allocation = &flag.allocations[0];
        assert_eq!(allocation.key, "targeted");
        let conditions = &allocation.rules[0].conditions;
        assert_eq!(conditions[0].attribute, "country");
        assert_eq!(conditions[0].value, ConditionValue::from(vec!["US", "CA"]));
        assert_eq!(conditions[1].attribute, "age");
        assert_eq!(conditions[1].value, ConditionValue::from(18.0));

        let split = &allocation.splits[0];
        assert_eq!(split.variation_key, "red");
        assert_eq!(split.extra_logging["holdout"], "none");
        assert_eq!(split.shards[0].salt, "color-salt");

        let reference = &ufc.bandit_references["banner_bandit"];
        assert_eq!(reference.model_version, "v7");
        assert_eq!(reference.flag_variations[0].flag_key, "color");
        assert_eq!(reference.flag_variations[0].variation_value, "#ff0000");
    }

    #[test]
    fn undecodable_flag_fails_alone() {
        let ufc = UniversalFlagConfig::from_json(&obfuscated_config()).unwrap();
        assert!(matches!(
            ufc.flags.get("broken"),
            Some(TryParse::ParseFailed(_))
        ));
        assert!(matches!(ufc.flags.get("color"), Some(TryParse::Parsed(_))));
    }

    #[test]
    fn decodes_typed_values_by_variation_type() {
        let variation = |key: &str, value: serde_json::Value| {
            (b64(key), serde_json::json!({"key": b64(key), "value": value}))
        };
        let flag = |key: &str, variation_type: &str, variations: Vec<(String, serde_json::Value)>| {
            serde_json::json!({
                "key": b64(key),
                "enabled": true,
                "variationType": variation_type,
                "variations": variations.into_iter().collect::<serde_json::Map<_, _>>(),
                "allocations": [{
                    "key": b64("everyone"),
                    "rules": [{"conditions": [
                        {"attribute": b64("email"), "operator": "IS_NULL", "value": b64("false")},
                        {"attribute": b64("age"), "operator": "GTE", "value": b64("18")}
                    ]}],
                    "splits": [{"variationKey": b64("on"), "shards": []}]
                }]
            })
        };
        let json = serde_json::to_vec(&serde_json::json!({
            "format": "CLIENT",
            "flags": {
                b64("bool"): flag("bool", "BOOLEAN", vec![
                    variation("on", b64("true").into()),
                    variation("off", b64("false").into()),
                ]),
                b64("int"): flag("int", "INTEGER", vec![variation("on", b64("42").into())]),
                b64("num"): flag("num", "NUMERIC", vec![variation("on", b64("2.75").into())]),
                b64("json"): flag("json", "JSON", vec![variation("on", b64(r#"{"a":1}"#).into())]),
                b64("plain"): flag("plain", "NUMERIC", vec![variation("on", 7.5.into())]),
                b64("garbled"): flag("garbled", "INTEGER", vec![variation("on", b64("many").into())])
            }
        }))
        .unwrap();

        let ufc = UniversalFlagConfig::from_json(&json).unwrap();
        let value = |flag_key: &str, variation_key: &str| match ufc.flags.get(flag_key) {
            Some(TryParse::Parsed(flag)) => flag.variations[variation_key].value.clone(),
            other => panic!("{flag_key} should be decoded, got {other:?}"),
        };

        assert_eq!(value("bool", "on"), Value::Boolean(true));
        assert_eq!(value("bool", "off"), Value::Boolean(false));
        assert_eq!(value("int", "on"), Value::Number(42.0));
        assert_eq!(value("num", "on"), Value::Number(2.75));
        assert_eq!(value("json", "on"), Value::String(r#"{"a":1}"#.to_owned()));
        assert_eq!(value("plain", "on"), Value::Number(7.5));
        assert!(matches!(
            ufc.flags.get("garbled"),
            Some(TryParse::ParseFailed(_))
        ));

        let Some(TryParse::Parsed(flag)) = ufc.flags.get("int") else {
            panic!("int flag should be decoded");
        };
        let conditions = &flag.allocations[0].rules[0].conditions;
        assert_eq!(conditions[0].value, ConditionValue::from(false));
        assert_eq!(conditions[1].value, ConditionValue::from("18"));
    }

    #[test]
    fn server_format_is_left_untouched() {
        let ufc = UniversalFlagConfig::from_json(
            br#"{"format": "SERVER", "flags": {"Y29sb3I=": {"key": "Y29sb3I=", "enabled": false, "variationType": "STRING", "variations": {}, "allocations": []}}}"#,
        )
        .unwrap();
        assert!(ufc.flags.contains_key("Y29sb3I="));
    }
}
