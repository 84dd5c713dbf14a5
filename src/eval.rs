use chrono::{DateTime, Utc};

use crate::{
    events::{sdk_meta_data, AssignmentEvent},
    rules::matches_any_rule,
    sharder::{bucket_with, Md5Sharder, Sharder},
    ufc::{
        Allocation, AssignmentValue, Flag, Shard, Split, Timestamp, TryParse, UniversalFlagConfig,
        Variation, VariationType,
    },
    Attributes, Configuration, EvaluationError,
};

/// How evaluation errors are surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvaluationMode {
    /// Errors are logged and the caller-supplied default is returned. Targeting conditions that
    /// cannot be evaluated simply don't match.
    #[default]
    Graceful,
    /// Errors are returned to the caller.
    Strict,
}

/// Result of a successful flag evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Assigned value.
    pub value: AssignmentValue,
    /// Matched allocation. `None` for subject overrides.
    pub allocation_key: Option<String>,
    /// Key of the assigned variation.
    pub variation_key: String,
    /// Assignment event that needs to be logged, if the allocation asks for logging.
    pub event: Option<AssignmentEvent>,
}

impl Configuration {
    /// Evaluate `flag_key` for the given subject.
    ///
    /// Returns `Ok(None)` if the flag is disabled or no allocation matches, so that the caller
    /// falls back to its default.
    pub fn get_assignment(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
        expected_type: Option<VariationType>,
        mode: EvaluationMode,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, EvaluationError> {
        self.flags.eval_flag(
            flag_key,
            subject_key,
            subject_attributes,
            expected_type,
            &Md5Sharder,
            mode,
            now,
        )
    }
}

impl UniversalFlagConfig {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn eval_flag(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
        expected_type: Option<VariationType>,
        sharder: &impl Sharder,
        mode: EvaluationMode,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, EvaluationError> {
        let flag = match self.flags.get(flag_key) {
            Some(TryParse::Parsed(flag)) => flag,
            Some(TryParse::ParseFailed(_)) => return Err(EvaluationError::ConfigurationParseError),
            None => return Err(EvaluationError::FlagNotFound),
        };

        if let Some(ty) = expected_type {
            flag.verify_type(ty)?;
        }

        flag.eval(subject_key, subject_attributes, sharder, mode, now)
    }
}

impl Flag {
    fn verify_type(&self, ty: VariationType) -> Result<(), EvaluationError> {
        if self.variation_type == ty {
            Ok(())
        } else {
            Err(EvaluationError::TypeMismatch {
                expected: ty,
                found: self.variation_type,
            })
        }
    }

    pub(crate) fn eval(
        &self,
        subject_key: &str,
        subject_attributes: &Attributes,
        sharder: &impl Sharder,
        mode: EvaluationMode,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, EvaluationError> {
        if let Some(variation_key) = self.overrides.get(subject_key) {
            let (variation, value) = self.resolve_variation(variation_key)?;
            log::trace!(target: "eppo",
                        flag_key:display = self.key,
                        subject_key,
                        variation_key:display = variation.key;
                        "using subject override");
            return Ok(Some(Assignment {
                value,
                allocation_key: None,
                variation_key: variation.key.clone(),
                event: None,
            }));
        }

        if !self.enabled {
            return Ok(None);
        }

        // Augmenting subject_attributes with id, so that subject_key can be used in the rules.
        let augmented_subject_attributes = {
            let mut sa = subject_attributes.clone();
            sa.entry("id".into()).or_insert_with(|| subject_key.into());
            sa
        };

        let mut matched = None;
        for allocation in &self.allocations {
            if let Some(split) = allocation.get_matching_split(
                subject_key,
                &augmented_subject_attributes,
                sharder,
                self.total_shards,
                mode,
                now,
            )? {
                matched = Some((allocation, split));
                break;
            }
        }
        let Some((allocation, split)) = matched else {
            return Ok(None);
        };

        let (variation, value) = self.resolve_variation(&split.variation_key)?;

        let event = allocation.do_log.then(|| AssignmentEvent {
            feature_flag: self.key.clone(),
            allocation: allocation.key.clone(),
            experiment: format!("{}-{}", self.key, allocation.key),
            variation: variation.key.clone(),
            variation_value: variation.value.clone(),
            subject: subject_key.to_owned(),
            subject_attributes: subject_attributes.clone(),
            timestamp: now.to_rfc3339(),
            meta_data: sdk_meta_data(),
            extra_logging: split.extra_logging.clone(),
        });

        Ok(Some(Assignment {
            value,
            allocation_key: Some(allocation.key.clone()),
            variation_key: variation.key.clone(),
            event,
        }))
    }

    fn resolve_variation(
        &self,
        variation_key: &str,
    ) -> Result<(&Variation, AssignmentValue), EvaluationError> {
        let variation = self.variations.get(variation_key).ok_or_else(|| {
            log::warn!(target: "eppo",
                       flag_key:display = self.key,
                       variation_key;
                       "internal: unable to find variation");
            EvaluationError::VariationNotFound {
                variation_key: variation_key.to_owned(),
            }
        })?;

        let value = variation
            .value
            .to_assignment_value(self.variation_type)
            .ok_or_else(|| {
                log::warn!(target: "eppo",
                           flag_key:display = self.key,
                           variation_key;
                           "internal: unable to convert Value to AssignmentValue");
                EvaluationError::InvalidVariationValue {
                    variation_key: variation_key.to_owned(),
                }
            })?;

        Ok((variation, value))
    }
}

impl Allocation {
    fn get_matching_split(
        &self,
        subject_key: &str,
        augmented_subject_attributes: &Attributes,
        sharder: &impl Sharder,
        total_shards: u64,
        mode: EvaluationMode,
        now: Timestamp,
    ) -> Result<Option<&Split>, EvaluationError> {
        if !self.is_allowed_by_time(now)
            || !matches_any_rule(augmented_subject_attributes, &self.rules, mode)?
        {
            return Ok(None);
        }

        Ok(self
            .splits
            .iter()
            .find(|split| split.matches(subject_key, sharder, total_shards)))
    }

    fn is_allowed_by_time(&self, now: Timestamp) -> bool {
        let forbidden = matches!(self.start_at, Some(t) if now < t)
            || matches!(self.end_at, Some(t) if now > t);
        !forbidden
    }
}

impl Split {
    /// Return `true` if `subject_key` matches the given split under the provided `sharder`.
    ///
    /// To match a split, subject must match all underlying shards.
    fn matches(&self, subject_key: &str, sharder: &impl Sharder, total_shards: u64) -> bool {
        self.shards
            .iter()
            .all(|shard| shard.matches(subject_key, sharder, total_shards))
    }
}

impl Shard {
    /// Return `true` if `subject_key` falls into any of the shard ranges.
    fn matches(&self, subject_key: &str, sharder: &impl Sharder, total_shards: u64) -> bool {
        let h = bucket_with(sharder, &self.salt, subject_key, total_shards);
        self.ranges.iter().any(|range| range.contains(h))
    }
}
