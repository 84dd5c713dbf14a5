use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::{
    bandits::{BanditConfiguration, BanditResponse},
    ufc::{BanditVariation, UniversalFlagConfig},
};

/// Remote configuration snapshot. It's a central piece that defines evaluation behavior.
///
/// A `Configuration` is immutable once built; a newer one replaces it completely in
/// [`ConfigurationStore`](crate::ConfigurationStore).
#[derive(Debug)]
pub struct Configuration {
    /// Timestamp when configuration was fetched by the SDK.
    pub fetched_at: DateTime<Utc>,
    /// Flags configuration.
    pub flags: UniversalFlagConfig,
    /// Bandit parameters, if any bandit is referenced by the flags.
    pub bandits: Option<BanditResponse>,
    /// flag key → variation value → bandit variation.
    bandit_index: HashMap<String, HashMap<String, BanditVariation>>,
}

impl Configuration {
    /// Create a new configuration from server responses.
    pub fn from_server_response(
        mut flags: UniversalFlagConfig,
        bandits: Option<BanditResponse>,
    ) -> Configuration {
        flags.compile_rules();

        let mut bandit_index = HashMap::<String, HashMap<String, BanditVariation>>::new();
        for reference in flags.bandit_references.values() {
            for variation in &reference.flag_variations {
                bandit_index
                    .entry(variation.flag_key.clone())
                    .or_default()
                    .insert(variation.variation_value.clone(), variation.clone());
            }
        }

        Configuration {
            fetched_at: Utc::now(),
            flags,
            bandits,
            bandit_index,
        }
    }

    /// Return the bandit key controlling the given flag variation value, if any.
    pub(crate) fn get_bandit_key<'a>(&'a self, flag_key: &str, variation: &str) -> Option<&'a str> {
        self.bandit_index
            .get(flag_key)
            .and_then(|x| x.get(variation))
            .map(|variation| variation.key.as_str())
    }

    /// Return bandit configuration for the given key.
    ///
    /// Returns `None` if bandits are missing or the bandit does not exist.
    pub(crate) fn get_bandit<'a>(&'a self, bandit_key: &str) -> Option<&'a BanditConfiguration> {
        self.bandits.as_ref()?.bandits.get(bandit_key)
    }

    /// Returns `true` if every bandit referenced by `flags` is loaded here with the same model
    /// version, so the bandit parameters can be carried over without refetching.
    pub(crate) fn has_bandits_for(&self, flags: &UniversalFlagConfig) -> bool {
        flags
            .bandit_references
            .iter()
            .all(|(bandit_key, reference)| {
                self.get_bandit(bandit_key)
                    .is_some_and(|bandit| bandit.model_version == reference.model_version)
            })
    }

    /// Get a set of all available flags. Note that this may return both disabled flags and flags
    /// with bad configuration.
    pub fn flag_keys(&self) -> HashSet<String> {
        self.flags.flags.keys().cloned().collect()
    }
}
