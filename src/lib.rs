//! Offline evaluation engine for Eppo feature flags and contextual bandits.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that evaluates feature flag values for `subjects`, where
//! each subject has a unique key and key-value attributes associated with it. Feature flag
//! evaluation results in an [`AssignmentValue`] being returned, representing a specific feature
//! flag value assigned to the subject.
//!
//! Flags that are connected to a bandit can additionally pick an action for the subject out of a
//! set of candidate actions with [`Client::get_bandit_action`].
//!
//! Configuration is either fetched in the background by a [`PollerThread`] or supplied directly
//! through a [`ConfigurationStore`]. Evaluation itself never touches the network.
//!
//! An [`AssignmentLogger`] (and [`BanditLogger`]) should be provided to save events to your
//! storage, facilitating tracking of which user received which feature flag values. Repeated
//! identical events are suppressed by a [`DedupCache`].
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Problems local to a single flag are reported as
//! [`EvaluationError`].
//!
//! By default ([`EvaluationMode::Graceful`]) evaluation errors are logged and the caller's default
//! value is returned, as feature flag evaluation should not be critical enough to cause system
//! crashes. [`EvaluationMode::Strict`] surfaces them instead, which is valuable for debugging.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages under
//! the `eppo` target. Consider integrating a `log`-compatible logger implementation for better
//! visibility into SDK operations.
//!
//! # Examples
//!
//! ```
//! # use eppo_evaluator::{AssignmentValue, Attributes, ClientConfig};
//! let client = ClientConfig::from_api_key("api-key").to_client();
//! // No configuration has been loaded yet, so the default is returned.
//! let value = client
//!     .get_variation("a-flag", "subject-1", &Attributes::new(), AssignmentValue::Boolean(false))
//!     .unwrap();
//! assert_eq!(value, AssignmentValue::Boolean(false));
//! ```

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod assignment_logger;
mod attributes;
pub mod bandits;
mod client;
mod config;
mod configuration;
mod configuration_fetcher;
mod configuration_store;
mod dedup_cache;
mod error;
mod eval;
mod events;
mod obfuscation;
mod poller_thread;
pub mod rules;
mod sharder;
pub mod ufc;

pub use assignment_logger::{AssignmentLogger, BanditLogger};
pub use attributes::{AttributeValue, Attributes, ContextAttributes};
pub use bandits::BanditResult;
pub use client::Client;
pub use config::ClientConfig;
pub use configuration::Configuration;
pub use configuration_fetcher::{
    ConfigurationFetcher, ConfigurationFetcherConfig, ConfigurationSource,
};
pub use configuration_store::ConfigurationStore;
pub use dedup_cache::{
    DedupCache, ExpiringDedupCache, Fingerprint, LruDedupCache, PassThroughCache,
};
pub use error::{Error, EvaluationError, Result};
pub use eval::{Assignment, EvaluationMode};
pub use events::{AssignmentEvent, BanditEvent};
pub use poller_thread::{PollerThread, PollerThreadConfig};
pub use rules::matches_any_rule;
pub use sharder::{bucket, Md5Sharder, Sharder};
pub use ufc::{AssignmentValue, VariationType};
