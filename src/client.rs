use std::{collections::HashMap, sync::Arc};

use chrono::Utc;

#[cfg(doc)]
use crate::EvaluationError;
use crate::{
    configuration_fetcher::{ConfigurationFetcher, ConfigurationFetcherConfig},
    eval::Assignment,
    ufc::VariationType,
    AssignmentEvent, AssignmentValue, Attributes, BanditEvent, BanditResult, ClientConfig,
    ConfigurationStore, ContextAttributes, Error, EvaluationMode, Fingerprint, PollerThread,
    Result,
};

/// A client evaluating feature flags and bandits against the latest fetched configuration.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// # Poller Thread
///
/// Before calling `Client::get_assignment()`, you should start the poller thread by calling
/// [`Client::start_poller_thread()`], ensuring that the configuration is fetched. It's also
/// recommended to call [`PollerThread::wait_for_configuration`] before calling `get_assignment()`.
///
/// # Errors
///
/// In [`EvaluationMode::Graceful`] (the default), evaluation errors and missing configuration are
/// logged and the caller default is returned. In [`EvaluationMode::Strict`], they are returned as
/// [`Error`].
///
/// # Examples
/// ```no_run
/// # use eppo_evaluator::{Client, ClientConfig};
/// let mut client = Client::new(ClientConfig::from_api_key("api-key"));
/// client.start_poller_thread();
/// ```
pub struct Client<'a> {
    configuration_store: Arc<ConfigurationStore>,
    config: ClientConfig<'a>,
}

impl<'a> Client<'a> {
    /// Create a new `Client` using the specified configuration.
    ///
    /// ```
    /// # use eppo_evaluator::{ClientConfig, Client};
    /// let client = Client::new(ClientConfig::from_api_key("api-key"));
    /// ```
    pub fn new(config: ClientConfig<'a>) -> Self {
        Client::new_with_configuration_store(config, Arc::new(ConfigurationStore::new()))
    }

    /// Create a new `Client` reading configuration from an existing store. Useful to share one
    /// store between clients, or to feed configuration without a poller thread.
    pub fn new_with_configuration_store(
        config: ClientConfig<'a>,
        configuration_store: Arc<ConfigurationStore>,
    ) -> Self {
        Client {
            configuration_store,
            config,
        }
    }

    /// Get the assignment for a given feature flag and subject, or `default` if the subject is not
    /// eligible for any allocation.
    ///
    /// The flag must have the same variation type as `default`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use eppo_evaluator::AssignmentValue;
    /// # fn test(client: &eppo_evaluator::Client) {
    /// let variation = client
    ///     .get_variation(
    ///         "a-string-flag",
    ///         "user-id",
    ///         &[("country".to_owned(), "FR".into())].into_iter().collect(),
    ///         AssignmentValue::String("control".to_owned()),
    ///     )
    ///     .unwrap_or(AssignmentValue::String("control".to_owned()));
    /// # }
    /// ```
    pub fn get_variation(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
        default: AssignmentValue,
    ) -> Result<AssignmentValue> {
        let expected_type = default.variation_type();
        Ok(self
            .get_assignment_inner(
                flag_key,
                subject_key,
                subject_attributes,
                Some(expected_type),
                Some,
            )?
            .unwrap_or(default))
    }

    /// Get the assignment value for a given feature flag and subject.
    ///
    /// If the subject is not eligible for any allocation, returns `Ok(None)`.
    ///
    /// If the configuration has not been fetched yet, returns `Ok(None)` (or
    /// [`Error::ConfigurationUnavailable`] in strict mode). You should call
    /// [`Client::start_poller_thread`] before any call to `get_assignment()`.
    ///
    /// # Typed versions
    ///
    /// There are typed versions of this function:
    /// - [`Client::get_string_assignment()`]
    /// - [`Client::get_integer_assignment()`]
    /// - [`Client::get_numeric_assignment()`]
    /// - [`Client::get_boolean_assignment()`]
    /// - [`Client::get_json_assignment()`]
    ///
    /// It is recommended to use typed versions of this function as they provide additional type
    /// safety. They can catch type errors even _before_ evaluating the assignment, which helps to
    /// detect errors if subject is not eligible for the flag allocation.
    ///
    /// # Errors
    ///
    /// Only in strict mode:
    /// - [`EvaluationError::FlagNotFound`] if the requested flag configuration was not found.
    /// - [`EvaluationError::ConfigurationParseError`] if the flag configuration received from the
    ///   server is invalid.
    /// - Other [`EvaluationError`]s if targeting rules cannot be evaluated.
    ///
    /// # Examples
    ///
    /// ```
    /// # fn test(client: &eppo_evaluator::Client) {
    /// let assignment = client
    ///     .get_assignment(
    ///         "a-boolean-flag",
    ///         "user-id",
    ///         &[("age".to_owned(), 42.0.into())]
    ///             .into_iter()
    ///             .collect(),
    ///     )
    ///     .unwrap_or_default()
    ///     .and_then(|x| x.as_boolean())
    ///     // default assignment
    ///     .unwrap_or(false);
    /// # }
    /// ```
    pub fn get_assignment(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
    ) -> Result<Option<AssignmentValue>> {
        self.get_assignment_inner(flag_key, subject_key, subject_attributes, None, Some)
    }

    /// Retrieves the assignment value for a given feature flag and subject as a string.
    ///
    /// Returns [`EvaluationError::TypeMismatch`] in strict mode if the flag is not a string flag.
    ///
    /// # Examples
    ///
    /// ```
    /// # fn test(client: &eppo_evaluator::Client) {
    /// let assignment = client
    ///     .get_string_assignment("a-string-flag", "user-id", &[
    ///         ("language".into(), "en".into())
    ///     ].into_iter().collect())
    ///     .unwrap_or_default()
    ///     .unwrap_or("default_value".to_owned());
    /// # }
    /// ```
    pub fn get_string_assignment(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
    ) -> Result<Option<String>> {
        self.get_assignment_inner(
            flag_key,
            subject_key,
            subject_attributes,
            Some(VariationType::String),
            AssignmentValue::to_string,
        )
    }

    /// Retrieves the assignment value for a given feature flag and subject as an integer value.
    ///
    /// ```
    /// # fn test(client: &eppo_evaluator::Client) {
    /// let assignment = client
    ///     .get_integer_assignment("an-int-flag", "user-id", &[
    ///         ("age".to_owned(), 42.0.into())
    ///     ].into_iter().collect())
    ///     .unwrap_or_default()
    ///     .unwrap_or(0);
    /// # }
    /// ```
    pub fn get_integer_assignment(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
    ) -> Result<Option<i64>> {
        self.get_assignment_inner(
            flag_key,
            subject_key,
            subject_attributes,
            Some(VariationType::Integer),
            |x| x.as_integer(),
        )
    }

    /// Retrieves the assignment value for a given feature flag and subject as a numeric value.
    pub fn get_numeric_assignment(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
    ) -> Result<Option<f64>> {
        self.get_assignment_inner(
            flag_key,
            subject_key,
            subject_attributes,
            Some(VariationType::Numeric),
            |x| x.as_numeric(),
        )
    }

    /// Retrieves the assignment value for a given feature flag and subject as a boolean value.
    pub fn get_boolean_assignment(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
    ) -> Result<Option<bool>> {
        self.get_assignment_inner(
            flag_key,
            subject_key,
            subject_attributes,
            Some(VariationType::Boolean),
            |x| x.as_boolean(),
        )
    }

    /// Retrieves the assignment value for a given feature flag and subject as a JSON value.
    ///
    /// ```
    /// # use serde_json::json;
    /// # fn test(client: &eppo_evaluator::Client) {
    /// let assignment = client
    ///     .get_json_assignment("a-json-flag", "user-id", &[
    ///         ("language".into(), "en".into())
    ///     ].into_iter().collect())
    ///     .unwrap_or_default()
    ///     .unwrap_or(json!({}));
    /// # }
    /// ```
    pub fn get_json_assignment(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
    ) -> Result<Option<serde_json::Value>> {
        self.get_assignment_inner(
            flag_key,
            subject_key,
            subject_attributes,
            Some(VariationType::Json),
            AssignmentValue::to_json,
        )
    }

    fn get_assignment_inner<T>(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
        expected_type: Option<VariationType>,
        convert: impl FnOnce(AssignmentValue) -> Option<T>,
    ) -> Result<Option<T>> {
        let result = self.configuration().and_then(|configuration| {
            Ok(configuration.get_assignment(
                flag_key,
                subject_key,
                subject_attributes,
                expected_type,
                self.config.evaluation_mode,
                Utc::now(),
            )?)
        });

        let assignment = match result {
            Ok(assignment) => assignment,
            Err(err) => {
                log::warn!(target: "eppo",
                           flag_key,
                           subject_key,
                           subject_attributes:serde;
                           "error occurred while evaluating a flag: {err}");
                return self.on_error(err, None);
            }
        };

        log::trace!(target: "eppo",
                    flag_key,
                    subject_key,
                    subject_attributes:serde,
                    assignment:serde = assignment.as_ref().map(|a| &a.value);
                    "evaluated a flag");

        let Some(Assignment { value, event, .. }) = assignment else {
            return Ok(None);
        };

        if let Some(event) = event {
            self.log_assignment_event(event);
        }

        Ok(convert(value))
    }

    /// Evaluate the specified string feature flag for the given subject. If the resulting variation
    /// is controlled by a bandit, select one of `actions` for the subject.
    ///
    /// If the subject is not eligible for any allocation, `default_variation` is used (and may
    /// itself be a bandit variation).
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::collections::HashMap;
    /// # use eppo_evaluator::ContextAttributes;
    /// # fn test(client: &eppo_evaluator::Client) {
    /// let actions: HashMap<String, ContextAttributes> = [
    ///     ("nike".to_owned(), [("brand_affinity".to_owned(), 0.4.into())].into_iter().collect()),
    ///     ("adidas".to_owned(), ContextAttributes::default()),
    /// ].into();
    /// let result = client
    ///     .get_bandit_action("shoe-bandit", "user-id", &ContextAttributes::default(), &actions, "control")
    ///     .unwrap();
    /// println!("{} {:?}", result.variation, result.action);
    /// # }
    /// ```
    pub fn get_bandit_action(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &ContextAttributes,
        actions: &HashMap<String, ContextAttributes>,
        default_variation: &str,
    ) -> Result<BanditResult> {
        let result = self.configuration().and_then(|configuration| {
            Ok(configuration.get_bandit_action(
                flag_key,
                subject_key,
                subject_attributes,
                actions,
                default_variation,
                self.config.evaluation_mode,
                Utc::now(),
            )?)
        });

        let result = match result {
            Ok(result) => result,
            Err(err) => {
                log::warn!(target: "eppo",
                           flag_key,
                           subject_key;
                           "error occurred while evaluating a bandit: {err}");
                return self.on_error(err, BanditResult::from_default(default_variation));
            }
        };

        if let Some(event) = &result.assignment_event {
            self.log_assignment_event(event.clone());
        }
        if let Some(event) = &result.bandit_event {
            self.log_bandit_event(event.clone());
        }

        Ok(result)
    }

    fn configuration(&self) -> Result<Arc<crate::Configuration>> {
        self.configuration_store.get_configuration().ok_or_else(|| {
            log::warn!(target: "eppo", "evaluating before configuration has been fetched");
            Error::ConfigurationUnavailable
        })
    }

    fn on_error<T>(&self, err: Error, default: T) -> Result<T> {
        match self.config.evaluation_mode {
            EvaluationMode::Graceful => Ok(default),
            EvaluationMode::Strict => Err(err),
        }
    }

    fn log_assignment_event(&self, event: AssignmentEvent) {
        if !self
            .config
            .assignment_cache
            .should_log(&Fingerprint::for_assignment(&event))
        {
            log::trace!(target: "eppo", flag_key:display = event.feature_flag; "skipping duplicate assignment event");
            return;
        }
        log::trace!(target: "eppo",
                    event:serde;
                    "logging assignment");
        self.config.assignment_logger.log_assignment(event);
    }

    fn log_bandit_event(&self, event: BanditEvent) {
        if !self
            .config
            .bandit_cache
            .should_log(&Fingerprint::for_bandit(&event))
        {
            log::trace!(target: "eppo", bandit_key:display = event.bandit_key; "skipping duplicate bandit event");
            return;
        }
        log::trace!(target: "eppo",
                    event:serde;
                    "logging bandit action");
        self.config.bandit_logger.log_bandit_action(event);
    }

    /// Start a poller thread to fetch configuration from the server.
    pub fn start_poller_thread(&mut self) -> Result<PollerThread> {
        let fetcher = ConfigurationFetcher::new(ConfigurationFetcherConfig {
            base_url: self.config.base_url.clone(),
            api_key: self.config.api_key.clone(),
            sdk_name: "rust".to_owned(),
            sdk_version: env!("CARGO_PKG_VERSION").to_owned(),
        });
        Ok(PollerThread::start_with_config(
            fetcher,
            self.configuration_store.clone(),
            self.config.poller.clone(),
        )?)
    }
}
