use std::time::Duration;

use crate::{
    assignment_logger::{NoopAssignmentLogger, NoopBanditLogger},
    configuration_fetcher::DEFAULT_BASE_URL,
    AssignmentLogger, BanditLogger, Client, DedupCache, EvaluationMode, ExpiringDedupCache,
    LruDedupCache, PollerThreadConfig,
};

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use eppo_evaluator::ClientConfig;
/// let client = ClientConfig::from_api_key("api-key")
///     .assignment_logger(|event| {
///         println!("{:?}", event);
///     })
///     .to_client();
/// ```
pub struct ClientConfig<'a> {
    pub(crate) api_key: String,
    pub(crate) base_url: String,
    pub(crate) assignment_logger: Box<dyn AssignmentLogger + Send + Sync + 'a>,
    pub(crate) bandit_logger: Box<dyn BanditLogger + Send + Sync + 'a>,
    pub(crate) evaluation_mode: EvaluationMode,
    pub(crate) assignment_cache: Box<dyn DedupCache + 'a>,
    pub(crate) bandit_cache: Box<dyn DedupCache + 'a>,
    pub(crate) poller: PollerThreadConfig,
}

impl<'a> ClientConfig<'a> {
    /// Create a default configuration using the specified API key.
    ///
    /// ```
    /// # use eppo_evaluator::ClientConfig;
    /// ClientConfig::from_api_key("api-key");
    /// ```
    pub fn from_api_key(api_key: impl Into<String>) -> Self {
        ClientConfig {
            api_key: api_key.into(),
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            assignment_logger: Box::new(NoopAssignmentLogger),
            bandit_logger: Box::new(NoopBanditLogger),
            evaluation_mode: EvaluationMode::default(),
            assignment_cache: Box::new(LruDedupCache::default()),
            bandit_cache: Box::new(ExpiringDedupCache::default()),
            poller: PollerThreadConfig::default(),
        }
    }

    /// Set assignment logger to store variation assignments to your data warehouse.
    ///
    /// ```
    /// # use eppo_evaluator::ClientConfig;
    /// let config = ClientConfig::from_api_key("api-key").assignment_logger(|event| {
    ///   println!("{:?}", event);
    /// });
    /// ```
    pub fn assignment_logger(
        mut self,
        assignment_logger: impl AssignmentLogger + Send + Sync + 'a,
    ) -> Self {
        self.assignment_logger = Box::new(assignment_logger);
        self
    }

    /// Set bandit logger to store selected bandit actions to your data warehouse.
    pub fn bandit_logger(mut self, bandit_logger: impl BanditLogger + Send + Sync + 'a) -> Self {
        self.bandit_logger = Box::new(bandit_logger);
        self
    }

    /// Default base URL for API calls.
    pub const DEFAULT_BASE_URL: &'static str = DEFAULT_BASE_URL;

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Choose whether evaluation errors are returned ([`EvaluationMode::Strict`]) or replaced with
    /// defaults ([`EvaluationMode::Graceful`], the default).
    pub fn evaluation_mode(mut self, evaluation_mode: EvaluationMode) -> Self {
        self.evaluation_mode = evaluation_mode;
        self
    }

    /// Replace the cache used to de-duplicate assignment events. Pass
    /// [`PassThroughCache`](crate::PassThroughCache) to log every assignment.
    ///
    /// Defaults to an [`LruDedupCache`] with [`LruDedupCache::DEFAULT_CAPACITY`].
    pub fn assignment_cache(mut self, cache: impl DedupCache + 'a) -> Self {
        self.assignment_cache = Box::new(cache);
        self
    }

    /// Replace the cache used to de-duplicate bandit events.
    ///
    /// Defaults to an [`ExpiringDedupCache`] with [`ExpiringDedupCache::DEFAULT_TTL`].
    pub fn bandit_cache(mut self, cache: impl DedupCache + 'a) -> Self {
        self.bandit_cache = Box::new(cache);
        self
    }

    /// Override how often the poller thread fetches configuration.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poller.interval = interval;
        self
    }

    /// Override the random jitter applied to poll interval.
    pub fn poll_jitter(mut self, jitter: Duration) -> Self {
        self.poller.jitter = jitter;
        self
    }

    /// Replace poller thread configuration altogether.
    pub fn poller_thread_config(mut self, poller: PollerThreadConfig) -> Self {
        self.poller = poller;
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use eppo_evaluator::{ClientConfig, Client};
    /// let client: Client = ClientConfig::from_api_key("api-key").to_client();
    /// ```
    pub fn to_client(self) -> Client<'a> {
        Client::new(self)
    }
}
