//! An HTTP client that fetches configuration from the server.
use reqwest::{StatusCode, Url};

use crate::{bandits::BanditResponse, ufc::UniversalFlagConfig, Configuration, Error, Result};

/// Something that can produce a fresh [`Configuration`]. [`PollerThread`](crate::PollerThread)
/// calls it on every poll.
pub trait ConfigurationSource: Send + 'static {
    /// Fetch a new configuration. `current` is the currently active snapshot, if any, so that
    /// unchanged parts can be reused.
    fn fetch_configuration(&mut self, current: Option<&Configuration>) -> Result<Configuration>;
}

impl<F> ConfigurationSource for F
where
    F: FnMut(Option<&Configuration>) -> Result<Configuration> + Send + 'static,
{
    fn fetch_configuration(&mut self, current: Option<&Configuration>) -> Result<Configuration> {
        self(current)
    }
}

/// Configuration for [`ConfigurationFetcher`].
#[derive(Debug, Clone)]
pub struct ConfigurationFetcherConfig {
    #[allow(missing_docs)]
    pub base_url: String,
    #[allow(missing_docs)]
    pub api_key: String,
    /// SDK name. Usually, language name.
    pub sdk_name: String,
    /// Version of SDK.
    pub sdk_version: String,
}

/// Default server to fetch configuration from.
pub const DEFAULT_BASE_URL: &str = "https://fscdn.eppo.cloud/api";

const UFC_ENDPOINT: &str = "/flag-config/v1/config";
const BANDIT_ENDPOINT: &str = "/flag-config/v1/bandits";

/// A client that fetches configuration from the server.
pub struct ConfigurationFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    config: ConfigurationFetcherConfig,
    /// If we receive a 401 Unauthorized error during a request, it means the API key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: bool,
}

impl ConfigurationFetcher {
    #[allow(missing_docs)]
    pub fn new(config: ConfigurationFetcherConfig) -> ConfigurationFetcher {
        let client = reqwest::blocking::Client::new();

        ConfigurationFetcher {
            client,
            config,
            unauthorized: false,
        }
    }

    fn fetch_ufc_configuration(&mut self) -> Result<UniversalFlagConfig> {
        log::debug!(target: "eppo", "fetching UFC configuration");
        let body = self.get(UFC_ENDPOINT)?;
        let ufc = UniversalFlagConfig::from_json(&body)?;
        log::debug!(target: "eppo", "successfully fetched UFC configuration");
        Ok(ufc)
    }

    fn fetch_bandits_configuration(&mut self) -> Result<BanditResponse> {
        log::debug!(target: "eppo", "fetching bandits configuration");
        let body = self.get(BANDIT_ENDPOINT)?;
        let bandits = BanditResponse::from_json(&body)?;
        log::debug!(target: "eppo", "successfully fetched bandits configuration");
        Ok(bandits)
    }

    fn get(&mut self, endpoint: &str) -> Result<Vec<u8>> {
        let url = self.url(endpoint)?;
        let response = self.client.get(url).send()?;

        if let Err(err) = check_status(response.status()) {
            if matches!(err, Error::Unauthorized) {
                log::warn!(target: "eppo", "client is not authorized. Check your API key");
                self.unauthorized = true;
            } else {
                log::warn!(target: "eppo", endpoint; "received non-200 response while fetching new configuration: {err}");
            }
            return Err(err);
        }

        Ok(response.bytes()?.to_vec())
    }

    fn url(&self, endpoint: &str) -> Result<Url> {
        Url::parse_with_params(
            &format!("{}{}", self.config.base_url, endpoint),
            &[
                ("apiKey", &*self.config.api_key),
                ("sdkName", &*self.config.sdk_name),
                ("sdkVersion", &*self.config.sdk_version),
            ],
        )
        .map_err(Error::InvalidBaseUrl)
    }
}

impl ConfigurationSource for ConfigurationFetcher {
    fn fetch_configuration(&mut self, current: Option<&Configuration>) -> Result<Configuration> {
        if self.unauthorized {
            return Err(Error::Unauthorized);
        }

        let ufc = self.fetch_ufc_configuration()?;

        let bandits = match reusable_bandits(current, &ufc) {
            Some(bandits) => bandits,
            None => Some(self.fetch_bandits_configuration()?),
        };

        Ok(Configuration::from_server_response(ufc, bandits))
    }
}

/// Decide whether bandit parameters need to be fetched for `ufc`.
///
/// Returns `Some(bandits)` when no request is needed: either no bandit is referenced, or `current`
/// already holds every referenced model version.
fn reusable_bandits(
    current: Option<&Configuration>,
    ufc: &UniversalFlagConfig,
) -> Option<Option<BanditResponse>> {
    if ufc.bandit_references.is_empty() {
        return Some(None);
    }
    let current = current.filter(|current| current.has_bandits_for(ufc))?;
    log::debug!(target: "eppo", "bandit models are up to date, skipping fetch");
    Some(current.bandits.clone())
}

/// Map an HTTP status to the error the poller acts upon.
fn check_status(status: StatusCode) -> Result<()> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED => Err(Error::Unauthorized),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Err(Error::RateLimited {
            status: status.as_u16(),
        }),
        _ => Err(Error::UnexpectedStatus {
            status: status.as_u16(),
        }),
    }
}
