//! Network collaborator: fetches block definitions and personalized payloads from the server.
use std::{
    collections::HashMap,
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
};

use reqwest::{StatusCode, Url};
use serde::Serialize;

use crate::{
    models::{DefinitionsResponse, PersonalizedContentBlock, PersonalizedResponse, TryParse},
    Error, Result,
};

/// Fetches personalized payloads for a set of block ids.
pub trait PersonalizationFetcher: Send + Sync + 'static {
    /// Fetch personalization for `block_ids`, keyed by block id. Ids missing from the result were
    /// not served by the server.
    fn fetch_personalization(
        &self,
        block_ids: &[String],
    ) -> impl Future<Output = Result<HashMap<String, PersonalizedContentBlock>>> + Send;
}

/// Connection settings of [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// API root, without a trailing path.
    pub base_url: String,
    /// Project the content blocks belong to.
    pub project_token: String,
    /// Sent as `Authorization: Token {api_key}`.
    pub api_key: String,
    /// Identifies the customer that content is personalized for.
    pub customer_ids: HashMap<String, String>,
}

impl HttpFetcherConfig {
    #[allow(missing_docs)]
    pub const DEFAULT_BASE_URL: &'static str = "https://api.exponea.com";

    /// Create a config pointing at [`HttpFetcherConfig::DEFAULT_BASE_URL`].
    pub fn new(project_token: impl Into<String>, api_key: impl Into<String>) -> HttpFetcherConfig {
        HttpFetcherConfig {
            base_url: HttpFetcherConfig::DEFAULT_BASE_URL.to_owned(),
            project_token: project_token.into(),
            api_key: api_key.into(),
            customer_ids: HashMap::new(),
        }
    }

    /// Point the fetcher at another API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> HttpFetcherConfig {
        self.base_url = base_url.into();
        self
    }

    /// Add a customer identifier, e.g., `("registered", "jane@example.com")`.
    pub fn with_customer_id(
        mut self,
        kind: impl Into<String>,
        value: impl Into<String>,
    ) -> HttpFetcherConfig {
        self.customer_ids.insert(kind.into(), value.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct PersonalizationRequest<'a> {
    customer_ids: &'a HashMap<String, String>,
    content_block_ids: &'a [String],
}

/// [`PersonalizationFetcher`] talking to the content block HTTP API.
pub struct HttpFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    config: HttpFetcherConfig,
    /// If we receive a 401 Unauthorized error during a request, it means the API key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl HttpFetcher {
    /// Create a fetcher with its own connection pool.
    pub fn new(config: HttpFetcherConfig) -> HttpFetcher {
        HttpFetcher {
            client: reqwest::Client::new(),
            config,
            unauthorized: AtomicBool::new(false),
        }
    }

    /// Fetch every content block definition of the project.
    pub async fn fetch_definitions(&self) -> Result<DefinitionsResponse> {
        self.check_authorized()?;

        let url = Url::parse_with_params(
            &format!(
                "{}/wxstatic/projects/{}/bundle-ios.json",
                self.config.base_url, self.config.project_token
            ),
            &[("v", "2")],
        )
        .map_err(Error::InvalidBaseUrl)?;

        log::debug!(target: "content_blocks", "fetching content block definitions");
        let response = self.client.get(url).send().await?;
        let response = self.error_for_status(response)?;
        let definitions: DefinitionsResponse = response.json().await?;

        if !definitions.success {
            return Err(Error::FetchFailed(
                "definitions response reported failure".to_owned(),
            ));
        }
        log::debug!(target: "content_blocks",
                    count = definitions.content_blocks.len();
                    "successfully fetched content block definitions");
        Ok(definitions)
    }

    fn check_authorized(&self) -> Result<()> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }
        Ok(())
    }

    fn error_for_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        response.error_for_status().map_err(|err| {
            if err.status() == Some(StatusCode::UNAUTHORIZED) {
                log::warn!(target: "content_blocks", "client is not authorized. Check your API key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Error::Unauthorized
            } else {
                log::warn!(target: "content_blocks", "received non-200 response: {:?}", err);
                Error::from(err)
            }
        })
    }
}

impl PersonalizationFetcher for HttpFetcher {
    async fn fetch_personalization(
        &self,
        block_ids: &[String],
    ) -> Result<HashMap<String, PersonalizedContentBlock>> {
        self.check_authorized()?;

        let url = Url::parse_with_params(
            &format!(
                "{}/webxp/s/{}/inappcontentblocks",
                self.config.base_url, self.config.project_token
            ),
            &[("v", "2")],
        )
        .map_err(Error::InvalidBaseUrl)?;

        log::debug!(target: "content_blocks",
                    block_ids:debug = block_ids;
                    "fetching personalized content blocks");
        let response = self
            .client
            .post(url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Token {}", self.config.api_key),
            )
            .json(&PersonalizationRequest {
                customer_ids: &self.config.customer_ids,
                content_block_ids: block_ids,
            })
            .send()
            .await?;
        let response = self.error_for_status(response)?;
        let response: PersonalizedResponse = response.json().await?;

        Ok(index_personalized(response))
    }
}

/// Key parsed entries by block id, dropping those that failed to parse.
fn index_personalized(response: PersonalizedResponse) -> HashMap<String, PersonalizedContentBlock> {
    response
        .data
        .into_iter()
        .filter_map(|entry| match entry {
            TryParse::Parsed(block) => Some((block.id.clone(), block)),
            TryParse::ParseFailed(value) => {
                log::warn!(target: "content_blocks",
                           id:display = value.get("id").and_then(|id| id.as_str()).unwrap_or("<unknown>");
                           "skipping personalized content block that failed to parse");
                None
            }
        })
        .collect()
}
