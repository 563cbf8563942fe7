//! HTTP feed fetcher
//!
//! This module handles all HTTP requests for the harvester, including:
//! - Building the HTTP client
//! - Turning a `FeedRequest` and paging state into a request URL
//! - Attaching credential headers through a `RequestSigner`
//! - Classifying responses into pages or typed errors
//! - Retrying transient failures with backoff

use crate::config::{ApiConfig, Config};
use crate::crawler::detection::detect;
use crate::crawler::pagination::{parse_page, FeedRequest, FeedSource, FetchedPage, PagingState};
use crate::credentials::CredentialBundle;
use crate::retry::{with_retry, RetryPolicy};
use crate::{HarvestError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, REFERER, USER_AGENT};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const PARENT_ID_PLACEHOLDER: &str = "{parent_id}";

/// Produces any extra headers a request needs beyond the bundle's own
///
/// Real signature schemes live outside this crate; the default signer adds nothing.
pub trait RequestSigner: Send + Sync {
    fn sign(&self, url: &Url, bundle: &CredentialBundle) -> Vec<(String, String)>;
}

/// Sends the credential bundle as-is
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughSigner;

impl RequestSigner for PassthroughSigner {
    fn sign(&self, _url: &Url, _bundle: &CredentialBundle) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The API configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &ApiConfig) -> std::result::Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Feed source backed by the remote JSON API
pub struct HttpFeedSource {
    client: Client,
    api: ApiConfig,
    page_size: u32,
    retry: RetryPolicy,
    signer: Arc<dyn RequestSigner>,
}

impl HttpFeedSource {
    pub fn new(
        client: Client,
        api: ApiConfig,
        page_size: u32,
        retry: RetryPolicy,
        signer: Arc<dyn RequestSigner>,
    ) -> Self {
        Self {
            client,
            api,
            page_size,
            retry,
            signer,
        }
    }

    /// Builds a source from the full configuration with the passthrough signer
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = build_http_client(&config.api)?;
        Ok(Self::new(
            client,
            config.api.clone(),
            config.crawler.page_size,
            RetryPolicy::from(&config.retry),
            Arc::new(PassthroughSigner),
        ))
    }

    /// Builds the request URL for one page
    pub fn page_url(&self, request: &FeedRequest, state: &PagingState) -> Result<Url> {
        let mut url = match request {
            FeedRequest::Search { .. } => Url::parse(&self.api.search_url)?,
            FeedRequest::Children { parent_id } => Url::parse(
                &self
                    .api
                    .children_url
                    .replace(PARENT_ID_PLACEHOLDER, parent_id),
            )?,
        };

        {
            let mut query = url.query_pairs_mut();
            if let FeedRequest::Search {
                keywords,
                start_date,
                end_date,
            } = request
            {
                query.append_pair("q", keywords);
                query.append_pair("t", "general");
                if let Some(start) = start_date {
                    query.append_pair("start_date", &start.to_string());
                }
                if let Some(end) = end_date {
                    query.append_pair("end_date", &end.to_string());
                }
            } else {
                query.append_pair("order", "default");
                query.append_pair("platform", "desktop");
            }
            query.append_pair("limit", &self.page_size.to_string());
            query.append_pair("offset", &state.offset.to_string());
            if let Some(cursor) = &state.cursor {
                query.append_pair("cursor", cursor);
            }
        }

        Ok(url)
    }

    fn headers_for(
        &self,
        request: &FeedRequest,
        url: &Url,
        credential: &CredentialBundle,
    ) -> HeaderMap {
        let mut headers = HeaderMap::new();

        let signed = self.signer.sign(url, credential);
        let pairs = credential
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain(signed.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        for (name, value) in pairs {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::debug!(header = name, "Skipping invalid credential header"),
            }
        }

        if let Some(ua) = credential
            .user_agent
            .as_deref()
            .and_then(|ua| HeaderValue::from_str(ua).ok())
        {
            headers.insert(USER_AGENT, ua);
        }

        if let FeedRequest::Children { parent_id } = request {
            let referer = self
                .api
                .parent_page_url
                .replace(PARENT_ID_PLACEHOLDER, parent_id);
            if let Ok(value) = HeaderValue::from_str(&referer) {
                headers.insert(REFERER, value);
            }
        }

        headers
    }

    /// Sends one request and classifies the response, without retrying
    async fn fetch_once(
        &self,
        request: &FeedRequest,
        state: &PagingState,
        credential: &CredentialBundle,
    ) -> Result<FetchedPage> {
        let url = self.page_url(request, state)?;
        let headers = self.headers_for(request, &url, credential);
        let url_str = url.to_string();

        tracing::debug!(url = %url_str, page = state.page_index, "Fetching feed page");

        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HarvestError::Timeout {
                        url: url_str.clone(),
                    }
                } else {
                    HarvestError::Http {
                        url: url_str.clone(),
                        source: e,
                    }
                }
            })?;

        let status = response.status();
        let response_headers = response.headers().clone();
        let body = response.text().await.map_err(|e| HarvestError::Http {
            url: url_str.clone(),
            source: e,
        })?;

        if let Some(detection) = detect(status, &response_headers, &body, false) {
            tracing::warn!(
                url = %url_str,
                kind = %detection.kind,
                status = status.as_u16(),
                "Anti-bot response detected"
            );
            return Err(detection.into_error(&url_str));
        }

        if !status.is_success() {
            return Err(HarvestError::ServerError {
                url: url_str,
                status: status.as_u16(),
            });
        }

        match parse_page(&url_str, &body, state, self.page_size) {
            Ok(page) => Ok(page),
            Err(err) => {
                // A challenge page served with 200 is not JSON
                if let Some(detection) = detect(status, &response_headers, &body, true) {
                    tracing::warn!(url = %url_str, kind = %detection.kind, "Challenge page detected");
                    return Err(detection.into_error(&url_str));
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch_page(
        &self,
        request: &FeedRequest,
        state: &PagingState,
        credential: &CredentialBundle,
    ) -> Result<FetchedPage> {
        with_retry(&self.retry, || self.fetch_once(request, state, credential)).await
    }
}
