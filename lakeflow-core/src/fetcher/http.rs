//! `reqwest`-backed [`ApiClient`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use super::{ApiClient, ApiResponse, Headers};
use crate::config::FetcherConfig;
use crate::error::FetchError;
use crate::types::Connection;

/// How requests authenticate against the upstream API.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ApiAuth {
    #[default]
    None,
    Bearer(String),
    Basic {
        username: String,
        password: String,
    },
    /// A custom header, e.g. `Private-Token` or `Authorization: token ...`.
    Header { name: String, value: String },
}

impl ApiAuth {
    /// Derive auth from a connection: token wins over username/password.
    pub fn from_connection(connection: &Connection) -> Self {
        if let Some(token) = connection.token.as_deref().filter(|t| !t.is_empty()) {
            return ApiAuth::Bearer(token.to_string());
        }
        match (&connection.username, &connection.password) {
            (Some(username), password) if !username.is_empty() => ApiAuth::Basic {
                username: username.clone(),
                password: password.clone().unwrap_or_default(),
            },
            _ => ApiAuth::None,
        }
    }
}

/// HTTP client bound to one endpoint and credential set.
#[derive(Debug, Clone)]
pub struct HttpApiClient {
    client: reqwest::Client,
    endpoint: Url,
    auth: ApiAuth,
    timeout_secs: u64,
}

impl HttpApiClient {
    pub fn new(
        endpoint: &str,
        auth: ApiAuth,
        proxy: Option<&str>,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, FetchError> {
        let mut base = endpoint.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base).map_err(|e| FetchError::InvalidRequest {
            message: format!("invalid endpoint '{endpoint}': {e}"),
        })?;

        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| FetchError::InvalidRequest {
                message: format!("invalid proxy '{proxy}': {e}"),
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| FetchError::InvalidRequest {
            message: format!("failed to build HTTP client: {e}"),
        })?;

        Ok(Self {
            client,
            endpoint,
            auth,
            timeout_secs: timeout.as_secs(),
        })
    }

    /// Build a client for a configured connection.
    pub fn for_connection(
        connection: &Connection,
        auth: ApiAuth,
        config: &FetcherConfig,
    ) -> Result<Self, FetchError> {
        Self::new(
            &connection.endpoint,
            auth,
            connection.proxy_url(),
            Duration::from_secs(config.timeout_secs),
            &config.user_agent,
        )
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn resolve(&self, path: &str) -> Result<Url, FetchError> {
        self.endpoint
            .join(path.trim_start_matches('/'))
            .map_err(|e| FetchError::InvalidRequest {
                message: format!("invalid path '{path}': {e}"),
            })
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &Headers,
    ) -> Result<ApiResponse, FetchError> {
        let url = self.resolve(path)?;
        let mut request = self.client.get(url.clone()).query(query);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = match &self.auth {
            ApiAuth::None => request,
            ApiAuth::Bearer(token) => request.bearer_auth(token),
            ApiAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
            ApiAuth::Header { name, value } => request.header(name.as_str(), value.as_str()),
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                    timeout_secs: self.timeout_secs,
                }
            } else {
                FetchError::Connection {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| FetchError::Connection {
            url: final_url.clone(),
            message: format!("failed to read body: {e}"),
        })?;

        Ok(ApiResponse {
            status,
            url: final_url,
            headers,
            body,
        })
    }
}
