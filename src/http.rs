//! HTTP client for the control-plane REST API.
//!
//! This module provides a wrapper around `reqwest::Client` that adds:
//! * Bearer token authentication on every request
//! * A hard per-request timeout, so a slow control plane degrades to
//!   "no data this tick" instead of stalling the polling loop
//! * Consistent headers and connection reuse
//!
//! # Example
//!
//! ```rust
//! use mediawarden::http::Client;
//!
//! let client = Client::new(&config)?;
//! let url = client.url("api/states/media_player.spotify")?;
//! let response = client.execute(client.get(url)).await?;
//! ```

use std::time::Duration;

use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Body, Method, Url,
};

use crate::{
    config::Config,
    error::{Error, Result},
};

/// HTTP client with authentication and bounded timeouts.
pub struct Client {
    inner: reqwest::Client,
    base: Url,
}

impl Client {
    /// Duration to keep idle connections alive.
    ///
    /// The daemon polls every half second while music plays, so keeping the
    /// connection warm avoids a TCP handshake per request.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Duration to wait for a connection to be established.
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

    /// Creates a new client for the configured control plane.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * No token is configured
    /// * HTTP client creation fails
    /// * The token cannot be used as a header value
    pub fn new(config: &Config) -> Result<Self> {
        let token = config
            .token
            .as_ref()
            .ok_or_else(|| Error::unauthenticated("no access token configured"))?;
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", &**token))?;
        bearer.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let inner = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .connect_timeout(Self::CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .default_headers(headers)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self {
            inner,
            base: config.hass_url.clone(),
        })
    }

    /// Resolves a path relative to the control-plane base URL.
    ///
    /// # Errors
    ///
    /// Returns error if the path cannot be joined onto the base URL.
    pub fn url(&self, path: &str) -> Result<Url> {
        self.base.join(path).map_err(Into::into)
    }

    /// Builds a request with specified method, URL and body.
    pub fn request<T>(&self, method: Method, url: Url, body: T) -> reqwest::Request
    where
        T: Into<Body>,
    {
        let mut request = reqwest::Request::new(method, url);
        *request.body_mut() = Some(body.into());
        request
    }

    /// Builds a POST request.
    pub fn post<T>(&self, url: Url, body: T) -> reqwest::Request
    where
        T: Into<Body>,
    {
        self.request(Method::POST, url, body)
    }

    /// Builds a GET request without body.
    pub fn get(&self, url: Url) -> reqwest::Request {
        reqwest::Request::new(Method::GET, url)
    }

    /// Executes a request.
    ///
    /// Non-success statuses are turned into errors.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * The request times out
    /// * A network error occurs
    /// * The control plane answers with a non-success status
    pub async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        let response = self.inner.execute(request).await?;
        response.error_for_status().map_err(Into::into)
    }
}
