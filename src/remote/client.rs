//! HTTP implementation of the account service. Each task gets its own
//! `reqwest::Client` so the proxy and connection pool live exactly as long as
//! the task.

use super::options::HttpServiceOptions;
use super::service::{AccountService, AccountServiceFactory, PointsSnapshot, RemoteStep};
use crate::source::{Account, Credential};
use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use reqwest::{Client, Method, Proxy};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct HttpAccountServiceFactory {
    base_url: Arc<str>,
    options: HttpServiceOptions,
}

impl HttpAccountServiceFactory {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_options(base_url, HttpServiceOptions::default())
    }

    pub fn with_options(base_url: impl Into<String>, options: HttpServiceOptions) -> Result<Self> {
        options.validate()?;
        let base_url = base_url.into();
        let base_url = base_url.trim().trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            bail!("service url must start with http:// or https://");
        }
        Ok(Self {
            base_url: Arc::from(base_url),
            options,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl AccountServiceFactory for HttpAccountServiceFactory {
    type Service = HttpAccountService;

    fn connect(&self, account: &Account, proxy: Option<&str>) -> Result<HttpAccountService> {
        let mut builder = Client::builder()
            .timeout(self.options.request_timeout)
            .connect_timeout(self.options.connect_timeout)
            .user_agent(self.options.user_agent.clone());

        if let Some(proxy) = proxy {
            let proxy = Proxy::all(proxy).with_context(|| format!("invalid proxy {proxy}"))?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }

        let client = builder.build().context("failed to build HTTP client")?;
        Ok(HttpAccountService {
            client: Some(client),
            base_url: self.base_url.clone(),
            address: account.address.clone(),
            credential: account.credential.clone(),
        })
    }
}

pub struct HttpAccountService {
    client: Option<Client>,
    base_url: Arc<str>,
    address: String,
    credential: Credential,
}

#[derive(Deserialize)]
struct NodeState {
    running: bool,
}

#[derive(Deserialize)]
struct ProofResponse {
    proof: Option<String>,
}

impl HttpAccountService {
    fn url(&self, suffix: &str) -> String {
        format!("{}/accounts/{}{}", self.base_url, self.address, suffix)
    }

    async fn send(&self, step: RemoteStep, method: Method, suffix: &str) -> Result<String> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| anyhow!("{step} called on a closed service client"))?;
        let url = self.url(suffix);

        let response = client
            .request(method.clone(), &url)
            .bearer_auth(self.credential.expose())
            .send()
            .await
            .map_err(|err| transport_error(step, err))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| transport_error(step, err))?;

        if !status.is_success() {
            bail!("{step} request {method} {url} returned {status}: {body}");
        }
        Ok(body)
    }

    async fn post(&self, step: RemoteStep, suffix: &str) -> Result<()> {
        self.send(step, Method::POST, suffix).await.map(|_| ())
    }

    async fn get_json<T: DeserializeOwned>(&self, step: RemoteStep, suffix: &str) -> Result<T> {
        let body = self.send(step, Method::GET, suffix).await?;
        serde_json::from_str(&body).with_context(|| format!("{step} returned malformed JSON"))
    }
}

fn transport_error(step: RemoteStep, err: reqwest::Error) -> anyhow::Error {
    if err.is_timeout() {
        anyhow!("{step} request timed out")
    } else {
        anyhow!(err).context(format!("{step} request failed"))
    }
}

impl AccountService for HttpAccountService {
    fn check_in(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.post(RemoteStep::CheckIn, "/check-in"))
    }

    fn node_running(&mut self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let state: NodeState = self
                .get_json(RemoteStep::QueryRunningState, "/node")
                .await?;
            Ok(state.running)
        })
    }

    fn stop_node(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.post(RemoteStep::Stop, "/node/stop"))
    }

    fn connect_node(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.post(RemoteStep::Reconnect, "/node/start"))
    }

    fn node_points(&mut self) -> BoxFuture<'_, Result<PointsSnapshot>> {
        Box::pin(self.get_json(RemoteStep::QueryPoints, "/points"))
    }

    fn fetch_proof(&mut self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            let response: ProofResponse = self.get_json(RemoteStep::FetchProof, "/proof").await?;
            Ok(response.proof.filter(|proof| !proof.trim().is_empty()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.client.take().is_some() {
                tracing::trace!(address = %self.address, "service client released");
            }
        })
    }
}
