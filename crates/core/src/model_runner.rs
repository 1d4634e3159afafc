use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::config::ReplicateConfig;

pub type ModelInputs = serde_json::Map<String, serde_json::Value>;

/// Executes one prediction. Calls block until the model finishes or fails.
pub trait ModelRunner: Send + Sync {
    fn run(&self, model_id: &str, inputs: &ModelInputs) -> Result<serde_json::Value>;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// `Prefer: wait` holds the create call open for at most this long.
const SYNC_WAIT_SECS: u64 = 60;

/// Model runner backed by the Replicate predictions HTTP API.
///
/// The blocking HTTP client is built per call, on the blocking pool the engine runs models on.
pub struct ReplicateRunner {
    headers: HeaderMap,
    api_base: Url,
    poll_interval: Duration,
    timeout: Duration,
}

impl ReplicateRunner {
    pub fn new(api_base: &str, token: &str, poll_interval: Duration, timeout: Duration) -> Result<Self> {
        let api_base = Url::parse(api_base.trim_end_matches('/'))
            .with_context(|| format!("invalid Replicate api_base: {api_base}"))?;
        if !matches!(api_base.scheme(), "http" | "https") {
            bail!("Replicate api_base must be http(s), got '{}'", api_base.scheme());
        }

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("Replicate API token contains invalid header characters")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            headers,
            api_base,
            poll_interval,
            timeout,
        })
    }

    /// Build a runner from config, reading the API token from the configured environment variable.
    pub fn from_config(config: &ReplicateConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| anyhow!("environment variable {} is not set", config.token_env))?;

        Self::new(
            &config.api_base,
            token.trim(),
            Duration::from_millis(config.poll_interval_ms.max(100)),
            Duration::from_secs(config.timeout_secs.max(1)),
        )
    }

    fn client(&self) -> Result<reqwest::blocking::Client> {
        reqwest::blocking::Client::builder()
            .default_headers(self.headers.clone())
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(self.timeout.max(Duration::from_secs(SYNC_WAIT_SECS + 5)))
            .build()
            .context("failed to build HTTP client for Replicate")
    }

    fn create_prediction(
        &self,
        client: &reqwest::blocking::Client,
        model_id: &str,
        inputs: &ModelInputs,
    ) -> Result<Prediction> {
        let (endpoint, body) = match parse_model_ref(model_id)? {
            ModelRef::Official { owner, name } => (
                self.endpoint(&format!("models/{owner}/{name}/predictions"))?,
                serde_json::json!({ "input": inputs }),
            ),
            ModelRef::Version { version } => (
                self.endpoint("predictions")?,
                serde_json::json!({ "version": version, "input": inputs }),
            ),
        };

        let response = client
            .post(endpoint)
            .header("Prefer", format!("wait={SYNC_WAIT_SECS}"))
            .json(&body)
            .send()
            .with_context(|| format!("Replicate request for {model_id} failed"))?;
        read_prediction(response, model_id)
    }

    fn fetch_prediction(
        &self,
        client: &reqwest::blocking::Client,
        url: &str,
        model_id: &str,
    ) -> Result<Prediction> {
        let response = client
            .get(url)
            .send()
            .with_context(|| format!("Replicate poll for {model_id} failed"))?;
        read_prediction(response, model_id)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let joined = format!("{}/{}", self.api_base.as_str().trim_end_matches('/'), path);
        Url::parse(&joined).with_context(|| format!("invalid Replicate endpoint: {joined}"))
    }
}

impl ModelRunner for ReplicateRunner {
    fn run(&self, model_id: &str, inputs: &ModelInputs) -> Result<serde_json::Value> {
        let started = Instant::now();
        let client = self.client()?;
        let mut prediction = self.create_prediction(&client, model_id, inputs)?;
        info!(model_id, prediction_id = %prediction.id, status = %prediction.status, "Prediction created");

        while !prediction.is_terminal() {
            if started.elapsed() >= self.timeout {
                bail!(
                    "prediction {} for {model_id} timed out after {}s",
                    prediction.id,
                    self.timeout.as_secs()
                );
            }
            let Some(poll_url) = prediction.urls.get.clone() else {
                bail!("prediction {} for {model_id} has no poll URL", prediction.id);
            };

            std::thread::sleep(self.poll_interval);
            prediction = self.fetch_prediction(&client, &poll_url, model_id)?;
            debug!(model_id, prediction_id = %prediction.id, status = %prediction.status, "Polled prediction");
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let output = prediction.into_output(model_id)?;
        info!(model_id, elapsed_ms, "Prediction succeeded");
        Ok(output)
    }
}

#[derive(Debug, PartialEq)]
enum ModelRef<'a> {
    Official { owner: &'a str, name: &'a str },
    Version { version: &'a str },
}

/// `owner/name` runs the model's latest version; `owner/name:version` pins a version.
fn parse_model_ref(model_id: &str) -> Result<ModelRef<'_>> {
    let model_id = model_id.trim();
    if let Some((_, version)) = model_id.split_once(':') {
        if version.is_empty() {
            bail!("model id '{model_id}' has an empty version");
        }
        return Ok(ModelRef::Version { version });
    }

    match model_id.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok(ModelRef::Official { owner, name })
        }
        _ => bail!("model id '{model_id}' must look like owner/name"),
    }
}

#[derive(Debug, Default, Deserialize)]
struct PredictionUrls {
    get: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    #[serde(default)]
    id: String,
    status: String,
    #[serde(default)]
    output: serde_json::Value,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    urls: PredictionUrls,
}

impl Prediction {
    fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "succeeded" | "failed" | "canceled")
    }

    /// Terminal prediction into its output. A bare string output becomes a one-element list.
    fn into_output(self, model_id: &str) -> Result<serde_json::Value> {
        match self.status.as_str() {
            "succeeded" => Ok(match self.output {
                serde_json::Value::String(s) => serde_json::Value::Array(vec![s.into()]),
                other => other,
            }),
            "canceled" => bail!("prediction {} for {model_id} was canceled", self.id),
            _ => {
                let reason = match self.error {
                    Some(serde_json::Value::String(s)) => s,
                    Some(serde_json::Value::Null) | None => "unknown error".to_string(),
                    Some(other) => other.to_string(),
                };
                bail!("prediction {} for {model_id} failed: {reason}", self.id)
            }
        }
    }
}

fn read_prediction(response: reqwest::blocking::Response, model_id: &str) -> Result<Prediction> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("failed reading Replicate response for {model_id}"))?;

    if !status.is_success() {
        let detail = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
            .unwrap_or(body);
        bail!("Replicate returned {} for {model_id}: {detail}", status.as_u16());
    }

    serde_json::from_str(&body)
        .with_context(|| format!("Replicate response for {model_id} is not a prediction"))
}
