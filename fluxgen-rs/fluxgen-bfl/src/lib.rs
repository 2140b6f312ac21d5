use std::time::Duration;

use log::debug;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const SUBMIT_PATH: &str = "/v1/image";
pub const RESULT_PATH: &str = "/v1/get_result";
pub const READY_STATUS: &str = "Ready";

pub const DEFAULT_WIDTH: u32 = 1024;
pub const DEFAULT_HEIGHT: u32 = 1024;
pub const DEFAULT_VARIANT: &str = "flux.1-pro";
pub const DEFAULT_STEPS: u32 = 25;
pub const DEFAULT_GUIDANCE: f64 = 2.5;
pub const DEFAULT_SAFETY_TOLERANCE: i32 = 2;
pub const DEFAULT_INTERVAL: f64 = 2.0;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Shorter poll intervals are raised to this value.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum BflError {
    #[error("BFL API key is missing")]
    MissingApiKey,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{status} for url ({url}): {body}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        body: String,
    },
    #[error("'id' not found in the POST response")]
    MissingJobId,
    #[error("job {id} was not ready after waiting {waited:?}")]
    PollTimeout { id: String, waited: Duration },
}

/// Body of a FLUX generation request. Field order is the order sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub variant: String,
    pub steps: u32,
    pub prompt_upsampling: bool,
    /// Serialized as `null` when absent.
    pub seed: Option<u64>,
    pub guidance: f64,
    pub safety_tolerance: i32,
    pub interval: f64,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            variant: DEFAULT_VARIANT.to_string(),
            steps: DEFAULT_STEPS,
            prompt_upsampling: false,
            seed: None,
            guidance: DEFAULT_GUIDANCE,
            safety_tolerance: DEFAULT_SAFETY_TOLERANCE,
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// Operations the CLI needs from the remote job API.
pub trait JobApi {
    /// Submits a generation job and returns the raw creation response.
    fn submit(&self, request: &GenerationRequest) -> Result<Value, BflError>;
    /// Fetches the current state of job `id`.
    fn get_result(&self, id: &str) -> Result<Value, BflError>;
    /// Downloads the bytes behind a result URL.
    fn download(&self, url: &str) -> Result<Vec<u8>, BflError>;
}

#[derive(Debug, Clone)]
pub struct BflClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl BflClient {
    /// # Errors
    ///
    /// Returns [`BflError::MissingApiKey`] when `api_key` is empty or whitespace only.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, BflError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(BflError::MissingApiKey);
        }

        Ok(Self {
            http: Client::new(),
            base_url: base_url.into(),
            api_key,
        })
    }

    pub fn endpoint_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

impl JobApi for BflClient {
    fn submit(&self, request: &GenerationRequest) -> Result<Value, BflError> {
        let url = self.endpoint_url(SUBMIT_PATH);
        debug!("POST {url}");

        let response = self
            .http
            .post(&url)
            .header("accept", "application/json")
            .header("x-key", &self.api_key)
            .json(request)
            .send()?;

        Ok(ensure_success(response)?.json::<Value>()?)
    }

    fn get_result(&self, id: &str) -> Result<Value, BflError> {
        let url = self.endpoint_url(RESULT_PATH);
        debug!("GET {url}?id={id}");

        let response = self
            .http
            .get(&url)
            .header("accept", "application/json")
            .header("x-key", &self.api_key)
            .query(&[("id", id)])
            .send()?;

        Ok(ensure_success(response)?.json::<Value>()?)
    }

    fn download(&self, url: &str) -> Result<Vec<u8>, BflError> {
        debug!("GET {url}");
        let response = ensure_success(self.http.get(url).send()?)?;
        Ok(response.bytes()?.to_vec())
    }
}

fn ensure_success(response: Response) -> Result<Response, BflError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let body = response.text().unwrap_or_default();
    Err(BflError::HttpStatus { status, url, body })
}

/// Extracts the job identifier from a creation response.
pub fn job_id(response: &Value) -> Result<&str, BflError> {
    response
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or(BflError::MissingJobId)
}

pub fn status_of(response: &Value) -> Option<&str> {
    response.get("status").and_then(Value::as_str)
}

/// URL of the generated image, present once a job is ready.
pub fn sample_url(response: &Value) -> Option<&str> {
    response
        .get("result")
        .and_then(|result| result.get("sample"))
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOptions {
    /// Sleep before every status request.
    pub interval: Duration,
    /// Upper bound on the total time slept. `None` polls until the job is ready.
    pub max_wait: Option<Duration>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_wait: None,
        }
    }
}

#[derive(Debug)]
pub enum PollEvent<'a> {
    /// A status request failed; polling continues.
    Failed { attempt: usize, error: BflError },
    Pending {
        attempt: usize,
        status: Option<&'a str>,
        response: &'a Value,
    },
    Ready { attempt: usize, response: &'a Value },
}

/// Polls job `id` until it reports [`READY_STATUS`], returning the final payload.
///
/// Every attempt is preceded by `sleep(options.interval)`, with the interval
/// raised to at least [`MIN_POLL_INTERVAL`]. Failed requests are reported
/// through `observe` and retried without backoff.
///
/// # Errors
///
/// Returns [`BflError::PollTimeout`] once `options.max_wait` is exhausted. With
/// no `max_wait` this function only returns when the job is ready.
pub fn poll_until_ready<A, S, O>(
    api: &A,
    id: &str,
    options: &PollOptions,
    mut sleep: S,
    mut observe: O,
) -> Result<Value, BflError>
where
    A: JobApi + ?Sized,
    S: FnMut(Duration),
    O: FnMut(PollEvent<'_>),
{
    let interval = options.interval.max(MIN_POLL_INTERVAL);
    let mut waited = Duration::ZERO;
    let mut attempt = 0;

    loop {
        attempt += 1;
        sleep(interval);
        waited += interval;

        match api.get_result(id) {
            Ok(response) => {
                let status = status_of(&response);
                if status == Some(READY_STATUS) {
                    observe(PollEvent::Ready {
                        attempt,
                        response: &response,
                    });
                    return Ok(response);
                }
                observe(PollEvent::Pending {
                    attempt,
                    status,
                    response: &response,
                });
            }
            Err(error) => observe(PollEvent::Failed { attempt, error }),
        }

        if options.max_wait.is_some_and(|limit| waited >= limit) {
            return Err(BflError::PollTimeout {
                id: id.to_string(),
                waited,
            });
        }
    }
}

#[cfg(test)]
mod tests;
