// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Multi-endpoint LLM client with weighted routing and failover.
//!
//! Works against any OpenAI-compatible Chat Completions API. Each configured
//! endpoint carries a static routing weight, a rolling latency average, and a
//! health flag. Per call, healthy endpoints are ordered by weighted random
//! sampling without replacement (faster endpoints get a bounded boost) and
//! tried in order until one succeeds. Endpoints that fail three times in a
//! row are demoted to the back of the order until a probe interval passes.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EndpointSpec;
use crate::error::LlmError;
use crate::types::ChatMessage;

/// EMA smoothing factor for endpoint latency.
const EMA_ALPHA: f64 = 0.3;

/// Consecutive failures before an endpoint is considered unhealthy.
const UNHEALTHY_THRESHOLD: u32 = 3;

/// How long an unhealthy endpoint sits out before one trial request.
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Latency boost bounds on the effective weight: an endpoint never drops
/// below half its base share and never exceeds twice it.
const WEIGHT_FLOOR: f64 = 0.5;
const WEIGHT_CAP: f64 = 2.0;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Readiness poll cadence.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(10);
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(8);

/// Per-call parameter overrides.
#[derive(Debug, Clone, Default)]
pub struct CompletionOverrides {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Token usage breakdown; absent fields default to zero.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A successful completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
    pub finish_reason: String,
    /// Name of the endpoint that served the request.
    pub endpoint: String,
    pub latency_ms: u64,
}

/// The completion seam the planner, sub-planner, and reconciler depend on.
/// Tests substitute a canned implementation.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        overrides: &CompletionOverrides,
    ) -> Result<Completion, LlmError>;
}

#[derive(Debug)]
struct EndpointState {
    spec: EndpointSpec,
    /// Rolling EMA of request latency in milliseconds; 0 until sampled.
    avg_latency_ms: f64,
    consecutive_failures: u32,
    healthy: bool,
    last_failure: Option<Instant>,
}

impl EndpointState {
    fn new(spec: EndpointSpec) -> Self {
        Self {
            spec,
            avg_latency_ms: 0.0,
            consecutive_failures: 0,
            healthy: true,
            last_failure: None,
        }
    }

    /// Static weight scaled by relative latency, bounded to [0.5, 2.0]x.
    fn effective_weight(&self, fleet_min_latency: f64) -> f64 {
        if self.avg_latency_ms <= 0.0 || fleet_min_latency <= 0.0 {
            return self.spec.weight;
        }
        let ratio = (fleet_min_latency / self.avg_latency_ms).clamp(WEIGHT_FLOOR, WEIGHT_CAP);
        self.spec.weight * ratio
    }
}

/// Weighted-routing LLM client over one or more named endpoints.
#[derive(Debug)]
pub struct LlmClient {
    http: reqwest::Client,
    endpoints: Mutex<Vec<EndpointState>>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    request_timeout: Duration,
}

impl LlmClient {
    /// Create a client from endpoint specs and default request parameters.
    pub fn new(
        endpoints: Vec<EndpointSpec>,
        model: impl Into<String>,
        max_tokens: u32,
        temperature: f32,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        if endpoints.is_empty() {
            return Err(LlmError::NotConfigured);
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;
        Ok(Self {
            http,
            endpoints: Mutex::new(endpoints.into_iter().map(EndpointState::new).collect()),
            model: model.into(),
            max_tokens,
            temperature,
            request_timeout,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Health view: `(name, healthy, consecutive_failures)` per endpoint.
    pub fn endpoint_health(&self) -> Vec<(String, bool, u32)> {
        self.endpoints
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.spec.name.clone(), e.healthy, e.consecutive_failures))
            .collect()
    }

    /// The endpoint a fresh request would try first, as `(url, api_key)`.
    /// Used to hand sandbox workers a concrete endpoint.
    pub fn preferred_endpoint(&self) -> Option<(String, Option<String>)> {
        let order = self.selection_order(Instant::now());
        let endpoints = self.endpoints.lock().unwrap();
        order.first().map(|&i| {
            (
                endpoints[i].spec.endpoint.clone(),
                endpoints[i].spec.api_key.clone(),
            )
        })
    }

    /// Poll `GET /v1/models` on every endpoint until one answers 200 or the
    /// deadline passes. Used at startup to ride out model cold starts.
    pub async fn wait_ready(&self, deadline: Duration) -> Result<(), LlmError> {
        let start = Instant::now();
        let specs: Vec<EndpointSpec> = self
            .endpoints
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.spec.clone())
            .collect();

        loop {
            for spec in &specs {
                let url = format!("{}/v1/models", spec.endpoint.trim_end_matches('/'));
                let mut req = self.http.get(&url).timeout(READY_PROBE_TIMEOUT);
                if let Some(key) = &spec.api_key {
                    req = req.bearer_auth(key);
                }
                match req.send().await {
                    Ok(resp) if resp.status().is_success() => {
                        info!(endpoint = %spec.name, "LLM endpoint ready");
                        return Ok(());
                    }
                    Ok(resp) => {
                        debug!(endpoint = %spec.name, status = %resp.status(), "not ready");
                    }
                    Err(e) => {
                        debug!(endpoint = %spec.name, error = %e, "not reachable");
                    }
                }
            }

            if start.elapsed() >= deadline {
                return Err(LlmError::NotReady(deadline.as_secs()));
            }
            let remaining = deadline.saturating_sub(start.elapsed());
            tokio::time::sleep(READY_POLL_INTERVAL.min(remaining)).await;
        }
    }

    /// Compute the try-order of endpoint indices for one call.
    ///
    /// Healthy endpoints come first in weighted random order; unhealthy ones
    /// are appended so they are only reached when everything else fails. An
    /// unhealthy endpoint whose probe interval has elapsed is re-marked
    /// healthy for one trial.
    fn selection_order(&self, now: Instant) -> Vec<usize> {
        let mut endpoints = self.endpoints.lock().unwrap();

        for state in endpoints.iter_mut() {
            if !state.healthy {
                if let Some(failed_at) = state.last_failure {
                    if now.duration_since(failed_at) >= PROBE_INTERVAL {
                        debug!(endpoint = %state.spec.name, "probing unhealthy endpoint");
                        state.healthy = true;
                    }
                }
            }
        }

        let fleet_min = endpoints
            .iter()
            .filter(|e| e.healthy && e.avg_latency_ms > 0.0)
            .map(|e| e.avg_latency_ms)
            .fold(f64::INFINITY, f64::min);
        let fleet_min = if fleet_min.is_finite() { fleet_min } else { 0.0 };

        let healthy: Vec<(usize, f64)> = endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| e.healthy)
            .map(|(i, e)| (i, e.effective_weight(fleet_min)))
            .collect();
        let unhealthy: Vec<usize> = endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.healthy)
            .map(|(i, _)| i)
            .collect();

        let mut order = weighted_order(healthy);
        order.extend(unhealthy);
        order
    }

    fn record_success(&self, index: usize, latency_ms: u64) {
        let mut endpoints = self.endpoints.lock().unwrap();
        let state = &mut endpoints[index];
        let sample = latency_ms as f64;
        state.avg_latency_ms = if state.avg_latency_ms <= 0.0 {
            sample
        } else {
            EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * state.avg_latency_ms
        };
        state.consecutive_failures = 0;
        state.healthy = true;
    }

    fn record_failure(&self, index: usize, now: Instant) {
        let mut endpoints = self.endpoints.lock().unwrap();
        let state = &mut endpoints[index];
        state.consecutive_failures += 1;
        state.last_failure = Some(now);
        if state.consecutive_failures >= UNHEALTHY_THRESHOLD {
            if state.healthy {
                warn!(
                    endpoint = %state.spec.name,
                    failures = state.consecutive_failures,
                    "marking endpoint unhealthy"
                );
            }
            state.healthy = false;
        }
    }

    async fn request_endpoint(
        &self,
        spec: &EndpointSpec,
        messages: &[ChatMessage],
        overrides: &CompletionOverrides,
    ) -> Result<(String, TokenUsage, String), LlmError> {
        let request = ChatRequest {
            model: overrides.model.clone().unwrap_or_else(|| self.model.clone()),
            messages,
            temperature: overrides.temperature.unwrap_or(self.temperature),
            max_tokens: overrides.max_tokens.unwrap_or(self.max_tokens),
        };

        let url = format!(
            "{}/v1/chat/completions",
            spec.endpoint.trim_end_matches('/')
        );
        let mut req = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .timeout(self.request_timeout);
        if let Some(key) = &spec.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.json(&request).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(self.request_timeout.as_millis() as u64)
            } else {
                LlmError::NetworkError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthError(truncate(&body, 300)),
                429 => LlmError::RateLimited(truncate(&body, 300)),
                code => LlmError::api(truncate(&body, 300), code),
            });
        }

        let api_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ParseError("response had no choices".to_string()))?;

        Ok((
            choice.message.content.unwrap_or_default(),
            api_response.usage.unwrap_or_default(),
            choice.finish_reason.unwrap_or_default(),
        ))
    }
}

#[async_trait]
impl CompletionClient for LlmClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        overrides: &CompletionOverrides,
    ) -> Result<Completion, LlmError> {
        let order = self.selection_order(Instant::now());
        if order.is_empty() {
            return Err(LlmError::NotConfigured);
        }

        let mut failures: Vec<String> = Vec::new();
        for index in order.iter().copied() {
            let spec = {
                let endpoints = self.endpoints.lock().unwrap();
                endpoints[index].spec.clone()
            };

            let start = Instant::now();
            match self.request_endpoint(&spec, messages, overrides).await {
                Ok((content, usage, finish_reason)) => {
                    let latency_ms = start.elapsed().as_millis() as u64;
                    self.record_success(index, latency_ms);
                    debug!(
                        endpoint = %spec.name,
                        latency_ms,
                        tokens = usage.total_tokens,
                        "completion ok"
                    );
                    return Ok(Completion {
                        content,
                        usage,
                        finish_reason,
                        endpoint: spec.name,
                        latency_ms,
                    });
                }
                Err(e) => {
                    self.record_failure(index, Instant::now());
                    warn!(endpoint = %spec.name, error = %e, "completion failed");
                    failures.push(format!("{}: {}", spec.name, e));
                }
            }
        }

        Err(LlmError::AllEndpointsFailed {
            attempts: failures.len(),
            detail: failures.join("; "),
        })
    }
}

/// Weighted random permutation without replacement.
fn weighted_order(mut pool: Vec<(usize, f64)>) -> Vec<usize> {
    let mut rng = rand::thread_rng();
    let mut order = Vec::with_capacity(pool.len());
    while !pool.is_empty() {
        let total: f64 = pool.iter().map(|(_, w)| w.max(0.0)).sum();
        let picked = if total <= 0.0 {
            0
        } else {
            let mut roll = rng.gen_range(0.0..total);
            let mut picked = pool.len() - 1;
            for (i, (_, w)) in pool.iter().enumerate() {
                let w = w.max(0.0);
                if roll < w {
                    picked = i;
                    break;
                }
                roll -= w;
            }
            picked
        };
        order.push(pool.swap_remove(picked).0);
    }
    order
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let end = s
            .char_indices()
            .take_while(|(i, _)| *i < max)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...", &s[..end])
    }
}

// ============================================================================
// Wire types (OpenAI Chat Completions)
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: String,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}
