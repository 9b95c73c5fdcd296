/*
 *
 * Copyright 2026 roam authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Parsing and lookup of the JSON service config document.
//!
//! Recognized keys: `loadBalancingConfig`, `methodConfig` (with `name`,
//! `timeout`, `waitForReady`, message-size caps and `retryPolicy` /
//! `hedgingPolicy`), and `retryThrottling`. Unknown fields are ignored
//! everywhere.

use std::str::FromStr;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::Code;

/// Largest `maxAttempts` honored in a retry or hedging policy.
const MAX_ATTEMPTS_CAP: u32 = 5;

/// A parsed, validated service config.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// The first entry of `loadBalancingConfig` whose policy name is
    /// registered: `(name, raw config)`.
    pub(crate) lb_policy: Option<(String, serde_json::Value)>,
    pub(crate) method_configs: Vec<MethodConfig>,
    pub(crate) retry_throttling: Option<RetryThrottlingConfig>,
}

/// Per-method settings, selected by `{service, method}` with fallbacks to
/// service-wide and config-wide entries.
#[derive(Debug, Clone, Default)]
pub struct MethodConfig {
    names: Vec<MethodName>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) wait_for_ready: Option<bool>,
    pub(crate) max_request_message_bytes: Option<usize>,
    pub(crate) max_response_message_bytes: Option<usize>,
    pub(crate) retry_policy: Option<RetryPolicy>,
    /// Parsed and validated, but not executed by this client.
    #[allow(dead_code)]
    pub(crate) hedging_policy: Option<HedgingPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct MethodName {
    service: String,
    method: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    pub(crate) max_attempts: u32,
    pub(crate) initial_backoff: Duration,
    pub(crate) max_backoff: Duration,
    pub(crate) backoff_multiplier: f64,
    pub(crate) retryable_status_codes: Vec<Code>,
}

#[derive(Debug, Clone)]
pub(crate) struct HedgingPolicy {
    #[allow(dead_code)]
    pub(crate) max_attempts: u32,
    #[allow(dead_code)]
    pub(crate) hedging_delay: Option<Duration>,
    #[allow(dead_code)]
    pub(crate) non_fatal_status_codes: Vec<Code>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RetryThrottlingConfig {
    pub(crate) max_tokens: f64,
    pub(crate) token_ratio: f64,
}

impl ServiceConfig {
    /// Parses and validates a service config JSON document.
    pub fn parse(json: &str) -> Result<ServiceConfig, String> {
        let raw: RawServiceConfig =
            serde_json::from_str(json).map_err(|e| format!("invalid service config: {e}"))?;
        raw.validate()
    }

    /// Looks up the method config for `/service/method`, most specific
    /// entry first: exact match, then service-wide, then the config-wide
    /// default (an entry with an empty service).
    pub(crate) fn method_config(&self, service: &str, method: &str) -> Option<&MethodConfig> {
        let mut service_level: Option<&MethodConfig> = None;
        let mut default_level: Option<&MethodConfig> = None;
        for config in &self.method_configs {
            for name in &config.names {
                if name.service == service {
                    match &name.method {
                        Some(m) if m == method => return Some(config),
                        None => service_level = service_level.or(Some(config)),
                        _ => {}
                    }
                } else if name.service.is_empty() && name.method.is_none() {
                    default_level = default_level.or(Some(config));
                }
            }
        }
        service_level.or(default_level)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawServiceConfig {
    load_balancing_config: Vec<serde_json::Map<String, serde_json::Value>>,
    method_config: Vec<RawMethodConfig>,
    retry_throttling: Option<RawRetryThrottling>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawMethodConfig {
    name: Vec<RawMethodName>,
    timeout: Option<String>,
    wait_for_ready: Option<bool>,
    max_request_message_bytes: Option<u64>,
    max_response_message_bytes: Option<u64>,
    retry_policy: Option<RawRetryPolicy>,
    hedging_policy: Option<RawHedgingPolicy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawMethodName {
    service: String,
    method: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawRetryPolicy {
    max_attempts: u32,
    initial_backoff: Option<String>,
    max_backoff: Option<String>,
    backoff_multiplier: f64,
    retryable_status_codes: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawHedgingPolicy {
    max_attempts: u32,
    hedging_delay: Option<String>,
    non_fatal_status_codes: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawRetryThrottling {
    max_tokens: f64,
    token_ratio: f64,
}

impl RawServiceConfig {
    fn validate(self) -> Result<ServiceConfig, String> {
        let mut lb_policy = None;
        for entry in &self.load_balancing_config {
            if entry.len() != 1 {
                return Err(
                    "loadBalancingConfig entries must contain exactly one policy".to_string()
                );
            }
            let (name, config) = entry.iter().next().expect("len checked above");
            if crate::client::load_balancing::GLOBAL_LB_REGISTRY
                .get(name)
                .is_some()
            {
                lb_policy = Some((name.clone(), config.clone()));
                break;
            }
        }
        if lb_policy.is_none() && !self.load_balancing_config.is_empty() {
            return Err("no supported policy in loadBalancingConfig".to_string());
        }

        let mut method_configs = Vec::with_capacity(self.method_config.len());
        for raw in self.method_config {
            if raw.name.is_empty() {
                return Err("methodConfig entry with no name".to_string());
            }
            let mut names = Vec::with_capacity(raw.name.len());
            for name in raw.name {
                if name.service.is_empty() && name.method.is_some() {
                    return Err("methodConfig name with a method but no service".to_string());
                }
                names.push(MethodName {
                    service: name.service,
                    method: name.method.filter(|m| !m.is_empty()),
                });
            }
            method_configs.push(MethodConfig {
                names,
                timeout: raw.timeout.as_deref().map(parse_duration).transpose()?,
                wait_for_ready: raw.wait_for_ready,
                max_request_message_bytes: raw.max_request_message_bytes.map(|v| v as usize),
                max_response_message_bytes: raw.max_response_message_bytes.map(|v| v as usize),
                retry_policy: raw.retry_policy.map(validate_retry_policy).transpose()?,
                hedging_policy: raw.hedging_policy.map(validate_hedging_policy).transpose()?,
            });
        }

        let retry_throttling = match self.retry_throttling {
            Some(raw) => {
                if raw.max_tokens <= 0.0 || raw.max_tokens > 1000.0 {
                    return Err("retryThrottling.maxTokens must be in (0, 1000]".to_string());
                }
                if raw.token_ratio <= 0.0 {
                    return Err("retryThrottling.tokenRatio must be positive".to_string());
                }
                Some(RetryThrottlingConfig {
                    max_tokens: raw.max_tokens,
                    token_ratio: raw.token_ratio,
                })
            }
            None => None,
        };

        Ok(ServiceConfig {
            lb_policy,
            method_configs,
            retry_throttling,
        })
    }
}

fn validate_retry_policy(raw: RawRetryPolicy) -> Result<RetryPolicy, String> {
    if raw.max_attempts < 2 {
        return Err("retryPolicy.maxAttempts must be at least 2".to_string());
    }
    let initial_backoff = parse_duration(
        raw.initial_backoff
            .as_deref()
            .ok_or("retryPolicy.initialBackoff is required")?,
    )?;
    let max_backoff = parse_duration(
        raw.max_backoff
            .as_deref()
            .ok_or("retryPolicy.maxBackoff is required")?,
    )?;
    if initial_backoff.is_zero() || max_backoff.is_zero() {
        return Err("retryPolicy backoffs must be positive".to_string());
    }
    if raw.backoff_multiplier <= 0.0 {
        return Err("retryPolicy.backoffMultiplier must be positive".to_string());
    }
    if raw.retryable_status_codes.is_empty() {
        return Err("retryPolicy.retryableStatusCodes must be non-empty".to_string());
    }
    Ok(RetryPolicy {
        max_attempts: raw.max_attempts.min(MAX_ATTEMPTS_CAP),
        initial_backoff,
        max_backoff,
        backoff_multiplier: raw.backoff_multiplier,
        retryable_status_codes: parse_codes(&raw.retryable_status_codes)?,
    })
}

fn validate_hedging_policy(raw: RawHedgingPolicy) -> Result<HedgingPolicy, String> {
    if raw.max_attempts < 2 {
        return Err("hedgingPolicy.maxAttempts must be at least 2".to_string());
    }
    Ok(HedgingPolicy {
        max_attempts: raw.max_attempts.min(MAX_ATTEMPTS_CAP),
        hedging_delay: raw.hedging_delay.as_deref().map(parse_duration).transpose()?,
        non_fatal_status_codes: parse_codes(&raw.non_fatal_status_codes)?,
    })
}

fn parse_codes(names: &[String]) -> Result<Vec<Code>, String> {
    names.iter().map(|name| Code::from_str(name)).collect()
}

/// Parses a protobuf-JSON duration string: decimal seconds suffixed with
/// `s`, e.g. `"1.5s"`.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let digits = s
        .strip_suffix('s')
        .ok_or_else(|| format!("invalid duration {s:?}: missing 's' suffix"))?;
    let seconds: f64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("invalid duration {s:?}"));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// The client-side retry throttle: a token bucket shared by all methods
/// on a channel. Retries are only permitted while more than half the
/// tokens remain.
#[derive(Debug)]
pub(crate) struct RetryThrottler {
    max_tokens: f64,
    token_ratio: f64,
    tokens: Mutex<f64>,
}

impl RetryThrottler {
    pub(crate) fn new(config: RetryThrottlingConfig) -> Self {
        RetryThrottler {
            max_tokens: config.max_tokens,
            token_ratio: config.token_ratio,
            tokens: Mutex::new(config.max_tokens),
        }
    }

    /// Records a throttled failure; returns whether a retry is permitted.
    pub(crate) fn on_failure(&self) -> bool {
        let mut tokens = self.tokens.lock();
        *tokens = (*tokens - 1.0).max(0.0);
        *tokens > self.max_tokens / 2.0
    }

    pub(crate) fn on_success(&self) {
        let mut tokens = self.tokens.lock();
        *tokens = (*tokens + self.token_ratio).min(self.max_tokens);
    }

    #[cfg(test)]
    fn tokens(&self) -> f64 {
        *self.tokens.lock()
    }
}

impl FromStr for Code {
    type Err = String;

    /// Parses either a canonical code name (`"UNAVAILABLE"`) or its
    /// integer value.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(i) = s.parse::<i32>() {
            if (0..=16).contains(&i) {
                return Ok(Code::from_i32(i));
            }
            return Err(format!("unknown status code {s:?}"));
        }
        Ok(match s {
            "OK" => Code::Ok,
            "CANCELLED" => Code::Cancelled,
            "UNKNOWN" => Code::Unknown,
            "INVALID_ARGUMENT" => Code::InvalidArgument,
            "DEADLINE_EXCEEDED" => Code::DeadlineExceeded,
            "NOT_FOUND" => Code::NotFound,
            "ALREADY_EXISTS" => Code::AlreadyExists,
            "PERMISSION_DENIED" => Code::PermissionDenied,
            "RESOURCE_EXHAUSTED" => Code::ResourceExhausted,
            "FAILED_PRECONDITION" => Code::FailedPrecondition,
            "ABORTED" => Code::Aborted,
            "OUT_OF_RANGE" => Code::OutOfRange,
            "UNIMPLEMENTED" => Code::Unimplemented,
            "INTERNAL" => Code::Internal,
            "UNAVAILABLE" => Code::Unavailable,
            "DATA_LOSS" => Code::DataLoss,
            "UNAUTHENTICATED" => Code::Unauthenticated,
            _ => return Err(format!("unknown status code {s:?}")),
        })
    }
}
