//! The typed configuration surface.
//!
//! Internally configuration is plain structs validated at construction;
//! the JSON document (the gRPC service-config shape) only exists at the
//! system boundary, produced and consumed by [`ClientConfig::to_json`] and
//! [`ClientConfig::from_json`].

use crate::{ConfigError, RetryPolicy, RetryThrottle, ServiceName};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tonic::Code;

/// How outbound calls are spread over the healthy endpoint set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicy {
    /// Uniform selection over the healthy set.
    #[default]
    Random,
    /// Strict rotation over the healthy set.
    RoundRobin,
    /// The endpoint with the fewest in-flight attempts.
    LeastLoaded,
}

/// Names one service a [`MethodConfig`] applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodName {
    /// `package.Service`.
    pub service: String,
}

/// Retry parameters in boundary form. Converted into a validated
/// [`RetryPolicy`] before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicyConfig {
    /// Total attempts including the initial call, so `2` means one retry.
    pub max_attempts: u32,
    #[serde(with = "go_duration")]
    pub initial_backoff: Duration,
    #[serde(with = "go_duration")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Numeric gRPC status codes, e.g. `[14]` for UNAVAILABLE.
    pub retryable_status_codes: Vec<i32>,
}

impl TryFrom<&RetryPolicyConfig> for RetryPolicy {
    type Error = ConfigError;

    fn try_from(config: &RetryPolicyConfig) -> Result<Self, Self::Error> {
        let mut codes = Vec::with_capacity(config.retryable_status_codes.len());
        for code in &config.retryable_status_codes {
            if !(0..=16).contains(code) {
                return Err(ConfigError::InvalidStatusCode(*code));
            }
            codes.push(Code::from(*code));
        }

        RetryPolicy::new(
            config.max_attempts,
            config.initial_backoff,
            config.max_backoff,
            config.backoff_multiplier,
            codes,
        )
    }
}

/// Per-service call settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodConfig {
    /// The services this entry applies to. An empty list is a catch-all.
    #[serde(default)]
    pub name: Vec<MethodName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicyConfig>,
    /// Whether calls should wait for a healthy endpoint instead of failing
    /// immediately on an empty set.
    #[serde(default)]
    pub wait_for_ready: bool,
    /// Per-call deadline, spanning every attempt of the call.
    #[serde(
        default,
        with = "go_duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_request_message_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_message_bytes: Option<usize>,
}

/// Bounds aggregate retry volume; see
/// [`RetryThrottle`](crate::RetryThrottle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryThrottlingConfig {
    /// In (0, 1000].
    pub max_tokens: u32,
    /// In (0, 1].
    pub token_ratio: f64,
}

/// Which service name health checks are issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// `package.Service`; empty queries overall server health.
    pub service_name: String,
}

/// Everything a [`BalancedClient`](crate::BalancedClient) needs to know
/// about how to call a service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default)]
    pub load_balancing_policy: LoadBalancingPolicy,
    #[serde(default)]
    pub method_config: Vec<MethodConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_throttling: Option<RetryThrottlingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_config: Option<HealthCheckConfig>,
}

impl ClientConfig {
    /// The battle-tested defaults: random balancing, three attempts with a
    /// flat 100ms backoff on UNAVAILABLE, a 1.5s call deadline,
    /// wait-for-ready, 1 GiB message ceilings and a full retry-throttling
    /// bucket.
    pub fn recommended(service: &ServiceName) -> Self {
        Self {
            load_balancing_policy: LoadBalancingPolicy::Random,
            method_config: vec![MethodConfig {
                name: vec![MethodName {
                    service: service.to_string(),
                }],
                retry_policy: Some(RetryPolicyConfig {
                    max_attempts: 3,
                    initial_backoff: Duration::from_millis(100),
                    max_backoff: Duration::from_secs(1),
                    backoff_multiplier: 1.0,
                    retryable_status_codes: vec![Code::Unavailable as i32],
                }),
                wait_for_ready: true,
                timeout: Some(Duration::from_millis(1500)),
                max_request_message_bytes: Some(1024 * 1024 * 1024),
                max_response_message_bytes: Some(1024 * 1024 * 1024),
            }],
            retry_throttling: Some(RetryThrottlingConfig {
                max_tokens: 1000,
                token_ratio: 1.0,
            }),
            health_check_config: Some(HealthCheckConfig {
                service_name: service.to_string(),
            }),
        }
    }

    /// The method config entry applying to `service`: an exact name match
    /// first, then a catch-all entry with an empty name list.
    pub fn method_config_for(&self, service: &ServiceName) -> Option<&MethodConfig> {
        self.method_config
            .iter()
            .find(|method| {
                method
                    .name
                    .iter()
                    .any(|name| name.service == service.as_str())
            })
            .or_else(|| self.method_config.iter().find(|method| method.name.is_empty()))
    }

    /// Check every invariant the typed fields cannot express on their own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for method in &self.method_config {
            for name in &method.name {
                if name.service.is_empty() {
                    return Err(ConfigError::EmptyMethodName);
                }
            }
            if let Some(retry_policy) = &method.retry_policy {
                RetryPolicy::try_from(retry_policy)?;
            }
        }

        if let Some(throttling) = &self.retry_throttling {
            RetryThrottle::new(throttling.max_tokens, throttling.token_ratio)?;
        }

        Ok(())
    }

    /// Serialize to the wire-shaped JSON document.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse the wire-shaped JSON document. Call
    /// [`validate`](Self::validate) before using the result.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Go-style duration strings (`"0.1s"`, `"100ms"`, `"1m30s"`) at the JSON
/// boundary.
pub(crate) mod go_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(crate) fn parse(input: &str) -> Result<Duration, String> {
        let mut rest = input.trim();
        if rest.is_empty() {
            return Err("empty duration".to_string());
        }

        let mut total = Duration::ZERO;
        while !rest.is_empty() {
            let number_len = rest
                .find(|c: char| !c.is_ascii_digit() && c != '.')
                .ok_or_else(|| format!("missing unit in duration `{input}`"))?;
            if number_len == 0 {
                return Err(format!("invalid duration `{input}`"));
            }
            let (number, tail) = rest.split_at(number_len);
            let value: f64 = number
                .parse()
                .map_err(|_| format!("invalid number in duration `{input}`"))?;

            let unit_len = tail
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(tail.len());
            let (unit, next) = tail.split_at(unit_len);
            let unit_seconds = match unit {
                "ns" => 1e-9,
                "us" | "µs" => 1e-6,
                "ms" => 1e-3,
                "s" => 1.0,
                "m" => 60.0,
                "h" => 3600.0,
                _ => return Err(format!("unknown unit `{unit}` in duration `{input}`")),
            };

            let segment = Duration::try_from_secs_f64(value * unit_seconds)
                .map_err(|_| format!("duration `{input}` out of range"))?;
            total = total
                .checked_add(segment)
                .ok_or_else(|| format!("duration `{input}` out of range"))?;
            rest = next;
        }

        Ok(total)
    }

    pub(crate) fn format(duration: Duration) -> String {
        if duration < Duration::from_secs(1) && duration.subsec_nanos() % 1_000_000 == 0 {
            return format!("{}ms", duration.subsec_millis());
        }
        format!("{}s", duration.as_secs_f64())
    }

    pub(crate) fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*duration))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub(crate) mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub(crate) fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(duration) => serializer.serialize_str(&super::format(*duration)),
                None => serializer.serialize_none(),
            }
        }

        pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|raw| super::parse(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
