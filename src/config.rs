use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::LLMError;

/// Options recognized for every provider instance.
///
/// The core never reads a provider's configuration; it only parses and validates
/// the shared option set so that misspelled or unsupported options fail at
/// construction time instead of being silently ignored.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use llm_switchboard::config::ProviderConfig;
///
/// let config = ProviderConfig::from_json_str(r#"{
///     "credential": { "type": "bearer", "token": "sk-test" },
///     "endpoint": "https://llm.internal/v1",
///     "defaultModel": "m1",
///     "requestTimeout": "30s"
/// }"#).unwrap();
/// assert_eq!(config.default_model.as_deref(), Some("m1"));
/// assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
///
/// let err = ProviderConfig::from_json_str(r#"{ "temprature": 0.2 }"#).unwrap_err();
/// assert_eq!(err.kind(), llm_switchboard::error::ErrorKind::InvalidRequest);
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Authentication material.
    #[serde(default)]
    pub credential: Credential,
    /// Base URL override.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Model used by adapters when they need one and the request does not pin it.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Upper bound for a single call; strings such as `"30s"` or integer milliseconds.
    #[serde(default, deserialize_with = "deserialize_timeout")]
    pub request_timeout: Option<Duration>,
}

impl ProviderConfig {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            ..Self::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Parses and validates a JSON configuration value.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidRequest` error for unknown options, malformed values, or a
    /// configuration that fails [`ProviderConfig::validate`].
    pub fn from_value(value: Value) -> Result<Self, LLMError> {
        let config: Self = serde_json::from_value(value).map_err(|err| {
            LLMError::invalid_request(format!("invalid provider configuration: {err}"))
                .with_source(err)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self, LLMError> {
        let config: Self = serde_json::from_str(text).map_err(|err| {
            LLMError::invalid_request(format!("invalid provider configuration: {err}"))
                .with_source(err)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values serde cannot express.
    pub fn validate(&self) -> Result<(), LLMError> {
        if let Some(endpoint) = &self.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(LLMError::invalid_request(format!(
                    "endpoint must be an http(s) URL, got {endpoint}"
                )));
            }
        }
        if let Some(model) = &self.default_model {
            if model.trim().is_empty() {
                return Err(LLMError::invalid_request("defaultModel must not be empty"));
            }
        }
        if self.request_timeout == Some(Duration::ZERO) {
            return Err(LLMError::invalid_request(
                "requestTimeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Authentication material. Secrets are redacted from `Debug` output.
#[derive(Debug, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Credential {
    /// Static API key sent in a header.
    ApiKey {
        #[serde(deserialize_with = "deserialize_secret")]
        key: SecretString,
        /// Header name; adapters fall back to their own default when absent.
        #[serde(default)]
        header: Option<String>,
    },
    /// Bearer token for the `Authorization` header.
    Bearer {
        #[serde(deserialize_with = "deserialize_secret")]
        token: SecretString,
    },
    /// Local or otherwise unauthenticated provider.
    #[default]
    None,
}

impl Credential {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey {
            key: SecretString::from(key.into()),
            header: None,
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: SecretString::from(token.into()),
        }
    }

    /// Header name and value an HTTP adapter should send, if any.
    ///
    /// `default_key_header` is used for API keys configured without a header name.
    pub fn header(&self, default_key_header: &str) -> Option<(String, String)> {
        match self {
            Self::ApiKey { key, header } => Some((
                header
                    .clone()
                    .unwrap_or_else(|| default_key_header.to_string()),
                key.expose_secret().to_string(),
            )),
            Self::Bearer { token } => Some((
                "Authorization".to_string(),
                format!("Bearer {}", token.expose_secret()),
            )),
            Self::None => None,
        }
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if raw.is_empty() {
        return Err(D::Error::custom("credential must not be empty"));
    }
    Ok(SecretString::from(raw))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Millis(u64),
    Text(String),
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawDuration>::deserialize(deserializer)?;
    raw.map(|raw| match raw {
        RawDuration::Millis(millis) => Ok(Duration::from_millis(millis)),
        RawDuration::Text(text) => duration_str::parse(&text)
            .map_err(|err| D::Error::custom(format!("invalid duration '{text}': {err}"))),
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn parses_all_recognized_options() {
        let config = ProviderConfig::from_value(json!({
            "credential": { "type": "api_key", "key": "k-123", "header": "x-api-key" },
            "endpoint": "http://localhost:8080",
            "defaultModel": "local-7b",
            "requestTimeout": 1500
        }))
        .expect("config");

        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.default_model.as_deref(), Some("local-7b"));
        assert_eq!(config.request_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(
            config.credential.header("authorization"),
            Some(("x-api-key".to_string(), "k-123".to_string()))
        );
    }

    #[test]
    fn duration_strings_are_accepted() {
        let config = ProviderConfig::from_value(json!({ "requestTimeout": "1m" })).expect("config");
        assert_eq!(config.request_timeout, Some(Duration::from_secs(60)));

        let err = ProviderConfig::from_value(json!({ "requestTimeout": "soon" })).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn unknown_options_are_rejected() {
        let err = ProviderConfig::from_value(json!({
            "credential": { "type": "none" },
            "retries": 3
        }))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(err.message().contains("retries"), "{}", err.message());

        let err = ProviderConfig::from_value(json!({
            "credential": { "type": "bearer", "token": "t", "scope": "all" }
        }))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn semantic_validation_runs_after_parsing() {
        let err = ProviderConfig::from_value(json!({ "endpoint": "ftp://nope" })).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let err = ProviderConfig::from_value(json!({ "requestTimeout": 0 })).unwrap_err();
        assert!(err.message().contains("requestTimeout"));
    }

    #[test]
    fn credentials_are_redacted_in_debug_output() {
        let config = ProviderConfig::new(Credential::bearer("super-secret-token"));
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret-token"), "{rendered}");
        assert_eq!(
            config.credential.header("x-api-key"),
            Some((
                "Authorization".to_string(),
                "Bearer super-secret-token".to_string()
            ))
        );
    }

    #[test]
    fn missing_credential_defaults_to_none() {
        let config = ProviderConfig::from_value(json!({})).expect("config");
        assert!(matches!(config.credential, Credential::None));
        assert!(config.credential.header("x-api-key").is_none());
    }
}
