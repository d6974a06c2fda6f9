//! Environment-backed client configuration.

use crate::client::{Authentication, EndpointKind, OutputFormat, UspClient};
use crate::error::UspError;
use secrecy::{ExposeSecret, SecretString};
use std::env;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {variable}: {reason}")]
    InvalidValue { variable: String, reason: String },
}

/// Connection settings assembled from the environment. Intended for tools
/// and services that configure the client out of process; everything here
/// can also be set programmatically on [`UspClient`].
#[derive(Debug)]
pub struct ClientConfig {
    pub endpoint: String,
    pub endpoint_kind: EndpointKind,
    pub subscription_key: SecretString,
    pub language: Option<String>,
    pub output_format: Option<OutputFormat>,
    pub model_id: Option<String>,
}

impl ClientConfig {
    /// Loads configuration from `USP_*` environment variables, honoring a
    /// `.env` file when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // A missing .env file is fine

        let endpoint = require_var("USP_ENDPOINT")?;
        let subscription_key = require_var("USP_SUBSCRIPTION_KEY")?;

        let endpoint_kind = match env::var("USP_ENDPOINT_KIND") {
            Ok(value) => parse_var("USP_ENDPOINT_KIND", &value)?,
            Err(_) => EndpointKind::Default,
        };
        let output_format = match env::var("USP_OUTPUT_FORMAT") {
            Ok(value) => Some(parse_var("USP_OUTPUT_FORMAT", &value)?),
            Err(_) => None,
        };

        Ok(Self {
            endpoint,
            endpoint_kind,
            subscription_key: SecretString::from(subscription_key),
            language: env::var("USP_LANGUAGE").ok(),
            output_format,
            model_id: env::var("USP_MODEL_ID").ok(),
        })
    }

    /// The subscription key (use only when handing it to the client).
    pub fn subscription_key(&self) -> &str {
        self.subscription_key.expose_secret()
    }
}

fn require_var(name: &str) -> Result<String, ConfigError> {
    let value = env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            variable: name.to_string(),
            reason: "value cannot be empty".to_string(),
        });
    }
    Ok(value)
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr<Err = UspError>,
{
    value.parse().map_err(|e: UspError| ConfigError::InvalidValue {
        variable: name.to_string(),
        reason: e.to_string(),
    })
}

impl UspClient {
    /// Builds a client configured from `config`. The returned client still
    /// needs callbacks and `connect`.
    pub fn from_config(config: &ClientConfig) -> crate::Result<Self> {
        let client = UspClient::new();
        client.set_endpoint(&config.endpoint, config.endpoint_kind)?;
        client.set_auth(Authentication::SubscriptionKey(SecretString::from(
            config.subscription_key().to_string(),
        )))?;
        if let Some(language) = &config.language {
            client.set_language(language)?;
        }
        if let Some(format) = config.output_format {
            client.set_output_format(format)?;
        }
        if let Some(model_id) = &config.model_id {
            client.set_model_id(model_id)?;
        }
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_kind_parses() {
        assert_eq!(
            parse_var::<EndpointKind>("USP_ENDPOINT_KIND", "cdsdk").unwrap(),
            EndpointKind::CdSdk
        );
        assert!(parse_var::<EndpointKind>("USP_ENDPOINT_KIND", "fancy").is_err());
    }

    #[test]
    fn test_output_format_parses() {
        assert_eq!(
            parse_var::<OutputFormat>("USP_OUTPUT_FORMAT", "detailed").unwrap(),
            OutputFormat::Detailed
        );
    }
}
