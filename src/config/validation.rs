use std::net::SocketAddr;

use eyre::Result;
use url::Url;

use crate::config::models::{CorsPolicy, NegotiationPolicy, ServerConfig, TlsConfig, TrustPolicy};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration, reporting every problem at once
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if let Err(mut tls_errors) = Self::validate_tls_config(&config.tls) {
            errors.append(&mut tls_errors);
        }

        if let Err(mut trust_errors) = Self::validate_trust_policy(&config.forwarded) {
            errors.append(&mut trust_errors);
        }

        if let Err(mut cors_errors) = Self::validate_cors_policy(&config.cors) {
            errors.append(&mut cors_errors);
        }

        if let Err(mut negotiation_errors) = Self::validate_negotiation(&config.negotiation) {
            errors.append(&mut negotiation_errors);
        }

        if let Err(e) = humantime::parse_duration(&config.shutdown_timeout) {
            errors.push(ValidationError::InvalidField {
                field: "shutdown_timeout".to_string(),
                message: format!("'{}' is not a duration: {e}", config.shutdown_timeout),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:8443' or '[::]:8443')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_tls_config(config: &TlsConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if config.credentials.is_empty() {
            errors.push(ValidationError::InvalidTls {
                message: "At least one credential (SNI name) must be configured".to_string(),
            });
        }

        for name in &config.credentials {
            if name.trim().is_empty() || name.contains('/') || name.contains("..") {
                errors.push(ValidationError::InvalidTls {
                    message: format!("Credential name '{name}' is not a valid host name"),
                });
            }
        }

        if config.certificate_dir.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "tls.certificate_dir".to_string(),
            });
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_trust_policy(policy: &TrustPolicy) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Some(secret) = &policy.secret {
            if secret.is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: "forwarded.secret".to_string(),
                    message: "An empty secret would match hops without one".to_string(),
                });
            }
        }

        for hop in &policy.skip_list {
            if hop.trim().is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: "forwarded.skip_list".to_string(),
                    message: "Hop identities must not be empty".to_string(),
                });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_cors_policy(policy: &CorsPolicy) -> Result<(), Vec<ValidationError>> {
        let errors: Vec<ValidationError> = policy
            .allowed_origins
            .iter()
            .filter(|origin| origin.as_str() != "*" && Url::parse(origin).is_err())
            .map(|origin| ValidationError::InvalidField {
                field: "cors.allowed_origins".to_string(),
                message: format!("'{origin}' is neither '*' nor a valid origin URL"),
            })
            .collect();

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_negotiation(policy: &NegotiationPolicy) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for (field, list) in [
            ("negotiation.media_types", &policy.media_types),
            ("negotiation.encodings", &policy.encodings),
            ("negotiation.languages", &policy.languages),
        ] {
            if list.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: field.to_string(),
                });
            }
        }

        for media_type in &policy.media_types {
            if !media_type.contains('/') {
                errors.push(ValidationError::InvalidField {
                    field: "negotiation.media_types".to_string(),
                    message: format!("'{media_type}' is not a type/subtype pair"),
                });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Format multiple validation errors into a readable message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
