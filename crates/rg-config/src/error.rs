//! Configuration error types

use std::io;

use rg_common::GatewayError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{component} '{name}' is missing required field '{field}'")]
    MissingField {
        component: &'static str,
        name: String,
        field: &'static str,
    },

    #[error("{component} '{name}' has invalid {field}: {message}")]
    InvalidValue {
        component: &'static str,
        name: String,
        field: &'static str,
        message: String,
    },

    #[error("processor id '{id}' is configured more than once")]
    DuplicateProcessor { id: String },

    /// A rule that the router refused to build
    #[error("processor '{processor}': {source}")]
    Rule {
        processor: String,
        #[source]
        source: GatewayError,
    },
}

impl ConfigError {
    pub fn missing_field(component: &'static str, name: impl Into<String>, field: &'static str) -> Self {
        Self::MissingField {
            component,
            name: name.into(),
            field,
        }
    }

    pub fn invalid_value(
        component: &'static str,
        name: impl Into<String>,
        field: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            component,
            name: name.into(),
            field,
            message: message.into(),
        }
    }

    pub fn rule(processor: impl Into<String>, source: GatewayError) -> Self {
        Self::Rule {
            processor: processor.into(),
            source,
        }
    }
}
