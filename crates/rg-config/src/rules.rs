//! Acceptor and action configuration
//!
//! Rules are tagged by `type` and turned into router values with `build()`.
//!
//! ```toml
//! [[processors.acceptors]]
//! type = "regexp"
//! field = "to"
//! pattern = "57\\d+"
//!
//! [[processors.pre_processing_actions]]
//! type = "replace"
//! field = "text"
//! replace = { "\\s+" = " " }
//! ```

use indexmap::IndexMap;
use rg_common::Result;
use rg_router::{Acceptor, Action};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AcceptorConfig {
    AcceptAll,
    ExactMatch {
        field: String,
        expression: String,
    },
    Regexp {
        field: String,
        pattern: String,
    },
    And {
        acceptors: Vec<AcceptorConfig>,
    },
}

impl AcceptorConfig {
    pub fn build(&self) -> Result<Acceptor> {
        match self {
            AcceptorConfig::AcceptAll => Ok(Acceptor::AcceptAll),
            AcceptorConfig::ExactMatch { field, expression } => {
                Ok(Acceptor::exact_match(field.clone(), expression.clone()))
            }
            AcceptorConfig::Regexp { field, pattern } => Acceptor::regexp(field.clone(), pattern.clone()),
            AcceptorConfig::And { acceptors } => {
                let built = acceptors.iter().map(AcceptorConfig::build).collect::<Result<Vec<_>>>()?;
                Ok(Acceptor::And(built))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    AddPrefix {
        field: String,
        prefix: String,
    },
    AddSuffix {
        field: String,
        suffix: String,
    },
    AddSpaces {
        field: String,
        length: usize,
    },
    Concat {
        fields: Vec<String>,
        #[serde(default)]
        separator: String,
        dest_field: String,
    },
    Copy {
        from: String,
        to: String,
        #[serde(default)]
        delete_from: bool,
    },
    JsonParser {
        field: String,
    },
    Remove {
        field: String,
    },
    Replace {
        field: String,
        replace: IndexMap<String, String>,
    },
    Update {
        field: String,
        value: Value,
    },
}

impl ActionConfig {
    pub fn build(&self) -> Result<Action> {
        Ok(match self {
            ActionConfig::AddPrefix { field, prefix } => Action::add_prefix(field.clone(), prefix.clone()),
            ActionConfig::AddSuffix { field, suffix } => Action::add_suffix(field.clone(), suffix.clone()),
            ActionConfig::AddSpaces { field, length } => Action::add_spaces(field.clone(), *length)?,
            ActionConfig::Concat {
                fields,
                separator,
                dest_field,
            } => Action::concat(fields.clone(), separator.clone(), dest_field.clone())?,
            ActionConfig::Copy { from, to, delete_from } => Action::copy(from.clone(), to.clone(), *delete_from),
            ActionConfig::JsonParser { field } => Action::json_parser(field.clone()),
            ActionConfig::Remove { field } => Action::remove(field.clone()),
            ActionConfig::Replace { field, replace } => Action::replace(field.clone(), replace.clone())?,
            ActionConfig::Update { field, value } => Action::update(field.clone(), value.clone()),
        })
    }
}
