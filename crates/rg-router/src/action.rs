//! Actions - message mutation steps run at the pre-processing,
//! post-processing and post-receiving stages
//!
//! A list of actions runs in order. While executing, an action may:
//! - `stop()` the pipeline for the current message
//! - `route(message)` a new message, which continues from the next action
//!   of the same list
//!
//! Every message leaving a pipeline ends up delivered, halted or failed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use regex::Regex;
use rg_common::{GatewayError, Message, Result};
use serde_json::Value;
use tracing::{debug, warn};

/// Per-message execution context handed to every action
#[derive(Debug, Default)]
pub struct Execution {
    stopped: bool,
    routed: Vec<Message>,
}

impl Execution {
    /// Halt the pipeline for the current message after this action
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Inject a new message that continues from the next action
    pub fn route(&mut self, message: Message) {
        self.routed.push(message);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, message: &mut Message, execution: &mut Execution) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ReplaceRule {
    pub pattern: String,
    pub replacement: String,
    regex: Regex,
}

impl PartialEq for ReplaceRule {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.replacement == other.replacement
    }
}

#[derive(Clone)]
pub enum Action {
    /// Prepend `prefix` unless the value already starts with it
    AddPrefix { field: String, prefix: String },
    /// Append `suffix` unless the value already ends with it
    AddSuffix { field: String, suffix: String },
    /// Right-pad the value with spaces up to `length` characters
    AddSpaces { field: String, length: usize },
    /// Join the non-empty values of `fields` into `dest_field`
    Concat { fields: Vec<String>, separator: String, dest_field: String },
    Copy { from: String, to: String, delete_from: bool },
    /// Parse the JSON object held in `field` and merge its keys into the message
    JsonParser { field: String },
    Remove { field: String },
    /// Regex replace-all, rules applied in order
    Replace { field: String, rules: Vec<ReplaceRule> },
    /// Set `field` to a fixed value
    Update { field: String, value: Value },
    Custom { name: String, handler: Arc<dyn ActionHandler> },
}

impl Action {
    pub fn add_prefix(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Action::AddPrefix { field: field.into(), prefix: prefix.into() }
    }

    pub fn add_suffix(field: impl Into<String>, suffix: impl Into<String>) -> Self {
        Action::AddSuffix { field: field.into(), suffix: suffix.into() }
    }

    pub fn add_spaces(field: impl Into<String>, length: usize) -> Result<Self> {
        if length < 1 {
            return Err(GatewayError::invalid_argument("add-spaces length must be positive"));
        }
        Ok(Action::AddSpaces { field: field.into(), length })
    }

    pub fn concat(
        fields: Vec<String>,
        separator: impl Into<String>,
        dest_field: impl Into<String>,
    ) -> Result<Self> {
        let dest_field = dest_field.into();
        if dest_field.is_empty() {
            return Err(GatewayError::invalid_argument("concat destination field not provided"));
        }
        Ok(Action::Concat { fields, separator: separator.into(), dest_field })
    }

    pub fn copy(from: impl Into<String>, to: impl Into<String>, delete_from: bool) -> Self {
        Action::Copy { from: from.into(), to: to.into(), delete_from }
    }

    pub fn json_parser(field: impl Into<String>) -> Self {
        Action::JsonParser { field: field.into() }
    }

    pub fn remove(field: impl Into<String>) -> Self {
        Action::Remove { field: field.into() }
    }

    /// Build a replace action from an ordered pattern -> replacement map
    pub fn replace(field: impl Into<String>, replace: IndexMap<String, String>) -> Result<Self> {
        let mut rules = Vec::with_capacity(replace.len());
        for (pattern, replacement) in replace {
            let regex = Regex::new(&pattern).map_err(|e| {
                GatewayError::invalid_argument(format!("invalid replace pattern '{}': {}", pattern, e))
            })?;
            rules.push(ReplaceRule { pattern, replacement, regex });
        }
        Ok(Action::Replace { field: field.into(), rules })
    }

    pub fn update(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Action::Update { field: field.into(), value: value.into() }
    }

    pub fn custom(name: impl Into<String>, handler: impl ActionHandler + 'static) -> Self {
        Action::Custom { name: name.into(), handler: Arc::new(handler) }
    }

    pub async fn execute(&self, message: &mut Message, execution: &mut Execution) -> anyhow::Result<()> {
        match self {
            Action::AddPrefix { field, prefix } => {
                let value = message.get_string(field).unwrap_or_default();
                if !value.starts_with(prefix.as_str()) {
                    message.set_property(field.clone(), format!("{}{}", prefix, value));
                }
            }
            Action::AddSuffix { field, suffix } => {
                let value = message.get_string(field).unwrap_or_default();
                if !value.ends_with(suffix.as_str()) {
                    message.set_property(field.clone(), format!("{}{}", value, suffix));
                }
            }
            Action::AddSpaces { field, length } => {
                let value = message.get_string(field).unwrap_or_default();
                let current = value.chars().count();
                if current < *length {
                    let padded = format!("{}{}", value, " ".repeat(length - current));
                    message.set_property(field.clone(), padded);
                }
            }
            Action::Concat { fields, separator, dest_field } => {
                let parts: Vec<String> = fields
                    .iter()
                    .filter_map(|f| message.get_string(f))
                    .filter(|v| !v.is_empty())
                    .collect();
                message.set_property(dest_field.clone(), parts.join(separator));
            }
            Action::Copy { from, to, delete_from } => {
                if let Some(value) = message.get_property(from).filter(|v| !v.is_null()).cloned() {
                    message.set_property(to.clone(), value);
                    if *delete_from {
                        message.remove_property(from);
                    }
                }
            }
            Action::JsonParser { field } => {
                if let Some(raw) = message.get_str(field).map(str::to_string) {
                    match serde_json::from_str::<Value>(&raw) {
                        Ok(Value::Object(map)) => {
                            for (key, value) in map {
                                message.set_property(key, value);
                            }
                        }
                        Ok(_) => warn!(field = %field, "Property is valid JSON but not an object"),
                        Err(e) => warn!(field = %field, error = %e, "Could not parse JSON property"),
                    }
                }
            }
            Action::Remove { field } => {
                message.remove_property(field);
            }
            Action::Replace { field, rules } => {
                if let Some(mut value) = message.get_string(field) {
                    for rule in rules {
                        value = rule.regex.replace_all(&value, rule.replacement.as_str()).into_owned();
                    }
                    message.set_property(field.clone(), value);
                }
            }
            Action::Update { field, value } => {
                message.set_property(field.clone(), value.clone());
            }
            Action::Custom { handler, .. } => {
                handler.execute(message, execution).await?;
            }
        }
        Ok(())
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        use Action::*;
        match (self, other) {
            (AddPrefix { field: f1, prefix: p1 }, AddPrefix { field: f2, prefix: p2 }) => f1 == f2 && p1 == p2,
            (AddSuffix { field: f1, suffix: s1 }, AddSuffix { field: f2, suffix: s2 }) => f1 == f2 && s1 == s2,
            (AddSpaces { field: f1, length: l1 }, AddSpaces { field: f2, length: l2 }) => f1 == f2 && l1 == l2,
            (
                Concat { fields: f1, separator: s1, dest_field: d1 },
                Concat { fields: f2, separator: s2, dest_field: d2 },
            ) => f1 == f2 && s1 == s2 && d1 == d2,
            (
                Copy { from: f1, to: t1, delete_from: d1 },
                Copy { from: f2, to: t2, delete_from: d2 },
            ) => f1 == f2 && t1 == t2 && d1 == d2,
            (JsonParser { field: f1 }, JsonParser { field: f2 }) => f1 == f2,
            (Remove { field: f1 }, Remove { field: f2 }) => f1 == f2,
            (Replace { field: f1, rules: r1 }, Replace { field: f2, rules: r2 }) => f1 == f2 && r1 == r2,
            (Update { field: f1, value: v1 }, Update { field: f2, value: v2 }) => f1 == f2 && v1 == v2,
            (Custom { name: n1, .. }, Custom { name: n2, .. }) => n1 == n2,
            _ => false,
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::AddPrefix { field, prefix } => write!(f, "AddPrefix({}, {:?})", field, prefix),
            Action::AddSuffix { field, suffix } => write!(f, "AddSuffix({}, {:?})", field, suffix),
            Action::AddSpaces { field, length } => write!(f, "AddSpaces({}, {})", field, length),
            Action::Concat { fields, separator, dest_field } => {
                write!(f, "Concat({:?} -> {} by {:?})", fields, dest_field, separator)
            }
            Action::Copy { from, to, delete_from } => {
                write!(f, "Copy({} -> {}, delete_from={})", from, to, delete_from)
            }
            Action::JsonParser { field } => write!(f, "JsonParser({})", field),
            Action::Remove { field } => write!(f, "Remove({})", field),
            Action::Replace { field, rules } => {
                let pairs: Vec<(&str, &str)> = rules
                    .iter()
                    .map(|r| (r.pattern.as_str(), r.replacement.as_str()))
                    .collect();
                write!(f, "Replace({}, {:?})", field, pairs)
            }
            Action::Update { field, value } => write!(f, "Update({} = {})", field, value),
            Action::Custom { name, .. } => write!(f, "Custom({})", name),
        }
    }
}

/// Where each message ended up after running an action list
#[derive(Debug, Default)]
pub struct PipelineOutcome {
    /// Ran through every action; continue processing
    pub delivered: Vec<Message>,
    /// An action called `stop()`
    pub halted: Vec<Message>,
    /// An action returned an error
    pub failed: Vec<(Message, anyhow::Error)>,
}

impl PipelineOutcome {
    pub fn total(&self) -> usize {
        self.delivered.len() + self.halted.len() + self.failed.len()
    }
}

/// Run `actions` over `message`. Messages routed by an action are queued
/// and continue from the action after the one that routed them.
pub async fn run_actions(actions: &[Action], message: Message) -> PipelineOutcome {
    let mut outcome = PipelineOutcome::default();
    let mut pending: VecDeque<(Message, usize)> = VecDeque::new();
    pending.push_back((message, 0));

    'messages: while let Some((mut message, start)) = pending.pop_front() {
        for (index, action) in actions.iter().enumerate().skip(start) {
            let mut execution = Execution::default();
            let result = action.execute(&mut message, &mut execution).await;

            for routed in execution.routed.drain(..) {
                debug!(action = ?action, reference = %routed.reference, "Action routed a new message");
                pending.push_back((routed, index + 1));
            }

            if let Err(e) = result {
                warn!(action = ?action, reference = %message.reference, error = %e, "Action failed");
                outcome.failed.push((message, e));
                continue 'messages;
            }
            if execution.is_stopped() {
                debug!(action = ?action, reference = %message.reference, "Action stopped the pipeline");
                outcome.halted.push(message);
                continue 'messages;
            }
        }
        outcome.delivered.push(message);
    }

    outcome
}

/// Add to an action list, rejecting configuration-equal duplicates
pub fn add_unique<T: PartialEq + fmt::Debug>(list: &mut Vec<T>, item: T, kind: &str) -> Result<()> {
    if list.contains(&item) {
        return Err(GatewayError::already_exists(kind, format!("{:?}", item)));
    }
    list.push(item);
    Ok(())
}

/// Remove a configuration-equal entry
pub fn remove_existing<T: PartialEq + fmt::Debug>(list: &mut Vec<T>, item: &T, kind: &str) -> Result<()> {
    match list.iter().position(|existing| existing == item) {
        Some(index) => {
            list.remove(index);
            Ok(())
        }
        None => Err(GatewayError::not_found(kind, format!("{:?}", item))),
    }
}
