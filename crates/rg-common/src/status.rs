use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Ok,
    Failed,
    Unknown,
}

/// Health snapshot reported by connectors, services and the supervisor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitorStatus {
    pub state: HealthState,
    pub message: Option<String>,
}

impl MonitorStatus {
    pub fn ok() -> Self {
        Self { state: HealthState::Ok, message: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: HealthState::Failed,
            message: Some(message.into()),
        }
    }

    pub fn unknown() -> Self {
        Self { state: HealthState::Unknown, message: None }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.state == HealthState::Ok
    }

    pub fn is_failed(&self) -> bool {
        self.state == HealthState::Failed
    }
}

impl Default for MonitorStatus {
    fn default() -> Self {
        Self::unknown()
    }
}
