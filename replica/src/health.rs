//! Process health shared by every component that can fail or must refuse to proceed.

use std::fmt::Display;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HealthState {
    #[default]
    Healthy,
    /// The first fatal cause observed; later causes are only logged.
    Unhealthy(String),
}

/// Handle to the shared health flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct Health {
    state: Arc<RwLock<HealthState>>,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HealthState {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.state(), HealthState::Healthy)
    }

    /// Flip the flag. Never goes back to healthy in-process.
    pub fn mark_unhealthy(&self, cause: impl Display) {
        let cause = cause.to_string();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match &*state {
            HealthState::Healthy => {
                log::error!("marking process unhealthy: {}", cause);
                *state = HealthState::Unhealthy(cause);
            }
            HealthState::Unhealthy(first) => {
                log::warn!("already unhealthy ({}), further cause: {}", first, cause);
            }
        }
    }

    pub fn ensure_healthy(&self) -> Result<()> {
        match self.state() {
            HealthState::Healthy => Ok(()),
            HealthState::Unhealthy(cause) => Err(Error::Unhealthy(cause)),
        }
    }
}
