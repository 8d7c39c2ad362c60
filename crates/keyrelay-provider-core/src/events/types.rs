use std::time::{Duration, SystemTime};

use keyrelay_common::Service;
use serde::{Deserialize, Serialize};

use crate::DisableReason;

/// Key pool state transitions, broadcast to subscribers and sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    KeyDisabled(KeyDisabledEvent),
    KeyRateLimited(KeyRateLimitedEvent),
    KeyChecked(KeyCheckedEvent),
}

impl Event {
    pub fn service(&self) -> Service {
        match self {
            Event::KeyDisabled(ev) => ev.service,
            Event::KeyRateLimited(ev) => ev.service,
            Event::KeyChecked(ev) => ev.service,
        }
    }

    pub fn key_id(&self) -> &str {
        match self {
            Event::KeyDisabled(ev) => &ev.key_id,
            Event::KeyRateLimited(ev) => &ev.key_id,
            Event::KeyChecked(ev) => &ev.key_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyDisabledEvent {
    pub at: SystemTime,
    pub service: Service,
    pub key_id: String,
    pub reason: DisableReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRateLimitedEvent {
    pub at: SystemTime,
    pub service: Service,
    pub key_id: String,
    pub lockout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyCheckedEvent {
    pub at: SystemTime,
    pub service: Service,
    pub key_id: String,
    /// `None` when the check succeeded.
    pub failure: Option<String>,
}
