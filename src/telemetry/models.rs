use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fields::{push_history, remap_fields};
use super::{Result, TelemetryError};
use crate::serial::{DataBits, FlowControl, Parity, SerialConnectionConfig, StopBits};

/// One positional value of a telemetry line, optionally named by the user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Field {
    pub key: Option<String>,
    pub value: String,
}

impl Field {
    pub fn new(key: Option<String>, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    /// Blank entry used when a key is assigned beyond the current fields
    pub fn placeholder() -> Self {
        Self {
            key: None,
            value: String::new(),
        }
    }
}

/// Serial link lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkPhase {
    Closed,
    Opening,
    Open,
}

/// Configuration plus runtime state of the telemetry device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SerialDeviceState {
    pub device: String,
    pub config: SerialConnectionConfig,
    pub is_open: bool,
    pub history: VecDeque<String>,
    pub current_fields: Vec<Field>,
    pub last_line_at: Option<DateTime<Utc>>,
}

impl SerialDeviceState {
    pub fn new(config: SerialConnectionConfig) -> Self {
        Self {
            device: config.path.clone(),
            config,
            is_open: false,
            history: VecDeque::new(),
            current_fields: Vec::new(),
            last_line_at: None,
        }
    }

    /// Record one line: append to the bounded history and re-map fields
    pub fn ingest_line(&mut self, line: &str, history_limit: usize) {
        push_history(&mut self.history, line, history_limit);
        self.current_fields = remap_fields(&self.current_fields, line);
        self.last_line_at = Some(Utc::now());
    }

    /// Back to the closed state; configuration is kept
    pub fn reset_runtime(&mut self) {
        self.is_open = false;
        self.history.clear();
        self.current_fields.clear();
        self.last_line_at = None;
    }

    pub fn apply_patch(&mut self, patch: DeviceStatePatch) -> Result<()> {
        if patch.baud_rate == Some(0) {
            return Err(TelemetryError::InvalidConfiguration(
                "baud rate must be positive".to_string(),
            ));
        }

        if let Some(path) = patch.path {
            self.config.path = path;
            self.device = self.config.path.clone();
        }
        if let Some(baud_rate) = patch.baud_rate {
            self.config.baud_rate = baud_rate;
        }
        if let Some(data_bits) = patch.data_bits {
            self.config.data_bits = data_bits;
        }
        if let Some(stop_bits) = patch.stop_bits {
            self.config.stop_bits = stop_bits;
        }
        if let Some(parity) = patch.parity {
            self.config.parity = parity;
        }
        if let Some(flow_control) = patch.flow_control {
            self.config.flow_control = flow_control;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            serial: SerialSnapshot {
                is_open: self.is_open,
                fields: self.current_fields.clone(),
            },
        }
    }
}

/// Partial configuration update from the control plane
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatePatch {
    #[serde(alias = "device")]
    pub path: Option<String>,
    pub baud_rate: Option<u32>,
    pub data_bits: Option<DataBits>,
    pub stop_bits: Option<StopBits>,
    pub parity: Option<Parity>,
    pub flow_control: Option<FlowControl>,
}

/// Relay payload: `{ "serial": { "isOpen": .., "fields": [..] } }`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySnapshot {
    pub serial: SerialSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialSnapshot {
    #[serde(rename = "isOpen")]
    pub is_open: bool,
    pub fields: Vec<Field>,
}

impl TelemetrySnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Consumer-side check: JSON with a `serial` key is a snapshot, anything
    /// else is an opaque relay payload.
    pub fn from_frame_text(text: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        if value.get("serial").is_none() {
            return None;
        }
        serde_json::from_value(value).ok()
    }
}
