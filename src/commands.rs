use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::serial::{self, SerialPortSummary};
use crate::telemetry::{DeviceStatePatch, Field, SerialDeviceState, TelemetryController};

/// Get the device configuration and runtime state
pub async fn get_device_state(
    controller: &TelemetryController,
) -> Result<SerialDeviceState, String> {
    Ok(controller.device_state())
}

/// Merge a partial configuration; it applies on the next open
pub async fn update_device_state(
    controller: &TelemetryController,
    patch: DeviceStatePatch,
) -> Result<SerialDeviceState, String> {
    controller
        .update_device_state(patch)
        .map_err(|e| format!("Failed to update device state: {}", e))
}

/// Open the device when closed, close it when open
pub async fn toggle_open(controller: &TelemetryController) -> Result<SerialDeviceState, String> {
    controller
        .try_toggle_open()
        .await
        .map_err(|e| format!("Failed to toggle serial device: {}", e))?;
    Ok(controller.device_state())
}

/// Name (or un-name with `None`) the field at `index`
pub async fn set_field_key(
    controller: &TelemetryController,
    index: usize,
    key: Option<String>,
) -> Result<Vec<Field>, String> {
    controller
        .set_field_key(index, key)
        .map_err(|e| format!("Failed to set field key: {}", e))
}

/// Serial ports present on this machine
pub async fn list_available_ports() -> Result<Vec<SerialPortSummary>, String> {
    tokio::task::spawn_blocking(serial::list_available_ports)
        .await
        .map_err(|e| format!("Port enumeration task failed: {}", e))?
        .map_err(|e| format!("Failed to list serial ports: {}", e))
}

/// One line of the control console
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum ControlRequest {
    GetDeviceState,
    UpdateDeviceState {
        #[serde(flatten)]
        patch: DeviceStatePatch,
    },
    ToggleOpen,
    SetFieldKey {
        index: usize,
        #[serde(default)]
        key: Option<String>,
    },
    ListPorts,
}

/// `{"ok":true,"data":..}` or `{"ok":false,"error":".."}`
#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    fn from_result<T: Serialize>(result: Result<T, String>) -> Self {
        match result.and_then(|data| {
            serde_json::to_value(data).map_err(|e| format!("Failed to encode response: {}", e))
        }) {
            Ok(data) => Self {
                ok: true,
                data: Some(data),
                error: None,
            },
            Err(error) => Self::failure(error),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

pub async fn dispatch(controller: &TelemetryController, request: ControlRequest) -> CommandResponse {
    log::debug!("Control request: {:?}", request);
    match request {
        ControlRequest::GetDeviceState => {
            CommandResponse::from_result(get_device_state(controller).await)
        }
        ControlRequest::UpdateDeviceState { patch } => {
            CommandResponse::from_result(update_device_state(controller, patch).await)
        }
        ControlRequest::ToggleOpen => CommandResponse::from_result(toggle_open(controller).await),
        ControlRequest::SetFieldKey { index, key } => {
            CommandResponse::from_result(set_field_key(controller, index, key).await)
        }
        ControlRequest::ListPorts => CommandResponse::from_result(list_available_ports().await),
    }
}

/// Parse and run one console line
pub async fn handle_line(controller: &TelemetryController, line: &str) -> CommandResponse {
    match serde_json::from_str::<ControlRequest>(line) {
        Ok(request) => dispatch(controller, request).await,
        Err(e) => CommandResponse::failure(format!("Invalid request: {}", e)),
    }
}

/// JSON-lines console: one request per input line, one response per output
/// line. Returns when the input ends.
pub async fn serve_console<R, W>(
    controller: &TelemetryController,
    input: R,
    mut output: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = handle_line(controller, line).await;
        let mut encoded = serde_json::to_string(&response).map_err(std::io::Error::other)?;
        encoded.push('\n');
        output.write_all(encoded.as_bytes()).await?;
        output.flush().await?;
    }
    Ok(())
}
