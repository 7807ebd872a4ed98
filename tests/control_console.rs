use std::sync::Arc;

use serde_json::Value;

use overlay_telemetry_lib::commands::{self, serve_console};
use overlay_telemetry_lib::serial::{SerialConnectionConfig, SimulatedSerial};
use overlay_telemetry_lib::telemetry::{
    Result, SnapshotPublisher, TelemetryController, TelemetrySettings, TelemetrySnapshot,
};

struct NullPublisher;

#[async_trait::async_trait]
impl SnapshotPublisher for NullPublisher {
    async fn publish(&self, _snapshot: &TelemetrySnapshot) -> Result<usize> {
        Ok(0)
    }
}

fn controller(sim: &SimulatedSerial) -> TelemetryController {
    TelemetryController::new(
        Arc::new(sim.clone()),
        Arc::new(NullPublisher),
        SerialConnectionConfig {
            path: "/dev/ttySIM1".to_string(),
            ..SerialConnectionConfig::default()
        },
        TelemetrySettings::default(),
    )
}

async fn run_console(controller: &TelemetryController, script: &str) -> Vec<Value> {
    let mut output = Vec::new();
    serve_console(controller, script.as_bytes(), &mut output)
        .await
        .unwrap();
    String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_console_answers_one_line_per_request() {
    let sim = SimulatedSerial::new();
    let controller = controller(&sim);
    let script = r#"{"cmd":"getDeviceState"}

{"cmd":"updateDeviceState","baudRate":19200,"parity":"even"}
{"cmd":"setFieldKey","index":1,"key":"rpm"}
not json
"#;

    let responses = run_console(&controller, script).await;
    assert_eq!(responses.len(), 4, "blank lines are skipped");

    assert_eq!(responses[0]["ok"], true);
    assert_eq!(responses[0]["data"]["device"], "/dev/ttySIM1");
    assert_eq!(responses[0]["data"]["isOpen"], false);

    assert_eq!(responses[1]["data"]["config"]["baudRate"], 19200);
    assert_eq!(responses[1]["data"]["config"]["parity"], "even");

    let fields = responses[2]["data"].as_array().unwrap();
    assert_eq!(fields.len(), 2);
    assert!(fields[0]["key"].is_null());
    assert_eq!(fields[1]["key"], "rpm");
    assert_eq!(fields[1]["value"], "");

    assert_eq!(responses[3]["ok"], false);
    assert!(responses[3]["error"].as_str().unwrap().starts_with("Invalid request"));
}

#[tokio::test]
async fn test_toggle_open_reports_state_or_error() {
    let sim = SimulatedSerial::new();
    let controller = controller(&sim);

    let opened = commands::toggle_open(&controller).await.unwrap();
    assert!(opened.is_open);
    let closed = commands::toggle_open(&controller).await.unwrap();
    assert!(!closed.is_open);

    sim.set_open_failure(Some("access denied"));
    let responses = run_console(&controller, "{\"cmd\":\"toggleOpen\"}\n").await;
    assert_eq!(responses[0]["ok"], false);
    let error = responses[0]["error"].as_str().unwrap();
    assert!(error.contains("access denied"), "error was {}", error);
    assert!(!controller.is_open());
}

#[tokio::test]
async fn test_zero_baud_is_rejected() {
    let sim = SimulatedSerial::new();
    let controller = controller(&sim);

    let responses =
        run_console(&controller, "{\"cmd\":\"updateDeviceState\",\"baudRate\":0}\n").await;
    assert_eq!(responses[0]["ok"], false);
    assert_eq!(controller.device_state().config.baud_rate, 9600);
}

#[tokio::test]
async fn test_out_of_range_field_index_is_an_error_response() {
    let sim = SimulatedSerial::new();
    let controller = controller(&sim);
    let script = r#"{"cmd":"setFieldKey","index":18446744073709551615,"key":"x"}
{"cmd":"setFieldKey","index":10000000000,"key":"x"}
{"cmd":"setFieldKey","index":0,"key":"speed"}
"#;

    let responses = run_console(&controller, script).await;
    assert_eq!(responses.len(), 3, "every request gets an answer");

    for rejected in &responses[..2] {
        assert_eq!(rejected["ok"], false);
        let error = rejected["error"].as_str().unwrap();
        assert!(error.contains("field index"), "error was {}", error);
    }
    assert_eq!(responses[2]["ok"], true);
    assert_eq!(responses[2]["data"][0]["key"], "speed");
    assert_eq!(controller.device_state().current_fields.len(), 1);
}
