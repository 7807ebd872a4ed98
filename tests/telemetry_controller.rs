use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use overlay_telemetry_lib::serial::{DataBits, Parity, SerialConnectionConfig, SimulatedSerial, StopBits};
use overlay_telemetry_lib::telemetry::{
    DeviceStatePatch, Field, LinkPhase, Result, SnapshotPublisher, TelemetryController,
    TelemetryError, TelemetrySettings, TelemetrySnapshot,
};

struct RecordingPublisher {
    tx: mpsc::UnboundedSender<TelemetrySnapshot>,
}

#[async_trait::async_trait]
impl SnapshotPublisher for RecordingPublisher {
    async fn publish(&self, snapshot: &TelemetrySnapshot) -> Result<usize> {
        let _ = self.tx.send(snapshot.clone());
        Ok(1)
    }
}

fn setup(
    settings: TelemetrySettings,
) -> (
    TelemetryController,
    SimulatedSerial,
    mpsc::UnboundedReceiver<TelemetrySnapshot>,
) {
    let sim = SimulatedSerial::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let config = SerialConnectionConfig {
        path: "/dev/ttySIM0".to_string(),
        ..SerialConnectionConfig::default()
    };
    let controller = TelemetryController::new(
        Arc::new(sim.clone()),
        Arc::new(RecordingPublisher { tx }),
        config,
        settings,
    );
    (controller, sim, rx)
}

async fn next_snapshot(rx: &mut mpsc::UnboundedReceiver<TelemetrySnapshot>) -> TelemetrySnapshot {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a snapshot")
        .expect("publisher channel closed")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<TelemetrySnapshot>, millis: u64) {
    let extra = timeout(Duration::from_millis(millis), rx.recv()).await;
    assert!(extra.is_err(), "unexpected snapshot: {:?}", extra);
}

fn unnamed(values: &[&str]) -> Vec<Field> {
    values.iter().map(|v| Field::new(None, *v)).collect()
}

#[tokio::test]
async fn test_open_then_line_maps_fields() {
    let (controller, sim, mut rx) = setup(TelemetrySettings::default());

    controller.open_current_serial().await.unwrap();
    assert!(controller.is_open());
    assert_eq!(controller.phase(), LinkPhase::Open);

    let config = sim.last_config().unwrap();
    assert_eq!(config.baud_rate, 9600);
    assert_eq!(config.data_bits, DataBits::Eight);
    assert_eq!(config.parity, Parity::None);
    assert_eq!(config.stop_bits, StopBits::One);

    let opened = next_snapshot(&mut rx).await;
    assert!(opened.serial.is_open);
    assert!(opened.serial.fields.is_empty());

    assert!(sim.push_line("12.3,45.6,OK"));
    let snapshot = next_snapshot(&mut rx).await;
    assert_eq!(snapshot.serial.fields, unnamed(&["12.3", "45.6", "OK"]));
    assert_eq!(controller.device_state().current_fields, unnamed(&["12.3", "45.6", "OK"]));
    assert_eq!(controller.device_state().history.len(), 1);
}

#[tokio::test]
async fn test_field_key_survives_next_line() {
    let (controller, sim, mut rx) = setup(TelemetrySettings::default());
    controller.open_current_serial().await.unwrap();
    next_snapshot(&mut rx).await;

    sim.push_line("12.3,45.6,OK");
    next_snapshot(&mut rx).await;

    let fields = controller.set_field_key(0, Some("temp".to_string())).unwrap();
    assert_eq!(fields[0], Field::new(Some("temp".to_string()), "12.3"));
    // naming a field is pushed to consumers right away
    let renamed = next_snapshot(&mut rx).await;
    assert_eq!(renamed.serial.fields[0].key.as_deref(), Some("temp"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    sim.push_line("13.1,45.9,OK");
    let snapshot = next_snapshot(&mut rx).await;
    assert_eq!(
        snapshot.serial.fields,
        vec![
            Field::new(Some("temp".to_string()), "13.1"),
            Field::new(None, "45.9"),
            Field::new(None, "OK"),
        ]
    );
}

#[tokio::test]
async fn test_burst_is_throttled() {
    let (controller, sim, mut rx) = setup(TelemetrySettings::default());
    controller.open_current_serial().await.unwrap();
    next_snapshot(&mut rx).await;

    for i in 0..10 {
        sim.push_line(&format!("{},{}", i, i * 2));
    }

    let first = next_snapshot(&mut rx).await;
    assert_eq!(first.serial.fields, unnamed(&["0", "0"]));
    assert_quiet(&mut rx, 300).await;

    // state keeps up even though broadcasts are dropped
    let state = controller.device_state();
    assert_eq!(state.history.len(), 10);
    assert_eq!(state.current_fields, unnamed(&["9", "18"]));
}

#[tokio::test]
async fn test_trailing_flush_emits_latest_state() {
    let settings = TelemetrySettings {
        throttle: Duration::from_millis(100),
        trailing_flush: true,
        ..TelemetrySettings::default()
    };
    let (controller, sim, mut rx) = setup(settings);
    controller.open_current_serial().await.unwrap();
    next_snapshot(&mut rx).await;

    for i in 0..5 {
        sim.push_line(&i.to_string());
    }

    assert_eq!(next_snapshot(&mut rx).await.serial.fields, unnamed(&["0"]));
    assert_eq!(next_snapshot(&mut rx).await.serial.fields, unnamed(&["4"]));
    assert_quiet(&mut rx, 250).await;
}

#[tokio::test]
async fn test_close_resets_runtime_state() {
    let (controller, sim, mut rx) = setup(TelemetrySettings::default());
    controller.open_current_serial().await.unwrap();
    sim.push_line("1,2,3");
    next_snapshot(&mut rx).await;
    next_snapshot(&mut rx).await;

    controller.close_current_serial().await;

    let state = controller.device_state();
    assert!(!state.is_open);
    assert!(state.history.is_empty());
    assert!(state.current_fields.is_empty());
    assert_eq!(state.config.path, "/dev/ttySIM0", "configuration is kept");
    assert_eq!(controller.phase(), LinkPhase::Closed);
    assert_eq!(sim.close_count(), 1);
    assert!(!sim.is_open());

    let closed = next_snapshot(&mut rx).await;
    assert!(!closed.serial.is_open);
    assert!(closed.serial.fields.is_empty());

    // closing again is a no-op
    controller.close_current_serial().await;
    assert_eq!(sim.close_count(), 1);
    assert_quiet(&mut rx, 50).await;
}

#[tokio::test]
async fn test_open_failure_leaves_device_closed() {
    let (controller, sim, mut rx) = setup(TelemetrySettings::default());
    sim.set_open_failure(Some("port busy"));

    let err = controller.open_current_serial().await.unwrap_err();
    assert!(matches!(err, TelemetryError::SerialError(_)), "got {:?}", err);
    assert!(!controller.is_open());
    assert_eq!(controller.phase(), LinkPhase::Closed);
    assert!(!controller.toggle_open().await, "toggle reports the failure");
    assert_quiet(&mut rx, 50).await;

    sim.set_open_failure(None);
    assert!(controller.toggle_open().await);
    assert!(controller.is_open());
}

#[tokio::test]
async fn test_second_open_is_a_noop() {
    let (controller, sim, _rx) = setup(TelemetrySettings::default());
    controller.open_current_serial().await.unwrap();
    controller.open_current_serial().await.unwrap();
    assert_eq!(sim.open_count(), 1);
}

#[tokio::test]
async fn test_toggle_alternates_open_and_closed() {
    let (controller, sim, _rx) = setup(TelemetrySettings::default());

    assert!(controller.try_toggle_open().await.unwrap());
    assert!(controller.is_open());
    assert!(!controller.try_toggle_open().await.unwrap());
    assert!(!controller.is_open());
    assert!(controller.toggle_open().await);
    assert!(controller.is_open());
    assert_eq!(sim.open_count(), 2);
    assert_eq!(sim.close_count(), 1);
}

async fn wait_until_closed(controller: &TelemetryController) {
    timeout(Duration::from_secs(1), async {
        while controller.is_open() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("link was not torn down");
}

#[tokio::test]
async fn test_device_disconnect_tears_link_down() {
    let (controller, sim, mut rx) = setup(TelemetrySettings::default());
    controller.open_current_serial().await.unwrap();
    sim.push_line("5,6");
    next_snapshot(&mut rx).await;
    next_snapshot(&mut rx).await;

    sim.disconnect();
    wait_until_closed(&controller).await;

    let closed = next_snapshot(&mut rx).await;
    assert!(!closed.serial.is_open);
    assert!(controller.device_state().current_fields.is_empty());
    assert_eq!(sim.close_count(), 1);

    // the device can be reopened afterwards
    controller.open_current_serial().await.unwrap();
    assert!(controller.is_open());
}

#[tokio::test]
async fn test_driver_error_tears_link_down() {
    let (controller, sim, _rx) = setup(TelemetrySettings::default());
    controller.open_current_serial().await.unwrap();

    sim.raise_error("framing error");
    wait_until_closed(&controller).await;
    assert_eq!(controller.phase(), LinkPhase::Closed);
    assert!(!sim.push_line("1"), "no live connection after the error");
}

#[tokio::test]
async fn test_history_is_capped() {
    let settings = TelemetrySettings {
        history_limit: 3,
        ..TelemetrySettings::default()
    };
    let (controller, sim, _rx) = setup(settings);
    controller.open_current_serial().await.unwrap();

    for line in ["a", "b", "c", "d", "e"] {
        sim.push_line(line);
    }
    let history: Vec<String> = controller.device_state().history.into_iter().collect();
    assert_eq!(history, vec!["c", "d", "e"]);
}

#[tokio::test]
async fn test_raw_bytes_are_split_into_lines() {
    let (controller, sim, _rx) = setup(TelemetrySettings::default());
    controller.open_current_serial().await.unwrap();

    assert_eq!(sim.push_raw(b"1.5,2.5\r\n3."), 1);
    assert_eq!(sim.push_raw(b"5,4.5\n"), 1);
    assert_eq!(controller.device_state().current_fields, unnamed(&["3.5", "4.5"]));
}

#[tokio::test]
async fn test_config_update_applies_on_next_open() {
    let (controller, sim, _rx) = setup(TelemetrySettings::default());

    let bad = controller.update_device_state(DeviceStatePatch {
        baud_rate: Some(0),
        ..DeviceStatePatch::default()
    });
    assert!(matches!(bad, Err(TelemetryError::InvalidConfiguration(_))));

    let state = controller
        .update_device_state(DeviceStatePatch {
            path: Some("COM7".to_string()),
            baud_rate: Some(115200),
            ..DeviceStatePatch::default()
        })
        .unwrap();
    assert_eq!(state.device, "COM7");

    controller.open_current_serial().await.unwrap();
    let used = sim.last_config().unwrap();
    assert_eq!(used.path, "COM7");
    assert_eq!(used.baud_rate, 115200);
}

#[tokio::test]
async fn test_dispose_closes_and_refuses_open() {
    let (controller, sim, _rx) = setup(TelemetrySettings::default());
    controller.open_current_serial().await.unwrap();

    controller.dispose().await;
    assert!(!controller.is_open());
    assert_eq!(sim.close_count(), 1);
    assert!(matches!(
        controller.open_current_serial().await,
        Err(TelemetryError::Disposed)
    ));
}
