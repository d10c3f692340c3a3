use periphlink_communication::{
    ConnectionManager, ContinuousLoadCell, GcodeController, GcodeDevice, QueryLoadCell, Script,
};
use periphlink_core::{
    CommandError, ConnectionState, DeviceEvent, DeviceProfile, Error, Position, ReconnectPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const RECORD: &str = "+0001.234    lbs\r\n";
const BANNER: &str = "start\necho: Marlin 1.1.9\nPulse D-224 ready\n";

fn fast(profile: DeviceProfile) -> DeviceProfile {
    DeviceProfile {
        read_timeout_ms: 50,
        write_timeout_ms: 50,
        handshake_timeout_ms: 200,
        reconnect: ReconnectPolicy::Fixed { delay_ms: 10 },
        ..profile
    }
}

fn load_cell_manager(script: &Script) -> ConnectionManager {
    let cell = ContinuousLoadCell::new(fast(ContinuousLoadCell::default_profile()));
    ConnectionManager::new(Arc::new(cell), script.factory())
}

fn gcode_controller(script: &Script) -> GcodeController {
    let device = GcodeDevice::new(fast(GcodeDevice::default_profile()));
    GcodeController::new(device, script.factory())
}

/// Collect state changes until `done` returns true or a second passes
async fn states_until(
    events: &mut broadcast::Receiver<DeviceEvent>,
    done: impl Fn(&[ConnectionState]) -> bool,
) -> Vec<ConnectionState> {
    let mut states = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        while let Ok(event) = events.recv().await {
            if let DeviceEvent::StateChanged { state, .. } = event {
                states.push(state);
                if done(&states) {
                    break;
                }
            }
        }
    })
    .await;
    states
}

#[tokio::test]
async fn test_probe_timeout_is_negative() {
    let script = Script::new();
    let manager = load_cell_manager(&script);

    assert!(!manager.probe("/dev/ttyUSB0").await);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(script.open_count(), 1);
    assert_eq!(script.close_count(), 1);
}

#[tokio::test]
async fn test_connect_without_identification_stays_disconnected() {
    let script = Script::new();
    script.push_bytes("no banner here\n");
    let mut controller = gcode_controller(&script);

    assert!(!controller.connect("/dev/ttyACM0").await.unwrap());
    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert_eq!(script.close_count(), 1);
}

#[tokio::test]
async fn test_garbage_during_probe_is_negative() {
    let script = Script::new();
    script.push_bytes([0xFFu8, 0xFE, 0x80, 0x81, 0x00, 0xC3, 0x28, 0xA0, 0xA1]);
    let manager = load_cell_manager(&script);
    assert!(!manager.probe("/dev/ttyUSB0").await);
}

#[tokio::test]
async fn test_find_device_tries_ports_in_order() {
    let script = Script::new();
    script.fail_opens(1);
    script.push_bytes(BANNER);
    let controller = gcode_controller(&script);

    let ports = ["/dev/ttyACM0", "/dev/ttyACM1"];
    let found = controller.manager().find_device(&ports).await;
    assert_eq!(found.as_deref(), Some("/dev/ttyACM1"));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let script = Script::new();
    script.push_bytes(RECORD).push_bytes(RECORD);
    let mut manager = load_cell_manager(&script).with_auto_reconnect(false);

    // Disconnecting a manager that never connected is harmless
    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    assert!(manager.connect("/dev/ttyUSB0").await.unwrap());
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(manager.session_id().is_some());

    manager.disconnect().await;
    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(script.open_count(), 1);
    assert_eq!(script.close_count(), 1);
    assert!(matches!(
        manager.send_command("T").await,
        Err(CommandError::NotConnected)
    ));
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let script = Script::new();
    script.push_bytes(BANNER);
    let mut controller = gcode_controller(&script);

    assert!(controller.connect("/dev/ttyACM0").await.unwrap());
    let second = controller.connect("/dev/ttyACM0").await;
    assert!(matches!(second, Err(Error::AlreadyConnected { .. })));
    assert_eq!(controller.state(), ConnectionState::Connected);
    controller.disconnect().await;
}

#[tokio::test]
async fn test_streaming_publishes_readings() {
    let script = Script::new();
    script
        .push_bytes(RECORD)
        .push_bytes("+0002.500    lbs\r\n-0000.750    lbs\r\n");
    let mut manager = load_cell_manager(&script).with_auto_reconnect(false);
    let mut events = manager.subscribe();

    assert!(manager.connect("/dev/ttyUSB0").await.unwrap());

    let mut values = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        while let Ok(event) = events.recv().await {
            if let DeviceEvent::Reading(reading) = event {
                values.push(reading.value);
                if values.len() == 2 {
                    break;
                }
            }
        }
    })
    .await;
    assert_eq!(values, vec![2.5, -0.75]);
    manager.disconnect().await;
}

#[tokio::test]
async fn test_reconnect_after_io_error() {
    let script = Script::new();
    script
        .push_bytes(RECORD)
        .push_fault("device reports I/O error")
        .push_bytes(RECORD);
    let mut manager = load_cell_manager(&script);
    let mut events = manager.subscribe();

    assert!(manager.connect("/dev/ttyUSB0").await.unwrap());

    let states = states_until(&mut events, |s| {
        s.iter().filter(|st| **st == ConnectionState::Connected).count() == 2
    })
    .await;
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    assert_eq!(script.open_count(), 2);

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_streaming_silence_without_reconnect_disconnects() {
    let script = Script::new();
    script.push_bytes(RECORD);
    let mut manager = load_cell_manager(&script).with_auto_reconnect(false);
    let mut events = manager.subscribe();

    assert!(manager.connect("/dev/ttyUSB0").await.unwrap());
    let states = states_until(&mut events, |s| {
        s.last() == Some(&ConnectionState::Disconnected)
    })
    .await;
    assert_eq!(states.last(), Some(&ConnectionState::Disconnected));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_query_load_cell_prompts_for_records() {
    let script = Script::new();
    script.reply_to("?", "+0001.234\r");
    let cell = QueryLoadCell::new(fast(QueryLoadCell::default_profile()));
    let mut manager =
        ConnectionManager::new(Arc::new(cell), script.factory()).with_auto_reconnect(false);
    let mut events = manager.subscribe();

    assert!(manager.connect("COM3").await.unwrap());

    let reading = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(DeviceEvent::Reading(reading)) = events.recv().await {
                return reading;
            }
        }
    })
    .await
    .unwrap();
    assert!((reading.value - 1.234).abs() < 1e-9);
    assert!(script.writes().len() >= 2);
    assert!(script.writes().iter().all(|w| w == "?"));
    manager.disconnect().await;
}

#[tokio::test]
async fn test_query_load_cell_rejects_chatty_device() {
    let script = Script::new();
    script.push_bytes("+0001.234\r");
    let cell = QueryLoadCell::new(fast(QueryLoadCell::default_profile()));
    let manager = ConnectionManager::new(Arc::new(cell), script.factory());

    assert!(!manager.probe("COM3").await);
    assert!(script.writes().is_empty());
}

#[tokio::test]
async fn test_gcode_commands_end_to_end() {
    let script = Script::new();
    script
        .push_bytes(BANNER)
        .reply_to("G28", "echo:busy: processing\nok\n")
        .reply_to("G1 ", "ok\n")
        .reply_to(
            "M114",
            "X:125.00 Y:125.00 Z:125.00 E:0.00 Count X:10000 Y:10000 Z:50000\nok\n",
        );
    let mut controller = gcode_controller(&script);

    assert!(controller.connect("/dev/ttyACM0").await.unwrap());

    let homed = controller.home().await.unwrap();
    assert_eq!(homed.lines, vec!["ok"]);

    controller.move_to(125.0, 125.0, 125.0, 8000.0).await.unwrap();

    let position = controller.query_position().await.unwrap();
    assert_eq!(position, Position::new(125.0, 125.0, 125.0));
    assert_eq!(controller.position(), position);

    assert_eq!(
        script.writes(),
        vec!["G28\n", "G1 X125 Y125 Z125 F8000\n", "M114\n"]
    );
    controller.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_cancels_pending_command() {
    let script = Script::new();
    script.push_bytes(BANNER);
    let mut controller = gcode_controller(&script);
    assert!(controller.connect("/dev/ttyACM0").await.unwrap());

    let pending = controller.manager().send_command("G28");
    // Wait until the session has written it
    for _ in 0..100 {
        if !script.writes().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(script.writes(), vec!["G28\n"]);

    controller.disconnect().await;
    assert_eq!(
        pending.await,
        Err(CommandError::Cancelled {
            command: "G28".to_string()
        })
    );
}

#[tokio::test]
async fn test_disconnect_cancels_unwritten_command() {
    let script = Script::new();
    script.push_bytes(BANNER);
    let mut controller = gcode_controller(&script);
    assert!(controller.connect("/dev/ttyACM0").await.unwrap());

    let pending = controller.manager().send_command("G28");
    controller.disconnect().await;

    assert_eq!(
        pending.await,
        Err(CommandError::Cancelled {
            command: "G28".to_string()
        })
    );
}

#[tokio::test]
async fn test_command_interrupts_idle_read() {
    let script = Script::new();
    script.push_bytes(BANNER).reply_to("M114", "X:4.00 Y:5.00 Z:6.00 E:0.00\nok\n");
    let profile = DeviceProfile {
        read_timeout_ms: 5000,
        ..fast(GcodeDevice::default_profile())
    };
    let mut controller = GcodeController::new(GcodeDevice::new(profile), script.factory());
    assert!(controller.connect("/dev/ttyACM0").await.unwrap());

    // Let the session settle into a read that would idle for five seconds
    tokio::time::sleep(Duration::from_millis(50)).await;

    let block = tokio::time::timeout(Duration::from_secs(1), controller.send_command("M114"))
        .await
        .expect("command waited out the read deadline")
        .unwrap();
    assert_eq!(block.lines, vec!["X:4.00 Y:5.00 Z:6.00 E:0.00", "ok"]);
    controller.disconnect().await;
}

#[tokio::test]
async fn test_orphan_response_is_surfaced() {
    let script = Script::new();
    script
        .push_bytes(BANNER)
        .push_timeout()
        .push_bytes("X:1.00 Y:1.00 Z:1.00\nok\n");
    let mut controller = gcode_controller(&script);
    let mut events = controller.subscribe();
    assert!(controller.connect("/dev/ttyACM0").await.unwrap());

    let anomaly = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(DeviceEvent::Anomaly(msg)) = events.recv().await {
                return msg;
            }
        }
    })
    .await
    .unwrap();
    assert!(anomaly.contains("no pending command"));
    assert_eq!(controller.state(), ConnectionState::Connected);
    controller.disconnect().await;
}
