//! End-to-end tests driving a session against a fake receiver on loopback.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use denon_avr::{
    AvrError, AvrSession, CommandSpec, ConnectionState, DiscoveryMode, DiscoveryRecord,
    PropertyValue, SessionConfig, StateEvent, StateUpdate, PROBES, VOLUME,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

/// One accepted connection, seen from the receiver's side.
struct Device {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Device {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept())
            .await
            .expect("session never connected")
            .unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn read_line(&mut self) -> Option<String> {
        let mut buf = Vec::new();
        let n = timeout(WAIT, self.reader.read_until(b'\r', &mut buf))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        if n == 0 {
            return None;
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Some(String::from_utf8(buf).unwrap())
    }

    async fn expect_line(&mut self, expected: &str) {
        assert_eq!(self.read_line().await.as_deref(), Some(expected));
    }

    async fn expect_probes(&mut self) {
        for probe in PROBES {
            self.expect_line(probe).await;
        }
    }

    async fn expect_silence(&mut self) {
        let mut buf = Vec::new();
        let read = timeout(QUIET, self.reader.read_until(b'\r', &mut buf)).await;
        assert!(read.is_err(), "unexpected traffic: {:?}", String::from_utf8_lossy(&buf));
    }

    async fn expect_closed(&mut self) {
        assert_eq!(self.read_line().await, None);
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r", line).as_bytes())
            .await
            .unwrap();
    }
}

fn test_config(port: u16) -> SessionConfig {
    SessionConfig::default()
        .with_discovery(DiscoveryMode::Manual)
        .with_port(port)
        .with_command_timeout(Duration::from_millis(400))
        .with_retry(3, Duration::from_millis(50))
        .with_reconnect_interval(Duration::from_millis(50), Duration::from_millis(400))
        .with_probe_timing(Duration::from_millis(5), Duration::from_secs(30))
}

fn start(config: SessionConfig) -> (AvrSession, mpsc::UnboundedReceiver<StateUpdate>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = AvrSession::builder(move |update| {
        let _ = tx.send(update.clone());
    })
    .with_config(config)
    .with_reachability(|_: IpAddr| true)
    .build()
    .unwrap();
    (session, rx)
}

fn loopback(last_octet: u8) -> IpAddr {
    IpAddr::from([127, 0, 0, last_octet])
}

async fn next_update(updates: &mut mpsc::UnboundedReceiver<StateUpdate>) -> StateUpdate {
    timeout(WAIT, updates.recv())
        .await
        .expect("no state update")
        .unwrap()
}

async fn wait_for_state(session: &AvrSession, state: ConnectionState) {
    timeout(WAIT, async {
        while session.status().await.unwrap().connection != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection state never reached");
}

/// Start a session connected to a fresh fake receiver, probes consumed.
async fn connected() -> (
    AvrSession,
    mpsc::UnboundedReceiver<StateUpdate>,
    TcpListener,
    Device,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (session, updates) = start(test_config(port));

    session.discovered(DiscoveryRecord::bare(loopback(1))).unwrap();
    let mut device = Device::accept(&listener).await;
    device.expect_probes().await;
    wait_for_state(&session, ConnectionState::Connected).await;

    (session, updates, listener, device)
}

#[tokio::test]
async fn test_unsolicited_line_updates_state_and_fires_callback() {
    let (session, mut updates, _listener, mut device) = connected().await;

    device.send("MV35").await;
    let update = next_update(&mut updates).await;
    assert_eq!(
        update.event,
        StateEvent::Property {
            name: VOLUME.to_string(),
            value: PropertyValue::from("35"),
        }
    );
    assert_eq!(update.snapshot.get(VOLUME), Some(&PropertyValue::from("35")));

    device.send("MSDOLBY DIGITAL").await;
    let update = next_update(&mut updates).await;
    assert_eq!(
        update.event,
        StateEvent::Unknown {
            line: "MSDOLBY DIGITAL".to_string()
        }
    );
    assert_eq!(update.snapshot.len(), 1);

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_commands_are_sent_one_at_a_time() {
    let (session, _updates, _listener, mut device) = connected().await;

    let receiver = async {
        device.expect_line("MV40").await;
        // the mute command waits until the volume command is answered
        device.expect_silence().await;
        device.send("MV40").await;
        device.expect_line("MUON").await;
        device.send("MUON").await;
    };

    let (volume, muted, ()) = tokio::join!(session.set_volume(40), session.set_muted(true), receiver);
    assert_eq!(volume.unwrap(), "40");
    muted.unwrap();

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.get(VOLUME), Some(&PropertyValue::from("40")));
    assert_eq!(snapshot.get("muted"), Some(&PropertyValue::Bool(true)));
}

#[tokio::test]
async fn test_set_to_cached_value_sends_nothing() {
    let (session, mut updates, _listener, mut device) = connected().await;

    device.send("MV35").await;
    next_update(&mut updates).await;

    let volume = timeout(QUIET, session.set_volume(35))
        .await
        .expect("set to cached value should resolve immediately")
        .unwrap();
    assert_eq!(volume, "35");
    device.expect_silence().await;
}

#[tokio::test]
async fn test_response_to_in_flight_command_skips_callback() {
    let (session, mut updates, _listener, mut device) = connected().await;

    let receiver = async {
        device.expect_line("MV?").await;
        device.send("MV50").await;
    };
    let (volume, ()) = tokio::join!(session.volume(), receiver);
    assert_eq!(volume.unwrap(), "50");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(updates.try_recv().is_err());
    // the cached value is still refreshed
    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.get(VOLUME), Some(&PropertyValue::from("50")));
}

#[tokio::test]
async fn test_retries_exhausted_then_next_command_runs() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (session, _updates) = start(test_config(port));

    // Never answers SI?, answers MV? with MV45, accepts every reconnect
    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let mut device = Device::accept(&listener).await;
            let lines_tx = lines_tx.clone();
            tokio::spawn(async move {
                while let Some(line) = device.read_line().await {
                    if line == "MV?" {
                        device.send("MV45").await;
                    }
                    let _ = lines_tx.send(line);
                }
            });
        }
    });

    session.discovered(DiscoveryRecord::bare(loopback(1))).unwrap();
    let (input, volume) = tokio::join!(session.input(), session.volume());

    assert!(matches!(
        input,
        Err(AvrError::CommandTimeout { ref command, attempts: 3 }) if command == "SI?"
    ));
    assert_eq!(volume.unwrap(), "45");

    let mut seen = Vec::new();
    while let Ok(line) = lines_rx.try_recv() {
        seen.push(line);
    }
    assert!(seen.iter().filter(|line| *line == "SI?").count() >= 3);
}

#[tokio::test]
async fn test_command_timeout_resets_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (session, _updates) = start(test_config(port).with_retry(1, Duration::from_millis(50)));

    session.discovered(DiscoveryRecord::bare(loopback(1))).unwrap();
    let mut device = Device::accept(&listener).await;
    device.expect_probes().await;
    wait_for_state(&session, ConnectionState::Connected).await;

    let pending = session.clone();
    let handle = tokio::spawn(async move { pending.input().await });
    device.expect_line("SI?").await;

    // Left unanswered: the session hangs up once the command times out
    device.expect_closed().await;
    assert!(matches!(
        handle.await.unwrap(),
        Err(AvrError::CommandTimeout { ref command, attempts: 1 }) if command == "SI?"
    ));

    let mut device = Device::accept(&listener).await;
    device.expect_probes().await;
    wait_for_state(&session, ConnectionState::Connected).await;
}

#[tokio::test]
async fn test_connection_loss_clears_state_and_reprobes() {
    let (session, mut updates, listener, mut device) = connected().await;

    device.send("MV35").await;
    device.send("MUOFF").await;
    next_update(&mut updates).await;
    next_update(&mut updates).await;
    assert_eq!(session.snapshot().await.unwrap().len(), 2);

    drop(device);
    let mut device = Device::accept(&listener).await;
    assert!(session.snapshot().await.unwrap().is_empty());
    device.expect_probes().await;
}

#[tokio::test]
async fn test_new_address_replaces_connection() {
    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener_a.local_addr().unwrap().port();
    let listener_b = TcpListener::bind((loopback(2), port)).await.unwrap();
    let (session, mut updates) = start(test_config(port));

    session.discovered(DiscoveryRecord::bare(loopback(1))).unwrap();
    let mut device_a = Device::accept(&listener_a).await;
    device_a.expect_probes().await;

    device_a.send("MV35").await;
    let update = next_update(&mut updates).await;
    assert_eq!(update.snapshot.get(VOLUME), Some(&PropertyValue::from("35")));

    // Reporting the same address again changes nothing
    session.discovered(DiscoveryRecord::bare(loopback(1))).unwrap();
    device_a.expect_silence().await;

    session.discovered(DiscoveryRecord::bare(loopback(2))).unwrap();
    device_a.expect_closed().await;
    let mut device_b = Device::accept(&listener_b).await;
    device_b.expect_probes().await;

    let status = session.status().await.unwrap();
    assert_eq!(status.address, Some((loopback(2), port).into()));
    assert!(session.snapshot().await.unwrap().get(VOLUME).is_none());
}

#[tokio::test]
async fn test_address_change_aborts_in_flight_command() {
    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener_a.local_addr().unwrap().port();
    let listener_b = TcpListener::bind((loopback(2), port)).await.unwrap();
    let (session, _updates) = start(test_config(port).with_command_timeout(Duration::from_secs(10)));

    session.discovered(DiscoveryRecord::bare(loopback(1))).unwrap();
    let mut device_a = Device::accept(&listener_a).await;
    device_a.expect_probes().await;

    let switch = async {
        device_a.expect_line("SI?").await;
        session.discovered(DiscoveryRecord::bare(loopback(2))).unwrap();
    };
    let (input, ()) = tokio::join!(session.input(), switch);

    assert!(matches!(
        input,
        Err(AvrError::ConnectionReplaced { ref command }) if command == "SI?"
    ));
    let _device_b = Device::accept(&listener_b).await;
}

#[tokio::test]
async fn test_raw_commands() {
    let (session, _updates, _listener, mut device) = connected().await;

    // No registered prefix and no pattern: resolved once written
    assert_eq!(session.command("MSDIRECT").await.unwrap(), None);
    device.expect_line("MSDIRECT").await;

    let receiver = async {
        device.expect_line("MS?").await;
        device.send("MSSTEREO").await;
    };
    let (mode, ()) = tokio::join!(session.command_matching("MS?", "^MS(.+)"), receiver);
    assert_eq!(mode.unwrap(), PropertyValue::from("STEREO"));

    // A registered prefix waits for that property's report
    let receiver = async {
        device.expect_line("MV?").await;
        device.send("MV22").await;
    };
    let (volume, ()) = tokio::join!(session.command("MV?"), receiver);
    assert_eq!(volume.unwrap(), Some(PropertyValue::from("22")));
}

#[tokio::test]
async fn test_registered_command_and_accessors() {
    let (session, mut updates, _listener, mut device) = connected().await;

    session
        .register_command(CommandSpec::new("surroundMode", "MS", "^MS(.+)").unwrap())
        .await
        .unwrap();
    assert!(session
        .accessor_names()
        .await
        .unwrap()
        .contains(&"setSurroundMode".to_string()));

    let receiver = async {
        device.expect_line("MSSTEREO").await;
        device.send("MSSTEREO").await;
    };
    let (mode, ()) = tokio::join!(session.invoke("setSurroundMode", &["STEREO"]), receiver);
    assert_eq!(mode.unwrap(), PropertyValue::from("STEREO"));

    device.send("MSDIRECT").await;
    let update = next_update(&mut updates).await;
    assert_eq!(
        update.event,
        StateEvent::Property {
            name: "surroundMode".to_string(),
            value: PropertyValue::from("DIRECT"),
        }
    );

    let receiver = async {
        device.expect_line("ZMON").await;
        device.send("ZMON").await;
    };
    let (power, ()) = tokio::join!(session.invoke("on", &[]), receiver);
    assert_eq!(power.unwrap(), PropertyValue::Bool(true));

    assert!(matches!(
        session.invoke("setVolume", &[]).await,
        Err(AvrError::MissingArgument(_))
    ));
    assert!(matches!(
        session.invoke("setTreble", &["5"]).await,
        Err(AvrError::UnknownAccessor(_))
    ));
}

#[tokio::test]
async fn test_commands_before_discovery_are_not_ready() {
    let (session, _updates) = start(test_config(23));

    assert!(matches!(session.set_volume(30).await, Err(AvrError::NotReady)));
    assert!(matches!(session.muted().await, Err(AvrError::NotReady)));
    assert!(matches!(session.command("MSDIRECT").await, Err(AvrError::NotReady)));
    assert!(matches!(
        session.get_property("treble").await,
        Err(AvrError::UnknownProperty(ref name)) if name == "treble"
    ));
    assert!(matches!(
        session.set_property("muted", "MAYBE").await,
        Err(AvrError::InvalidValue { .. })
    ));
}

#[tokio::test]
async fn test_model_filter_and_reachability() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (session, _updates) = start(test_config(port).with_model("AVR-X2400H"));

    let mut other = BTreeMap::new();
    other.insert("Device-Model".to_string(), "AVR-X1600H".to_string());
    session
        .discovered(DiscoveryRecord::new(loopback(1), other))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.status().await.unwrap().address, None);

    let mut wanted = BTreeMap::new();
    wanted.insert("Device-Model".to_string(), "AVR-X2400H".to_string());
    session
        .discovered(DiscoveryRecord::new(loopback(1), wanted))
        .unwrap();
    let mut device = Device::accept(&listener).await;
    device.expect_probes().await;

    let (tx, _rx) = mpsc::unbounded_channel::<StateUpdate>();
    let unreachable = AvrSession::builder(move |update| {
        let _ = tx.send(update.clone());
    })
    .with_config(test_config(port))
    .with_reachability(|_: IpAddr| false)
    .build()
    .unwrap();
    unreachable
        .discovered(DiscoveryRecord::bare(loopback(1)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(unreachable.status().await.unwrap().address, None);
}

#[tokio::test]
async fn test_model_filter_rejects_beacons_without_model() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (session, _updates) = start(test_config(port).with_model("AVR-X2400H"));

    let mut anonymous = BTreeMap::new();
    anonymous.insert("Make".to_string(), "ACME".to_string());
    session
        .discovered(DiscoveryRecord::new(loopback(1), anonymous))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.status().await.unwrap().address, None);

    // Hostname records carry no model and are adopted
    session
        .discovered(DiscoveryRecord::from_hostname(loopback(1), "denon-avr-x2400h.local"))
        .unwrap();
    let mut device = Device::accept(&listener).await;
    device.expect_probes().await;
    assert_eq!(
        session.status().await.unwrap().address.map(|address| address.ip()),
        Some(loopback(1))
    );
}

#[tokio::test]
async fn test_static_address_connects_at_start() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = test_config(port).with_discovery(DiscoveryMode::Static(loopback(1)));
    let (session, _updates) = start(config);

    let mut device = Device::accept(&listener).await;
    device.expect_probes().await;
    wait_for_state(&session, ConnectionState::Connected).await;
}

#[tokio::test]
async fn test_collect_queries_properties_probes_missed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = test_config(port)
        .with_probe_timing(Duration::from_millis(5), Duration::from_millis(100));
    let (session, mut updates) = start(config);

    session.discovered(DiscoveryRecord::bare(loopback(1))).unwrap();
    let mut device = Device::accept(&listener).await;
    device.expect_line("ZM?").await;
    device.send("ZMON").await;
    device.expect_line("MV?").await;
    device.send("MV35").await;
    device.expect_line("MU?").await;
    device.send("MUOFF").await;
    device.expect_line("SI?").await;
    for _ in 0..3 {
        next_update(&mut updates).await;
    }

    // input and dynamicVolume are still unknown
    device.expect_line("SI?").await;
    device.expect_line("PSDYNVOL ?").await;
}

#[tokio::test]
async fn test_shutdown_fails_pending_commands() {
    let (session, _updates, _listener, mut device) = connected().await;

    let pending = session.clone();
    let handle = tokio::spawn(async move { pending.input().await });
    device.expect_line("SI?").await;

    session.shutdown().await.unwrap();
    assert!(matches!(handle.await.unwrap(), Err(AvrError::SessionClosed)));
    assert!(matches!(session.snapshot().await, Err(AvrError::SessionClosed)));
}
