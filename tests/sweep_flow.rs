//! Full measurement flows against the simulated instruments.

use cryolab::fridge::{Fridge, FridgeSettings};
use cryolab::resource::{self, OpenOptions};
use cryolab::sim::{FridgeSimulator, ScpiVnaSimulator, SimTransport, SimulatedInstrument};
use cryolab::stability::Sleeper;
use cryolab::sweep::{measure, SweepPlan};
use cryolab::transport::Transport;
use cryolab::vna::{Analyzer, Hp8753, ScanSettings, ScpiVna};
use cryolab::{InstrumentError, TemperatureSweep};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct Clock {
    slept: Duration,
}

impl Sleeper for Clock {
    fn sleep(&mut self, duration: Duration) {
        self.slept += duration;
    }
}

fn quick_plan(temperatures: Vec<f64>) -> SweepPlan {
    let mut plan = SweepPlan::new(temperatures);
    plan.timing.min_stable_s = 15.0;
    plan.timing.poll_interval_s = 5.0;
    plan.timing.recovery_interval_s = 60.0;
    plan.timing.timeout_s = Some(3600.0);
    plan
}

#[test]
fn sweep_with_isobus_fridge_and_scpi_analyzer() {
    let fridge_sim = Arc::new(Mutex::new(FridgeSimulator::new().with_isobus_address(3)));
    let settings = FridgeSettings {
        isobus_address: Some(3),
        ..FridgeSettings::default()
    };
    let transport: Box<dyn Transport> = Box::new(SimTransport::shared(Arc::clone(&fridge_sim)));
    let mut fridge = Fridge::new(transport, settings);

    let vna_sim = Arc::new(Mutex::new(ScpiVnaSimulator::new()));
    let scan = ScanSettings {
        start_hz: 5.0e9,
        stop_hz: 5.2e9,
        power_dbm: -25.0,
        points: 101,
        averages: 2,
    };
    let mut analyzer: Box<dyn Analyzer> =
        Box::new(ScpiVna::new(SimTransport::shared(Arc::clone(&vna_sim))).with_scan(scan));

    let mut clock = Clock::default();
    let sweep = measure(
        &mut fridge,
        analyzer.as_mut(),
        &quick_plan(vec![50.0, 80.0, 120.0]),
        &mut clock,
    )
    .unwrap();

    assert_eq!(sweep.temperatures(), vec![50.0, 80.0, 120.0]);
    for point in &sweep.points {
        assert_eq!(point.spectrum.len(), 101);
        assert_eq!(point.spectrum.frequencies.len(), 101);
    }
    assert!(clock.slept > Duration::ZERO);

    // last setpoint landed at 120 mK in 0.1 mK counts
    let fridge_sim = fridge_sim.lock().unwrap();
    assert_eq!(fridge_sim.setpoint, 1200.0);
    assert_eq!(fridge_sim.power_range, 3);
    assert_eq!(fridge_sim.control_mode, 2);
    assert!(vna_sim.lock().unwrap().continuous);
}

#[test]
fn sweep_exports_csv_and_json() {
    let mut fridge = Fridge::new(
        SimTransport::new(FridgeSimulator::new()),
        FridgeSettings::default(),
    );
    let mut analyzer = Hp8753::open(
        SimTransport::new(cryolab::sim::Hp8753Simulator::new()),
        21,
    )
    .unwrap();
    analyzer.set_frequency_range(4.0, 4.2).unwrap();
    let sweep = measure(
        &mut fridge,
        &mut analyzer,
        &quick_plan(vec![100.0, 60.0]),
        &mut Clock::default(),
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("sweep.csv");
    sweep
        .write_csv(std::fs::File::create(&csv_path).unwrap())
        .unwrap();
    let csv = std::fs::read_to_string(&csv_path).unwrap();
    // header plus one row per temperature and point
    assert_eq!(csv.lines().count(), 1 + 2 * 21);
    assert!(csv.lines().nth(1).unwrap().starts_with("100,0,4000000000,"));

    let json_path = dir.path().join("sweep.json");
    sweep
        .write_json(std::fs::File::create(&json_path).unwrap())
        .unwrap();
    let back: TemperatureSweep =
        serde_json::from_reader(std::fs::File::open(&json_path).unwrap()).unwrap();
    assert_eq!(back.temperatures(), vec![100.0, 60.0]);
    assert_eq!(back.points[1].spectrum.len(), 21);
}

#[test]
fn pressure_fault_gives_up_after_timeout() {
    let mut sim = FridgeSimulator::new();
    sim.sensors[15] = 250_000.0;
    let mut fridge = Fridge::new(SimTransport::new(sim), FridgeSettings::default());
    let mut analyzer = ScpiVna::new(SimTransport::new(ScpiVnaSimulator::new()));
    let mut clock = Clock::default();
    let err = measure(
        &mut fridge,
        &mut analyzer,
        &quick_plan(vec![40.0]),
        &mut clock,
    )
    .unwrap_err();
    assert!(matches!(err, InstrumentError::NotStable { .. }));
    assert_eq!(clock.slept, Duration::from_secs(3600));
}

/// Serves one SCPI simulator on a local socket, one connection.
fn serve_scpi_once() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut sim = ScpiVnaSimulator::new();
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            if let Some(reply) = sim.respond(line.trim()) {
                if writer.write_all(&reply).is_err() {
                    break;
                }
            }
        }
    });
    port
}

#[test]
fn scpi_analyzer_over_a_socket_resource() {
    let port = serve_scpi_once();
    let transport =
        resource::open_str(&format!("TCPIP0::127.0.0.1::{port}::SOCKET"), &OpenOptions::default())
            .unwrap();
    let mut analyzer = ScpiVna::new(transport);
    assert!(analyzer.identify().unwrap().contains("N9914A"));
    analyzer.set_sweep_points(11.0).unwrap();
    let spectrum = analyzer.read_iq().unwrap();
    assert_eq!(spectrum.len(), 11);
    assert_eq!(spectrum.frequencies[0], 1.0e9);
}
