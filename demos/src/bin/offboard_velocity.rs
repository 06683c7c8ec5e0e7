// Fly a square with velocity setpoints against the simulated flight controller
//
// The session configuration is read from `offboard.toml` when given as first argument.

use demos::spawn_sim_vehicle;
use offboard_lib::subsystems::sequencer::{CommandSequencer, Step};
use offboard_lib::subsystems::setpoint::Setpoint;
use offboard_lib::subsystems::telemetry::{FlightMode, TelemetryCategory, TelemetryData};
use offboard_lib::{loopback, SessionConfig, Vehicle};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };

    let (link, remote) = loopback();
    let sim = spawn_sim_vehicle(remote);
    let vehicle = Vehicle::connect_from_link(link, config).await?;

    vehicle.subscribe_session_state(|change| {
        println!("session {:?} -> {:?}", change.previous, change.current);
    });
    vehicle.subscribe_telemetry(TelemetryCategory::Position, |sample| {
        if let TelemetryData::Position { north_m, east_m, down_m } = sample.data {
            if sample.sequence % 20 == 0 {
                println!("position n={:.2} e={:.2} d={:.2}", north_m, east_m, down_m);
            }
        }
    });

    vehicle.action.arm().await?;
    vehicle.action.takeoff().await?;

    let side = Duration::from_secs(2);
    let steps = vec![
        Step::new(Setpoint::velocity_ned(1.0, 0.0, 0.0, 0.0)?, side),
        Step::new(Setpoint::velocity_ned(0.0, 1.0, 0.0, 90.0)?, side),
        Step::new(Setpoint::velocity_ned(-1.0, 0.0, 0.0, 180.0)?, side),
        Step::new(Setpoint::velocity_ned(0.0, -1.0, 0.0, 270.0)?, side),
        Step::new(Setpoint::velocity_ned(0.0, 0.0, 0.0, 0.0)?, Duration::from_millis(500)),
    ];
    let report = CommandSequencer::new(steps)
        .with_shutdown(vehicle.shutdown_token())
        .run(&vehicle.offboard)
        .await?;
    println!("square done, {} steps flown", report.completed_steps);

    vehicle
        .telemetry
        .wait_for(TelemetryCategory::FlightMode, Duration::from_secs(1), |s| {
            s.data == TelemetryData::FlightMode(FlightMode::Hold)
        })
        .await?;

    vehicle.action.land().await?;
    vehicle.action.disarm().await?;

    vehicle.shutdown().await;
    sim.abort();
    Ok(())
}
