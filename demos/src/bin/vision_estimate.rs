// Feed external vision pose estimates while watching the vehicle position

use demos::spawn_sim_vehicle;
use futures::StreamExt;
use offboard_lib::subsystems::localization::VisionPositionEstimate;
use offboard_lib::subsystems::telemetry::{TelemetryCategory, TelemetryData};
use offboard_lib::{loopback, SessionConfig, Vehicle};
use std::time::Duration;
use tokio::time::{interval, Instant};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (link, remote) = loopback();
    let sim = spawn_sim_vehicle(remote);
    let vehicle = Vehicle::connect_from_link(link, SessionConfig::default()).await?;

    let printer = tokio::spawn({
        let mut positions = Box::pin(vehicle.telemetry.stream(TelemetryCategory::Position));
        async move {
            let mut count = 0;
            while let Some(sample) = positions.next().await {
                if let TelemetryData::Position { north_m, east_m, down_m } = sample.data {
                    count += 1;
                    if count % 10 == 0 {
                        println!("position n={:.2} e={:.2} d={:.2}", north_m, east_m, down_m);
                    }
                }
            }
        }
    });

    // Circle of 1 m radius at 30 Hz for 3 seconds
    let start = Instant::now();
    let mut ticker = interval(Duration::from_millis(33));
    while start.elapsed() < Duration::from_secs(3) {
        ticker.tick().await;
        let t = start.elapsed().as_secs_f32();
        let estimate = VisionPositionEstimate {
            time_usec: start.elapsed().as_micros() as u64,
            position: [t.cos(), t.sin(), -1.0],
            angles: [0.0, 0.0, t],
            covariance: None,
        };
        vehicle.localization.send_vision_position_estimate(&estimate).await?;
    }

    vehicle.shutdown().await;
    printer.await?;
    sim.abort();
    Ok(())
}
