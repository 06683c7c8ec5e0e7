// Simulated flight controller used by the demos
//
// Plays the vehicle side of a loopback link: acknowledges commands, integrates velocity setpoints, falls back to
// hold when the setpoint stream stops and publishes position, flight mode and landed state telemetry.

use log::{info, warn};
use offboard_lib::command::{Command, CommandId, CommandResult};
use offboard_lib::subsystems::localization::{AttitudePositionMocap, VisionPositionEstimate};
use offboard_lib::subsystems::setpoint::Setpoint;
use offboard_lib::subsystems::telemetry::{FlightMode, LandedState, TelemetryData, TelemetrySample};
use offboard_lib::{Frame, Port, RemoteEndpoint};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};

const OFFBOARD_TIMEOUT: Duration = Duration::from_millis(500);
const TELEMETRY_PERIOD: Duration = Duration::from_millis(50);
const TAKEOFF_ALTITUDE_M: f32 = 2.5;

struct SimState {
    armed: bool,
    mode: FlightMode,
    landed: LandedState,
    position: [f32; 3],
    setpoint: Option<(Instant, Setpoint)>,
    pose_estimates: usize,
    sequence: u32,
}

impl SimState {
    fn new() -> Self {
        Self {
            armed: false,
            mode: FlightMode::Ready,
            landed: LandedState::OnGround,
            position: [0.0; 3],
            setpoint: None,
            pose_estimates: 0,
            sequence: 0,
        }
    }

    fn setpoint_is_fresh(&self) -> bool {
        matches!(self.setpoint, Some((at, _)) if at.elapsed() < OFFBOARD_TIMEOUT)
    }

    fn handle_command(&mut self, command: &Command) -> CommandResult {
        match command.id {
            CommandId::Arm => {
                self.armed = true;
                CommandResult::Accepted
            }
            CommandId::Disarm if self.landed == LandedState::OnGround => {
                self.armed = false;
                CommandResult::Accepted
            }
            CommandId::Takeoff if self.armed => {
                self.landed = LandedState::InAir;
                self.position[2] = -TAKEOFF_ALTITUDE_M;
                self.mode = FlightMode::Hold;
                CommandResult::Accepted
            }
            CommandId::Land | CommandId::ReturnToLaunch => {
                self.mode = FlightMode::Land;
                self.landed = LandedState::OnGround;
                self.position[2] = 0.0;
                CommandResult::Accepted
            }
            CommandId::Kill => {
                self.armed = false;
                self.mode = FlightMode::Ready;
                CommandResult::Accepted
            }
            CommandId::OffboardStart if self.armed && self.setpoint_is_fresh() => {
                self.mode = FlightMode::Offboard;
                CommandResult::Accepted
            }
            CommandId::OffboardStop => {
                if self.mode == FlightMode::Offboard {
                    self.mode = FlightMode::Hold;
                }
                CommandResult::Accepted
            }
            CommandId::SetTelemetryRate => CommandResult::Unsupported,
            _ => CommandResult::Denied,
        }
    }

    fn step(&mut self, dt: f32) {
        if self.mode != FlightMode::Offboard {
            return;
        }
        if !self.setpoint_is_fresh() {
            warn!("[sim] setpoint stream lost, holding position");
            self.mode = FlightMode::Hold;
            return;
        }
        match self.setpoint {
            Some((
                _,
                Setpoint::VelocityNed {
                    north_m_s,
                    east_m_s,
                    down_m_s,
                    ..
                },
            )) => {
                self.position[0] += north_m_s * dt;
                self.position[1] += east_m_s * dt;
                self.position[2] += down_m_s * dt;
            }
            Some((
                _,
                Setpoint::PositionNed {
                    north_m,
                    east_m,
                    down_m,
                    ..
                },
            )) => self.position = [north_m, east_m, down_m],
            _ => (),
        }
    }

    fn telemetry(&mut self) -> Vec<Frame> {
        self.sequence = self.sequence.wrapping_add(1);
        [
            TelemetryData::Position {
                north_m: self.position[0],
                east_m: self.position[1],
                down_m: self.position[2],
            },
            TelemetryData::FlightMode(self.mode),
            TelemetryData::LandedState(self.landed),
        ]
        .into_iter()
        .map(|data| TelemetrySample::new(self.sequence, data).to_frame())
        .collect()
    }
}

/// Run the simulated flight controller until the link is dropped
pub fn spawn_sim_vehicle(remote: RemoteEndpoint) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state = SimState::new();
        let mut ticker = interval(TELEMETRY_PERIOD);

        loop {
            tokio::select! {
                frame = remote.recv_frame() => {
                    let Ok(frame) = frame else { break };
                    match frame.get_port() {
                        Port::Setpoint => {
                            if let Ok(setpoint) = Setpoint::from_frame(&frame) {
                                state.setpoint = Some((Instant::now(), setpoint));
                            }
                        }
                        Port::Command => {
                            let Ok(command) = Command::from_frame(&frame) else { continue };
                            let result = state.handle_command(&command);
                            info!("[sim] {:?} -> {:?}", command.id, result);
                            if remote.send_frame(&command.ack(result).to_frame()).await.is_err() {
                                break;
                            }
                        }
                        Port::Localization => {
                            if VisionPositionEstimate::from_frame(&frame).is_ok()
                                || AttitudePositionMocap::from_frame(&frame).is_ok()
                            {
                                state.pose_estimates += 1;
                                if state.pose_estimates % 10 == 0 {
                                    info!("[sim] {} pose estimates fused", state.pose_estimates);
                                }
                            }
                        }
                        Port::Telemetry => (),
                    }
                }
                _ = ticker.tick() => {
                    state.step(TELEMETRY_PERIOD.as_secs_f32());
                    for frame in state.telemetry() {
                        if remote.send_frame(&frame).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    })
}
