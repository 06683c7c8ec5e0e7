//! # Action subsystem
//!
//! One-shot vehicle commands: arming, takeoff, landing, return to launch and kill, as well as telemetry rate
//! requests. Each command is acknowledged by the vehicle and the functions return once the acknowledgement is
//! received.
//!
//! ``` no_run
//! # async fn takeoff(vehicle: &offboard_lib::Vehicle) -> offboard_lib::Result<()> {
//! vehicle.action.arm().await?;
//! vehicle.action.takeoff().await?;
//! # Ok(())
//! # }
//! ```

use crate::command::{accepted, CommandChannel, CommandId};
use crate::shutdown::Shutdown;
use crate::subsystems::telemetry::TelemetryCategory;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// # Access to the action subsystem
///
/// The functions return [Error::Rejected] if the vehicle refuses the command, [Error::Timeout] if it does not
/// answer in time and [Error::Cancelled] if the vehicle connection shuts down while waiting.
pub struct Action {
    commands: Arc<CommandChannel>,
    ack_timeout: Duration,
    shutdown: Shutdown,
}

impl Action {
    pub(crate) fn new(commands: Arc<CommandChannel>, ack_timeout: Duration, shutdown: Shutdown) -> Self {
        Self {
            commands,
            ack_timeout,
            shutdown,
        }
    }

    async fn command(&self, id: CommandId, params: Vec<u8>) -> Result<()> {
        let result = self
            .commands
            .request(id, params, self.ack_timeout, &self.shutdown)
            .await?;
        accepted(result)
    }

    /// Arm the motors
    pub async fn arm(&self) -> Result<()> {
        self.command(CommandId::Arm, Vec::new()).await
    }

    /// Disarm the motors
    ///
    /// The vehicle refuses to disarm in flight.
    pub async fn disarm(&self) -> Result<()> {
        self.command(CommandId::Disarm, Vec::new()).await
    }

    /// Take off to the takeoff altitude configured in the vehicle
    pub async fn takeoff(&self) -> Result<()> {
        self.command(CommandId::Takeoff, Vec::new()).await
    }

    /// Land at the current position
    pub async fn land(&self) -> Result<()> {
        self.command(CommandId::Land, Vec::new()).await
    }

    /// Fly back to the launch position and land
    pub async fn return_to_launch(&self) -> Result<()> {
        self.command(CommandId::ReturnToLaunch, Vec::new()).await
    }

    /// Stop the motors immediately
    ///
    /// The vehicle falls if it is flying.
    pub async fn kill(&self) -> Result<()> {
        self.command(CommandId::Kill, Vec::new()).await
    }

    /// Set the rate at which the vehicle sends a telemetry category
    ///
    /// A rate of 0 stops the category. Returns [Error::InvalidArgument] for a negative or non finite rate.
    pub async fn set_telemetry_rate(&self, category: TelemetryCategory, rate_hz: f32) -> Result<()> {
        if !rate_hz.is_finite() || rate_hz < 0.0 {
            return Err(Error::InvalidArgument(format!("telemetry rate {} Hz", rate_hz)));
        }

        let mut params = vec![category.into()];
        params.extend_from_slice(&rate_hz.to_le_bytes());
        self.command(CommandId::SetTelemetryRate, params).await
    }
}
