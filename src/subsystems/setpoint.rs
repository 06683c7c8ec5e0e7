//! # Offboard setpoints
//!
//! A setpoint is the instant control target streamed to the vehicle while offboard mode is engaged. Each kind of
//! target is its own variant and is always built complete, there is no partially filled setpoint that could carry
//! stale fields from a previous command.
//!
//! On the wire a setpoint is `[type id][4 x f32 little endian]` on the setpoint port, channel 0.

use crate::frame::{Frame, PayloadReader, Port};
use crate::{Error, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};

const SETPOINT_CHANNEL: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum SetpointType {
    Attitude = 1,
    VelocityNed = 2,
    VelocityBody = 3,
    PositionNed = 4,
}

/// Control target for offboard mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setpoint {
    /// Absolute attitude and collective thrust
    Attitude {
        /// Roll angle (degrees, positive is right wing down)
        roll_deg: f32,
        /// Pitch angle (degrees, positive is nose up)
        pitch_deg: f32,
        /// Yaw angle (degrees, positive is clockwise seen from above)
        yaw_deg: f32,
        /// Thrust, 0.0 to 1.0
        thrust: f32,
    },
    /// Velocity in the local north-east-down frame with an absolute yaw
    VelocityNed {
        /// Velocity north (meters/second)
        north_m_s: f32,
        /// Velocity east (meters/second)
        east_m_s: f32,
        /// Velocity down (meters/second)
        down_m_s: f32,
        /// Yaw angle (degrees)
        yaw_deg: f32,
    },
    /// Velocity in the body frame with a yaw rate
    VelocityBody {
        /// Velocity forward (meters/second)
        forward_m_s: f32,
        /// Velocity right (meters/second)
        right_m_s: f32,
        /// Velocity down (meters/second)
        down_m_s: f32,
        /// Yaw rate (degrees/second)
        yawspeed_deg_s: f32,
    },
    /// Position in the local north-east-down frame with an absolute yaw
    PositionNed {
        /// Position north (meters)
        north_m: f32,
        /// Position east (meters)
        east_m: f32,
        /// Position down (meters, negative is up)
        down_m: f32,
        /// Yaw angle (degrees)
        yaw_deg: f32,
    },
}

impl Setpoint {
    /// Attitude setpoint
    ///
    /// Returns an error if the thrust is outside of 0.0 to 1.0 or any value is not finite.
    pub fn attitude(roll_deg: f32, pitch_deg: f32, yaw_deg: f32, thrust: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&thrust) {
            return Err(Error::InvalidArgument(format!(
                "thrust {} outside of 0.0..=1.0",
                thrust
            )));
        }
        Self::Attitude {
            roll_deg,
            pitch_deg,
            yaw_deg,
            thrust,
        }
        .checked()
    }

    /// Velocity setpoint in the local NED frame
    pub fn velocity_ned(north_m_s: f32, east_m_s: f32, down_m_s: f32, yaw_deg: f32) -> Result<Self> {
        Self::VelocityNed {
            north_m_s,
            east_m_s,
            down_m_s,
            yaw_deg,
        }
        .checked()
    }

    /// Velocity setpoint in the body frame
    pub fn velocity_body(
        forward_m_s: f32,
        right_m_s: f32,
        down_m_s: f32,
        yawspeed_deg_s: f32,
    ) -> Result<Self> {
        Self::VelocityBody {
            forward_m_s,
            right_m_s,
            down_m_s,
            yawspeed_deg_s,
        }
        .checked()
    }

    /// Position setpoint in the local NED frame
    pub fn position_ned(north_m: f32, east_m: f32, down_m: f32, yaw_deg: f32) -> Result<Self> {
        Self::PositionNed {
            north_m,
            east_m,
            down_m,
            yaw_deg,
        }
        .checked()
    }

    /// Zero velocity in the body frame, the usual "hold here" setpoint
    pub fn hold() -> Self {
        Self::VelocityBody {
            forward_m_s: 0.0,
            right_m_s: 0.0,
            down_m_s: 0.0,
            yawspeed_deg_s: 0.0,
        }
    }

    fn checked(self) -> Result<Self> {
        if self.fields().1.iter().all(|v| v.is_finite()) {
            Ok(self)
        } else {
            Err(Error::InvalidArgument(format!("non finite value in {:?}", self)))
        }
    }

    fn fields(&self) -> (SetpointType, [f32; 4]) {
        match *self {
            Setpoint::Attitude {
                roll_deg,
                pitch_deg,
                yaw_deg,
                thrust,
            } => (SetpointType::Attitude, [roll_deg, pitch_deg, yaw_deg, thrust]),
            Setpoint::VelocityNed {
                north_m_s,
                east_m_s,
                down_m_s,
                yaw_deg,
            } => (
                SetpointType::VelocityNed,
                [north_m_s, east_m_s, down_m_s, yaw_deg],
            ),
            Setpoint::VelocityBody {
                forward_m_s,
                right_m_s,
                down_m_s,
                yawspeed_deg_s,
            } => (
                SetpointType::VelocityBody,
                [forward_m_s, right_m_s, down_m_s, yawspeed_deg_s],
            ),
            Setpoint::PositionNed {
                north_m,
                east_m,
                down_m,
                yaw_deg,
            } => (SetpointType::PositionNed, [north_m, east_m, down_m, yaw_deg]),
        }
    }

    /// Encode the setpoint frame
    pub fn to_frame(&self) -> Frame {
        let (setpoint_type, values) = self.fields();
        let mut payload = Vec::with_capacity(1 + 4 * 4);
        payload.push(setpoint_type.into());
        for value in values {
            payload.extend_from_slice(&value.to_le_bytes());
        }
        Frame::new(Port::Setpoint, SETPOINT_CHANNEL, payload)
    }

    /// Decode a setpoint frame, as done by the vehicle
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if frame.get_port() != Port::Setpoint {
            return Err(Error::ProtocolError("not a setpoint frame".to_owned()));
        }
        let mut reader = PayloadReader::new(frame.get_data());
        let setpoint_type = SetpointType::try_from(reader.u8()?)
            .map_err(|e| Error::ProtocolError(format!("unknown setpoint type {}", e.number)))?;
        let (a, b, c, d) = (reader.f32()?, reader.f32()?, reader.f32()?, reader.f32()?);

        Ok(match setpoint_type {
            SetpointType::Attitude => Setpoint::Attitude {
                roll_deg: a,
                pitch_deg: b,
                yaw_deg: c,
                thrust: d,
            },
            SetpointType::VelocityNed => Setpoint::VelocityNed {
                north_m_s: a,
                east_m_s: b,
                down_m_s: c,
                yaw_deg: d,
            },
            SetpointType::VelocityBody => Setpoint::VelocityBody {
                forward_m_s: a,
                right_m_s: b,
                down_m_s: c,
                yawspeed_deg_s: d,
            },
            SetpointType::PositionNed => Setpoint::PositionNed {
                north_m: a,
                east_m: b,
                down_m: c,
                yaw_deg: d,
            },
        })
    }
}
