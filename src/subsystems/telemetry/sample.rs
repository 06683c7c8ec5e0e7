//! Telemetry sample types and their frame layout
//!
//! A telemetry frame is sent on the telemetry port with the category id as channel. The payload starts with the
//! sample sequence (`u32`, little endian) followed by the category fields, all little endian.

use crate::frame::{Frame, PayloadReader, Port};
use crate::{Error, Result};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

/// Telemetry categories
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum TelemetryCategory {
    /// Sensor calibration and estimator readiness
    Health = 0,
    /// Local position (NED)
    Position = 1,
    /// Euler attitude
    Attitude = 2,
    /// Local velocity (NED)
    Velocity = 3,
    /// Battery state
    Battery = 4,
    /// Radio control link state
    RcStatus = 5,
    /// Active flight mode
    FlightMode = 6,
    /// Landed state
    LandedState = 7,
    /// GNSS fix
    Gps = 8,
    /// Actuator control targets
    ActuatorTarget = 9,
}

impl TelemetryCategory {
    /// All the categories, in id order
    pub const ALL: [TelemetryCategory; 10] = [
        TelemetryCategory::Health,
        TelemetryCategory::Position,
        TelemetryCategory::Attitude,
        TelemetryCategory::Velocity,
        TelemetryCategory::Battery,
        TelemetryCategory::RcStatus,
        TelemetryCategory::FlightMode,
        TelemetryCategory::LandedState,
        TelemetryCategory::Gps,
        TelemetryCategory::ActuatorTarget,
    ];
}

// Health bit positions
const BIT_GYROMETER_CALIBRATION_OK: u8 = 0;
const BIT_ACCELEROMETER_CALIBRATION_OK: u8 = 1;
const BIT_MAGNETOMETER_CALIBRATION_OK: u8 = 2;
const BIT_LOCAL_POSITION_OK: u8 = 3;
const BIT_GLOBAL_POSITION_OK: u8 = 4;
const BIT_HOME_POSITION_OK: u8 = 5;
const BIT_ARMABLE: u8 = 6;

/// Health bitfield
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    /// Raw bitfield value
    pub raw: u16,
}

impl Health {
    /// Create from raw bitfield value
    pub fn from_bits(bits: u16) -> Self {
        Self { raw: bits }
    }

    fn bit(&self, bit: u8) -> bool {
        (self.raw >> bit) & 0x01 != 0
    }

    /// Gyrometer is calibrated
    pub fn is_gyrometer_calibration_ok(&self) -> bool {
        self.bit(BIT_GYROMETER_CALIBRATION_OK)
    }

    /// Accelerometer is calibrated
    pub fn is_accelerometer_calibration_ok(&self) -> bool {
        self.bit(BIT_ACCELEROMETER_CALIBRATION_OK)
    }

    /// Magnetometer is calibrated
    pub fn is_magnetometer_calibration_ok(&self) -> bool {
        self.bit(BIT_MAGNETOMETER_CALIBRATION_OK)
    }

    /// Local position estimate is good enough to fly in position control
    pub fn is_local_position_ok(&self) -> bool {
        self.bit(BIT_LOCAL_POSITION_OK)
    }

    /// Global position estimate is good enough to fly in position control
    pub fn is_global_position_ok(&self) -> bool {
        self.bit(BIT_GLOBAL_POSITION_OK)
    }

    /// Home position is initialized
    pub fn is_home_position_ok(&self) -> bool {
        self.bit(BIT_HOME_POSITION_OK)
    }

    /// The vehicle accepts an arming command
    pub fn is_armable(&self) -> bool {
        self.bit(BIT_ARMABLE)
    }

    /// Every check passes
    pub fn is_all_ok(&self) -> bool {
        (BIT_GYROMETER_CALIBRATION_OK..=BIT_ARMABLE).all(|bit| self.bit(bit))
    }

    /// Names of the failing checks
    pub fn failing_checks(&self) -> Vec<&'static str> {
        let checks = [
            ("Gyrometer calibration", self.is_gyrometer_calibration_ok()),
            ("Accelerometer calibration", self.is_accelerometer_calibration_ok()),
            ("Magnetometer calibration", self.is_magnetometer_calibration_ok()),
            ("Local position", self.is_local_position_ok()),
            ("Global position", self.is_global_position_ok()),
            ("Home position", self.is_home_position_ok()),
            ("Armable", self.is_armable()),
        ];

        checks
            .iter()
            .filter_map(|(name, ok)| if *ok { None } else { Some(*name) })
            .collect()
    }
}

/// Flight mode reported by the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum FlightMode {
    /// Mode not known to this library
    #[num_enum(default)]
    Unknown = 0,
    /// Armed and ready to take off
    Ready = 1,
    /// Taking off
    Takeoff = 2,
    /// Holding position
    Hold = 3,
    /// Flying a mission
    Mission = 4,
    /// Returning to launch
    ReturnToLaunch = 5,
    /// Landing
    Land = 6,
    /// Following offboard setpoints
    Offboard = 7,
    /// Manual control
    Manual = 8,
    /// Altitude control
    Altctl = 9,
    /// Position control
    Posctl = 10,
    /// Acro
    Acro = 11,
    /// Stabilized
    Stabilized = 12,
}

/// Landed state reported by the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum LandedState {
    /// State not known
    #[num_enum(default)]
    Unknown = 0,
    /// On the ground
    OnGround = 1,
    /// Flying
    InAir = 2,
    /// Taking off
    TakingOff = 3,
    /// Landing
    Landing = 4,
}

/// Payload of a telemetry sample
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryData {
    /// Health checks
    Health(Health),
    /// Local position
    Position {
        /// Position north (meters)
        north_m: f32,
        /// Position east (meters)
        east_m: f32,
        /// Position down (meters)
        down_m: f32,
    },
    /// Attitude
    Attitude {
        /// Roll (degrees)
        roll_deg: f32,
        /// Pitch (degrees)
        pitch_deg: f32,
        /// Yaw (degrees)
        yaw_deg: f32,
    },
    /// Local velocity
    Velocity {
        /// Velocity north (meters/second)
        north_m_s: f32,
        /// Velocity east (meters/second)
        east_m_s: f32,
        /// Velocity down (meters/second)
        down_m_s: f32,
    },
    /// Battery
    Battery {
        /// Voltage (volts)
        voltage_v: f32,
        /// Remaining charge, 0.0 to 1.0
        remaining: f32,
    },
    /// Radio control link
    RcStatus {
        /// An RC link was available at some point
        was_available_once: bool,
        /// An RC link is available now
        is_available: bool,
        /// Signal strength (percent)
        signal_strength_percent: f32,
    },
    /// Flight mode
    FlightMode(FlightMode),
    /// Landed state
    LandedState(LandedState),
    /// GNSS fix
    Gps {
        /// Latitude (degrees)
        latitude_deg: f64,
        /// Longitude (degrees)
        longitude_deg: f64,
        /// Altitude above mean sea level (meters)
        absolute_altitude_m: f32,
        /// Number of satellites used
        num_satellites: u8,
        /// Fix type, 0 = no fix, 2 = 2D, 3 = 3D
        fix_type: u8,
    },
    /// Actuator control targets of one control group
    ActuatorTarget {
        /// Control group
        group: u8,
        /// Normalized controls
        controls: [f32; 8],
    },
}

impl TelemetryData {
    /// Category of the data
    pub fn category(&self) -> TelemetryCategory {
        match self {
            TelemetryData::Health(_) => TelemetryCategory::Health,
            TelemetryData::Position { .. } => TelemetryCategory::Position,
            TelemetryData::Attitude { .. } => TelemetryCategory::Attitude,
            TelemetryData::Velocity { .. } => TelemetryCategory::Velocity,
            TelemetryData::Battery { .. } => TelemetryCategory::Battery,
            TelemetryData::RcStatus { .. } => TelemetryCategory::RcStatus,
            TelemetryData::FlightMode(_) => TelemetryCategory::FlightMode,
            TelemetryData::LandedState(_) => TelemetryCategory::LandedState,
            TelemetryData::Gps { .. } => TelemetryCategory::Gps,
            TelemetryData::ActuatorTarget { .. } => TelemetryCategory::ActuatorTarget,
        }
    }
}

/// One telemetry sample
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    /// Sequence number assigned by the vehicle, increasing per category
    pub sequence: u32,
    /// Sample payload
    pub data: TelemetryData,
}

impl TelemetrySample {
    /// Create a sample
    pub fn new(sequence: u32, data: TelemetryData) -> Self {
        Self { sequence, data }
    }

    /// Category of the sample
    pub fn category(&self) -> TelemetryCategory {
        self.data.category()
    }

    /// True if this sample comes after `other` in sequence order, wrapping around `u32::MAX`
    ///
    /// Assumes both samples come from the same run of the vehicle. A vehicle that reboots restarts its sequence,
    /// its new samples compare as older until the sequence catches up, see [TelemetryHub::reset()].
    ///
    /// [TelemetryHub::reset()]: crate::subsystems::telemetry::TelemetryHub::reset
    pub fn is_newer_than(&self, other: &TelemetrySample) -> bool {
        (self.sequence.wrapping_sub(other.sequence) as i32) > 0
    }

    /// Encode the sample frame, as done by the vehicle
    pub fn to_frame(&self) -> Frame {
        let mut payload = Vec::with_capacity(48);
        payload.extend_from_slice(&self.sequence.to_le_bytes());

        match &self.data {
            TelemetryData::Health(health) => payload.extend_from_slice(&health.raw.to_le_bytes()),
            TelemetryData::Position {
                north_m,
                east_m,
                down_m,
            } => put_f32(&mut payload, &[*north_m, *east_m, *down_m]),
            TelemetryData::Attitude {
                roll_deg,
                pitch_deg,
                yaw_deg,
            } => put_f32(&mut payload, &[*roll_deg, *pitch_deg, *yaw_deg]),
            TelemetryData::Velocity {
                north_m_s,
                east_m_s,
                down_m_s,
            } => put_f32(&mut payload, &[*north_m_s, *east_m_s, *down_m_s]),
            TelemetryData::Battery {
                voltage_v,
                remaining,
            } => put_f32(&mut payload, &[*voltage_v, *remaining]),
            TelemetryData::RcStatus {
                was_available_once,
                is_available,
                signal_strength_percent,
            } => {
                payload.push(*was_available_once as u8);
                payload.push(*is_available as u8);
                put_f32(&mut payload, &[*signal_strength_percent]);
            }
            TelemetryData::FlightMode(mode) => payload.push((*mode).into()),
            TelemetryData::LandedState(state) => payload.push((*state).into()),
            TelemetryData::Gps {
                latitude_deg,
                longitude_deg,
                absolute_altitude_m,
                num_satellites,
                fix_type,
            } => {
                payload.extend_from_slice(&latitude_deg.to_le_bytes());
                payload.extend_from_slice(&longitude_deg.to_le_bytes());
                put_f32(&mut payload, &[*absolute_altitude_m]);
                payload.push(*num_satellites);
                payload.push(*fix_type);
            }
            TelemetryData::ActuatorTarget { group, controls } => {
                payload.push(*group);
                put_f32(&mut payload, &controls[..]);
            }
        }

        Frame::new(Port::Telemetry, self.category().into(), payload)
    }

    /// Decode a telemetry frame
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if frame.get_port() != Port::Telemetry {
            return Err(Error::ProtocolError("not a telemetry frame".to_owned()));
        }
        let category = TelemetryCategory::try_from(frame.get_channel()).map_err(|e| {
            Error::ProtocolError(format!("unknown telemetry category {}", e.number))
        })?;

        let mut r = PayloadReader::new(frame.get_data());
        let sequence = r.u32()?;

        let data = match category {
            TelemetryCategory::Health => TelemetryData::Health(Health::from_bits(r.u16()?)),
            TelemetryCategory::Position => TelemetryData::Position {
                north_m: r.f32()?,
                east_m: r.f32()?,
                down_m: r.f32()?,
            },
            TelemetryCategory::Attitude => TelemetryData::Attitude {
                roll_deg: r.f32()?,
                pitch_deg: r.f32()?,
                yaw_deg: r.f32()?,
            },
            TelemetryCategory::Velocity => TelemetryData::Velocity {
                north_m_s: r.f32()?,
                east_m_s: r.f32()?,
                down_m_s: r.f32()?,
            },
            TelemetryCategory::Battery => TelemetryData::Battery {
                voltage_v: r.f32()?,
                remaining: r.f32()?,
            },
            TelemetryCategory::RcStatus => TelemetryData::RcStatus {
                was_available_once: r.u8()? != 0,
                is_available: r.u8()? != 0,
                signal_strength_percent: r.f32()?,
            },
            TelemetryCategory::FlightMode => TelemetryData::FlightMode(FlightMode::from(r.u8()?)),
            TelemetryCategory::LandedState => {
                TelemetryData::LandedState(LandedState::from(r.u8()?))
            }
            TelemetryCategory::Gps => TelemetryData::Gps {
                latitude_deg: r.f64()?,
                longitude_deg: r.f64()?,
                absolute_altitude_m: r.f32()?,
                num_satellites: r.u8()?,
                fix_type: r.u8()?,
            },
            TelemetryCategory::ActuatorTarget => {
                let group = r.u8()?;
                let mut controls = [0.0; 8];
                for control in controls.iter_mut() {
                    *control = r.f32()?;
                }
                TelemetryData::ActuatorTarget { group, controls }
            }
        };

        Ok(Self { sequence, data })
    }
}

fn put_f32(payload: &mut Vec<u8>, values: &[f32]) {
    for value in values {
        payload.extend_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_reports_failing_checks() {
        let health = Health::from_bits(0b0111_0111);
        assert!(!health.is_all_ok());
        assert_eq!(health.failing_checks(), vec!["Local position"]);
        assert!(Health::from_bits(0x7f).is_all_ok());
    }

    #[test]
    fn unknown_modes_fall_back_to_unknown() {
        let frame = Frame::new(Port::Telemetry, 6, vec![1, 0, 0, 0, 200]);
        let sample = TelemetrySample::from_frame(&frame).unwrap();
        assert_eq!(sample.data, TelemetryData::FlightMode(FlightMode::Unknown));
    }

    #[test]
    fn truncated_payload_is_a_protocol_error() {
        let frame = Frame::new(Port::Telemetry, 4, vec![1, 0, 0, 0, 0, 0]);
        assert!(matches!(
            TelemetrySample::from_frame(&frame),
            Err(Error::ProtocolError(_))
        ));
    }

    #[test]
    fn sequence_order_wraps() {
        let old = TelemetrySample::new(u32::MAX, TelemetryData::FlightMode(FlightMode::Hold));
        let new = TelemetrySample::new(1, TelemetryData::FlightMode(FlightMode::Hold));
        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
        assert!(!new.is_newer_than(&new));
    }
}
