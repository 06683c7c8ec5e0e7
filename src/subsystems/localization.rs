//! # Localization subsystem
//!
//! Injection of pose estimates computed outside of the vehicle, typically by a vision or motion capture system,
//! into the vehicle state estimator.
//!
//! Estimates are plain outbound messages: they are not acknowledged and do not need the offboard session. Like
//! setpoints they must be sent continuously for the estimator to keep using them.

use crate::frame::{Frame, PayloadReader, Port};
use crate::link::Uplink;
use crate::{Error, Result};

// Channels
const VISION_CHANNEL: u8 = 0;
const MOCAP_CHANNEL: u8 = 1;

/// Number of elements of the upper triangle of a 6x6 pose covariance matrix
pub const COVARIANCE_SIZE: usize = 21;

/// Pose covariance, upper triangle of the 6x6 matrix (x, y, z, roll, pitch, yaw), row major
pub type Covariance = [f32; COVARIANCE_SIZE];

/// Position and euler angles estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisionPositionEstimate {
    /// Timestamp of the estimate (microseconds, 0 if unknown)
    pub time_usec: u64,
    /// Position in the local NED frame (meters)
    pub position: [f32; 3],
    /// Roll, pitch and yaw (radians)
    pub angles: [f32; 3],
    /// Covariance, `None` if unknown
    pub covariance: Option<Covariance>,
}

/// Position and attitude quaternion estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttitudePositionMocap {
    /// Timestamp of the estimate (microseconds, 0 if unknown)
    pub time_usec: u64,
    /// Attitude quaternion, w x y z
    pub q: [f32; 4],
    /// Position in the local NED frame (meters)
    pub position: [f32; 3],
    /// Covariance, `None` if unknown
    pub covariance: Option<Covariance>,
}

fn encode(time_usec: u64, values: &[f32], covariance: &Option<Covariance>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + 4 * (values.len() + COVARIANCE_SIZE));
    payload.extend_from_slice(&time_usec.to_le_bytes());
    for value in values {
        payload.extend_from_slice(&value.to_le_bytes());
    }

    // An unknown covariance is flagged by a NaN first element
    let mut unknown = [0.0; COVARIANCE_SIZE];
    unknown[0] = f32::NAN;
    for value in covariance.as_ref().unwrap_or(&unknown) {
        payload.extend_from_slice(&value.to_le_bytes());
    }
    payload
}

fn decode_covariance(reader: &mut PayloadReader) -> Result<Option<Covariance>> {
    let mut covariance = [0.0; COVARIANCE_SIZE];
    for value in covariance.iter_mut() {
        *value = reader.f32()?;
    }
    Ok(if covariance[0].is_nan() {
        None
    } else {
        Some(covariance)
    })
}

fn check_channel(frame: &Frame, channel: u8) -> Result<()> {
    if frame.get_port() != Port::Localization || frame.get_channel() != channel {
        return Err(Error::ProtocolError(format!(
            "expected localization channel {}, got {:?}/{}",
            channel,
            frame.get_port(),
            frame.get_channel()
        )));
    }
    Ok(())
}

impl VisionPositionEstimate {
    /// Encode the estimate frame
    pub fn to_frame(&self) -> Frame {
        let values = [
            self.position[0],
            self.position[1],
            self.position[2],
            self.angles[0],
            self.angles[1],
            self.angles[2],
        ];
        Frame::new(
            Port::Localization,
            VISION_CHANNEL,
            encode(self.time_usec, &values, &self.covariance),
        )
    }

    /// Decode an estimate frame, as done by the vehicle
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        check_channel(frame, VISION_CHANNEL)?;
        let mut reader = PayloadReader::new(frame.get_data());

        Ok(Self {
            time_usec: reader.u64()?,
            position: [reader.f32()?, reader.f32()?, reader.f32()?],
            angles: [reader.f32()?, reader.f32()?, reader.f32()?],
            covariance: decode_covariance(&mut reader)?,
        })
    }
}

impl AttitudePositionMocap {
    /// Encode the estimate frame
    pub fn to_frame(&self) -> Frame {
        let values = [
            self.q[0],
            self.q[1],
            self.q[2],
            self.q[3],
            self.position[0],
            self.position[1],
            self.position[2],
        ];
        Frame::new(
            Port::Localization,
            MOCAP_CHANNEL,
            encode(self.time_usec, &values, &self.covariance),
        )
    }

    /// Decode an estimate frame, as done by the vehicle
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        check_channel(frame, MOCAP_CHANNEL)?;
        let mut reader = PayloadReader::new(frame.get_data());

        Ok(Self {
            time_usec: reader.u64()?,
            q: [reader.f32()?, reader.f32()?, reader.f32()?, reader.f32()?],
            position: [reader.f32()?, reader.f32()?, reader.f32()?],
            covariance: decode_covariance(&mut reader)?,
        })
    }
}

/// # Access to the localization subsystem
///
/// See the [localization module documentation](crate::subsystems::localization) for more context and information.
#[derive(Debug)]
pub struct Localization {
    uplink: Uplink,
}

impl Localization {
    pub(crate) fn new(uplink: Uplink) -> Self {
        Self { uplink }
    }

    /// Send a vision position estimate
    ///
    /// Returns the link error if the frame could not be sent.
    pub async fn send_vision_position_estimate(&self, estimate: &VisionPositionEstimate) -> Result<()> {
        self.uplink.send_frame(&estimate.to_frame()).await?;
        Ok(())
    }

    /// Send a motion capture attitude and position estimate
    ///
    /// Returns the link error if the frame could not be sent.
    pub async fn send_attitude_position_mocap(&self, estimate: &AttitudePositionMocap) -> Result<()> {
        self.uplink.send_frame(&estimate.to_frame()).await?;
        Ok(())
    }
}
