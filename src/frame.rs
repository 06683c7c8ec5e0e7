//! Frame envelope used to multiplex the session traffic over one link
//!
//! Every link message carries exactly one frame: `[port][channel][data...]`. The port selects the
//! subsystem, the channel is interpreted by the subsystem.

use crate::{Error, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Maximum payload length of a frame
pub const MAX_DATA_SIZE: usize = 253;

/// Subsystem ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Port {
    /// Streamed offboard setpoints, ground to vehicle
    Setpoint = 1,
    /// Acknowledged commands (channel 0) and their acks (channel 1)
    Command = 2,
    /// Telemetry samples, channel is the telemetry category
    Telemetry = 3,
    /// External pose estimates, ground to vehicle
    Localization = 4,
}

/// One message exchanged over the link
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    port: Port,
    channel: u8,
    data: Vec<u8>,
}

impl Frame {
    /// Create a frame
    pub fn new(port: Port, channel: u8, data: Vec<u8>) -> Self {
        Self { port, channel, data }
    }

    /// Port of the frame
    pub fn get_port(&self) -> Port {
        self.port
    }

    /// Channel of the frame
    pub fn get_channel(&self) -> u8 {
        self.channel
    }

    /// Payload of the frame
    pub fn get_data(&self) -> &[u8] {
        &self.data
    }

    /// Serialize the frame into a link message
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.data.len());
        bytes.push(self.port.into());
        bytes.push(self.channel);
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Parse a link message
    ///
    /// Returns a [Error::ProtocolError] for a truncated message, an unknown port or an oversized payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::ProtocolError(format!(
                "frame too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes.len() - 2 > MAX_DATA_SIZE {
            return Err(Error::ProtocolError(format!(
                "frame payload too large: {} bytes",
                bytes.len() - 2
            )));
        }
        let port = Port::try_from(bytes[0])
            .map_err(|e| Error::ProtocolError(format!("unknown port {}", e.number)))?;

        Ok(Self::new(port, bytes[1], bytes[2..].to_vec()))
    }
}

/// Little-endian cursor over a frame payload
pub(crate) struct PayloadReader<'a> {
    data: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.data.len() < N {
            return Err(Error::ProtocolError(format!(
                "payload truncated: need {} more bytes, have {}",
                N,
                self.data.len()
            )));
        }
        let (head, rest) = self.data.split_at(N);
        self.data = rest;
        Ok(head.try_into()?)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    pub(crate) fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take()?))
    }

    pub(crate) fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take()?))
    }
}
