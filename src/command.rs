//! # Acknowledged commands
//!
//! Commands are sent on the command port, channel 0, as `[command id][request sequence][parameters...]`. The
//! vehicle answers on channel 1 with `[command id][request sequence][result]`. The request sequence lets a late
//! acknowledgement of an earlier request be told apart from the answer to the current one.

use crate::dispatch::WaitForFrame;
use crate::frame::{Frame, Port};
use crate::link::Uplink;
use crate::shutdown::Shutdown;
use crate::{Error, Result};
use futures::lock::Mutex;
use log::debug;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;

/// Channel carrying command requests
pub const REQUEST_CHANNEL: u8 = 0;
/// Channel carrying command acknowledgements
pub const ACK_CHANNEL: u8 = 1;

/// Command identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CommandId {
    /// Enter offboard mode
    OffboardStart = 1,
    /// Leave offboard mode
    OffboardStop = 2,
    /// Arm the motors
    Arm = 3,
    /// Disarm the motors
    Disarm = 4,
    /// Take off to the vehicle's configured takeoff altitude
    Takeoff = 5,
    /// Land at the current position
    Land = 6,
    /// Fly back to the launch point
    ReturnToLaunch = 7,
    /// Cut the motors immediately, also in flight
    Kill = 8,
    /// Change the rate of a telemetry stream, parameters are `[category][rate_hz f32]`
    SetTelemetryRate = 9,
}

/// Result code of an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CommandResult {
    /// The command is executed
    Accepted = 0,
    /// The vehicle refuses the command in its current state
    Denied = 1,
    /// The vehicle does not know the command
    Unsupported = 2,
    /// The command was accepted but failed
    Failed = 3,
}

/// Command request as seen by the vehicle
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Requested command
    pub id: CommandId,
    /// Request sequence, echoed in the acknowledgement
    pub sequence: u8,
    /// Command specific parameters
    pub params: Vec<u8>,
}

impl Command {
    /// Build the request frame
    pub fn to_frame(&self) -> Frame {
        let mut data = Vec::with_capacity(2 + self.params.len());
        data.push(self.id.into());
        data.push(self.sequence);
        data.extend_from_slice(&self.params);
        Frame::new(Port::Command, REQUEST_CHANNEL, data)
    }

    /// Parse a request frame
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if frame.get_port() != Port::Command || frame.get_channel() != REQUEST_CHANNEL {
            return Err(Error::ProtocolError("not a command request".to_owned()));
        }
        let data = frame.get_data();
        if data.len() < 2 {
            return Err(Error::ProtocolError("command request too short".to_owned()));
        }
        let id = CommandId::try_from(data[0])
            .map_err(|e| Error::ProtocolError(format!("unknown command {}", e.number)))?;

        Ok(Self {
            id,
            sequence: data[1],
            params: data[2..].to_vec(),
        })
    }

    /// Acknowledgement answering this request
    pub fn ack(&self, result: CommandResult) -> CommandAck {
        CommandAck {
            id: self.id,
            sequence: self.sequence,
            result,
        }
    }
}

/// Command acknowledgement sent by the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    /// Acknowledged command
    pub id: CommandId,
    /// Sequence of the acknowledged request
    pub sequence: u8,
    /// Outcome
    pub result: CommandResult,
}

impl CommandAck {
    /// Build the acknowledgement frame
    pub fn to_frame(&self) -> Frame {
        Frame::new(
            Port::Command,
            ACK_CHANNEL,
            vec![self.id.into(), self.sequence, self.result.into()],
        )
    }

    /// Parse an acknowledgement frame
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let data = frame.get_data();
        if frame.get_channel() != ACK_CHANNEL || data.len() < 3 {
            return Err(Error::ProtocolError("malformed command ack".to_owned()));
        }
        let id = CommandId::try_from(data[0])
            .map_err(|e| Error::ProtocolError(format!("unknown command {}", e.number)))?;
        let result = CommandResult::try_from(data[2])
            .map_err(|e| Error::ProtocolError(format!("unknown command result {}", e.number)))?;

        Ok(Self {
            id,
            sequence: data[1],
            result,
        })
    }
}

/// Request/acknowledge exchange shared by the subsystems sending commands
pub(crate) struct CommandChannel {
    uplink: Uplink,
    ack_downlink: Mutex<flume::Receiver<Frame>>,
    next_sequence: AtomicU8,
}

impl CommandChannel {
    pub(crate) fn new(uplink: Uplink, ack_downlink: flume::Receiver<Frame>) -> Self {
        Self {
            uplink,
            ack_downlink: Mutex::new(ack_downlink),
            next_sequence: AtomicU8::new(0),
        }
    }

    /// Send a command and wait for its acknowledgement
    ///
    /// Returns [Error::Timeout] if no matching ack arrives within `timeout` and [Error::Cancelled] if shutdown is
    /// requested first. Only one exchange runs at a time.
    pub(crate) async fn request(
        &self,
        id: CommandId,
        params: Vec<u8>,
        timeout: Duration,
        shutdown: &Shutdown,
    ) -> Result<CommandResult> {
        let downlink = shutdown.run_until(self.ack_downlink.lock()).await?;

        // Acks of earlier requests that timed out are stale now
        for stale in downlink.drain() {
            debug!("discarding stale ack {:?}", stale.get_data());
        }

        let command = Command {
            id,
            sequence: self.next_sequence.fetch_add(1, Relaxed),
            params,
        };
        debug!("sending command {:?} (seq {})", command.id, command.sequence);
        self.uplink.send_frame(&command.to_frame()).await?;

        let prefix = [u8::from(id), command.sequence];
        let frame = shutdown
            .run_until(tokio::time::timeout(
                timeout,
                downlink.wait_frame(Port::Command, ACK_CHANNEL, &prefix),
            ))
            .await?
            .map_err(|_| Error::Timeout)??;

        Ok(CommandAck::from_frame(&frame)?.result)
    }
}

/// Map an acknowledgement result to the crate error
pub(crate) fn accepted(result: CommandResult) -> Result<()> {
    match result {
        CommandResult::Accepted => Ok(()),
        other => Err(Error::Rejected(other)),
    }
}
