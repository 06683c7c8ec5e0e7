//! # Vehicle subsystems
//!
//! The functionalities of the library are organized in subsystems. Subsystems are greatly independent and each have
//! one logical role: streaming setpoints, managing the offboard session, dispatching telemetry, sending one-shot
//! commands or injecting pose estimates.
//!
//! Subsystems are available as public fields of the [Vehicle](crate::Vehicle) struct.

pub mod action;
pub mod localization;
pub mod offboard;
pub mod sequencer;
pub mod setpoint;
pub mod streamer;
pub mod telemetry;
