//! # Offboard library
//!
//! This crate is the session core of a program driving a UAV through an external "offboard" control channel. It
//! negotiates and keeps the offboard control authority over an unreliable link, streams setpoints at the rate the
//! vehicle requires and delivers the vehicle telemetry to interested observers.
//!
//! The crate does not implement any transport: the link to the vehicle is provided by the user as an implementation
//! of the [Link] trait. An in-process [loopback()] link is provided for tests and simulations.
//!
//! ## Status
//!
//! The functionalities are implemented in subsystems:
//!
//! | Subsystem | Role |
//! |-----------|------|
//! | Offboard | Offboard mode handshake and setpoint streaming |
//! | Telemetry | Per category telemetry dispatch |
//! | Sequencer | Scripted setpoint sequences |
//! | Action | Arm, takeoff, land, return to launch, kill, telemetry rates |
//! | Localization | Vision and motion capture pose estimates |
//!
//! ## Usage
//!
//! The basic procedure to use the lib is:
//!  - Open a link to the vehicle
//!  - Create a [Vehicle] object from the link and a [SessionConfig], this initializes the subsystems
//!  - Subsystems are available as public fields of the [Vehicle] struct.
//!  - Use the subsystems to control the vehicle
//!  - Call [Vehicle::shutdown()] or drop the Vehicle object
//!
//! All subsystems functions are only taking an un-mutable reference to self (`&self`), the intention is for the
//! Vehicle object to be shared between tasks using `Arc<>`.
//!
//! For example:
//! ``` no_run
//! # use offboard_lib::subsystems::setpoint::Setpoint;
//! # use offboard_lib::subsystems::telemetry::{TelemetryCategory, TelemetryData};
//! # async fn fly(link: offboard_lib::LoopbackLink) -> Result<(), Box<dyn std::error::Error>> {
//! let vehicle = offboard_lib::Vehicle::connect_from_link(link, offboard_lib::SessionConfig::default()).await?;
//!
//! vehicle.subscribe_telemetry(TelemetryCategory::Position, |sample| {
//!     if let TelemetryData::Position { north_m, east_m, down_m } = sample.data {
//!         println!("Position: {:.2} {:.2} {:.2}", north_m, east_m, down_m);
//!     }
//! });
//!
//! vehicle.action.arm().await?;
//! vehicle.action.takeoff().await?;
//!
//! vehicle.update_setpoint(Setpoint::hold())?;
//! vehicle.start_session().await?;
//! vehicle.update_setpoint(Setpoint::velocity_body(0.0, 0.0, 0.0, 45.0)?)?;
//! tokio::time::sleep(std::time::Duration::from_secs(4)).await;
//! vehicle.stop_session().await?;
//!
//! vehicle.action.land().await?;
//! vehicle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod command;
mod config;
mod dispatch;
mod error;
pub mod frame;
mod link;
mod observer;
pub mod shutdown;
mod vehicle;

pub mod subsystems;

pub use crate::config::SessionConfig;
pub use crate::error::{Error, LinkError, Result};
pub use crate::frame::{Frame, Port};
pub use crate::link::{loopback, Link, LinkLease, LoopbackLink, RemoteEndpoint, Uplink};
pub use crate::shutdown::Shutdown;
pub use crate::vehicle::Vehicle;
