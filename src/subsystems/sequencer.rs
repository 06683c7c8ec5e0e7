//! # Command sequencer
//!
//! Runs a scripted list of timed setpoints against an offboard session: the first setpoint is primed, the session
//! is started, each setpoint is held for its duration and the session is stopped at the end.
//!
//! ``` no_run
//! # use offboard_lib::subsystems::sequencer::{CommandSequencer, Step};
//! # use offboard_lib::subsystems::setpoint::Setpoint;
//! # use std::time::Duration;
//! # async fn square(vehicle: &offboard_lib::Vehicle) -> offboard_lib::Result<()> {
//! let sequencer = CommandSequencer::new(vec![
//!     Step::new(Setpoint::velocity_ned(1.0, 0.0, 0.0, 0.0)?, Duration::from_secs(2)),
//!     Step::new(Setpoint::velocity_ned(0.0, 1.0, 0.0, 90.0)?, Duration::from_secs(2)),
//!     Step::new(Setpoint::hold(), Duration::from_secs(1)),
//! ])
//! .with_shutdown(vehicle.shutdown_token());
//!
//! let report = sequencer.run(&vehicle.offboard).await?;
//! println!("{} steps flown", report.completed_steps);
//! # Ok(())
//! # }
//! ```

use crate::shutdown::Shutdown;
use crate::subsystems::offboard::{OffboardSession, SessionState};
use crate::subsystems::setpoint::Setpoint;
use crate::{Error, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::watch;

/// Offboard control operations used by the sequencer
///
/// Implemented by [OffboardSession]. The semantics of the functions are the ones of the session.
#[async_trait]
pub trait OffboardControl: Send + Sync {
    /// Prime or replace the setpoint
    fn set(&self, setpoint: Setpoint) -> Result<()>;

    /// Replace the streamed setpoint of an engaged session
    fn update(&self, setpoint: Setpoint) -> Result<()>;

    /// Engage offboard mode
    async fn start(&self) -> Result<()>;

    /// Leave offboard mode
    async fn stop(&self) -> Result<()>;

    /// Receiver following the session state
    fn watch_state(&self) -> watch::Receiver<SessionState>;
}

#[async_trait]
impl OffboardControl for OffboardSession {
    fn set(&self, setpoint: Setpoint) -> Result<()> {
        OffboardSession::set(self, setpoint)
    }

    fn update(&self, setpoint: Setpoint) -> Result<()> {
        OffboardSession::update(self, setpoint)
    }

    async fn start(&self) -> Result<()> {
        OffboardSession::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        OffboardSession::stop(self).await
    }

    fn watch_state(&self) -> watch::Receiver<SessionState> {
        OffboardSession::watch_state(self)
    }
}

/// One scripted setpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    /// Setpoint to stream
    pub setpoint: Setpoint,
    /// How long the setpoint is held before the next step
    pub hold: Duration,
}

impl Step {
    /// Create a step
    pub fn new(setpoint: Setpoint, hold: Duration) -> Self {
        Self { setpoint, hold }
    }
}

/// Outcome of a completed sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceReport {
    /// Number of steps held to the end
    pub completed_steps: usize,
}

/// Scripted setpoint sequence
#[derive(Debug, Clone)]
pub struct CommandSequencer {
    steps: Vec<Step>,
    shutdown: Option<Shutdown>,
}

impl CommandSequencer {
    /// Create a sequencer for `steps`
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            shutdown: None,
        }
    }

    /// Interrupt the sequence when `shutdown` is triggered
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Steps of the sequence
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Fly the sequence
    ///
    /// An empty sequence returns immediately without starting the session. Otherwise the session is started once
    /// and, if the start succeeded, stopped exactly once whatever happens to the steps.
    ///
    /// A hold is interrupted if the session leaves the `Active` state or on shutdown. Any failure aborts the
    /// remaining steps and is returned as [Error::SequenceAborted] with the index of the failing step. A failure
    /// of the final stop is reported with the step index `steps.len()`.
    pub async fn run<C: OffboardControl + ?Sized>(&self, control: &C) -> Result<SequenceReport> {
        let Some(first) = self.steps.first() else {
            debug!("empty sequence, nothing to fly");
            return Ok(SequenceReport { completed_steps: 0 });
        };

        let abort = |step: usize| move |source: Error| Error::SequenceAborted {
            step,
            source: Box::new(source),
        };

        control.set(first.setpoint).map_err(abort(0))?;
        control.start().await.map_err(abort(0))?;
        info!("sequence started, {} steps", self.steps.len());

        let flown = self.fly_steps(control).await;
        let stopped = control.stop().await;

        match (flown, stopped) {
            (Err(e), stopped) => {
                if let Err(stop_error) = stopped {
                    warn!("stop after aborted sequence failed: {}", stop_error);
                }
                Err(e)
            }
            (Ok(_), Err(e)) => Err(abort(self.steps.len())(e)),
            (Ok(completed_steps), Ok(())) => {
                info!("sequence completed");
                Ok(SequenceReport { completed_steps })
            }
        }
    }

    async fn fly_steps<C: OffboardControl + ?Sized>(&self, control: &C) -> Result<usize> {
        let mut state = control.watch_state();

        for (index, step) in self.steps.iter().enumerate() {
            let aborted = |source: Error| Error::SequenceAborted {
                step: index,
                source: Box::new(source),
            };

            control.update(step.setpoint).map_err(aborted)?;
            debug!("step {}: {:?} for {:?}", index, step.setpoint, step.hold);

            self.hold(step.hold, &mut state).await.map_err(aborted)?;
        }

        Ok(self.steps.len())
    }

    async fn hold(&self, duration: Duration, state: &mut watch::Receiver<SessionState>) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        let shutdown_requested = async {
            match shutdown.as_mut() {
                Some(shutdown) => shutdown.triggered().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = shutdown_requested => Err(Error::Cancelled),
            left = state.wait_for(|s| *s != SessionState::Active) => match left.map(|s| *s) {
                Ok(SessionState::Degraded) => Err(Error::Degraded),
                Ok(_) => Err(Error::NotActive),
                Err(_) => Err(Error::Disconnected),
            },
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
