//! # Offboard session
//!
//! The offboard session negotiates control authority with the vehicle and keeps it alive by streaming setpoints.
//!
//! The session goes through the states `Idle → Starting → Active → Stopping → Idle`. If the setpoint stream fails
//! or the link is lost while the session is engaged, it moves to `Degraded` and stops streaming: the vehicle falls
//! back to its own failsafe. `Degraded` is left by [OffboardSession::stop()], [OffboardSession::abort()] or a fresh
//! [OffboardSession::start()].
//!
//! The vehicle refuses offboard mode unless it already receives setpoints, so a setpoint must be primed with
//! [OffboardSession::set()] before starting:
//!
//! ``` no_run
//! # use offboard_lib::subsystems::setpoint::Setpoint;
//! # async fn fly(vehicle: &offboard_lib::Vehicle) -> offboard_lib::Result<()> {
//! vehicle.offboard.set(Setpoint::hold())?;
//! vehicle.offboard.start().await?;
//!
//! vehicle.offboard.update(Setpoint::velocity_body(1.0, 0.0, 0.0, 0.0)?)?;
//! tokio::time::sleep(std::time::Duration::from_secs(2)).await;
//!
//! vehicle.offboard.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Every state transition is published to the callbacks registered with [OffboardSession::subscribe_state()] and
//! to the streams returned by [OffboardSession::state_events()].

use crate::command::{CommandChannel, CommandId, CommandResult};
use crate::config::SessionConfig;
use crate::error::LinkError;
use crate::link::{LinkLease, Uplink};
use crate::observer::Observers;
use crate::shutdown::{self, Shutdown};
use crate::subsystems::setpoint::Setpoint;
use crate::subsystems::streamer::{FaultReport, SetpointStreamer, StreamFault};
use crate::{Error, Result};
use async_broadcast::{broadcast, InactiveReceiver};
use futures::lock::Mutex;
use futures::Stream;
use log::{debug, info, warn};
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const STATE_EVENTS_CAPACITY: usize = 32;

/// Lifecycle state of an offboard session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No control authority, nothing streamed
    Idle,
    /// Streaming, waiting for the vehicle to accept offboard mode
    Starting,
    /// Offboard mode engaged
    Active,
    /// Streaming, waiting for the vehicle to leave offboard mode
    Stopping,
    /// The stream failed while engaged, control authority is lost
    Degraded,
}

/// State transition event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// State before the transition
    pub previous: SessionState,
    /// State after the transition
    pub current: SessionState,
}

/// Token returned by [OffboardSession::subscribe_state()]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateSubscription(u64);

enum SessionEvent {
    Changed(StateChange),
    Closed,
}

struct SessionInner {
    lease: std::sync::Mutex<Option<LinkLease>>,
    streamer: SetpointStreamer,
    commands: Arc<CommandChannel>,
    // Also serializes the writes to the streamer setpoint
    primed: std::sync::Mutex<Option<Setpoint>>,
    state: watch::Sender<SessionState>,
    events: flume::Sender<SessionEvent>,
    observers: Arc<Observers<StateChange>>,
    next_id: AtomicU64,
    config: SessionConfig,
    shutdown: Shutdown,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `to` if the current state matches `from`, returns the previous state on success
    fn transition(&self, from: impl Fn(SessionState) -> bool, to: SessionState) -> Option<SessionState> {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if *state == to || !from(*state) {
                return false;
            }
            let _ = self.events.send(SessionEvent::Changed(StateChange {
                previous: *state,
                current: to,
            }));
            previous = Some(*state);
            *state = to;
            true
        });

        if let Some(previous) = previous {
            info!("offboard session {:?} -> {:?}", previous, to);
        }
        previous
    }

    fn force_idle(&self) {
        self.transition(|_| true, SessionState::Idle);
    }

    fn write_setpoint(&self, setpoint: Setpoint) {
        let mut primed = self.primed.lock().unwrap_or_else(|e| e.into_inner());
        *primed = Some(setpoint);
        self.streamer.set(setpoint);
    }

    fn resync_setpoint(&self) {
        let primed = self.primed.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(setpoint) = *primed {
            self.streamer.set(setpoint);
        }
    }

    async fn degrade(&self, report: FaultReport) {
        let FaultReport { generation, fault } = report;
        if generation != self.streamer.generation() {
            debug!("ignoring {:?} of previous stream {}", fault, generation);
            return;
        }
        if !matches!(
            self.state(),
            SessionState::Starting | SessionState::Active | SessionState::Stopping
        ) {
            debug!("ignoring {:?} in state {:?}", fault, self.state());
            return;
        }

        self.streamer.stop().await;
        if self
            .transition(
                |s| matches!(s, SessionState::Starting | SessionState::Active | SessionState::Stopping),
                SessionState::Degraded,
            )
            .is_some()
        {
            warn!("offboard session degraded: {:?}", fault);
        }
    }
}

/// # Access to the offboard session
///
/// See the [offboard module documentation](crate::subsystems::offboard) for more context and information.
pub struct OffboardSession {
    inner: Arc<SessionInner>,
    transition: Mutex<()>,
    state_events: InactiveReceiver<StateChange>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OffboardSession {
    /// Create a session streaming over `uplink`
    ///
    /// Takes the link lease, fails with [Error::LinkBusy] if another session holds it. A message on `link_closed`
    /// is handled as a link loss.
    pub(crate) fn new(
        uplink: Uplink,
        commands: Arc<CommandChannel>,
        config: SessionConfig,
        shutdown: Shutdown,
        link_closed: flume::Receiver<()>,
    ) -> Result<Self> {
        let lease = uplink.acquire_lease()?;

        let (faults_tx, faults_rx) = flume::unbounded();
        let streamer = SetpointStreamer::new(
            uplink,
            config.setpoint_period(),
            config.send_failure_threshold,
            faults_tx,
        );

        let (state, _) = watch::channel(SessionState::Idle);
        let (events, events_rx) = flume::unbounded();
        let observers: Arc<Observers<StateChange>> = Arc::default();

        let (mut broadcast_tx, broadcast_rx) = broadcast(STATE_EVENTS_CAPACITY);
        broadcast_tx.set_overflow(true);
        broadcast_tx.set_await_active(false);

        let inner = Arc::new(SessionInner {
            lease: std::sync::Mutex::new(Some(lease)),
            streamer,
            commands,
            primed: std::sync::Mutex::new(None),
            state,
            events,
            observers: observers.clone(),
            next_id: AtomicU64::new(0),
            config,
            shutdown,
        });

        let event_task = tokio::spawn(async move {
            while let Ok(SessionEvent::Changed(change)) = events_rx.recv_async().await {
                let _ = broadcast_tx.try_broadcast(change);

                let observers = observers.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || observers.dispatch(&change)).await {
                    warn!("session state observer panicked: {}", e);
                }
            }
        });
        let fault_task = tokio::spawn(fault_loop(inner.clone(), faults_rx, link_closed));

        Ok(Self {
            inner,
            transition: Mutex::new(()),
            state_events: broadcast_rx.deactivate(),
            tasks: Mutex::new(vec![event_task, fault_task]),
        })
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Receiver following the session state
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Stream of the state transitions happening after this call
    ///
    /// A stream that falls too far behind loses the oldest transitions.
    pub fn state_events(&self) -> impl Stream<Item = StateChange> {
        self.state_events.activate_cloned()
    }

    /// Register a callback called on every state transition
    ///
    /// Callbacks are called in registration order from a dedicated worker, never from the task causing the
    /// transition.
    pub fn subscribe_state<F>(&self, callback: F) -> StateSubscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Relaxed);
        self.inner.observers.insert(id, Arc::new(callback));
        StateSubscription(id)
    }

    /// Remove a state callback, returns false if it was already removed
    pub fn unsubscribe_state(&self, subscription: StateSubscription) -> bool {
        self.inner.observers.remove(subscription.0)
    }

    /// Setpoint streamed by the session
    pub fn current_setpoint(&self) -> Option<Setpoint> {
        *self.inner.primed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the setpoint
    ///
    /// Before starting, this primes the setpoint sent first by [OffboardSession::start()]. While starting or
    /// active it replaces the streamed setpoint. Fails with [Error::NotActive] while stopping.
    pub fn set(&self, setpoint: Setpoint) -> Result<()> {
        if self.state() == SessionState::Stopping {
            return Err(Error::NotActive);
        }
        self.inner.write_setpoint(setpoint);
        Ok(())
    }

    /// Replace the streamed setpoint
    ///
    /// Fails with [Error::NotActive] unless the session is starting or active.
    pub fn update(&self, setpoint: Setpoint) -> Result<()> {
        match self.state() {
            SessionState::Starting | SessionState::Active => {
                self.inner.write_setpoint(setpoint);
                Ok(())
            }
            _ => Err(Error::NotActive),
        }
    }

    /// Engage offboard mode
    ///
    /// Starts streaming the primed setpoint, then requests offboard mode and waits for the vehicle to accept it.
    /// If the vehicle denies the request or does not answer within the ack timeout, the stream is stopped and the
    /// session returns to `Idle` with [Error::Rejected]. A shutdown while waiting returns [Error::Cancelled] and
    /// leaves the stream running for the stop handshake of the shutdown.
    ///
    /// Fails with [Error::NoSetpointPrimed] if no setpoint was ever set, and with [Error::AlreadyStreaming] if the
    /// session is already starting or active.
    pub async fn start(&self) -> Result<()> {
        let _transition = self.inner.shutdown.run_until(self.transition.lock()).await?;
        let inner = &self.inner;

        let initial = {
            let primed = inner.primed.lock().unwrap_or_else(|e| e.into_inner());
            let initial = match (inner.state(), *primed) {
                (SessionState::Starting | SessionState::Active, _) => return Err(Error::AlreadyStreaming),
                (SessionState::Stopping, _) => return Err(Error::NotActive),
                (_, None) => return Err(Error::NoSetpointPrimed),
                (_, Some(initial)) => initial,
            };
            inner.transition(
                |s| matches!(s, SessionState::Idle | SessionState::Degraded),
                SessionState::Starting,
            );
            initial
        };

        if let Err(e) = inner.streamer.start(initial).await {
            inner.transition(|s| s == SessionState::Starting, SessionState::Idle);
            return Err(e);
        }
        // A set() may have landed while the stream was starting
        inner.resync_setpoint();

        let outcome = inner
            .commands
            .request(
                CommandId::OffboardStart,
                Vec::new(),
                inner.config.ack_timeout(),
                &inner.shutdown,
            )
            .await;

        if let Ok(CommandResult::Accepted) = outcome {
            if inner
                .transition(|s| s == SessionState::Starting, SessionState::Active)
                .is_some()
            {
                return Ok(());
            }
        }

        if matches!(outcome, Err(Error::Cancelled))
            && inner.shutdown.is_triggered()
            && inner.state() == SessionState::Starting
        {
            // The start request may have been accepted, the shutdown handshake leaves offboard mode
            debug!("offboard start interrupted by shutdown");
            return Err(Error::Cancelled);
        }

        inner.streamer.stop().await;
        if inner.state() == SessionState::Degraded {
            return Err(Error::Degraded);
        }
        let aborted = inner.state() != SessionState::Starting;
        inner.transition(|s| s == SessionState::Starting, SessionState::Idle);

        match outcome {
            _ if aborted => Err(Error::Cancelled),
            Ok(CommandResult::Accepted) => Err(Error::Cancelled),
            Ok(result) => {
                warn!("offboard start rejected: {:?}", result);
                Err(Error::Rejected(result))
            }
            Err(Error::Timeout) => {
                warn!("offboard start not acknowledged in time");
                Err(Error::Rejected(CommandResult::Failed))
            }
            Err(e) => Err(e),
        }
    }

    /// Leave offboard mode
    ///
    /// Requests the vehicle to leave offboard mode and keeps streaming until it acknowledges or the ack timeout
    /// elapses. The stream is stopped in all cases and the session returns to `Idle`. Returns [Error::Timeout] if
    /// the vehicle did not answer and [Error::Rejected] if it refused.
    ///
    /// Does nothing when the session is idle. From `Degraded` it only returns the session to `Idle`.
    pub async fn stop(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let inner = &self.inner;

        match inner.state() {
            SessionState::Idle => return Ok(()),
            SessionState::Degraded => {
                inner.streamer.stop().await;
                inner.transition(|s| s == SessionState::Degraded, SessionState::Idle);
                return Ok(());
            }
            SessionState::Starting | SessionState::Stopping => return Err(Error::NotActive),
            SessionState::Active => (),
        }

        inner.transition(|s| s == SessionState::Active, SessionState::Stopping);
        let outcome = inner
            .commands
            .request(
                CommandId::OffboardStop,
                Vec::new(),
                inner.config.ack_timeout(),
                &inner.shutdown,
            )
            .await;

        inner.streamer.stop().await;
        inner.transition(
            |s| matches!(s, SessionState::Stopping | SessionState::Degraded),
            SessionState::Idle,
        );

        match outcome {
            Ok(CommandResult::Accepted) => Ok(()),
            Ok(result) => {
                warn!("offboard stop rejected: {:?}", result);
                Err(Error::Rejected(result))
            }
            Err(e) => {
                warn!("offboard stop: {}", e);
                Err(e)
            }
        }
    }

    /// Stop streaming and return to `Idle` without telling the vehicle
    ///
    /// The vehicle detects the missing setpoints and falls back to its failsafe.
    pub async fn abort(&self) {
        warn!("offboard session aborted");
        self.inner.streamer.stop().await;
        self.inner.force_idle();
    }

    /// True while setpoints are being transmitted
    pub fn is_streaming(&self) -> bool {
        self.inner.streamer.is_streaming()
    }

    /// Release control authority during the vehicle shutdown
    ///
    /// Expects the shutdown token to be triggered already, so that pending [OffboardSession::start()] and
    /// [OffboardSession::stop()] calls return. A session that is engaged, or was interrupted while waiting for
    /// the start acknowledgement, tries a stop handshake bounded by the shutdown timeout while the stream keeps
    /// running. The session then ends in `Idle` with the stream stopped and the lease released.
    pub(crate) async fn shutdown(&self) {
        let _transition = self.transition.lock().await;
        let inner = &self.inner;

        if inner
            .transition(
                |s| matches!(s, SessionState::Starting | SessionState::Active),
                SessionState::Stopping,
            )
            .is_some()
        {
            // The session token is already triggered, the handshake runs under its own
            let (_handshake, token) = shutdown::channel();
            match inner
                .commands
                .request(
                    CommandId::OffboardStop,
                    Vec::new(),
                    inner.config.shutdown_timeout(),
                    &token,
                )
                .await
            {
                Ok(CommandResult::Accepted) => debug!("offboard mode left on shutdown"),
                other => warn!("offboard stop on shutdown: {:?}", other),
            }
        }

        inner.streamer.stop().await;
        inner.force_idle();
        inner.lease.lock().unwrap_or_else(|e| e.into_inner()).take();

        let _ = inner.events.send(SessionEvent::Closed);
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn fault_loop(
    inner: Arc<SessionInner>,
    faults: flume::Receiver<FaultReport>,
    link_closed: flume::Receiver<()>,
) {
    let mut shutdown = inner.shutdown.clone();
    let mut watching_link = true;

    loop {
        let report = tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            report = faults.recv_async() => match report {
                Ok(report) => report,
                Err(_) => break,
            },
            closed = link_closed.recv_async(), if watching_link => match closed {
                Ok(()) => FaultReport {
                    generation: inner.streamer.generation(),
                    fault: StreamFault::LinkLost(LinkError::Fatal("link closed".to_owned())),
                },
                Err(_) => {
                    watching_link = false;
                    continue;
                }
            },
        };
        inner.degrade(report).await;
    }
}
