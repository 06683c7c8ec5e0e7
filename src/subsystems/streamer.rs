//! # Setpoint streamer
//!
//! The vehicle leaves offboard mode and falls back to a failsafe when it stops receiving setpoints (2 Hz is the
//! usual minimum). The streamer re-sends the latest setpoint at a fixed period, whether it changed or not: the
//! vehicle disengages on silence, not on repetition.
//!
//! Send failures are counted. A success resets the count, reaching the configured threshold, or any fatal link
//! error, ends the stream and reports a [StreamFault] to the owner. Every start opens a new stream generation and
//! faults are tagged with the generation that raised them, so the owner can tell a fault of a previous stream from
//! one of the running stream.

use crate::error::LinkError;
use crate::link::Uplink;
use crate::subsystems::setpoint::Setpoint;
use crate::{Error, Result};
use futures::lock::Mutex;
use log::{debug, warn};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Reason a stream ended by itself
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFault {
    /// `count` consecutive sends failed, the last one with `last_error`
    SendFailures {
        /// Number of consecutive failures
        count: u32,
        /// Error of the last failed send
        last_error: LinkError,
    },
    /// The link reported an unrecoverable error
    LinkLost(LinkError),
}

/// Fault raised by the stream of one generation
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FaultReport {
    pub(crate) generation: u64,
    pub(crate) fault: StreamFault,
}

struct Running {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Fixed rate setpoint transmitter
pub struct SetpointStreamer {
    uplink: Uplink,
    period: Duration,
    failure_threshold: u32,
    current: Arc<std::sync::Mutex<Setpoint>>,
    streaming: Arc<AtomicBool>,
    running: Mutex<Option<Running>>,
    generation: AtomicU64,
    faults: flume::Sender<FaultReport>,
}

impl SetpointStreamer {
    pub(crate) fn new(
        uplink: Uplink,
        period: Duration,
        failure_threshold: u32,
        faults: flume::Sender<FaultReport>,
    ) -> Self {
        Self {
            uplink,
            period,
            failure_threshold: failure_threshold.max(1),
            current: Arc::new(std::sync::Mutex::new(Setpoint::hold())),
            streaming: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
            generation: AtomicU64::new(0),
            faults,
        }
    }

    /// Replace the streamed setpoint
    ///
    /// Takes effect on the next tick. Never waits on the stream.
    pub fn set(&self, setpoint: Setpoint) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = setpoint;
    }

    /// Setpoint the next tick will transmit
    pub fn current(&self) -> Setpoint {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True while the tick task is transmitting
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Acquire)
    }

    /// Generation of the latest started stream
    pub fn generation(&self) -> u64 {
        self.generation.load(Acquire)
    }

    /// Start streaming `initial`
    ///
    /// The first frame is sent before this function returns so that the vehicle has seen a setpoint before any
    /// mode change request. Fails with [Error::AlreadyStreaming] if the stream is running.
    pub async fn start(&self, initial: Setpoint) -> Result<()> {
        let mut running = self.running.lock().await;

        if let Some(previous) = running.take() {
            if self.is_streaming() {
                *running = Some(previous);
                return Err(Error::AlreadyStreaming);
            }
            // The previous stream ended by itself after a fault
            let _ = previous.task.await;
        }

        self.set(initial);

        let mut failures = 0;
        match self.uplink.send_frame(&initial.to_frame()).await {
            Ok(()) => (),
            Err(e) if e.is_fatal() || self.failure_threshold <= 1 => return Err(e.into()),
            Err(e) => {
                warn!("first setpoint send failed: {}", e);
                failures = 1;
            }
        }

        let (stop, stop_rx) = oneshot::channel();
        let generation = self.generation.fetch_add(1, AcqRel) + 1;
        self.streaming.store(true, Release);
        let task = tokio::spawn(
            StreamTask {
                uplink: self.uplink.clone(),
                current: self.current.clone(),
                streaming: self.streaming.clone(),
                faults: self.faults.clone(),
                period: self.period,
                failure_threshold: self.failure_threshold,
                generation,
            }
            .run(failures, stop_rx),
        );
        *running = Some(Running { stop, task });

        debug!("setpoint stream started, period {:?}", self.period);
        Ok(())
    }

    /// Stop streaming
    ///
    /// Once this returns no more setpoint is sent. Calling it on a stopped stream does nothing.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(Running { stop, task }) = running.take() {
            let _ = stop.send(());
            let _ = task.await;
            debug!("setpoint stream stopped");
        }
        self.streaming.store(false, Release);
    }
}

struct StreamTask {
    uplink: Uplink,
    current: Arc<std::sync::Mutex<Setpoint>>,
    streaming: Arc<AtomicBool>,
    faults: flume::Sender<FaultReport>,
    period: Duration,
    failure_threshold: u32,
    generation: u64,
}

impl StreamTask {
    async fn run(self, mut failures: u32, mut stop: oneshot::Receiver<()>) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let fault = loop {
            tokio::select! {
                biased;
                _ = &mut stop => break None,
                _ = ticker.tick() => (),
            }

            let setpoint = *self.current.lock().unwrap_or_else(|e| e.into_inner());
            match self.uplink.send_frame(&setpoint.to_frame()).await {
                Ok(()) => failures = 0,
                Err(e) if e.is_fatal() => break Some(StreamFault::LinkLost(e)),
                Err(e) => {
                    failures += 1;
                    debug!("setpoint send failed ({}/{}): {}", failures, self.failure_threshold, e);
                    if failures >= self.failure_threshold {
                        break Some(StreamFault::SendFailures {
                            count: failures,
                            last_error: e,
                        });
                    }
                }
            }
        };

        self.streaming.store(false, Release);

        if let Some(fault) = fault {
            warn!("setpoint stream {} ended: {:?}", self.generation, fault);
            let _ = self.faults.send(FaultReport {
                generation: self.generation,
                fault,
            });
        }
    }
}
