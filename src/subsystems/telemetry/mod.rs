//! # Telemetry subsystem
//!
//! The telemetry hub keeps the latest sample of every [TelemetryCategory] and delivers it to the observers
//! subscribed to that category.
//!
//! Telemetry is a live view of the vehicle state, not an event log: each category holds a single slot that is
//! overwritten by newer samples. Every category has its own dispatch worker which runs the category's callbacks in
//! registration order on the blocking thread pool. While a slow callback runs, newer samples keep replacing the
//! slot and the next dispatch pass only sees the latest one. A slow callback therefore never delays ingestion or
//! another category, and one subscription never has two invocations in flight.
//!
//! ``` no_run
//! # use offboard_lib::subsystems::telemetry::{TelemetryCategory, TelemetryData};
//! # async fn battery(vehicle: &offboard_lib::Vehicle) {
//! let handle = vehicle.telemetry.subscribe(TelemetryCategory::Battery, |sample| {
//!     if let TelemetryData::Battery { remaining, .. } = sample.data {
//!         println!("Battery: {:.0}%", remaining * 100.0);
//!     }
//! });
//! // ...
//! vehicle.telemetry.unsubscribe(handle);
//! # }
//! ```

mod sample;

pub use sample::{
    FlightMode, Health, LandedState, TelemetryCategory, TelemetryData, TelemetrySample,
};

use crate::frame::Frame;
use crate::observer::Observers;
use crate::shutdown::Shutdown;
use crate::{Error, Result};
use futures::lock::Mutex;
use futures::Stream;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Token returned by [TelemetryHub::subscribe()], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    category: TelemetryCategory,
    id: u64,
}

impl SubscriptionHandle {
    /// Category of the subscription
    pub fn category(&self) -> TelemetryCategory {
        self.category
    }
}

struct CategorySlot {
    latest: watch::Sender<Option<TelemetrySample>>,
    observers: Arc<Observers<TelemetrySample>>,
}

/// # Access to the telemetry hub
///
/// See the [telemetry module documentation](crate::subsystems::telemetry) for more context and information.
pub struct TelemetryHub {
    slots: BTreeMap<TelemetryCategory, CategorySlot>,
    next_id: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Shutdown,
}

impl TelemetryHub {
    /// Create a hub and start its dispatch workers
    ///
    /// Must be called from within a tokio runtime. The workers run until `shutdown` is triggered.
    pub fn new(shutdown: Shutdown) -> Self {
        let mut slots = BTreeMap::new();
        let mut workers = Vec::new();

        for category in TelemetryCategory::ALL {
            let (latest, rx) = watch::channel(None);
            let observers: Arc<Observers<TelemetrySample>> = Arc::default();

            workers.push(tokio::spawn(dispatch_loop(
                category,
                rx,
                observers.clone(),
                shutdown.clone(),
            )));
            slots.insert(category, CategorySlot { latest, observers });
        }

        Self {
            slots,
            next_id: AtomicU64::new(0),
            workers: Mutex::new(workers),
            shutdown,
        }
    }

    fn slot(&self, category: TelemetryCategory) -> &CategorySlot {
        // Every category gets a slot in new()
        &self.slots[&category]
    }

    /// Register a callback for a category
    ///
    /// Callbacks of one category are called in registration order, one sample at a time. They run on the blocking
    /// thread pool and may block, but a blocked callback delays the following callbacks of the same category.
    pub fn subscribe<F>(&self, category: TelemetryCategory, callback: F) -> SubscriptionHandle
    where
        F: Fn(&TelemetrySample) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Relaxed);
        self.slot(category).observers.insert(id, Arc::new(callback));
        debug!("telemetry subscription {} on {:?}", id, category);

        SubscriptionHandle { category, id }
    }

    /// Remove a subscription
    ///
    /// Can be called from within a callback. The callback is not called anymore once this returns, except for the
    /// invocation currently running. Returns false if the subscription was already removed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.slot(handle.category).observers.remove(handle.id)
    }

    /// Number of active subscriptions for a category
    pub fn subscriber_count(&self, category: TelemetryCategory) -> usize {
        self.slot(category).observers.active_count()
    }

    /// Ingest a sample
    ///
    /// Never blocks. Samples that are not newer than the one already held for the category are discarded as
    /// reordered, the function then returns false.
    pub fn publish(&self, sample: TelemetrySample) -> bool {
        let category = sample.category();
        let accepted = self.slot(category).latest.send_if_modified(|latest| {
            let newer = latest
                .as_ref()
                .map_or(true, |current| sample.is_newer_than(current));
            if newer {
                *latest = Some(sample.clone());
            }
            newer
        });

        if !accepted {
            debug!("discarding stale {:?} sample {}", category, sample.sequence);
        }
        accepted
    }

    /// Forget the latest sample of every category
    ///
    /// To be called when the vehicle restarted: its sample sequence starts over and would otherwise be discarded
    /// as reordered. Subscriptions are kept.
    pub fn reset(&self) {
        for slot in self.slots.values() {
            slot.latest.send_replace(None);
        }
        debug!("telemetry slots cleared");
    }

    /// Latest sample received for a category
    pub fn latest(&self, category: TelemetryCategory) -> Option<TelemetrySample> {
        self.slot(category).latest.borrow().clone()
    }

    /// Stream of the samples of a category
    ///
    /// Like the callbacks, the stream only yields the latest sample if several arrived since it was last polled.
    /// It ends when the hub shuts down.
    pub fn stream(&self, category: TelemetryCategory) -> impl Stream<Item = TelemetrySample> {
        let mut rx = self.slot(category).latest.subscribe();
        rx.mark_unchanged();
        let mut shutdown = self.shutdown.clone();

        async_stream::stream! {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.triggered() => break,
                    changed = rx.changed() => if changed.is_err() { break },
                }
                let sample = rx.borrow_and_update().clone();
                if let Some(sample) = sample {
                    yield sample;
                }
            }
        }
    }

    /// Wait for a sample of `category` matching `predicate`
    ///
    /// The latest sample already received is tested first. Returns [Error::Timeout] if no sample matches in time
    /// and [Error::Cancelled] on shutdown.
    pub async fn wait_for<P>(
        &self,
        category: TelemetryCategory,
        timeout: Duration,
        mut predicate: P,
    ) -> Result<TelemetrySample>
    where
        P: FnMut(&TelemetrySample) -> bool,
    {
        let mut rx = self.slot(category).latest.subscribe();
        let wait = async {
            rx.wait_for(|sample| sample.as_ref().map_or(false, &mut predicate))
                .await
                .map(|sample| sample.clone())
        };

        match self.shutdown.run_until(tokio::time::timeout(timeout, wait)).await? {
            Ok(Ok(Some(sample))) => Ok(sample),
            Ok(Ok(None)) | Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Start decoding telemetry frames received from the link
    pub(crate) async fn spawn_ingest(self: &Arc<Self>, downlink: flume::Receiver<Frame>) {
        let hub = self.clone();
        let mut shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = shutdown.triggered() => break,
                    frame = downlink.recv_async() => match frame {
                        Ok(frame) => frame,
                        Err(_) => break,
                    },
                };
                match TelemetrySample::from_frame(&frame) {
                    Ok(sample) => {
                        hub.publish(sample);
                    }
                    Err(e) => warn!("malformed telemetry frame: {}", e),
                }
            }
        });
        self.workers.lock().await.push(task);
    }

    /// Wait for the dispatch workers to exit
    ///
    /// The workers stop once the shutdown token is triggered, after the dispatch pass in flight completes.
    pub async fn shutdown(&self) {
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
    }
}

async fn dispatch_loop(
    category: TelemetryCategory,
    mut rx: watch::Receiver<Option<TelemetrySample>>,
    observers: Arc<Observers<TelemetrySample>>,
    mut shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            changed = rx.changed() => if changed.is_err() { break },
        }

        let Some(sample) = rx.borrow_and_update().clone() else {
            continue;
        };

        let observers = observers.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || observers.dispatch(&sample)).await {
            warn!("{:?} telemetry observer panicked: {}", category, e);
        }
    }
    debug!("{:?} telemetry dispatch stopped", category);
}
