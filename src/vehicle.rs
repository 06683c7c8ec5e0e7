use crate::command::CommandChannel;
use crate::config::SessionConfig;
use crate::dispatch::LinkDispatch;
use crate::frame::Port;
use crate::link::{Link, Uplink};
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::subsystems::action::Action;
use crate::subsystems::localization::Localization;
use crate::subsystems::offboard::{OffboardSession, StateChange, StateSubscription};
use crate::subsystems::setpoint::Setpoint;
use crate::subsystems::telemetry::{SubscriptionHandle, TelemetryCategory, TelemetryHub, TelemetrySample};
use crate::{Error, Result};
use futures::lock::Mutex;
use log::info;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// # The vehicle
///
/// This struct is one-time use: creating it takes over a link to one vehicle and once shut down, either as requested
/// by the lib user or by dropping it, the object cannot be reused. A new one needs to be created from a new link.
///
/// See the [offboard-lib crate root documentation](crate) for more context and information.
pub struct Vehicle {
    /// Offboard session access
    pub offboard: OffboardSession,
    /// Telemetry hub access
    pub telemetry: Arc<TelemetryHub>,
    /// Action subsystem access
    pub action: Action,
    /// Localization subsystem access
    pub localization: Localization,
    config: SessionConfig,
    trigger: ShutdownTrigger,
    dispatch_trigger: ShutdownTrigger,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    uplink: Uplink,
    link: Arc<dyn Link>,
}

impl Vehicle {
    /// Connect to a vehicle over an open link
    ///
    /// The configuration is validated first. The subsystems are created and the link dispatcher is started, no
    /// traffic is sent before the user calls a subsystem. Must be called from within a tokio runtime.
    pub async fn connect_from_link(link: impl Link + 'static, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        if !link.is_open() {
            return Err(Error::Disconnected);
        }

        let (trigger, shutdown) = shutdown::channel();
        let link: Arc<dyn Link> = Arc::new(link);
        let uplink = Uplink::new(link.clone());

        // Downlink dispatcher, it outlives the session to route the acknowledgement of the shutdown handshake
        let (dispatch_trigger, dispatch_shutdown) = shutdown::channel();
        let mut dispatcher = LinkDispatch::new(link.clone(), dispatch_shutdown);

        // The get_port_receiver calls are guaranteed to work if the same port is not used twice
        let telemetry_downlink = dispatcher
            .get_port_receiver(Port::Telemetry)
            .ok_or_else(|| Error::ProtocolError("port routed twice".to_owned()))?;
        let ack_downlink = dispatcher
            .get_port_receiver(Port::Command)
            .ok_or_else(|| Error::ProtocolError("port routed twice".to_owned()))?;
        let link_closed = dispatcher.close_notifier();

        let commands = Arc::new(CommandChannel::new(uplink.clone(), ack_downlink));

        let telemetry = Arc::new(TelemetryHub::new(shutdown.clone()));
        telemetry.spawn_ingest(telemetry_downlink).await;

        let offboard = OffboardSession::new(
            uplink.clone(),
            commands.clone(),
            config.clone(),
            shutdown.clone(),
            link_closed,
        )?;
        let action = Action::new(commands, config.ack_timeout(), shutdown);
        let localization = Localization::new(uplink.clone());

        // Start the downlink frame dispatcher
        let dispatch_task = dispatcher.run();
        info!("vehicle connected, setpoint period {:?}", config.setpoint_period());

        Ok(Vehicle {
            offboard,
            telemetry,
            action,
            localization,
            config,
            trigger,
            dispatch_trigger,
            dispatch_task: Mutex::new(Some(dispatch_task)),
            uplink,
            link,
        })
    }

    /// Configuration of the connection
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Token triggered when the vehicle shuts down
    ///
    /// Can be used to stop user tasks, for example a [CommandSequencer](crate::subsystems::sequencer::CommandSequencer).
    pub fn shutdown_token(&self) -> Shutdown {
        self.trigger.token()
    }

    /// True while the link is open and the vehicle not shut down
    pub fn is_connected(&self) -> bool {
        self.uplink.is_open() && !self.shutdown_token().is_triggered()
    }

    /// Engage offboard mode, see [OffboardSession::start()]
    pub async fn start_session(&self) -> Result<()> {
        self.offboard.start().await
    }

    /// Set the offboard setpoint, see [OffboardSession::set()]
    ///
    /// Primes the setpoint before the session is started and replaces the streamed one afterwards.
    pub fn update_setpoint(&self, setpoint: Setpoint) -> Result<()> {
        self.offboard.set(setpoint)
    }

    /// Leave offboard mode, see [OffboardSession::stop()]
    pub async fn stop_session(&self) -> Result<()> {
        self.offboard.stop().await
    }

    /// Register a telemetry callback, see [TelemetryHub::subscribe()]
    pub fn subscribe_telemetry<F>(&self, category: TelemetryCategory, callback: F) -> SubscriptionHandle
    where
        F: Fn(&TelemetrySample) + Send + Sync + 'static,
    {
        self.telemetry.subscribe(category, callback)
    }

    /// Remove a telemetry callback, see [TelemetryHub::unsubscribe()]
    pub fn unsubscribe_telemetry(&self, handle: SubscriptionHandle) -> bool {
        self.telemetry.unsubscribe(handle)
    }

    /// Register a session state callback, see [OffboardSession::subscribe_state()]
    pub fn subscribe_session_state<F>(&self, callback: F) -> StateSubscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.offboard.subscribe_state(callback)
    }

    /// Shut the vehicle connection down
    ///
    /// Pending commands and sequencer holds are cancelled, an engaged offboard session is stopped with a short
    /// handshake, the telemetry callbacks in flight complete and the link is closed. Once this function returns
    /// nothing is sent anymore and the link lease is released.
    ///
    /// Dropping the [Vehicle] also triggers the shutdown, but without waiting for the tasks to end.
    pub async fn shutdown(&self) {
        self.trigger.trigger();

        self.offboard.shutdown().await;
        self.telemetry.shutdown().await;

        self.dispatch_trigger.trigger();
        if let Some(dispatch_task) = self.dispatch_task.lock().await.take() {
            let _ = dispatch_task.await;
        }
        self.link.close().await;

        info!("vehicle disconnected");
    }
}

impl Drop for Vehicle {
    fn drop(&mut self) {
        self.trigger.trigger();
        self.dispatch_trigger.trigger();
    }
}
