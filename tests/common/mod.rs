// Scripted vehicle used by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use offboard_lib::command::{Command, CommandId, CommandResult};
use offboard_lib::subsystems::setpoint::Setpoint;
use offboard_lib::{loopback, Frame, Link, LinkError, LoopbackLink, Port, RemoteEndpoint, SessionConfig};
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fast timings, with margins large enough for a loaded test machine
pub fn test_config() -> SessionConfig {
    SessionConfig {
        setpoint_period_ms: 10,
        remote_timeout_ms: 100,
        send_failure_threshold: 3,
        ack_timeout_ms: 200,
        shutdown_timeout_ms: 100,
    }
}

/// How the simulated vehicle answers a command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reply {
    Ack(CommandResult),
    Silent,
}

/// Vehicle side of a loopback link, answering commands and recording setpoints
pub struct SimVehicle {
    pub remote: Arc<RemoteEndpoint>,
    replies: Arc<Mutex<HashMap<CommandId, Reply>>>,
    setpoints: Arc<Mutex<Vec<(Instant, Setpoint)>>>,
    commands: Arc<Mutex<Vec<Command>>>,
    frames: Arc<Mutex<Vec<Frame>>>,
    task: JoinHandle<()>,
}

impl SimVehicle {
    pub fn spawn(remote: RemoteEndpoint) -> Self {
        let remote = Arc::new(remote);
        let replies: Arc<Mutex<HashMap<CommandId, Reply>>> = Arc::default();
        let setpoints: Arc<Mutex<Vec<(Instant, Setpoint)>>> = Arc::default();
        let commands: Arc<Mutex<Vec<Command>>> = Arc::default();
        let frames: Arc<Mutex<Vec<Frame>>> = Arc::default();

        let task = tokio::spawn({
            let remote = remote.clone();
            let replies = replies.clone();
            let setpoints = setpoints.clone();
            let commands = commands.clone();
            let frames = frames.clone();
            async move {
                while let Ok(frame) = remote.recv_frame().await {
                    match frame.get_port() {
                        Port::Setpoint => {
                            if let Ok(setpoint) = Setpoint::from_frame(&frame) {
                                setpoints.lock().unwrap().push((Instant::now(), setpoint));
                            }
                        }
                        Port::Command => {
                            let Ok(command) = Command::from_frame(&frame) else {
                                continue;
                            };
                            let reply = replies
                                .lock()
                                .unwrap()
                                .get(&command.id)
                                .copied()
                                .unwrap_or(Reply::Ack(CommandResult::Accepted));
                            commands.lock().unwrap().push(command.clone());
                            if let Reply::Ack(result) = reply {
                                let _ = remote.send_frame(&command.ack(result).to_frame()).await;
                            }
                        }
                        _ => frames.lock().unwrap().push(frame),
                    }
                }
            }
        });

        Self {
            remote,
            replies,
            setpoints,
            commands,
            frames,
            task,
        }
    }

    pub fn reply(&self, id: CommandId, reply: Reply) {
        self.replies.lock().unwrap().insert(id, reply);
    }

    pub fn setpoints(&self) -> Vec<(Instant, Setpoint)> {
        self.setpoints.lock().unwrap().clone()
    }

    pub fn setpoint_count(&self) -> usize {
        self.setpoints.lock().unwrap().len()
    }

    pub fn commands(&self) -> Vec<CommandId> {
        self.commands.lock().unwrap().iter().map(|c| c.id).collect()
    }

    pub fn last_command(&self) -> Option<Command> {
        self.commands.lock().unwrap().last().cloned()
    }

    pub fn other_frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    pub async fn send(&self, frame: &Frame) {
        self.remote.send_frame(frame).await.unwrap();
    }

    /// Stop answering and drop the vehicle side of the link
    pub fn disconnect(self) {
        self.task.abort();
    }
}

/// Failures injected into setpoint sends
#[derive(Debug, Default)]
pub struct FailurePlan {
    transient: AtomicU32,
    fatal: AtomicU32,
}

impl FailurePlan {
    pub fn fail_next(&self, count: u32) {
        self.transient.store(count, SeqCst);
    }

    pub fn fail_fatally(&self) {
        self.fatal.store(1, SeqCst);
    }

    fn next(&self) -> Option<LinkError> {
        if self.fatal.load(SeqCst) > 0 {
            return Some(LinkError::Fatal("radio unplugged".to_owned()));
        }
        self.transient
            .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| LinkError::Transient("congested".to_owned()))
    }
}

/// Loopback link failing setpoint sends on demand
pub struct FlakyLink {
    inner: LoopbackLink,
    plan: Arc<FailurePlan>,
}

#[async_trait]
impl Link for FlakyLink {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), LinkError> {
        if bytes.first() == Some(&u8::from(Port::Setpoint)) {
            if let Some(error) = self.plan.next() {
                return Err(error);
            }
        }
        self.inner.send(bytes).await
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.inner.recv().await
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

pub fn flaky_loopback() -> (FlakyLink, RemoteEndpoint, Arc<FailurePlan>) {
    let (inner, remote) = loopback();
    let plan: Arc<FailurePlan> = Arc::default();
    (
        FlakyLink {
            inner,
            plan: plan.clone(),
        },
        remote,
        plan,
    )
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}
