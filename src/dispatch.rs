//! Downlink frame routing
//!
//! These functionalities are currently all private, some might be useful for the user code as well, lets make them
//! public when needed.

use crate::frame::{Frame, Port};
use crate::link::Link;
use crate::shutdown::Shutdown;
use crate::{Error, Result};
use async_trait::async_trait;
use flume as channel;
use flume::{Receiver, Sender};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub(crate) struct LinkDispatch {
    link: Arc<dyn Link>,
    port_channels: BTreeMap<Port, Sender<Frame>>,
    on_close: Vec<Sender<()>>,
    shutdown: Shutdown,
}

impl LinkDispatch {
    pub(crate) fn new(link: Arc<dyn Link>, shutdown: Shutdown) -> Self {
        LinkDispatch {
            link,
            port_channels: BTreeMap::new(),
            on_close: Vec::new(),
            shutdown,
        }
    }

    #[allow(clippy::map_entry)]
    pub(crate) fn get_port_receiver(&mut self, port: Port) -> Option<Receiver<Frame>> {
        if self.port_channels.contains_key(&port) {
            None
        } else {
            let (tx, rx) = channel::unbounded();
            self.port_channels.insert(port, tx);
            Some(rx)
        }
    }

    /// Channel signalled once if the link closes by itself
    pub(crate) fn close_notifier(&mut self) -> Receiver<()> {
        let (tx, rx) = channel::bounded(1);
        self.on_close.push(tx);
        rx
    }

    pub(crate) fn run(self) -> JoinHandle<()> {
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let bytes = tokio::select! {
                    biased;
                    _ = shutdown.triggered() => return,
                    bytes = self.link.recv() => bytes,
                };

                let Some(bytes) = bytes else {
                    info!("link closed by remote side");
                    for notify in &self.on_close {
                        let _ = notify.try_send(());
                    }
                    return;
                };

                match Frame::from_bytes(&bytes) {
                    Ok(frame) => {
                        if let Some(channel) = self.port_channels.get(&frame.get_port()) {
                            let _ = channel.send_async(frame).await;
                        } else {
                            debug!("no receiver for frame on port {:?}", frame.get_port());
                        }
                    }
                    Err(e) => warn!("dropping malformed frame: {}", e),
                }
            }
        })
    }
}

#[async_trait]
pub(crate) trait WaitForFrame {
    async fn wait_frame(&self, port: Port, channel: u8, data_prefix: &[u8]) -> Result<Frame>;
}

#[async_trait]
impl WaitForFrame for channel::Receiver<Frame> {
    async fn wait_frame(&self, port: Port, channel: u8, data_prefix: &[u8]) -> Result<Frame> {
        loop {
            let frame = self.recv_async().await.map_err(|_| Error::Disconnected)?;
            if frame.get_port() == port
                && frame.get_channel() == channel
                && frame.get_data().starts_with(data_prefix)
            {
                return Ok(frame);
            }
        }
    }
}
