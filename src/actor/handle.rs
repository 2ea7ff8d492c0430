//! Supervisor side of the device actor.
//!
//! [`DeviceActorHandle::spawn`] starts the actor task and returns once the
//! actor signalled it is ready. Every command waits for the actor's status.
//! Dropping the handle closes the control channel, which the actor treats
//! like `$TERM`.

use super::{ControlReply, ControlRequest, DeviceActor, DeviceError, Initializing};
use crate::broker::BrokerFactory;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct DeviceActorHandle {
    pipe: mpsc::Sender<ControlRequest>,
    task: JoinHandle<()>,
}

impl DeviceActorHandle {
    pub async fn spawn(factory: BrokerFactory) -> Result<Self, DeviceError> {
        let (pipe_tx, pipe_rx) = mpsc::channel(32);
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let actor = DeviceActor::<Initializing>::create(pipe_rx, factory).signal(ready_tx);
            actor.run().await.destroy().await;
        });

        ready_rx
            .await
            .map_err(|_| DeviceError::ChannelError("Actor exited before signalling".into()))?;

        info!("Device actor spawned");
        Ok(Self {
            pipe: pipe_tx,
            task,
        })
    }

    /// Sends raw command frames and waits for the status.
    pub async fn send<I, S>(&self, frames: I) -> ControlReply
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let frames: Vec<String> = frames.into_iter().map(Into::into).collect();
        debug!("Sending control frames: {:?}", frames.first());

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pipe
            .send(ControlRequest {
                frames,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|e| DeviceError::ChannelError(format!("Actor is gone: {}", e)))?;

        reply_rx
            .await
            .map_err(|e| DeviceError::ChannelError(format!("No status from actor: {}", e)))?
    }

    pub async fn start(&self) -> ControlReply {
        self.send(["START"]).await
    }

    pub async fn stop(&self) -> ControlReply {
        self.send(["STOP"]).await
    }

    pub async fn verbose(&self) -> ControlReply {
        self.send(["VERBOSE"]).await
    }

    pub async fn configure(&self, config: &str) -> ControlReply {
        self.send(["CONFIG", config]).await
    }

    /// Sends `$TERM` and waits until the actor released its resources.
    pub async fn terminate(self) -> ControlReply {
        self.send(["$TERM"]).await?;
        self.task.await.map_err(|e| {
            error!("Device actor task failed: {}", e);
            DeviceError::ChannelError(format!("Actor task failed: {}", e))
        })
    }

    /// Gives up control, the actor terminates once it notices the closed channel.
    pub fn into_task(self) -> JoinHandle<()> {
        self.task
    }
}
