//! Control Command Handler
//!
//! Supervisor directives arrive as string frames, the first frame being the
//! verb. Frames are parsed into [`ControlCommand`] at the boundary; anything
//! that does not parse is answered with an error and the actor keeps running.

use super::{DeviceActor, DeviceError, Running};
use crate::config::DeviceConfig;
use crate::registry::DeviceRegistry;
use std::path::PathBuf;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Status answered to the supervisor for one command
pub type ControlReply = Result<(), DeviceError>;

#[derive(Debug)]
pub struct ControlRequest {
    pub frames: Vec<String>,
    pub reply: Option<oneshot::Sender<ControlReply>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
    Verbose,
    /// Configuration text, replaces the current configuration as a whole
    Config(String),
    /// Sent by the supervisor when the actor must exit
    Term,
}

impl ControlCommand {
    pub fn parse(frames: Vec<String>) -> Result<Self, DeviceError> {
        let mut frames = frames.into_iter();
        let verb = frames.next().ok_or(DeviceError::EmptyCommand)?;

        match verb.as_str() {
            "START" => Ok(ControlCommand::Start),
            "STOP" => Ok(ControlCommand::Stop),
            "VERBOSE" => Ok(ControlCommand::Verbose),
            "$TERM" => Ok(ControlCommand::Term),
            "CONFIG" => frames
                .next()
                .map(ControlCommand::Config)
                .ok_or(DeviceError::MissingConfigPayload),
            _ => Err(DeviceError::UnknownCommand(verb)),
        }
    }
}

impl DeviceActor<Running> {
    /// Handles one message from the control channel and answers its reply slot.
    pub(super) async fn recv_api(&mut self, request: ControlRequest) {
        let result = match ControlCommand::parse(request.frames) {
            Ok(command) => self.handle_command(command).await,
            Err(e) => {
                error!("Rejected control message: {}", e);
                Err(e)
            }
        };

        if let Some(reply) = request.reply {
            if reply.send(result).is_err() {
                debug!("Supervisor dropped the reply channel");
            }
        }
    }

    async fn handle_command(&mut self, command: ControlCommand) -> ControlReply {
        debug!("Control command: {:?}", command);
        match command {
            ControlCommand::Start => self.connect().await.inspect_err(|e| {
                warn!("Failed to start: {}", e);
            }),
            ControlCommand::Stop => {
                self.disconnect().await;
                Ok(())
            }
            ControlCommand::Verbose => {
                self.verbose = true;
                info!("Verbose logging enabled");
                Ok(())
            }
            ControlCommand::Config(text) => self.configure(&text).await,
            ControlCommand::Term => {
                self.terminated = true;
                Ok(())
            }
        }
    }

    /// Applies a CONFIG as a whole: the configuration is only replaced once the
    /// registry is bound to its `server/file`.
    async fn configure(&mut self, text: &str) -> ControlReply {
        let config: DeviceConfig = text.parse().map_err(|e| {
            warn!("Can't load configuration from string: {}", e);
            DeviceError::Config(e)
        })?;

        let moved = config
            .server
            .file
            .clone()
            .filter(|file| self.devices.file() != Some(file.as_path()));
        if let Some(file) = moved {
            self.rebind_registry(file).await?;
        }

        info!(
            "Configuration replaced (endpoint: {}, address: {})",
            config.resolve("malamute/endpoint").as_deref().unwrap_or("-"),
            config.resolve("malamute/address").as_deref().unwrap_or("-")
        );
        self.config = Some(config);
        Ok(())
    }

    /// Moves the registry onto `file`.
    ///
    /// A registry without a backing file writes its records to `file` and
    /// keeps them. Otherwise `file` is loaded, the current table is flushed to
    /// its old file and then replaced. The registry is untouched on error.
    async fn rebind_registry(&mut self, file: PathBuf) -> ControlReply {
        if self.devices.file().is_none() {
            self.devices.store_to(&file).await.map_err(|e| {
                error!("Failed to persist devices to {}: {}", file.display(), e);
                DeviceError::Persistence(e)
            })?;
            info!(
                "Device registry bound to {} ({} devices)",
                file.display(),
                self.devices.len()
            );
            self.devices.set_file(file);
            return Ok(());
        }

        let devices = DeviceRegistry::load(&file).await.map_err(|e| {
            error!("Failed to load devices from {}: {}", file.display(), e);
            DeviceError::Persistence(e)
        })?;

        self.devices.store().await.map_err(|e| {
            error!("Failed to persist devices before reload: {}", e);
            DeviceError::Persistence(e)
        })?;

        info!(
            "Device registry bound to {} ({} devices)",
            file.display(),
            devices.len()
        );
        self.devices = devices;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_known_verbs() {
        assert_eq!(
            ControlCommand::parse(frames(&["START"])).unwrap(),
            ControlCommand::Start
        );
        assert_eq!(
            ControlCommand::parse(frames(&["STOP"])).unwrap(),
            ControlCommand::Stop
        );
        assert_eq!(
            ControlCommand::parse(frames(&["VERBOSE"])).unwrap(),
            ControlCommand::Verbose
        );
        assert_eq!(
            ControlCommand::parse(frames(&["$TERM"])).unwrap(),
            ControlCommand::Term
        );
        assert_eq!(
            ControlCommand::parse(frames(&["CONFIG", "[server]"])).unwrap(),
            ControlCommand::Config("[server]".to_string())
        );
    }

    #[test]
    fn rejects_unknown_and_incomplete_commands() {
        assert!(matches!(
            ControlCommand::parse(frames(&["BIND", "inproc://x"])),
            Err(DeviceError::UnknownCommand(verb)) if verb == "BIND"
        ));
        assert!(matches!(
            ControlCommand::parse(frames(&["start"])),
            Err(DeviceError::UnknownCommand(_))
        ));
        assert!(matches!(
            ControlCommand::parse(frames(&["CONFIG"])),
            Err(DeviceError::MissingConfigPayload)
        ));
        assert!(matches!(
            ControlCommand::parse(Vec::new()),
            Err(DeviceError::EmptyCommand)
        ));
    }
}
