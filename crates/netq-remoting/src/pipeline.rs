//! Per-channel handler pipeline.
//!
//! Inbound frames pass through the stages in order, each stage transforming
//! or consuming the message. Outbound commands pass through in reverse order
//! and must come out as an encoded frame. Lifecycle events are delivered to
//! every stage in order.
//!
//! The standard pipeline is idle tracking, then the command codec, then the
//! connection manager, then dispatch into the invocation engine.

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::channel::Channel;
use crate::connection::ChannelEvent;
use crate::error::{RemotingError, Result};
use crate::invoke::InvocationEngine;
use crate::protocol::{decode_command, encode_command, Command};

/// A message moving through the pipeline.
#[derive(Debug, Clone)]
pub enum Message {
    /// Raw frame payload, length prefix already stripped.
    Frame(Bytes),
    /// Decoded command.
    Command(Command),
}

/// One handler in a channel pipeline.
pub trait Stage: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Handles an inbound message. `Ok(None)` consumes it.
    fn inbound(&self, _channel: &Channel, msg: Message) -> Result<Option<Message>> {
        Ok(Some(msg))
    }

    /// Handles an outbound message.
    fn outbound(&self, _channel: &Channel, msg: Message) -> Result<Message> {
        Ok(msg)
    }

    /// Observes a lifecycle event.
    fn event(&self, _channel: &Channel, _event: &ChannelEvent) {}
}

/// Ordered stage list shared by every channel of a server or client.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("Pipeline").field("stages", &names).finish()
    }
}

impl Pipeline {
    /// Creates a pipeline from stages in inbound order.
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// The standard remoting pipeline.
    pub fn standard(connections: Arc<dyn Stage>, engine: Arc<InvocationEngine>) -> Self {
        Self::new(vec![
            Arc::new(IdleStateStage),
            Arc::new(CommandCodec),
            connections,
            Arc::new(DispatchStage::new(engine)),
        ])
    }

    /// Stage names in inbound order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs `msg` through the inbound stages.
    pub fn fire_inbound(&self, channel: &Channel, msg: Message) -> Result<()> {
        let mut current = msg;
        for stage in &self.stages {
            match stage.inbound(channel, current)? {
                Some(next) => current = next,
                None => return Ok(()),
            }
        }
        trace!(channel = channel.id(), "message reached end of pipeline unconsumed");
        Ok(())
    }

    /// Runs `command` through the outbound stages and returns the frame payload.
    pub fn encode_outbound(&self, channel: &Channel, command: Command) -> Result<Bytes> {
        let mut current = Message::Command(command);
        for stage in self.stages.iter().rev() {
            current = stage.outbound(channel, current)?;
        }
        match current {
            Message::Frame(frame) => Ok(frame),
            Message::Command(_) => Err(RemotingError::ProtocolEncode {
                reason: "pipeline has no encoding stage".to_string(),
            }),
        }
    }

    /// Delivers `event` to every stage.
    pub fn fire_event(&self, channel: &Channel, event: ChannelEvent) {
        for stage in &self.stages {
            stage.event(channel, &event);
        }
    }
}

/// Frame payload to [`Command`] and back.
#[derive(Debug, Default)]
pub struct CommandCodec;

impl Stage for CommandCodec {
    fn name(&self) -> &'static str {
        "codec"
    }

    fn inbound(&self, _channel: &Channel, msg: Message) -> Result<Option<Message>> {
        match msg {
            Message::Frame(frame) => decode_command(&frame).map(|cmd| Some(Message::Command(cmd))),
            other => Ok(Some(other)),
        }
    }

    fn outbound(&self, _channel: &Channel, msg: Message) -> Result<Message> {
        match msg {
            Message::Command(cmd) => encode_command(&cmd).map(Message::Frame),
            other => Ok(other),
        }
    }
}

/// Records read activity for all-idle detection.
#[derive(Debug, Default)]
pub struct IdleStateStage;

impl Stage for IdleStateStage {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn inbound(&self, channel: &Channel, msg: Message) -> Result<Option<Message>> {
        channel.touch_read();
        Ok(Some(msg))
    }
}

/// Hands decoded commands to the invocation engine.
pub struct DispatchStage {
    engine: Arc<InvocationEngine>,
}

impl DispatchStage {
    /// Creates a dispatch stage over `engine`.
    pub fn new(engine: Arc<InvocationEngine>) -> Self {
        Self { engine }
    }
}

impl Stage for DispatchStage {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    fn inbound(&self, channel: &Channel, msg: Message) -> Result<Option<Message>> {
        match msg {
            Message::Command(cmd) => {
                self.engine.process_command(channel, cmd);
                Ok(None)
            }
            other => Ok(Some(other)),
        }
    }

    fn event(&self, channel: &Channel, event: &ChannelEvent) {
        if matches!(event, ChannelEvent::Close) {
            self.engine.cancel_channel(channel);
        }
    }
}
