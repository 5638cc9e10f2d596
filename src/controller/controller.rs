use std::sync::Arc;

use anyhow::{anyhow, bail};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::context::CtContext;
use crate::controller::command::{Command, CommandEnvelope, CommandOutput, CommandResult};
use crate::receiver::ReceiverSide;
use crate::source::SourceSide;

/// Submits commands to the controller. Cloned freely: application calls, transport tasks and
///  timers all hold one.
#[derive(Clone, Debug)]
pub struct ControllerHandle {
    sender: mpsc::UnboundedSender<CommandEnvelope>,
}

impl ControllerHandle {
    pub fn new() -> (ControllerHandle, mpsc::UnboundedReceiver<CommandEnvelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ControllerHandle { sender }, receiver)
    }

    /// Returns after the controller executed the command, with the command's result
    pub async fn submit_wait(&self, command: Command) -> CommandResult {
        let (reply, reply_receiver) = oneshot::channel();
        self.sender.send(CommandEnvelope { command, reply: Some(reply) })
            .map_err(|e| anyhow!("controller is not running - cannot execute {}", e.0.command.name()))?;

        reply_receiver.await
            .map_err(|_| anyhow!("controller terminated before completing the command"))?
    }

    /// Returns immediately. Failures are logged by the controller.
    pub fn submit_nowait(&self, command: Command) {
        if let Err(e) = self.sender.send(CommandEnvelope { command, reply: None }) {
            warn!("controller is not running - dropping command {:?}", e.0.command);
        }
    }
}


/// The single owner of all connected sources, receivers and their connections. All changes to
///  them happen by executing commands here, one at a time and in submission order.
///
/// The one exception is receiver-side connection state that the transport's delivery task needs
///  to update in line with the data stream - that is guarded by a per-connection lock.
pub struct Controller {
    ctx: Arc<CtContext>,
    source_side: SourceSide,
    receiver_side: ReceiverSide,
}

impl Controller {
    pub fn new(ctx: Arc<CtContext>) -> Controller {
        Controller {
            source_side: SourceSide::new(ctx.clone()),
            receiver_side: ReceiverSide::new(ctx.clone()),
            ctx,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<CommandEnvelope>) {
        info!("starting controller for process {}", self.ctx.ct_id);

        while let Some(CommandEnvelope { command, reply }) = commands.recv().await {
            if let Command::Quit = command {
                debug!("controller received quit");
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(CommandOutput::Done));
                }
                break;
            }

            trace!("executing {:?}", command);
            self.ctx.record_event(|| format!("cmd {:?}", command));
            let name = command.name();

            let result = self.execute(command).await;
            match reply {
                Some(reply) => {
                    if reply.send(result).is_err() {
                        debug!("submitter of {} stopped waiting for the result", name);
                    }
                }
                None => {
                    if let Err(e) = result {
                        error!("error executing {}: {}", name, e);
                    }
                }
            }
        }

        info!("controller for process {} terminated", self.ctx.ct_id);
    }

    async fn execute(&mut self, command: Command) -> CommandResult {
        match command {
            Command::SourceCreate(data) => {
                let (id, transport_source) = self.source_side.create_source(data).await?;
                Ok(CommandOutput::SourceCreated { id, transport_source })
            }
            Command::SourceDelete(id) => {
                self.source_side.delete_source(id).await?;
                Ok(CommandOutput::Done)
            }
            Command::ReceiverCreate(data) => {
                let id = self.receiver_side.create_receiver(data).await?;
                Ok(CommandOutput::ReceiverCreated(id))
            }
            Command::ReceiverDelete(id) => {
                self.receiver_side.delete_receiver(id).await?;
                Ok(CommandOutput::Done)
            }
            Command::SrcHandshake(buf) => {
                self.source_side.on_handshake(&buf).await?;
                Ok(CommandOutput::Done)
            }
            Command::SrcConnTick { key, tmr_id } => {
                self.source_side.on_tick(key, tmr_id).await?;
                Ok(CommandOutput::Done)
            }
            Command::RcvConnCreate(conn) => {
                self.receiver_side.conn_create(conn).await?;
                Ok(CommandOutput::Done)
            }
            Command::RcvConnDelete(conn) => {
                self.receiver_side.conn_delete(conn).await?;
                Ok(CommandOutput::Done)
            }
            Command::RcvConnTick { conn, tmr_id } => {
                self.receiver_side.on_tick(conn, tmr_id).await?;
                Ok(CommandOutput::Done)
            }
            Command::RcvSendConnectOk(conn) => {
                self.receiver_side.send_connect_ok(conn).await?;
                Ok(CommandOutput::Done)
            }
            Command::RcvSendDisconnectOk(conn) => {
                self.receiver_side.send_disconnect_ok(conn).await?;
                Ok(CommandOutput::Done)
            }
            Command::EndpointCounts => Ok(CommandOutput::EndpointCounts {
                sources: self.source_side.num_sources(),
                receivers: self.receiver_side.num_receivers(),
            }),
            Command::RecentEvents => Ok(CommandOutput::RecentEvents(self.ctx.recent_events())),
            Command::Test { fail } => {
                info!("executing test command");
                if fail {
                    bail!("test command failed on request");
                }
                Ok(CommandOutput::Done)
            }
            Command::Quit => Ok(CommandOutput::Done),
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::config::{CtConfig, TestBits};
    use crate::transport::loopback::LoopbackBus;

    use super::*;

    async fn start(test_bits: TestBits) -> (Arc<CtContext>, tokio::task::JoinHandle<()>) {
        let transport = LoopbackBus::new().new_transport(None).await;
        let (handle, commands) = ControllerHandle::new();
        let config = CtConfig {
            test_bits,
            ..CtConfig::new()
        };
        let ctx = Arc::new(CtContext::new(config, 77, transport, handle));
        let task = tokio::spawn(Controller::new(ctx.clone()).run(commands));
        (ctx, task)
    }

    #[tokio::test]
    async fn test_submit_wait_returns_result() {
        let (ctx, task) = start(TestBits::empty()).await;

        assert!(matches!(ctx.controller.submit_wait(Command::Test { fail: false }).await, Ok(CommandOutput::Done)));

        let err = ctx.controller.submit_wait(Command::Test { fail: true }).await.unwrap_err();
        assert!(err.to_string().contains("test command failed"));

        // a failed command does not stop the controller
        assert!(ctx.controller.submit_wait(Command::Test { fail: false }).await.is_ok());

        ctx.controller.submit_nowait(Command::Quit);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_quit_fails() {
        let (ctx, task) = start(TestBits::empty()).await;

        ctx.controller.submit_nowait(Command::Test { fail: true });
        ctx.controller.submit_nowait(Command::Quit);
        task.await.unwrap();

        assert!(ctx.controller.submit_wait(Command::Test { fail: false }).await.is_err());
        // must not panic
        ctx.controller.submit_nowait(Command::Test { fail: false });
    }

    #[tokio::test]
    async fn test_endpoint_counts_initially_zero() {
        let (ctx, task) = start(TestBits::empty()).await;

        match ctx.controller.submit_wait(Command::EndpointCounts).await.unwrap() {
            CommandOutput::EndpointCounts { sources, receivers } => {
                assert_eq!(sources, 0);
                assert_eq!(receivers, 0);
            }
            other => panic!("unexpected output {:?}", other),
        }

        ctx.controller.submit_nowait(Command::Quit);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_events_in_order() {
        let (ctx, task) = start(TestBits::DEBUG).await;

        ctx.controller.submit_nowait(Command::Test { fail: false });
        tokio::time::sleep(Duration::from_millis(5)).await;
        ctx.controller.submit_nowait(Command::Test { fail: true });

        let CommandOutput::RecentEvents(events) = ctx.controller.submit_wait(Command::RecentEvents).await.unwrap() else {
            panic!("expected recent events");
        };
        assert_eq!(events.len(), 3);
        assert!(events[0].ends_with("cmd Test"));
        assert!(events[1].ends_with("cmd Test"));
        assert!(events[2].ends_with("cmd RecentEvents"));

        ctx.controller.submit_nowait(Command::Quit);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_recent_events_disabled_without_debug_bit() {
        let (ctx, task) = start(TestBits::empty()).await;

        ctx.controller.submit_nowait(Command::Test { fail: false });
        let CommandOutput::RecentEvents(events) = ctx.controller.submit_wait(Command::RecentEvents).await.unwrap() else {
            panic!("expected recent events");
        };
        assert!(events.is_empty());

        ctx.controller.submit_nowait(Command::Quit);
        task.await.unwrap();
    }
}
