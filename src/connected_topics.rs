use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CtConfig;
use crate::context::CtContext;
use crate::controller::command::{Command, CommandOutput, ReceiverCreateData, SourceCreateData};
use crate::controller::controller::{Controller, ControllerHandle};
use crate::handshake::conn_end::UimAddr;
use crate::handshake::HANDSHAKE_TOPIC;
use crate::listener::{ReceiverListener, SourceListener};
use crate::receiver::ct_receiver::ConnectedReceiver;
use crate::source::ct_source::ConnectedSource;
use crate::transport::{ImmediateHandler, TopicReceiver, Transport};
use crate::util::random::{new_ct_id, RngRandom};

/// Connection-oriented sources and receivers on top of a publish/subscribe [Transport].
///
/// Each instance is a separate 'process' for the handshake protocol: it has its own random id and
///  receives handshake messages at its transport's address. All sources and receivers must be
///  deleted before [ConnectedTopics::stop] is called.
///
/// An instance should be stopped explicitly. Dropping it without [ConnectedTopics::stop] ends the
///  controller and detaches the handshake listener in the background, without waiting for either.
pub struct ConnectedTopics {
    ctx: Arc<CtContext>,
    controller_task: Option<JoinHandle<()>>,
    handshake_listener: Option<Arc<dyn TopicReceiver>>,
}

/// Receives out-of-band handshake messages and passes them to the controller
struct HandshakeForwarder {
    controller: ControllerHandle,
}

#[async_trait]
impl ImmediateHandler for HandshakeForwarder {
    async fn on_immediate(&self, buf: Bytes) {
        self.controller.submit_nowait(Command::SrcHandshake(buf));
    }
}

impl ConnectedTopics {
    pub async fn start(config: CtConfig, transport: Arc<dyn Transport>) -> anyhow::Result<ConnectedTopics> {
        config.validate()?;
        let local_addr = transport.local_addr();
        if config.domain_id.is_some() && config.domain_id != local_addr.domain_id {
            bail!("configured domain {:?} does not match the transport's address {:?}", config.domain_id, local_addr);
        }

        let ct_id = new_ct_id::<RngRandom>();
        let (controller, commands) = ControllerHandle::new();
        let ctx = Arc::new(CtContext::new(config, ct_id, transport, controller));
        let controller_task = tokio::spawn(Controller::new(ctx.clone()).run(commands));

        let forwarder = Arc::new(HandshakeForwarder { controller: ctx.controller.clone() });
        let handshake_listener = match ctx.transport.listen_immediate(HANDSHAKE_TOPIC, forwarder).await {
            Ok(listener) => listener,
            Err(e) => {
                ctx.controller.submit_nowait(Command::Quit);
                let _ = controller_task.await;
                return Err(e);
            }
        };

        info!("started connected topics {} at {:?}", ct_id, ctx.local_addr);
        Ok(ConnectedTopics {
            ctx,
            controller_task: Some(controller_task),
            handshake_listener: Some(handshake_listener),
        })
    }

    pub fn ct_id(&self) -> u32 {
        self.ctx.ct_id
    }

    pub fn local_addr(&self) -> UimAddr {
        self.ctx.local_addr
    }

    pub fn config(&self) -> &CtConfig {
        &self.ctx.config
    }

    pub async fn create_source(&self, topic: &str, metadata: Bytes, listener: Arc<dyn SourceListener>) -> anyhow::Result<ConnectedSource> {
        let command = Command::SourceCreate(SourceCreateData {
            topic: topic.to_string(),
            metadata,
            listener,
        });
        match self.ctx.controller.submit_wait(command).await? {
            CommandOutput::SourceCreated { id, transport_source } => Ok(ConnectedSource::new(id, topic.to_string(), transport_source)),
            other => bail!("unexpected result creating a source: {:?}", other),
        }
    }

    /// Returns once the disconnect handshakes are started. Disconnect callbacks for the source's
    ///  connections may come later.
    pub async fn delete_source(&self, source: ConnectedSource) -> anyhow::Result<()> {
        self.ctx.controller.submit_wait(Command::SourceDelete(source.id)).await?;
        Ok(())
    }

    pub async fn create_receiver(&self, topic: &str, metadata: Bytes, listener: Arc<dyn ReceiverListener>) -> anyhow::Result<ConnectedReceiver> {
        let command = Command::ReceiverCreate(ReceiverCreateData {
            topic: topic.to_string(),
            metadata,
            listener,
        });
        match self.ctx.controller.submit_wait(command).await? {
            CommandOutput::ReceiverCreated(id) => Ok(ConnectedReceiver::new(id, topic.to_string())),
            other => bail!("unexpected result creating a receiver: {:?}", other),
        }
    }

    pub async fn delete_receiver(&self, receiver: ConnectedReceiver) -> anyhow::Result<()> {
        self.ctx.controller.submit_wait(Command::ReceiverDelete(receiver.id)).await?;
        Ok(())
    }

    /// Round trip through the controller, failing on request
    pub async fn test_command(&self, fail: bool) -> anyhow::Result<()> {
        self.ctx.controller.submit_wait(Command::Test { fail }).await?;
        Ok(())
    }

    /// The controller's most recent events, oldest first. Only recorded if
    ///  [crate::config::TestBits::DEBUG] is set.
    pub async fn recent_events(&self) -> anyhow::Result<Vec<String>> {
        match self.ctx.controller.submit_wait(Command::RecentEvents).await? {
            CommandOutput::RecentEvents(events) => Ok(events),
            other => bail!("unexpected result fetching recent events: {:?}", other),
        }
    }

    pub async fn stop(&mut self) -> anyhow::Result<()> {
        let Some(controller_task) = self.controller_task.take() else {
            bail!("already stopped");
        };

        match self.ctx.controller.submit_wait(Command::EndpointCounts).await {
            Ok(CommandOutput::EndpointCounts { sources, receivers }) if sources > 0 || receivers > 0 => {
                self.controller_task = Some(controller_task);
                bail!("must delete sources ({}) and receivers ({}) before stopping", sources, receivers);
            }
            Ok(_) => {}
            Err(e) => {
                self.controller_task = Some(controller_task);
                return Err(e);
            }
        }

        if let Some(handshake_listener) = self.handshake_listener.take() {
            handshake_listener.delete().await?;
        }
        self.ctx.controller.submit_nowait(Command::Quit);
        controller_task.await?;
        info!("stopped connected topics {}", self.ctx.ct_id);
        Ok(())
    }
}

impl Drop for ConnectedTopics {
    fn drop(&mut self) {
        if self.controller_task.is_some() {
            warn!("connected topics {} dropped without being stopped", self.ctx.ct_id);
            self.ctx.controller.submit_nowait(Command::Quit);

            if let Some(handshake_listener) = self.handshake_listener.take() {
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            if let Err(e) = handshake_listener.delete().await {
                                warn!("error deleting handshake listener: {}", e);
                            }
                        });
                    }
                    Err(_) => warn!("no runtime - handshake listener stays registered on the transport"),
                }
            }
        }
        else {
            debug!("dropping connected topics {}", self.ctx.ct_id);
        }
    }
}
