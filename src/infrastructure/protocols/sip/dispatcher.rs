//! Transaction dispatcher
//!
//! One task owns the transport reader and every attached state machine.
//! Commands arrive on an unbounded channel. Each datagram is parsed once and
//! offered to every machine in attachment order; the actions they return are
//! executed before the next datagram is read. Requests are also forwarded to
//! the session layer.

use super::message::{SipMessage, SipRequest};
use super::transaction::{
    TransactionAction, TransactionId, TransactionStateMachine, TransactionTimer,
};
use super::transport::{Transport, MAX_DATAGRAM};
use bytes::Bytes;
use metrics::counter;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Request received from the network
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub request: SipRequest,
    pub source: SocketAddr,
}

enum Command {
    Attach(TransactionId, Box<dyn TransactionStateMachine>),
    Detach(TransactionId),
    Timer(TransactionId, TransactionTimer),
    Send(Bytes, Option<SocketAddr>),
    Shutdown,
}

/// Cloneable front of the dispatcher task
#[derive(Clone)]
pub struct DispatcherHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl DispatcherHandle {
    /// Register `machine` and send its initial request; a known id is ignored
    pub fn attach(&self, id: TransactionId, machine: Box<dyn TransactionStateMachine>) {
        self.submit(Command::Attach(id, machine));
    }

    /// Forget a machine and cancel its timers; unknown ids are ignored
    pub fn detach(&self, id: TransactionId) {
        self.submit(Command::Detach(id));
    }

    /// Send raw bytes to the SIP server
    pub fn send(&self, data: Bytes) {
        self.submit(Command::Send(data, None));
    }

    /// Send raw bytes to a specific peer (responses to inbound requests)
    pub fn send_to(&self, data: Bytes, destination: SocketAddr) {
        self.submit(Command::Send(data, Some(destination)));
    }

    pub fn shutdown(&self) {
        self.submit(Command::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Transaction dispatcher is not running");
        }
    }
}

pub struct TransactionDispatcher {
    handle: DispatcherHandle,
    task: JoinHandle<()>,
}

impl TransactionDispatcher {
    /// Spawn the dispatcher task; requests come out of the returned receiver
    pub fn start(
        transport: Arc<dyn Transport>,
        server: SocketAddr,
    ) -> (Self, mpsc::UnboundedReceiver<InboundRequest>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            transport,
            server,
            machines: Vec::new(),
            loopback: commands_tx.downgrade(),
            inbound: inbound_tx,
        };
        let task = tokio::spawn(worker.run(commands_rx));
        info!("Transaction dispatcher started for {}", server);

        (
            Self {
                handle: DispatcherHandle {
                    commands: commands_tx,
                },
                task,
            },
            inbound_rx,
        )
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Stop the task and wait for it
    pub async fn shutdown(self) {
        self.handle.shutdown();
        if let Err(e) = self.task.await {
            error!("Transaction dispatcher panicked: {}", e);
        }
    }
}

struct Attached {
    id: TransactionId,
    machine: Box<dyn TransactionStateMachine>,
    timers: Vec<JoinHandle<()>>,
}

struct Worker {
    transport: Arc<dyn Transport>,
    server: SocketAddr,
    machines: Vec<Attached>,
    loopback: mpsc::WeakUnboundedSender<Command>,
    inbound: mpsc::UnboundedSender<InboundRequest>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let transport = self.transport.clone();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.on_command(command).await,
                    }
                }
                received = transport.recv(&mut buf) => {
                    match received {
                        Ok((len, source)) => self.on_datagram(&buf[..len], source).await,
                        Err(e) => error!("SIP receive failed: {}", e),
                    }
                }
            }
        }

        for attached in self.machines.drain(..) {
            attached.timers.iter().for_each(JoinHandle::abort);
        }
        info!("Transaction dispatcher stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Attach(id, mut machine) => {
                if self.position(id).is_some() {
                    debug!("Transaction {} already attached", id);
                    return;
                }
                debug!("Attaching {} transaction {}", machine.name(), id);
                let actions = machine.start();
                self.machines.push(Attached {
                    id,
                    machine,
                    timers: Vec::new(),
                });
                self.execute(id, actions).await;
            }
            Command::Detach(id) => {
                if let Some(index) = self.position(id) {
                    let attached = self.machines.remove(index);
                    attached.timers.iter().for_each(JoinHandle::abort);
                    debug!("Detached {} transaction {}", attached.machine.name(), id);
                }
            }
            Command::Timer(id, timer) => {
                let Some(index) = self.position(id) else {
                    return;
                };
                let actions = self.machines[index].machine.on_timer(timer);
                self.execute(id, actions).await;
            }
            Command::Send(data, destination) => {
                self.send(&data, destination.unwrap_or(self.server)).await;
            }
            Command::Shutdown => {}
        }
    }

    async fn on_datagram(&mut self, data: &[u8], source: SocketAddr) {
        let message = match SipMessage::parse(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping unparsable datagram from {}: {}", source, e);
                return;
            }
        };
        let kind = if message.is_request() { "request" } else { "response" };
        counter!("sip_messages_received_total", "kind" => kind).increment(1);

        let mut pending = Vec::new();
        for attached in self.machines.iter_mut() {
            let actions = attached.machine.update_response(&message);
            if !actions.is_empty() {
                pending.push((attached.id, actions));
            }
        }
        for (id, actions) in pending {
            self.execute(id, actions).await;
        }

        if let SipMessage::Request(request) = message {
            if self.inbound.send(InboundRequest { request, source }).is_err() {
                debug!("Nobody listening for inbound requests");
            }
        }
    }

    async fn execute(&mut self, id: TransactionId, actions: Vec<TransactionAction>) {
        for action in actions {
            match action {
                TransactionAction::Send(data) => self.send(&data, self.server).await,
                TransactionAction::Schedule { after, timer } => {
                    let loopback = self.loopback.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        if let Some(commands) = loopback.upgrade() {
                            let _ = commands.send(Command::Timer(id, timer));
                        }
                    });
                    match self.position(id) {
                        Some(index) => {
                            let timers = &mut self.machines[index].timers;
                            timers.retain(|t| !t.is_finished());
                            timers.push(task);
                        }
                        None => task.abort(),
                    }
                }
            }
        }
    }

    async fn send(&self, data: &[u8], destination: SocketAddr) {
        if let Err(e) = self.transport.send(data, destination).await {
            error!("Failed to send SIP message to {}: {}", destination, e);
        }
    }

    fn position(&self, id: TransactionId) -> Option<usize> {
        self.machines.iter().position(|attached| attached.id == id)
    }
}
