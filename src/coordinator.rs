//! Coordinator process.
//!
//! Turns discovery datagrams into machine entries, keeps one control
//! connection per machine alive, answers role reports, reconciles reported
//! versions against the codebase, and serves bundle transfers for the
//! challenges it hands out.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

use crate::challenge::ChallengeTable;
use crate::channel::{spawn_writer, Connector, MessageReader, Outbox, Transport};
use crate::reconcile::reconcile;
use crate::registry::{reconnect_delay, MachineRegistry, MachineSnapshot, MachineStatus};
use crate::roles::resolve_roles;
use crate::runtime::{CodebaseProvider, ConfigStore};
use crate::transfer::{serve_transfer, TransferError};
use crate::types::{DiscoveryDatagram, Message, VersionMap};

pub struct Coordinator {
    registry: Mutex<MachineRegistry>,
    challenges: Mutex<ChallengeTable>,
    codebase: Arc<dyn CodebaseProvider>,
    store: Arc<dyn ConfigStore>,
    connector: Arc<dyn Connector>,
    reconnect_backoff: Duration,
}

impl Coordinator {
    pub fn new(
        codebase: Arc<dyn CodebaseProvider>,
        store: Arc<dyn ConfigStore>,
        connector: Arc<dyn Connector>,
        reconnect_backoff: Duration,
        challenge_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(MachineRegistry::new()),
            challenges: Mutex::new(ChallengeTable::new(challenge_ttl)),
            codebase,
            store,
            connector,
            reconnect_backoff,
        })
    }

    /// Consume announcements until the discovery listener stops.
    pub async fn run_discovery(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<(DiscoveryDatagram, SocketAddr)>,
    ) {
        while let Some((datagram, from)) = rx.recv().await {
            self.handle_discovery(&datagram, from).await;
        }
        info!("Discovery channel closed");
    }

    /// Register the announcing machine; connect only if it is new.
    ///
    /// Returns whether a connection attempt was started.
    pub async fn handle_discovery(self: &Arc<Self>, datagram: &DiscoveryDatagram, from: SocketAddr) -> bool {
        let key = SocketAddr::new(from.ip(), datagram.tcp_port());
        let created = self.registry.lock().await.register(key);
        if created {
            info!("New machine {}", key);
            self.connect(key);
        } else {
            debug!("Duplicate announcement from {}", key);
        }
        created
    }

    pub async fn machines(&self) -> Vec<MachineSnapshot> {
        self.registry.lock().await.snapshot()
    }

    pub async fn status(&self, key: &SocketAddr) -> Option<MachineStatus> {
        self.registry.lock().await.status(key)
    }

    /// Queue `message` on a machine's control channel.
    pub async fn instruct(&self, key: &SocketAddr, message: Message) -> bool {
        let outbox = self
            .registry
            .lock()
            .await
            .get(key)
            .and_then(|m| m.outbox.clone());
        match outbox {
            Some(outbox) => outbox.send(message).await.is_ok(),
            None => {
                warn!("Cannot send {} to {}: not connected", message.kind(), key);
                false
            }
        }
    }

    fn connect(self: &Arc<Self>, key: SocketAddr) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.connection_task(key).await });
    }

    async fn connection_task(self: Arc<Self>, key: SocketAddr) {
        self.registry.lock().await.mark_connecting(&key);
        let closed_with_error = match self.connector.connect(key).await {
            Ok(stream) => {
                info!("Connected to {}", key);
                match self.run_session(key, stream).await {
                    Ok(()) => {
                        info!("{} closed the control channel", key);
                        false
                    }
                    Err(e) => {
                        warn!("Control channel to {} failed: {}", key, e);
                        true
                    }
                }
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", key, e);
                true
            }
        };
        self.schedule_reconnect(key, closed_with_error).await;
    }

    async fn schedule_reconnect(self: &Arc<Self>, key: SocketAddr, closed_with_error: bool) {
        let delay = reconnect_delay(closed_with_error, self.reconnect_backoff);
        let mut registry = self.registry.lock().await;
        registry.mark_down(&key);
        if let Some(entry) = registry.get_mut(&key) {
            debug!("Reconnecting to {} in {:?}", key, delay);
            let this = Arc::clone(self);
            entry.reconnect.arm(delay, async move { this.connect(key) });
        }
    }

    async fn run_session(
        self: &Arc<Self>,
        key: SocketAddr,
        stream: Box<dyn Transport>,
    ) -> io::Result<()> {
        let (reader, writer) = tokio::io::split(stream);
        let (outbox, writer_task) = spawn_writer(writer);
        self.registry.lock().await.mark_up(&key, outbox.clone());

        let mut reader = MessageReader::new(reader);
        let result = loop {
            match reader.next_message().await {
                Ok(Some(message)) => self.dispatch(key, &outbox, message).await,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        writer_task.abort();
        result
    }

    async fn dispatch(&self, key: SocketAddr, outbox: &Outbox, message: Message) {
        match message {
            Message::Role { environment, roles } => {
                self.registry
                    .lock()
                    .await
                    .record_roles(&key, &environment, &roles);
                let apps = resolve_roles(self.store.as_ref(), &roles).await;
                info!(
                    "{} ({}) reports roles {:?}, apps {:?}",
                    key, environment, roles, apps
                );
                let _ = outbox.send(Message::Apps { apps }).await;
            }
            Message::Versions { apps } => self.reconcile_machine(key, outbox, &apps).await,
            other => debug!("Ignoring {} message from {}", other.kind(), key),
        }
    }

    /// Local versions of the reported apps; apps whose lookup fails are left out.
    async fn local_versions(&self, reported: &VersionMap) -> VersionMap {
        let lookups = reported.keys().map(|app| async move {
            (app, self.codebase.get_current_version(app).await)
        });
        join_all(lookups)
            .await
            .into_iter()
            .filter_map(|(app, version)| match version {
                Ok(version) => Some((app.clone(), version)),
                Err(e) => {
                    warn!("Failed to get the current version of {}: {}", app, e);
                    None
                }
            })
            .collect()
    }

    async fn reconcile_machine(&self, key: SocketAddr, outbox: &Outbox, reported: &VersionMap) {
        let local = self.local_versions(reported).await;
        let reported: VersionMap = reported
            .iter()
            .filter(|(app, _)| local.contains_key(*app))
            .map(|(app, version)| (app.clone(), version.clone()))
            .collect();

        let instructions = reconcile(&local, &reported);
        if instructions.is_empty() {
            debug!("{} is up to date", key);
            return;
        }
        info!(
            "{}: install {:?}, upgrade {:?}, remove {:?}",
            key, instructions.install, instructions.upgrade, instructions.remove
        );

        let challenges: Vec<Message> = {
            let mut table = self.challenges.lock().await;
            instructions
                .transfers(&reported)
                .into_iter()
                .map(|(app, bundle)| {
                    let challenge = table.issue(key, &app, bundle);
                    Message::ConnectionChallenge {
                        id: challenge.id,
                        app: challenge.app,
                        bundle: challenge.bundle,
                    }
                })
                .collect()
        };

        for message in instructions.messages().into_iter().chain(challenges) {
            if outbox.send(message).await.is_err() {
                warn!("Control channel to {} closed mid-reconciliation", key);
                return;
            }
        }
    }

    /// Serve every transfer socket accepted on `listener`.
    pub async fn serve_transfers(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("Accepting bundle transfers on {}", listener.local_addr()?);
        loop {
            let (mut stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept a transfer connection: {}", e);
                    continue;
                }
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                match this.handle_transfer(&mut stream).await {
                    Ok(_) => {}
                    Err(e @ TransferError::Source(_)) => {
                        warn!("Aborting transfer to {}: {}", peer, e);
                        // Reset instead of FIN so a partial bundle never reads as complete.
                        if let Err(e) = stream.set_linger(Some(Duration::ZERO)) {
                            debug!("Failed to set linger for {}: {}", peer, e);
                        }
                    }
                    Err(e) => warn!("Dropped transfer connection from {}: {}", peer, e),
                }
            });
        }
    }

    pub async fn handle_transfer<S>(&self, stream: S) -> Result<u64, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        serve_transfer(stream, &self.challenges, self.codebase.as_ref()).await
    }
}
