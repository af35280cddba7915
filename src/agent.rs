//! Agent process.
//!
//! An agent is either searching, announcing itself on the multicast group
//! until a coordinator connects, or joined to exactly one coordinator.  While
//! joined it reports its role and app versions, applies start/stop/remove
//! instructions, and pulls the bundles it has been told to expect.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::channel::{spawn_writer, Connector, MessageReader, Outbox, Transport};
use crate::discovery::Announcer;
use crate::runtime::ProcessSupervisor;
use crate::timer::Timer;
use crate::transfer::fetch_bundle;
use crate::types::{ChallengeHeader, Message, VersionMap, VersionPair};

#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Control port announced to coordinators.
    pub tcp_port: u16,
    /// Coordinator port bundle transfers connect to.
    pub transfer_port: u16,
    pub environment: String,
    pub roles: Vec<String>,
    pub discovery_interval: Duration,
    pub version_report_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Searching,
    Joined(SocketAddr),
}

pub struct Agent {
    settings: AgentSettings,
    announcer: Arc<dyn Announcer>,
    supervisor: Arc<dyn ProcessSupervisor>,
    connector: Arc<dyn Connector>,
    state: Mutex<AgentState>,
    discovery: Mutex<Timer>,
    reporting: Mutex<Timer>,
    assigned: Mutex<Vec<String>>,
    /// Bundles announced by install/upgrade, consumed by the matching challenge.
    expected: Mutex<HashMap<String, VersionPair>>,
    /// Apps with a transfer under way.
    in_flight: Mutex<HashSet<String>>,
}

impl Agent {
    pub fn new(
        settings: AgentSettings,
        announcer: Arc<dyn Announcer>,
        supervisor: Arc<dyn ProcessSupervisor>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            announcer,
            supervisor,
            connector,
            state: Mutex::new(AgentState::Searching),
            discovery: Mutex::new(Timer::new()),
            reporting: Mutex::new(Timer::new()),
            assigned: Mutex::new(Vec::new()),
            expected: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub async fn state(&self) -> AgentState {
        *self.state.lock().await
    }

    /// Announce on the multicast group and accept coordinator connections.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("Agent listening on {}", listener.local_addr()?);
        self.start_searching().await;
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept a control connection: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }
            self.accept(Box::new(stream), peer).await;
        }
    }

    pub async fn start_searching(&self) {
        let announcer = Arc::clone(&self.announcer);
        let port = self.settings.tcp_port;
        self.discovery
            .lock()
            .await
            .arm_repeating(self.settings.discovery_interval, move || {
                let announcer = Arc::clone(&announcer);
                async move {
                    if let Err(e) = announcer.announce(port).await {
                        warn!("Failed to announce: {}", e);
                    }
                }
            });
        debug!("Searching for a coordinator");
    }

    /// Take over an inbound control connection.
    ///
    /// Only one coordinator is served at a time; a connection arriving
    /// while joined is closed right away.
    pub async fn accept(self: &Arc<Self>, stream: Box<dyn Transport>, peer: SocketAddr) {
        let mut state = self.state.lock().await;
        if let AgentState::Joined(coordinator) = *state {
            warn!(
                "Closing connection from {} while joined to {}",
                peer, coordinator
            );
            return;
        }

        let (reader, writer) = tokio::io::split(stream);
        let (outbox, writer_task) = spawn_writer(writer);
        *state = AgentState::Joined(peer);
        // State before discovery, same as `leave`.
        self.discovery.lock().await.cancel();
        drop(state);
        info!("Joined coordinator {}", peer);

        let role = Message::Role {
            environment: self.settings.environment.clone(),
            roles: self.settings.roles.clone(),
        };
        let _ = outbox.send(role).await;
        self.arm_version_reports(&outbox).await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut reader = MessageReader::new(reader);
            let result = loop {
                match reader.next_message().await {
                    Ok(Some(message)) => this.dispatch(peer, &outbox, message).await,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };
            writer_task.abort();
            match result {
                Ok(()) => info!("Coordinator {} closed the control channel", peer),
                Err(e) => warn!("Control channel to {} failed: {}", peer, e),
            }
            this.leave().await;
        });
    }

    async fn leave(&self) {
        let mut state = self.state.lock().await;
        self.reporting.lock().await.cancel();
        self.expected.lock().await.clear();
        *state = AgentState::Searching;
        // Held until discovery is armed so a new coordinator cannot join in between.
        self.start_searching().await;
    }

    async fn arm_version_reports(self: &Arc<Self>, outbox: &Outbox) {
        let period = self.settings.version_report_interval;
        let this = Arc::clone(self);
        let outbox = outbox.clone();
        self.reporting.lock().await.arm(period, async move {
            loop {
                this.report_versions(&outbox).await;
                tokio::time::sleep(period).await;
            }
        });
    }

    async fn dispatch(self: &Arc<Self>, coordinator: SocketAddr, outbox: &Outbox, message: Message) {
        match message {
            Message::Apps { apps } => {
                info!("Assigned apps {:?}", apps);
                *self.assigned.lock().await = apps;
                self.report_versions(outbox).await;
            }
            Message::Start { app, branch } => {
                if let Err(e) = self.supervisor.start(&app, &branch).await {
                    warn!("Failed to start {} ({}): {}", app, branch, e);
                }
            }
            Message::Stop { app, branch } => {
                if let Err(e) = self.supervisor.stop(&app, &branch).await {
                    warn!("Failed to stop {} ({}): {}", app, branch, e);
                }
            }
            Message::Install { apps } => {
                let mut expected = self.expected.lock().await;
                for (app, to) in apps {
                    expected.insert(app, VersionPair::full(to));
                }
            }
            Message::Upgrade { apps } => {
                for (app, to) in apps {
                    let from = self.current_version(&app).await;
                    self.expected
                        .lock()
                        .await
                        .insert(app, VersionPair(from, to));
                }
            }
            Message::Remove { apps } => {
                for app in apps {
                    self.expected.lock().await.remove(&app);
                    info!("Removing {}", app);
                    if let Err(e) = self.supervisor.remove(&app).await {
                        warn!("Failed to remove {}: {}", app, e);
                    }
                }
            }
            Message::ConnectionChallenge { id, app, bundle } => {
                self.answer_challenge(coordinator, outbox, id, app, bundle)
                    .await
            }
            other => debug!("Ignoring {} message from {}", other.kind(), coordinator),
        }
    }

    async fn answer_challenge(
        self: &Arc<Self>,
        coordinator: SocketAddr,
        outbox: &Outbox,
        id: String,
        app: String,
        bundle: VersionPair,
    ) {
        match self.expected.lock().await.remove(&app) {
            Some(expected) if expected == bundle => {}
            Some(expected) => {
                warn!(
                    "Challenge for {} {} does not match the expected {}",
                    app, bundle, expected
                );
                return;
            }
            None => {
                warn!("Unexpected challenge for {} {}", app, bundle);
                return;
            }
        }

        if !self.in_flight.lock().await.insert(app.clone()) {
            warn!("Transfer of {} already under way, ignoring {}", app, bundle);
            return;
        }
        let sink = match self.supervisor.create_bundle_installer(&app).await {
            Ok(sink) => sink,
            Err(e) => {
                warn!("Failed to prepare installation of {}: {}", app, e);
                self.in_flight.lock().await.remove(&app);
                return;
            }
        };

        let addr = SocketAddr::new(coordinator.ip(), self.settings.transfer_port);
        let header = ChallengeHeader {
            challenge: id,
            app,
            bundle,
        };
        let this = Arc::clone(self);
        let outbox = outbox.clone();
        tokio::spawn(async move {
            let result = fetch_bundle(this.connector.as_ref(), addr, &header, sink).await;
            this.in_flight.lock().await.remove(&header.app);
            match result {
                Ok(bytes) => {
                    info!("Installed {} {} ({} bytes)", header.app, header.bundle, bytes);
                    this.report_versions(&outbox).await;
                }
                Err(e) => warn!("Transfer of {} {} failed: {}", header.app, header.bundle, e),
            }
        });
    }

    async fn current_version(&self, app: &str) -> Option<String> {
        self.supervisor
            .get_current_version(app)
            .await
            .unwrap_or_else(|e| {
                warn!("Failed to get the current version of {}: {}", app, e);
                None
            })
    }

    /// Versions of every assigned or installed app; unknown ones are null.
    pub async fn version_report(&self) -> VersionMap {
        let mut apps: BTreeSet<String> = self.assigned.lock().await.iter().cloned().collect();
        match self.supervisor.installed_apps().await {
            Ok(installed) => apps.extend(installed),
            Err(e) => warn!("Failed to list installed apps: {}", e),
        }

        let mut report = VersionMap::new();
        for app in apps {
            let version = self.current_version(&app).await;
            report.insert(app, version);
        }
        report
    }

    async fn report_versions(&self, outbox: &Outbox) {
        let apps = self.version_report().await;
        debug!("Reporting versions {:?}", apps);
        let _ = outbox.send(Message::Versions { apps }).await;
    }
}
