//! Wires the sync engine together for one CLI invocation.

use std::time::Duration;

use comanda_core::{
    ChannelSession, CollectionKind, CollectionStore, Connectivity, CredentialStore, Credentials,
    FileStore, RequestContext, Requester, ScopedTask, ServerProbe, SyncTuning, Transport,
};

use crate::config::Config;

/// A live session: transport, reachability poller and request context.
///
/// Everything it started stops when it is dropped.
pub struct Engine {
    requester: Requester,
    tuning: SyncTuning,
    _transport: ScopedTask,
    _poller: ScopedTask,
}

impl Engine {
    /// Probes the server once, then starts the transport in the background.
    pub async fn start(config: &Config) -> Result<Self, EngineError> {
        let server_url = config
            .server_url
            .value
            .clone()
            .ok_or(EngineError::NotConfigured)?;

        let credentials = credential_store(config).load();
        let context = request_context(config, credentials.as_ref());
        if context.workspace_id.is_empty() {
            tracing::warn!("no workspace configured; requests will not be scoped");
        }

        let probe = ServerProbe::new(&server_url);
        let connectivity = Connectivity::default();
        connectivity.probe_with(&probe).await;
        let poller = connectivity.spawn_poller(probe, config.sync.probe_interval());

        let session = ChannelSession::new();
        let mut transport = Transport::new(server_url, config.sync.reconnect)
            .with_connectivity(connectivity.clone());
        if !context.workspace_id.is_empty() {
            transport = transport.with_query("carrinho", context.workspace_id.clone());
        }
        let transport = transport.spawn(session.clone());

        Ok(Self {
            requester: Requester::new(session, connectivity, context),
            tuning: config.sync.tuning,
            _transport: transport,
            _poller: poller,
        })
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    pub fn session(&self) -> &ChannelSession {
        self.requester.session()
    }

    pub fn tuning(&self) -> &SyncTuning {
        &self.tuning
    }

    /// Opens a mirror of `kind` on this session.
    pub fn open(&self, kind: CollectionKind) -> CollectionStore {
        CollectionStore::open(kind, self.requester.clone(), self.tuning)
    }

    /// Waits until the channel is up. Returns false on timeout.
    pub async fn wait_connected(&self, limit: Duration) -> bool {
        let mut changes = self.session().connection_changes();
        let connected = tokio::time::timeout(limit, changes.wait_for(|up| *up)).await;
        matches!(connected, Ok(Ok(_)))
    }
}

/// Credential store in the configured data directory.
pub fn credential_store(config: &Config) -> CredentialStore<FileStore> {
    CredentialStore::new(FileStore::new(config.session_dir()))
}

/// Context for requests: the saved session, with the configured workspace
/// and role taking precedence.
pub fn request_context(config: &Config, credentials: Option<&Credentials>) -> RequestContext {
    let mut context = credentials
        .map(Credentials::context)
        .unwrap_or_default();
    if let Some(workspace) = config.workspace.value.as_ref().filter(|w| !w.is_empty()) {
        context.workspace_id = workspace.clone();
    }
    if let Some(role) = config.sync.role.as_ref().filter(|r| !r.is_empty()) {
        context.role = role.clone();
    }
    context
}

#[derive(Debug)]
pub enum EngineError {
    NotConfigured,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotConfigured => write!(
                f,
                "Sync server not configured. Set server_url in config or COMANDA_SERVER_URL."
            ),
        }
    }
}

impl std::error::Error for EngineError {}
