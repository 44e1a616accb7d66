//! The production event loop.
//!
//! Funnels all three event sources (inbound transport frames, client
//! submissions, and timer fires) into one channel, drives the engine one
//! event at a time, and executes the returned actions. The engine never
//! runs concurrently with itself; this loop is the "single logical event
//! thread".

use crate::storage::{RocksDbStore, StorageError};
use crate::timers::TimerManager;
use crate::tls::TlsIdentity;
use crate::transport::{PeerConfig, Transport, TransportError};
use lockstep_core::{Action, Event, Signer, StateMachine};
use lockstep_engine::{Config, ConfigError, RecoveredState, Replica};
use lockstep_types::ReplicaId;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Capacity of the funnel channel feeding the engine.
const EVENT_QUEUE: usize = 1024;

/// Host upcall invoked for every delivered batch, in sequence order.
pub type DeliverFn = Box<dyn FnMut(u64, Vec<Vec<u8>>) + Send>;

/// Errors from building the production runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Invalid replica configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Storage could not be opened.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Transport could not be started.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Handle for submitting client requests to a running replica.
#[derive(Clone)]
pub struct ClientHandle {
    event_tx: mpsc::Sender<Event>,
}

impl ClientHandle {
    /// Submit an opaque request payload. Returns `false` when the runner
    /// has shut down.
    pub async fn submit(&self, payload: Vec<u8>) -> bool {
        self.event_tx
            .send(Event::ClientRequest { payload })
            .await
            .is_ok()
    }
}

/// Handle for shutting down a running replica.
///
/// When dropped, signals the runner to exit gracefully.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A fully wired production replica, ready to run.
pub struct ProductionRunner {
    replica: Replica,
    storage: RocksDbStore,
    timers: TimerManager,
    transport: Transport,
    event_rx: mpsc::Receiver<Event>,
    deliver: DeliverFn,
    shutdown_rx: oneshot::Receiver<()>,
}

impl ProductionRunner {
    /// Open storage, restore persisted state, start the transport, and wire
    /// the event loop. The returned runner must be driven with
    /// [`ProductionRunner::run`].
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        id: ReplicaId,
        config: Config,
        signer: Arc<dyn Signer>,
        identity: &TlsIdentity,
        listen_addr: SocketAddr,
        peers: Vec<PeerConfig>,
        storage_path: &Path,
        deliver: DeliverFn,
    ) -> Result<(Self, ClientHandle, ShutdownHandle), RunnerError> {
        let storage = RocksDbStore::open(storage_path)?;
        let recovered = RecoveredState::load(&storage);
        let mut replica = Replica::new(id, config, signer, recovered)?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let transport =
            Transport::spawn(id, identity, listen_addr, peers, event_tx.clone()).await?;
        let mut timers = TimerManager::new(event_tx.clone());

        // Re-arm timers for anything restored from storage.
        for action in replica.bootstrap() {
            if let Action::SetTimer { id, duration } = action {
                timers.set_timer(id, duration);
            }
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        info!(%id, "replica runner ready");

        let runner = Self {
            replica,
            storage,
            timers,
            transport,
            event_rx,
            deliver,
            shutdown_rx,
        };
        let client = ClientHandle { event_tx };
        let shutdown = ShutdownHandle {
            tx: Some(shutdown_tx),
        };
        Ok((runner, client, shutdown))
    }

    /// Drive the replica until shutdown.
    pub async fn run(self) {
        let Self {
            mut replica,
            mut storage,
            mut timers,
            transport,
            mut event_rx,
            mut deliver,
            mut shutdown_rx,
        } = self;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("shutdown requested");
                    break;
                }
                event = event_rx.recv() => {
                    let Some(event) = event else {
                        debug!("event channel closed");
                        break;
                    };
                    let actions = replica.handle(event);
                    apply_actions(
                        actions,
                        &transport,
                        &mut timers,
                        &mut storage,
                        &mut deliver,
                    )
                    .await;
                }
            }
        }
        timers.cancel_all();
    }
}

async fn apply_actions(
    actions: Vec<Action>,
    transport: &Transport,
    timers: &mut TimerManager,
    storage: &mut RocksDbStore,
    deliver: &mut DeliverFn,
) {
    use lockstep_core::StateStore as _;

    for action in actions {
        match action {
            Action::Broadcast { envelope } => transport.broadcast(&envelope).await,
            Action::Send { to, envelope } => transport.send(to, &envelope).await,
            Action::SetTimer { id, duration } => timers.set_timer(id, duration),
            Action::CancelTimer { id } => timers.cancel_timer(id),
            Action::Deliver { seq, batch } => {
                deliver(seq, batch);
                storage.set_last_seq(seq);
            }
            Action::Persist { key, value } => storage.store_state(&key, &value),
            Action::PersistDelete { key } => storage.del_state(&key),
        }
    }
}
