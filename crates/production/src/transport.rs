//! Point-to-point replica transport over mutually-authenticated TLS.
//!
//! Each replica listens on one address and dials every peer. Connections
//! are pinned both ways (see [`crate::tls`]); a peer presenting the wrong
//! certificate never completes the handshake. Frames are length-prefixed
//! wire envelopes.
//!
//! Delivery is best-effort, matching the engine's expectations: frames are
//! dropped while a peer is unreachable and the protocol's quorum and timer
//! machinery absorbs the loss. The transport never authenticates protocol
//! content; envelope signatures do.

use crate::tls::{certificate_fingerprint, TlsError, TlsIdentity};
use bytes::Bytes;
use lockstep_core::Event;
use lockstep_types::{decode_envelope, encode_envelope, ReplicaId, SignedMessage};
use rustls::pki_types::{CertificateDer, ServerName};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, trace, warn};

/// Frames above this size are treated as garbage and close the connection.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Outbound frames queued per peer before the oldest are dropped.
const OUTBOUND_QUEUE: usize = 1024;

/// Initial reconnect backoff; doubles up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// One peer's identity on the network.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// The peer's replica id.
    pub id: ReplicaId,
    /// Where the peer listens.
    pub addr: SocketAddr,
    /// The peer's pinned certificate (DER).
    pub certificate: CertificateDer<'static>,
}

/// Transport setup errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not bind the listen address.
    #[error("could not bind {addr}: {source}")]
    Bind {
        /// The address that failed.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },

    /// TLS configuration failed.
    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// The replica-to-replica transport.
pub struct Transport {
    local_id: ReplicaId,
    event_tx: mpsc::Sender<Event>,
    outbound: HashMap<ReplicaId, mpsc::Sender<Bytes>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Transport {
    /// Bind the listener, spawn per-peer dialers, and start feeding inbound
    /// envelopes into `event_tx`.
    pub async fn spawn(
        local_id: ReplicaId,
        identity: &TlsIdentity,
        listen_addr: SocketAddr,
        peers: Vec<PeerConfig>,
        event_tx: mpsc::Sender<Event>,
    ) -> Result<Self, TransportError> {
        let mut tasks = Vec::new();

        // Inbound: accept pinned-mTLS connections from every peer.
        let peer_certs: Vec<CertificateDer<'static>> = peers
            .iter()
            .filter(|p| p.id != local_id)
            .map(|p| p.certificate.clone())
            .collect();
        let acceptor = TlsAcceptor::from(Arc::new(identity.acceptor_config(peer_certs)?));
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: listen_addr,
                source,
            })?;
        let ids_by_cert: Arc<HashMap<Vec<u8>, ReplicaId>> = Arc::new(
            peers
                .iter()
                .map(|p| (p.certificate.as_ref().to_vec(), p.id))
                .collect(),
        );
        tasks.push(tokio::spawn(accept_loop(
            listener,
            acceptor,
            ids_by_cert,
            event_tx.clone(),
        )));

        // Outbound: one dialer per remote peer.
        let mut outbound = HashMap::new();
        for peer in peers.into_iter().filter(|p| p.id != local_id) {
            let config = Arc::new(identity.connector_config(peer.certificate.clone())?);
            let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
            outbound.insert(peer.id, tx);
            tasks.push(tokio::spawn(dial_loop(peer, config, rx)));
        }

        info!(%local_id, %listen_addr, peers = outbound.len(), "transport started");
        Ok(Self {
            local_id,
            event_tx,
            outbound,
            tasks,
        })
    }

    /// Send an envelope to one replica. Sending to ourselves loops the
    /// envelope straight back into the event channel.
    pub async fn send(&self, to: ReplicaId, envelope: &SignedMessage) {
        if to == self.local_id {
            let event = Event::MessageReceived {
                envelope: envelope.clone(),
                from: self.local_id,
            };
            if self.event_tx.send(event).await.is_err() {
                debug!("event channel closed, loopback dropped");
            }
            return;
        }
        let Some(tx) = self.outbound.get(&to) else {
            warn!(%to, "send to unknown peer");
            return;
        };
        let frame = match encode_envelope(envelope) {
            Ok(frame) => Bytes::from(frame),
            Err(e) => {
                warn!(error = %e, "unencodable envelope dropped");
                return;
            }
        };
        // Best-effort: a full queue means the peer is slow or down.
        if tx.try_send(frame).is_err() {
            debug!(%to, "outbound queue full, frame dropped");
        }
    }

    /// Send an envelope to every replica, including ourselves.
    pub async fn broadcast(&self, envelope: &SignedMessage) {
        self.send(self.local_id, envelope).await;
        let peer_ids: Vec<ReplicaId> = self.outbound.keys().copied().collect();
        for id in peer_ids {
            self.send(id, envelope).await;
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ids_by_cert: Arc<HashMap<Vec<u8>, ReplicaId>>,
    event_tx: mpsc::Sender<Event>,
) {
    loop {
        let (tcp, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let ids_by_cert = ids_by_cert.clone();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            let mut tls = match acceptor.accept(tcp).await {
                Ok(tls) => tls,
                Err(e) => {
                    // Pinning failures land here, in-band.
                    warn!(%remote, error = %e, "tls handshake failed");
                    return;
                }
            };
            let peer_id = {
                let (_, conn) = tls.get_ref();
                conn.peer_certificates()
                    .and_then(|certs| certs.first())
                    .and_then(|cert| {
                        let id = ids_by_cert.get(cert.as_ref()).copied();
                        if id.is_none() {
                            warn!(
                                %remote,
                                fingerprint = certificate_fingerprint(cert),
                                "connection from unpinned certificate"
                            );
                        }
                        id
                    })
            };
            let Some(peer_id) = peer_id else {
                return;
            };
            debug!(%remote, %peer_id, "inbound link up");

            loop {
                let mut len_bytes = [0u8; 4];
                if tls.read_exact(&mut len_bytes).await.is_err() {
                    debug!(%peer_id, "inbound link closed");
                    return;
                }
                let len = u32::from_be_bytes(len_bytes);
                if len == 0 || len > MAX_FRAME_BYTES {
                    warn!(%peer_id, len, "bad frame length, closing link");
                    return;
                }
                let mut frame = vec![0u8; len as usize];
                if tls.read_exact(&mut frame).await.is_err() {
                    debug!(%peer_id, "inbound link closed mid-frame");
                    return;
                }
                match decode_envelope(&frame) {
                    Ok(envelope) => {
                        trace!(%peer_id, bytes = frame.len(), "frame received");
                        let event = Event::MessageReceived {
                            envelope,
                            from: peer_id,
                        };
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => debug!(%peer_id, error = %e, "undecodable frame dropped"),
                }
            }
        });
    }
}

async fn dial_loop(
    peer: PeerConfig,
    config: Arc<rustls::ClientConfig>,
    mut rx: mpsc::Receiver<Bytes>,
) {
    let connector = TlsConnector::from(config);
    let mut link: Option<tokio_rustls::client::TlsStream<TcpStream>> = None;
    let mut backoff = INITIAL_BACKOFF;

    while let Some(frame) = rx.recv().await {
        if link.is_none() {
            match TcpStream::connect(peer.addr).await {
                Ok(tcp) => {
                    let server_name = ServerName::IpAddress(peer.addr.ip().into());
                    match connector.connect(server_name, tcp).await {
                        Ok(tls) => {
                            debug!(peer = %peer.id, addr = %peer.addr, "outbound link up");
                            link = Some(tls);
                            backoff = INITIAL_BACKOFF;
                        }
                        Err(e) => {
                            // A pinning mismatch fails here, before any
                            // frame leaves.
                            warn!(peer = %peer.id, error = %e, "tls connect failed");
                        }
                    }
                }
                Err(e) => debug!(peer = %peer.id, error = %e, "tcp connect failed"),
            }
            if link.is_none() {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue; // frame dropped; delivery is best-effort
            }
        }

        if let Some(stream) = link.as_mut() {
            let result = async {
                stream.write_all(&(frame.len() as u32).to_be_bytes()).await?;
                stream.write_all(&frame).await?;
                stream.flush().await
            }
            .await;
            if let Err(e) = result {
                debug!(peer = %peer.id, error = %e, "outbound link lost");
                link = None;
            }
        }
    }
}
