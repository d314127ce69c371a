//! Per-connection replication session
//!
//! A `ReplicationSession` drives the handshake / offer / request / entry
//! exchange over one duplex stream for one group. It runs in its own task
//! and moves through `Idle -> Handshaking -> Active -> Closed` exactly once;
//! reconnecting means a new session.
//!
//! ## Backfill
//!
//! On an `Offer {W, I}` with local head `H`, the session wants every index in
//! `H+1..=I`. Requests for one writer are issued one at a time in ascending
//! order; the next goes out only when the previous entry arrived. Different
//! writers progress concurrently. Later offers only extend the wanted range,
//! so no `(writer, index)` is ever requested twice while in flight.
//!
//! ## Liveness
//!
//! A session that hears nothing from its peer for `idle_timeout` fails with
//! `Timeout`. To keep a quiet but healthy peer alive, each side sends a
//! `Keepalive` once it has sent nothing for half that interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SwarmConfig;
use crate::error::{SyncError, SyncResult};
use crate::log::{LogStore, LogUpdate, PutOutcome};
use crate::sync::envelope::Envelope;
use crate::sync::events::SyncEvent;
use crate::sync::protocol::{framed, ReplicationCodec, ReplicationMessage, WireMessage};
use crate::types::{DiscoveryKey, PeerId, WriterKey};

/// How long a closing session waits to deliver its `Error` message
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Handshaking,
    Active,
    Closed,
}

/// Counters reported when a session ends cleanly
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub entries_received: u64,
    pub entries_sent: u64,
    pub invalid_entries: u32,
}

/// Outstanding backfill for one writer
#[derive(Debug)]
struct WriterRange {
    next: u64,
    target: u64,
    in_flight: Option<u64>,
}

impl WriterRange {
    fn issue(&mut self) -> Option<u64> {
        if self.in_flight.is_some() || self.next > self.target {
            return None;
        }
        let index = self.next;
        self.next += 1;
        self.in_flight = Some(index);
        Some(index)
    }
}

/// Request bookkeeping: at most one request in flight per writer
#[derive(Debug, Default)]
struct PendingRequests {
    writers: HashMap<WriterKey, WriterRange>,
}

impl PendingRequests {
    /// Want `from..=to` for `writer`; returns an index to request now.
    fn want(&mut self, writer: WriterKey, from: u64, to: u64) -> Option<u64> {
        let range = self.writers.entry(writer).or_insert(WriterRange {
            next: from,
            target: to,
            in_flight: None,
        });
        range.target = range.target.max(to);
        range.next = range.next.max(from);
        range.issue()
    }

    /// Record the arrival of `index`; returns the next index to request.
    fn complete(&mut self, writer: WriterKey, index: u64, head: Option<u64>) -> Option<u64> {
        let range = self.writers.get_mut(&writer)?;
        if range.in_flight != Some(index) {
            return None;
        }
        range.in_flight = None;
        if let Some(head) = head {
            range.next = range.next.max(head + 1);
        }
        let next = range.issue();
        if next.is_none() {
            self.writers.remove(&writer);
        }
        next
    }

    fn abandon(&mut self, writer: &WriterKey) {
        self.writers.remove(writer);
    }

    fn is_in_flight(&self, writer: &WriterKey, index: u64) -> bool {
        self.writers
            .get(writer)
            .is_some_and(|r| r.in_flight == Some(index))
    }

    fn has_in_flight(&self) -> bool {
        self.writers.values().any(|r| r.in_flight.is_some())
    }
}

/// Replication protocol state machine for one peer connection
pub struct ReplicationSession<T> {
    store: Arc<LogStore>,
    discovery_key: DiscoveryKey,
    local_peer: PeerId,
    remote_peer: PeerId,
    config: SwarmConfig,
    framed: Framed<T, ReplicationCodec>,
    updates: broadcast::Receiver<LogUpdate>,
    state: SessionState,
    pending: PendingRequests,
    summary: SessionSummary,
    last_progress: Instant,
    last_sent: Instant,
    remote_closed: bool,
    events: Option<broadcast::Sender<SyncEvent>>,
    cancel: CancellationToken,
}

impl<T> ReplicationSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Bind a new session to `store` over `stream`.
    ///
    /// `remote_peer` must be the transport-authenticated identity of the
    /// other side; the handshake proof is checked against it.
    pub fn new(
        store: Arc<LogStore>,
        stream: T,
        local_peer: PeerId,
        remote_peer: PeerId,
        config: &SwarmConfig,
    ) -> Self {
        Self {
            discovery_key: store.keys().discovery_key(),
            updates: store.subscribe(),
            store,
            local_peer,
            remote_peer,
            framed: framed(stream, config.max_message_size),
            config: config.clone(),
            state: SessionState::Idle,
            pending: PendingRequests::default(),
            summary: SessionSummary::default(),
            last_progress: Instant::now(),
            last_sent: Instant::now(),
            remote_closed: false,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Publish session events on `events`
    pub fn with_events(mut self, events: broadcast::Sender<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Close the session when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    /// Run the session to completion.
    ///
    /// Returns `Ok` when the peer hung up or the session was cancelled, and
    /// the terminating error otherwise. Either way the store subscription
    /// is released when this returns.
    pub async fn run(mut self) -> SyncResult<SessionSummary> {
        self.state = SessionState::Handshaking;
        debug!(dk = %self.discovery_key, peer = %self.remote_peer, "Session handshaking");

        let result = self.drive().await;
        let was_active = self.state == SessionState::Active;
        self.state = SessionState::Closed;

        let reason = match &result {
            Ok(()) => None,
            Err(e) => {
                if !self.remote_closed {
                    self.send_error(e.to_string()).await;
                }
                Some(e.to_string())
            }
        };

        match &reason {
            Some(reason) => {
                warn!(dk = %self.discovery_key, peer = %self.remote_peer, %reason, "Session failed")
            }
            None => info!(
                dk = %self.discovery_key,
                peer = %self.remote_peer,
                received = self.summary.entries_received,
                sent = self.summary.entries_sent,
                "Session closed"
            ),
        }

        if was_active {
            self.emit(SyncEvent::PeerDisconnected {
                discovery_key: self.discovery_key,
                peer: self.remote_peer,
                reason,
            });
        }

        result.map(|()| self.summary)
    }

    async fn drive(&mut self) -> SyncResult<()> {
        self.send_handshake().await?;
        self.last_progress = Instant::now();

        loop {
            let deadline = self.last_progress + self.config.idle_timeout();
            let keepalive_at = self.last_sent + self.config.idle_timeout() / 2;

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(peer = %self.remote_peer, "Session cancelled");
                    self.send_error("session closed".to_string()).await;
                    return Ok(());
                }

                frame = self.framed.next() => match frame {
                    None => {
                        debug!(peer = %self.remote_peer, "Peer closed the stream");
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e),
                    Some(Ok(wire)) => {
                        self.last_progress = Instant::now();
                        self.handle_message(wire.into_inner()).await?;
                    }
                },

                update = self.updates.recv(), if self.state == SessionState::Active => match update {
                    Ok(update) => {
                        self.send(ReplicationMessage::Offer {
                            writer: update.writer,
                            index: update.index,
                        })
                        .await?;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        debug!(peer = %self.remote_peer, missed, "Update feed lagged, offering heads");
                        self.offer_heads().await?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },

                _ = tokio::time::sleep_until(keepalive_at), if self.state == SessionState::Active => {
                    trace!(peer = %self.remote_peer, "Sending keepalive");
                    self.send(ReplicationMessage::Keepalive).await?;
                }

                _ = tokio::time::sleep_until(deadline) => {
                    debug!(
                        peer = %self.remote_peer,
                        awaiting_entry = self.pending.has_in_flight(),
                        "Session idle"
                    );
                    return Err(SyncError::Timeout(format!(
                        "no progress from {} for {:?}",
                        self.remote_peer,
                        self.config.idle_timeout()
                    )));
                }
            }
        }
    }

    async fn handle_message(&mut self, message: ReplicationMessage) -> SyncResult<()> {
        trace!(peer = %self.remote_peer, kind = message.kind(), "Received message");

        if self.state == SessionState::Handshaking && !message.is_handshake() {
            if let ReplicationMessage::Error { reason } = &message {
                self.remote_closed = true;
                return Err(SyncError::Handshake(format!("peer refused: {}", reason)));
            }
            return Err(SyncError::Handshake(format!(
                "received {} before handshake",
                message.kind()
            )));
        }

        match message {
            ReplicationMessage::Handshake {
                discovery_key,
                nonce,
                proof,
            } => self.handle_handshake(discovery_key, nonce, proof).await,
            ReplicationMessage::Offer { writer, index } => self.handle_offer(writer, index).await,
            ReplicationMessage::Request { writer, index } => {
                self.handle_request(writer, index).await
            }
            ReplicationMessage::Entry(envelope) => self.handle_entry(envelope).await,
            ReplicationMessage::Invalid {
                writer,
                index,
                reason,
            } => {
                warn!(peer = %self.remote_peer, %writer, index, %reason, "Peer rejected an entry we sent");
                self.emit(SyncEvent::PeerReportedInvalid {
                    discovery_key: self.discovery_key,
                    peer: self.remote_peer,
                    writer,
                    index,
                    reason,
                });
                Ok(())
            }
            ReplicationMessage::Error { reason } => {
                self.remote_closed = true;
                Err(SyncError::Transport(format!("peer closed session: {}", reason)))
            }
            ReplicationMessage::Keepalive => Ok(()),
        }
    }

    async fn handle_handshake(
        &mut self,
        discovery_key: DiscoveryKey,
        nonce: [u8; 32],
        proof: [u8; 32],
    ) -> SyncResult<()> {
        if self.state != SessionState::Handshaking {
            return Err(SyncError::Protocol("duplicate handshake".to_string()));
        }
        if discovery_key != self.discovery_key {
            return Err(SyncError::Handshake(format!(
                "peer is replicating {} instead of {}",
                discovery_key, self.discovery_key
            )));
        }
        if !self
            .store
            .keys()
            .verify_handshake_proof(&self.remote_peer, &nonce, &proof)
        {
            return Err(SyncError::Handshake(
                "peer does not hold the replication key".to_string(),
            ));
        }

        self.state = SessionState::Active;
        info!(dk = %self.discovery_key, peer = %self.remote_peer, "Session active");
        self.emit(SyncEvent::PeerConnected {
            discovery_key: self.discovery_key,
            peer: self.remote_peer,
        });

        self.offer_heads().await
    }

    /// Offer the head of every writer we hold
    async fn offer_heads(&mut self) -> SyncResult<()> {
        for (writer, head) in self.store.heads()? {
            self.send(ReplicationMessage::Offer {
                writer,
                index: head,
            })
            .await?;
        }
        Ok(())
    }

    async fn handle_offer(&mut self, writer: WriterKey, index: u64) -> SyncResult<()> {
        let from = self.store.head(&writer)?.map_or(0, |h| h + 1);
        if from > index {
            trace!(%writer, index, "Already have offered entry");
            return Ok(());
        }
        if let Some(next) = self.pending.want(writer, from, index) {
            self.request(writer, next).await?;
        }
        Ok(())
    }

    async fn handle_request(&mut self, writer: WriterKey, index: u64) -> SyncResult<()> {
        match self.store.get_envelope(&writer, index)? {
            Some(envelope) => {
                self.send(ReplicationMessage::Entry(envelope)).await?;
                self.summary.entries_sent += 1;
            }
            None => debug!(%writer, index, "Ignoring request for entry we do not have"),
        }
        Ok(())
    }

    async fn handle_entry(&mut self, envelope: Envelope) -> SyncResult<()> {
        let writer = envelope.writer;
        let index = envelope.index;

        match self.store.put(envelope) {
            Ok(PutOutcome::Stored(_)) => {
                self.summary.entries_received += 1;
                self.emit(SyncEvent::EntryStored {
                    discovery_key: self.discovery_key,
                    writer,
                    index,
                });
            }
            Ok(PutOutcome::AlreadyPresent(_)) => {
                trace!(%writer, index, "Entry already stored");
            }
            Err(SyncError::Validation(reason)) => {
                warn!(peer = %self.remote_peer, %writer, index, %reason, "Discarding invalid entry");
                self.emit(SyncEvent::InvalidEntry {
                    discovery_key: self.discovery_key,
                    peer: self.remote_peer,
                    writer,
                    index,
                    reason: reason.clone(),
                });
                self.send(ReplicationMessage::Invalid {
                    writer,
                    index,
                    reason,
                })
                .await?;
                self.pending.abandon(&writer);
                return self.penalize();
            }
            Err(e @ SyncError::Conflict { .. }) => {
                warn!(peer = %self.remote_peer, error = %e, "Peer sent a conflicting entry");
                self.pending.abandon(&writer);
                return self.penalize();
            }
            Err(e @ SyncError::OutOfOrder { .. }) => {
                debug!(peer = %self.remote_peer, error = %e, "Dropping out of order entry");
                if self.pending.is_in_flight(&writer, index) {
                    self.pending.abandon(&writer);
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let head = self.store.head(&writer)?;
        if let Some(next) = self.pending.complete(writer, index, head) {
            self.request(writer, next).await?;
        }
        Ok(())
    }

    /// Count a bad entry; fail the session past the configured limit
    fn penalize(&mut self) -> SyncResult<()> {
        self.summary.invalid_entries += 1;
        if self.summary.invalid_entries > self.config.max_invalid_entries {
            return Err(SyncError::Protocol(format!(
                "peer sent {} invalid entries",
                self.summary.invalid_entries
            )));
        }
        Ok(())
    }

    async fn request(&mut self, writer: WriterKey, index: u64) -> SyncResult<()> {
        trace!(%writer, index, "Requesting entry");
        self.send(ReplicationMessage::Request { writer, index }).await
    }

    async fn send_handshake(&mut self) -> SyncResult<()> {
        let mut nonce = [0u8; 32];
        rand::rng().fill_bytes(&mut nonce);
        let proof = self.store.keys().handshake_proof(&self.local_peer, &nonce);

        self.send(ReplicationMessage::Handshake {
            discovery_key: self.discovery_key,
            nonce,
            proof,
        })
        .await
    }

    async fn send(&mut self, message: ReplicationMessage) -> SyncResult<()> {
        self.framed.send(WireMessage::new(message)).await?;
        self.last_sent = Instant::now();
        Ok(())
    }

    /// Best-effort terminal message; failures are ignored
    async fn send_error(&mut self, reason: String) {
        let message = WireMessage::new(ReplicationMessage::Error { reason });
        let _ = tokio::time::timeout(CLOSE_GRACE, self.framed.send(message)).await;
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(n: u8) -> WriterKey {
        WriterKey([n; 32])
    }

    #[test]
    fn test_pending_issues_one_request_per_writer() {
        let mut pending = PendingRequests::default();

        assert_eq!(pending.want(writer(1), 0, 2), Some(0));
        // Same range offered again while 0 is in flight
        assert_eq!(pending.want(writer(1), 0, 2), None);
        assert!(pending.is_in_flight(&writer(1), 0));

        assert_eq!(pending.complete(writer(1), 0, Some(0)), Some(1));
        assert_eq!(pending.complete(writer(1), 1, Some(1)), Some(2));
        assert_eq!(pending.complete(writer(1), 2, Some(2)), None);
        assert!(!pending.has_in_flight());
    }

    #[test]
    fn test_pending_writers_progress_independently() {
        let mut pending = PendingRequests::default();

        assert_eq!(pending.want(writer(1), 0, 1), Some(0));
        assert_eq!(pending.want(writer(2), 3, 3), Some(3));
        assert!(pending.is_in_flight(&writer(1), 0));
        assert!(pending.is_in_flight(&writer(2), 3));
    }

    #[test]
    fn test_pending_later_offer_extends_target() {
        let mut pending = PendingRequests::default();

        assert_eq!(pending.want(writer(1), 0, 0), Some(0));
        assert_eq!(pending.want(writer(1), 0, 2), None);
        assert_eq!(pending.complete(writer(1), 0, Some(0)), Some(1));
        assert_eq!(pending.complete(writer(1), 1, Some(1)), Some(2));
    }

    #[test]
    fn test_pending_skips_entries_stored_elsewhere() {
        let mut pending = PendingRequests::default();

        assert_eq!(pending.want(writer(1), 0, 5), Some(0));
        // Another session filled the log up to 3 meanwhile
        assert_eq!(pending.complete(writer(1), 0, Some(3)), Some(4));
    }

    #[test]
    fn test_pending_ignores_unsolicited_completion() {
        let mut pending = PendingRequests::default();

        assert_eq!(pending.want(writer(1), 0, 2), Some(0));
        assert_eq!(pending.complete(writer(1), 1, Some(1)), None);
        assert!(pending.is_in_flight(&writer(1), 0));
        assert_eq!(pending.complete(writer(9), 0, Some(0)), None);
    }

    #[test]
    fn test_pending_abandon() {
        let mut pending = PendingRequests::default();

        pending.want(writer(1), 0, 2);
        pending.abandon(&writer(1));
        assert!(!pending.has_in_flight());
        assert_eq!(pending.want(writer(1), 0, 2), Some(0));
    }
}
