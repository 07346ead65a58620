//! Multiplexed byte streams within a session.
//!
//! A stream is a pair of ordered byte channels with credit-based flow
//! control. The owning session drives the wire side (`prepare_send`,
//! `deliver_segment`); applications consume through a [`StreamHandle`],
//! which stays valid without holding the session lock. Closing a stream
//! wakes pending receivers, which observe end-of-stream rather than an
//! error.

use crate::error::StreamError;
use crate::stream_codec::{StreamDecoder, StreamEncoder, stream_context};
use crate::{INITIAL_STREAM_CREDIT, SessionId};
use std::sync::Arc;
use std::time::Duration;
use stt_crypto::SessionKey;
use tokio::sync::{Mutex, mpsc};

/// Stream lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, nothing sent or received yet
    Idle,
    /// Carrying data
    Open,
    /// Closed; receivers drain and then observe end-of-stream
    Closed,
}

/// Stream statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    /// Plaintext bytes sent
    pub bytes_sent: u64,
    /// Plaintext bytes received
    pub bytes_received: u64,
    /// Chunks sent
    pub chunks_sent: u64,
    /// Chunks received
    pub chunks_received: u64,
    /// Remaining send credit
    pub send_credit: u64,
    /// Remaining receive credit
    pub recv_credit: u64,
}

/// A single multiplexed stream, owned by its session.
pub struct Stream {
    id: u32,
    session_id: SessionId,
    state: StreamState,
    send_credit: u64,
    recv_credit: u64,
    encoder: StreamEncoder,
    decoder: StreamDecoder,
    recv_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    recv_rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    stats: StreamStats,
}

impl Stream {
    /// Create a stream with its per-direction crypto contexts derived from
    /// the session key.
    #[must_use]
    pub fn new(id: u32, session_id: SessionId, session_key: &SessionKey) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id,
            session_id,
            state: StreamState::Idle,
            send_credit: INITIAL_STREAM_CREDIT,
            recv_credit: INITIAL_STREAM_CREDIT,
            encoder: StreamEncoder::new(stream_context(session_key, &session_id, id)),
            decoder: StreamDecoder::new(stream_context(session_key, &session_id, id)),
            recv_tx: Some(tx),
            recv_rx: Arc::new(Mutex::new(rx)),
            stats: StreamStats {
                send_credit: INITIAL_STREAM_CREDIT,
                recv_credit: INITIAL_STREAM_CREDIT,
                ..StreamStats::default()
            },
        }
    }

    /// Stream identifier.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Owning session identifier.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Whether the stream is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Encode an outbound chunk, charging send credit.
    ///
    /// Returns the per-stream sequence and the encrypted segment for the
    /// session to wrap into a frame.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Closed` on a closed stream and
    /// `StreamError::FlowControl` when credit is insufficient.
    pub fn prepare_send(&mut self, data: &[u8]) -> Result<(u64, Vec<u8>), StreamError> {
        if self.state == StreamState::Closed {
            return Err(StreamError::Closed);
        }
        let needed = data.len() as u64;
        if needed > self.send_credit {
            return Err(StreamError::FlowControl {
                needed,
                available: self.send_credit,
            });
        }

        let (sequence, segment) = self.encoder.encode_segment(data)?;
        self.send_credit -= needed;
        self.stats.send_credit = self.send_credit;
        self.stats.bytes_sent += needed;
        self.stats.chunks_sent += 1;
        if self.state == StreamState::Idle {
            self.state = StreamState::Open;
        }
        tracing::debug!(
            stream = self.id,
            sequence,
            bytes = data.len(),
            credit = self.send_credit,
            "queued stream chunk"
        );
        Ok((sequence, segment))
    }

    /// Ingest an inbound segment and deliver any chunks that became
    /// contiguous, in sender order.
    ///
    /// Duplicate and stale sequences are dropped silently by the decoder.
    /// Returns the delivered chunks; each is also pushed to the stream's
    /// receive channel.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::FlowControl` if the sender overran our receive
    /// window — the decoded chunk and the rest of its batch stay parked in
    /// the reorder buffer (see [`Self::flush_ready`]) — or the decoder's
    /// segment errors.
    pub fn deliver_segment(
        &mut self,
        segment: &[u8],
        sequence: u64,
    ) -> Result<Vec<Vec<u8>>, StreamError> {
        if self.state == StreamState::Closed {
            return Err(StreamError::Closed);
        }

        self.decoder.decode_segment(segment, Some(sequence))?;
        self.flush_ready()
    }

    /// Deliver every buffered chunk that is contiguous from the delivery
    /// cursor, in sender order.
    ///
    /// The whole contiguous run is charged against receive credit before
    /// anything is consumed: on `FlowControl` the decoder's buffer and
    /// delivery cursor are untouched, so the chunks remain recoverable
    /// once [`Self::add_recv_credit`] makes another flush possible.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::FlowControl` when the ready batch exceeds the
    /// remaining receive window.
    pub fn flush_ready(&mut self) -> Result<Vec<Vec<u8>>, StreamError> {
        if self.state == StreamState::Closed {
            return Err(StreamError::Closed);
        }

        let needed = self.decoder.ready_bytes();
        if needed > self.recv_credit {
            return Err(StreamError::FlowControl {
                needed,
                available: self.recv_credit,
            });
        }

        let ready = self.decoder.get_ordered_chunks();
        let mut delivered = Vec::with_capacity(ready.len());
        for chunk in ready {
            let len = chunk.len() as u64;
            self.recv_credit -= len;
            self.stats.recv_credit = self.recv_credit;
            self.stats.bytes_received += len;
            self.stats.chunks_received += 1;
            if let Some(tx) = &self.recv_tx {
                // A send failure means every handle is gone; the chunks
                // are undeliverable and dropping them is correct.
                let _ = tx.send(chunk.clone());
            }
            delivered.push(chunk);
        }
        if !delivered.is_empty() && self.state == StreamState::Idle {
            self.state = StreamState::Open;
        }
        Ok(delivered)
    }

    /// Grant additional send credit (peer flow-control update).
    pub fn add_send_credit(&mut self, amount: u64) {
        self.send_credit += amount;
        self.stats.send_credit = self.send_credit;
    }

    /// Grant additional receive credit (local decision).
    pub fn add_recv_credit(&mut self, amount: u64) {
        self.recv_credit += amount;
        self.stats.recv_credit = self.recv_credit;
    }

    /// Close the stream. Pending receivers drain buffered chunks, then see
    /// end-of-stream.
    pub fn close(&mut self) {
        if self.state != StreamState::Closed {
            self.state = StreamState::Closed;
            self.recv_tx = None;
            tracing::debug!(stream = self.id, "stream closed");
        }
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> StreamStats {
        self.stats.clone()
    }

    /// Obtain a receive handle usable without the session lock.
    #[must_use]
    pub fn handle(&self) -> StreamHandle {
        StreamHandle {
            id: self.id,
            session_id: self.session_id,
            rx: Arc::clone(&self.recv_rx),
        }
    }
}

/// Lightweight consumer-side handle to a stream's receive channel.
///
/// Holds the session and stream ids rather than a back pointer, so handles
/// survive independently of the session table's locking.
#[derive(Clone)]
pub struct StreamHandle {
    id: u32,
    session_id: SessionId,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl StreamHandle {
    /// Stream identifier.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Owning session identifier.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Receive the next chunk in sender order.
    ///
    /// Returns `Ok(None)` on end-of-stream (the stream was closed and the
    /// buffer is drained).
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Timeout` if `timeout` elapses first.
    pub async fn receive(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, StreamError> {
        let mut rx = self.rx.lock().await;
        match timeout {
            None => Ok(rx.recv().await),
            Some(limit) => tokio::time::timeout(limit, rx.recv())
                .await
                .map_err(|_| StreamError::Timeout),
        }
    }
}
