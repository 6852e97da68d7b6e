// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Length-prefixed framing and the batched-send contract (§5, §6).
//!
//! A peer channel is a duplex stream of length-prefixed frames; each frame is one
//! CBOR-encoded [`Batch`](crate::messages::Batch). Outgoing messages are queued
//! and drained into a single frame at most every `interval`: this coalesces
//! multiple `ComputeTask`/`KeyInMemory`-style notifications produced within one
//! event-loop tick into one transport write without reordering them. The queue
//! never blocks the caller and never raises; on comm close, whatever was queued
//! is dropped rather than risk a partial write.

use crate::messages::Batch;
use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Errors raised while encoding or decoding a frame.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// The frame's CBOR payload could not be decoded.
    #[error("failed to decode frame: {0}")]
    Decode(String),
    /// A message could not be CBOR-encoded.
    #[error("failed to encode frame: {0}")]
    Encode(String),
    /// The underlying length-delimited transport errored.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Wraps [`LengthDelimitedCodec`] with CBOR (de)serialization of a [`Batch<M>`].
pub struct MessageCodec<M> {
    inner: LengthDelimitedCodec,
    _marker: std::marker::PhantomData<fn() -> M>,
}

impl<M> Default for MessageCodec<M> {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<M: Serialize> Encoder<Batch<M>> for MessageCodec<M> {
    type Error = CodecError;

    fn encode(&mut self, item: Batch<M>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut payload = Vec::new();
        ciborium::into_writer(&item, &mut payload).map_err(|e| CodecError::Encode(e.to_string()))?;
        self.inner.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

impl<M: DeserializeOwned> Decoder for MessageCodec<M> {
    type Item = Batch<M>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let batch = ciborium::from_reader(frame.reader()).map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(Some(batch))
    }
}

/// Interval-batched outgoing queue for one peer (§5 "Batched send contract").
///
/// `send` appends to an in-memory queue and returns immediately; a background
/// drain flushes the accumulated queue as one [`Batch`] at most every `interval`.
/// If the peer's outgoing channel is closed, queued messages are silently
/// dropped: the caller reconciles state on reconnection rather than retrying.
pub struct BatchedSender<M> {
    queued: Vec<M>,
    interval: Duration,
    out: mpsc::UnboundedSender<Batch<M>>,
}

impl<M> BatchedSender<M> {
    /// Creates a sender paired with the receiver the transport-write task drains.
    #[must_use]
    pub fn new(interval: Duration) -> (Self, mpsc::UnboundedReceiver<Batch<M>>) {
        let (out, rx) = mpsc::unbounded_channel();
        (
            Self {
                queued: Vec::new(),
                interval,
                out,
            },
            rx,
        )
    }

    /// Queues `message` for the next flush. Never blocks, never raises: per §5
    /// this is best-effort and the caller must not treat it as a delivery
    /// guarantee.
    pub fn send(&mut self, message: M) {
        self.queued.push(message);
    }

    /// Returns the configured flush interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Drains the queue into one batch and pushes it to the transport-write
    /// task, if non-empty. Returns `false` once the receiving end has closed,
    /// signalling the caller should stop scheduling further flushes.
    pub fn flush(&mut self) -> bool {
        if self.queued.is_empty() {
            return !self.out.is_closed();
        }
        let batch = Batch::new(std::mem::take(&mut self.queued));
        self.out.send(batch).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SchedulerToClient;

    #[test]
    fn flush_coalesces_queued_messages_into_one_batch() {
        let (mut sender, mut rx) = BatchedSender::<SchedulerToClient>::new(Duration::from_millis(2));
        sender.send(SchedulerToClient::KeyInMemory {
            key: "a".to_string(),
            nbytes: 10,
        });
        sender.send(SchedulerToClient::KeyInMemory {
            key: "b".to_string(),
            nbytes: 20,
        });
        assert!(sender.flush());

        let batch = rx.try_recv().expect("batch queued");
        assert_eq!(batch.messages.len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn flush_is_noop_when_queue_empty() {
        let (mut sender, mut rx) = BatchedSender::<SchedulerToClient>::new(Duration::from_millis(2));
        assert!(sender.flush());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn flush_reports_closed_receiver() {
        let (mut sender, rx) = BatchedSender::<SchedulerToClient>::new(Duration::from_millis(2));
        drop(rx);
        sender.send(SchedulerToClient::Restart);
        assert!(!sender.flush());
    }

    #[test]
    fn codec_round_trips_a_batch() {
        let mut codec = MessageCodec::<SchedulerToClient>::default();
        let batch = Batch::new(vec![SchedulerToClient::KeyInMemory {
            key: "a".to_string(),
            nbytes: 42,
        }]);
        let mut buf = BytesMut::new();
        codec.encode(batch.clone(), &mut buf).expect("encode");

        let mut codec = MessageCodec::<SchedulerToClient>::default();
        let decoded = codec.decode(&mut buf).expect("decode").expect("frame present");
        assert_eq!(decoded, batch);
    }
}
