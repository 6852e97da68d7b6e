// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-connection I/O: the discriminant handshake, framed reads, and the
//! batched write-back loop (§5, §6). Everything here only moves bytes; dispatch
//! to the scheduler core happens in `lib.rs`'s event loop.

use futures::{SinkExt, StreamExt};
use scheduler_protocol::framing::MessageCodec;
use scheduler_protocol::messages::{Batch, ClientMessage, SchedulerToClient, SchedulerToWorker, WorkerMessage};
use std::collections::HashMap;
use tokio::io::{split, AsyncReadExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

/// First byte a connecting peer sends, selecting which message family follows.
pub const WORKER_TAG: u8 = 0;
/// See [`WORKER_TAG`].
pub const CLIENT_TAG: u8 = 1;

type WorkerReader = FramedRead<ReadHalf<TcpStream>, MessageCodec<WorkerMessage>>;
type WorkerWriter = FramedWrite<WriteHalf<TcpStream>, MessageCodec<SchedulerToWorker>>;
type ClientReader = FramedRead<ReadHalf<TcpStream>, MessageCodec<ClientMessage>>;
type ClientWriter = FramedWrite<WriteHalf<TcpStream>, MessageCodec<SchedulerToClient>>;

/// A unit of work handed from a connection's reader task to the event loop.
#[derive(Debug)]
pub enum ServerEvent {
    /// A worker completed its handshake. The event loop replies on `ready` with
    /// the receiving half of the `BatchedSender` it registers for this worker,
    /// which this connection's writer task then drains onto the wire.
    WorkerConnected {
        register: WorkerRegistration,
        ready: oneshot::Sender<mpsc::UnboundedReceiver<Batch<SchedulerToWorker>>>,
    },
    /// A subsequent message from an already-connected worker.
    WorkerMessage { address: String, message: WorkerMessage },
    /// The worker's connection closed.
    WorkerDisconnected { address: String },
    /// A client completed its handshake. See [`ServerEvent::WorkerConnected`].
    ClientConnected {
        client_id: String,
        ready: oneshot::Sender<mpsc::UnboundedReceiver<Batch<SchedulerToClient>>>,
    },
    /// A subsequent message from an already-connected client.
    ClientMessage { client_id: String, message: ClientMessage },
    /// The client's connection closed.
    ClientDisconnected { client_id: String },
}

/// Fields carried by a worker's `register` handshake message (§6).
#[derive(Debug, Clone)]
pub struct WorkerRegistration {
    pub address: String,
    pub ncores: usize,
    pub host: String,
    pub services: HashMap<String, String>,
    pub resources: HashMap<String, f64>,
    pub nbytes_known: Vec<(String, i64)>,
}

/// Accepts one raw connection, reads its discriminant byte, and drives the
/// appropriate worker/client handling loop until the peer disconnects.
pub async fn handle_connection(mut stream: TcpStream, events_tx: mpsc::UnboundedSender<ServerEvent>) {
    let mut tag = [0u8; 1];
    if let Err(e) = stream.read_exact(&mut tag).await {
        debug!(error = %e, "peer closed before sending a handshake tag");
        return;
    }

    match tag[0] {
        WORKER_TAG => handle_worker_connection(stream, events_tx).await,
        CLIENT_TAG => handle_client_connection(stream, events_tx).await,
        other => warn!(tag = other, "unknown peer handshake tag; dropping connection"),
    }
}

async fn handle_worker_connection(stream: TcpStream, events_tx: mpsc::UnboundedSender<ServerEvent>) {
    let (read_half, write_half) = split(stream);
    let mut reader: WorkerReader = FramedRead::new(read_half, MessageCodec::default());
    let writer: WorkerWriter = FramedWrite::new(write_half, MessageCodec::default());

    let register = match read_registration(&mut reader).await {
        Some(r) => r,
        None => return,
    };
    let address = register.address.clone();

    let (ready_tx, ready_rx) = oneshot::channel();
    if events_tx.send(ServerEvent::WorkerConnected { register, ready: ready_tx }).is_err() {
        return;
    }
    let Ok(outbound_rx) = ready_rx.await else {
        return;
    };

    tokio::spawn(run_writer(writer, outbound_rx, address.clone()));

    loop {
        match reader.next().await {
            Some(Ok(batch)) => {
                for message in batch.messages {
                    if events_tx
                        .send(ServerEvent::WorkerMessage { address: address.clone(), message })
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, address = %address, "worker frame decode error; dropping connection");
                break;
            }
            None => break,
        }
    }
    let _ = events_tx.send(ServerEvent::WorkerDisconnected { address });
}

async fn read_registration(reader: &mut WorkerReader) -> Option<WorkerRegistration> {
    loop {
        match reader.next().await {
            Some(Ok(batch)) => {
                let Some(first) = batch.messages.into_iter().next() else {
                    continue;
                };
                return match first {
                    WorkerMessage::Register {
                        address,
                        ncores,
                        host,
                        services,
                        resources,
                        nbytes_known,
                    } => Some(WorkerRegistration {
                        address,
                        ncores,
                        host,
                        services,
                        resources,
                        nbytes_known,
                    }),
                    _ => {
                        warn!("worker connection's first message was not register; dropping");
                        None
                    }
                };
            }
            Some(Err(e)) => {
                warn!(error = %e, "failed to decode worker handshake frame");
                return None;
            }
            None => return None,
        }
    }
}

async fn run_writer<W, M>(mut writer: W, mut outbound_rx: mpsc::UnboundedReceiver<Batch<M>>, peer: String)
where
    W: futures::Sink<Batch<M>> + Unpin,
    W::Error: std::fmt::Display,
{
    while let Some(batch) = outbound_rx.recv().await {
        if let Err(e) = writer.send(batch).await {
            debug!(error = %e, peer = %peer, "peer write side closed");
            break;
        }
    }
}

async fn handle_client_connection(stream: TcpStream, events_tx: mpsc::UnboundedSender<ServerEvent>) {
    let (read_half, write_half) = split(stream);
    let mut reader: ClientReader = FramedRead::new(read_half, MessageCodec::default());
    let mut writer: ClientWriter = FramedWrite::new(write_half, MessageCodec::default());

    let client_id = uuid::Uuid::new_v4().to_string();
    if writer
        .send(Batch::new(vec![SchedulerToClient::StreamStart { client_id: client_id.clone() }]))
        .await
        .is_err()
    {
        return;
    }

    let (ready_tx, ready_rx) = oneshot::channel();
    if events_tx
        .send(ServerEvent::ClientConnected { client_id: client_id.clone(), ready: ready_tx })
        .is_err()
    {
        return;
    }
    let Ok(outbound_rx) = ready_rx.await else {
        return;
    };

    tokio::spawn(run_writer(writer, outbound_rx, client_id.clone()));

    loop {
        match reader.next().await {
            Some(Ok(batch)) => {
                for message in batch.messages {
                    if events_tx
                        .send(ServerEvent::ClientMessage { client_id: client_id.clone(), message })
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, client_id = %client_id, "client frame decode error; dropping connection");
                break;
            }
            None => break,
        }
    }
    let _ = events_tx.send(ServerEvent::ClientDisconnected { client_id });
}
