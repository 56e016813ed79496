//! A single multiplexed connection: a reader task that demultiplexes
//! responses by stream id, a writer task that serializes outbound frames,
//! and a heartbeat task that defuncts the connection on prolonged silence.
//!
//! The two I/O tasks communicate only through a shared callback table
//! guarded by one mutex; there is no lock shared beyond it, matching the
//! single-threaded-per-connection reactor model.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{
    callback::{CallbackResponse, CallbackState, RequestCallback},
    establish::HandshakeIo,
    options::ConnectionOptions,
    stream_manager::StreamManager,
};
use crate::{
    compression,
    error::{Error, ErrorKind, Result, ServerError},
    protocol::{self, EncodedFrame, Frame, FrameCodec, FrameFlags, Opcode},
    runtime::{self, AsyncJoinHandle, AsyncStream, Interval},
};

/// `EVENT` frames observed on a connection registered for server push
/// events are forwarded here; only the control connection supplies one.
pub(crate) type EventSender = mpsc::UnboundedSender<Frame>;

struct OutboundRequest {
    opcode: Opcode,
    body: BytesMut,
    callback: RequestCallback,
}

/// State shared between the reader and writer tasks: the callback table
/// keyed by stream id and the stream id allocator.
struct Shared {
    stream_manager: Mutex<StreamManager>,
    callbacks: Mutex<HashMap<i16, RequestCallback>>,
    in_flight: AtomicUsize,
    current_keyspace: Mutex<Option<String>>,
    defunct: AtomicBool,
}

/// A cheap, cloneable handle to one established connection. Holds no
/// socket directly; the socket lives inside the reader/writer tasks this
/// handle spawned, and closes when both tasks exit.
#[derive(Clone)]
pub(crate) struct Connection {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<OutboundRequest>,
    reader_task: Arc<AsyncJoinHandle<()>>,
    writer_task: Arc<AsyncJoinHandle<()>>,
    heartbeat_task: Arc<AsyncJoinHandle<()>>,
    address: SocketAddr,
}

impl Connection {
    /// Completes the handshake over `stream` and spawns the reader, writer,
    /// and heartbeat tasks. `events` receives `EVENT` frames observed on
    /// this connection (only meaningful for a control connection that
    /// `REGISTER`ed for them).
    pub(crate) async fn establish(
        address: SocketAddr,
        stream: AsyncStream,
        options: &ConnectionOptions,
        events: Option<EventSender>,
    ) -> Result<Self> {
        let (io, compression) = super::establish::handshake(stream, options).await?;
        Ok(Self::spawn(address, io, options, compression, events))
    }

    fn spawn(
        address: SocketAddr,
        io: HandshakeIo,
        options: &ConnectionOptions,
        compression: Option<compression::Algorithm>,
        events: Option<EventSender>,
    ) -> Self {
        let max_stream_id = protocol::max_stream_id(options.protocol_version);
        let shared = Arc::new(Shared {
            stream_manager: Mutex::new(StreamManager::new(max_stream_id)),
            callbacks: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            current_keyspace: Mutex::new(options.keyspace.clone()),
            defunct: AtomicBool::new(false),
        });

        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundRequest>(64);

        let reader_task = runtime::spawn(reader_loop(io.reader, shared.clone(), compression, events));
        let writer_task = runtime::spawn(writer_loop(io.writer, outbound_rx, shared.clone(), compression));
        let heartbeat_task = runtime::spawn(heartbeat_loop(
            outbound_tx.clone(),
            shared.clone(),
            options.heartbeat_interval,
            options.idle_timeout,
        ));

        Self {
            shared,
            outbound: outbound_tx,
            reader_task: Arc::new(reader_task),
            writer_task: Arc::new(writer_task),
            heartbeat_task: Arc::new(heartbeat_task),
            address,
        }
    }

    /// The address this connection is talking to.
    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    /// The number of requests currently awaiting a response on this
    /// connection, used by [`super::connection_pool::Pool`]'s least-busy
    /// selection.
    pub(crate) fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Relaxed)
    }

    /// Whether this connection has been defuncted (socket error, protocol
    /// violation, or heartbeat timeout) and must no longer be selected.
    pub(crate) fn is_defunct(&self) -> bool {
        self.shared.defunct.load(Ordering::Relaxed)
    }

    /// The keyspace this connection last successfully `USE`d, if any.
    pub(crate) fn current_keyspace(&self) -> Option<String> {
        self.shared.current_keyspace.lock().unwrap().clone()
    }

    /// Issues `USE <keyspace>` on this connection and, on success, updates
    /// the keyspace this connection reports via [`Connection::current_keyspace`].
    /// Used by the pool manager to propagate a session-wide keyspace change
    /// to already-open connections.
    pub(crate) async fn set_keyspace(&self, keyspace: &str) -> Result<()> {
        let request = protocol::QueryRequest {
            query: format!("USE {keyspace}"),
            params: protocol::QueryParams::default(),
        };
        let body = request.encode()?;
        self.send(Opcode::Query, body).await?;
        *self.shared.current_keyspace.lock().unwrap() = Some(keyspace.to_string());
        Ok(())
    }

    /// Sends a raw request body and awaits its response, or an error if the
    /// connection has no stream ids free, is defunct, or closes before a
    /// response arrives.
    pub(crate) async fn send(&self, opcode: Opcode, body: BytesMut) -> Result<Frame> {
        if self.is_defunct() {
            return Err(Error::internal("connection is defunct"));
        }
        let (callback, receiver) = RequestCallback::new(None);
        self.outbound
            .send(OutboundRequest {
                opcode,
                body,
                callback,
            })
            .await
            .map_err(|_| Error::internal("connection writer task has exited"))?;
        receiver
            .await
            .map_err(|_| Error::internal("connection closed before a response arrived"))?
    }

    /// Sends with a deadline, per request execution's per-attempt timeout.
    pub(crate) async fn send_with_timeout(
        &self,
        opcode: Opcode,
        body: BytesMut,
        timeout: Duration,
    ) -> Result<Frame> {
        runtime::with_timeout(timeout, self.send(opcode, body)).await?
    }

    /// Force-closes the connection: aborts all three tasks and fails every
    /// pending request. Idempotent.
    pub(crate) fn defunct(&self) {
        if !self.shared.defunct.swap(true, Ordering::Relaxed) {
            self.reader_task.abort();
            self.writer_task.abort();
            self.heartbeat_task.abort();
            let pending: Vec<RequestCallback> =
                self.shared.callbacks.lock().unwrap().drain().map(|(_, v)| v).collect();
            for callback in pending {
                callback.complete(Err(Error::internal("connection was closed")));
            }
        }
    }

    /// Initiates a graceful close. In-flight requests are abandoned rather
    /// than drained, since a pool closing its connections has already
    /// decided it no longer wants to serve them.
    pub(crate) fn close(&self) {
        self.defunct();
    }
}

/// Drains every request already sitting in the outbound channel into one
/// write-buffer fill, then flushes once, instead of a syscall per request:
/// a burst of concurrent callers sharing this connection pays for one
/// flush rather than one each.
async fn writer_loop(
    mut writer: FramedWrite<tokio::io::WriteHalf<AsyncStream>, FrameCodec>,
    mut outbound: mpsc::Receiver<OutboundRequest>,
    shared: Arc<Shared>,
    compression_algo: Option<compression::Algorithm>,
) {
    while let Some(first) = outbound.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = outbound.try_recv() {
            batch.push(next);
        }

        let mut fed = Vec::with_capacity(batch.len());
        for request in batch {
            if shared.defunct.load(Ordering::Relaxed) {
                request
                    .callback
                    .complete(Err(Error::internal("connection is defunct")));
                continue;
            }
            if let Some(stream_id) = feed_outbound(&mut writer, request, &shared, compression_algo).await {
                fed.push(stream_id);
            }
        }

        if fed.is_empty() {
            continue;
        }

        match writer.flush().await {
            Ok(()) => {
                for stream_id in fed {
                    transition_after_write(&shared, stream_id);
                }
            }
            Err(e) => {
                for stream_id in fed {
                    release_failed_write(&shared, stream_id, e.clone());
                }
            }
        }
    }
}

/// Encodes one request into the write buffer without flushing. Returns the
/// stream id on success, or `None` if the request was already failed (no
/// free stream id, or compression failed) and should not be flushed.
async fn feed_outbound(
    writer: &mut FramedWrite<tokio::io::WriteHalf<AsyncStream>, FrameCodec>,
    request: OutboundRequest,
    shared: &Arc<Shared>,
    compression_algo: Option<compression::Algorithm>,
) -> Option<i16> {
    let stream_id = shared.stream_manager.lock().unwrap().acquire();
    let Some(stream_id) = stream_id else {
        request.callback.complete(Err(Error::no_stream_ids()));
        return None;
    };
    shared.in_flight.fetch_add(1, Ordering::Relaxed);
    shared.callbacks.lock().unwrap().insert(stream_id, request.callback);

    let (flags, body) = match compression_algo {
        Some(algo) => match compression::compress(algo, &request.body) {
            Ok(body) => (FrameFlags::COMPRESSION, body),
            Err(e) => {
                release_failed_write(shared, stream_id, e);
                return None;
            }
        },
        None => (FrameFlags::empty(), request.body.freeze()),
    };

    let feed_result = writer
        .feed(EncodedFrame {
            flags,
            stream_id,
            opcode: request.opcode,
            body,
        })
        .await;

    match feed_result {
        Ok(()) => Some(stream_id),
        Err(e) => {
            release_failed_write(shared, stream_id, e);
            None
        }
    }
}

fn release_failed_write(shared: &Arc<Shared>, stream_id: i16, error: Error) {
    let callback = shared.callbacks.lock().unwrap().remove(&stream_id);
    shared.in_flight.fetch_sub(1, Ordering::Relaxed);
    shared.stream_manager.lock().unwrap().release(stream_id);
    if let Some(callback) = callback {
        callback.complete(Err(error));
    }
}

/// Implements the writer side of the `WRITING`/`READING`/`READ_BEFORE_WRITE`
/// transition table: once the write is confirmed, either move the pending
/// callback to `READING`, or if the response already arrived, deliver it.
fn transition_after_write(shared: &Arc<Shared>, stream_id: i16) {
    let mut callbacks = shared.callbacks.lock().unwrap();
    let Some(callback) = callbacks.get_mut(&stream_id) else {
        return;
    };
    match std::mem::replace(&mut callback.state, CallbackState::Reading) {
        CallbackState::Writing => {}
        CallbackState::ReadBeforeWrite(response) => {
            let callback = callbacks.remove(&stream_id).unwrap();
            drop(callbacks);
            shared.in_flight.fetch_sub(1, Ordering::Relaxed);
            shared.stream_manager.lock().unwrap().release(stream_id);
            callback.complete(response);
        }
        CallbackState::Reading => {
            // A write cannot legally complete twice for the same stream
            // id; put it back and let the connection run until the server
            // eventually responds or the caller's deadline elapses.
            callback.state = CallbackState::Reading;
        }
    }
}

async fn reader_loop(
    mut reader: FramedRead<tokio::io::ReadHalf<AsyncStream>, FrameCodec>,
    shared: Arc<Shared>,
    compression_algo: Option<compression::Algorithm>,
    events: Option<EventSender>,
) {
    loop {
        let frame = match reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                defunct_all_pending(&shared, e);
                return;
            }
            None => {
                defunct_all_pending(&shared, Error::internal("connection closed by peer"));
                return;
            }
        };

        if frame.stream_id < 0 {
            if frame.opcode == Opcode::Event {
                if let Some(events) = &events {
                    match decompress_frame_body(&frame, compression_algo) {
                        Ok(body) => {
                            let _ = events.send(Frame {
                                body: BytesMut::from(body.as_ref()),
                                flags: frame.flags - FrameFlags::COMPRESSION,
                                ..frame
                            });
                        }
                        Err(e) => {
                            defunct_all_pending(&shared, e);
                            return;
                        }
                    }
                }
            }
            continue;
        }

        let response = decode_response(&frame, compression_algo);
        dispatch_response(&shared, frame.stream_id, response);
    }
}

fn decompress_frame_body(
    frame: &Frame,
    compression_algo: Option<compression::Algorithm>,
) -> Result<bytes::Bytes> {
    if frame.flags.contains(FrameFlags::COMPRESSION) {
        let algo = compression_algo
            .ok_or_else(|| Error::internal("received compressed frame with no algorithm negotiated"))?;
        compression::decompress(algo, &frame.body)
    } else {
        Ok(frame.body.clone().freeze())
    }
}

fn decode_response(
    frame: &Frame,
    compression_algo: Option<compression::Algorithm>,
) -> CallbackResponse {
    let raw = decompress_frame_body(frame, compression_algo)?;
    if frame.opcode == Opcode::Error {
        let mut raw = raw;
        let server_error = protocol::messages::decode_error_body(&mut raw)?;
        return Err(ErrorKind::Server(server_error).into());
    }
    Ok(Frame {
        protocol_version: frame.protocol_version,
        flags: frame.flags,
        stream_id: frame.stream_id,
        opcode: frame.opcode,
        body: BytesMut::from(raw.as_ref()),
    })
}

/// Implements the reader side of the transition table: a response for a
/// stream in `READING` completes the request directly; a response arriving
/// for a stream still in `WRITING` is cached as `READ_BEFORE_WRITE` for the
/// writer task to deliver once it observes the write as complete.
fn dispatch_response(shared: &Arc<Shared>, stream_id: i16, response: CallbackResponse) {
    let mut callbacks = shared.callbacks.lock().unwrap();
    let Some(callback) = callbacks.get_mut(&stream_id) else {
        // Unknown stream id, most likely a response for a request whose
        // caller already canceled and released the id. Not on its own a
        // protocol violation.
        return;
    };

    match callback.state {
        CallbackState::Reading => {
            let callback = callbacks.remove(&stream_id).unwrap();
            drop(callbacks);
            shared.in_flight.fetch_sub(1, Ordering::Relaxed);
            shared.stream_manager.lock().unwrap().release(stream_id);
            callback.complete(response);
        }
        CallbackState::Writing => {
            callback.state = CallbackState::ReadBeforeWrite(response);
        }
        CallbackState::ReadBeforeWrite(_) => {
            drop(callbacks);
            defunct_all_pending(
                shared,
                ErrorKind::Server(ServerError::ProtocolError {
                    message: format!("duplicate response for stream id {stream_id}"),
                })
                .into(),
            );
        }
    }
}

fn defunct_all_pending(shared: &Arc<Shared>, error: Error) {
    shared.defunct.store(true, Ordering::Relaxed);
    let pending: Vec<RequestCallback> = shared.callbacks.lock().unwrap().drain().map(|(_, v)| v).collect();
    let remaining = pending.len();
    shared.in_flight.fetch_sub(remaining, Ordering::Relaxed);
    for callback in pending {
        callback.complete(Err(error.clone()));
    }
}

async fn heartbeat_loop(
    outbound: mpsc::Sender<OutboundRequest>,
    shared: Arc<Shared>,
    heartbeat_interval: Duration,
    idle_timeout: Duration,
) {
    let mut ticker = Interval::new(heartbeat_interval);
    loop {
        ticker.tick().await;
        if shared.defunct.load(Ordering::Relaxed) {
            return;
        }

        let (callback, receiver) = RequestCallback::new(Some(Instant::now() + idle_timeout));
        if outbound
            .send(OutboundRequest {
                opcode: Opcode::Options,
                body: BytesMut::new(),
                callback,
            })
            .await
            .is_err()
        {
            return;
        }

        match runtime::with_timeout(idle_timeout, receiver).await {
            Ok(Ok(Ok(_))) => {}
            _ => {
                shared.defunct.store(true, Ordering::Relaxed);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_with_one_stream() -> (Arc<Shared>, i16) {
        let shared = Arc::new(Shared {
            stream_manager: Mutex::new(StreamManager::new(127)),
            callbacks: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            current_keyspace: Mutex::new(None),
            defunct: AtomicBool::new(false),
        });
        let stream_id = shared.stream_manager.lock().unwrap().acquire().unwrap();
        shared.in_flight.fetch_add(1, Ordering::Relaxed);
        (shared, stream_id)
    }

    /// Scenario: the response for a request arrives before the writer task
    /// has confirmed the write that sent it. `dispatch_response` (reader
    /// side) must cache it as `ReadBeforeWrite` rather than complete the
    /// caller immediately, and `transition_after_write` (writer side) must
    /// then be the one to deliver it, exactly once, releasing the stream id.
    #[tokio::test]
    async fn response_racing_ahead_of_write_confirmation_is_delivered_once() {
        let (shared, stream_id) = shared_with_one_stream();
        let (callback, receiver) = RequestCallback::new(None);
        shared.callbacks.lock().unwrap().insert(stream_id, callback);

        let response_frame = Frame {
            protocol_version: 4,
            flags: FrameFlags::empty(),
            stream_id,
            opcode: Opcode::Result,
            body: BytesMut::new(),
        };
        dispatch_response(&shared, stream_id, Ok(response_frame));

        // Still pending: the writer hasn't confirmed its write yet, so the
        // response must not have been delivered to the caller.
        assert!(receiver.try_recv().is_err());
        assert!(matches!(
            shared.callbacks.lock().unwrap().get(&stream_id).unwrap().state,
            CallbackState::ReadBeforeWrite(_)
        ));

        transition_after_write(&shared, stream_id);

        let delivered = receiver.await.unwrap();
        assert!(delivered.is_ok());
        assert!(!shared.callbacks.lock().unwrap().contains_key(&stream_id));
        assert_eq!(shared.in_flight.load(Ordering::Relaxed), 0);
    }

    /// The ordinary order: write confirms first (`Writing -> Reading`), then
    /// the response arrives and completes the caller directly.
    #[tokio::test]
    async fn response_arriving_after_write_confirmation_completes_directly() {
        let (shared, stream_id) = shared_with_one_stream();
        let (callback, receiver) = RequestCallback::new(None);
        shared.callbacks.lock().unwrap().insert(stream_id, callback);

        transition_after_write(&shared, stream_id);
        assert!(matches!(
            shared.callbacks.lock().unwrap().get(&stream_id).unwrap().state,
            CallbackState::Reading
        ));

        let response_frame = Frame {
            protocol_version: 4,
            flags: FrameFlags::empty(),
            stream_id,
            opcode: Opcode::Result,
            body: BytesMut::new(),
        };
        dispatch_response(&shared, stream_id, Ok(response_frame));

        let delivered = receiver.await.unwrap();
        assert!(delivered.is_ok());
        assert!(!shared.callbacks.lock().unwrap().contains_key(&stream_id));
        assert_eq!(shared.in_flight.load(Ordering::Relaxed), 0);
    }
}
