//! Per-broker connection actor.
//!
//! Each [`Broker`] owns exactly one TCP connection, driven by a single
//! spawned task that serialises all queue and state mutation: callers on any
//! thread post work through the mailbox and wait on oneshot completions.
//! Requests are written to the socket strictly in submission order, the
//! correlation id is assigned at the moment a request is dequeued for
//! writing, and responses are matched back against the head of the sent
//! queue, so within one broker submission order, wire order and response
//! order are all the same sequence.
//!
//! A caller whose deadline fires simply stops listening; the request keeps
//! its slot in the sent queue and the eventual response is discarded. The
//! connection stays open. Connection-level failures (read/write errors,
//! framing errors, correlation mismatches) close the broker and fail every
//! queued request. A closed broker never recovers; the producer client
//! builds a fresh one instead.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder as FrameDecoder, FramedRead};
use tracing::{debug, error, info, warn};

use crate::codec::{Decoder, Encoder};
use crate::error::ClientError;
use crate::metrics;
use crate::protocol::{BrokerIdentity, RequestHeader, API_VERSION};
use crate::Result;

/// Responses larger than this are treated as a framing error rather than
/// trusted as an allocation size.
const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// Connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Connecting,
    Connected,
    Closed,
}

/// A request travelling through the actor. The correlation id in the header
/// stays 0 until the actor dequeues the request for writing.
struct InFlightRequest {
    header: RequestHeader,
    body: Bytes,
    expects_response: bool,
    completer: oneshot::Sender<Result<Decoder>>,
}

enum Command {
    Connect,
    Call(InFlightRequest),
    Close,
}

/// Handle to one broker connection. Cheap to share; all clones feed the same
/// actor task, which stays alive until the last handle is dropped.
pub struct Broker {
    identity: BrokerIdentity,
    client_id: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnState>,
    _actor: JoinHandle<()>,
}

impl Broker {
    /// Creates the broker handle and spawns its actor. No connection is
    /// attempted until the first [`wait_for_connect`](Self::wait_for_connect).
    pub fn new(identity: BrokerIdentity, client_id: String) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnState::Init);
        let actor = Actor {
            identity: identity.clone(),
            cmd_rx,
            state_tx,
            in_flight: VecDeque::new(),
            next_correlation_id: 1,
        };
        let handle = tokio::spawn(actor.run());
        Self {
            identity,
            client_id,
            cmd_tx,
            state_rx,
            _actor: handle,
        }
    }

    pub fn identity(&self) -> &BrokerIdentity {
        &self.identity
    }

    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnState::Closed
    }

    /// Ensures a connection attempt is running and waits for its outcome.
    ///
    /// The first caller moves the actor from `Init` to `Connecting`; any
    /// number of concurrent callers share that single attempt. Returns
    /// `Ok(())` once `Connected`, [`ClientError::NetworkFail`] if the broker
    /// is (or becomes) `Closed`, and [`ClientError::NetworkTimeout`] if the
    /// deadline elapses first, in which case the attempt is abandoned and
    /// the broker closed, unblocking every other waiter.
    pub async fn wait_for_connect(&self, timeout: Duration) -> Result<()> {
        let _ = self.cmd_tx.send(Command::Connect);
        let mut state_rx = self.state_rx.clone();
        let result = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|s| matches!(s, ConnState::Connected | ConnState::Closed)),
        )
        .await
        .map(|r| r.map(|state| *state));
        match result {
            Ok(Ok(state)) if state == ConnState::Connected => Ok(()),
            Ok(_) => Err(ClientError::network_fail(format!(
                "broker {} is closed",
                self.identity
            ))),
            Err(_) => {
                self.close();
                Err(ClientError::NetworkTimeout)
            }
        }
    }

    /// Submits a request and returns the completion to wait on.
    ///
    /// Callable from any thread and any task. Requests submitted before the
    /// connection is up are queued and written once it is. With
    /// `expects_response` false (produce with `required_acks == 0`, which
    /// the broker never answers) the completion fires as soon as the write
    /// finishes, with an empty decoder.
    pub fn call(
        &self,
        api_key: i16,
        body: Bytes,
        expects_response: bool,
    ) -> oneshot::Receiver<Result<Decoder>> {
        let (tx, rx) = oneshot::channel();
        let request = InFlightRequest {
            header: RequestHeader {
                api_key,
                api_version: API_VERSION,
                correlation_id: 0,
                client_id: self.client_id.clone(),
            },
            body,
            expects_response,
            completer: tx,
        };
        if let Err(mpsc::error::SendError(Command::Call(request))) =
            self.cmd_tx.send(Command::Call(request))
        {
            let _ = request.completer.send(Err(ClientError::network_fail(format!(
                "broker {} actor stopped",
                self.identity
            ))));
        }
        rx
    }

    /// Requests shutdown. Idempotent; safe to call at any time and from any
    /// thread. Every queued and in-flight request fails with
    /// [`ClientError::NetworkFail`].
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    /// Waits until the actor has reached `Closed`.
    pub async fn wait_closed(&self) {
        let mut state_rx = self.state_rx.clone();
        let _ = state_rx.wait_for(|s| *s == ConnState::Closed).await;
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

/// A request that has been written and is awaiting its response.
struct SentRequest {
    correlation_id: i32,
    api_key: i16,
    completer: oneshot::Sender<Result<Decoder>>,
}

/// Events the reader sub-task feeds back to the actor.
enum ReadEvent {
    Frame { correlation_id: i32, body: Bytes },
    Failed(io::Error),
    Eof,
}

struct Actor {
    identity: BrokerIdentity,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnState>,
    in_flight: VecDeque<SentRequest>,
    next_correlation_id: i32,
}

impl Actor {
    async fn run(mut self) {
        // Requests submitted before anyone asked for a connection.
        let mut queued: VecDeque<InFlightRequest> = VecDeque::new();

        let stream = loop {
            match self.cmd_rx.recv().await {
                Some(Command::Connect) => match self.connect(&mut queued).await {
                    Ok(Some(stream)) => break stream,
                    Ok(None) => {
                        // Closed while connecting.
                        self.shutdown(queued, None).await;
                        return;
                    }
                    Err(err) => {
                        warn!("connect to broker {} failed: {}", self.identity, err);
                        metrics::global_metrics().record_connection_failed();
                        self.shutdown(queued, None).await;
                        return;
                    }
                },
                Some(Command::Call(request)) => queued.push_back(request),
                Some(Command::Close) | None => {
                    self.shutdown(queued, None).await;
                    return;
                }
            }
        };

        let (read_half, mut write_half) = stream.into_split();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(read_half, event_tx));

        let reason = self
            .serve(&mut queued, &mut write_half, &mut event_rx)
            .await;
        if let Some(err) = &reason {
            warn!("broker {} connection failed: {}", self.identity, err);
        } else {
            debug!("broker {} connection closed", self.identity);
        }

        reader.abort();
        let _ = write_half.shutdown().await;
        self.shutdown(queued, reason).await;
    }

    /// Resolves and connects, processing mailbox commands in the meantime so
    /// a close request can abandon the attempt. Returns `Ok(None)` when
    /// closed mid-connect.
    async fn connect(
        &mut self,
        queued: &mut VecDeque<InFlightRequest>,
    ) -> io::Result<Option<TcpStream>> {
        self.publish(ConnState::Connecting);
        debug!("resolving broker {}", self.identity);

        let host = self.identity.host.clone();
        let port = self.identity.port as u16;
        let attempt = async move {
            let addrs = tokio::net::lookup_host((host.as_str(), port)).await?;
            let mut last_err =
                io::Error::new(io::ErrorKind::NotFound, "hostname resolved to no addresses");
            for addr in addrs {
                debug!("connecting to {}", addr);
                match TcpStream::connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(err) => {
                        debug!("connect to {} failed: {}", addr, err);
                        last_err = err;
                    }
                }
            }
            Err(last_err)
        };
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(stream) => {
                            info!("connected to broker {}", self.identity);
                            metrics::global_metrics().record_connection_created();
                            self.publish(ConnState::Connected);
                            Ok(Some(stream))
                        }
                        Err(err) => Err(err),
                    };
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Call(request)) => queued.push_back(request),
                    Some(Command::Connect) => {}
                    Some(Command::Close) | None => return Ok(None),
                },
            }
        }
    }

    /// The connected phase. Returns the error that ended the session, or
    /// `None` for an explicit close.
    async fn serve(
        &mut self,
        queued: &mut VecDeque<InFlightRequest>,
        write_half: &mut OwnedWriteHalf,
        event_rx: &mut mpsc::UnboundedReceiver<ReadEvent>,
    ) -> Option<ClientError> {
        // Flush requests that arrived while connecting, in order.
        while let Some(request) = queued.pop_front() {
            if let Err(err) = self.write_request(write_half, request).await {
                return Some(err.into());
            }
        }

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Call(request)) => {
                        if let Err(err) = self.write_request(write_half, request).await {
                            return Some(err.into());
                        }
                    }
                    Some(Command::Connect) => {}
                    Some(Command::Close) | None => return None,
                },
                event = event_rx.recv() => match event {
                    Some(ReadEvent::Frame { correlation_id, body }) => {
                        if let Err(err) = self.deliver(correlation_id, body) {
                            return Some(err);
                        }
                    }
                    Some(ReadEvent::Failed(err)) => return Some(err.into()),
                    Some(ReadEvent::Eof) | None => {
                        return Some(ClientError::network_fail(format!(
                            "broker {} closed the connection",
                            self.identity
                        )));
                    }
                },
            }
        }
    }

    /// Assigns the next correlation id, writes `[header, body]` to the
    /// socket and moves the request into the sent queue.
    ///
    /// A header that fails to encode fails only that request; the
    /// connection stays usable. An I/O error is fatal for the connection.
    async fn write_request(
        &mut self,
        write_half: &mut OwnedWriteHalf,
        mut request: InFlightRequest,
    ) -> io::Result<()> {
        request.header.correlation_id = self.next_correlation_id;

        let mut header = Encoder::with_capacity(14 + request.header.client_id.len());
        if let Err(err) = request.header.encode(&mut header) {
            // The id was not consumed, so the wire sequence stays contiguous.
            let _ = request.completer.send(Err(err.into()));
            return Ok(());
        }
        let header = header.into_bytes();
        self.next_correlation_id = self.next_correlation_id.wrapping_add(1);

        let mut framed = Encoder::with_capacity(4 + header.len());
        framed.put_i32((header.len() + request.body.len()) as i32);
        framed.put_raw(&header);

        debug!(
            "broker {}: sending request api_key={} correlation_id={} ({} bytes)",
            self.identity,
            request.header.api_key,
            request.header.correlation_id,
            request.body.len(),
        );

        let mut buffers = framed.into_bytes().chain(request.body.clone());
        match write_half.write_all_buf(&mut buffers).await {
            Ok(()) => {
                if request.expects_response {
                    self.in_flight.push_back(SentRequest {
                        correlation_id: request.header.correlation_id,
                        api_key: request.header.api_key,
                        completer: request.completer,
                    });
                } else {
                    // Nothing will come back for this one; done at write.
                    let _ = request.completer.send(Ok(Decoder::new(Bytes::new())));
                }
                Ok(())
            }
            Err(err) => {
                let _ = request
                    .completer
                    .send(Err(ClientError::network_fail(format!(
                        "write to broker {} failed: {}",
                        self.identity, err
                    ))));
                Err(err)
            }
        }
    }

    /// Matches a response frame against the head of the sent queue.
    fn deliver(&mut self, correlation_id: i32, body: Bytes) -> std::result::Result<(), ClientError> {
        let Some(head) = self.in_flight.pop_front() else {
            error!(
                "broker {}: response with correlation id {} but nothing in flight",
                self.identity, correlation_id
            );
            return Err(ClientError::encoding(format!(
                "unsolicited response with correlation id {}",
                correlation_id
            )));
        };

        if head.correlation_id != correlation_id {
            error!(
                "broker {}: correlation id mismatch, expected {} got {}",
                self.identity, head.correlation_id, correlation_id
            );
            let message = format!(
                "correlation id mismatch: expected {}, got {}",
                head.correlation_id, correlation_id
            );
            let _ = head.completer.send(Err(ClientError::encoding(&message)));
            return Err(ClientError::encoding(message));
        }

        debug!(
            "broker {}: response for api_key={} correlation_id={} ({} bytes)",
            self.identity,
            head.api_key,
            correlation_id,
            body.len(),
        );
        if head.completer.send(Ok(Decoder::new(body))).is_err() {
            warn!(
                "broker {}: discarding response for correlation id {}, caller stopped waiting",
                self.identity, correlation_id
            );
        }
        Ok(())
    }

    fn publish(&self, state: ConnState) {
        let _ = self.state_tx.send(state);
    }

    /// Terminal state: fail everything, publish `Closed`, then keep failing
    /// late submissions until the last handle is dropped.
    async fn shutdown(mut self, queued: VecDeque<InFlightRequest>, reason: Option<ClientError>) {
        if let Some(err) = reason {
            debug!("broker {} closing after error: {}", self.identity, err);
        }
        let closed = |identity: &BrokerIdentity| {
            ClientError::network_fail(format!("broker {} is closed", identity))
        };

        for request in queued {
            let _ = request.completer.send(Err(closed(&self.identity)));
        }
        while let Some(sent) = self.in_flight.pop_front() {
            let _ = sent.completer.send(Err(closed(&self.identity)));
        }
        self.publish(ConnState::Closed);

        while let Some(cmd) = self.cmd_rx.recv().await {
            if let Command::Call(request) = cmd {
                let _ = request.completer.send(Err(closed(&self.identity)));
            }
        }
    }
}

/// Reader sub-task: decodes response frames off the socket one at a time and
/// feeds them to the actor. Exits on the first error or EOF.
async fn read_loop(read_half: OwnedReadHalf, events: mpsc::UnboundedSender<ReadEvent>) {
    let mut frames = FramedRead::new(read_half, ResponseFrameCodec);
    loop {
        let event = match frames.next().await {
            Some(Ok((correlation_id, body))) => ReadEvent::Frame {
                correlation_id,
                body,
            },
            Some(Err(err)) => {
                let _ = events.send(ReadEvent::Failed(err));
                return;
            }
            None => {
                let _ = events.send(ReadEvent::Eof);
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

/// Splits the stream into `{len: i32, correlation_id: i32, body}` frames.
/// `len` covers the correlation id and body.
struct ResponseFrameCodec;

impl FrameDecoder for ResponseFrameCodec {
    type Item = (i32, Bytes);
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<(i32, Bytes)>> {
        if src.len() < 8 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if len < 4 || len as usize > MAX_RESPONSE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid response length prefix: {}", len),
            ));
        }
        let frame_len = 4 + len as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(frame_len).freeze();
        frame.advance(4);
        let correlation_id = frame.get_i32();
        Ok(Some((correlation_id, frame)))
    }
}
