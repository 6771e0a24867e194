//! Minimal stream multiplexer.
//!
//! Runs many logical streams over a single ordered byte pipe (a memory
//! socket, or a relayed stream). Every frame carries a 9-byte header:
//!
//! ```text
//! +------+-----------+-------------+-----------------+
//! | type | stream id | payload len | payload ...     |
//! | u8   | u32 (BE)  | u32 (BE)    | len bytes       |
//! +------+-----------+-------------+-----------------+
//! ```
//!
//! Streams are opened with the protocol name in an `Open` frame and must be
//! answered with `Accept` or `Reject` before any data flows. Dialer-side
//! stream ids are odd, listener-side ids are even.
//!
//! Each stream direction has a credit window of [`STREAM_WINDOW`] bytes. The
//! sender spends credit for every `Data` frame and stops reading from its
//! user once the credit is gone; the receiver hands credit back in
//! `WindowUpdate` frames as its user consumes the data. A remote that sends
//! beyond its window gets the stream reset.

use crate::error::{ConnectionError, FrameError};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::sync::{Semaphore, mpsc, oneshot, watch};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum payload carried by a single frame (64 KB)
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Per-stream in-memory buffer between the user and the pump task
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Bytes a stream may have in flight towards the remote before it has to
/// wait for a `WindowUpdate`
pub const STREAM_WINDOW: u32 = 256 * 1024;

/// Remotely opened streams waiting for an accept/reject decision
const INBOUND_QUEUE_SIZE: usize = 256;

/// Read chunk size for outgoing stream data
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Time allowed for the remote to answer an `Open` frame
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Reject reason: no handler registered for the protocol
const REJECT_UNSUPPORTED: u8 = 0;

/// Reject reason: handler refused to run over a transient connection
const REJECT_TRANSIENT: u8 = 1;

/// Multiplexer frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Open a stream; payload is the protocol name
    Open = 0x01,
    /// Accept a stream open
    Accept = 0x02,
    /// Reject a stream open; payload is a one-byte reason
    Reject = 0x03,
    /// Stream data
    Data = 0x04,
    /// Half-close: sender will write no more data
    Close = 0x05,
    /// Abort the stream in both directions
    Reset = 0x06,
    /// Connection shutdown
    GoAway = 0x07,
    /// Return send credit; payload is a `u32` (BE) byte count
    WindowUpdate = 0x08,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Open),
            0x02 => Ok(Self::Accept),
            0x03 => Ok(Self::Reject),
            0x04 => Ok(Self::Data),
            0x05 => Ok(Self::Close),
            0x06 => Ok(Self::Reset),
            0x07 => Ok(Self::GoAway),
            0x08 => Ok(Self::WindowUpdate),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// A single multiplexer frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Stream the frame belongs to (0 for connection-level frames)
    pub stream_id: u32,
    /// Frame payload
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame
    #[must_use]
    pub fn new(frame_type: FrameType, stream_id: u32, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            stream_id,
            payload,
        }
    }

    fn window_update(stream_id: u32, credit: u32) -> Self {
        Self::new(FrameType::WindowUpdate, stream_id, credit.to_be_bytes().to_vec())
    }

    /// Encode header and payload
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a frame header, returning type, stream id and payload length
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] for short headers, unknown types or oversized payloads.
    pub fn parse_header(header: &[u8]) -> Result<(FrameType, u32, usize), FrameError> {
        if header.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: header.len(),
            });
        }

        let frame_type = FrameType::try_from(header[0])?;
        let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;

        if len > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(len));
        }

        Ok((frame_type, stream_id, len))
    }

    /// Read one frame; `Ok(None)` on a clean end of stream between frames
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, truncated frames or invalid headers.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Frame>, ConnectionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let first = reader.read(&mut header[..1]).await?;
        if first == 0 {
            return Ok(None);
        }
        reader.read_exact(&mut header[1..]).await?;

        let (frame_type, stream_id, len) = Frame::parse_header(&header)?;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        Ok(Some(Frame {
            frame_type,
            stream_id,
            payload,
        }))
    }
}

/// Which end of the underlying pipe this multiplexer runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Opened the pipe; allocates odd stream ids
    Dialer,
    /// Accepted the pipe; allocates even stream ids
    Listener,
}

/// Events delivered from the reader task to a stream's pump task
#[derive(Debug)]
enum StreamEvent {
    Data(Vec<u8>),
    Fin,
    Reset,
}

/// Reader-task view of a live stream
struct StreamSlot {
    events: mpsc::UnboundedSender<StreamEvent>,
    /// Credit left for sending to the remote
    send_window: Arc<Semaphore>,
    /// Bytes received and not yet handed to the user
    buffered: Arc<AtomicUsize>,
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        // Wakes a sender waiting for credit on a stream that is gone
        self.send_window.close();
    }
}

/// Pump-task view of a live stream
struct PumpState {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    send_window: Arc<Semaphore>,
    buffered: Arc<AtomicUsize>,
}

fn stream_slot() -> (StreamSlot, PumpState) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let send_window = Arc::new(Semaphore::new(STREAM_WINDOW as usize));
    let buffered = Arc::new(AtomicUsize::new(0));
    (
        StreamSlot {
            events: events_tx,
            send_window: send_window.clone(),
            buffered: buffered.clone(),
        },
        PumpState {
            events: events_rx,
            send_window,
            buffered,
        },
    )
}

struct Shared {
    /// Frames for the writer task; data frames in it are bounded by the
    /// stream windows
    outbound: mpsc::UnboundedSender<Frame>,
    streams: DashMap<u32, StreamSlot>,
    pending_opens: DashMap<u32, oneshot::Sender<Result<(), u8>>>,
    next_id: AtomicU32,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn send(&self, frame: Frame) {
        // Fails only once the writer task is gone, i.e. the pipe is closed
        let _ = self.outbound.send(frame);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn mark_closed(&self) {
        self.closed.send_replace(true);
        self.streams.clear();
        self.pending_opens.clear();
    }
}

/// A stream opened by the remote, awaiting an accept/reject decision
pub struct InboundStream {
    id: u32,
    protocol: String,
    user: DuplexStream,
    pump: DuplexStream,
    state: PumpState,
    shared: Arc<Shared>,
}

impl InboundStream {
    /// Protocol requested by the remote
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Accept the stream and start moving data
    #[must_use]
    pub fn accept(self) -> DuplexStream {
        self.shared
            .send(Frame::new(FrameType::Accept, self.id, Vec::new()));
        tokio::spawn(pump(self.id, self.pump, self.state, self.shared));
        self.user
    }

    /// Reject the stream because no handler exists for its protocol
    pub fn reject_unsupported(self) {
        self.reject(REJECT_UNSUPPORTED);
    }

    /// Reject the stream because its handler does not run over transient connections
    pub fn reject_transient(self) {
        self.reject(REJECT_TRANSIENT);
    }

    fn reject(self, reason: u8) {
        self.shared.streams.remove(&self.id);
        self.shared
            .send(Frame::new(FrameType::Reject, self.id, vec![reason]));
    }
}

impl std::fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStream")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Receiver for streams opened by the remote
pub type InboundStreams = mpsc::Receiver<InboundStream>;

/// Handle to a running multiplexer
#[derive(Clone)]
pub struct Muxer {
    shared: Arc<Shared>,
}

impl Muxer {
    /// Start multiplexing over `io`
    ///
    /// Spawns the reader and writer tasks and returns the handle together with
    /// the receiver of remotely opened streams.
    pub fn new<T>(io: T, side: Side) -> (Self, InboundStreams)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let (closed, _) = watch::channel(false);

        let first_id = match side {
            Side::Dialer => 1,
            Side::Listener => 2,
        };

        let shared = Arc::new(Shared {
            outbound: outbound_tx,
            streams: DashMap::new(),
            pending_opens: DashMap::new(),
            next_id: AtomicU32::new(first_id),
            closed,
        });

        let (reader, writer) = tokio::io::split(io);
        tokio::spawn(write_loop(writer, outbound_rx, shared.clone()));
        tokio::spawn(read_loop(reader, inbound_tx, shared.clone()));

        (Self { shared }, inbound_rx)
    }

    /// Open a new stream for `protocol`
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::ProtocolRejected`] or
    /// [`ConnectionError::TransientConnection`] when the remote refuses,
    /// [`ConnectionError::Closed`] if the pipe is gone and
    /// [`ConnectionError::Timeout`] if the remote does not answer.
    pub async fn open_stream(&self, protocol: &str) -> Result<DuplexStream, ConnectionError> {
        if self.shared.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let (answer_tx, answer_rx) = oneshot::channel();
        let (user, pump_end) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        let (slot, state) = stream_slot();

        // Register before sending Open so data racing the Accept is not lost
        self.shared.pending_opens.insert(id, answer_tx);
        self.shared.streams.insert(id, slot);
        self.shared.send(Frame::new(
            FrameType::Open,
            id,
            protocol.as_bytes().to_vec(),
        ));

        match tokio::time::timeout(OPEN_TIMEOUT, answer_rx).await {
            Ok(Ok(Ok(()))) => {
                tokio::spawn(pump(id, pump_end, state, self.shared.clone()));
                Ok(user)
            }
            Ok(Ok(Err(reason))) => {
                self.shared.streams.remove(&id);
                if reason == REJECT_TRANSIENT {
                    Err(ConnectionError::TransientConnection {
                        protocol: protocol.to_string(),
                    })
                } else {
                    Err(ConnectionError::ProtocolRejected(protocol.to_string()))
                }
            }
            Ok(Err(_)) => {
                self.shared.streams.remove(&id);
                Err(ConnectionError::Closed)
            }
            Err(_) => {
                self.shared.pending_opens.remove(&id);
                self.shared.streams.remove(&id);
                self.shared
                    .send(Frame::new(FrameType::Reset, id, Vec::new()));
                Err(ConnectionError::Timeout("stream open".into()))
            }
        }
    }

    /// Shut the multiplexer down, resetting every stream
    pub fn close(&self) {
        if self.shared.is_closed() {
            return;
        }
        self.shared.send(Frame::new(FrameType::GoAway, 0, Vec::new()));
        self.shared.mark_closed();
    }

    /// Whether the multiplexer has shut down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolve once the multiplexer has shut down
    pub async fn closed(&self) {
        wait_closed(&mut self.shared.closed.subscribe()).await;
    }

    /// Number of live streams
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.shared.streams.len()
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // The sender lives in `Shared`, which every caller holds
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    let mut closed = shared.closed.subscribe();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let is_goaway = frame.frame_type == FrameType::GoAway;
                if let Err(e) = writer.write_all(&frame.encode()).await {
                    tracing::trace!("Mux write failed: {}", e);
                    break;
                }
                if writer.flush().await.is_err() || is_goaway {
                    break;
                }
            }
            () = wait_closed(&mut closed) => {
                // Drain frames queued before the close (GoAway, resets)
                while let Ok(frame) = outbound.try_recv() {
                    if writer.write_all(&frame.encode()).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    shared.mark_closed();
}

async fn read_loop<R>(
    mut reader: R,
    inbound: mpsc::Sender<InboundStream>,
    shared: Arc<Shared>,
) where
    R: AsyncRead + Unpin,
{
    let mut closed = shared.closed.subscribe();

    loop {
        let frame = tokio::select! {
            frame = Frame::read_from(&mut reader) => frame,
            () = wait_closed(&mut closed) => break,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::trace!("Mux pipe reached end of stream");
                break;
            }
            Err(e) => {
                tracing::debug!("Mux read failed: {}", e);
                break;
            }
        };

        match frame.frame_type {
            FrameType::Open => {
                let Ok(protocol) = String::from_utf8(frame.payload) else {
                    shared.send(Frame::new(
                        FrameType::Reject,
                        frame.stream_id,
                        vec![REJECT_UNSUPPORTED],
                    ));
                    continue;
                };
                let (user, pump_end) = tokio::io::duplex(STREAM_BUFFER_SIZE);
                let (slot, state) = stream_slot();
                shared.streams.insert(frame.stream_id, slot);

                let pending = InboundStream {
                    id: frame.stream_id,
                    protocol,
                    user,
                    pump: pump_end,
                    state,
                    shared: shared.clone(),
                };
                if let Err(rejected) = inbound.try_send(pending) {
                    tracing::debug!("Too many pending inbound streams, rejecting");
                    rejected.into_inner().reject_unsupported();
                }
            }
            FrameType::Accept => {
                if let Some((_, answer)) = shared.pending_opens.remove(&frame.stream_id) {
                    let _ = answer.send(Ok(()));
                }
            }
            FrameType::Reject => {
                let reason = frame.payload.first().copied().unwrap_or(REJECT_UNSUPPORTED);
                if let Some((_, answer)) = shared.pending_opens.remove(&frame.stream_id) {
                    let _ = answer.send(Err(reason));
                }
            }
            FrameType::Data => {
                let len = frame.payload.len();
                let overrun = match shared.streams.get(&frame.stream_id) {
                    Some(slot) => {
                        let buffered = slot.buffered.fetch_add(len, Ordering::AcqRel) + len;
                        if buffered > STREAM_WINDOW as usize {
                            true
                        } else {
                            let _ = slot.events.send(StreamEvent::Data(frame.payload));
                            false
                        }
                    }
                    None => false,
                };
                if overrun {
                    tracing::debug!("Stream {} overran its receive window", frame.stream_id);
                    if let Some((_, slot)) = shared.streams.remove(&frame.stream_id) {
                        let _ = slot.events.send(StreamEvent::Reset);
                    }
                    shared.send(Frame::new(FrameType::Reset, frame.stream_id, Vec::new()));
                }
            }
            FrameType::WindowUpdate => {
                let Ok(credit) = <[u8; 4]>::try_from(frame.payload.as_slice()) else {
                    continue;
                };
                if let Some(slot) = shared.streams.get(&frame.stream_id) {
                    // Never more than a full window, whatever the remote claims
                    let room = (STREAM_WINDOW as usize)
                        .saturating_sub(slot.send_window.available_permits());
                    let credit = u32::from_be_bytes(credit) as usize;
                    slot.send_window.add_permits(credit.min(room));
                }
            }
            FrameType::Close => {
                if let Some(slot) = shared.streams.get(&frame.stream_id) {
                    let _ = slot.events.send(StreamEvent::Fin);
                }
            }
            FrameType::Reset => {
                shared.pending_opens.remove(&frame.stream_id);
                if let Some((_, slot)) = shared.streams.remove(&frame.stream_id) {
                    let _ = slot.events.send(StreamEvent::Reset);
                }
            }
            FrameType::GoAway => {
                tracing::trace!("Mux received GoAway");
                break;
            }
        }
    }

    shared.mark_closed();
}

/// How the receiving half of a stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvEnd {
    /// Remote half-closed; the local side may still be sending
    Finished,
    /// Reset, connection gone or the user dropped the stream
    Aborted,
}

/// Move bytes between one user-facing duplex end and the frame queues
///
/// The two directions run independently so that a sender waiting for
/// credit never stops this side from consuming data and returning credit.
async fn pump(id: u32, io: DuplexStream, state: PumpState, shared: Arc<Shared>) {
    let PumpState {
        events,
        send_window,
        buffered,
    } = state;
    let (reader, writer) = tokio::io::split(io);

    let outgoing = send_half(id, reader, &send_window, &shared);
    let incoming = recv_half(id, writer, events, &buffered, &shared);
    tokio::pin!(outgoing);
    tokio::pin!(incoming);

    let mut sending = true;
    loop {
        tokio::select! {
            () = &mut outgoing, if sending => sending = false,
            end = &mut incoming => {
                if end == RecvEnd::Finished && sending {
                    (&mut outgoing).await;
                }
                break;
            }
        }
    }

    shared.streams.remove(&id);
}

async fn send_half(
    id: u32,
    mut reader: ReadHalf<DuplexStream>,
    window: &Semaphore,
    shared: &Shared,
) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        // Wait until the remote has room for the chunk
        let Ok(credit) = window.acquire_many(n as u32).await else {
            return;
        };
        credit.forget();
        shared.send(Frame::new(FrameType::Data, id, buf[..n].to_vec()));
    }

    shared.send(Frame::new(FrameType::Close, id, Vec::new()));
}

async fn recv_half(
    id: u32,
    mut writer: WriteHalf<DuplexStream>,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    buffered: &AtomicUsize,
    shared: &Shared,
) -> RecvEnd {
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Data(bytes) => {
                if writer.write_all(&bytes).await.is_err() {
                    // User dropped the stream; stop the remote from sending more
                    shared.send(Frame::new(FrameType::Reset, id, Vec::new()));
                    return RecvEnd::Aborted;
                }
                buffered.fetch_sub(bytes.len(), Ordering::AcqRel);
                shared.send(Frame::window_update(id, bytes.len() as u32));
            }
            StreamEvent::Fin => {
                let _ = writer.shutdown().await;
                return RecvEnd::Finished;
            }
            StreamEvent::Reset => return RecvEnd::Aborted,
        }
    }
    RecvEnd::Aborted
}
