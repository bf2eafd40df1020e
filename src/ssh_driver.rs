//! Channel multiplexing over one libssh2 session.
//!
//! libssh2 is not async and a blocking read on one channel holds the whole
//! session, so a single driver thread owns the [`ssh2::Session`] in
//! non-blocking mode and services every channel in turn. Relay tasks see each
//! channel as an [`SshChannelStream`], a pair of bounded queues to and from the
//! driver. Queue capacity is the backpressure: the driver stops reading a
//! channel while its inbound queue is full.
//!
//! The session socket is polled, not waited on. An idle driver backs off to
//! at most [`MAX_IDLE_SLEEP`] between turns, so the first byte after a quiet
//! period can wait up to that long, and an idle session costs about sixty
//! wake-ups a second.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use ssh2::{Channel, ErrorCode, Session};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::PollSender;

use crate::transport::{ChannelError, SessionState};

pub(crate) const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
pub(crate) const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
pub(crate) const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
pub(crate) const LIBSSH2_ERROR_EAGAIN: i32 = -37;
pub(crate) const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

/// Chunks queued per direction per channel.
const QUEUE_DEPTH: usize = 32;
const READ_BUFFER: usize = 32 * 1024;
/// Bound on work per channel per turn so one busy channel cannot starve the rest.
const CHUNKS_PER_TURN: usize = 16;
const MAX_IDLE_SLEEP: Duration = Duration::from_millis(16);

pub(crate) fn is_eagain(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// Errors that mean the TCP transport under the session is gone.
pub(crate) fn is_transport_failure(err: &ssh2::Error) -> bool {
    matches!(
        err.code(),
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND
                | LIBSSH2_ERROR_SOCKET_DISCONNECT
                | LIBSSH2_ERROR_SOCKET_TIMEOUT
                | LIBSSH2_ERROR_SOCKET_RECV
        )
    )
}

pub(crate) enum DriverCommand {
    Open {
        host: String,
        port: u16,
        reply: oneshot::Sender<Result<SshChannelStream, ChannelError>>,
    },
    Shutdown,
}

/// Relay-side end of one forwarded channel.
pub struct SshChannelStream {
    inbound: mpsc::Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    offset: usize,
    outbound: PollSender<Vec<u8>>,
}

impl SshChannelStream {
    fn new(inbound: mpsc::Receiver<Vec<u8>>, outbound: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            inbound,
            chunk: Vec::new(),
            offset: 0,
            outbound: PollSender::new(outbound),
        }
    }

    /// Build a stream and the driver-side queue ends that feed it.
    fn pair() -> (Self, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        (Self::new(inbound_rx, outbound_tx), inbound_tx, outbound_rx)
    }
}

fn channel_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "ssh channel closed")
}

impl AsyncRead for SshChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset >= this.chunk.len() {
            match ready!(this.inbound.poll_recv(cx)) {
                Some(chunk) => {
                    this.chunk = chunk;
                    this.offset = 0;
                }
                // Remote EOF or driver gone: report EOF.
                None => return Poll::Ready(Ok(())),
            }
        }
        let available = &this.chunk[this.offset..];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        this.offset += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for SshChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();
        ready!(this.outbound.poll_reserve(cx)).map_err(|_| channel_gone())?;
        let len = buf.len().min(READ_BUFFER);
        this.outbound
            .send_item(buf[..len].to_vec())
            .map_err(|_| channel_gone())?;
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Closing the outbound queue makes the driver send EOF on the channel.
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().outbound.close();
        Poll::Ready(Ok(()))
    }
}

struct PendingOpen {
    host: String,
    port: u16,
    reply: oneshot::Sender<Result<SshChannelStream, ChannelError>>,
    /// libssh2 keeps the half-finished request internally; once started it
    /// must be retried with the same arguments until it completes.
    started: bool,
}

impl PendingOpen {
    fn destination(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Queue-side bookkeeping of one channel. Knows nothing about libssh2.
struct Flow {
    outbound: Option<mpsc::Receiver<Vec<u8>>>,
    pending_out: Vec<u8>,
    written: usize,
    eof_pending: bool,
    inbound: Option<mpsc::Sender<Vec<u8>>>,
    pending_in: Option<Vec<u8>>,
}

impl Flow {
    fn new(inbound: mpsc::Sender<Vec<u8>>, outbound: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            outbound: Some(outbound),
            pending_out: Vec::new(),
            written: 0,
            eof_pending: false,
            inbound: Some(inbound),
            pending_in: None,
        }
    }

    /// Bytes from the relay not yet written to the channel, pulling the next
    /// queued chunk when the current one is done. Once the relay has closed
    /// its side and the queue is drained, marks EOF as due.
    fn unsent(&mut self) -> Option<&[u8]> {
        if self.written >= self.pending_out.len() {
            let outbound = self.outbound.as_mut()?;
            match outbound.try_recv() {
                Ok(chunk) => {
                    self.pending_out = chunk;
                    self.written = 0;
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    self.outbound = None;
                    self.eof_pending = true;
                    return None;
                }
            }
        }
        Some(&self.pending_out[self.written..])
    }

    fn sent(&mut self, n: usize) {
        self.written += n;
    }

    fn eof_due(&self) -> bool {
        self.eof_pending && self.written >= self.pending_out.len()
    }

    fn eof_sent(&mut self) {
        self.eof_pending = false;
    }

    /// Hand a held chunk to the relay. `true` when the channel may be read.
    fn flush_inbound(&mut self) -> bool {
        let Some(inbound) = self.inbound.as_ref() else {
            return false;
        };
        if inbound.is_closed() {
            self.reader_gone();
            return false;
        }
        let Some(chunk) = self.pending_in.take() else {
            return true;
        };
        match inbound.try_send(chunk) {
            Ok(()) => true,
            Err(TrySendError::Full(chunk)) => {
                self.pending_in = Some(chunk);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.reader_gone();
                false
            }
        }
    }

    fn hold(&mut self, chunk: Vec<u8>) {
        self.pending_in = Some(chunk);
    }

    /// Dropping the sender is EOF on the relay side.
    fn remote_eof(&mut self) {
        self.inbound = None;
    }

    /// Nothing more can be delivered, but queued relay writes still go out.
    fn reader_gone(&mut self) {
        self.inbound = None;
        self.pending_in = None;
    }

    fn inbound_state(&self) -> (bool, bool) {
        (self.inbound.is_some(), self.pending_in.is_some())
    }

    /// Every relay byte and the EOF reached the channel, and there is no one
    /// left to deliver remote data to.
    fn is_finished(&self) -> bool {
        let upstream_done =
            self.outbound.is_none() && !self.eof_pending && self.written >= self.pending_out.len();
        upstream_done && self.inbound.is_none()
    }
}

/// Driver-side state of one open channel.
struct ChannelSlot {
    channel: Channel,
    destination: String,
    flow: Flow,
}

impl ChannelSlot {
    fn new(
        channel: Channel,
        destination: String,
        inbound: mpsc::Sender<Vec<u8>>,
        outbound: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        Self {
            channel,
            destination,
            flow: Flow::new(inbound, outbound),
        }
    }

    /// Move whatever can move without blocking. Returns whether anything did.
    fn pump(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let sent = self.pump_outbound()?;
        let received = self.pump_inbound(buf)?;
        Ok(sent || received)
    }

    fn pump_outbound(&mut self) -> io::Result<bool> {
        let mut progress = false;
        let eof_was_pending = self.flow.eof_pending;
        for _ in 0..CHUNKS_PER_TURN {
            let result = match self.flow.unsent() {
                Some(bytes) => self.channel.write(bytes),
                None => break,
            };
            match result {
                Ok(n) => {
                    self.flow.sent(n);
                    progress = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(progress),
                Err(e) => return Err(e),
            }
        }
        progress |= self.flow.eof_pending != eof_was_pending;

        if self.flow.eof_due() {
            match self.channel.send_eof() {
                Ok(()) => {
                    self.flow.eof_sent();
                    progress = true;
                }
                Err(e) if is_eagain(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(progress)
    }

    fn pump_inbound(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut progress = false;
        for _ in 0..CHUNKS_PER_TURN {
            let before = self.flow.inbound_state();
            let readable = self.flow.flush_inbound();
            progress |= self.flow.inbound_state() != before;
            if !readable {
                break;
            }
            match self.channel.read(buf) {
                Ok(0) => {
                    if self.channel.eof() {
                        self.flow.remote_eof();
                        progress = true;
                    }
                    break;
                }
                Ok(n) => {
                    self.flow.hold(buf[..n].to_vec());
                    progress = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(progress)
    }
}

/// Doubling back-off from 1 ms, capped at [`MAX_IDLE_SLEEP`].
fn next_idle(idle: Duration) -> Duration {
    (idle * 2).clamp(Duration::from_millis(1), MAX_IDLE_SLEEP)
}

enum Exit {
    Requested,
    Failed(String),
}

/// Owns the session for its whole life. Runs on a dedicated thread.
pub(crate) struct Driver {
    session: Session,
    peer: String,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    state: watch::Sender<SessionState>,
    pending: VecDeque<PendingOpen>,
    channels: Vec<ChannelSlot>,
    keepalive_interval: Duration,
    next_keepalive: Instant,
}

impl Driver {
    pub(crate) fn new(
        session: Session,
        peer: String,
        commands: mpsc::UnboundedReceiver<DriverCommand>,
        state: watch::Sender<SessionState>,
        keepalive_interval: Duration,
    ) -> Self {
        Self {
            session,
            peer,
            commands,
            state,
            pending: VecDeque::new(),
            channels: Vec::new(),
            keepalive_interval,
            next_keepalive: Instant::now() + keepalive_interval,
        }
    }

    pub(crate) fn run(mut self) {
        self.session.set_blocking(false);
        let mut buf = vec![0u8; READ_BUFFER];
        let mut idle = Duration::ZERO;

        let exit = loop {
            match self.turn(&mut buf) {
                Ok(true) => idle = Duration::ZERO,
                Ok(false) => {
                    idle = next_idle(idle);
                    std::thread::sleep(idle);
                }
                Err(exit) => break exit,
            }
        };
        self.finish(exit);
    }

    fn turn(&mut self, buf: &mut [u8]) -> Result<bool, Exit> {
        let mut progress = self.drain_commands()?;
        progress |= self.advance_open()?;
        progress |= self.service_channels(buf);
        self.keepalive()?;
        Ok(progress)
    }

    fn drain_commands(&mut self) -> Result<bool, Exit> {
        let mut progress = false;
        loop {
            match self.commands.try_recv() {
                Ok(DriverCommand::Open { host, port, reply }) => {
                    self.pending.push_back(PendingOpen {
                        host,
                        port,
                        reply,
                        started: false,
                    });
                    progress = true;
                }
                Ok(DriverCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    return Err(Exit::Requested)
                }
                Err(TryRecvError::Empty) => return Ok(progress),
            }
        }
    }

    /// Only the front request is ever in flight inside libssh2.
    fn advance_open(&mut self) -> Result<bool, Exit> {
        let Some(front) = self.pending.front_mut() else {
            return Ok(false);
        };
        if !front.started && front.reply.is_closed() {
            self.pending.pop_front();
            return Ok(true);
        }

        let result = self.session.channel_direct_tcpip(&front.host, front.port, None);
        let open = match result {
            Err(e) if is_eagain(&e) => {
                front.started = true;
                return Ok(false);
            }
            Err(e) if is_transport_failure(&e) => return Err(Exit::Failed(e.to_string())),
            other => other,
        };

        let Some(request) = self.pending.pop_front() else {
            return Ok(true);
        };
        let destination = request.destination();
        match open {
            Ok(channel) => {
                let (stream, inbound, outbound) = SshChannelStream::pair();
                tracing::debug!(%destination, "channel opened");
                self.channels
                    .push(ChannelSlot::new(channel, destination, inbound, outbound));
                // A requester that gave up drops the stream; the slot then
                // sends EOF and closes the channel.
                let _ = request.reply.send(Ok(stream));
            }
            Err(e) => {
                tracing::debug!(%destination, error = %e, "channel refused");
                let _ = request.reply.send(Err(ChannelError::Refused {
                    destination,
                    reason: e.message().to_string(),
                }));
            }
        }
        Ok(true)
    }

    fn service_channels(&mut self, buf: &mut [u8]) -> bool {
        let mut progress = false;
        let mut failed = false;
        let mut index = 0;
        while index < self.channels.len() {
            let slot = &mut self.channels[index];
            let done = match slot.pump(buf) {
                Ok(moved) => {
                    progress |= moved;
                    slot.flow.is_finished()
                }
                Err(e) => {
                    tracing::debug!(destination = %slot.destination, error = %e, "channel error");
                    failed = true;
                    true
                }
            };
            if done {
                let mut slot = self.channels.swap_remove(index);
                let _ = slot.channel.close();
                progress = true;
            } else {
                index += 1;
            }
        }
        if failed {
            // A dead transport fails every channel; check the session now.
            self.next_keepalive = Instant::now();
        }
        progress
    }

    fn keepalive(&mut self) -> Result<(), Exit> {
        let now = Instant::now();
        if now < self.next_keepalive {
            return Ok(());
        }
        match self.session.keepalive_send() {
            Ok(_) => {
                self.next_keepalive = now + self.keepalive_interval;
                Ok(())
            }
            Err(e) if is_eagain(&e) => {
                self.next_keepalive = now + Duration::from_secs(1);
                Ok(())
            }
            Err(e) => Err(Exit::Failed(e.to_string())),
        }
    }

    fn finish(mut self, exit: Exit) {
        for request in self.pending.drain(..) {
            let _ = request.reply.send(Err(ChannelError::SessionClosed));
        }
        let open = self.channels.len();
        self.channels.clear();

        let reason = match exit {
            Exit::Requested => {
                self.session.set_blocking(true);
                self.session.set_timeout(2_000);
                let _ = self.session.disconnect(None, "tunnel closed", None);
                tracing::info!(peer = %self.peer, open_channels = open, "SSH connection closed");
                None
            }
            Exit::Failed(reason) => {
                tracing::warn!(peer = %self.peer, error = %reason, "SSH connection lost");
                Some(reason)
            }
        };
        self.state.send_replace(SessionState::Disconnected { reason });
    }
}
