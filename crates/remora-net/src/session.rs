//! One session per remote peer: a dedicated thread owning the TCP stream,
//! fed commands from the coordinator and reporting everything observable
//! back through a shared event channel.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, trace};

use crate::handshake::{Handshake, HANDSHAKE_LEN};
use crate::message::{PeerMessage, BLOCK_SIZE, MAX_PAYLOAD_LEN};
use remora_util::bitfield;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);
/// Read timeout for the steady-state loop; bounds command latency.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// What a session reports back to the coordinator.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed; the session is usable.
    Ready { addr: SocketAddr, peer_id: [u8; 20] },
    Bitfield { addr: SocketAddr, raw: Vec<u8> },
    Have { addr: SocketAddr, index: u32 },
    Choked { addr: SocketAddr },
    Unchoked { addr: SocketAddr },
    Block {
        addr: SocketAddr,
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// Connect, handshake or protocol failure. Terminal for the session.
    Failed { addr: SocketAddr, reason: String },
    /// Emitted exactly once, after everything else, when the session ends.
    Disconnected { addr: SocketAddr },
}

#[derive(Debug)]
pub enum PeerCommand {
    /// Issue pipelined block requests covering the whole piece.
    RequestPiece { index: u32, size: u32 },
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub addr: SocketAddr,
    pub info_hash: [u8; 20],
    pub local_peer_id: [u8; 20],
    pub piece_count: usize,
    pub connect_timeout: Duration,
}

/// Spawns the session thread and hands back its command channel. All
/// outcomes, including an immediate connect failure, arrive as events.
pub fn spawn(params: SessionParams, events: Sender<PeerEvent>) -> Sender<PeerCommand> {
    let (cmd_tx, cmd_rx) = std::sync::mpsc::channel();
    let addr = params.addr;

    let thread_events = events.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("peer-{}", addr))
        .spawn(move || run(params, cmd_rx, thread_events));

    if let Err(err) = spawned {
        // Thread creation failing is as terminal as a refused connection.
        let _ = events.send(PeerEvent::Failed {
            addr,
            reason: format!("spawn session thread: {}", err),
        });
        let _ = events.send(PeerEvent::Disconnected { addr });
    }

    cmd_tx
}

fn run(params: SessionParams, commands: Receiver<PeerCommand>, events: Sender<PeerEvent>) {
    let addr = params.addr;

    match Session::establish(&params) {
        Ok(mut session) => {
            let _ = events.send(PeerEvent::Ready {
                addr,
                peer_id: session.remote_peer_id,
            });
            if let Err(err) = session.drive(&commands, &events) {
                let _ = events.send(PeerEvent::Failed {
                    addr,
                    reason: format!("{:#}", err),
                });
            }
        }
        Err(err) => {
            let _ = events.send(PeerEvent::Failed {
                addr,
                reason: format!("{:#}", err),
            });
        }
    }

    let _ = events.send(PeerEvent::Disconnected { addr });
}

enum ReadState {
    Length,
    Payload(usize),
}

/// Accumulates socket bytes across read timeouts, yielding one frame at a
/// time and preserving partial frames for the next poll.
struct FrameReader {
    buf: Vec<u8>,
    filled: usize,
    state: ReadState,
}

impl FrameReader {
    fn new() -> Self {
        FrameReader {
            buf: vec![0; 4],
            filled: 0,
            state: ReadState::Length,
        }
    }
}

struct Session {
    stream: TcpStream,
    addr: SocketAddr,
    piece_count: usize,
    remote_peer_id: [u8; 20],
    am_choked: bool,
    am_interested: bool,
    peer_choked: bool,
    peer_interested: bool,
    /// Block requests accepted while choked, flushed on unchoke. Nothing is
    /// written to the socket while `am_choked` holds.
    queued_requests: Vec<(u32, u32, u32)>,
    reader: FrameReader,
    last_sent: Instant,
}

impl Session {
    fn establish(params: &SessionParams) -> Result<Self> {
        let mut stream = TcpStream::connect_timeout(&params.addr, params.connect_timeout)
            .with_context(|| format!("connect to {}", params.addr))?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

        stream
            .write_all(&Handshake::new(params.info_hash, params.local_peer_id).to_bytes())
            .context("send handshake")?;

        let mut reply = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut reply).context("read handshake")?;
        let theirs = Handshake::parse(&reply)?;
        if theirs.info_hash != params.info_hash {
            anyhow::bail!("handshake: info hash mismatch");
        }

        stream.set_read_timeout(Some(POLL_INTERVAL))?;

        let mut session = Session {
            stream,
            addr: params.addr,
            piece_count: params.piece_count,
            remote_peer_id: theirs.peer_id,
            am_choked: true,
            am_interested: false,
            peer_choked: true,
            peer_interested: false,
            queued_requests: Vec::new(),
            reader: FrameReader::new(),
            last_sent: Instant::now(),
        };

        session.send(&PeerMessage::Interested)?;
        session.am_interested = true;

        Ok(session)
    }

    fn drive(&mut self, commands: &Receiver<PeerCommand>, events: &Sender<PeerEvent>) -> Result<()> {
        loop {
            loop {
                match commands.try_recv() {
                    Ok(PeerCommand::RequestPiece { index, size }) => {
                        self.queue_piece(index, size)?
                    }
                    Ok(PeerCommand::Disconnect) => return Ok(()),
                    Err(TryRecvError::Empty) => break,
                    // Coordinator dropped the handle; nothing left to do.
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }

            if let Some(msg) = self.read_frame()? {
                if !self.dispatch(msg, events)? {
                    // Coordinator side of the event channel is gone.
                    return Ok(());
                }
            }

            if self.last_sent.elapsed() >= KEEPALIVE_INTERVAL {
                self.send(&PeerMessage::KeepAlive)?;
            }
        }
    }

    /// Splits a piece into 16 KiB block requests. Sent immediately when
    /// unchoked, otherwise parked until the unchoke arrives.
    fn queue_piece(&mut self, index: u32, size: u32) -> Result<()> {
        let mut begin = 0u32;
        while begin < size {
            let length = BLOCK_SIZE.min(size - begin);
            self.queued_requests.push((index, begin, length));
            begin += length;
        }
        if !self.am_choked {
            self.flush_requests()?;
        }
        Ok(())
    }

    fn flush_requests(&mut self) -> Result<()> {
        debug_assert!(self.am_interested && !self.am_choked);
        for (index, begin, length) in std::mem::take(&mut self.queued_requests) {
            self.send(&PeerMessage::Request {
                index,
                begin,
                length,
            })?;
        }
        Ok(())
    }

    /// Applies one incoming message. Returns false when the coordinator has
    /// dropped the event channel and the session should wind down.
    fn dispatch(&mut self, msg: PeerMessage, events: &Sender<PeerEvent>) -> Result<bool> {
        let addr = self.addr;
        let sent = match msg {
            PeerMessage::KeepAlive => {
                trace!("keep-alive from {}", addr);
                Ok(())
            }
            PeerMessage::Choke => {
                self.am_choked = true;
                events.send(PeerEvent::Choked { addr })
            }
            PeerMessage::Unchoke => {
                self.am_choked = false;
                self.flush_requests()?;
                events.send(PeerEvent::Unchoked { addr })
            }
            PeerMessage::Interested => {
                self.peer_interested = true;
                Ok(())
            }
            PeerMessage::NotInterested => {
                self.peer_interested = false;
                Ok(())
            }
            PeerMessage::Have { index } => events.send(PeerEvent::Have { addr, index }),
            PeerMessage::Bitfield { raw } => {
                if !bitfield::trailing_bits_zero(&raw, self.piece_count) {
                    debug!("{} sent bitfield with bits past piece count", addr);
                }
                events.send(PeerEvent::Bitfield { addr, raw })
            }
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => events.send(PeerEvent::Block {
                addr,
                index,
                begin,
                block,
            }),
            PeerMessage::Request { index, .. } => {
                // We never unchoke anyone, so inbound requests go unanswered.
                if self.peer_choked {
                    trace!("{} requested piece {} while choked", addr, index);
                }
                Ok(())
            }
            PeerMessage::Cancel { .. } | PeerMessage::Port { .. } => Ok(()),
            PeerMessage::Unknown { id } => {
                debug!("{} sent unknown message id {}, skipping", addr, id);
                Ok(())
            }
        };
        Ok(sent.is_ok())
    }

    /// Pulls at most one frame off the socket. `Ok(None)` means the read
    /// timed out with a partial (or no) frame buffered.
    fn read_frame(&mut self) -> Result<Option<PeerMessage>> {
        loop {
            match self.reader.state {
                ReadState::Length => {
                    if self.reader.filled < 4 && !self.fill_to(4)? {
                        return Ok(None);
                    }
                    let len = u32::from_be_bytes([
                        self.reader.buf[0],
                        self.reader.buf[1],
                        self.reader.buf[2],
                        self.reader.buf[3],
                    ]);
                    self.reader.filled = 0;
                    if len == 0 {
                        return Ok(Some(PeerMessage::KeepAlive));
                    }
                    if len > MAX_PAYLOAD_LEN {
                        anyhow::bail!("oversized frame from {}: {} bytes", self.addr, len);
                    }
                    self.reader.buf.resize(len as usize, 0);
                    self.reader.state = ReadState::Payload(len as usize);
                }
                ReadState::Payload(len) => {
                    if self.reader.filled < len && !self.fill_to(len)? {
                        return Ok(None);
                    }
                    let msg = PeerMessage::parse(&self.reader.buf[..len])?;
                    self.reader.filled = 0;
                    self.reader.buf.resize(4, 0);
                    self.reader.state = ReadState::Length;
                    return Ok(Some(msg));
                }
            }
        }
    }

    /// Reads until `target` bytes are buffered. False on timeout.
    fn fill_to(&mut self, target: usize) -> Result<bool> {
        while self.reader.filled < target {
            match self.stream.read(&mut self.reader.buf[self.reader.filled..target]) {
                Ok(0) => anyhow::bail!("connection closed by {}", self.addr),
                Ok(n) => self.reader.filled += n,
                Err(err) if is_timeout(&err) => return Ok(false),
                Err(err) => return Err(err).context("socket read"),
            }
        }
        Ok(true)
    }

    fn send(&mut self, msg: &PeerMessage) -> Result<()> {
        self.stream
            .write_all(&msg.to_frame())
            .context("socket write")?;
        self.last_sent = Instant::now();
        Ok(())
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
