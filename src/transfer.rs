use crate::error::{Error, Result};
use crate::structs::{Peer, TransferKind};
use crate::transport::{Progress, Transport};
use md5::{Digest, Md5};
use std::fmt::{self, Display};
use std::io;
use std::time::Instant;

/// Version number carried on the wire command line.
pub const PROTOCOL_VERSION: u32 = 1;

const MAX_LINE_LEN: usize = 256;
const CHUNK: usize = 16 * 1024;

/// Lifecycle of one transfer. `Open` covers the TCP connect and the SOCKS5
/// negotiation; `Command` the command/acknowledgement line exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    New,
    Open,
    Command,
    Payload,
    Checksum,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Wall-clock checkpoints recorded at each protocol transition.
#[derive(Debug)]
struct Checkpoints {
    created: Instant,
    connected: Option<Instant>,
    command_sent: Option<Instant>,
    command_received: Option<Instant>,
    first_payload: Option<Instant>,
    payload_done: Option<Instant>,
    complete: Option<Instant>,
}

impl Checkpoints {
    fn new() -> Self {
        Checkpoints {
            created: Instant::now(),
            connected: None,
            command_sent: None,
            command_received: None,
            first_payload: None,
            payload_done: None,
            complete: None,
        }
    }

    fn span_ms(from: Option<Instant>, to: Option<Instant>) -> u128 {
        match (from, to) {
            (Some(a), Some(b)) => b.saturating_duration_since(a).as_millis(),
            _ => 0,
        }
    }

    /// End of the command phase: the later of line-sent and line-received.
    fn command_done(&self) -> Option<Instant> {
        match (self.command_sent, self.command_received) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// One byte exchange over a TCP stream, framed by a command line, a
/// fixed-size payload, and an MD5 checksum line. Each readiness callback
/// drives the state machine until the socket would block.
pub struct Transfer {
    id: u64,
    role: Role,
    kind: Option<TransferKind>,
    size: u64,
    transport: Transport,
    state: TransferState,
    bytes_transferred: u64,
    outbuf: Vec<u8>,
    outpos: usize,
    line: Vec<u8>,
    digest: Md5,
    expected_sum: String,
    times: Checkpoints,
    failure: Option<&'static str>,
}

impl Transfer {
    /// Initiate an outbound transfer to `peer`, optionally through a SOCKS5
    /// proxy.
    pub fn client(
        id: u64,
        kind: TransferKind,
        size: u64,
        peer: Peer,
        proxy: Option<Peer>,
    ) -> Result<Transfer> {
        let transport = Transport::connect(peer, proxy)?;
        Ok(Transfer {
            id,
            role: Role::Client,
            kind: Some(kind),
            size,
            transport,
            state: TransferState::New,
            bytes_transferred: 0,
            outbuf: Vec::new(),
            outpos: 0,
            line: Vec::new(),
            digest: Md5::new(),
            expected_sum: String::new(),
            times: Checkpoints::new(),
            failure: None,
        })
    }

    /// Wrap an accepted inbound connection. Direction and size are learned
    /// from the peer's command line.
    pub fn server(id: u64, stream: mio::net::TcpStream, peer: Peer) -> Transfer {
        Transfer {
            id,
            role: Role::Server,
            kind: None,
            size: 0,
            transport: Transport::accepted(stream, peer),
            state: TransferState::New,
            bytes_transferred: 0,
            outbuf: Vec::new(),
            outpos: 0,
            line: Vec::new(),
            digest: Md5::new(),
            expected_sum: String::new(),
            times: Checkpoints::new(),
            failure: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn bytes_expected(&self) -> u64 {
        self.size
    }

    pub fn peer(&self) -> Peer {
        self.transport.peer()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, TransferState::Success | TransferState::Error)
    }

    /// The raw stream, exposed for poller registration only.
    pub fn stream_mut(&mut self) -> &mut mio::net::TcpStream {
        self.transport.stream_mut()
    }

    /// True when this side emits the payload (client put, server get).
    fn is_sender(&self) -> bool {
        matches!(
            (self.role, self.kind),
            (Role::Client, Some(TransferKind::Put)) | (Role::Server, Some(TransferKind::Get))
        )
    }

    fn sending_line(&self) -> bool {
        self.outpos < self.outbuf.len()
    }

    pub fn want_read(&self) -> bool {
        match self.state {
            TransferState::New | TransferState::Open => self.transport.want_read(),
            TransferState::Command => match self.role {
                Role::Client => !self.sending_line(),
                Role::Server => self.kind.is_none(),
            },
            TransferState::Payload | TransferState::Checksum => !self.is_sender(),
            TransferState::Success | TransferState::Error => false,
        }
    }

    pub fn want_write(&self) -> bool {
        match self.state {
            TransferState::New | TransferState::Open => self.transport.want_write(),
            TransferState::Command => match self.role {
                Role::Client => self.sending_line(),
                Role::Server => self.kind.is_some(),
            },
            TransferState::Payload | TransferState::Checksum => self.is_sender(),
            TransferState::Success | TransferState::Error => false,
        }
    }

    /// Pump the state machine until no further progress is possible. A
    /// failure is recorded on the transfer and reflected by `state()`.
    pub fn drive(&mut self) {
        if let Err(e) = self.step_all() {
            log::warn!("transfer {} with {} failed: {e}", self.id, self.peer());
            self.failure = Some(e.tag());
            self.state = TransferState::Error;
            self.times.complete = Some(Instant::now());
            self.transport.close();
        }
    }

    /// Force the transfer into the error state without a protocol failure,
    /// used when the driver shuts down with transfers in flight.
    pub fn cancel(&mut self) {
        if self.is_finished() {
            return;
        }
        self.failure = Some("cancelled");
        self.state = TransferState::Error;
        self.times.complete = Some(Instant::now());
        self.transport.close();
    }

    fn step_all(&mut self) -> Result<()> {
        loop {
            let progressed = match self.state {
                TransferState::New => {
                    self.state = TransferState::Open;
                    true
                }
                TransferState::Open => {
                    self.transport.drive()?;
                    if self.transport.is_ready() {
                        self.times.connected = Some(Instant::now());
                        self.enter_command();
                        true
                    } else {
                        false
                    }
                }
                TransferState::Command => self.step_command()?,
                TransferState::Payload => self.step_payload()?,
                TransferState::Checksum => self.step_checksum()?,
                TransferState::Success | TransferState::Error => return Ok(()),
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    fn enter_command(&mut self) {
        self.line.clear();
        if self.role == Role::Client {
            let kind = self.kind.expect("client transfers know their direction");
            self.send_line(format_command(self.id, kind, self.size));
        }
        self.state = TransferState::Command;
    }

    fn step_command(&mut self) -> Result<bool> {
        match self.role {
            Role::Client => {
                if self.sending_line() {
                    if !self.flush_line()? {
                        return Ok(false);
                    }
                    self.times.command_sent = Some(Instant::now());
                }
                match self.read_line()? {
                    None => Ok(false),
                    Some(line) => {
                        self.times.command_received = Some(Instant::now());
                        parse_response(&line, self.id)?;
                        self.enter_payload();
                        Ok(true)
                    }
                }
            }
            Role::Server => {
                if self.kind.is_none() {
                    match self.read_line()? {
                        None => return Ok(false),
                        Some(line) => {
                            let command = parse_command(&line)?;
                            if command.version != PROTOCOL_VERSION {
                                // Best-effort rejection line before closing.
                                let _ = self.transport.write(
                                    format!("TGEN ERR {} unsupported-version\n", command.id)
                                        .as_bytes(),
                                );
                                return Err(Error::Protocol(format!(
                                    "unsupported protocol version {}",
                                    command.version
                                )));
                            }
                            self.kind = Some(command.kind);
                            self.size = command.size;
                            self.times.command_received = Some(Instant::now());
                            self.send_line(format!("TGEN OK {}\n", command.id));
                        }
                    }
                }
                if !self.flush_line()? {
                    return Ok(false);
                }
                if self.times.command_sent.is_none() {
                    self.times.command_sent = Some(Instant::now());
                }
                self.enter_payload();
                Ok(true)
            }
        }
    }

    fn enter_payload(&mut self) {
        self.digest = Md5::new();
        self.bytes_transferred = 0;
        self.state = TransferState::Payload;
    }

    fn step_payload(&mut self) -> Result<bool> {
        let mut chunk = [0u8; CHUNK];
        if self.is_sender() {
            while self.bytes_transferred < self.size {
                let n = (self.size - self.bytes_transferred).min(CHUNK as u64) as usize;
                fill_pattern(&mut chunk[..n], self.bytes_transferred);
                match self.transport.write(&chunk[..n]) {
                    Progress::Bytes(written) => {
                        self.note_first_payload();
                        self.digest.update(&chunk[..written]);
                        self.bytes_transferred += written as u64;
                    }
                    Progress::WouldBlock => return Ok(false),
                    Progress::Eof => {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed while sending the payload",
                        )))
                    }
                    Progress::Error(e) => return Err(Error::Io(e)),
                }
            }
        } else {
            while self.bytes_transferred < self.size {
                let n = (self.size - self.bytes_transferred).min(CHUNK as u64) as usize;
                match self.transport.read(&mut chunk[..n]) {
                    Progress::Bytes(read) => {
                        self.note_first_payload();
                        self.digest.update(&chunk[..read]);
                        self.bytes_transferred += read as u64;
                    }
                    Progress::WouldBlock => return Ok(false),
                    Progress::Eof => {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed mid-payload",
                        )))
                    }
                    Progress::Error(e) => return Err(Error::Io(e)),
                }
            }
        }
        self.enter_checksum();
        Ok(true)
    }

    fn note_first_payload(&mut self) {
        if self.times.first_payload.is_none() {
            self.times.first_payload = Some(Instant::now());
        }
    }

    fn enter_checksum(&mut self) {
        self.times.payload_done = Some(Instant::now());
        let digest = self.digest.finalize_reset();
        let hexsum = hex::encode(&digest[..]);
        if self.is_sender() {
            self.send_line(format!("MD5 {hexsum}\n"));
        } else {
            self.expected_sum = hexsum;
            self.line.clear();
        }
        self.state = TransferState::Checksum;
    }

    fn step_checksum(&mut self) -> Result<bool> {
        if self.is_sender() {
            if !self.flush_line()? {
                return Ok(false);
            }
        } else {
            let line = match self.read_line()? {
                None => return Ok(false),
                Some(line) => line,
            };
            let sum = line
                .strip_prefix("MD5 ")
                .ok_or_else(|| Error::Protocol(format!("bad checksum line '{line}'")))?;
            if !sum.eq_ignore_ascii_case(&self.expected_sum) {
                return Err(Error::Protocol(format!(
                    "checksum mismatch: peer sent {sum}, payload hashes to {}",
                    self.expected_sum
                )));
            }
        }
        self.times.complete = Some(Instant::now());
        self.state = TransferState::Success;
        Ok(true)
    }

    fn send_line(&mut self, line: String) {
        self.outbuf = line.into_bytes();
        self.outpos = 0;
    }

    /// Write out the pending line. True once fully flushed.
    fn flush_line(&mut self) -> Result<bool> {
        while self.sending_line() {
            match self.transport.write(&self.outbuf[self.outpos..]) {
                Progress::Bytes(n) => self.outpos += n,
                Progress::WouldBlock => return Ok(false),
                Progress::Eof => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed while sending a protocol line",
                    )))
                }
                Progress::Error(e) => return Err(Error::Io(e)),
            }
        }
        Ok(true)
    }

    /// Read up to the next `\n`, one byte at a time so bytes that belong to
    /// the next phase are never consumed early. `None` until the full line
    /// arrived.
    fn read_line(&mut self) -> Result<Option<String>> {
        let mut byte = [0u8; 1];
        loop {
            match self.transport.read(&mut byte) {
                Progress::Bytes(_) => {
                    if byte[0] == b'\n' {
                        let raw = std::mem::take(&mut self.line);
                        let text = String::from_utf8(raw).map_err(|_| {
                            Error::Protocol("protocol line is not valid ascii".into())
                        })?;
                        return Ok(Some(text));
                    }
                    self.line.push(byte[0]);
                    if self.line.len() > MAX_LINE_LEN {
                        return Err(Error::Protocol("protocol line too long".into()));
                    }
                }
                Progress::WouldBlock => return Ok(None),
                Progress::Eof => {
                    return Err(Error::Protocol(
                        "connection closed before the line completed".into(),
                    ))
                }
                Progress::Error(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Emit the structured completion line.
    pub fn log_completion(&self) {
        let t = &self.times;
        let result = match self.failure {
            None => "success".to_string(),
            Some(tag) => format!("error:{tag}"),
        };
        let kind = match self.kind {
            Some(k) => k.to_string(),
            None => "-".to_string(),
        };
        log::info!(
            "transfer-complete id={} role={} kind={} peer={} size={} \
             connect_ms={} command_ms={} payload_ms={} total_ms={} result={}",
            self.id,
            self.role,
            kind,
            self.peer(),
            self.size,
            Checkpoints::span_ms(Some(t.created), t.connected),
            Checkpoints::span_ms(t.connected, t.command_done()),
            Checkpoints::span_ms(t.command_done(), t.payload_done),
            Checkpoints::span_ms(Some(t.created), t.complete),
            result,
        );
    }
}

/// A parsed `TGEN <version> <id> <GET|PUT> <size>` command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandLine {
    pub version: u32,
    pub id: u64,
    pub kind: TransferKind,
    pub size: u64,
}

pub fn format_command(id: u64, kind: TransferKind, size: u64) -> String {
    format!("TGEN {PROTOCOL_VERSION} {id} {} {size}\n", kind.wire())
}

pub fn parse_command(line: &str) -> Result<CommandLine> {
    let bad = || Error::Protocol(format!("bad command line '{line}'"));
    let mut fields = line.split_ascii_whitespace();
    if fields.next() != Some("TGEN") {
        return Err(bad());
    }
    let version = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
    let id = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
    let kind = fields
        .next()
        .and_then(TransferKind::from_wire)
        .ok_or_else(bad)?;
    let size = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
    if fields.next().is_some() {
        return Err(bad());
    }
    Ok(CommandLine {
        version,
        id,
        kind,
        size,
    })
}

/// Validate a `TGEN OK <id>` acknowledgement for the transfer we initiated.
pub fn parse_response(line: &str, expected_id: u64) -> Result<()> {
    let mut fields = line.split_ascii_whitespace();
    if fields.next() != Some("TGEN") {
        return Err(Error::Protocol(format!("bad response line '{line}'")));
    }
    match fields.next() {
        Some("OK") => {
            let id: u64 = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| Error::Protocol(format!("bad response line '{line}'")))?;
            if id != expected_id {
                return Err(Error::Protocol(format!(
                    "response acknowledges transfer {id}, expected {expected_id}"
                )));
            }
            Ok(())
        }
        Some("ERR") => Err(Error::Protocol(format!("peer rejected transfer: {line}"))),
        _ => Err(Error::Protocol(format!("bad response line '{line}'"))),
    }
}

/// Deterministic payload content: the byte at absolute offset `i` is
/// `i mod 256`, so two payloads of equal size are always identical.
pub fn fill_pattern(buf: &mut [u8], offset: u64) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = offset.wrapping_add(i as u64) as u8;
    }
}
