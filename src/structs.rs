use rand::RngCore;
use std::fmt::{self, Display};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

/// A resolved transfer endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Peer { addr, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.addr, self.port))
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl FromStr for Peer {
    type Err = String;

    /// Parse `host:port`. Peers arrive already resolved, so the host part
    /// must be `localhost` or a dotted IPv4 literal.
    fn from_str(s: &str) -> Result<Self, String> {
        let (host, port) = s
            .split_once(':')
            .ok_or_else(|| format!("expected peer syntax 'host:port', got '{s}'"))?;
        let addr = if host.eq_ignore_ascii_case("localhost") {
            Ipv4Addr::LOCALHOST
        } else {
            host.parse()
                .map_err(|_| format!("invalid host '{host}' in peer '{s}'"))?
        };
        if addr.is_unspecified() {
            return Err(format!("invalid host '{host}' in peer '{s}'"));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port in peer '{s}', expected 16 bit unsigned integer"))?;
        if port == 0 {
            return Err(format!("invalid port 0 in peer '{s}'"));
        }
        Ok(Peer { addr, port })
    }
}

/// A shareable pool of peers. Duplicates are allowed and act as selection
/// weights. The pool is filled during loading and then handed out as an
/// immutable `Arc` snapshot; no iteration order is part of the API.
#[derive(Debug, Clone, Default)]
pub struct PeerPool {
    peers: Vec<Peer>,
}

impl PeerPool {
    pub fn new() -> Self {
        PeerPool { peers: Vec::new() }
    }

    pub fn add(&mut self, peer: Peer) {
        self.peers.push(peer);
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Uniform random selection over the entries. `None` on an empty pool.
    pub fn choose(&self, rng: &mut impl RngCore) -> Option<Peer> {
        if self.peers.is_empty() {
            None
        } else {
            Some(self.peers[(rng.next_u32() as usize) % self.peers.len()])
        }
    }
}

/// The direction of a transfer: `Get` pulls bytes from the remote side,
/// `Put` pushes bytes to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Get,
    Put,
}

impl TransferKind {
    /// Token used on the wire command line.
    pub fn wire(&self) -> &'static str {
        match self {
            TransferKind::Get => "GET",
            TransferKind::Put => "PUT",
        }
    }

    pub fn from_wire(token: &str) -> Option<TransferKind> {
        match token {
            "GET" => Some(TransferKind::Get),
            "PUT" => Some(TransferKind::Put),
            _ => None,
        }
    }
}

impl Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Get => write!(f, "get"),
            TransferKind::Put => write!(f, "put"),
        }
    }
}

impl FromStr for TransferKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        if s.eq_ignore_ascii_case("get") {
            Ok(TransferKind::Get)
        } else if s.eq_ignore_ascii_case("put") {
            Ok(TransferKind::Put)
        } else {
            Err(format!("unknown transfer type '{s}', expected 'get' or 'put'"))
        }
    }
}

/// Transport schema values. Only `Tcp` is driven; the other values are
/// reserved in the schema and rejected at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferProtocol {
    Tcp,
    Udp,
    Pipe,
    SocketPair,
}

impl Display for TransferProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferProtocol::Tcp => write!(f, "tcp"),
            TransferProtocol::Udp => write!(f, "udp"),
            TransferProtocol::Pipe => write!(f, "pipe"),
            TransferProtocol::SocketPair => write!(f, "socketpair"),
        }
    }
}

impl FromStr for TransferProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(TransferProtocol::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(TransferProtocol::Udp)
        } else if s.eq_ignore_ascii_case("pipe") {
            Ok(TransferProtocol::Pipe)
        } else if s.eq_ignore_ascii_case("socketpair") {
            Ok(TransferProtocol::SocketPair)
        } else {
            Err(format!(
                "unknown protocol '{s}', expected 'tcp', 'udp', 'pipe' or 'socketpair'"
            ))
        }
    }
}
