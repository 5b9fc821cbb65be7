use crate::error::{Error, Result};
use crate::structs::Peer;
use mio::net::TcpStream;
use std::io::{self, Read, Write};

/// SOCKS5 constants (RFC 1928), no-auth profile only.
mod socks5 {
    pub const VERSION: u8 = 5;
    pub const METH_NO_AUTH: u8 = 0;
    pub const CMD_CONNECT: u8 = 1;
    pub const ATYP_IPV4: u8 = 1;
    pub const REP_SUCCEEDED: u8 = 0;

    pub const METHOD_REPLY_LEN: usize = 2;
    pub const CONNECT_REPLY_LEN: usize = 10;
}

/// Result of one non-blocking read or write attempt.
#[derive(Debug)]
pub enum Progress {
    Bytes(usize),
    WouldBlock,
    Eof,
    Error(io::Error),
}

/// Connection lifecycle. The proxy states only occur when a SOCKS5 proxy is
/// configured; the transfer layer sees the stream once `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    ConnectPending,
    ProxyInit,
    ProxyAuth,
    ProxyRequest,
    ProxyResponse,
    Ready,
    Closed,
}

/// A non-blocking TCP stream, optionally negotiating a SOCKS5 tunnel to the
/// real peer before any payload flows.
pub struct Transport {
    stream: TcpStream,
    state: TransportState,
    peer: Peer,
    proxy: Option<Peer>,
    outbuf: Vec<u8>,
    outpos: usize,
    inbuf: Vec<u8>,
    inneed: usize,
}

impl Transport {
    /// Start a non-blocking connect. With a proxy, the TCP connection goes
    /// to the proxy and `peer` becomes the CONNECT target.
    pub fn connect(peer: Peer, proxy: Option<Peer>) -> Result<Transport> {
        let target = proxy.unwrap_or(peer);
        let stream = TcpStream::connect(target.socket_addr()).map_err(|e| {
            if proxy.is_some() {
                Error::Proxy(e.to_string())
            } else {
                Error::Connect(e)
            }
        })?;
        Ok(Transport {
            stream,
            state: TransportState::ConnectPending,
            peer,
            proxy,
            outbuf: Vec::new(),
            outpos: 0,
            inbuf: Vec::new(),
            inneed: 0,
        })
    }

    /// Wrap an accepted inbound stream; it is ready immediately.
    pub fn accepted(stream: TcpStream, peer: Peer) -> Transport {
        Transport {
            stream,
            state: TransportState::Ready,
            peer,
            proxy: None,
            outbuf: Vec::new(),
            outpos: 0,
            inbuf: Vec::new(),
            inneed: 0,
        }
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == TransportState::Ready
    }

    /// The raw stream, exposed for poller registration only.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Readiness interest while the handshake runs. Once `Ready`, the
    /// transfer layer decides.
    pub fn want_write(&self) -> bool {
        matches!(
            self.state,
            TransportState::ConnectPending | TransportState::ProxyInit | TransportState::ProxyRequest
        )
    }

    pub fn want_read(&self) -> bool {
        matches!(
            self.state,
            TransportState::ProxyAuth | TransportState::ProxyResponse
        )
    }

    /// Pump the connect and proxy handshake as far as the socket allows.
    /// Returns without error when stalled; the caller checks `is_ready`.
    pub fn drive(&mut self) -> Result<()> {
        loop {
            match self.state {
                TransportState::Ready | TransportState::Closed => return Ok(()),
                TransportState::ConnectPending => {
                    // A pending connect reports completion through
                    // writability; take_error surfaces a failed attempt.
                    if let Some(e) = self.stream.take_error().map_err(Error::Connect)? {
                        self.state = TransportState::Closed;
                        return Err(self.connect_error(e));
                    }
                    match self.stream.peer_addr() {
                        Ok(_) => {
                            if self.proxy.is_some() {
                                self.send_later(vec![
                                    socks5::VERSION,
                                    1,
                                    socks5::METH_NO_AUTH,
                                ]);
                                self.state = TransportState::ProxyInit;
                            } else {
                                self.state = TransportState::Ready;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
                        Err(e) => {
                            self.state = TransportState::Closed;
                            return Err(self.connect_error(e));
                        }
                    }
                }
                TransportState::ProxyInit => {
                    if !self.flush_handshake()? {
                        return Ok(());
                    }
                    self.expect(socks5::METHOD_REPLY_LEN);
                    self.state = TransportState::ProxyAuth;
                }
                TransportState::ProxyAuth => {
                    if !self.fill_handshake()? {
                        return Ok(());
                    }
                    check_method_reply(&self.inbuf).inspect_err(|_| {
                        self.state = TransportState::Closed;
                    })?;
                    self.send_later(connect_request(self.peer).to_vec());
                    self.state = TransportState::ProxyRequest;
                }
                TransportState::ProxyRequest => {
                    if !self.flush_handshake()? {
                        return Ok(());
                    }
                    self.expect(socks5::CONNECT_REPLY_LEN);
                    self.state = TransportState::ProxyResponse;
                }
                TransportState::ProxyResponse => {
                    if !self.fill_handshake()? {
                        return Ok(());
                    }
                    check_connect_reply(&self.inbuf).inspect_err(|_| {
                        self.state = TransportState::Closed;
                    })?;
                    log::debug!("socks5 tunnel to {} established", self.peer);
                    self.state = TransportState::Ready;
                }
            }
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Progress {
        if self.state == TransportState::Closed {
            return Progress::Eof;
        }
        loop {
            match self.stream.read(buf) {
                Ok(0) => {
                    self.state = TransportState::Closed;
                    return Progress::Eof;
                }
                Ok(n) => return Progress::Bytes(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Progress::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.state = TransportState::Closed;
                    return Progress::Error(e);
                }
            }
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Progress {
        if self.state == TransportState::Closed {
            return Progress::Eof;
        }
        loop {
            match self.stream.write(buf) {
                Ok(0) => {
                    self.state = TransportState::Closed;
                    return Progress::Eof;
                }
                Ok(n) => return Progress::Bytes(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Progress::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.state = TransportState::Closed;
                    return Progress::Error(e);
                }
            }
        }
    }

    pub fn close(&mut self) {
        self.state = TransportState::Closed;
    }

    fn connect_error(&self, e: io::Error) -> Error {
        if self.proxy.is_some() {
            Error::Proxy(e.to_string())
        } else {
            Error::Connect(e)
        }
    }

    fn send_later(&mut self, bytes: Vec<u8>) {
        self.outbuf = bytes;
        self.outpos = 0;
    }

    fn expect(&mut self, n: usize) {
        self.inbuf.clear();
        self.inneed = n;
    }

    /// Write out the pending handshake bytes. True once fully flushed.
    fn flush_handshake(&mut self) -> Result<bool> {
        while self.outpos < self.outbuf.len() {
            match self.stream.write(&self.outbuf[self.outpos..]) {
                Ok(0) => {
                    self.state = TransportState::Closed;
                    return Err(Error::Proxy("stream closed during negotiation".into()));
                }
                Ok(n) => self.outpos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.state = TransportState::Closed;
                    return Err(Error::Proxy(e.to_string()));
                }
            }
        }
        Ok(true)
    }

    /// Read until `inneed` handshake bytes arrived, tolerating any
    /// fragmentation. True once complete.
    fn fill_handshake(&mut self) -> Result<bool> {
        let mut chunk = [0u8; socks5::CONNECT_REPLY_LEN];
        while self.inbuf.len() < self.inneed {
            let want = self.inneed - self.inbuf.len();
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => {
                    self.state = TransportState::Closed;
                    return Err(Error::Proxy("unexpected eof during negotiation".into()));
                }
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.state = TransportState::Closed;
                    return Err(Error::Proxy(e.to_string()));
                }
            }
        }
        Ok(true)
    }
}

/// The CONNECT request for an IPv4 target: `05 01 00 01 <ipv4:4> <port:2>`.
fn connect_request(peer: Peer) -> [u8; 10] {
    let ip = peer.addr.octets();
    let port = peer.port.to_be_bytes();
    [
        socks5::VERSION,
        socks5::CMD_CONNECT,
        0,
        socks5::ATYP_IPV4,
        ip[0],
        ip[1],
        ip[2],
        ip[3],
        port[0],
        port[1],
    ]
}

/// The method selection reply must be `05 00` (no-auth accepted).
fn check_method_reply(reply: &[u8]) -> Result<()> {
    if reply.len() != socks5::METHOD_REPLY_LEN || reply[0] != socks5::VERSION {
        return Err(Error::Proxy(format!(
            "unexpected method reply {reply:02x?}"
        )));
    }
    if reply[1] != socks5::METH_NO_AUTH {
        return Err(Error::Proxy(format!(
            "proxy refused the no-auth method (got {:#04x})",
            reply[1]
        )));
    }
    Ok(())
}

/// The CONNECT reply must be `05 00 00 01` followed by the bound IPv4
/// address and port, which we ignore.
fn check_connect_reply(reply: &[u8]) -> Result<()> {
    if reply.len() != socks5::CONNECT_REPLY_LEN || reply[0] != socks5::VERSION {
        return Err(Error::Proxy(format!(
            "unexpected connect reply {reply:02x?}"
        )));
    }
    if reply[1] != socks5::REP_SUCCEEDED {
        return Err(Error::Proxy(format!(
            "proxy rejected the connect request (reply code {:#04x})",
            reply[1]
        )));
    }
    if reply[3] != socks5::ATYP_IPV4 {
        return Err(Error::Proxy(format!(
            "unexpected bind address type {:#04x}",
            reply[3]
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_layout() {
        let peer: Peer = "1.2.3.4:80".parse().unwrap();
        assert_eq!(
            connect_request(peer),
            [0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50]
        );
    }

    #[test]
    fn method_reply_validation() {
        assert!(check_method_reply(&[0x05, 0x00]).is_ok());
        assert!(check_method_reply(&[0x04, 0x00]).is_err());
        assert!(check_method_reply(&[0x05, 0xff]).is_err());
        assert!(check_method_reply(&[0x05]).is_err());
    }

    #[test]
    fn connect_reply_validation() {
        let ok = [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90];
        assert!(check_connect_reply(&ok).is_ok());

        let mut refused = ok;
        refused[1] = 0x05; // connection refused
        assert!(check_connect_reply(&refused).is_err());

        let mut bad_version = ok;
        bad_version[0] = 0x04;
        assert!(check_connect_reply(&bad_version).is_err());

        let mut ipv6 = ok;
        ipv6[3] = 0x04;
        assert!(check_connect_reply(&ipv6).is_err());
    }
}
