use thiserror::Error;

/// Errors surfaced by graph loading, the driver, and individual transfers.
///
/// Per-transfer errors are local: they are recorded on the transfer, logged,
/// and the graph walk continues. Only graph loading, listener setup, and
/// poller failures abort the process.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or semantically invalid action graph.
    #[error("invalid graph: {0}")]
    Graph(String),

    /// The server listener could not be opened.
    #[error("cannot bind server listener: {0}")]
    Bind(#[source] std::io::Error),

    /// An outbound TCP connect failed.
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    /// SOCKS5 negotiation failed.
    #[error("socks5 negotiation failed: {0}")]
    Proxy(String),

    /// Unexpected command line or checksum mismatch.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Unexpected EOF or OS error during a transfer.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// A peer was requested from an empty pool.
    #[error("peer pool is empty")]
    EmptyPool,
}

impl Error {
    /// Short tag used in the `result=error:<tag>` field of transfer logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Error::Graph(_) => "graph",
            Error::Bind(_) => "bind",
            Error::Connect(_) => "connect",
            Error::Proxy(_) => "proxy",
            Error::Protocol(_) => "protocol",
            Error::Io(_) => "io",
            Error::EmptyPool => "pool",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
