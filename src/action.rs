use crate::error::{Error, Result};
use crate::structs::{Peer, PeerPool, TransferKind, TransferProtocol};
use std::sync::Arc;

/// One scheduled behavior attached to a graph vertex.
///
/// A time, count, or size of zero on `End` means that condition is
/// unconstrained. A `Transfer` without its own pool falls back to the pool
/// of the `Start` action at dispatch time.
#[derive(Debug, Clone)]
pub enum Action {
    Start {
        time_s: u64,
        server_port: u16,
        peers: Arc<PeerPool>,
        socks_proxy: Option<Peer>,
    },
    End {
        time_s: u64,
        count: u64,
        size_bytes: u64,
    },
    Pause {
        time_s: u64,
    },
    Synchronize,
    Transfer {
        kind: TransferKind,
        protocol: TransferProtocol,
        size_bytes: u64,
        peers: Option<Arc<PeerPool>>,
    },
}

impl Action {
    pub fn new_start(
        time_s: u64,
        server_port: u16,
        peers: &str,
        socks_proxy: Option<&str>,
    ) -> Result<Action> {
        let pool = parse_peers("peers", peers)?;
        if pool.is_empty() {
            return Err(Error::Graph(
                "start action has an empty 'peers' attribute".into(),
            ));
        }
        let socks_proxy = socks_proxy
            .map(|s| parse_peer("socksproxy", s))
            .transpose()?;
        Ok(Action::Start {
            time_s,
            server_port,
            peers: Arc::new(pool),
            socks_proxy,
        })
    }

    /// Time, count, and size are termination conditions; all are optional.
    pub fn new_end(time_s: Option<u64>, count: Option<u64>, size: Option<&str>) -> Result<Action> {
        let size_bytes = match size {
            Some(s) => parse_bytes("size", s)?,
            None => 0,
        };
        Ok(Action::End {
            time_s: time_s.unwrap_or(0),
            count: count.unwrap_or(0),
            size_bytes,
        })
    }

    pub fn new_pause(time_s: u64) -> Action {
        Action::Pause { time_s }
    }

    pub fn new_transfer(
        kind: &str,
        protocol: &str,
        size: &str,
        peers: Option<&str>,
    ) -> Result<Action> {
        let kind: TransferKind = kind
            .parse()
            .map_err(|e| Error::Graph(format!("attribute 'type': {e}")))?;
        let protocol: TransferProtocol = protocol
            .parse()
            .map_err(|e| Error::Graph(format!("attribute 'protocol': {e}")))?;
        if protocol != TransferProtocol::Tcp {
            return Err(Error::Graph(format!(
                "transfer protocol '{protocol}' is reserved but not driven, only 'tcp' is supported"
            )));
        }
        let size_bytes = parse_bytes("size", size)?;
        let peers = match peers {
            Some(p) => {
                let pool = parse_peers("peers", p)?;
                if pool.is_empty() {
                    return Err(Error::Graph(
                        "transfer action has an empty 'peers' attribute".into(),
                    ));
                }
                Some(Arc::new(pool))
            }
            None => None,
        };
        Ok(Action::Transfer {
            kind,
            protocol,
            size_bytes,
            peers,
        })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Action::Start { .. } => "start",
            Action::End { .. } => "end",
            Action::Pause { .. } => "pause",
            Action::Synchronize => "synchronize",
            Action::Transfer { .. } => "transfer",
        }
    }
}

/// Parse a single `host:port` attribute value.
pub fn parse_peer(attribute: &str, value: &str) -> Result<Peer> {
    value
        .parse()
        .map_err(|e| Error::Graph(format!("attribute '{attribute}': {e}")))
}

/// Parse a comma-separated peer list into a pool. Duplicates are kept.
pub fn parse_peers(attribute: &str, value: &str) -> Result<PeerPool> {
    let mut pool = PeerPool::new();
    for token in value.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        pool.add(parse_peer(attribute, token)?);
    }
    Ok(pool)
}

/// Decode a byte count such as `10240`, `10 kb`, or `10 MiB`.
/// SI suffixes are powers of ten, IEC suffixes powers of two.
pub fn parse_bytes(attribute: &str, value: &str) -> Result<u64> {
    let mut parts = value.trim().splitn(2, ' ');
    let digits = parts.next().unwrap_or("");
    let suffix = parts.next();

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Graph(format!(
            "invalid byte string '{value}' for attribute '{attribute}', \
             expected format like '10240' or '10 KiB'"
        )));
    }
    let count: u64 = digits.parse().map_err(|_| {
        Error::Graph(format!(
            "byte count '{digits}' out of range for attribute '{attribute}'"
        ))
    })?;

    let factor = match suffix {
        None => 1,
        Some(s) => match s.to_ascii_lowercase().as_str() {
            "kb" => 10u64.pow(3),
            "mb" => 10u64.pow(6),
            "gb" => 10u64.pow(9),
            "tb" => 10u64.pow(12),
            "kib" => 1 << 10,
            "mib" => 1 << 20,
            "gib" => 1 << 30,
            "tib" => 1u64 << 40,
            _ => {
                return Err(Error::Graph(format!(
                    "invalid bytes suffix '{s}' in '{value}' for attribute '{attribute}', \
                     expected one of 'kib','mib','gib','tib','kb','mb','gb' or 'tb'"
                )))
            }
        },
    };

    count.checked_mul(factor).ok_or_else(|| {
        Error::Graph(format!(
            "byte count '{value}' overflows for attribute '{attribute}'"
        ))
    })
}
