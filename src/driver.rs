use crate::action::Action;
use crate::error::{Error, Result};
use crate::graph::{ActionGraph, VertexId};
use crate::structs::{Peer, PeerPool, TransferKind};
use crate::transfer::{Role, Transfer, TransferState};
use crate::ui::{RunSummary, Stats};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use rand::SeedableRng;
use rand_pcg::Pcg32;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LISTENER: Token = Token(0);
const EVENTS_CAPACITY: usize = 256;

/// What a due timer does.
#[derive(Debug, Clone, Copy)]
enum TimerEvent {
    /// Run the vertex's action.
    Activate(VertexId),
    /// A pause elapsed; continue the walk behind it.
    WalkSuccessors(VertexId),
    /// Re-evaluate the registered end conditions.
    EndCheck,
    Heartbeat,
}

#[derive(Debug)]
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    event: TimerEvent,
}

// Ordering ignores the event: equal deadlines fire in insertion order.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Monotonic timer heap with millisecond granularity. Entries never fire
/// before their deadline; ties break FIFO.
#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    seq: u64,
}

impl TimerQueue {
    fn schedule(&mut self, deadline: Instant, event: TimerEvent) {
        self.seq += 1;
        self.heap.push(Reverse(TimerEntry {
            deadline,
            seq: self.seq,
            event,
        }));
    }

    fn schedule_in(&mut self, delay: Duration, event: TimerEvent) {
        self.schedule(Instant::now() + delay, event);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.deadline)
    }

    fn pop_due(&mut self, now: Instant) -> Option<TimerEvent> {
        if self
            .heap
            .peek()
            .is_some_and(|Reverse(e)| e.deadline <= now)
        {
            self.heap.pop().map(|Reverse(e)| e.event)
        } else {
            None
        }
    }

    fn clear(&mut self) {
        self.heap.clear();
    }
}

/// The single-threaded event loop: multiplexes the listener and every live
/// transfer, fires timers, walks the action graph, and tracks the end
/// conditions.
pub struct Driver {
    graph: ActionGraph,
    poll: Poll,
    listener: TcpListener,
    transfers: HashMap<Token, (Transfer, Option<VertexId>)>,
    timers: TimerQueue,
    rng: Pcg32,
    boot: Instant,
    next_id: u64,
    start_pool: Arc<PeerPool>,
    socks_proxy: Option<Peer>,
    active: HashSet<VertexId>,
    sync_visits: HashMap<VertexId, usize>,
    ends: Vec<VertexId>,
    stats: Stats,
    stop: bool,
    interrupted: Arc<AtomicBool>,
    heartbeat: Duration,
}

impl Driver {
    /// Bind the listener and prepare a run. A `None` seed draws one from
    /// entropy; passing a seed reproduces all peer selections.
    pub fn new(graph: ActionGraph, seed: Option<u64>) -> Result<Driver> {
        let (server_port, start_pool, socks_proxy) = match graph.action_of(graph.start_vertex()) {
            Action::Start {
                server_port,
                peers,
                socks_proxy,
                ..
            } => (*server_port, peers.clone(), *socks_proxy),
            _ => unreachable!("the loader guarantees a start vertex"),
        };

        let poll = Poll::new()?;
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, server_port));
        let mut listener = TcpListener::bind(addr).map_err(Error::Bind)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let seed = seed.unwrap_or_else(rand::random);
        log::debug!("rng seeded with {seed}");

        Ok(Driver {
            graph,
            poll,
            listener,
            transfers: HashMap::new(),
            timers: TimerQueue::default(),
            rng: Pcg32::seed_from_u64(seed),
            boot: Instant::now(),
            next_id: 0,
            start_pool,
            socks_proxy,
            active: HashSet::new(),
            sync_visits: HashMap::new(),
            ends: Vec::new(),
            stats: Stats::default(),
            stop: false,
            interrupted: Arc::new(AtomicBool::new(false)),
            heartbeat: Duration::from_secs(5),
        })
    }

    /// Period of the progress log line. Zero disables it.
    pub fn set_heartbeat(&mut self, period: Duration) {
        self.heartbeat = period;
    }

    /// Shared flag that asks the loop to shut down at the next iteration
    /// boundary, e.g. from a signal handler.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    /// The port the listener actually bound.
    pub fn server_port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or_default()
    }

    /// Run until an end condition is satisfied or the stop flag is raised.
    pub fn run(&mut self) -> Result<RunSummary> {
        self.boot = Instant::now();
        self.stats.mark_start();

        let start = self.graph.start_vertex();
        let start_delay = match self.graph.action_of(start) {
            Action::Start { time_s, .. } => Duration::from_millis(time_s * 1000),
            _ => unreachable!("the loader guarantees a start vertex"),
        };
        self.timers
            .schedule(self.boot + start_delay, TimerEvent::Activate(start));
        if !self.heartbeat.is_zero() {
            self.timers.schedule_in(self.heartbeat, TimerEvent::Heartbeat);
        }
        log::info!(
            "listening on port {}, driving a graph of {} vertices",
            self.server_port(),
            self.graph.len()
        );

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while !self.stop {
            if self.interrupted.load(Ordering::Relaxed) {
                log::warn!("interrupt received, shutting down");
                break;
            }

            let timeout = self
                .timers
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()));
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Io(e));
            }

            for event in events.iter() {
                if self.stop {
                    break;
                }
                match event.token() {
                    LISTENER => self.accept_pending(),
                    token => self.drive_transfer(token),
                }
            }

            let now = Instant::now();
            while let Some(timer) = self.timers.pop_due(now) {
                if self.stop {
                    break;
                }
                self.handle_timer(timer);
            }
        }

        self.shutdown();
        Ok(self.stats.summary())
    }

    fn next_transfer_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // Accept every pending inbound connection. Server transfers live outside
    // the graph walk but their successes count toward the end thresholds.
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let peer = match addr {
                        SocketAddr::V4(a) => Peer::new(*a.ip(), a.port()),
                        SocketAddr::V6(_) => {
                            log::warn!("dropping non-ipv4 connection from {addr}");
                            continue;
                        }
                    };
                    let id = self.next_transfer_id();
                    log::debug!("transfer {id}: accepted inbound connection from {peer}");
                    self.stats.server_started();
                    self.install(Transfer::server(id, stream, peer), None);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    return;
                }
            }
        }
    }

    fn install(&mut self, mut transfer: Transfer, vertex: Option<VertexId>) {
        let token = Token(transfer.id() as usize);
        let interests = interests_of(&transfer);
        if let Err(e) = self
            .poll
            .registry()
            .register(transfer.stream_mut(), token, interests)
        {
            log::warn!("cannot register transfer {}: {e}", transfer.id());
            transfer.cancel();
        }
        self.transfers.insert(token, (transfer, vertex));
        // Pump once: an accepted socket may already hold the command line.
        self.drive_transfer(token);
    }

    fn drive_transfer(&mut self, token: Token) {
        let finished = match self.transfers.get_mut(&token) {
            // Stale readiness for a transfer that already finished.
            None => return,
            Some((transfer, _)) => {
                transfer.drive();
                transfer.is_finished()
            }
        };
        if finished {
            self.finish_transfer(token);
        } else if let Some((transfer, _)) = self.transfers.get_mut(&token) {
            let interests = interests_of(transfer);
            if let Err(e) = self
                .poll
                .registry()
                .reregister(transfer.stream_mut(), token, interests)
            {
                log::warn!("cannot update interest for transfer {}: {e}", transfer.id());
            }
        }
    }

    fn finish_transfer(&mut self, token: Token) {
        let Some((mut transfer, vertex)) = self.transfers.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(transfer.stream_mut());
        transfer.log_completion();
        let success = transfer.state() == TransferState::Success;
        self.stats.completed(
            transfer.role(),
            success,
            if success { transfer.bytes_transferred() } else { 0 },
        );
        drop(transfer);

        if let Some(v) = vertex {
            self.active.remove(&v);
            if !self.stop {
                self.walk_successors(v);
            }
        }
        self.check_end_conditions();
    }

    fn handle_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::Activate(v) => {
                self.activate(v);
                self.check_end_conditions();
            }
            TimerEvent::WalkSuccessors(v) => {
                log::debug!("pause '{}' elapsed", self.graph.name_of(v));
                self.walk_successors(v);
                self.check_end_conditions();
            }
            TimerEvent::EndCheck => self.check_end_conditions(),
            TimerEvent::Heartbeat => {
                self.stats.log_heartbeat(self.transfers.len());
                self.timers.schedule_in(self.heartbeat, TimerEvent::Heartbeat);
                self.check_end_conditions();
            }
        }
    }

    /// Activate each successor in edge order.
    fn walk_successors(&mut self, v: VertexId) {
        let successors: Vec<VertexId> = self.graph.successors(v).to_vec();
        for s in successors {
            if self.stop {
                break;
            }
            self.activate(s);
        }
    }

    fn activate(&mut self, v: VertexId) {
        // Pools inside the action are Arc-shared, so the clone is cheap and
        // releases the graph borrow before the walk continues.
        let action = self.graph.action_of(v).clone();
        match action {
            Action::Start { .. } => {
                log::info!("graph walk started");
                self.walk_successors(v);
            }
            Action::Pause { time_s } => {
                let time_ms = time_s * 1000;
                log::debug!("pause '{}' for {time_ms} ms", self.graph.name_of(v));
                self.timers
                    .schedule_in(Duration::from_millis(time_ms), TimerEvent::WalkSuccessors(v));
            }
            Action::Synchronize => {
                let needed = self.graph.in_degree(v).max(1);
                let visits = self.sync_visits.entry(v).or_insert(0);
                *visits += 1;
                if *visits >= needed {
                    // Reset so a cyclic walk can join here again.
                    *visits = 0;
                    log::debug!("synchronize '{}' complete", self.graph.name_of(v));
                    self.walk_successors(v);
                } else {
                    log::debug!(
                        "synchronize '{}' waiting ({}/{needed})",
                        self.graph.name_of(v),
                        self.sync_visits[&v]
                    );
                }
            }
            Action::End { time_s, .. } => {
                if !self.ends.contains(&v) {
                    self.ends.push(v);
                    if time_s > 0 {
                        // Wake the loop when the time condition comes due,
                        // even if no I/O or other timer would.
                        self.timers.schedule(
                            self.boot + Duration::from_millis(time_s * 1000),
                            TimerEvent::EndCheck,
                        );
                    }
                }
                self.check_end_conditions();
            }
            Action::Transfer {
                kind,
                size_bytes,
                peers,
                ..
            } => {
                if self.active.contains(&v) {
                    log::debug!(
                        "transfer '{}' is already in flight, skipping activation",
                        self.graph.name_of(v)
                    );
                    return;
                }
                self.start_client_transfer(v, kind, size_bytes, peers);
            }
        }
    }

    fn start_client_transfer(
        &mut self,
        v: VertexId,
        kind: TransferKind,
        size: u64,
        pool: Option<Arc<PeerPool>>,
    ) {
        let pool = pool.unwrap_or_else(|| self.start_pool.clone());
        let id = self.next_transfer_id();
        self.stats.client_started();

        let failed = |tag: &str, peer: &str, id: u64| {
            log::info!(
                "transfer-complete id={id} role=client kind={kind} peer={peer} size={size} \
                 connect_ms=0 command_ms=0 payload_ms=0 total_ms=0 result=error:{tag}"
            );
        };

        let Some(peer) = pool.choose(&mut self.rng) else {
            log::warn!("transfer {id} failed: {}", Error::EmptyPool);
            failed(Error::EmptyPool.tag(), "-", id);
            self.stats.completed(Role::Client, false, 0);
            self.walk_successors(v);
            self.check_end_conditions();
            return;
        };

        match Transfer::client(id, kind, size, peer, self.socks_proxy) {
            Ok(transfer) => {
                log::debug!("transfer {id}: {kind} {size} bytes with {peer}");
                self.active.insert(v);
                self.install(transfer, Some(v));
            }
            Err(e) => {
                log::warn!("transfer {id} failed: {e}");
                failed(e.tag(), &peer.to_string(), id);
                self.stats.completed(Role::Client, false, 0);
                self.walk_successors(v);
                self.check_end_conditions();
            }
        }
    }

    fn check_end_conditions(&mut self) {
        if self.stop {
            return;
        }
        let elapsed = self.boot.elapsed();
        for &v in &self.ends {
            if let Action::End {
                time_s,
                count,
                size_bytes,
            } = self.graph.action_of(v)
            {
                let time_hit =
                    *time_s > 0 && elapsed >= Duration::from_millis(time_s * 1000);
                let count_hit = *count > 0 && self.stats.succeeded() >= *count;
                let size_hit = *size_bytes > 0 && self.stats.bytes() >= *size_bytes;
                if time_hit || count_hit || size_hit {
                    log::info!(
                        "end condition of '{}' satisfied (time={time_hit} count={count_hit} size={size_hit})",
                        self.graph.name_of(v)
                    );
                    self.stop = true;
                    return;
                }
            }
        }
    }

    /// Cancel whatever is in flight, release the sockets, and log the final
    /// summary.
    fn shutdown(&mut self) {
        self.timers.clear();
        let tokens: Vec<Token> = self.transfers.keys().copied().collect();
        for token in tokens {
            if let Some((mut transfer, _)) = self.transfers.remove(&token) {
                let _ = self.poll.registry().deregister(transfer.stream_mut());
                transfer.cancel();
                transfer.log_completion();
                self.stats.completed(transfer.role(), false, 0);
            }
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
        self.stats.log_summary();
    }
}

fn interests_of(transfer: &Transfer) -> Interest {
    match (transfer.want_read(), transfer.want_write()) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        // Terminal states never reach registration, so default to readable
        // to notice a peer close.
        _ => Interest::READABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut timers = TimerQueue::default();
        let now = Instant::now();
        timers.schedule(now + Duration::from_millis(30), TimerEvent::EndCheck);
        timers.schedule(now + Duration::from_millis(10), TimerEvent::Activate(1));
        timers.schedule(now + Duration::from_millis(20), TimerEvent::Activate(2));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));
        let late = now + Duration::from_millis(50);
        assert!(matches!(timers.pop_due(late), Some(TimerEvent::Activate(1))));
        assert!(matches!(timers.pop_due(late), Some(TimerEvent::Activate(2))));
        assert!(matches!(timers.pop_due(late), Some(TimerEvent::EndCheck)));
        assert!(timers.pop_due(late).is_none());
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let mut timers = TimerQueue::default();
        let deadline = Instant::now() + Duration::from_millis(5);
        for v in 0..10 {
            timers.schedule(deadline, TimerEvent::Activate(v));
        }
        let late = deadline + Duration::from_millis(1);
        for v in 0..10 {
            match timers.pop_due(late) {
                Some(TimerEvent::Activate(got)) => assert_eq!(got, v),
                other => panic!("expected Activate({v}), got {other:?}"),
            }
        }
    }

    #[test]
    fn nothing_fires_before_its_deadline() {
        let mut timers = TimerQueue::default();
        let now = Instant::now();
        timers.schedule(now + Duration::from_secs(3600), TimerEvent::EndCheck);
        assert!(timers.pop_due(now).is_none());
        assert!(timers.pop_due(now + Duration::from_secs(3599)).is_none());
    }
}
