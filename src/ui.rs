use crate::transfer::Role;
use std::time::{Duration, Instant};

// Handles run statistics only; the log output is the whole UI.

/// Aggregate transfer accounting for one driver run. The driver is single
/// threaded, so plain counters are enough.
#[derive(Debug)]
pub struct Stats {
    start_time: Instant,
    clients_started: u64,
    clients_succeeded: u64,
    clients_failed: u64,
    servers_accepted: u64,
    servers_succeeded: u64,
    servers_failed: u64,
    bytes: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Stats {
            start_time: Instant::now(),
            clients_started: 0,
            clients_succeeded: 0,
            clients_failed: 0,
            servers_accepted: 0,
            servers_succeeded: 0,
            servers_failed: 0,
            bytes: 0,
        }
    }
}

/// Final counters returned by `Driver::run` and logged at shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub clients_started: u64,
    pub clients_succeeded: u64,
    pub clients_failed: u64,
    pub servers_accepted: u64,
    pub servers_succeeded: u64,
    pub servers_failed: u64,
    pub bytes: u64,
    pub wall_time: Duration,
}

impl RunSummary {
    pub fn succeeded(&self) -> u64 {
        self.clients_succeeded + self.servers_succeeded
    }

    pub fn failed(&self) -> u64 {
        self.clients_failed + self.servers_failed
    }
}

impl Stats {
    pub fn mark_start(&mut self) {
        self.start_time = Instant::now();
    }

    pub fn client_started(&mut self) {
        self.clients_started += 1;
    }

    pub fn server_started(&mut self) {
        self.servers_accepted += 1;
    }

    /// Record a finished transfer. Only successful transfers contribute to
    /// the byte total the end conditions consult.
    pub fn completed(&mut self, role: Role, success: bool, bytes: u64) {
        match (role, success) {
            (Role::Client, true) => self.clients_succeeded += 1,
            (Role::Client, false) => self.clients_failed += 1,
            (Role::Server, true) => self.servers_succeeded += 1,
            (Role::Server, false) => self.servers_failed += 1,
        }
        if success {
            self.bytes += bytes;
        }
    }

    pub fn succeeded(&self) -> u64 {
        self.clients_succeeded + self.servers_succeeded
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn log_heartbeat(&self, live: usize) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let completed = self.succeeded() + self.clients_failed + self.servers_failed;
        let throughput = 8. * (self.bytes as f64) / elapsed / 1_000_000.;
        if throughput < 1. {
            log::info!("{live} transfers live, {completed} complete ({:.2} kbps)", throughput * 1000.);
        } else if throughput < 1000. {
            log::info!("{live} transfers live, {completed} complete ({:.2} Mbps)", throughput);
        } else {
            log::info!("{live} transfers live, {completed} complete ({:.2} Gbps)", throughput / 1000.);
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            clients_started: self.clients_started,
            clients_succeeded: self.clients_succeeded,
            clients_failed: self.clients_failed,
            servers_accepted: self.servers_accepted,
            servers_succeeded: self.servers_succeeded,
            servers_failed: self.servers_failed,
            bytes: self.bytes,
            wall_time: self.start_time.elapsed(),
        }
    }

    pub fn log_summary(&self) {
        log::info!(
            "run complete: {}/{} client and {}/{} server transfers succeeded, \
             {} bytes in {:.3}s",
            self.clients_succeeded,
            self.clients_started,
            self.servers_succeeded,
            self.servers_accepted,
            self.bytes,
            self.start_time.elapsed().as_secs_f64(),
        );
    }
}
