use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use tgen::driver::Driver;
use tgen::graph::ActionGraph;
use tgen::ui::RunSummary;

// Each test uses its own port range so the scenarios can run concurrently.

fn run_graph(yaml: &str) -> RunSummary {
    let graph = ActionGraph::from_str(yaml).unwrap();
    let mut driver = Driver::new(graph, Some(0)).unwrap();
    driver.set_heartbeat(Duration::ZERO);
    driver.run().unwrap()
}

#[test]
fn direct_get_completes_on_both_sides() {
    let summary = run_graph(
        r#"
vertices:
  - id: start
    action: start
    time: 0
    serverport: 9710
    peers: 127.0.0.1:9710
  - id: fetch
    action: transfer
    type: get
    protocol: tcp
    size: 64 KiB
  - id: done
    action: end
    count: 2
edges:
  - [start, fetch]
  - [fetch, done]
"#,
    );
    assert_eq!(summary.clients_started, 1);
    assert_eq!(summary.clients_succeeded, 1);
    assert_eq!(summary.servers_accepted, 1);
    assert_eq!(summary.servers_succeeded, 1);
    assert_eq!(summary.bytes, 2 * 64 * 1024);
}

#[test]
fn zero_size_transfer_succeeds() {
    let summary = run_graph(
        r#"
vertices:
  - id: start
    action: start
    time: 0
    serverport: 9711
    peers: 127.0.0.1:9711
  - id: fetch
    action: transfer
    type: get
    protocol: tcp
    size: "0"
  - id: done
    action: end
    count: 2
edges:
  - [start, fetch]
  - [fetch, done]
"#,
    );
    assert_eq!(summary.clients_succeeded, 1);
    assert_eq!(summary.servers_succeeded, 1);
    assert_eq!(summary.bytes, 0);
}

#[test]
fn pause_delays_the_first_transfer() {
    let summary = run_graph(
        r#"
vertices:
  - id: start
    action: start
    time: 0
    serverport: 9712
    peers: 127.0.0.1:9712
  - id: wait
    action: pause
    time: 1
  - id: push
    action: transfer
    type: put
    protocol: tcp
    size: 10 KiB
  - id: done
    action: end
    count: 2
edges:
  - [start, wait]
  - [wait, push]
  - [push, done]
"#,
    );
    assert_eq!(summary.clients_succeeded, 1);
    assert!(
        summary.wall_time >= Duration::from_secs(1),
        "transfer ran before the pause elapsed: {:?}",
        summary.wall_time
    );
}

#[test]
fn synchronize_joins_branches_and_fires_once() {
    let summary = run_graph(
        r#"
vertices:
  - id: start
    action: start
    time: 0
    serverport: 9713
    peers: 127.0.0.1:9713
  - id: short
    action: pause
    time: 1
  - id: long
    action: pause
    time: 2
  - id: join
    action: synchronize
  - id: fetch
    action: transfer
    type: get
    protocol: tcp
    size: 1 KiB
  - id: done
    action: end
    count: 2
edges:
  - [start, short]
  - [start, long]
  - [short, join]
  - [long, join]
  - [join, fetch]
  - [fetch, done]
"#,
    );
    // The join fires once, after the longest branch.
    assert_eq!(summary.clients_started, 1);
    assert_eq!(summary.clients_succeeded, 1);
    assert!(
        summary.wall_time >= Duration::from_secs(2),
        "join fired before both branches completed: {:?}",
        summary.wall_time
    );
}

#[test]
fn end_by_count_stops_the_loop() {
    let summary = run_graph(
        r#"
vertices:
  - id: start
    action: start
    time: 0
    serverport: 9714
    peers: 127.0.0.1:9714
  - id: t1
    action: transfer
    type: get
    protocol: tcp
    size: 1 KiB
  - id: t2
    action: transfer
    type: get
    protocol: tcp
    size: 1 KiB
  - id: t3
    action: transfer
    type: get
    protocol: tcp
    size: 1 KiB
  - id: done
    action: end
    count: 2
edges:
  - [start, t1]
  - [start, t2]
  - [start, t3]
  - [t1, done]
  - [t2, done]
  - [t3, done]
"#,
    );
    assert_eq!(summary.clients_started, 3);
    assert!(
        summary.succeeded() >= 2,
        "loop stopped before the count threshold: {summary:?}"
    );
}

#[test]
fn checksum_mismatch_is_local_and_nonfatal() {
    // A hostile server that accepts the transfer but lies about the digest.
    let listener = TcpListener::bind("127.0.0.1:9715").unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).unwrap();
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        let line = String::from_utf8(line).unwrap();
        let mut fields = line.split_ascii_whitespace();
        let id = fields.nth(2).unwrap().to_string();
        let size: usize = fields.nth(1).unwrap().parse().unwrap();

        stream
            .write_all(format!("TGEN OK {id}\n").as_bytes())
            .unwrap();
        stream.write_all(&vec![0u8; size]).unwrap();
        stream
            .write_all(b"MD5 00000000000000000000000000000000\n")
            .unwrap();
        let _ = stream.shutdown(Shutdown::Write);
        thread::sleep(Duration::from_secs(2));
    });

    let summary = run_graph(
        r#"
vertices:
  - id: start
    action: start
    time: 0
    serverport: 9716
    peers: 127.0.0.1:9715
  - id: fetch
    action: transfer
    type: get
    protocol: tcp
    size: 1 KiB
  - id: done
    action: end
    time: 1
edges:
  - [start, fetch]
  - [fetch, done]
"#,
    );
    assert_eq!(summary.clients_failed, 1);
    assert_eq!(summary.clients_succeeded, 0);
    // Failed transfers never reach the byte aggregate.
    assert_eq!(summary.bytes, 0);
    assert!(summary.wall_time >= Duration::from_secs(1));
}

#[test]
fn socks5_proxy_happy_path() {
    // Minimal no-auth SOCKS5 proxy: one handshake, then blind forwarding.
    let proxy = TcpListener::bind("127.0.0.1:9718").unwrap();
    thread::spawn(move || {
        let (mut client, _) = proxy.accept().unwrap();

        let mut greeting = [0u8; 3];
        client.read_exact(&mut greeting).unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        client.write_all(&[0x05, 0x00]).unwrap();

        let mut request = [0u8; 10];
        client.read_exact(&mut request).unwrap();
        assert_eq!(&request[..4], [0x05, 0x01, 0x00, 0x01]);
        let ip = std::net::Ipv4Addr::new(request[4], request[5], request[6], request[7]);
        let port = u16::from_be_bytes([request[8], request[9]]);

        let upstream = TcpStream::connect((ip, port)).unwrap();
        client
            .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
            .unwrap();

        let mut client_read = client.try_clone().unwrap();
        let mut upstream_write = upstream.try_clone().unwrap();
        let forward = thread::spawn(move || {
            let _ = io::copy(&mut client_read, &mut upstream_write);
            let _ = upstream_write.shutdown(Shutdown::Write);
        });
        let mut upstream_read = upstream;
        let mut client_write = client;
        let _ = io::copy(&mut upstream_read, &mut client_write);
        let _ = client_write.shutdown(Shutdown::Write);
        let _ = forward.join();
    });

    let summary = run_graph(
        r#"
vertices:
  - id: start
    action: start
    time: 0
    serverport: 9717
    peers: 127.0.0.1:9717
    socksproxy: 127.0.0.1:9718
  - id: fetch
    action: transfer
    type: get
    protocol: tcp
    size: 4 KiB
  - id: done
    action: end
    count: 2
edges:
  - [start, fetch]
  - [fetch, done]
"#,
    );
    assert_eq!(summary.clients_succeeded, 1);
    assert_eq!(summary.servers_succeeded, 1);
    assert_eq!(summary.bytes, 2 * 4096);
}

#[test]
fn unreachable_proxy_is_reported_and_survived() {
    let summary = run_graph(
        r#"
vertices:
  - id: start
    action: start
    time: 0
    serverport: 9719
    peers: 127.0.0.1:9719
    socksproxy: 127.0.0.1:9721
  - id: fetch
    action: transfer
    type: get
    protocol: tcp
    size: 1 KiB
  - id: done
    action: end
    time: 1
edges:
  - [start, fetch]
  - [fetch, done]
"#,
    );
    assert_eq!(summary.clients_failed, 1);
    assert_eq!(summary.servers_accepted, 0);
    assert!(summary.wall_time >= Duration::from_secs(1));
}

#[test]
fn empty_pool_fails_without_opening_a_socket() {
    use std::sync::Arc;
    use tgen::action::Action;
    use tgen::graph::GraphBuilder;
    use tgen::structs::{PeerPool, TransferKind, TransferProtocol};

    let mut builder = GraphBuilder::new();
    let start =
        builder.add_vertex(Action::new_start(0, 9722, "127.0.0.1:9722", None).unwrap());
    let fetch = builder.add_vertex(Action::Transfer {
        kind: TransferKind::Get,
        protocol: TransferProtocol::Tcp,
        size_bytes: 1024,
        peers: Some(Arc::new(PeerPool::new())),
    });
    let done = builder.add_vertex(Action::new_end(Some(1), None, None).unwrap());
    builder.add_edge(start, fetch).unwrap();
    builder.add_edge(fetch, done).unwrap();

    let mut driver = Driver::new(builder.build().unwrap(), Some(0)).unwrap();
    driver.set_heartbeat(Duration::ZERO);
    let summary = driver.run().unwrap();

    assert_eq!(summary.clients_started, 1);
    assert_eq!(summary.clients_failed, 1);
    assert_eq!(summary.servers_accepted, 0);
}
