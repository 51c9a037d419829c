//! End-to-end echo scenarios over real loopback sockets.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gantry_core::{BoxedStream, PoolConfig, ServerConfig, Transport};

use common::{echo_server, echo_server_with_transport, start_server, wait_until};

#[test]
fn test_echo_single_client_chunked_reads() {
    let (server, stats, _sessions) = echo_server(
        ServerConfig::development(),
        PoolConfig {
            preallocated_sessions: 4,
            read_buffer_size: 256,
            ..Default::default()
        },
    );
    let (handle, addr) = start_server(&server);

    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    let mut conn = TcpStream::connect(addr).unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    conn.write_all(&payload).unwrap();

    let mut echoed = vec![0u8; payload.len()];
    conn.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, payload);
    drop(conn);

    wait_until("session close", || stats.closes() == 1);
    assert_eq!(stats.opens(), 1);
    // a 256-byte read buffer forces at least four read/write rounds
    assert!(stats.reads.load(Ordering::SeqCst) >= 4);
    assert!(stats.writes.load(Ordering::SeqCst) >= 4);
    assert_eq!(stats.eof_closes.load(Ordering::SeqCst), 1);

    server.stop();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_echo_concurrent_clients_with_isolation() {
    let config = ServerConfig {
        io_pool_size: 2,
        work_pool_init_size: 1,
        work_pool_high_watermark: 8,
        work_pool_thread_load: 16,
        ..ServerConfig::default()
    };
    let (server, stats, _sessions) = echo_server(
        config,
        PoolConfig {
            preallocated_sessions: 16,
            read_buffer_size: 256,
            ..Default::default()
        },
    );
    let (handle, addr) = start_server(&server);

    let clients: Vec<_> = (0..50u8)
        .map(|i| {
            std::thread::spawn(move || {
                let mut conn = TcpStream::connect(addr).unwrap();
                conn.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
                // distinct pattern per client: echoes must never cross
                let payload = [i; 64];
                conn.write_all(&payload).unwrap();
                let mut echoed = [0u8; 64];
                conn.read_exact(&mut echoed).unwrap();
                assert_eq!(echoed, payload);
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    wait_until("all sessions closed", || stats.closes() == 50);
    assert_eq!(stats.opens(), 50);
    // elastic growth stays under the watermark
    assert!(server.stats().work_loops <= 8);

    server.stop();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_session_timeout_closes_idle_connection() {
    let (server, stats, _sessions) = echo_server(
        ServerConfig::development(),
        PoolConfig {
            preallocated_sessions: 2,
            read_buffer_size: 256,
            session_timeout: Duration::from_secs(1),
            ..Default::default()
        },
    );
    let (handle, addr) = start_server(&server);

    let started = Instant::now();
    let mut conn = TcpStream::connect(addr).unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    // idle: the server must hang up on its own
    let mut buf = [0u8; 16];
    let n = conn.read(&mut buf).unwrap_or(0);
    let elapsed = started.elapsed();
    assert_eq!(n, 0, "expected a clean server-side close");
    assert!(elapsed >= Duration::from_millis(900), "closed too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(2500), "closed too late: {elapsed:?}");

    wait_until("timeout close recorded", || {
        stats.timeout_closes.load(Ordering::SeqCst) == 1
    });

    server.stop();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_sequential_sessions_reuse_preallocated_handlers() {
    let (server, stats, sessions) = echo_server(
        ServerConfig::development(),
        PoolConfig {
            preallocated_sessions: 2,
            read_buffer_size: 256,
            ..Default::default()
        },
    );
    let (handle, addr) = start_server(&server);

    for round in 0..8u8 {
        let mut conn = TcpStream::connect(addr).unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        conn.write_all(&[round; 16]).unwrap();
        let mut echoed = [0u8; 16];
        conn.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, [round; 16]);
        drop(conn);
        // one handler always sits checked out awaiting the next accept;
        // the session's own handler must come back before the next round
        wait_until("session recycled", || sessions.load() == 1);
    }

    // one-at-a-time traffic never allocates past the preallocated set
    assert_eq!(sessions.created(), 2);
    assert_eq!(stats.opens(), 8);

    server.stop();
    handle.join().unwrap().unwrap();
}

/// Transport that records the `TCP_NODELAY` state of every stream it sees,
/// after the server's socket options have been applied.
struct NodelayProbe {
    observed: Arc<Mutex<Option<bool>>>,
}

#[async_trait::async_trait]
impl Transport for NodelayProbe {
    async fn accept(&self, stream: tokio::net::TcpStream) -> std::io::Result<BoxedStream> {
        *self.observed.lock().unwrap() = Some(stream.nodelay()?);
        Ok(Box::new(stream))
    }

    async fn connect(&self, stream: tokio::net::TcpStream) -> std::io::Result<BoxedStream> {
        *self.observed.lock().unwrap() = Some(stream.nodelay()?);
        Ok(Box::new(stream))
    }
}

#[test]
fn test_nodelay_applied_to_accepted_socket() {
    let observed = Arc::new(Mutex::new(None));
    let (server, stats, _sessions) = echo_server_with_transport(
        ServerConfig {
            nodelay: true,
            ..ServerConfig::development()
        },
        PoolConfig {
            preallocated_sessions: 2,
            read_buffer_size: 256,
            ..Default::default()
        },
        Arc::new(NodelayProbe {
            observed: observed.clone(),
        }),
    );
    let (handle, addr) = start_server(&server);

    let mut conn = TcpStream::connect(addr).unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    conn.write_all(b"ping").unwrap();
    let mut echoed = [0u8; 4];
    conn.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"ping");

    // by the time the transport hook ran, the option was already set
    assert_eq!(*observed.lock().unwrap(), Some(true));

    drop(conn);
    wait_until("session close", || stats.closes() == 1);
    server.stop();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_run_and_stop_without_traffic() {
    let (server, _stats, sessions) =
        echo_server(ServerConfig::development(), PoolConfig::default());
    let (handle, _addr) = start_server(&server);

    std::thread::sleep(Duration::from_millis(50));
    server.stop();
    handle.join().unwrap().unwrap();
    // the pending-accept checkout was recycled on shutdown
    assert_eq!(sessions.load(), 0);
}

#[test]
fn test_graceful_stop_closes_live_sessions() {
    let (server, stats, sessions) = echo_server(
        ServerConfig::default(),
        PoolConfig {
            preallocated_sessions: 8,
            read_buffer_size: 256,
            ..Default::default()
        },
    );
    let (handle, addr) = start_server(&server);

    // connections that have echoed once and now sit idle with the server
    let conns: Vec<_> = (0..10u8)
        .map(|i| {
            let mut conn = TcpStream::connect(addr).unwrap();
            conn.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            conn.write_all(&[i; 32]).unwrap();
            let mut echoed = [0u8; 32];
            conn.read_exact(&mut echoed).unwrap();
            conn
        })
        .collect();
    wait_until("all sessions open", || stats.opens() == 10);

    server.stop();
    handle.join().unwrap().unwrap();

    // every open observed a close and every handler went back to the pool
    assert_eq!(stats.closes(), 10);
    assert_eq!(sessions.load(), 0);

    // clients see the server hang up
    for mut conn in conns {
        let mut buf = [0u8; 1];
        let n = conn.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0);
    }
}
