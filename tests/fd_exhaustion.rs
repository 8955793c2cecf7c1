//! Lowers RLIMIT_NOFILE for the whole process, so it lives in its own test
//! binary with a single test.

mod common;

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::Duration;

use common::{base_loop, start_server, wait_until};
use mill_reactor::net::tcp::{ConnectionHandler, TcpConnectionPtr, TcpServer, TcpServerConfig};
use mill_reactor::Buffer;
use socket2::{Domain, Protocol, Socket, Type};

struct Echo;

impl ConnectionHandler for Echo {
    fn on_message(&self, conn: &TcpConnectionPtr, buf: &mut Buffer, _: std::time::Instant) {
        conn.send_buffer(buf);
    }
}

fn nofile_limit() -> libc::rlimit {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid out-pointer for the call.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    assert_eq!(rc, 0, "getrlimit: {}", io::Error::last_os_error());
    limit
}

fn set_nofile_limit(limit: &libc::rlimit) {
    // SAFETY: `limit` points to a valid rlimit.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, limit) };
    assert_eq!(rc, 0, "setrlimit: {}", io::Error::last_os_error());
}

/// Lowest descriptor number the process would get next.
fn next_free_fd() -> libc::rlim_t {
    let file = File::open("/dev/null").unwrap();
    file.as_raw_fd() as libc::rlim_t
}

enum Outcome {
    Served,
    Rejected,
}

/// Connects a socket created before the limit was lowered and reports
/// whether the server echoes or drops it.
fn try_session(socket: Socket, addr: SocketAddr) -> (Outcome, TcpStream) {
    socket.connect(&addr.into()).unwrap();
    let mut stream = TcpStream::from(socket);
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    // The handshake completes in the backlog even when accept cannot run.
    let _ = stream.write_all(b"ping");
    let mut reply = [0u8; 4];
    let outcome = match stream.read(&mut reply) {
        Ok(0) => Outcome::Rejected,
        Err(e) if e.kind() == ErrorKind::ConnectionReset => Outcome::Rejected,
        Ok(n) => {
            stream.read_exact(&mut reply[n..]).unwrap();
            assert_eq!(&reply, b"ping");
            Outcome::Served
        }
        Err(e) => panic!("no answer from server: {e}"),
    };
    (outcome, stream)
}

#[test]
fn test_accept_survives_descriptor_exhaustion() {
    let (thread, base) = base_loop("server-emfile");
    let config = TcpServerConfig::builder()
        .name("emfile")
        .address("127.0.0.1:0".parse().unwrap())
        .io_threads(0)
        .build();
    let server = TcpServer::new(&base, config, Echo).unwrap();
    start_server(&server);
    let addr = server.local_addr();

    // Client sockets need descriptors too, so they are all made up front.
    let mut spare: Vec<Socket> = (0..16)
        .map(|_| Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap())
        .collect();

    let original = nofile_limit();
    let lowered = libc::rlimit {
        rlim_cur: next_free_fd() + 2,
        rlim_max: original.rlim_max,
    };
    set_nofile_limit(&lowered);

    let mut served = Vec::new();
    let mut rejected = None;
    while rejected.is_none() {
        let socket = spare.pop().expect("ran out of clients before accept failed");
        match try_session(socket, addr) {
            (Outcome::Served, stream) => served.push(stream),
            (Outcome::Rejected, stream) => rejected = Some(stream),
        }
        assert!(!spare.is_empty(), "accept never ran out of descriptors");
    }
    assert!(!served.is_empty());
    assert_eq!(server.connection_count(), served.len());

    // An idle loop stays parked in poll instead of spinning on the listener.
    let before = base.iteration();
    thread::sleep(Duration::from_millis(200));
    assert!(base.iteration() - before < 20);

    // Served peers keep working while the table is full.
    let mut first = served.remove(0);
    first.write_all(b"live").unwrap();
    let mut reply = [0u8; 4];
    first.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"live");

    // Freeing one descriptor lets the next peer in.
    let count = server.connection_count();
    drop(first);
    assert!(wait_until(|| server.connection_count() == count - 1));
    thread::sleep(Duration::from_millis(100));
    let (outcome, late) = try_session(spare.pop().unwrap(), addr);
    assert!(matches!(outcome, Outcome::Served));
    assert!(wait_until(|| server.connection_count() == count));

    set_nofile_limit(&original);
    drop(late);
    drop(served);
    drop(rejected);
    drop(spare);
    drop(server);
    drop(thread);
}
