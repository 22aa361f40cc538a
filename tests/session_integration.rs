//! Loop-back session tests over real TCP sockets: handshake, round trips,
//! shutdown semantics and deadlines, all in self-signed mode.

mod common;

use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use tlslink::{EngineError, Phase, TlsConfig, TlsError, TlsService};

/// Self-signed server/client service pair plus the fixture files backing
/// them (the files must outlive every handshake).
fn service_pair() -> (TlsService, TlsService, Vec<tempfile::NamedTempFile>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let (key, cert) = common::make_self_signed("localhost");
    let bundle = common::write_pem(&[common::cert_pem(&cert), common::key_pem(&key)]);

    let server_config = TlsConfig::self_signed().cert_file(bundle.path()).build();
    let client_config = TlsConfig::self_signed()
        .cert_file(bundle.path())
        .servername("localhost")
        .build();

    (
        TlsService::new(server_config, true),
        TlsService::new(client_config, false),
        vec![bundle],
    )
}

#[test]
fn test_handshake_and_single_byte_round_trip() {
    let (server, client, _files) = service_pair();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut session = server.on_accept(&stream).unwrap();
        assert_eq!(session.phase(), Phase::Established);

        let mut buf = [0u8; 16];
        let n = session.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"x");

        assert_eq!(session.send(b"y").unwrap(), 1);
        session.close().unwrap();
    });

    let stream = TcpStream::connect(addr).unwrap();
    let mut session = client.on_connect(&stream).unwrap();
    assert_eq!(session.phase(), Phase::Established);

    assert_eq!(session.send(b"x").unwrap(), 1);

    let mut buf = [0u8; 16];
    let n = session.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"y");

    session.close().unwrap();
    handle.join().unwrap();
}

#[test]
fn test_round_trip_larger_than_one_record() {
    // Larger than the 16 KiB TLS record size, forcing several internal
    // write/read rounds.
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let (server, client, _files) = service_pair();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut session = server.on_accept(&stream).unwrap();

        let mut received = Vec::with_capacity(expected.len());
        let mut buf = [0u8; 4096];
        while received.len() < expected.len() {
            let n = session.recv(&mut buf).unwrap();
            assert!(n > 0, "peer closed before the payload completed");
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, expected);
        session.send(b"done").unwrap();
    });

    let stream = TcpStream::connect(addr).unwrap();
    let mut session = client.on_connect(&stream).unwrap();

    let mut sent = 0;
    while sent < payload.len() {
        sent += session.send(&payload[sent..]).unwrap();
    }

    let mut buf = [0u8; 16];
    let n = session.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"done");
    handle.join().unwrap();
}

#[test]
fn test_zero_length_send_is_a_noop() {
    let (server, client, _files) = service_pair();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut session = server.on_accept(&stream).unwrap();
        let mut buf = [0u8; 16];
        let n = session.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"after-empty");
    });

    let stream = TcpStream::connect(addr).unwrap();
    let mut session = client.on_connect(&stream).unwrap();

    assert_eq!(session.send(&[]).unwrap(), 0);
    session.send(b"after-empty").unwrap();
    handle.join().unwrap();
}

#[test]
fn test_recv_returns_zero_on_orderly_shutdown() {
    let (server, client, _files) = service_pair();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut session = server.on_accept(&stream).unwrap();

        let mut buf = [0u8; 16];
        let n = session.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"bye");

        // Orderly shutdown: exactly zero, and again zero on a re-read.
        assert_eq!(session.recv(&mut buf).unwrap(), 0);
        assert_eq!(session.recv(&mut buf).unwrap(), 0);
    });

    let stream = TcpStream::connect(addr).unwrap();
    let mut session = client.on_connect(&stream).unwrap();
    session.send(b"bye").unwrap();
    session.close().unwrap();
    handle.join().unwrap();
}

#[test]
fn test_recv_reports_abort_on_connection_reset() {
    let (server, client, _files) = service_pair();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut session = server.on_accept(&stream).unwrap();

        let mut buf = [0u8; 16];
        let n = session.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"go");

        let err = loop {
            match session.recv(&mut buf) {
                Ok(0) => panic!("expected an abort, got orderly shutdown"),
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert!(
            matches!(err, EngineError::ClosedAbort),
            "expected ClosedAbort, got {:?}",
            err
        );
        assert_eq!(session.phase(), Phase::Failed);
    });

    let stream = TcpStream::connect(addr).unwrap();
    let mut session = client.on_connect(&stream).unwrap();

    // Let the server drain everything sent so far before the reset tears
    // down the receive queue.
    session.send(b"go").unwrap();
    thread::sleep(Duration::from_millis(100));

    // Reset the connection under the established session: linger 0 turns
    // the close into an RST instead of an orderly FIN. The session is
    // forgotten, not dropped, so no close notification sneaks out first.
    socket2::SockRef::from(&stream)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    std::mem::forget(session);
    drop(stream);

    handle.join().unwrap();
}

#[test]
fn test_close_twice_is_a_noop() {
    let (server, client, _files) = service_pair();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut session = server.on_accept(&stream).unwrap();
        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(session.phase(), Phase::Closed);
    });

    let stream = TcpStream::connect(addr).unwrap();
    let mut session = client.on_connect(&stream).unwrap();
    session.close().unwrap();
    session.close().unwrap();
    assert_eq!(session.phase(), Phase::Closed);
    handle.join().unwrap();
}

#[test]
fn test_self_signed_server_verify_connection_succeeds() {
    let (server, client, _files) = service_pair();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let session = server.on_accept(&stream).unwrap();
        // No peer material is inspected in self-signed server mode.
        session.verify_connection().unwrap();
    });

    let stream = TcpStream::connect(addr).unwrap();
    let session = client.on_connect(&stream).unwrap();
    assert!(session.negotiated().unwrap().version.contains("TLS"));
    drop(session);
    handle.join().unwrap();
}

#[test]
fn test_handshake_times_out_against_a_silent_peer() {
    let (mut server, _client, _files) = service_pair();
    server.set_timeout(Some(Duration::from_millis(100)));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // A TCP client that never speaks TLS.
    let silent = TcpStream::connect(addr).unwrap();

    let (stream, _) = listener.accept().unwrap();
    let err = server.on_accept(&stream).unwrap_err();
    assert!(
        matches!(err, TlsError::Engine(EngineError::TimedOut)),
        "expected TimedOut, got {:?}",
        err
    );
    drop(silent);
}
