//! Decoder behavior over real TCP connections.
//!
//! These exercise the framing guarantees that matter on a live socket:
//! responses that arrive back-to-back in one kernel buffer, bodies that are
//! still streaming, and servers that simply never close.

use servtest::decoder::{ResponseDecoder, ResponseFraming};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Spawn a one-shot server running `script` against the accepted
/// connection, and hand back the client side.
fn with_server<F>(script: F) -> (TcpStream, JoinHandle<()>)
where
    F: FnOnce(&mut TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        script(&mut stream);
    });
    let client = TcpStream::connect(addr).expect("connect");
    (client, handle)
}

#[test]
fn back_to_back_responses_do_not_bleed_into_each_other() {
    // Both responses land in one write; the decoder must stop exactly at
    // each fixed-length boundary.
    let (mut client, server) = with_server(|stream| {
        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nfirst\
                  HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecond",
            )
            .unwrap();
    });

    let decoder = ResponseDecoder::default();
    let first = decoder.decode(&mut client).unwrap().unwrap();
    let second = decoder.decode(&mut client).unwrap().unwrap();
    assert_eq!(&first.body[..], b"first");
    assert_eq!(&second.body[..], b"second");
    server.join().unwrap();
}

#[test]
fn sentinel_byte_after_fixed_body_stays_in_the_socket() {
    let (mut client, server) = with_server(|stream| {
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhelloZ")
            .unwrap();
    });

    let resp = ResponseDecoder::default().decode(&mut client).unwrap().unwrap();
    assert_eq!(&resp.body[..], b"hello");

    let mut sentinel = [0u8; 1];
    client.read_exact(&mut sentinel).unwrap();
    assert_eq!(&sentinel, b"Z");
    server.join().unwrap();
}

#[test]
fn close_delimited_read_is_bounded_by_the_socket_timeout() {
    // The server sends an unframed body and then goes quiet without
    // closing. The caller's read timeout must end the body.
    let (mut client, server) = with_server(|stream| {
        stream
            .write_all(b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\npartial")
            .unwrap();
        thread::sleep(Duration::from_secs(3));
    });

    client
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let start = Instant::now();
    let resp = ResponseDecoder::default().decode(&mut client).unwrap().unwrap();
    assert_eq!(resp.framing, ResponseFraming::CloseDelimited);
    assert_eq!(&resp.body[..], b"partial");
    assert!(start.elapsed() < Duration::from_secs(2));
    drop(client);
    server.join().unwrap();
}

#[test]
fn incomplete_input_then_valid_request_does_not_desync() {
    // Mirrors a correct server: it answers only once a full request
    // arrived, so the bare CRLF must produce silence, and the following
    // well-formed request must still get its response.
    let (mut client, server) = with_server(|stream| {
        let mut received = Vec::new();
        let mut scratch = [0u8; 256];
        while !received.ends_with(b"\r\n\r\n") || received.len() <= 4 {
            let n = stream.read(&mut scratch).unwrap();
            if n == 0 {
                return;
            }
            received.extend_from_slice(&scratch[..n]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .unwrap();
    });

    client.write_all(b"\r\n").unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut byte = [0u8; 1];
    let err = client.read(&mut byte).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));

    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    client
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let resp = ResponseDecoder::default().decode(&mut client).unwrap().unwrap();
    assert_eq!(resp.status_code(), Some(200));
    assert_eq!(&resp.body[..], b"ok");
    server.join().unwrap();
}

#[test]
fn chunked_body_streamed_in_pieces_then_connection_reused() {
    let (mut client, server) = with_server(|stream| {
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap();
        for i in 0..3u8 {
            let payload = format!("chunk-{i}\n");
            stream
                .write_all(format!("{:x}\r\n{payload}\r\n", payload.len()).as_bytes())
                .unwrap();
            thread::sleep(Duration::from_millis(50));
        }
        stream.write_all(b"0\r\n\r\n").unwrap();
        // Second exchange on the same connection.
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nstatic")
            .unwrap();
    });

    let decoder = ResponseDecoder::default();
    let first = decoder.decode(&mut client).unwrap().unwrap();
    assert_eq!(first.framing, ResponseFraming::Chunked);
    assert_eq!(&first.body[..], b"chunk-0\nchunk-1\nchunk-2\n");

    let second = decoder.decode(&mut client).unwrap().unwrap();
    assert_eq!(&second.body[..], b"static");
    server.join().unwrap();
}
