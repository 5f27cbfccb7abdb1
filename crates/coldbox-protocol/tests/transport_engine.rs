//! ---
//! cbx_section: "15-testing"
//! cbx_subsection: "integration-tests"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Transport behaviour against scripted TCP peers."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::time::Duration;

use bytes::Bytes;
use coldbox_protocol::{
    ConnectionState, Frame, LinkError, PendingTable, ProtocolError, Request, Response,
    TcpTransport, TransportError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

const TIMEOUT: Duration = Duration::from_millis(300);

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    (listener, port)
}

async fn read_frame(socket: &mut TcpStream) -> Frame {
    let mut header = [0u8; 6];
    socket.read_exact(&mut header).await.expect("header");
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut rest = vec![0u8; length];
    socket.read_exact(&mut rest).await.expect("body");
    let mut bytes = header.to_vec();
    bytes.extend_from_slice(&rest);
    Frame::decode(&bytes).expect("valid request frame")
}

/// Answer a holding-register read with every register set to its address.
fn echo_address(request: &Frame) -> Frame {
    match Request::decode(&request.pdu).expect("request pdu") {
        Request::ReadHoldingRegisters { address, quantity } => Frame::new(
            request.transaction_id,
            request.unit_id,
            Response::ReadHoldingRegisters(vec![address; quantity as usize]).encode(),
        ),
        other => panic!("unexpected request {:?}", other),
    }
}

fn read(address: u16) -> Request {
    Request::ReadHoldingRegisters {
        address,
        quantity: 1,
    }
}

async fn connected(port: u16) -> TcpTransport {
    let transport = TcpTransport::new(TIMEOUT);
    transport
        .connect("127.0.0.1", port, Duration::from_secs(1))
        .await
        .expect("connect");
    transport
}

#[tokio::test]
async fn fragmented_response_is_reassembled() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_frame(&mut socket).await;
        for byte in echo_address(&request).to_bytes().iter() {
            socket.write_all(&[*byte]).await.unwrap();
            socket.flush().await.unwrap();
            sleep(Duration::from_millis(2)).await;
        }
        sleep(Duration::from_secs(1)).await;
    });

    let transport = connected(port).await;
    let response = transport.call(1, &read(224)).await.expect("response");
    assert_eq!(response.registers().unwrap(), &[224]);
}

#[tokio::test]
async fn concurrent_requests_are_matched_by_transaction_id() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let first = read_frame(&mut socket).await;
        let second = read_frame(&mut socket).await;
        let mut coalesced = echo_address(&second).to_bytes().to_vec();
        coalesced.extend_from_slice(&echo_address(&first).to_bytes());
        socket.write_all(&coalesced).await.unwrap();
        sleep(Duration::from_secs(1)).await;
    });

    let transport = connected(port).await;
    let (req_a, req_b) = (read(100), read(95));
    let (a, b) = tokio::join!(transport.call(1, &req_a), transport.call(1, &req_b));
    assert_eq!(a.unwrap().registers().unwrap(), &[100]);
    assert_eq!(b.unwrap().registers().unwrap(), &[95]);
    assert_eq!(transport.pending_len(), 0);
}

#[tokio::test]
async fn late_response_is_discarded_after_timeout() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let stale = read_frame(&mut socket).await;
        let fresh = read_frame(&mut socket).await;
        socket.write_all(&echo_address(&stale).to_bytes()).await.unwrap();
        socket.write_all(&echo_address(&fresh).to_bytes()).await.unwrap();
        sleep(Duration::from_secs(1)).await;
    });

    let transport = connected(port).await;
    let err = transport.call(1, &read(1)).await.unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {err:?}");
    assert_eq!(transport.pending_len(), 0);

    let response = transport.call(1, &read(2)).await.expect("fresh response");
    assert_eq!(response.registers().unwrap(), &[2]);
    assert!(transport.is_connected());
}

#[tokio::test]
async fn disconnect_fails_pending_requests() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = read_frame(&mut socket).await;
        sleep(Duration::from_secs(2)).await;
    });

    let transport = TcpTransport::new(Duration::from_secs(5));
    transport
        .connect("127.0.0.1", port, Duration::from_secs(1))
        .await
        .unwrap();
    let caller = transport.clone();
    let pending = tokio::spawn(async move { caller.call(1, &read(7)).await });

    timeout(Duration::from_secs(1), async {
        while transport.pending_len() == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("request registered");

    transport.disconnect().await;
    assert_eq!(transport.pending_len(), 0);
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, LinkError::Transport(TransportError::Disconnected));
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn peer_close_is_observed() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        sleep(Duration::from_millis(50)).await;
        drop(socket);
    });

    let transport = connected(port).await;
    let mut states = transport.subscribe();
    timeout(Duration::from_secs(2), async {
        while *states.borrow_and_update() != ConnectionState::Disconnected {
            states.changed().await.unwrap();
        }
    })
    .await
    .expect("disconnect observed");

    let err = transport.call(1, &read(1)).await.unwrap_err();
    assert_eq!(err, LinkError::Transport(TransportError::NotConnected));
}

#[tokio::test]
async fn malformed_frame_fails_only_its_request() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let first = read_frame(&mut socket).await;
        let mut bad = echo_address(&first);
        bad.protocol_id = 7;
        socket.write_all(&bad.to_bytes()).await.unwrap();
        let second = read_frame(&mut socket).await;
        socket.write_all(&echo_address(&second).to_bytes()).await.unwrap();
        sleep(Duration::from_secs(1)).await;
    });

    let transport = connected(port).await;
    let err = transport.call(1, &read(3)).await.unwrap_err();
    assert!(matches!(
        err,
        LinkError::Protocol(ProtocolError::BadProtocolId { protocol_id: 7, .. })
    ));
    assert!(transport.is_connected());
    let response = transport.call(1, &read(4)).await.unwrap();
    assert_eq!(response.registers().unwrap(), &[4]);
}

#[tokio::test]
async fn transaction_ids_wrap_on_the_wire() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..2 {
            let request = read_frame(&mut socket).await;
            seen.push(request.transaction_id);
            socket.write_all(&echo_address(&request).to_bytes()).await.unwrap();
        }
        seen
    });

    let transport = TcpTransport::with_pending(TIMEOUT, PendingTable::starting_at(0xFFFF));
    transport
        .connect("127.0.0.1", port, Duration::from_secs(1))
        .await
        .unwrap();
    transport.call(1, &read(1)).await.unwrap();
    transport.call(1, &read(2)).await.unwrap();
    assert_eq!(server.await.unwrap(), vec![0xFFFF, 0x0000]);
}

#[tokio::test]
async fn device_exception_is_surfaced() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_frame(&mut socket).await;
        let reply = Frame::new(request.transaction_id, request.unit_id, Bytes::from_static(&[0x83, 0x02]));
        socket.write_all(&reply.to_bytes()).await.unwrap();
        sleep(Duration::from_secs(1)).await;
    });

    let transport = connected(port).await;
    let err = transport.call(1, &read(105)).await.unwrap_err();
    assert!(err.device_exception().is_some());
    assert!(transport.is_connected());
}

#[tokio::test]
async fn requests_before_connect_are_rejected() {
    let transport = TcpTransport::new(TIMEOUT);
    let err = transport.call(1, &read(1)).await.unwrap_err();
    assert_eq!(err, LinkError::Transport(TransportError::NotConnected));
}

#[tokio::test]
async fn refused_connection_reports_failure() {
    let (listener, port) = listener().await;
    drop(listener);
    let transport = TcpTransport::new(TIMEOUT);
    let err = transport
        .connect("127.0.0.1", port, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectRefused(_)), "got {err:?}");
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}
