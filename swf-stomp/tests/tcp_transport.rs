//! Integration tests for the TCP transport against a scripted in-process broker.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use std::time::Duration;
use swf_stomp::frame::{self, headers};
use swf_stomp::{
    AckMode, BusError, Command, ConnectParams, Decoded, EventSink, Frame, HeartBeat,
    SessionEvent, StompTransport, SubscribeRequest, Transport, TransportEvent,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn params(port: u16) -> ConnectParams {
    ConnectParams {
        host: "127.0.0.1".to_owned(),
        port,
        vhost: "localhost".to_owned(),
        login: "admin".to_owned(),
        passcode: "secret".to_owned(),
        client_id: "test-agent-7".to_owned(),
        heart_beat: HeartBeat::new(0, 0),
        connect_timeout: Duration::from_secs(2),
        tls: None,
    }
}

async fn read_frame(sock: &mut TcpStream, buf: &mut BytesMut) -> Option<Frame> {
    loop {
        while let Some(item) = frame::decode(buf).expect("valid client frame") {
            if let Decoded::Frame(frame) = item {
                return Some(frame);
            }
        }
        if sock.read_buf(buf).await.expect("read") == 0 {
            return None;
        }
    }
}

async fn accept_session(listener: &TcpListener, reply: Frame) -> (TcpStream, BytesMut, Frame) {
    let (mut sock, _) = listener.accept().await.expect("accept");
    let mut buf = BytesMut::new();
    let connect = read_frame(&mut sock, &mut buf).await.expect("CONNECT");
    sock.write_all(&reply.to_bytes()).await.expect("write reply");
    (sock, buf, connect)
}

fn connected() -> Frame {
    Frame::new(Command::Connected)
        .with_header(headers::VERSION, "1.2")
        .with_header(headers::HEART_BEAT, "0,0")
        .with_header(headers::SERVER, "ActiveMQ/6.1.0")
}

async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}

#[tokio::test]
async fn connect_sends_credentials_and_reports_connected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let broker = tokio::spawn(async move { accept_session(&listener, connected()).await });

    let (tx, mut rx) = mpsc::channel(16);
    let mut transport = StompTransport::new();
    transport
        .connect(&params(port), EventSink::new(3, tx))
        .await
        .expect("connect");

    let (_sock, _buf, connect) = broker.await.unwrap();
    assert_eq!(connect.command, Command::Connect);
    assert_eq!(connect.header(headers::LOGIN), Some("admin"));
    assert_eq!(connect.header(headers::PASSCODE), Some("secret"));
    assert_eq!(connect.header(headers::CLIENT_ID), Some("test-agent-7"));
    assert_eq!(connect.header(headers::ACCEPT_VERSION), Some("1.1,1.2"));

    let event = next_event(&mut rx).await;
    assert_eq!(event.session, 3);
    assert!(matches!(event.event, TransportEvent::Connected(_)));
    assert!(transport.is_connected());
    assert_eq!(transport.negotiated_version(), Some("1.2"));
}

#[tokio::test]
async fn error_reply_is_a_rejection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let reply = Frame::new(Command::Error)
        .with_header(headers::MESSAGE, "User name [admin] or password is invalid.")
        .with_body("Authentication failed");
    let broker = tokio::spawn(async move { accept_session(&listener, reply).await });

    let (tx, _rx) = mpsc::channel(16);
    let mut transport = StompTransport::new();
    let err = transport
        .connect(&params(port), EventSink::new(1, tx))
        .await
        .expect_err("rejected");
    broker.await.unwrap();

    assert!(matches!(err, BusError::Rejected(_)), "{err}");
    assert!(err.to_string().contains("password is invalid"));
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn connect_to_closed_port_fails_as_connection_loss() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (tx, _rx) = mpsc::channel(16);
    let mut transport = StompTransport::new();
    let err = transport
        .connect(&params(port), EventSink::new(1, tx))
        .await
        .expect_err("nothing listening");
    assert!(err.is_connection_loss(), "{err}");
}

#[tokio::test]
async fn subscribe_send_and_receive_message() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let (mut sock, mut buf, _) = accept_session(&listener, connected()).await;
        let subscribe = read_frame(&mut sock, &mut buf).await.expect("SUBSCRIBE");
        let send = read_frame(&mut sock, &mut buf).await.expect("SEND");

        let message = Frame::new(Command::Message)
            .with_header(headers::SUBSCRIPTION, "1")
            .with_header(headers::MESSAGE_ID, "ID:broker-1:1:1:1:1")
            .with_header(headers::DESTINATION, "/queue/work")
            .with_header("ack", "ID:broker-1:1")
            .with_body(r#"{"msg_type":"run_imminent"}"#);
        // heart-beat EOLs between frames must be skipped
        sock.write_all(b"\n\n").await.unwrap();
        sock.write_all(&message.to_bytes()).await.unwrap();

        let ack = read_frame(&mut sock, &mut buf).await.expect("ACK");
        (subscribe, send, ack)
    });

    let (tx, mut rx) = mpsc::channel(16);
    let mut transport = StompTransport::new();
    transport
        .connect(&params(port), EventSink::new(1, tx))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut rx).await.event,
        TransportEvent::Connected(_)
    ));

    let request = SubscribeRequest {
        id: 1,
        destination: "/queue/work".to_owned(),
        ack: AckMode::ClientIndividual,
        prefetch: 1,
        selector: Some("task_id = 'a'".to_owned()),
    };
    transport.subscribe(&request).await.unwrap();
    transport
        .send(
            "/topic/epictopic",
            br#"{"msg_type":"data_ready"}"#,
            &[("persistent".to_owned(), "true".to_owned())],
        )
        .await
        .unwrap();

    let event = next_event(&mut rx).await;
    let TransportEvent::Message(frame) = event.event else {
        panic!("expected MESSAGE, got {:?}", event.event);
    };
    assert_eq!(frame.header(headers::SUBSCRIPTION), Some("1"));
    assert_eq!(frame.body_text(), r#"{"msg_type":"run_imminent"}"#);

    transport.ack("ID:broker-1:1", 1).await.unwrap();

    let (subscribe, send, ack) = timeout(WAIT, broker).await.unwrap().unwrap();
    assert_eq!(subscribe.header(headers::ACK), Some("client-individual"));
    assert_eq!(subscribe.header(headers::PREFETCH_SIZE), Some("1"));
    assert_eq!(subscribe.header(headers::SELECTOR), Some("task_id = 'a'"));
    assert_eq!(send.header(headers::DESTINATION), Some("/topic/epictopic"));
    assert_eq!(send.header("persistent"), Some("true"));
    assert_eq!(ack.command, Command::Ack);
    assert_eq!(ack.header(headers::ID), Some("ID:broker-1:1"));
    assert_eq!(ack.header(headers::SUBSCRIPTION), Some("1"));
}

#[tokio::test]
async fn broker_eof_emits_disconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let broker = tokio::spawn(async move {
        let (sock, _, _) = accept_session(&listener, connected()).await;
        drop(sock);
    });

    let (tx, mut rx) = mpsc::channel(16);
    let mut transport = StompTransport::new();
    transport
        .connect(&params(port), EventSink::new(9, tx))
        .await
        .unwrap();
    broker.await.unwrap();

    assert!(matches!(
        next_event(&mut rx).await.event,
        TransportEvent::Connected(_)
    ));
    let event = next_event(&mut rx).await;
    assert_eq!(event.session, 9);
    assert!(matches!(event.event, TransportEvent::Disconnected));
    assert!(!transport.is_connected());

    let err = transport
        .send("/queue/x", b"{}", &[])
        .await
        .expect_err("session is gone");
    assert!(err.is_connection_loss());
}

#[tokio::test]
async fn disconnect_without_session_is_ok() {
    let mut transport = StompTransport::new();
    assert!(transport.disconnect().await.is_ok());
    assert!(matches!(
        transport.send("/queue/x", b"{}", &[]).await,
        Err(BusError::NotConnected)
    ));
}

#[tokio::test]
async fn disconnect_waits_for_the_broker_receipt() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let broker = tokio::spawn(async move {
        let (mut sock, mut buf, _) = accept_session(&listener, connected()).await;
        let disconnect = read_frame(&mut sock, &mut buf).await.expect("DISCONNECT");
        let receipt_id = disconnect
            .header(headers::RECEIPT)
            .expect("receipt requested")
            .to_owned();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let receipt =
            Frame::new(Command::Receipt).with_header(headers::RECEIPT_ID, receipt_id);
        sock.write_all(&receipt.to_bytes()).await.unwrap();
        // keep the socket open until the client closes it
        let _ = read_frame(&mut sock, &mut buf).await;
        disconnect
    });

    let (tx, _rx) = mpsc::channel(16);
    let mut transport = StompTransport::new();
    transport
        .connect(&params(port), EventSink::new(1, tx))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    transport.disconnect().await.expect("clean disconnect");
    let waited = started.elapsed();

    assert!(waited >= Duration::from_millis(150), "returned after {waited:?}");
    assert!(waited < Duration::from_secs(2), "timed out instead: {waited:?}");
    assert!(!transport.is_connected());

    let disconnect = timeout(WAIT, broker).await.unwrap().unwrap();
    assert_eq!(disconnect.command, Command::Disconnect);
}
