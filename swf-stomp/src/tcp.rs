//! STOMP over TCP, optionally wrapped in TLS
//!
//! One [`StompTransport`] holds at most one session. Each session runs a
//! reader task that decodes inbound frames into the [`EventSink`] and, when
//! heart-beats were negotiated, a writer task that emits an EOL every send
//! interval. The reader declares the session lost after twice the negotiated
//! receive interval without any inbound byte. DISCONNECT carries a receipt
//! and waits briefly for the broker to confirm it before the socket closes.

use crate::error::{BusError, Result};
use crate::frame::{self, Command, Decoded, Frame, HeartBeat, headers};
use crate::transport::{ConnectParams, EventSink, SubscribeRequest, Transport, TransportEvent};
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Grace factor applied to the broker's promised heart-beat interval
const RECEIVE_GRACE_FACTOR: u32 = 2;

/// How long DISCONNECT waits for the broker's RECEIPT
const DISCONNECT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Byte stream to the broker, plain or TLS
trait BrokerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BrokerStream for T {}

type Stream = Box<dyn BrokerStream>;
type Writer = Arc<Mutex<WriteHalf<Stream>>>;

/// Receipt id awaited by DISCONNECT and the channel that reports it
type PendingReceipt = Arc<StdMutex<Option<(String, oneshot::Sender<()>)>>>;

/// Live session state
struct Session {
    writer: Writer,
    alive: Arc<AtomicBool>,
    receipt: PendingReceipt,
    reader_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
    version: String,
}

impl Session {
    fn abort_tasks(&self) {
        self.reader_task.abort();
        if let Some(ref task) = self.heartbeat_task {
            task.abort();
        }
    }
}

/// TCP transport speaking STOMP 1.1/1.2
#[derive(Default)]
pub struct StompTransport {
    session: Option<Session>,
    receipt_counter: u64,
}

impl StompTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protocol version agreed with the broker, if connected
    pub fn negotiated_version(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.version.as_str())
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let session = self
            .session
            .as_ref()
            .filter(|s| s.alive.load(Ordering::SeqCst))
            .ok_or(BusError::NotConnected)?;

        let bytes = frame.to_bytes();
        let mut writer = session.writer.lock().await;
        let written = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            session.alive.store(false, Ordering::SeqCst);
            return Err(BusError::transport(format!(
                "Connection lost while writing {} frame: {e}",
                frame.command
            )));
        }
        trace!(command = %frame.command, bytes = bytes.len(), "Frame written");
        Ok(())
    }
}

#[async_trait]
impl Transport for StompTransport {
    async fn connect(&mut self, params: &ConnectParams, sink: EventSink) -> Result<()> {
        if self.is_connected() {
            return Err(BusError::transport(
                "Connection already open; disconnect first",
            ));
        }
        if let Some(stale) = self.session.take() {
            stale.abort_tasks();
        }

        let address = params.address();
        debug!(address = %address, session = sink.session(), "Opening broker connection");

        let handshake = async {
            let tcp = TcpStream::connect(&address).await.map_err(|e| {
                BusError::transport(format!("Connection to {address} failed: {e}"))
            })?;
            tcp.set_nodelay(true)?;
            let mut stream: Stream = match &params.tls {
                Some(tls) => {
                    let stream = tls.wrap(&params.host, tcp).await?;
                    debug!(address = %address, "SSL session established");
                    Box::new(stream)
                }
                None => Box::new(tcp),
            };

            let connect = Frame::connect(
                &params.vhost,
                &params.login,
                &params.passcode,
                &params.client_id,
                params.heart_beat,
            );
            stream.write_all(&connect.to_bytes()).await?;
            stream.flush().await?;

            let mut buf = BytesMut::with_capacity(4096);
            let reply = read_frame(&mut stream, &mut buf).await?;
            Ok::<_, BusError>((stream, buf, reply))
        };

        let (stream, buf, reply) = tokio::time::timeout(params.connect_timeout, handshake)
            .await
            .map_err(|_| {
                BusError::timeout(format!(
                    "Connection to {address} not established within {:?}",
                    params.connect_timeout
                ))
            })??;

        match reply.command {
            Command::Connected => {}
            Command::Error => {
                let message = reply.header(headers::MESSAGE).unwrap_or("no message");
                return Err(BusError::Rejected(format!(
                    "{message}: {}",
                    reply.body_text().trim()
                )));
            }
            other => {
                return Err(BusError::protocol(format!(
                    "Expected CONNECTED, broker answered {other}"
                )));
            }
        }

        let server_beat = reply
            .header(headers::HEART_BEAT)
            .map(str::parse::<HeartBeat>)
            .transpose()?
            .unwrap_or_default();
        let negotiated = params.heart_beat.negotiate(server_beat);
        let version = reply.header(headers::VERSION).unwrap_or("1.0").to_owned();

        info!(
            address = %address,
            version = %version,
            server = reply.header(headers::SERVER).unwrap_or("unknown"),
            heart_beat = %negotiated,
            ssl = params.tls.is_some(),
            "Broker connection established"
        );

        let (reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(writer));
        let alive = Arc::new(AtomicBool::new(true));
        let receipt = PendingReceipt::default();

        sink.emit(TransportEvent::Connected(reply.headers.clone()))
            .await;

        let idle_timeout = (negotiated.receive_ms > 0)
            .then(|| Duration::from_millis(negotiated.receive_ms) * RECEIVE_GRACE_FACTOR);
        let reader_task = tokio::spawn(read_loop(
            reader,
            buf,
            sink.clone(),
            Arc::clone(&alive),
            Arc::clone(&receipt),
            idle_timeout,
        ));

        let heartbeat_task = (negotiated.send_ms > 0).then(|| {
            tokio::spawn(heartbeat_loop(
                Arc::clone(&writer),
                Arc::clone(&alive),
                Duration::from_millis(negotiated.send_ms),
            ))
        });

        self.session = Some(Session {
            writer,
            alive,
            receipt,
            reader_task,
            heartbeat_task,
            version,
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            debug!("Disconnect requested with no open session");
            return Ok(());
        };

        if session.alive.load(Ordering::SeqCst) {
            self.receipt_counter = self.receipt_counter.wrapping_add(1);
            let receipt_id = format!("disconnect-{}", self.receipt_counter);
            let (confirmed_tx, confirmed) = oneshot::channel();
            *session
                .receipt
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some((receipt_id.clone(), confirmed_tx));

            let bytes = Frame::disconnect(&receipt_id).to_bytes();
            let written = {
                let mut writer = session.writer.lock().await;
                async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                }
                .await
            };
            match written {
                Ok(()) => match tokio::time::timeout(DISCONNECT_RECEIPT_TIMEOUT, confirmed).await {
                    Ok(Ok(())) => debug!(receipt = %receipt_id, "Broker confirmed DISCONNECT"),
                    Ok(Err(_)) => debug!(receipt = %receipt_id, "Session ended before RECEIPT"),
                    Err(_) => warn!(
                        receipt = %receipt_id,
                        timeout = ?DISCONNECT_RECEIPT_TIMEOUT,
                        "No RECEIPT for DISCONNECT, closing anyway"
                    ),
                },
                Err(e) => debug!(error = %e, "DISCONNECT frame not delivered"),
            }

            if let Err(e) = session.writer.lock().await.shutdown().await {
                debug!(error = %e, "Socket shutdown failed");
            }
        }
        session.alive.store(false, Ordering::SeqCst);
        session.abort_tasks();
        debug!("Broker session closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.alive.load(Ordering::SeqCst))
    }

    async fn subscribe(&mut self, request: &SubscribeRequest) -> Result<()> {
        self.write_frame(&request.to_frame()).await
    }

    async fn unsubscribe(&mut self, id: u64) -> Result<()> {
        self.write_frame(&Frame::unsubscribe(id)).await
    }

    async fn send(
        &mut self,
        destination: &str,
        body: &[u8],
        headers: &[(String, String)],
    ) -> Result<()> {
        let frame = Frame::send(destination, body.to_vec(), headers);
        self.write_frame(&frame).await
    }

    async fn ack(&mut self, ack_id: &str, subscription: u64) -> Result<()> {
        self.write_frame(&Frame::ack(ack_id, subscription)).await
    }

    async fn nack(&mut self, ack_id: &str, subscription: u64) -> Result<()> {
        self.write_frame(&Frame::nack(ack_id, subscription)).await
    }
}

impl Drop for StompTransport {
    fn drop(&mut self) {
        if let Some(ref session) = self.session {
            session.abort_tasks();
        }
    }
}

/// Read until one complete frame is decoded, skipping heart-beats.
async fn read_frame(stream: &mut Stream, buf: &mut BytesMut) -> Result<Frame> {
    loop {
        while let Some(item) = frame::decode(buf)? {
            if let Decoded::Frame(frame) = item {
                return Ok(frame);
            }
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(BusError::transport(
                "Connection closed by broker (EOF) during handshake",
            ));
        }
    }
}

/// Wake DISCONNECT if `id` is the receipt it waits for.
fn confirm_receipt(pending: &PendingReceipt, id: &str) {
    let mut slot = pending.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.as_ref().is_some_and(|(expected, _)| expected == id)
        && let Some((_, confirmed)) = slot.take()
    {
        if confirmed.send(()).is_err() {
            trace!(receipt = %id, "DISCONNECT stopped waiting for its receipt");
        }
    }
}

async fn read_loop(
    mut reader: ReadHalf<Stream>,
    mut buf: BytesMut,
    sink: EventSink,
    alive: Arc<AtomicBool>,
    receipt: PendingReceipt,
    idle_timeout: Option<Duration>,
) {
    'session: loop {
        loop {
            let frame = match frame::decode(&mut buf) {
                Ok(Some(Decoded::HeartBeat)) => {
                    trace!("Heart-beat from broker");
                    continue;
                }
                Ok(Some(Decoded::Frame(frame))) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Protocol violation from broker, dropping session");
                    break 'session;
                }
            };

            let event = match frame.command {
                Command::Message => TransportEvent::Message(frame),
                Command::Error => TransportEvent::Error(frame),
                Command::Receipt => {
                    let id = frame.header(headers::RECEIPT_ID).unwrap_or_default();
                    confirm_receipt(&receipt, id);
                    TransportEvent::Receipt(id.to_owned())
                }
                other => {
                    debug!(command = %other, "Ignoring unexpected frame from broker");
                    continue;
                }
            };
            if !sink.emit(event).await {
                alive.store(false, Ordering::SeqCst);
                return;
            }
        }

        let read = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, reader.read_buf(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    warn!(timeout = ?limit, "No traffic from broker, treating connection as lost");
                    break;
                }
            },
            None => reader.read_buf(&mut buf).await,
        };

        match read {
            Ok(0) => {
                info!("Broker closed the connection (EOF)");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Read from broker failed");
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    // a DISCONNECT still waiting will not get its receipt now
    receipt.lock().unwrap_or_else(PoisonError::into_inner).take();
    sink.emit(TransportEvent::Disconnected).await;
}

async fn heartbeat_loop(writer: Writer, alive: Arc<AtomicBool>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        if !alive.load(Ordering::SeqCst) {
            break;
        }
        let mut guard = writer.lock().await;
        let written = async {
            guard.write_all(b"\n").await?;
            guard.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(error = %e, "Heart-beat write failed");
            alive.store(false, Ordering::SeqCst);
            break;
        }
        trace!("Heart-beat sent");
    }
}
