//! In-memory transport that records every call
//!
//! Used to drive agent logic without a broker. The [`RecordingHandle`] stays
//! with the test while the transport itself is boxed into the code under test;
//! through the handle a test inspects the call log, injects failures and
//! pushes inbound frames or disconnects into the current session.

use crate::error::{BusError, Result};
use crate::frame::Frame;
use crate::transport::{ConnectParams, EventSink, SubscribeRequest, Transport, TransportEvent};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// One recorded transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect { client_id: String, session: u64 },
    Disconnect,
    Subscribe(SubscribeRequest),
    Unsubscribe(u64),
    Send {
        destination: String,
        body: Vec<u8>,
        headers: Vec<(String, String)>,
    },
    Ack { ack_id: String, subscription: u64 },
    Nack { ack_id: String, subscription: u64 },
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    connected: bool,
    sink: Option<EventSink>,
    failing_connects: usize,
    failing_sends: usize,
    send_failure: String,
    failing_subscriptions: HashSet<String>,
    failing_acks: bool,
}

/// Test-side view of a [`RecordingTransport`]
#[derive(Clone, Default)]
pub struct RecordingHandle {
    state: Arc<Mutex<State>>,
}

impl RecordingHandle {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Forget the recorded calls
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn connect_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Connect { .. }))
    }

    pub fn subscribe_calls(&self) -> Vec<SubscribeRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Subscribe(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn unsubscribe_calls(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Unsubscribe(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Destination and body of every SEND attempt
    pub fn sends(&self) -> Vec<(String, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send {
                    destination, body, ..
                } => Some((destination, body)),
                _ => None,
            })
            .collect()
    }

    pub fn ack_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Ack { .. }))
    }

    pub fn nack_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Nack { .. }))
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Whether the fake broker session is open
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Make the next `n` connect attempts fail
    pub fn fail_next_connects(&self, n: usize) {
        self.lock().failing_connects = n;
    }

    /// Make the next `n` SEND attempts fail with `message`.
    ///
    /// A message that reads as a connection loss also closes the fake session.
    pub fn fail_next_sends(&self, n: usize, message: &str) {
        let mut state = self.lock();
        state.failing_sends = n;
        message.clone_into(&mut state.send_failure);
    }

    /// Make every SUBSCRIBE to `destination` fail
    pub fn fail_subscriptions_to(&self, destination: &str) {
        self.lock()
            .failing_subscriptions
            .insert(destination.to_owned());
    }

    /// Make ACK/NACK calls fail
    pub fn fail_acks(&self, fail: bool) {
        self.lock().failing_acks = fail;
    }

    /// Push a MESSAGE frame into the current session
    pub async fn deliver(&self, frame: Frame) -> bool {
        let sink = self.lock().sink.clone();
        match sink {
            Some(sink) => sink.emit(TransportEvent::Message(frame)).await,
            None => false,
        }
    }

    /// Close the fake session without telling the sink, so the loss is only
    /// discovered by the next call
    pub fn sever(&self) {
        self.lock().connected = false;
    }

    /// Drop the fake session as if the socket died, notifying the sink
    pub async fn drop_connection(&self) {
        let sink = {
            let mut state = self.lock();
            state.connected = false;
            state.sink.clone()
        };
        if let Some(sink) = sink {
            sink.emit(TransportEvent::Disconnected).await;
        }
    }
}

/// [`Transport`] implementation backed by a [`RecordingHandle`]
pub struct RecordingTransport {
    handle: RecordingHandle,
}

impl RecordingTransport {
    /// Create a transport and the handle observing it
    pub fn new() -> (Self, RecordingHandle) {
        let handle = RecordingHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }

    fn record(&self, call: Call) -> MutexGuard<'_, State> {
        let mut state = self.handle.lock();
        state.calls.push(call);
        state
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn connect(&mut self, params: &ConnectParams, sink: EventSink) -> Result<()> {
        {
            let mut state = self.record(Call::Connect {
                client_id: params.client_id.clone(),
                session: sink.session(),
            });
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(BusError::transport(format!(
                    "Connection to {} refused",
                    params.address()
                )));
            }
            state.connected = true;
            state.sink = Some(sink.clone());
        }
        sink.emit(TransportEvent::Connected(vec![(
            "version".to_owned(),
            "1.2".to_owned(),
        )]))
        .await;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = self.record(Call::Disconnect);
        state.connected = false;
        state.sink = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    async fn subscribe(&mut self, request: &SubscribeRequest) -> Result<()> {
        let state = self.record(Call::Subscribe(request.clone()));
        if !state.connected {
            return Err(BusError::NotConnected);
        }
        if state.failing_subscriptions.contains(&request.destination) {
            return Err(BusError::transport(format!(
                "Broker refused subscription to {}",
                request.destination
            )));
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, id: u64) -> Result<()> {
        let state = self.record(Call::Unsubscribe(id));
        if !state.connected {
            return Err(BusError::NotConnected);
        }
        Ok(())
    }

    async fn send(
        &mut self,
        destination: &str,
        body: &[u8],
        headers: &[(String, String)],
    ) -> Result<()> {
        let mut state = self.record(Call::Send {
            destination: destination.to_owned(),
            body: body.to_vec(),
            headers: headers.to_vec(),
        });
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            let err = BusError::transport(state.send_failure.clone());
            if err.is_connection_loss() {
                state.connected = false;
            }
            return Err(err);
        }
        if !state.connected {
            return Err(BusError::NotConnected);
        }
        Ok(())
    }

    async fn ack(&mut self, ack_id: &str, subscription: u64) -> Result<()> {
        let state = self.record(Call::Ack {
            ack_id: ack_id.to_owned(),
            subscription,
        });
        if state.failing_acks {
            return Err(BusError::transport("ACK rejected"));
        }
        Ok(())
    }

    async fn nack(&mut self, ack_id: &str, subscription: u64) -> Result<()> {
        let state = self.record(Call::Nack {
            ack_id: ack_id.to_owned(),
            subscription,
        });
        if state.failing_acks {
            return Err(BusError::transport("NACK rejected"));
        }
        Ok(())
    }
}
