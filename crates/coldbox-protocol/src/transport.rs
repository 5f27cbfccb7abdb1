//! ---
//! cbx_section: "02-field-protocol"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Persistent TCP link with transaction-id correlation."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
//! The transport owns one socket at a time. Writers serialize on an async mutex while a
//! single reader task drains the socket, reassembles frames and completes the matching
//! entry in the pending table. Requests may therefore be in flight concurrently and are
//! matched purely by transaction id.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::codec::{decode_frame, DecodeError, Frame, Request, Response};
use crate::error::{LinkError, ProtocolError, TransportError};
use crate::pending::{PendingTable, Slot};

const READ_BUFFER_CAPACITY: usize = 1024;

/// Connection lifecycle published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Request/response multiplexer over a single TCP connection.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: watch::Sender<ConnectionState>,
    pending: Mutex<PendingTable>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Mutex<Duration>,
    generation: AtomicU64,
}

impl TcpTransport {
    pub fn new(request_timeout: Duration) -> Self {
        Self::with_pending(request_timeout, PendingTable::new())
    }

    /// Build a transport around a preconfigured pending table.
    pub fn with_pending(request_timeout: Duration, pending: PendingTable) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                state,
                pending: Mutex::new(pending),
                writer: AsyncMutex::new(None),
                reader: Mutex::new(None),
                request_timeout: Mutex::new(request_timeout),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver that observes every lifecycle transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn request_timeout(&self) -> Duration {
        *self.shared.request_timeout.lock()
    }

    pub fn set_request_timeout(&self, timeout: Duration) {
        *self.shared.request_timeout.lock() = timeout;
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Open a connection, replacing any existing one.
    ///
    /// Fails with [`TransportError::AlreadyConnecting`] while another attempt runs.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut busy = false;
        self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                busy = true;
                false
            } else {
                *state = ConnectionState::Connecting;
                true
            }
        });
        if busy {
            return Err(TransportError::AlreadyConnecting);
        }

        self.shared.release(TransportError::Disconnected);
        self.shared.writer.lock().await.take();

        debug!(host, port, timeout_ms = timeout.as_millis() as u64, "opening plc connection");
        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.shared.mark_disconnected_if(ConnectionState::Connecting);
                return Err(match err.kind() {
                    std::io::ErrorKind::ConnectionRefused => {
                        TransportError::ConnectRefused(format!("{}:{}: {}", host, port, err))
                    }
                    _ => TransportError::Io(err.to_string()),
                });
            }
            Err(_) => {
                self.shared.mark_disconnected_if(ConnectionState::Connecting);
                return Err(TransportError::ConnectTimeout(timeout));
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            warn!(error = %err, "unable to disable nagle on plc socket");
        }

        let (read_half, write_half) = stream.into_split();
        *self.shared.writer.lock().await = Some(write_half);
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = tokio::spawn(read_loop(self.shared.clone(), read_half, generation));
        *self.shared.reader.lock() = Some(handle);

        // A disconnect issued during the handshake wins over the new socket.
        let mut cancelled = false;
        self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                cancelled = true;
                false
            }
        });
        if cancelled {
            self.shared.release(TransportError::Disconnected);
            self.shared.writer.lock().await.take();
            return Err(TransportError::Disconnected);
        }
        info!(host, port, "plc connection established");
        Ok(())
    }

    /// Close the connection. Pending requests fail before this returns.
    pub async fn disconnect(&self) {
        let failed = self.shared.release(TransportError::Disconnected);
        self.shared.state.send_replace(ConnectionState::Disconnected);
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        info!(failed_requests = failed, "plc connection closed");
    }

    /// Send a raw PDU and wait for the PDU of the matching response.
    pub async fn request(&self, unit_id: u8, pdu: Bytes) -> Result<Bytes, LinkError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        let timeout = self.request_timeout();
        let (slot, receiver) = self.shared.pending.lock().register(Instant::now())?;
        let guard = AbandonGuard {
            shared: &self.shared,
            slot,
        };

        let frame = Frame::new(slot.transaction_id, unit_id, pdu).to_bytes();
        {
            let mut writer = self.shared.writer.lock().await;
            let stream = writer.as_mut().ok_or(TransportError::NotConnected)?;
            match tokio::time::timeout(timeout, stream.write_all(&frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(TransportError::Io(err.to_string()).into()),
                Err(_) => return Err(TransportError::Timeout(timeout).into()),
            }
        }
        trace!(transaction_id = slot.transaction_id, unit_id, bytes = frame.len(), "request sent");

        let outcome = match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Disconnected.into()),
            Err(_) => {
                debug!(transaction_id = slot.transaction_id, timeout_ms = timeout.as_millis() as u64, "request timed out");
                Err(TransportError::Timeout(timeout).into())
            }
        };
        drop(guard);
        outcome
    }

    /// Encode `request`, send it and decode the typed response.
    pub async fn call(&self, unit_id: u8, request: &Request) -> Result<Response, LinkError> {
        request.validate()?;
        let pdu = self.request(unit_id, request.encode()).await?;
        Response::for_request(request, &pdu)
    }
}

impl Shared {
    /// Detach the current socket: fail pending work and stop the reader.
    fn release(&self, reason: TransportError) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.pending.lock().fail_all(reason)
    }

    fn mark_disconnected_if(&self, expected: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == expected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
    }

    fn dispatch(&self, buffer: &mut BytesMut) {
        loop {
            match decode_frame(buffer) {
                Ok(Some(frame)) => {
                    let transaction_id = frame.transaction_id;
                    if !self.pending.lock().complete(transaction_id, Ok(frame.pdu)) {
                        warn!(
                            transaction_id,
                            error = %ProtocolError::UnmatchedTransaction(transaction_id),
                            "discarding response"
                        );
                    }
                }
                Ok(None) => break,
                Err(DecodeError {
                    transaction_id,
                    error,
                }) => {
                    warn!(?transaction_id, error = %error, "malformed frame from plc");
                    if let Some(id) = transaction_id {
                        self.pending.lock().complete(id, Err(error.into()));
                    }
                }
            }
        }
    }

    async fn connection_lost(&self, generation: u64, reason: TransportError) {
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        warn!(error = %reason, "plc connection lost");
        self.reader.lock().take();
        self.pending.lock().fail_all(reason);
        self.state.send_replace(ConnectionState::Disconnected);
        self.writer.lock().await.take();
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf, generation: u64) {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    let reason = loop {
        match reader.read_buf(&mut buffer).await {
            Ok(0) => break TransportError::ConnectionReset("closed by peer".into()),
            Ok(read) => {
                trace!(bytes = read, buffered = buffer.len(), "plc bytes received");
                shared.dispatch(&mut buffer);
            }
            Err(err) => break TransportError::ConnectionReset(err.to_string()),
        }
    };
    shared.connection_lost(generation, reason).await;
}

/// Drops the pending entry when the waiting side goes away before completion.
struct AbandonGuard<'a> {
    shared: &'a Shared,
    slot: Slot,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().abandon(self.slot);
    }
}
