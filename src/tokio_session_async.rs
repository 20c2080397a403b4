//! Asynchronous request/response session on top of a caller-owned transport.
//!
//! The transport (serial port, BLE characteristic, ...) stays outside this
//! crate: the caller opens it, pumps its inbound bytes into
//! [`Session::handle_chunk`] from a single reader task, and hands outbound
//! bytes to it through the [`Transport`] trait. The session correlates
//! commands with responses, enforces one request in flight per connection,
//! and forwards everything it did not ask for (periodic telemetry pushes,
//! framing errors) on a notification channel.
//!
//! # Example
//!
//! ```ignore
//! use jbdbms_lib::tokio_session_async::{Session, Transport};
//! use std::time::Duration;
//!
//! let (session, mut notifications) = Session::new(ble_link);
//! let session = std::sync::Arc::new(session);
//!
//! // single reader task feeds inbound chunks
//! let reader = session.clone();
//! tokio::spawn(async move {
//!     while let Some(chunk) = inbound.recv().await {
//!         reader.handle_chunk(&chunk);
//!     }
//!     reader.transport_closed();
//! });
//!
//! let info = session.read_basic_info(Duration::from_secs(1)).await?;
//! println!("pack voltage: {} mV", info.voltage_mv);
//! let cells = session.read_cell_voltages(Duration::from_secs(1)).await?;
//! println!("cells: {:?} mV", cells.millivolts());
//! ```

use crate::error::{DecodeError, FrameError};
use crate::protocol::{
    encode_command, BasicInfo, CellVoltages, DeviceName, Register, ValidatedFrame,
};
use crate::reassembler::{StreamEvent, StreamReassembler, DEFAULT_FRAME_TIMEOUT};
use std::io;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

/// Errors for a single [`Session::request`] exchange.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// No matching response arrived within the caller's deadline.
    #[error("timed out waiting for a matching response")]
    Timeout,
    /// The transport signalled closure; the session is finished.
    #[error("transport closed")]
    TransportClosed,
    /// The request was cancelled via [`Session::cancel_pending`].
    #[error("request cancelled")]
    Cancelled,
    /// Error indicating that `read_basic_info()` must be called before
    /// methods that rely on the reported cell count.
    #[error("read_basic_info() has to be called at least once before")]
    BasicInfoRequired,
    /// The response frame was well-formed but its payload was not.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    /// The transport failed to accept the outbound command.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

/// Outbound half of the byte-oriented duplex channel to the pack.
///
/// Implementations wrap whatever link the caller manages: a serial writer, a
/// BLE write-without-response characteristic, a test double. Inbound bytes do
/// not come through this trait; the caller pushes them into
/// [`Session::handle_chunk`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, bytes: &[u8]) -> io::Result<()>;
}

/// Out-of-band events the session did not request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A frame nobody was waiting for; packs push these periodically.
    Frame(ValidatedFrame),
    /// A non-fatal framing error; the stream has already resynchronized.
    FrameError(FrameError),
}

/// How many notifications may queue before the oldest feeds are dropped.
const NOTIFICATION_CAPACITY: usize = 32;

struct PendingRequest {
    code: u8,
    reply_tx: oneshot::Sender<Result<ValidatedFrame, RequestError>>,
}

#[derive(Default)]
struct Correlation {
    in_flight: Option<PendingRequest>,
    /// Response code of a cancelled request whose reply may still arrive;
    /// exactly one late frame with this code is swallowed.
    discard_code: Option<u8>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases the correlation slot if the owning request never completed, so a
/// dropped `request` future counts as a cancellation.
struct SlotGuard<'a> {
    correlation: &'a StdMutex<Correlation>,
    code: u8,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut correlation = lock(self.correlation);
        if let Some(pending) = correlation.in_flight.take() {
            if pending.code == self.code {
                correlation.discard_code = Some(self.code);
                log::debug!(
                    "Request for code {:#04X} abandoned before completion",
                    self.code
                );
            } else {
                correlation.in_flight = Some(pending);
            }
        }
    }
}

/// Request/response driver for one connection to a pack.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Any number of
/// tasks may call [`request`](Self::request) concurrently; the session lets
/// exactly one command onto the wire at a time and admits waiters in call
/// order. Inbound chunks must come from a single reader task, matching the
/// one-reassembler-per-transport ownership rule.
pub struct Session<T> {
    transport: T,
    correlation: StdMutex<Correlation>,
    reassembler: StdMutex<StreamReassembler>,
    /// The in-flight slot; `tokio::sync::Mutex` queues waiters FIFO.
    request_lock: Mutex<()>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    notify_tx: mpsc::Sender<Notification>,
    /// Cell count from the most recent basic-info read; the cell-voltage
    /// payload does not carry its own count.
    cell_cnt: StdMutex<Option<u8>>,
}

impl<T: Transport> Session<T> {
    /// Create a session and the receiving end of its notification channel.
    pub fn new(transport: T) -> (Self, mpsc::Receiver<Notification>) {
        Self::with_frame_timeout(transport, DEFAULT_FRAME_TIMEOUT)
    }

    /// Like [`new`](Self::new) with a custom partial-frame timeout for the
    /// underlying reassembler.
    pub fn with_frame_timeout(
        transport: T,
        frame_timeout: Duration,
    ) -> (Self, mpsc::Receiver<Notification>) {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);
        (
            Self {
                transport,
                correlation: StdMutex::new(Correlation::default()),
                reassembler: StdMutex::new(StreamReassembler::with_timeout(frame_timeout)),
                request_lock: Mutex::new(()),
                closed_tx,
                closed_rx,
                notify_tx,
                cell_cnt: StdMutex::new(None),
            },
            notify_rx,
        )
    }

    /// Send a command and wait for the response whose code matches.
    ///
    /// Only one request is on the wire at a time; concurrent callers suspend
    /// in FIFO order until the slot frees up. Dropping the returned future
    /// cancels the request: the slot is released for the next caller and a
    /// late-arriving response is discarded instead of leaking into an
    /// unrelated exchange.
    pub async fn request(
        &self,
        register: Register,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<ValidatedFrame, RequestError> {
        let _slot = self.request_lock.lock().await;

        let mut closed_rx = self.closed_rx.clone();
        if *closed_rx.borrow_and_update() {
            return Err(RequestError::TransportClosed);
        }

        let code = register as u8;
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut correlation = lock(&self.correlation);
            // this request owns the code space now; stop discarding
            correlation.discard_code = None;
            correlation.in_flight = Some(PendingRequest { code, reply_tx });
        }
        let _guard = SlotGuard {
            correlation: &self.correlation,
            code,
        };

        let tx_buffer = encode_command(register, payload);
        log::trace!("write bytes: {tx_buffer:02X?}");
        self.transport.send(&tx_buffer).await?;

        tokio::select! {
            reply = reply_rx => match reply {
                Ok(result) => result,
                // the sender half only disappears if the session is torn down
                Err(_) => Err(RequestError::TransportClosed),
            },
            _ = tokio::time::sleep(timeout) => {
                log::debug!("request for code {code:#04X} timed out after {timeout:?}");
                Err(RequestError::Timeout)
            }
            _ = closed_rx.changed() => Err(RequestError::TransportClosed),
        }
    }

    /// Feed a chunk of inbound transport bytes.
    ///
    /// Call this from the single reader task that owns the inbound side of
    /// the connection. Completed frames resolve the in-flight request when
    /// their code matches; everything else becomes a [`Notification`].
    /// Never blocks.
    pub fn handle_chunk(&self, chunk: &[u8]) {
        let events = lock(&self.reassembler).push(chunk);
        for event in events {
            match event {
                StreamEvent::Frame(frame) => self.dispatch_frame(frame),
                StreamEvent::Error(err) => {
                    log::debug!("Stream error: {err}");
                    self.notify(Notification::FrameError(err));
                }
            }
        }
    }

    /// Signal that the transport has closed.
    ///
    /// Terminal for the session: the in-flight request, every queued caller
    /// and every later call fail with [`RequestError::TransportClosed`].
    pub fn transport_closed(&self) {
        log::debug!("Transport closed");
        let _ = self.closed_tx.send(true);
        let mut correlation = lock(&self.correlation);
        correlation.discard_code = None;
        if let Some(pending) = correlation.in_flight.take() {
            let _ = pending.reply_tx.send(Err(RequestError::TransportClosed));
        }
    }

    /// Cancel the in-flight request, if any.
    ///
    /// The waiting caller resolves with [`RequestError::Cancelled`] and the
    /// next queued caller proceeds immediately. The wire protocol has no
    /// correlation id, so the cancelled command's response may still arrive;
    /// the session remembers its code and silently drops one matching frame.
    /// Starting a new request reclaims the code.
    pub fn cancel_pending(&self) {
        let mut correlation = lock(&self.correlation);
        if let Some(pending) = correlation.in_flight.take() {
            log::debug!("Cancelling in-flight request (code {:#04X})", pending.code);
            correlation.discard_code = Some(pending.code);
            let _ = pending.reply_tx.send(Err(RequestError::Cancelled));
        }
    }

    /// Retrieve the basic-info telemetry record.
    ///
    /// Also caches the reported cell count, which
    /// [`read_cell_voltages`](Self::read_cell_voltages) needs.
    pub async fn read_basic_info(&self, timeout: Duration) -> Result<BasicInfo, RequestError> {
        log::trace!("read basic info");
        let frame = self.request(Register::BasicInfo, &[], timeout).await?;
        let info = BasicInfo::decode(&frame.payload)?;
        *lock(&self.cell_cnt) = Some(info.cell_cnt);
        Ok(info)
    }

    /// Retrieve the per-cell voltages.
    ///
    /// Returns [`RequestError::BasicInfoRequired`] unless
    /// [`read_basic_info`](Self::read_basic_info) succeeded at least once on
    /// this session.
    pub async fn read_cell_voltages(&self, timeout: Duration) -> Result<CellVoltages, RequestError> {
        log::trace!("read cell voltages");
        let Some(cell_cnt) = *lock(&self.cell_cnt) else {
            return Err(RequestError::BasicInfoRequired);
        };
        let frame = self.request(Register::CellVoltages, &[], timeout).await?;
        Ok(CellVoltages::decode(&frame.payload, cell_cnt)?)
    }

    /// Retrieve the device name string.
    pub async fn read_device_name(&self, timeout: Duration) -> Result<DeviceName, RequestError> {
        log::trace!("read device name");
        let frame = self.request(Register::DeviceName, &[], timeout).await?;
        Ok(DeviceName::decode(&frame.payload)?)
    }

    fn dispatch_frame(&self, frame: ValidatedFrame) {
        enum Route {
            Reply(PendingRequest, ValidatedFrame),
            Discard,
            Unsolicited(ValidatedFrame),
        }

        let route = {
            let mut correlation = lock(&self.correlation);
            match correlation.in_flight.take() {
                Some(pending) if pending.code == frame.code => Route::Reply(pending, frame),
                other => {
                    correlation.in_flight = other;
                    if correlation.discard_code == Some(frame.code) {
                        correlation.discard_code = None;
                        Route::Discard
                    } else {
                        Route::Unsolicited(frame)
                    }
                }
            }
        };

        match route {
            Route::Reply(pending, frame) => {
                if pending.reply_tx.send(Ok(frame)).is_err() {
                    log::trace!("Requester went away before its response arrived");
                }
            }
            Route::Discard => {
                log::debug!("Discarding late response for a cancelled request");
            }
            Route::Unsolicited(frame) => {
                log::trace!("Unsolicited frame - code={:#04X}", frame.code);
                self.notify(Notification::Frame(frame));
            }
        }
    }

    fn notify(&self, notification: Notification) {
        use mpsc::error::TrySendError;
        match self.notify_tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                log::warn!("Notification queue full, dropping {dropped:?}");
            }
            Err(TrySendError::Closed(_)) => {
                log::trace!("Nobody listens for notifications");
            }
        }
    }
}
