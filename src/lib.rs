#![cfg_attr(docsrs, feature(doc_cfg))]
//! # jbdbms_lib
//!
//! This crate speaks the JBD (Jiabaida / "Xiaoxiang") smart BMS protocol:
//! it turns the raw byte stream of such a pack into validated, typed
//! telemetry and protection events, and encodes the commands that elicit
//! them. The physical link (a UART adapter, a BLE UART characteristic) is
//! deliberately left to the caller.
//!
//! The crate is layered bottom-up:
//!
//! - [`protocol`]: wire constants, frame codec and the typed records
//!   ([`protocol::BasicInfo`], [`protocol::CellVoltages`], protection and
//!   FET bit flags) with lossless bitmask round-trips.
//! - [`reassembler`]: a non-blocking state machine that reassembles frames
//!   from arbitrary transport chunks, resynchronizing after noise,
//!   corruption or stalled partial frames.
//! - [`tokio_session_async`]: an async session driver correlating commands
//!   with responses over a caller-owned transport, one request in flight at
//!   a time, with unsolicited telemetry on a notification channel.
//!
//! ## Features
//!
//! - `tokio-session-async` (default): enables the **asynchronous** session
//!   driver using `tokio`.
//! - `serde`: enables `serde` support for the telemetry data structures.

/// Contains error types for the library.
mod error;
/// Defines the JBD communication protocol: frame codec and typed records.
pub mod protocol;
/// Reassembles protocol frames from a raw transport byte stream.
pub mod reassembler;

pub use error::{DecodeError, FrameError};

/// Asynchronous request/response session driver.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-session-async")))]
#[cfg(feature = "tokio-session-async")]
pub mod tokio_session_async;
