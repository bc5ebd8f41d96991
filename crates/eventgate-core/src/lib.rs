//! # eventgate-core
//!
//! Shared vocabulary for the eventgate crates:
//!
//! - **Protocol**: [`protocol::Opcode`], [`protocol::Message`] and the
//!   opcode-specific payloads that make up the wire envelope
//! - **Close codes**: [`protocol::CloseCode`], including the non-error
//!   `Restart` code used during orchestrated shutdown
//! - **Events**: validated [`events::EventType`], subscription conditions and the
//!   [`events::BusEvent`] envelope publishers put on the bus
//! - **Session ids**: random 16-byte hex [`ids::SessionId`]
//! - **Errors**: [`errors::GatewayError`] taxonomy via `thiserror`
//! - **Logging**: [`logging::init_subscriber`]

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod protocol;

pub use errors::{GatewayError, ProtocolError, Result};
pub use events::{BusEvent, Condition, EventType};
pub use ids::SessionId;
pub use protocol::{CloseCode, Message, Opcode};
