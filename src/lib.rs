//! An asynchronous Modbus TCP master.
//!
//! A [`ModbusController`](crate::core::ModbusController) opens one
//! [`TransportSession`](crate::core::modbus::TransportSession) per `host:port` and multiplexes every
//! attached [`Device`](crate::core::Device) over it, pipelining requests that are matched back to their
//! callers by transaction id.

#[macro_use]
extern crate enum_primitive;

pub mod core;
pub mod queue;

pub mod prelude {
    pub use crate::core::modbus::*;
    pub use crate::core::*;
    pub use crate::queue::*;
}
