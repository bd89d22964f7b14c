use std::fmt::{Display, Formatter};
use std::io;

use crate::core::config::ConfigError;
use crate::core::modbus::{Address, Quantity};

enum_from_primitive! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Modbus exception codes returned from the server.
    pub enum ExceptionCode {
        IllegalFunction         = 0x01,
        IllegalDataAddress      = 0x02,
        IllegalDataValue        = 0x03,
        SlaveOrServerFailure    = 0x04,
        Acknowledge             = 0x05,
        SlaveOrServerBusy       = 0x06,
        NegativeAcknowledge     = 0x07,
        MemoryParity            = 0x08,
        NotDefined              = 0x09,
        GatewayPath             = 0x0a,
        GatewayTarget           = 0x0b
    }
}

/// Why a frame could not be parsed or composed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    Truncated(usize),
    LengthMismatch { declared: u16, actual: usize },
    ProtocolId(u16),
    SendBufferTooBig(usize),
    UnexpectedReplySize,
    InvalidCoilValue(u16),
}

/// An address that was refused before anything reached the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressViolation {
    UnitId(u8),
    Quantity { quantity: Quantity, max: Quantity },
    Range { address: Address, quantity: Quantity },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Every transaction id is currently in flight.
    TransactionsExhausted,
    /// The pending entry was dropped without being resolved.
    ResponderDropped,
}

#[derive(Debug)]
pub enum Error {
    Exception(ExceptionCode),
    Io(io::Error),
    MalformedFrame(Reason),
    TransactionTimeout,
    ConnectionLost,
    InvalidAddress(AddressViolation),
    Faulted,
    InvalidResponse,
    Queue(QueueError),
    DuplicateUnit(u8),
    DuplicateDevice(String),
    Config(ConfigError),
    Decode(serde_json::Error),
}

impl From<Reason> for Error {
    fn from(reason: Reason) -> Error {
        Error::MalformedFrame(reason)
    }
}

impl From<AddressViolation> for Error {
    fn from(violation: AddressViolation) -> Error {
        Error::InvalidAddress(violation)
    }
}

impl From<ExceptionCode> for Error {
    fn from(err: ExceptionCode) -> Error {
        Error::Exception(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<QueueError> for Error {
    fn from(err: QueueError) -> Error {
        Error::Queue(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Error {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::Decode(err)
    }
}

impl Display for Reason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::Truncated(len) => write!(f, "truncated frame of {len} bytes"),
            Reason::LengthMismatch { declared, actual } => write!(
                f,
                "length field declares {declared} bytes but {actual} follow the prefix"
            ),
            Reason::ProtocolId(id) => write!(f, "protocol id {id:#06x} is not Modbus"),
            Reason::SendBufferTooBig(len) => write!(f, "pdu of {len} bytes exceeds 253"),
            Reason::UnexpectedReplySize => write!(f, "reply size does not match the request"),
            Reason::InvalidCoilValue(value) => write!(f, "coil value {value:#06x}"),
        }
    }
}

impl Display for AddressViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressViolation::UnitId(id) => write!(f, "unit id {id} is outside 1..=247"),
            AddressViolation::Quantity { quantity, max } => {
                write!(f, "quantity {quantity} is outside 1..={max}")
            }
            AddressViolation::Range { address, quantity } => write!(
                f,
                "{quantity} items from address {address} run past the end of the table"
            ),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Exception(code) => write!(f, "modbus exception {code:?}"),
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::MalformedFrame(reason) => write!(f, "malformed frame: {reason}"),
            Error::TransactionTimeout => write!(f, "transaction timed out"),
            Error::ConnectionLost => write!(f, "connection lost"),
            Error::InvalidAddress(violation) => write!(f, "invalid address: {violation}"),
            Error::Faulted => write!(f, "session faulted"),
            Error::InvalidResponse => write!(f, "response does not match its request"),
            Error::Queue(err) => write!(f, "transaction queue: {err:?}"),
            Error::DuplicateUnit(id) => write!(f, "unit id {id} is already attached"),
            Error::DuplicateDevice(name) => write!(f, "a device named `{name}` already exists"),
            Error::Config(err) => write!(f, "{err}"),
            Error::Decode(err) => write!(f, "could not decode configuration: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Decode(err) => Some(err),
            Error::Config(err) => Some(err),
            _ => None,
        }
    }
}
