use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use enum_primitive::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::io::Cursor;
use std::ops::Deref;

use super::{binary, AddressViolation, Error, Pdu, Reason};

pub type Address = u16;
pub type Quantity = u16;
pub type Value = u16;

pub const MAX_READ_BITS: Quantity = 2000;
pub const MAX_READ_REGISTERS: Quantity = 125;
pub const MAX_WRITE_COILS: Quantity = 1968;
pub const MAX_WRITE_REGISTERS: Quantity = 123;

pub const MIN_UNIT_ID: u8 = 1;
pub const MAX_UNIT_ID: u8 = 247;

pub const COIL_ON: Value = 0xFF00;
pub const COIL_OFF: Value = 0x0000;

enum_from_primitive! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// The function codes this master issues.
    pub enum FunctionCode {
        ReadCoils               = 0x01,
        ReadDiscreteInputs      = 0x02,
        ReadHoldingRegisters    = 0x03,
        ReadInputRegisters      = 0x04,
        WriteSingleCoil         = 0x05,
        WriteSingleRegister     = 0x06,
        WriteMultipleCoils      = 0x0F,
        WriteMultipleRegisters  = 0x10
    }
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<FunctionCode> {
        FunctionCode::from_u8(code)
    }
}

/// A unit identifier addressable over Modbus TCP, always within 1..=247.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u8);

impl UnitId {
    pub fn new(id: u8) -> Result<UnitId, AddressViolation> {
        if (MIN_UNIT_ID..=MAX_UNIT_ID).contains(&id) {
            Ok(UnitId(id))
        } else {
            Err(AddressViolation::UnitId(id))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for UnitId {
    type Error = AddressViolation;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        UnitId::new(value)
    }
}

impl Deref for UnitId {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for UnitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The four data tables a Modbus server exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl Table {
    /// The largest block a single read can cover for this table.
    pub fn max_read(self) -> Quantity {
        match self {
            Table::Coils | Table::DiscreteInputs => MAX_READ_BITS,
            Table::HoldingRegisters | Table::InputRegisters => MAX_READ_REGISTERS,
        }
    }

    pub fn read_request(self, address: Address, quantity: Quantity) -> Request {
        match self {
            Table::Coils => Request::ReadCoils(address, quantity),
            Table::DiscreteInputs => Request::ReadDiscreteInputs(address, quantity),
            Table::HoldingRegisters => Request::ReadHoldingRegisters(address, quantity),
            Table::InputRegisters => Request::ReadInputRegisters(address, quantity),
        }
    }
}

/// A cached value of a single coil, input or register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    Bit(bool),
    Word(Value),
}

/// Checks that `quantity` items starting at `address` fit in `1..=max` and inside
/// the 16-bit address space.
pub fn check_range(
    address: Address,
    quantity: Quantity,
    max: Quantity,
) -> Result<(), AddressViolation> {
    if quantity < 1 || quantity > max {
        return Err(AddressViolation::Quantity { quantity, max });
    }

    if address as u32 + quantity as u32 > u16::MAX as u32 + 1 {
        return Err(AddressViolation::Range { address, quantity });
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils(Address, Quantity),
    ReadDiscreteInputs(Address, Quantity),
    ReadHoldingRegisters(Address, Quantity),
    ReadInputRegisters(Address, Quantity),

    WriteSingleCoil(Address, bool),
    WriteSingleRegister(Address, Value),
    WriteMultipleCoils(Address, Vec<bool>),
    WriteMultipleRegisters(Address, Vec<Value>),
}

impl Request {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Request::ReadCoils(..) => FunctionCode::ReadCoils,
            Request::ReadDiscreteInputs(..) => FunctionCode::ReadDiscreteInputs,
            Request::ReadHoldingRegisters(..) => FunctionCode::ReadHoldingRegisters,
            Request::ReadInputRegisters(..) => FunctionCode::ReadInputRegisters,
            Request::WriteSingleCoil(..) => FunctionCode::WriteSingleCoil,
            Request::WriteSingleRegister(..) => FunctionCode::WriteSingleRegister,
            Request::WriteMultipleCoils(..) => FunctionCode::WriteMultipleCoils,
            Request::WriteMultipleRegisters(..) => FunctionCode::WriteMultipleRegisters,
        }
    }

    pub fn table(&self) -> Table {
        match self {
            Request::ReadCoils(..) | Request::WriteSingleCoil(..) | Request::WriteMultipleCoils(..) => {
                Table::Coils
            }
            Request::ReadDiscreteInputs(..) => Table::DiscreteInputs,
            Request::ReadHoldingRegisters(..)
            | Request::WriteSingleRegister(..)
            | Request::WriteMultipleRegisters(..) => Table::HoldingRegisters,
            Request::ReadInputRegisters(..) => Table::InputRegisters,
        }
    }

    /// Rejects quantities and ranges the protocol cannot carry.
    pub fn validate(&self) -> Result<(), AddressViolation> {
        match self {
            Request::ReadCoils(addr, quant) | Request::ReadDiscreteInputs(addr, quant) => {
                check_range(*addr, *quant, MAX_READ_BITS)
            }
            Request::ReadHoldingRegisters(addr, quant) | Request::ReadInputRegisters(addr, quant) => {
                check_range(*addr, *quant, MAX_READ_REGISTERS)
            }
            Request::WriteSingleCoil(..) | Request::WriteSingleRegister(..) => Ok(()),
            Request::WriteMultipleCoils(addr, values) => {
                check_range(*addr, clamp_len(values.len()), MAX_WRITE_COILS)
            }
            Request::WriteMultipleRegisters(addr, values) => {
                check_range(*addr, clamp_len(values.len()), MAX_WRITE_REGISTERS)
            }
        }
    }

    /// The PDU data following the function code.
    pub fn payload(&self) -> Result<Vec<u8>, Error> {
        let mut buff = vec![];

        match self {
            Request::ReadCoils(addr, quant)
            | Request::ReadDiscreteInputs(addr, quant)
            | Request::ReadHoldingRegisters(addr, quant)
            | Request::ReadInputRegisters(addr, quant) => {
                buff.write_u16::<BigEndian>(*addr)?;
                buff.write_u16::<BigEndian>(*quant)?;
            }
            Request::WriteSingleCoil(addr, state) => {
                buff.write_u16::<BigEndian>(*addr)?;
                buff.write_u16::<BigEndian>(if *state { COIL_ON } else { COIL_OFF })?;
            }
            Request::WriteSingleRegister(addr, value) => {
                buff.write_u16::<BigEndian>(*addr)?;
                buff.write_u16::<BigEndian>(*value)?;
            }
            Request::WriteMultipleCoils(addr, values) => {
                let bytes = binary::pack_bits(values);
                buff.write_u16::<BigEndian>(*addr)?;
                buff.write_u16::<BigEndian>(clamp_len(values.len()))?;
                buff.write_u8(bytes.len() as u8)?;
                buff.extend_from_slice(&bytes);
            }
            Request::WriteMultipleRegisters(addr, values) => {
                let bytes = binary::pack_words(values);
                buff.write_u16::<BigEndian>(*addr)?;
                buff.write_u16::<BigEndian>(clamp_len(values.len()))?;
                buff.write_u8(bytes.len() as u8)?;
                buff.extend_from_slice(&bytes);
            }
        }

        Ok(buff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Coils(Vec<bool>),
    DiscreteInputs(Vec<bool>),
    HoldingRegisters(Vec<Value>),
    InputRegisters(Vec<Value>),

    WriteSingleCoil(Address, bool),
    WriteSingleRegister(Address, Value),
    WriteMultipleCoils(Address, Quantity),
    WriteMultipleRegisters(Address, Quantity),
}

impl Response {
    /// Decodes the reply to `request`, checking that it echoes what was asked.
    pub fn decode(request: &Request, pdu: &Pdu) -> Result<Response, Error> {
        if pdu.function != request.function_code().code() {
            return Err(Error::InvalidResponse);
        }

        match request {
            Request::ReadCoils(_, quant) => {
                Ok(Response::Coils(read_bits(&pdu.data, *quant)?))
            }
            Request::ReadDiscreteInputs(_, quant) => {
                Ok(Response::DiscreteInputs(read_bits(&pdu.data, *quant)?))
            }
            Request::ReadHoldingRegisters(_, quant) => {
                Ok(Response::HoldingRegisters(read_words(&pdu.data, *quant)?))
            }
            Request::ReadInputRegisters(_, quant) => {
                Ok(Response::InputRegisters(read_words(&pdu.data, *quant)?))
            }
            Request::WriteSingleCoil(addr, state) => {
                let (echo_addr, raw) = read_echo(&pdu.data)?;
                let echo_state = match raw {
                    COIL_ON => true,
                    COIL_OFF => false,
                    other => return Err(Reason::InvalidCoilValue(other).into()),
                };
                if echo_addr != *addr || echo_state != *state {
                    return Err(Error::InvalidResponse);
                }
                Ok(Response::WriteSingleCoil(echo_addr, echo_state))
            }
            Request::WriteSingleRegister(addr, value) => {
                let echo = read_echo(&pdu.data)?;
                if echo != (*addr, *value) {
                    return Err(Error::InvalidResponse);
                }
                Ok(Response::WriteSingleRegister(echo.0, echo.1))
            }
            Request::WriteMultipleCoils(addr, values) => {
                let echo = read_echo(&pdu.data)?;
                if echo != (*addr, clamp_len(values.len())) {
                    return Err(Error::InvalidResponse);
                }
                Ok(Response::WriteMultipleCoils(echo.0, echo.1))
            }
            Request::WriteMultipleRegisters(addr, values) => {
                let echo = read_echo(&pdu.data)?;
                if echo != (*addr, clamp_len(values.len())) {
                    return Err(Error::InvalidResponse);
                }
                Ok(Response::WriteMultipleRegisters(echo.0, echo.1))
            }
        }
    }
}

fn clamp_len(len: usize) -> Quantity {
    len.min(u16::MAX as usize) as Quantity
}

fn byte_counted(data: &[u8], expected_bytes: usize) -> Result<&[u8], Error> {
    let given = *data.first().ok_or(Reason::UnexpectedReplySize)? as usize;

    if given != expected_bytes || data.len() != expected_bytes + 1 {
        return Err(Reason::UnexpectedReplySize.into());
    }

    Ok(&data[1..])
}

fn read_bits(data: &[u8], quantity: Quantity) -> Result<Vec<bool>, Error> {
    let bytes = byte_counted(data, (quantity as usize + 7) / 8)?;
    Ok(binary::unpack_bits(bytes, quantity))
}

fn read_words(data: &[u8], quantity: Quantity) -> Result<Vec<Value>, Error> {
    let bytes = byte_counted(data, 2 * quantity as usize)?;
    binary::unpack_words(bytes)
}

fn read_echo(data: &[u8]) -> Result<(u16, u16), Error> {
    if data.len() != 4 {
        return Err(Reason::UnexpectedReplySize.into());
    }

    let mut rdr = Cursor::new(data);
    Ok((rdr.read_u16::<BigEndian>()?, rdr.read_u16::<BigEndian>()?))
}
