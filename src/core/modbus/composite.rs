use std::io;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use enum_primitive::FromPrimitive;

use super::{Error, ExceptionCode, Reason};

pub const MODBUS_PROTOCOL_TCP: u16 = 0x0000;
pub const MODBUS_TCP_DEFAULT_PORT: u16 = 502;

/// Transaction id, protocol id, length and unit id.
pub const MODBUS_HEADER_SIZE: usize = 7;

/// The header bytes preceding the span counted by the length field.
pub const MODBUS_LENGTH_PREFIX: usize = 6;

pub const MODBUS_MAX_PDU_SIZE: usize = 253;
pub const MODBUS_MAX_PACKET_SIZE: usize = MODBUS_HEADER_SIZE + MODBUS_MAX_PDU_SIZE;

/// Bit set on the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// The MBAP header on a given modbus message.
///
/// `length` counts the unit id plus the PDU, so it is always the PDU length + 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl Header {
    pub fn pack(&self) -> Result<Vec<u8>, Error> {
        let mut buff = Vec::with_capacity(MODBUS_HEADER_SIZE);
        buff.write_u16::<BigEndian>(self.transaction_id)?;
        buff.write_u16::<BigEndian>(self.protocol_id)?;
        buff.write_u16::<BigEndian>(self.length)?;
        buff.write_u8(self.unit_id)?;
        Ok(buff)
    }

    pub fn unpack(buff: &[u8]) -> Result<Header, Error> {
        let mut rdr = io::Cursor::new(buff);
        Ok(Header {
            transaction_id: rdr.read_u16::<BigEndian>()?,
            protocol_id: rdr.read_u16::<BigEndian>()?,
            length: rdr.read_u16::<BigEndian>()?,
            unit_id: rdr.read_u8()?,
        })
    }
}

/// Function code plus its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub function: u8,
    pub data: Vec<u8>,
}

impl Pdu {
    pub fn new(function: u8, data: Vec<u8>) -> Pdu {
        Pdu { function, data }
    }

    pub fn exception(function: u8, code: ExceptionCode) -> Pdu {
        Pdu {
            function: function | EXCEPTION_FLAG,
            data: vec![code as u8],
        }
    }

    /// Byte length of the PDU including its function code.
    pub fn size(&self) -> usize {
        1 + self.data.len()
    }

    pub fn is_exception(&self) -> bool {
        self.function & EXCEPTION_FLAG != 0
    }

    /// Turns an exception response into [`Error::Exception`].
    pub fn into_result(self) -> Result<Pdu, Error> {
        if !self.is_exception() {
            return Ok(self);
        }

        let code = *self.data.first().ok_or(Error::InvalidResponse)?;
        match ExceptionCode::from_u8(code) {
            Some(code) => Err(Error::Exception(code)),
            None => Err(Error::InvalidResponse),
        }
    }
}

/// A complete Modbus TCP application data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub pdu: Pdu,
}

impl Frame {
    pub fn new(transaction_id: u16, unit_id: u8, function: u8, payload: Vec<u8>) -> Frame {
        let pdu = Pdu::new(function, payload);

        Frame {
            header: Header {
                transaction_id,
                protocol_id: MODBUS_PROTOCOL_TCP,
                length: (pdu.size() + 1) as u16,
                unit_id,
            },
            pdu,
        }
    }

    pub fn transaction_id(&self) -> u16 {
        self.header.transaction_id
    }

    pub fn unit_id(&self) -> u8 {
        self.header.unit_id
    }

    /// Serialises the frame. Fails when the PDU cannot fit a Modbus TCP packet.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        if self.pdu.size() > MODBUS_MAX_PDU_SIZE {
            return Err(Reason::SendBufferTooBig(self.pdu.size()).into());
        }

        let header = Header {
            length: (self.pdu.size() + 1) as u16,
            ..self.header
        };

        let mut buff = header.pack()?;
        buff.write_u8(self.pdu.function)?;
        buff.extend_from_slice(&self.pdu.data);
        Ok(buff)
    }

    /// Parses exactly one frame from `buff`.
    pub fn decode(buff: &[u8]) -> Result<Frame, Error> {
        if buff.len() < MODBUS_HEADER_SIZE + 1 {
            return Err(Reason::Truncated(buff.len()).into());
        }

        let header = Header::unpack(&buff[..MODBUS_HEADER_SIZE])?;

        if header.protocol_id != MODBUS_PROTOCOL_TCP {
            return Err(Reason::ProtocolId(header.protocol_id).into());
        }

        let actual = buff.len() - MODBUS_LENGTH_PREFIX;
        if header.length as usize != actual {
            return Err(Reason::LengthMismatch {
                declared: header.length,
                actual,
            }
            .into());
        }

        Ok(Frame {
            header,
            pdu: Pdu::new(
                buff[MODBUS_HEADER_SIZE],
                buff[MODBUS_HEADER_SIZE + 1..].to_vec(),
            ),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_every_unit_id() {
        for unit_id in 1..=247u8 {
            let frame = Frame::new(0x1234, unit_id, 0x03, vec![0x00, 0x6B, 0x00, 0x03]);
            let bytes = frame.encode().expect("Must encode");

            assert_eq!(Frame::decode(&bytes).expect("Must decode"), frame);
        }
    }

    #[test]
    fn length_is_pdu_plus_one() {
        let bytes = Frame::new(1, 17, 0x06, vec![0x00, 0x01, 0x00, 0x03])
            .encode()
            .expect("Must encode");

        assert_eq!(
            bytes,
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x06, 0x00, 0x01, 0x00, 0x03]
        );
    }

    #[test]
    fn truncated_buffers_are_malformed() {
        assert!(matches!(
            Frame::decode(&[0x00, 0x01, 0x00, 0x00, 0x00]),
            Err(Error::MalformedFrame(Reason::Truncated(5)))
        ));
    }

    #[test]
    fn length_mismatch_is_malformed() {
        let buff = [0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x02, 0x00];

        assert!(matches!(
            Frame::decode(&buff),
            Err(Error::MalformedFrame(Reason::LengthMismatch { declared: 7, actual: 4 }))
        ));
    }

    #[test]
    fn foreign_protocol_is_malformed() {
        let buff = [0x00, 0x01, 0x00, 0x01, 0x00, 0x02, 0x01, 0x03];

        assert!(matches!(
            Frame::decode(&buff),
            Err(Error::MalformedFrame(Reason::ProtocolId(1)))
        ));
    }

    #[test]
    fn exception_pdu_surfaces_its_code() {
        let pdu = Pdu::exception(0x03, ExceptionCode::IllegalDataAddress);
        assert_eq!(pdu, Pdu::new(0x83, vec![0x02]));

        assert!(matches!(
            pdu.into_result(),
            Err(Error::Exception(ExceptionCode::IllegalDataAddress))
        ));
    }

    #[test]
    fn oversized_pdu_is_refused() {
        let frame = Frame::new(1, 1, 0x10, vec![0; MODBUS_MAX_PDU_SIZE]);
        assert!(matches!(
            frame.encode(),
            Err(Error::MalformedFrame(Reason::SendBufferTooBig(254)))
        ));
    }
}
