use log::{trace, warn};
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{
    Error, Frame, Header, MODBUS_HEADER_SIZE, MODBUS_LENGTH_PREFIX, MODBUS_MAX_PDU_SIZE,
    MODBUS_PROTOCOL_TCP,
};

/// Frames a Modbus TCP byte stream.
///
/// Bytes that cannot start a valid MBAP header are discarded one at a time until
/// the stream resynchronises, so a corrupt frame never tears down the connection.
#[derive(Debug, Default)]
pub struct MbapCodec;

impl MbapCodec {
    fn plausible(header: &Header) -> bool {
        header.protocol_id == MODBUS_PROTOCOL_TCP
            && header.length >= 2
            && header.length as usize <= MODBUS_MAX_PDU_SIZE + 1
    }
}

impl Decoder for MbapCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < MODBUS_HEADER_SIZE {
                // Not enough data to read length marker.
                return Ok(None);
            }

            let header = Header::unpack(&src[..MODBUS_HEADER_SIZE])?;
            if !MbapCodec::plausible(&header) {
                warn!("Discarding byte ahead of malformed header {header:?}");
                src.advance(1);
                continue;
            }

            let expected_size = MODBUS_LENGTH_PREFIX + header.length as usize;
            if src.len() < expected_size {
                src.reserve(expected_size - src.len());
                return Ok(None);
            }

            let data = src.split_to(expected_size);
            match Frame::decode(&data) {
                Ok(frame) => {
                    trace!(
                        "Obtained frame of size {}. TxnID={}",
                        header.length,
                        header.transaction_id
                    );
                    return Ok(Some(frame));
                }
                Err(err) => warn!("Dropping malformed frame: {err}"),
            }
        }
    }
}

impl Encoder<Frame> for MbapCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item.encode()?;
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}
