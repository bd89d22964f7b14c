use byteorder::{BigEndian, ByteOrder};

use super::{Error, Quantity, Reason, Value};

/// Packs coil states into bytes, least significant bit first.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];

    for (index, _) in bits.iter().enumerate().filter(|(_, bit)| **bit) {
        bytes[index / 8] |= 1 << (index % 8);
    }

    bytes
}

/// Inverse of [`pack_bits`]; trailing padding bits beyond `count` are ignored.
pub fn unpack_bits(bytes: &[u8], count: Quantity) -> Vec<bool> {
    (0..count as usize)
        .map(|index| {
            bytes
                .get(index / 8)
                .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
        })
        .collect()
}

pub fn pack_words(values: &[Value]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len() * 2];
    BigEndian::write_u16_into(values, &mut bytes);
    bytes
}

pub fn unpack_words(bytes: &[u8]) -> Result<Vec<Value>, Error> {
    if bytes.len() % 2 != 0 {
        return Err(Reason::UnexpectedReplySize.into());
    }

    let mut values = vec![0u16; bytes.len() / 2];
    BigEndian::read_u16_into(bytes, &mut values);
    Ok(values)
}
