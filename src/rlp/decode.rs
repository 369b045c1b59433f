use super::{RLP_EMPTY_LIST, RLP_NULL, error::RLPDecodeError};
use bytes::Bytes;
use ethereum_types::{H256, H264, H512, U256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Max payload size accepted when decoding. Any well-formed protocol message
/// fits in a single UDP datagram, so anything larger is a bug or malicious.
const MAX_RLP_BYTES: usize = 1024 * 1024;

pub trait RLPDecode: Sized {
    /// Decodes a value from the front of `rlp`, returning it along with the
    /// remaining bytes.
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError>;

    fn decode(rlp: &[u8]) -> Result<Self, RLPDecodeError> {
        let (decoded, remaining) = Self::decode_unfinished(rlp)?;
        if !remaining.is_empty() {
            return Err(RLPDecodeError::InvalidLength);
        }
        Ok(decoded)
    }
}

impl RLPDecode for u8 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let first = *rlp.first().ok_or(RLPDecodeError::InvalidLength)?;
        match first {
            0..=0x7f => Ok((first, &rlp[1..])),
            RLP_NULL => Ok((0, &rlp[1..])),
            b if b == RLP_NULL + 1 && rlp.len() >= 2 => Ok((rlp[1], &rlp[2..])),
            _ => Err(RLPDecodeError::MalformedData),
        }
    }
}

macro_rules! impl_rlp_decode_uint {
    ($($t:ty),*) => {
        $(impl RLPDecode for $t {
            fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
                let (bytes, rest) = decode_bytes(rlp)?;
                Ok((<$t>::from_be_bytes(static_left_pad(bytes)?), rest))
            }
        })*
    };
}

impl_rlp_decode_uint!(u16, u32, u64, u128, usize);

impl<const N: usize> RLPDecode for [u8; N] {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let value = bytes.try_into().map_err(|_| RLPDecodeError::InvalidLength)?;
        Ok((value, rest))
    }
}

impl RLPDecode for Bytes {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        Ok((Bytes::copy_from_slice(bytes), rest))
    }
}

impl RLPDecode for String {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let value = String::from_utf8(bytes.to_vec()).map_err(|_| RLPDecodeError::MalformedData)?;
        Ok((value, rest))
    }
}

impl RLPDecode for H256 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = RLPDecode::decode_unfinished(rlp)?;
        Ok((H256(value), rest))
    }
}

impl RLPDecode for H264 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = RLPDecode::decode_unfinished(rlp)?;
        Ok((H264(value), rest))
    }
}

impl RLPDecode for H512 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = RLPDecode::decode_unfinished(rlp)?;
        Ok((H512(value), rest))
    }
}

impl RLPDecode for U256 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let padded: [u8; 32] = static_left_pad(bytes)?;
        Ok((U256::from_big_endian(&padded), rest))
    }
}

impl RLPDecode for Ipv4Addr {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let octets: [u8; 4] = bytes.try_into().map_err(|_| RLPDecodeError::InvalidLength)?;
        Ok((Ipv4Addr::from(octets), rest))
    }
}

impl RLPDecode for Ipv6Addr {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let octets: [u8; 16] = bytes.try_into().map_err(|_| RLPDecodeError::InvalidLength)?;
        Ok((Ipv6Addr::from(octets), rest))
    }
}

impl RLPDecode for IpAddr {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        match bytes.len() {
            4 => {
                let octets: [u8; 4] =
                    bytes.try_into().map_err(|_| RLPDecodeError::InvalidLength)?;
                Ok((IpAddr::V4(Ipv4Addr::from(octets)), rest))
            }
            16 => {
                let octets: [u8; 16] =
                    bytes.try_into().map_err(|_| RLPDecodeError::InvalidLength)?;
                // An ipv4-mapped address decodes back to its canonical form.
                Ok((IpAddr::V6(Ipv6Addr::from(octets)).to_canonical(), rest))
            }
            _ => Err(RLPDecodeError::InvalidLength),
        }
    }
}

impl<T: RLPDecode> RLPDecode for Vec<T> {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        if rlp.is_empty() {
            return Err(RLPDecodeError::InvalidLength);
        }
        if rlp[0] == RLP_EMPTY_LIST {
            return Ok((Vec::new(), &rlp[1..]));
        }
        let (is_list, payload, rest) = decode_rlp_item(rlp)?;
        if !is_list {
            return Err(RLPDecodeError::UnexpectedString);
        }
        let mut result = Vec::new();
        let mut current = payload;
        while !current.is_empty() {
            let (item, remaining) = T::decode_unfinished(current)?;
            result.push(item);
            current = remaining;
        }
        Ok((result, rest))
    }
}

impl<T1: RLPDecode, T2: RLPDecode> RLPDecode for (T1, T2) {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (is_list, payload, rest) = decode_rlp_item(rlp)?;
        if !is_list {
            return Err(RLPDecodeError::UnexpectedString);
        }
        let (first, payload) = T1::decode_unfinished(payload)?;
        let (second, payload) = T2::decode_unfinished(payload)?;
        if !payload.is_empty() {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok(((first, second), rest))
    }
}

impl<T1: RLPDecode, T2: RLPDecode, T3: RLPDecode> RLPDecode for (T1, T2, T3) {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (is_list, payload, rest) = decode_rlp_item(rlp)?;
        if !is_list {
            return Err(RLPDecodeError::UnexpectedString);
        }
        let (first, payload) = T1::decode_unfinished(payload)?;
        let (second, payload) = T2::decode_unfinished(payload)?;
        let (third, payload) = T3::decode_unfinished(payload)?;
        if !payload.is_empty() {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok(((first, second, third), rest))
    }
}

/// Splits an RLP item off the front of `data`.
///
/// Returns whether the item is a list, the item payload without its prefix,
/// and the remaining bytes after the item.
pub fn decode_rlp_item(data: &[u8]) -> Result<(bool, &[u8], &[u8]), RLPDecodeError> {
    let first = *data.first().ok_or(RLPDecodeError::InvalidLength)?;
    match first {
        0..=0x7f => Ok((false, &data[..1], &data[1..])),
        0x80..=0xb7 => {
            let len = (first - 0x80) as usize;
            if data.len() < len + 1 {
                return Err(RLPDecodeError::InvalidLength);
            }
            Ok((false, &data[1..len + 1], &data[len + 1..]))
        }
        0xb8..=0xbf => {
            let len_of_len = (first - 0xb7) as usize;
            let (len, start) = long_length(data, len_of_len)?;
            Ok((false, &data[start..start + len], &data[start + len..]))
        }
        RLP_EMPTY_LIST..=0xf7 => {
            let len = (first - RLP_EMPTY_LIST) as usize;
            if data.len() < len + 1 {
                return Err(RLPDecodeError::InvalidLength);
            }
            Ok((true, &data[1..len + 1], &data[len + 1..]))
        }
        0xf8..=0xff => {
            let len_of_len = (first - 0xf7) as usize;
            let (len, start) = long_length(data, len_of_len)?;
            Ok((true, &data[start..start + len], &data[start + len..]))
        }
    }
}

/// Splits an RLP item off the front of `data`, keeping its prefix.
pub fn get_item_with_prefix(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let (_, _, rest) = decode_rlp_item(data)?;
    let item_len = data.len() - rest.len();
    Ok((&data[..item_len], rest))
}

/// Decodes the payload of a byte-string item, rejecting lists.
pub fn decode_bytes(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let (is_list, payload, rest) = decode_rlp_item(data)?;
    if is_list {
        return Err(RLPDecodeError::UnexpectedList);
    }
    Ok((payload, rest))
}

fn long_length(data: &[u8], len_of_len: usize) -> Result<(usize, usize), RLPDecodeError> {
    if data.len() < len_of_len + 1 {
        return Err(RLPDecodeError::InvalidLength);
    }
    let len = usize::from_be_bytes(static_left_pad(&data[1..len_of_len + 1])?);
    if len > MAX_RLP_BYTES || data.len() < len_of_len + len + 1 {
        return Err(RLPDecodeError::InvalidLength);
    }
    Ok((len, len_of_len + 1))
}

/// Left-pads big-endian bytes with zeros up to a fixed width.
/// Leading zeros in the input are malformed (non-canonical integer).
pub fn static_left_pad<const N: usize>(data: &[u8]) -> Result<[u8; N], RLPDecodeError> {
    let mut result = [0; N];
    if data.is_empty() {
        return Ok(result);
    }
    if data[0] == 0 {
        return Err(RLPDecodeError::MalformedData);
    }
    if data.len() > N {
        return Err(RLPDecodeError::InvalidLength);
    }
    result[N - data.len()..].copy_from_slice(data);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlp::encode::RLPEncode;

    #[test]
    fn roundtrip_uints() {
        for value in [0u64, 1, 0x7f, 0x80, 0xffff, u64::MAX] {
            let encoded = value.encode_to_vec();
            assert_eq!(u64::decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn roundtrip_strings() {
        for value in ["", "a", "hello world", "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"] {
            let encoded = value.encode_to_vec();
            assert_eq!(String::decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn roundtrip_vec() {
        let value = vec![1u64, 0x80, 0xffffffff];
        let encoded = value.encode_to_vec();
        assert_eq!(Vec::<u64>::decode(&encoded).unwrap(), value);
    }

    #[test]
    fn roundtrip_ip_addrs() {
        let v4: IpAddr = "18.138.108.67".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        for ip in [v4, v6] {
            let encoded = ip.encode_to_vec();
            assert_eq!(IpAddr::decode(&encoded).unwrap(), ip);
        }
    }

    #[test]
    fn non_canonical_integer_is_rejected() {
        // 0x82 0x00 0x01 has a leading zero in the integer payload.
        assert!(u16::decode(&[0x82, 0x00, 0x01]).is_err());
    }
}
