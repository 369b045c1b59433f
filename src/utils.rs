use ethereum_types::{H256, H512, U256};
use secp256k1::{PublicKey, SecretKey};
use sha3::{Digest, Keccak256};
use std::net::IpAddr;

/// Computes the node id from a public key (the Keccak256 hash of the
/// uncompressed key, without the prefix byte).
pub fn node_id(public_key: &H512) -> H256 {
    H256::from_slice(&Keccak256::digest(public_key.as_bytes()))
}

pub fn public_key_from_signing_key(signer: &SecretKey) -> H512 {
    let public_key = PublicKey::from_secret_key(secp256k1::SECP256K1, signer);
    let encoded = public_key.serialize_uncompressed();
    H512::from_slice(&encoded[1..])
}

/// Rebuilds a parsed public key from its uncompressed 64-byte form.
pub fn compress_public_key(public_key: &H512) -> Option<PublicKey> {
    let mut encoded = [0u8; 65];
    encoded[0] = 0x04;
    encoded[1..].copy_from_slice(public_key.as_bytes());
    PublicKey::from_slice(&encoded).ok()
}

/// Position of the highest-order differing bit between two ids, in [0, 256].
/// Zero means the ids are equal.
pub fn log_distance(a: &H256, b: &H256) -> u64 {
    for (i, (x, y)) in a.as_bytes().iter().zip(b.as_bytes()).enumerate() {
        let byte = x ^ y;
        if byte != 0 {
            return 256 - (i as u64) * 8 - byte.leading_zeros() as u64;
        }
    }
    0
}

/// XOR distance between two ids, as an integer for ordering.
pub fn xor_distance(a: &H256, b: &H256) -> U256 {
    let mut out = [0u8; 32];
    for (i, (x, y)) in a.as_bytes().iter().zip(b.as_bytes()).enumerate() {
        out[i] = x ^ y;
    }
    U256::from_big_endian(&out)
}

/// Whether `addr` is a plausible endpoint for a node relayed by `sender`.
///
/// Rejects unspecified and multicast addresses, loopback addresses relayed
/// from outside the loopback, and site-local addresses relayed from the
/// public internet.
pub fn valid_relayed_addr(sender: IpAddr, addr: IpAddr) -> bool {
    if addr.is_unspecified() || addr.is_multicast() {
        return false;
    }
    if addr.is_loopback() && !sender.is_loopback() {
        return false;
    }
    if is_site_local(addr) && !(is_site_local(sender) || sender.is_loopback()) {
        return false;
    }
    true
}

fn is_site_local(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(ip) => ip.is_private(),
        // fc00::/7, the ipv6 unique-local range
        IpAddr::V6(ip) => (ip.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> H256 {
        let mut raw = [0u8; 32];
        raw[0] = byte;
        H256(raw)
    }

    #[test]
    fn log_distance_of_equal_ids_is_zero() {
        assert_eq!(log_distance(&id(0xaa), &id(0xaa)), 0);
    }

    #[test]
    fn log_distance_counts_highest_differing_bit() {
        // Ids differing in the very first bit are at maximum distance.
        assert_eq!(log_distance(&id(0x00), &id(0x80)), 256);
        assert_eq!(log_distance(&id(0x00), &id(0x01)), 249);

        let mut raw = [0u8; 32];
        raw[31] = 0x01;
        assert_eq!(log_distance(&H256::zero(), &H256(raw)), 1);
    }

    #[test]
    fn xor_distance_orders_ids() {
        let target = id(0x00);
        assert!(xor_distance(&target, &id(0x01)) < xor_distance(&target, &id(0x02)));
        assert!(xor_distance(&target, &id(0x02)) < xor_distance(&target, &id(0x80)));
    }

    #[test]
    fn relayed_addr_validation() {
        let public: IpAddr = "18.138.108.67".parse().unwrap();
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        let private: IpAddr = "192.168.1.7".parse().unwrap();

        assert!(valid_relayed_addr(public, public));
        assert!(!valid_relayed_addr(public, "0.0.0.0".parse().unwrap()));
        assert!(!valid_relayed_addr(public, "224.0.0.1".parse().unwrap()));

        // Loopback and site-local endpoints are only valid from inside.
        assert!(valid_relayed_addr(loopback, loopback));
        assert!(!valid_relayed_addr(public, loopback));
        assert!(valid_relayed_addr(private, private));
        assert!(valid_relayed_addr(loopback, private));
        assert!(!valid_relayed_addr(public, private));
    }
}
