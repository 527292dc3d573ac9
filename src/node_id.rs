//! # Node Identifiers and the XOR Metric
//!
//! Every DHT participant, info-hash and item target lives in the same 160-bit
//! keyspace. This module defines [`NodeId`] plus the bit-level helpers the
//! routing table and traversals are built on:
//!
//! | Function | Purpose |
//! |----------|---------|
//! | [`distance`] | Bitwise XOR of two IDs |
//! | [`distance_exp`] | Index of the highest differing bit (159 = MSB), `-1` when equal |
//! | [`compare_ref`] | Orders two IDs by closeness to a reference |
//! | [`generate_prefix_mask`] | ID with the top `n` bits set |
//! | [`classify_prefix`] | Sub-bucket slot used for replacement diversity |
//! | [`generate_id`] / [`verify_id`] | BEP 42 IP-bound node IDs |
//!
//! ## BEP 42
//!
//! A secure node ID carries the CRC32-C of the node's masked external IP in
//! its top 21 bits, and the random seed used for the mask in its last byte.
//! Addresses in private, loopback and link-local ranges are exempt from
//! verification since they can never be observed consistently.

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::ops::BitXor;

use crc::{Crc, CRC_32_ISCSI};
use rand::Rng;

/// Size of a node ID in bytes.
pub const ID_LEN: usize = 20;

/// Number of bits in a node ID.
pub const ID_BITS: usize = ID_LEN * 8;

/// CRC32-C (Castagnoli), as required by BEP 42.
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const V4_MASK: [u8; 4] = [0x03, 0x0f, 0x3f, 0xff];
const V6_MASK: [u8; 8] = [0x01, 0x03, 0x07, 0x0f, 0x1f, 0x3f, 0x7f, 0xff];

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an ID from a slice, returning `None` unless it is exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub const fn min() -> Self {
        Self([0u8; ID_LEN])
    }

    pub const fn max() -> Self {
        Self([0xffu8; ID_LEN])
    }

    pub fn is_all_zeros(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> usize {
        let mut count = 0;
        for &b in &self.0 {
            if b == 0 {
                count += 8;
                continue;
            }
            count += b.leading_zeros() as usize;
            break;
        }
        count
    }

    /// Shift the whole 160-bit value left by `bits`, filling with zeros.
    pub fn shl(&self, bits: usize) -> NodeId {
        if bits >= ID_BITS {
            return NodeId::min();
        }
        let byte_shift = bits / 8;
        let bit_shift = bits % 8;
        let mut out = [0u8; ID_LEN];
        for (i, slot) in out.iter_mut().enumerate() {
            let src = i + byte_shift;
            if src >= ID_LEN {
                break;
            }
            let mut v = self.0[src] << bit_shift;
            if bit_shift > 0 && src + 1 < ID_LEN {
                v |= self.0[src + 1] >> (8 - bit_shift);
            }
            *slot = v;
        }
        NodeId(out)
    }

    /// Value of bit `index`, counted from the most significant bit (index 0).
    #[inline]
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < ID_BITS);
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }
}

impl BitXor for NodeId {
    type Output = NodeId;

    fn bitxor(self, rhs: NodeId) -> NodeId {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ rhs.0[i];
        }
        NodeId(out)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// XOR Metric
// ============================================================================

#[inline]
pub fn distance(a: &NodeId, b: &NodeId) -> NodeId {
    *a ^ *b
}

/// Index of the most significant differing bit, 159 being the MSB.
/// Returns `-1` when the IDs are equal.
pub fn distance_exp(a: &NodeId, b: &NodeId) -> i32 {
    let lz = distance(a, b).leading_zeros();
    ID_BITS as i32 - 1 - lz as i32
}

/// Smallest `distance_exp` between `target` and any of `ids`.
/// Returns 159 for an empty slice.
pub fn min_distance_exp(target: &NodeId, ids: &[NodeId]) -> i32 {
    ids.iter()
        .map(|id| distance_exp(target, id))
        .min()
        .unwrap_or(ID_BITS as i32 - 1)
}

/// Order `a` and `b` by XOR closeness to `target`. `Less` means `a` is closer.
///
/// Distinct IDs never tie under XOR, so `Equal` only occurs when `a == b`.
#[inline]
pub fn compare_ref(a: &NodeId, b: &NodeId, target: &NodeId) -> Ordering {
    distance(a, target).cmp(&distance(b, target))
}

/// An ID with the top `bits` bits set and the rest zero.
pub fn generate_prefix_mask(bits: usize) -> NodeId {
    let bits = bits.min(ID_BITS);
    let mut out = [0u8; ID_LEN];
    let full = bits / 8;
    for b in out.iter_mut().take(full) {
        *b = 0xff;
    }
    if full < ID_LEN && bits % 8 != 0 {
        out[full] = 0xffu8 << (8 - bits % 8);
    }
    NodeId(out)
}

/// Sub-bucket slot of `id` for a bucket at `bucket_index` holding
/// `bucket_size` entries (a power of two, at most 256).
///
/// Reads the `log2(bucket_size)` bits just below the bucket's prefix. Non-last
/// buckets skip one more bit, since the bit at `bucket_index` is identical for
/// every entry of an already-split bucket.
pub fn classify_prefix(bucket_index: usize, last_bucket: bool, bucket_size: usize, id: &NodeId) -> u8 {
    debug_assert!(bucket_size > 0 && bucket_size <= 256);
    debug_assert!(bucket_size.is_power_of_two());

    let mask = (bucket_size - 1) as u8;
    if mask == 0 {
        return 0;
    }
    let mask_shift = mask.leading_zeros();
    let mask = mask << mask_shift;

    let shifted = id.shl(bucket_index + usize::from(!last_bucket));
    (shifted.0[0] & mask) >> mask_shift
}

// ============================================================================
// Random and BEP 42 IDs
// ============================================================================

pub fn generate_random_id() -> NodeId {
    NodeId(rand::thread_rng().gen())
}

/// Whether `ip` is in a range exempt from BEP 42 verification.
pub fn is_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 10
                || o[0] == 127
                || (o[0] == 172 && (o[1] & 0xf0) == 16)
                || (o[0] == 192 && o[1] == 168)
                || (o[0] == 169 && o[1] == 254)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_local(&IpAddr::V4(mapped));
            }
            let seg0 = v6.segments()[0];
            v6.is_loopback() || (seg0 & 0xffc0) == 0xfe80 || (seg0 & 0xfe00) == 0xfc00
        }
    }
}

/// CRC32-C over the masked address with the 3 low bits of `r` folded into
/// the first octet.
fn bep42_crc(ip: &IpAddr, r: u32) -> u32 {
    let mut buf = [0u8; 8];
    let len = match ip {
        IpAddr::V4(v4) => {
            buf[..4].copy_from_slice(&v4.octets());
            for (b, m) in buf.iter_mut().zip(V4_MASK.iter()) {
                *b &= m;
            }
            4
        }
        IpAddr::V6(v6) => {
            buf.copy_from_slice(&v6.octets()[..8]);
            for (b, m) in buf.iter_mut().zip(V6_MASK.iter()) {
                *b &= m;
            }
            8
        }
    };
    buf[0] |= ((r & 0x7) << 5) as u8;
    CASTAGNOLI.checksum(&buf[..len])
}

/// Build a BEP 42 node ID for `ip` using the seed byte `r`.
pub fn generate_id_impl(ip: &IpAddr, r: u32) -> NodeId {
    let c = bep42_crc(ip, r);
    let mut rng = rand::thread_rng();
    let mut id = [0u8; ID_LEN];
    id[0] = (c >> 24) as u8;
    id[1] = (c >> 16) as u8;
    id[2] = (((c >> 8) & 0xf8) as u8) | rng.gen_range(0..8u8);
    for b in id.iter_mut().take(19).skip(3) {
        *b = rng.gen();
    }
    id[19] = r as u8;
    NodeId(id)
}

/// Build a BEP 42 node ID for `ip` with a random seed.
pub fn generate_id(ip: &IpAddr) -> NodeId {
    generate_id_impl(ip, rand::thread_rng().gen::<u8>() as u32)
}

/// Check that `id` is consistent with the BEP 42 rules for `source`.
pub fn verify_id(id: &NodeId, source: &IpAddr) -> bool {
    if is_local(source) {
        return true;
    }
    let c = bep42_crc(source, id.0[19] as u32);
    id.0[0] == (c >> 24) as u8
        && id.0[1] == (c >> 16) as u8
        && (id.0[2] & 0xf8) == ((c >> 8) as u8 & 0xf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn id_with_prefix(prefix: &[u8]) -> NodeId {
        let mut bytes = [0u8; ID_LEN];
        bytes[..prefix.len()].copy_from_slice(prefix);
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn distance_exp_is_symmetric_and_defined_for_equal_ids() {
        let a = generate_random_id();
        let b = generate_random_id();
        assert_eq!(distance_exp(&a, &b), distance_exp(&b, &a));
        assert_eq!(distance_exp(&a, &a), -1);

        let zero = NodeId::min();
        assert_eq!(distance_exp(&zero, &id_with_prefix(&[0x80])), 159);
        assert_eq!(distance_exp(&zero, &id_with_prefix(&[0x01])), 152);
        let mut last = [0u8; ID_LEN];
        last[19] = 1;
        assert_eq!(distance_exp(&zero, &NodeId::from_bytes(last)), 0);
    }

    #[test]
    fn compare_ref_orders_by_xor_to_target() {
        let target = id_with_prefix(&[0x10]);
        let near = id_with_prefix(&[0x11]);
        let far = id_with_prefix(&[0x90]);
        assert_eq!(compare_ref(&near, &far, &target), Ordering::Less);
        assert_eq!(compare_ref(&far, &near, &target), Ordering::Greater);
        assert_eq!(compare_ref(&near, &near, &target), Ordering::Equal);
    }

    #[test]
    fn compare_ref_agrees_with_distance_exp() {
        for _ in 0..200 {
            let target = generate_random_id();
            let a = generate_random_id();
            let b = generate_random_id();
            let (ea, eb) = (distance_exp(&a, &target), distance_exp(&b, &target));
            if ea < eb {
                assert_eq!(compare_ref(&a, &b, &target), Ordering::Less);
            } else if ea > eb {
                assert_eq!(compare_ref(&a, &b, &target), Ordering::Greater);
            }
        }
    }

    #[test]
    fn prefix_mask_sets_top_bits() {
        assert_eq!(generate_prefix_mask(0), NodeId::min());
        assert_eq!(generate_prefix_mask(160), NodeId::max());
        assert_eq!(generate_prefix_mask(12), id_with_prefix(&[0xff, 0xf0]));
        assert_eq!(generate_prefix_mask(8), id_with_prefix(&[0xff]));
    }

    #[test]
    fn shl_carries_bits_across_bytes() {
        let id = id_with_prefix(&[0x01, 0x80]);
        assert_eq!(id.shl(1), id_with_prefix(&[0x03]));
        assert_eq!(id.shl(8), id_with_prefix(&[0x80]));
        assert_eq!(id.shl(160), NodeId::min());
    }

    #[test]
    fn classify_prefix_reads_bits_below_bucket_prefix() {
        // last bucket at index 0 includes the top bit
        let id = id_with_prefix(&[0b1010_0000]);
        assert_eq!(classify_prefix(0, true, 8, &id), 0b101);
        // a split bucket skips the defining bit
        assert_eq!(classify_prefix(0, false, 8, &id), 0b010);
        // deeper buckets shift further
        let id = id_with_prefix(&[0b0001_1100]);
        assert_eq!(classify_prefix(3, true, 8, &id), 0b111);
        assert_eq!(classify_prefix(2, false, 4, &id), 0b11);
        for size in [1usize, 2, 4, 8, 16, 128] {
            let slot = classify_prefix(5, false, size, &generate_random_id());
            assert!((slot as usize) < size);
        }
    }

    #[test]
    fn bep42_test_vectors() {
        let vectors: [(Ipv4Addr, u32, [u8; 3]); 5] = [
            (Ipv4Addr::new(124, 31, 75, 21), 1, [0x5f, 0xbf, 0xbf]),
            (Ipv4Addr::new(21, 75, 31, 124), 86, [0x5a, 0x3c, 0xe9]),
            (Ipv4Addr::new(65, 23, 51, 170), 22, [0xa5, 0xd4, 0x32]),
            (Ipv4Addr::new(84, 124, 73, 14), 65, [0x1b, 0x03, 0x21]),
            (Ipv4Addr::new(43, 213, 53, 83), 90, [0xe5, 0x6f, 0x6c]),
        ];
        for (ip, r, prefix) in vectors {
            let ip = IpAddr::V4(ip);
            let id = generate_id_impl(&ip, r);
            assert_eq!(id.as_bytes()[0], prefix[0], "{ip}");
            assert_eq!(id.as_bytes()[1], prefix[1], "{ip}");
            assert_eq!(id.as_bytes()[2] & 0xf8, prefix[2] & 0xf8, "{ip}");
            assert_eq!(id.as_bytes()[19], r as u8);
            assert!(verify_id(&id, &ip));
        }
    }

    #[test]
    fn verify_id_rejects_foreign_ids_but_exempts_local_space() {
        let public = IpAddr::V4(Ipv4Addr::new(124, 31, 75, 21));
        let other = IpAddr::V4(Ipv4Addr::new(21, 75, 31, 124));
        let id = generate_id(&public);
        assert!(verify_id(&id, &public));
        assert!(!verify_id(&id, &other));

        assert!(verify_id(&id, &IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(verify_id(&id, &IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))));
        assert!(verify_id(&id, &IpAddr::V4(Ipv4Addr::new(172, 20, 0, 1))));
        assert!(verify_id(&id, &IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(!verify_id(&id, &IpAddr::V4(Ipv4Addr::new(172, 32, 0, 1))));
    }

    #[test]
    fn bep42_v6_roundtrip() {
        let ip: IpAddr = "2001:db8:85a3::8a2e:370:7334".parse().unwrap();
        let id = generate_id(&ip);
        assert!(verify_id(&id, &ip));
    }

    #[test]
    fn hex_roundtrip_and_debug_prefix() {
        let id = generate_random_id();
        assert_eq!(NodeId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(NodeId::from_hex("abcd").is_err());
        assert_eq!(format!("{id:?}").len(), "NodeId()".len() + 16);
    }

    #[test]
    fn min_distance_exp_picks_closest() {
        let target = NodeId::min();
        let ids = [id_with_prefix(&[0x80]), id_with_prefix(&[0x01])];
        assert_eq!(min_distance_exp(&target, &ids), 152);
        assert_eq!(min_distance_exp(&target, &[]), 159);
    }
}
