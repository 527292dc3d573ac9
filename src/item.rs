//! BEP 44 data items.
//!
//! Immutable items are addressed by `SHA1(bencode(v))`. Mutable items are
//! addressed by `SHA1(public_key || salt)` and carry an ed25519 signature over
//! the canonical buffer `[4:salt<len>:<salt>]3:seqi<seq>e1:v<bencode(v)>`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha1::{Digest, Sha1};

use crate::msg::{encode, KrpcError, Value};
use crate::node_id::NodeId;

/// Largest bencoded `v` accepted in a put.
pub const ITEM_MAX_SIZE: usize = 1000;
/// Largest salt accepted in a put.
pub const SALT_MAX_SIZE: usize = 64;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

pub fn hash(data: &[u8]) -> NodeId {
    let digest: [u8; 20] = Sha1::digest(data).into();
    NodeId::from_bytes(digest)
}

/// Target of an immutable item, given its bencoded value.
pub fn item_target_id(encoded_value: &[u8]) -> NodeId {
    hash(encoded_value)
}

/// Target of a mutable item.
pub fn mutable_target_id(public_key: &[u8; PUBLIC_KEY_LEN], salt: &[u8]) -> NodeId {
    let mut h = Sha1::new();
    h.update(public_key);
    h.update(salt);
    NodeId::from_bytes(h.finalize().into())
}

/// The byte string a mutable item's signature covers.
pub fn canonical_string(encoded_value: &[u8], seq: i64, salt: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_value.len() + salt.len() + 32);
    if !salt.is_empty() {
        buf.extend_from_slice(b"4:salt");
        buf.extend_from_slice(salt.len().to_string().as_bytes());
        buf.push(b':');
        buf.extend_from_slice(salt);
    }
    buf.extend_from_slice(b"3:seqi");
    buf.extend_from_slice(seq.to_string().as_bytes());
    buf.extend_from_slice(b"e1:v");
    buf.extend_from_slice(encoded_value);
    buf
}

pub fn sign_mutable_item(encoded_value: &[u8], salt: &[u8], seq: i64, key: &SigningKey) -> [u8; SIGNATURE_LEN] {
    key.sign(&canonical_string(encoded_value, seq, salt)).to_bytes()
}

pub fn verify_mutable_item(
    encoded_value: &[u8],
    salt: &[u8],
    seq: i64,
    public_key: &[u8; PUBLIC_KEY_LEN],
    sig: &[u8; SIGNATURE_LEN],
) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    vk.verify(&canonical_string(encoded_value, seq, salt), &Signature::from_bytes(sig))
        .is_ok()
}

/// A value stored in or fetched from the DHT.
#[derive(Debug, Clone)]
pub struct Item {
    value: Value,
    encoded: Vec<u8>,
    mutable: Option<MutableParts>,
}

#[derive(Debug, Clone)]
struct MutableParts {
    public_key: [u8; PUBLIC_KEY_LEN],
    signature: [u8; SIGNATURE_LEN],
    seq: i64,
    salt: Vec<u8>,
}

impl Item {
    pub fn immutable(value: Value) -> Result<Self, KrpcError> {
        let encoded = encode(&value)?;
        Ok(Self { value, encoded, mutable: None })
    }

    /// Build and sign a mutable item.
    pub fn mutable(value: Value, salt: Vec<u8>, seq: i64, key: &SigningKey) -> Result<Self, KrpcError> {
        let encoded = encode(&value)?;
        let signature = sign_mutable_item(&encoded, &salt, seq, key);
        Ok(Self {
            value,
            encoded,
            mutable: Some(MutableParts {
                public_key: key.verifying_key().to_bytes(),
                signature,
                seq,
                salt,
            }),
        })
    }

    /// Accept a mutable item received from the network, if its signature holds.
    pub fn from_signed(
        value: Value,
        public_key: [u8; PUBLIC_KEY_LEN],
        signature: [u8; SIGNATURE_LEN],
        seq: i64,
        salt: Vec<u8>,
    ) -> Option<Self> {
        let encoded = encode(&value).ok()?;
        if !verify_mutable_item(&encoded, &salt, seq, &public_key, &signature) {
            return None;
        }
        Some(Self {
            value,
            encoded,
            mutable: Some(MutableParts { public_key, signature, seq, salt }),
        })
    }

    pub fn target(&self) -> NodeId {
        match &self.mutable {
            Some(m) => mutable_target_id(&m.public_key, &m.salt),
            None => item_target_id(&self.encoded),
        }
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable.is_some()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Bencoded `v`.
    pub fn encoded_value(&self) -> &[u8] {
        &self.encoded
    }

    pub fn seq(&self) -> i64 {
        self.mutable.as_ref().map_or(0, |m| m.seq)
    }

    pub fn salt(&self) -> &[u8] {
        self.mutable.as_ref().map_or(&[][..], |m| &m.salt)
    }

    pub fn public_key(&self) -> Option<&[u8; PUBLIC_KEY_LEN]> {
        self.mutable.as_ref().map(|m| &m.public_key)
    }

    pub fn signature(&self) -> Option<&[u8; SIGNATURE_LEN]> {
        self.mutable.as_ref().map(|m| &m.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    const TEST_PK: &str = "77ff84905a91936367c01360803104f92432fcd904a43511876df5cdf3e7e548";

    fn test_pk() -> [u8; 32] {
        hex::decode(TEST_PK).unwrap().try_into().unwrap()
    }

    fn sig(s: &str) -> [u8; 64] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn bep44_vector_without_salt() {
        let s = sig("305ac8aeb6c9c151fa120f120ea2cfb923564e11552d06a5d856091e5e853cff\
                     1260d3f39e4999684aa92eb73ffd136e6f4f3ecbfda0ce53a1608ecd7ae21f01");
        assert!(verify_mutable_item(b"12:Hello World!", b"", 1, &test_pk(), &s));
        assert!(!verify_mutable_item(b"12:Hello World!", b"", 2, &test_pk(), &s));
        assert_eq!(
            mutable_target_id(&test_pk(), b"").to_hex(),
            "4a533d47ec9c7d95b1ad75f576cffc641853b750"
        );
    }

    #[test]
    fn bep44_vector_with_salt() {
        let s = sig("6834284b6b24c3204eb2fea824d82f88883a3d95e8b4a21b8c0ded553d17d17d\
                     df9a8a7104b1258f30bed3787e6cb896fca78c58f8e03b5f18f14951a87d9a08");
        assert!(verify_mutable_item(b"12:Hello World!", b"foobar", 1, &test_pk(), &s));
        assert!(!verify_mutable_item(b"12:Hello World!", b"", 1, &test_pk(), &s));
        assert_eq!(
            mutable_target_id(&test_pk(), b"foobar").to_hex(),
            "411eba73b6f087ca51a3795d9c8c938d365e32c1"
        );
    }

    #[test]
    fn bep44_immutable_target() {
        let item = Item::immutable(Value::Bytes(b"Hello World!".to_vec())).unwrap();
        assert_eq!(item.encoded_value(), b"12:Hello World!");
        assert_eq!(item.target().to_hex(), "e5f96f6f38320f0f33959cb4d3d656452117aadb");
        assert!(!item.is_mutable());
    }

    #[test]
    fn canonical_buffer_layout() {
        assert_eq!(canonical_string(b"1:x", 5, b""), b"3:seqi5e1:v1:x".to_vec());
        assert_eq!(canonical_string(b"1:x", 5, b"ab"), b"4:salt2:ab3:seqi5e1:v1:x".to_vec());
    }

    #[test]
    fn signed_items_verify_and_tampering_fails() {
        let key = SigningKey::generate(&mut OsRng);
        let item = Item::mutable(Value::Int(42), b"salt".to_vec(), 7, &key).unwrap();
        let pk = *item.public_key().unwrap();
        let s = *item.signature().unwrap();

        let received = Item::from_signed(Value::Int(42), pk, s, 7, b"salt".to_vec()).unwrap();
        assert_eq!(received.target(), item.target());
        assert_eq!(received.seq(), 7);

        assert!(Item::from_signed(Value::Int(43), pk, s, 7, b"salt".to_vec()).is_none());
        assert!(Item::from_signed(Value::Int(42), pk, s, 8, b"salt".to_vec()).is_none());
    }
}
