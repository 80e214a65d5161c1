//! Script fingerprints used as index keys.
//!
//! A fingerprint is a `(prefix, payload)` pair identifying a class of
//! spending conditions: the hash160 for P2PKH/P2SH, the pubkey for P2PK, and
//! the full bytecode for anything else. OP_RETURN outputs are unspendable and
//! have no fingerprint.

use bitcoin::Script;
use serde::{Deserialize, Serialize};

/// Script class tag, used as the first byte of every script-keyed index
/// entry. Values are stable; they are part of the database layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum PayloadPrefix {
    Other = 0,
    P2pk = 1,
    P2pkh = 2,
    P2sh = 3,
}

impl PayloadPrefix {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PayloadPrefix::Other),
            1 => Some(PayloadPrefix::P2pk),
            2 => Some(PayloadPrefix::P2pkh),
            3 => Some(PayloadPrefix::P2sh),
            _ => None,
        }
    }
}

/// A script fingerprint: `(class, payload bytes)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScriptPayload {
    pub prefix: PayloadPrefix,
    pub payload: Vec<u8>,
}

impl ScriptPayload {
    /// Classify an output script.
    ///
    /// Returns `None` for OP_RETURN scripts, which can never be spent and are
    /// not indexed.
    pub fn from_script(script: &Script) -> Option<Self> {
        let bytes = script.as_bytes();
        if script.is_op_return() {
            return None;
        }
        if script.is_p2pkh() {
            return Some(ScriptPayload {
                prefix: PayloadPrefix::P2pkh,
                payload: bytes[3..23].to_vec(),
            });
        }
        if script.is_p2sh() {
            return Some(ScriptPayload {
                prefix: PayloadPrefix::P2sh,
                payload: bytes[2..22].to_vec(),
            });
        }
        if script.is_p2pk() {
            // Push of a 33-byte or 65-byte pubkey followed by OP_CHECKSIG.
            return Some(ScriptPayload {
                prefix: PayloadPrefix::P2pk,
                payload: bytes[1..bytes.len() - 1].to_vec(),
            });
        }
        Some(ScriptPayload {
            prefix: PayloadPrefix::Other,
            payload: bytes.to_vec(),
        })
    }

    /// Construct from already-classified parts, e.g. a client request.
    pub fn new(prefix: PayloadPrefix, payload: Vec<u8>) -> Self {
        ScriptPayload { prefix, payload }
    }

    /// Key bytes for script-keyed column families: prefix tag then payload.
    pub fn to_key_bytes(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + self.payload.len());
        key.push(self.prefix as u8);
        key.extend_from_slice(&self.payload);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::ScriptBuf;
    use bitcoin::hashes::Hash;

    #[test]
    fn test_p2pkh_payload() {
        let hash = bitcoin::PubkeyHash::from_byte_array([0xab; 20]);
        let script = ScriptBuf::new_p2pkh(&hash);
        let payload = ScriptPayload::from_script(&script).unwrap();
        assert_eq!(payload.prefix, PayloadPrefix::P2pkh);
        assert_eq!(payload.payload, vec![0xab; 20]);
        assert_eq!(payload.to_key_bytes()[0], 2);
    }

    #[test]
    fn test_p2pkh_payload_from_raw_script() {
        // OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG
        let raw = hex_literal::hex!("76a914000102030405060708090a0b0c0d0e0f1011121388ac");
        let script = ScriptBuf::from_bytes(raw.to_vec());
        let payload = ScriptPayload::from_script(&script).unwrap();
        assert_eq!(payload.prefix, PayloadPrefix::P2pkh);
        assert_eq!(payload.payload, raw[3..23].to_vec());
    }

    #[test]
    fn test_p2pk_payload() {
        // 33-byte compressed pubkey push followed by OP_CHECKSIG.
        let mut raw = vec![0x21, 0x02];
        raw.extend_from_slice(&[0x11; 32]);
        raw.push(0xac);
        let script = ScriptBuf::from_bytes(raw.clone());
        let payload = ScriptPayload::from_script(&script).unwrap();
        assert_eq!(payload.prefix, PayloadPrefix::P2pk);
        assert_eq!(payload.payload, raw[1..34].to_vec());
    }

    #[test]
    fn test_p2sh_payload() {
        let hash = bitcoin::ScriptHash::from_byte_array([0xcd; 20]);
        let script = ScriptBuf::new_p2sh(&hash);
        let payload = ScriptPayload::from_script(&script).unwrap();
        assert_eq!(payload.prefix, PayloadPrefix::P2sh);
        assert_eq!(payload.payload, vec![0xcd; 20]);
    }

    #[test]
    fn test_op_return_has_no_payload() {
        let script = ScriptBuf::new_op_return([1, 2, 3]);
        assert_eq!(ScriptPayload::from_script(&script), None);
    }

    #[test]
    fn test_other_script_uses_full_bytecode() {
        let script = ScriptBuf::from_bytes(vec![0x51]); // OP_TRUE
        let payload = ScriptPayload::from_script(&script).unwrap();
        assert_eq!(payload.prefix, PayloadPrefix::Other);
        assert_eq!(payload.payload, vec![0x51]);
    }

    #[test]
    fn test_key_bytes_distinguish_prefixes() {
        let a = ScriptPayload::new(PayloadPrefix::P2pkh, vec![1, 2, 3]);
        let b = ScriptPayload::new(PayloadPrefix::P2sh, vec![1, 2, 3]);
        assert_ne!(a.to_key_bytes(), b.to_key_bytes());
    }
}
