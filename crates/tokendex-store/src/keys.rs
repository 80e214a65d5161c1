//! Key encodings.
//!
//! Integer key components are big-endian so that lexicographic key order
//! equals numeric order; script-keyed tables carry the payload length so
//! that one fingerprint's prefix range can never swallow a longer payload
//! sharing the same leading bytes.

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, Txid};
use tokendex_primitives::{ScriptPayload, TxNum};

pub fn height_key(height: i32) -> [u8; 4] {
    (height as u32).to_be_bytes()
}

pub fn height_from_key(key: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = key.try_into().ok()?;
    Some(u32::from_be_bytes(bytes) as i32)
}

pub fn tx_num_key(tx_num: TxNum) -> [u8; 8] {
    tx_num.to_be_bytes()
}

pub fn tx_num_from_key(key: &[u8]) -> Option<TxNum> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(TxNum::from_be_bytes(bytes))
}

pub fn hash_key(hash: &BlockHash) -> [u8; 32] {
    hash.to_byte_array()
}

pub fn outpoint_key(outpoint: &OutPoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(&outpoint.txid.to_byte_array());
    key[32..].copy_from_slice(&outpoint.vout.to_be_bytes());
    key
}

pub fn outpoint_from_key(key: &[u8]) -> Option<OutPoint> {
    if key.len() != 36 {
        return None;
    }
    let txid_bytes: [u8; 32] = key[..32].try_into().ok()?;
    let vout_bytes: [u8; 4] = key[32..].try_into().ok()?;
    Some(OutPoint {
        txid: Txid::from_byte_array(txid_bytes),
        vout: u32::from_be_bytes(vout_bytes),
    })
}

/// Prefix for all entries of one script fingerprint:
/// `prefix tag ‖ payload len (BE16) ‖ payload`.
pub fn script_prefix(script: &ScriptPayload) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + script.payload.len());
    key.push(script.prefix as u8);
    key.extend_from_slice(&(script.payload.len() as u16).to_be_bytes());
    key.extend_from_slice(&script.payload);
    key
}

/// Script prefix followed by a suffix (tx num or outpoint).
pub fn script_key(script: &ScriptPayload, suffix: &[u8]) -> Vec<u8> {
    let mut key = script_prefix(script);
    key.extend_from_slice(suffix);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokendex_primitives::PayloadPrefix;

    #[test]
    fn test_tx_num_keys_sort_numerically() {
        assert!(tx_num_key(1) < tx_num_key(2));
        assert!(tx_num_key(255) < tx_num_key(256));
        assert!(tx_num_key(u64::from(u32::MAX)) < tx_num_key(u64::from(u32::MAX) + 1));
        assert_eq!(tx_num_from_key(&tx_num_key(77)), Some(77));
    }

    #[test]
    fn test_outpoint_key_roundtrip() {
        let outpoint = OutPoint {
            txid: Txid::from_byte_array([0xab; 32]),
            vout: 513,
        };
        let key = outpoint_key(&outpoint);
        assert_eq!(outpoint_from_key(&key), Some(outpoint));
        // vout is ordered numerically within a txid.
        let next = OutPoint { vout: 514, ..outpoint };
        assert!(key < outpoint_key(&next));
    }

    #[test]
    fn test_script_prefix_disambiguates_payload_length() {
        let short = ScriptPayload::new(PayloadPrefix::Other, vec![1, 2]);
        let long = ScriptPayload::new(PayloadPrefix::Other, vec![1, 2, 3]);
        let short_entry = script_key(&short, &tx_num_key(9));
        // An entry for the longer payload must not fall in the shorter
        // payload's prefix range.
        assert!(!script_key(&long, &tx_num_key(1)).starts_with(&script_prefix(&short)));
        assert!(short_entry.starts_with(&script_prefix(&short)));
    }
}
