use serde::{Deserialize, Serialize};

/// Chain the indexer is attached to.
///
/// Discriminants are part of the client-facing encoding and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Network {
    Bch = 0,
    Xec = 1,
    Xpi = 2,
    Xrg = 3,
}

impl Network {
    /// Stable wire discriminant.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Network::Bch),
            1 => Some(Network::Xec),
            2 => Some(Network::Xpi),
            3 => Some(Network::Xrg),
            _ => None,
        }
    }
}
