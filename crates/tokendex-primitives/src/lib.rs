//! Shared data model for the tokendex indexer.
//!
//! Everything here is a plain value type: consensus data is represented with
//! the `bitcoin` crate's types, index-derived data (token validity, spent-by
//! references, confirmation status) with types defined in this crate.

mod block;
mod net;
mod script;
mod token;
mod tx;
mod utxo;

pub use self::block::{BlockInfo, BlockMetadata};
pub use self::net::Network;
pub use self::script::{PayloadPrefix, ScriptPayload};
pub use self::token::{
    GenesisInfo, TokenAmount, TokenBurn, TokenId, TokenMeta, TokenTxData, TokenTxType, TokenType,
};
pub use self::tx::{RichTx, RichTxInput, RichTxOutput, TxNum, TxStatus};
pub use self::utxo::{Utxo, UtxoState, UtxoStateVariant, UtxoTokenData};
