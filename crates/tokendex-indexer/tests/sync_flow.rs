//! End-to-end tests driving the synchronizer through the node-event channel
//! and observing the results through queries and subscriptions.

use std::time::Duration;

use bitcoin::absolute::LockTime;
use bitcoin::blockdata::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version as TxVersion;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Txid, Witness,
};
use tokendex_indexer::{Indexer, IndexerConfig, NodeEvent, SubscribeMessage, SyncState};
use tokendex_primitives::{Network, ScriptPayload, TxStatus, UtxoStateVariant};
use tokendex_store::HashOrHeight;
use tokio::sync::broadcast;

fn p2pkh(byte: u8) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::from_byte_array([byte; 20]))
}

fn payload(byte: u8) -> ScriptPayload {
    ScriptPayload::from_script(&p2pkh(byte)).unwrap()
}

fn coinbase_tx(height: i32, value: u64, script_byte: u8) -> Transaction {
    let mut sig = vec![0x03];
    sig.extend_from_slice(&height.to_le_bytes()[..3]);
    Transaction {
        version: TxVersion::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(sig),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: p2pkh(script_byte),
        }],
    }
}

fn spend_tx(prev_outs: &[OutPoint], outputs: &[(u64, ScriptBuf)]) -> Transaction {
    Transaction {
        version: TxVersion::TWO,
        lock_time: LockTime::ZERO,
        input: prev_outs
            .iter()
            .map(|&prev_out| TxIn {
                previous_output: prev_out,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|(value, script)| TxOut {
                value: Amount::from_sat(*value),
                script_pubkey: script.clone(),
            })
            .collect(),
    }
}

fn make_block(prev: BlockHash, time: u32, txs: Vec<Transaction>) -> Block {
    Block {
        header: Header {
            version: BlockVersion::TWO,
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time,
            bits: CompactTarget::from_consensus(0x1d00ffff),
            nonce: time,
        },
        txdata: txs,
    }
}

fn genesis_prev() -> BlockHash {
    BlockHash::all_zeros()
}

fn outpoint(tx: &Transaction, vout: u32) -> OutPoint {
    OutPoint {
        txid: tx.compute_txid(),
        vout,
    }
}

fn setup() -> (tempfile::TempDir, Indexer) {
    let dir = tempfile::tempdir().unwrap();
    let (indexer, synchronizer) =
        Indexer::open(dir.path(), Network::Xec, IndexerConfig::default()).unwrap();
    tokio::spawn(synchronizer.run());
    (dir, indexer)
}

async fn recv(receiver: &mut broadcast::Receiver<SubscribeMessage>) -> SubscribeMessage {
    tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("timed out waiting for a subscription message")
        .expect("subscription channel closed")
}

async fn wait_for_height(indexer: &Indexer, height: i32) {
    let query = indexer.query();
    for _ in 0..500 {
        if query.block(HashOrHeight::Height(height)).is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("index never reached height {height}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_confirmed_notifications_follow_block_order() {
    let (_dir, indexer) = setup();
    let mut receiver = indexer.subscriptions().subscribe(&payload(0xaa));

    let coinbase0 = coinbase_tx(0, 50_000, 0xaa);
    let block0 = make_block(genesis_prev(), 1000, vec![coinbase0.clone()]);
    indexer
        .events()
        .send(NodeEvent::BlockConnected(block0.clone()))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut receiver).await,
        SubscribeMessage::Confirmed(coinbase0.compute_txid())
    );

    // Two transactions touching the subscribed script in one block must
    // arrive as two Confirmed messages in their in-block order.
    let tx_a = spend_tx(&[outpoint(&coinbase0, 0)], &[(49_000, p2pkh(0xaa))]);
    let tx_b = spend_tx(&[outpoint(&tx_a, 0)], &[(48_000, p2pkh(0xaa))]);
    let block1 = make_block(
        block0.block_hash(),
        1001,
        vec![coinbase_tx(1, 50_000, 0xee), tx_a.clone(), tx_b.clone()],
    );
    indexer
        .events()
        .send(NodeEvent::BlockConnected(block1))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut receiver).await,
        SubscribeMessage::Confirmed(tx_a.compute_txid())
    );
    assert_eq!(
        recv(&mut receiver).await,
        SubscribeMessage::Confirmed(tx_b.compute_txid())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mempool_lifecycle_notifications() {
    let (_dir, indexer) = setup();
    let mut receiver = indexer.subscriptions().subscribe(&payload(0xaa));

    let coinbase0 = coinbase_tx(0, 50_000, 0xaa);
    let block0 = make_block(genesis_prev(), 1000, vec![coinbase0.clone()]);
    indexer
        .events()
        .send(NodeEvent::BlockConnected(block0.clone()))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut receiver).await,
        SubscribeMessage::Confirmed(coinbase0.compute_txid())
    );

    // The spend touches the subscribed script through its input.
    let tx1 = spend_tx(&[outpoint(&coinbase0, 0)], &[(49_000, p2pkh(0xbb))]);
    let txid1 = tx1.compute_txid();
    indexer
        .events()
        .send(NodeEvent::MempoolTxAdded {
            tx: tx1.clone(),
            time_first_seen: 1500,
        })
        .await
        .unwrap();
    assert_eq!(recv(&mut receiver).await, SubscribeMessage::AddedToMempool(txid1));

    indexer
        .events()
        .send(NodeEvent::MempoolTxRemoved(txid1))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut receiver).await,
        SubscribeMessage::RemovedFromMempool(txid1)
    );

    // Re-added, then confirmed by a block.
    indexer
        .events()
        .send(NodeEvent::MempoolTxAdded {
            tx: tx1.clone(),
            time_first_seen: 1600,
        })
        .await
        .unwrap();
    assert_eq!(recv(&mut receiver).await, SubscribeMessage::AddedToMempool(txid1));

    let query = indexer.query();
    let rich = query.tx(&txid1).unwrap();
    assert_eq!(rich.status, TxStatus::Mempool);
    assert_eq!(rich.time_first_seen, 1600);

    let block1 = make_block(
        block0.block_hash(),
        1001,
        vec![coinbase_tx(1, 50_000, 0xee), tx1.clone()],
    );
    indexer
        .events()
        .send(NodeEvent::BlockConnected(block1))
        .await
        .unwrap();
    assert_eq!(recv(&mut receiver).await, SubscribeMessage::Confirmed(txid1));
    let rich = query.tx(&txid1).unwrap();
    assert!(rich.status.is_confirmed());
    assert_eq!(rich.time_first_seen, 1600);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reorg_walks_back_and_requeues() {
    let (_dir, indexer) = setup();
    let mut receiver_b = indexer.subscriptions().subscribe(&payload(0xbb));

    let coinbase0 = coinbase_tx(0, 50_000, 0xaa);
    let block0 = make_block(genesis_prev(), 1000, vec![coinbase0.clone()]);
    indexer
        .events()
        .send(NodeEvent::BlockConnected(block0.clone()))
        .await
        .unwrap();

    // Branch A: a coinbase paying 0xbb plus a spend of the old coinbase.
    let coinbase1a = coinbase_tx(1, 50_000, 0xbb);
    let spend = spend_tx(&[outpoint(&coinbase0, 0)], &[(49_000, p2pkh(0xcc))]);
    let block1a = make_block(
        block0.block_hash(),
        1001,
        vec![coinbase1a.clone(), spend.clone()],
    );
    indexer
        .events()
        .send(NodeEvent::BlockConnected(block1a.clone()))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut receiver_b).await,
        SubscribeMessage::Confirmed(coinbase1a.compute_txid())
    );

    // The node reorganizes to branch B: a sibling of block1a arrives whose
    // parent is block0. The synchronizer must walk block1a back first.
    let coinbase1b = coinbase_tx(1, 50_000, 0xdd);
    let block1b = make_block(block0.block_hash(), 2001, vec![coinbase1b.clone()]);
    indexer
        .events()
        .send(NodeEvent::BlockConnected(block1b.clone()))
        .await
        .unwrap();

    // The reorged-out coinbase cannot re-enter the mempool.
    assert_eq!(
        recv(&mut receiver_b).await,
        SubscribeMessage::Reorg(coinbase1a.compute_txid())
    );

    wait_for_height(&indexer, 1).await;
    let query = indexer.query();
    assert_eq!(
        query.block(HashOrHeight::Height(1)).unwrap().info.hash,
        block1b.block_hash()
    );

    // The ordinary spend survived the reorg as a mempool tx.
    let rich = query.tx(&spend.compute_txid()).unwrap();
    assert_eq!(rich.status, TxStatus::Mempool);

    // Branch A's block is gone.
    assert!(query.block(HashOrHeight::Hash(block1a.block_hash())).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_query_boundary_validation() {
    let (_dir, indexer) = setup();
    let coinbase0 = coinbase_tx(0, 50_000, 0xaa);
    let block0 = make_block(genesis_prev(), 1000, vec![coinbase0.clone()]);
    let spend = spend_tx(&[outpoint(&coinbase0, 0)], &[(49_000, p2pkh(0xcc))]);
    let block1 = make_block(
        block0.block_hash(),
        1001,
        vec![coinbase_tx(1, 50_000, 0xbb), spend.clone()],
    );
    indexer
        .events()
        .send(NodeEvent::BlockConnected(block0))
        .await
        .unwrap();
    indexer
        .events()
        .send(NodeEvent::BlockConnected(block1))
        .await
        .unwrap();
    wait_for_height(&indexer, 1).await;

    let query = indexer.query();

    let err = query.history_page(&payload(0xaa), 0, 0).unwrap_err();
    assert!(err.is_user_error);
    assert_eq!(err.error_code, "invalid-page-size");
    let err = query.history_page(&payload(0xaa), 0, 10_000).unwrap_err();
    assert!(err.is_user_error);

    let err = query.tx(&Txid::from_byte_array([9; 32])).unwrap_err();
    assert!(err.is_user_error);
    assert_eq!(err.error_code, "tx-not-found");

    let err = query.block(HashOrHeight::Height(99)).unwrap_err();
    assert_eq!(err.error_code, "block-not-found");

    let err = query.blocks_range(3, 1).unwrap_err();
    assert_eq!(err.error_code, "invalid-block-range");
    let infos = query.blocks_range(0, 1).unwrap();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].height, 0);
    assert_eq!(infos[1].height, 1);

    // Batch validation classifies each entry independently, in input order.
    let states = query
        .validate_utxos(&[
            outpoint(&coinbase0, 0),
            outpoint(&spend, 0),
            OutPoint {
                txid: Txid::from_byte_array([9; 32]),
                vout: 0,
            },
            outpoint(&coinbase0, 5),
        ])
        .unwrap();
    assert_eq!(
        states.iter().map(|state| state.variant).collect::<Vec<_>>(),
        vec![
            UtxoStateVariant::Spent,
            UtxoStateVariant::Unspent,
            UtxoStateVariant::NoSuchTx,
            UtxoStateVariant::NoSuchOutput,
        ]
    );

    // A history page served twice comes from the cache the second time and
    // is identical.
    let first = query.history_page(&payload(0xaa), 0, 25).unwrap();
    let second = query.history_page(&payload(0xaa), 0, 25).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.num_pages, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_status_reaches_synced() {
    let (_dir, indexer) = setup();
    assert_eq!(indexer.sync_status().get(), SyncState::Syncing);

    let block0 = make_block(genesis_prev(), 1000, vec![coinbase_tx(0, 50_000, 0xaa)]);
    indexer
        .events()
        .send(NodeEvent::BlockConnected(block0))
        .await
        .unwrap();
    wait_for_height(&indexer, 0).await;

    for _ in 0..500 {
        if indexer.sync_status().get() == SyncState::Synced {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("synchronizer never reported Synced");
}
