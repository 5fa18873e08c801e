//! Snapshot import.
//!
//! Mirror of the export: loads the deduped map, fans workers out over its
//! entries to download, open and verify each referenced block, restores
//! ascending index order, reconciles block geometry, and writes the
//! blocks into the destination vdisk's cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use blockio_common::{BlockHash, BlockSize, Source};
use blockio_storage::BlockStorage;

use crate::compress::CompressionType;
use crate::config::{open_source_storage, BackupConfig};
use crate::crypto::Crypter;
use crate::driver::StorageDriver;
use crate::error::{BackupError, Result};
use crate::fetcher::{sized_block_fetcher, BlockPair, ChannelBlockFetcher};
use crate::map::DedupedMap;

/// Import a snapshot from the backup store into a vdisk.
pub async fn import_vdisk(
    source: Arc<dyn Source>,
    driver: Arc<dyn StorageDriver>,
    cfg: BackupConfig,
) -> Result<()> {
    let snapshot_id = cfg.snapshot_id();
    let jobs = cfg.jobs();
    let crypter = Crypter::new(&cfg.crypto_key)?;

    let sealed = driver
        .get_deduped_map(&snapshot_id)
        .await?
        .ok_or_else(|| BackupError::SnapshotNotFound(snapshot_id.clone()))?;
    let map = DedupedMap::deserialize(&sealed, cfg.compression, &crypter)?;
    let entries = map.entries();
    tracing::info!(
        vdisk = %cfg.vdisk_id,
        snapshot = %snapshot_id,
        blocks = entries.len(),
        jobs,
        "importing vdisk snapshot"
    );
    if entries.is_empty() {
        return Ok(());
    }

    let src = open_source_storage(source.as_ref(), &cfg.vdisk_id)?;

    let cancel = CancellationToken::new();
    let ctx = Arc::new(ImportContext {
        driver: driver.clone(),
        compression: cfg.compression,
        crypter,
        snapshot_id,
        cancel: cancel.clone(),
    });

    let (work_tx, work_rx) = mpsc::channel::<WorkItem>(jobs * 2);
    let work_rx = Arc::new(AsyncMutex::new(work_rx));
    let (done_tx, done_rx) = mpsc::channel::<(usize, BlockPair)>(jobs * 2);

    let mut workers = JoinSet::new();
    for _ in 0..jobs {
        workers.spawn(import_worker(work_rx.clone(), done_tx.clone(), ctx.clone()));
    }
    drop(work_rx);
    drop(done_tx);

    let feeder = tokio::spawn(feed_entries(entries, work_tx, cancel.clone()));

    let (ordered_tx, ordered_rx) = mpsc::channel::<BlockPair>(jobs * 2);
    let collector = tokio::spawn(reorder_results(done_rx, ordered_tx));

    let writer_result = write_blocks(
        ChannelBlockFetcher::new(ordered_rx),
        map.block_size(),
        src.storage.clone(),
    )
    .await;
    if writer_result.is_err() {
        cancel.cancel();
    }

    let _ = feeder.await;
    let _ = collector.await;

    let mut first_error = None;
    while let Some(joined) = workers.join_next().await {
        let result = joined.unwrap_or(Err(BackupError::WorkerLost));
        if let Err(err) = result {
            cancel.cancel();
            first_error.get_or_insert(err);
        }
    }
    let first_error = first_error.or(writer_result.err());
    if let Some(err) = first_error {
        return Err(err);
    }

    src.storage.flush().await?;
    tracing::info!(vdisk = %cfg.vdisk_id, "snapshot imported");
    Ok(())
}

struct ImportContext {
    driver: Arc<dyn StorageDriver>,
    compression: CompressionType,
    crypter: Crypter,
    snapshot_id: String,
    cancel: CancellationToken,
}

#[derive(Clone, Copy)]
struct WorkItem {
    /// position in the sorted entry list, used to restore ordering
    seq: usize,
    index: u64,
    hash: BlockHash,
}

async fn feed_entries(
    entries: Vec<(u64, BlockHash)>,
    tx: mpsc::Sender<WorkItem>,
    cancel: CancellationToken,
) {
    for (seq, (index, hash)) in entries.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return;
        }
        if tx.send(WorkItem { seq, index, hash }).await.is_err() {
            return;
        }
    }
}

/// Re-emit worker results in ascending sequence order; the inflator and
/// deflator downstream depend on it.
async fn reorder_results(
    mut done_rx: mpsc::Receiver<(usize, BlockPair)>,
    ordered_tx: mpsc::Sender<BlockPair>,
) {
    let mut pending: BTreeMap<usize, BlockPair> = BTreeMap::new();
    let mut next_seq = 0usize;
    while let Some((seq, pair)) = done_rx.recv().await {
        pending.insert(seq, pair);
        while let Some(pair) = pending.remove(&next_seq) {
            if ordered_tx.send(pair).await.is_err() {
                return;
            }
            next_seq += 1;
        }
    }
}

async fn write_blocks(
    fetcher: ChannelBlockFetcher,
    snapshot_block_size: BlockSize,
    storage: Arc<BlockStorage>,
) -> Result<()> {
    let mut fetcher = sized_block_fetcher(
        Box::new(fetcher),
        snapshot_block_size,
        storage.block_size(),
    )?;
    while let Some(pair) = fetcher.fetch_block().await? {
        storage.set_block(pair.index, &pair.block).await?;
    }
    Ok(())
}

async fn import_worker(
    work_rx: Arc<AsyncMutex<mpsc::Receiver<WorkItem>>>,
    done_tx: mpsc::Sender<(usize, BlockPair)>,
    ctx: Arc<ImportContext>,
) -> Result<()> {
    loop {
        let item = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                item = rx.recv() => item,
            }
        };
        let Some(item) = item else {
            return Ok(());
        };
        match import_block(&ctx, item).await {
            Ok(block) => {
                let pair = BlockPair {
                    index: item.index,
                    block,
                };
                if done_tx.send((item.seq, pair)).await.is_err() {
                    return Ok(());
                }
            }
            Err(err) => {
                ctx.cancel.cancel();
                return Err(err);
            }
        }
    }
}

async fn import_block(ctx: &ImportContext, item: WorkItem) -> Result<Bytes> {
    let sealed = ctx
        .driver
        .get_deduped_block(&ctx.snapshot_id, item.hash)
        .await?
        .ok_or(BackupError::BlockNotFound { hash: item.hash })?;
    let compressed = ctx.crypter.decrypt(&sealed)?;
    let block = ctx.compression.decompress(&compressed)?;
    if BlockHash::of(&block) != item.hash {
        return Err(BackupError::HashMismatch { hash: item.hash });
    }
    Ok(Bytes::from(block))
}
