//! Snapshot export.
//!
//! Reads every stored block of a vdisk, reconciles block geometry,
//! deduplicates by plaintext content hash and uploads
//! compress-then-encrypt sealed blocks to the backup store. The deduped
//! map uploads last, only after every worker drained: a failed export
//! never commits a map.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use blockio_common::{BlockHash, BlockSize, Error, Source};
use blockio_storage::{is_nil_block, list_block_indices};

use crate::compress::CompressionType;
use crate::config::{open_source_storage, BackupConfig};
use crate::crypto::Crypter;
use crate::driver::StorageDriver;
use crate::error::{BackupError, Result};
use crate::fetcher::{sized_block_fetcher, BlockFetcher, BlockPair, StorageBlockFetcher};
use crate::map::DedupedMap;

/// Export a vdisk snapshot to the backup store.
pub async fn export_vdisk(
    source: Arc<dyn Source>,
    driver: Arc<dyn StorageDriver>,
    cfg: BackupConfig,
) -> Result<()> {
    let snapshot_id = cfg.snapshot_id();
    let snapshot_block_size = cfg.snapshot_block_size()?;
    let jobs = cfg.jobs();
    let crypter = Crypter::new(&cfg.crypto_key)?;

    let src = open_source_storage(source.as_ref(), &cfg.vdisk_id)?;
    let indices =
        list_block_indices(&cfg.vdisk_id, src.static_cfg.vdisk_type, &src.cluster).await?;
    tracing::info!(
        vdisk = %cfg.vdisk_id,
        snapshot = %snapshot_id,
        blocks = indices.len(),
        jobs,
        "exporting vdisk snapshot"
    );

    let map = load_or_create_map(
        driver.as_ref(),
        &snapshot_id,
        snapshot_block_size,
        cfg.compression,
        &crypter,
        cfg.force,
    )
    .await?;
    let map = Arc::new(map);

    let fetcher = sized_block_fetcher(
        Box::new(StorageBlockFetcher::new(src.storage.clone(), indices)),
        src.static_cfg.block_size,
        snapshot_block_size,
    )?;

    let ctx = Arc::new(ExportContext {
        map: map.clone(),
        known: Mutex::new(map.known_hashes()),
        driver: driver.clone(),
        compression: cfg.compression,
        crypter: crypter.clone(),
        snapshot_id: snapshot_id.clone(),
        cancel: CancellationToken::new(),
    });

    let (tx, rx) = mpsc::channel::<BlockPair>(jobs * 2);
    let rx = Arc::new(AsyncMutex::new(rx));
    let mut workers = JoinSet::new();
    for _ in 0..jobs {
        workers.spawn(export_worker(rx.clone(), ctx.clone()));
    }
    drop(rx);

    let feed_result = feed_blocks(fetcher, tx, &ctx.cancel).await;
    if feed_result.is_err() {
        ctx.cancel.cancel();
    }

    let mut first_error = feed_result.err();
    while let Some(joined) = workers.join_next().await {
        let result = joined.unwrap_or(Err(BackupError::WorkerLost));
        if let Err(err) = result {
            ctx.cancel.cancel();
            first_error.get_or_insert(err);
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    // the map upload is the final linearization point
    let sealed = map.serialize(cfg.compression, &crypter)?;
    driver.set_deduped_map(&snapshot_id, &sealed).await?;
    tracing::info!(snapshot = %snapshot_id, entries = map.len(), "snapshot exported");
    Ok(())
}

struct ExportContext {
    map: Arc<DedupedMap>,
    /// hashes already present in the backup store
    known: Mutex<HashSet<BlockHash>>,
    driver: Arc<dyn StorageDriver>,
    compression: CompressionType,
    crypter: Crypter,
    snapshot_id: String,
    cancel: CancellationToken,
}

async fn load_or_create_map(
    driver: &dyn StorageDriver,
    snapshot_id: &str,
    block_size: BlockSize,
    compression: CompressionType,
    crypter: &Crypter,
    force: bool,
) -> Result<DedupedMap> {
    let Some(sealed) = driver.get_deduped_map(snapshot_id).await? else {
        return Ok(DedupedMap::new(block_size));
    };
    match DedupedMap::deserialize(&sealed, compression, crypter) {
        Ok(map) if map.block_size() == block_size => Ok(map),
        Ok(map) => {
            if force {
                tracing::warn!(
                    snapshot = %snapshot_id,
                    existing = map.block_size().bytes(),
                    requested = block_size.bytes(),
                    "snapshot block size changed, starting a fresh deduped map"
                );
                return Ok(DedupedMap::new(block_size));
            }
            Err(Error::invalid_input(format!(
                "snapshot {snapshot_id} exists with block size {}, requested {}",
                map.block_size().bytes(),
                block_size.bytes()
            ))
            .into())
        }
        Err(err) => {
            if force {
                tracing::warn!(
                    snapshot = %snapshot_id,
                    error = %err,
                    "existing deduped map cannot be loaded, starting fresh"
                );
                return Ok(DedupedMap::new(block_size));
            }
            Err(err)
        }
    }
}

async fn feed_blocks(
    mut fetcher: Box<dyn BlockFetcher>,
    tx: mpsc::Sender<BlockPair>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let Some(pair) = fetcher.fetch_block().await? else {
            return Ok(());
        };
        // nil blocks are never persisted
        if is_nil_block(&pair.block) {
            continue;
        }
        if tx.send(pair).await.is_err() {
            // all workers are gone; their error surfaces on join
            return Ok(());
        }
    }
}

async fn export_worker(
    rx: Arc<AsyncMutex<mpsc::Receiver<BlockPair>>>,
    ctx: Arc<ExportContext>,
) -> Result<()> {
    loop {
        let pair = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                pair = rx.recv() => pair,
            }
        };
        let Some(pair) = pair else {
            return Ok(());
        };
        if let Err(err) = export_block(&ctx, &pair).await {
            ctx.cancel.cancel();
            return Err(err);
        }
    }
}

async fn export_block(ctx: &ExportContext, pair: &BlockPair) -> Result<()> {
    // content addressing is over the plaintext, uncompressed block, so
    // deduplication is independent of key and compression choices
    let hash = BlockHash::of(&pair.block);

    let fresh = ctx.known.lock().insert(hash);
    if fresh {
        let compressed = ctx.compression.compress(&pair.block)?;
        let sealed = ctx.crypter.encrypt(&compressed)?;
        ctx.driver
            .set_deduped_block(&ctx.snapshot_id, hash, &sealed)
            .await?;
    }

    ctx.map.set(pair.index, hash);
    Ok(())
}
