//! The block fetcher chain.
//!
//! A block fetcher lazily produces `(index, block)` pairs in ascending
//! index order, signalling end of stream with `None`. When the source and
//! destination block geometries differ, [`sized_block_fetcher`] wraps the
//! chain in an inflator or deflator so the consumer always sees
//! destination-sized blocks.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use blockio_common::{BlockSize, Error};
use blockio_storage::{is_nil_block, BlockStorage};

use crate::error::Result;

/// One fetched block and its index
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockPair {
    pub index: u64,
    pub block: Bytes,
}

/// A lazy producer of `(index, block)` pairs
#[async_trait]
pub trait BlockFetcher: Send {
    /// Fetch the next pair; `None` once the stream is exhausted.
    async fn fetch_block(&mut self) -> Result<Option<BlockPair>>;
}

/// Wrap `fetcher` so it yields `dst`-sized blocks.
///
/// Returns the fetcher unchanged when the sizes match; otherwise an
/// inflator (`src < dst`) or deflator (`src > dst`).
///
/// # Errors
///
/// `InvalidInput` when the larger size is not a multiple of the smaller.
pub fn sized_block_fetcher(
    fetcher: Box<dyn BlockFetcher>,
    src: BlockSize,
    dst: BlockSize,
) -> Result<Box<dyn BlockFetcher>> {
    let (src, dst) = (src.bytes_u64(), dst.bytes_u64());
    if src < dst {
        if dst % src != 0 {
            return Err(Error::invalid_input(format!(
                "destination block size {dst} is not a multiple of source block size {src}"
            ))
            .into());
        }
        Ok(Box::new(InflationBlockFetcher::new(fetcher, src, dst)))
    } else if src > dst {
        if src % dst != 0 {
            return Err(Error::invalid_input(format!(
                "source block size {src} is not a multiple of destination block size {dst}"
            ))
            .into());
        }
        Ok(Box::new(DeflationBlockFetcher::new(fetcher, src, dst)))
    } else {
        Ok(fetcher)
    }
}

struct InflationCache {
    output: Vec<u8>,
    offset: u64,
    prev_index: u64,
}

/// Concatenates up to `ratio` source blocks into one destination block.
///
/// The output buffer is zero-initialized, so source blocks missing within
/// a destination span read as zeros. A gap between source indices
/// advances the write offset by the gap size; when that pushes the offset
/// past the destination size, the current output is emitted and the
/// fetched block seeds the next one.
pub struct InflationBlockFetcher {
    inner: Box<dyn BlockFetcher>,
    src_size: u64,
    dst_size: u64,
    ratio: u64,
    cache: Option<InflationCache>,
}

impl InflationBlockFetcher {
    fn new(inner: Box<dyn BlockFetcher>, src_size: u64, dst_size: u64) -> Self {
        Self {
            inner,
            src_size,
            dst_size,
            ratio: dst_size / src_size,
            cache: None,
        }
    }

    fn seed(&self, pair: &BlockPair) -> InflationCache {
        let mut output = vec![0u8; self.dst_size as usize];
        let offset = (pair.index % self.ratio) * self.src_size;
        copy_block(&mut output, offset, &pair.block, self.src_size);
        InflationCache {
            output,
            offset: offset + self.src_size,
            prev_index: pair.index,
        }
    }
}

#[async_trait]
impl BlockFetcher for InflationBlockFetcher {
    async fn fetch_block(&mut self) -> Result<Option<BlockPair>> {
        let mut cache = match self.cache.take() {
            Some(cache) => cache,
            None => match self.inner.fetch_block().await? {
                Some(pair) => self.seed(&pair),
                None => return Ok(None),
            },
        };

        // fill the destination block as far as the source stream allows
        while cache.offset < self.dst_size {
            let Some(pair) = self.inner.fetch_block().await? else {
                // the rest of the destination block stays zero
                break;
            };

            // respect the original block spacing before copying
            let index_delta = pair.index - cache.prev_index;
            if index_delta > 1 {
                cache.offset += (index_delta - 1) * self.src_size;
                if cache.offset >= self.dst_size {
                    // the fetched block starts past this destination
                    // block; emit and let it seed the next one
                    let emitted = BlockPair {
                        index: cache.prev_index / self.ratio,
                        block: Bytes::from(cache.output),
                    };
                    self.cache = Some(self.seed(&pair));
                    return Ok(Some(emitted));
                }
            }

            cache.prev_index = pair.index;
            copy_block(&mut cache.output, cache.offset, &pair.block, self.src_size);
            cache.offset += self.src_size;
        }

        Ok(Some(BlockPair {
            index: cache.prev_index / self.ratio,
            block: Bytes::from(cache.output),
        }))
    }
}

/// Splits each source block into `ratio` destination-sized slices.
///
/// All-zero slices are suppressed from the output, but the index counter
/// still advances through them.
pub struct DeflationBlockFetcher {
    inner: Box<dyn BlockFetcher>,
    dst_size: u64,
    ratio: u64,
    /// remainder of the current source block
    current: Bytes,
    /// destination index of the next slice of `current`
    current_index: u64,
}

impl DeflationBlockFetcher {
    fn new(inner: Box<dyn BlockFetcher>, src_size: u64, dst_size: u64) -> Self {
        Self {
            inner,
            dst_size,
            ratio: src_size / dst_size,
            current: Bytes::new(),
            current_index: 0,
        }
    }
}

#[async_trait]
impl BlockFetcher for DeflationBlockFetcher {
    async fn fetch_block(&mut self) -> Result<Option<BlockPair>> {
        loop {
            // keep slicing the current source block
            while !self.current.is_empty() {
                let take = (self.dst_size as usize).min(self.current.len());
                let slice = self.current.split_to(take);
                let index = self.current_index;
                self.current_index += 1;

                if !is_nil_block(&slice) {
                    return Ok(Some(BlockPair {
                        index,
                        block: slice,
                    }));
                }
            }

            let Some(pair) = self.inner.fetch_block().await? else {
                return Ok(None);
            };
            self.current = pair.block;
            self.current_index = pair.index * self.ratio;
        }
    }
}

fn copy_block(output: &mut [u8], offset: u64, block: &[u8], src_size: u64) {
    let offset = offset as usize;
    let len = block.len().min(src_size as usize);
    output[offset..offset + len].copy_from_slice(&block[..len]);
}

/// Fetches blocks from a vdisk's block storage, in the order of the given
/// index list. Indices holding no block are skipped.
pub struct StorageBlockFetcher {
    storage: Arc<BlockStorage>,
    indices: VecDeque<u64>,
}

impl StorageBlockFetcher {
    #[must_use]
    pub fn new(storage: Arc<BlockStorage>, indices: Vec<u64>) -> Self {
        Self {
            storage,
            indices: indices.into(),
        }
    }
}

#[async_trait]
impl BlockFetcher for StorageBlockFetcher {
    async fn fetch_block(&mut self) -> Result<Option<BlockPair>> {
        while let Some(index) = self.indices.pop_front() {
            if let Some(block) = self.storage.get_block(index).await? {
                return Ok(Some(BlockPair { index, block }));
            }
        }
        Ok(None)
    }
}

/// Fetches blocks from a channel; the stream ends when the sender side is
/// dropped. Used to feed reordered worker output through a fetcher chain.
pub struct ChannelBlockFetcher {
    rx: mpsc::Receiver<BlockPair>,
}

impl ChannelBlockFetcher {
    #[must_use]
    pub fn new(rx: mpsc::Receiver<BlockPair>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl BlockFetcher for ChannelBlockFetcher {
    async fn fetch_block(&mut self) -> Result<Option<BlockPair>> {
        Ok(self.rx.recv().await)
    }
}
