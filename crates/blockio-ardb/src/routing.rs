//! Server routing.
//!
//! Free functions shared by every cluster flavor: given the full length of
//! the routing space and a predicate telling which slots are operational,
//! map an object index to a server index deterministically.

use blockio_common::{Error, Result};

/// Find the first operational server index.
///
/// # Errors
///
/// `NoServersAvailable` when the predicate accepts no index; predicate
/// errors propagate.
pub fn find_first_server_index<P>(server_count: u64, mut predicate: P) -> Result<u64>
where
    P: FnMut(u64) -> Result<bool>,
{
    for server_index in 0..server_count {
        if predicate(server_index)? {
            return Ok(server_index);
        }
    }
    Err(Error::NoServersAvailable)
}

/// Compute the server index mapping to the given object index.
///
/// Plain modulo is tried first so that the all-operational default stays
/// cheap and allocation-free. When the modulo slot is not operational, the
/// index is re-routed through rounds of jump-consistent hashing, the key
/// re-seeded from the object index each round so every caller re-routes
/// identically.
///
/// The caller has to ensure at least one server is operational; cluster
/// constructors and reload validation enforce this. Predicate errors
/// propagate.
pub fn compute_server_index<P>(server_count: u64, object_index: u64, mut predicate: P) -> Result<u64>
where
    P: FnMut(u64) -> Result<bool>,
{
    if server_count == 0 {
        return Err(Error::NoServersAvailable);
    }
    let server_index = object_index % server_count;
    if predicate(server_index)? {
        return Ok(server_index);
    }

    let mut key_seed = object_index;
    loop {
        let server_index = jump_consistent_hash(key_seed, server_count);
        if predicate(server_index)? {
            return Ok(server_index);
        }
        key_seed = key_seed.wrapping_add(1);
    }
}

/// Jump consistent hashing, Lamping & Veach (arXiv:1406.2294).
fn jump_consistent_hash(mut key: u64, buckets: u64) -> u64 {
    let mut bucket = 0;
    let mut next = 0;
    while next < buckets {
        bucket = next;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        next = ((bucket + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as u64;
    }
    bucket
}
