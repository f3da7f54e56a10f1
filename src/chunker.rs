//! Splits a byte sequence into fixed-size blocks and hashes each one.

use md5::{Digest, Md5};
use std::num::NonZeroUsize;

/// 4 MiB, the block size the upload protocol expects.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

const PROTOCOL_BLOCK: NonZeroUsize = match NonZeroUsize::new(BLOCK_SIZE) {
    Some(size) => size,
    None => panic!("BLOCK_SIZE is zero"),
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentBlock<'a> {
    pub index: usize,
    pub bytes: &'a [u8],
    pub hash: String,
}

/// Lowercase hex MD5 digest.
pub fn md5_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

pub fn split(data: &[u8]) -> (Vec<ContentBlock<'_>>, Vec<String>) {
    split_with(data, PROTOCOL_BLOCK)
}

/// An empty input still yields one empty block, so empty files negotiate like any other.
pub fn split_with(
    data: &[u8],
    block_size: NonZeroUsize,
) -> (Vec<ContentBlock<'_>>, Vec<String>) {
    if data.is_empty() {
        let hash = md5_hex(data);
        let block = ContentBlock {
            index: 0,
            bytes: data,
            hash: hash.clone(),
        };
        return (vec![block], vec![hash]);
    }

    let blocks = data
        .chunks(block_size.get())
        .enumerate()
        .map(|(index, bytes)| ContentBlock {
            index,
            bytes,
            hash: md5_hex(bytes),
        })
        .collect::<Vec<_>>();
    let hashes = blocks.iter().map(|b| b.hash.clone()).collect();
    (blocks, hashes)
}

/// `ceil(len / block_size)`, or 1 for an empty input.
pub fn block_count(len: usize, block_size: NonZeroUsize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(block_size.get())
    }
}
