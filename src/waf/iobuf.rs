//! Block-chained byte buffer used by the stream filters.
//!
//! Mirrors the shape of the host proxy's reference-counted I/O buffers:
//! data is appended as whole blocks, consumed from the front, and split
//! off without copying when a block boundary allows it.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

#[derive(Debug, Default)]
pub struct IoBuffer {
    blocks: VecDeque<Bytes>,
    len: usize,
}

impl IoBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes available to a reader.
    pub fn available(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a block without copying.
    pub fn push(&mut self, block: Bytes) {
        if block.is_empty() {
            return;
        }
        self.len += block.len();
        self.blocks.push_back(block);
    }

    /// Appends by copy.
    pub fn write(&mut self, data: &[u8]) {
        self.push(Bytes::copy_from_slice(data));
    }

    /// Iterates the blocks currently staged, front to back.
    pub fn blocks(&self) -> impl Iterator<Item = &Bytes> {
        self.blocks.iter()
    }

    /// Copies the first `n` bytes without consuming them.
    pub fn copy(&self, n: usize) -> Bytes {
        let n = n.min(self.len);
        let mut out = BytesMut::with_capacity(n);
        let mut left = n;
        for block in &self.blocks {
            if left == 0 {
                break;
            }
            let take = left.min(block.len());
            out.extend_from_slice(&block[..take]);
            left -= take;
        }
        out.freeze()
    }

    /// Advances the reader past `n` bytes, discarding them.
    pub fn consume(&mut self, n: usize) {
        let mut left = n.min(self.len);
        self.len -= left;
        while left > 0 {
            let front = self.blocks.front_mut().expect("len accounted for");
            if front.len() <= left {
                left -= front.len();
                self.blocks.pop_front();
            } else {
                let _ = front.split_to(left);
                left = 0;
            }
        }
    }

    /// Splits off the first `n` bytes. Single-block splits are zero-copy;
    /// spans are gathered into one block.
    pub fn split_to(&mut self, n: usize) -> Bytes {
        let n = n.min(self.len);
        if n == 0 {
            return Bytes::new();
        }
        self.len -= n;
        {
            let front = self.blocks.front_mut().expect("len accounted for");
            if front.len() > n {
                return front.split_to(n);
            }
            if front.len() == n {
                return self.blocks.pop_front().expect("front exists");
            }
        }
        let mut out = BytesMut::with_capacity(n);
        let mut left = n;
        while left > 0 {
            let front = self.blocks.front_mut().expect("len accounted for");
            if front.len() <= left {
                left -= front.len();
                out.extend_from_slice(front);
                self.blocks.pop_front();
            } else {
                out.extend_from_slice(&front.split_to(left));
                left = 0;
            }
        }
        out.freeze()
    }

    /// Drains everything into one block.
    pub fn take_all(&mut self) -> Bytes {
        let n = self.len;
        self.split_to(n)
    }
}
