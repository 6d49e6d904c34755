//! Backing storage of the heap. Each segment owns one region; releasing
//! the region is its `Drop`.

use std::io::{self, Write};

pub trait Storage: Send + 'static {
    /// A zero filled region of `size` bytes.
    fn allocate(size: usize) -> Self
    where
        Self: Sized;

    fn size(&self) -> usize;

    fn as_slice(&self) -> &[u8];

    fn as_mut_slice(&mut self) -> &mut [u8];

    fn set(&mut self, offset: usize, len: usize, value: u8) {
        self.as_mut_slice()[offset..offset + len].fill(value);
    }

    fn dump(&self, w: &mut dyn Write, offset: usize, len: usize) -> io::Result<()> {
        w.write_all(&self.as_slice()[offset..offset + len])
    }
}

/// A plain in-process byte buffer.
pub struct MemoryStorage {
    buf: Box<[u8]>,
}

impl Storage for MemoryStorage {
    fn allocate(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
        }
    }

    fn size(&self) -> usize { self.buf.len() }

    fn as_slice(&self) -> &[u8] { &self.buf }

    fn as_mut_slice(&mut self) -> &mut [u8] { &mut self.buf }
}
