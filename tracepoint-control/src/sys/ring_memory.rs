/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use crate::perf_abi::mmap_page;
use nix::sys::mman::munmap;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use tracing::warn;

#[derive(Debug)]
enum Backing {
    /// Pages mapped from a perf event handle; unmapped on drop.
    Mapped,
    /// Heap memory standing in for a kernel mapping.
    Owned(Box<[u64]>),
}

/// One ring buffer mapping: a header page followed by the data region.
///
/// The kernel writes into this memory concurrently with our reads; only the
/// header's `data_head`/`data_tail` words are used for synchronisation.
#[derive(Debug)]
pub struct RingMemory {
    base: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// The mapping is plain memory owned by this value; the head/tail protocol does
// not depend on which thread reads it.
unsafe impl Send for RingMemory {}

impl RingMemory {
    /// Takes ownership of a mapping created with `mmap`.
    ///
    /// # Safety
    /// `base` must be the page-aligned start of a live mapping of `len` bytes
    /// that is not unmapped elsewhere.
    pub unsafe fn from_mapping(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len, backing: Backing::Mapped }
    }

    /// Zero-initialised heap memory with the layout of a ring mapping.
    pub fn owned(len: usize) -> Self {
        let words = (len + 7) / 8;
        let mut storage = vec![0u64; words].into_boxed_slice();
        let base = NonNull::new(storage.as_mut_ptr().cast::<u8>())
            .unwrap_or(NonNull::dangling());
        Self { base, len, backing: Backing::Owned(storage) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One of the 64-bit words of the header page.
    pub(crate) fn header_word(&self, offset: usize) -> Option<&AtomicU64> {
        if offset % 8 != 0 || offset + 8 > self.len.min(mmap_page::MIN_SIZE) {
            return None;
        }

        // SAFETY: offset is in bounds and 8-aligned, and the base is at least
        // 8-aligned (page aligned for mappings, u64 storage for owned memory).
        Some(unsafe { &*self.base.as_ptr().add(offset).cast::<AtomicU64>() })
    }

    /// `len` bytes starting at `offset`.
    pub(crate) fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }

        // SAFETY: bounds checked above; the memory lives as long as `self`.
        Some(unsafe {
            std::slice::from_raw_parts(self.base.as_ptr().add(offset), len)
        })
    }

    /// Mutable access to the whole region, used to play the kernel's part.
    #[cfg(test)]
    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: `&mut self` guarantees exclusive access to the region.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }
}

impl Drop for RingMemory {
    fn drop(&mut self) {
        if let Backing::Mapped = self.backing {
            // SAFETY: created by `from_mapping`, unmapped exactly once here.
            if let Err(e) =
                unsafe { munmap(self.base.as_ptr().cast(), self.len) }
            {
                warn!("failed to unmap ring buffer of {} bytes: {e}", self.len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn owned_memory_exposes_header_words() {
        let ring = RingMemory::owned(4096 * 2);
        let head = ring.header_word(mmap_page::DATA_HEAD).expect("head");
        head.store(64, Ordering::Release);

        let bytes = ring.bytes(mmap_page::DATA_HEAD, 8).expect("bytes");
        assert_eq!(u64::from_ne_bytes(bytes.try_into().expect("8 bytes")), 64);
    }

    #[test]
    fn header_word_rejects_misaligned_offsets() {
        let ring = RingMemory::owned(4096);
        assert!(ring.header_word(1028).is_none());
        assert!(ring.header_word(8192).is_none());
    }
}
