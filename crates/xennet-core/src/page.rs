//! `Page`: one page-aligned, page-sized block of memory that can be
//! shared with the peer through a grant.
//!
//! The peer may write into a granted page at any time the protocol
//! allows, so the contents are reached only through raw copies
//! (`read`, `write`, `copy_from`), never through long-lived `&[u8]`
//! borrows. Handles are `Arc<Page>`: the arc keeps the memory alive,
//! the buffer pool's explicit refcount decides when it is recycled.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::wire::PAGE_SIZE;

pub struct Page {
    ptr: NonNull<u8>,
}

// Safety: the page is plain memory. Concurrent access is ordered by the
// ring protocol (a page is written by exactly one side at a time).
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    fn layout() -> Option<Layout> {
        Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).ok()
    }

    /// Allocate a zeroed page. Returns `None` when the allocator fails.
    pub fn new() -> Option<Arc<Page>> {
        let layout = Self::layout()?;
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(raw).map(|ptr| Arc::new(Page { ptr }))
    }

    /// Base address. Valid for `PAGE_SIZE` bytes while the page is alive.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    fn check(offset: usize, len: usize) {
        assert!(
            offset <= PAGE_SIZE && len <= PAGE_SIZE - offset,
            "page access out of bounds: offset {} len {}",
            offset,
            len
        );
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the page.
    ///
    /// # Panics
    /// If the range leaves the page.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        Self::check(offset, dst.len());
        unsafe {
            ptr::copy_nonoverlapping(self.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Copy `src` into the page at `offset`.
    ///
    /// # Panics
    /// If the range leaves the page.
    pub fn write(&self, offset: usize, src: &[u8]) {
        Self::check(offset, src.len());
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(offset), src.len());
        }
    }

    /// Copy `len` bytes from `src[src_offset..]` into `self[offset..]`.
    /// `src` may be `self`; overlapping ranges are handled.
    pub fn copy_from(&self, offset: usize, src: &Page, src_offset: usize, len: usize) {
        Self::check(offset, len);
        Self::check(src_offset, len);
        unsafe {
            ptr::copy(src.as_ptr().add(src_offset), self.as_ptr().add(offset), len);
        }
    }

    pub fn to_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut v = vec![0u8; len];
        self.read(offset, &mut v);
        v
    }

    pub fn fill(&self, byte: u8) {
        unsafe {
            ptr::write_bytes(self.as_ptr(), byte, PAGE_SIZE);
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let Some(layout) = Self::layout() {
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Page({:p})", self.ptr.as_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_and_zeroed() {
        let page = Page::new().unwrap();
        assert_eq!(page.as_ptr() as usize % PAGE_SIZE, 0);
        assert!(page.to_vec(0, PAGE_SIZE).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_write_roundtrip_at_end() {
        let page = Page::new().unwrap();
        page.write(PAGE_SIZE - 3, &[1, 2, 3]);
        assert_eq!(page.to_vec(PAGE_SIZE - 3, 3), vec![1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_write_past_end_panics() {
        let page = Page::new().unwrap();
        page.write(PAGE_SIZE - 1, &[0, 0]);
    }

    #[test]
    fn test_copy_between_pages_and_within() {
        let a = Page::new().unwrap();
        let b = Page::new().unwrap();
        a.write(10, b"hello");
        b.copy_from(0, &a, 10, 5);
        assert_eq!(b.to_vec(0, 5), b"hello");

        a.copy_from(12, &a, 10, 5);
        assert_eq!(a.to_vec(10, 7), b"hehello");
    }
}
