//! Frames exchanged with the adapter shim.
//!
//! - [`TxFrame`]: built by the shim, a list of page fragments plus the
//!   offloads it asks for. Handed back through `on_frame_sent`.
//! - [`RxFrame`]: built by the engine over pooled buffers. The shim
//!   reads it and hands it back with `return_rx_buffer`; until then the
//!   buffers stay out of the freelists.

use std::sync::Arc;

use crate::error::{NetfrontError, Result};
use crate::page::Page;
use crate::wire::PAGE_SIZE;

/// A byte range inside one page.
#[derive(Debug, Clone)]
pub struct Fragment {
    page: Arc<Page>,
    offset: u16,
    len: u16,
}

impl Fragment {
    pub fn new(page: Arc<Page>, offset: usize, len: usize) -> Result<Self> {
        if offset > PAGE_SIZE || len > PAGE_SIZE - offset {
            return Err(NetfrontError::InvalidConfig("fragment leaves its page"));
        }
        Ok(Self { page, offset: offset as u16, len: len as u16 })
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn offset(&self) -> usize {
        self.offset as usize
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Offloads requested by the network stack for one outbound frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOffload {
    pub ip_header_checksum: bool,
    pub tcp_checksum: bool,
    pub udp_checksum: bool,
    /// Large-send segment size. 0 = no LSO.
    pub mss: u32,
}

#[derive(Debug, Clone)]
pub struct TxFrame {
    fragments: Vec<Fragment>,
    offload: TxOffload,
    tag: u64,
}

impl TxFrame {
    pub fn new(fragments: Vec<Fragment>) -> Self {
        Self { fragments, offload: TxOffload::default(), tag: 0 }
    }

    /// Copy `data` into freshly allocated pages, at most `chunk` bytes
    /// per fragment (clamped to one page).
    pub fn from_bytes(data: &[u8], chunk: usize) -> Result<Self> {
        let chunk = chunk.clamp(1, PAGE_SIZE);
        let mut fragments = Vec::with_capacity(data.len() / chunk + 1);
        for piece in data.chunks(chunk) {
            let page = Page::new().ok_or(NetfrontError::OutOfMemory)?;
            page.write(0, piece);
            fragments.push(Fragment::new(page, 0, piece.len())?);
        }
        Ok(Self::new(fragments))
    }

    pub fn with_offload(mut self, offload: TxOffload) -> Self {
        self.offload = offload;
        self
    }

    /// Opaque value for the shim to recognise the frame on completion.
    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn offload(&self) -> TxOffload {
        self.offload
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.iter().map(Fragment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy up to `dst.len()` bytes starting at frame offset `from`.
    /// Returns the number of bytes copied.
    pub fn copy_out(&self, mut from: usize, dst: &mut [u8]) -> usize {
        let mut written = 0;
        for frag in &self.fragments {
            if written == dst.len() {
                break;
            }
            if from >= frag.len() {
                from -= frag.len();
                continue;
            }
            let n = (frag.len() - from).min(dst.len() - written);
            frag.page.read(frag.offset() + from, &mut dst[written..written + n]);
            written += n;
            from = 0;
        }
        written
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut v = vec![0u8; self.len()];
        self.copy_out(0, &mut v);
        v
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    Failure,
}

/// Handle of a buffer descriptor in the engine's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// A range of one pooled buffer that belongs to a received frame.
#[derive(Debug)]
pub struct RxSegment {
    pub buffer: BufferId,
    pub page: Arc<Page>,
    pub offset: u16,
    pub len: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChecksumResult {
    #[default]
    NotChecked,
    Succeeded,
    Failed,
}

/// Receive checksum annotation handed to the network stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxChecksum {
    pub ip: ChecksumResult,
    pub tcp: ChecksumResult,
    pub udp: ChecksumResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    Unicast,
    Multicast,
    Broadcast,
}

impl CastKind {
    /// Classify by destination MAC.
    pub fn of(dest: &[u8]) -> Self {
        if dest.len() >= 6 && dest[..6] == [0xff; 6] {
            CastKind::Broadcast
        } else if dest.first().map_or(false, |b| b & 0x01 != 0) {
            CastKind::Multicast
        } else {
            CastKind::Unicast
        }
    }
}

/// A received frame. Not `Clone`: each frame is returned exactly once.
#[derive(Debug)]
pub struct RxFrame {
    segments: Vec<RxSegment>,
    len: usize,
    checksum: RxChecksum,
    cast: CastKind,
}

impl RxFrame {
    pub fn new(segments: Vec<RxSegment>, checksum: RxChecksum, cast: CastKind) -> Self {
        let len = segments.iter().map(|s| s.len as usize).sum();
        Self { segments, len, checksum, cast }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segments(&self) -> &[RxSegment] {
        &self.segments
    }

    pub fn checksum(&self) -> RxChecksum {
        self.checksum
    }

    pub fn cast(&self) -> CastKind {
        self.cast
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.len);
        for seg in &self.segments {
            let start = v.len();
            v.resize(start + seg.len as usize, 0);
            seg.page.read(seg.offset as usize, &mut v[start..]);
        }
        v
    }

    /// Give up the frame, leaving its segments for the pool to release.
    pub fn into_segments(self) -> Vec<RxSegment> {
        self.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_chunks_and_copies() {
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let frame = TxFrame::from_bytes(&data, 3000).unwrap();
        assert_eq!(frame.fragments().len(), 4);
        assert_eq!(frame.fragments()[3].len(), 1000);
        assert_eq!(frame.len(), 10_000);
        assert_eq!(frame.to_vec(), data);
    }

    #[test]
    fn test_copy_out_across_fragments() {
        let data: Vec<u8> = (0..100u8).collect();
        let frame = TxFrame::from_bytes(&data, 30).unwrap();
        let mut out = [0u8; 20];
        assert_eq!(frame.copy_out(25, &mut out), 20);
        assert_eq!(&out[..], &data[25..45]);
        assert_eq!(frame.copy_out(95, &mut out), 5);
    }

    #[test]
    fn test_fragment_bounds() {
        let page = Page::new().unwrap();
        assert!(Fragment::new(page.clone(), 4000, 96).is_ok());
        assert!(Fragment::new(page, 4000, 97).is_err());
    }

    #[test]
    fn test_cast_kind() {
        assert_eq!(CastKind::of(&[0xff; 6]), CastKind::Broadcast);
        assert_eq!(CastKind::of(&[0x01, 0, 0x5e, 0, 0, 1]), CastKind::Multicast);
        assert_eq!(CastKind::of(&[0x02, 0, 0, 0, 0, 1]), CastKind::Unicast);
    }

    #[test]
    fn test_rx_frame_concatenates_segments() {
        let a = Page::new().unwrap();
        let b = Page::new().unwrap();
        a.write(100, b"abc");
        b.write(0, b"defg");
        let frame = RxFrame::new(
            vec![
                RxSegment { buffer: BufferId(0), page: a, offset: 100, len: 3 },
                RxSegment { buffer: BufferId(1), page: b, offset: 0, len: 4 },
            ],
            RxChecksum::default(),
            CastKind::Unicast,
        );
        assert_eq!(frame.len(), 7);
        assert_eq!(frame.to_vec(), b"abcdefg");
    }
}
