/// Upper bound on the number of virtual spans one miniheap may serve.
/// A merge that would push the combined count past this is refused.
pub const MAX_MESHES: usize = 16;

/// A contiguous run of arena pages. `offset` doubles as the span's extent
/// offset in the backing file (identity mapping until meshed away).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Span {
    pub offset: u32,
    pub length: u32,
}

impl Span {
    #[inline]
    pub fn byte_offset(&self, page_size: usize) -> usize {
        self.offset as usize * page_size
    }

    #[inline]
    pub fn byte_len(&self, page_size: usize) -> usize {
        self.length as usize * page_size
    }
}
