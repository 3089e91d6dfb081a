/// Read-only view over one received frame.
///
/// Implementations must refuse any read whose byte range is not fully inside
/// the frame; `fits` is the single place that proves it.
pub trait FrameView {
    /// Number of bytes available in the frame.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True iff `[offset, offset + size)` lies within the frame.
    #[inline(always)]
    fn fits(&self, offset: usize, size: usize) -> bool {
        match offset.checked_add(size) {
            Some(end) => end <= self.len(),
            None => false,
        }
    }

    /// Copy `N` bytes starting at `offset`, or `None` if they do not fit.
    fn read<const N: usize>(&self, offset: usize) -> Option<[u8; N]>;
}

/// Frame backed by a byte slice. Used by the agent and by tests.
#[derive(Clone, Copy, Debug)]
pub struct SliceFrame<'a> {
    bytes: &'a [u8],
}

impl<'a> SliceFrame<'a> {
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }
}

impl FrameView for SliceFrame<'_> {
    #[inline(always)]
    fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    fn read<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        if !self.fits(offset, N) {
            return None;
        }
        let src = self.bytes.get(offset..offset + N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(src);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_accepts_range_ending_at_frame_end() {
        let bytes = [0u8; 14];
        let frame = SliceFrame::new(&bytes);
        assert!(frame.fits(0, 14));
        assert!(frame.fits(14, 0));
        assert!(!frame.fits(0, 15));
        assert!(!frame.fits(1, 14));
    }

    #[test]
    fn fits_rejects_overflowing_offsets() {
        let bytes = [0u8; 4];
        let frame = SliceFrame::new(&bytes);
        assert!(!frame.fits(usize::MAX, 1));
        assert!(!frame.fits(1, usize::MAX));
    }

    #[test]
    fn read_copies_requested_window() {
        let bytes = [1u8, 2, 3, 4, 5];
        let frame = SliceFrame::new(&bytes);
        assert_eq!(frame.read::<2>(3), Some([4, 5]));
        assert_eq!(frame.read::<2>(4), None);
        assert_eq!(frame.read::<0>(5), Some([]));
    }

    #[test]
    fn empty_frame_fits_nothing() {
        let frame = SliceFrame::new(&[]);
        assert!(frame.is_empty());
        assert!(!frame.fits(0, 1));
        assert_eq!(frame.read::<1>(0), None);
    }
}
