use crate::{
    constants::memory::{BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY},
    memory::{
        paging::{PageEntry, PageFlags, PagingError},
        static_alloc::{Alignment, StaticAllocator},
    },
};

/// One bit per physical frame, set while the frame is in use.
pub struct BitmapFrameAllocator {
    total_frames: usize,
    free_frames: usize,
    to_allocate: usize,
    bitmap: &'static mut [u32],
}

impl BitmapFrameAllocator {
    /// Carves a bitmap for every frame below `memory_end` out of static memory.
    /// All frames start out free.
    ///
    /// # Safety
    ///
    /// The static allocator's window must be writable.
    pub unsafe fn init(placement: &mut StaticAllocator, memory_end: usize) -> Self {
        let total_frames = memory_end / FRAME_SIZE;
        let bitmap_size = total_frames.div_ceil(BITMAP_ENTRY_SIZE).max(1);

        let block = placement.alloc_base(
            bitmap_size * core::mem::size_of::<u32>(),
            Alignment::Natural,
        );
        let bitmap = core::slice::from_raw_parts_mut(block.addr as *mut u32, bitmap_size);
        bitmap.fill(0);

        log::debug!(
            "frame bitmap: {} frames, {} words at {:#x}",
            total_frames,
            bitmap_size,
            block.addr
        );

        Self::from_bitmap(bitmap, total_frames)
    }

    /// Wraps an already zeroed bitmap.
    pub fn from_bitmap(bitmap: &'static mut [u32], total_frames: usize) -> Self {
        assert!(bitmap.len() * BITMAP_ENTRY_SIZE >= total_frames);
        Self {
            total_frames,
            free_frames: total_frames,
            to_allocate: 0,
            bitmap,
        }
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Check if the frame starting at `frame` is used
    pub fn is_frame_used(&self, frame: usize) -> bool {
        self.is_bit_set(frame / FRAME_SIZE)
    }

    /// Reserves a specific frame, e.g. one already holding kernel code.
    pub fn mark_used(&mut self, frame: usize) {
        self.set_bit(frame / FRAME_SIZE);
    }

    /// Hands out the next free frame, searching from just past the last one
    /// given out.
    pub fn allocate(&mut self) -> Option<usize> {
        if self.free_frames == 0 {
            return None;
        }

        loop {
            let word = self.to_allocate / BITMAP_ENTRY_SIZE;
            if self.to_allocate % BITMAP_ENTRY_SIZE == 0 && self.bitmap[word] == FULL_BITMAP_ENTRY {
                self.to_allocate = (self.to_allocate + BITMAP_ENTRY_SIZE) % self.total_frames;
                continue;
            }

            if !self.is_bit_set(self.to_allocate) {
                self.set_bit(self.to_allocate);
                let addr = self.to_allocate * FRAME_SIZE;
                self.to_allocate = (self.to_allocate + 1) % self.total_frames;
                return Some(addr);
            }

            self.to_allocate = (self.to_allocate + 1) % self.total_frames;
        }
    }

    pub fn deallocate(&mut self, frame: usize) {
        self.clear_bit(frame / FRAME_SIZE);
    }

    /// Backs `entry` with a fresh frame.
    ///
    /// An entry that is already present keeps its frame and flags.
    pub fn frame_alloc(
        &mut self,
        entry: &mut PageEntry,
        kernel_mode: bool,
        writable: bool,
    ) -> Result<(), PagingError> {
        if entry.is_present() {
            log::debug!("frame_alloc: entry already maps {:#x}", entry.frame());
            return Ok(());
        }

        let frame = self.allocate().ok_or(PagingError::OutOfFrames)?;
        entry.set(frame, entry_flags(kernel_mode, writable));
        Ok(())
    }

    /// Maps `entry` onto a caller-chosen frame, reserving it.
    pub fn map_frame(&mut self, entry: &mut PageEntry, frame: usize, kernel_mode: bool, writable: bool) {
        if entry.is_present() {
            return;
        }
        self.mark_used(frame);
        entry.set(frame, entry_flags(kernel_mode, writable));
    }

    /// Returns the frame behind `entry` and clears it. Unused entries are left alone.
    pub fn frame_free(&mut self, entry: &mut PageEntry) {
        if !entry.is_present() {
            return;
        }
        self.deallocate(entry.frame());
        entry.clear();
    }

    /// set a particular bit (1), taking in frame_index (usize)
    fn set_bit(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames, "frame {:#x} out of range", frame_index);

        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        let word = &mut self.bitmap[frame_index / BITMAP_ENTRY_SIZE];
        if *word & mask == 0 {
            *word |= mask;
            self.free_frames -= 1;
        }
    }

    /// clear a particular bit (0), taking in frame_index (usize)
    fn clear_bit(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames, "frame {:#x} out of range", frame_index);

        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        let word = &mut self.bitmap[frame_index / BITMAP_ENTRY_SIZE];
        if *word & mask != 0 {
            *word &= !mask;
            self.free_frames += 1;
        }
    }

    /// check if bit is set at frame_index. returns true if bit == 1, false otherwise
    fn is_bit_set(&self, frame_index: usize) -> bool {
        assert!(frame_index < self.total_frames, "frame {:#x} out of range", frame_index);

        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        (self.bitmap[frame_index / BITMAP_ENTRY_SIZE] & mask) != 0
    }
}

fn entry_flags(kernel_mode: bool, writable: bool) -> PageFlags {
    let mut flags = PageFlags::PRESENT;
    if writable {
        flags |= PageFlags::WRITABLE;
    }
    if !kernel_mode {
        flags |= PageFlags::USER;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{boxed::Box, vec};

    fn allocator(frames: usize) -> BitmapFrameAllocator {
        let words = frames.div_ceil(BITMAP_ENTRY_SIZE);
        BitmapFrameAllocator::from_bitmap(Box::leak(vec![0u32; words].into_boxed_slice()), frames)
    }

    #[test]
    fn allocates_distinct_frames_until_empty() {
        let mut frames = allocator(40);
        let mut seen = alloc::vec::Vec::new();
        while let Some(frame) = frames.allocate() {
            assert_eq!(frame % FRAME_SIZE, 0);
            assert!(!seen.contains(&frame));
            seen.push(frame);
        }
        assert_eq!(seen.len(), 40);
        assert_eq!(frames.free_frames(), 0);
    }

    #[test]
    fn free_count_survives_double_marking() {
        let mut frames = allocator(64);
        frames.mark_used(0x3000);
        frames.mark_used(0x3000);
        assert_eq!(frames.free_frames(), 63);

        frames.deallocate(0x3000);
        frames.deallocate(0x3000);
        assert_eq!(frames.free_frames(), 64);
    }

    #[test]
    fn allocation_skips_reserved_frames() {
        let mut frames = allocator(64);
        for frame in 0..33 {
            frames.mark_used(frame * FRAME_SIZE);
        }
        assert_eq!(frames.allocate(), Some(33 * FRAME_SIZE));
    }

    #[test]
    fn frame_alloc_sets_flags_and_is_idempotent() {
        let mut frames = allocator(8);
        let mut entry = PageEntry::empty();

        frames.frame_alloc(&mut entry, false, true).unwrap();
        assert_eq!(
            entry.flags(),
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER
        );
        let frame = entry.frame();
        assert!(frames.is_frame_used(frame));

        frames.frame_alloc(&mut entry, true, false).unwrap();
        assert_eq!(entry.frame(), frame);
        assert_eq!(frames.free_frames(), 7);

        frames.frame_free(&mut entry);
        assert!(entry.is_unused());
        assert!(!frames.is_frame_used(frame));
        assert_eq!(frames.free_frames(), 8);
    }

    #[test]
    fn frame_alloc_reports_exhaustion() {
        let mut frames = allocator(1);
        let mut first = PageEntry::empty();
        let mut second = PageEntry::empty();

        frames.frame_alloc(&mut first, true, true).unwrap();
        assert_eq!(
            frames.frame_alloc(&mut second, true, true),
            Err(PagingError::OutOfFrames)
        );
        assert!(second.is_unused());
    }

    #[test]
    fn map_frame_reserves_the_chosen_frame() {
        let mut frames = allocator(16);
        let mut entry = PageEntry::empty();

        frames.map_frame(&mut entry, 0x5000, true, true);
        assert_eq!(entry.frame(), 0x5000);
        assert!(frames.is_frame_used(0x5000));
        assert!(!entry.flags().contains(PageFlags::USER));
    }
}
