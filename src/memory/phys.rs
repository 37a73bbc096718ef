//! Physical memory: a contiguous run of page frames with a record per page.
//!
//! Page contents are stored as 64-bit words so that page table entries, which live in ordinary
//! pages, can be read and written atomically the way the MMU sees them.

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use super::{Enomem, Frame, PhysicalAddress, PAGE_SIZE};
use crate::common::ObjectId;

const WORDS_PER_PAGE: usize = PAGE_SIZE / 8;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: usize {
        const REFERENCED = 1 << 0;
        const MODIFIED = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageOwner {
    None,
    Object { id: ObjectId, offset: usize },
    Anon,
    PageTable,
}

#[derive(Debug)]
pub struct PageInfo {
    owner: Mutex<PageOwner>,
    flags: AtomicUsize,
    /// Number of reverse mappings (pmap, address) translating to this page.
    mappings: AtomicUsize,
}

impl PageInfo {
    const fn new() -> Self {
        Self {
            owner: Mutex::new(PageOwner::None),
            flags: AtomicUsize::new(0),
            mappings: AtomicUsize::new(0),
        }
    }
    pub fn owner(&self) -> PageOwner {
        *self.owner.lock()
    }
    /// Claims the page for `owner`. A page belongs to at most one owner at a time.
    pub fn set_owner(&self, owner: PageOwner) {
        let mut slot = self.owner.lock();
        assert!(
            *slot == PageOwner::None || owner == PageOwner::None,
            "page already owned by {:?}",
            *slot
        );
        *slot = owner;
    }
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }
    pub fn set_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }
    pub fn clear_flags(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
    pub fn mappings(&self) -> usize {
        self.mappings.load(Ordering::Acquire)
    }
    pub fn add_mapping(&self) {
        self.mappings.fetch_add(1, Ordering::AcqRel);
    }
    pub fn remove_mapping(&self) {
        let old = self.mappings.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(old, 0, "page mapping count underflow");
    }
    fn reset(&self) {
        *self.owner.lock() = PageOwner::None;
        self.flags.store(0, Ordering::Release);
        self.mappings.store(0, Ordering::Release);
    }
}

pub struct PhysMem {
    base: Frame,
    ram: Box<[AtomicU64]>,
    frames: Box<[PageInfo]>,
    used: Mutex<Vec<bool>>,
}

impl core::fmt::Debug for PhysMem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysMem")
            .field("base", &self.base)
            .field("pages", &self.frames.len())
            .finish()
    }
}

impl PhysMem {
    /// Physical memory of `count` pages starting at `base`, which must be page aligned and
    /// non-zero.
    pub fn new(base: PhysicalAddress, count: usize) -> Self {
        assert!(base.data() != 0, "physical memory must not start at 0x0");
        assert_eq!(base.data() % PAGE_SIZE, 0, "unaligned physical memory base");

        let ram = (0..count * WORDS_PER_PAGE)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let frames = (0..count)
            .map(|_| PageInfo::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        log::info!("physical memory: {:?} + {} pages", base, count);

        Self {
            base: Frame::containing(base),
            ram,
            frames,
            used: Mutex::new(alloc::vec![false; count]),
        }
    }

    pub fn base(&self) -> PhysicalAddress {
        self.base.start_address()
    }
    pub fn end(&self) -> PhysicalAddress {
        self.base.next_by(self.frames.len()).start_address()
    }
    pub fn page_count(&self) -> usize {
        self.frames.len()
    }
    pub fn contains(&self, address: PhysicalAddress) -> bool {
        (self.base().data()..self.end().data()).contains(&address.data())
    }

    fn index(&self, frame: Frame) -> usize {
        assert!(
            self.contains(frame.start_address()),
            "{:?} is outside physical memory",
            frame
        );
        frame.offset_from(self.base)
    }

    pub fn page_info(&self, frame: Frame) -> &PageInfo {
        &self.frames[self.index(frame)]
    }

    /// Allocates `count` contiguous pages, first fit. Page contents are left as they were.
    pub fn allocate(&self, count: usize) -> Result<Frame, Enomem> {
        assert_ne!(count, 0, "zero-sized page allocation");

        let mut used = self.used.lock();
        let mut run = 0;
        let mut found = None;
        for (i, &busy) in used.iter().enumerate() {
            run = if busy { 0 } else { run + 1 };
            if run == count {
                found = Some(i + 1 - count);
                break;
            }
        }
        let Some(start) = found else {
            log::warn!("out of physical memory allocating {} pages", count);
            return Err(Enomem);
        };
        for i in start..start + count {
            used[i] = true;
            self.frames[i].reset();
        }
        Ok(self.base.next_by(start))
    }

    pub fn allocate_zeroed(&self, count: usize) -> Result<Frame, Enomem> {
        let frame = self.allocate(count)?;
        for i in 0..count {
            self.zero_page(frame.next_by(i));
        }
        Ok(frame)
    }

    /// Returns a single page to the free pool. Freeing a free page, or a page that is still
    /// mapped somewhere, is a caller bug.
    pub fn free(&self, frame: Frame) {
        let i = self.index(frame);
        let info = &self.frames[i];
        assert_eq!(
            info.mappings(),
            0,
            "freeing {:?} while it is still mapped",
            frame
        );
        let mut used = self.used.lock();
        assert!(used[i], "double free of {:?}", frame);
        used[i] = false;
        info.reset();
    }

    pub fn is_allocated(&self, frame: Frame) -> bool {
        self.used.lock()[self.index(frame)]
    }
    pub fn free_count(&self) -> usize {
        self.used.lock().iter().filter(|&&busy| !busy).count()
    }

    fn word(&self, address: PhysicalAddress) -> &AtomicU64 {
        assert_eq!(address.data() % 8, 0, "unaligned word access at {:?}", address);
        assert!(self.contains(address), "{:?} is outside physical memory", address);
        &self.ram[(address.data() - self.base().data()) / 8]
    }

    pub fn read_u64(&self, address: PhysicalAddress) -> u64 {
        self.word(address).load(Ordering::Acquire)
    }
    pub fn write_u64(&self, address: PhysicalAddress, value: u64) {
        self.word(address).store(value, Ordering::Release)
    }

    fn page_words(&self, frame: Frame) -> &[AtomicU64] {
        let start = self.index(frame) * WORDS_PER_PAGE;
        &self.ram[start..start + WORDS_PER_PAGE]
    }

    pub fn zero_page(&self, frame: Frame) {
        for word in self.page_words(frame) {
            word.store(0, Ordering::Relaxed);
        }
    }
    pub fn copy_page(&self, src: Frame, dst: Frame) {
        for (from, to) in self.page_words(src).iter().zip(self.page_words(dst)) {
            to.store(from.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }
    pub fn fill_page(&self, frame: Frame, byte: u8) {
        let word = u64::from_ne_bytes([byte; 8]);
        for w in self.page_words(frame) {
            w.store(word, Ordering::Relaxed);
        }
    }
    pub fn page_bytes(&self, frame: Frame) -> Vec<u8> {
        self.page_words(frame)
            .iter()
            .flat_map(|w| w.load(Ordering::Relaxed).to_ne_bytes())
            .collect()
    }
}
