// vim: tw=80
//! Sizing and allocation of the pages that back a SIOTS
//!
//! Every SIOTS needs control structures (per-drive request descriptors, SG
//! lists, verify tracking) plus data buffers.  They are all carved out of
//! fixed-size pages that are allocated at once, all or nothing.

use std::{
    fmt,
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

#[cfg(test)] use mockall::automock;
use serde_derive::{Deserialize, Serialize};

use crate::{types::*, util::div_roundup};

/// Size of a buffer block, in bytes
pub const BYTES_PER_BLOCK: u64 = 520;

/// Size of one per-drive request descriptor
pub const FRU_BYTES: u64 = 256;

/// Size of a nested SIOTS
pub const SIOTS_BYTES: u64 = 1024;

/// Size of a verify tracking structure
pub const VCTS_BYTES: u64 = 320;

/// Size of a verify read tracking structure
pub const VRTS_BYTES: u64 = 128;

/// Size of one SG list element
pub const SG_ELEMENT_BYTES: u64 = 16;

/// Number of SG list size classes
pub const SG_TYPES: usize = 4;

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
         Serialize)]
pub enum PageSize {
    Min,
    Std,
    Max,
}

impl PageSize {
    pub const ALL: [PageSize; 3] =
        [PageSize::Min, PageSize::Std, PageSize::Max];

    /// Page size in buffer blocks
    pub fn blocks(&self) -> u64 {
        match self {
            PageSize::Min => 2,
            PageSize::Std => 16,
            PageSize::Max => 64,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.blocks() * BYTES_PER_BLOCK
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Size classes of SG lists
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
         Serialize)]
pub enum SgType {
    Sg1,
    Sg8,
    Sg32,
    Sg128,
}

impl SgType {
    pub const ALL: [SgType; SG_TYPES] =
        [SgType::Sg1, SgType::Sg8, SgType::Sg32, SgType::Sg128];

    /// Usable entries, not counting the terminator
    pub fn entries(&self) -> u64 {
        match self {
            SgType::Sg1 => 1,
            SgType::Sg8 => 8,
            SgType::Sg32 => 32,
            SgType::Sg128 => 128,
        }
    }

    pub fn bytes(&self) -> u64 {
        (self.entries() + 1) * SG_ELEMENT_BYTES
    }

    /// The smallest class that can hold `entries` entries
    pub fn for_entries(entries: u64) -> Option<SgType> {
        Self::ALL.into_iter().find(|t| t.entries() >= entries)
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// What a SIOTS needs, independent of page size
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ResourceShape {
    pub fru_requests: u32,
    /// Number of SG lists of each `SgType`
    pub sg_lists: [u32; SG_TYPES],
    /// Buffer blocks
    pub blocks: u64,
    pub nested_siots: u32,
    /// Does the SIOTS need verify tracking structures?
    pub verify_tracking: bool,
}

impl ResourceShape {
    /// Account for a per-drive request moving `blocks` blocks
    pub fn add_fru(&mut self, blocks: BlockCount) -> Result<()> {
        let entries = div_roundup(blocks.max(1), PageSize::Std.blocks());
        let sg = SgType::for_entries(entries)
            .ok_or(Error::ResourceExhausted)?;
        self.fru_requests += 1;
        self.sg_lists[sg.index()] += 1;
        self.blocks += blocks;
        Ok(())
    }

    /// Size of the largest single control structure
    fn largest_struct(&self) -> u64 {
        let mut largest = 0;
        if self.fru_requests > 0 {
            largest = FRU_BYTES;
        }
        if self.nested_siots > 0 {
            largest = largest.max(SIOTS_BYTES);
        }
        if self.verify_tracking {
            largest = largest.max(VCTS_BYTES);
        }
        for t in SgType::ALL {
            if self.sg_lists[t.index()] > 0 {
                largest = largest.max(t.bytes());
            }
        }
        largest
    }

    /// Does everything in this shape fit comfortably in pages of this size?
    fn fits(&self, ps: PageSize) -> bool {
        self.blocks <= ps.blocks() &&
            self.largest_struct() <= ps.bytes() &&
            u64::from(self.fru_requests) * FRU_BYTES <= ps.bytes()
    }

    /// Choose a page size for this shape
    pub fn page_size(&self) -> PageSize {
        if self.fits(PageSize::Min) {
            PageSize::Min
        } else if self.fits(PageSize::Std) {
            PageSize::Std
        } else {
            PageSize::Max
        }
    }

    /// Number of pages of size `ps` needed to hold this shape.
    ///
    /// Buffers are packed first, then request descriptors, nested SIOTS,
    /// verify tracking and finally SG lists.  Each kind fills the tail of the
    /// current page before new pages are started.
    pub fn pages(&self, ps: PageSize) -> u64 {
        let mut packer = Packer::new(ps.bytes());
        packer.pack(self.blocks, BYTES_PER_BLOCK);
        packer.pack(u64::from(self.fru_requests), FRU_BYTES);
        packer.pack(u64::from(self.nested_siots), SIOTS_BYTES);
        if self.verify_tracking {
            packer.pack(1, VCTS_BYTES);
            packer.pack(u64::from(self.fru_requests), VRTS_BYTES);
        }
        for t in SgType::ALL {
            packer.pack(u64::from(self.sg_lists[t.index()]), t.bytes());
        }
        packer.pages
    }
}

struct Packer {
    page_bytes: u64,
    pages: u64,
    /// Free bytes at the end of the last page
    remainder: u64,
}

impl Packer {
    fn new(page_bytes: u64) -> Self {
        Packer{page_bytes, pages: 0, remainder: 0}
    }

    fn pack(&mut self, mut count: u64, size: u64) {
        assert!(size <= self.page_bytes,
            "A single structure must fit within one page");
        let fit = count.min(self.remainder / size);
        count -= fit;
        self.remainder -= fit * size;
        if count > 0 {
            let per_page = self.page_bytes / size;
            let new_pages = div_roundup(count, per_page);
            let in_last = count - (new_pages - 1) * per_page;
            self.pages += new_pages;
            self.remainder = self.page_bytes - in_last * size;
        }
    }
}

/// A request for pages from a `MemoryPool`
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct PageRequest {
    pub page_size: PageSize,
    pub pages: u64,
}

impl PageRequest {
    pub fn for_shape(shape: &ResourceShape) -> Self {
        let page_size = shape.page_size();
        PageRequest{page_size, pages: shape.pages(page_size)}
    }
}

/// Something that takes back pages when a grant is dropped
pub trait Reclaim: Send + Sync {
    fn reclaim(&self, request: &PageRequest);
}

/// A grant of pages.  The pages are returned to their pool on drop.
pub struct Pages {
    request: PageRequest,
    owner: Option<Arc<dyn Reclaim>>,
}

impl Pages {
    /// Construct a grant that isn't tied to any pool
    pub fn unowned(request: PageRequest) -> Self {
        Pages{request, owner: None}
    }

    pub fn request(&self) -> &PageRequest {
        &self.request
    }
}

impl fmt::Debug for Pages {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pages")
            .field("request", &self.request)
            .field("owned", &self.owner.is_some())
            .finish()
    }
}

impl Drop for Pages {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.reclaim(&self.request);
        }
    }
}

/// Source of pages for SIOTS
#[cfg_attr(test, automock)]
pub trait MemoryPool: Send + Sync {
    /// Allocate all of the requested pages, or none of them.
    ///
    /// Returns `Error::ResourceExhausted` if there aren't enough free pages
    /// right now.
    fn try_allocate(&self, request: &PageRequest) -> Result<Pages>;
}

fn default_pages() -> u64 { 1024 }

/// Number of pages of each size in a `PagePool`
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PoolConfig {
    #[serde(default = "default_pages")]
    pub min_pages: u64,
    #[serde(default = "default_pages")]
    pub std_pages: u64,
    #[serde(default = "default_pages")]
    pub max_pages: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_pages: default_pages(),
            std_pages: default_pages(),
            max_pages: default_pages(),
        }
    }
}

/// Allocation statistics of a `PagePool`
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PoolStats {
    /// Pages ever allocated
    pub allocated: u64,
    /// Pages ever returned
    pub released: u64,
    /// Allocation attempts that failed for lack of pages
    pub deferred: u64,
}

#[derive(Debug)]
struct PoolInner {
    free: Mutex<[u64; 3]>,
    allocated: AtomicU64,
    released: AtomicU64,
    deferred: AtomicU64,
}

impl Reclaim for PoolInner {
    fn reclaim(&self, request: &PageRequest) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        free[request.page_size.index()] += request.pages;
        self.released.fetch_add(request.pages, Ordering::Relaxed);
    }
}

/// A fixed budget of pages, shared by every IOTS of a raid group.
#[derive(Clone, Debug)]
pub struct PagePool {
    inner: Arc<PoolInner>,
}

impl PagePool {
    pub fn new(config: PoolConfig) -> Self {
        let inner = PoolInner {
            free: Mutex::new([config.min_pages, config.std_pages,
                              config.max_pages]),
            allocated: AtomicU64::new(0),
            released: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
        };
        PagePool{inner: Arc::new(inner)}
    }

    /// Free pages of the given size
    pub fn free(&self, page_size: PageSize) -> u64 {
        let free = self.inner.free.lock()
            .unwrap_or_else(PoisonError::into_inner);
        free[page_size.index()]
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
            deferred: self.inner.deferred.load(Ordering::Relaxed),
        }
    }
}

impl MemoryPool for PagePool {
    fn try_allocate(&self, request: &PageRequest) -> Result<Pages> {
        let mut free = self.inner.free.lock()
            .unwrap_or_else(PoisonError::into_inner);
        let avail = &mut free[request.page_size.index()];
        if *avail < request.pages {
            self.inner.deferred.fetch_add(1, Ordering::Relaxed);
            return Err(Error::ResourceExhausted);
        }
        *avail -= request.pages;
        self.inner.allocated.fetch_add(request.pages, Ordering::Relaxed);
        let owner: Arc<dyn Reclaim> = self.inner.clone();
        Ok(Pages{request: *request, owner: Some(owner)})
    }
}

// LCOV_EXCL_STOP
