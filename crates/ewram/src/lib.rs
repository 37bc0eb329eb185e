//! External working RAM parameterization for the handheld target.
//!
//! The console maps 256 KiB of external working RAM at a fixed address.
//! This crate pins the allocator geometry for that region (2 KiB pages,
//! buddy orders up to 6) and offers a thin process-wide façade over one
//! page allocator plus one fine allocator, both living behind a spinlock.
//! Slab instances stay caller-owned; the façade only lends them the shared
//! page allocator.
//!
//! The link script communicates how much of the region the host image
//! reserves: everything below `__ewram_reserved_end` stays untouched and
//! the managed region starts at the next page. Hosted builds (tests,
//! tooling) fall back to a zero-length prefix.

#![cfg_attr(not(test), no_std)]

use core::ptr;

use allocator::{
    BuddyPageAllocator, FineAllocator, FineConfig, RegionGeometry, SlabAllocator,
};
use spin::Mutex;

/// Base address of the external working RAM.
pub const EWRAM_BASE: usize = 0x0200_0000;
/// Page size shift: 2 KiB pages.
pub const EWRAM_PAGE_SHIFT: u32 = 11;
/// Raw size of the region in pages, reserved prefix included.
pub const EWRAM_PAGES: usize = 128;
/// Exclusive upper bound on buddy orders.
pub const EWRAM_MAX_ORDER: u32 = 6;

#[cfg(target_os = "none")]
unsafe extern "C" {
    /// Link-script symbol marking the end of the image's EWRAM data.
    static __ewram_reserved_end: u8;
}

#[cfg(target_os = "none")]
fn reserved_prefix_bytes() -> usize {
    let end = unsafe { &raw const __ewram_reserved_end };
    end as usize - EWRAM_BASE
}

#[cfg(not(target_os = "none"))]
fn reserved_prefix_bytes() -> usize {
    0
}

struct Mm {
    pages: Option<BuddyPageAllocator>,
    heap: Option<FineAllocator>,
}

static MM: Mutex<Mm> = Mutex::new(Mm {
    pages: None,
    heap: None,
});

/// Initializes the process-wide page allocator. Idempotent: a second call
/// reports success without touching the existing instance.
///
/// # Safety
///
/// The caller asserts that the managed part of EWRAM (everything above the
/// reserved prefix) is unused and stays reserved for these allocators.
pub unsafe fn page_init() -> bool {
    let mut mm = MM.lock();
    if mm.pages.is_some() {
        return true;
    }
    let geometry = match RegionGeometry::with_reserved_prefix(
        EWRAM_BASE,
        EWRAM_PAGE_SHIFT,
        EWRAM_PAGES,
        EWRAM_MAX_ORDER,
        reserved_prefix_bytes(),
    ) {
        Ok(geometry) => geometry,
        Err(err) => {
            log::warn!("ewram geometry rejected: {err}");
            return false;
        }
    };
    log::info!(
        "ewram page allocator ready: {} pages of {} bytes at {:#x}",
        geometry.page_count(),
        geometry.page_size(),
        geometry.base(),
    );
    mm.pages = Some(unsafe { BuddyPageAllocator::new(geometry) });
    true
}

/// Whether [`page_init`] has run.
pub fn page_has_init() -> bool {
    MM.lock().pages.is_some()
}

/// Allocates a block of `2^order` pages from the high pool. Null on
/// exhaustion or while uninitialized.
pub fn page_alloc(order: u32) -> *mut u8 {
    let mut mm = MM.lock();
    match mm.pages.as_mut().and_then(|pages| pages.alloc_high(order)) {
        Some(addr) => ptr::with_exposed_provenance_mut(addr),
        None => ptr::null_mut(),
    }
}

/// Returns a block from [`page_alloc`]. No-op on null or while
/// uninitialized.
///
/// # Safety
///
/// `page` must be null or a live block from `page_alloc` with the same
/// `order`, unused from here on.
pub unsafe fn page_free(page: *mut u8, order: u32) {
    let mut mm = MM.lock();
    if let Some(pages) = mm.pages.as_mut() {
        unsafe {
            pages.free_high(page.expose_provenance(), order);
        }
    }
}

/// Initializes the process-wide fine allocator. Fails while the page
/// allocator is uninitialized; idempotent afterwards.
pub fn malloc_init() -> bool {
    let mut mm = MM.lock();
    if mm.heap.is_some() {
        return true;
    }
    let Some(pages) = mm.pages.as_ref() else {
        return false;
    };
    match FineAllocator::new(pages.geometry(), FineConfig::default()) {
        Ok(heap) => {
            log::info!("ewram heap allocator ready");
            mm.heap = Some(heap);
            true
        }
        Err(err) => {
            log::warn!("ewram heap config rejected: {err}");
            false
        }
    }
}

/// Whether [`malloc_init`] has run.
pub fn malloc_has_init() -> bool {
    MM.lock().heap.is_some()
}

/// Allocates `size` bytes from the shared heap. Null on a zero size,
/// exhaustion, or while uninitialized.
pub fn malloc(size: usize) -> *mut u8 {
    let mut mm = MM.lock();
    let Mm {
        pages: Some(pages),
        heap: Some(heap),
    } = &mut *mm
    else {
        return ptr::null_mut();
    };
    match unsafe { heap.allocate(pages, size) } {
        Some(ptr) => ptr.as_ptr(),
        None => ptr::null_mut(),
    }
}

/// Returns a pointer from [`malloc`]. No-op on null or while
/// uninitialized.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from `malloc`, unused from here
/// on.
pub unsafe fn free(ptr: *mut u8) {
    let mut mm = MM.lock();
    let Mm {
        pages: Some(pages),
        heap: Some(heap),
    } = &mut *mm
    else {
        return;
    };
    unsafe {
        heap.deallocate(pages, ptr);
    }
}

/// Creates a caller-owned slab instance for objects of `object_size`
/// bytes. `None` while the page allocator is uninitialized or when the
/// class cannot be served.
pub fn slab_init(object_size: usize) -> Option<SlabAllocator> {
    let mm = MM.lock();
    let pages = mm.pages.as_ref()?;
    match SlabAllocator::new_sized(pages.geometry(), object_size) {
        Ok(slab) => Some(slab),
        Err(err) => {
            log::warn!("ewram slab class rejected: {err}");
            None
        }
    }
}

/// Creates a caller-owned slab instance for objects of `2^shift` bytes.
pub fn slab_init_pow2(shift: u32) -> Option<SlabAllocator> {
    let mm = MM.lock();
    let pages = mm.pages.as_ref()?;
    match SlabAllocator::new_pow2(pages.geometry(), shift) {
        Ok(slab) => Some(slab),
        Err(err) => {
            log::warn!("ewram slab class rejected: {err}");
            None
        }
    }
}

/// Allocates one object from `slab`, backed by the shared page allocator.
///
/// # Safety
///
/// `slab` must come from [`slab_init`]/[`slab_init_pow2`] and must not
/// have moved since its first allocation.
pub unsafe fn slab_alloc(slab: &mut SlabAllocator) -> *mut u8 {
    let mut mm = MM.lock();
    let Some(pages) = mm.pages.as_mut() else {
        return ptr::null_mut();
    };
    match unsafe { slab.allocate(pages) } {
        Some(ptr) => ptr.as_ptr(),
        None => ptr::null_mut(),
    }
}

/// Returns an object to `slab`. Mismatched pointers are silently ignored.
///
/// # Safety
///
/// Same contract as [`slab_alloc`]; the object must not be used after this
/// call.
pub unsafe fn slab_free(slab: &mut SlabAllocator, ptr: *mut u8) {
    let mut mm = MM.lock();
    if let Some(pages) = mm.pages.as_mut() {
        unsafe {
            slab.deallocate(pages, ptr);
        }
    }
}
