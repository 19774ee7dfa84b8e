//! Secure memory for object instance data.
//!
//! Every block is laid out as
//!
//! ```text
//! [ header (flags, size, prev, next, checksum) ][ payload ][ trailer checksum ]
//! ```
//!
//! Live blocks form a doubly linked list threaded through their headers. The
//! header checksum is an HMAC-SHA256 (truncated to 64 bits) over the header
//! with its checksum field zeroed, keyed with a per-allocator random key, and
//! the trailer mirrors it. A block marked read-only also has its payload
//! covered. Blocks are optionally locked into RAM and are zeroised in full
//! (header, payload and trailer) before being returned to the OS.
//!
//! Checksums are verified before any free or list traversal. A mismatch
//! means heap corruption and is fatal.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::mem::{self, offset_of};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;
use ring::hmac;
use ring::rand::SystemRandom;
use zeroize::Zeroize;

use crate::error::{kernel_trap, KernelError, KernelResult};

/// Smallest payload handed out. Smaller requests are rounded up.
pub const MIN_ALLOC_SIZE: usize = 8;

const BLOCK_ALIGN: usize = 16;
const PAYLOAD_ALIGN: usize = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct BlockFlags: u32 {
        /// Pages are locked into RAM.
        const LOCKED    = 0x01;
        /// Read-only: the checksum covers the payload as well.
        const PROTECTED = 0x02;
    }
}

#[repr(C)]
struct BlockHeader {
    flags: u32,
    size: u32,
    prev: usize,
    next: usize,
    checksum: u64,
}

const fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

const HEADER_LEN: usize = round_up(mem::size_of::<BlockHeader>(), BLOCK_ALIGN);
const TRAILER_LEN: usize = mem::size_of::<u64>();
const CHECKSUM_OFFSET: usize = offset_of!(BlockHeader, checksum);

// ---------------------------------------------------------------------------
// Shared allocator state
// ---------------------------------------------------------------------------

/// The process-wide block list. `sizes` is the allocator's own record of
/// every live block; list links are only followed to addresses found there.
struct BlockList {
    head: usize,
    sizes: HashMap<usize, usize>,
}

struct AllocShared {
    list: Mutex<BlockList>,
    key: hmac::Key,
    lock_pages: bool,
    max_size: usize,
}

impl AllocShared {
    fn lock_list(&self) -> MutexGuard<'_, BlockList> {
        // A trap is terminal in release builds. In tests it unwinds past a
        // held guard, and the list itself is still consistent.
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checksum of the block at `addr` whose payload is `size` bytes.
    ///
    /// # Safety
    /// `addr` must be a live block of this allocator with payload `size`.
    unsafe fn checksum(&self, addr: usize, size: usize) -> u64 {
        let mut header = [0u8; HEADER_LEN];
        ptr::copy_nonoverlapping(addr as *const u8, header.as_mut_ptr(), HEADER_LEN);
        header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8].fill(0);

        let mut ctx = hmac::Context::with_key(&self.key);
        ctx.update(&header);
        let flags = BlockFlags::from_bits_retain((*(addr as *const BlockHeader)).flags);
        if flags.contains(BlockFlags::PROTECTED) {
            let payload = std::slice::from_raw_parts((addr + HEADER_LEN) as *const u8, size);
            ctx.update(payload);
        }
        let tag = ctx.sign();
        let mut out = [0u8; 8];
        out.copy_from_slice(&tag.as_ref()[..8]);
        u64::from_le_bytes(out)
    }

    /// # Safety
    /// As for [`Self::checksum`]. The list lock must be held.
    unsafe fn seal(&self, addr: usize, size: usize) {
        let sum = self.checksum(addr, size);
        (*(addr as *mut BlockHeader)).checksum = sum;
        ptr::write_unaligned(trailer_addr(addr, size) as *mut u64, sum);
    }

    /// Check one block. Returns a description of the damage, if any.
    ///
    /// # Safety
    /// As for [`Self::checksum`]. The list lock must be held.
    unsafe fn check(&self, addr: usize, size: usize) -> Result<(), &'static str> {
        let header = &*(addr as *const BlockHeader);
        if header.size as usize != size || !(MIN_ALLOC_SIZE..=self.max_size).contains(&size) {
            return Err("block size field corrupted");
        }
        if BlockFlags::from_bits(header.flags).is_none() {
            return Err("block flags corrupted");
        }
        let stored = header.checksum;
        if self.checksum(addr, size) != stored {
            return Err("block header checksum mismatch");
        }
        let trailer = ptr::read_unaligned(trailer_addr(addr, size) as *const u64);
        if trailer != stored {
            return Err("block trailer checksum mismatch");
        }
        Ok(())
    }

    /// Verify a neighbour reached through a list link.
    ///
    /// # Safety
    /// The list lock must be held and `list` must be its contents.
    unsafe fn check_linked(&self, list: &BlockList, addr: usize) -> usize {
        let Some(&size) = list.sizes.get(&addr) else {
            kernel_trap!("block list link points outside the allocator");
        };
        if let Err(reason) = self.check(addr, size) {
            kernel_trap!("{reason}");
        }
        size
    }
}

fn trailer_addr(addr: usize, size: usize) -> usize {
    addr + HEADER_LEN + round_up(size, PAYLOAD_ALIGN)
}

// ---------------------------------------------------------------------------
// Page locking
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn lock_region(ptr: NonNull<u8>, len: usize) -> bool {
    // SAFETY: the region is a live allocation owned by the caller.
    match unsafe { nix::sys::mman::mlock(ptr.cast(), len) } {
        Ok(()) => true,
        Err(e) => {
            log::debug!("mlock of {len} bytes failed: {e}");
            false
        }
    }
}

#[cfg(unix)]
fn unlock_region(ptr: NonNull<u8>, len: usize) {
    // SAFETY: the region was locked by `lock_region` and is still allocated.
    let _ = unsafe { nix::sys::mman::munlock(ptr.cast(), len) };
}

#[cfg(not(unix))]
fn lock_region(_ptr: NonNull<u8>, _len: usize) -> bool {
    false
}

#[cfg(not(unix))]
fn unlock_region(_ptr: NonNull<u8>, _len: usize) {}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// Hands out [`SecureBlock`]s and tracks them in one checked list.
pub(crate) struct SecureAllocator {
    shared: Arc<AllocShared>,
}

impl SecureAllocator {
    pub(crate) fn new(lock_pages: bool, max_size: usize) -> KernelResult<Self> {
        let rng = SystemRandom::new();
        let key =
            hmac::Key::generate(hmac::HMAC_SHA256, &rng).map_err(|_| KernelError::Failed)?;
        let max_size = max_size.min(u32::MAX as usize);
        Ok(Self {
            shared: Arc::new(AllocShared {
                list: Mutex::new(BlockList {
                    head: 0,
                    sizes: HashMap::new(),
                }),
                key,
                lock_pages,
                max_size,
            }),
        })
    }

    /// Allocate a zeroed block with at least `size` bytes of payload.
    pub(crate) fn allocate(&self, size: usize) -> KernelResult<SecureBlock> {
        if size > self.shared.max_size {
            return Err(KernelError::Overflow);
        }
        let size = size.max(MIN_ALLOC_SIZE);
        let total = HEADER_LEN + round_up(size, PAYLOAD_ALIGN) + TRAILER_LEN;
        let layout =
            Layout::from_size_align(total, BLOCK_ALIGN).map_err(|_| KernelError::Memory)?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(KernelError::Memory)?;

        let mut flags = BlockFlags::empty();
        if self.shared.lock_pages && lock_region(ptr, total) {
            flags |= BlockFlags::LOCKED;
        }

        let addr = ptr.as_ptr() as usize;
        let mut list = self.shared.lock_list();
        // SAFETY: `addr` is the fresh allocation above; neighbours are only
        // touched after `check_linked` confirmed them.
        unsafe {
            let header = &mut *(addr as *mut BlockHeader);
            header.flags = flags.bits();
            header.size = size as u32;
            header.prev = 0;
            header.next = list.head;

            if list.head != 0 {
                let head = list.head;
                let head_size = self.shared.check_linked(&list, head);
                (*(head as *mut BlockHeader)).prev = addr;
                self.shared.seal(head, head_size);
            }
            self.shared.seal(addr, size);
        }
        list.head = addr;
        list.sizes.insert(addr, size);
        drop(list);

        Ok(SecureBlock {
            ptr,
            layout,
            size,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Walk the block list verifying every block. Returns the number walked.
    pub(crate) fn verify_all(&self) -> usize {
        let list = self.shared.lock_list();
        let mut addr = list.head;
        let mut prev = 0usize;
        let mut walked = 0usize;
        while addr != 0 {
            // SAFETY: `check_linked` only accepts addresses in `sizes`.
            unsafe {
                self.shared.check_linked(&list, addr);
                let header = &*(addr as *const BlockHeader);
                if header.prev != prev {
                    kernel_trap!("block list back-link corrupted");
                }
                prev = addr;
                addr = header.next;
            }
            walked += 1;
            if walked > list.sizes.len() {
                kernel_trap!("block list contains a cycle");
            }
        }
        if walked != list.sizes.len() {
            kernel_trap!("block list lost {} blocks", list.sizes.len() - walked);
        }
        walked
    }

    /// Number of live blocks.
    pub(crate) fn live_blocks(&self) -> usize {
        self.shared.lock_list().sizes.len()
    }
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// One checked allocation. Zeroised and released on drop.
pub(crate) struct SecureBlock {
    ptr: NonNull<u8>,
    layout: Layout,
    size: usize,
    shared: Arc<AllocShared>,
}

// SAFETY: the block exclusively owns its allocation. Header updates made by
// neighbours go through the allocator's list lock.
unsafe impl Send for SecureBlock {}
// SAFETY: shared references only read the payload; every header access takes
// the list lock.
unsafe impl Sync for SecureBlock {}

impl SecureBlock {
    fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    fn flags(&self) -> BlockFlags {
        let _list = self.shared.lock_list();
        // SAFETY: header of a live block, read under the list lock.
        BlockFlags::from_bits_retain(unsafe { (*(self.addr() as *const BlockHeader)).flags })
    }

    pub(crate) fn len(&self) -> usize {
        self.size
    }

    pub(crate) fn payload(&self) -> &[u8] {
        // SAFETY: the payload region lies inside the allocation.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(HEADER_LEN), self.size) }
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        if self.flags().contains(BlockFlags::PROTECTED) {
            kernel_trap!("write to read-only memory block");
        }
        // SAFETY: the payload region lies inside the allocation and `&mut self`
        // guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(HEADER_LEN), self.size) }
    }

    /// Mark the payload read-only. Later writes trap.
    pub(crate) fn protect(&mut self) {
        self.update_flags(|f| f | BlockFlags::PROTECTED);
    }

    pub(crate) fn unprotect(&mut self) {
        self.update_flags(|f| f - BlockFlags::PROTECTED);
    }

    fn update_flags(&mut self, f: impl FnOnce(BlockFlags) -> BlockFlags) {
        let list = self.shared.lock_list();
        let addr = self.addr();
        // SAFETY: live block, list lock held.
        unsafe {
            if let Err(reason) = self.shared.check(addr, self.size) {
                drop(list);
                kernel_trap!("{reason}");
            }
            let header = &mut *(addr as *mut BlockHeader);
            header.flags = f(BlockFlags::from_bits_retain(header.flags)).bits();
            self.shared.seal(addr, self.size);
        }
    }

    /// Zero the payload, clearing read-only protection first.
    pub(crate) fn wipe(&mut self) {
        self.unprotect();
        self.payload_mut().zeroize();
    }

    /// Verify this block's header and trailer. Traps on corruption.
    pub(crate) fn verify(&self) {
        let list = self.shared.lock_list();
        // SAFETY: live block, list lock held.
        let result = unsafe { self.shared.check(self.addr(), self.size) };
        drop(list);
        if let Err(reason) = result {
            kernel_trap!("{reason}");
        }
    }

    /// Verify, unlink from the list, zeroise everything and unlock pages.
    /// Leaves the memory allocated.
    fn release(&mut self) {
        let addr = self.addr();
        let mut list = self.shared.lock_list();
        // SAFETY: live block and its list neighbours, list lock held.
        let locked = unsafe {
            if let Err(reason) = self.shared.check(addr, self.size) {
                kernel_trap!("{reason}");
            }
            let header = &*(addr as *const BlockHeader);
            let (prev, next) = (header.prev, header.next);
            let locked = BlockFlags::from_bits_retain(header.flags).contains(BlockFlags::LOCKED);

            if prev != 0 {
                let prev_size = self.shared.check_linked(&list, prev);
                (*(prev as *mut BlockHeader)).next = next;
                self.shared.seal(prev, prev_size);
            } else {
                list.head = next;
            }
            if next != 0 {
                let next_size = self.shared.check_linked(&list, next);
                (*(next as *mut BlockHeader)).prev = prev;
                self.shared.seal(next, next_size);
            }
            locked
        };
        list.sizes.remove(&addr);
        drop(list);

        // SAFETY: the whole allocation is owned by this block.
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()).zeroize();
        }
        if locked {
            unlock_region(self.ptr, self.layout.size());
        }
    }
}

impl Drop for SecureBlock {
    fn drop(&mut self) {
        self.release();
        // SAFETY: allocated in `SecureAllocator::allocate` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
impl SecureBlock {
    /// The whole block, header through trailer.
    pub(crate) fn raw_mut(&mut self) -> &mut [u8] {
        // SAFETY: the allocation is `layout.size()` bytes and exclusively ours.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// Free the block, returning a copy of its memory as it was just before
    /// it went back to the OS.
    pub(crate) fn free_and_inspect(self) -> Vec<u8> {
        let mut this = mem::ManuallyDrop::new(self);
        this.release();
        let snapshot = this.raw_mut().to_vec();
        // SAFETY: same layout as the allocation; `shared` is dropped exactly once.
        unsafe {
            alloc::dealloc(this.ptr.as_ptr(), this.layout);
            ptr::drop_in_place(&mut this.shared);
        }
        snapshot
    }
}
