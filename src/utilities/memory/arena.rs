use crate::error::{BuildError, Result};
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Configuration of an [`Arena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaSettings {
    /// Size in bytes of each region handed to a thread allocator. Oversized requests get a dedicated region.
    pub block_size: usize,
    /// Upper limit on reserved bytes. Claiming a region past this limit is an allocation failure.
    pub max_bytes: Option<usize>,
}

impl Default for ArenaSettings {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            max_bytes: None,
        }
    }
}

/// Snapshot of arena bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStatistics {
    /// Number of regions currently owned by the arena.
    pub region_count: usize,
    /// Bytes reserved from the system across all regions.
    pub bytes_reserved: usize,
    /// Bytes handed out to callers. Only includes allocators that have been dropped or refilled.
    pub bytes_used: usize,
}

struct Region {
    memory: NonNull<u8>,
    layout: Layout,
}

/// Bump allocator shared by all tasks of a build.
///
/// Each task allocates through its own [`ThreadAllocator`], which bumps a pointer inside a private region.
/// The shared region list is only locked when a thread allocator runs dry. Nothing is freed individually;
/// every region is released together by [`Arena::clear`] or on drop.
pub struct Arena {
    settings: ArenaSettings,
    regions: Mutex<Vec<Region>>,
    bytes_reserved: CachePadded<AtomicUsize>,
    bytes_used: CachePadded<AtomicUsize>,
}

// Regions are only reachable through the mutex or through allocators that borrow the arena.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Default for Arena {
    fn default() -> Self {
        Self::new(ArenaSettings::default())
    }
}

impl Arena {
    /// Alignment of every region. Allocations may request any power of two up to this.
    pub const REGION_ALIGNMENT: usize = 128;

    pub fn new(settings: ArenaSettings) -> Self {
        debug_assert!(settings.block_size > 0, "Block size must be positive.");
        Self {
            settings,
            regions: Mutex::new(Vec::new()),
            bytes_reserved: CachePadded::new(AtomicUsize::new(0)),
            bytes_used: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn settings(&self) -> &ArenaSettings {
        &self.settings
    }

    /// Creates an allocator that bumps through regions claimed from this arena.
    #[inline]
    pub fn thread_allocator(&self) -> ThreadAllocator<'_> {
        ThreadAllocator {
            arena: self,
            region: None,
            offset: 0,
            capacity: 0,
            used: 0,
        }
    }

    /// Reserves a fresh region of at least `minimum_size` bytes.
    fn claim_region(&self, minimum_size: usize) -> Result<(NonNull<u8>, usize)> {
        let size = self
            .settings
            .block_size
            .max(minimum_size)
            .next_multiple_of(Self::REGION_ALIGNMENT);

        let previous = self.bytes_reserved.fetch_add(size, Ordering::Relaxed);
        if let Some(limit) = self.settings.max_bytes {
            if previous + size > limit {
                self.bytes_reserved.fetch_sub(size, Ordering::Relaxed);
                return Err(BuildError::OutOfMemory { requested: size });
            }
        }

        let layout = match Layout::from_size_align(size, Self::REGION_ALIGNMENT) {
            Ok(layout) => layout,
            Err(_) => {
                self.bytes_reserved.fetch_sub(size, Ordering::Relaxed);
                return Err(BuildError::OutOfMemory { requested: size });
            }
        };
        let memory = match NonNull::new(unsafe { alloc::alloc(layout) }) {
            Some(memory) => memory,
            None => {
                self.bytes_reserved.fetch_sub(size, Ordering::Relaxed);
                return Err(BuildError::OutOfMemory { requested: size });
            }
        };

        self.regions.lock().push(Region { memory, layout });
        Ok((memory, size))
    }

    pub fn statistics(&self) -> ArenaStatistics {
        let regions = self.regions.lock();
        ArenaStatistics {
            region_count: regions.len(),
            bytes_reserved: regions.iter().map(|r| r.layout.size()).sum(),
            bytes_used: self.bytes_used.load(Ordering::Relaxed),
        }
    }

    /// Releases every region. Any `NodeRef` pointing into this arena is invalidated.
    pub fn clear(&mut self) {
        let regions = self.regions.get_mut();
        for region in regions.drain(..) {
            unsafe { alloc::dealloc(region.memory.as_ptr(), region.layout) };
        }
        *self.bytes_reserved.get_mut() = 0;
        *self.bytes_used.get_mut() = 0;
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Per-task bump allocator. Used by one thread at a time.
pub struct ThreadAllocator<'a> {
    arena: &'a Arena,
    region: Option<NonNull<u8>>,
    offset: usize,
    capacity: usize,
    used: usize,
}

// The region belongs to the arena; the allocator only carries a cursor into it.
unsafe impl Send for ThreadAllocator<'_> {}

impl<'a> ThreadAllocator<'a> {
    /// Returns `bytes` of uninitialized memory aligned to `align`.
    pub fn malloc(&mut self, bytes: usize, align: usize) -> Result<NonNull<u8>> {
        debug_assert!(
            align.is_power_of_two() && align <= Arena::REGION_ALIGNMENT,
            "Alignment must be a power of two no larger than the region alignment."
        );
        if let Some(region) = self.region {
            let start = self.offset.next_multiple_of(align);
            if start + bytes <= self.capacity {
                self.offset = start + bytes;
                self.used += bytes;
                return Ok(unsafe { NonNull::new_unchecked(region.as_ptr().add(start)) });
            }
        }

        // Out of room; the tail of the old region is abandoned.
        self.flush_used();
        let (region, capacity) = self.arena.claim_region(bytes)?;
        self.region = Some(region);
        self.capacity = capacity;
        self.offset = bytes;
        self.used = bytes;
        Ok(region)
    }

    /// Moves `value` into the arena.
    pub fn alloc<T: Copy>(&mut self, value: T) -> Result<NonNull<T>> {
        let memory = self
            .malloc(std::mem::size_of::<T>(), std::mem::align_of::<T>())?
            .cast::<T>();
        unsafe { memory.as_ptr().write(value) };
        Ok(memory)
    }

    #[inline]
    fn flush_used(&mut self) {
        if self.used > 0 {
            self.arena.bytes_used.fetch_add(self.used, Ordering::Relaxed);
            self.used = 0;
        }
    }
}

impl Drop for ThreadAllocator<'_> {
    fn drop(&mut self) {
        self.flush_used();
    }
}

/// One [`ThreadAllocator`] per worker of the current rayon pool, plus one for a caller outside the pool.
///
/// Tasks running on the same worker keep bumping through the same region, so forking does not claim a
/// fresh region per task.
pub struct WorkerAllocators<'a> {
    arena: &'a Arena,
    allocators: Vec<CachePadded<Mutex<ThreadAllocator<'a>>>>,
}

impl<'a> WorkerAllocators<'a> {
    pub fn new(arena: &'a Arena) -> Self {
        let allocators = (0..rayon::current_num_threads() + 1)
            .map(|_| CachePadded::new(Mutex::new(arena.thread_allocator())))
            .collect();
        Self { arena, allocators }
    }

    /// Gets the allocator of the calling worker.
    ///
    /// Returns `None` if that allocator is already in use further up this thread's stack, which happens when
    /// a nested parallel call steals another task.
    pub fn try_current(&self) -> Option<MutexGuard<'_, ThreadAllocator<'a>>> {
        let worker_index = rayon::current_thread_index()
            .filter(|&index| index + 1 < self.allocators.len())
            .unwrap_or(self.allocators.len() - 1);
        self.allocators[worker_index].try_lock()
    }

    /// Runs `f` with the calling worker's allocator, or with a temporary one if it is busy.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut ThreadAllocator<'a>) -> R) -> R {
        match self.try_current() {
            Some(mut alloc) => f(&mut *alloc),
            None => f(&mut self.arena.thread_allocator()),
        }
    }
}
