#![allow(clippy::missing_safety_doc)]

//! First-fit `malloc`/`free`/`realloc` over anonymous memory that stays shared
//! between a process and every child it forks afterwards.
//!
//! The heap is a fixed set of 1 MiB arenas. Each arena is one `MAP_SHARED`
//! mapping laid out as:
//!
//! ```text
//! +------+--------+---------+--------+---------+-----+--------+------------+
//! | lock | header | payload | header | payload | ... | header | free words |
//! +------+--------+---------+--------+---------+-----+--------+------------+
//!  word 0 \________________________ chunk chain ______________________________/
//! ```
//!
//! A header is a single `i64`. Non-negative means allocated with that many
//! payload words, negative means free with `!header` words. Freeing only flips
//! the header; adjacent free chunks are merged by the next scan that walks over
//! them.

use core::{
  hint,
  mem::size_of,
  ops::Sub,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};
use std::{
  io, process,
  sync::{Mutex, OnceLock},
};

// =============================================================================
// Constants
// =============================================================================

/// Number of arenas mapped by every heap.
pub const ARENA_COUNT: usize = 40;

/// Bytes per arena mapping.
pub const ARENA_SIZE: usize = 1 << 20; // 1MB

const WORD_SIZE: usize = size_of::<i64>();

/// Words per arena mapping, lock word included.
pub const ARENA_WORDS: usize = ARENA_SIZE / WORD_SIZE;

/// Words covered by the chunk chain. Word 0 of the mapping is the lock.
const CHAIN_WORDS: usize = ARENA_WORDS - 1;

/// Free length of a freshly formatted arena: the chain minus its first header.
pub const LAST_WORD: usize = CHAIN_WORDS - 1;

/// Full passes over all arenas before `alloc` gives up.
const SCAN_PASSES: usize = 3;

/// Address space reserved and abandoned after every arena.
#[cfg(feature = "guard-mapping")]
const GUARD_SIZE: usize = 1 << 17; // 128KB

/// Alignment of every returned payload.
pub const PAYLOAD_ALIGN: usize = 16;

/// Word written in front of a payload that had to skip one word for alignment.
/// Allocated headers are never 0, so the two cannot be confused.
const PAD_MARKER: i64 = 0;

/// Arenas mapped by this process image.
static ARENAS_CREATED: AtomicUsize = AtomicUsize::new(0);

// Per-process counters. A forked child starts from the parent's values.
static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static FREES: AtomicU64 = AtomicU64::new(0);
static REALLOCATIONS: AtomicU64 = AtomicU64::new(0);

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ARENA_SIZE.is_power_of_two());
const _: () = assert!(ARENA_WORDS == 131072);
const _: () = assert!(LAST_WORD == 131070);
const _: () = assert!(PAYLOAD_ALIGN == 2 * WORD_SIZE);
const _: () = assert!(size_of::<SpinLock>() <= WORD_SIZE);
const _: () = assert!(SCAN_PASSES >= 1);

// =============================================================================
// Errors
// =============================================================================

/// Failure to bring up the shared heap.
#[derive(Debug, thiserror::Error)]
pub enum HeapError {
  #[error("cannot map shared arena {arena}")]
  Map {
    arena: usize,
    #[source]
    source: io::Error,
  },
}

/// The heap is unusable without its arenas, so there is nothing to fall back to.
#[cold]
fn fatal(err: HeapError) -> ! {
  log::error!("{err}");
  match std::error::Error::source(&err) {
    Some(cause) => eprintln!("sharedheap: {err}: {cause}"),
    None => eprintln!("sharedheap: {err}"),
  }
  process::exit(1)
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap_shared(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_SHARED | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

/// Reserve inaccessible address space and forget about it. Arena capacity
/// expectations of existing hosts were measured with this waste in place.
#[cfg(feature = "guard-mapping")]
unsafe fn os_reserve_guard() {
  unsafe {
    libc::mmap(
      null_mut(),
      GUARD_SIZE,
      libc::PROT_NONE,
      libc::MAP_SHARED | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };
}

/// Map one zeroed, read-write, anonymous region of [`ARENA_SIZE`] bytes that
/// children forked later will see at the same address with the same pages.
pub(crate) fn create_arena() -> io::Result<NonNull<u8>> {
  let raw = unsafe { os_mmap_shared(ARENA_SIZE) };
  let Some(base) = NonNull::new(raw) else {
    return Err(io::Error::last_os_error());
  };

  #[cfg(feature = "guard-mapping")]
  unsafe {
    os_reserve_guard();
  }

  ARENAS_CREATED.fetch_add(1, Ordering::Relaxed);
  Ok(base)
}

// =============================================================================
// Spin Lock
// =============================================================================

/// Busy-wait lock that lives inside shared memory.
///
/// A process-private mutex would not be visible to the other processes mapping
/// the arena, so this is a single atomic byte polled in place.
#[repr(transparent)]
struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  /// Reinterpret the first byte at `ptr` as a lock. Zeroed memory is unlocked.
  #[inline]
  unsafe fn at<'a>(ptr: *mut u8) -> &'a Self {
    unsafe { &*ptr.cast::<SpinLock>() }
  }

  #[inline]
  fn lock(&self) -> SpinGuard<'_> {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    SpinGuard { lock: self }
  }

  #[inline]
  fn try_lock(&self) -> Option<SpinGuard<'_>> {
    let acquired = !self.locked.load(Ordering::Relaxed)
      && self
        .locked
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok();
    acquired.then_some(SpinGuard { lock: self })
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

/// Holds a [`SpinLock`] until dropped. A panic inside the critical section
/// still unlocks, otherwise every process sharing the arena would spin forever.
struct SpinGuard<'a> {
  lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    self.lock.unlock();
  }
}

// =============================================================================
// Chunk Header
// =============================================================================

/// Decoded chunk header. Lengths are in words and exclude the header itself.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Header {
  Allocated(usize),
  Free(usize),
}

impl Header {
  #[inline]
  pub const fn decode(word: i64) -> Self {
    if word < 0 {
      Header::Free(!word as usize)
    } else {
      Header::Allocated(word as usize)
    }
  }

  #[inline]
  pub const fn encode(self) -> i64 {
    match self {
      Header::Allocated(len) => len as i64,
      Header::Free(len) => !(len as i64),
    }
  }

  #[inline]
  pub const fn len(self) -> usize {
    match self {
      Header::Allocated(len) | Header::Free(len) => len,
    }
  }

  #[inline]
  pub const fn is_free(self) -> bool {
    matches!(self, Header::Free(_))
  }
}

/// Whole words needed for `size` bytes. Empty requests still take a word so that
/// no allocated header can read as the padding marker.
#[inline]
const fn words_for(size: usize) -> usize {
  let words = size.div_ceil(WORD_SIZE);
  if words == 0 { 1 } else { words }
}

// =============================================================================
// Arena
// =============================================================================

/// This process's view of one shared arena mapping.
///
/// Every method that touches the chain expects the caller to hold the arena
/// lock, except where noted.
#[derive(Clone, Copy)]
pub(crate) struct Arena {
  base: NonNull<u8>,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
  /// Map a new arena and format it as a single free chunk.
  pub(crate) fn map() -> io::Result<Self> {
    let arena = Arena {
      base: create_arena()?,
    };
    arena.format();
    Ok(arena)
  }

  /// Destructive: any chunk already handed out in this arena is lost.
  fn format(&self) {
    self.set_header(0, Header::Free(LAST_WORD));
    self.lock().unlock();
  }

  #[inline]
  fn lock(&self) -> &SpinLock {
    unsafe { SpinLock::at(self.base.as_ptr()) }
  }

  #[inline]
  fn chain(&self) -> *mut i64 {
    unsafe { self.base.as_ptr().add(WORD_SIZE).cast::<i64>() }
  }

  #[inline]
  fn header(&self, at: usize) -> Header {
    debug_assert!(at < CHAIN_WORDS);
    Header::decode(unsafe { self.chain().add(at).read() })
  }

  #[inline]
  fn set_header(&self, at: usize, header: Header) {
    debug_assert!(at < CHAIN_WORDS);
    unsafe { self.chain().add(at).write(header.encode()) };
  }

  /// A payload right after the header at `at` would sit on an 8-byte boundary.
  #[inline]
  fn needs_pad(&self, at: usize) -> bool {
    let header = self.chain().wrapping_add(at) as usize;
    header % PAYLOAD_ALIGN == 0
  }

  /// True if `ptr` points into this arena's chain. Safe without the lock.
  #[inline]
  pub(crate) fn contains(&self, ptr: *const u8) -> bool {
    let start = self.chain() as usize;
    let end = self.base.as_ptr() as usize + ARENA_SIZE;
    let addr = ptr as usize;
    addr >= start && addr < end
  }

  /// Merge every free chunk directly after the free chunk at `at` into it and
  /// return the merged length. Stops at the first allocated chunk or the end.
  fn coalesce(&self, at: usize, mut len: usize) -> usize {
    loop {
      let next = at + 1 + len;
      if next >= CHAIN_WORDS {
        break;
      }
      match self.header(next) {
        Header::Free(more) => len += 1 + more,
        Header::Allocated(_) => break,
      }
    }
    self.set_header(at, Header::Free(len));
    len
  }

  /// First free chunk, after coalescing, that holds `words` plus any alignment
  /// padding. Returns its offset, its length and the words it must provide.
  fn first_fit(&self, words: usize) -> Option<(usize, usize, usize)> {
    let mut at = 0;
    while at < CHAIN_WORDS {
      let len = match self.header(at) {
        Header::Free(len) => {
          let len = self.coalesce(at, len);
          let needed = words + self.needs_pad(at) as usize;
          if len >= needed {
            return Some((at, len, needed));
          }
          len
        }
        Header::Allocated(len) => len,
      };
      at += 1 + len;
    }
    None
  }

  /// Turn the free chunk at `at` into an allocation of `needed` words. The tail
  /// is split off as a new free chunk only if it can hold a header and a word;
  /// otherwise the whole chunk is handed out.
  fn carve(&self, at: usize, len: usize, needed: usize) -> NonNull<u8> {
    let taken = if len >= needed + 2 {
      self.set_header(at + 1 + needed, Header::Free(len - needed - 1));
      needed
    } else {
      len
    };
    self.set_header(at, Header::Allocated(taken));

    unsafe {
      let mut payload = self.chain().add(at + 1);
      if self.needs_pad(at) {
        payload.write(PAD_MARKER);
        payload = payload.add(1);
      }
      NonNull::new_unchecked(payload.cast::<u8>())
    }
  }

  /// First-fit allocation of `words` payload words. Caller holds the lock.
  unsafe fn allocate(&self, words: usize) -> Option<NonNull<u8>> {
    let (at, len, needed) = self.first_fit(words)?;
    Some(self.carve(at, len, needed))
  }

  /// Header offset of the chunk owning `payload`, and whether a pad word sits
  /// between them.
  unsafe fn chunk_of(&self, payload: *mut u8) -> (usize, bool) {
    unsafe {
      let mut word = payload.cast::<i64>().sub(1);
      let padded = word.read() == PAD_MARKER;
      if padded {
        word = word.sub(1);
      }
      ((word as usize - self.chain() as usize) / WORD_SIZE, padded)
    }
  }

  /// Payload bytes usable through `payload`. Caller holds the lock.
  unsafe fn payload_size(&self, payload: *mut u8) -> usize {
    let (at, padded) = unsafe { self.chunk_of(payload) };
    let header = self.header(at);
    debug_assert!(!header.is_free(), "payload {payload:p} is not allocated");
    (header.len() - padded as usize) * WORD_SIZE
  }

  /// Mark the chunk owning `payload` free. Neighbours are left alone until the
  /// next scan. Caller holds the lock.
  unsafe fn release(&self, payload: *mut u8) {
    let (at, _) = unsafe { self.chunk_of(payload) };
    let header = self.header(at);
    debug_assert!(!header.is_free(), "double free of {payload:p}");
    self.set_header(at, Header::Free(header.len()));
  }

  /// Walk the chain from the start, yielding `(offset, header)` pairs. Caller
  /// holds the lock or otherwise knows nobody is mutating the arena.
  pub(crate) fn walk(&self) -> Walk<'_> {
    Walk { arena: self, at: 0 }
  }
}

/// Iterator over the chunk chain of one arena. See [`Arena::walk`].
pub(crate) struct Walk<'a> {
  arena: &'a Arena,
  at: usize,
}

impl Iterator for Walk<'_> {
  type Item = (usize, Header);

  fn next(&mut self) -> Option<Self::Item> {
    if self.at >= CHAIN_WORDS {
      return None;
    }
    let at = self.at;
    let header = self.arena.header(at);
    self.at = at + 1 + header.len();
    Some((at, header))
  }
}

// =============================================================================
// Shared Heap
// =============================================================================

struct SharedHeap {
  arenas: Box<[Arena]>,
}

static HEAP: OnceLock<SharedHeap> = OnceLock::new();
static HEAP_INIT: Mutex<()> = Mutex::new(());

impl SharedHeap {
  fn new() -> Result<Self, HeapError> {
    let mut arenas = Vec::with_capacity(ARENA_COUNT);
    for arena in 0..ARENA_COUNT {
      arenas.push(Arena::map().map_err(|source| HeapError::Map { arena, source })?);
    }

    log::debug!(
      "shared heap ready: {} arenas of {} bytes",
      ARENA_COUNT,
      ARENA_SIZE
    );
    Ok(SharedHeap {
      arenas: arenas.into_boxed_slice(),
    })
  }

  fn try_get() -> Result<&'static Self, HeapError> {
    if let Some(heap) = HEAP.get() {
      return Ok(heap);
    }

    let _guard = HEAP_INIT.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(heap) = HEAP.get() {
      return Ok(heap);
    }
    let heap = Self::new()?;
    Ok(HEAP.get_or_init(|| heap))
  }

  #[inline]
  fn get() -> &'static Self {
    match Self::try_get() {
      Ok(heap) => heap,
      Err(err) => fatal(err),
    }
  }

  fn find_owning_arena(&self, ptr: *const u8) -> Option<usize> {
    self.arenas.iter().position(|arena| arena.contains(ptr))
  }

  fn owner(&self, ptr: *const u8) -> (usize, &Arena) {
    match self.find_owning_arena(ptr) {
      Some(idx) => (idx, &self.arenas[idx]),
      None => panic!("pointer {ptr:p} does not belong to the shared heap"),
    }
  }

  /// Try up to [`SCAN_PASSES`] rounds over every arena, starting at one picked by
  /// process id. Arenas locked by someone else are skipped, except `held`, whose
  /// lock the caller already owns.
  fn allocate(&self, size: usize, held: Option<usize>) -> *mut u8 {
    let words = words_for(size);
    if words > LAST_WORD {
      log::warn!("request of {size} bytes is larger than an arena");
      return null_mut();
    }

    let start = process::id() as usize;
    for attempt in 0..ARENA_COUNT * SCAN_PASSES {
      let idx = (start + attempt) % ARENA_COUNT;
      let arena = &self.arenas[idx];

      let found = if held == Some(idx) {
        unsafe { arena.allocate(words) }
      } else {
        let Some(_guard) = arena.lock().try_lock() else {
          continue;
        };
        unsafe { arena.allocate(words) }
      };

      match found {
        Some(payload) => return payload.as_ptr(),
        None => log::trace!("arena {idx} cannot fit {words} words"),
      }
    }

    log::warn!("shared heap exhausted: no arena can fit {size} bytes");
    null_mut()
  }
}

// =============================================================================
// Public API
// =============================================================================

/// Map and format every arena. Idempotent within a process image.
///
/// Call this before forking so parent and children share the same arenas. A
/// child inherits the parent's heap and must not try to build a new one.
pub fn init() -> Result<(), HeapError> {
  SharedHeap::try_get().map(|_| ())
}

/// Allocate `size` bytes with a 16-byte aligned payload. Null means every arena
/// is full for this size.
///
/// Initializes the heap on first use and exits the process if that fails.
pub fn alloc(size: usize) -> *mut u8 {
  let ptr = SharedHeap::get().allocate(size, None);
  if !ptr.is_null() {
    ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
  }
  ptr
}

/// Give back a block returned by [`alloc`] or [`realloc`]. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a live block of this heap. Double frees are not
/// detected. Panics if `ptr` lies outside every arena.
pub unsafe fn release(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }

  let (_, arena) = SharedHeap::get().owner(ptr);
  {
    let _guard = arena.lock().lock();
    unsafe { arena.release(ptr) };
  }
  FREES.fetch_add(1, Ordering::Relaxed);
}

/// Move a block to a fresh allocation of `new_size` bytes, copying what fits.
///
/// The block is never resized in place. A null `ptr` behaves like [`alloc`].
/// If no arena can fit `new_size`, null is returned and `ptr` stays valid.
/// Counts as a reallocation only, so allocations minus frees keeps tracking
/// live blocks.
///
/// # Safety
///
/// Same contract as [`release`] for `ptr`.
pub unsafe fn realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
  if ptr.is_null() {
    return alloc(new_size);
  }

  let heap = SharedHeap::get();
  let (idx, arena) = heap.owner(ptr);
  let guard = arena.lock().lock();

  let old_size = unsafe { arena.payload_size(ptr) };
  let fresh = heap.allocate(new_size, Some(idx));
  if !fresh.is_null() {
    unsafe {
      ptr::copy_nonoverlapping(ptr, fresh, old_size.min(new_size));
      arena.release(ptr);
    }
  }

  drop(guard);

  if !fresh.is_null() {
    REALLOCATIONS.fetch_add(1, Ordering::Relaxed);
  }
  fresh
}

/// Payload bytes available through a live block, at least what was requested.
///
/// # Safety
///
/// Same contract as [`release`] for `ptr`, which must not be null.
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
  let (_, arena) = SharedHeap::get().owner(ptr);
  let _guard = arena.lock().lock();
  unsafe { arena.payload_size(ptr) }
}

/// Snapshot of this process's allocator counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
  pub allocations: u64,
  pub frees: u64,
  pub reallocations: u64,
}

impl Stats {
  /// Blocks allocated and not yet freed since the counters started.
  pub fn live(&self) -> i64 {
    self.allocations as i64 - self.frees as i64
  }
}

impl Sub for Stats {
  type Output = Stats;

  fn sub(self, earlier: Stats) -> Stats {
    Stats {
      allocations: self.allocations - earlier.allocations,
      frees: self.frees - earlier.frees,
      reallocations: self.reallocations - earlier.reallocations,
    }
  }
}

pub fn stats() -> Stats {
  Stats {
    allocations: ALLOCATIONS.load(Ordering::Relaxed),
    frees: FREES.load(Ordering::Relaxed),
    reallocations: REALLOCATIONS.load(Ordering::Relaxed),
  }
}

/// Arenas this process image has mapped so far.
pub fn arenas_created() -> usize {
  ARENAS_CREATED.load(Ordering::Relaxed)
}

/// Occupancy of the whole heap as seen by one walk over every arena.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
  /// Chunks in all chains, free runs not yet merged counted separately.
  pub chunks: usize,
  /// Words held by allocated chunks, padding included.
  pub allocated_words: usize,
  /// Words held by free chunks.
  pub free_words: usize,
}

/// Walk every arena under its lock. Does not coalesce.
pub fn usage() -> Usage {
  let heap = SharedHeap::get();
  let mut usage = Usage::default();
  for arena in heap.arenas.iter() {
    let _guard = arena.lock().lock();
    for (_, header) in arena.walk() {
      usage.chunks += 1;
      match header {
        Header::Allocated(len) => usage.allocated_words += len,
        Header::Free(len) => usage.free_words += len,
      }
    }
  }
  usage
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub extern "C" fn SharedHeap_init() {
  if let Err(err) = init() {
    fatal(err);
  }
}

#[cfg(feature = "c_api")]
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub extern "C" fn SharedHeap_malloc(size: usize) -> *mut u8 {
  alloc(size)
}

#[cfg(feature = "c_api")]
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn SharedHeap_free(ptr: *mut u8) {
  unsafe { release(ptr) }
}

#[cfg(feature = "c_api")]
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn SharedHeap_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { realloc(ptr, size) }
}

#[cfg(feature = "c_api")]
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn SharedHeap_usable_size(ptr: *mut u8) -> usize {
  if ptr.is_null() {
    return 0;
  }
  unsafe { usable_size(ptr) }
}

// =============================================================================
// Tests
// =============================================================================
