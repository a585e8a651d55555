//! Counter bookkeeping. Kept in its own binary so no other test moves the
//! process-wide counters underneath it.

use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};

#[test]
fn allocations_minus_frees_tracks_live_blocks() {
  sharedheap::init().expect("heap init");
  let start = sharedheap::stats();
  let mut rng = StdRng::seed_from_u64(7);
  let mut live = Vec::new();

  for round in 0..20 {
    for _ in 0..500 {
      let ptr = sharedheap::alloc(rng.random_range(1..=1000));
      assert!(!ptr.is_null());
      live.push(ptr);
    }

    live.shuffle(&mut rng);
    let keep = live.len() / 2;
    for ptr in live.drain(keep..) {
      unsafe { sharedheap::release(ptr) };
    }

    let delta = sharedheap::stats() - start;
    assert_eq!(delta.live(), live.len() as i64, "round {round}");
  }

  for ptr in live.drain(..) {
    unsafe { sharedheap::release(ptr) };
  }
  let delta = sharedheap::stats() - start;
  assert_eq!(delta.live(), 0);
  assert_eq!(delta.allocations, 20 * 500);
  assert_eq!(delta.reallocations, 0);

  // Null frees are not counted.
  unsafe { sharedheap::release(std::ptr::null_mut()) };
  assert_eq!(sharedheap::stats() - start, delta);

  // Reallocation moves a block without changing the live count.
  let ptr = sharedheap::alloc(10);
  let moved = unsafe { sharedheap::realloc(ptr, 100) };
  assert!(!moved.is_null());
  let delta = sharedheap::stats() - start;
  assert_eq!(delta.reallocations, 1);
  assert_eq!(delta.live(), 1);

  unsafe { sharedheap::release(moved) };
  assert_eq!((sharedheap::stats() - start).live(), 0);

  assert_eq!(sharedheap::arenas_created(), sharedheap::ARENA_COUNT);
}
