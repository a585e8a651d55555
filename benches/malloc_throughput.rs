use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// Shared heap alloc/free throughput.
fn sharedheap_alloc_release(size: usize) {
  for _ in 0..OPS {
    let ptr = sharedheap::alloc(size);
    black_box(ptr);
    unsafe { sharedheap::release(ptr) };
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  sharedheap::init().expect("shared heap init");
  let mut group = c.benchmark_group("malloc_throughput");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("sharedheap", size), &size, |b, &size| {
      b.iter(|| sharedheap_alloc_release(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

/// Same loop with a resident working set, so every scan walks past live chunks.
fn benchmark_fragmented(c: &mut Criterion) {
  sharedheap::init().expect("shared heap init");
  let resident: Vec<*mut u8> = (0..2000).map(|i| sharedheap::alloc(1 + i % 1000)).collect();

  let mut group = c.benchmark_group("fragmented");
  for size in [16, 1024] {
    group.throughput(Throughput::Elements(OPS));
    group.bench_with_input(BenchmarkId::new("sharedheap", size), &size, |b, &size| {
      b.iter(|| sharedheap_alloc_release(size))
    });
  }
  group.finish();

  for ptr in resident {
    unsafe { sharedheap::release(ptr) };
  }
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_fragmented);
criterion_main!(benches);
