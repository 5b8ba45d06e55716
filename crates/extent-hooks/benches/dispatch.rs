//! Dispatch overhead benchmarks
//!
//! Compares the default fast path against a custom table, with and without
//! a populated slot, and the cost of a full map/unmap cycle.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use nebula_extent_hooks::pages::page_size;
use nebula_extent_hooks::prelude::*;
use std::hint::black_box;
use std::ptr::NonNull;

unsafe fn alloc_none(
    _: &ExtentHooks,
    _: Option<NonNull<u8>>,
    _: usize,
    _: usize,
    _: &mut bool,
    _: &mut bool,
    _: u32,
) -> Option<NonNull<u8>> {
    None
}

unsafe fn merge_ok(
    _: &ExtentHooks,
    _: NonNull<u8>,
    _: usize,
    _: NonNull<u8>,
    _: usize,
    _: bool,
    _: u32,
) -> bool {
    false
}

static EMPTY: ExtentHooks = ExtentHooks::new(alloc_none);
static WITH_MERGE: ExtentHooks = ExtentHooks::new(alloc_none).with_merge(merge_ok);

/// Merge routed through each of the three dispatch paths
fn bench_merge_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_dispatch");
    let tsd = Tsd::new();
    let a = NonNull::<u8>::dangling();
    let b = NonNull::new(a.as_ptr().wrapping_add(page_size())).unwrap_or(a);

    for (name, hooks) in [
        ("default", &DEFAULT_EXTENT_HOOKS),
        ("empty_slot", &EMPTY),
        ("custom", &WITH_MERGE),
    ] {
        let ehooks = EHooks::with_capabilities(hooks, PurgeCapabilities::NONE);
        group.bench_with_input(BenchmarkId::from_parameter(name), &ehooks, |bencher, ehooks| {
            bencher.iter(|| unsafe {
                black_box(ehooks.merge(Some(&tsd), a, 1, b, 1, true, 0));
            });
        });
    }

    group.finish();
}

/// Predicate cost, which the extent manager pays on every split attempt
fn bench_predicates(c: &mut Criterion) {
    let mut group = c.benchmark_group("predicates");
    let ehooks = EHooks::default();

    group.bench_function("split_will_fail", |bencher| {
        bencher.iter(|| black_box(ehooks.split_will_fail()));
    });
    group.bench_function("is_default", |bencher| {
        bencher.iter(|| black_box(ehooks.is_default()));
    });

    group.finish();
}

/// Full map/unmap cycle through the default backend
#[cfg(unix)]
fn bench_default_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("default_alloc");
    let ehooks = EHooks::default();
    let page = page_size();

    for pages in [1usize, 16, 256] {
        let size = pages * page;
        group.bench_with_input(BenchmarkId::from_parameter(pages), &size, |bencher, &size| {
            bencher.iter(|| unsafe {
                let (mut zero, mut commit) = (false, true);
                if let Some(addr) = ehooks.alloc(None, None, size, page, &mut zero, &mut commit, 0) {
                    ehooks.destroy(None, black_box(addr), size, true, 0);
                }
            });
        });
    }

    group.finish();
}

#[cfg(not(unix))]
fn bench_default_alloc(_: &mut Criterion) {}

criterion_group!(benches, bench_merge_paths, bench_predicates, bench_default_alloc);

criterion_main!(benches);
