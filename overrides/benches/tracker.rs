use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use stubline::{ChainTable, Quota, Request, Target};
use stubline_intercept::{CodePatcher, Prologue, Result, REDIRECT_LEN};

/// Accepts every patch without touching code.
#[derive(Default)]
struct NullPatcher;

impl CodePatcher for NullPatcher {
    unsafe fn install(&mut self, _target: usize, _replacement: usize) -> Result<Prologue> {
        Ok(Prologue::from_bytes([0; REDIRECT_LEN]))
    }

    unsafe fn restore(&mut self, _target: usize, _saved: &Prologue) -> Result<()> {
        Ok(())
    }
}

#[inline(never)]
fn bench_target(x: u64) -> u64 {
    black_box(x).rotate_left(7)
}

#[inline(never)]
fn other_target(x: u64) -> u64 {
    black_box(x) ^ 0xdead
}

fn target(f: fn(u64) -> u64) -> Target {
    Target::resolve(f).expect("resolvable benchmark target")
}

fn bench_unlimited(c: &mut Criterion) {
    let mut table = ChainTable::new(NullPatcher);
    table
        .request(target(other_target), Request::new(0x2000, "other", Quota::Always))
        .unwrap();
    table
        .request(target(bench_target), Request::new(0x1000, "unlimited", Quota::Unlimited))
        .unwrap();

    c.bench_function("record_invocation_unlimited", |b| {
        b.iter(|| table.record_invocation(black_box(0x1000)).unwrap())
    });
}

fn bench_chain_handover(c: &mut Criterion) {
    c.bench_function("record_invocation_chain_of_8", |b| {
        b.iter_batched(
            || {
                let mut table = ChainTable::new(NullPatcher);
                for i in 0..8 {
                    let request = Request::new(0x1000 + i, format!("r{}", i), Quota::ONCE);
                    table.request(target(bench_target), request).unwrap();
                }
                table
            },
            |mut table| {
                for i in 0..8 {
                    table.record_invocation(0x1000 + i).unwrap();
                }
                table
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_unlimited, bench_chain_handover);
criterion_main!(benches);
