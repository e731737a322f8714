use criterion::{black_box, criterion_group, criterion_main, Criterion};

use stubline_intercept::arch::{arm64, x86_64};
use stubline_intercept::code::page_span;

fn bench_encode(c: &mut Criterion) {
    c.bench_function("x86_64_encode_redirect", |b| {
        b.iter(|| x86_64::encode_redirect(black_box(0x5555_0000_1000), black_box(0x5555_0004_2000)))
    });
    c.bench_function("arm64_encode_redirect", |b| {
        b.iter(|| arm64::encode_redirect(black_box(0x1_0000_4000), black_box(0x1_0020_0000)))
    });
}

fn bench_page_span(c: &mut Criterion) {
    c.bench_function("page_span", |b| {
        b.iter(|| page_span(black_box(0x7fff_1234_5ffc), black_box(16), black_box(0x4000)))
    });
}

criterion_group!(benches, bench_encode, bench_page_span);
criterion_main!(benches);
