//! Benchmark suite for the attention forward pass
//!
//! Measures end-to-end forward latency across (batch, seq) shapes and
//! compares the dense and structured-sparse projection paths.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use atender::{
    prune_2of4, AttentionConfig, AttentionWeights, FusedAttentionLayer, HostProvider,
    ProjectionWeights, SmArch, SystemAllocator, TensorView, TensorViewMut,
};

const NUM_HEADS: usize = 4;
const HEAD_DIM: usize = 16;
const HIDDEN: usize = NUM_HEADS * HEAD_DIM;

fn filler(len: usize, seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            ((state % 2000) as f32 / 1000.0 - 1.0) * 0.25
        })
        .collect()
}

fn bench_weights(sparse: bool) -> AttentionWeights<f32> {
    let mk = |seed: u64| {
        let dense = prune_2of4(&filler(HIDDEN * HIDDEN, seed), HIDDEN, HIDDEN).unwrap();
        let w = ProjectionWeights::new(dense, filler(HIDDEN, seed + 50), HIDDEN, HIDDEN).unwrap();
        if sparse {
            w.with_sparse_encoding().unwrap()
        } else {
            w
        }
    };
    AttentionWeights::new(mk(1), mk(2), mk(3), mk(4), HIDDEN).unwrap()
}

fn build_layer(
    max_batch: usize,
    max_seq: usize,
    sparsity_enabled: bool,
) -> FusedAttentionLayer<f32, HostProvider, SystemAllocator> {
    let config = AttentionConfig {
        max_batch_size: max_batch,
        max_seq_len: max_seq,
        num_heads: NUM_HEADS,
        head_dim: HEAD_DIM,
        arch: SmArch::Ampere,
        query_scale: 1.0 / (HEAD_DIM as f32).sqrt(),
        release_after_call: false,
        sparsity_enabled,
    };
    FusedAttentionLayer::new(
        config,
        bench_weights(sparsity_enabled),
        HostProvider::new(),
        SystemAllocator::new(),
    )
    .unwrap()
}

fn bench_forward_shapes(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");
    for (batch, seq) in [(1usize, 32usize), (1, 128), (4, 64)] {
        let mut layer = build_layer(batch, seq, false);
        let tokens = batch * seq;
        let x = filler(tokens * HIDDEN, 9);
        let mask = vec![1.0f32; batch * seq * seq];
        let mut out = vec![0.0f32; tokens * HIDDEN];

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("b{batch}_s{seq}")),
            &(batch, seq),
            |b, _| {
                b.iter(|| {
                    let xs = TensorView::new(&x, &[tokens, HIDDEN]).unwrap();
                    let mv = TensorView::new(&mask, &[batch, 1, seq, seq]).unwrap();
                    let mut ov = TensorViewMut::new(&mut out, &[tokens, HIDDEN]).unwrap();
                    layer.forward(&xs, &mv, None, &mut ov).unwrap();
                    black_box(out[0])
                });
            },
        );
    }
    group.finish();
}

fn bench_projection_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection_path");
    let (batch, seq) = (2usize, 64usize);
    let tokens = batch * seq;
    let x = filler(tokens * HIDDEN, 9);
    let mask = vec![1.0f32; batch * seq * seq];

    for (label, sparsity) in [("dense", false), ("sparse", true)] {
        let mut layer = build_layer(batch, seq, sparsity);
        let mut out = vec![0.0f32; tokens * HIDDEN];
        group.bench_function(label, |b| {
            b.iter(|| {
                let xs = TensorView::new(&x, &[tokens, HIDDEN]).unwrap();
                let mv = TensorView::new(&mask, &[batch, 1, seq, seq]).unwrap();
                let mut ov = TensorViewMut::new(&mut out, &[tokens, HIDDEN]).unwrap();
                layer.forward(&xs, &mv, None, &mut ov).unwrap();
                black_box(out[0])
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_forward_shapes, bench_projection_paths);
criterion_main!(benches);
