use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use st_tensor::{CpuBackend, CpuTensor, MathBackend, Shape};

#[track_caller]
fn unwrap_ok<T, E: core::fmt::Debug>(context: &str, result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(error) => panic!("{context}: {error:?}"),
    }
}

fn random(backend: &CpuBackend, rng: &mut StdRng, rows: usize, cols: usize) -> CpuTensor {
    let data: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
    unwrap_ok("upload", backend.from_host(&data, &Shape::matrix(rows, cols)))
}

fn bench_matmul(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_matmul");
    let mut rng = StdRng::seed_from_u64(7);
    for size in [16usize, 64, 256] {
        for (label, backend) in [
            ("serial", CpuBackend::serial()),
            ("parallel", CpuBackend::new().with_parallel_volume(1)),
        ] {
            let lhs = random(&backend, &mut rng, size, size);
            let rhs = random(&backend, &mut rng, size, size);
            let mut dst = unwrap_ok("zeros", backend.zeros(&Shape::matrix(size, size)));
            group.bench_with_input(BenchmarkId::new(label, size), &size, |b, _| {
                b.iter(|| {
                    unwrap_ok("matmul", backend.matmul(&mut dst, black_box(&lhs), black_box(&rhs)))
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_matmul);
criterion_main!(benches);
