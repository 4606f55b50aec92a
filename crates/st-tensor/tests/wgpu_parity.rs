#![cfg(feature = "wgpu")]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use st_tensor::{CpuBackend, MathBackend, Shape, WgpuBackend};

const TOLERANCE: f32 = 1e-3;

fn device() -> Option<WgpuBackend> {
    match WgpuBackend::new() {
        Ok(backend) => Some(backend),
        Err(err) => {
            eprintln!("skipping wgpu parity: {err}");
            None
        }
    }
}

fn host(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-2.0..2.0)).collect()
}

fn assert_close(cpu: &[f32], gpu: &[f32]) {
    assert_eq!(cpu.len(), gpu.len());
    for (index, (a, b)) in cpu.iter().zip(gpu.iter()).enumerate() {
        let scale = a.abs().max(1.0);
        assert!((a - b).abs() / scale <= TOLERANCE, "element {index}: {a} vs {b}");
    }
}

#[test]
fn matmul_family_matches_cpu() {
    let Some(gpu) = device() else { return };
    let cpu = CpuBackend::serial();
    let mut rng = StdRng::seed_from_u64(3);
    let (m, k, n) = (9, 21, 17);
    let a = host(&mut rng, m * k);
    let b = host(&mut rng, k * n);
    let at = host(&mut rng, k * m);
    let bt = host(&mut rng, n * k);

    let cases: [(&str, &[f32], Shape, &[f32], Shape); 3] = [
        ("matmul", a.as_slice(), Shape::matrix(m, k), b.as_slice(), Shape::matrix(k, n)),
        ("lhs_t", at.as_slice(), Shape::matrix(k, m), b.as_slice(), Shape::matrix(k, n)),
        ("rhs_t", a.as_slice(), Shape::matrix(m, k), bt.as_slice(), Shape::matrix(n, k)),
    ];
    for (label, lhs, lhs_shape, rhs, rhs_shape) in cases {
        let out_shape = Shape::matrix(m, n);
        let (cl, cr) = (
            cpu.from_host(lhs, &lhs_shape).unwrap(),
            cpu.from_host(rhs, &rhs_shape).unwrap(),
        );
        let (gl, gr) = (
            gpu.from_host(lhs, &lhs_shape).unwrap(),
            gpu.from_host(rhs, &rhs_shape).unwrap(),
        );
        let mut co = cpu.zeros(&out_shape).unwrap();
        let mut go = gpu.zeros(&out_shape).unwrap();
        match label {
            "matmul" => {
                cpu.matmul(&mut co, &cl, &cr).unwrap();
                gpu.matmul(&mut go, &gl, &gr).unwrap();
            }
            "lhs_t" => {
                cpu.matmul_transpose_lhs(&mut co, &cl, &cr).unwrap();
                gpu.matmul_transpose_lhs(&mut go, &gl, &gr).unwrap();
            }
            _ => {
                cpu.matmul_transpose_rhs(&mut co, &cl, &cr).unwrap();
                gpu.matmul_transpose_rhs(&mut go, &gl, &gr).unwrap();
            }
        }
        assert_close(co.data(), &gpu.to_host(&go).unwrap());
    }
}

#[test]
fn elementwise_and_row_ops_match_cpu() {
    let Some(gpu) = device() else { return };
    let cpu = CpuBackend::new();
    let mut rng = StdRng::seed_from_u64(5);
    let shape = Shape::matrix(4, 6);
    let x = host(&mut rng, 24);
    let y = host(&mut rng, 24);
    let bias = host(&mut rng, 6);

    let (cx, cy) = (cpu.from_host(&x, &shape).unwrap(), cpu.from_host(&y, &shape).unwrap());
    let (gx, gy) = (gpu.from_host(&x, &shape).unwrap(), gpu.from_host(&y, &shape).unwrap());
    let cb = cpu.from_host(&bias, &Shape::row(6)).unwrap();
    let gb = gpu.from_host(&bias, &Shape::row(6)).unwrap();
    let mut co = cpu.zeros(&shape).unwrap();
    let mut go = gpu.zeros(&shape).unwrap();

    macro_rules! check {
        ($cpu:expr, $gpu:expr) => {{
            $cpu.unwrap();
            $gpu.unwrap();
            assert_close(co.data(), &gpu.to_host(&go).unwrap());
        }};
    }

    check!(cpu.mul(&mut co, &cx, &cy), gpu.mul(&mut go, &gx, &gy));
    check!(cpu.sub(&mut co, &cx, &cy), gpu.sub(&mut go, &gx, &gy));
    check!(cpu.sigmoid(&mut co, &cx), gpu.sigmoid(&mut go, &gx));
    check!(cpu.tanh(&mut co, &cx), gpu.tanh(&mut go, &gx));
    check!(cpu.softmax_rows(&mut co, &cx), gpu.softmax_rows(&mut go, &gx));
    check!(
        cpu.add_row_broadcast(&mut co, &cx, &cb),
        gpu.add_row_broadcast(&mut go, &gx, &gb)
    );
    check!(cpu.add_scaled(&mut co, &cy, 0.3), gpu.add_scaled(&mut go, &gy, 0.3));
    check!(cpu.clip(&mut co, &cx, -0.5, 0.5), gpu.clip(&mut go, &gx, -0.5, 0.5));
    check!(
        cpu.accumulate_row(&mut co, 2, &cb),
        gpu.accumulate_row(&mut go, 2, &gb)
    );
    check!(
        cpu.softmax_cross_entropy_grad(&mut co, &cx, &[0, 5, 2, 3]),
        gpu.softmax_cross_entropy_grad(&mut go, &gx, &[0, 5, 2, 3])
    );

    check!(cpu.add(&mut co, &cx, &cy), gpu.add(&mut go, &gx, &gy));
    check!(cpu.scale(&mut co, &cx, -1.7), gpu.scale(&mut go, &gx, -1.7));
    check!(cpu.sub_scaled(&mut co, &cy, 0.4), gpu.sub_scaled(&mut go, &gy, 0.4));
    check!(cpu.fill(&mut co, 0.25), gpu.fill(&mut go, 0.25));
    check!(cpu.copy(&mut co, &cy), gpu.copy(&mut go, &gy));
    check!(
        cpu.sigmoid_derivative(&mut co, &cx),
        gpu.sigmoid_derivative(&mut go, &gx)
    );
    check!(
        cpu.tanh_derivative(&mut co, &cx),
        gpu.tanh_derivative(&mut go, &gx)
    );
    check!(cpu.set_row(&mut co, 1, &cb), gpu.set_row(&mut go, 1, &gb));

    let gd = gpu.duplicate(&gx).unwrap();
    assert_close(cx.data(), &gpu.to_host(&gd).unwrap());

    let mut cslice = cpu.zeros(&Shape::row(6)).unwrap();
    let mut gslice = gpu.zeros(&Shape::row(6)).unwrap();
    cpu.slice_row(&mut cslice, &cy, 3).unwrap();
    gpu.slice_row(&mut gslice, &gy, 3).unwrap();
    assert_close(cslice.data(), &gpu.to_host(&gslice).unwrap());

    let mut crow = cpu.zeros(&Shape::row(6)).unwrap();
    let mut grow = gpu.zeros(&Shape::row(6)).unwrap();
    cpu.embedding_lookup(&mut crow, &cx, 3).unwrap();
    gpu.embedding_lookup(&mut grow, &gx, 3).unwrap();
    assert_close(crow.data(), &gpu.to_host(&grow).unwrap());

    let mut ct = cpu.zeros(&Shape::matrix(6, 4)).unwrap();
    let mut gt = gpu.zeros(&Shape::matrix(6, 4)).unwrap();
    cpu.transpose(&mut ct, &cx).unwrap();
    gpu.transpose(&mut gt, &gx).unwrap();
    assert_close(ct.data(), &gpu.to_host(&gt).unwrap());

    for tensor in [gx, gy, gb, go, gd, gslice, grow, gt] {
        gpu.release(tensor).unwrap();
    }
}

#[test]
fn empty_tensors_round_trip() {
    let Some(gpu) = device() else { return };
    let empty = gpu.from_host(&[], &Shape::matrix(0, 0)).unwrap();
    assert!(gpu.to_host(&empty).unwrap().is_empty());
    gpu.release(empty).unwrap();
}
