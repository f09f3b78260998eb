//! Reverse-mode properties: seeding, masking, scattering and the error
//! taxonomy, checked through the reference interpreter.

use std::collections::BTreeMap;

use approx::assert_relative_eq;
use ndarray::{ArrayD, IxDyn};

use lyre::{
    propagate_adjoints, propagate_adjoints_scalar, DerivativeError, Interval, Module, Realizer,
    ScalarType,
};

fn buffer_1d(m: &mut Module, name: &str, data: Vec<f64>) {
    let len = data.len();
    let array = ArrayD::from_shape_vec(IxDyn(&[len]), data).unwrap();
    m.add_buffer(name, ScalarType::F32, vec![0], array);
}

fn ones_seed(m: &mut Module, name: &str) {
    let one = m.lit(1.0f32);
    m.define(name, &["x"], vec![one]);
}

#[test]
fn test_identity_seed_yields_exact_ones() {
    let mut m = Module::new();
    buffer_1d(&mut m, "in", vec![3.0, 5.0, 7.0]);
    let x = m.var("x");
    let read = m.read_buffer("in", vec![x]);
    m.define("out", &["x"], vec![read]);

    let d = propagate_adjoints_scalar(&m, "out").unwrap();
    let d_in = d.adjoint_name("in", -1).unwrap();
    let r = Realizer::new(&d.module, BTreeMap::new());
    assert_eq!(r.value(d_in, &[0]), vec![1.0]);
}

#[test]
fn test_linearity_matches_finite_differences() {
    let n = 6i64;
    let mut m = Module::new();
    buffer_1d(&mut m, "in", vec![0.5, -1.0, 2.0, 0.25, 3.0, -0.75, 1.5]);
    // out(x) = 2 in(x) + 3 in(x + 1) - in(x)
    let x = m.var("x");
    let r0 = m.read_buffer("in", vec![x]);
    let two = m.lit(2.0f32);
    let t0 = m.mul(two, r0);
    let x1 = m.var("x");
    let one = m.lit(1i32);
    let xp1 = m.add(x1, one);
    let r1 = m.read_buffer("in", vec![xp1]);
    let three = m.lit(3.0f32);
    let t1 = m.mul(three, r1);
    let sum = m.add(t0, t1);
    let out = m.sub(sum, r0);
    m.define("out", &["x"], vec![out]);
    ones_seed(&mut m, "seed");

    let d = propagate_adjoints(&m, "out", "seed", &[(0, n - 1)]).unwrap();
    let d_in = d.adjoint_name("in", -1).unwrap().to_string();
    let realizer = Realizer::new(&d.module, BTreeMap::new());

    let loss = |module: &Module| -> f64 {
        let r = Realizer::new(module, BTreeMap::new());
        (0..n).map(|i| r.value("out", &[i])[0]).sum()
    };
    let h = 1e-3;
    for i in 0..=n {
        let analytic = realizer.value(&d_in, &[i])[0];
        let mut plus = m.clone();
        plus.buffers.get_mut("in").unwrap().data[IxDyn(&[i as usize])] += h;
        let mut minus = m.clone();
        minus.buffers.get_mut("in").unwrap().data[IxDyn(&[i as usize])] -= h;
        let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
        assert_relative_eq!(analytic, numeric, max_relative = 1e-4, epsilon = 1e-6);
    }
}

#[test]
fn test_masking_zeroes_overwritten_point() {
    let n = 5i64;
    let mut m = Module::new();
    buffer_1d(&mut m, "in", vec![1.0; 5]);
    // f(x) = in(x); f(2) = 4.0  (plain overwrite, no self-read)
    let x = m.var("x");
    let read = m.read_buffer("in", vec![x]);
    m.define("f", &["x"], vec![read]);
    let idx = m.lit(2i32);
    let k = m.lit(4.0f32);
    m.define_update("f", vec![idx], vec![k], None);
    ones_seed(&mut m, "seed");

    let d = propagate_adjoints(&m, "f", "seed", &[(0, n - 1)]).unwrap();
    let pre = d.adjoint_name("f", -1).unwrap().to_string();
    let post = d.adjoint_name("f", 0).unwrap().to_string();

    let mut bounds = BTreeMap::new();
    bounds.insert(pre.clone(), vec![Interval::new(0, n - 1)]);
    let r = Realizer::new(&d.module, bounds);
    for i in 0..n {
        let expected = if i == 2 { 0.0 } else { 1.0 };
        assert_eq!(r.value(&pre, &[i]), vec![expected], "pre-update at {i}");
        assert_eq!(r.value(&post, &[i]), vec![1.0], "post-update at {i}");
    }
    // The pre-update adjoint is what flows into the buffer.
    let d_in = d.adjoint_name("in", -1).unwrap().to_string();
    for i in 0..n {
        let expected = if i == 2 { 0.0 } else { 1.0 };
        assert_eq!(r.value(&d_in, &[i]), vec![expected]);
    }
}

#[test]
fn test_self_update_accumulates_through_masking() {
    let n = 5i64;
    let mut m = Module::new();
    buffer_1d(&mut m, "in", vec![1.0; 5]);
    // f(x) = in(x); f(2) = 0.5 * f(2)
    let x = m.var("x");
    let read = m.read_buffer("in", vec![x]);
    m.define("f", &["x"], vec![read]);
    let idx = m.lit(2i32);
    let self_read = m.read("f", vec![idx]);
    let half = m.lit(0.5f32);
    let damped = m.mul(half, self_read);
    let idx2 = m.lit(2i32);
    m.define_update("f", vec![idx2], vec![damped], None);
    ones_seed(&mut m, "seed");

    let d = propagate_adjoints(&m, "f", "seed", &[(0, n - 1)]).unwrap();
    let pre = d.adjoint_name("f", -1).unwrap().to_string();
    let mut bounds = BTreeMap::new();
    bounds.insert(pre.clone(), vec![Interval::new(0, n - 1)]);
    let r = Realizer::new(&d.module, bounds);
    // Masked to zero, then the self-read contributes 0.5 of the seed;
    // without the mask this would read 1.5.
    for i in 0..n {
        let expected = if i == 2 { 0.5 } else { 1.0 };
        assert_eq!(r.value(&pre, &[i]), vec![expected]);
    }
}

#[test]
fn test_downsample_scatter_is_sparse() {
    let n = 4i64;
    let mut m = Module::new();
    buffer_1d(&mut m, "buf", vec![1.0; 16]);
    let x = m.var("x");
    let b = m.read_buffer("buf", vec![x]);
    m.define("in", &["x"], vec![b]);
    // out(x) = in(4 x)
    let x2 = m.var("x");
    let four = m.lit(4i32);
    let stretched = m.mul(four, x2);
    let r = m.read("in", vec![stretched]);
    m.define("out", &["x"], vec![r]);
    ones_seed(&mut m, "seed");

    let d = propagate_adjoints(&m, "out", "seed", &[(0, n - 1)]).unwrap();
    let d_in = d.adjoint_name("in", -1).unwrap().to_string();
    let d_out = d.adjoint_name("out", -1).unwrap().to_string();

    let mut bounds = BTreeMap::new();
    // The unwrapped accumulator carries the scatter update.
    let unb = d.adjoint_name("in_unbounded", -1).unwrap().to_string();
    bounds.insert(unb, vec![Interval::new(0, 4 * (n - 1))]);
    let r = Realizer::new(&d.module, bounds);
    for i in 0..=4 * (n - 1) {
        let expected = if i % 4 == 0 {
            r.value(&d_out, &[i / 4])[0]
        } else {
            0.0
        };
        assert_eq!(r.value(&d_in, &[i]), vec![expected], "adjoint at {i}");
    }
}

#[test]
fn test_strided_window_folds_to_dense_adjoint() {
    let n = 4i64;
    let mut m = Module::new();
    buffer_1d(&mut m, "in", vec![1.0; 16]);
    // out(x) = 0; out(x) = out(x) + in(4 x + k), k in [0, 4)
    let zero = m.lit(0.0f32);
    m.define("out", &["x"], vec![zero]);
    let rd = m.reduction(&[(0, 4)]);
    let x = m.var("x");
    let self_read = m.read("out", vec![x]);
    let x2 = m.var("x");
    let four = m.lit(4i32);
    let strided = m.mul(four, x2);
    let k = m.rvar(rd, 0);
    let idx = m.add(strided, k);
    let window = m.read_buffer("in", vec![idx]);
    let sum = m.add(self_read, window);
    let x3 = m.var("x");
    m.define_update("out", vec![x3], vec![sum], Some(rd));
    ones_seed(&mut m, "seed");

    let d = propagate_adjoints(&m, "out", "seed", &[(0, n - 1)]).unwrap();
    let d_in = d.adjoint_name("in", -1).unwrap().to_string();
    let d_out = d.adjoint_name("out", 0).unwrap().to_string();

    // The strided pattern collapses: no reduction remains, and the
    // adjoint is dense, equal to the consumer's at the decimated index.
    let accumulator = d.module.func(&d_in).unwrap();
    assert_eq!(accumulator.num_updates(), 0);
    let r = Realizer::new(&d.module, BTreeMap::new());
    for i in 0..4 * n {
        let expected = r.value(&d_out, &[i / 4])[0];
        assert_eq!(r.value(&d_in, &[i]), vec![expected], "adjoint at {i}");
    }
}

#[test]
fn test_convolution_weight_gradient_sums_over_image() {
    let n = 5i64;
    let data: Vec<f64> = (0..8).map(|v| v as f64 * 0.5).collect();
    let mut m = Module::new();
    buffer_1d(&mut m, "img", data.clone());
    buffer_1d(&mut m, "wbuf", vec![0.25, 0.5, 0.25]);
    let kk = m.var("k");
    let wread = m.read_buffer("wbuf", vec![kk]);
    m.define("w", &["k"], vec![wread]);
    // out(x) = 0; out(x) = out(x) + img(x + k) * w(k), k in [0, 3)
    let zero = m.lit(0.0f32);
    m.define("out", &["x"], vec![zero]);
    let rd = m.reduction(&[(0, 3)]);
    let x = m.var("x");
    let self_read = m.read("out", vec![x]);
    let x2 = m.var("x");
    let k = m.rvar(rd, 0);
    let shifted = m.add(x2, k);
    let tap = m.read_buffer("img", vec![shifted]);
    let k2 = m.rvar(rd, 0);
    let weight = m.read("w", vec![k2]);
    let prod = m.mul(tap, weight);
    let sum = m.add(self_read, prod);
    let x3 = m.var("x");
    m.define_update("out", vec![x3], vec![sum], Some(rd));
    ones_seed(&mut m, "seed");

    let d = propagate_adjoints(&m, "out", "seed", &[(0, n - 1)]).unwrap();
    let d_w = d.adjoint_name("w", -1).unwrap().to_string();
    let unb = d.adjoint_name("w_unbounded", -1).unwrap().to_string();
    let mut bounds = BTreeMap::new();
    bounds.insert(unb, vec![Interval::new(0, 2)]);
    let r = Realizer::new(&d.module, bounds);
    // dL/dw(k) = sum_x img(x + k)
    for k in 0..3i64 {
        let expected: f64 = (0..n).map(|x| data[(x + k) as usize]).sum();
        assert_relative_eq!(r.value(&d_w, &[k])[0], expected, max_relative = 1e-5);
    }
}

#[test]
fn test_unknown_intrinsic_degrades_to_zero_gradient() {
    let mut m = Module::new();
    buffer_1d(&mut m, "in", vec![1.0, 2.0]);
    let x = m.var("x");
    let read = m.read_buffer("in", vec![x]);
    let mystery = m.call_intrinsic("mystery_op", vec![read], ScalarType::F32);
    m.define("out", &["x"], vec![mystery]);
    ones_seed(&mut m, "seed");

    let d = propagate_adjoints(&m, "out", "seed", &[(0, 1)]).unwrap();
    let d_in = d.adjoint_name("in", -1).unwrap().to_string();
    let r = Realizer::new(&d.module, BTreeMap::new());
    assert_eq!(r.value(&d_in, &[0]), vec![0.0]);
    assert_eq!(r.value(&d_in, &[1]), vec![0.0]);
}

#[test]
fn test_unknown_extern_aborts() {
    let mut m = Module::new();
    buffer_1d(&mut m, "in", vec![1.0, 2.0]);
    let x = m.var("x");
    let read = m.read_buffer("in", vec![x]);
    let erf = m.call_extern("erf", vec![read], ScalarType::F32);
    m.define("out", &["x"], vec![erf]);
    ones_seed(&mut m, "seed");

    let err = propagate_adjoints(&m, "out", "seed", &[(0, 1)]).unwrap_err();
    assert!(matches!(err, DerivativeError::UnsupportedDerivative(name) if name == "erf"));
}

#[test]
fn test_dimension_mismatch_is_checked_up_front() {
    let mut m = Module::new();
    buffer_1d(&mut m, "in", vec![1.0, 2.0]);
    let x = m.var("x");
    let read = m.read_buffer("in", vec![x]);
    m.define("out", &["x"], vec![read]);
    let one = m.lit(1.0f32);
    m.define("seed2", &["x", "y"], vec![one]);

    let err = propagate_adjoints(&m, "out", "seed2", &[(0, 1)]).unwrap_err();
    assert!(matches!(err, DerivativeError::DimensionMismatch { .. }));

    ones_seed(&mut m, "seed");
    let err = propagate_adjoints(&m, "out", "seed", &[(0, 1), (0, 1)]).unwrap_err();
    assert!(matches!(err, DerivativeError::DimensionMismatch { .. }));
}

#[test]
fn test_buffer_function_name_collision_is_rejected() {
    let mut m = Module::new();
    buffer_1d(&mut m, "f", vec![1.0, 2.0]);
    // A function also named `f`, plus a consumer that reads both.
    let half = m.lit(0.5f32);
    m.define("f", &["x"], vec![half]);
    let x = m.var("x");
    let from_buffer = m.read_buffer("f", vec![x]);
    let x2 = m.var("x");
    let from_func = m.read("f", vec![x2]);
    let sum = m.add(from_buffer, from_func);
    m.define("out", &["x"], vec![sum]);
    ones_seed(&mut m, "seed");

    let err = propagate_adjoints(&m, "out", "seed", &[(0, 1)]).unwrap_err();
    assert!(matches!(err, DerivativeError::NamingConflict(name) if name == "f"));
}

#[test]
fn test_shared_subexpression_contributions_sum() {
    // out(x) = t * t with t = in(x) shared by identity: d in = 2 in.
    let data = vec![1.5, -2.0, 3.0];
    let mut m = Module::new();
    buffer_1d(&mut m, "in", data.clone());
    let x = m.var("x");
    let t = m.read_buffer("in", vec![x]);
    let square = m.mul(t, t);
    m.define("out", &["x"], vec![square]);
    ones_seed(&mut m, "seed");

    let d = propagate_adjoints(&m, "out", "seed", &[(0, 2)]).unwrap();
    let d_in = d.adjoint_name("in", -1).unwrap().to_string();
    let r = Realizer::new(&d.module, BTreeMap::new());
    for (i, v) in data.iter().enumerate() {
        assert_relative_eq!(r.value(&d_in, &[i as i64])[0], 2.0 * v, max_relative = 1e-5);
    }
}
