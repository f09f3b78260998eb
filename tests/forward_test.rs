//! Forward-mode properties, including forward/reverse consistency on
//! composed pipelines.

use std::collections::BTreeMap;

use approx::assert_relative_eq;
use ndarray::{ArrayD, IxDyn};

use lyre::{propagate_adjoints, propagate_tangents, Module, Realizer, ScalarType};

fn buffer_1d(m: &mut Module, name: &str, data: Vec<f64>) {
    let len = data.len();
    let array = ArrayD::from_shape_vec(IxDyn(&[len]), data).unwrap();
    m.add_buffer(name, ScalarType::F32, vec![0], array);
}

fn ones(m: &mut Module, name: &str) {
    let one = m.lit(1.0f32);
    m.define(name, &["x"], vec![one]);
}

/// Forward tangent of `h(x) = f(g(x))` must equal the reverse adjoint of
/// the input under an all-ones seed, since each output point depends on
/// exactly one input point.
fn check_forward_reverse_consistency(m: &Module, output: &str, n: i64) {
    let mut tangents = BTreeMap::new();
    tangents.insert("in".to_string(), "din".to_string());
    let fwd = propagate_tangents(m, output, &tangents).unwrap();
    let rev = propagate_adjoints(m, output, "seed", &[(0, n - 1)]).unwrap();
    let d_in = rev.adjoint_name("in", -1).unwrap().to_string();

    let fwd_r = Realizer::new(&fwd.module, BTreeMap::new());
    let rev_r = Realizer::new(&rev.module, BTreeMap::new());
    for i in 0..n {
        let tangent = fwd_r.value(&fwd.output, &[i])[0];
        let adjoint = rev_r.value(&d_in, &[i])[0];
        assert_relative_eq!(tangent, adjoint, max_relative = 1e-4, epsilon = 1e-9);
    }
}

#[test]
fn test_chain_rule_consistency_sin_exp() {
    let n = 4i64;
    let mut m = Module::new();
    buffer_1d(&mut m, "in", vec![0.3, -0.8, 1.2, 2.5]);
    ones(&mut m, "seed");
    ones(&mut m, "din");
    // g(x) = sin(in(x)); h(x) = exp(g(x))
    let x = m.var("x");
    let b = m.read_buffer("in", vec![x]);
    let s = m.call_extern("sin", vec![b], ScalarType::F32);
    m.define("g", &["x"], vec![s]);
    let x2 = m.var("x");
    let g = m.read("g", vec![x2]);
    let e = m.call_extern("exp", vec![g], ScalarType::F32);
    m.define("h", &["x"], vec![e]);

    check_forward_reverse_consistency(&m, "h", n);
}

#[test]
fn test_chain_rule_consistency_pow() {
    let n = 4i64;
    let mut m = Module::new();
    buffer_1d(&mut m, "in", vec![0.5, 1.5, 2.0, 3.0]);
    ones(&mut m, "seed");
    ones(&mut m, "din");
    // p(x) = pow(in(x), 3)
    let x = m.var("x");
    let b = m.read_buffer("in", vec![x]);
    let three = m.lit(3.0f32);
    let p = m.call_extern("pow", vec![b, three], ScalarType::F32);
    m.define("p", &["x"], vec![p]);

    check_forward_reverse_consistency(&m, "p", n);
}

#[test]
fn test_forward_tangent_matches_finite_differences() {
    let n = 4i64;
    let data = vec![0.4, -1.1, 0.9, 2.2];
    let mut m = Module::new();
    buffer_1d(&mut m, "in", data);
    ones(&mut m, "din");
    // f(x) = in(x) * in(x) + sin(in(x))
    let x = m.var("x");
    let b = m.read_buffer("in", vec![x]);
    let sq = m.mul(b, b);
    let s = m.call_extern("sin", vec![b], ScalarType::F32);
    let f = m.add(sq, s);
    m.define("f", &["x"], vec![f]);

    let mut tangents = BTreeMap::new();
    tangents.insert("in".to_string(), "din".to_string());
    let fwd = propagate_tangents(&m, "f", &tangents).unwrap();
    let fwd_r = Realizer::new(&fwd.module, BTreeMap::new());

    let h = 1e-4;
    for i in 0..n {
        let tangent = fwd_r.value(&fwd.output, &[i])[0];
        let mut plus = m.clone();
        plus.buffers.get_mut("in").unwrap().data[IxDyn(&[i as usize])] += h;
        let mut minus = m.clone();
        minus.buffers.get_mut("in").unwrap().data[IxDyn(&[i as usize])] -= h;
        let rp = Realizer::new(&plus, BTreeMap::new());
        let rm = Realizer::new(&minus, BTreeMap::new());
        let numeric = (rp.value("f", &[i])[0] - rm.value("f", &[i])[0]) / (2.0 * h);
        assert_relative_eq!(tangent, numeric, max_relative = 1e-4, epsilon = 1e-6);
    }
}

#[test]
fn test_forward_transforms_update_stages_in_order() {
    use lyre::Interval;

    let mut m = Module::new();
    buffer_1d(&mut m, "in", vec![2.0, 4.0]);
    ones(&mut m, "din");
    // f(x) = in(x); f(x) = in(x) * in(x)  (the overwrite wins)
    let x = m.var("x");
    let b = m.read_buffer("in", vec![x]);
    m.define("f", &["x"], vec![b]);
    let x2 = m.var("x");
    let b2 = m.read_buffer("in", vec![x2]);
    let sq = m.mul(b2, b2);
    let x3 = m.var("x");
    m.define_update("f", vec![x3], vec![sq], None);

    let mut tangents = BTreeMap::new();
    tangents.insert("in".to_string(), "din".to_string());
    let fwd = propagate_tangents(&m, "f", &tangents).unwrap();
    let mut bounds = BTreeMap::new();
    bounds.insert(fwd.output.clone(), vec![Interval::new(0, 1)]);
    let r = Realizer::new(&fwd.module, bounds);
    // The transformed update overwrites the transformed pure stage, so
    // the tangent is d(in^2) = 2 in, not 1.
    assert_relative_eq!(r.value(&fwd.output, &[0])[0], 4.0, max_relative = 1e-6);
    assert_relative_eq!(r.value(&fwd.output, &[1])[0], 8.0, max_relative = 1e-6);
}
