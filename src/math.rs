use itertools::izip;
use multiversion::multiversion;
use ndarray::Zip;

use crate::model::{Tensor, VarMap};

/// Compute `((a - b) · x, (a - b) · y)` in one pass.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn scalar_prods_of_diff(a: &[f64], b: &[f64], x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = a.len();
    assert!(b.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(a, b, x, y).fold((0f64, 0f64), |(s1, s2), (a, b, x, y)| {
        let diff = a - b;
        (diff.mul_add(*x, s1), diff.mul_add(*y, s2))
    })
}

/// Compute `sum(x * x * scale)`.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn sum_sq_scaled(x: &[f64], scale: &[f64]) -> f64 {
    assert!(x.len() == scale.len());

    x.iter()
        .zip(scale)
        .fold(0f64, |acc, (&x, &s)| (x * x).mul_add(s, acc))
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn axpy_out(x: &[f64], y: &[f64], a: f64, out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = a.mul_add(*x, *y);
    });
}

pub(crate) fn tensor_prods_of_diff(a: &Tensor, b: &Tensor, x: &Tensor, y: &Tensor) -> (f64, f64) {
    match (a.as_slice(), b.as_slice(), x.as_slice(), y.as_slice()) {
        (Some(a), Some(b), Some(x), Some(y)) => scalar_prods_of_diff(a, b, x, y),
        _ => Zip::from(a)
            .and(b)
            .and(x)
            .and(y)
            .fold((0f64, 0f64), |(s1, s2), &a, &b, &x, &y| {
                ((a - b) * x + s1, (a - b) * y + s2)
            }),
    }
}

pub(crate) fn tensor_sum_sq_scaled(x: &Tensor, scale: &Tensor) -> f64 {
    match (x.as_slice(), scale.as_slice()) {
        (Some(x), Some(scale)) => sum_sq_scaled(x, scale),
        _ => Zip::from(x)
            .and(scale)
            .fold(0f64, |acc, &x, &s| (x * x).mul_add(s, acc)),
    }
}

/// Return `y + a * x` as a new tensor in standard layout.
pub(crate) fn tensor_axpy(x: &Tensor, y: &Tensor, a: f64) -> Tensor {
    let mut out = Tensor::zeros(y.raw_dim());
    match (x.as_slice(), y.as_slice(), out.as_slice_mut()) {
        (Some(x), Some(y), Some(out)) => axpy_out(x, y, a, out),
        _ => Zip::from(&mut out)
            .and(x)
            .and(y)
            .for_each(|out, &x, &y| *out = a.mul_add(x, y)),
    }
    out
}

/// Elementwise product of two tensors.
pub(crate) fn tensor_mul(x: &Tensor, y: &Tensor) -> Tensor {
    Zip::from(x).and(y).map_collect(|&x, &y| x * y)
}

/// Return `y + a * x` for every variable.
///
/// Both maps must have the same keys.
pub(crate) fn axpy_map(x: &VarMap<Tensor>, y: &VarMap<Tensor>, a: f64) -> VarMap<Tensor> {
    debug_assert!(x.keys().eq(y.keys()));
    x.values()
        .zip(y.iter())
        .map(|(x, (var, y))| (*var, tensor_axpy(x, y, a)))
        .collect()
}

pub(crate) fn all_finite(values: &VarMap<Tensor>) -> bool {
    values.values().all(|t| t.iter().all(|v| v.is_finite()))
}

pub(crate) fn same_keys<A, B>(a: &VarMap<A>, b: &VarMap<B>) -> bool {
    a.len() == b.len() && a.keys().eq(b.keys())
}
