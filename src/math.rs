use itertools::izip;
use multiversion::multiversion;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `out = a * x + y`
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn axpy_out(x: &[f64], y: &[f64], a: f64, out: &mut [f64]) {
    assert!(x.len() == y.len());
    assert!(x.len() == out.len());
    izip!(x, y, out).for_each(|(&x, &y, out)| {
        *out = a.mul_add(x, y);
    });
}

/// `y += a * x`
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(x.len() == y.len());
    x.iter().zip(y.iter_mut()).for_each(|(&x, y)| {
        *y = a.mul_add(x, *y);
    });
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn multiply(x: &[f64], y: &[f64], out: &mut [f64]) {
    assert!(x.len() == y.len());
    assert!(x.len() == out.len());
    izip!(x, y, out).for_each(|(&x, &y, out)| {
        *out = x * y;
    });
}

/// `(a + b) . x` and `(a + b) . y`
pub(crate) fn scalar_prods2(a: &[f64], b: &[f64], x: &[f64], y: &[f64]) -> (f64, f64) {
    assert!(a.len() == b.len());
    assert!(a.len() == x.len());
    assert!(a.len() == y.len());
    izip!(a, b, x, y).fold((0f64, 0f64), |(s1, s2), (a, b, x, y)| {
        (s1 + x * (a + b), s2 + y * (a + b))
    })
}

/// `(p1 - n1 + p2) . x` and `(p1 - n1 + p2) . y`
pub(crate) fn scalar_prods3(
    p1: &[f64],
    n1: &[f64],
    p2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    assert!(p1.len() == n1.len());
    assert!(p1.len() == p2.len());
    assert!(p1.len() == x.len());
    assert!(p1.len() == y.len());
    izip!(p1, n1, p2, x, y).fold((0f64, 0f64), |(s1, s2), (p1, n1, p2, x, y)| {
        let rho = p1 - n1 + p2;
        (s1 + x * rho, s2 + y * rho)
    })
}
