use ndarray::{Array1, ArrayView1, ArrayView2};

#[derive(Default, Clone, Copy)]
pub(crate) struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    pub(crate) fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    pub(crate) fn sum(self) -> f64 {
        self.sum
    }
}

/// Back-substitution for `R x = b` with `R` upper triangular and a nonzero
/// diagonal.
pub(crate) fn solve_upper_triangular(r: ArrayView2<'_, f64>, rhs: ArrayView1<'_, f64>) -> Array1<f64> {
    let k = rhs.len();
    debug_assert_eq!(r.nrows(), k);
    debug_assert_eq!(r.ncols(), k);
    let mut out = Array1::<f64>::zeros(k);
    for i in (0..k).rev() {
        let mut v = rhs[i];
        for j in (i + 1)..k {
            v -= r[[i, j]] * out[j];
        }
        out[i] = v / r[[i, i]];
    }
    out
}
