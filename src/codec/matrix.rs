use crate::{
    errors::{EngineError, Result},
    gf256,
};

/// Dense row-major matrix over GF(256).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl Matrix {
    pub fn zero(rows: usize, cols: usize) -> Self {
        Matrix {
            rows,
            cols,
            data: vec![0u8; rows * cols],
        }
    }

    pub fn identity(size: usize) -> Self {
        let mut m = Matrix::zero(size, size);
        for i in 0..size {
            m.set(i, i, 1);
        }
        m
    }

    /// Generator matrix whose row `i` is `(i+1)^0, (i+1)^1, ..., (i+1)^(cols-1)`.
    pub fn vandermonde(rows: usize, cols: usize) -> Self {
        let indices: Vec<u8> = (0..rows).map(|i| i as u8).collect();
        Matrix::vandermonde_rows(&indices, cols)
    }

    /// The rows of the generator matrix for the given fragment indices only.
    pub fn vandermonde_rows(indices: &[u8], cols: usize) -> Self {
        let mut m = Matrix::zero(indices.len(), cols);
        for (r, &idx) in indices.iter().enumerate() {
            let x = idx.wrapping_add(1);
            for c in 0..cols {
                m.set(r, c, gf256::power(x, c as u32));
            }
        }
        m
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, r: usize, c: usize) -> u8 {
        self.data[r * self.cols + c]
    }

    pub fn set(&mut self, r: usize, c: usize, v: u8) {
        self.data[r * self.cols + c] = v;
    }

    pub fn row(&self, r: usize) -> &[u8] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for c in 0..self.cols {
            self.data.swap(a * self.cols + c, b * self.cols + c);
        }
    }

    pub fn multiply(&self, other: &Matrix) -> Result<Matrix> {
        if self.cols != other.rows {
            return Err(EngineError::invalid_parameters(
                "matrix dimensions do not agree",
            ));
        }
        let mut out = Matrix::zero(self.rows, other.cols);
        for r in 0..self.rows {
            for c in 0..other.cols {
                let mut acc = 0u8;
                for i in 0..self.cols {
                    acc = gf256::add(acc, gf256::multiply(self.get(r, i), other.get(i, c)));
                }
                out.set(r, c, acc);
            }
        }
        Ok(out)
    }

    /// Writes `self * input` into `out`. `input` must have `cols` entries and
    /// `out` must have `rows` entries.
    pub fn mul_vec(&self, input: &[u8], out: &mut [u8]) {
        for (r, slot) in out.iter_mut().enumerate().take(self.rows) {
            let mut acc = 0u8;
            for (c, &v) in self.row(r).iter().zip(input) {
                acc ^= gf256::multiply(*c, v);
            }
            *slot = acc;
        }
    }

    /// Gauss-Jordan inversion. Fails with `SingularMatrix` when no pivot can
    /// be found for some column.
    pub fn invert(&self) -> Result<Matrix> {
        if self.rows != self.cols {
            return Err(EngineError::invalid_parameters(
                "only square matrices can be inverted",
            ));
        }
        let n = self.rows;
        let mut work = self.clone();
        let mut inv = Matrix::identity(n);

        for col in 0..n {
            let pivot = (col..n)
                .find(|&r| work.get(r, col) != 0)
                .ok_or(EngineError::SingularMatrix)?;
            work.swap_rows(col, pivot);
            inv.swap_rows(col, pivot);

            let scale = gf256::inverse(work.get(col, col))?;
            for c in 0..n {
                work.set(col, c, gf256::multiply(work.get(col, c), scale));
                inv.set(col, c, gf256::multiply(inv.get(col, c), scale));
            }

            for r in 0..n {
                if r == col {
                    continue;
                }
                let factor = work.get(r, col);
                if factor == 0 {
                    continue;
                }
                for c in 0..n {
                    let w = gf256::sub(work.get(r, c), gf256::multiply(factor, work.get(col, c)));
                    work.set(r, c, w);
                    let v = gf256::sub(inv.get(r, c), gf256::multiply(factor, inv.get(col, c)));
                    inv.set(r, c, v);
                }
            }
        }

        Ok(inv)
    }
}
