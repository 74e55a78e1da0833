//! Reference interpreter for reductions
//!
//! Executes a [`Reduction`] on concrete row-major matrices by walking its
//! loop nest and evaluating every bound and subscript. A scheduled op must
//! compute the same product as the op it was derived from.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::error::{CompileError, CompileResult};
use crate::expr::IndexExpr;
use crate::ir::{Reduction, TensorAccess};

/// Dense row-major matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> CompileResult<Self> {
        if data.len() != rows * cols {
            return Err(CompileError::execution(format!(
                "{}x{} matrix needs {} elements, got {}",
                rows,
                cols,
                rows * cols,
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Build from nested rows; every row must have the same length
    pub fn from_rows(rows: &[Vec<f64>]) -> CompileResult<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(CompileError::execution("ragged matrix rows"));
        }
        Self::new(rows.len(), cols, rows.concat())
    }

    /// Deterministic test data: element `i` is `(i % modulus) + 1`
    pub fn sequential(rows: usize, cols: usize, modulus: usize) -> Self {
        let modulus = modulus.max(1);
        let data = (0..rows * cols).map(|i| ((i % modulus) + 1) as f64).collect();
        Self { rows, cols, data }
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.rows && col < self.cols {
            self.data.get(row * self.cols + col).copied()
        } else {
            None
        }
    }

    /// Plain triple-loop product, independent of any IR
    pub fn matmul(&self, other: &Matrix) -> CompileResult<Matrix> {
        if self.cols != other.rows {
            return Err(CompileError::ShapeMismatch {
                lhs: self.cols,
                rhs: other.rows,
            });
        }
        let mut out = Matrix::zeros(self.rows, other.cols);
        for i in 0..self.rows {
            for j in 0..other.cols {
                let mut acc = 0.0;
                for k in 0..self.cols {
                    acc += self.data[i * self.cols + k] * other.data[k * other.cols + j];
                }
                out.data[i * other.cols + j] = acc;
            }
        }
        Ok(out)
    }

    /// Element-wise comparison within `tolerance`
    pub fn approx_eq(&self, other: &Matrix, tolerance: f64) -> bool {
        self.rows == other.rows
            && self.cols == other.cols
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.data.chunks(self.cols.max(1)) {
            let cells: Vec<String> = row.iter().map(|v| format!("{:8.2}", v)).collect();
            writeln!(f, "[{}]", cells.join(", "))?;
        }
        Ok(())
    }
}

/// Counters and result of one interpreted run
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub output: Matrix,
    /// Innermost body executions
    pub iterations: u64,
    /// Element reads from input tensors, promoted loads included
    pub loads: u64,
}

/// Run `op` with `lhs` bound to the first read and `rhs` to the second.
///
/// The destination starts zeroed and has the extents declared by the write
/// access. When both reads name the same tensor, `lhs` is used for both.
pub fn execute(op: &Reduction, lhs: &Matrix, rhs: &Matrix) -> CompileResult<Matrix> {
    trace(op, lhs, rhs).map(|t| t.output)
}

/// Like [`execute`], also reporting how often the body ran and loaded.
///
/// Promoted reads are loaded once before their loop opens and reused by
/// the body, so their subscripts must only use loops and index hoists in
/// scope at that point.
pub fn trace(op: &Reduction, lhs: &Matrix, rhs: &Matrix) -> CompileResult<Trace> {
    op.validate()?;
    let mut tensors: HashMap<&str, &Matrix> = HashMap::new();
    for (access, matrix) in op.reads.iter().zip([lhs, rhs]) {
        let bound = *tensors.entry(access.var.as_str()).or_insert(matrix);
        check_extents(access, bound)?;
    }

    let [rows, cols] = declared_extents(&op.write)?;
    let mut out = Matrix::zeros(rows, cols);
    let mut run = Run {
        op,
        tensors,
        env: Vec::with_capacity(op.loops.len()),
        promoted: vec![None; op.reads.len()],
        out: &mut out,
        iterations: 0,
        loads: 0,
    };
    run.nest(0)?;
    let (iterations, loads) = (run.iterations, run.loads);
    debug!(op = %op.name, iterations, loads, "executed");
    Ok(Trace {
        output: out,
        iterations,
        loads,
    })
}

fn declared_extents(access: &TensorAccess) -> CompileResult<[usize; 2]> {
    let mut dims = [0; 2];
    for (slot, extent) in dims.iter_mut().zip(&access.shape) {
        *slot = extent
            .as_constant()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| {
                CompileError::execution(format!(
                    "extent `{}` of `{}` is not a non-negative constant",
                    extent, access.var
                ))
            })?;
    }
    Ok(dims)
}

fn check_extents(access: &TensorAccess, matrix: &Matrix) -> CompileResult<()> {
    let [rows, cols] = declared_extents(access)?;
    if (rows, cols) != (matrix.rows, matrix.cols) {
        return Err(CompileError::execution(format!(
            "`{}` is declared {}x{} but the input is {}x{}",
            access.var, rows, cols, matrix.rows, matrix.cols
        )));
    }
    Ok(())
}

struct Run<'a> {
    op: &'a Reduction,
    tensors: HashMap<&'a str, &'a Matrix>,
    /// Loop variables currently open, outermost first
    env: Vec<(&'a str, i64)>,
    /// Values of promoted reads, indexed like `Reduction::reads`
    promoted: Vec<Option<f64>>,
    out: &'a mut Matrix,
    iterations: u64,
    loads: u64,
}

impl<'a> Run<'a> {
    fn nest(&mut self, depth: usize) -> CompileResult<()> {
        let op = self.op;
        let Some(lp) = op.loops.get(depth) else {
            return self.body();
        };

        let mut filled = Vec::new();
        for promotion in op.promotions.iter().filter(|p| p.loop_var == lp.var) {
            // An outer promotion of the same read already holds the value.
            if self.promoted.get(promotion.read).copied().flatten().is_some() {
                continue;
            }
            let access = op.promoted_access(promotion).ok_or_else(|| {
                CompileError::schedule(format!("promotion refers to read #{}", promotion.read))
            })?;
            self.check_scope(depth, access)?;
            let value = self.load(access)?;
            self.promoted[promotion.read] = Some(value);
            filled.push(promotion.read);
        }

        let result = self.iterate(depth);
        for slot in filled {
            self.promoted[slot] = None;
        }
        result
    }

    fn iterate(&mut self, depth: usize) -> CompileResult<()> {
        let op = self.op;
        let lp = &op.loops[depth];
        let start = self.eval(&lp.start)?;
        let end = self.eval(&lp.end)?;
        for value in start..end {
            self.env.push((lp.var.as_str(), value));
            let result = self.nest(depth + 1);
            self.env.pop();
            result?;
        }
        Ok(())
    }

    /// Subscripts of a load placed before the loop at `depth` may only use
    /// loops already open and index hoists bound at or above `depth`
    fn check_scope(&self, depth: usize, access: &TensorAccess) -> CompileResult<()> {
        for var in access.at.iter().flat_map(|idx| idx.variables()) {
            let open = self.env.iter().any(|(name, _)| *name == var);
            let bound = self
                .op
                .index_hoists
                .get(&var)
                .is_some_and(|hoist| hoist.depth <= depth);
            if !open && !bound {
                return Err(CompileError::HoistOutOfScope {
                    what: access.var.clone(),
                    var,
                });
            }
        }
        Ok(())
    }

    fn load(&mut self, access: &TensorAccess) -> CompileResult<f64> {
        let [row, col] = self.position(access)?;
        let matrix = self.tensors.get(access.var.as_str()).ok_or_else(|| {
            CompileError::execution(format!("no input bound to `{}`", access.var))
        })?;
        let value = matrix
            .get(row, col)
            .ok_or_else(|| out_of_bounds(access, row, col))?;
        self.loads += 1;
        Ok(value)
    }

    fn body(&mut self) -> CompileResult<()> {
        self.iterations += 1;
        let op = self.op;
        let mut product = 1.0;
        for (slot, access) in op.reads.iter().enumerate() {
            let cached = self.promoted[slot];
            product *= match cached {
                Some(value) => value,
                None => self.load(access)?,
            };
        }

        let [row, col] = self.position(&op.write)?;
        if row >= self.out.rows || col >= self.out.cols {
            return Err(out_of_bounds(&op.write, row, col));
        }
        let cols = self.out.cols;
        self.out.data[row * cols + col] += product;
        Ok(())
    }

    fn position(&self, access: &TensorAccess) -> CompileResult<[usize; 2]> {
        let mut pos = [0; 2];
        for (slot, idx) in pos.iter_mut().zip(&access.at) {
            let value = self.eval(idx)?;
            *slot = usize::try_from(value).map_err(|_| {
                CompileError::execution(format!(
                    "negative subscript {} into `{}`",
                    value, access.var
                ))
            })?;
        }
        Ok(pos)
    }

    fn eval(&self, expr: &IndexExpr) -> CompileResult<i64> {
        expr.eval(&|name| self.lookup(name))
            .ok_or_else(|| CompileError::execution(format!("cannot evaluate `{}`", expr)))
    }

    fn lookup(&self, name: &str) -> Option<i64> {
        let open = |name: &str| {
            self.env
                .iter()
                .rev()
                .find(|(var, _)| *var == name)
                .map(|(_, value)| *value)
        };
        open(name).or_else(|| {
            self.op
                .index_hoists
                .get(name)
                .and_then(|hoist| hoist.expr.eval(&open))
        })
    }
}

fn out_of_bounds(access: &TensorAccess, row: usize, col: usize) -> CompileError {
    CompileError::execution(format!(
        "access {}[{}, {}] is out of bounds",
        access.var, row, col
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::{lower_matmul, lower_str};
    use crate::schedule::Schedule;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_two_by_two() {
        let op = lower_str("[2, 2] @ [2, 2]").unwrap();
        let a = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let b = Matrix::from_rows(&[vec![5.0, 6.0], vec![7.0, 8.0]]).unwrap();
        let c = execute(&op, &a, &b).unwrap();
        assert_eq!(c.data, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_scheduled_matches_reference() {
        let a = Matrix::sequential(8, 4, 7);
        let b = Matrix::sequential(4, 6, 5);
        let expected = a.matmul(&b).unwrap();

        let op = Schedule::new(lower_matmul(8, 4, 4, 6).unwrap())
            .tile(&[("m", 4), ("k", 2)])
            .unwrap()
            .reorder(&["m_blk", "k_blk", "m_inner", "k_inner", "n"])
            .unwrap()
            .promote_invariants("n")
            .unwrap()
            .finish();
        assert_eq!(op.promotions.len(), 1);
        let got = execute(&op, &a, &b).unwrap();
        assert!(got.approx_eq(&expected, 1e-9));
        // The generator accepts the same schedule.
        assert!(crate::codegen::generate(&op, crate::codegen::Dialect::Native).is_ok());
    }

    #[test]
    fn test_promoted_load_needs_open_loops() {
        let a = Matrix::sequential(8, 4, 7);
        let b = Matrix::sequential(4, 6, 5);
        let op = Schedule::new(lower_matmul(8, 4, 4, 6).unwrap())
            .tile(&[("m", 4), ("k", 2)])
            .unwrap()
            .reorder(&["m_blk", "k_blk", "n", "m_inner", "k_inner"])
            .unwrap()
            .promote_invariants("m_inner")
            .unwrap()
            .finish();

        let err = execute(&op, &a, &b).unwrap_err();
        assert!(
            matches!(&err, CompileError::HoistOutOfScope { what, var } if what == "B" && var == "k_inner"),
            "{:?}",
            err
        );
        assert!(matches!(
            crate::codegen::generate(&op, crate::codegen::Dialect::Debug),
            Err(CompileError::HoistOutOfScope { .. })
        ));
    }

    #[test]
    fn test_promoted_value_is_reused() {
        let a = Matrix::sequential(2, 3, 5);
        let b = Matrix::sequential(3, 4, 5);
        let expected = a.matmul(&b).unwrap();

        let mut op = lower_matmul(2, 3, 3, 4).unwrap();
        op.reorder(&["m", "k", "n"]).unwrap();
        let naive = trace(&op, &a, &b).unwrap();
        assert_eq!(naive.iterations, 24);
        assert_eq!(naive.loads, 48);

        op.promote_invariants("n").unwrap();
        let promoted = trace(&op, &a, &b).unwrap();
        // A[m, k] is read once per (m, k) instead of once per (m, k, n).
        assert_eq!(promoted.iterations, 24);
        assert_eq!(promoted.loads, 6 + 24);
        assert!(promoted.output.approx_eq(&expected, 1e-9));
    }

    #[test]
    fn test_hoisted_index_matches_reference() {
        let a = Matrix::sequential(4, 4, 3);
        let b = Matrix::sequential(4, 4, 4);
        let expected = a.matmul(&b).unwrap();

        let op = Schedule::new(lower_matmul(4, 4, 4, 4).unwrap())
            .tile(&[("m", 2)])
            .unwrap()
            .hoist_index(
                "m_base",
                IndexExpr::mul(IndexExpr::var("m_blk"), IndexExpr::lit(2)),
                1,
            )
            .unwrap()
            .finish();
        assert!(op.index_hoists.contains_key("m_base"));
        let got = execute(&op, &a, &b).unwrap();
        assert!(got.approx_eq(&expected, 1e-9));
    }

    #[test]
    fn test_partial_tile_drops_iterations() {
        let a = Matrix::sequential(5, 2, 9);
        let b = Matrix::sequential(2, 2, 9);
        let mut op = lower_matmul(5, 2, 2, 2).unwrap();
        op.tile(&[("m", 2)]).unwrap();

        let got = execute(&op, &a, &b).unwrap();
        let expected = a.matmul(&b).unwrap();
        // Rows 0..4 are covered by two full tiles; row 4 is never visited.
        assert_eq!(got.data[..8], expected.data[..8]);
        assert_eq!(got.data[8..], [0.0, 0.0]);
    }

    #[test]
    fn test_rejects_wrong_input_shape() {
        let op = lower_matmul(2, 3, 3, 2).unwrap();
        let a = Matrix::zeros(3, 2);
        let b = Matrix::zeros(3, 2);
        assert!(matches!(
            execute(&op, &a, &b),
            Err(CompileError::Execution { .. })
        ));
    }

    #[test]
    fn test_matrix_construction() {
        assert!(Matrix::new(2, 2, vec![1.0; 3]).is_err());
        assert!(Matrix::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
        let m = Matrix::sequential(2, 3, 4);
        assert_eq!(m.data, vec![1.0, 2.0, 3.0, 4.0, 1.0, 2.0]);
        assert_eq!(m.get(1, 2), Some(2.0));
        assert_eq!(m.get(2, 0), None);
    }
}
