//! Lowering from shape descriptions to the loop-nest IR
//!
//! Every lowered contraction has the canonical form
//!
//! ```text
//! for m in 0..M { for n in 0..N { for k in 0..K {
//!     C[m, n] += A[m, k] * B[k, n]
//! } } }
//! ```
//!
//! which the schedule transformations and the code generator rely on.

use tracing::debug;

use crate::error::{CompileError, CompileResult};
use crate::expr::IndexExpr;
use crate::ir::{Loop, Reduction, TensorAccess};
use crate::parser::{self, ShapeDescription};

/// Name given to every lowered contraction
pub const MATMUL_OP_NAME: &str = "mm";

/// Lower `[m, k1] @ [k2, n]` into the canonical matmul loop nest
pub fn lower_matmul(m: usize, k1: usize, k2: usize, n: usize) -> CompileResult<Reduction> {
    if k1 != k2 {
        return Err(CompileError::ShapeMismatch { lhs: k1, rhs: k2 });
    }
    let (m, k, n) = (extent(m)?, extent(k1)?, extent(n)?);

    let loops = vec![
        Loop::new("m", IndexExpr::lit(0), m.clone()),
        Loop::new("n", IndexExpr::lit(0), n.clone()),
        Loop::new("k", IndexExpr::lit(0), k.clone()),
    ];
    let a = TensorAccess::new("A", vec!["m".into(), "k".into()], vec![m.clone(), k.clone()]);
    let b = TensorAccess::new("B", vec!["k".into(), "n".into()], vec![k, n.clone()]);
    let c = TensorAccess::new("C", vec!["m".into(), "n".into()], vec![m, n]);

    let op = Reduction::new(MATMUL_OP_NAME, loops, [a, b], c, Some("k".to_string()))?;
    debug!(loops = ?op.loop_vars(), "lowered matmul");
    Ok(op)
}

/// Lower an already parsed description
pub fn lower(desc: &ShapeDescription) -> CompileResult<Reduction> {
    let (m, k1) = desc.lhs;
    let (k2, n) = desc.rhs;
    lower_matmul(m, k1, k2, n)
}

/// Parse and lower a description string such as `[4, 3] @ [3, 5]`
pub fn lower_str(source: &str) -> CompileResult<Reduction> {
    lower(&parser::parse(source)?)
}

fn extent(value: usize) -> CompileResult<IndexExpr> {
    match i64::try_from(value) {
        Ok(v) if v > 0 => Ok(IndexExpr::lit(v)),
        _ => Err(CompileError::parse_error(format!(
            "extent {} must be a positive 64-bit integer",
            value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(access: &TensorAccess) -> Vec<String> {
        access.at.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn test_lower_canonical_nest() {
        let op = lower_matmul(4, 3, 3, 5).unwrap();

        assert_eq!(op.name, "mm");
        assert_eq!(op.loop_vars(), vec!["m", "n", "k"]);
        let ends: Vec<_> = op.loops.iter().map(|l| l.end.as_constant()).collect();
        assert_eq!(ends, vec![Some(4), Some(5), Some(3)]);
        assert!(op.loops.iter().all(|l| l.start == IndexExpr::lit(0)));
        assert_eq!(op.reduction.as_deref(), Some("k"));

        assert_eq!(op.reads[0].var, "A");
        assert_eq!(rendered(&op.reads[0]), vec!["m", "k"]);
        assert_eq!(op.reads[1].var, "B");
        assert_eq!(rendered(&op.reads[1]), vec!["k", "n"]);
        assert_eq!(op.write.var, "C");
        assert_eq!(rendered(&op.write), vec!["m", "n"]);
        assert_eq!(op.write.shape, vec![IndexExpr::lit(4), IndexExpr::lit(5)]);
        assert!(op.promotions.is_empty());
        assert!(op.index_hoists.is_empty());
    }

    #[test]
    fn test_lower_shape_mismatch() {
        for (m, n) in [(1, 1), (4, 5), (7, 2)] {
            let err = lower_matmul(m, 3, 4, n).unwrap_err();
            assert!(matches!(err, CompileError::ShapeMismatch { lhs: 3, rhs: 4 }));
        }
    }

    #[test]
    fn test_lower_from_string() {
        let op = lower_str("  [2, 8] @ [8, 6]  ").unwrap();
        assert_eq!(op.reads[0].shape, vec![IndexExpr::lit(2), IndexExpr::lit(8)]);
        assert_eq!(op.reads[1].shape, vec![IndexExpr::lit(8), IndexExpr::lit(6)]);
        assert!(matches!(
            lower_str("[2, 8] @ [7, 6]"),
            Err(CompileError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_lower_rejects_zero_extent() {
        assert!(lower_matmul(0, 2, 2, 2).is_err());
    }
}
