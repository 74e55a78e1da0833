//! Loop-nest intermediate representation
//!
//! A [`Reduction`] is an explicit loop nest around a fused
//! multiply-accumulate `write[..] += reads[0][..] * reads[1][..]`. Loops are
//! stored outermost first; their order is the nesting order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{CompileError, CompileResult};
use crate::expr::IndexExpr;

/// Rank of every tensor this IR addresses
pub const TENSOR_RANK: usize = 2;

/// A counted loop `for var in start..end`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loop {
    pub var: String,
    pub start: IndexExpr,
    pub end: IndexExpr,
}

impl Loop {
    pub fn new(var: impl Into<String>, start: IndexExpr, end: IndexExpr) -> Self {
        Self {
            var: var.into(),
            start,
            end,
        }
    }
}

/// An element access `var[at0, at1]` into a tensor of extents `shape`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorAccess {
    pub var: String,
    pub at: Vec<IndexExpr>,
    pub shape: Vec<IndexExpr>,
}

impl TensorAccess {
    pub fn new(var: impl Into<String>, at: Vec<IndexExpr>, shape: Vec<IndexExpr>) -> Self {
        Self {
            var: var.into(),
            at,
            shape,
        }
    }

    /// Whether any subscript mentions `loop_var`
    pub fn references(&self, loop_var: &str) -> bool {
        self.at.iter().any(|idx| idx.contains_var(loop_var))
    }
}

/// A read registered to be loaded once, just before the loop `loop_var`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    pub loop_var: String,
    /// Position of the access in [`Reduction::reads`]
    pub read: usize,
}

/// A named index value computed once before the loop at `depth`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHoist {
    pub expr: IndexExpr,
    pub depth: usize,
}

/// Two-operand contraction with in-place accumulation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reduction {
    pub name: String,
    pub loops: Vec<Loop>,
    pub reads: [TensorAccess; 2],
    pub write: TensorAccess,
    /// Loop variable carrying the contraction
    pub reduction: Option<String>,
    pub promotions: Vec<Promotion>,
    pub index_hoists: BTreeMap<String, IndexHoist>,
}

impl Reduction {
    /// Build a reduction and check its invariants
    pub fn new(
        name: impl Into<String>,
        loops: Vec<Loop>,
        reads: [TensorAccess; 2],
        write: TensorAccess,
        reduction: Option<String>,
    ) -> CompileResult<Self> {
        let op = Self {
            name: name.into(),
            loops,
            reads,
            write,
            reduction,
            promotions: Vec::new(),
            index_hoists: BTreeMap::new(),
        };
        op.validate()?;
        Ok(op)
    }

    pub fn loop_vars(&self) -> Vec<&str> {
        self.loops.iter().map(|l| l.var.as_str()).collect()
    }

    pub fn loop_position(&self, var: &str) -> Option<usize> {
        self.loops.iter().position(|l| l.var == var)
    }

    /// The read access a promotion refers to
    pub fn promoted_access(&self, promotion: &Promotion) -> Option<&TensorAccess> {
        self.reads.get(promotion.read)
    }

    /// Whether `access` depends on `loop_var`, looking through hoisted index names.
    ///
    /// This is a syntactic test: a subscript depends on a loop exactly when
    /// the loop variable appears in it.
    pub fn access_depends_on(&self, access: &TensorAccess, loop_var: &str) -> bool {
        access.at.iter().flat_map(|idx| idx.variables()).any(|var| {
            var == loop_var
                || self
                    .index_hoists
                    .get(&var)
                    .is_some_and(|hoist| hoist.expr.contains_var(loop_var))
        })
    }

    /// Every access of the op, reads first
    pub fn accesses(&self) -> impl Iterator<Item = &TensorAccess> {
        self.reads.iter().chain(std::iter::once(&self.write))
    }

    /// Check the structural invariants every transformation must preserve
    pub fn validate(&self) -> CompileResult<()> {
        let mut seen = HashSet::new();
        for (depth, lp) in self.loops.iter().enumerate() {
            if lp.var.is_empty() {
                return Err(CompileError::schedule("empty loop variable"));
            }
            if !seen.insert(lp.var.as_str()) {
                return Err(CompileError::schedule(format!(
                    "loop variable `{}` declared twice",
                    lp.var
                )));
            }
            for bound in [&lp.start, &lp.end] {
                for var in bound.variables() {
                    let outer = self.loops[..depth].iter().any(|l| l.var == var);
                    if !outer {
                        return Err(CompileError::schedule(format!(
                            "bound `{}` of loop `{}` uses `{}` which is not an enclosing loop",
                            bound, lp.var, var
                        )));
                    }
                }
            }
        }

        if let Some(red) = &self.reduction {
            if !seen.contains(red.as_str()) {
                return Err(CompileError::unknown_loop(red.clone()));
            }
        }

        for access in self.accesses() {
            if access.at.len() != TENSOR_RANK || access.shape.len() != TENSOR_RANK {
                return Err(CompileError::schedule(format!(
                    "access to `{}` must have rank {}",
                    access.var, TENSOR_RANK
                )));
            }
            for idx in &access.at {
                for var in idx.variables() {
                    if !seen.contains(var.as_str()) && !self.index_hoists.contains_key(&var) {
                        return Err(CompileError::unknown_loop(var));
                    }
                }
            }
        }

        for promotion in &self.promotions {
            if !seen.contains(promotion.loop_var.as_str()) {
                return Err(CompileError::unknown_loop(promotion.loop_var.clone()));
            }
            if promotion.read >= self.reads.len() {
                return Err(CompileError::schedule(format!(
                    "promotion refers to read #{}",
                    promotion.read
                )));
            }
        }

        for (name, hoist) in &self.index_hoists {
            if seen.contains(name.as_str()) {
                return Err(CompileError::schedule(format!(
                    "index hoist `{}` shadows a loop variable",
                    name
                )));
            }
            if hoist.depth >= self.loops.len() {
                return Err(CompileError::schedule(format!(
                    "index hoist `{}` has depth {} but the nest has {} loops",
                    name,
                    hoist.depth,
                    self.loops.len()
                )));
            }
            for var in hoist.expr.variables() {
                let opened = self.loops[..hoist.depth].iter().any(|l| l.var == var);
                if !opened {
                    return Err(CompileError::HoistOutOfScope {
                        what: name.clone(),
                        var,
                    });
                }
            }
        }

        Ok(())
    }
}

/// IR node kinds the code generator knows how to emit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Reduction(Reduction),
}

impl Op {
    pub fn name(&self) -> &str {
        match self {
            Op::Reduction(op) => &op.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Op::Reduction(_) => "reduction",
        }
    }
}

impl From<Reduction> for Op {
    fn from(op: Reduction) -> Self {
        Op::Reduction(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(var: &str, at: [&str; 2], shape: [i64; 2]) -> TensorAccess {
        TensorAccess::new(
            var,
            at.iter().map(|v| IndexExpr::var(*v)).collect(),
            shape.iter().map(|v| IndexExpr::lit(*v)).collect(),
        )
    }

    fn loops() -> Vec<Loop> {
        vec![
            Loop::new("m", 0.into(), 2.into()),
            Loop::new("n", 0.into(), 2.into()),
            Loop::new("k", 0.into(), 2.into()),
        ]
    }

    #[test]
    fn test_valid_reduction() {
        let op = Reduction::new(
            "mm",
            loops(),
            [access("A", ["m", "k"], [2, 2]), access("B", ["k", "n"], [2, 2])],
            access("C", ["m", "n"], [2, 2]),
            Some("k".to_string()),
        )
        .unwrap();
        assert_eq!(op.loop_vars(), vec!["m", "n", "k"]);
        assert_eq!(op.loop_position("k"), Some(2));
        assert!(op.reads[0].references("k"));
        assert!(!op.reads[0].references("n"));
    }

    #[test]
    fn test_rejects_duplicate_loop() {
        let mut l = loops();
        l[2].var = "m".to_string();
        let result = Reduction::new(
            "mm",
            l,
            [access("A", ["m", "m"], [2, 2]), access("B", ["m", "n"], [2, 2])],
            access("C", ["m", "n"], [2, 2]),
            None,
        );
        assert!(matches!(result, Err(CompileError::InvalidSchedule { .. })));
    }

    #[test]
    fn test_rejects_undeclared_subscript() {
        let result = Reduction::new(
            "mm",
            loops(),
            [access("A", ["m", "z"], [2, 2]), access("B", ["k", "n"], [2, 2])],
            access("C", ["m", "n"], [2, 2]),
            Some("k".to_string()),
        );
        assert!(matches!(result, Err(CompileError::UnknownLoopVariable { name }) if name == "z"));
    }

    #[test]
    fn test_rejects_unknown_reduction_axis() {
        let result = Reduction::new(
            "mm",
            loops(),
            [access("A", ["m", "k"], [2, 2]), access("B", ["k", "n"], [2, 2])],
            access("C", ["m", "n"], [2, 2]),
            Some("j".to_string()),
        );
        assert!(matches!(result, Err(CompileError::UnknownLoopVariable { .. })));
    }

    #[test]
    fn test_op_dispatch_metadata() {
        let op: Op = Reduction::new(
            "mm",
            loops(),
            [access("A", ["m", "k"], [2, 2]), access("B", ["k", "n"], [2, 2])],
            access("C", ["m", "n"], [2, 2]),
            Some("k".to_string()),
        )
        .unwrap()
        .into();
        assert_eq!(op.name(), "mm");
        assert_eq!(op.kind(), "reduction");
    }
}
