//! Symbolic index expressions
//!
//! Array subscripts, tensor extents and loop bounds are small arithmetic
//! trees over integer literals and loop variables. Rewrites such as tiling
//! substitute a variable structurally, so a loop named `m` can never be
//! confused with one named `m2`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Closed-form integer expression over loop variables
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexExpr {
    /// Integer literal
    Lit(i64),
    /// Loop variable (or hoisted index name)
    Var(String),
    Add(Box<IndexExpr>, Box<IndexExpr>),
    Mul(Box<IndexExpr>, Box<IndexExpr>),
    /// Integer division rounding toward negative infinity
    FloorDiv(Box<IndexExpr>, Box<IndexExpr>),
}

impl IndexExpr {
    pub fn lit(value: i64) -> Self {
        IndexExpr::Lit(value)
    }

    pub fn var(name: impl Into<String>) -> Self {
        IndexExpr::Var(name.into())
    }

    /// `lhs + rhs`, folded when both sides are literals
    pub fn add(lhs: IndexExpr, rhs: IndexExpr) -> Self {
        if let (IndexExpr::Lit(a), IndexExpr::Lit(b)) = (&lhs, &rhs) {
            if let Some(sum) = a.checked_add(*b) {
                return IndexExpr::Lit(sum);
            }
        }
        IndexExpr::Add(Box::new(lhs), Box::new(rhs))
    }

    /// `lhs * rhs`, folded when both sides are literals
    pub fn mul(lhs: IndexExpr, rhs: IndexExpr) -> Self {
        if let (IndexExpr::Lit(a), IndexExpr::Lit(b)) = (&lhs, &rhs) {
            if let Some(product) = a.checked_mul(*b) {
                return IndexExpr::Lit(product);
            }
        }
        IndexExpr::Mul(Box::new(lhs), Box::new(rhs))
    }

    /// `lhs / rhs` (floor), folded when both sides are literals and the divisor is non-zero
    pub fn floor_div(lhs: IndexExpr, rhs: IndexExpr) -> Self {
        if let (IndexExpr::Lit(a), IndexExpr::Lit(b)) = (&lhs, &rhs) {
            if let Some(q) = floor_div_i64(*a, *b) {
                return IndexExpr::Lit(q);
            }
        }
        IndexExpr::FloorDiv(Box::new(lhs), Box::new(rhs))
    }

    /// Whether `name` occurs as a variable anywhere in the tree
    pub fn contains_var(&self, name: &str) -> bool {
        match self {
            IndexExpr::Lit(_) => false,
            IndexExpr::Var(v) => v == name,
            IndexExpr::Add(l, r) | IndexExpr::Mul(l, r) | IndexExpr::FloorDiv(l, r) => {
                l.contains_var(name) || r.contains_var(name)
            }
        }
    }

    /// All variable names referenced by the expression
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_vars(&mut out);
        out
    }

    fn collect_vars(&self, out: &mut BTreeSet<String>) {
        match self {
            IndexExpr::Lit(_) => {}
            IndexExpr::Var(v) => {
                out.insert(v.clone());
            }
            IndexExpr::Add(l, r) | IndexExpr::Mul(l, r) | IndexExpr::FloorDiv(l, r) => {
                l.collect_vars(out);
                r.collect_vars(out);
            }
        }
    }

    /// Replace every occurrence of the variable `name` with `replacement`.
    ///
    /// The tree shape is kept as-is so the rewritten subscript still reads
    /// like the substitution that produced it.
    pub fn substitute(&self, name: &str, replacement: &IndexExpr) -> IndexExpr {
        self.replace_subtree(&IndexExpr::Var(name.to_string()), replacement)
    }

    /// Replace every subtree structurally equal to `pattern`
    pub fn replace_subtree(&self, pattern: &IndexExpr, replacement: &IndexExpr) -> IndexExpr {
        if self == pattern {
            return replacement.clone();
        }
        match self {
            IndexExpr::Lit(_) | IndexExpr::Var(_) => self.clone(),
            IndexExpr::Add(l, r) => IndexExpr::Add(
                Box::new(l.replace_subtree(pattern, replacement)),
                Box::new(r.replace_subtree(pattern, replacement)),
            ),
            IndexExpr::Mul(l, r) => IndexExpr::Mul(
                Box::new(l.replace_subtree(pattern, replacement)),
                Box::new(r.replace_subtree(pattern, replacement)),
            ),
            IndexExpr::FloorDiv(l, r) => IndexExpr::FloorDiv(
                Box::new(l.replace_subtree(pattern, replacement)),
                Box::new(r.replace_subtree(pattern, replacement)),
            ),
        }
    }

    /// Evaluate with variables resolved by `lookup`.
    ///
    /// Returns `None` for an unbound variable, division by zero or overflow.
    pub fn eval<F>(&self, lookup: &F) -> Option<i64>
    where
        F: Fn(&str) -> Option<i64>,
    {
        match self {
            IndexExpr::Lit(v) => Some(*v),
            IndexExpr::Var(v) => lookup(v),
            IndexExpr::Add(l, r) => l.eval(lookup)?.checked_add(r.eval(lookup)?),
            IndexExpr::Mul(l, r) => l.eval(lookup)?.checked_mul(r.eval(lookup)?),
            IndexExpr::FloorDiv(l, r) => floor_div_i64(l.eval(lookup)?, r.eval(lookup)?),
        }
    }

    /// Value of a variable-free expression
    pub fn as_constant(&self) -> Option<i64> {
        self.eval(&|_| None)
    }
}

fn floor_div_i64(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

impl From<i64> for IndexExpr {
    fn from(value: i64) -> Self {
        IndexExpr::Lit(value)
    }
}

impl From<&str> for IndexExpr {
    fn from(name: &str) -> Self {
        IndexExpr::Var(name.to_string())
    }
}

impl fmt::Display for IndexExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexExpr::Lit(v) => write!(f, "{}", v),
            IndexExpr::Var(v) => write!(f, "{}", v),
            IndexExpr::Add(l, r) => write!(f, "({} + {})", l, r),
            IndexExpr::Mul(l, r) => {
                write!(f, "{} * ", l)?;
                fmt_right_operand(r, f)
            }
            IndexExpr::FloorDiv(l, r) => {
                write!(f, "{} / ", l)?;
                fmt_right_operand(r, f)
            }
        }
    }
}

// Mul and FloorDiv associate left, so a nested right operand needs parens.
fn fmt_right_operand(expr: &IndexExpr, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match expr {
        IndexExpr::Mul(..) | IndexExpr::FloorDiv(..) => write!(f, "({})", expr),
        _ => write!(f, "{}", expr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiled(blk: &str, width: i64, inner: &str) -> IndexExpr {
        IndexExpr::add(
            IndexExpr::mul(IndexExpr::var(blk), IndexExpr::lit(width)),
            IndexExpr::var(inner),
        )
    }

    #[test]
    fn test_display_tiled_subscript() {
        assert_eq!(tiled("m_blk", 2, "m_inner").to_string(), "(m_blk * 2 + m_inner)");
    }

    #[test]
    fn test_substitute_whole_identifier_only() {
        let expr = IndexExpr::add(IndexExpr::var("m"), IndexExpr::var("m2"));
        let out = expr.substitute("m", &tiled("m_blk", 2, "m_inner"));
        assert_eq!(out.to_string(), "((m_blk * 2 + m_inner) + m2)");
        assert!(out.contains_var("m2"));
        assert!(!out.contains_var("m"));
    }

    #[test]
    fn test_nested_substitution() {
        let once = IndexExpr::var("m").substitute("m", &tiled("m_blk", 256, "m_inner"));
        let twice = once.substitute("m_inner", &tiled("m_inner_blk", 32, "m_inner_inner"));
        assert_eq!(
            twice.to_string(),
            "(m_blk * 256 + (m_inner_blk * 32 + m_inner_inner))"
        );
    }

    #[test]
    fn test_replace_subtree() {
        let expr = IndexExpr::add(tiled("m_blk", 2, "m_inner"), IndexExpr::var("k"));
        let pattern = IndexExpr::mul(IndexExpr::var("m_blk"), IndexExpr::lit(2));
        let out = expr.replace_subtree(&pattern, &IndexExpr::var("m_base"));
        assert_eq!(out.to_string(), "((m_base + m_inner) + k)");
    }

    #[test]
    fn test_constant_folding() {
        assert_eq!(IndexExpr::floor_div(4.into(), 2.into()), IndexExpr::Lit(2));
        assert_eq!(IndexExpr::floor_div(5.into(), 2.into()), IndexExpr::Lit(2));
        assert_eq!(IndexExpr::floor_div((-5).into(), 2.into()), IndexExpr::Lit(-3));
        assert_eq!(IndexExpr::mul(3.into(), 4.into()), IndexExpr::Lit(12));
        // Division by zero is left symbolic instead of folding.
        assert!(matches!(
            IndexExpr::floor_div(4.into(), 0.into()),
            IndexExpr::FloorDiv(..)
        ));
    }

    #[test]
    fn test_eval_and_constant() {
        let expr = tiled("m_blk", 4, "m_inner");
        let env = |name: &str| match name {
            "m_blk" => Some(2),
            "m_inner" => Some(3),
            _ => None,
        };
        assert_eq!(expr.eval(&env), Some(11));
        assert_eq!(expr.as_constant(), None);
        assert_eq!(IndexExpr::FloorDiv(Box::new(9.into()), Box::new(2.into())).as_constant(), Some(4));
        assert_eq!(IndexExpr::FloorDiv(Box::new(9.into()), Box::new(0.into())).as_constant(), None);
    }

    #[test]
    fn test_right_nested_display() {
        let expr = IndexExpr::FloorDiv(
            Box::new(IndexExpr::var("a")),
            Box::new(IndexExpr::Mul(Box::new(IndexExpr::var("b")), Box::new(2.into()))),
        );
        assert_eq!(expr.to_string(), "a / (b * 2)");
        assert_eq!(expr.variables().into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
