//! Schedule transformations on the loop-nest IR
//!
//! Each transformation works on a scratch copy of the op, re-validates it and
//! only then commits, so a rejected call leaves the op untouched. Methods
//! return `&mut Self` so calls chain with `?`:
//!
//! ```rust
//! use loopnest::lower::lower_matmul;
//!
//! let mut op = lower_matmul(64, 64, 64, 64).unwrap();
//! op.tile(&[("m", 16), ("k", 16)])
//!     .unwrap()
//!     .reorder(&["m_blk", "k_blk", "n", "m_inner", "k_inner"])
//!     .unwrap();
//! assert_eq!(op.reduction.as_deref(), Some("k_inner"));
//! ```

use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::error::{CompileError, CompileResult};
use crate::expr::IndexExpr;
use crate::ir::{IndexHoist, Loop, Promotion, Reduction};

impl Reduction {
    /// Split each named loop `v` of width `T` into `v_blk` (`start..end/T`)
    /// and `v_inner` (`0..T`), rewriting every use of `v` to
    /// `(v_blk * T + v_inner)`.
    ///
    /// The block extent is floor-divided; when `T` does not divide the extent
    /// the trailing partial tile is not executed.
    pub fn tile(&mut self, sizes: &[(&str, usize)]) -> CompileResult<&mut Self> {
        let mut taken: HashSet<String> = self
            .loops
            .iter()
            .map(|l| l.var.clone())
            .chain(self.index_hoists.keys().cloned())
            .collect();
        let mut requested = HashSet::new();

        for &(var, width) in sizes {
            if self.loop_position(var).is_none() {
                return Err(CompileError::unknown_loop(var));
            }
            if !requested.insert(var) {
                return Err(CompileError::schedule(format!("`{}` tiled twice", var)));
            }
            if width == 0 {
                return Err(CompileError::schedule(format!(
                    "tile width for `{}` must be positive",
                    var
                )));
            }
            for name in [block_name(var), inner_name(var)] {
                if !taken.insert(name.clone()) {
                    return Err(CompileError::schedule(format!(
                        "tiling `{}` would redeclare `{}`",
                        var, name
                    )));
                }
            }
        }

        let width_of = |var: &str| sizes.iter().find(|(v, _)| *v == var).map(|(_, w)| *w);

        let mut next = self.clone();
        next.loops.clear();
        let mut splits = Vec::new();
        for (depth, lp) in self.loops.iter().enumerate() {
            let Some(width) = width_of(&lp.var) else {
                next.loops.push(lp.clone());
                continue;
            };
            let width = i64::try_from(width)
                .map_err(|_| CompileError::schedule(format!("tile width {} is too large", width)))?;
            if let Some(extent) = lp.end.as_constant() {
                if extent % width != 0 {
                    warn!(
                        var = %lp.var,
                        extent,
                        width,
                        "tile width does not divide the extent; trailing iterations are dropped"
                    );
                }
            }

            let blk = block_name(&lp.var);
            let inner = inner_name(&lp.var);
            next.loops.push(Loop::new(
                blk.clone(),
                lp.start.clone(),
                IndexExpr::floor_div(lp.end.clone(), IndexExpr::lit(width)),
            ));
            next.loops
                .push(Loop::new(inner.clone(), IndexExpr::lit(0), IndexExpr::lit(width)));

            if next.reduction.as_deref() == Some(lp.var.as_str()) {
                next.reduction = Some(inner.clone());
            }
            for promotion in &mut next.promotions {
                if promotion.loop_var == lp.var {
                    promotion.loop_var = blk.clone();
                }
            }
            // Each split inserts one loop, pushing later hoist points down.
            for (hoist, original) in next.index_hoists.values_mut().zip(self.index_hoists.values()) {
                if original.depth > depth {
                    hoist.depth += 1;
                }
            }

            let replacement = IndexExpr::add(
                IndexExpr::mul(IndexExpr::var(blk), IndexExpr::lit(width)),
                IndexExpr::var(inner),
            );
            splits.push((lp.var.as_str(), replacement));
        }

        for (var, replacement) in &splits {
            next.substitute_loop_var(var, replacement);
        }

        next.validate()?;
        debug!(?sizes, loops = ?next.loop_vars(), "tiled");
        *self = next;
        Ok(self)
    }

    /// Rewrite every use of `var` in subscripts, bounds and hoisted indices
    fn substitute_loop_var(&mut self, var: &str, replacement: &IndexExpr) {
        for access in self.reads.iter_mut().chain(std::iter::once(&mut self.write)) {
            for idx in &mut access.at {
                *idx = idx.substitute(var, replacement);
            }
        }
        for lp in &mut self.loops {
            lp.start = lp.start.substitute(var, replacement);
            lp.end = lp.end.substitute(var, replacement);
        }
        for hoist in self.index_hoists.values_mut() {
            hoist.expr = hoist.expr.substitute(var, replacement);
        }
    }

    /// Reorder the nest; `new_order` must be a permutation of the loop variables
    pub fn reorder(&mut self, new_order: &[&str]) -> CompileResult<&mut Self> {
        if let Some(unknown) = new_order.iter().find(|v| self.loop_position(v).is_none()) {
            return Err(CompileError::unknown_loop(*unknown));
        }
        let mut listed = HashSet::new();
        for var in new_order {
            if !listed.insert(*var) {
                return Err(CompileError::schedule(format!("`{}` listed twice in reorder", var)));
            }
        }
        let missing: Vec<&str> = self
            .loop_vars()
            .into_iter()
            .filter(|v| !listed.contains(v))
            .collect();
        if !missing.is_empty() {
            return Err(CompileError::schedule(format!(
                "reorder omits {}",
                missing.join(", ")
            )));
        }

        let mut next = self.clone();
        next.loops = new_order
            .iter()
            .filter_map(|var| self.loops.iter().find(|l| l.var == *var).cloned())
            .collect();
        next.validate()?;
        debug!(loops = ?next.loop_vars(), "reordered");
        *self = next;
        Ok(self)
    }

    /// Register every read whose subscripts do not mention `loop_var` to be
    /// loaded once, just before that loop opens.
    ///
    /// Invariance is judged by the absence of the variable from the
    /// subscripts; no symbolic analysis is attempted. Whether the hoisted
    /// subscripts only use loops opened before `loop_var` is checked at
    /// generation time.
    pub fn promote_invariants(&mut self, loop_var: &str) -> CompileResult<&mut Self> {
        if self.loop_position(loop_var).is_none() {
            return Err(CompileError::unknown_loop(loop_var));
        }

        let mut hoisted = Vec::new();
        let mut registered = Vec::new();
        for (i, read) in self.reads.iter().enumerate() {
            if self.access_depends_on(read, loop_var) {
                continue;
            }
            let promotion = Promotion {
                loop_var: loop_var.to_string(),
                read: i,
            };
            if self.promotions.contains(&promotion) {
                registered.push(read.var.as_str());
            } else {
                hoisted.push(promotion);
            }
        }

        let names: Vec<&str> = hoisted.iter().map(|p| self.reads[p.read].var.as_str()).collect();
        if !names.is_empty() {
            info!("[Promotion] Hoisting {} outside {}", names.join(", "), loop_var);
        } else if !registered.is_empty() {
            info!("[Promotion] {} already hoisted outside {}", registered.join(", "), loop_var);
        } else {
            info!("[Promotion] Nothing to hoist outside {}", loop_var);
        }
        self.promotions.extend(hoisted);
        Ok(self)
    }

    /// Bind `expr` to `name` before the loop at `depth` and use the name in
    /// every subscript where `expr` occurs.
    pub fn hoist_index(
        &mut self,
        name: &str,
        expr: IndexExpr,
        depth: usize,
    ) -> CompileResult<&mut Self> {
        if !is_identifier(name) {
            return Err(CompileError::schedule(format!("`{}` is not an identifier", name)));
        }
        if self.loop_position(name).is_some() || self.index_hoists.contains_key(name) {
            return Err(CompileError::schedule(format!("`{}` is already declared", name)));
        }
        if matches!(expr, IndexExpr::Lit(_) | IndexExpr::Var(_)) {
            return Err(CompileError::schedule(format!(
                "`{}` is not worth hoisting",
                expr
            )));
        }

        let mut next = self.clone();
        let alias = IndexExpr::var(name);
        for access in next.reads.iter_mut().chain(std::iter::once(&mut next.write)) {
            for idx in &mut access.at {
                *idx = idx.replace_subtree(&expr, &alias);
            }
        }
        next.index_hoists
            .insert(name.to_string(), IndexHoist { expr, depth });
        next.validate()?;
        debug!(name, depth, "hoisted index expression");
        *self = next;
        Ok(self)
    }

    /// Extension point: vectorization is not implemented and leaves the op unchanged
    pub fn vectorize(&mut self, loop_var: &str, width: usize) -> &mut Self {
        debug!(loop_var, width, "vectorize requested; not implemented");
        self
    }

    /// Extension point: unrolling is not implemented and leaves the op unchanged
    pub fn unroll(&mut self, loop_var: &str, factor: usize) -> &mut Self {
        debug!(loop_var, factor, "unroll requested; not implemented");
        self
    }
}

fn block_name(var: &str) -> String {
    format!("{}_blk", var)
}

fn inner_name(var: &str) -> String {
    format!("{}_inner", var)
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Owning builder for by-value transformation chains
#[derive(Debug, Clone)]
pub struct Schedule {
    op: Reduction,
}

impl Schedule {
    pub fn new(op: Reduction) -> Self {
        Self { op }
    }

    pub fn tile(mut self, sizes: &[(&str, usize)]) -> CompileResult<Self> {
        self.op.tile(sizes)?;
        Ok(self)
    }

    pub fn reorder(mut self, new_order: &[&str]) -> CompileResult<Self> {
        self.op.reorder(new_order)?;
        Ok(self)
    }

    pub fn promote_invariants(mut self, loop_var: &str) -> CompileResult<Self> {
        self.op.promote_invariants(loop_var)?;
        Ok(self)
    }

    pub fn hoist_index(mut self, name: &str, expr: IndexExpr, depth: usize) -> CompileResult<Self> {
        self.op.hoist_index(name, expr, depth)?;
        Ok(self)
    }

    pub fn op(&self) -> &Reduction {
        &self.op
    }

    pub fn finish(self) -> Reduction {
        self.op
    }
}

impl From<Reduction> for Schedule {
    fn from(op: Reduction) -> Self {
        Self::new(op)
    }
}
