//! Code generator for loop-nest reductions
//!
//! Walks a [`Reduction`] once, outermost loop first, and emits either the
//! symbolic debug listing or a flattened C++ procedure. Both dialects share
//! one walk; they differ only in how a load, multiply, accumulate or loop
//! header is spelled.
//!
//! Temporaries are SSA-style (`a_1`, `mul_1`, ...). Counters and the table of
//! already loaded `(tensor, subscripts)` pairs live in per-call state, so
//! generating the same op twice yields identical text.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::{CompileError, CompileResult};
use crate::expr::IndexExpr;
use crate::ir::{Loop, Reduction, TensorAccess};
use crate::schedule::is_identifier;

/// Output syntax of the generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    /// Symbolic IR listing with two-dimensional subscripts
    #[serde(rename = "ir")]
    Debug,
    /// C++ procedure over flat row-major buffers
    #[serde(rename = "c")]
    Native,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Debug => write!(f, "ir"),
            Dialect::Native => write!(f, "c"),
        }
    }
}

impl FromStr for Dialect {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ir" | "debug" => Ok(Dialect::Debug),
            "c" | "cpp" | "native" => Ok(Dialect::Native),
            _ => Err(CompileError::unsupported_target(s)),
        }
    }
}

/// Scalar type of the tensors in native code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32,
    F64,
}

impl ElementType {
    pub fn c_name(&self) -> &'static str {
        match self {
            ElementType::F32 => "float",
            ElementType::F64 => "double",
        }
    }

    pub fn torch_dtype(&self) -> &'static str {
        match self {
            ElementType::F32 => "torch::kFloat",
            ElementType::F64 => "torch::kDouble",
        }
    }
}

/// Knobs shared by code generation and linking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenConfig {
    /// Spaces per nesting level
    pub indent_width: usize,
    pub element_type: ElementType,
    /// Integer type of native loop counters and hoisted indices
    pub index_type: String,
    /// Name of the extension module produced by linking
    pub module_name: String,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            indent_width: 2,
            element_type: ElementType::F32,
            index_type: "size_t".to_string(),
            module_name: "mod".to_string(),
        }
    }
}

impl CodegenConfig {
    /// Load a config from JSON; missing fields keep their defaults
    pub fn from_json(source: &str) -> CompileResult<Self> {
        serde_json::from_str(source)
            .map_err(|e| CompileError::parse_error(format!("invalid codegen config: {}", e)))
    }
}

/// Code generator for reductions
pub struct CodeGenerator {
    config: CodegenConfig,
}

impl CodeGenerator {
    pub fn new(config: CodegenConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodegenConfig {
        &self.config
    }

    /// Generate `op` under its own name
    pub fn generate(&self, op: &Reduction, dialect: Dialect) -> CompileResult<String> {
        self.generate_named(op, dialect, &op.name)
    }

    /// Generate `op`, emitting `name` as its procedure (or listing) name
    pub fn generate_named(
        &self,
        op: &Reduction,
        dialect: Dialect,
        name: &str,
    ) -> CompileResult<String> {
        if !is_identifier(name) {
            return Err(CompileError::InvalidName {
                name: name.to_string(),
            });
        }
        op.validate()?;

        let mut state = EmitState::new(dialect, &self.config);
        state.header(op, name)?;

        for (pos, lp) in op.loops.iter().enumerate() {
            for (hoist_name, hoist) in &op.index_hoists {
                if hoist.depth == pos {
                    state.check_scope(hoist_name, &hoist.expr)?;
                    state.emit_index_hoist(hoist_name, &hoist.expr);
                    state.in_scope.insert(hoist_name.clone());
                }
            }

            for promotion in op.promotions.iter().filter(|p| p.loop_var == lp.var) {
                let access = op.promoted_access(promotion).ok_or_else(|| {
                    CompileError::schedule(format!("promotion refers to read #{}", promotion.read))
                })?;
                for idx in &access.at {
                    state.check_scope(&access.var, idx)?;
                }
                let key = (access.var.clone(), access.at.clone());
                if state.symbols.contains_key(&key) {
                    continue;
                }
                let tmp = state.fresh(&access.var);
                state.emit_load(&tmp, access, true)?;
                state.symbols.insert(key, tmp);
            }

            let is_reduction = op.reduction.as_deref() == Some(lp.var.as_str());
            state.emit_loop_open(lp, is_reduction)?;
            state.in_scope.insert(lp.var.clone());
            state.level += 1;
        }

        let mut operands = Vec::with_capacity(op.reads.len());
        for read in &op.reads {
            let key = (read.var.clone(), read.at.clone());
            let tmp = match state.symbols.get(&key) {
                Some(tmp) => tmp.clone(),
                None => {
                    let tmp = state.fresh(&read.var);
                    state.emit_load(&tmp, read, false)?;
                    state.symbols.insert(key, tmp.clone());
                    tmp
                }
            };
            operands.push(tmp);
        }

        let product = state.fresh("mul");
        state.emit_mul(&product, &operands[0], &operands[1]);
        state.emit_accumulate(&product, &op.write)?;

        for _ in op.loops.iter().rev() {
            state.level -= 1;
            state.line("}");
        }
        if dialect == Dialect::Native {
            state.level -= 1;
            state.line("}");
        }

        debug!(op = %op.name, name, %dialect, loops = op.loops.len(), "generated");
        Ok(state.code)
    }
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new(CodegenConfig::default())
    }
}

/// Generate with the default configuration
pub fn generate(op: &Reduction, dialect: Dialect) -> CompileResult<String> {
    CodeGenerator::default().generate(op, dialect)
}

type SymbolKey = (String, Vec<IndexExpr>);

/// State of one generation call
struct EmitState<'a> {
    dialect: Dialect,
    config: &'a CodegenConfig,
    code: String,
    level: usize,
    ssa_counters: HashMap<String, usize>,
    symbols: HashMap<SymbolKey, String>,
    /// Loop variables and hoisted index names declared so far
    in_scope: HashSet<String>,
}

impl<'a> EmitState<'a> {
    fn new(dialect: Dialect, config: &'a CodegenConfig) -> Self {
        Self {
            dialect,
            config,
            code: String::new(),
            level: 0,
            ssa_counters: HashMap::new(),
            symbols: HashMap::new(),
            in_scope: HashSet::new(),
        }
    }

    fn line(&mut self, text: &str) {
        let indent = " ".repeat(self.level * self.config.indent_width);
        self.code.push_str(&indent);
        self.code.push_str(text);
        self.code.push('\n');
    }

    /// Mint the next temporary for `base`
    fn fresh(&mut self, base: &str) -> String {
        let base = base.to_lowercase();
        let counter = self.ssa_counters.entry(base.clone()).or_insert(0);
        *counter += 1;
        match self.dialect {
            Dialect::Debug => format!("%{}_{}", base, counter),
            Dialect::Native => format!("{}_{}", base, counter),
        }
    }

    fn check_scope(&self, what: &str, expr: &IndexExpr) -> CompileResult<()> {
        match expr.variables().into_iter().find(|v| !self.in_scope.contains(v)) {
            Some(var) => Err(CompileError::HoistOutOfScope {
                what: what.to_string(),
                var,
            }),
            None => Ok(()),
        }
    }

    fn header(&mut self, op: &Reduction, name: &str) -> CompileResult<()> {
        match self.dialect {
            Dialect::Debug => self.line(&format!("@IR.{}", name)),
            Dialect::Native => {
                let elem = self.config.element_type.c_name();
                let mut params: Vec<String> = Vec::new();
                let mut seen = HashSet::new();
                for read in &op.reads {
                    if seen.insert(read.var.as_str()) {
                        params.push(format!("const {}* {}", elem, read.var));
                    }
                }
                if !seen.insert(op.write.var.as_str()) {
                    return Err(CompileError::unsupported_op(format!(
                        "`{}` is both read and written",
                        op.write.var
                    )));
                }
                params.push(format!("{}* {}", elem, op.write.var));

                self.line(&format!("// Generated loop nest '{}'", name));
                self.line(&format!("void {}({}) {{", name, params.join(", ")));
                self.level += 1;
            }
        }
        Ok(())
    }

    fn emit_index_hoist(&mut self, name: &str, expr: &IndexExpr) {
        let text = match self.dialect {
            Dialect::Debug => format!("const {} = {}", name, expr),
            Dialect::Native => format!("const {} {} = {};", self.config.index_type, name, expr),
        };
        self.line(&text);
    }

    fn emit_loop_open(&mut self, lp: &Loop, is_reduction: bool) -> CompileResult<()> {
        let text = match self.dialect {
            Dialect::Debug => format!(
                "for ({} in {}..{}){} {{",
                lp.var,
                lp.start,
                lp.end,
                if is_reduction { " reduction" } else { "" }
            ),
            Dialect::Native => {
                let start = constant_bound(lp, &lp.start)?;
                let end = constant_bound(lp, &lp.end)?;
                let mut text = format!(
                    "for ({ty} {v} = {start}; {v} < {end}; ++{v}) {{",
                    ty = self.config.index_type,
                    v = lp.var,
                    start = start,
                    end = end
                );
                if is_reduction {
                    text.push_str(&format!("  // reduction over {}", lp.var));
                }
                text
            }
        };
        self.line(&text);
        Ok(())
    }

    fn emit_load(&mut self, tmp: &str, access: &TensorAccess, hoisted: bool) -> CompileResult<()> {
        let mut text = match self.dialect {
            Dialect::Debug => format!("{} = load {}", tmp, subscript_2d(access)),
            Dialect::Native => format!(
                "{} {} = {};",
                self.config.element_type.c_name(),
                tmp,
                subscript_flat(access)?
            ),
        };
        if hoisted {
            text.push_str("   // hoisted");
        }
        self.line(&text);
        Ok(())
    }

    fn emit_mul(&mut self, tmp: &str, lhs: &str, rhs: &str) {
        let text = match self.dialect {
            Dialect::Debug => format!("{} = mul {}, {}", tmp, lhs, rhs),
            Dialect::Native => format!(
                "{} {} = {} * {};",
                self.config.element_type.c_name(),
                tmp,
                lhs,
                rhs
            ),
        };
        self.line(&text);
    }

    /// Read-modify-write of the destination slot; there is no accumulator temporary
    fn emit_accumulate(&mut self, value: &str, dst: &TensorAccess) -> CompileResult<()> {
        let text = match self.dialect {
            Dialect::Debug => format!("accumul {}, {}", value, subscript_2d(dst)),
            Dialect::Native => format!("{} += {};", subscript_flat(dst)?, value),
        };
        self.line(&text);
        Ok(())
    }
}

fn subscript_2d(access: &TensorAccess) -> String {
    let idx: Vec<String> = access.at.iter().map(|e| e.to_string()).collect();
    format!("{}[{}]", access.var, idx.join(", "))
}

/// `var[row * stride + col]` over a row-major buffer
fn subscript_flat(access: &TensorAccess) -> CompileResult<String> {
    let stride = access.shape[1]
        .as_constant()
        .ok_or_else(|| CompileError::NonNumericBound {
            var: access.var.clone(),
            expr: access.shape[1].to_string(),
        })?;
    let row = IndexExpr::mul(access.at[0].clone(), IndexExpr::lit(stride));
    Ok(format!("{}[{} + {}]", access.var, row, access.at[1]))
}

fn constant_bound(lp: &Loop, bound: &IndexExpr) -> CompileResult<i64> {
    bound.as_constant().ok_or_else(|| CompileError::NonNumericBound {
        var: lp.var.clone(),
        expr: bound.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::lower_matmul;
    use pretty_assertions::assert_eq;

    fn base() -> Reduction {
        lower_matmul(4, 3, 3, 5).unwrap()
    }

    fn count(text: &str, pred: impl Fn(&str) -> bool) -> usize {
        text.lines().map(str::trim).filter(|&l| pred(l)).count()
    }

    fn is_loop_open(l: &str) -> bool {
        l.starts_with("for (")
    }

    fn is_close(l: &str) -> bool {
        l == "}"
    }

    #[test]
    fn test_debug_listing() {
        let text = generate(&base(), Dialect::Debug).unwrap();
        let expected = "\
@IR.mm
for (m in 0..4) {
  for (n in 0..5) {
    for (k in 0..3) reduction {
      %a_1 = load A[m, k]
      %b_1 = load B[k, n]
      %mul_1 = mul %a_1, %b_1
      accumul %mul_1, C[m, n]
    }
  }
}
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_native_procedure() {
        let text = generate(&base(), Dialect::Native).unwrap();
        let expected = "\
// Generated loop nest 'mm'
void mm(const float* A, const float* B, float* C) {
  for (size_t m = 0; m < 4; ++m) {
    for (size_t n = 0; n < 5; ++n) {
      for (size_t k = 0; k < 3; ++k) {  // reduction over k
        float a_1 = A[m * 3 + k];
        float b_1 = B[k * 5 + n];
        float mul_1 = a_1 * b_1;
        C[m * 5 + n] += mul_1;
      }
    }
  }
}
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_debug_line_counts() {
        let text = generate(&base(), Dialect::Debug).unwrap();
        assert_eq!(count(&text, is_loop_open), 3);
        assert_eq!(count(&text, is_close), 3);
        assert_eq!(count(&text, |l| l.contains(" = load ")), 2);
        assert_eq!(count(&text, |l| l.contains(" = mul ")), 1);
        assert_eq!(count(&text, |l| l.starts_with("accumul ")), 1);
    }

    #[test]
    fn test_generation_is_idempotent() {
        let op = base();
        let gen = CodeGenerator::default();
        for dialect in [Dialect::Debug, Dialect::Native] {
            assert_eq!(
                gen.generate(&op, dialect).unwrap(),
                gen.generate(&op, dialect).unwrap()
            );
        }
    }

    #[test]
    fn test_tiling_changes_loops_not_body() {
        let before = generate(&base(), Dialect::Debug).unwrap();
        let mut op = base();
        op.tile(&[("m", 2)]).unwrap();
        let after = generate(&op, Dialect::Debug).unwrap();

        assert_ne!(before, after);
        assert_eq!(count(&after, is_loop_open), 4);
        assert_eq!(count(&after, is_close), 4);
        let body_lines: [fn(&str) -> bool; 3] = [
            |l| l.contains(" = load "),
            |l| l.contains(" = mul "),
            |l| l.starts_with("accumul "),
        ];
        for pred in body_lines {
            assert_eq!(count(&before, pred), count(&after, pred));
        }
        assert!(after.contains("for (m_blk in 0..2) {"));
        assert!(after.contains("load A[(m_blk * 2 + m_inner), k]"));
    }

    #[test]
    fn test_native_tiled_flattening() {
        let mut op = base();
        op.tile(&[("m", 2)]).unwrap();
        let text = generate(&op, Dialect::Native).unwrap();
        assert!(text.contains("for (size_t m_blk = 0; m_blk < 2; ++m_blk) {"));
        assert!(text.contains("float a_1 = A[(m_blk * 2 + m_inner) * 3 + k];"));
        assert!(text.contains("C[(m_blk * 2 + m_inner) * 5 + n] += mul_1;"));
    }

    #[test]
    fn test_hoisted_load_is_reused() {
        let mut op = base();
        op.reorder(&["m", "k", "n"]).unwrap().promote_invariants("n").unwrap();
        let text = generate(&op, Dialect::Debug).unwrap();
        let expected = "\
@IR.mm
for (m in 0..4) {
  for (k in 0..3) reduction {
    %a_1 = load A[m, k]   // hoisted
    for (n in 0..5) {
      %b_1 = load B[k, n]
      %mul_1 = mul %a_1, %b_1
      accumul %mul_1, C[m, n]
    }
  }
}
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_hoist_before_operand_loop_is_rejected() {
        // A[m, k] would be loaded before `k` opens.
        let mut op = base();
        op.promote_invariants("n").unwrap();
        let err = generate(&op, Dialect::Debug).unwrap_err();
        assert!(matches!(err, CompileError::HoistOutOfScope { var, .. } if var == "k"));
    }

    #[test]
    fn test_shared_access_loaded_once() {
        let mut op = lower_matmul(3, 3, 3, 3).unwrap();
        op.reads[1] = op.reads[0].clone();
        let text = generate(&op, Dialect::Debug).unwrap();
        assert_eq!(count(&text, |l| l.contains(" = load ")), 1);
        assert!(text.contains("%mul_1 = mul %a_1, %a_1"));

        let native = generate(&op, Dialect::Native).unwrap();
        assert!(native.contains("void mm(const float* A, float* C) {"));
    }

    #[test]
    fn test_index_hoist_emission() {
        let mut op = base();
        op.tile(&[("m", 2)]).unwrap();
        op.hoist_index("m_base", IndexExpr::mul(IndexExpr::var("m_blk"), IndexExpr::lit(2)), 1)
            .unwrap();

        let debug_text = generate(&op, Dialect::Debug).unwrap();
        assert!(debug_text.contains("\n  const m_base = m_blk * 2\n  for (m_inner in 0..2) {"));
        assert!(debug_text.contains("load A[(m_base + m_inner), k]"));

        let native = generate(&op, Dialect::Native).unwrap();
        assert!(native.contains("    const size_t m_base = m_blk * 2;\n"));
        assert!(native.contains("A[(m_base + m_inner) * 3 + k]"));
    }

    #[test]
    fn test_native_rejects_symbolic_bound() {
        let mut op = base();
        op.loops[1].end = IndexExpr::add(IndexExpr::var("m"), IndexExpr::lit(1));
        op.validate().unwrap();
        assert!(generate(&op, Dialect::Debug).is_ok());
        let err = generate(&op, Dialect::Native).unwrap_err();
        assert!(matches!(err, CompileError::NonNumericBound { var, .. } if var == "n"));
    }

    #[test]
    fn test_native_braces_balanced() {
        let mut op = lower_matmul(8, 8, 8, 8).unwrap();
        op.tile(&[("m", 4), ("n", 2), ("k", 4)]).unwrap();
        let text = generate(&op, Dialect::Native).unwrap();
        assert_eq!(text.matches('{').count(), text.matches('}').count());
        assert_eq!(count(&text, is_loop_open), 6);
        assert_eq!(count(&text, is_close), 7);
    }

    #[test]
    fn test_config_changes_spelling() {
        let config = CodegenConfig {
            indent_width: 4,
            element_type: ElementType::F64,
            ..CodegenConfig::default()
        };
        let text = CodeGenerator::new(config).generate(&base(), Dialect::Native).unwrap();
        assert!(text.contains("void mm(const double* A, const double* B, double* C) {"));
        assert!(text.contains("\n    for (size_t m = 0; m < 4; ++m) {"));
        assert!(text.contains("double mul_1 = a_1 * b_1;"));
    }

    #[test]
    fn test_config_from_json() {
        let config = CodegenConfig::from_json(r#"{"element_type": "f64"}"#).unwrap();
        assert_eq!(config.element_type, ElementType::F64);
        assert_eq!(config.indent_width, 2);
        assert!(CodegenConfig::from_json("{").is_err());
    }

    #[test]
    fn test_dialect_from_str() {
        assert_eq!("ir".parse::<Dialect>().unwrap(), Dialect::Debug);
        assert_eq!("C".parse::<Dialect>().unwrap(), Dialect::Native);
        assert!(matches!(
            "cuda".parse::<Dialect>(),
            Err(CompileError::UnsupportedTarget { .. })
        ));
    }

    #[test]
    fn test_invalid_name() {
        let err = CodeGenerator::default()
            .generate_named(&base(), Dialect::Native, "mm-fast")
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidName { .. }));
    }

    #[test]
    fn test_dialect_spelling_matches_serde() {
        for dialect in [Dialect::Debug, Dialect::Native] {
            let json = serde_json::to_string(&dialect).unwrap();
            assert_eq!(json, format!("\"{}\"", dialect));
            assert_eq!(serde_json::from_str::<Dialect>(&json).unwrap(), dialect);
            assert_eq!(dialect.to_string().parse::<Dialect>().unwrap(), dialect);
        }
    }

    #[test]
    fn test_malformed_access_is_an_error() {
        let mut op = base();
        op.reads[0].at.pop();
        for dialect in [Dialect::Debug, Dialect::Native] {
            let err = generate(&op, dialect).unwrap_err();
            assert!(matches!(err, CompileError::InvalidSchedule { .. }), "{:?}", err);
        }
    }
}
