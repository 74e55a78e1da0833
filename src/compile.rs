//! Compile entry and the handoff to the external build step
//!
//! [`compile`] picks the generator for an op kind and produces a
//! [`CompiledSource`]. [`link`] joins a batch of native sources into one
//! C++ extension unit: the procedures, a shape-checking tensor wrapper per
//! procedure and a binding table. Building and loading that unit is left to
//! the toolchain that consumes it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::codegen::{CodeGenerator, CodegenConfig, Dialect};
use crate::error::{CompileError, CompileResult};
use crate::expr::IndexExpr;
use crate::ir::{Op, Reduction};

/// A tensor parameter of a generated procedure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorParam {
    pub var: String,
    pub extents: Vec<IndexExpr>,
}

/// Generated text for one op
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledSource {
    pub name: String,
    pub text: String,
    pub target: Dialect,
    /// Procedure parameters in signature order; the destination comes last
    pub params: Vec<TensorParam>,
}

impl CompiledSource {
    /// Export to JSON format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for CompiledSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Compile `op` for `target` with the default configuration.
///
/// `name` renames the emitted procedure; only the procedure name changes,
/// never identifiers that merely contain the op's name.
pub fn compile(op: &Op, target: Dialect, name: Option<&str>) -> CompileResult<CompiledSource> {
    compile_with(&CodeGenerator::default(), op, target, name)
}

/// Compile `op` with an explicit generator
pub fn compile_with(
    codegen: &CodeGenerator,
    op: &Op,
    target: Dialect,
    name: Option<&str>,
) -> CompileResult<CompiledSource> {
    match op {
        Op::Reduction(reduction) => {
            let name = name.unwrap_or(&reduction.name);
            let text = codegen.generate_named(reduction, target, name)?;
            debug!(name, kind = op.kind(), %target, "compiled");
            Ok(CompiledSource {
                name: name.to_string(),
                text,
                target,
                params: tensor_params(reduction),
            })
        }
    }
}

/// Compile several ops in order, rejecting repeated output names
pub fn compile_batch(
    codegen: &CodeGenerator,
    ops: &[(&Op, Option<&str>)],
    target: Dialect,
) -> CompileResult<Vec<CompiledSource>> {
    let mut names = HashSet::new();
    let mut sources = Vec::with_capacity(ops.len());
    for (op, name) in ops {
        let source = compile_with(codegen, op, target, *name)?;
        if !names.insert(source.name.clone()) {
            return Err(CompileError::DuplicateOutputName { name: source.name });
        }
        sources.push(source);
    }
    Ok(sources)
}

fn tensor_params(op: &Reduction) -> Vec<TensorParam> {
    let mut seen = HashSet::new();
    op.accesses()
        .filter(|access| seen.insert(access.var.as_str()))
        .map(|access| TensorParam {
            var: access.var.clone(),
            extents: access.shape.clone(),
        })
        .collect()
}

/// One C++ extension unit ready for the external build step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedModule {
    pub module_name: String,
    /// Exported procedure names, in input order
    pub symbols: Vec<String>,
    pub text: String,
}

impl LinkedModule {
    /// Export to JSON format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write the unit to `path`, creating parent directories
    pub fn write_to(&self, path: impl AsRef<Path>) -> CompileResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &self.text)?;
        info!(path = %path.display(), symbols = self.symbols.len(), "wrote module");
        Ok(())
    }
}

impl fmt::Display for LinkedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Join native sources into one extension unit
pub fn link(sources: &[CompiledSource], config: &CodegenConfig) -> CompileResult<LinkedModule> {
    let first = sources
        .first()
        .ok_or_else(|| CompileError::unsupported_op("no sources to link"))?;
    let mut names = HashSet::new();
    for source in sources {
        if source.target != first.target {
            return Err(CompileError::unsupported_target(format!(
                "mixed targets `{}` and `{}` in one module",
                first.target, source.target
            )));
        }
        if !names.insert(source.name.as_str()) {
            return Err(CompileError::DuplicateOutputName {
                name: source.name.clone(),
            });
        }
    }
    if first.target != Dialect::Native {
        return Err(CompileError::unsupported_target(format!(
            "`{}` sources cannot be built",
            first.target
        )));
    }

    let mut text = String::new();
    text.push_str("// This code is auto-generated.\n");
    text.push_str("#include <torch/extension.h>\n\n\n");
    for source in sources {
        text.push_str(&source.text);
        text.push('\n');
        text.push_str(&tensor_wrapper(source, config)?);
        text.push('\n');
    }

    text.push_str(&format!("PYBIND11_MODULE({}, m) {{\n", config.module_name));
    for source in sources {
        text.push_str(&format!(
            "  m.def(\"{name}\", &c_reduction_wrapper_{name}, \"\");\n",
            name = source.name
        ));
    }
    text.push_str("}\n");

    Ok(LinkedModule {
        module_name: config.module_name.clone(),
        symbols: sources.iter().map(|s| s.name.clone()).collect(),
        text,
    })
}

/// Tensor-level wrapper: checks input shapes, allocates the zeroed output
fn tensor_wrapper(source: &CompiledSource, config: &CodegenConfig) -> CompileResult<String> {
    let Some((output, inputs)) = source.params.split_last() else {
        return Err(CompileError::unsupported_op(format!(
            "`{}` has no tensor parameters",
            source.name
        )));
    };
    let elem = config.element_type.c_name();
    let dtype = config.element_type.torch_dtype();

    let args: Vec<String> = inputs
        .iter()
        .map(|p| format!("torch::Tensor {}", p.var))
        .collect();
    let mut out = format!(
        "torch::Tensor c_reduction_wrapper_{}({}) {{\n",
        source.name,
        args.join(", ")
    );

    for param in inputs {
        let [rows, cols] = constant_extents(param)?;
        out.push_str(&format!(
            "  TORCH_CHECK({v}.dim() == 2 && {v}.size(0) == {r} && {v}.size(1) == {c}, \"{v} must be a {r}x{c} matrix\");\n",
            v = param.var,
            r = rows,
            c = cols
        ));
    }
    for param in inputs {
        out.push_str(&format!(
            "  {v} = {v}.contiguous().to({dtype});\n",
            v = param.var,
            dtype = dtype
        ));
    }

    let [rows, cols] = constant_extents(output)?;
    out.push_str(&format!(
        "\n  auto {} = torch::zeros({{{}, {}}}, {});\n\n",
        output.var, rows, cols, dtype
    ));

    let ptrs: Vec<String> = source
        .params
        .iter()
        .map(|p| format!("{}.data_ptr<{}>()", p.var, elem))
        .collect();
    out.push_str(&format!("  {}({});\n", source.name, ptrs.join(", ")));
    out.push_str(&format!("  return {};\n}}\n", output.var));
    Ok(out)
}

fn constant_extents(param: &TensorParam) -> CompileResult<[i64; 2]> {
    let mut dims = [0; 2];
    for (slot, extent) in dims.iter_mut().zip(&param.extents) {
        *slot = extent.as_constant().ok_or_else(|| CompileError::NonNumericBound {
            var: param.var.clone(),
            expr: extent.to_string(),
        })?;
    }
    Ok(dims)
}
