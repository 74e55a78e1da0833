//! Example: building one extension module from several schedules
//!
//! Compiles three schedules of the same product under distinct names, links
//! them into a single C++ unit and shows that a repeated name is rejected.
//!
//! Run with: cargo run --example batch_module

use loopnest::{compile_batch, link, lower_matmul, CodeGenerator, Dialect, Op, Schedule};

fn main() {
    println!("=== Batch Module Example ===\n");

    let base = lower_matmul(32, 16, 16, 8).unwrap();
    let tiled = Schedule::new(base.clone())
        .tile(&[("m", 8)])
        .unwrap()
        .finish();
    let promoted = Schedule::new(base.clone())
        .reorder(&["m", "k", "n"])
        .unwrap()
        .promote_invariants("n")
        .unwrap()
        .finish();

    let ops: Vec<Op> = vec![base.into(), tiled.into(), promoted.into()];
    let codegen = CodeGenerator::default();
    let sources = compile_batch(
        &codegen,
        &[
            (&ops[0], Some("mm_naive")),
            (&ops[1], Some("mm_tiled")),
            (&ops[2], Some("mm_promoted")),
        ],
        Dialect::Native,
    )
    .unwrap();

    let module = link(&sources, codegen.config()).unwrap();
    println!("Module `{}` exports {:?}\n", module.module_name, module.symbols);
    println!("{}", module);

    match compile_batch(
        &codegen,
        &[(&ops[0], Some("mm")), (&ops[1], Some("mm"))],
        Dialect::Native,
    ) {
        Ok(_) => println!("Unexpected: duplicate names accepted"),
        Err(e) => println!("Rejected as expected: {}", e),
    }
}
