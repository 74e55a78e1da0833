//! Example: naive vs. tiled matrix multiplication
//!
//! Lowers a 64x64 product, tiles and reorders it, promotes the `A` load out
//! of the innermost column loop, and prints both listings. The reference
//! interpreter confirms the schedule does not change the result.
//!
//! Run with: cargo run --example naive_vs_tiled

use loopnest::{compile, execute, lower_str, trace, Dialect, Matrix, Schedule};

fn main() {
    println!("=== Naive vs. Tiled Matmul ===\n");

    let naive = lower_str("[64, 64] @ [64, 64]").unwrap();
    println!("Naive loop order: {:?}\n", naive.loop_vars());
    let listing = compile(&naive.clone().into(), Dialect::Debug, Some("naive")).unwrap();
    println!("{}", listing);

    let tiled = Schedule::new(naive.clone())
        .tile(&[("m", 16), ("k", 16)])
        .unwrap()
        .reorder(&["m_blk", "k_blk", "m_inner", "k_inner", "n"])
        .unwrap()
        .promote_invariants("n")
        .unwrap()
        .finish();
    println!("Tiled loop order: {:?}\n", tiled.loop_vars());
    let listing = compile(&tiled.clone().into(), Dialect::Debug, Some("tiled")).unwrap();
    println!("{}", listing);

    let native = compile(&tiled.clone().into(), Dialect::Native, Some("tiled")).unwrap();
    println!("Native procedure:\n");
    println!("{}", native);

    let a = Matrix::sequential(64, 64, 7);
    let b = Matrix::sequential(64, 64, 5);
    let expected = execute(&naive, &a, &b).unwrap();
    let traced = trace(&tiled, &a, &b).unwrap();
    println!(
        "Tiled result matches naive: {} ({} loads instead of {})",
        if traced.output.approx_eq(&expected, 1e-9) { "yes" } else { "NO" },
        traced.loads,
        2 * traced.iterations
    );

    // Small case that can be checked by hand:
    // | 1 2 |   | 5 6 |   | 19 22 |
    // | 3 4 | * | 7 8 | = | 43 50 |
    let small = lower_str("[2, 2] @ [2, 2]").unwrap();
    let a = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
    let b = Matrix::from_rows(&[vec![5.0, 6.0], vec![7.0, 8.0]]).unwrap();
    println!("\n2x2 product:\n{}", execute(&small, &a, &b).unwrap());
}
