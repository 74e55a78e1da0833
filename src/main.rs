//! Loop-nest compiler CLI
//!
//! Usage:
//!   loopnest "[4, 3] @ [3, 5]"
//!   loopnest "[64, 64] @ [64, 64]" --tile m=16 --tile k=16 --reorder m_blk,k_blk,n,m_inner,k_inner
//!   loopnest "[8, 8] @ [8, 8]" --reorder m,k,n --promote n --target c --name mm_fast --link -o mod.cpp

use clap::Parser as ClapParser;
use colored::Colorize;
use std::fmt::Display;
use std::fs;
use std::io::{self, IsTerminal, Read};
use tracing::Level;

use loopnest::{
    compile_with, init_subscriber, link, lower_str, CodeGenerator, CodegenConfig, Dialect,
    ElementType, Schedule,
};

#[derive(ClapParser, Debug)]
#[command(name = "loopnest")]
#[command(author = "Loopnest Team")]
#[command(version = "0.1.0")]
#[command(about = "Compiles matrix-multiply loop nests to IR listings or C++")]
struct Args {
    /// Shape description (e.g., "[4, 3] @ [3, 5]")
    #[arg(value_name = "DESC")]
    description: Option<String>,

    /// Read the description from file
    #[arg(short = 'f', long = "file")]
    input_file: Option<String>,

    /// Tile a loop (e.g., "m=16"); may be repeated
    #[arg(short = 't', long = "tile", value_parser = parse_tile)]
    tiles: Vec<(String, usize)>,

    /// New loop order, comma separated (e.g., "m_blk,k_blk,n,m_inner,k_inner")
    #[arg(short = 'r', long = "reorder", value_delimiter = ',')]
    reorder: Option<Vec<String>>,

    /// Promote loads that do not depend on this loop; may be repeated
    #[arg(short = 'p', long = "promote")]
    promote: Vec<String>,

    /// Output dialect: ir or c
    #[arg(long = "target", default_value = "ir", value_parser = parse_target)]
    target: Dialect,

    /// Procedure name of the generated code
    #[arg(short = 'n', long = "name")]
    name: Option<String>,

    /// Wrap native output into a loadable extension module
    #[arg(short = 'l', long = "link")]
    link: bool,

    /// Codegen config as JSON
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// Scalar type of native code (f32 or f64)
    #[arg(short = 'e', long = "element-type", value_parser = parse_element_type)]
    element_type: Option<ElementType>,

    /// Output as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Write the output to a file instead of stdout
    #[arg(short = 'o', long = "output")]
    output: Option<String>,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn parse_tile(s: &str) -> Result<(String, usize), String> {
    let (var, width) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid tile format: {}", s))?;
    let width = width
        .trim()
        .parse::<usize>()
        .map_err(|_| format!("Invalid tile width: {}", width))?;
    Ok((var.trim().to_string(), width))
}

fn parse_target(s: &str) -> Result<Dialect, String> {
    s.parse::<Dialect>().map_err(|e| e.to_string())
}

fn parse_element_type(s: &str) -> Result<ElementType, String> {
    match s.to_ascii_lowercase().as_str() {
        "f32" | "float" => Ok(ElementType::F32),
        "f64" | "double" => Ok(ElementType::F64),
        _ => Err(format!("Invalid element type: {}", s)),
    }
}

fn fail(label: &str, err: impl Display) -> ! {
    eprintln!("{}: {}", label.red(), err);
    std::process::exit(1);
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    if let Err(e) = init_subscriber(level) {
        fail("Error", format!("Failed to initialize logging: {}", e));
    }

    // Get description from argument, file, or stdin
    let description = if let Some(desc) = args.description.clone() {
        desc
    } else if let Some(file) = &args.input_file {
        fs::read_to_string(file)
            .unwrap_or_else(|e| fail("Error", format!("Failed to read file '{}': {}", file, e)))
    } else {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .unwrap_or_else(|e| fail("Error", format!("Failed to read stdin: {}", e)));
        buffer
    };

    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path).unwrap_or_else(|e| {
                fail("Error", format!("Failed to read config '{}': {}", path, e))
            });
            CodegenConfig::from_json(&text).unwrap_or_else(|e| fail("Config error", e))
        }
        None => CodegenConfig::default(),
    };
    if let Some(element_type) = args.element_type {
        config.element_type = element_type;
    }

    if args.verbose {
        eprintln!("{}", "Loop-Nest Compiler".bold().blue());
        eprintln!("{}", "=".repeat(35));
        eprintln!();
        eprintln!("{}: {}", "Input".green(), description.trim());
        eprintln!("{}: {}", "Target".green(), args.target);
        eprintln!();
    }

    let op = lower_str(&description).unwrap_or_else(|e| fail("Lowering error", e));
    let op = apply_schedule(Schedule::new(op), &args)
        .unwrap_or_else(|e| fail("Schedule error", e))
        .finish();

    let codegen = CodeGenerator::new(config);
    let source = compile_with(&codegen, &op.into(), args.target, args.name.as_deref())
        .unwrap_or_else(|e| fail("Code generation error", e));

    let (text, highlight) = if args.link {
        let module = link(&[source], codegen.config()).unwrap_or_else(|e| fail("Link error", e));
        let text = if args.json_output {
            module.to_json().unwrap_or_else(|e| fail("Error", format!("Failed to serialize to JSON: {}", e)))
        } else {
            module.text
        };
        (text, false)
    } else if args.json_output {
        let json = source
            .to_json()
            .unwrap_or_else(|e| fail("Error", format!("Failed to serialize to JSON: {}", e)));
        (json, false)
    } else {
        (source.text, source.target == Dialect::Debug)
    };

    match &args.output {
        Some(path) => {
            fs::write(path, &text)
                .unwrap_or_else(|e| fail("Error", format!("Failed to write '{}': {}", path, e)));
            if args.verbose {
                eprintln!("{}: {}", "Wrote".green(), path);
            }
        }
        None if highlight && io::stdout().is_terminal() => {
            for line in text.lines() {
                println!("{}", highlight_line(line));
            }
        }
        None => print!("{}", text),
    }
}

/// Apply the requested transformations in the order tile, reorder, promote
fn apply_schedule(schedule: Schedule, args: &Args) -> loopnest::CompileResult<Schedule> {
    let mut schedule = schedule;
    if !args.tiles.is_empty() {
        let tiles: Vec<(&str, usize)> = args.tiles.iter().map(|(v, w)| (v.as_str(), *w)).collect();
        schedule = schedule.tile(&tiles)?;
    }
    if let Some(order) = &args.reorder {
        let order: Vec<&str> = order.iter().map(|v| v.trim()).collect();
        schedule = schedule.reorder(&order)?;
    }
    for var in &args.promote {
        schedule = schedule.promote_invariants(var)?;
    }
    Ok(schedule)
}

fn highlight_line(line: &str) -> String {
    let code_start = line.len() - line.trim_start().len();
    let (indent, rest) = line.split_at(code_start);
    let (code, comment) = match rest.find("//") {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };

    let words: Vec<String> = code
        .split(' ')
        .map(|word| match word {
            "for" | "in" | "reduction" | "load" | "mul" | "accumul" | "const" => {
                word.blue().bold().to_string()
            }
            w if w.starts_with("@IR.") => w.green().bold().to_string(),
            w if w.starts_with('%') => w.yellow().to_string(),
            w => w.to_string(),
        })
        .collect();

    format!("{}{}{}", indent, words.join(" "), comment.dimmed())
}
