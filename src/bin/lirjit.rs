//! Demo driver: builds the sample functions, runs them and prints the results.

use bumpalo::Bump;
use clap::Parser;

use lirjit::{AbiKind, JitConfig, JitContext, JitError, LOpcode};

#[derive(Parser, Debug)]
#[command(name = "lirjit", about = "Compile and run the LIR sample functions")]
struct Args {
    /// Trace appended instructions and log native disassembly
    #[arg(short, long)]
    verbose: bool,

    /// Build without the CSE and algebraic stages
    #[arg(long)]
    no_optimize: bool,

    /// Print session statistics after running the samples
    #[arg(long)]
    stats: bool,
}

fn build_samples(jit: &mut JitContext<'_>, optimize: bool) -> Result<(), JitError> {
    // ret0() = 0
    let mut fb = jit.builder("ret0", optimize);
    let zero = fb.immi(0);
    fb.reti(zero);
    fb.finalize()?;

    // add2(x) = x + 2
    let mut fb = jit.builder("add2", optimize);
    let x = fb.insert_parameter()?;
    let x = fb.q2i(x);
    let two = fb.immi(2);
    let sum = fb.addi(x, two);
    fb.reti(sum);
    fb.finalize()?;

    // sum(x, y) = x + y
    let mut fb = jit.builder("sum", optimize);
    let x = fb.insert_parameter()?;
    let y = fb.insert_parameter()?;
    let sum = fb.addq(x, y);
    fb.retq(sum);
    fb.finalize()?;

    // mult(x, y) = (x * y) * 8
    let mut fb = jit.builder("mult", optimize);
    let x = fb.insert_parameter()?;
    let y = fb.insert_parameter()?;
    let product = fb.mulq(x, y);
    let eight = fb.immq(8);
    let scaled = fb.mulq(product, eight);
    fb.retq(scaled);
    fb.finalize()?;

    // chain(x, y) = mult(sum(x, y), 2)
    let mut fb = jit.builder("chain", optimize);
    let x = fb.insert_parameter()?;
    let y = fb.insert_parameter()?;
    let s = fb.call("sum", LOpcode::CallQ, AbiKind::Cdecl, &[x, y])?;
    let two = fb.immq(2);
    let m = fb.call("mult", LOpcode::CallQ, AbiKind::Cdecl, &[s, two])?;
    fb.retq(m);
    fb.finalize()?;

    Ok(())
}

fn main() {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let arena = Bump::new();
    let config = JitConfig::from_env().with_verbose(args.verbose);
    let mut jit = JitContext::new(&arena, config);

    if let Err(e) = build_samples(&mut jit, !args.no_optimize) {
        eprintln!("lirjit: {}", e);
        std::process::exit(1);
    }

    // SAFETY: the signatures below match the functions built above and the
    // context outlives every call.
    unsafe {
        if let Some(f) = jit.function_by_name("ret0") {
            let f: extern "C" fn() -> i32 = f.as_fn();
            println!("ret0() = {}", f());
        }
        if let Some(f) = jit.function_by_name("add2") {
            let f: extern "C" fn(i64) -> i32 = f.as_fn();
            println!("add2(5) = {}", f(5));
        }
        if let Some(f) = jit.function_by_name("sum") {
            let f: extern "C" fn(i64, i64) -> i64 = f.as_fn();
            println!("sum(100, 200) = {}", f(100, 200));
        }
        if let Some(f) = jit.function_by_name("mult") {
            let f: extern "C" fn(i64, i64) -> i64 = f.as_fn();
            println!("mult(100, 200) = {}", f(100, 200));
        }
        if let Some(f) = jit.function_by_name("chain") {
            let f: extern "C" fn(i64, i64) -> i64 = f.as_fn();
            println!("chain(3, 4) = {}", f(3, 4));
        }
    }

    if args.stats {
        let stats = jit.stats();
        println!("functions compiled:     {}", stats.functions_compiled);
        println!("instructions compiled:  {}", stats.instructions_compiled);
        println!("total code size:        {} bytes", stats.total_code_size);
        println!(
            "largest function:       {} ({} bytes)",
            stats.largest_function_name, stats.largest_function_size
        );
        println!("registers allocated:    {}", stats.registers_allocated);
        println!("spills generated:       {}", stats.spills_generated);
        println!("call sites:             {}", stats.total_calls);
        println!("cse hits:               {}", stats.cse_hits);
        println!("simplifications:        {}", stats.simplifications);
    }
}
