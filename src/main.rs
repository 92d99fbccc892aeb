use std::io::{self, BufRead, IsTerminal, Read, Write};
use std::thread;
use std::time::Instant;

use carp::config::Config;
use carp::eval::Machine;

fn main() {
    env_logger::init();

    // Evaluation recurses on the host stack, so run it on a thread sized
    // for the configured depth limit.
    let config = Config::from_env();
    let interpreter = thread::Builder::new()
        .name("carp".into())
        .stack_size(config.host_stack_bytes())
        .spawn(move || run(config));
    let handle = match interpreter {
        Ok(h) => h,
        Err(e) => {
            eprintln!("Failed to start interpreter thread: {}", e);
            std::process::exit(1);
        }
    };
    if handle.join().is_err() {
        std::process::exit(101);
    }
}

fn run(config: Config) {
    let args: Vec<String> = std::env::args().collect();
    let mut machine = Machine::with_config(config);

    // Process command-line flags
    let mut load_files: Vec<String> = Vec::new();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--load" => {
                if i + 1 < args.len() {
                    load_files.push(args[i + 1].clone());
                    i += 2;
                } else {
                    eprintln!("--load requires a file path");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                println!("Usage: carp [OPTIONS]");
                println!();
                println!("Options:");
                println!("  --load <file>    Evaluate a source file before reading stdin");
                println!("  --help, -h       Show this help message");
                println!();
                println!("Environment variables:");
                println!("  CARP_STACK_SIZE      Operand/root stack capacity (default 8192)");
                println!("  CARP_MAX_DEPTH       Deepest evaluation nesting (default 1000)");
                println!("  CARP_GC_THRESHOLD    Live objects before the first collection (default 10000)");
                println!("  CARP_GC_INCREMENT    Threshold growth per collection (default 1000)");
                println!("  CARP_GC_EACH_FORM=1  Collect after every top-level form");
                println!("  RUST_LOG=carp=debug  Log collections");
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                eprintln!("Try 'carp --help' for usage information.");
                std::process::exit(1);
            }
        }
    }

    for path in &load_files {
        load_file(&mut machine, path);
    }

    let stdin = io::stdin();
    if stdin.is_terminal() {
        println!("carp");
        println!("  Heap: {} objects live", machine.heap.live_count());
        println!("Ready.\n");
        run_interactive(&mut machine);
    } else {
        run_piped(&mut machine);
    }
}

/// Evaluate a file without echoing results. Exits on the first error.
fn load_file(machine: &mut Machine, path: &str) {
    let input = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading {}: {}", path, e);
            std::process::exit(1);
        }
    };

    let start = Instant::now();
    let echo = machine.config.echo_results;
    machine.config.echo_results = false;
    let global = machine.global;
    let mut stderr = io::stderr();
    let result = machine.eval_text(global, &input, &mut stderr);
    machine.config.echo_results = echo;
    if result.is_err() {
        std::process::exit(1);
    }
    eprintln!(
        "Loaded {} in {:.2}s ({} objects live, {} collections, {} freed)",
        path,
        start.elapsed().as_secs_f64(),
        machine.heap.live_count(),
        machine.stats.collections,
        machine.stats.freed_total
    );
}

/// Interactive REPL: accumulate lines until parens are balanced.
fn run_interactive(machine: &mut Machine) {
    let stdin = io::stdin();
    let mut buf = String::new();
    let mut depth: i32 = 0;

    loop {
        if depth == 0 {
            print!("> ");
        } else {
            print!("  ");
        }
        if io::stdout().flush().is_err() {
            break;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("Read error: {}", e);
                break;
            }
        }

        // Naive depth tracking: brackets inside strings are counted too.
        for ch in line.chars() {
            match ch {
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                _ => {}
            }
        }
        buf.push_str(&line);

        if depth <= 0 {
            depth = 0;
            let input = buf.trim().to_string();
            buf.clear();
            if input.is_empty() {
                continue;
            }
            let global = machine.global;
            // Errors are already reported on stdout with their trace.
            let _ = machine.eval_text(global, &input, &mut io::stdout());
        }
    }
}

/// Piped mode: the whole input is one batch.
fn run_piped(machine: &mut Machine) {
    let mut input = String::new();
    if let Err(e) = io::stdin().read_to_string(&mut input) {
        eprintln!("Failed to read input: {}", e);
        std::process::exit(1);
    }
    let global = machine.global;
    if machine.eval_text(global, &input, &mut io::stdout()).is_err() {
        std::process::exit(1);
    }
}
