use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;
use std::{fs, process};

use cinder::builtins;
use cinder::compiler;
use cinder::repl::Repl;
use cinder::Context;

/// Arena handed to the interpreter; everything the language allocates
/// lives in here.
const MEMORY_POOL_SIZE: usize = 1024 * 1024;

const EXIT_USAGE: i32 = 64;
const EXIT_COMPILE: i32 = 65;
const EXIT_IO: i32 = 74;

#[derive(Parser)]
#[command(name = "cinder")]
#[command(version)]
#[command(about = "A small embeddable scripting language", long_about = None)]
struct Cli {
    /// Script to run; starts the interactive REPL when omitted
    script: Option<PathBuf>,

    /// Record source spans during compilation for annotated error traces
    #[arg(long)]
    spans: bool,
}

fn run_file(ctx: &mut Context, path: &PathBuf) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("Could not open file \"{}\".", path.display());
            process::exit(EXIT_IO);
        }
    };

    let program = match compiler::compile(ctx, &source) {
        Ok(program) => program,
        Err(diagnostic) => {
            eprintln!("{}", diagnostic.format());
            process::exit(EXIT_COMPILE);
        }
    };

    if let Err(e) = cinder::eval::eval(ctx, program) {
        let diagnostic = ctx.diagnose(e);
        eprintln!("{}", diagnostic.format());
        process::exit(1);
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e)
            if e.kind() == ErrorKind::DisplayHelp
                || e.kind() == ErrorKind::DisplayVersion =>
        {
            print!("{}", e);
            return;
        }
        Err(e) => {
            eprint!("{}", e);
            process::exit(EXIT_USAGE);
        }
    };

    let mut ctx = match Context::open(MEMORY_POOL_SIZE) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("failed to initialize interpreter: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = builtins::install(&mut ctx) {
        eprintln!("failed to register builtins: {}", e);
        process::exit(1);
    }
    ctx.set_span_recording(cli.spans);

    match cli.script {
        Some(path) => run_file(&mut ctx, &path),
        None => Repl::new().run(&mut ctx),
    }
}
