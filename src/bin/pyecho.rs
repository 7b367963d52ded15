use std::{env, io, process::ExitCode};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pyecho::{ExecutionContext, runner, runtime::DEFAULT_RECURSION_LIMIT};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Run a JSON-encoded Python snippet and echo its last value"
)]
struct Args {
    /// Environment variable holding the JSON-encoded program
    #[arg(long, default_value = "USER_CODE")]
    var: String,
    /// JSON-encoded program, taking precedence over the environment
    #[arg(long)]
    code: Option<String>,
    /// Maximum depth of nested function calls
    #[arg(long, default_value_t = DEFAULT_RECURSION_LIMIT)]
    recursion_limit: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("PYECHO_LOG").unwrap_or_else(|_| EnvFilter::new("off")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let raw = args.code.or_else(|| env::var(&args.var).ok());
    let context = ExecutionContext {
        recursion_limit: args.recursion_limit,
        ..ExecutionContext::default()
    };

    let status = runner::run(
        raw.as_deref(),
        context,
        Box::new(io::stdout()),
        &mut io::stderr(),
    );
    ExitCode::from(status.code())
}
