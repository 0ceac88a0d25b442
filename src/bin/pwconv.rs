//! Convert a flat-text password file to the canonical JSON database.
//!
//! Honors `COUCHBASE_CBSASL_SECRETS` on both sides, so it can also be
//! used to wrap or unwrap an existing database. `-` designates
//! stdin/stdout.

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Convert a flat password file to the JSON password database")]
struct Args {
    /// Input file in the flat `USER [SP PASSWORD]` format, or `-` for
    /// stdin.
    input: String,
    /// Output file for the JSON database, or `-` for stdout.
    output: String,

    /// PBKDF2 iteration count to use for the generated entries.
    #[arg(long)]
    iteration_count: Option<u32>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Some(count) = args.iteration_count {
        cbsasl::pwdb::set_default_iteration_count(count);
    }

    cbsasl::pwdb::convert_files(&args.input, &args.output)
        .with_context(|| format!("failed to convert [{}] to [{}]", args.input, args.output))
}
