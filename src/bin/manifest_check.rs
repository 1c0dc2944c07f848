//! Validates a `requirements.txt`-style pin list.
//!
//! Exits non-zero when any line is malformed or a package is pinned twice
//! to different versions.

use clap::Parser;
use mindmap_pro::manifest::check_manifest;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "manifest-check")]
#[command(about = "Check a dependency pin list for malformed or conflicting pins")]
struct Args {
    /// Path to the pin list
    #[arg(default_value = "requirements.txt")]
    path: PathBuf,

    /// Print every accepted pin
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    let text = std::fs::read_to_string(&args.path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", args.path.display(), e))?;

    match check_manifest(&text) {
        Ok(manifest) => {
            if args.verbose {
                for entry in &manifest.entries {
                    println!("{:>4}  {}=={}", entry.line, entry.name, entry.version);
                }
            }
            println!("{}: {} pins OK", args.path.display(), manifest.len());
            Ok(ExitCode::SUCCESS)
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("{}: {}", args.path.display(), error);
            }
            Ok(ExitCode::FAILURE)
        }
    }
}
