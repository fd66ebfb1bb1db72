//! Command-line front end over the cleaner (component C7): a thin binary so
//! the VHD chain maintenance logic can be run directly against a VM backup
//! directory instead of only being embedded in a larger host application.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use vhdchain::vhd::{VhdFile, VhdInstance};
use vhdchain::{clean_vm, CleanOptions, FsHandler};

#[derive(Parser)]
#[command(name = "vhd-chain", version, about = "VHD backup chain maintenance", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a VM backup directory, reporting (and optionally fixing) broken
    /// VHDs, orphans, stale metadata, and mergeable differencing chains.
    Clean {
        /// Directory containing `vdis/<pool>/<vdi>/*.vhd` and backup metadata.
        vm_dir: PathBuf,

        /// Unlink broken and orphaned VHDs and metadata referencing missing
        /// payloads, instead of only reporting them.
        #[arg(long)]
        remove: bool,

        /// Actually run discovered chain merges.
        #[arg(long)]
        merge: bool,

        /// Rewrite backup-metadata JSON `size` fields that undercount the
        /// actual on-disk payload.
        #[arg(long)]
        fix_metadata: bool,

        /// Upper bound on concurrently running merge chains.
        #[arg(long, default_value_t = 1)]
        merge_limit: usize,
    },
    /// Print a human-readable summary of a single VHD's footer and header.
    Describe {
        /// Path to the VHD file.
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Clean {
            vm_dir,
            remove,
            merge,
            fix_metadata,
            merge_limit,
        } => run_clean(&vm_dir, remove, merge, fix_metadata, merge_limit),
        Commands::Describe { path } => run_describe(&path),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_clean(
    vm_dir: &std::path::Path,
    remove: bool,
    merge: bool,
    fix_metadata: bool,
    merge_limit: usize,
) -> vhdchain::Result<()> {
    let handler = FsHandler;
    let options = CleanOptions {
        remove,
        merge,
        fix_metadata,
        merge_limit,
    };

    let report = clean_vm(&handler, vm_dir, &options, |msg, is_error| {
        if is_error {
            eprintln!("{}", msg);
        } else {
            println!("{}", msg);
        }
    })?;

    println!();
    println!("broken removed:   {}", report.broken_removed.len());
    println!("orphans removed:  {}", report.orphans_removed.len());
    println!("metadata removed: {}", report.metadata_removed.len());
    println!("metadata fixed:   {}", report.metadata_fixed.len());
    println!("chains merged:    {}", report.merged_chains.len());
    println!("bytes coalesced:  {}", report.merged_bytes);
    for chain in &report.merged_chains {
        let rendered: Vec<String> = chain.iter().map(|p| p.display().to_string()).collect();
        println!("  {}", rendered.join(" -> "));
    }

    Ok(())
}

fn run_describe(path: &std::path::Path) -> vhdchain::Result<()> {
    let handler = FsHandler;
    let vhd = VhdFile::open(&handler, path, true)?;
    println!("{}", vhd.footer());
    println!("{}", vhd.header());
    println!("disk type:      {:?}", vhd.disk_type());
    println!("contains block 0: {}", vhd.contains_block(0));
    Ok(())
}
