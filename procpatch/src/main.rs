use std::path::PathBuf;

use clap::{Parser, Subcommand};

use procpatch::config;

#[derive(Debug, Parser)]
#[command(name = "procpatch", about = "Live binary patching of running processes")]
struct Cli {
    /// Directory holding procpatch_config.json; created with defaults when
    /// missing.
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply a patch to a running process.
    Patch {
        pid: i32,
        patchfile: PathBuf,
        /// Validate everything, write nothing.
        #[arg(long)]
        dry_run: bool,
        /// Never inject the helper service; all transfers use ptrace.
        #[arg(long)]
        no_service: bool,
    },
    /// Revert a previously applied patch.
    Unpatch {
        pid: i32,
        patchfile: PathBuf,
        /// Only report whether the patch could be reverted.
        #[arg(long)]
        dry_run: bool,
    },
    /// Check whether a patch is applied.
    Check { pid: i32, patchfile: PathBuf },
    /// List the patches applied to a process.
    List { pid: i32 },
}

fn main() {
    let cli = Cli::parse();

    let cfg = match load_or_create_config(&cli.config_dir) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(libc::EINVAL);
        }
    };
    procpatch::init_logging(cfg.level_filter());

    let result = match cli.command {
        Command::Patch {
            pid,
            patchfile,
            dry_run,
            no_service,
        } => procpatch::patch_process(&cfg, pid, &patchfile, dry_run, no_service),
        Command::Unpatch {
            pid,
            patchfile,
            dry_run,
        } => procpatch::unpatch_process(&cfg, pid, &patchfile, dry_run),
        Command::Check { pid, patchfile } => procpatch::check_process(&cfg, pid, &patchfile),
        Command::List { pid } => procpatch::list_process_patches(&cfg, pid),
    };

    if let Err(err) = result {
        log::error!("{err}");
        std::process::exit(err.code());
    }
}

fn load_or_create_config(dir: &PathBuf) -> anyhow::Result<config::PatcherConfig> {
    config::create_initial_config(dir)?;
    config::load_config(dir)
}
