mod config;
mod walk;

use std::fs::File;
use std::path::Path;

use chrono::Utc;
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Table};
use tracing::{debug, info};

use ebakup_core::manifest::FileType;
use ebakup_core::storage::Storage;
use ebakup_core::sync::sync_to_path;
use ebakup_core::verify::verify_storage;
use ebakup_types::error::{EbakupError, Result};
use ebakup_types::name::SnapshotName;

use config::{BackupSet, Config};
use walk::{walk_source, FileKind};

#[derive(Parser)]
#[command(
    name = "ebakup",
    version,
    about = "Checksummed, deduplicating backups into self-verifying storages",
    after_help = "\
Configuration file lookup order:
  1. --config <path>       (explicit flag)
  2. $EBAKUP_CONFIG        (environment variable)
  3. ./ebakup.toml         (project)
  4. ~/.config/ebakup/config.toml (user)"
)]
struct Cli {
    /// Path to configuration file (overrides EBAKUP_CONFIG and the search)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up the configured source trees to a new snapshot
    Backup {
        /// Backup sets to run (all when omitted)
        sets: Vec<String>,
    },

    /// Mirror each set's first storage into the others
    Sync {
        /// Backup sets to sync (all when omitted)
        sets: Vec<String>,
    },

    /// Verify storage integrity and record the results
    Verify {
        /// Backup sets to verify (all when omitted)
        sets: Vec<String>,
    },

    /// Materialize a snapshot as a tree of hard links
    Shadowcopy {
        /// Backup set to read from
        #[arg(short = 'B', long = "backup")]
        set: Option<String>,

        /// Snapshot name (YYYY/MM-DDThh:mm)
        snapshot: String,

        /// Destination directory (must not exist)
        dest: String,
    },

    /// Show storages, snapshots and content counts
    Info {
        /// Backup sets to show (all when omitted)
        sets: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_path = match config::resolve_config_path(cli.config.as_deref()) {
        Some(path) => path,
        None => {
            eprintln!("Error: no configuration file found.");
            eprintln!("Write an ebakup.toml or pass --config.");
            std::process::exit(1);
        }
    };
    debug!(path = %config_path.display(), "using config");

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let result = match &cli.command {
        Commands::Backup { sets } => run_backup(&config, sets),
        Commands::Sync { sets } => run_sync(&config, sets),
        Commands::Verify { sets } => run_verify(&config, sets),
        Commands::Shadowcopy {
            set,
            snapshot,
            dest,
        } => run_shadowcopy(&config, set.as_deref(), snapshot, dest),
        Commands::Info { sets } => run_info(&config, sets),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn open_or_create(path: &Path) -> Result<Storage> {
    if path.join("db").join("main").exists() {
        Storage::open(path)
    } else {
        Storage::create(path)
    }
}

fn run_backup(config: &Config, sets: &[String]) -> Result<()> {
    for set in config.select(sets)? {
        let storage_path = &set.storages[0];
        let mut storage = open_or_create(storage_path)?;
        let start = Utc::now().naive_utc();
        info!(set = %set.name, storage = %storage_path.display(), "starting backup");

        let mut builder = storage.start_snapshot(start)?;
        let mut files: u64 = 0;
        let mut bytes: u64 = 0;
        for source in &set.sources {
            walk_source(source, &mut |file| {
                let (cid, size) = match file.kind {
                    FileKind::Regular => {
                        let mut body = File::open(&file.path)?;
                        (storage.add_content(&mut body)?, file.size)
                    }
                    FileKind::Symlink => {
                        let target = std::fs::read_link(&file.path)?;
                        let target = link_target_bytes(&target);
                        let cid = storage.add_content(&mut &target[..])?;
                        (cid, target.len() as u64)
                    }
                };
                let filetype = match file.kind {
                    FileKind::Regular => FileType::Regular,
                    FileKind::Symlink => FileType::Symlink,
                };
                let extra = match file.mode {
                    Some(mode) => vec![(
                        b"unix-access".to_vec(),
                        format!("{mode:04o}").into_bytes(),
                    )],
                    None => Vec::new(),
                };
                builder.add_file(
                    &file.components,
                    &cid,
                    size,
                    file.mtime,
                    file.mtime_nsec,
                    filetype,
                    &extra,
                )?;
                files += 1;
                bytes += size;
                Ok(())
            })?;
        }
        let name = builder.commit(Utc::now().naive_utc())?;
        println!("{}: snapshot {name} ({files} files, {bytes} bytes)", set.name);
    }
    Ok(())
}

fn link_target_bytes(target: &Path) -> Vec<u8> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        target.as_os_str().as_bytes().to_vec()
    }
    #[cfg(not(unix))]
    {
        target.to_string_lossy().into_owned().into_bytes()
    }
}

fn run_sync(config: &Config, sets: &[String]) -> Result<()> {
    for set in config.select(sets)? {
        let source = Storage::open(&set.storages[0])?;
        for dest in &set.storages[1..] {
            let stats = sync_to_path(&source, dest)?;
            println!(
                "{}: {} -> {}: {} snapshots, {} objects ({} bytes) copied",
                set.name,
                set.storages[0].display(),
                dest.display(),
                stats.snapshots_copied,
                stats.objects_copied,
                stats.bytes_copied,
            );
        }
    }
    Ok(())
}

fn run_verify(config: &Config, sets: &[String]) -> Result<()> {
    let mut clean = true;
    for set in config.select(sets)? {
        for storage_path in &set.storages {
            let storage = Storage::open(storage_path)?;
            let report = verify_storage(&storage, Utc::now().naive_utc())?;
            println!(
                "{}: {}: {} contents, {} snapshots, {} blocks checked, {} errors",
                set.name,
                storage_path.display(),
                report.contents_checked,
                report.snapshots_checked,
                report.blocks_checked,
                report.errors.len(),
            );
            for error in &report.errors {
                println!("  [{}] {}", error.context, error.message);
            }
            clean &= report.is_clean();
        }
    }
    if !clean {
        return Err(EbakupError::Config("verification found problems".into()));
    }
    Ok(())
}

fn run_shadowcopy(
    config: &Config,
    set: Option<&str>,
    snapshot: &str,
    dest: &str,
) -> Result<()> {
    let sets: Vec<&BackupSet> = match set {
        Some(name) => config.select(&[name.to_string()])?,
        None => config.select(&[])?,
    };
    let set = sets
        .first()
        .ok_or_else(|| EbakupError::Config("no backup sets configured".into()))?;
    let storage = Storage::open(&set.storages[0])?;
    let name = SnapshotName::parse(snapshot)?;
    let stats = storage.shadow_copy(&name, Path::new(dest))?;
    println!(
        "{}: shadow copy of {name} at {dest}: {} files, {} symlinks, {} skipped",
        set.name, stats.files, stats.symlinks, stats.skipped,
    );
    Ok(())
}

fn run_info(config: &Config, sets: &[String]) -> Result<()> {
    for set in config.select(sets)? {
        println!("backup set '{}'", set.name);
        for storage_path in &set.storages {
            let storage = match Storage::open(storage_path) {
                Ok(storage) => storage,
                Err(EbakupError::NotFound(_)) => {
                    println!("  {} (not created yet)", storage_path.display());
                    continue;
                }
                Err(e) => return Err(e),
            };
            let contents = storage.content_index().entries()?.count();
            println!(
                "  {} ({}, {} content items)",
                storage_path.display(),
                storage.checksum_algorithm().name(),
                contents,
            );

            let snapshots = storage.snapshots()?;
            if snapshots.is_empty() {
                println!("    no snapshots");
                continue;
            }
            let mut table = Table::new();
            table.load_preset(UTF8_FULL_CONDENSED);
            table.set_header(vec!["Snapshot", "Start", "End", "Files"]);
            for name in &snapshots {
                let manifest = storage.snapshot(name)?;
                table.add_row(vec![
                    name.to_string(),
                    manifest.start_time().format("%Y-%m-%d %H:%M:%S").to_string(),
                    manifest.end_time().format("%Y-%m-%d %H:%M:%S").to_string(),
                    manifest.files().len().to_string(),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}
