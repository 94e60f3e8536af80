mod output;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use output::{
    BackupOutput, GcOutput, InitOutput, OutputWriter, PruneOutput, ResolveOutput,
    RootsChangeOutput, RootsListOutput,
};
use snapvault_core::{
    BackupOptions, BackupSource, DEFAULT_DATE_FORMAT, DatePattern, GcOptions, LiveLinkRef,
    PreviousBackup, RetentionPolicy, Rule, Store, StoreConfig,
};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Snapvault - deduplicating backups into a content-addressed store
#[derive(Parser)]
#[command(name = "snapvault")]
#[command(about = "Deduplicating, link-based backups", long_about = None)]
#[command(version)]
struct Cli {
    /// Store root directory (defaults to SNAPVAULT_STORE env var or ./snapvault-store)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log debug output to stderr (RUST_LOG takes precedence)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new store
    Init {
        /// Cache digests of files at least this large, in bytes, or "off"
        #[arg(long, value_parser = parse_threshold)]
        hash_cache_threshold: Option<Threshold>,
    },

    /// Back up one or more sources into a new dated snapshot
    Backup {
        /// Sources, as PATH or ALIAS=PATH
        #[arg(required = true)]
        sources: Vec<BackupSource>,

        /// Destination directory receiving the snapshot
        #[arg(long)]
        dest: PathBuf,

        /// Gitignore-style pattern to exclude (repeatable)
        #[arg(long = "exclude")]
        excludes: Vec<String>,

        /// Number of file-processing threads
        #[arg(long)]
        threads: Option<usize>,

        /// Snapshot to reuse unchanged files from (default: newest in --dest)
        #[arg(long, conflicts_with = "no_previous")]
        previous: Option<PathBuf>,

        /// Hash every file instead of consulting an earlier snapshot
        #[arg(long)]
        no_previous: bool,

        /// Snapshot folder name format
        #[arg(long, default_value = DEFAULT_DATE_FORMAT)]
        date_format: String,
    },

    /// Garbage collect objects no snapshot references
    Gc {
        /// Dry run - show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,

        /// Additional directory to treat as live (repeatable)
        #[arg(long = "live")]
        live: Vec<PathBuf>,
    },

    /// Delete old snapshots according to retention rules
    Prune {
        /// Destination directory holding the snapshots
        dest: PathBuf,

        /// Retention rule COUNT:INTERVAL, e.g. 14:1d (repeatable)
        #[arg(long = "rule", required = true)]
        rules: Vec<Rule>,

        /// Never keep fewer snapshots than this
        #[arg(long, default_value_t = 1)]
        keep_min: usize,

        /// Actually delete; without this flag only the plan is shown
        #[arg(long)]
        enable_delete: bool,

        /// Snapshot folder name format
        #[arg(long, default_value = DEFAULT_DATE_FORMAT)]
        date_format: String,
    },

    /// Show the kind and digest a link or store path refers to
    Resolve {
        /// Live link, store entry or link target
        path: PathBuf,
    },

    /// Manage registered backup destinations (GC roots)
    #[command(subcommand)]
    Roots(RootsCommands),
}

#[derive(Subcommand)]
enum RootsCommands {
    /// Register a destination
    Add {
        /// Destination directory
        path: PathBuf,
    },

    /// List registered destinations
    List,

    /// Unregister a destination
    Rm {
        /// Destination directory
        path: PathBuf,
    },
}

/// Parsed `--hash-cache-threshold` value.
#[derive(Debug, Clone, Copy)]
struct Threshold(Option<u64>);

fn parse_threshold(s: &str) -> std::result::Result<Threshold, String> {
    match s {
        "off" => Ok(Threshold(None)),
        bytes => bytes
            .parse()
            .map(|b| Threshold(Some(b)))
            .map_err(|_| format!("expected a byte count or \"off\", got {}", bytes)),
    }
}

fn init_tracing(verbose: u8) {
    let default = if verbose > 0 { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let output = OutputWriter::new(cli.json);

    // Determine store root: CLI arg > SNAPVAULT_STORE env var > ./snapvault-store default
    let root = cli
        .store
        .or_else(|| std::env::var("SNAPVAULT_STORE").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./snapvault-store"));
    debug!("Using store at {}", root.display());

    let result = match cli.command {
        Commands::Init {
            hash_cache_threshold,
        } => cmd_init(&root, hash_cache_threshold, &output),
        Commands::Backup {
            sources,
            dest,
            excludes,
            threads,
            previous,
            no_previous,
            date_format,
        } => {
            let previous = match (previous, no_previous) {
                (_, true) => PreviousBackup::Disabled,
                (Some(path), false) => PreviousBackup::Path(path),
                (None, false) => PreviousBackup::Auto,
            };
            cmd_backup(
                &root,
                sources,
                dest,
                excludes,
                threads,
                previous,
                &date_format,
                &output,
            )
        }
        Commands::Gc { dry_run, live } => cmd_gc(&root, dry_run, live, &output),
        Commands::Prune {
            dest,
            rules,
            keep_min,
            enable_delete,
            date_format,
        } => cmd_prune(&dest, rules, keep_min, enable_delete, &date_format, &output),
        Commands::Resolve { path } => cmd_resolve(&path, &output),
        Commands::Roots(roots_cmd) => match roots_cmd {
            RootsCommands::Add { path } => cmd_roots_add(&root, &path, &output),
            RootsCommands::List => cmd_roots_list(&root, &output),
            RootsCommands::Rm { path } => cmd_roots_rm(&root, &path, &output),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output.write_error(&e, 1);
            ExitCode::from(1)
        }
    }
}

fn open_store(root: &Path) -> Result<Store> {
    Store::open(root).with_context(|| format!("Failed to open store at {}", root.display()))
}

fn cmd_init(root: &Path, threshold: Option<Threshold>, output: &OutputWriter) -> Result<()> {
    let mut config = StoreConfig::default();
    if let Some(Threshold(threshold)) = threshold {
        config.hash_cache_threshold = threshold;
    }

    let store = Store::init_with_config(root, &config)
        .with_context(|| format!("Failed to initialize store at {}", root.display()))?;

    let data = InitOutput {
        success: true,
        result_code: 0,
        root: store.root().display().to_string(),
        algorithm: "sha1-160".to_string(),
    };
    output.write(&data, || {
        format!(
            "Initialized snapvault store at {}\nAlgorithm: sha1-160\n",
            store.root().display()
        )
    })
}

#[allow(clippy::too_many_arguments)]
fn cmd_backup(
    root: &Path,
    sources: Vec<BackupSource>,
    dest: PathBuf,
    excludes: Vec<String>,
    threads: Option<usize>,
    previous: PreviousBackup,
    date_format: &str,
    output: &OutputWriter,
) -> Result<()> {
    let store = open_store(root)?;

    let mut options = BackupOptions::new(sources, dest);
    options.excludes = excludes;
    options.previous = previous;
    options.date_format = DatePattern::new(date_format)?;
    if let Some(threads) = threads {
        options.threads = threads;
    }

    let report = store.backup(&options).context("Backup failed")?;

    let text = {
        let c = &report.counters;
        let mut text = String::new();
        match &report.root {
            Some(path) => {
                let _ = writeln!(text, "Snapshot: {}", path.display());
            }
            None => text.push_str("Backup cancelled; no snapshot created\n"),
        }
        if let Some(digest) = &report.digest {
            let _ = writeln!(text, "Root: {}", digest);
        }
        let _ = writeln!(
            text,
            "Files: {} ({} new, {} reused from previous, {} cached digests)",
            c.files, c.files_published, c.fast_path_hits, c.cache_hits
        );
        let _ = writeln!(
            text,
            "Directories: {} ({} new)",
            c.directories, c.directories_published
        );
        let _ = writeln!(
            text,
            "Bytes hashed: {}, bytes written: {}",
            c.bytes_hashed, c.bytes_written
        );
        if c.excluded + c.skipped_special > 0 {
            let _ = writeln!(
                text,
                "Skipped: {} excluded, {} special entries",
                c.excluded, c.skipped_special
            );
        }
        if c.private_copies > 0 {
            let _ = writeln!(text, "Private copies (link limit): {}", c.private_copies);
        }
        if c.source_errors + c.missing_sources + c.hash_collisions > 0 {
            let _ = writeln!(
                text,
                "Problems: {} source errors, {} missing sources, {} hash collisions",
                c.source_errors, c.missing_sources, c.hash_collisions
            );
        }
        text
    };

    let data = BackupOutput {
        success: true,
        result_code: 0,
        report,
    };
    output.write(&data, || text)
}

fn cmd_gc(root: &Path, dry_run: bool, live: Vec<PathBuf>, output: &OutputWriter) -> Result<()> {
    let store = open_store(root)?;

    let stats = store
        .gc(&GcOptions {
            dry_run,
            extra_live: live,
        })
        .context("Failed to run garbage collection")?;

    let text = if dry_run {
        format!(
            "Dry run - no objects deleted\nWould delete {} objects\nWould free {} bytes\n",
            stats.objects_deleted, stats.bytes_freed
        )
    } else {
        let mut text = format!(
            "Marked {} objects\nDeleted {} objects\nFreed {} bytes\n",
            stats.objects_marked, stats.objects_deleted, stats.bytes_freed
        );
        if stats.delete_failures > 0 {
            let _ = writeln!(text, "Failed to delete {} objects", stats.delete_failures);
        }
        if stats.dangling > 0 {
            let _ = writeln!(text, "Dangling references: {}", stats.dangling);
        }
        text
    };

    let data = GcOutput {
        success: true,
        result_code: 0,
        dry_run,
        stats,
    };
    output.write(&data, || text)
}

fn cmd_prune(
    dest: &Path,
    rules: Vec<Rule>,
    keep_min: usize,
    enable_delete: bool,
    date_format: &str,
    output: &OutputWriter,
) -> Result<()> {
    let policy = RetentionPolicy::new(rules, keep_min)?;
    let pattern = DatePattern::new(date_format)?;

    let report = snapvault_core::prune(dest, &policy, &pattern, enable_delete)
        .with_context(|| format!("Failed to prune {}", dest.display()))?;

    let text = {
        let mut text = String::new();
        let verb = if enable_delete { "Deleting" } else { "Would delete" };
        for path in &report.planned {
            let _ = writeln!(text, "{} {}", verb, path.display());
        }
        if enable_delete {
            let _ = writeln!(
                text,
                "Deleted {} snapshots ({} failures), kept {}",
                report.deleted, report.failures, report.kept
            );
        } else {
            let _ = writeln!(
                text,
                "Dry run - kept {}; pass --enable-delete to delete",
                report.kept
            );
        }
        text
    };

    let data = PruneOutput {
        success: true,
        result_code: 0,
        report,
    };
    output.write(&data, || text)
}

fn cmd_resolve(path: &Path, output: &OutputWriter) -> Result<()> {
    // A link resolves through its target; anything else is parsed as given.
    let target = std::fs::read_link(path).unwrap_or_else(|_| path.to_path_buf());
    let reference = LiveLinkRef::from(
        snapvault_core::resolve(&target)
            .with_context(|| format!("Cannot resolve {}", path.display()))?,
    );

    let data = ResolveOutput {
        success: true,
        result_code: 0,
        path: path.display().to_string(),
        kind: reference.kind,
        digest: reference.digest,
    };
    output.write(&data, || {
        format!("{} {}\n", reference.kind.as_str(), reference.digest)
    })
}

fn cmd_roots_add(root: &Path, path: &Path, output: &OutputWriter) -> Result<()> {
    let store = open_store(root)?;
    let path = std::fs::canonicalize(path)
        .with_context(|| format!("Destination {} does not exist", path.display()))?;

    store
        .roots()
        .add(&path)
        .with_context(|| format!("Failed to register {}", path.display()))?;

    let data = RootsChangeOutput {
        success: true,
        result_code: 0,
        root: path.display().to_string(),
    };
    output.write(&data, || format!("Registered {}\n", path.display()))
}

fn cmd_roots_list(root: &Path, output: &OutputWriter) -> Result<()> {
    let store = open_store(root)?;

    let roots = store
        .roots()
        .list()
        .context("Failed to list destinations")?;

    let text = if roots.is_empty() {
        "No registered destinations\n".to_string()
    } else {
        roots
            .iter()
            .map(|r| format!("{}\n", r.display()))
            .collect::<String>()
    };

    let data = RootsListOutput {
        success: true,
        result_code: 0,
        roots: roots.iter().map(|r| r.display().to_string()).collect(),
    };
    output.write(&data, || text)
}

fn cmd_roots_rm(root: &Path, path: &Path, output: &OutputWriter) -> Result<()> {
    let store = open_store(root)?;

    // Unregistering must work for destinations that are gone.
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    store
        .roots()
        .remove(&path)
        .with_context(|| format!("Failed to unregister {}", path.display()))?;

    let data = RootsChangeOutput {
        success: true,
        result_code: 0,
        root: path.display().to_string(),
    };
    output.write(&data, || format!("Unregistered {}\n", path.display()))
}
