//! # rekkord
//!
//! A deduplicating, encrypted, content-addressed backup engine: directory
//! trees are stored as immutable, chunked, encrypted blobs in a pluggable
//! object store (local filesystem, S3-compatible bucket, or SFTP path), and
//! can be restored, browsed, or scheduled for backup through this CLI.
//!
//! Command set follows the upstream tool's grouping (management, snapshot,
//! exploration, agent, advanced), kept in one flat `main.rs` with a
//! `Cli`/`Command`/`run`/`cmd_*` shape.

mod agent;
mod blobstore;
mod cache;
mod chunker;
mod codec;
mod config;
mod error;
mod keys;
mod logging;
mod oid;
mod repo;
mod restore;
mod save;
mod store;
mod tree;
mod view;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use log::LevelFilter;

use config::{Config, RepositoryUrl};
use error::{Error, Result};
use keys::{KeyRole, KeySet};
use oid::Oid;
use repo::Repository;
use view::{ObjectKind, RepositoryView};

#[derive(Parser, Debug)]
#[command(
    name = "rekkord",
    version,
    about = "A deduplicating, encrypted, content-addressed backup engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (overrides the default search path)
    #[arg(short = 'C', long = "config", global = true)]
    config_file: Option<PathBuf>,

    /// Skip existing configuration files; requires --repository
    #[arg(long, global = true)]
    no_config: bool,

    /// Repository URL (file://, s3:, ssh://)
    #[arg(short = 'R', long, global = true)]
    repository: Option<String>,

    /// File containing repository keys
    #[arg(short = 'K', long = "key_file", global = true)]
    key_file: Option<PathBuf>,

    /// Passphrase protecting --key_file (or set REKKORD_PASSPHRASE)
    #[arg(long, global = true)]
    passphrase: Option<String>,

    /// Number of worker threads (default: automatic)
    #[arg(short = 'j', long, global = true)]
    threads: Option<usize>,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run simple wizard to create basic config file
    Setup {
        /// Where to write the generated config file
        #[arg(long, default_value = "rekkord.ini")]
        output: PathBuf,
        /// Local directory to use as the repository
        repository: PathBuf,
    },

    /// Init new backup repository
    Init {
        /// Where to write the generated master key file
        #[arg(long = "key_file")]
        out_key_file: PathBuf,
    },

    /// Derive restricted key file from master key
    Derive {
        #[arg(value_enum)]
        role: CliKeyRole,
        /// Destination for the derived key file
        output: PathBuf,
        /// Passphrase to protect the derived key file (default: raw-sealed)
        #[arg(long)]
        out_passphrase: Option<String>,
    },

    /// Get information about a key file
    Identify,

    /// Store directory or file and make a snapshot
    Save {
        channel: String,
        paths: Vec<PathBuf>,
        /// Store the tree without recording a snapshot/channel entry
        #[arg(long)]
        no_snapshot: bool,
        /// Re-hash and re-chunk every file even if metadata looks unchanged
        #[arg(long)]
        rehash: bool,
        #[arg(long)]
        follow_symlinks: bool,
        #[arg(long)]
        atime: bool,
        #[arg(long)]
        xattrs: bool,
        /// Disable skip_unchanged reuse against the previous snapshot
        #[arg(long)]
        full: bool,
    },

    /// Restore snapshot, directory or file
    Restore {
        /// `<channel|hex-oid>[:<path>]`
        identifier: String,
        destination: PathBuf,
        #[arg(short, long)]
        force: bool,
        #[arg(long)]
        unlink_extras: bool,
        #[arg(long)]
        chown: bool,
        #[arg(long)]
        no_xattrs: bool,
        #[arg(long)]
        dry_run: bool,
    },

    /// Check snapshots and blobs
    Scan {
        /// Restrict the scan to one channel (default: every channel)
        channel: Option<String>,
    },

    /// List known snapshots
    Snapshots {
        channel: Option<String>,
    },

    /// Show status of snapshot channels
    Channels,

    /// List snapshot or directory children
    List {
        /// `<channel|hex-oid>[:<path>]`
        identifier: String,
        /// How many levels deep to recurse (0: immediate children only)
        #[arg(long, default_value_t = 0)]
        depth: usize,
    },

    /// Mount repository readonly as user filesystem
    Mount {
        mountpoint: PathBuf,
    },

    /// Run cloud-connected automated agent
    Agent {
        /// Seconds between schedule ticks (default: 3600)
        #[arg(long)]
        period_secs: Option<u64>,
    },

    /// Change repository cache ID (CID)
    ChangeCid,

    /// Reset or rebuild local repository cache
    ResetCache {
        #[arg(long)]
        rebuild: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliKeyRole {
    Full,
    Write,
    Log,
    Config,
}

impl From<CliKeyRole> for KeyRole {
    fn from(role: CliKeyRole) -> Self {
        match role {
            CliKeyRole::Full => KeyRole::Full,
            CliKeyRole::Write => KeyRole::Write,
            CliKeyRole::Log => KeyRole::Log,
            CliKeyRole::Config => KeyRole::Config,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    if let Err(e) = run(cli) {
        eprintln!("{} {e}", "error:".red().bold());
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Setup { output, repository } => cmd_setup(output, repository),
        Command::Init { out_key_file } => cmd_init(&cli, out_key_file),
        Command::Derive {
            role,
            output,
            out_passphrase,
        } => cmd_derive(&cli, (*role).into(), output, out_passphrase.as_deref()),
        Command::Identify => cmd_identify(&cli),
        Command::Save {
            channel,
            paths,
            no_snapshot,
            rehash,
            follow_symlinks,
            atime,
            xattrs,
            full,
        } => cmd_save(
            &cli,
            channel,
            paths,
            *no_snapshot,
            *rehash,
            *follow_symlinks,
            *atime,
            *xattrs,
            *full,
        ),
        Command::Restore {
            identifier,
            destination,
            force,
            unlink_extras,
            chown,
            no_xattrs,
            dry_run,
        } => cmd_restore(
            &cli,
            identifier,
            destination,
            *force,
            *unlink_extras,
            *chown,
            *no_xattrs,
            *dry_run,
        ),
        Command::Scan { channel } => cmd_scan(&cli, channel.as_deref()),
        Command::Snapshots { channel } => cmd_snapshots(&cli, channel.as_deref()),
        Command::Channels => cmd_channels(&cli),
        Command::List { identifier, depth } => cmd_list(&cli, identifier, *depth),
        Command::Mount { mountpoint } => cmd_mount(mountpoint),
        Command::Agent { period_secs } => cmd_agent(&cli, *period_secs),
        Command::ChangeCid => cmd_change_cid(&cli),
        Command::ResetCache { rebuild } => cmd_reset_cache(&cli, *rebuild),
    }
}

// ─── Management commands ────────────────────────────────────────────────

fn cmd_setup(output: &Path, repository: &Path) -> Result<()> {
    config::init_config(output, repository)?;
    eprintln!(
        "{} wrote configuration to {}",
        "✓".green().bold(),
        output.display()
    );
    eprintln!("  add [S3]/[SFTP]/[Link] sections if needed, then run:");
    eprintln!(
        "  {} rekkord -C {} init --key_file master.rk",
        "$".bold(),
        output.display()
    );
    Ok(())
}

fn cmd_init(cli: &Cli, out_key_file: &Path) -> Result<()> {
    let config = load_config(cli)?;
    let store = repo::open_store(&config)?;

    let master = KeySet::init_master();
    Repository::init(store, &master, config.chunker)?;

    let sealed = master.export_key_file(passphrase(cli).as_deref())?;
    if let Some(parent) = out_key_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(out_key_file, sealed)?;

    eprintln!("{} repository initialized", "✓".green().bold());
    eprintln!("  master key written to {}", out_key_file.display());
    eprintln!("  keep this file safe; it is the only copy of the master key");
    Ok(())
}

fn cmd_derive(
    cli: &Cli,
    role: KeyRole,
    output: &Path,
    out_passphrase: Option<&str>,
) -> Result<()> {
    let config = load_config(cli)?;
    let source = load_keys(cli, &config)?;
    if source.role() != KeyRole::Master {
        return Err(Error::Config(
            "deriving a restricted key requires a master key file".into(),
        ));
    }

    let derived = source.derive(role);
    let sealed = derived.export_key_file(out_passphrase)?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, sealed)?;

    eprintln!(
        "{} wrote {role} key to {}",
        "✓".green().bold(),
        output.display()
    );
    Ok(())
}

fn cmd_identify(cli: &Cli) -> Result<()> {
    let path = resolve_key_file_path(cli)?;
    let bytes = std::fs::read(&path)
        .map_err(|e| Error::Config(format!("reading key file {}: {e}", path.display())))?;
    let (role, kid) = KeySet::inspect_key_file(&bytes)?;

    println!("role: {role}");
    println!("kid:  {}", hex::encode(kid));
    Ok(())
}

// ─── Snapshot commands ──────────────────────────────────────────────────

fn cmd_save(
    cli: &Cli,
    channel: &str,
    paths: &[PathBuf],
    no_snapshot: bool,
    rehash: bool,
    follow_symlinks: bool,
    atime: bool,
    xattrs: bool,
    full: bool,
) -> Result<()> {
    if paths.is_empty() {
        return Err(Error::Config("save requires at least one path".into()));
    }

    let config = load_config(cli)?;
    let repo = open_repo(cli, &config)?;

    let settings = save::SaveSettings {
        skip_unchanged: !full,
        rehash,
        follow_symlinks,
        atime,
        xattrs,
        no_snapshot,
    };

    let engine = save::SaveEngine::new(&repo.blobs, repo.chunker);
    let previous = repo
        .current_snapshot(channel)?
        .map(|entry| engine.flatten_previous(entry.oid))
        .transpose()?;

    eprintln!(
        "{} saving {} path(s) to channel '{channel}'",
        "▶".cyan().bold(),
        paths.len()
    );
    let outcome = engine.save(channel, paths, &settings, previous.as_ref())?;

    if let Some(snapshot_oid) = outcome.snapshot {
        repo.append_channel_entry(channel, now_ms(), snapshot_oid)?;
        println!("snapshot: {snapshot_oid}");
    } else {
        println!("root: {}", outcome.root);
    }

    eprintln!(
        "  {} files, {} source, {} stored, {} added, {}ms",
        outcome.stats.files,
        format_size(outcome.stats.source_size),
        format_size(outcome.stats.stored_size),
        format_size(outcome.stats.added_size),
        outcome.stats.duration_ms,
    );

    for error in &outcome.errors {
        eprintln!("  {} {}: {}", "✗".red(), error.path.display(), error.message);
    }

    if !outcome.errors.is_empty() {
        return Err(Error::Other(anyhow::anyhow!(
            "{} path(s) failed to save",
            outcome.errors.len()
        )));
    }
    Ok(())
}

fn cmd_restore(
    cli: &Cli,
    identifier: &str,
    destination: &Path,
    force: bool,
    unlink_extras: bool,
    chown: bool,
    no_xattrs: bool,
    dry_run: bool,
) -> Result<()> {
    let config = load_config(cli)?;
    let repo = open_repo(cli, &config)?;
    let view = RepositoryView::new(&repo);
    let (oid, kind) = view.locate_with_kind(identifier)?;

    let settings = restore::RestoreSettings {
        force,
        unlink_extras,
        chown,
        xattrs: !no_xattrs,
        verbose: cli.verbose,
        dry_run,
    };

    eprintln!(
        "{} restoring {identifier} to {}",
        "▶".cyan().bold(),
        destination.display()
    );
    let engine = restore::RestoreEngine::new(&repo.blobs);
    let outcome = engine.restore(oid, kind, destination, &settings)?;

    eprintln!(
        "  {} files, {} dirs, {} links, {}",
        outcome.stats.files,
        outcome.stats.dirs,
        outcome.stats.links,
        format_size(outcome.stats.bytes),
    );
    for error in &outcome.errors {
        eprintln!("  {} {}: {}", "✗".red(), error.path.display(), error.message);
    }

    if !outcome.errors.is_empty() {
        return Err(Error::Other(anyhow::anyhow!(
            "{} entries failed to restore",
            outcome.errors.len()
        )));
    }
    Ok(())
}

fn cmd_scan(cli: &Cli, channel: Option<&str>) -> Result<()> {
    let config = load_config(cli)?;
    let repo = open_repo(cli, &config)?;

    let snapshots: Vec<(String, repo::ChannelEntry)> = match channel {
        Some(name) => repo
            .list_channel_entries(name)?
            .into_iter()
            .map(|entry| (name.to_string(), entry))
            .collect(),
        None => {
            let mut all = Vec::new();
            for name in repo.list_channels()? {
                for entry in repo.list_channel_entries(&name)? {
                    all.push((name.clone(), entry));
                }
            }
            all
        }
    };

    if snapshots.is_empty() {
        eprintln!("no snapshots to scan");
        return Ok(());
    }

    let mut ok = 0u64;
    let mut corrupt = Vec::new();
    for (name, entry) in &snapshots {
        eprintln!("{} scanning {name}@{}", "▶".cyan().bold(), entry.oid);
        scan_object(&repo, entry.oid, ObjectKind::Snapshot, &mut ok, &mut corrupt);
    }

    for (oid, message) in &corrupt {
        eprintln!("  {} {oid}: {message}", "✗".red());
    }
    eprintln!("  {ok} blob(s) verified, {} corrupt", corrupt.len());

    if !corrupt.is_empty() {
        return Err(Error::Other(anyhow::anyhow!(
            "{} corrupt blob(s) found",
            corrupt.len()
        )));
    }
    Ok(())
}

/// Recursively decodes every blob reachable from `oid`, recording a
/// `CorruptBlob` entry for each one whose recomputed hash mismatches rather
/// than aborting the walk, so a single flipped bit identifies one OID
/// without hiding the rest of the tree's verification result.
fn scan_object(
    repo: &Repository,
    oid: Oid,
    kind: ObjectKind,
    ok: &mut u64,
    corrupt: &mut Vec<(Oid, String)>,
) {
    if kind == ObjectKind::Absent {
        // Recorded as absent by the save that produced it; no blob exists
        // to fetch, and that is not itself a sign of corruption.
        return;
    }

    let blob_kind = match kind {
        ObjectKind::Snapshot => codec::BlobKind::Snapshot,
        ObjectKind::Dir => codec::BlobKind::Dir,
        ObjectKind::File => codec::BlobKind::FileIndex,
        ObjectKind::Link => codec::BlobKind::Link,
        ObjectKind::Absent => unreachable!("handled above"),
    };

    let bytes = match repo.blobs.get_blob(&oid, blob_kind) {
        Ok(bytes) => bytes,
        Err(e) => {
            corrupt.push((oid, e.to_string()));
            return;
        }
    };
    *ok += 1;

    match kind {
        ObjectKind::Snapshot => {
            if let Ok(snapshot) = tree::decode_snapshot(&bytes) {
                scan_object(repo, snapshot.root, ObjectKind::Dir, ok, corrupt);
            }
        }
        ObjectKind::Dir => {
            if let Ok(dir) = tree::decode_dir(&bytes) {
                for entry in dir.entries {
                    let child_kind = match entry.kind {
                        tree::EntryKind::Dir => ObjectKind::Dir,
                        tree::EntryKind::File => ObjectKind::File,
                        tree::EntryKind::Link => ObjectKind::Link,
                        tree::EntryKind::Snapshot => ObjectKind::Snapshot,
                        tree::EntryKind::Absent => ObjectKind::Absent,
                    };
                    scan_object(repo, entry.child, child_kind, ok, corrupt);
                }
            }
        }
        ObjectKind::File => {
            if let Ok(index) = tree::decode_file_index(&bytes) {
                for chunk in index.chunks {
                    match repo.blobs.get_blob(&chunk.oid, codec::BlobKind::Chunk) {
                        Ok(_) => *ok += 1,
                        Err(e) => corrupt.push((chunk.oid, e.to_string())),
                    }
                }
            }
        }
        ObjectKind::Link => {}
    }
}

// ─── Exploration commands ───────────────────────────────────────────────

fn cmd_snapshots(cli: &Cli, channel: Option<&str>) -> Result<()> {
    let config = load_config(cli)?;
    let repo = open_repo(cli, &config)?;
    let view = RepositoryView::new(&repo);

    let snapshots: Vec<_> = view
        .list_snapshots()?
        .into_iter()
        .filter(|s| channel.map_or(true, |c| s.channel == c))
        .collect();

    if snapshots.is_empty() {
        eprintln!("no snapshots found");
        return Ok(());
    }

    println!("{:<20}  {:<19}  oid", "channel", "time");
    for snap in &snapshots {
        println!(
            "{:<20}  {:<19}  {}",
            snap.channel,
            format_time(snap.time_ms),
            snap.oid
        );
    }
    eprintln!();
    eprintln!("  {} snapshot(s)", snapshots.len());
    Ok(())
}

fn cmd_channels(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let repo = open_repo(cli, &config)?;
    let view = RepositoryView::new(&repo);

    let channels = view.list_channels()?;
    if channels.is_empty() {
        eprintln!("no channels found");
        return Ok(());
    }

    for channel in &channels {
        match &channel.latest {
            Some(snap) => println!(
                "{:<20}  {:<19}  {}",
                channel.name,
                format_time(snap.time_ms),
                snap.oid
            ),
            None => println!("{:<20}  (no snapshots)", channel.name),
        }
    }
    Ok(())
}

fn cmd_list(cli: &Cli, identifier: &str, depth: usize) -> Result<()> {
    let config = load_config(cli)?;
    let repo = open_repo(cli, &config)?;
    let view = RepositoryView::new(&repo);

    let (oid, kind) = view.locate_with_kind(identifier)?;
    if matches!(kind, ObjectKind::File | ObjectKind::Link) {
        println!("{identifier}  {oid}");
        return Ok(());
    }

    for child in view.list_children(oid, depth)? {
        let indent = "  ".repeat(child.depth);
        let marker = match child.kind {
            ObjectKind::Dir => "/",
            ObjectKind::Snapshot => "@",
            ObjectKind::Absent => " (absent)",
            _ => "",
        };
        let size = child.size.map(format_size).unwrap_or_default();
        println!("{indent}{}{marker}  {size}", child.name);
    }
    Ok(())
}

fn cmd_mount(mountpoint: &Path) -> Result<()> {
    let _ = mountpoint;
    Err(Error::Other(anyhow::anyhow!(
        "mount is not supported by this build (the read-only FUSE adapter is out of scope)"
    )))
}

// ─── Agent commands ─────────────────────────────────────────────────────

fn cmd_agent(cli: &Cli, period_secs: Option<u64>) -> Result<()> {
    let config = load_config(cli)?;
    let link = config.link.clone().ok_or_else(|| {
        Error::Config("agent requires a [Link] section (Url + ApiKey)".into())
    })?;
    let repo = open_repo(cli, &config)?;

    let mut settings = agent::AgentSettings {
        repository_label: repository_label(&config),
        ..agent::AgentSettings::default()
    };
    if let Some(secs) = period_secs {
        settings.period = std::time::Duration::from_secs(secs);
    }

    eprintln!("{} agent starting, polling {}", "▶".cyan().bold(), link.url);
    let agent_loop = agent::AgentLoop::new(&repo, link, settings);
    agent_loop.run()
}

fn repository_label(config: &Config) -> String {
    match &config.repository {
        RepositoryUrl::Local(path) => format!("file://{}", path.display()),
        RepositoryUrl::S3(rest) => format!("s3:{rest}"),
        RepositoryUrl::Sftp(url) => url.clone(),
    }
}

// ─── Advanced commands ───────────────────────────────────────────────────

fn cmd_change_cid(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let repo = open_repo(cli, &config)?;
    let new_cid = repo.change_cid()?;
    eprintln!(
        "{} repository cache id changed to {}",
        "✓".green().bold(),
        new_cid.to_hex()
    );
    Ok(())
}

fn cmd_reset_cache(cli: &Cli, rebuild: bool) -> Result<()> {
    let config = load_config(cli)?;
    let repo = open_repo(cli, &config)?;
    repo.reset_cache(rebuild)?;
    eprintln!("{} local cache reset", "✓".green().bold());
    Ok(())
}

// ─── Helpers ─────────────────────────────────────────────────────────────

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if cli.no_config {
        let url = cli
            .repository
            .as_ref()
            .ok_or_else(|| Error::Config("--no_config requires --repository".into()))?;
        Config {
            repository: RepositoryUrl::parse(url)?,
            threads: None,
            chunker: chunker::ChunkerParams::default(),
            s3: None,
            sftp: None,
            key_file: None,
            link: None,
        }
    } else if let Some(path) = &cli.config_file {
        config::load_config_from(path)?
    } else {
        config::load_config()?
    };

    if let Some(url) = &cli.repository {
        config.repository = RepositoryUrl::parse(url)?;
    }
    if let Some(threads) = cli.threads {
        config.threads = Some(threads);
    }
    if let Some(key_file) = &cli.key_file {
        config.key_file = Some(key_file.clone());
    }
    Ok(config)
}

fn passphrase(cli: &Cli) -> Option<String> {
    cli.passphrase
        .clone()
        .or_else(|| std::env::var("REKKORD_PASSPHRASE").ok())
}

fn resolve_key_file_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = &cli.key_file {
        return Ok(path.clone());
    }
    load_config(cli)?
        .key_file
        .ok_or_else(|| Error::Config("no key file configured; pass --key_file".into()))
}

fn load_keys(cli: &Cli, config: &Config) -> Result<KeySet> {
    let path = cli
        .key_file
        .clone()
        .or_else(|| config.key_file.clone())
        .ok_or_else(|| {
            Error::Config("no key file configured; pass --key_file or set [Protection] KeyFile".into())
        })?;
    let bytes = std::fs::read(&path)
        .map_err(|e| Error::Config(format!("reading key file {}: {e}", path.display())))?;
    KeySet::import_key_file(&bytes, passphrase(cli).as_deref())
}

fn open_repo(cli: &Cli, config: &Config) -> Result<Repository> {
    let keys = load_keys(cli, config)?;
    let store = repo::open_store(config)?;
    Repository::open(config, store, keys)
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn format_time(time_ms: i64) -> String {
    use chrono::TimeZone;
    chrono::Utc
        .timestamp_millis_opt(time_ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| time_ms.to_string())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
