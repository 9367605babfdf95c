//! salftp - command-line front-end for the FTP client core.
//!
//! Paths are `//user:password@host:port/path` strings, or server paths when
//! `--bookmark` names a saved connection.

use clap::{Parser, Subcommand, ValueEnum};
use salftp_credentials::PasswordManager;
use salftp_ftp::ftp::config::{JsonFileStore, StoredSettings};
use salftp_ftp::ftp::operations::RemoteFileSystem;
use salftp_ftp::ftp::paths::UserPart;
use salftp_ftp::ftp::queue::OperationSummary;
use salftp_ftp::ftp::socket::LoggingUserInterface;
use salftp_ftp::ftp::{
    DataChannelMode, FtpConnectionConfig, FtpContext, FtpError, FtpFileSystem, FtpResult, SecurityMode,
    TransferMode,
};
use salftp_verinfo::{classify, read_script_file, CheckOptions, Filters, InstalledModule, ModuleStatus};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Environment variable read for the master password.
const MASTER_PASSWORD_ENV: &str = "SALFTP_MASTER_PASSWORD";

#[derive(Parser, Debug)]
#[command(author, version, about = "FTP/FTPS client")]
struct Args {
    /// More log output (-vv for protocol traces)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use a saved bookmark; paths are then server paths
    #[arg(short, long, global = true)]
    bookmark: Option<String>,

    /// Directory holding the saved settings
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Use active mode (PORT) instead of passive
    #[arg(long, global = true)]
    active: bool,

    #[arg(long, value_enum, global = true)]
    tls: Option<TlsArg>,

    /// Accept untrusted server certificates
    #[arg(long, global = true)]
    insecure: bool,

    #[arg(long, value_enum, global = true)]
    mode: Option<ModeArg>,

    /// Parallel connections for multi-file operations
    #[arg(short = 'j', long, default_value_t = 1, global = true)]
    workers: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TlsArg {
    None,
    Explicit,
    Implicit,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Binary,
    Ascii,
    Auto,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory
    Ls {
        path: String,
        /// Bypass the listings cache
        #[arg(long)]
        refresh: bool,
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the working directory after changing into a path
    Cd { path: String },
    /// Download a file or directory into a local directory
    Get {
        path: String,
        #[arg(default_value = ".")]
        target: PathBuf,
        /// Delete the source after a complete copy
        #[arg(long = "move")]
        is_move: bool,
    },
    /// Write a remote file to stdout
    Cat { path: String },
    /// Delete a file, or a directory tree with --dir
    Rm {
        path: String,
        #[arg(short, long)]
        dir: bool,
    },
    /// Change the mode of a file (SITE CHMOD)
    Chmod {
        /// Octal mode, e.g. 644
        mode: String,
        path: String,
        #[arg(short = 'R', long)]
        recursive: bool,
    },
    /// List saved bookmarks
    Bookmarks,
    /// Check an update script against installed module versions
    Verinfo {
        script: PathBuf,
        /// Installed module as `file=version`
        #[arg(long = "installed", value_name = "FILE=VERSION")]
        installed: Vec<String>,
        #[arg(long)]
        beta: bool,
        #[arg(long)]
        preview: bool,
        /// Hide a module (`name`) or one version (`name|version`)
        #[arg(long = "filter")]
        filters: Vec<String>,
    },
    /// Print the scrambled form of a password
    Scramble { password: String },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn store(args: &Args) -> FtpResult<JsonFileStore> {
    match &args.config_dir {
        Some(dir) => Ok(JsonFileStore::new(dir)),
        None => JsonFileStore::default_location(),
    }
}

/// Settings with the saved passwords opened.
fn load_settings(args: &Args) -> FtpResult<StoredSettings> {
    let mut settings = StoredSettings::load(&store(args)?)?;
    let mut manager: PasswordManager = settings.password_manager();
    if manager.is_using_master_password() {
        match std::env::var(MASTER_PASSWORD_ENV) {
            Ok(master) => manager.unlock(&master)?,
            Err(_) => {
                log::warn!("{} not set; saved passwords stay locked", MASTER_PASSWORD_ENV);
                return Ok(settings);
            }
        }
    }
    settings.unlock_passwords(&manager)?;
    Ok(settings)
}

fn apply_overrides(args: &Args, cfg: &mut FtpConnectionConfig) {
    if args.active {
        cfg.data_channel_mode = DataChannelMode::Active;
    }
    if let Some(tls) = args.tls {
        cfg.security = match tls {
            TlsArg::None => SecurityMode::None,
            TlsArg::Explicit => SecurityMode::Explicit,
            TlsArg::Implicit => SecurityMode::Implicit,
        };
        if cfg.security == SecurityMode::Implicit && cfg.port == 21 {
            cfg.port = 990;
        }
    }
    if args.insecure {
        cfg.accept_invalid_certs = true;
    }
    if let Some(mode) = args.mode {
        cfg.transfer_mode = match mode {
            ModeArg::Binary => TransferMode::Binary,
            ModeArg::Ascii => TransferMode::Ascii,
            ModeArg::Auto => TransferMode::Auto,
        };
    }
}

struct Session {
    fs: FtpFileSystem,
    /// Prefix turning a server path into a user-part path.
    base: Option<String>,
}

impl Session {
    fn open(args: &Args) -> FtpResult<Self> {
        let settings = load_settings(args)?;
        let ctx = FtpContext::new(settings.config.clone())?;
        let mut template = match &args.bookmark {
            Some(name) => {
                let bookmark = settings
                    .bookmark(name)
                    .ok_or_else(|| FtpError::not_found(format!("No bookmark named {}", name)))?;
                settings.connection_config(bookmark)?
            }
            None => ctx.config().connection_defaults(""),
        };
        apply_overrides(args, &mut template);
        let base = args.bookmark.as_ref().map(|_| {
            let part = UserPart {
                user: Some(template.user.clone()),
                password: None,
                host: template.host.clone(),
                port: Some(template.port),
                path: None,
            };
            part.to_display_string().trim_end_matches('/').to_string()
        });
        let mut fs = FtpFileSystem::with_template(ctx, template);
        fs.set_user_interface(Arc::new(LoggingUserInterface));
        fs.set_max_workers(args.workers);
        Ok(Self { fs, base })
    }

    fn url(&self, path: &str) -> String {
        match &self.base {
            Some(base) => format!("{}/{}", base, path.trim_start_matches('/')),
            None => path.to_string(),
        }
    }
}

fn report(summary: &OperationSummary) -> FtpResult<()> {
    println!(
        "{} done, {} skipped, {} failed ({} bytes)",
        summary.done, summary.skipped, summary.failed, summary.transferred
    );
    if summary.failed > 0 {
        return Err(FtpError::transfer_failed(format!("{} item(s) failed", summary.failed)));
    }
    Ok(())
}

async fn run_remote(args: &Args, cancel: &CancellationToken) -> FtpResult<()> {
    let mut session = Session::open(args)?;
    let result = match &args.command {
        Command::Ls { path, refresh, json } => {
            let listing = session
                .fs
                .list_current_path(&session.url(path), *refresh, cancel)
                .await?;
            match (&listing.entries, *json) {
                (Some(entries), true) => {
                    let text = serde_json::to_string_pretty(entries)
                        .map_err(|e| FtpError::protocol_error(e.to_string()))?;
                    println!("{}", text);
                }
                (Some(entries), false) => {
                    for e in entries {
                        let kind = if e.is_dir() { 'd' } else { '-' };
                        println!("{} {:>12} {} {}", kind, e.size, e.modified().format("%Y-%m-%d %H:%M"), e.name);
                    }
                }
                (None, _) => {
                    log::warn!("Listing could not be parsed; showing it raw");
                    print!("{}", String::from_utf8_lossy(&listing.raw));
                }
            }
            if listing.incomplete {
                log::warn!("The listing is incomplete");
            }
            Ok(())
        }
        Command::Cd { path } => {
            let now = session.fs.change_path(&session.url(path), cancel).await?;
            println!("{}", now);
            Ok(())
        }
        Command::Get { path, target, is_move } => {
            let summary = session
                .fs
                .copy_or_move_from_fs(&session.url(path), target, *is_move, cancel)
                .await?;
            report(&summary)
        }
        Command::Cat { path } => {
            use std::io::Write;
            let data = session.fs.view_file(&session.url(path), cancel).await?;
            std::io::stdout().write_all(&data)?;
            Ok(())
        }
        Command::Rm { path, dir } => {
            let summary = session.fs.delete(&session.url(path), *dir, cancel).await?;
            report(&summary)
        }
        Command::Chmod { mode, path, recursive } => {
            let mode = u32::from_str_radix(mode, 8)
                .map_err(|_| FtpError::invalid_config(format!("Invalid octal mode: {}", mode)))?;
            let summary = session
                .fs
                .change_attributes(&session.url(path), mode, *recursive, cancel)
                .await?;
            report(&summary)
        }
        Command::Bookmarks | Command::Verinfo { .. } | Command::Scramble { .. } => Ok(()),
    };
    if let Err(e) = session.fs.disconnect().await {
        log::debug!("Disconnect failed: {}", e);
    }
    result
}

fn list_bookmarks(args: &Args) -> FtpResult<()> {
    let settings = StoredSettings::load(&store(args)?)?;
    for b in &settings.bookmarks {
        println!(
            "{}\t{}@{}:{}{}",
            b.name,
            if b.user.is_empty() { "anonymous" } else { &b.user },
            b.host,
            b.port.unwrap_or(21),
            b.initial_path.as_deref().unwrap_or("/")
        );
    }
    Ok(())
}

fn check_updates(
    script: &Path,
    installed: &[String],
    beta: bool,
    preview: bool,
    filter_items: &[String],
) -> Result<bool, String> {
    let modules = read_script_file(script).map_err(|e| e.to_string())?;
    let installed: Vec<InstalledModule> = installed
        .iter()
        .map(|item| {
            item.split_once('=')
                .map(|(m, v)| InstalledModule::new(m, v))
                .ok_or_else(|| format!("Expected FILE=VERSION, got {}", item))
        })
        .collect::<Result<_, _>>()?;
    let options = CheckOptions {
        check_beta: beta,
        check_preview: preview,
        ..CheckOptions::default()
    };
    let mut filters = Filters::default();
    for f in filter_items {
        filters.add(f.as_str());
    }
    let report = classify(&modules, &installed, &options, &filters);
    for (m, status) in modules.iter().zip(&report.statuses) {
        let label = match status {
            ModuleStatus::NewRelease => "new release",
            ModuleStatus::NewBeta => "new beta",
            ModuleStatus::NewPreview => "new preview build",
            ModuleStatus::Filtered => continue,
            ModuleStatus::Installed => "installed",
        };
        println!("{:<24} {:<24} {}", m.name, m.version, label);
        if *status != ModuleStatus::Installed {
            println!("    {}", m.url);
            for info in &m.infos {
                println!("    {}", info);
            }
        }
    }
    Ok(report.found_new())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match &args.command {
        Command::Bookmarks => {
            return match list_bookmarks(&args) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("salftp: {}", e.message);
                    ExitCode::FAILURE
                }
            };
        }
        Command::Verinfo {
            script,
            installed,
            beta,
            preview,
            filters,
        } => {
            return match check_updates(script, installed, *beta, *preview, filters) {
                Ok(true) => ExitCode::SUCCESS,
                // nothing new
                Ok(false) => ExitCode::from(2),
                Err(e) => {
                    eprintln!("salftp: {}", e);
                    ExitCode::FAILURE
                }
            };
        }
        Command::Scramble { password } => {
            return match PasswordManager::new(None).encrypt_password(password, false) {
                Ok(enc) => {
                    println!("{}", enc.to_base64());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("salftp: {}", e);
                    ExitCode::FAILURE
                }
            };
        }
        _ => {}
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    match run_remote(&args, &cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.code {
                Some(code) => eprintln!("salftp: {} {}", code, e.message),
                None => eprintln!("salftp: {}", e.message),
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let args = tokio_test::assert_ok!(Args::try_parse_from([
            "salftp", "rm", "//h/x", "--dir", "--tls", "implicit", "-vv"
        ]));
        assert_eq!(args.verbose, 2);
        assert!(matches!(args.tls, Some(TlsArg::Implicit)));
        assert!(matches!(args.command, Command::Rm { dir: true, .. }));
    }

    #[test]
    fn implicit_tls_moves_default_port() {
        let args = Args::try_parse_from(["salftp", "--tls", "implicit", "--active", "cat", "//h/x"]).unwrap();
        let mut cfg = FtpConnectionConfig::new("h");
        apply_overrides(&args, &mut cfg);
        assert_eq!(cfg.port, 990);
        assert_eq!(cfg.security, SecurityMode::Implicit);
        assert_eq!(cfg.data_channel_mode, DataChannelMode::Active);
    }

    #[tokio::test]
    async fn bookmark_paths_become_user_part_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let mut settings = StoredSettings::default();
        let mut bookmark = salftp_ftp::ftp::config::Bookmark::new("work", "ftp.example.org");
        bookmark.user = "bob".into();
        settings.bookmarks.push(bookmark);
        settings.save(&store).unwrap();

        let args = Args::try_parse_from([
            "salftp",
            "--config-dir",
            dir.path().to_str().unwrap(),
            "--bookmark",
            "work",
            "ls",
            "/pub",
        ])
        .unwrap();
        let session = Session::open(&args).unwrap();
        assert_eq!(session.url("/pub"), "//bob@ftp.example.org/pub");
    }
}
