use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bunkit::util::{CancelFlag, format_size};
use bunkit::{DownloadProgress, InstallDirectory, Installer, Result, Runtime, Version};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

#[derive(Parser, Debug)]
#[command(
    name = "bunkit",
    author,
    version,
    about = "Installs, tracks and launches local Bun runtimes"
)]
struct Cli {
    /// Log engine activity at debug level.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct RootArgs {
    /// Base directory for installs; defaults to BUNKIT_HOME or the per-user data dir.
    #[arg(short = 'p', long = "path")]
    path: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install the runtime if needed and run it with the given arguments.
    Run {
        /// Version to run, e.g. 1.3.6 or bun-v1.3.6; defaults to the latest.
        #[arg(short = 'v', long = "version")]
        version: Option<String>,

        #[command(flatten)]
        root: RootArgs,

        /// Hide download progress.
        #[arg(long)]
        silent: bool,

        /// Arguments passed to the runtime unchanged.
        #[arg(last = true)]
        args: Vec<OsString>,
    },
    /// Install the newest published release.
    Upgrade {
        #[command(flatten)]
        root: RootArgs,
    },
    /// List installed versions.
    Versions {
        #[command(flatten)]
        root: RootArgs,
    },
    /// Remove every installed version except the newest.
    Cleanup {
        #[command(flatten)]
        root: RootArgs,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received, cancelling");
            on_interrupt.store(true, Ordering::SeqCst);
        }
    });

    match execute(cli.command, &cancel).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            if err.is_lock_timeout() {
                eprintln!("another bunkit process is installing into the same directory; try again later");
            }
            err.exit_code()
        }
    }
}

async fn execute(command: Command, cancel: &CancelFlag) -> Result<ExitCode> {
    match command {
        Command::Run {
            version,
            root,
            silent,
            args,
        } => {
            if args.first().is_some_and(|arg| arg == "upgrade") {
                eprintln!(
                    "error: the managed runtime cannot upgrade itself; use `bunkit upgrade` instead"
                );
                return Ok(ExitCode::from(2));
            }
            let version = match version {
                Some(raw) => Version::parse(&raw)?,
                None => None,
            };
            let installer = installer_for(&root)?;
            let mut reporter = DownloadReporter::new(silent);
            let runtime = {
                let mut on_progress = |progress: DownloadProgress| reporter.update(progress);
                installer
                    .install(
                        version,
                        Some(&mut on_progress as &mut (dyn FnMut(DownloadProgress) + Send)),
                        Some(cancel.as_ref()),
                    )
                    .await
            };
            reporter.finish();
            let runtime = runtime?;

            let working_dir = std::env::current_dir()?;
            let code = runtime
                .run(&args, &working_dir, Some(cancel.as_ref()))
                .await?;
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
        }
        Command::Upgrade { root } => {
            let installer = installer_for(&root)?;
            let mut reporter = DownloadReporter::new(false);
            let runtime = {
                let mut on_progress = |progress: DownloadProgress| reporter.update(progress);
                installer
                    .upgrade(
                        Some(&mut on_progress as &mut (dyn FnMut(DownloadProgress) + Send)),
                        Some(cancel.as_ref()),
                    )
                    .await
            };
            reporter.finish();
            let runtime = runtime?;
            println!(
                "bun {} is installed at {}",
                runtime.version(),
                runtime.executable_path().display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Versions { root } => {
            let installer = installer_for(&root)?;
            let runtimes = installer.list_versions().await?;
            if runtimes.is_empty() {
                println!("No versions installed in {}", installer.directory().root().display());
            }
            for runtime in &runtimes {
                print_runtime(runtime);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Cleanup { root } => {
            let installer = installer_for(&root)?;
            let result = installer.cleanup(Some(cancel.as_ref())).await?;
            if result.is_empty() {
                println!("Nothing to clean up");
                return Ok(ExitCode::SUCCESS);
            }
            for removed in &result.removed_versions {
                println!("removed bun {}", removed.version);
            }
            for orphan in &result.orphaned_directories {
                println!("removed orphaned {}", orphan.display());
            }
            println!(
                "Removed {} version(s), freed {}",
                result.removed_versions.len(),
                format_size(result.freed_bytes())
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn installer_for(root: &RootArgs) -> Result<Installer> {
    let directory = InstallDirectory::resolve(root.path.as_deref())?;
    Ok(Installer::new(directory))
}

fn print_runtime(runtime: &Runtime) {
    let metadata = runtime.metadata();
    println!(
        "{:<10} {:>10}  {}  {}",
        metadata.version.to_string(),
        format_size(metadata.size_bytes),
        metadata.installed_at.format("%Y-%m-%d"),
        runtime.executable_path().display()
    );
}

/// Terminal rendering of download progress: a bar when the size is known, a spinner otherwise.
struct DownloadReporter {
    silent: bool,
    bar: Option<ProgressBar>,
}

impl DownloadReporter {
    fn new(silent: bool) -> Self {
        Self { silent, bar: None }
    }

    fn update(&mut self, progress: DownloadProgress) {
        if self.silent {
            return;
        }
        let bar = self.bar.get_or_insert_with(|| new_bar(progress.total));
        if let Some(total) = progress.total {
            bar.set_length(total);
        }
        bar.set_position(progress.read);
    }

    fn finish(self) {
        if let Some(bar) = self.bar {
            bar.finish_and_clear();
        }
    }
}

fn new_bar(total: Option<u64>) -> ProgressBar {
    let bar = match total {
        Some(total) => {
            let bar = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::with_template(
                "{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec}",
            ) {
                bar.set_style(style.progress_chars("=>-"));
            }
            bar
        }
        None => {
            let bar = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg} {bytes}") {
                bar.set_style(style);
            }
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        }
    };
    bar.set_message("Downloading bun");
    bar
}
