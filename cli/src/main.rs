//! filetransfer - Command-line interface for the transfer engine.
//!
//! Runs one configured job and exits with a code derived from its status.
//! Also maintains SFTP known-hosts files.

mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use engine::config::{LoggingPolicy, NotifyPolicy, SSH_PORT};
use engine::endpoint::sftp::{delete_host_key, fetch_host_key, known_hosts_name, save_host_key};
use engine::error::error_chain;
use engine::lock::local_host_name;
use engine::{
    config_path, load_app_config, load_job, AppConfig, CancellationToken, ConfigError, Engine,
    FileEntry, FileMark, FileRecord, FileTags, JobConfig, JobResult, ProgressCallback, Status,
};

/// Exit code for command-line usage errors.
const EXIT_USAGE: u8 = 4;

/// Seconds to wait for a server while fetching its host key.
const HOSTKEY_TIMEOUT: Duration = Duration::from_secs(30);

/// filetransfer - Run configured file transfer jobs
#[derive(Parser, Debug)]
#[command(name = "filetransfer")]
#[command(version)]
#[command(about = "Run configured file transfer jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a job
    Run(RunArgs),

    /// Show a server's host key and optionally save it
    Hostkey {
        /// Server host name
        host: String,

        /// Known-hosts file
        file: PathBuf,

        /// Server port
        #[arg(short, long, default_value_t = SSH_PORT)]
        port: u16,

        /// Store the key in the known-hosts file
        #[arg(long)]
        save: bool,
    },

    /// Remove a server's host key from a known-hosts file
    DeleteHostkey {
        /// Server host name
        host: String,

        /// Known-hosts file
        file: PathBuf,

        /// Server port
        #[arg(short, long, default_value_t = SSH_PORT)]
        port: u16,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Job id; the job is read from `<jobs_dir>/<JOB_ID>.yaml`
    job_id: String,

    /// Application config file (default: $FILETRANSFER_CFG)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print per-file progress
    #[arg(short, long)]
    verbose: bool,
}

/// Prints progress of a run to stderr.
struct CliProgress {
    verbose: bool,
    start_time: Instant,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }
}

impl ProgressCallback for CliProgress {
    fn on_job_started(&self, job: &JobConfig, file_count: usize) {
        eprintln!("Job {} ({})", job.job_id, job.name);
        eprintln!("  Source: {}", job.source_url());
        eprintln!("  Target: {}", job.target_url());
        eprintln!("  Files: {}", file_count);
        eprintln!();
    }

    fn on_file_started(&self, _job: &JobConfig, file_index: usize, file: &FileEntry) {
        if self.verbose {
            match file.size {
                Some(size) => eprintln!(
                    "[{:3}] Starting: {} ({})",
                    file_index,
                    file.rel_path,
                    Self::format_bytes(size)
                ),
                None => eprintln!("[{:3}] Starting: {}", file_index, file.rel_path),
            }
        }
    }

    fn on_file_completed(&self, _job: &JobConfig, file_index: usize, record: &FileRecord) {
        if self.verbose {
            let status = match record.mark {
                FileMark::Transferred => "Done",
                FileMark::SourceError => "Source error",
                FileMark::TargetError => "Target error",
                FileMark::Unprocessed => "Not post-processed",
            };
            eprintln!("[{:3}] {}: {} ({})", file_index, status, record.path, record.info);
        }
    }

    fn on_job_completed(&self, _job: &JobConfig, result: &JobResult) {
        eprintln!();
        eprintln!("Job finished: {}", result.status());
        eprintln!(
            "Summary: {} transferred, {} source errors, {} target errors",
            result.files_cnt(),
            result.src_error_cnt(),
            result.tgt_error_cnt()
        );
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));
        if let Some(msg) = result.error_message() {
            eprintln!("Error: {}", msg);
        }
    }
}

/// Exit code for a command-line parse error; help and version exit cleanly.
fn usage_exit_code(err: &clap::Error) -> u8 {
    if err.use_stderr() {
        EXIT_USAGE
    } else {
        0
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(usage_exit_code(&e));
        }
    };

    let code = match cli.command {
        Command::Run(args) => run_command(&args),
        Command::Hostkey {
            host,
            file,
            port,
            save,
        } => report(show_host_key(&host, port, &file, save)),
        Command::DeleteHostkey { host, file, port } => {
            report(remove_host_key(&host, port, &file))
        }
    };
    ExitCode::from(code)
}

fn report(result: Result<()>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            Status::Failure.exit_code() as u8
        }
    }
}

/// Configuration of one run, or why it could not be loaded.
enum Loaded {
    Job(JobConfig),
    /// The application config is kept when it could be read, for the notification
    Invalid(Option<AppConfig>, ConfigError),
}

fn load(args: &RunArgs) -> Loaded {
    let app = match config_path(args.config.as_deref()).and_then(|p| load_app_config(&p)) {
        Ok(app) => app,
        Err(e) => return Loaded::Invalid(None, e),
    };
    match load_job(&app, &args.job_id) {
        Ok(job) => Loaded::Job(job),
        Err(e) => Loaded::Invalid(Some(app), e),
    }
}

fn run_command(args: &RunArgs) -> u8 {
    let started = Local::now();
    let loaded = load(args);

    let policy = match &loaded {
        Loaded::Job(job) => job.logging.clone(),
        Loaded::Invalid(Some(app), _) => app.logging.clone(),
        Loaded::Invalid(None, _) => LoggingPolicy::default(),
    };
    let log_file = logging::log_file_path(&policy, &args.job_id, started);
    let _guard = match logging::setup_logging(&policy.level, log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            None
        }
    };

    let token = CancellationToken::new();
    let handler_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::warn!("termination requested");
        handler_token.cancel();
    }) {
        tracing::warn!("cannot install signal handler: {}", e);
    }

    let result = execute(args, loaded, token, log_file.as_deref());
    result.status().exit_code() as u8
}

/// Run a loaded job, or report its configuration error.
fn execute(
    args: &RunArgs,
    loaded: Loaded,
    token: CancellationToken,
    log_file: Option<&Path>,
) -> JobResult {
    let logfile = log_file.map_or_else(|| "-".to_string(), |p| p.display().to_string());
    let mut engine = Engine::new()
        .with_cancellation(token)
        .with_tag("logfile", logfile.as_str());
    if args.verbose {
        engine = engine.with_progress(CliProgress::new(true));
    }

    match loaded {
        Loaded::Job(job) => engine.run(&job),
        Loaded::Invalid(app, err) => {
            let result = JobResult::config_error(args.job_id.as_str(), Local::now(), &err);
            tracing::error!("job {}: {}", args.job_id, error_chain(&err));
            eprintln!("Error: {}", error_chain(&err));
            if let Some(app) = app {
                let policy = NotifyPolicy {
                    mail: app.mail.get("default").cloned(),
                    ..NotifyPolicy::default()
                };
                let mut tags = FileTags::new();
                tags.insert("jobid", args.job_id.as_str());
                tags.insert("jobname", args.job_id.as_str());
                tags.insert("host", local_host_name());
                tags.insert("logfile", logfile);
                engine.notify(&policy, &result, &tags);
            }
            result
        }
    }
}

fn show_host_key(host: &str, port: u16, file: &Path, save: bool) -> Result<()> {
    let key = fetch_host_key(host, port, Some(HOSTKEY_TIMEOUT))
        .with_context(|| format!("Failed to get host key of {}:{}", host, port))?;
    println!(
        "{} {} MD5:{} SHA256:{}",
        known_hosts_name(host, port),
        key.type_name(),
        key.md5,
        key.sha256
    );
    if save {
        save_host_key(&key, file)
            .with_context(|| format!("Failed to save host key to {}", file.display()))?;
        println!("Saved to {}", file.display());
    }
    Ok(())
}

fn remove_host_key(host: &str, port: u16, file: &Path) -> Result<()> {
    let removed = delete_host_key(host, port, file)
        .with_context(|| format!("Failed to update {}", file.display()))?;
    println!(
        "{} entries for {} removed from {}",
        removed,
        known_hosts_name(host, port),
        file.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Writes an application config plus one local job `job1`.
    fn write_config(dir: &Path, job_extra: &str) -> PathBuf {
        let jobs = dir.join("jobs");
        let src = dir.join("src");
        let dst = dir.join("dst");
        for d in [&jobs, &src, &dst] {
            fs::create_dir_all(d).expect("Failed to create dir");
        }
        fs::write(
            jobs.join("job1.yaml"),
            format!(
                "source:\n  path: {}\n  files: \"*.txt\"\ntarget:\n  path: {}\n{}",
                src.display(),
                dst.display(),
                job_extra
            ),
        )
        .expect("Failed to write job file");
        let app = dir.join("app.yaml");
        fs::write(
            &app,
            format!(
                "global:\n  jobs_dir: {}\n  locks_dir: {}\nmail:\n  default:\n    from: ft@example.com\n    to: ops@example.com\n    host: TEST\n",
                jobs.display(),
                dir.join("locks").display()
            ),
        )
        .expect("Failed to write app config");
        app
    }

    fn run_args(config: &Path, job_id: &str) -> RunArgs {
        RunArgs {
            job_id: job_id.to_string(),
            config: Some(config.to_path_buf()),
            verbose: false,
        }
    }

    fn run(args: &RunArgs) -> JobResult {
        execute(args, load(args), CancellationToken::new(), None)
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from(["filetransfer", "run", "job1", "-c", "/etc/ft.yaml", "-v"])
            .expect("Failed to parse");
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.job_id, "job1");
                assert_eq!(args.config, Some(PathBuf::from("/etc/ft.yaml")));
                assert!(args.verbose);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_hostkey_defaults_to_ssh_port() {
        let cli = Cli::try_parse_from(["filetransfer", "hostkey", "files.example.com", "/tmp/kh"])
            .expect("Failed to parse");
        match cli.command {
            Command::Hostkey { port, save, .. } => {
                assert_eq!(port, 22);
                assert!(!save);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_usage_errors_exit_with_usage_code() {
        let err = Cli::try_parse_from(["filetransfer", "run"]).expect_err("job id is required");
        assert_eq!(usage_exit_code(&err), EXIT_USAGE);
        let err = Cli::try_parse_from(["filetransfer", "--help"]).expect_err("help exits early");
        assert_eq!(usage_exit_code(&err), 0);
    }

    #[test]
    fn test_run_transfers_files() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = write_config(temp_dir.path(), "");
        fs::write(temp_dir.path().join("src").join("a.txt"), "hello").expect("Failed to write file");
        fs::write(temp_dir.path().join("src").join("b.csv"), "skip").expect("Failed to write file");

        let result = run(&run_args(&config, "job1"));

        assert_eq!(result.status(), Status::Success);
        assert_eq!(result.files_cnt(), 1);
        assert!(temp_dir.path().join("dst").join("a.txt").exists());
        assert!(!temp_dir.path().join("dst").join("b.csv").exists());
    }

    #[test]
    fn test_unknown_job_is_config_error() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = write_config(temp_dir.path(), "");

        let result = run(&run_args(&config, "missing"));

        assert_eq!(result.status(), Status::ConfigError);
        assert_eq!(result.status().exit_code(), 3);
    }

    #[test]
    fn test_missing_config_file_is_config_error() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let args = run_args(&temp_dir.path().join("nope.yaml"), "job1");
        assert_eq!(run(&args).status(), Status::ConfigError);
    }

    #[test]
    fn test_invalid_job_option_is_config_error() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = write_config(temp_dir.path(), "retry:\n  max_attempts: 0\n");
        assert_eq!(run(&run_args(&config, "job1")).status(), Status::ConfigError);
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(CliProgress::format_bytes(1536), "1.50 KB");
        assert_eq!(CliProgress::format_duration(Duration::from_secs(3725)), "1h 2m 5s");
        assert_eq!(CliProgress::format_duration(Duration::from_secs(42)), "42s");
    }
}
