//! Procwrap CLI - run one external tool under a managed process handle.
//!
//! The tool's stdout/stderr are forwarded to ours, Ctrl-C or `--timeout`
//! cancels the whole process tree, and we exit with the tool's exit code.

mod runner;

use anyhow::{bail, Context, Result};
use clap::Parser;
use procwrap_core::ProcessSpec;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "procwrap")]
#[command(about = "Run an external tool with output capture and cooperative cancellation")]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log process lifecycle events
    #[arg(short, long)]
    verbose: bool,

    /// Cancel the tool after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Grace period between SIGTERM and SIGKILL when cancelling
    #[arg(long, value_name = "MS")]
    kill_grace: Option<u64>,

    /// Working directory for the tool
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Extra environment variable for the tool (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Load the process spec from a JSON file instead of the command line
    #[arg(long, value_name = "FILE", conflicts_with = "command")]
    spec: Option<PathBuf>,

    /// Program and arguments to run
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn parse_env_pair(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", raw)),
    }
}

impl Args {
    /// Build the process spec, applying command-line overrides on top of a
    /// spec file when one is given.
    fn to_spec(&self) -> Result<ProcessSpec> {
        let mut spec = match (&self.spec, self.command.split_first()) {
            (Some(path), _) => ProcessSpec::from_json_file(path)
                .with_context(|| format!("Failed to load spec {}", path.display()))?,
            (None, Some((program, args))) => ProcessSpec::new(program).args(args.iter().cloned()),
            (None, None) => bail!("either --spec or a command to run is required"),
        };

        if let Some(ref cwd) = self.cwd {
            spec = spec.working_dir(cwd);
        }
        for (key, value) in &self.env {
            spec = spec.env(key.clone(), value.clone());
        }
        if let Some(ms) = self.kill_grace {
            spec = spec.kill_grace(Duration::from_millis(ms));
        }

        spec.validate()?;
        Ok(spec)
    }

    fn log_level(&self) -> Level {
        if self.debug {
            Level::DEBUG
        } else if self.verbose {
            Level::INFO
        } else {
            Level::WARN
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so they never mix into the tool's stdout
    FmtSubscriber::builder()
        .with_max_level(args.log_level())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let spec = args.to_spec()?;
    debug!(
        program = %spec.program.display(),
        args = ?spec.args,
        cwd = ?spec.working_dir,
        "Resolved tool"
    );
    let timeout = args.timeout.map(Duration::from_secs);
    let code = runner::run(spec, timeout).await?;

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("procwrap").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_command_with_hyphen_args() {
        let args = parse(&["--timeout", "5", "sh", "-c", "echo hi"]);
        assert_eq!(args.timeout, Some(5));
        assert_eq!(args.command, vec!["sh", "-c", "echo hi"]);

        let spec = args.to_spec().unwrap();
        assert_eq!(spec.program, PathBuf::from("sh"));
        assert_eq!(spec.args, vec!["-c", "echo hi"]);
    }

    #[test]
    fn test_overrides_apply() {
        let args = parse(&[
            "--cwd",
            "/work",
            "--env",
            "A=1",
            "--env",
            "B=x=y",
            "--kill-grace",
            "250",
            "make",
        ]);
        let spec = args.to_spec().unwrap();

        assert_eq!(spec.working_dir, Some(PathBuf::from("/work")));
        assert_eq!(spec.env.get("B").map(String::as_str), Some("x=y"));
        assert_eq!(spec.kill_grace, Duration::from_millis(250));
    }

    #[test]
    fn test_bad_env_pair_rejected() {
        let result = Args::try_parse_from(["procwrap", "--env", "=oops", "make"]);
        assert!(result.is_err());
        assert!(parse_env_pair("NOEQUALS").is_err());
    }

    #[test]
    fn test_spec_file_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool.json");
        std::fs::write(&path, r#"{"program": "msbuild", "args": ["/t:Build"]}"#).unwrap();

        let args = parse(&["--spec", path.to_str().unwrap(), "--env", "Configuration=Release"]);
        let spec = args.to_spec().unwrap();

        assert_eq!(spec.program, PathBuf::from("msbuild"));
        assert_eq!(spec.args, vec!["/t:Build"]);
        assert_eq!(
            spec.env.get("Configuration").map(String::as_str),
            Some("Release")
        );
    }

    #[test]
    fn test_missing_command_rejected() {
        assert!(parse(&[]).to_spec().is_err());
    }

    #[test]
    fn test_log_level() {
        assert_eq!(parse(&["ls"]).log_level(), Level::WARN);
        assert_eq!(parse(&["-v", "ls"]).log_level(), Level::INFO);
        assert_eq!(parse(&["-d", "-v", "ls"]).log_level(), Level::DEBUG);
    }
}
