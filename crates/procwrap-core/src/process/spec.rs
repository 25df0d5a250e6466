//! Launch description for a managed process.

use crate::config::ProcessConfig;
use crate::error::{ProcwrapError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// What to launch and how.
///
/// The handle passes everything here straight to the OS; it never interprets
/// arguments or environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessSpec {
    /// Executable to run. Resolved through `PATH` when it has no separator.
    pub program: PathBuf,
    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory. Inherits the host's when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Environment variables to set.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Environment variables to remove from the inherited environment.
    #[serde(default)]
    pub env_remove: Vec<String>,
    /// Start from an empty environment instead of inheriting the host's.
    #[serde(default)]
    pub clear_env: bool,
    /// Time between polite termination and a forced kill when cancelling.
    #[serde(default = "default_kill_grace", with = "millis")]
    pub kill_grace: Duration,
}

fn default_kill_grace() -> Duration {
    ProcessConfig::DEFAULT_KILL_GRACE
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl ProcessSpec {
    /// Create a spec for `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            env_remove: Vec::new(),
            clear_env: false,
            kill_grace: default_kill_grace(),
        }
    }

    /// Load a spec from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ProcwrapError::io_with_path(e, path))?;
        let spec: Self = serde_json::from_str(&content)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Add an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Remove an inherited environment variable.
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    /// Start from an empty environment.
    pub fn clear_env(mut self) -> Self {
        self.clear_env = true;
        self
    }

    /// Set the grace period used when cancelling.
    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Reject specs the OS could never launch.
    pub fn validate(&self) -> Result<()> {
        if self.program.as_os_str().is_empty() {
            return Err(ProcwrapError::InvalidSpec {
                message: "program must not be empty".to_string(),
            });
        }
        if let Some(key) = self
            .env
            .keys()
            .find(|k| k.is_empty() || k.contains('='))
        {
            return Err(ProcwrapError::InvalidSpec {
                message: format!("invalid environment variable name {:?}", key),
            });
        }
        Ok(())
    }

    /// Build the OS command. Stdin is closed; stdout/stderr are piped only
    /// when captured and discarded otherwise.
    pub(crate) fn to_command(&self, capture_stdout: bool, capture_stderr: bool) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        if self.clear_env {
            cmd.env_clear();
        }
        for key in &self.env_remove {
            cmd.env_remove(key);
        }
        cmd.envs(&self.env);

        cmd.stdin(Stdio::null());
        cmd.stdout(if capture_stdout { Stdio::piped() } else { Stdio::null() });
        cmd.stderr(if capture_stderr { Stdio::piped() } else { Stdio::null() });
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let spec = ProcessSpec::new("cargo")
            .arg("build")
            .args(["--release", "--quiet"])
            .env("RUST_LOG", "debug")
            .env_remove("CARGO_TARGET_DIR")
            .kill_grace(Duration::from_millis(250));

        assert_eq!(spec.program, PathBuf::from("cargo"));
        assert_eq!(spec.args, vec!["build", "--release", "--quiet"]);
        assert_eq!(spec.env.get("RUST_LOG").map(String::as_str), Some("debug"));
        assert_eq!(spec.env_remove, vec!["CARGO_TARGET_DIR"]);
        assert_eq!(spec.kill_grace, Duration::from_millis(250));
        assert!(!spec.clear_env);
    }

    #[test]
    fn test_deserialize_minimal_json() {
        let spec: ProcessSpec = serde_json::from_str(r#"{"program": "msbuild"}"#).unwrap();
        assert_eq!(spec, ProcessSpec::new("msbuild"));
    }

    #[test]
    fn test_deserialize_full_json() {
        let json = r#"{
            "program": "/usr/bin/make",
            "args": ["-j4", "all"],
            "working_dir": "/src/project",
            "env": {"CC": "clang"},
            "env_remove": ["MAKEFLAGS"],
            "clear_env": false,
            "kill_grace": 1500
        }"#;
        let spec: ProcessSpec = serde_json::from_str(json).unwrap();

        assert_eq!(spec.working_dir, Some(PathBuf::from("/src/project")));
        assert_eq!(spec.kill_grace, Duration::from_millis(1500));
        assert_eq!(serde_json::to_value(&spec).unwrap()["kill_grace"], 1500);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: std::result::Result<ProcessSpec, _> =
            serde_json::from_str(r#"{"program": "ls", "shell": true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate() {
        assert!(ProcessSpec::new("ls").validate().is_ok());
        assert!(ProcessSpec::new("").validate().is_err());
        assert!(ProcessSpec::new("ls").env("A=B", "c").validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.json");
        std::fs::write(&path, r#"{"program": "dotnet", "args": ["test"]}"#).unwrap();

        let spec = ProcessSpec::from_json_file(&path).unwrap();
        assert_eq!(spec.args, vec!["test"]);

        let missing = ProcessSpec::from_json_file(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(ProcwrapError::Io { path: Some(_), .. })));
    }
}
