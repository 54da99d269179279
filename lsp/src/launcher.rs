//! Process creation for language servers.
//!
//! [`ServerLauncher`] is the seam between a session and the OS: the session
//! only sees a pair of byte streams plus a [`ServerProcess`] it can wait on
//! or kill.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};

const WORKSPACE_ROOT: &str = "{WorkspaceRoot}";
const HOST_PROCESS_ID: &str = "{HostProcessId}";

/// Everything needed to start one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Server name, for logs.
    pub server: String,
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub working_dir: PathBuf,
}

impl LaunchSpec {
    /// Build a launch spec from an argument template.
    pub fn from_template(
        server: &str,
        executable: PathBuf,
        template: &str,
        workspace_root: &Path,
    ) -> Result<Self, shell_words::ParseError> {
        Ok(Self {
            server: server.to_string(),
            executable,
            arguments: build_arguments(template, workspace_root, std::process::id())?,
            working_dir: workspace_root.to_path_buf(),
        })
    }
}

/// Split `template` with POSIX shell-word rules, then substitute the
/// placeholders inside each word. A root containing spaces stays one
/// argument.
pub fn build_arguments(
    template: &str,
    workspace_root: &Path,
    host_pid: u32,
) -> Result<Vec<String>, shell_words::ParseError> {
    let root = workspace_root.to_string_lossy();
    let pid = host_pid.to_string();
    Ok(shell_words::split(template)?
        .into_iter()
        .map(|word| {
            word.replace(WORKSPACE_ROOT, &root)
                .replace(HOST_PROCESS_ID, &pid)
        })
        .collect())
}

/// Handle on a running server process.
#[async_trait]
pub trait ServerProcess: Send {
    /// Wait for exit; returns the exit code when there is one.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    async fn kill(&mut self) -> io::Result<()>;
}

/// A started server: its stdin, stdout, and process handle.
pub struct LaunchedServer {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub process: Box<dyn ServerProcess>,
}

#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<LaunchedServer>;
}

/// Launches real subprocesses with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

struct ChildProcess(Child);

#[async_trait]
impl ServerProcess for ChildProcess {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.0.wait().await.map(|status| status.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.0.kill().await
    }
}

#[async_trait]
impl ServerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<LaunchedServer> {
        let mut child = Command::new(&spec.executable)
            .args(&spec.arguments)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child has no stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            let server = spec.server.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => tracing::trace!(server = %server, "stderr: {line}"),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::trace!(server = %server, "stderr closed: {e}");
                            break;
                        }
                    }
                }
            });
        }

        tracing::debug!(
            server = %spec.server,
            pid = ?child.id(),
            executable = %spec.executable.display(),
            "Spawned language server"
        );

        Ok(LaunchedServer {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            process: Box::new(ChildProcess(child)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omnisharp_template_substitution() {
        let args = build_arguments(
            r#"-s "{WorkspaceRoot}" --hostPID {HostProcessId}"#,
            Path::new("/home/dev/My Solution"),
            4242,
        )
        .unwrap();
        assert_eq!(
            args,
            vec!["-s", "/home/dev/My Solution", "--hostPID", "4242"]
        );
    }

    #[test]
    fn placeholders_inside_larger_words() {
        let args = build_arguments(
            "--root={WorkspaceRoot} --parent={HostProcessId}",
            Path::new("/ws"),
            7,
        )
        .unwrap();
        assert_eq!(args, vec!["--root=/ws", "--parent=7"]);
    }

    #[test]
    fn backslashes_in_root_survive() {
        let args = build_arguments(
            r#"-s "{WorkspaceRoot}""#,
            Path::new(r"C:\Users\dev\repo"),
            1,
        )
        .unwrap();
        assert_eq!(args, vec!["-s", r"C:\Users\dev\repo"]);
    }

    #[test]
    fn empty_template_means_no_arguments() {
        assert!(build_arguments("", Path::new("/ws"), 1).unwrap().is_empty());
    }

    #[test]
    fn unbalanced_quotes_are_rejected() {
        assert!(build_arguments(r#"-s "{WorkspaceRoot}"#, Path::new("/ws"), 1).is_err());
    }

    #[test]
    fn spec_from_template_uses_root_as_cwd() {
        let spec = LaunchSpec::from_template(
            "omnisharp",
            PathBuf::from("/servers/run"),
            "--hostPID {HostProcessId}",
            Path::new("/ws"),
        )
        .unwrap();
        assert_eq!(spec.working_dir, PathBuf::from("/ws"));
        assert_eq!(spec.arguments[1], std::process::id().to_string());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_launcher_reports_missing_executable() {
        let spec = LaunchSpec {
            server: "ghost".to_string(),
            executable: PathBuf::from("/definitely/not/here/ghost-ls"),
            arguments: Vec::new(),
            working_dir: std::env::temp_dir(),
        };
        assert!(ProcessLauncher.launch(&spec).await.is_err());
    }
}
