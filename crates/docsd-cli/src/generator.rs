//! The one concrete [`SiteGenerator`] this workspace ships: shells out to a
//! configurable external command rather than rendering anything itself.
//!
//! Cloning repositories and turning markdown into a static site is
//! deliberately out of scope for `docsd-core` (see `generator::SiteGenerator`
//! doc comment) — but a CLI binary has to be runnable end to end, so this
//! adapter hands the job to whatever external program the operator points
//! it at, over a small JSON contract on stdin/stdout, using the async
//! `tokio::process::Command` this workspace uses throughout.

use std::io::Write as _;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use docsd_core::generator::{GenerationContext, SiteGenerator};
use docsd_core::shutdown::ShutdownSignal;
use docsd_types::{BuildReport, RepositoryDescriptor};
use serde::Serialize;
use tokio::process::Command;

/// The JSON document written to the external command's stdin: everything it
/// needs to know to go do the actual clone-and-render work.
#[derive(Debug, Serialize)]
struct GeneratorInvocation<'a> {
    output_dir: &'a Path,
    namespace_forges: bool,
    live_reload: bool,
    workspace_dir: &'a Path,
    repositories: &'a [RepositoryDescriptor],
}

/// Invokes an external program, feeds it a [`GeneratorInvocation`] on stdin,
/// and parses a [`BuildReport`] back from its stdout.
///
/// The external command is expected to exit zero and print exactly one JSON
/// object; anything it writes to stderr is surfaced as a warning rather than
/// failing the build outright, mirroring how the pipeline treats a state
/// store flush failure as non-fatal.
pub struct ExternalProcessGenerator {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalProcessGenerator {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl SiteGenerator for ExternalProcessGenerator {
    async fn generate(
        &self,
        context: &GenerationContext,
        selected_repositories: &[RepositoryDescriptor],
        workspace_dir: &Path,
        mut shutdown: ShutdownSignal,
    ) -> anyhow::Result<BuildReport> {
        let invocation = GeneratorInvocation {
            output_dir: &context.output_dir,
            namespace_forges: context.namespace_forges,
            live_reload: context.live_reload,
            workspace_dir,
            repositories: selected_repositories,
        };
        let stdin_payload =
            serde_json::to_vec(&invocation).context("serializing generator invocation")?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning generator command `{}`", self.command))?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        tokio::task::spawn_blocking(move || stdin.write_all(&stdin_payload))
            .await
            .context("generator stdin writer task panicked")?
            .context("writing invocation to generator stdin")?;

        let wait = async {
            tokio::time::timeout(self.timeout, child.wait_with_output())
                .await
                .context("generator command timed out")?
                .context("waiting for generator command")
        };

        let output = tokio::select! {
            result = wait => result?,
            _ = shutdown.cancelled() => {
                anyhow::bail!("generation cancelled before the generator command exited");
            }
        };

        if !output.stderr.is_empty() {
            tracing::warn!(
                command = %self.command,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "generator command wrote to stderr"
            );
        }

        if !output.status.success() {
            anyhow::bail!(
                "generator command `{}` exited with {:?}: {}",
                self.command,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        serde_json::from_slice(&output.stdout).with_context(|| {
            format!(
                "parsing build report from generator command `{}` stdout",
                self.command
            )
        })
    }
}
