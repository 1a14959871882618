//! Sandboxed execution of untrusted snippets in ephemeral containers.
//!
//! The [`ContainerRunner`] contract isolates the rest of the pipeline from
//! the container runtime: the worker pool hands it a snippet and a hard
//! deadline and gets back captured output plus the exit code. Production
//! uses the Docker implementation; tests substitute deterministic fakes.

use async_trait::async_trait;
use tokio::time::Instant;

use crate::core_types::RunOutput;
use crate::errors::RunnerError;

pub mod docker;

pub use docker::{DockerRunner, RunnerConfig};

/// Languages the engine can execute, with their fixed container images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    Javascript,
}

impl Language {
    /// Resolve a client-supplied tag. Unknown tags are rejected at the
    /// runner, not at ingest, so the submitter still gets a terminal
    /// `failed` status for them.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "python" => Some(Language::Python),
            "javascript" => Some(Language::Javascript),
            _ => None,
        }
    }

    pub fn image(&self) -> &'static str {
        match self {
            Language::Python => "python:alpine",
            Language::Javascript => "node:alpine",
        }
    }

    /// Interpreter invocation with the literal snippet as a single argument.
    pub fn command(&self, code: &str) -> Vec<String> {
        let (interpreter, eval_flag) = match self {
            Language::Python => ("python", "-c"),
            Language::Javascript => ("node", "-e"),
        };
        vec![
            interpreter.to_string(),
            eval_flag.to_string(),
            code.to_string(),
        ]
    }
}

/// Runs one snippet in one short-lived, resource-constrained container.
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    /// Execute `code` for `language`, observing the hard `deadline`.
    ///
    /// Implementations must never leak the container: a force-remove is
    /// issued on every exit path, including timeout.
    async fn run(
        &self,
        job_id: &str,
        code: &str,
        language: &str,
        deadline: Instant,
    ) -> Result<RunOutput, RunnerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_image_map() {
        assert_eq!(Language::from_tag("python"), Some(Language::Python));
        assert_eq!(Language::from_tag("javascript"), Some(Language::Javascript));
        assert_eq!(Language::Python.image(), "python:alpine");
        assert_eq!(Language::Javascript.image(), "node:alpine");
    }

    #[test]
    fn test_unknown_language_rejected() {
        assert_eq!(Language::from_tag("ruby"), None);
        assert_eq!(Language::from_tag(""), None);
        // Tags are case-sensitive, matching the submit API.
        assert_eq!(Language::from_tag("Python"), None);
    }

    #[test]
    fn test_command_passes_snippet_verbatim() {
        let cmd = Language::Python.command("print('hi; there')");
        assert_eq!(cmd, vec!["python", "-c", "print('hi; there')"]);

        let cmd = Language::Javascript.command("console.log(1)");
        assert_eq!(cmd, vec!["node", "-e", "console.log(1)"]);
    }
}
