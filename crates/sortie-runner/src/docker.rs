//! Docker runtime using bollard.
//!
//! One container per issue, named `sortie-issue-<N>`, running the agent
//! image with the worktree bound at `/workspace`.

use crate::runtime::{UnitHandle, UnitRuntime, UnitSpec};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::HostConfig;
use futures_util::StreamExt;
use sortie_core::config::{ContainerConfig, Secrets};
use sortie_core::task::IssueNumber;
use std::collections::HashMap;

/// Mount point of the worktree inside the container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Container name for an issue.
pub fn container_name(issue: IssueNumber) -> String {
    format!("sortie-issue-{}", issue.0)
}

pub struct DockerRuntime {
    client: Docker,
    config: ContainerConfig,
    secrets: Secrets,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub async fn connect(config: ContainerConfig, secrets: Secrets) -> Result<Self> {
        let client =
            Docker::connect_with_local_defaults().context("failed to connect to Docker daemon")?;

        client
            .ping()
            .await
            .context("Docker daemon not responding")?;

        Ok(Self {
            client,
            config,
            secrets,
        })
    }

    /// Whether the configured image is present locally.
    pub async fn image_exists(&self) -> Result<bool> {
        match self.client.inspect_image(&self.config.image).await {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e).context(format!("failed to inspect image {}", self.config.image)),
        }
    }

    /// Remove a container by name or id, treating "not found" as done.
    async fn force_remove(&self, name_or_id: &str) -> Result<()> {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(name_or_id, Some(opts)).await {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e).context(format!("failed to remove container {name_or_id}")),
        }
    }
}

/// Environment passed to the agent.
pub fn container_env(secrets: &Secrets) -> Vec<String> {
    let mut env = Vec::new();
    if let Some(token) = &secrets.github_token {
        env.push(format!("GH_TOKEN={token}"));
        env.push(format!("GITHUB_TOKEN={token}"));
    }
    // OAuth credentials take precedence over an API key.
    if secrets.credentials_file.is_none()
        && let Some(key) = &secrets.api_key
    {
        env.push(format!("ANTHROPIC_API_KEY={key}"));
        env.push(format!("CLAUDE_API_KEY={key}"));
    }
    env
}

/// Bind mounts: the worktree, plus the credentials file read-only when present.
pub fn container_binds(spec: &UnitSpec, config: &ContainerConfig, secrets: &Secrets) -> Vec<String> {
    let mut binds = vec![format!("{}:{WORKSPACE_MOUNT}", spec.workspace.display())];
    if let Some(creds) = &secrets.credentials_file {
        let target = config.home().join(".claude").join(".credentials.json");
        binds.push(format!("{}:{}:ro", creds.display(), target.display()));
    }
    binds
}

/// Agent command line. The image entrypoint is the agent CLI.
pub fn container_cmd(instructions: &str) -> Vec<String> {
    vec![
        "-p".into(),
        "--dangerously-skip-permissions".into(),
        instructions.into(),
    ]
}

#[async_trait]
impl UnitRuntime for DockerRuntime {
    async fn launch(&self, spec: &UnitSpec) -> Result<UnitHandle> {
        let name = container_name(spec.issue);

        // A leftover container from an earlier run holds the name.
        self.force_remove(&name).await?;

        let host_config = HostConfig {
            binds: Some(container_binds(spec, &self.config, &self.secrets)),
            memory: self
                .config
                .memory_limit_mb
                .map(|mb| (mb * 1024 * 1024) as i64),
            network_mode: Some(self.config.network.clone()),
            ..Default::default()
        };

        let labels = HashMap::from([
            ("sortie.issue".to_string(), spec.issue.0.to_string()),
            ("sortie.managed".to_string(), "true".to_string()),
        ]);

        let container_config: Config<String> = Config {
            image: Some(self.config.image.clone()),
            cmd: Some(container_cmd(&spec.instructions)),
            env: Some(container_env(&self.secrets)),
            user: Some(self.config.user.clone()),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_opts = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(create_opts), container_config)
            .await
            .context(format!("failed to create container {name}"))?;

        if let Err(e) = self
            .client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(cleanup) = self.force_remove(&container.id).await {
                tracing::warn!(container = %name, error = %cleanup, "failed to remove unstarted container");
            }
            return Err(e).context(format!("failed to start container {name}"));
        }

        let unit = UnitHandle::new(container.id);
        tracing::info!(
            issue = %spec.issue,
            container = %name,
            id = %unit,
            image = %self.config.image,
            "container started"
        );
        Ok(unit)
    }

    async fn wait(&self, unit: &UnitHandle) -> Result<i64> {
        let mut stream = self
            .client
            .wait_container(&unit.id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a nonzero exit as an error carrying the code.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e).context(format!("failed waiting for container {unit}")),
            None => anyhow::bail!("wait stream for container {unit} ended without a status"),
        }
    }

    async fn logs(&self, unit: &UnitHandle) -> Result<String> {
        let opts = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut out = String::new();
        let mut stream = self.client.logs(&unit.id, Some(opts));
        while let Some(chunk) = stream.next().await {
            match chunk.context(format!("failed to read logs of container {unit}"))? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => {
                    out.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(out)
    }

    async fn remove(&self, unit: &UnitHandle) -> Result<()> {
        self.force_remove(&unit.id).await?;
        tracing::debug!(container = %unit, "container removed");
        Ok(())
    }

    fn name(&self) -> &str {
        "docker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec() -> UnitSpec {
        UnitSpec {
            issue: IssueNumber(21),
            workspace: PathBuf::from("/tmp/sortie-worktrees/issue-21"),
            instructions: "Read issue #21".into(),
        }
    }

    #[test]
    fn name_is_per_issue() {
        assert_eq!(container_name(IssueNumber(21)), "sortie-issue-21");
    }

    #[test]
    fn worktree_bound_at_workspace() {
        let binds = container_binds(&spec(), &ContainerConfig::default(), &Secrets::default());
        assert_eq!(binds, vec!["/tmp/sortie-worktrees/issue-21:/workspace"]);
    }

    #[test]
    fn credentials_file_mounted_read_only_in_user_home() {
        let secrets = Secrets {
            credentials_file: Some(PathBuf::from("/home/me/.claude/.credentials.json")),
            ..Default::default()
        };
        let binds = container_binds(&spec(), &ContainerConfig::default(), &secrets);
        assert_eq!(
            binds[1],
            "/home/me/.claude/.credentials.json:/home/claude/.claude/.credentials.json:ro"
        );
    }

    #[test]
    fn env_carries_tokens_under_both_names() {
        let secrets = Secrets {
            github_token: Some("ghp".into()),
            api_key: Some("sk".into()),
            credentials_file: None,
        };
        let env = container_env(&secrets);
        assert!(env.contains(&"GH_TOKEN=ghp".to_string()));
        assert!(env.contains(&"GITHUB_TOKEN=ghp".to_string()));
        assert!(env.contains(&"ANTHROPIC_API_KEY=sk".to_string()));
        assert!(env.contains(&"CLAUDE_API_KEY=sk".to_string()));
    }

    #[test]
    fn api_key_omitted_when_credentials_file_mounted() {
        let secrets = Secrets {
            github_token: None,
            api_key: Some("sk".into()),
            credentials_file: Some(PathBuf::from("/c.json")),
        };
        assert!(container_env(&secrets).is_empty());
    }

    #[test]
    fn command_runs_agent_non_interactively() {
        let cmd = container_cmd("do it");
        assert_eq!(cmd, vec!["-p", "--dangerously-skip-permissions", "do it"]);
    }
}
