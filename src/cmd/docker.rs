use crate::cmd::shell::{Shell, ShellError, ShellOutput, SystemShell};
use once_cell::sync::Lazy;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum DockerError {
    #[error("Docker Invalid configuration: {raw_error_message:?}")]
    InvalidConfig { raw_error_message: String },

    #[error("Docker terminated with an unknown error: {raw_error_message:?}")]
    ExecutionError { raw_error_message: String },

    #[error("Docker terminated with a non success exit status code {exit_status:?}: {raw_error_message:?}")]
    ExitStatusError {
        exit_status: ExitStatus,
        raw_error_message: String,
    },

    #[error("Docker command terminated due to timeout: {raw_error_message:?}")]
    Timeout { raw_error_message: String },
}

impl From<ShellError> for DockerError {
    fn from(e: ShellError) -> Self {
        match e {
            ShellError::Timeout { .. } => DockerError::Timeout {
                raw_error_message: e.to_string(),
            },
            ShellError::ExitStatusError {
                exit_status,
                ref stderr_tail,
                ..
            } => DockerError::ExitStatusError {
                exit_status,
                raw_error_message: stderr_tail.clone(),
            },
            ShellError::ExecutionError { .. } => DockerError::ExecutionError {
                raw_error_message: e.to_string(),
            },
        }
    }
}

// Docker login when launched in parallel can mess up ~/.docker/config.json
// We use a mutex that will force serialization of logins in order to avoid that
static LOGIN_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub struct Docker {
    shell: Arc<dyn Shell>,
    socket_location: Option<Url>,
    common_envs: Vec<(String, String)>,
}

impl Docker {
    pub fn new(socket_location: Option<Url>) -> Result<Self, DockerError> {
        Self::new_with_shell(Arc::new(SystemShell), socket_location)
    }

    pub fn new_with_shell(shell: Arc<dyn Shell>, socket_location: Option<Url>) -> Result<Self, DockerError> {
        let mut docker = Docker {
            shell,
            socket_location,
            common_envs: vec![("DOCKER_BUILDKIT".to_string(), "1".to_string())],
        };

        // Override DOCKER_HOST if we use a TCP socket
        if let Some(socket_location) = &docker.socket_location {
            docker
                .common_envs
                .push(("DOCKER_HOST".to_string(), socket_location.to_string()))
        }

        if docker.exec(&["version", "--format", "{{.Client.Version}}"]).is_err() {
            return Err(DockerError::InvalidConfig {
                raw_error_message: "Docker client is not correctly installed".to_string(),
            });
        }

        Ok(docker)
    }

    pub fn socket_url(&self) -> &Option<Url> {
        &self.socket_location
    }

    fn exec(&self, args: &[&str]) -> Result<ShellOutput, DockerError> {
        self.exec_with_timeout(args, None)
    }

    fn exec_with_timeout(&self, args: &[&str], timeout: Option<Duration>) -> Result<ShellOutput, DockerError> {
        let envs: Vec<(&str, &str)> = self.common_envs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        Ok(self.shell.run("docker", args, &envs, timeout)?)
    }

    pub fn login(&self, registry: &Url) -> Result<(), DockerError> {
        info!("Docker login {} as user {}", registry, registry.username());
        let password = urlencoding::decode(registry.password().unwrap_or_default())
            .unwrap_or_default()
            .to_string();
        self.login_with_credentials(registry.host_str().unwrap_or_default(), registry.username(), &password)
    }

    pub fn login_with_credentials(&self, host: &str, username: &str, password: &str) -> Result<(), DockerError> {
        let _lock = LOGIN_LOCK.lock().unwrap();
        self.exec(&["login", host, "-u", username, "-p", password])?;
        Ok(())
    }

    pub fn does_image_exist_locally(&self, image_name: &str) -> Result<bool, DockerError> {
        let ret = self.exec(&["image", "inspect", image_name]);
        Ok(ret.is_ok())
    }

    pub fn does_image_exist_remotely(&self, image_name: &str) -> Result<bool, DockerError> {
        match self.exec(&["manifest", "inspect", image_name]) {
            Ok(_) => Ok(true),
            Err(DockerError::ExitStatusError { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &self,
        dockerfile_path: Option<&str>,
        context_dir: &str,
        image_name: &str,
        platform: &str,
        nocache: bool,
        build_args: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<(), DockerError> {
        info!("Docker build {}", image_name);
        let mut args: Vec<String> = vec![
            "build".to_string(),
            "--tag".to_string(),
            image_name.to_string(),
            "--platform".to_string(),
            platform.to_string(),
        ];
        if nocache {
            args.push("--no-cache".to_string());
        }
        if let Some(dockerfile_path) = dockerfile_path {
            args.push("--file".to_string());
            args.push(dockerfile_path.to_string());
        }
        for (key, value) in build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(context_dir.to_string());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.exec_with_timeout(&args, timeout)?;
        Ok(())
    }

    pub fn tag(&self, source_image: &str, dest_image: &str) -> Result<(), DockerError> {
        info!("Docker tag {} {}", source_image, dest_image);
        self.exec(&["tag", source_image, dest_image])?;
        Ok(())
    }

    pub fn push(&self, image_name: &str, timeout: Option<Duration>) -> Result<(), DockerError> {
        info!("Docker push {}", image_name);
        self.exec_with_timeout(&["push", image_name], timeout)?;
        Ok(())
    }

    pub fn pull(&self, image_name: &str, timeout: Option<Duration>) -> Result<(), DockerError> {
        info!("Docker pull {}", image_name);
        self.exec_with_timeout(&["pull", image_name], timeout)?;
        Ok(())
    }

    pub fn remove_image(&self, image_name: &str) -> Result<(), DockerError> {
        info!("Docker remove image {}", image_name);
        self.exec(&["rmi", "--force", image_name])?;
        Ok(())
    }

    /// Repo digest of a local image, e.g. `sha256:abcd...`.
    pub fn image_digest(&self, image_name: &str) -> Result<Option<String>, DockerError> {
        let output = self.exec(&["image", "inspect", "--format", "{{index .RepoDigests 0}}", image_name])?;
        let digest = output
            .stdout
            .first()
            .and_then(|line| line.rsplit('@').next())
            .map(str::to_string);
        Ok(digest)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        container_name: &str,
        image_name: &str,
        ports: &[(u16, u16)],
        envs: &[(&str, &str)],
        detach: bool,
        remove: bool,
        restart_policy: Option<&str>,
        command: &[&str],
    ) -> Result<String, DockerError> {
        info!("Docker run {} as {}", image_name, container_name);
        let mut args: Vec<String> = vec!["run".to_string(), "--name".to_string(), container_name.to_string()];
        if detach {
            args.push("--detach".to_string());
        }
        if remove {
            args.push("--rm".to_string());
        }
        if let Some(policy) = restart_policy {
            args.push("--restart".to_string());
            args.push(policy.to_string());
        }
        for (host_port, container_port) in ports {
            args.push("--publish".to_string());
            args.push(format!("{host_port}:{container_port}"));
        }
        for (key, value) in envs {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(image_name.to_string());
        args.extend(command.iter().map(|c| c.to_string()));

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.exec(&args)?;
        Ok(output.stdout.last().cloned().unwrap_or_default())
    }

    pub fn stop_container(&self, container_name: &str) -> Result<(), DockerError> {
        self.exec(&["stop", container_name])?;
        Ok(())
    }

    pub fn remove_container(&self, container_name: &str, force: bool) -> Result<(), DockerError> {
        let mut args = vec!["rm"];
        if force {
            args.push("--force");
        }
        args.push(container_name);
        self.exec(&args)?;
        Ok(())
    }

    pub fn inspect_container(&self, container_name: &str) -> Result<Option<serde_json::Value>, DockerError> {
        let output = match self.exec(&["container", "inspect", container_name]) {
            Ok(output) => output,
            Err(DockerError::ExitStatusError { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        let parsed: serde_json::Value =
            serde_json::from_str(&output.stdout_string()).map_err(|e| DockerError::ExecutionError {
                raw_error_message: format!("Cannot parse docker inspect output: {e}"),
            })?;
        Ok(parsed.as_array().and_then(|arr| arr.first().cloned()))
    }

    /// Running containers as one JSON value per line, optionally filtered.
    pub fn list_containers(&self, name_filter: Option<&str>) -> Result<Vec<serde_json::Value>, DockerError> {
        let mut args: Vec<String> = vec!["ps".to_string(), "--format".to_string(), "{{json .}}".to_string()];
        if let Some(filter) = name_filter {
            args.push("--filter".to_string());
            args.push(format!("name={filter}"));
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.exec(&args)?;
        let mut containers = Vec::with_capacity(output.stdout.len());
        for line in &output.stdout {
            if line.trim().is_empty() {
                continue;
            }
            let value = serde_json::from_str(line).map_err(|e| DockerError::ExecutionError {
                raw_error_message: format!("Cannot parse docker ps output: {e}"),
            })?;
            containers.push(value);
        }
        Ok(containers)
    }

    /// `repository:tag` references present locally, via `docker images`.
    pub fn list_image_references(&self, repository_filter: &str) -> Result<Vec<String>, DockerError> {
        let output = self.exec(&["images", repository_filter, "--format", "{{.Repository}}:{{.Tag}}"])?;
        Ok(output
            .stdout
            .into_iter()
            .filter(|reference| !reference.is_empty() && !reference.contains("<none>"))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::shell::test_support::FakeShell;

    #[test]
    fn docker_run_builds_expected_argv() {
        let shell = Arc::new(FakeShell::default());
        shell.enqueue_stdout(&["20.10.0"]); // docker version probe
        shell.enqueue_stdout(&["abcd1234"]); // run result
        let docker = Docker::new_with_shell(shell.clone(), None).unwrap();
        let container_id = docker
            .run(
                "web",
                "nginx:latest",
                &[(8080, 80)],
                &[("A", "1")],
                true,
                false,
                Some("always"),
                &[],
            )
            .unwrap();
        assert_eq!(container_id, "abcd1234");
        let calls = shell.recorded_calls();
        let run_call = calls.last().unwrap();
        assert!(run_call.contains(&"--publish".to_string()));
        assert!(run_call.contains(&"8080:80".to_string()));
        assert!(run_call.contains(&"--restart".to_string()));
        assert!(!run_call.contains(&"--rm".to_string()));
    }

    #[test]
    fn build_argv_carries_platform_and_cache_flags() {
        let shell = Arc::new(FakeShell::default());
        shell.enqueue_stdout(&["20.10.0"]);
        let docker = Docker::new_with_shell(shell.clone(), None).unwrap();
        docker
            .build(None, "/tmp/ctx", "web:v1", "linux/amd64", true, &[("REV", "abc")], None)
            .unwrap();
        let calls = shell.recorded_calls();
        let build_call = calls.last().unwrap();
        assert!(build_call.contains(&"--no-cache".to_string()));
        assert!(build_call.contains(&"linux/amd64".to_string()));
        assert!(build_call.contains(&"REV=abc".to_string()));
        assert_eq!(build_call.last().unwrap(), "/tmp/ctx");
    }
}
