use std::io::{BufRead, BufReader};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum ShellError {
    #[error("Cannot spawn `{binary}`: {raw_error_message:?}")]
    ExecutionError { binary: String, raw_error_message: String },

    #[error("`{binary}` terminated with a non success exit status code {exit_status:?}: {stderr_tail:?}")]
    ExitStatusError {
        binary: String,
        exit_status: ExitStatus,
        stderr_tail: String,
    },

    #[error("`{binary}` killed after {timeout:?} timeout")]
    Timeout { binary: String, timeout: Duration },
}

/// Output of one shell invocation, line-split.
#[derive(Debug, Default, Clone)]
pub struct ShellOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ShellOutput {
    pub fn stdout_string(&self) -> String {
        self.stdout.join("\n")
    }
}

/// Seam for every external binary invocation (`docker`, `az`, `gcloud`,
/// `minikube`); tests inject fakes here.
pub trait Shell: Send + Sync {
    fn run(
        &self,
        binary: &str,
        args: &[&str],
        envs: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<ShellOutput, ShellError>;
}

#[derive(Default)]
pub struct SystemShell;

impl Shell for SystemShell {
    fn run(
        &self,
        binary: &str,
        args: &[&str],
        envs: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<ShellOutput, ShellError> {
        debug!("command: {} {}", binary, args.join(" "));
        let mut command = Command::new(binary);
        command.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        for (key, value) in envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| ShellError::ExecutionError {
            binary: binary.to_string(),
            raw_error_message: e.to_string(),
        })?;

        // Dedicated reader threads keep the child from blocking on a full
        // pipe while the parent waits on it.
        let stdout_reader = child.stdout.take().map(spawn_line_reader);
        let stderr_reader = child.stderr.take().map(spawn_line_reader);

        let deadline = timeout.map(|t| Instant::now() + t);
        let exit_status = loop {
            match child.try_wait() {
                Ok(Some(exit_status)) => break exit_status,
                Ok(None) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            warn!("Killing `{}` after {:?} timeout", binary, timeout.unwrap_or_default());
                            terminate(&mut child);
                            drain(stdout_reader);
                            drain(stderr_reader);
                            return Err(ShellError::Timeout {
                                binary: binary.to_string(),
                                timeout: timeout.unwrap_or_default(),
                            });
                        }
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    return Err(ShellError::ExecutionError {
                        binary: binary.to_string(),
                        raw_error_message: e.to_string(),
                    });
                }
            }
        };

        let output = ShellOutput {
            stdout: drain(stdout_reader),
            stderr: drain(stderr_reader),
        };
        if !exit_status.success() {
            return Err(ShellError::ExitStatusError {
                binary: binary.to_string(),
                exit_status,
                stderr_tail: output.stderr.last().cloned().unwrap_or_default(),
            });
        }
        Ok(output)
    }
}

fn spawn_line_reader<R: std::io::Read + Send + 'static>(source: R) -> thread::JoinHandle<Vec<String>> {
    thread::spawn(move || BufReader::new(source).lines().map_while(Result::ok).collect())
}

fn drain(reader: Option<thread::JoinHandle<Vec<String>>>) -> Vec<String> {
    reader.and_then(|handle| handle.join().ok()).unwrap_or_default()
}

/// SIGINT first so the child can shut down cleanly, hard kill once the
/// grace period is over.
fn terminate(child: &mut Child) {
    unsafe {
        let _ = libc::kill(child.id() as i32, libc::SIGINT);
    }
    let killed_since = Instant::now();
    while let Ok(None) = child.try_wait() {
        if killed_since.elapsed() > KILL_GRACE_PERIOD {
            let _ = child.kill();
        }
        thread::sleep(Duration::from_millis(100));
    }
    let _ = child.wait();
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records invocations and replays canned outputs, oldest first.
    #[derive(Default)]
    pub struct FakeShell {
        pub calls: Mutex<Vec<Vec<String>>>,
        pub outputs: Mutex<VecDeque<Result<ShellOutput, String>>>,
    }

    impl FakeShell {
        pub fn enqueue_stdout(&self, lines: &[&str]) {
            self.outputs.lock().unwrap().push_back(Ok(ShellOutput {
                stdout: lines.iter().map(|s| s.to_string()).collect(),
                stderr: vec![],
            }));
        }

        pub fn recorded_calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Shell for FakeShell {
        fn run(
            &self,
            binary: &str,
            args: &[&str],
            _envs: &[(&str, &str)],
            _timeout: Option<Duration>,
        ) -> Result<ShellOutput, ShellError> {
            let mut call = vec![binary.to_string()];
            call.extend(args.iter().map(|a| a.to_string()));
            self.calls.lock().unwrap().push(call);
            match self.outputs.lock().unwrap().pop_front() {
                Some(Ok(output)) => Ok(output),
                Some(Err(message)) => Err(ShellError::ExecutionError {
                    binary: binary.to_string(),
                    raw_error_message: message,
                }),
                None => Ok(ShellOutput::default()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_lines_in_order() {
        let output = SystemShell
            .run("sh", &["-c", "echo one; echo two"], &[], None)
            .unwrap();
        assert_eq!(output.stdout, vec!["one", "two"]);
        assert!(output.stderr.is_empty());
    }

    #[test]
    fn environment_variables_reach_the_child() {
        let output = SystemShell
            .run("sh", &["-c", "echo $GREETING"], &[("GREETING", "hello")], None)
            .unwrap();
        assert_eq!(output.stdout_string(), "hello");
    }

    #[test]
    fn non_zero_exit_carries_the_stderr_tail() {
        let result = SystemShell.run("sh", &["-c", "echo oops >&2; exit 3"], &[], None);
        match result {
            Err(ShellError::ExitStatusError { stderr_tail, .. }) => assert_eq!(stderr_tail, "oops"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn timeout_kills_the_child() {
        let started = Instant::now();
        let result = SystemShell.run("sleep", &["30"], &[], Some(Duration::from_secs(1)));
        assert!(matches!(result, Err(ShellError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[test]
    fn missing_binary_is_an_execution_error() {
        let result = SystemShell.run("definitely-not-a-binary", &[], &[], None);
        assert!(matches!(result, Err(ShellError::ExecutionError { .. })));
    }
}
