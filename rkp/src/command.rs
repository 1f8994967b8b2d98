use std::{io, process::ExitStatus, time::Duration};

use tokio::{io::AsyncWriteExt, process::Command};

/// Captured result of a child process that exited successfully.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("i/o error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl CommandError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::Failed { status, .. } => status.code(),
            _ => None,
        }
    }
}

/// Run `cmd` to completion, feeding it `stdin` if given.
///
/// The child is killed if it outlives `timeout`. A non-zero exit is an error
/// carrying the child's stderr.
pub async fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    cmd.kill_on_drop(true)
        .stdin(if stdin.is_some() {
            std::process::Stdio::piped()
        } else {
            std::process::Stdio::null()
        })
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
        program: program.clone(),
        source,
    })?;

    let input = child.stdin.take();
    let run = async move {
        if let (Some(mut pipe), Some(data)) = (input, stdin) {
            match pipe.write_all(data).await {
                // The child may not care about stdin at all.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                other => other?,
            }
        }
        let output = child.wait_with_output().await?;
        Ok::<_, io::Error>(output)
    };

    let output = match tokio::time::timeout(timeout, run).await {
        Ok(res) => res.map_err(|source| CommandError::Io {
            program: program.clone(),
            source,
        })?,
        // dropping the future drops the child, which kills it
        Err(_) => return Err(CommandError::Timeout { program, timeout }),
    };

    let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
    if !output.status.success() {
        return Err(CommandError::Failed {
            program,
            status: output.status,
            stderr,
        });
    }
    Ok(CommandOutput { stdout, stderr })
}
