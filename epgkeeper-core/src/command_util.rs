use std::env;
use std::io;
use std::process::Stdio;

use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStderr;
use tokio::process::Command;

/// Spawns a child process for a shell-like command line.
///
/// The child process is killed when the returned `Child` is dropped.
pub fn spawn_process<I, O>(command: &str, input: I, output: O) -> Result<Child, Error>
where
    I: Into<Stdio>,
    O: Into<Stdio>,
{
    let words = match shell_words::split(command) {
        Ok(words) => words,
        Err(_) => return Err(Error::UnableToParse(command.to_string())),
    };
    let (prog, args) = match words.split_first() {
        Some(pair) => pair,
        None => return Err(Error::UnableToParse(command.to_string())),
    };
    let log_stderr = env::var_os("EPGKEEPER_DEBUG_CHILD_PROCESS").is_some();
    let mut child = Command::new(prog)
        .args(args)
        .stdin(input)
        .stdout(output)
        .stderr(if log_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| Error::UnableToSpawn(command.to_string(), err))?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_lines(prog.to_string(), child.id(), stderr));
    }
    Ok(child)
}

// Lines may contain invalid UTF-8 sequences.
async fn log_lines(prog: String, pid: Option<u32>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).split(b'\n');
    while let Ok(Some(line)) = lines.next_segment().await {
        let line = String::from_utf8_lossy(&line);
        tracing::debug!(child.prog = %prog, child.pid = ?pid, "{}", line.trim_end());
    }
}

// errors

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unable to parse: {0}")]
    UnableToParse(String),
    #[error("Unable to spawn: {0}: {1}")]
    UnableToSpawn(String, io::Error),
    #[error("Exited abnormally: {0}")]
    ExitedAbnormally(String),
    #[error(transparent)]
    IoError(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use test_log::test;
    use tokio::io::AsyncReadExt;

    #[test(tokio::test)]
    async fn test_spawn_process() {
        let mut child = spawn_process("sh -c 'echo hello'", Stdio::null(), Stdio::piped()).unwrap();
        let mut stdout = child.stdout.take().unwrap();
        let mut buf = String::new();
        stdout.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "hello\n");
        assert!(child.wait().await.unwrap().success());
    }

    #[test(tokio::test)]
    async fn test_spawn_process_unable_to_parse() {
        let result = spawn_process("'", Stdio::null(), Stdio::null());
        assert_matches!(result, Err(Error::UnableToParse(_)));

        let result = spawn_process("", Stdio::null(), Stdio::null());
        assert_matches!(result, Err(Error::UnableToParse(_)));
    }

    #[test(tokio::test)]
    async fn test_spawn_process_unable_to_spawn() {
        let result = spawn_process("no-such-command", Stdio::null(), Stdio::null());
        assert_matches!(result, Err(Error::UnableToSpawn(..)));
    }
}
