//! C1: GTP Engine Session — spawn, converse with, and reap one engine
//! subprocess under the strict one-request/one-response discipline of the Go
//! Text Protocol.
//!
//! Grounded on
//! `natsutteatsuiyone-neural-reversi/automatch/src/engine.rs`'s `GtpEngine`
//! for the spawn/send/read-until-blank-line/reap shape, adapted to
//! `tokio::process` so a hung engine blocks only the worker task awaiting it,
//! never the runtime. Protocol details (comment lines, version parsing) come
//! from `autogtp/Game.cpp`'s `sendGtpCommand`/`checkVersion`/`eatNewLine`.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};

/// Errors raised while driving an engine subprocess.
#[derive(Debug, thiserror::Error)]
pub enum GtpError {
    /// The subprocess could not be spawned.
    #[error("could not start engine: {0}")]
    NoEngine(#[source] std::io::Error),
    /// The subprocess exited (or its pipes closed) while a response was
    /// expected.
    #[error("engine process died")]
    ProcessDied,
    /// A line was read but did not begin with `=` (GTP error response or
    /// protocol violation).
    #[error("unexpected GTP response: {0}")]
    WrongGtp(String),
    /// I/O error talking to the subprocess's pipes.
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A live engine subprocess speaking GTP over its stdio pipes.
pub struct GtpSession {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

/// Minimum engine version accepted, as an `(major, minor, patch)` triple.
pub type VersionTriple = (u32, u32, u32);

impl GtpSession {
    /// Spawns `binary options network` with piped stdio.
    pub async fn spawn(binary: &str, options: &str, network: &str) -> Result<Self, GtpError> {
        let mut cmd = tokio::process::Command::new(binary);
        for arg in options.split_whitespace() {
            cmd.arg(arg);
        }
        cmd.arg(network);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(GtpError::NoEngine)?;
        let stdin = child.stdin.take().ok_or(GtpError::ProcessDied)?;
        let stdout = child.stdout.take().ok_or(GtpError::ProcessDied)?;
        let lines = BufReader::new(stdout).lines();
        Ok(Self { child, stdin, lines })
    }

    /// Sends `version`, tolerating a leading `#`-prefixed comment line (the
    /// engine emits one during OpenCL tuning), and fails if the parsed
    /// `a.b[.c]` triple is lexicographically less than `min`.
    pub async fn check_version(&mut self, min: VersionTriple) -> Result<(), GtpError> {
        let response = self.command("version").await?;
        let found = parse_version(&response).ok_or_else(|| GtpError::WrongGtp(response.clone()))?;
        if found < min {
            return Err(GtpError::WrongGtp(format!(
                "engine version {}.{}.{} below minimum {}.{}.{}",
                found.0, found.1, found.2, min.0, min.1, min.2
            )));
        }
        Ok(())
    }

    /// Sends one GTP command and returns the payload of the `=`-prefixed
    /// response line (without the `= ` prefix), having consumed the
    /// terminating blank line. `#`-prefixed lines encountered while waiting
    /// are treated as status comments: printed, then skipped.
    pub async fn command(&mut self, cmd: &str) -> Result<String, GtpError> {
        self.stdin.write_all(cmd.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;

        let response = loop {
            let line = self
                .lines
                .next_line()
                .await?
                .ok_or(GtpError::ProcessDied)?;
            if let Some(comment) = line.strip_prefix('#') {
                println!("{comment}");
                continue;
            }
            break line;
        };

        if !response.starts_with('=') {
            return Err(GtpError::WrongGtp(response));
        }
        // GTP responses are terminated by a blank line.
        let _ = self.lines.next_line().await?;

        Ok(response
            .trim_start_matches('=')
            .trim_start()
            .to_string())
    }

    /// Sends `genmove <color>` and returns the move text (a coordinate,
    /// `"pass"`, or `"resign"`, case preserved as the engine returned it).
    pub async fn genmove(&mut self, color: char) -> Result<String, GtpError> {
        self.command(&format!("genmove {color}")).await
    }

    /// Sends `quit` and waits for the process to exit.
    pub async fn quit(&mut self) -> Result<(), GtpError> {
        let _ = self.stdin.write_all(b"quit\n").await;
        let _ = self.stdin.flush().await;
        let _ = self.child.wait().await;
        Ok(())
    }
}

impl Drop for GtpSession {
    fn drop(&mut self) {
        // Best-effort reap: a panicking or early-returning Game Driver must
        // never leak a running engine subprocess.
        let _ = self.child.start_kill();
    }
}

/// Parses a `"major[.minor[.patch]]"` version string.
pub fn parse_version(text: &str) -> Option<VersionTriple> {
    let text = text.trim();
    let mut parts = text.split('.');
    let major: u32 = parts.next()?.trim().parse().ok()?;
    let minor: u32 = parts.next().unwrap_or("0").trim().parse().unwrap_or(0);
    let patch: u32 = parts.next().unwrap_or("0").trim().parse().unwrap_or(0);
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_and_three_part_versions() {
        assert_eq!(parse_version("0.17"), Some((0, 17, 0)));
        assert_eq!(parse_version("0.17.1"), Some((0, 17, 1)));
        assert_eq!(parse_version("bogus"), None);
    }

    #[test]
    fn version_ordering_matches_lexicographic_triple_compare() {
        assert!((0, 16, 9) < (0, 17, 0));
        assert!((0, 17, 0) >= (0, 17, 0));
    }
}
