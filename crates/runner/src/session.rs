//! Interactive sessions and the session-script interpreter
//!
//! A [`Session`] is one spawned interactive process with a readable output
//! stream and sendable input. The [`Interpreter`] executes a test case's
//! script against sessions opened on the case's box, holding at most one
//! live session at a time.

use std::process::Stdio;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time;
use tracing::{debug, info};
use vmharness_common::{Error, Result, ScriptLine, TimeoutClass};

use crate::provider::Provider;

/// Environment variable overriding the slow timeout class, in seconds.
pub const SLOW_TIMEOUT_ENV: &str = "SLOW_TEXT_TIMEOUT";

const DEFAULT_SLOW_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit is expected to be prompt once output ends.
const EXIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Input sentinel asking for a freshly generated token.
const GENSYM: &str = "gensym";

const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_LEN: usize = 10;

/// The configured slow timeout; the very-slow class is always double this.
pub fn slow_timeout() -> Duration {
    std::env::var(SLOW_TIMEOUT_ENV)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SLOW_TIMEOUT)
}

/// One spawned interactive process.
///
/// Output is accumulated and matched verbatim; a successful match consumes
/// the stream through the matched text, so a later expect never re-matches
/// output that an earlier line already matched.
pub struct Session {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    buffer: Vec<u8>,
    consumed: usize,
    saw_eof: bool,
}

impl Session {
    /// Spawn `command` with piped stdin/stdout as a new session.
    pub fn spawn(command: &mut Command) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Backend("session has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Backend("session has no stdout".to_string()))?;
        Ok(Self {
            child,
            stdin,
            stdout,
            buffer: Vec::new(),
            consumed: 0,
            saw_eof: false,
        })
    }

    /// Block until `text` appears in the unconsumed output, or fail once
    /// `limit` elapses or the stream closes.
    pub async fn expect(&mut self, text: &str, limit: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if let Some(pos) = find_subslice(&self.buffer[self.consumed..], text.as_bytes()) {
                self.consumed += pos + text.len();
                return Ok(());
            }
            if self.saw_eof {
                return Err(Error::SessionClosed {
                    expected: text.to_string(),
                });
            }
            let remaining = limit.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(Error::ExpectationTimedOut {
                    expected: text.to_string(),
                    elapsed: start.elapsed(),
                });
            }
            match time::timeout(remaining, self.read_chunk()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::ExpectationTimedOut {
                        expected: text.to_string(),
                        elapsed: start.elapsed(),
                    })
                }
            }
        }
    }

    /// Send one line of input to the session.
    pub async fn send_line(&mut self, input: &str) -> Result<()> {
        self.stdin.write_all(input.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Wait for end-of-stream and return the session's exit code.
    pub async fn wait_exit(mut self) -> Result<i32> {
        let start = Instant::now();
        while !self.saw_eof {
            let remaining = EXIT_TIMEOUT.saturating_sub(start.elapsed());
            match time::timeout(remaining, self.read_chunk()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::ExpectationTimedOut {
                        expected: "end of session output".to_string(),
                        elapsed: start.elapsed(),
                    })
                }
            }
        }
        // Stream end does not guarantee the process is reaped yet.
        let status = time::timeout(EXIT_TIMEOUT, self.child.wait())
            .await
            .map_err(|_| Error::ExpectationTimedOut {
                expected: "session exit".to_string(),
                elapsed: start.elapsed(),
            })??;
        Ok(status.code().unwrap_or(-1))
    }

    async fn read_chunk(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        let read = self.stdout.read(&mut chunk).await?;
        if read == 0 {
            self.saw_eof = true;
        } else {
            self.buffer.extend_from_slice(&chunk[..read]);
        }
        Ok(())
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Executes one test case's script against sessions on the case's box.
pub struct Interpreter<'a> {
    provider: &'a dyn Provider,
    box_name: &'a str,
    slow_timeout: Duration,
    session: Option<Session>,
    token: Option<String>,
}

impl<'a> Interpreter<'a> {
    pub fn new(provider: &'a dyn Provider, box_name: &'a str) -> Self {
        Self {
            provider,
            box_name,
            slow_timeout: slow_timeout(),
            session: None,
            token: None,
        }
    }

    /// Run the whole script. The first failing line aborts the remainder.
    pub async fn run_script(&mut self, script: &[ScriptLine]) -> Result<()> {
        for line in script {
            self.step(line).await?;
        }
        Ok(())
    }

    async fn step(&mut self, line: &ScriptLine) -> Result<()> {
        match line {
            ScriptLine::Run { command } => {
                info!("$ {command}");
                // A still-open prior session is dropped here without
                // asserting its exit status.
                self.session = Some(self.provider.open_session(self.box_name, command).await?);
            }
            ScriptLine::Expect { text, timeout } => {
                self.expect(text, *timeout).await?;
            }
            ScriptLine::Type {
                expect,
                input,
                timeout,
            } => {
                self.expect(expect, *timeout).await?;
                let input = if input == GENSYM {
                    self.fresh_token()
                } else {
                    input.clone()
                };
                self.current()?.send_line(&input).await?;
            }
            ScriptLine::ExpectExitCode { preceding, code } => {
                debug!("expecting exit code {code} after {preceding:?}");
                let session = self
                    .session
                    .take()
                    .ok_or_else(|| Error::Backend("$[exitcode] before any $[run]".to_string()))?;
                let actual = session.wait_exit().await?;
                if actual != *code {
                    return Err(Error::UnexpectedExitCode {
                        expected: *code,
                        actual,
                    });
                }
            }
        }
        Ok(())
    }

    async fn expect(&mut self, text: &str, timeout: TimeoutClass) -> Result<()> {
        let text = self.resolve(text);
        // An empty expect matches immediately; test files routinely end with
        // a trailing empty line after the session has already been closed.
        if text.is_empty() {
            return Ok(());
        }
        let limit = timeout.duration(self.slow_timeout);
        info!("expecting {text:?}");
        self.current()?.expect(&text, limit).await
    }

    /// Resolve the `gensym` literal in expect texts to the token generated
    /// earlier in this case, if any.
    fn resolve(&self, text: &str) -> String {
        match &self.token {
            Some(token) => text.replace(GENSYM, token),
            None => text.to_string(),
        }
    }

    fn fresh_token(&mut self) -> String {
        let mut rng = rand::thread_rng();
        let token: String = (0..TOKEN_LEN)
            .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
            .collect();
        self.token = Some(token.clone());
        token
    }

    /// The last token generated for a `gensym` input, if any.
    pub fn last_token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn current(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::Backend("script line before any $[run]".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use vmharness_common::RemoteOutput;

    use super::*;
    use crate::provider::ResumeOutcome;

    /// Runs session commands under a local shell; lifecycle operations are
    /// never reached from the interpreter.
    struct ShellProvider;

    #[async_trait]
    impl Provider for ShellProvider {
        async fn resume(&self, _box_name: &str) -> Result<ResumeOutcome> {
            unreachable!()
        }
        async fn up(&self, _box_name: &str) -> Result<()> {
            unreachable!()
        }
        async fn suspend(&self, _box_name: &str) -> Result<()> {
            unreachable!()
        }
        async fn halt(&self, _box_name: &str) -> Result<()> {
            unreachable!()
        }
        async fn destroy(&self, _box_name: &str) -> Result<()> {
            unreachable!()
        }
        async fn rsync(&self, _box_name: &str) -> Result<()> {
            unreachable!()
        }
        async fn run_remote(&self, _box_name: &str, _command: &str) -> Result<RemoteOutput> {
            unreachable!()
        }
        async fn open_session(&self, _box_name: &str, command: &str) -> Result<Session> {
            Session::spawn(Command::new("sh").arg("-c").arg(command))
        }
    }

    fn script(lines: &[&str]) -> Vec<ScriptLine> {
        lines
            .iter()
            .map(|l| crate::testfile::parse_script_line(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn echo_with_expected_exit_code_passes() {
        let mut interp = Interpreter::new(&ShellProvider, "local");
        interp
            .run_script(&script(&["$[run]echo hi", "hi$[exitcode]0"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exit_code_mismatch_is_reported() {
        let mut interp = Interpreter::new(&ShellProvider, "local");
        let err = interp
            .run_script(&script(&["$[run]echo hi; exit 1", "hi$[exitcode]0"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedExitCode {
                expected: 0,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn type_sends_input_after_match() {
        let mut interp = Interpreter::new(&ShellProvider, "local");
        interp
            .run_script(&script(&[
                "$[run]printf 'name? '; read x; echo \"got $x\"",
                "name?$[type]bob",
                "got bob",
                "$[exitcode]0",
            ]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn matched_output_is_consumed() {
        let mut interp = Interpreter::new(&ShellProvider, "local");
        // Both expects succeed only because the text appears twice.
        interp
            .run_script(&script(&["$[run]echo 'one two one'", "one", "one", "$[exitcode]0"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_text_times_out() {
        let mut interp = Interpreter::new(&ShellProvider, "local");
        let err = interp
            .run_script(&script(&["$[run]sleep 5", "never appears"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExpectationTimedOut { expected, .. } if expected == "never appears"));
    }

    #[tokio::test]
    async fn closed_stream_fails_fast() {
        let mut interp = Interpreter::new(&ShellProvider, "local");
        let start = Instant::now();
        let err = interp
            .run_script(&script(&["$[run]echo done", "missing"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionClosed { .. }));
        // Fails on stream end, well before the two-second class timeout.
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn gensym_generates_fresh_tokens_and_matches_later() {
        let run = "$[run]read x; echo \"token $x accepted\"";
        let mut first = Interpreter::new(&ShellProvider, "local");
        first
            .run_script(&script(&[
                run,
                "$[type]gensym",
                "token gensym accepted",
                "$[exitcode]0",
            ]))
            .await
            .unwrap();
        let mut second = Interpreter::new(&ShellProvider, "local");
        second
            .run_script(&script(&[run, "$[type]gensym", "$[exitcode]0"]))
            .await
            .unwrap();

        let a = first.last_token().unwrap().to_string();
        let b = second.last_token().unwrap().to_string();
        assert_eq!(a.len(), 10);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn second_run_discards_prior_session_without_asserting() {
        let mut interp = Interpreter::new(&ShellProvider, "local");
        // The first session exits non-zero but its fate is never asserted.
        interp
            .run_script(&script(&[
                "$[run]exit 3",
                "$[run]echo fresh",
                "fresh$[exitcode]0",
            ]))
            .await
            .unwrap();
    }

    #[test]
    fn veryslow_is_exactly_double_slow() {
        for base in [1u64, 7, 30, 120] {
            let base = Duration::from_secs(base);
            assert_eq!(
                TimeoutClass::VerySlow.duration(base),
                TimeoutClass::Slow.duration(base) * 2
            );
        }
    }
}
