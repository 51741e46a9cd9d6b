use std::io;
use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::status::StatusScanner;

/// The status leg of a running gpg: `--status-fd 2` points it at stderr.
pub type StatusLeg = StatusScanner<BufReader<ChildStderr>>;

const READ_CHUNK: usize = 8192;

/// One running gpg process and its three pipes.
///
/// - the command leg (stdin) carries answers to prompts, or input data;
/// - the status leg (stderr) carries `[GNUPG:]` lines and diagnostics;
/// - the output leg (stdout) carries listings and exported data.
///
/// The output leg is drained in the background so gpg never stalls on a
/// full pipe while the caller waits on the status leg. The child is killed
/// if the session is dropped before [`close`](Self::close).
pub struct Session {
    child: Child,
    stdin: Option<ChildStdin>,
    feeder: Option<JoinHandle<io::Result<()>>>,
    status: StatusLeg,
    chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    reader: Option<JoinHandle<io::Result<()>>>,
    output: Vec<u8>,
    cursor: usize,
    output_done: bool,
    exit: Option<i32>,
}

impl Session {
    /// Spawns `gpg` for `verb` with the options of `ctx`.
    pub fn start<I, S>(ctx: &Context, verb: &str, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let mut cmd = ctx.command(verb, args);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(binary = ctx.binary(), verb, "starting gpg");
        trace!(?cmd);

        let mut child = cmd.spawn().map_err(|source| Error::Startup {
            binary: ctx.binary().to_string(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or(Error::PipeCaptureFailed("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(Error::PipeCaptureFailed("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(Error::PipeCaptureFailed("stderr"))?;

        let (tx, chunks) = mpsc::unbounded_channel();
        let reader = tokio::spawn(pump_output(stdout, tx));

        Ok(Self {
            child,
            stdin: Some(stdin),
            feeder: None,
            status: StatusScanner::new(BufReader::new(stderr)),
            chunks,
            reader: Some(reader),
            output: Vec::new(),
            cursor: 0,
            output_done: false,
            exit: None,
        })
    }

    /// Sends one answer on the command leg.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or(Error::SessionClosed)?;
        trace!(line, "answering");
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Streams `data` to the command leg from a separate task and closes
    /// the leg once written.
    pub fn feed(&mut self, data: Vec<u8>) -> Result<()> {
        let mut stdin = self.stdin.take().ok_or(Error::SessionClosed)?;
        self.feeder = Some(tokio::spawn(async move {
            stdin.write_all(&data).await?;
            stdin.shutdown().await
        }));
        Ok(())
    }

    pub fn status(&mut self) -> &mut StatusLeg {
        &mut self.status
    }

    /// The next line of the output leg, without its line terminator.
    ///
    /// Returns `None` once gpg has closed stdout and every line was read.
    pub async fn read_output_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.output[self.cursor..].iter().position(|&b| b == b'\n') {
                let end = self.cursor + pos;
                let line = trim_line(&self.output[self.cursor..end]);
                self.cursor = end + 1;
                return Ok(Some(line));
            }
            if !self.receive().await {
                if self.cursor < self.output.len() {
                    let line = trim_line(&self.output[self.cursor..]);
                    self.cursor = self.output.len();
                    return Ok(Some(line));
                }
                return Ok(None);
            }
        }
    }

    /// Closes the command leg, drains the status and output legs and
    /// waits for gpg to exit.
    ///
    /// Calling it again returns the same exit code. A gpg killed by a
    /// signal reports `-1`.
    pub async fn close(&mut self) -> Result<i32> {
        if let Some(code) = self.exit {
            return Ok(code);
        }
        drop(self.stdin.take());
        if let Some(feeder) = self.feeder.take() {
            match feeder.await.map_err(io::Error::other)? {
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("gpg stopped reading its input early");
                }
                result => result?,
            }
        }

        self.status.drain().await?;
        while self.receive().await {}
        if let Some(reader) = self.reader.take() {
            reader.await.map_err(io::Error::other)??;
        }

        let status = self.child.wait().await?;
        let code = status.code().unwrap_or(-1);
        debug!(code, output_bytes = self.output.len(), "gpg exited");
        self.exit = Some(code);
        Ok(code)
    }

    /// Kills gpg and reaps it. Nothing more is read or written afterwards.
    pub async fn abort(&mut self) -> Result<i32> {
        if let Some(code) = self.exit {
            return Ok(code);
        }
        if let Err(err) = self.child.start_kill() {
            warn!(%err, "failed to kill gpg");
        }
        drop(self.stdin.take());
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        let status = self.child.wait().await?;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        let code = status.code().unwrap_or(-1);
        debug!(code, "gpg aborted");
        self.exit = Some(code);
        Ok(code)
    }

    /// The exit code, once the session is closed or aborted.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit
    }

    /// Everything gpg wrote on stdout so far; complete after `close`.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn into_output(self) -> Vec<u8> {
        self.output
    }

    /// The diagnostics gpg printed between its status lines.
    pub fn diagnostics(&self) -> String {
        self.status.diagnostics()
    }

    async fn receive(&mut self) -> bool {
        if self.output_done {
            return false;
        }
        match self.chunks.recv().await {
            Some(chunk) => {
                self.output.extend_from_slice(&chunk);
                true
            }
            None => {
                self.output_done = true;
                false
            }
        }
    }
}

async fn pump_output(mut stdout: ChildStdout, tx: mpsc::UnboundedSender<Vec<u8>>) -> io::Result<()> {
    let mut buf = vec![0; READ_CHUNK];
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 || tx.send(buf[..n].to_vec()).is_err() {
            return Ok(());
        }
    }
}

fn trim_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::fake_gpg;

    #[tokio::test]
    async fn test_missing_binary() {
        let ctx = Context::with_binary("/nonexistent/gpg");
        match Session::start(&ctx, "version", [] as [&str; 0]) {
            Err(Error::Startup { binary, .. }) => assert_eq!(binary, "/nonexistent/gpg"),
            Err(other) => panic!("expected Startup error, got {other:?}"),
            Ok(_) => panic!("expected Startup error"),
        }
    }

    #[tokio::test]
    async fn test_conversation_round_trip() {
        let (_dir, ctx) = fake_gpg(
            r#"echo '[GNUPG:] GET_LINE test.prompt' >&2
read answer
echo '[GNUPG:] GOT_IT' >&2
echo "answer:$answer"
exit 3"#,
        );
        let mut session = Session::start(&ctx, "edit-key", ["DEADBEEF"]).unwrap();
        session.status().seek(r"GET_LINE test\.prompt").await.unwrap();
        session.write_line("hello").await.unwrap();
        session.status().expect("GOT_IT").await.unwrap();
        assert_eq!(
            session.read_output_line().await.unwrap().as_deref(),
            Some("answer:hello")
        );
        assert_eq!(session.close().await.unwrap(), 3);
        assert_eq!(session.close().await.unwrap(), 3);
        assert_eq!(session.exit_code(), Some(3));
        assert!(matches!(
            session.write_line("late").await,
            Err(Error::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_arguments_reach_binary() {
        let (_dir, ctx) = fake_gpg(r#"echo "$@""#);
        let mut session = Session::start(&ctx, "list-keys", ["alice@example.org"]).unwrap();
        assert_eq!(session.close().await.unwrap(), 0);
        let output = String::from_utf8(session.into_output()).unwrap();
        assert!(output.starts_with("--status-fd 2 --command-fd 0"));
        assert!(output.trim_end().ends_with("--list-keys alice@example.org"));
    }

    #[tokio::test]
    async fn test_feed_and_capture_output() {
        let (_dir, ctx) = fake_gpg("cat\necho 'gpg: done' >&2");
        let mut session = Session::start(&ctx, "import", [] as [&str; 0]).unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(256 * 1024).collect();
        session.feed(data.clone()).unwrap();
        assert!(matches!(session.feed(Vec::new()), Err(Error::SessionClosed)));
        assert_eq!(session.close().await.unwrap(), 0);
        assert_eq!(session.output(), &data[..]);
        assert_eq!(session.diagnostics(), "gpg: done");
    }

    #[tokio::test]
    async fn test_output_without_trailing_newline() {
        let (_dir, ctx) = fake_gpg("printf 'one\\r\\ntwo'");
        let mut session = Session::start(&ctx, "list-keys", [] as [&str; 0]).unwrap();
        assert_eq!(session.read_output_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(session.read_output_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(session.read_output_line().await.unwrap(), None);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_kills_waiting_child() {
        let (_dir, ctx) = fake_gpg("read never\nexit 0");
        let mut session = Session::start(&ctx, "sign-key", ["DEADBEEF"]).unwrap();
        assert_eq!(session.abort().await.unwrap(), -1);
        assert_eq!(session.close().await.unwrap(), -1);
    }
}
