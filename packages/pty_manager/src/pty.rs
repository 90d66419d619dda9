use anyhow::Context;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::PtyError;
use crate::utf8::Utf8StreamDecoder;

/// Configuration for spawning a PTY
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: "/bin/bash".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            rows: 20,
            cols: 80,
        }
    }
}

/// State of a PTY session
#[derive(Clone, Debug)]
pub struct PtyState {
    pub running: bool,
    pub pid: Option<u32>,
    pub rows: u16,
    pub cols: u16,
}

/// Receives decoded output in the order the process produced it.
/// Dropped by the reader thread once the PTY reaches EOF.
pub type OutputSink = mpsc::UnboundedSender<String>;

enum PtyMessage {
    Write {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<usize, PtyError>>,
    },
    Resize {
        rows: u16,
        cols: u16,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    GetState {
        respond_to: oneshot::Sender<PtyState>,
    },
    Terminate {
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
}

/// Handle to communicate with a PTY actor
#[derive(Clone, Debug)]
pub struct PtyHandle {
    sender: mpsc::Sender<PtyMessage>,
}

impl PtyHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PtyMessage,
    ) -> Result<T, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| PtyError::ProcessExited)?;
        rx.await.map_err(|_| PtyError::ProcessExited)
    }

    /// Write raw bytes to the PTY
    pub async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        let data = data.to_vec();
        self.request(|respond_to| PtyMessage::Write { data, respond_to })
            .await?
    }

    pub async fn write_str(&self, text: &str) -> Result<usize, PtyError> {
        self.write(text.as_bytes()).await
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.request(|respond_to| PtyMessage::Resize {
            rows,
            cols,
            respond_to,
        })
        .await?
    }

    pub async fn state(&self) -> Result<PtyState, PtyError> {
        self.request(|respond_to| PtyMessage::GetState { respond_to })
            .await
    }

    /// Hang up the shell and stop the actor.
    ///
    /// Terminating a PTY whose process already exited succeeds.
    pub async fn terminate(&self) -> Result<(), PtyError> {
        match self
            .request(|respond_to| PtyMessage::Terminate { respond_to })
            .await
            .and_then(|result| result)
        {
            Err(PtyError::ProcessExited) => Ok(()),
            other => other,
        }
    }
}

/// The PTY actor that owns a single PTY session
pub struct PtyActor {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    state: PtyState,
    receiver: mpsc::Receiver<PtyMessage>,
}

impl PtyActor {
    /// Spawn a new PTY whose output is streamed into `output`
    pub fn spawn(config: PtyConfig, output: OutputSink) -> Result<PtyHandle, PtyError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&config.command);
        for arg in &config.args {
            cmd.arg(arg);
        }
        if let Some(dir) = &config.working_dir {
            cmd.cwd(dir);
        }

        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for key in ["PATH", "HOME", "USER", "LANG"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn command '{}': {}", config.command, e);
            PtyError::CreateFailed(e.to_string())
        })?;
        // The child holds its own copy of the slave; ours would keep EOF from arriving.
        drop(pair.slave);

        let pid = child.process_id();
        info!(pid = ?pid, command = %config.command, "PTY process started");

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")?;

        std::thread::spawn(move || pump_output(reader, output));

        let (msg_tx, msg_rx) = mpsc::channel(32);
        let mut actor = Self {
            master: pair.master,
            writer,
            child,
            state: PtyState {
                running: true,
                pid,
                rows: config.rows,
                cols: config.cols,
            },
            receiver: msg_rx,
        };
        tokio::spawn(async move {
            actor.run().await;
        });

        Ok(PtyHandle { sender: msg_tx })
    }

    async fn run(&mut self) {
        while let Some(msg) = self.receiver.recv().await {
            match msg {
                PtyMessage::Write { data, respond_to } => {
                    let _ = respond_to.send(self.handle_write(&data));
                }
                PtyMessage::Resize {
                    rows,
                    cols,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.handle_resize(rows, cols));
                }
                PtyMessage::GetState { respond_to } => {
                    let _ = respond_to.send(self.state.clone());
                }
                PtyMessage::Terminate { respond_to } => {
                    let result = self.handle_terminate();
                    let done = result.is_ok();
                    let _ = respond_to.send(result);
                    if done {
                        break;
                    }
                }
            }

            if let Ok(Some(status)) = self.child.try_wait() {
                info!(pid = ?self.state.pid, "PTY process exited with status: {:?}", status);
                self.state.running = false;
                break;
            }
        }

        debug!(pid = ?self.state.pid, "PTY actor shutting down");
    }

    fn handle_write(&mut self, data: &[u8]) -> Result<usize, PtyError> {
        self.writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        self.writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        Ok(data.len())
    }

    fn handle_resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;
        self.state.rows = rows;
        self.state.cols = cols;
        Ok(())
    }

    fn handle_terminate(&mut self) -> Result<(), PtyError> {
        if let Ok(Some(_)) = self.child.try_wait() {
            self.state.running = false;
            return Ok(());
        }

        // Interactive shells ignore SIGTERM; SIGHUP makes them exit and hang up their jobs.
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.state.pid {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                    warn!(pid, "SIGHUP failed, falling back to kill: {}", e);
                }
            }
        }

        if !matches!(self.child.try_wait(), Ok(Some(_))) {
            self.child
                .kill()
                .map_err(|e| PtyError::TerminateFailed(e.to_string()))?;
        }

        self.state.running = false;
        Ok(())
    }
}

fn pump_output(mut reader: Box<dyn Read + Send>, output: OutputSink) {
    let mut decoder = Utf8StreamDecoder::new();
    let mut buffer = vec![0u8; 4096];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buffer[..n]);
                if !text.is_empty() && output.send(text).is_err() {
                    debug!("PTY output receiver dropped");
                    return;
                }
            }
            Err(e) => {
                // EIO is how Linux reports a hung-up PTY
                debug!("PTY read ended: {}", e);
                break;
            }
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = output.send(rest);
    }
    debug!("PTY reader thread exiting");
}
