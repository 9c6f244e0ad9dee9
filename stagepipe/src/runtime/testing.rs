//! In-process simulated task runtime.
//!
//! `SimRuntime` stands in for a real container engine in tests: stages
//! are tokio tasks that attach to the pipeline's FIFOs by path, exactly
//! as an external runtime would, with scripted behaviors and failure
//! injection. An event journal records pull/create/start/delete order
//! for cleanup assertions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::oneshot;

use crate::config::StageSpec;
use crate::errors::{StagepipeError, StagepipeResult};
use crate::pipeline::IoBinding;
use crate::runtime::{ExitStatus, TaskHandle, TaskRuntime, WaitHandle};

/// Scripted behavior for one simulated stage.
#[derive(Debug, Clone)]
pub enum StageBehavior {
    /// Write the bytes to stdout, then exit with the given code.
    Emit { bytes: Vec<u8>, code: i32 },
    /// Copy stdin to the capture buffer and to stdout until EOF, then
    /// exit 0.
    PassThrough,
    /// Exit immediately without touching any stream.
    Exit(i32),
    /// Never complete. For deadline tests.
    Hang,
}

impl StageBehavior {
    /// Emit bytes and exit 0.
    pub fn emit(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Emit {
            bytes: bytes.into(),
            code: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Journal {
    pulled: Vec<String>,
    created: Vec<String>,
    started: Vec<String>,
    stdin_closed: Vec<String>,
    deleted: Vec<String>,
}

#[derive(Debug, Default)]
struct SimState {
    behaviors: Mutex<HashMap<String, StageBehavior>>,
    journal: Mutex<Journal>,
    captures: Mutex<HashMap<String, Vec<u8>>>,
    fail_create: Mutex<Option<String>>,
    fail_start: Mutex<Option<String>>,
    fail_wait: Mutex<Option<String>>,
    fail_close_stdin: Mutex<Option<String>>,
}

/// Simulated task runtime. Cheap to clone; clones share state, so a
/// test can keep one handle for assertions after the run.
#[derive(Debug, Clone, Default)]
pub struct SimRuntime {
    state: Arc<SimState>,
}

impl SimRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage behavior, keyed by stage id. Chainable.
    pub fn stage(self, id: &str, behavior: StageBehavior) -> Self {
        self.state.behaviors.lock().insert(id.to_string(), behavior);
        self
    }

    /// Reject `create_task` for the given stage id.
    pub fn fail_create(self, id: &str) -> Self {
        *self.state.fail_create.lock() = Some(id.to_string());
        self
    }

    /// Reject `start` for the given stage id.
    pub fn fail_start(self, id: &str) -> Self {
        *self.state.fail_start.lock() = Some(id.to_string());
        self
    }

    /// Break the completion channel for the given stage id: `wait`
    /// hands out a receiver whose sender is already gone, as when the
    /// runtime connection is lost.
    pub fn fail_wait(self, id: &str) -> Self {
        *self.state.fail_wait.lock() = Some(id.to_string());
        self
    }

    /// Reject `close_stdin` for the given stage id.
    pub fn fail_close_stdin(self, id: &str) -> Self {
        *self.state.fail_close_stdin.lock() = Some(id.to_string());
        self
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state.journal.lock().pulled.clone()
    }

    pub fn created(&self) -> Vec<String> {
        self.state.journal.lock().created.clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.state.journal.lock().started.clone()
    }

    pub fn stdin_closed(&self) -> Vec<String> {
        self.state.journal.lock().stdin_closed.clone()
    }

    /// Deletion order; cleanup runs most-recently-created first.
    pub fn deleted(&self) -> Vec<String> {
        self.state.journal.lock().deleted.clone()
    }

    /// Bytes a `PassThrough` stage consumed from its stdin.
    pub fn captured(&self, id: &str) -> Vec<u8> {
        self.state
            .captures
            .lock()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TaskRuntime for SimRuntime {
    async fn pull(&self, image: &str) -> StagepipeResult<()> {
        self.state.journal.lock().pulled.push(image.to_string());
        Ok(())
    }

    async fn create_task(
        &self,
        spec: &StageSpec,
        io: &IoBinding,
    ) -> StagepipeResult<Box<dyn TaskHandle>> {
        if self.state.fail_create.lock().as_deref() == Some(spec.id.as_str()) {
            return Err(StagepipeError::Creation(format!(
                "injected create failure for {}",
                spec.id
            )));
        }
        let behavior = self
            .state
            .behaviors
            .lock()
            .remove(&spec.id)
            .ok_or_else(|| {
                StagepipeError::Creation(format!("no behavior registered for {}", spec.id))
            })?;

        self.state.journal.lock().created.push(spec.id.clone());

        Ok(Box::new(SimTask {
            id: spec.id.clone(),
            io: io.clone(),
            behavior: Mutex::new(Some(behavior)),
            slot: Arc::new(Mutex::new(CompletionSlot::default())),
            state: Arc::clone(&self.state),
        }))
    }
}

#[derive(Debug, Default)]
struct CompletionSlot {
    done: Option<ExitStatus>,
    waiters: Vec<oneshot::Sender<ExitStatus>>,
}

fn complete(slot: &Mutex<CompletionSlot>, status: ExitStatus) {
    let mut slot = slot.lock();
    slot.done = Some(status);
    for waiter in slot.waiters.drain(..) {
        let _ = waiter.send(status);
    }
}

struct SimTask {
    id: String,
    io: IoBinding,
    behavior: Mutex<Option<StageBehavior>>,
    slot: Arc<Mutex<CompletionSlot>>,
    state: Arc<SimState>,
}

impl SimTask {
    async fn run_behavior(
        behavior: StageBehavior,
        id: String,
        io: IoBinding,
        slot: Arc<Mutex<CompletionSlot>>,
        state: Arc<SimState>,
    ) {
        match behavior {
            StageBehavior::Emit { bytes, code } => {
                if let Some(path) = io.stdout.as_deref() {
                    match pipe::OpenOptions::new().open_sender(path) {
                        Ok(mut sender) => {
                            if let Err(e) = sender.write_all(&bytes).await {
                                tracing::warn!(stage_id = %id, error = %e, "sim emit failed");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(stage_id = %id, error = %e, "sim stdout attach failed")
                        }
                    }
                }
                complete(&slot, ExitStatus { code });
            }
            StageBehavior::PassThrough => {
                let code = Self::pass_through(&id, &io, &state).await;
                complete(&slot, ExitStatus { code });
            }
            StageBehavior::Exit(code) => complete(&slot, ExitStatus { code }),
            StageBehavior::Hang => {}
        }
    }

    async fn pass_through(id: &str, io: &IoBinding, state: &SimState) -> i32 {
        let Some(stdin_path) = io.stdin.as_deref() else {
            return 0;
        };
        let mut stdin = match pipe::OpenOptions::new().open_receiver(stdin_path) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(stage_id = %id, error = %e, "sim stdin attach failed");
                return 1;
            }
        };
        let mut stdout = match io.stdout.as_deref() {
            Some(path) => match pipe::OpenOptions::new().open_sender(path) {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!(stage_id = %id, error = %e, "sim stdout attach failed");
                    return 1;
                }
            },
            None => None,
        };

        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    state
                        .captures
                        .lock()
                        .entry(id.to_string())
                        .or_default()
                        .extend_from_slice(&buf[..n]);
                    if let Some(out) = stdout.as_mut() {
                        if let Err(e) = out.write_all(&buf[..n]).await {
                            tracing::warn!(stage_id = %id, error = %e, "sim forward failed");
                            return 1;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(stage_id = %id, error = %e, "sim stdin read failed");
                    return 1;
                }
            }
        }
        0
    }
}

#[async_trait]
impl TaskHandle for SimTask {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> StagepipeResult<()> {
        if self.state.fail_start.lock().as_deref() == Some(self.id.as_str()) {
            return Err(StagepipeError::Start(format!(
                "injected start failure for {}",
                self.id
            )));
        }
        self.state.journal.lock().started.push(self.id.clone());

        let behavior = self
            .behavior
            .lock()
            .take()
            .ok_or_else(|| StagepipeError::Start(format!("{} already started", self.id)))?;

        tokio::spawn(Self::run_behavior(
            behavior,
            self.id.clone(),
            self.io.clone(),
            Arc::clone(&self.slot),
            Arc::clone(&self.state),
        ));
        Ok(())
    }

    async fn wait(&self) -> StagepipeResult<WaitHandle> {
        let (tx, rx) = oneshot::channel();
        if self.state.fail_wait.lock().as_deref() == Some(self.id.as_str()) {
            drop(tx);
            return Ok(rx);
        }
        let mut slot = self.slot.lock();
        match slot.done {
            // Resolve immediately for tasks that already exited, so a
            // late wait cannot hang forever.
            Some(status) => {
                let _ = tx.send(status);
            }
            None => slot.waiters.push(tx),
        }
        Ok(rx)
    }

    async fn close_stdin(&self) -> StagepipeResult<()> {
        if self.state.fail_close_stdin.lock().as_deref() == Some(self.id.as_str()) {
            return Err(StagepipeError::Close(format!(
                "injected close failure for {}",
                self.id
            )));
        }
        self.state.journal.lock().stdin_closed.push(self.id.clone());
        Ok(())
    }

    async fn delete(&self) -> StagepipeResult<()> {
        self.state.journal.lock().deleted.push(self.id.clone());
        Ok(())
    }
}
