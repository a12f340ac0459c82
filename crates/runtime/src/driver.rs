//! Pipeline driver: wires source, operators, and sink into one flow and
//! owns the run/shutdown lifecycle.
//!
//! State machine: `Idle -> Running -> (Draining | Failed) -> Stopped`.
//! A stop signal drains the pipeline (source stops, partial batches flush,
//! in-flight work resolves); a fatal sink error aborts without draining.

use crate::{spawn_operator, spawn_sink, spawn_source, stream_channel, Operator, Receiver, Sink, Source};
use anyhow::{anyhow, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Lifecycle states of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    /// Stop requested: source halted, buffered and in-flight work resolving.
    Draining,
    /// Aborted on a fatal error without draining.
    Failed(String),
    Stopped,
}

type SpawnFn = Box<dyn FnOnce() -> JoinHandle<Result<()>> + Send>;

struct PendingTask {
    name: &'static str,
    spawn: SpawnFn,
}

/// Entry point for wiring a pipeline.
pub struct PipelineWiring {
    capacity: usize,
    stop: CancellationToken,
}

impl PipelineWiring {
    /// Token that triggers the drain sequence when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Begin the chain with a source stage.
    pub fn source<S>(self, name: &'static str, source: S) -> PipelineBuilder<S::Out>
    where
        S: Source,
    {
        let (tx, rx) = stream_channel(self.capacity);
        let token = self.stop.child_token();
        let spawn: SpawnFn = Box::new(move || spawn_source(name, tx, source, token));
        PipelineBuilder {
            capacity: self.capacity,
            stop: self.stop,
            stages: vec![PendingTask { name, spawn }],
            head: rx,
        }
    }
}

/// A partially wired pipeline whose current edge carries `T`.
///
/// Stages are connected by bounded channels and spawned when [`Pipeline::run`]
/// is called, not at wiring time.
pub struct PipelineBuilder<T> {
    capacity: usize,
    stop: CancellationToken,
    stages: Vec<PendingTask>,
    head: Receiver<T>,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Append an operator stage.
    pub fn operator<O>(mut self, name: &'static str, op: O) -> PipelineBuilder<O::Out>
    where
        O: Operator<In = T>,
    {
        let (tx, rx) = stream_channel(self.capacity);
        let head = self.head;
        let spawn: SpawnFn = Box::new(move || spawn_operator(name, op, head, tx));
        self.stages.push(PendingTask { name, spawn });
        PipelineBuilder {
            capacity: self.capacity,
            stop: self.stop,
            stages: self.stages,
            head: rx,
        }
    }

    /// Terminate the chain with a sink stage.
    pub fn sink<S>(self, name: &'static str, sink: S) -> Pipeline
    where
        S: Sink<In = T>,
    {
        let head = self.head;
        let spawn: SpawnFn = Box::new(move || spawn_sink(name, head, sink));
        let (state_tx, state_rx) = watch::channel(PipelineState::Idle);
        Pipeline {
            stop: self.stop,
            stages: self.stages,
            sink: PendingTask { name, spawn },
            state_tx,
            state_rx,
        }
    }
}

/// A fully wired pipeline ready to run.
pub struct Pipeline {
    stop: CancellationToken,
    stages: Vec<PendingTask>,
    sink: PendingTask,
    state_tx: watch::Sender<PipelineState>,
    state_rx: watch::Receiver<PipelineState>,
}

impl Pipeline {
    /// Start wiring a pipeline with the given inter-stage channel capacity.
    pub fn builder(capacity: usize) -> PipelineWiring {
        PipelineWiring {
            capacity,
            stop: CancellationToken::new(),
        }
    }

    /// Token that triggers the drain sequence when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Observe lifecycle state transitions.
    pub fn state(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }

    /// Run the pipeline to completion.
    ///
    /// Returns `Ok(())` once the run reaches `Stopped`; a fatal error moves
    /// the state to `Failed` and is returned to the caller.
    pub async fn run(self) -> Result<()> {
        let Pipeline {
            stop,
            stages,
            sink,
            state_tx,
            ..
        } = self;

        state_tx.send_replace(PipelineState::Running);
        info!("pipeline running");

        let stage_handles: Vec<(&'static str, JoinHandle<Result<()>>)> = stages
            .into_iter()
            .map(|task| (task.name, (task.spawn)()))
            .collect();
        let mut sink_handle = (sink.spawn)();

        let mut draining = false;
        let sink_result = loop {
            tokio::select! {
                _ = stop.cancelled(), if !draining => {
                    draining = true;
                    state_tx.send_replace(PipelineState::Draining);
                    info!("stop signal received, draining");
                }
                joined = &mut sink_handle => {
                    break match joined {
                        Ok(result) => result,
                        Err(e) => Err(anyhow!("sink task panicked: {e}")),
                    };
                }
            }
        };

        match sink_result {
            Ok(()) => {
                // The sink saw end-of-stream and drained; surface any stage
                // failure that terminated the stream early.
                for (name, handle) in stage_handles {
                    match handle.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            let e = e.context(format!("stage `{name}` failed"));
                            state_tx.send_replace(PipelineState::Failed(e.to_string()));
                            error!(stage = %name, error = %e, "pipeline failed");
                            return Err(e);
                        }
                        Err(e) => {
                            let e = anyhow!("stage `{name}` panicked: {e}");
                            state_tx.send_replace(PipelineState::Failed(e.to_string()));
                            error!(stage = %name, error = %e, "pipeline failed");
                            return Err(e);
                        }
                    }
                }
                state_tx.send_replace(PipelineState::Stopped);
                info!("pipeline stopped");
                Ok(())
            }
            Err(e) => {
                // Abort without draining: stop admissions immediately.
                stop.cancel();
                for (_, handle) in &stage_handles {
                    handle.abort();
                }
                state_tx.send_replace(PipelineState::Failed(e.to_string()));
                error!(error = %e, "pipeline failed");
                Err(e)
            }
        }
    }
}
