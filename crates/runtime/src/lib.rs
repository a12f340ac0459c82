//! Minimal runtime for a streaming operator chain.
//!
//! Characteristics:
//! - single-input, single-output operators
//! - bounded channels (backpressure)
//! - end-of-stream is propagated through every stage
//! - sinks can schedule deadline-driven work (timed buffer flushes)

use anyhow::Result;
use async_trait::async_trait;
use conveyor_core::StreamMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub mod driver;

pub use driver::{Pipeline, PipelineBuilder, PipelineState, PipelineWiring};

pub type Sender<T> = mpsc::Sender<StreamMessage<T>>;
pub type Receiver<T> = mpsc::Receiver<StreamMessage<T>>;

/// Outbound collector for an operator.
#[derive(Clone)]
pub struct Emitter<T> {
    tx: Sender<T>,
}

impl<T: Send + 'static> Emitter<T> {
    pub fn new(tx: Sender<T>) -> Self {
        Self { tx }
    }

    pub async fn emit(&mut self, msg: StreamMessage<T>) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("downstream channel closed"))
    }

    pub async fn data(&mut self, item: T) -> Result<()> {
        self.emit(StreamMessage::Data(item)).await
    }

    pub async fn end(&mut self) -> Result<()> {
        self.emit(StreamMessage::End).await
    }
}

/// An operator transforms an input stream into an output stream.
///
/// Single input -> single output.
#[async_trait]
pub trait Operator: Send + 'static {
    type In: Send + 'static;
    type Out: Send + 'static;

    async fn on_message(
        &mut self,
        msg: StreamMessage<Self::In>,
        out: &mut Emitter<Self::Out>,
    ) -> Result<()>;

    /// Called when initializing the operator.
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when closing the operator.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A source pulls records from an external system and emits them downstream.
///
/// `run` returns when the origin reaches end-of-stream or `stop` is
/// cancelled; the spawn wrapper emits the final `End` marker either way.
#[async_trait]
pub trait Source: Send + 'static {
    type Out: Send + 'static;

    async fn run(&mut self, out: &mut Emitter<Self::Out>, stop: CancellationToken) -> Result<()>;
}

/// A sink consumes the end of an operator chain.
///
/// Sinks that buffer work can report a `deadline` at which `tick` must run
/// even if no input arrives (timed flushes, reaping completed dispatches).
#[async_trait]
pub trait Sink: Send + 'static {
    type In: Send + 'static;

    async fn handle(&mut self, item: Self::In) -> Result<()>;

    /// Next instant at which `tick` should be called without new input.
    fn deadline(&self) -> Option<Instant> {
        None
    }

    /// Deadline-driven callback.
    async fn tick(&mut self) -> Result<()> {
        Ok(())
    }

    /// Flush buffered work and wait for in-flight completions.
    async fn drain(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Create a bounded channel for stream messages.
pub fn stream_channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    mpsc::channel(capacity)
}

/// Spawn an operator as an async task.
pub fn spawn_operator<O>(
    name: &'static str,
    mut op: O,
    mut rx: Receiver<O::In>,
    tx: Sender<O::Out>,
) -> JoinHandle<Result<()>>
where
    O: Operator,
{
    tokio::spawn(async move {
        let mut out = Emitter::new(tx);
        debug!(%name, "operator started");

        if let Err(e) = op.open().await {
            error!(%name, error = %e, "operator open failed");
            let _ = out.end().await;
            return Err(e);
        }

        while let Some(msg) = rx.recv().await {
            let is_end = matches!(msg, StreamMessage::End);

            if let Err(e) = op.on_message(msg, &mut out).await {
                error!(%name, error = %e, "operator error");
                let _ = out.end().await;
                return Err(e);
            }

            if is_end {
                break;
            }
        }

        op.close().await?;
        debug!(%name, "operator stopped");
        Ok(())
    })
}

/// Spawn a source as an async task.
///
/// The `End` marker is emitted after the source returns, so downstream
/// stages always observe a terminated stream.
pub fn spawn_source<S>(
    name: &'static str,
    tx: Sender<S::Out>,
    mut source: S,
    stop: CancellationToken,
) -> JoinHandle<Result<()>>
where
    S: Source,
{
    tokio::spawn(async move {
        debug!(%name, "source started");
        let mut out = Emitter::new(tx);
        let result = source.run(&mut out, stop).await;
        let _ = out.end().await;
        if let Err(e) = &result {
            error!(%name, error = %e, "source error");
        }
        debug!(%name, "source stopped");
        result
    })
}

/// Spawn a sink as an async task.
///
/// The loop interleaves input with the sink's own deadlines; on end of
/// stream the sink is drained before the task completes. A sink error is
/// returned as-is without draining.
pub fn spawn_sink<S>(name: &'static str, mut rx: Receiver<S::In>, mut sink: S) -> JoinHandle<Result<()>>
where
    S: Sink,
{
    tokio::spawn(async move {
        debug!(%name, "sink started");
        loop {
            let deadline = sink.deadline();
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(StreamMessage::Data(item)) => {
                        if let Err(e) = sink.handle(item).await {
                            error!(%name, error = %e, "sink error");
                            return Err(e);
                        }
                    }
                    Some(StreamMessage::End) | None => break,
                },
                _ = sleep_until_opt(deadline) => {
                    if let Err(e) = sink.tick().await {
                        error!(%name, error = %e, "sink error");
                        return Err(e);
                    }
                }
            }
        }

        if let Err(e) = sink.drain().await {
            error!(%name, error = %e, "sink drain failed");
            return Err(e);
        }
        debug!(%name, "sink stopped");
        Ok(())
    })
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
