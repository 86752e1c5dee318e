//! The bounded multi-turn agent loop.
//!
//! One user turn runs as one spawned task:
//! `CallingModel → {ExecutingTools → CallingModel}* → Finishing`, hard-capped
//! at the configured iteration count. Chunks are forwarded to the caller, the
//! accumulator, and the fan-out as they arrive; tool dispatch waits for the
//! model's turn to complete so it never races still-arriving text.
//!
//! Provider `Finish` chunks are loop control, not output: the caller sees
//! exactly one terminal `Finish` per turn, whatever the iteration count.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::accumulator::TurnAccumulator;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::fanout::FanOut;
use crate::persist::MessageStore;
use crate::provider::adapter_for;
use crate::tools::ToolDispatcher;
use crate::transport::stream::chunk_stream;
use crate::transport::AttributedTransport;
use crate::types::{ContentPart, FinishReason, Role, StreamChunk, ToolCall, UnifiedMessage};

use super::types::{TurnPhase, TurnRequest};

/// The public entry point: wires transport, fan-out, and storage together
/// and runs user turns against them.
pub struct AgentPipeline {
    transport: Arc<dyn AttributedTransport>,
    fanout: Arc<dyn FanOut>,
    store: Arc<dyn MessageStore>,
    config: PipelineConfig,
}

impl AgentPipeline {
    pub fn new(
        transport: Arc<dyn AttributedTransport>,
        fanout: Arc<dyn FanOut>,
        store: Arc<dyn MessageStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            transport,
            fanout,
            store,
            config,
        }
    }

    /// Run one user turn, returning its live chunk stream.
    ///
    /// The turn executes on its own task; dropping the returned stream does
    /// not abort it (use the request's cancellation token for that). The
    /// stream ends with exactly one `Finish` chunk, followed by an `Err`
    /// only when the turn failed outright.
    pub fn run(&self, request: TurnRequest) -> BoxStream<'static, Result<StreamChunk>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = TurnWorker {
            transport: Arc::clone(&self.transport),
            fanout: Arc::clone(&self.fanout),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            tx,
        };
        tokio::spawn(worker.run(request));
        UnboundedReceiverStream::new(rx).boxed()
    }
}

struct TurnWorker {
    transport: Arc<dyn AttributedTransport>,
    fanout: Arc<dyn FanOut>,
    store: Arc<dyn MessageStore>,
    config: PipelineConfig,
    tx: mpsc::UnboundedSender<Result<StreamChunk>>,
}

/// What one `CallingModel` iteration decided.
enum IterationOutcome {
    /// Tools were dispatched; run another iteration.
    Continue,
    /// The model finished without tool calls.
    Terminal(FinishReason),
}

impl TurnWorker {
    async fn run(self, request: TurnRequest) {
        let TurnRequest {
            session_id,
            customer_id,
            mut model,
            history,
            user_message,
            tools,
            cancel,
        } = request;

        let dispatcher = ToolDispatcher::new(tools, self.config.tool_timeout);
        let tool_defs = dispatcher.definitions();
        let mut accumulator = TurnAccumulator::new(&session_id, &model.model_id);

        let mut conversation = history;
        conversation.push(user_message);

        let mut iteration = 0usize;
        let mut fallback_used = false;

        let terminal: Result<FinishReason> = loop {
            if cancel.is_cancelled() {
                debug!(session_id, iteration, "turn aborted by caller");
                break Ok(FinishReason::Other);
            }

            iteration += 1;
            if iteration > self.config.max_iterations {
                warn!(
                    session_id,
                    max_iterations = self.config.max_iterations,
                    "iteration cap reached, finishing turn"
                );
                break Ok(FinishReason::Length);
            }

            debug!(session_id, iteration, phase = %TurnPhase::CallingModel, model = %model);
            let adapter = adapter_for(&model);
            let encoded =
                match adapter.encode_request(&conversation, &tool_defs, &self.config) {
                    Ok(encoded) => encoded,
                    Err(e) => break Err(e),
                };

            let bytes = match self
                .config
                .retry
                .execute(|| self.transport.perform_attributed_call(&encoded, &customer_id))
                .await
            {
                Ok(bytes) => bytes,
                Err(PipelineError::ProviderBalance { provider, message }) => {
                    match self.config.fallback_model.clone() {
                        Some(fallback) if !fallback_used => {
                            warn!(
                                session_id,
                                provider,
                                fallback = %fallback,
                                "balance rejection, switching to fallback model"
                            );
                            fallback_used = true;
                            accumulator.set_model_id(&fallback.model_id);
                            model = fallback;
                            continue;
                        }
                        _ => {
                            warn!(session_id, provider, message, "balance rejection, no fallback available");
                            break Ok(FinishReason::Error);
                        }
                    }
                }
                Err(e) => break Err(e),
            };

            let chunks = chunk_stream(bytes, adapter.decoder());
            match self
                .run_iteration(chunks, &session_id, &mut accumulator, &mut conversation, &dispatcher, &cancel)
                .await
            {
                Ok(IterationOutcome::Continue) => {}
                Ok(IterationOutcome::Terminal(reason)) => break Ok(reason),
                Err(e) => break Err(e),
            }
        };

        debug!(session_id, iteration, phase = %TurnPhase::Finishing);
        match terminal {
            Ok(reason) => {
                let finish = StreamChunk::Finish { reason };
                accumulator.observe(&finish);
                self.fanout.publish(&session_id, &finish).await;
                let _ = self.tx.send(Ok(finish));

                if let Err(e) = self.store.insert(accumulator.into_persisted()).await {
                    error!(session_id, error = %e, "failed to persist turn");
                    let _ = self.tx.send(Err(e));
                }
            }
            Err(e) => {
                // Turn failure: the caller still gets a terminal finish,
                // then the error. Nothing is persisted.
                error!(session_id, error = %e, "turn failed");
                let finish = StreamChunk::Finish {
                    reason: FinishReason::Error,
                };
                self.fanout.publish(&session_id, &finish).await;
                let _ = self.tx.send(Ok(finish));
                let _ = self.tx.send(Err(e));
            }
        }
    }

    /// Drive one model response to completion, then dispatch any tool calls
    /// it made.
    async fn run_iteration(
        &self,
        mut chunks: BoxStream<'static, Result<StreamChunk>>,
        session_id: &str,
        accumulator: &mut TurnAccumulator,
        conversation: &mut Vec<UnifiedMessage>,
        dispatcher: &ToolDispatcher,
        cancel: &CancellationToken,
    ) -> Result<IterationOutcome> {
        let mut text = String::new();
        let mut ready: Vec<ToolCall> = Vec::new();
        let mut provider_finish: Option<FinishReason> = None;

        while let Some(item) = chunks.next().await {
            match item? {
                StreamChunk::Finish { reason } => provider_finish = Some(reason),
                chunk => {
                    match &chunk {
                        StreamChunk::TextDelta { text: delta } => text.push_str(delta),
                        StreamChunk::ToolCallReady { id, name, input } => ready.push(ToolCall {
                            id: id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        }),
                        _ => {}
                    }
                    self.forward(session_id, accumulator, chunk).await;
                }
            }
        }

        if ready.is_empty() {
            let reason = match provider_finish {
                // A tool-calls reason with no parsed calls degrades to a
                // normal stop rather than spinning another iteration.
                Some(FinishReason::ToolCalls) | None => FinishReason::Stop,
                Some(reason) => reason,
            };
            return Ok(IterationOutcome::Terminal(reason));
        }

        debug!(
            session_id,
            phase = %TurnPhase::ExecutingTools,
            calls = ready.len()
        );
        let mut parts: Vec<ContentPart> = Vec::new();
        if !text.is_empty() {
            parts.push(ContentPart::Text { text });
        }
        parts.extend(ready.iter().cloned().map(ContentPart::ToolCall));
        conversation.push(UnifiedMessage {
            role: Role::Assistant,
            content: parts,
        });

        let outcomes = dispatcher.dispatch(&ready, cancel).await;
        let mut results = Vec::with_capacity(outcomes.len());
        for (chunk, result) in outcomes {
            self.forward(session_id, accumulator, chunk).await;
            results.push(result);
        }
        conversation.push(UnifiedMessage::tool_results(results));

        Ok(IterationOutcome::Continue)
    }

    async fn forward(
        &self,
        session_id: &str,
        accumulator: &mut TurnAccumulator,
        chunk: StreamChunk,
    ) {
        accumulator.observe(&chunk);
        self.fanout.publish(session_id, &chunk).await;
        let _ = self.tx.send(Ok(chunk));
    }
}
