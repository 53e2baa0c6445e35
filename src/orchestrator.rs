//! Tool-augmented generation loop.
//!
//! Each round is one provider call on a held lease. When the model asks for
//! tools, the calls run concurrently through the [`ToolInvoker`] and their
//! results are appended as `tool` messages, in the order the model emitted
//! the calls, before the next round. The loop ends on a round without tool
//! calls, or when the per-round or total round cap is hit (returning the
//! best content seen so far).

use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::broker::ToolInvoker;
use crate::config::OrchestratorConfig;
use crate::error::{Error, ProviderError, Result};
use crate::models::{ToolCall, ToolResult};
use crate::provider::pool::outcome_for;
use crate::provider::{
    assistant_message, tool_message, ChatChunk, ChatMessage, Completion, GenerateOptions, Lease,
    Outcome, ProviderPool, ToolDef,
};
use crate::scope::{Interrupted, Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model answered without requesting tools.
    Completed,
    /// The model requested more calls in one round than allowed.
    CallLimit,
    /// The model still wanted tools after the last allowed round.
    RoundLimit,
}

/// Result of [`Orchestrator::generate_with_tools`].
#[derive(Debug, Clone, Serialize)]
pub struct Generation {
    pub content: String,
    pub rounds: usize,
    pub stop_reason: StopReason,
    /// Every call executed, in emission order across rounds.
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    #[serde(skip)]
    pub messages: Vec<ChatMessage>,
}

/// Events of [`Orchestrator::stream_with_tools`]. The stream always ends
/// with exactly one `Done` or `Error`.
#[derive(Debug)]
pub enum GenerationEvent {
    Delta(String),
    ToolCallStarted(ToolCall),
    ToolCallFinished(ToolResult),
    Done(Generation),
    Error(Error),
}

#[derive(Clone)]
pub struct Orchestrator {
    pool: ProviderPool,
    tools: Arc<dyn ToolInvoker>,
    max_calls_per_round: usize,
    max_rounds: usize,
}

enum RoundStep {
    Finished(Generation),
    Continue,
}

struct LoopState {
    messages: Vec<ChatMessage>,
    best: String,
    calls: Vec<ToolCall>,
    results: Vec<ToolResult>,
}

impl LoopState {
    fn finish(self, content: String, rounds: usize, stop_reason: StopReason) -> Generation {
        Generation {
            content,
            rounds,
            stop_reason,
            tool_calls: self.calls,
            tool_results: self.results,
            messages: self.messages,
        }
    }
}

impl Orchestrator {
    pub fn new(pool: ProviderPool, tools: Arc<dyn ToolInvoker>, config: &OrchestratorConfig) -> Self {
        Self {
            pool,
            tools,
            max_calls_per_round: config.max_calls_per_round.max(1),
            max_rounds: config.max_rounds.max(1),
        }
    }

    pub fn pool(&self) -> &ProviderPool {
        &self.pool
    }

    pub fn tools(&self) -> &Arc<dyn ToolInvoker> {
        &self.tools
    }

    /// Tool definitions for every currently callable tool.
    pub fn tool_defs(&self) -> Vec<ToolDef> {
        self.tools.tools().iter().map(ToolDef::from).collect()
    }

    /// Plain generation with failover and no tools.
    pub async fn generate(
        &self,
        scope: &Scope,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<Completion> {
        self.pool.generate(scope, messages, &[], options).await
    }

    pub async fn generate_with_tools(
        &self,
        scope: &Scope,
        messages: Vec<ChatMessage>,
        tool_defs: &[ToolDef],
        options: &GenerateOptions,
    ) -> Result<Generation> {
        options.validate()?;
        let mut state = LoopState {
            messages,
            best: String::new(),
            calls: Vec::new(),
            results: Vec::new(),
        };
        let mut lease: Option<Lease> = None;

        for round in 1..=self.max_rounds {
            let (held, completion) = self
                .pool
                .generate_on(scope, lease.take(), &state.messages, tool_defs, options)
                .await?;
            match self.after_round(scope, round, completion, &mut state, None).await {
                Ok(RoundStep::Continue) => lease = Some(held),
                Ok(RoundStep::Finished(out)) => {
                    held.release(Outcome::Success);
                    return Ok(out);
                }
                Err(e) => {
                    held.release(Outcome::Neutral);
                    return Err(e);
                }
            }
        }
        // after_round finishes on the last round, so this is unreachable in practice.
        if let Some(l) = lease {
            l.release(Outcome::Success);
        }
        let best = state.best.clone();
        Ok(state.finish(best, self.max_rounds, StopReason::RoundLimit))
    }

    /// Streaming variant: content deltas as they arrive, tool activity as
    /// status events. Dropping the receiver cancels the generation and any
    /// outstanding tool calls.
    pub fn stream_with_tools(
        &self,
        scope: &Scope,
        messages: Vec<ChatMessage>,
        tool_defs: Vec<ToolDef>,
        options: GenerateOptions,
    ) -> mpsc::Receiver<GenerationEvent> {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        let scope = scope.child();

        let watcher_tx = tx.clone();
        let token = scope.token().clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watcher_tx.closed() => token.cancel(),
                _ = token.cancelled() => {}
            }
        });

        tokio::spawn(async move {
            let _stop_watcher = scope.token().clone().drop_guard();
            let event = match this.drive_stream(&scope, messages, &tool_defs, &options, &tx).await {
                Ok(out) => GenerationEvent::Done(out),
                Err(e) => GenerationEvent::Error(e),
            };
            let _ = tx.send(event).await;
        });
        rx
    }

    async fn drive_stream(
        &self,
        scope: &Scope,
        messages: Vec<ChatMessage>,
        tool_defs: &[ToolDef],
        options: &GenerateOptions,
        tx: &mpsc::Sender<GenerationEvent>,
    ) -> Result<Generation> {
        options.validate()?;
        let mut state = LoopState {
            messages,
            best: String::new(),
            calls: Vec::new(),
            results: Vec::new(),
        };
        let mut lease: Option<Lease> = None;

        for round in 1..=self.max_rounds {
            let (held, mut stream) = self
                .pool
                .stream_on(scope, lease.take(), &state.messages, tool_defs, options)
                .await?;

            let mut completion = None;
            loop {
                let item = match scope.run(stream.next()).await {
                    Ok(item) => item,
                    Err(Interrupted::Cancelled) => {
                        held.release(Outcome::Neutral);
                        return Err(Error::Cancelled);
                    }
                    Err(Interrupted::DeadlineExceeded) => {
                        let provider = held.name().to_string();
                        held.release(Outcome::Failure);
                        return Err(ProviderError::Timeout {
                            provider,
                            elapsed: std::time::Duration::ZERO,
                        }
                        .into());
                    }
                };
                match item {
                    Some(Ok(ChatChunk::Delta(d))) => {
                        if tx.send(GenerationEvent::Delta(d)).await.is_err() {
                            held.release(Outcome::Neutral);
                            return Err(Error::Cancelled);
                        }
                    }
                    Some(Ok(ChatChunk::Done(c))) => {
                        completion = Some(c);
                        break;
                    }
                    Some(Err(e)) => {
                        let e = Error::from(e);
                        held.release(outcome_for(&e));
                        return Err(e);
                    }
                    None => break,
                }
            }
            let Some(completion) = completion else {
                let provider = held.name().to_string();
                held.release(Outcome::Failure);
                return Err(ProviderError::Unavailable {
                    provider,
                    message: "stream ended without a final chunk".into(),
                }
                .into());
            };

            match self.after_round(scope, round, completion, &mut state, Some(tx)).await {
                Ok(RoundStep::Continue) => lease = Some(held),
                Ok(RoundStep::Finished(out)) => {
                    held.release(Outcome::Success);
                    return Ok(out);
                }
                Err(e) => {
                    held.release(Outcome::Neutral);
                    return Err(e);
                }
            }
        }
        if let Some(l) = lease {
            l.release(Outcome::Success);
        }
        let best = state.best.clone();
        Ok(state.finish(best, self.max_rounds, StopReason::RoundLimit))
    }

    /// Inspect a finished round; run its tool calls and extend the history
    /// when the loop should go on.
    async fn after_round(
        &self,
        scope: &Scope,
        round: usize,
        completion: Completion,
        state: &mut LoopState,
        events: Option<&mpsc::Sender<GenerationEvent>>,
    ) -> Result<RoundStep> {
        if !completion.content.trim().is_empty() {
            state.best = completion.content.clone();
        }
        if completion.tool_calls.is_empty() {
            let content = completion.content;
            tracing::debug!(round, "generation finished");
            return Ok(RoundStep::Finished(std::mem::replace(state, empty_state()).finish(
                content,
                round,
                StopReason::Completed,
            )));
        }
        if completion.tool_calls.len() > self.max_calls_per_round {
            tracing::warn!(
                round,
                requested = completion.tool_calls.len(),
                limit = self.max_calls_per_round,
                "per-round tool call limit exceeded"
            );
            let best = state.best.clone();
            return Ok(RoundStep::Finished(
                std::mem::replace(state, empty_state()).finish(best, round, StopReason::CallLimit),
            ));
        }
        if round >= self.max_rounds {
            tracing::warn!(round, "round limit reached with tool calls pending");
            let best = state.best.clone();
            return Ok(RoundStep::Finished(
                std::mem::replace(state, empty_state()).finish(best, round, StopReason::RoundLimit),
            ));
        }

        let calls: Vec<ToolCall> = completion
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(i, mut c)| {
                if c.id.is_empty() {
                    c.id = format!("call_{}_{}", round, i);
                }
                c
            })
            .collect();
        tracing::info!(round, calls = calls.len(), "executing tool calls");

        state
            .messages
            .push(assistant_message(&completion.content, calls.clone()));
        if let Some(tx) = events {
            for c in &calls {
                let _ = tx.send(GenerationEvent::ToolCallStarted(c.clone())).await;
            }
        }

        let results = self.tools.call_batch(&calls, &scope.child()).await;
        if scope.is_cancelled() {
            return Err(Error::Cancelled);
        }

        for r in &results {
            state.messages.push(tool_message(&r.call_id, &r.to_model_text()));
            if let Some(tx) = events {
                let _ = tx.send(GenerationEvent::ToolCallFinished(r.clone())).await;
            }
        }
        state.calls.extend(calls);
        state.results.extend(results);
        Ok(RoundStep::Continue)
    }
}

fn empty_state() -> LoopState {
    LoopState {
        messages: Vec::new(),
        best: String::new(),
        calls: Vec::new(),
        results: Vec::new(),
    }
}
