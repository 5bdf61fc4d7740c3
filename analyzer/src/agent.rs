//! Tool-calling agent loop.
//!
//! Every provider call goes through [`execute_with_retry`]; every tool call
//! goes through the [`ToolGateway`]. The loop ends at the first final answer
//! or fails with [`EngineError::MaxTurnsExceeded`].

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::errors::EngineError;
use crate::core::messages::{Message, ProviderResponse};
use crate::core::retry::{RetryPolicy, Sleeper, execute_with_retry};
use crate::io::gateway::ToolGateway;
use crate::io::provider::CompletionProvider;

/// Inputs for one agent conversation.
#[derive(Debug, Clone)]
pub struct AgentTask {
    pub instructions: String,
    pub kickoff: String,
    pub max_turns: u32,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutcome {
    pub final_output: String,
    pub turns: u32,
}

/// Wraps a sleeper and keeps every wait, in seconds.
struct RecordingSleeper<'s> {
    inner: &'s mut dyn Sleeper,
    waits: &'s mut Vec<f64>,
}

impl Sleeper for RecordingSleeper<'_> {
    fn sleep(&mut self, duration: Duration) {
        self.waits.push(duration.as_secs_f64());
        self.inner.sleep(duration);
    }
}

/// Drive `provider` until it answers without tool calls.
///
/// Retry waits are appended to `retry_waits` as they happen, so they survive a
/// failed run.
#[instrument(skip_all, fields(max_turns = task.max_turns))]
pub fn run_agent(
    provider: &mut dyn CompletionProvider,
    gateway: &mut ToolGateway<'_>,
    sleeper: &mut dyn Sleeper,
    task: &AgentTask,
    retry_waits: &mut Vec<f64>,
) -> Result<AgentOutcome> {
    let mut messages = vec![
        Message::System(task.instructions.clone()),
        Message::User(task.kickoff.clone()),
    ];

    for turn in 1..=task.max_turns {
        let mut recording = RecordingSleeper {
            inner: &mut *sleeper,
            waits: &mut *retry_waits,
        };
        let response = execute_with_retry(&task.retry, &mut recording, || {
            provider.submit(&messages)
        })
        .map_err(EngineError::from)
        .with_context(|| format!("provider call on turn {turn}"))?;

        match response {
            ProviderResponse::Final(text) => {
                info!(turn, chars = text.len(), "agent finished");
                return Ok(AgentOutcome {
                    final_output: text,
                    turns: turn,
                });
            }
            ProviderResponse::ToolCalls { text, calls } => {
                debug!(turn, calls = calls.len(), "tool calls requested");
                messages.push(Message::Assistant {
                    text,
                    tool_calls: calls.clone(),
                });
                for call in &calls {
                    let result = gateway
                        .execute(call)
                        .with_context(|| format!("tool call {} on turn {turn}", call.id))?;
                    messages.push(Message::Tool(result));
                }
            }
        }
    }

    Err(EngineError::MaxTurnsExceeded {
        max_turns: task.max_turns,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{ProviderError, error_kind};
    use crate::core::messages::ToolCallKind;
    use crate::io::gateway::{AutoApprove, CommandPolicy};
    use crate::test_support::{ScriptedProvider, shell_call};

    fn task(max_turns: u32) -> AgentTask {
        AgentTask {
            instructions: "analyze".to_string(),
            kickoff: "go".to_string(),
            max_turns,
            retry: RetryPolicy::new(2, 2.0),
        }
    }

    fn gateway(dir: &std::path::Path) -> ToolGateway<'static> {
        ToolGateway::new(
            dir,
            &dir.join("commands.jsonl"),
            4000,
            CommandPolicy::Edit,
            Box::new(AutoApprove),
        )
            .expect("gateway")
    }

    /// Verifies tool output is fed back to the provider before the next turn.
    #[test]
    fn tool_results_flow_back_to_the_provider() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut provider = ScriptedProvider::new(vec![
            Ok(ProviderResponse::ToolCalls {
                text: None,
                calls: vec![shell_call("c1", ToolCallKind::FunctionShell, &["echo hi"])],
            }),
            Ok(ProviderResponse::Final("done".to_string())),
        ]);
        let mut gw = gateway(temp.path());
        let mut sleeper = |_: Duration| {};
        let mut waits = Vec::new();
        let outcome = run_agent(&mut provider, &mut gw, &mut sleeper, &task(5), &mut waits)
            .expect("agent");
        assert_eq!(outcome.final_output, "done");
        assert_eq!(outcome.turns, 2);
        let last = provider.seen().last().expect("second call");
        assert!(matches!(last.last(), Some(Message::Tool(result)) if result.render_text().contains("hi")));
        assert_eq!(gw.records().len(), 1);
    }

    /// Verifies transient failures are retried with linear waits that get recorded.
    #[test]
    fn retry_waits_are_recorded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut provider = ScriptedProvider::new(vec![
            Err(ProviderError::Http {
                status: 429,
                body: String::new(),
            }),
            Err(ProviderError::Timeout),
            Ok(ProviderResponse::Final("ok".to_string())),
        ]);
        let mut gw = gateway(temp.path());
        let mut slept = Vec::new();
        let mut sleeper = |d: Duration| slept.push(d);
        let mut waits = Vec::new();
        run_agent(&mut provider, &mut gw, &mut sleeper, &task(3), &mut waits).expect("agent");
        assert_eq!(waits, vec![2.0, 4.0]);
        assert_eq!(slept.len(), 2);
    }

    #[test]
    fn fatal_provider_error_fails_without_retry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut provider = ScriptedProvider::new(vec![Err(ProviderError::Http {
            status: 401,
            body: "bad key".to_string(),
        })]);
        let mut gw = gateway(temp.path());
        let mut sleeper = |_: Duration| {};
        let mut waits = Vec::new();
        let err = run_agent(&mut provider, &mut gw, &mut sleeper, &task(3), &mut waits)
            .expect_err("fatal");
        assert_eq!(error_kind(&err), "FatalProviderError");
        assert_eq!(provider.seen().len(), 1);
        assert!(waits.is_empty());
    }

    #[test]
    fn turn_limit_is_enforced() {
        let temp = tempfile::tempdir().expect("tempdir");
        let looping = || {
            Ok(ProviderResponse::ToolCalls {
                text: None,
                calls: vec![shell_call("c", ToolCallKind::HostedShell, &["true"])],
            })
        };
        let mut provider = ScriptedProvider::new(vec![looping(), looping()]);
        let mut gw = gateway(temp.path());
        let mut sleeper = |_: Duration| {};
        let mut waits = Vec::new();
        let err = run_agent(&mut provider, &mut gw, &mut sleeper, &task(2), &mut waits)
            .expect_err("max turns");
        assert_eq!(error_kind(&err), "MaxTurnsExceeded");
    }
}
