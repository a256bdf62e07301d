//! The orchestrator state machine.
//!
//! One user turn drives an explicit frame stack: the supervisor's frame at
//! the bottom, one frame per active delegation above it. Delegation depth is
//! therefore bounded by the stack, not by native recursion, and a worker's
//! final reply folds back into its delegator's transcript as a tool result.
//!
//! Limit violations inside a turn (cycle, depth, unknown tool) are fed back
//! to the offending agent as tool-error text so it can recover; only
//! iteration exhaustion of the supervisor ends the turn with a degraded
//! reply.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::conversation::{ConversationState, DelegationRecord};
use super::workflow::WorkflowDefinition;
use crate::error::OrchestratorError;
use crate::llm::{Capability, ChatMessage, ToolCall};
use crate::metrics::{CONVERSATION_TURNS, DELEGATIONS};
use crate::tools::ToolDispatcher;

/// Where the conversation currently stands. Observable for dashboards and
/// asserted on in tests; the machine itself transitions through these as a
/// turn progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingUser,
    SupervisorThinking,
    RespondingToUser,
    Delegating,
    WorkerThinking,
    WorkerToolCall,
    WorkerResult,
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorLimits {
    /// Maximum delegations below the supervisor on the active stack.
    pub max_depth: usize,
    /// Maximum capability invocations per frame per turn.
    pub max_iterations: usize,
}

impl Default for OrchestratorLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_iterations: 10,
        }
    }
}

/// One agent's in-flight activation.
struct Frame {
    agent: String,
    /// Tool-dispatch session; workers get a fresh one per delegation.
    session: String,
    messages: Vec<ChatMessage>,
    pending: VecDeque<ToolCall>,
    iterations: usize,
    /// Index into the conversation's delegation records, for workers.
    record_idx: Option<usize>,
}

pub struct Orchestrator {
    workflow: WorkflowDefinition,
    capabilities: HashMap<String, Arc<dyn Capability>>,
    dispatcher: Arc<ToolDispatcher>,
    limits: OrchestratorLimits,
    conversation: ConversationState,
    conversation_id: String,
    phase: Phase,
    delegation_seq: u64,
}

impl Orchestrator {
    /// Build an orchestrator for a validated workflow. Fails fast when the
    /// graph is malformed or an agent names a capability that was not
    /// provided.
    pub fn new(
        workflow: WorkflowDefinition,
        capabilities: HashMap<String, Arc<dyn Capability>>,
        dispatcher: Arc<ToolDispatcher>,
        limits: OrchestratorLimits,
    ) -> Result<Self, OrchestratorError> {
        workflow.validate(dispatcher.catalogue())?;
        for agent in &workflow.agents {
            if !capabilities.contains_key(&agent.capability) {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "agent '{}' references unknown capability '{}'",
                    agent.name, agent.capability
                )));
            }
        }
        Ok(Self {
            workflow,
            capabilities,
            dispatcher,
            limits,
            conversation: ConversationState::new(),
            conversation_id: format!("conv-{}", Uuid::now_v7()),
            phase: Phase::AwaitingUser,
            delegation_seq: 0,
        })
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// End the conversation and release the supervisor's sandbox session.
    pub async fn end_conversation(&mut self) {
        self.conversation.ended = true;
        let session = self.supervisor_session();
        self.dispatcher.end_session(&session).await;
        info!(conversation = %self.conversation_id, "conversation ended");
    }

    /// Run one full user turn to completion and return the supervisor's
    /// user-facing reply.
    pub async fn handle_turn(&mut self, input: &str) -> Result<String, OrchestratorError> {
        if self.conversation.ended {
            return Err(OrchestratorError::Ended);
        }

        CONVERSATION_TURNS.inc();
        self.conversation.record_user(input);
        self.conversation.delegation_stack = vec![self.workflow.supervisor.clone()];
        self.phase = Phase::SupervisorThinking;

        let result = self.run_turn(input).await;

        self.conversation.delegation_stack.clear();
        self.phase = Phase::AwaitingUser;
        result
    }

    async fn run_turn(&mut self, input: &str) -> Result<String, OrchestratorError> {
        let supervisor = self
            .workflow
            .agent(&self.workflow.supervisor)
            .ok_or_else(|| OrchestratorError::UnknownAgent(self.workflow.supervisor.clone()))?;

        let mut messages = vec![ChatMessage::system(supervisor.system_prompt.clone())];
        for turn in &self.conversation.turns {
            match &turn.speaker {
                super::conversation::Speaker::User => {
                    messages.push(ChatMessage::user(turn.content.clone()))
                }
                super::conversation::Speaker::Agent { .. } => {
                    messages.push(ChatMessage::assistant(turn.content.clone()))
                }
            }
        }

        let mut frames = vec![Frame {
            agent: supervisor.name.clone(),
            session: self.supervisor_session(),
            messages,
            pending: VecDeque::new(),
            iterations: 0,
            record_idx: None,
        }];
        debug!(conversation = %self.conversation_id, input_len = input.len(), "turn started");

        let result = self.drive(&mut frames).await;
        if result.is_err() {
            self.abort_frames(&mut frames).await;
        }
        result
    }

    async fn drive(&mut self, frames: &mut Vec<Frame>) -> Result<String, OrchestratorError> {
        loop {
            let at_supervisor = frames.len() == 1;
            let Some(frame) = frames.last_mut() else {
                return Err(OrchestratorError::InvalidWorkflow(
                    "frame stack drained without a reply".to_string(),
                ));
            };

            if let Some(call) = frame.pending.pop_front() {
                self.step_tool_call(frames, call).await?;
                continue;
            }

            frame.iterations += 1;
            if frame.iterations > self.limits.max_iterations {
                if at_supervisor {
                    // The supervisor ran out of thinking budget. Surface a
                    // degraded reply rather than an opaque failure.
                    warn!(
                        conversation = %self.conversation_id,
                        limit = self.limits.max_iterations,
                        "supervisor iteration limit reached"
                    );
                    let reply = format!(
                        "I was unable to finish this request within {} steps. \
                         Partial work may be visible above.",
                        self.limits.max_iterations
                    );
                    self.conversation
                        .record_agent(self.workflow.supervisor.clone(), reply.clone());
                    self.phase = Phase::RespondingToUser;
                    return Ok(reply);
                }
                // A worker ran out; its delegator decides what to do next.
                let err = OrchestratorError::IterationExceeded(self.limits.max_iterations);
                self.pop_frame(frames, format!("Error: {err}")).await;
                continue;
            }

            let agent = self
                .workflow
                .agent(&frame.agent)
                .ok_or_else(|| OrchestratorError::UnknownAgent(frame.agent.clone()))?;
            let capability = self
                .capabilities
                .get(&agent.capability)
                .ok_or_else(|| OrchestratorError::UnknownAgent(agent.capability.clone()))?
                .clone();
            let tools = self
                .workflow
                .tools_for_agent(agent, self.dispatcher.catalogue());

            self.phase = if at_supervisor {
                Phase::SupervisorThinking
            } else {
                Phase::WorkerThinking
            };
            let message = capability.complete(&frame.messages, &tools).await?;
            frame.messages.push(message.clone());

            if let Some(calls) = message.tool_calls {
                if !calls.is_empty() {
                    frame.pending.extend(calls);
                    continue;
                }
            }

            // A plain reply terminates the frame.
            if at_supervisor {
                self.conversation
                    .record_agent(self.workflow.supervisor.clone(), message.content.clone());
                self.phase = Phase::RespondingToUser;
                debug!(conversation = %self.conversation_id, "turn finished");
                return Ok(message.content);
            }
            self.pop_frame(frames, message.content).await;
        }
    }

    /// Unwind the stack after a turn aborts so worker sandbox sessions are
    /// released; the supervisor's session outlives the turn.
    async fn abort_frames(&mut self, frames: &mut Vec<Frame>) {
        while let Some(frame) = frames.pop() {
            if frame.record_idx.is_some() {
                self.conversation.pop_delegation();
                self.dispatcher.end_session(&frame.session).await;
                warn!(
                    conversation = %self.conversation_id,
                    agent = %frame.agent,
                    "delegation aborted"
                );
            }
        }
    }

    /// Handle one pending tool call on the top frame: either a delegation
    /// (the call names an agent) or a catalogue dispatch.
    async fn step_tool_call(
        &mut self,
        frames: &mut Vec<Frame>,
        call: ToolCall,
    ) -> Result<(), OrchestratorError> {
        let Some(frame) = frames.last_mut() else {
            return Err(OrchestratorError::InvalidWorkflow(
                "empty frame stack".to_string(),
            ));
        };
        let name = call.function.name.clone();

        if self.workflow.is_agent(&name) {
            if !self.workflow.may_delegate(&frame.agent, &name) {
                DELEGATIONS.with_label_values(&[name.as_str(), "denied"]).inc();
                frame.messages.push(ChatMessage::tool(format!(
                    "Error: delegation to '{name}' is not permitted from '{}'",
                    frame.agent
                )));
                return Ok(());
            }

            match self.conversation.push_delegation(&name, self.limits.max_depth) {
                Ok(()) => {}
                Err(e @ OrchestratorError::CyclicDelegation(_)) => {
                    DELEGATIONS.with_label_values(&[name.as_str(), "cycle"]).inc();
                    frame
                        .messages
                        .push(ChatMessage::tool(format!("Error: {e}. Handle the task yourself.")));
                    return Ok(());
                }
                Err(e @ OrchestratorError::DepthExceeded(_)) => {
                    DELEGATIONS.with_label_values(&[name.as_str(), "depth"]).inc();
                    frame
                        .messages
                        .push(ChatMessage::tool(format!("Error: {e}. Handle the task yourself.")));
                    return Ok(());
                }
                Err(e) => return Err(e),
            }

            let instruction = call
                .function
                .arguments
                .get("instruction")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let delegator = frame.agent.clone();

            let delegate = self
                .workflow
                .agent(&name)
                .ok_or_else(|| OrchestratorError::UnknownAgent(name.clone()))?;
            let record_idx = self.conversation.delegations.len();
            self.conversation.delegations.push(DelegationRecord {
                delegator: delegator.clone(),
                delegate: name.clone(),
                instruction: instruction.clone(),
                result: None,
            });

            DELEGATIONS.with_label_values(&[name.as_str(), "ok"]).inc();
            info!(
                conversation = %self.conversation_id,
                from = %delegator,
                to = %name,
                "delegation started"
            );
            self.phase = Phase::Delegating;
            self.delegation_seq += 1;
            frames.push(Frame {
                agent: name.clone(),
                session: format!("{}:{}:{}", self.conversation_id, name, self.delegation_seq),
                messages: vec![
                    ChatMessage::system(delegate.system_prompt.clone()),
                    ChatMessage::user(instruction),
                ],
                pending: VecDeque::new(),
                iterations: 0,
                record_idx: Some(record_idx),
            });
            return Ok(());
        }

        if frames.len() > 1 {
            self.phase = Phase::WorkerToolCall;
        }
        let frame = frames
            .last_mut()
            .ok_or_else(|| OrchestratorError::InvalidWorkflow("empty frame stack".to_string()))?;
        let outcome = self.dispatcher.dispatch(&frame.session, &call).await;
        let text = match outcome {
            Ok(text) => text,
            Err(e) => format!("Tool error: {e}"),
        };
        frame.messages.push(ChatMessage::tool(text));
        Ok(())
    }

    /// Fold a finished worker frame back into its delegator.
    async fn pop_frame(&mut self, frames: &mut Vec<Frame>, result: String) {
        let Some(done) = frames.pop() else {
            return;
        };
        if let Some(idx) = done.record_idx {
            if let Some(record) = self.conversation.delegations.get_mut(idx) {
                record.result = Some(result.clone());
            }
        }
        self.conversation.pop_delegation();
        self.dispatcher.end_session(&done.session).await;
        info!(
            conversation = %self.conversation_id,
            agent = %done.agent,
            "delegation finished"
        );

        if let Some(parent) = frames.last_mut() {
            parent
                .messages
                .push(ChatMessage::tool(format!("Agent {} result: {result}", done.agent)));
        }
        // The next loop pass moves to SupervisorThinking or WorkerThinking
        // when the parent resumes.
        self.phase = Phase::WorkerResult;
    }

    /// The supervisor's sandbox session persists across turns so files
    /// written earlier in the conversation stay visible.
    fn supervisor_session(&self) -> String {
        format!("{}:{}", self.conversation_id, self.workflow.supervisor)
    }
}
