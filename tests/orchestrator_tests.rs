//! Conversation state machine tests with scripted capabilities.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use cowork::error::{CapabilityError, OrchestratorError};
use cowork::llm::{Capability, ChatMessage, Tool, ToolCall};
use cowork::orchestrator::{
    AgentNode, DelegationEdge, Orchestrator, OrchestratorLimits, Speaker, WorkflowDefinition,
};
use cowork::sandbox::local::LocalProvider;
use cowork::sandbox::{PoolConfig, SandboxConfig, SandboxManager};
use cowork::tools::{ToolCatalogue, ToolDescriptor, ToolDispatcher};

/// Replays a fixed sequence of assistant messages, then plain "done".
struct ScriptedCapability {
    replies: Mutex<VecDeque<ChatMessage>>,
}

impl ScriptedCapability {
    fn new(replies: Vec<ChatMessage>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
        })
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _tools: &[Tool],
    ) -> Result<ChatMessage, CapabilityError> {
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ChatMessage::assistant("done")))
    }
}

/// Replays its script, then fails every further completion.
struct FlakyCapability {
    replies: Mutex<VecDeque<ChatMessage>>,
}

impl FlakyCapability {
    fn new(replies: Vec<ChatMessage>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
        })
    }
}

#[async_trait]
impl Capability for FlakyCapability {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _tools: &[Tool],
    ) -> Result<ChatMessage, CapabilityError> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| CapabilityError::Request("model endpoint went away".to_string()))
    }
}

fn calling(name: &str, args: serde_json::Value) -> ChatMessage {
    let mut msg = ChatMessage::assistant("");
    msg.tool_calls = Some(vec![ToolCall::new(name, args)]);
    msg
}

fn node(name: &str, tools: &[&str]) -> AgentNode {
    AgentNode {
        name: name.to_string(),
        system_prompt: format!("You are the {name} agent."),
        tools: tools.iter().map(|t| t.to_string()).collect(),
        capability: name.to_string(),
    }
}

fn edge(from: &str, to: &str) -> DelegationEdge {
    DelegationEdge {
        from: from.to_string(),
        to: to.to_string(),
    }
}

struct Harness {
    _root: tempfile::TempDir,
    orchestrator: Orchestrator,
}

fn harness(
    workflow: WorkflowDefinition,
    scripts: Vec<(&str, Arc<ScriptedCapability>)>,
    limits: OrchestratorLimits,
) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let provider = Arc::new(LocalProvider::new(Some(root.path().to_path_buf())).unwrap());
    let manager = Arc::new(SandboxManager::new(provider, PoolConfig::default()));

    let mut catalogue = ToolCatalogue::new();
    catalogue
        .register(ToolDescriptor::exec_command(SandboxConfig::default()))
        .unwrap();
    catalogue
        .register(ToolDescriptor::write_file(SandboxConfig::default()))
        .unwrap();
    catalogue
        .register(ToolDescriptor::read_file(SandboxConfig::default()))
        .unwrap();
    let dispatcher = Arc::new(ToolDispatcher::new(Arc::new(catalogue), manager));

    let capabilities: HashMap<String, Arc<dyn Capability>> = scripts
        .into_iter()
        .map(|(name, cap)| (name.to_string(), cap as Arc<dyn Capability>))
        .collect();

    let orchestrator = Orchestrator::new(workflow, capabilities, dispatcher, limits).unwrap();
    Harness {
        _root: root,
        orchestrator,
    }
}

fn single_agent_workflow() -> WorkflowDefinition {
    WorkflowDefinition {
        name: "solo".to_string(),
        agents: vec![node("supervisor", &["exec_command", "write_file", "read_file"])],
        supervisor: "supervisor".to_string(),
        edges: vec![],
    }
}

#[tokio::test]
async fn plain_reply_is_forwarded_verbatim() {
    let mut h = harness(
        single_agent_workflow(),
        vec![(
            "supervisor",
            ScriptedCapability::new(vec![ChatMessage::assistant("Paris is the capital.")]),
        )],
        OrchestratorLimits::default(),
    );

    let reply = h.orchestrator.handle_turn("Capital of France?").await.unwrap();
    assert_eq!(reply, "Paris is the capital.");

    let turns = &h.orchestrator.conversation().turns;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].speaker, Speaker::User);
    assert_eq!(
        turns[1].speaker,
        Speaker::Agent {
            name: "supervisor".to_string()
        }
    );
    assert!(h.orchestrator.conversation().delegations.is_empty());
}

#[tokio::test]
async fn tool_results_feed_back_into_the_loop() {
    let mut h = harness(
        single_agent_workflow(),
        vec![(
            "supervisor",
            ScriptedCapability::new(vec![
                calling("exec_command", json!({"command": "echo 41+1 | bc"})),
                ChatMessage::assistant("The answer is 42."),
            ]),
        )],
        OrchestratorLimits::default(),
    );

    let reply = h.orchestrator.handle_turn("what is 41+1?").await.unwrap();
    assert_eq!(reply, "The answer is 42.");
}

#[tokio::test]
async fn unknown_tool_is_recoverable() {
    let mut h = harness(
        single_agent_workflow(),
        vec![(
            "supervisor",
            ScriptedCapability::new(vec![
                calling("launch_rockets", json!({})),
                ChatMessage::assistant("I don't have that tool."),
            ]),
        )],
        OrchestratorLimits::default(),
    );

    let reply = h.orchestrator.handle_turn("do a thing").await.unwrap();
    assert_eq!(reply, "I don't have that tool.");
}

#[tokio::test]
async fn delegation_runs_the_worker_and_records_it() {
    let workflow = WorkflowDefinition {
        name: "pair".to_string(),
        agents: vec![node("supervisor", &[]), node("worker", &["exec_command"])],
        supervisor: "supervisor".to_string(),
        edges: vec![edge("supervisor", "worker")],
    };
    let mut h = harness(
        workflow,
        vec![
            (
                "supervisor",
                ScriptedCapability::new(vec![
                    calling("worker", json!({"instruction": "count the files"})),
                    ChatMessage::assistant("There are 3 files."),
                ]),
            ),
            (
                "worker",
                ScriptedCapability::new(vec![ChatMessage::assistant("I counted 3 files.")]),
            ),
        ],
        OrchestratorLimits::default(),
    );

    let reply = h.orchestrator.handle_turn("how many files?").await.unwrap();
    assert_eq!(reply, "There are 3 files.");

    let delegations = &h.orchestrator.conversation().delegations;
    assert_eq!(delegations.len(), 1);
    assert_eq!(delegations[0].delegator, "supervisor");
    assert_eq!(delegations[0].delegate, "worker");
    assert_eq!(delegations[0].instruction, "count the files");
    assert_eq!(delegations[0].result.as_deref(), Some("I counted 3 files."));
    assert!(h.orchestrator.conversation().delegation_stack.is_empty());
}

#[tokio::test]
async fn cyclic_delegation_is_rejected_and_recoverable() {
    let workflow = WorkflowDefinition {
        name: "cycle".to_string(),
        agents: vec![node("a", &[]), node("b", &[])],
        supervisor: "a".to_string(),
        edges: vec![edge("a", "b"), edge("b", "a")],
    };
    let mut h = harness(
        workflow,
        vec![
            (
                "a",
                ScriptedCapability::new(vec![
                    calling("b", json!({"instruction": "ask a for help"})),
                    ChatMessage::assistant("resolved without a loop"),
                ]),
            ),
            (
                "b",
                ScriptedCapability::new(vec![
                    calling("a", json!({"instruction": "help me"})),
                    ChatMessage::assistant("handled it myself"),
                ]),
            ),
        ],
        OrchestratorLimits::default(),
    );

    let reply = h.orchestrator.handle_turn("go").await.unwrap();
    assert_eq!(reply, "resolved without a loop");

    // Only the permitted delegation left a record; the cycle was refused.
    let delegations = &h.orchestrator.conversation().delegations;
    assert_eq!(delegations.len(), 1);
    assert_eq!(delegations[0].result.as_deref(), Some("handled it myself"));
}

#[tokio::test]
async fn depth_limit_stops_deep_chains() {
    let workflow = WorkflowDefinition {
        name: "deep".to_string(),
        agents: vec![node("supervisor", &[]), node("w1", &[]), node("w2", &[])],
        supervisor: "supervisor".to_string(),
        edges: vec![edge("supervisor", "w1"), edge("w1", "w2")],
    };
    let limits = OrchestratorLimits {
        max_depth: 1,
        max_iterations: 10,
    };
    let mut h = harness(
        workflow,
        vec![
            (
                "supervisor",
                ScriptedCapability::new(vec![
                    calling("w1", json!({"instruction": "dig deeper"})),
                    ChatMessage::assistant("finished at the top"),
                ]),
            ),
            (
                "w1",
                ScriptedCapability::new(vec![
                    calling("w2", json!({"instruction": "even deeper"})),
                    ChatMessage::assistant("stopped digging"),
                ]),
            ),
            ("w2", ScriptedCapability::new(vec![])),
        ],
        limits,
    );

    let reply = h.orchestrator.handle_turn("go").await.unwrap();
    assert_eq!(reply, "finished at the top");

    // w2 was never activated.
    let delegations = &h.orchestrator.conversation().delegations;
    assert_eq!(delegations.len(), 1);
    assert_eq!(delegations[0].delegate, "w1");
}

#[tokio::test]
async fn unpermitted_delegation_is_denied() {
    let workflow = WorkflowDefinition {
        name: "no-edge".to_string(),
        agents: vec![node("supervisor", &[]), node("worker", &[])],
        supervisor: "supervisor".to_string(),
        edges: vec![],
    };
    let mut h = harness(
        workflow,
        vec![
            (
                "supervisor",
                ScriptedCapability::new(vec![
                    calling("worker", json!({"instruction": "do it"})),
                    ChatMessage::assistant("did it myself"),
                ]),
            ),
            ("worker", ScriptedCapability::new(vec![])),
        ],
        OrchestratorLimits::default(),
    );

    let reply = h.orchestrator.handle_turn("go").await.unwrap();
    assert_eq!(reply, "did it myself");
    assert!(h.orchestrator.conversation().delegations.is_empty());
}

#[tokio::test]
async fn supervisor_iteration_overflow_degrades_gracefully() {
    let limits = OrchestratorLimits {
        max_depth: 3,
        max_iterations: 2,
    };
    let mut h = harness(
        single_agent_workflow(),
        vec![(
            "supervisor",
            ScriptedCapability::new(vec![
                calling("exec_command", json!({"command": "true"})),
                calling("exec_command", json!({"command": "true"})),
                calling("exec_command", json!({"command": "true"})),
            ]),
        )],
        limits,
    );

    let reply = h.orchestrator.handle_turn("loop forever").await.unwrap();
    assert!(reply.contains("unable to finish"));

    // The degraded reply is part of the transcript.
    let turns = &h.orchestrator.conversation().turns;
    assert_eq!(turns.last().unwrap().content, reply);
}

#[tokio::test]
async fn ended_conversations_reject_new_turns() {
    let mut h = harness(
        single_agent_workflow(),
        vec![("supervisor", ScriptedCapability::new(vec![]))],
        OrchestratorLimits::default(),
    );

    h.orchestrator.end_conversation().await;
    let err = h.orchestrator.handle_turn("hello?").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Ended));
}

#[tokio::test]
async fn unknown_capability_fails_construction() {
    let workflow = single_agent_workflow();
    let root = tempfile::tempdir().unwrap();
    let provider = Arc::new(LocalProvider::new(Some(root.path().to_path_buf())).unwrap());
    let manager = Arc::new(SandboxManager::new(provider, PoolConfig::default()));
    let mut catalogue = ToolCatalogue::new();
    catalogue
        .register(ToolDescriptor::exec_command(SandboxConfig::default()))
        .unwrap();
    catalogue
        .register(ToolDescriptor::write_file(SandboxConfig::default()))
        .unwrap();
    catalogue
        .register(ToolDescriptor::read_file(SandboxConfig::default()))
        .unwrap();
    let dispatcher = Arc::new(ToolDispatcher::new(Arc::new(catalogue), manager));

    let err = Orchestrator::new(
        workflow,
        HashMap::new(),
        dispatcher,
        OrchestratorLimits::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, OrchestratorError::InvalidWorkflow(_)));
}

#[tokio::test]
async fn analysis_delegation_relays_the_worker_verdict_verbatim() {
    let root = tempfile::tempdir().unwrap();
    let provider = Arc::new(LocalProvider::new(Some(root.path().to_path_buf())).unwrap());
    let manager = Arc::new(SandboxManager::new(provider, PoolConfig::default()));

    let mut catalogue = ToolCatalogue::new();
    catalogue
        .register(ToolDescriptor::program(
            "run_analysis",
            "Run the static analyzer over the given target.",
            "echo analyzed",
            SandboxConfig::default(),
            false,
        ))
        .unwrap();
    let dispatcher = Arc::new(ToolDispatcher::new(Arc::new(catalogue), manager));

    let workflow = WorkflowDefinition {
        name: "analysis".to_string(),
        agents: vec![node("supervisor", &[]), node("analyst", &["run_analysis"])],
        supervisor: "supervisor".to_string(),
        edges: vec![edge("supervisor", "analyst")],
    };
    let capabilities: HashMap<String, Arc<dyn Capability>> = [
        (
            "supervisor".to_string(),
            ScriptedCapability::new(vec![
                calling("analyst", json!({"instruction": "analyze script.py"})),
                ChatMessage::assistant("no vulnerabilities found"),
            ]) as Arc<dyn Capability>,
        ),
        (
            "analyst".to_string(),
            ScriptedCapability::new(vec![
                calling("run_analysis", json!({"input": "script.py"})),
                ChatMessage::assistant("no vulnerabilities found"),
            ]) as Arc<dyn Capability>,
        ),
    ]
    .into_iter()
    .collect();

    let mut orchestrator =
        Orchestrator::new(workflow, capabilities, dispatcher, OrchestratorLimits::default())
            .unwrap();

    let reply = orchestrator.handle_turn("is script.py safe?").await.unwrap();
    assert_eq!(reply, "no vulnerabilities found");

    let delegations = &orchestrator.conversation().delegations;
    assert_eq!(delegations.len(), 1);
    assert_eq!(delegations[0].delegate, "analyst");
    assert_eq!(
        delegations[0].result.as_deref(),
        Some("no vulnerabilities found")
    );
}

#[tokio::test]
async fn aborted_turns_release_worker_sandbox_sessions() {
    let root = tempfile::tempdir().unwrap();
    let provider = Arc::new(LocalProvider::new(Some(root.path().to_path_buf())).unwrap());
    let manager = Arc::new(SandboxManager::new(provider, PoolConfig::default()));

    let mut catalogue = ToolCatalogue::new();
    catalogue
        .register(ToolDescriptor::exec_command(SandboxConfig::default()))
        .unwrap();
    let dispatcher = Arc::new(ToolDispatcher::new(Arc::new(catalogue), manager.clone()));

    let workflow = WorkflowDefinition {
        name: "flaky".to_string(),
        agents: vec![node("supervisor", &[]), node("worker", &["exec_command"])],
        supervisor: "supervisor".to_string(),
        edges: vec![edge("supervisor", "worker")],
    };
    let capabilities: HashMap<String, Arc<dyn Capability>> = [
        (
            "supervisor".to_string(),
            ScriptedCapability::new(vec![calling(
                "worker",
                json!({"instruction": "touch a file"}),
            )]) as Arc<dyn Capability>,
        ),
        (
            // The worker runs one command, then its model goes away
            // mid-delegation.
            "worker".to_string(),
            FlakyCapability::new(vec![calling(
                "exec_command",
                json!({"command": "echo working"}),
            )]) as Arc<dyn Capability>,
        ),
    ]
    .into_iter()
    .collect();

    let mut orchestrator =
        Orchestrator::new(workflow, capabilities, dispatcher, OrchestratorLimits::default())
            .unwrap();

    let err = orchestrator.handle_turn("do some work").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Capability(_)));

    // The worker's instance went back to the warm pool instead of staying
    // checked out on a session nobody will ever end.
    let stats = manager.stats().await;
    assert_eq!(stats.busy_count, 0);
    assert_eq!(stats.warm_count, 1);
    assert!(orchestrator.conversation().delegation_stack.is_empty());
}

#[tokio::test]
async fn sandbox_tools_work_end_to_end_through_a_delegation() {
    let workflow = WorkflowDefinition {
        name: "e2e".to_string(),
        agents: vec![
            node("supervisor", &[]),
            node("coder", &["exec_command", "write_file", "read_file"]),
        ],
        supervisor: "supervisor".to_string(),
        edges: vec![edge("supervisor", "coder")],
    };
    let mut h = harness(
        workflow,
        vec![
            (
                "supervisor",
                ScriptedCapability::new(vec![
                    calling("coder", json!({"instruction": "write then read a note"})),
                    ChatMessage::assistant("note handled"),
                ]),
            ),
            (
                "coder",
                ScriptedCapability::new(vec![
                    calling(
                        "write_file",
                        json!({"path": "notes/todo.txt", "content": "ship it"}),
                    ),
                    calling("read_file", json!({"path": "notes/todo.txt"})),
                    ChatMessage::assistant("the note says: ship it"),
                ]),
            ),
        ],
        OrchestratorLimits::default(),
    );

    let reply = h.orchestrator.handle_turn("take a note").await.unwrap();
    assert_eq!(reply, "note handled");
    assert_eq!(
        h.orchestrator.conversation().delegations[0].result.as_deref(),
        Some("the note says: ship it")
    );
}
