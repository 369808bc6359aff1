//! Core data model (design §3.1). Mirrors `bpmn-lite-core/src/types.rs` in
//! spirit — a flat module of `serde`-derived entities plus the scalar
//! aliases they share — generalized from a bytecode VM's state to the
//! graph-backed entities the design names.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Epoch milliseconds (UTC). Kept as an integer internally (cheap to compare
/// and order); rendered to ISO-8601 only at the wire boundary (§6.3).
pub type Timestamp = i64;

pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

pub fn to_iso8601(ts: Timestamp) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .unwrap_or_else(chrono::Utc::now)
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ─── Variable value & datatype ─────────────────────────────────

/// A typed variable value (design §4.3). `Datatype` tags the XSD type so the
/// graph store can round-trip the value through SPARQL literals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum VarValue {
    String(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    DateTime(Timestamp),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datatype {
    String,
    Integer,
    Decimal,
    Boolean,
    DateTime,
}

impl VarValue {
    pub fn datatype(&self) -> Datatype {
        match self {
            VarValue::String(_) => Datatype::String,
            VarValue::Integer(_) => Datatype::Integer,
            VarValue::Decimal(_) => Datatype::Decimal,
            VarValue::Boolean(_) => Datatype::Boolean,
            VarValue::DateTime(_) => Datatype::DateTime,
        }
    }

    /// Approximate in-memory/wire size, used against `variable_max_bytes`.
    pub fn byte_len(&self) -> usize {
        match self {
            VarValue::String(s) => s.len(),
            _ => 8,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            VarValue::Boolean(b) => *b,
            VarValue::Integer(n) => *n != 0,
            VarValue::Decimal(d) => *d != 0.0,
            VarValue::String(s) => !s.is_empty(),
            VarValue::DateTime(_) => true,
        }
    }
}

// ─── ProcessDefinition ──────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefinitionStatus {
    Active,
    Retired,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    pub version: u32,
    pub name: String,
    pub status: DefinitionStatus,
    pub nodes: Vec<FlowNode>,
    pub flows: Vec<SequenceFlow>,
    /// Original XML payload, stored verbatim alongside the parsed form (§6.1).
    pub source_xml: String,
}

impl ProcessDefinition {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn outgoing(&self, node_id: &str) -> Vec<&SequenceFlow> {
        self.flows.iter().filter(|f| f.source == node_id).collect()
    }

    pub fn incoming(&self, node_id: &str) -> Vec<&SequenceFlow> {
        self.flows.iter().filter(|f| f.target == node_id).collect()
    }

    pub fn boundary_events_on(&self, activity_id: &str) -> Vec<&FlowNode> {
        self.nodes
            .iter()
            .filter(|n| matches!(&n.kind, NodeKind::BoundaryEvent { attached_to, .. } if attached_to == activity_id))
            .collect()
    }
}

// ─── FlowNode ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndEventKind {
    None,
    Message,
    Error,
    Terminate,
    Cancel,
    Compensation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatchEventTrigger {
    Message,
    Timer,
    Signal,
    Error,
    Escalation,
    Conditional,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultiInstanceMode {
    Parallel,
    Sequential,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiInstanceSpec {
    pub mode: MultiInstanceMode,
    /// A guard-grammar expression (design §4.2) evaluating to an integer count.
    pub cardinality_expr: String,
    /// A guard-grammar expression; if true after a completion, remaining
    /// iterations are cancelled (design §4.6).
    pub completion_condition: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionListener {
    pub event: ListenerEvent,
    /// Registered topic name to invoke (preferred form, design §4.5.3).
    pub expression: Option<String>,
    /// Stored verbatim; invoking it is out of scope unless a handler with a
    /// matching name exists.
    pub class_or_delegate: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenerEvent {
    Start,
    End,
    Take,
    Create,
    Assignment,
    Complete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NodeKind {
    /// `message_name` is set when a `messageEventDefinition` is attached —
    /// the start event doubles as a registered message-start (design §4.7).
    StartEvent { message_name: Option<String> },
    /// Event-subprocess-only start variant; never entered by ordinary flow.
    EventSubprocessStart { trigger: CatchEventTrigger },
    EndEvent { kind: EndEventKind },
    ServiceTask { topic: Option<String> },
    SendTask { topic: Option<String> },
    UserTask,
    ReceiveTask { message_name: String, corr_key_source: String },
    ScriptTask { script: String },
    ManualTask,
    IntermediateThrowEvent { message_name: Option<String> },
    IntermediateCatchEvent { trigger: CatchEventTrigger, detail: CatchDetail },
    BoundaryEvent {
        attached_to: String,
        trigger: CatchEventTrigger,
        detail: CatchDetail,
        cancel_activity: bool,
    },
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
    EmbeddedSubprocess { start_node: String, own_variable_scope: bool },
    EventSubprocess { start_node: String, interrupting: bool },
    CallActivity {
        called_element: String,
        in_variables: Option<Vec<String>>,
        out_variables: Option<Vec<String>>,
    },
}

/// Extra parameters for catch-style triggers (timer duration, message name, …).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CatchDetail {
    None,
    TimerDuration { iso8601_duration: String },
    TimerDate { iso8601_date: String },
    TimerCycle { iso8601_cycle: String },
    Message { message_name: String, corr_key_source: String },
    Signal { signal_name: String },
    Error { error_code: Option<String> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    pub name: Option<String>,
    pub kind: NodeKind,
    pub multi_instance: Option<MultiInstanceSpec>,
    pub listeners: Vec<ExecutionListener>,
    pub in_variables: Option<Vec<String>>,
    pub out_variables: Option<Vec<String>>,
    /// Id of the enclosing `EmbeddedSubprocess`/`EventSubprocess` node, or
    /// `None` at the top level of the process. Lets the executor tell an
    /// inner end event (pop the scope) from the process's own end.
    pub container: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    /// A guard-grammar expression or full SPARQL ASK body (design §4.2).
    pub condition: Option<String>,
    pub is_default: bool,
}

// ─── ProcessInstance ────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Created,
    Running,
    Waiting,
    Completed,
    Terminated,
    Error,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed
                | InstanceStatus::Terminated
                | InstanceStatus::Error
                | InstanceStatus::Cancelled
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub instance_id: Uuid,
    pub definition_id: String,
    pub definition_version: u32,
    pub status: InstanceStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub parent: Option<ParentLink>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParentLink {
    pub parent_instance_id: Uuid,
    pub parent_call_node: String,
}

// ─── Token ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenState {
    Active,
    Waiting,
    Consumed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub token_id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    /// Stack of active subprocess scope ids, outermost first.
    pub scope_path: Vec<String>,
    pub state: TokenState,
    pub loop_index: Option<u32>,
}

impl Token {
    pub fn new(instance_id: Uuid, node_id: impl Into<String>, scope_path: Vec<String>) -> Self {
        Self {
            token_id: Uuid::now_v7(),
            instance_id,
            node_id: node_id.into(),
            scope_path,
            state: TokenState::Active,
            loop_index: None,
        }
    }
}

// ─── UserTask ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserTaskStatus {
    Created,
    Claimed,
    Completed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserTask {
    pub task_id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    pub token_id: Uuid,
    pub assignee: Option<String>,
    pub claimed_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub status: UserTaskStatus,
}

// ─── AuditEvent ─────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub seq: u64,
    pub instance_id: Uuid,
    pub node_id: Option<String>,
    pub event_type: String,
    pub timestamp: Timestamp,
    pub actor: String,
    pub details: Option<serde_json::Value>,
}

impl AuditEvent {
    pub const SYSTEM_ACTOR: &'static str = "System";
}

// ─── TimerJob ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerStatus {
    DuePending,
    Leased,
    Fired,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerJob {
    pub timer_id: Uuid,
    pub instance_id: Uuid,
    pub token_id: Uuid,
    pub target_node: String,
    pub due_at: Timestamp,
    pub lease_holder: Option<String>,
    pub lease_expires_at: Option<Timestamp>,
    pub attempts: u32,
    pub status: TimerStatus,
}

// ─── Message correlation ────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageSubscription {
    pub subscription_id: Uuid,
    pub instance_id: Uuid,
    pub token_id: Uuid,
    pub name: String,
    pub corr_key: String,
    /// Set when this subscription is one arm of an event-based gateway race.
    pub race_group: Option<String>,
}

// ─── Async HTTP handler suspension (design §4.4) ────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AsyncHandlerJob {
    pub job_id: Uuid,
    pub instance_id: Uuid,
    pub token_id: Uuid,
    pub node_id: String,
    pub topic: String,
    pub lease_holder: Option<String>,
}

// ─── Wire forms (design §6.3) ───────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariableWire {
    pub name: String,
    pub value: serde_json::Value,
    pub datatype: Datatype,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEventWire {
    pub event_uri: String,
    pub instance: Uuid,
    pub node: Option<String>,
    pub event_type: String,
    pub timestamp: String,
    pub actor: String,
    pub details: Option<serde_json::Value>,
}

impl From<&AuditEvent> for AuditEventWire {
    fn from(e: &AuditEvent) -> Self {
        AuditEventWire {
            event_uri: crate::vocab::iri("event", e.event_id),
            instance: e.instance_id,
            node: e.node_id.clone(),
            event_type: e.event_type.clone(),
            timestamp: to_iso8601(e.timestamp),
            actor: e.actor.clone(),
            details: e.details.clone(),
        }
    }
}

pub type Variables = BTreeMap<String, VarValue>;
