//! External Interface Adapter (design §6.1, "C10").
//!
//! A thin surface over (C9) the supervisor and (C1) read-only graph queries —
//! this is the seam a REST handler or CLI command would call into; no wire
//! protocol lives here, only the request/response shapes §6.1's table names
//! and the plumbing to produce them. Grounded on
//! `bpmn-lite-server/src/grpc.rs`, which does exactly this: hold an engine
//! facade, translate each RPC to one facade call, map domain results to wire
//! structs.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::executor::Executor;
use crate::handlers::{Handler, HandlerRegistry};
use crate::store::{GraphStore, QueryResultSet, Solution};
use crate::supervisor::InstanceSupervisor;
use crate::types::{
    to_iso8601, AuditEventWire, DefinitionStatus, InstanceStatus, ProcessDefinition, Timestamp,
    UserTaskStatus, VarValue, VariableWire, Variables,
};
use crate::variables::VariableStore;
use crate::vocab;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// `listInstances` / `getInstance` row: status plus the variable snapshot and
/// the node ids any ACTIVE/WAITING token currently sits on.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub instance_id: Uuid,
    pub definition_id: String,
    pub definition_version: u32,
    pub status: InstanceStatus,
    pub current_nodes: Vec<String>,
    pub variables: Vec<VariableWire>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserTaskView {
    pub task_id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    pub assignee: Option<String>,
    pub status: UserTaskStatus,
}

pub struct ControlApi {
    store: Arc<dyn GraphStore>,
    handlers: HandlerRegistry,
    supervisor: InstanceSupervisor,
}

impl ControlApi {
    pub fn new(store: Arc<dyn GraphStore>, handlers: HandlerRegistry, config: Arc<EngineConfig>) -> Self {
        let supervisor = InstanceSupervisor::new(store.clone(), handlers.clone(), config);
        Self { store, handlers, supervisor }
    }

    // ─── definitions ─────────────────────────────────────────────

    pub async fn deploy_definition(&self, definition_id: &str, xml: &str) -> EngineResult<(String, u32)> {
        self.supervisor.deploy_definition(definition_id, xml).await
    }

    pub async fn list_definitions(&self) -> EngineResult<Vec<(String, u32, DefinitionStatus)>> {
        self.supervisor.list_definitions().await
    }

    pub async fn get_definition(&self, definition_id: &str, version: u32) -> EngineResult<Option<ProcessDefinition>> {
        self.supervisor.get_definition(definition_id, version).await
    }

    pub async fn retire_definition(&self, definition_id: &str, version: u32) -> EngineResult<()> {
        self.supervisor.retire_definition(definition_id, version).await
    }

    // ─── instances ───────────────────────────────────────────────

    pub async fn start_instance(
        &self,
        definition_id: &str,
        version: Option<u32>,
        initial_variables: Variables,
        start_event_id: Option<&str>,
    ) -> EngineResult<(Uuid, Vec<VariableWire>)> {
        let instance_id = self.supervisor.start(definition_id, version, initial_variables, start_event_id).await?;
        let snapshot = self.variable_snapshot(instance_id).await?;
        Ok((instance_id, snapshot))
    }

    pub async fn get_instance(&self, instance_id: Uuid) -> EngineResult<Option<InstanceView>> {
        let query = format!(
            "SELECT ?id ?v ?status WHERE {{ <{inst_iri}> <{def_ref}> ?id . <{inst_iri}> <{def_ver}> ?v . <{inst_iri}> <{status}> ?status }}",
            inst_iri = vocab::iri("inst", instance_id),
            def_ref = vocab::pred::DEFINITION_REF,
            def_ver = vocab::pred::DEFINITION_VERSION,
            status = vocab::pred::STATUS,
        );
        let results = self.store.query(vocab::graph::INST, &query).await.map_err(EngineError::from)?;
        let Some(row) = results.as_solutions().map_err(EngineError::from)?.first().cloned() else {
            return Ok(None);
        };
        let definition_id = strip_quotes(field(&row, "id")?).to_string();
        let definition_version: u32 = strip_quotes(field(&row, "v")?)
            .parse()
            .map_err(|_| EngineError::StoreError(format!("instance {instance_id} has non-numeric definitionVersion")))?;
        let status = parse_instance_status(strip_quotes(field(&row, "status")?));

        let executor = Executor::new(self.store.as_ref(), &self.handlers, false);
        let current_nodes: Vec<String> = executor
            .tokens_for_instance(instance_id)
            .await
            .map_err(EngineError::from)?
            .into_iter()
            .map(|t| t.node_id)
            .collect();

        let variables = self.variable_snapshot(instance_id).await?;

        Ok(Some(InstanceView {
            instance_id,
            definition_id,
            definition_version,
            status,
            current_nodes,
            variables,
        }))
    }

    pub async fn list_instances(&self) -> EngineResult<Vec<InstanceView>> {
        let query = format!(
            "SELECT ?inst WHERE {{ ?inst <{rdf_type}> <{class}> }}",
            rdf_type = vocab::pred::RDF_TYPE,
            class = vocab::class::PROCESS_INSTANCE,
        );
        let results = self.store.query(vocab::graph::INST, &query).await.map_err(EngineError::from)?;
        let mut out = Vec::new();
        for row in results.as_solutions().map_err(EngineError::from)? {
            let instance_id = parse_uuid_iri(field(row, "inst")?)?;
            if let Some(view) = self.get_instance(instance_id).await? {
                out.push(view);
            }
        }
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(out)
    }

    pub async fn stop_instance(&self, instance_id: Uuid, reason: &str) -> EngineResult<()> {
        self.supervisor.stop(instance_id, reason).await
    }

    /// §6.1 groups `cancelInstance` with `throwError` rather than with
    /// `stopInstance`, but the control surface has no behavior for
    /// "cancel" beyond §4.9's `stop` (tear down every token, terminal
    /// status) — so this is `stop` under the name an operator-facing cancel
    /// action would use.
    pub async fn cancel_instance(&self, instance_id: Uuid, reason: &str) -> EngineResult<()> {
        self.supervisor.stop(instance_id, reason).await
    }

    pub async fn throw_error(&self, instance_id: Uuid, error_code: &str, message: &str) -> EngineResult<()> {
        self.supervisor.throw_error(instance_id, error_code, message).await
    }

    pub async fn history(&self, instance_id: Uuid) -> EngineResult<Vec<AuditEventWire>> {
        let events = crate::audit::AuditLog::new(self.store.as_ref())
            .history(instance_id)
            .await
            .map_err(EngineError::from)?;
        Ok(events.iter().map(AuditEventWire::from).collect())
    }

    async fn variable_snapshot(&self, instance_id: Uuid) -> EngineResult<Vec<VariableWire>> {
        let vars = VariableStore::new(self.store.as_ref(), usize::MAX)
            .snapshot(instance_id, &[])
            .await
            .map_err(EngineError::from)?;
        Ok(vars
            .into_iter()
            .map(|(name, value)| VariableWire { name, datatype: value.datatype(), value: var_value_to_json(&value) })
            .collect())
    }

    // ─── user tasks ──────────────────────────────────────────────

    pub async fn list_tasks(&self, instance_id: Option<Uuid>) -> EngineResult<Vec<UserTaskView>> {
        let query = match instance_id {
            Some(id) => format!(
                "SELECT ?t ?node ?assignee ?status WHERE {{
                    ?t <{inst_pred}> <{inst_iri}> . ?t <{node_pred}> ?node . ?t <{status_pred}> ?status .
                    OPTIONAL {{ ?t <{assignee_pred}> ?assignee }}
                 }}",
                inst_pred = vocab::pred::TASK_INSTANCE,
                inst_iri = vocab::iri("inst", id),
                node_pred = vocab::pred::TASK_NODE,
                status_pred = vocab::pred::TASK_STATUS,
                assignee_pred = vocab::pred::ASSIGNEE,
            ),
            None => format!(
                "SELECT ?t ?inst ?node ?assignee ?status WHERE {{
                    ?t <{rdf_type}> <{class}> . ?t <{inst_pred}> ?inst . ?t <{node_pred}> ?node . ?t <{status_pred}> ?status .
                    OPTIONAL {{ ?t <{assignee_pred}> ?assignee }}
                 }}",
                rdf_type = vocab::pred::RDF_TYPE,
                class = vocab::class::USER_TASK,
                inst_pred = vocab::pred::TASK_INSTANCE,
                node_pred = vocab::pred::TASK_NODE,
                status_pred = vocab::pred::TASK_STATUS,
                assignee_pred = vocab::pred::ASSIGNEE,
            ),
        };
        let results = self.store.query(vocab::graph::TASKS, &query).await.map_err(EngineError::from)?;
        results
            .as_solutions()
            .map_err(EngineError::from)?
            .iter()
            .map(|row| {
                let task_id = parse_uuid_iri(field(row, "t")?)?;
                let resolved_instance = match instance_id {
                    Some(id) => id,
                    None => parse_uuid_iri(field(row, "inst")?)?,
                };
                Ok(UserTaskView {
                    task_id,
                    instance_id: resolved_instance,
                    node_id: strip_quotes(field(row, "node")?).to_string(),
                    assignee: row.get("assignee").map(|a| strip_quotes(a).to_string()),
                    status: parse_user_task_status(strip_quotes(field(row, "status")?)),
                })
            })
            .collect()
    }

    pub async fn claim_task(&self, task_id: Uuid, assignee: &str) -> EngineResult<()> {
        self.supervisor.claim_task(task_id, assignee).await
    }

    pub async fn complete_task(&self, task_id: Uuid, variables: Variables) -> EngineResult<()> {
        self.supervisor.complete_task(task_id, variables).await
    }

    // ─── topics ──────────────────────────────────────────────────

    pub fn register_topic(&self, topic: &str, handler: Handler) {
        self.handlers.register(topic, handler);
    }

    pub fn unregister_topic(&self, topic: &str) {
        self.handlers.unregister(topic);
    }

    pub async fn test_topic(&self, topic: &str, input: Variables) -> EngineResult<Variables> {
        self.supervisor.test_topic(topic, input).await
    }

    // ─── timer sweep / event delivery (not in §6.1's table, but the
    // operations a process-level poller and REST message/signal endpoints
    // would call through this same facade) ────────────────────────

    pub async fn run_due_timers(&self, now: Timestamp) -> EngineResult<usize> {
        self.supervisor.run_due_timers(now).await
    }

    pub async fn run_pending_async_handlers(&self, now: Timestamp) -> EngineResult<usize> {
        self.supervisor.run_pending_async_handlers(now).await
    }

    pub async fn correlate_message(&self, message_name: &str, corr_key: &str) -> EngineResult<bool> {
        self.supervisor.correlate_message(message_name, corr_key).await
    }

    pub async fn broadcast_signal(&self, signal_name: &str) -> EngineResult<usize> {
        self.supervisor.broadcast_signal(signal_name).await
    }

    // ─── graph introspection ─────────────────────────────────────

    /// `queryGraph`: read-only SPARQL against one named graph, for
    /// diagnostics/tooling. Never routed through the supervisor since it
    /// never mutates state and needs no instance lock.
    pub async fn query_graph(&self, named_graph: &str, sparql: &str) -> EngineResult<QueryResultSet> {
        self.store.query(named_graph, sparql).await.map_err(EngineError::from)
    }
}

fn var_value_to_json(value: &VarValue) -> serde_json::Value {
    match value {
        VarValue::String(s) => serde_json::Value::String(s.clone()),
        VarValue::Integer(n) => serde_json::Value::from(*n),
        VarValue::Decimal(d) => serde_json::Number::from_f64(*d).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null),
        VarValue::Boolean(b) => serde_json::Value::Bool(*b),
        VarValue::DateTime(ts) => serde_json::Value::String(to_iso8601(*ts)),
    }
}

fn field<'r>(row: &'r Solution, key: &str) -> EngineResult<&'r str> {
    row.get(key).map(String::as_str).ok_or_else(|| EngineError::StoreError(format!("missing ?{key} in solution row")))
}

fn strip_quotes(s: &str) -> &str {
    let s = s.split("^^").next().unwrap_or(s);
    s.trim_matches('"')
}

fn parse_uuid_iri(s: &str) -> EngineResult<Uuid> {
    let body = s.trim_start_matches('<').trim_end_matches('>');
    let id = body.rsplit(':').next().ok_or_else(|| EngineError::StoreError(format!("malformed IRI: {s}")))?;
    Uuid::parse_str(id).map_err(|e| EngineError::StoreError(format!("malformed IRI {s}: {e}")))
}

fn parse_instance_status(s: &str) -> InstanceStatus {
    match s {
        "Running" => InstanceStatus::Running,
        "Waiting" => InstanceStatus::Waiting,
        "Completed" => InstanceStatus::Completed,
        "Terminated" => InstanceStatus::Terminated,
        "Error" => InstanceStatus::Error,
        "Cancelled" => InstanceStatus::Cancelled,
        _ => InstanceStatus::Created,
    }
}

fn parse_user_task_status(s: &str) -> UserTaskStatus {
    match s {
        "Claimed" => UserTaskStatus::Claimed,
        "Completed" => UserTaskStatus::Completed,
        _ => UserTaskStatus::Created,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OxigraphStore;

    fn api() -> ControlApi {
        let store: Arc<dyn GraphStore> = Arc::new(OxigraphStore::open_memory().unwrap());
        ControlApi::new(store, HandlerRegistry::new(), Arc::new(EngineConfig::default()))
    }

    const XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="p1">
    <startEvent id="start1" />
    <sequenceFlow id="f1" sourceRef="start1" targetRef="task1" />
    <serviceTask id="task1">
      <extensionElements><taskDefinition type="double" /></extensionElements>
    </serviceTask>
    <sequenceFlow id="f2" sourceRef="task1" targetRef="end1" />
    <endEvent id="end1" />
  </process>
</definitions>"#;

    #[tokio::test]
    async fn start_instance_returns_id_and_snapshot_after_quiescence() {
        let api = api();
        api.register_topic(
            "double",
            Handler::Function(Arc::new(|mut vars: Variables| {
                Box::pin(async move {
                    if let Some(VarValue::Integer(x)) = vars.get("x").cloned() {
                        vars.insert("x".to_string(), VarValue::Integer(x * 2));
                    }
                    Ok(vars)
                })
            })),
        );
        api.deploy_definition("p1", XML).await.unwrap();

        let mut initial = Variables::new();
        initial.insert("x".to_string(), VarValue::Integer(21));
        let (instance_id, snapshot) = api.start_instance("p1", None, initial, None).await.unwrap();

        let x = snapshot.iter().find(|v| v.name == "x").unwrap();
        assert_eq!(x.value, serde_json::json!(42));

        let view = api.get_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(view.status, InstanceStatus::Completed);
        assert!(view.current_nodes.is_empty());
    }

    #[tokio::test]
    async fn list_instances_reflects_started_instances() {
        let api = api();
        api.deploy_definition("p1", XML).await.unwrap();
        let (instance_id, _) = api.start_instance("p1", None, Variables::new(), None).await.unwrap();

        let all = api.list_instances().await.unwrap();
        assert!(all.iter().any(|v| v.instance_id == instance_id));
    }

    #[tokio::test]
    async fn query_graph_reads_deployed_definition_identity() {
        let api = api();
        api.deploy_definition("p1", XML).await.unwrap();
        let query = format!("SELECT ?s WHERE {{ ?s <{}> \"p1\" }}", vocab::pred::DEFINITION_ID);
        let results = api.query_graph(vocab::graph::DEFS, &query).await.unwrap();
        assert!(!results.as_solutions().unwrap().is_empty());
    }

    /// "deploy(defn) -> id; getDefinition(id) -> defn'" round-trip property
    /// (design §8): the loaded definition must carry the same node/flow
    /// graph as what was parsed, modulo the store's own id/version stamping.
    #[tokio::test]
    async fn get_definition_round_trips_the_deployed_node_and_flow_graph() {
        let api = api();
        let (definition_id, version) = api.deploy_definition("p1", XML).await.unwrap();
        let original = crate::compiler::parse_bpmn(XML, &definition_id, version).unwrap();

        let loaded = api.get_definition(&definition_id, version).await.unwrap().expect("deployed definition must load back");

        assert_eq!(loaded.id, original.id);
        assert_eq!(loaded.version, original.version);
        assert_eq!(loaded.status, original.status);

        let mut original_node_ids: Vec<&str> = original.nodes.iter().map(|n| n.id.as_str()).collect();
        let mut loaded_node_ids: Vec<&str> = loaded.nodes.iter().map(|n| n.id.as_str()).collect();
        original_node_ids.sort_unstable();
        loaded_node_ids.sort_unstable();
        assert_eq!(loaded_node_ids, original_node_ids);

        for node in &original.nodes {
            let round_tripped = loaded.node(&node.id).unwrap_or_else(|| panic!("node {} missing after round-trip", node.id));
            assert_eq!(format!("{:?}", round_tripped.kind), format!("{:?}", node.kind));
        }

        let mut original_flows: Vec<(&str, &str, &str)> =
            original.flows.iter().map(|f| (f.id.as_str(), f.source.as_str(), f.target.as_str())).collect();
        let mut loaded_flows: Vec<(&str, &str, &str)> =
            loaded.flows.iter().map(|f| (f.id.as_str(), f.source.as_str(), f.target.as_str())).collect();
        original_flows.sort_unstable();
        loaded_flows.sort_unstable();
        assert_eq!(loaded_flows, original_flows);
    }
}
