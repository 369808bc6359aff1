//! Scope & Subprocess Controller (design §4.6, "C6").
//!
//! Embedded subprocess entry/exit is simple enough (push/pop one scope
//! segment, one token) that `executor.rs` handles it inline. This module
//! covers the two cases that need more bookkeeping: call activities (child
//! `ProcessInstance` creation, in/out variable mapping) and multi-instance
//! activities (cardinality, completion condition, loop variables).
//!
//! Multi-instance fan-out dispatches on the loop characteristics' mode:
//! sequential iterations run one at a time in a single `step()` call;
//! parallel iterations are driven concurrently as sibling futures, each in
//! its own scope segment so per-iteration output variables don't clobber
//! one another, racing a `completionCondition` check against however many
//! are still outstanding.

use crate::audit::{event_type, AuditLog};
use crate::condition::evaluate_guard;
use crate::error::{EngineError, EngineResult};
use crate::executor::{Executor, StepOutcome};
use crate::store::GraphStore;
use crate::types::{
    AuditEvent, FlowNode, InstanceStatus, ListenerEvent, MultiInstanceMode, MultiInstanceSpec,
    NodeKind, ProcessDefinition, Token, VarValue,
};
use crate::variables::VariableStore;
use crate::vocab;
use futures::stream::{FuturesUnordered, StreamExt};
use oxigraph::model::{Literal, NamedNode, Term};
use uuid::Uuid;

// ─── Call Activity ──────────────────────────────────────────────

pub async fn start_call_activity(
    executor: &Executor<'_>,
    definition: &ProcessDefinition,
    token: Token,
    node: &FlowNode,
) -> EngineResult<StepOutcome> {
    let NodeKind::CallActivity { called_element, in_variables, out_variables: _ } = &node.kind else {
        unreachable!("start_call_activity called on non-CallActivity node");
    };
    if called_element.is_empty() {
        return Err(EngineError::BadDefinition {
            message: format!("call activity {} has no calledElement", node.id),
        });
    }

    let version = crate::compiler::resolve_active_version(executor.store, called_element)
        .await
        .map_err(EngineError::from)?
        .ok_or_else(|| EngineError::BadDefinition {
            message: format!("calledElement '{called_element}' has no deployed Active version"),
        })?;
    let child_defn = crate::compiler::load_definition(executor.store, called_element, version)
        .await
        .map_err(EngineError::from)?
        .ok_or_else(|| EngineError::BadDefinition {
            message: format!("calledElement '{called_element}' version {version} failed to load"),
        })?;
    let start_node = child_defn
        .nodes
        .iter()
        .find(|n| matches!(n.kind, NodeKind::StartEvent { .. }))
        .ok_or_else(|| EngineError::BadDefinition {
            message: format!("calledElement '{called_element}' has no start event"),
        })?
        .id
        .clone();

    let child_id = Uuid::now_v7();
    let now = crate::types::now_ms();
    let child_subject = vocab::iri("inst", child_id);
    let fields = vec![
        (vocab::pred::RDF_TYPE, Term::from(NamedNode::new_unchecked(vocab::class::PROCESS_INSTANCE))),
        (vocab::pred::DEFINITION_REF, Literal::new_simple_literal(called_element).into()),
        (vocab::pred::DEFINITION_VERSION, integer_literal(version as i64)),
        (vocab::pred::STATUS, Literal::new_simple_literal("Running").into()),
        (vocab::pred::CREATED_AT, crate::store::value_to_term(&VarValue::DateTime(now))),
        (vocab::pred::UPDATED_AT, crate::store::value_to_term(&VarValue::DateTime(now))),
        (
            vocab::pred::PARENT_INSTANCE,
            Term::from(NamedNode::new_unchecked(vocab::iri("inst", token.instance_id))),
        ),
        (vocab::pred::PARENT_CALL_NODE, Literal::new_simple_literal(&node.id).into()),
    ];
    executor.store.put_subject(vocab::graph::INST, &child_subject, fields).await.map_err(EngineError::from)?;

    let vars = VariableStore::new(executor.store, executor.variable_max_bytes);
    let parent_snapshot = vars.snapshot(token.instance_id, &[]).await.map_err(EngineError::from)?;
    let to_copy: Vec<(String, VarValue)> = match in_variables {
        Some(names) => names
            .iter()
            .filter_map(|n| parent_snapshot.get(n).map(|v| (n.clone(), v.clone())))
            .collect(),
        None => parent_snapshot.into_iter().collect(),
    };
    for (name, value) in to_copy {
        vars.set(child_id, &[], &name, value).await?;
    }

    AuditLog::new(executor.store)
        .record(
            token.instance_id,
            Some(&node.id),
            event_type::CALL_ACTIVITY_START,
            AuditEvent::SYSTEM_ACTOR,
            Some(serde_json::json!({"calledElement": called_element, "childInstance": child_id.to_string()})),
        )
        .await
        .map_err(EngineError::from)?;

    executor.park(token.clone()).await?;
    let boundaries = definition.boundary_events_on(&node.id);
    executor.arm_boundary_events(token.instance_id, &token.scope_path, &boundaries).await?;

    // Kick the child off immediately rather than waiting for an external
    // poll: most call activities (no user tasks, no waits in the callee)
    // complete within this same call, so the parent need never park at all
    // from an outside observer's perspective.
    executor.spawn_token(child_id, &start_node, vec![]).await.map_err(EngineError::from)?;
    executor.run_to_quiescence(&child_defn, child_id).await?;

    match instance_status(executor.store, child_id).await.map_err(EngineError::from)? {
        Some(status) if status.is_terminal() => {
            complete_call_activity(executor, definition, token.instance_id, &node.id, child_id, status).await
        }
        _ => Ok(StepOutcome::Parked),
    }
}

pub async fn instance_status(store: &dyn GraphStore, instance_id: Uuid) -> anyhow::Result<Option<InstanceStatus>> {
    let query = format!(
        "SELECT ?s WHERE {{ <{inst_iri}> <{status}> ?s }}",
        inst_iri = vocab::iri("inst", instance_id),
        status = vocab::pred::STATUS,
    );
    let results = store.query(vocab::graph::INST, &query).await?;
    let Some(row) = results.as_solutions()?.first() else { return Ok(None) };
    let s = row.get("s").ok_or_else(|| anyhow::anyhow!("missing ?s"))?;
    let s = s.split("^^").next().unwrap_or(s).trim_matches('"');
    Ok(Some(parse_instance_status(s)))
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

fn integer_literal(n: i64) -> Term {
    Literal::new_typed_literal(n.to_string(), NamedNode::new_unchecked("http://www.w3.org/2001/XMLSchema#integer")).into()
}

/// The `(parentInstanceId, callNodeId)` pair a child instance was started
/// from, if it was started by a call activity at all (the Instance
/// Supervisor uses this to decide whether a terminal instance needs to
/// resume a waiting caller).
pub async fn parent_link(store: &dyn GraphStore, instance_id: Uuid) -> anyhow::Result<Option<crate::types::ParentLink>> {
    let query = format!(
        "SELECT ?p ?n WHERE {{ <{inst_iri}> <{parent}> ?p . <{inst_iri}> <{call_node}> ?n }}",
        inst_iri = vocab::iri("inst", instance_id),
        parent = vocab::pred::PARENT_INSTANCE,
        call_node = vocab::pred::PARENT_CALL_NODE,
    );
    let results = store.query(vocab::graph::INST, &query).await?;
    let Some(row) = results.as_solutions()?.first() else { return Ok(None) };
    let p = row.get("p").ok_or_else(|| anyhow::anyhow!("missing ?p"))?;
    let p = p.trim_start_matches('<').trim_end_matches('>');
    let parent_id = p.rsplit(':').next().ok_or_else(|| anyhow::anyhow!("malformed parent IRI: {p}"))?;
    let n = row.get("n").ok_or_else(|| anyhow::anyhow!("missing ?n"))?;
    let n = n.split("^^").next().unwrap_or(n).trim_matches('"');
    Ok(Some(crate::types::ParentLink {
        parent_instance_id: Uuid::parse_str(parent_id)?,
        parent_call_node: n.to_string(),
    }))
}

/// Invoked by the Instance Supervisor once a call activity's child instance
/// reaches a terminal status: copies `outVariables` (or all, if unset) back
/// into the parent and resumes the parent's waiting token.
pub async fn complete_call_activity(
    executor: &Executor<'_>,
    definition: &ProcessDefinition,
    parent_instance_id: Uuid,
    call_node_id: &str,
    child_instance_id: Uuid,
    child_status: InstanceStatus,
) -> EngineResult<StepOutcome> {
    let node = definition.node(call_node_id).ok_or_else(|| EngineError::BadDefinition {
        message: format!("call activity node {call_node_id} not found"),
    })?;
    let NodeKind::CallActivity { out_variables, .. } = &node.kind else {
        return Err(EngineError::BadDefinition { message: format!("{call_node_id} is not a CallActivity") });
    };

    if child_status != InstanceStatus::Completed {
        return fail_call_activity(executor, definition, parent_instance_id, call_node_id, child_instance_id, child_status).await;
    }

    let vars = VariableStore::new(executor.store, executor.variable_max_bytes);
    let child_snapshot = vars.snapshot(child_instance_id, &[]).await.map_err(EngineError::from)?;
    let to_copy: Vec<(String, VarValue)> = match out_variables {
        Some(names) => names
            .iter()
            .filter_map(|n| child_snapshot.get(n).map(|v| (n.clone(), v.clone())))
            .collect(),
        None => child_snapshot.into_iter().collect(),
    };
    for (name, value) in to_copy {
        vars.set(parent_instance_id, &[], &name, value).await?;
    }

    AuditLog::new(executor.store)
        .record(
            parent_instance_id,
            Some(call_node_id),
            event_type::CALL_ACTIVITY_COMPLETE,
            AuditEvent::SYSTEM_ACTOR,
            Some(serde_json::json!({"childInstance": child_instance_id.to_string()})),
        )
        .await
        .map_err(EngineError::from)?;

    let waiting = executor
        .tokens_for_instance(parent_instance_id)
        .await
        .map_err(EngineError::from)?
        .into_iter()
        .find(|t| t.node_id == call_node_id)
        .ok_or_else(|| EngineError::NotFound { what: "waiting call-activity token", id: call_node_id.to_string() })?;

    executor.cancel_boundary_events(definition, parent_instance_id, &waiting.scope_path, call_node_id).await?;

    let mut resumed = waiting;
    resumed.state = crate::types::TokenState::Active;
    executor.take_single_outgoing(definition, resumed).await
}

/// A call activity's child reached `Error`/`Terminated` instead of
/// `Completed`: raise the failure on the parent's call-activity node through
/// the normal §4.5.4 escalation walk, starting from the waiting token's own
/// scope, rather than leaving it parked forever.
async fn fail_call_activity(
    executor: &Executor<'_>,
    definition: &ProcessDefinition,
    parent_instance_id: Uuid,
    call_node_id: &str,
    child_instance_id: Uuid,
    child_status: InstanceStatus,
) -> EngineResult<StepOutcome> {
    let waiting = executor
        .tokens_for_instance(parent_instance_id)
        .await
        .map_err(EngineError::from)?
        .into_iter()
        .find(|t| t.node_id == call_node_id)
        .ok_or_else(|| EngineError::NotFound { what: "waiting call-activity token", id: call_node_id.to_string() })?;

    let error_code = AuditLog::new(executor.store)
        .history(child_instance_id)
        .await
        .map_err(EngineError::from)?
        .into_iter()
        .rev()
        .find(|e| e.event_type == event_type::ERROR)
        .and_then(|e| e.details)
        .and_then(|d| d.get("errorCode").and_then(|v| v.as_str().map(str::to_string)))
        .unwrap_or_else(|| "CallActivityFailure".to_string());

    AuditLog::new(executor.store)
        .record(
            parent_instance_id,
            Some(call_node_id),
            event_type::CALL_ACTIVITY_ERROR,
            AuditEvent::SYSTEM_ACTOR,
            Some(serde_json::json!({
                "childInstance": child_instance_id.to_string(),
                "childStatus": format!("{child_status:?}"),
                "errorCode": error_code,
            })),
        )
        .await
        .map_err(EngineError::from)?;

    executor
        .throw_error_at_scope(
            definition,
            parent_instance_id,
            &waiting.scope_path,
            &error_code,
            &format!("call activity child {child_instance_id} ended in {child_status:?}"),
        )
        .await?;

    Ok(StepOutcome::Consumed)
}

// ─── Multi-instance ─────────────────────────────────────────────

pub async fn run_multi_instance(
    executor: &Executor<'_>,
    definition: &ProcessDefinition,
    token: Token,
    node: &FlowNode,
) -> EngineResult<StepOutcome> {
    let spec = node.multi_instance.as_ref().expect("checked by caller");
    match spec.mode {
        MultiInstanceMode::Sequential => run_multi_instance_sequential(executor, definition, token, node, spec).await,
        MultiInstanceMode::Parallel => run_multi_instance_parallel(executor, definition, token, node, spec).await,
    }
}

async fn run_multi_instance_sequential(
    executor: &Executor<'_>,
    definition: &ProcessDefinition,
    token: Token,
    node: &FlowNode,
    spec: &MultiInstanceSpec,
) -> EngineResult<StepOutcome> {
    let n = resolve_cardinality(executor.store, token.instance_id, &spec.cardinality_expr).await?;

    let prefix = format!("mi.{}", node.id);
    let vars = VariableStore::new(executor.store, executor.variable_max_bytes);
    vars.set(token.instance_id, &token.scope_path, &format!("{prefix}.nrOfInstances"), VarValue::Integer(n as i64)).await?;

    let mut completed = 0u32;
    for i in 1..=n {
        vars.set(token.instance_id, &token.scope_path, &format!("{prefix}.loopCounter"), VarValue::Integer(i as i64)).await?;
        vars.set(token.instance_id, &token.scope_path, &format!("{prefix}.nrOfActiveInstances"), VarValue::Integer((n - i + 1) as i64)).await?;
        vars.set(token.instance_id, &token.scope_path, &format!("{prefix}.nrOfCompletedInstances"), VarValue::Integer(completed as i64)).await?;

        run_mi_iteration(executor, token.instance_id, &token.scope_path, node).await?;
        completed += 1;

        if let Some(cond) = &spec.completion_condition {
            if evaluate_guard(executor.store, token.instance_id, cond).await.map_err(EngineError::from)? {
                AuditLog::new(executor.store)
                    .record(
                        token.instance_id,
                        Some(&node.id),
                        "MI_COMPLETION_CONDITION_MET",
                        AuditEvent::SYSTEM_ACTOR,
                        Some(serde_json::json!({"completedIterations": completed, "requested": n})),
                    )
                    .await
                    .map_err(EngineError::from)?;
                break;
            }
        }
    }
    vars.set(token.instance_id, &token.scope_path, &format!("{prefix}.nrOfCompletedInstances"), VarValue::Integer(completed as i64)).await?;
    vars.set(token.instance_id, &token.scope_path, &format!("{prefix}.nrOfActiveInstances"), VarValue::Integer(0)).await?;

    executor.take_single_outgoing(definition, token).await
}

/// Runs all `n` iterations as sibling futures racing a `completionCondition`
/// check against whatever's still outstanding, instead of one at a time.
/// Each iteration gets its own scope segment (`node.id#i`) so its output
/// variables land in an isolated slot rather than clobbering the shared MI
/// scope on every completion. Dropping the `FuturesUnordered` once the
/// condition is met (or a first error surfaces) cancels whatever hadn't
/// finished yet, mirroring the "remaining active instances are terminated"
/// rule for parallel multi-instance.
async fn run_multi_instance_parallel(
    executor: &Executor<'_>,
    definition: &ProcessDefinition,
    token: Token,
    node: &FlowNode,
    spec: &MultiInstanceSpec,
) -> EngineResult<StepOutcome> {
    let n = resolve_cardinality(executor.store, token.instance_id, &spec.cardinality_expr).await?;

    let prefix = format!("mi.{}", node.id);
    let vars = VariableStore::new(executor.store, executor.variable_max_bytes);
    vars.set(token.instance_id, &token.scope_path, &format!("{prefix}.nrOfInstances"), VarValue::Integer(n as i64)).await?;
    vars.set(token.instance_id, &token.scope_path, &format!("{prefix}.nrOfActiveInstances"), VarValue::Integer(n as i64)).await?;
    vars.set(token.instance_id, &token.scope_path, &format!("{prefix}.nrOfCompletedInstances"), VarValue::Integer(0)).await?;

    let instance_id = token.instance_id;
    let mut pending = FuturesUnordered::new();
    for i in 1..=n {
        let mut iter_scope = token.scope_path.clone();
        iter_scope.push(format!("{}#{i}", node.id));
        pending.push(async move {
            let result = run_mi_iteration(executor, instance_id, &iter_scope, node).await;
            (i, result)
        });
    }

    let mut completed = 0u32;
    let mut condition_met = false;
    let mut first_err = None;
    while let Some((i, result)) = pending.next().await {
        if let Err(e) = result {
            first_err = Some(e);
            break;
        }
        completed += 1;
        vars.set(token.instance_id, &token.scope_path, &format!("{prefix}.nrOfCompletedInstances"), VarValue::Integer(completed as i64)).await?;
        vars.set(token.instance_id, &token.scope_path, &format!("{prefix}.nrOfActiveInstances"), VarValue::Integer((n - completed) as i64)).await?;
        vars.set(token.instance_id, &token.scope_path, &format!("{prefix}.loopCounter"), VarValue::Integer(i as i64)).await?;

        if let Some(cond) = &spec.completion_condition {
            if evaluate_guard(executor.store, token.instance_id, cond).await.map_err(EngineError::from)? {
                condition_met = true;
                break;
            }
        }
    }
    let cancelled = pending.len();
    drop(pending);

    if let Some(e) = first_err {
        return Err(e);
    }
    if condition_met {
        AuditLog::new(executor.store)
            .record(
                token.instance_id,
                Some(&node.id),
                "MI_COMPLETION_CONDITION_MET",
                AuditEvent::SYSTEM_ACTOR,
                Some(serde_json::json!({"completedIterations": completed, "requested": n, "cancelled": cancelled})),
            )
            .await
            .map_err(EngineError::from)?;
    }

    vars.set(token.instance_id, &token.scope_path, &format!("{prefix}.nrOfActiveInstances"), VarValue::Integer(0)).await?;

    executor.take_single_outgoing(definition, token).await
}

async fn resolve_cardinality(store: &dyn GraphStore, instance_id: Uuid, expr: &str) -> EngineResult<u32> {
    let trimmed = expr.trim();
    if let Ok(literal) = trimmed.parse::<u32>() {
        return Ok(literal);
    }
    let ident = trimmed.trim_start_matches("${").trim_end_matches('}').trim();
    let vars = VariableStore::new(store, usize::MAX);
    match vars.get(instance_id, &[], ident).await.map_err(EngineError::from)? {
        Some(VarValue::Integer(n)) if n >= 0 => Ok(n as u32),
        Some(_) => Err(EngineError::BadDefinition { message: format!("loopCardinality '{expr}' is not a non-negative integer") }),
        None => Err(EngineError::BadDefinition { message: format!("loopCardinality variable '{ident}' is not set") }),
    }
}

async fn run_mi_iteration(
    executor: &Executor<'_>,
    instance_id: Uuid,
    scope_path: &[String],
    node: &FlowNode,
) -> EngineResult<()> {
    executor.run_listeners(&node.listeners, ListenerEvent::Start, instance_id, &node.id).await?;
    match &node.kind {
        NodeKind::ServiceTask { topic } | NodeKind::SendTask { topic } => {
            if let Some(topic) = topic {
                executor.invoke_topic_labeled(instance_id, scope_path, topic, event_type::COMPLETE, &node.id).await?;
            }
        }
        NodeKind::ManualTask => {
            AuditLog::new(executor.store)
                .record(instance_id, Some(&node.id), event_type::MANUAL_COMPLETE, AuditEvent::SYSTEM_ACTOR, None)
                .await
                .map_err(EngineError::from)?;
        }
        NodeKind::ScriptTask { script } if !executor.script_tasks_enabled => {
            AuditLog::new(executor.store)
                .record(instance_id, Some(&node.id), "SCRIPT_DISABLED", AuditEvent::SYSTEM_ACTOR, Some(serde_json::json!({"script": script})))
                .await
                .map_err(EngineError::from)?;
        }
        other => {
            return Err(EngineError::Unsupported {
                feature: format!("multi-instance on node kind {other:?} (requires synchronous-completing activity)"),
            });
        }
    }
    executor.run_listeners(&node.listeners, ListenerEvent::End, instance_id, &node.id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parse_bpmn;
    use crate::handlers::{Handler, HandlerRegistry};
    use crate::store::OxigraphStore;
    use crate::types::Variables;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn new_instance(store: &OxigraphStore, definition_id: &str) -> Uuid {
        let instance_id = Uuid::now_v7();
        let subject = vocab::iri("inst", instance_id);
        let fields = vec![
            (vocab::pred::RDF_TYPE, Term::from(NamedNode::new_unchecked(vocab::class::PROCESS_INSTANCE))),
            (vocab::pred::DEFINITION_REF, Literal::new_simple_literal(definition_id).into()),
            (vocab::pred::STATUS, Literal::new_simple_literal("Running").into()),
        ];
        store.put_subject(vocab::graph::INST, &subject, fields).await.unwrap();
        instance_id
    }

    #[tokio::test]
    async fn multi_instance_service_task_runs_n_times() {
        const XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="mi1">
    <startEvent id="start1" />
    <sequenceFlow id="f1" sourceRef="start1" targetRef="task1" />
    <serviceTask id="task1">
      <extensionElements><taskDefinition type="process" /></extensionElements>
      <multiInstanceLoopCharacteristics>
        <loopCardinality>3</loopCardinality>
      </multiInstanceLoopCharacteristics>
    </serviceTask>
    <sequenceFlow id="f2" sourceRef="task1" targetRef="end1" />
    <endEvent id="end1" />
  </process>
</definitions>"#;
        let store = OxigraphStore::open_memory().unwrap();
        let handlers = HandlerRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        handlers.register(
            "process",
            Handler::Function(Arc::new(move |vars: Variables| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Ok(vars) })
            })),
        );
        let executor = Executor::new(&store, &handlers, false);
        let defn = parse_bpmn(XML, "mi1", 1).unwrap();
        let instance_id = new_instance(&store, "mi1").await;
        executor.spawn_token(instance_id, "start1", vec![]).await.unwrap();

        executor.run_to_quiescence(&defn, instance_id).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    /// Seed scenario S6: parallel multi-instance, cardinality 5, completion
    /// condition short-circuits once at least 3 iterations have run. A
    /// completion condition must name its own node's counter (`mi.<id>.*`,
    /// §4.6's prefix) since a bare `nrOfCompletedInstances` would be
    /// ambiguous across multiple MI nodes sharing an instance scope.
    #[tokio::test]
    async fn multi_instance_completion_condition_short_circuits_remaining_iterations() {
        const XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="mi6">
    <startEvent id="start1" />
    <sequenceFlow id="f1" sourceRef="start1" targetRef="task1" />
    <serviceTask id="task1">
      <extensionElements><taskDefinition type="process" /></extensionElements>
      <multiInstanceLoopCharacteristics>
        <loopCardinality>5</loopCardinality>
        <completionCondition>${mi.task1.nrOfCompletedInstances >= 3}</completionCondition>
      </multiInstanceLoopCharacteristics>
    </serviceTask>
    <sequenceFlow id="f2" sourceRef="task1" targetRef="end1" />
    <endEvent id="end1" />
  </process>
</definitions>"#;
        let store = OxigraphStore::open_memory().unwrap();
        let handlers = HandlerRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        handlers.register(
            "process",
            Handler::Function(Arc::new(move |vars: Variables| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Ok(vars) })
            })),
        );
        let executor = Executor::new(&store, &handlers, false);
        let defn = parse_bpmn(XML, "mi6", 1).unwrap();
        let instance_id = new_instance(&store, "mi6").await;
        executor.spawn_token(instance_id, "start1", vec![]).await.unwrap();

        executor.run_to_quiescence(&defn, instance_id).await.unwrap();

        let calls_made = calls.load(Ordering::SeqCst);
        assert!(
            (3..=5).contains(&calls_made),
            "expected 3..=5 iterations to run before the completion condition fired, got {calls_made}"
        );

        let vars = VariableStore::new(&store, usize::MAX);
        let completed = vars
            .get(instance_id, &[], "mi.task1.nrOfCompletedInstances")
            .await
            .unwrap();
        assert_eq!(completed, Some(VarValue::Integer(calls_made as i64)));

        let active = vars
            .get(instance_id, &[], "mi.task1.nrOfActiveInstances")
            .await
            .unwrap();
        assert_eq!(active, Some(VarValue::Integer(0)));

        let history = AuditLog::new(&store).history(instance_id).await.unwrap();
        assert!(
            history.iter().any(|e| e.event_type == "MI_COMPLETION_CONDITION_MET"),
            "expected MI_COMPLETION_CONDITION_MET in audit history, got {history:?}"
        );
        assert_eq!(
            history.iter().filter(|e| e.event_type == event_type::END).count(),
            1,
            "expected exactly one END event, got {history:?}"
        );
    }

    /// Seed scenario S7: a call activity maps in/out variables through a
    /// narrow window — the child sees only `inVariables`, and only
    /// `outVariables` flow back, so a parent-only secret never reaches the
    /// child and a child-only variable never leaks back.
    #[tokio::test]
    async fn call_activity_maps_only_declared_in_and_out_variables() {
        const CHILD_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="approver">
    <startEvent id="cstart" />
    <sequenceFlow id="cf1" sourceRef="cstart" targetRef="approve" />
    <serviceTask id="approve">
      <extensionElements><taskDefinition type="approve" /></extensionElements>
    </serviceTask>
    <sequenceFlow id="cf2" sourceRef="approve" targetRef="cend" />
    <endEvent id="cend" />
  </process>
</definitions>"#;
        const PARENT_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="orderFlow">
    <startEvent id="pstart" />
    <sequenceFlow id="pf1" sourceRef="pstart" targetRef="callApprover" />
    <callActivity id="callApprover" calledElement="approver">
      <extensionElements>
        <in source="orderId" />
        <out target="approvalCode" />
      </extensionElements>
    </callActivity>
    <sequenceFlow id="pf2" sourceRef="callApprover" targetRef="pend" />
    <endEvent id="pend" />
  </process>
</definitions>"#;

        let store = OxigraphStore::open_memory().unwrap();
        let child_defn = parse_bpmn(CHILD_XML, "approver", 1).unwrap();
        crate::compiler::persist_definition(&store, &child_defn).await.unwrap();

        let handlers = HandlerRegistry::new();
        handlers.register(
            "approve",
            Handler::Function(Arc::new(|mut vars: Variables| {
                Box::pin(async move {
                    assert!(vars.get("secret").is_none(), "child must not see the parent's unmapped secret");
                    assert_eq!(vars.get("orderId"), Some(&VarValue::String("O-1".to_string())));
                    vars.insert("approvalCode".to_string(), VarValue::String("A".to_string()));
                    vars.insert("internalTemp".to_string(), VarValue::String("scratch".to_string()));
                    Ok(vars)
                })
            })),
        );

        let executor = Executor::new(&store, &handlers, false);
        let parent_defn = parse_bpmn(PARENT_XML, "orderFlow", 1).unwrap();
        let parent_id = new_instance(&store, "orderFlow").await;
        let vars = VariableStore::new(&store, usize::MAX);
        vars.set(parent_id, &[], "orderId", VarValue::String("O-1".to_string())).await.unwrap();
        vars.set(parent_id, &[], "secret", VarValue::String("s".to_string())).await.unwrap();

        executor.spawn_token(parent_id, "pstart", vec![]).await.unwrap();
        executor.run_to_quiescence(&parent_defn, parent_id).await.unwrap();

        assert_eq!(
            instance_status(&store, parent_id).await.unwrap(),
            Some(InstanceStatus::Completed)
        );
        assert_eq!(vars.get(parent_id, &[], "orderId").await.unwrap(), Some(VarValue::String("O-1".to_string())));
        assert_eq!(vars.get(parent_id, &[], "secret").await.unwrap(), Some(VarValue::String("s".to_string())));
        assert_eq!(vars.get(parent_id, &[], "approvalCode").await.unwrap(), Some(VarValue::String("A".to_string())));
        assert_eq!(
            vars.get(parent_id, &[], "internalTemp").await.unwrap(),
            None,
            "a child-only variable not in outVariables must not leak to the parent"
        );
    }
}
