//! Structural verification of a parsed `ProcessDefinition`, run once at
//! deploy time (design §4's deploy operation, grounded on
//! `bpmn-lite-core/src/compiler/verifier.rs`). Generalized from its
//! bytecode-IR checks (exactly one start, reachability via
//! `petgraph::visit::Dfs`, fork/join balance, XOR default-edge rule,
//! boundary-event attachment) to the full node-kind table, and extended with
//! checks for the entities it never had: inclusive gateways, multi-instance,
//! call activities, event subprocesses.

use super::ir::{self, ReachabilityGraph};
use crate::types::{CatchEventTrigger, NodeKind, ProcessDefinition};
use anyhow::{anyhow, Result};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct VerifyError {
    pub message: String,
    pub element_id: Option<String>,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.element_id {
            Some(id) => write!(f, "[{id}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

fn err(message: impl Into<String>, element_id: Option<&str>) -> VerifyError {
    VerifyError {
        message: message.into(),
        element_id: element_id.map(str::to_string),
    }
}

/// Verify structural invariants of a definition. Empty result means valid.
pub fn verify(defn: &ProcessDefinition) -> Vec<VerifyError> {
    let mut errors = Vec::new();

    check_start_and_end(defn, &mut errors);
    check_reachability(defn, &mut errors);
    check_parallel_gateways(defn, &mut errors);
    check_exclusive_gateways(defn, &mut errors);
    check_inclusive_gateways(defn, &mut errors);
    check_boundary_events(defn, &mut errors);
    check_call_activities(defn, &mut errors);
    check_multi_instance(defn, &mut errors);
    check_receive_and_message(defn, &mut errors);
    check_event_subprocesses(defn, &mut errors);
    check_service_tasks(defn, &mut errors);

    errors
}

pub fn verify_or_err(defn: &ProcessDefinition) -> Result<()> {
    let errors = verify(defn);
    if errors.is_empty() {
        Ok(())
    } else {
        let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        Err(anyhow!("Verification failed:\n{}", msgs.join("\n")))
    }
}

fn check_start_and_end(defn: &ProcessDefinition, errors: &mut Vec<VerifyError>) {
    let top_level_starts = defn
        .nodes
        .iter()
        .filter(|n| n.container.is_none() && matches!(n.kind, NodeKind::StartEvent { .. }))
        .count();
    match top_level_starts {
        0 => errors.push(err("No top-level StartEvent found", None)),
        1 => {}
        n => errors.push(err(format!("Multiple top-level StartEvents found ({n})"), None)),
    }

    let ends = defn
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::EndEvent { .. }))
        .count();
    if ends == 0 {
        errors.push(err("No EndEvent found", None));
    }

    for node in &defn.nodes {
        if let NodeKind::EmbeddedSubprocess { start_node, .. } | NodeKind::EventSubprocess { start_node, .. } =
            &node.kind
        {
            if start_node.is_empty() {
                errors.push(err("subprocess has no start event", Some(&node.id)));
            }
        }
    }
}

fn check_reachability(defn: &ProcessDefinition, errors: &mut Vec<VerifyError>) {
    let ReachabilityGraph { graph, index_of } = ir::build(defn);

    let top_level_start = defn
        .nodes
        .iter()
        .find(|n| n.container.is_none() && matches!(n.kind, NodeKind::StartEvent { .. }));
    let Some(top_level_start) = top_level_start else {
        return; // already reported by check_start_and_end
    };

    let mut reachable: HashSet<_> = HashSet::new();
    if let Some(&start_idx) = index_of.get(&top_level_start.id) {
        let mut dfs = Dfs::new(&graph, start_idx);
        while let Some(nx) = dfs.next(&graph) {
            reachable.insert(nx);
        }
    }

    // Boundary events, event-subprocess starts, and subprocess/call-activity
    // internals are alternative entry points not reached by ordinary flow
    // from the top-level start.
    for node in &defn.nodes {
        let is_alt_entry = matches!(
            node.kind,
            NodeKind::BoundaryEvent { .. } | NodeKind::EventSubprocessStart { .. }
        ) || node.container.is_some();
        if !is_alt_entry {
            continue;
        }
        if let Some(&idx) = index_of.get(&node.id) {
            if !reachable.contains(&idx) {
                reachable.insert(idx);
                let mut dfs = Dfs::new(&graph, idx);
                while let Some(nx) = dfs.next(&graph) {
                    reachable.insert(nx);
                }
            }
        }
    }

    for node in &defn.nodes {
        if let Some(&idx) = index_of.get(&node.id) {
            if !reachable.contains(&idx) {
                errors.push(err(format!("Unreachable node: {}", node.id), Some(&node.id)));
            }
        }
    }
}

fn check_parallel_gateways(defn: &ProcessDefinition, errors: &mut Vec<VerifyError>) {
    for node in &defn.nodes {
        if !matches!(node.kind, NodeKind::ParallelGateway) {
            continue;
        }
        let incoming = defn.incoming(&node.id).len();
        let outgoing = defn.outgoing(&node.id).len();
        if incoming > 1 && outgoing > 1 {
            errors.push(err(
                "Parallel gateway cannot fork and join at once; split into separate fork/join nodes",
                Some(&node.id),
            ));
        } else if incoming <= 1 && outgoing <= 1 {
            errors.push(err(
                "Parallel gateway has neither ≥2 incoming nor ≥2 outgoing flows",
                Some(&node.id),
            ));
        }
    }

    // Fork/join count balance: a coarse structural check, not a full
    // dead-path analysis (design §9's inclusive-gateway caveat applies
    // equally here — this is a count heuristic, not proof of pairing).
    let forks = defn
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::ParallelGateway) && defn.outgoing(&n.id).len() > 1)
        .count();
    let joins = defn
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::ParallelGateway) && defn.incoming(&n.id).len() > 1)
        .count();
    if forks != joins {
        errors.push(err(
            format!("Mismatched parallel gateways: {forks} forks, {joins} joins"),
            None,
        ));
    }
}

fn check_exclusive_gateways(defn: &ProcessDefinition, errors: &mut Vec<VerifyError>) {
    for node in &defn.nodes {
        if !matches!(node.kind, NodeKind::ExclusiveGateway) {
            continue;
        }
        let outgoing = defn.outgoing(&node.id);
        if outgoing.len() <= 1 {
            continue;
        }
        let without_condition = outgoing.iter().filter(|f| f.condition.is_none() && !f.is_default).count();
        let defaults = outgoing.iter().filter(|f| f.is_default).count();
        if defaults > 1 {
            errors.push(err(
                format!("Exclusive gateway has {defaults} default flows, expected at most 1"),
                Some(&node.id),
            ));
        } else if defaults == 0 && without_condition != 0 {
            errors.push(err(
                format!(
                    "Exclusive gateway has {without_condition} unconditional flow(s) with no default marker"
                ),
                Some(&node.id),
            ));
        }
    }
}

fn check_inclusive_gateways(defn: &ProcessDefinition, errors: &mut Vec<VerifyError>) {
    for node in &defn.nodes {
        if !matches!(node.kind, NodeKind::InclusiveGateway) {
            continue;
        }
        let incoming = defn.incoming(&node.id).len();
        let outgoing = defn.outgoing(&node.id).len();
        if outgoing > 1 && incoming > 1 {
            errors.push(err(
                "Inclusive gateway cannot fork and join at once; split into separate nodes",
                Some(&node.id),
            ));
        } else if outgoing > 1 {
            // diverging: fine, guards are evaluated per-flow at runtime.
        } else if incoming > 1 {
            // converging join: executor resolves completion via the
            // reachability approximation (design §9 Open Question b).
        } else {
            errors.push(err(
                "Inclusive gateway has neither ≥2 incoming nor ≥2 outgoing flows",
                Some(&node.id),
            ));
        }
    }
}

fn check_boundary_events(defn: &ProcessDefinition, errors: &mut Vec<VerifyError>) {
    let mut per_host: HashMap<String, Vec<String>> = HashMap::new();

    for node in &defn.nodes {
        let NodeKind::BoundaryEvent {
            attached_to,
            trigger,
            cancel_activity,
            ..
        } = &node.kind
        else {
            continue;
        };

        let host = defn.node(attached_to);
        let host_is_activity = host
            .map(|h| {
                matches!(
                    h.kind,
                    NodeKind::ServiceTask { .. }
                        | NodeKind::SendTask { .. }
                        | NodeKind::UserTask
                        | NodeKind::ReceiveTask { .. }
                        | NodeKind::ScriptTask { .. }
                        | NodeKind::ManualTask
                        | NodeKind::EmbeddedSubprocess { .. }
                        | NodeKind::CallActivity { .. }
                )
            })
            .unwrap_or(false);
        if !host_is_activity {
            errors.push(err(
                format!("boundary event attachedToRef '{attached_to}' does not reference an activity"),
                Some(&node.id),
            ));
        }

        if defn.outgoing(&node.id).is_empty() {
            errors.push(err("boundary event has no outgoing sequence flow", Some(&node.id)));
        }

        if matches!(trigger, CatchEventTrigger::Signal | CatchEventTrigger::Escalation) && !*cancel_activity {
            // non-interrupting signal/escalation boundaries are valid BPMN; no check needed.
        }

        per_host.entry(attached_to.clone()).or_default().push(node.id.clone());
    }

    for (host, boundary_ids) in &per_host {
        let interrupting_count = boundary_ids
            .iter()
            .filter_map(|id| defn.node(id))
            .filter(|n| matches!(&n.kind, NodeKind::BoundaryEvent { cancel_activity: true, .. }))
            .count();
        if interrupting_count > 1 {
            errors.push(err(
                format!(
                    "activity '{host}' has {interrupting_count} interrupting boundary events; at most 1 may cancel the activity concurrently per error/timer kind"
                ),
                Some(host),
            ));
        }
    }
}

fn check_call_activities(defn: &ProcessDefinition, errors: &mut Vec<VerifyError>) {
    for node in &defn.nodes {
        if let NodeKind::CallActivity { called_element, .. } = &node.kind {
            if called_element.is_empty() {
                errors.push(err("call activity has empty calledElement", Some(&node.id)));
            }
        }
    }
}

fn check_multi_instance(defn: &ProcessDefinition, errors: &mut Vec<VerifyError>) {
    for node in &defn.nodes {
        if let Some(mi) = &node.multi_instance {
            if mi.cardinality_expr.trim().is_empty() {
                errors.push(err(
                    "multi-instance loop characteristics missing loopCardinality",
                    Some(&node.id),
                ));
            }
        }
    }
}

fn check_receive_and_message(defn: &ProcessDefinition, errors: &mut Vec<VerifyError>) {
    for node in &defn.nodes {
        match &node.kind {
            NodeKind::ReceiveTask { message_name, .. } if message_name.is_empty() => {
                errors.push(err("receive task has no messageRef", Some(&node.id)));
            }
            NodeKind::IntermediateCatchEvent {
                trigger: CatchEventTrigger::Message,
                detail: crate::types::CatchDetail::Message { message_name, .. },
            } if message_name.is_empty() => {
                errors.push(err("message catch event has no messageRef", Some(&node.id)));
            }
            _ => {}
        }
    }
}

fn check_event_subprocesses(defn: &ProcessDefinition, errors: &mut Vec<VerifyError>) {
    for node in &defn.nodes {
        let NodeKind::EventSubprocess { start_node, .. } = &node.kind else {
            continue;
        };
        let Some(start) = defn.node(start_node) else {
            continue;
        };
        let NodeKind::EventSubprocessStart { trigger } = &start.kind else {
            errors.push(err(
                "event subprocess start node is not an EventSubprocessStart",
                Some(&node.id),
            ));
            continue;
        };
        // Design §9 Open Question (a): only message/timer event-subprocess
        // triggers are implemented; others fail closed as `Unsupported` at
        // runtime with an audit event, not rejected here at deploy time, so
        // a definition can be deployed ahead of handler support landing.
        let _ = trigger;
    }
}

fn check_service_tasks(defn: &ProcessDefinition, errors: &mut Vec<VerifyError>) {
    for node in &defn.nodes {
        match &node.kind {
            NodeKind::ServiceTask { topic: None } => {
                errors.push(err(
                    "service task has no zeebe:taskDefinition type and no inferred topic",
                    Some(&node.id),
                ));
            }
            NodeKind::ScriptTask { script } if script.trim().is_empty() => {
                errors.push(err("script task has empty script body", Some(&node.id)));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::parse_bpmn;

    #[test]
    fn rejects_definition_with_no_start_event() {
        let xml = r#"<?xml version="1.0"?>
        <bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <bpmn:process id="p">
            <bpmn:endEvent id="end1" />
          </bpmn:process>
        </bpmn:definitions>"#;
        let defn = parse_bpmn(xml, "p", 1).unwrap();
        let errors = verify(&defn);
        assert!(errors.iter().any(|e| e.message.contains("No top-level StartEvent")));
    }

    #[test]
    fn rejects_unmatched_parallel_gateways() {
        let xml = r#"<?xml version="1.0"?>
        <bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <bpmn:process id="p">
            <bpmn:startEvent id="start1" />
            <bpmn:parallelGateway id="fork1" />
            <bpmn:endEvent id="end1" />
            <bpmn:sequenceFlow id="f1" sourceRef="start1" targetRef="fork1" />
            <bpmn:sequenceFlow id="f2" sourceRef="fork1" targetRef="end1" />
          </bpmn:process>
        </bpmn:definitions>"#;
        let defn = parse_bpmn(xml, "p", 1).unwrap();
        let errors = verify(&defn);
        assert!(errors
            .iter()
            .any(|e| e.message.contains("neither ≥2 incoming nor ≥2 outgoing")));
    }

    #[test]
    fn accepts_well_formed_linear_process() {
        let xml = r#"<?xml version="1.0"?>
        <bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <bpmn:process id="p">
            <bpmn:startEvent id="start1" />
            <bpmn:serviceTask id="task1">
              <bpmn:extensionElements>
                <taskDefinition type="notify" />
              </bpmn:extensionElements>
            </bpmn:serviceTask>
            <bpmn:endEvent id="end1" />
            <bpmn:sequenceFlow id="f1" sourceRef="start1" targetRef="task1" />
            <bpmn:sequenceFlow id="f2" sourceRef="task1" targetRef="end1" />
          </bpmn:process>
        </bpmn:definitions>"#;
        let defn = parse_bpmn(xml, "p", 1).unwrap();
        assert!(verify(&defn).is_empty());
    }

    #[test]
    fn rejects_boundary_event_on_nonexistent_host() {
        let xml = r#"<?xml version="1.0"?>
        <bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <bpmn:process id="p">
            <bpmn:startEvent id="start1" />
            <bpmn:serviceTask id="task1">
              <bpmn:extensionElements>
                <taskDefinition type="notify" />
              </bpmn:extensionElements>
            </bpmn:serviceTask>
            <bpmn:boundaryEvent id="b1" attachedToRef="missing" cancelActivity="true">
              <bpmn:timerEventDefinition>
                <bpmn:timeDuration>PT5S</bpmn:timeDuration>
              </bpmn:timerEventDefinition>
            </bpmn:boundaryEvent>
            <bpmn:endEvent id="end1" />
            <bpmn:endEvent id="end2" />
            <bpmn:sequenceFlow id="f1" sourceRef="start1" targetRef="task1" />
            <bpmn:sequenceFlow id="f2" sourceRef="task1" targetRef="end1" />
            <bpmn:sequenceFlow id="f3" sourceRef="b1" targetRef="end2" />
          </bpmn:process>
        </bpmn:definitions>"#;
        let defn = parse_bpmn(xml, "p", 1).unwrap();
        let errors = verify(&defn);
        assert!(errors.iter().any(|e| e.message.contains("does not reference an activity")));
    }
}
