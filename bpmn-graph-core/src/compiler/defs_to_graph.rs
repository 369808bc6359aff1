//! Projects a parsed `ProcessDefinition` into the `defs` named graph, and
//! back (design §4's deploy/listDefinitions/getDefinition/retireDefinition
//! operations, §6.1 Control API table).
//!
//! Nodes and flows get shallow introspection triples — one subject per node
//! or flow, reusing the predicates the vocabulary already assigns meaning to
//! (`KIND`, `TOPIC`, `SCRIPT`, `ATTACHED_TO`, `CALLED_ELEMENT`, …) — so
//! `queryGraph` against `defs` can answer questions like "which service
//! tasks call topic X" directly in SPARQL. Round-tripping the full
//! `ProcessDefinition` back out of the graph, though, goes through
//! `source_xml` and `parse_bpmn` rather than reconstructing `FlowNode`/
//! `NodeKind` from triples: the XML is the only representation that doesn't
//! need a predicate for every node-kind variant's fields to stay lossless.

use super::parser::parse_bpmn;
use crate::store::GraphStore;
use crate::types::{CatchDetail, DefinitionStatus, NodeKind, ProcessDefinition};
use crate::vocab;
use anyhow::{anyhow, Context, Result};
use oxigraph::model::{Literal, NamedNode, Term};

fn definition_subject(definition_id: &str, version: u32) -> String {
    vocab::iri("defn", format!("{definition_id}:{version}"))
}

fn node_subject(definition_id: &str, version: u32, node_id: &str) -> String {
    vocab::iri("defnnode", format!("{definition_id}:{version}:{node_id}"))
}

fn flow_subject(definition_id: &str, version: u32, flow_id: &str) -> String {
    vocab::iri("defnflow", format!("{definition_id}:{version}:{flow_id}"))
}

fn status_literal(status: DefinitionStatus) -> Term {
    let s = match status {
        DefinitionStatus::Active => "Active",
        DefinitionStatus::Retired => "Retired",
    };
    Literal::new_simple_literal(s).into()
}

fn integer_literal(n: i64) -> Term {
    Literal::new_typed_literal(
        n.to_string(),
        NamedNode::new_unchecked("http://www.w3.org/2001/XMLSchema#integer"),
    )
    .into()
}

/// Name used for `KIND`, matching the BPMN element name a reader would
/// expect rather than the Rust variant's field shape.
fn kind_name(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::StartEvent { .. } => "StartEvent",
        NodeKind::EventSubprocessStart { .. } => "EventSubprocessStart",
        NodeKind::EndEvent { .. } => "EndEvent",
        NodeKind::ServiceTask { .. } => "ServiceTask",
        NodeKind::SendTask { .. } => "SendTask",
        NodeKind::UserTask => "UserTask",
        NodeKind::ReceiveTask { .. } => "ReceiveTask",
        NodeKind::ScriptTask { .. } => "ScriptTask",
        NodeKind::ManualTask => "ManualTask",
        NodeKind::IntermediateThrowEvent { .. } => "IntermediateThrowEvent",
        NodeKind::IntermediateCatchEvent { .. } => "IntermediateCatchEvent",
        NodeKind::BoundaryEvent { .. } => "BoundaryEvent",
        NodeKind::ExclusiveGateway => "ExclusiveGateway",
        NodeKind::ParallelGateway => "ParallelGateway",
        NodeKind::InclusiveGateway => "InclusiveGateway",
        NodeKind::EventBasedGateway => "EventBasedGateway",
        NodeKind::EmbeddedSubprocess { .. } => "EmbeddedSubprocess",
        NodeKind::EventSubprocess { .. } => "EventSubprocess",
        NodeKind::CallActivity { .. } => "CallActivity",
    }
}

/// Persist a definition's identity, source XML, and a shallow node/flow
/// index into the `defs` graph. Overwrites any prior triples for the same
/// (id, version) pair.
pub async fn persist_definition(store: &dyn GraphStore, defn: &ProcessDefinition) -> Result<()> {
    let subject = definition_subject(&defn.id, defn.version);

    let fields = vec![
        (vocab::pred::RDF_TYPE, Term::from(NamedNode::new_unchecked(vocab::class::PROCESS_DEFINITION))),
        (vocab::pred::DEFINITION_ID, Literal::new_simple_literal(&defn.id).into()),
        (vocab::pred::VERSION, integer_literal(defn.version as i64)),
        (vocab::pred::NAME, Literal::new_simple_literal(&defn.name).into()),
        (vocab::pred::STATUS, status_literal(defn.status)),
        (vocab::pred::SOURCE_XML, Literal::new_simple_literal(&defn.source_xml).into()),
    ];
    store.put_subject(vocab::graph::DEFS, &subject, fields).await?;

    for node in &defn.nodes {
        let node_subject = node_subject(&defn.id, defn.version, &node.id);
        let mut fields = vec![
            (vocab::pred::RDF_TYPE, Term::from(NamedNode::new_unchecked(vocab::class::FLOW_NODE))),
            (vocab::pred::DEFINITION_OF, Term::from(NamedNode::new_unchecked(subject.clone()))),
            (vocab::pred::KIND, Literal::new_simple_literal(kind_name(&node.kind)).into()),
        ];
        if let Some(name) = &node.name {
            fields.push((vocab::pred::NAME, Literal::new_simple_literal(name).into()));
        }
        match &node.kind {
            NodeKind::ServiceTask { topic } | NodeKind::SendTask { topic } => {
                if let Some(topic) = topic {
                    fields.push((vocab::pred::TOPIC, Literal::new_simple_literal(topic).into()));
                }
            }
            NodeKind::ScriptTask { script } => {
                fields.push((vocab::pred::SCRIPT, Literal::new_simple_literal(script).into()));
            }
            NodeKind::ReceiveTask { message_name, .. } => {
                fields.push((vocab::pred::MESSAGE_NAME, Literal::new_simple_literal(message_name).into()));
            }
            NodeKind::IntermediateThrowEvent { message_name: Some(name) } => {
                fields.push((vocab::pred::MESSAGE_NAME, Literal::new_simple_literal(name).into()));
            }
            NodeKind::IntermediateCatchEvent { detail, .. } => {
                push_catch_detail(&mut fields, detail);
            }
            NodeKind::BoundaryEvent { attached_to, detail, cancel_activity, .. } => {
                fields.push((vocab::pred::ATTACHED_TO, Literal::new_simple_literal(attached_to).into()));
                fields.push((
                    vocab::pred::CANCEL_ACTIVITY,
                    Literal::new_typed_literal(
                        cancel_activity.to_string(),
                        NamedNode::new_unchecked("http://www.w3.org/2001/XMLSchema#boolean"),
                    )
                    .into(),
                ));
                push_catch_detail(&mut fields, detail);
            }
            NodeKind::EventSubprocess { interrupting, .. } => {
                fields.push((
                    vocab::pred::TRIGGERED_BY_EVENT,
                    Literal::new_typed_literal(
                        interrupting.to_string(),
                        NamedNode::new_unchecked("http://www.w3.org/2001/XMLSchema#boolean"),
                    )
                    .into(),
                ));
            }
            NodeKind::CallActivity { called_element, .. } => {
                fields.push((vocab::pred::CALLED_ELEMENT, Literal::new_simple_literal(called_element).into()));
            }
            _ => {}
        }
        store.put_subject(vocab::graph::DEFS, &node_subject, fields).await?;
    }

    for flow in &defn.flows {
        let flow_subject = flow_subject(&defn.id, defn.version, &flow.id);
        let mut fields = vec![
            (vocab::pred::RDF_TYPE, Term::from(NamedNode::new_unchecked(vocab::class::SEQUENCE_FLOW))),
            (vocab::pred::DEFINITION_OF, Term::from(NamedNode::new_unchecked(subject.clone()))),
            (vocab::pred::SOURCE, Literal::new_simple_literal(&flow.source).into()),
            (vocab::pred::TARGET, Literal::new_simple_literal(&flow.target).into()),
            (
                vocab::pred::IS_DEFAULT,
                Literal::new_typed_literal(
                    flow.is_default.to_string(),
                    NamedNode::new_unchecked("http://www.w3.org/2001/XMLSchema#boolean"),
                )
                .into(),
            ),
        ];
        if let Some(condition) = &flow.condition {
            fields.push((vocab::pred::CONDITION, Literal::new_simple_literal(condition).into()));
        }
        store.put_subject(vocab::graph::DEFS, &flow_subject, fields).await?;
    }

    Ok(())
}

fn push_catch_detail(fields: &mut Vec<(&'static str, Term)>, detail: &CatchDetail) {
    match detail {
        CatchDetail::Message { message_name, .. } => {
            fields.push((vocab::pred::MESSAGE_NAME, Literal::new_simple_literal(message_name).into()));
        }
        CatchDetail::Signal { signal_name } => {
            fields.push((vocab::pred::SIGNAL_NAME, Literal::new_simple_literal(signal_name).into()));
        }
        CatchDetail::Error { error_code: Some(code) } => {
            fields.push((vocab::pred::ERROR_CODE, Literal::new_simple_literal(code).into()));
        }
        _ => {}
    }
}

/// Re-parse a deployed definition's stored XML, restoring its runtime
/// status from the graph (the XML itself always parses to `Active`).
pub async fn load_definition(
    store: &dyn GraphStore,
    definition_id: &str,
    version: u32,
) -> Result<Option<ProcessDefinition>> {
    let subject = definition_subject(definition_id, version);
    let query = format!(
        "SELECT ?xml ?status WHERE {{ <{subject}> <{source_xml}> ?xml . <{subject}> <{status}> ?status }}",
        source_xml = vocab::pred::SOURCE_XML,
        status = vocab::pred::STATUS,
    );
    let results = store.query(vocab::graph::DEFS, &query).await?;
    let rows = results.as_solutions()?;
    let Some(row) = rows.first() else {
        return Ok(None);
    };
    let xml = strip_quotes(row.get("xml").ok_or_else(|| anyhow!("definition missing sourceXml"))?);
    let status = parse_status(strip_quotes(row.get("status").ok_or_else(|| anyhow!("definition missing status"))?))?;

    let mut defn = parse_bpmn(xml, definition_id, version).context("re-parsing stored definition XML")?;
    defn.status = status;
    Ok(Some(defn))
}

/// Highest version of `definition_id` currently `Active`, if any — how a
/// call activity's bare `calledElement` (no version) is resolved at the
/// moment a child instance is started (§6.1).
pub async fn resolve_active_version(store: &dyn GraphStore, definition_id: &str) -> Result<Option<u32>> {
    let query = format!(
        "SELECT ?version WHERE {{
            ?d <{rdf_type}> <{class}> .
            ?d <{id_pred}> \"{definition_id}\" . ?d <{version_pred}> ?version . ?d <{status_pred}> \"Active\"
         }} ORDER BY DESC(?version) LIMIT 1",
        rdf_type = vocab::pred::RDF_TYPE,
        class = vocab::class::PROCESS_DEFINITION,
        id_pred = vocab::pred::DEFINITION_ID,
        version_pred = vocab::pred::VERSION,
        status_pred = vocab::pred::STATUS,
    );
    let results = store.query(vocab::graph::DEFS, &query).await?;
    match results.as_solutions()?.first().and_then(|r| r.get("version")) {
        Some(v) => Ok(Some(
            strip_quotes(v).parse().map_err(|e| anyhow!("bad version literal: {e}"))?,
        )),
        None => Ok(None),
    }
}

/// List every deployed `(definitionId, version, status)` triple, most
/// recent version first within each definition id.
pub async fn list_definitions(store: &dyn GraphStore) -> Result<Vec<(String, u32, DefinitionStatus)>> {
    let query = format!(
        "SELECT ?id ?version ?status WHERE {{
            ?d <{rdf_type}> <{class}> .
            ?d <{id_pred}> ?id . ?d <{version_pred}> ?version . ?d <{status_pred}> ?status
         }}",
        rdf_type = vocab::pred::RDF_TYPE,
        class = vocab::class::PROCESS_DEFINITION,
        id_pred = vocab::pred::DEFINITION_ID,
        version_pred = vocab::pred::VERSION,
        status_pred = vocab::pred::STATUS,
    );
    let results = store.query(vocab::graph::DEFS, &query).await?;
    let mut out = Vec::new();
    for row in results.as_solutions()? {
        let id = strip_quotes(row.get("id").ok_or_else(|| anyhow!("missing ?id"))?).to_string();
        let version: u32 = strip_quotes(row.get("version").ok_or_else(|| anyhow!("missing ?version"))?)
            .parse()
            .map_err(|e| anyhow!("bad version literal: {e}"))?;
        let status = parse_status(strip_quotes(row.get("status").ok_or_else(|| anyhow!("missing ?status"))?))?;
        out.push((id, version, status));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
    Ok(out)
}

/// Flip a deployed definition's status to `Retired` (§6.1 `retireDefinition`
/// — existing running instances keep executing against the in-memory
/// `ProcessDefinition` the supervisor already holds; only new `startInstance`
/// calls see the retirement).
pub async fn retire_definition(store: &dyn GraphStore, definition_id: &str, version: u32) -> Result<()> {
    let subject = definition_subject(definition_id, version);
    store
        .replace_predicate(
            vocab::graph::DEFS,
            &subject,
            vocab::pred::STATUS,
            Some(status_literal(DefinitionStatus::Retired)),
        )
        .await
}

fn parse_status(s: &str) -> Result<DefinitionStatus> {
    match s {
        "Active" => Ok(DefinitionStatus::Active),
        "Retired" => Ok(DefinitionStatus::Retired),
        other => Err(anyhow!("unknown definition status literal: {other}")),
    }
}

fn strip_quotes(s: &str) -> &str {
    let s = s.split("^^").next().unwrap_or(s);
    s.trim_matches('"')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OxigraphStore;

    const XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="roundtrip">
    <startEvent id="start1" />
    <sequenceFlow id="f1" sourceRef="start1" targetRef="end1" />
    <endEvent id="end1" />
  </process>
</definitions>"#;

    #[tokio::test]
    async fn persist_and_reload_round_trips_xml() {
        let store = OxigraphStore::open_memory().unwrap();
        let defn = parse_bpmn(XML, "roundtrip", 1).unwrap();
        persist_definition(&store, &defn).await.unwrap();

        let loaded = load_definition(&store, "roundtrip", 1).await.unwrap().unwrap();
        assert_eq!(loaded.nodes.len(), defn.nodes.len());
        assert_eq!(loaded.flows.len(), defn.flows.len());
        assert_eq!(loaded.status, DefinitionStatus::Active);

        let listed = list_definitions(&store).await.unwrap();
        assert_eq!(listed, vec![("roundtrip".to_string(), 1, DefinitionStatus::Active)]);

        retire_definition(&store, "roundtrip", 1).await.unwrap();
        let reloaded = load_definition(&store, "roundtrip", 1).await.unwrap().unwrap();
        assert_eq!(reloaded.status, DefinitionStatus::Retired);
    }

    #[tokio::test]
    async fn load_definition_missing_returns_none() {
        let store = OxigraphStore::open_memory().unwrap();
        assert!(load_definition(&store, "nope", 1).await.unwrap().is_none());
    }
}
