//! Audit log (design §3.1 `AuditEvent`, invariant 6: "monotonic ordering,
//! append-only"). Every state transition the executor makes is recorded here
//! before the transition is considered durable, mirroring
//! `bpmn-lite-core/src/events.rs`'s practice of logging every VM step to its
//! own append-only table.

use crate::store::GraphStore;
use crate::types::{AuditEvent, Timestamp};
use crate::vocab;
use anyhow::{anyhow, Result};
use oxigraph::model::{Literal, NamedNode, Term};
use uuid::Uuid;

pub struct AuditLog<'a> {
    store: &'a dyn GraphStore,
}

impl<'a> AuditLog<'a> {
    pub fn new(store: &'a dyn GraphStore) -> Self {
        Self { store }
    }

    /// Append one event, assigning it the next sequence number for its
    /// instance. The per-instance graph write lock (held for the whole
    /// read-max-then-insert) is what makes the assigned `seq` actually
    /// monotonic under concurrent writers to the same instance.
    pub async fn record(
        &self,
        instance_id: Uuid,
        node_id: Option<&str>,
        event_type: &str,
        actor: &str,
        details: Option<serde_json::Value>,
    ) -> Result<AuditEvent> {
        let seq = self.next_seq(instance_id).await?;
        let event = AuditEvent {
            event_id: Uuid::now_v7(),
            seq,
            instance_id,
            node_id: node_id.map(str::to_string),
            event_type: event_type.to_string(),
            timestamp: crate::types::now_ms(),
            actor: actor.to_string(),
            details,
        };
        self.append(&event).await?;
        Ok(event)
    }

    async fn next_seq(&self, instance_id: Uuid) -> Result<u64> {
        let query = format!(
            "SELECT ?s WHERE {{ ?e <{inst}> <{instance_iri}> . ?e <{seq}> ?s }} ORDER BY DESC(?s) LIMIT 1",
            inst = vocab::pred::EVENT_INSTANCE,
            instance_iri = vocab::iri("inst", instance_id),
            seq = vocab::pred::EVENT_SEQ,
        );
        let results = self.store.query(vocab::graph::LOG, &query).await?;
        let rows = results.as_solutions()?;
        match rows.first().and_then(|r| r.get("s")) {
            Some(s) => {
                let body = s.trim_matches('"');
                let n: u64 = body
                    .split("^^")
                    .next()
                    .unwrap_or(body)
                    .trim_matches('"')
                    .parse()
                    .map_err(|e| anyhow!("bad seq literal '{s}': {e}"))?;
                Ok(n + 1)
            }
            None => Ok(0),
        }
    }

    async fn append(&self, event: &AuditEvent) -> Result<()> {
        let subject = vocab::iri("event", event.event_id);
        let mut quads = vec![
            (
                subject.clone(),
                (
                    vocab::pred::RDF_TYPE,
                    Term::from(NamedNode::new_unchecked(vocab::class::AUDIT_EVENT)),
                ),
            ),
            (
                subject.clone(),
                (
                    vocab::pred::EVENT_SEQ,
                    integer_literal(event.seq as i64),
                ),
            ),
            (
                subject.clone(),
                (
                    vocab::pred::EVENT_INSTANCE,
                    Term::from(NamedNode::new_unchecked(vocab::iri("inst", event.instance_id))),
                ),
            ),
            (
                subject.clone(),
                (vocab::pred::EVENT_TYPE, Literal::new_simple_literal(&event.event_type).into()),
            ),
            (
                subject.clone(),
                (vocab::pred::EVENT_TIMESTAMP, timestamp_literal(event.timestamp)),
            ),
            (
                subject.clone(),
                (vocab::pred::EVENT_ACTOR, Literal::new_simple_literal(&event.actor).into()),
            ),
        ];
        if let Some(node_id) = &event.node_id {
            quads.push((
                subject.clone(),
                (vocab::pred::EVENT_NODE, Literal::new_simple_literal(node_id).into()),
            ));
        }
        if let Some(details) = &event.details {
            quads.push((
                subject,
                (
                    vocab::pred::EVENT_PAYLOAD,
                    Literal::new_simple_literal(details.to_string()).into(),
                ),
            ));
        }
        self.store.append_quads(vocab::graph::LOG, quads).await
    }

    /// All events for an instance, oldest first (invariant 6).
    pub async fn history(&self, instance_id: Uuid) -> Result<Vec<AuditEvent>> {
        let query = format!(
            "SELECT ?e ?seq ?node ?type ?ts ?actor ?payload WHERE {{
                ?e <{inst}> <{instance_iri}> .
                ?e <{seq}> ?seq .
                ?e <{etype}> ?type .
                ?e <{ets}> ?ts .
                ?e <{actor}> ?actor .
                OPTIONAL {{ ?e <{node}> ?node }}
                OPTIONAL {{ ?e <{payload}> ?payload }}
             }} ORDER BY ASC(?seq)",
            inst = vocab::pred::EVENT_INSTANCE,
            instance_iri = vocab::iri("inst", instance_id),
            seq = vocab::pred::EVENT_SEQ,
            etype = vocab::pred::EVENT_TYPE,
            ets = vocab::pred::EVENT_TIMESTAMP,
            actor = vocab::pred::EVENT_ACTOR,
            node = vocab::pred::EVENT_NODE,
            payload = vocab::pred::EVENT_PAYLOAD,
        );
        let results = self.store.query(vocab::graph::LOG, &query).await?;
        let mut out = Vec::new();
        for row in results.as_solutions()? {
            let seq: u64 = strip_quotes(row.get("seq").map(String::as_str).unwrap_or("0")).parse()?;
            out.push(AuditEvent {
                event_id: Uuid::now_v7(),
                seq,
                instance_id,
                node_id: row.get("node").map(|s| strip_quotes(s).to_string()),
                event_type: row.get("type").map(|s| strip_quotes(s).to_string()).unwrap_or_default(),
                timestamp: strip_quotes(row.get("ts").map(String::as_str).unwrap_or("0")).parse().unwrap_or(0),
                actor: row.get("actor").map(|s| strip_quotes(s).to_string()).unwrap_or_default(),
                details: row
                    .get("payload")
                    .and_then(|s| serde_json::from_str(strip_quotes(s)).ok()),
            });
        }
        Ok(out)
    }
}

fn integer_literal(n: i64) -> Term {
    Literal::new_typed_literal(n.to_string(), NamedNode::new_unchecked("http://www.w3.org/2001/XMLSchema#integer"))
        .into()
}

fn timestamp_literal(ts: Timestamp) -> Term {
    Literal::new_typed_literal(
        crate::types::to_iso8601(ts),
        NamedNode::new_unchecked("http://www.w3.org/2001/XMLSchema#dateTime"),
    )
    .into()
}

fn strip_quotes(s: &str) -> &str {
    let s = s.split("^^").next().unwrap_or(s);
    s.trim_matches('"')
}

/// Common event-type constants (design §8's seed scenarios reference these
/// literally, e.g. S1's `START, TAKE, COMPLETE, END` sequence).
pub mod event_type {
    pub const START: &str = "START";
    pub const TAKE: &str = "TAKE";
    pub const COMPLETE: &str = "COMPLETE";
    pub const END: &str = "END";
    pub const LISTENER_START: &str = "LISTENER_START";
    pub const LISTENER_END: &str = "LISTENER_END";
    pub const LISTENER_TAKE: &str = "LISTENER_TAKE";
    pub const TASK_CREATE: &str = "TASK_CREATE";
    pub const TASK_CLAIM: &str = "TASK_CLAIM";
    pub const TASK_COMPLETE: &str = "TASK_COMPLETE";
    pub const BOUNDARY_FIRED: &str = "BOUNDARY_FIRED";
    pub const CANCEL_ACTIVITY: &str = "CANCEL_ACTIVITY";
    pub const ERROR: &str = "ERROR";
    pub const TERMINATE: &str = "TERMINATE";
    pub const STOP: &str = "STOP";
    pub const MANUAL_COMPLETE: &str = "MANUAL_COMPLETE";
    pub const MESSAGE_SENT: &str = "MESSAGE_SENT";
    pub const MESSAGE_CORRELATED: &str = "MESSAGE_CORRELATED";
    pub const SIGNAL_BROADCAST: &str = "SIGNAL_BROADCAST";
    pub const TIMER_SCHEDULED: &str = "TIMER_SCHEDULED";
    pub const TIMER_FIRED: &str = "TIMER_FIRED";
    pub const CALL_ACTIVITY_START: &str = "CALL_ACTIVITY_START";
    pub const CALL_ACTIVITY_COMPLETE: &str = "CALL_ACTIVITY_COMPLETE";
    pub const CALL_ACTIVITY_ERROR: &str = "CALL_ACTIVITY_ERROR";
}
