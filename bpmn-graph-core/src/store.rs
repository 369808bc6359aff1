//! Graph Store (design §4.1, "C1").
//!
//! A single embedded RDF quadstore (`oxigraph`) holding all five named
//! graphs. The `GraphStore` trait mirrors `bpmn-lite-core/src/store.rs`'s
//! `ProcessStore` trait shape (`async_trait`, `anyhow::Result`, one method
//! per concern) but the concerns here are the generic ones the design
//! names — raw query/update/snapshot/restore — rather than
//! bytecode-VM-specific rows; typed helpers built on top live in
//! `variables.rs`, `audit.rs`, etc.

use crate::types::{Datatype, VarValue};
use crate::vocab;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use oxigraph::io::RdfFormat;
use oxigraph::model::{GraphNameRef, Literal, NamedNode, NamedOrBlankNode, Quad, Term};
use oxigraph::sparql::QueryResults;
use oxigraph::store::Store;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// One solution row from a SPARQL SELECT, variable name -> term (in Turtle
/// textual form, e.g. `"42"^^<...integer>` or `<urn:...>`).
pub type Solution = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub enum QueryResultSet {
    Solutions(Vec<Solution>),
    Boolean(bool),
    Quads(Vec<(String, String, String)>),
}

impl QueryResultSet {
    pub fn as_solutions(&self) -> Result<&[Solution]> {
        match self {
            QueryResultSet::Solutions(s) => Ok(s),
            _ => Err(anyhow!("expected SELECT solutions")),
        }
    }

    pub fn as_boolean(&self) -> Result<bool> {
        match self {
            QueryResultSet::Boolean(b) => Ok(*b),
            _ => Err(anyhow!("expected ASK boolean")),
        }
    }
}

/// A single (predicate, object) pair to attach to a subject IRI.
pub type QuadField = (&'static str, Term);

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Read-only SPARQL SELECT/ASK/CONSTRUCT against one named graph.
    async fn query(&self, named_graph: &str, sparql: &str) -> Result<QueryResultSet>;

    /// SPARQL ASK convenience wrapper (used heavily by the condition
    /// evaluator and timer lease CAS).
    async fn ask(&self, named_graph: &str, sparql_ask_body: &str) -> Result<bool> {
        let query = format!("ASK {sparql_ask_body}");
        self.query(named_graph, &query).await?.as_boolean()
    }

    /// Execute a SPARQL Update (INSERT DATA / DELETE DATA / DELETE..INSERT..WHERE)
    /// under the named graph's write lock.
    async fn update(&self, named_graph: &str, sparql_update: &str) -> Result<()>;

    /// Replace every triple with the given subject IRI in one named graph
    /// with a fresh set of (predicate, object) fields — the "remove-then-insert"
    /// pattern invariant 3 in §3.2 requires for variable/flag writes.
    async fn put_subject(
        &self,
        named_graph: &str,
        subject_iri: &str,
        fields: Vec<QuadField>,
    ) -> Result<()>;

    /// Remove every triple with the given subject IRI from a named graph.
    async fn delete_subject(&self, named_graph: &str, subject_iri: &str) -> Result<()>;

    /// Atomically replace the object(s) of a single (subject, predicate) pair
    /// — the narrow form of invariant 3's "remove-then-insert" used when a
    /// subject carries many independent predicates (e.g. an instance node's
    /// flat variable projection) and only one should change.
    async fn replace_predicate(
        &self,
        named_graph: &str,
        subject_iri: &str,
        predicate: &str,
        object: Option<Term>,
    ) -> Result<()>;

    /// Append one quad without clearing existing triples for the subject
    /// (used for append-only structures like the audit log).
    async fn append_quads(&self, named_graph: &str, quads: Vec<(String, QuadField)>) -> Result<()>;

    /// Serialize one named graph as canonical N-Triples.
    async fn snapshot(&self, named_graph: &str) -> Result<Vec<u8>>;

    /// Replace a named graph's contents from a canonical N-Triples snapshot.
    async fn restore(&self, named_graph: &str, data: &[u8]) -> Result<()>;

    /// Re-load invariants after a process restart (§6.2: reset stale LEASED
    /// timer jobs to DUE_PENDING).
    async fn reload(&self) -> Result<()>;
}

/// oxigraph-backed implementation. Two construction modes mirror
/// `bpmn-lite-core`'s pluggable `MemoryStore`/`PostgresProcessStore` split
/// behind one trait.
pub struct OxigraphStore {
    inner: Store,
    locks: HashMap<&'static str, RwLock<()>>,
}

impl OxigraphStore {
    /// Volatile in-memory store (`MemoryStore`'s equivalent).
    pub fn open_memory() -> Result<Self> {
        Ok(Self::wrap(Store::new().context("open in-memory store")?))
    }

    /// Disk-backed store (`--database-url`'s equivalent, generalized to a
    /// directory since the backend is embedded rather than networked).
    pub fn open_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::wrap(
            Store::open(path).context("open disk-backed store")?,
        ))
    }

    fn wrap(inner: Store) -> Self {
        let locks = vocab::graph::ALL
            .iter()
            .map(|&g| (g, RwLock::new(())))
            .collect();
        Self { inner, locks }
    }

    fn lock_for(&self, named_graph: &str) -> &RwLock<()> {
        self.locks
            .get(named_graph)
            .unwrap_or_else(|| panic!("unknown named graph: {named_graph}"))
    }

    fn graph_node(named_graph: &str) -> Result<NamedNode> {
        Ok(NamedNode::new(named_graph)?)
    }
}

#[async_trait]
impl GraphStore for OxigraphStore {
    async fn query(&self, named_graph: &str, sparql: &str) -> Result<QueryResultSet> {
        let _guard = self.lock_for(named_graph).read().await;
        let graph = Self::graph_node(named_graph)?;
        // Scope the query to the single named graph via a FROM clause unless
        // the caller's SPARQL already names graphs explicitly.
        let scoped = scope_query(sparql, &graph);
        let results = self
            .inner
            .query(&scoped)
            .map_err(|e| anyhow!("sparql query failed: {e}"))?;
        Ok(convert_results(results)?)
    }

    async fn update(&self, named_graph: &str, sparql_update: &str) -> Result<()> {
        let _guard = self.lock_for(named_graph).write().await;
        let graph = Self::graph_node(named_graph)?;
        let scoped = scope_update(sparql_update, &graph);
        self.inner
            .update(&scoped)
            .map_err(|e| anyhow!("sparql update failed: {e}"))?;
        Ok(())
    }

    async fn put_subject(
        &self,
        named_graph: &str,
        subject_iri: &str,
        fields: Vec<QuadField>,
    ) -> Result<()> {
        let _guard = self.lock_for(named_graph).write().await;
        let graph = Self::graph_node(named_graph)?;
        let subject: NamedOrBlankNode = NamedNode::new(subject_iri)?.into();
        remove_subject_locked(&self.inner, &graph, &subject)?;
        for (pred, obj) in fields {
            let quad = Quad::new(
                subject.clone(),
                NamedNode::new(pred)?,
                obj,
                GraphNameRef::from(&graph).into_owned(),
            );
            self.inner
                .insert(&quad)
                .map_err(|e| anyhow!("insert failed: {e}"))?;
        }
        Ok(())
    }

    async fn delete_subject(&self, named_graph: &str, subject_iri: &str) -> Result<()> {
        let _guard = self.lock_for(named_graph).write().await;
        let graph = Self::graph_node(named_graph)?;
        let subject: NamedOrBlankNode = NamedNode::new(subject_iri)?.into();
        remove_subject_locked(&self.inner, &graph, &subject)?;
        Ok(())
    }

    async fn replace_predicate(
        &self,
        named_graph: &str,
        subject_iri: &str,
        predicate: &str,
        object: Option<Term>,
    ) -> Result<()> {
        let _guard = self.lock_for(named_graph).write().await;
        let graph = Self::graph_node(named_graph)?;
        let subject = NamedNode::new(subject_iri)?;
        let pred = NamedNode::new(predicate)?;
        let existing: Vec<Quad> = self
            .inner
            .quads_for_pattern(
                Some(subject.as_ref().into()),
                Some(pred.as_ref().into()),
                None,
                Some(GraphNameRef::from(&graph)),
            )
            .collect::<Result<_, _>>()
            .map_err(|e| anyhow!("pattern scan failed: {e}"))?;
        for q in existing {
            self.inner
                .remove(&q)
                .map_err(|e| anyhow!("remove failed: {e}"))?;
        }
        if let Some(obj) = object {
            let quad = Quad::new(
                subject,
                pred,
                obj,
                GraphNameRef::from(&graph).into_owned(),
            );
            self.inner
                .insert(&quad)
                .map_err(|e| anyhow!("insert failed: {e}"))?;
        }
        Ok(())
    }

    async fn append_quads(&self, named_graph: &str, quads: Vec<(String, QuadField)>) -> Result<()> {
        let _guard = self.lock_for(named_graph).write().await;
        let graph = Self::graph_node(named_graph)?;
        for (subject_iri, (pred, obj)) in quads {
            let quad = Quad::new(
                NamedNode::new(subject_iri)?,
                NamedNode::new(pred)?,
                obj,
                GraphNameRef::from(&graph).into_owned(),
            );
            self.inner
                .insert(&quad)
                .map_err(|e| anyhow!("insert failed: {e}"))?;
        }
        Ok(())
    }

    async fn snapshot(&self, named_graph: &str) -> Result<Vec<u8>> {
        let _guard = self.lock_for(named_graph).read().await;
        let graph = Self::graph_node(named_graph)?;
        let mut buf = Vec::new();
        self.inner
            .dump_graph_to_writer(GraphNameRef::from(&graph), RdfFormat::NTriples, &mut buf)
            .map_err(|e| anyhow!("dump failed: {e}"))?;
        Ok(buf)
    }

    async fn restore(&self, named_graph: &str, data: &[u8]) -> Result<()> {
        let _guard = self.lock_for(named_graph).write().await;
        let graph = Self::graph_node(named_graph)?;
        // Restore replaces the graph wholesale: clear then reload.
        self.inner
            .clear_graph(GraphNameRef::from(&graph))
            .map_err(|e| anyhow!("clear failed: {e}"))?;
        self.inner
            .load_from_reader(
                RdfFormat::NTriples.with_default_graph(GraphNameRef::from(&graph).into_owned()),
                data,
            )
            .map_err(|e| anyhow!("load failed: {e}"))?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        // Reset any LEASED timer jobs to DUE_PENDING (§6.2 restart recovery).
        let reset = format!(
            "DELETE {{ ?t <{lease_holder}> ?h . ?t <{lease_expires}> ?e . ?t <{status}> \"Leased\" }}
             INSERT {{ ?t <{status}> \"DuePending\" }}
             WHERE {{ ?t <{status}> \"Leased\" . OPTIONAL {{ ?t <{lease_holder}> ?h }} OPTIONAL {{ ?t <{lease_expires}> ?e }} }}",
            lease_holder = vocab::pred::LEASE_HOLDER,
            lease_expires = vocab::pred::LEASE_EXPIRES_AT,
            status = vocab::pred::TIMER_STATUS,
        );
        self.update(vocab::graph::TIMERS, &reset).await
    }
}

fn remove_subject_locked(store: &Store, graph: &NamedNode, subject: &NamedOrBlankNode) -> Result<()> {
    let quads: Vec<Quad> = store
        .quads_for_pattern(Some(subject.as_ref().into()), None, None, Some(GraphNameRef::from(graph)))
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow!("pattern scan failed: {e}"))?;
    for q in quads {
        store.remove(&q).map_err(|e| anyhow!("remove failed: {e}"))?;
    }
    Ok(())
}

/// Rewrite a bare `SELECT ... WHERE { ... }` / `ASK { ... }` / `CONSTRUCT`
/// query to scope its default graph to `graph`, unless the caller already
/// wrote an explicit `GRAPH`/`FROM` clause (full SPARQL ASK passthrough per
/// §4.2 rule 1 is allowed to name its own graph).
fn scope_query(sparql: &str, graph: &NamedNode) -> String {
    if sparql.contains("GRAPH") || sparql.contains("FROM") {
        return sparql.to_string();
    }
    inject_from(sparql, graph)
}

fn scope_update(sparql: &str, graph: &NamedNode) -> String {
    if sparql.contains("GRAPH") {
        return sparql.to_string();
    }
    // Wrap bare INSERT DATA/DELETE DATA bodies with a GRAPH block.
    wrap_update_graph(sparql, graph)
}

fn inject_from(sparql: &str, graph: &NamedNode) -> String {
    let trimmed = sparql.trim_start();
    let upper = trimmed.to_uppercase();
    let keyword_end = ["SELECT", "ASK", "CONSTRUCT", "DESCRIBE"]
        .iter()
        .find_map(|kw| {
            if upper.starts_with(kw) {
                Some(kw.len())
            } else {
                None
            }
        });
    match keyword_end {
        Some(_) => {
            if let Some(where_idx) = trimmed.find('{') {
                let (head, body) = trimmed.split_at(where_idx);
                format!("{head} FROM <{}> {body}", graph.as_str())
            } else {
                trimmed.to_string()
            }
        }
        None => trimmed.to_string(),
    }
}

fn wrap_update_graph(sparql: &str, graph: &NamedNode) -> String {
    let trimmed = sparql.trim();
    if let Some(body_start) = trimmed.find('{') {
        let (head, rest) = trimmed.split_at(body_start);
        format!("{head} GRAPH <{}> {rest}", graph.as_str())
    } else {
        trimmed.to_string()
    }
}

fn convert_results(results: QueryResults) -> Result<QueryResultSet> {
    match results {
        QueryResults::Boolean(b) => Ok(QueryResultSet::Boolean(b)),
        QueryResults::Solutions(solutions) => {
            let mut rows = Vec::new();
            for sol in solutions {
                let sol = sol.map_err(|e| anyhow!("solution error: {e}"))?;
                let mut row = BTreeMap::new();
                for (var, term) in sol.iter() {
                    row.insert(var.as_str().to_string(), term.to_string());
                }
                rows.push(row);
            }
            Ok(QueryResultSet::Solutions(rows))
        }
        QueryResults::Graph(triples) => {
            let mut out = Vec::new();
            for t in triples {
                let t = t.map_err(|e| anyhow!("triple error: {e}"))?;
                out.push((t.subject.to_string(), t.predicate.to_string(), t.object.to_string()));
            }
            Ok(QueryResultSet::Quads(out))
        }
    }
}

// ─── Value <-> RDF term conversions ─────────────────────────────

pub fn value_to_term(v: &VarValue) -> Term {
    match v {
        VarValue::String(s) => Literal::new_simple_literal(s).into(),
        VarValue::Integer(n) => Literal::new_typed_literal(
            n.to_string(),
            NamedNode::new_unchecked("http://www.w3.org/2001/XMLSchema#integer"),
        )
        .into(),
        VarValue::Decimal(d) => Literal::new_typed_literal(
            format!("{d}"),
            NamedNode::new_unchecked("http://www.w3.org/2001/XMLSchema#decimal"),
        )
        .into(),
        VarValue::Boolean(b) => Literal::new_typed_literal(
            b.to_string(),
            NamedNode::new_unchecked("http://www.w3.org/2001/XMLSchema#boolean"),
        )
        .into(),
        VarValue::DateTime(ts) => Literal::new_typed_literal(
            crate::types::to_iso8601(*ts),
            NamedNode::new_unchecked("http://www.w3.org/2001/XMLSchema#dateTime"),
        )
        .into(),
    }
}

pub fn datatype_to_term(d: Datatype) -> Term {
    let s = match d {
        Datatype::String => "String",
        Datatype::Integer => "Integer",
        Datatype::Decimal => "Decimal",
        Datatype::Boolean => "Boolean",
        Datatype::DateTime => "DateTime",
    };
    Literal::new_simple_literal(s).into()
}

/// Parse a solution's bound term (the textual form produced by
/// `convert_results`) back into a `VarValue` given its companion datatype
/// string, as written by `datatype_to_term`.
pub fn parse_bound_value(literal: &str, datatype: &str) -> Result<VarValue> {
    let body = strip_literal_quotes(literal);
    match datatype {
        "Integer" => Ok(VarValue::Integer(body.parse()?)),
        "Decimal" => Ok(VarValue::Decimal(body.parse()?)),
        "Boolean" => Ok(VarValue::Boolean(body.parse()?)),
        "DateTime" => Ok(VarValue::DateTime(
            chrono::DateTime::parse_from_rfc3339(&body)?.timestamp_millis(),
        )),
        _ => Ok(VarValue::String(body)),
    }
}

fn strip_literal_quotes(s: &str) -> String {
    // oxigraph's Display for Literal renders `"value"` or `"value"^^<type>`.
    let s = s.trim();
    if let Some(rest) = s.strip_prefix('"') {
        if let Some(end) = rest.find('"') {
            return rest[..end].to_string();
        }
    }
    s.to_string()
}
