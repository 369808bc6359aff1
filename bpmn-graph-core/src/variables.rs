//! Variable Store (design §4.3, "C3").
//!
//! Variables are scoped: an instance scope (the empty path) and nested
//! subprocess/MI scopes (non-empty `scope_path`s, matching `Token::scope_path`
//! in `types.rs`). `get` walks innermost-to-outermost; `set` replaces the
//! value atomically (invariant 3 in §3.2's "remove-then-insert").
//!
//! Each write also dual-writes a flat per-instance projection
//! (`urn:bpmn-graph:var:<name>` on the instance IRI) reflecting the
//! currently-visible value for `name` at instance scope — this is exactly
//! the triple shape `condition.rs`'s guard translation expects
//! (`<instance> var:<IDENT> ?v`), keeping the condition evaluator simple
//! without re-deriving the scope walk inside SPARQL.

use crate::error::{EngineError, EngineResult};
use crate::store::{value_to_term, GraphStore};
use crate::types::{Datatype, VarValue, Variables};
use crate::vocab;
use anyhow::Result;
use uuid::Uuid;

pub struct VariableStore<'a> {
    store: &'a dyn GraphStore,
    max_bytes: usize,
}

impl<'a> VariableStore<'a> {
    pub fn new(store: &'a dyn GraphStore, max_bytes: usize) -> Self {
        Self { store, max_bytes }
    }

    fn scope_key(scope_path: &[String]) -> String {
        if scope_path.is_empty() {
            "root".to_string()
        } else {
            scope_path.join("/")
        }
    }

    fn subject(instance_id: Uuid, scope_path: &[String], name: &str) -> String {
        vocab::iri(
            "variable",
            format!("{instance_id}:{}:{name}", Self::scope_key(scope_path)),
        )
    }

    /// Scope-walk lookup: innermost scope outward to instance scope (§4.3).
    pub async fn get(
        &self,
        instance_id: Uuid,
        scope_path: &[String],
        name: &str,
    ) -> Result<Option<VarValue>> {
        for depth in (0..=scope_path.len()).rev() {
            let prefix = &scope_path[..depth];
            if let Some(v) = self.get_exact(instance_id, prefix, name).await? {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    async fn get_exact(
        &self,
        instance_id: Uuid,
        scope_path: &[String],
        name: &str,
    ) -> Result<Option<VarValue>> {
        let subject = Self::subject(instance_id, scope_path, name);
        let query = format!(
            "SELECT ?v ?d WHERE {{ <{subject}> <{val_pred}> ?v . <{subject}> <{dt_pred}> ?d }}",
            val_pred = vocab::pred::VAR_VALUE,
            dt_pred = vocab::pred::VAR_DATATYPE,
        );
        let results = self.store.query(vocab::graph::INST, &query).await?;
        let rows = results.as_solutions()?;
        match rows.first() {
            Some(row) => {
                let v = row.get("v").ok_or_else(|| anyhow::anyhow!("missing ?v"))?;
                let d = row.get("d").ok_or_else(|| anyhow::anyhow!("missing ?d"))?;
                Ok(Some(crate::store::parse_bound_value(v, literal_body(d))?))
            }
            None => Ok(None),
        }
    }

    /// Set a variable, defaulting scope to the instance scope (empty path).
    pub async fn set(
        &self,
        instance_id: Uuid,
        scope_path: &[String],
        name: &str,
        value: VarValue,
    ) -> EngineResult<()> {
        if value.byte_len() > self.max_bytes {
            return Err(EngineError::PreconditionFailed {
                message: format!(
                    "variable {name} exceeds max size of {} bytes",
                    self.max_bytes
                ),
            });
        }
        let subject = Self::subject(instance_id, scope_path, name);
        let datatype = value.datatype();
        let fields = vec![
            (vocab::pred::RDF_TYPE, oxigraph::model::Term::from(oxigraph::model::NamedNode::new_unchecked(vocab::class::VARIABLE))),
            (vocab::pred::VAR_INSTANCE, oxigraph::model::Term::from(oxigraph::model::NamedNode::new_unchecked(vocab::iri("inst", instance_id)))),
            (vocab::pred::VAR_NAME, oxigraph::model::Literal::new_simple_literal(name).into()),
            (vocab::pred::VAR_VALUE, value_to_term(&value)),
            (vocab::pred::VAR_DATATYPE, crate::store::datatype_to_term(datatype)),
            (vocab::pred::VAR_SCOPE, oxigraph::model::Literal::new_simple_literal(Self::scope_key(scope_path)).into()),
        ];
        self.store
            .put_subject(vocab::graph::INST, &subject, fields)
            .await?;

        // Dual-write the flat projection only when this write affects the
        // value an instance-scope guard would currently see (innermost
        // scope shadows outer ones, so only update the projection when the
        // written scope is the innermost one currently visible for `name`).
        self.refresh_projection(instance_id, scope_path, name).await?;
        Ok(())
    }

    /// Remove a variable (and refresh the projection to whatever the next
    /// outer scope provides, or clear it if none does).
    pub async fn unset(
        &self,
        instance_id: Uuid,
        scope_path: &[String],
        name: &str,
    ) -> Result<()> {
        let subject = Self::subject(instance_id, scope_path, name);
        self.store
            .delete_subject(vocab::graph::INST, &subject)
            .await?;
        self.refresh_projection(instance_id, scope_path, name).await?;
        Ok(())
    }

    async fn refresh_projection(
        &self,
        instance_id: Uuid,
        from_scope: &[String],
        name: &str,
    ) -> Result<()> {
        let instance_iri = vocab::iri("inst", instance_id);
        let pred = crate::condition::flat_var_predicate(name);
        let visible = self.get(instance_id, from_scope, name).await?;
        let object = visible.as_ref().map(value_to_term);
        self.store
            .replace_predicate(vocab::graph::INST, &instance_iri, &pred, object)
            .await
    }

    /// Snapshot every variable under a scope path (used on MI/subprocess
    /// entry so the scope can later be restored — §4.3, §4.6).
    pub async fn snapshot(
        &self,
        instance_id: Uuid,
        scope_path: &[String],
    ) -> Result<Variables> {
        let scope_key = Self::scope_key(scope_path);
        let query = format!(
            "SELECT ?n ?v ?d WHERE {{ ?s <{inst_pred}> <{instance_iri}> . ?s <{scope_pred}> \"{scope_key}\" . ?s <{name_pred}> ?n . ?s <{val_pred}> ?v . ?s <{dt_pred}> ?d }}",
            inst_pred = vocab::pred::VAR_INSTANCE,
            instance_iri = vocab::iri("inst", instance_id),
            scope_pred = vocab::pred::VAR_SCOPE,
            name_pred = vocab::pred::VAR_NAME,
            val_pred = vocab::pred::VAR_VALUE,
            dt_pred = vocab::pred::VAR_DATATYPE,
        );
        let results = self.store.query(vocab::graph::INST, &query).await?;
        let mut out = Variables::new();
        for row in results.as_solutions()? {
            let n = row.get("n").map(|s| literal_body(s).to_string()).unwrap_or_default();
            let v = row.get("v").cloned().unwrap_or_default();
            let d = row.get("d").cloned().unwrap_or_default();
            out.insert(n, crate::store::parse_bound_value(&v, literal_body(&d))?);
        }
        Ok(out)
    }

    /// Restore a previously captured snapshot into a scope (used on MI/event
    /// subprocess exit when the subprocess owns its own variable scope).
    pub async fn restore(
        &self,
        instance_id: Uuid,
        scope_path: &[String],
        vars: &Variables,
    ) -> EngineResult<()> {
        for (name, value) in vars {
            self.set(instance_id, scope_path, name, value.clone())
                .await?;
        }
        Ok(())
    }

    /// Remove every variable declared directly in a scope (subprocess exit
    /// when the subprocess owns its own variable scope, §4.6).
    pub async fn clear_scope(&self, instance_id: Uuid, scope_path: &[String]) -> Result<()> {
        let snapshot = self.snapshot(instance_id, scope_path).await?;
        for name in snapshot.keys() {
            self.unset(instance_id, scope_path, name).await?;
        }
        Ok(())
    }
}

fn literal_body(s: &str) -> &str {
    s.trim_matches('"')
}

pub fn parse_datatype(name: &str) -> Datatype {
    match name {
        "Integer" => Datatype::Integer,
        "Decimal" => Datatype::Decimal,
        "Boolean" => Datatype::Boolean,
        "DateTime" => Datatype::DateTime,
        _ => Datatype::String,
    }
}
