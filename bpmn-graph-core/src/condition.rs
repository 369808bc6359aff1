//! Expression & Condition Evaluator (design §4.2, "C2").
//!
//! Parses the restricted `${IDENT OP LITERAL}` guard grammar into a SPARQL
//! ASK body, or passes a full SPARQL ASK body through with `${instance}`
//! substitution. Grounded on `bpmn-lite-core/src/compiler/ir.rs`'s
//! `ConditionExpr`/`ConditionOp`: the same shape (identifier, operator,
//! literal), lifted from a compile-time bytecode flag comparison to a
//! runtime SPARQL ASK string builder evaluated against the graph store's
//! flat per-instance variable projection (see `variables.rs`).

use crate::store::GraphStore;
use crate::vocab;
use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl GuardOp {
    fn sparql(self) -> &'static str {
        match self {
            GuardOp::Eq => "=",
            GuardOp::Neq => "!=",
            GuardOp::Gt => ">",
            GuardOp::Gte => ">=",
            GuardOp::Lt => "<",
            GuardOp::Lte => "<=",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "==" | "eq" => Some(GuardOp::Eq),
            "!=" | "neq" => Some(GuardOp::Neq),
            ">" | "gt" => Some(GuardOp::Gt),
            ">=" | "gte" => Some(GuardOp::Gte),
            "<" | "lt" => Some(GuardOp::Lt),
            "<=" | "lte" => Some(GuardOp::Lte),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum GuardLiteral {
    Number(f64),
    Bool(bool),
    Str(String),
}

impl GuardLiteral {
    fn parse(token: &str) -> Self {
        let trimmed = token.trim();
        if let Some(inner) = trimmed
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
        {
            return GuardLiteral::Str(inner.to_string());
        }
        match trimmed {
            "true" => GuardLiteral::Bool(true),
            "false" => GuardLiteral::Bool(false),
            _ => trimmed
                .parse::<f64>()
                .map(GuardLiteral::Number)
                .unwrap_or_else(|_| GuardLiteral::Str(trimmed.to_string())),
        }
    }

    fn sparql(&self) -> String {
        match self {
            GuardLiteral::Number(n) => n.to_string(),
            GuardLiteral::Bool(b) => b.to_string(),
            GuardLiteral::Str(s) => format!("\"{}\"", s.replace('"', "\\\"")),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ParsedGuard {
    /// Null/empty expression — always true (§4.2 rule 4).
    Unconditional,
    /// `${IDENT}` bare identifier — truthy test.
    Truthy { ident: String },
    /// `${IDENT OP LITERAL}`.
    Simple {
        ident: String,
        op: GuardOp,
        literal: GuardLiteral,
    },
    /// A full SPARQL ASK body (`${instance}` substituted at evaluation time).
    FullAsk(String),
}

/// Parse a guard expression per §4.2's grammar.
pub fn parse_guard(text: &str) -> ParsedGuard {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ParsedGuard::Unconditional;
    }

    if let Some(inner) = trimmed
        .strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
    {
        let inner = inner.trim();
        let parts: Vec<&str> = inner.splitn(3, char::is_whitespace).collect();
        if parts.len() == 3 {
            if let Some(op) = GuardOp::parse(parts[1]) {
                return ParsedGuard::Simple {
                    ident: parts[0].to_string(),
                    op,
                    literal: GuardLiteral::parse(parts[2]),
                };
            }
        }
        return ParsedGuard::Truthy {
            ident: inner.to_string(),
        };
    }

    // Anything else is treated as a full SPARQL ASK body per §4.2 rule 1.
    ParsedGuard::FullAsk(trimmed.to_string())
}

/// Evaluate a guard against an instance's current variable projection.
///
/// Missing variable ⇒ the FILTER fails ⇒ false, per §4.2 rule 3 — except
/// callers must special-case the default sequence flow (never evaluated),
/// handled by `executor.rs`, not here.
pub async fn evaluate_guard(
    store: &dyn GraphStore,
    instance_id: uuid::Uuid,
    text: &str,
) -> Result<bool> {
    match parse_guard(text) {
        ParsedGuard::Unconditional => Ok(true),
        ParsedGuard::Truthy { ident } => {
            let instance_iri = vocab::iri("inst", instance_id);
            let var_pred = flat_var_predicate(&ident);
            let body = format!(
                "{{ <{instance_iri}> <{var_pred}> ?v . FILTER(isLiteral(?v) && (xsd:boolean(?v) || STR(?v) != \"\" && STR(?v) != \"0\" && STR(?v) != \"false\")) }}"
            );
            store.ask(vocab::graph::INST, &body).await
        }
        ParsedGuard::Simple { ident, op, literal } => {
            let instance_iri = vocab::iri("inst", instance_id);
            let var_pred = flat_var_predicate(&ident);
            let body = format!(
                "{{ <{instance_iri}> <{var_pred}> ?v . FILTER(?v {op} {lit}) }}",
                op = op.sparql(),
                lit = literal.sparql(),
            );
            store.ask(vocab::graph::INST, &body).await
        }
        ParsedGuard::FullAsk(sparql) => {
            let instance_iri = vocab::iri("inst", instance_id);
            let substituted = sparql.replace("${instance}", &format!("<{instance_iri}>"));
            // A full ASK body already carries its own `{ ... }`; reuse `query`
            // so we don't double-wrap it in an extra ASK keyword.
            let asked = if substituted.trim_start().to_uppercase().starts_with("ASK") {
                substituted
            } else {
                format!("ASK {substituted}")
            };
            store.query(vocab::graph::INST, &asked).await?.as_boolean()
        }
    }
}

/// Predicate used for the flat per-instance variable projection that guard
/// evaluation reads (see `variables.rs`'s dual-write).
pub fn flat_var_predicate(ident: &str) -> String {
    format!("{}var:{}", vocab::NS, ident)
}
