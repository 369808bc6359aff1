//! Token Executor (design §4.5, "C5") — the core state machine.
//!
//! `step()` consumes one ACTIVE token and dispatches on its current node's
//! `NodeKind` per §4.5.1's table, either advancing it, parking it WAITING,
//! replacing it with descendant tokens, or consuming it. `run_to_quiescence`
//! drives a whole instance forward until every remaining token is WAITING or
//! the instance reaches a terminal status (§4.9's "immediately runs the
//! executor until quiescence").
//!
//! Grounded on `bpmn-lite-core/src/vm.rs`'s step loop (`fn step(&mut self)
//! -> StepResult` dispatching on opcode) — generalized from one instruction
//! pointer per VM to one token per BPMN node, and from a flat opcode match
//! to the node-kind table §4.5.1 names. CallActivity and multi-instance
//! fan-out are delegated to `scope.rs`, which calls back into the token
//! primitives exposed here as `pub(crate)`.

use crate::async_jobs::AsyncJobService;
use crate::audit::{event_type, AuditLog};
use crate::condition::evaluate_guard;
use crate::error::{EngineError, EngineResult};
use crate::event_router::EventRouter;
use crate::handlers::{self, HandlerRegistry};
use crate::scope;
use crate::store::{value_to_term, GraphStore};
use crate::timer::TimerService;
use crate::types::{
    CatchDetail, CatchEventTrigger, EndEventKind, ExecutionListener, InstanceStatus, ListenerEvent,
    NodeKind, ProcessDefinition, Token, TokenState, VarValue, Variables,
};
use crate::vocab;
use crate::variables::VariableStore;
use anyhow::{anyhow, Result};
use oxigraph::model::{Literal, NamedNode, Term};
use uuid::Uuid;

/// What happened to the instance as a consequence of a single `step()`.
#[derive(Debug)]
pub enum StepOutcome {
    /// The token advanced, split, or was otherwise replaced by zero or more
    /// successor tokens now ACTIVE.
    Advanced(Vec<Token>),
    /// The token is now WAITING (UserTask, ReceiveTask, IntermediateCatchEvent,
    /// EventBasedGateway, CallActivity, parallel/inclusive join not yet complete).
    Parked,
    /// The token was consumed with no successor (ParallelGateway join still
    /// waiting on siblings, or an EndEvent that wasn't the instance's last).
    Consumed,
    /// The instance reached a terminal status as a result of this step.
    InstanceTerminal(InstanceStatus),
}

pub struct Executor<'a> {
    pub store: &'a dyn GraphStore,
    pub handlers: &'a HandlerRegistry,
    pub script_tasks_enabled: bool,
    pub variable_max_bytes: usize,
}

impl<'a> Executor<'a> {
    pub fn new(store: &'a dyn GraphStore, handlers: &'a HandlerRegistry, script_tasks_enabled: bool) -> Self {
        Self { store, handlers, script_tasks_enabled, variable_max_bytes: usize::MAX }
    }

    pub fn with_variable_max_bytes(mut self, variable_max_bytes: usize) -> Self {
        self.variable_max_bytes = variable_max_bytes;
        self
    }

    fn vars(&self) -> VariableStore<'a> {
        VariableStore::new(self.store, self.variable_max_bytes)
    }

    fn audit(&self) -> AuditLog<'a> {
        AuditLog::new(self.store)
    }

    fn router(&self) -> EventRouter<'a> {
        EventRouter::new(self.store)
    }

    fn timers(&self) -> TimerService<'a> {
        TimerService::new(self.store, 60_000)
    }

    fn async_jobs(&self) -> AsyncJobService<'a> {
        AsyncJobService::new(self.store, 60_000)
    }

    // ─── Token CRUD (inst graph) ──────────────────────────────────

    pub(crate) async fn persist_token(&self, token: &Token) -> Result<()> {
        let subject = vocab::iri("token", token.token_id);
        let mut fields = vec![
            (
                vocab::pred::RDF_TYPE,
                Term::from(NamedNode::new_unchecked(vocab::class::TOKEN)),
            ),
            (
                vocab::pred::OWNING_INSTANCE,
                Term::from(NamedNode::new_unchecked(vocab::iri("inst", token.instance_id))),
            ),
            (
                vocab::pred::CURRENT_NODE,
                Literal::new_simple_literal(&token.node_id).into(),
            ),
            (
                vocab::pred::SCOPE_PATH,
                Literal::new_simple_literal(token.scope_path.join("/")).into(),
            ),
            (vocab::pred::TOKEN_STATE, token_state_literal(token.state)),
        ];
        if let Some(idx) = token.loop_index {
            fields.push((vocab::pred::LOOP_INDEX, integer_literal(idx as i64)));
        }
        self.store.put_subject(vocab::graph::INST, &subject, fields).await
    }

    pub(crate) async fn delete_token(&self, token_id: Uuid) -> Result<()> {
        let subject = vocab::iri("token", token_id);
        self.store.delete_subject(vocab::graph::INST, &subject).await
    }

    pub(crate) async fn spawn_token(
        &self,
        instance_id: Uuid,
        node_id: &str,
        scope_path: Vec<String>,
    ) -> Result<Token> {
        let token = Token::new(instance_id, node_id, scope_path);
        self.persist_token(&token).await?;
        Ok(token)
    }

    /// Every token (any state) currently owned by an instance.
    pub(crate) async fn tokens_for_instance(&self, instance_id: Uuid) -> Result<Vec<Token>> {
        let query = format!(
            "SELECT ?t ?node ?scope ?state ?idx WHERE {{
                ?t <{owning}> <{inst_iri}> . ?t <{node}> ?node . ?t <{scope}> ?scope . ?t <{state}> ?state .
                OPTIONAL {{ ?t <{idx}> ?idx }}
             }}",
            owning = vocab::pred::OWNING_INSTANCE,
            inst_iri = vocab::iri("inst", instance_id),
            node = vocab::pred::CURRENT_NODE,
            scope = vocab::pred::SCOPE_PATH,
            state = vocab::pred::TOKEN_STATE,
            idx = vocab::pred::LOOP_INDEX,
        );
        let results = self.store.query(vocab::graph::INST, &query).await?;
        let mut out = Vec::new();
        for row in results.as_solutions()? {
            let token_id = parse_uuid_iri(row.get("t").ok_or_else(|| anyhow!("missing ?t"))?)?;
            let scope_raw = strip_quotes(row.get("scope").ok_or_else(|| anyhow!("missing ?scope"))?);
            let scope_path = if scope_raw.is_empty() {
                Vec::new()
            } else {
                scope_raw.split('/').map(str::to_string).collect()
            };
            out.push(Token {
                token_id,
                instance_id,
                node_id: strip_quotes(row.get("node").ok_or_else(|| anyhow!("missing ?node"))?).to_string(),
                scope_path,
                state: parse_token_state(strip_quotes(row.get("state").ok_or_else(|| anyhow!("missing ?state"))?)),
                loop_index: row.get("idx").map(|s| strip_quotes(s).parse().unwrap_or(0)),
            });
        }
        Ok(out)
    }

    async fn active_tokens(&self, instance_id: Uuid) -> Result<Vec<Token>> {
        Ok(self
            .tokens_for_instance(instance_id)
            .await?
            .into_iter()
            .filter(|t| t.state == TokenState::Active)
            .collect())
    }

    async fn set_instance_status(&self, instance_id: Uuid, status: InstanceStatus) -> Result<()> {
        let instance_iri = vocab::iri("inst", instance_id);
        let object = Some(status_literal(status));
        self.store
            .replace_predicate(vocab::graph::INST, &instance_iri, vocab::pred::STATUS, object)
            .await?;
        if status.is_terminal() {
            self.store
                .replace_predicate(
                    vocab::graph::INST,
                    &instance_iri,
                    vocab::pred::COMPLETED_AT,
                    Some(crate::store::value_to_term(&VarValue::DateTime(crate::types::now_ms()))),
                )
                .await?;
        }
        Ok(())
    }

    /// Run every ACTIVE token of an instance to quiescence (§4.9): repeatedly
    /// step the active set until none remain active or the instance goes
    /// terminal. Per §5, the caller holds the instance's serialization lock
    /// for the whole call.
    pub async fn run_to_quiescence(
        &self,
        definition: &ProcessDefinition,
        instance_id: Uuid,
    ) -> EngineResult<()> {
        loop {
            let active = self.active_tokens(instance_id).await.map_err(EngineError::from)?;
            if active.is_empty() {
                return Ok(());
            }
            for token in active {
                match self.step(definition, token).await {
                    Ok(StepOutcome::InstanceTerminal(_)) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => {
                        self.escalate_failure(definition, instance_id, None, &e).await?;
                        if self.instance_is_terminal(instance_id).await.map_err(EngineError::from)? {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn instance_is_terminal(&self, instance_id: Uuid) -> Result<bool> {
        let query = format!(
            "SELECT ?s WHERE {{ <{inst_iri}> <{status}> ?s }}",
            inst_iri = vocab::iri("inst", instance_id),
            status = vocab::pred::STATUS,
        );
        let results = self.store.query(vocab::graph::INST, &query).await?;
        let Some(row) = results.as_solutions()?.first() else { return Ok(false) };
        let s = strip_quotes(row.get("s").ok_or_else(|| anyhow!("missing ?s"))?);
        Ok(parse_instance_status(s).is_terminal())
    }

    // ─── Dispatch (§4.5.1) ────────────────────────────────────────

    pub async fn step(&self, definition: &ProcessDefinition, token: Token) -> EngineResult<StepOutcome> {
        let node = definition
            .node(&token.node_id)
            .ok_or_else(|| EngineError::BadDefinition {
                message: format!("token references unknown node {}", token.node_id),
            })?
            .clone();

        tracing::debug!(
            instance_id = %token.instance_id,
            token_id = %token.token_id,
            node_id = %node.id,
            kind = ?node.kind,
            "stepping token"
        );

        if node.multi_instance.is_some() && token.loop_index.is_none() {
            return scope::run_multi_instance(self, definition, token, &node).await;
        }

        match &node.kind {
            NodeKind::StartEvent { .. } | NodeKind::EventSubprocessStart { .. } => {
                self.audit()
                    .record(token.instance_id, Some(&node.id), event_type::START, crate::types::AuditEvent::SYSTEM_ACTOR, None)
                    .await
                    .map_err(EngineError::from)?;
                self.run_listeners(&node.listeners, ListenerEvent::Start, token.instance_id, &node.id).await?;
                self.take_single_outgoing(definition, token).await
            }

            NodeKind::ServiceTask { topic } | NodeKind::SendTask { topic } => {
                self.run_listeners(&node.listeners, ListenerEvent::Start, token.instance_id, &node.id).await?;
                if let Some(topic) = topic {
                    if self.is_async_handler(topic) {
                        return self.park_for_async_handler(definition, token, &node, topic).await;
                    }
                    self.invoke_topic(token.instance_id, &token.scope_path, topic).await?;
                }
                self.run_listeners(&node.listeners, ListenerEvent::End, token.instance_id, &node.id).await?;
                self.take_single_outgoing(definition, token).await
            }

            NodeKind::ManualTask => {
                self.audit()
                    .record(token.instance_id, Some(&node.id), event_type::MANUAL_COMPLETE, crate::types::AuditEvent::SYSTEM_ACTOR, None)
                    .await
                    .map_err(EngineError::from)?;
                self.take_single_outgoing(definition, token).await
            }

            NodeKind::UserTask => {
                self.park(token.clone()).await?;
                self.create_user_task(&token).await.map_err(EngineError::from)?;
                self.run_listeners(&node.listeners, ListenerEvent::Create, token.instance_id, &node.id).await?;
                let boundaries = definition.boundary_events_on(&node.id);
                self.arm_boundary_events(token.instance_id, &token.scope_path, &boundaries).await?;
                Ok(StepOutcome::Parked)
            }

            NodeKind::ReceiveTask { message_name, corr_key_source } => {
                let corr_key = self.resolve_corr_key(token.instance_id, &token.scope_path, corr_key_source).await?;
                self.park(token.clone()).await?;
                self.router()
                    .subscribe(token.instance_id, token.token_id, message_name, &corr_key, None)
                    .await
                    .map_err(EngineError::from)?;
                let boundaries = definition.boundary_events_on(&node.id);
                self.arm_boundary_events(token.instance_id, &token.scope_path, &boundaries).await?;
                Ok(StepOutcome::Parked)
            }

            NodeKind::ScriptTask { script } => self.run_script_task(definition, token, script).await,

            NodeKind::IntermediateThrowEvent { message_name } => {
                if let Some(name) = message_name {
                    self.audit()
                        .record(token.instance_id, Some(&node.id), event_type::MESSAGE_SENT, crate::types::AuditEvent::SYSTEM_ACTOR, Some(serde_json::json!({"message": name})))
                        .await
                        .map_err(EngineError::from)?;
                }
                self.take_single_outgoing(definition, token).await
            }

            NodeKind::IntermediateCatchEvent { trigger, detail } => {
                self.park_catch(token, *trigger, detail.clone()).await
            }

            NodeKind::ExclusiveGateway => self.take_exclusive(definition, token).await,
            NodeKind::InclusiveGateway => self.take_inclusive(definition, token).await,
            NodeKind::ParallelGateway => self.take_parallel(definition, token).await,
            NodeKind::EventBasedGateway => self.take_event_based(definition, token).await,

            NodeKind::EmbeddedSubprocess { start_node, .. } => {
                let boundaries = definition.boundary_events_on(&node.id);
                self.arm_boundary_events(token.instance_id, &token.scope_path, &boundaries).await?;
                let mut scope_path = token.scope_path.clone();
                scope_path.push(node.id.clone());
                let inner = self.spawn_token(token.instance_id, start_node, scope_path).await.map_err(EngineError::from)?;
                self.delete_token(token.token_id).await.map_err(EngineError::from)?;
                Ok(StepOutcome::Advanced(vec![inner]))
            }

            NodeKind::EventSubprocess { .. } => {
                // Never entered by ordinary flow (§4.5.1); reaching this node
                // via a normal TAKE is a definition error.
                Err(EngineError::BadDefinition {
                    message: format!("node {} is an event subprocess container and cannot be entered by a sequence flow", node.id),
                })
            }

            NodeKind::CallActivity { .. } => scope::start_call_activity(self, definition, token, &node).await,

            NodeKind::BoundaryEvent { .. } => {
                // Boundary events are entered by the Event Router, not by
                // ordinary flow-taking; a token should never land here directly.
                Err(EngineError::BadDefinition {
                    message: format!("node {} is a boundary event and cannot be entered by a sequence flow", node.id),
                })
            }

            NodeKind::EndEvent { kind } => self.run_end_event(definition, token, &node, *kind).await,
        }
    }

    async fn run_script_task(
        &self,
        definition: &ProcessDefinition,
        token: Token,
        script: &str,
    ) -> EngineResult<StepOutcome> {
        if !self.script_tasks_enabled {
            self.audit()
                .record(
                    token.instance_id,
                    Some(&token.node_id),
                    "SCRIPT_DISABLED",
                    crate::types::AuditEvent::SYSTEM_ACTOR,
                    Some(serde_json::json!({"script": script})),
                )
                .await
                .map_err(EngineError::from)?;
            return self.take_single_outgoing(definition, token).await;
        }
        // Scripting is disabled by default per §4.5.1 and no sandboxed
        // evaluator is wired up in this build; treat an enabled flag with no
        // evaluator as a configuration error rather than silently executing
        // untrusted script text.
        Err(EngineError::Unsupported {
            feature: "script task execution (no sandboxed evaluator configured)".to_string(),
        })
    }

    async fn run_end_event(
        &self,
        definition: &ProcessDefinition,
        token: Token,
        node: &crate::types::FlowNode,
        kind: EndEventKind,
    ) -> EngineResult<StepOutcome> {
        match kind {
            EndEventKind::Terminate => {
                self.cancel_all_tokens(token.instance_id).await.map_err(EngineError::from)?;
                self.set_instance_status(token.instance_id, InstanceStatus::Terminated)
                    .await
                    .map_err(EngineError::from)?;
                self.audit()
                    .record(token.instance_id, Some(&node.id), event_type::TERMINATE, crate::types::AuditEvent::SYSTEM_ACTOR, None)
                    .await
                    .map_err(EngineError::from)?;
                Ok(StepOutcome::InstanceTerminal(InstanceStatus::Terminated))
            }
            EndEventKind::Error => {
                let error_code = node.name.clone().unwrap_or_default();
                self.delete_token(token.token_id).await.map_err(EngineError::from)?;
                self.audit()
                    .record(token.instance_id, Some(&node.id), event_type::ERROR, crate::types::AuditEvent::SYSTEM_ACTOR, Some(serde_json::json!({"errorCode": error_code})))
                    .await
                    .map_err(EngineError::from)?;
                self.handle_error_propagation(definition, token.instance_id, &token.scope_path, &error_code).await
            }
            EndEventKind::Cancel | EndEventKind::Compensation => {
                // Compensation/cancel end events require a transaction
                // subprocess and registered compensation handlers, neither of
                // which this build tracks; fail explicitly rather than
                // silently treating them as a plain end (§9 Open Question).
                Err(EngineError::Unsupported {
                    feature: format!("{:?} end event", kind),
                })
            }
            EndEventKind::None | EndEventKind::Message => {
                if kind == EndEventKind::Message {
                    self.audit()
                        .record(token.instance_id, Some(&node.id), event_type::MESSAGE_SENT, crate::types::AuditEvent::SYSTEM_ACTOR, None)
                        .await
                        .map_err(EngineError::from)?;
                }
                self.audit()
                    .record(token.instance_id, Some(&node.id), event_type::END, crate::types::AuditEvent::SYSTEM_ACTOR, None)
                    .await
                    .map_err(EngineError::from)?;

                if let Some(container) = &node.container {
                    // Inner end event of an embedded subprocess: pop the
                    // scope and place one outgoing token on the container.
                    self.delete_token(token.token_id).await.map_err(EngineError::from)?;
                    let mut parent_scope = token.scope_path.clone();
                    parent_scope.pop();
                    self.cancel_boundary_events(definition, token.instance_id, &parent_scope, container).await?;
                    let parent_token = Token::new(token.instance_id, container.clone(), parent_scope);
                    self.persist_token(&parent_token).await.map_err(EngineError::from)?;
                    return self.take_single_outgoing(definition, parent_token).await;
                }

                self.delete_token(token.token_id).await.map_err(EngineError::from)?;
                let remaining = self.active_tokens(token.instance_id).await.map_err(EngineError::from)?;
                if remaining.is_empty() {
                    self.set_instance_status(token.instance_id, InstanceStatus::Completed)
                        .await
                        .map_err(EngineError::from)?;
                    Ok(StepOutcome::InstanceTerminal(InstanceStatus::Completed))
                } else {
                    Ok(StepOutcome::Consumed)
                }
            }
        }
    }

    // ─── Flow traversal (§4.5.2) ──────────────────────────────────

    pub(crate) async fn take_single_outgoing(&self, definition: &ProcessDefinition, token: Token) -> EngineResult<StepOutcome> {
        let outgoing = definition.outgoing(&token.node_id);
        let Some(flow) = outgoing.first() else {
            return Err(EngineError::DeadEnd { instance_id: token.instance_id, node_id: token.node_id.clone() });
        };
        let next = self.take_flow(definition, &token, flow.id.clone(), flow.target.clone()).await?;
        self.delete_token(token.token_id).await.map_err(EngineError::from)?;
        Ok(StepOutcome::Advanced(vec![next]))
    }

    pub(crate) async fn take_flow(
        &self,
        definition: &ProcessDefinition,
        token: &Token,
        flow_id: String,
        target: String,
    ) -> EngineResult<Token> {
        self.audit()
            .record(token.instance_id, Some(&flow_id), event_type::TAKE, crate::types::AuditEvent::SYSTEM_ACTOR, None)
            .await
            .map_err(EngineError::from)?;
        if let Some(source_node) = definition.node(&token.node_id) {
            self.run_listeners(&source_node.listeners, ListenerEvent::Take, token.instance_id, &flow_id).await?;
        }
        let next = Token::new(token.instance_id, target, token.scope_path.clone());
        self.persist_token(&next).await.map_err(EngineError::from)?;
        Ok(next)
    }

    async fn take_exclusive(&self, definition: &ProcessDefinition, token: Token) -> EngineResult<StepOutcome> {
        let outgoing = definition.outgoing(&token.node_id);
        let mut default_flow = None;
        for flow in &outgoing {
            if flow.is_default {
                default_flow = Some(flow);
                continue;
            }
            let condition = flow.condition.as_deref().unwrap_or("");
            if evaluate_guard(self.store, token.instance_id, condition).await.map_err(EngineError::from)? {
                let next = self.take_flow(definition, &token, flow.id.clone(), flow.target.clone()).await?;
                self.delete_token(token.token_id).await.map_err(EngineError::from)?;
                return Ok(StepOutcome::Advanced(vec![next]));
            }
        }
        if let Some(flow) = default_flow {
            let next = self.take_flow(definition, &token, flow.id.clone(), flow.target.clone()).await?;
            self.delete_token(token.token_id).await.map_err(EngineError::from)?;
            return Ok(StepOutcome::Advanced(vec![next]));
        }
        Err(EngineError::DeadEnd { instance_id: token.instance_id, node_id: token.node_id.clone() })
    }

    async fn take_inclusive(&self, definition: &ProcessDefinition, token: Token) -> EngineResult<StepOutcome> {
        let incoming = definition.incoming(&token.node_id);
        let outgoing = definition.outgoing(&token.node_id);
        if incoming.len() > 1 {
            // Join: park, then proceed only once every sibling scope token
            // that could still reach this gateway has arrived. This build
            // approximates "could still reach" as "no ACTIVE token remains
            // in the same scope" (documented approximation, §9).
            self.park(token.clone()).await?;
            let siblings = self.tokens_for_instance(token.instance_id).await.map_err(EngineError::from)?;
            let still_active = siblings
                .iter()
                .any(|t| t.scope_path == token.scope_path && t.state == TokenState::Active && t.token_id != token.token_id);
            if still_active {
                return Ok(StepOutcome::Parked);
            }
            let waiting_here: Vec<Token> = siblings
                .into_iter()
                .filter(|t| t.node_id == token.node_id && t.scope_path == token.scope_path)
                .collect();
            for t in &waiting_here {
                self.delete_token(t.token_id).await.map_err(EngineError::from)?;
            }
            let merged = Token::new(token.instance_id, token.node_id.clone(), token.scope_path.clone());
            self.persist_token(&merged).await.map_err(EngineError::from)?;
            return self.take_single_outgoing(definition, merged).await;
        }

        let mut taken = Vec::new();
        let mut any_true = false;
        for flow in &outgoing {
            if flow.is_default {
                continue;
            }
            let condition = flow.condition.as_deref().unwrap_or("");
            if evaluate_guard(self.store, token.instance_id, condition).await.map_err(EngineError::from)? {
                any_true = true;
                taken.push(flow);
            }
        }
        if !any_true {
            if let Some(default_flow) = outgoing.iter().find(|f| f.is_default) {
                taken.push(default_flow);
            }
        }
        if taken.is_empty() {
            return Err(EngineError::DeadEnd { instance_id: token.instance_id, node_id: token.node_id.clone() });
        }
        let mut spawned = Vec::new();
        for flow in taken {
            spawned.push(self.take_flow(definition, &token, flow.id.clone(), flow.target.clone()).await?);
        }
        self.delete_token(token.token_id).await.map_err(EngineError::from)?;
        Ok(StepOutcome::Advanced(spawned))
    }

    async fn take_parallel(&self, definition: &ProcessDefinition, token: Token) -> EngineResult<StepOutcome> {
        let incoming = definition.incoming(&token.node_id);
        let outgoing = definition.outgoing(&token.node_id);
        if incoming.len() > 1 {
            self.park(token.clone()).await?;
            let siblings = self.tokens_for_instance(token.instance_id).await.map_err(EngineError::from)?;
            let waiting_here: Vec<Token> = siblings
                .into_iter()
                .filter(|t| t.node_id == token.node_id && t.scope_path == token.scope_path && t.state == TokenState::Waiting)
                .collect();
            if waiting_here.len() < incoming.len() {
                return Ok(StepOutcome::Parked);
            }
            for t in &waiting_here {
                self.delete_token(t.token_id).await.map_err(EngineError::from)?;
            }
            let merged = Token::new(token.instance_id, token.node_id.clone(), token.scope_path.clone());
            self.persist_token(&merged).await.map_err(EngineError::from)?;
            return self.take_single_outgoing(definition, merged).await;
        }

        let mut spawned = Vec::new();
        for flow in &outgoing {
            spawned.push(self.take_flow(definition, &token, flow.id.clone(), flow.target.clone()).await?);
        }
        self.delete_token(token.token_id).await.map_err(EngineError::from)?;
        Ok(StepOutcome::Advanced(spawned))
    }

    async fn take_event_based(&self, definition: &ProcessDefinition, token: Token) -> EngineResult<StepOutcome> {
        let race_group = token.token_id.to_string();
        self.park(token.clone()).await?;
        for flow in definition.outgoing(&token.node_id) {
            let Some(target) = definition.node(&flow.target) else { continue };
            match &target.kind {
                NodeKind::IntermediateCatchEvent { trigger: CatchEventTrigger::Message, detail } => {
                    if let CatchDetail::Message { message_name, corr_key_source } = detail {
                        let corr_key = self.resolve_corr_key(token.instance_id, &token.scope_path, corr_key_source).await?;
                        self.router()
                            .subscribe(token.instance_id, token.token_id, message_name, &corr_key, Some(&race_group))
                            .await
                            .map_err(EngineError::from)?;
                    }
                }
                NodeKind::IntermediateCatchEvent { trigger: CatchEventTrigger::Timer, detail } => {
                    if let Some(due_at) = timer_due_at(detail) {
                        self.timers()
                            .schedule(token.instance_id, token.token_id, &flow.target, due_at)
                            .await
                            .map_err(EngineError::from)?;
                    }
                }
                _ => {}
            }
        }
        Ok(StepOutcome::Parked)
    }

    // ─── Catch events / parking ───────────────────────────────────

    async fn park_catch(
        &self,
        token: Token,
        trigger: CatchEventTrigger,
        detail: CatchDetail,
    ) -> EngineResult<StepOutcome> {
        self.park(token.clone()).await?;
        match trigger {
            CatchEventTrigger::Message => {
                if let CatchDetail::Message { message_name, corr_key_source } = &detail {
                    let corr_key = self.resolve_corr_key(token.instance_id, &token.scope_path, corr_key_source).await?;
                    self.router()
                        .subscribe(token.instance_id, token.token_id, message_name, &corr_key, None)
                        .await
                        .map_err(EngineError::from)?;
                }
                Ok(StepOutcome::Parked)
            }
            CatchEventTrigger::Signal => {
                if let CatchDetail::Signal { signal_name } = &detail {
                    self.router()
                        .subscribe(token.instance_id, token.token_id, signal_name, "", None)
                        .await
                        .map_err(EngineError::from)?;
                }
                Ok(StepOutcome::Parked)
            }
            CatchEventTrigger::Timer => {
                if let Some(due_at) = timer_due_at(&detail) {
                    self.timers()
                        .schedule(token.instance_id, token.token_id, &token.node_id, due_at)
                        .await
                        .map_err(EngineError::from)?;
                    self.audit()
                        .record(token.instance_id, Some(&token.node_id), event_type::TIMER_SCHEDULED, crate::types::AuditEvent::SYSTEM_ACTOR, None)
                        .await
                        .map_err(EngineError::from)?;
                }
                Ok(StepOutcome::Parked)
            }
            CatchEventTrigger::Error | CatchEventTrigger::Escalation | CatchEventTrigger::Conditional => {
                Err(EngineError::Unsupported { feature: format!("{:?} intermediate catch event", trigger) })
            }
        }
    }

    pub(crate) async fn park(&self, mut token: Token) -> EngineResult<()> {
        token.state = TokenState::Waiting;
        self.persist_token(&token).await.map_err(EngineError::from)
    }

    async fn resolve_corr_key(&self, instance_id: Uuid, scope_path: &[String], source: &str) -> EngineResult<String> {
        if source.is_empty() {
            return Ok(String::new());
        }
        match self.vars().get(instance_id, scope_path, source).await.map_err(EngineError::from)? {
            Some(VarValue::String(s)) => Ok(s),
            Some(other) => Ok(format!("{other:?}")),
            None => Ok(String::new()),
        }
    }

    async fn create_user_task(&self, token: &Token) -> Result<()> {
        let task_id = Uuid::now_v7();
        let subject = vocab::iri("task", task_id);
        let fields = vec![
            (
                vocab::pred::RDF_TYPE,
                Term::from(NamedNode::new_unchecked(vocab::class::USER_TASK)),
            ),
            (
                vocab::pred::TASK_INSTANCE,
                Term::from(NamedNode::new_unchecked(vocab::iri("inst", token.instance_id))),
            ),
            (
                vocab::pred::TASK_NODE,
                Literal::new_simple_literal(&token.node_id).into(),
            ),
            (
                vocab::pred::TASK_TOKEN,
                Term::from(NamedNode::new_unchecked(vocab::iri("token", token.token_id))),
            ),
            (vocab::pred::TASK_STATUS, Literal::new_simple_literal("Created").into()),
        ];
        self.store.put_subject(vocab::graph::TASKS, &subject, fields).await?;
        self.audit()
            .record(token.instance_id, Some(&token.node_id), event_type::TASK_CREATE, crate::types::AuditEvent::SYSTEM_ACTOR, Some(serde_json::json!({"taskId": task_id.to_string()})))
            .await?;
        Ok(())
    }

    // ─── Listeners (§4.5.3) ───────────────────────────────────────

    pub(crate) async fn run_listeners(
        &self,
        listeners: &[ExecutionListener],
        event: ListenerEvent,
        instance_id: Uuid,
        node_id: &str,
    ) -> EngineResult<()> {
        for listener in listeners.iter().filter(|l| l.event == event) {
            let Some(topic) = &listener.expression else { continue };
            let event_label = match event {
                ListenerEvent::Start => event_type::LISTENER_START,
                ListenerEvent::End => event_type::LISTENER_END,
                ListenerEvent::Take => event_type::LISTENER_TAKE,
                _ => event_type::LISTENER_START,
            };
            self.invoke_topic_labeled(instance_id, &[], topic, event_label, node_id).await?;
        }
        Ok(())
    }

    async fn invoke_topic(&self, instance_id: Uuid, scope_path: &[String], topic: &str) -> EngineResult<()> {
        self.invoke_topic_labeled(instance_id, scope_path, topic, event_type::COMPLETE, "").await
    }

    /// §4.4's fifth suspension point: a registered `Http` handler with
    /// `async_execution` set doesn't run inline inside `step()`.
    fn is_async_handler(&self, topic: &str) -> bool {
        matches!(self.handlers.get(topic), Some(handlers::Handler::Http(spec)) if spec.async_execution)
    }

    /// Park the token, record a pending job, and arm the node's boundary
    /// events exactly like any other waiting activity — the job poll
    /// (`Supervisor::run_pending_async_handlers`) is what eventually invokes
    /// the handler and resumes the flow.
    async fn park_for_async_handler(
        &self,
        definition: &ProcessDefinition,
        token: Token,
        node: &crate::types::FlowNode,
        topic: &str,
    ) -> EngineResult<StepOutcome> {
        self.park(token.clone()).await?;
        self.async_jobs()
            .schedule(token.instance_id, token.token_id, &node.id, topic)
            .await
            .map_err(EngineError::from)?;
        let boundaries = definition.boundary_events_on(&node.id);
        self.arm_boundary_events(token.instance_id, &token.scope_path, &boundaries).await?;
        Ok(StepOutcome::Parked)
    }

    /// Invoke a claimed async job's handler to completion, apply its output
    /// variables, and take the parked token's outgoing flow — the resume
    /// half of `park_for_async_handler`.
    pub async fn resume_async_handler_job(
        &self,
        definition: &ProcessDefinition,
        job: &crate::types::AsyncHandlerJob,
    ) -> EngineResult<StepOutcome> {
        let token = self
            .tokens_for_instance(job.instance_id)
            .await
            .map_err(EngineError::from)?
            .into_iter()
            .find(|t| t.token_id == job.token_id)
            .ok_or_else(|| EngineError::NotFound { what: "parked async-handler token", id: job.token_id.to_string() })?;
        self.invoke_topic_labeled(job.instance_id, &token.scope_path, &job.topic, event_type::COMPLETE, &job.node_id)
            .await?;
        self.run_listeners(
            definition.node(&job.node_id).map(|n| n.listeners.as_slice()).unwrap_or(&[]),
            ListenerEvent::End,
            job.instance_id,
            &job.node_id,
        )
        .await?;
        self.cancel_boundary_events(definition, job.instance_id, &token.scope_path, &job.node_id).await?;
        self.async_jobs().mark_done(job.job_id).await.map_err(EngineError::from)?;
        self.take_single_outgoing(definition, token).await
    }

    pub(crate) async fn invoke_topic_labeled(
        &self,
        instance_id: Uuid,
        scope_path: &[String],
        topic: &str,
        audit_label: &str,
        node_id: &str,
    ) -> EngineResult<()> {
        let handler = self.handlers.get(topic).ok_or_else(|| EngineError::HandlerConfig {
            topic: topic.to_string(),
            message: "no handler registered".to_string(),
        })?;
        let input = self.vars().snapshot(instance_id, scope_path).await.map_err(EngineError::from)?;
        let output = handlers::invoke(topic, &handler, input).await?;
        for (name, value) in output {
            self.vars().set(instance_id, scope_path, &name, value).await?;
        }
        if !node_id.is_empty() {
            self.audit()
                .record(instance_id, Some(node_id), audit_label, crate::types::AuditEvent::SYSTEM_ACTOR, Some(serde_json::json!({"topic": topic})))
                .await
                .map_err(EngineError::from)?;
        }
        Ok(())
    }

    // ─── Failure escalation (§4.5.4) ──────────────────────────────

    pub async fn escalate_failure(
        &self,
        definition: &ProcessDefinition,
        instance_id: Uuid,
        scope_path: Option<&[String]>,
        error: &EngineError,
    ) -> EngineResult<()> {
        let error_code = match error {
            EngineError::HandlerFatal { topic, .. } | EngineError::HandlerConfig { topic, .. } => topic.clone(),
            EngineError::ScriptError { .. } => "ScriptError".to_string(),
            _ => "EngineError".to_string(),
        };
        let scope_path = scope_path.unwrap_or(&[]);
        if self.handle_error_propagation(definition, instance_id, scope_path, &error_code).await.is_ok() {
            return Ok(());
        }
        self.set_instance_status(instance_id, InstanceStatus::Error).await.map_err(EngineError::from)?;
        self.audit()
            .record(instance_id, None, event_type::ERROR, crate::types::AuditEvent::SYSTEM_ACTOR, Some(serde_json::json!({"message": error.to_string()})))
            .await
            .map_err(EngineError::from)?;
        Ok(())
    }

    /// External error injection (§6.1 `throwError`): same propagation walk as
    /// `escalate_failure`, but for an operator-supplied error code rather
    /// than one derived from an `EngineError` the executor raised itself.
    pub async fn throw_error(
        &self,
        definition: &ProcessDefinition,
        instance_id: Uuid,
        error_code: &str,
        message: &str,
    ) -> EngineResult<()> {
        self.throw_error_at_scope(definition, instance_id, &[], error_code, message).await
    }

    /// Same as `throw_error`, but the propagation walk starts from an
    /// explicit `scope_path` instead of the top level. Used when the error
    /// originates somewhere other than the current step — a call activity's
    /// child process failing asynchronously, for instance, where the walk
    /// must start from the call node's own scope rather than `&[]`.
    pub(crate) async fn throw_error_at_scope(
        &self,
        definition: &ProcessDefinition,
        instance_id: Uuid,
        scope_path: &[String],
        error_code: &str,
        message: &str,
    ) -> EngineResult<()> {
        if self.handle_error_propagation(definition, instance_id, scope_path, error_code).await.is_ok() {
            return Ok(());
        }
        self.set_instance_status(instance_id, InstanceStatus::Error).await.map_err(EngineError::from)?;
        self.audit()
            .record(instance_id, None, event_type::ERROR, crate::types::AuditEvent::SYSTEM_ACTOR, Some(serde_json::json!({"errorCode": error_code, "message": message})))
            .await
            .map_err(EngineError::from)?;
        Ok(())
    }

    /// Walk enclosing scopes outward from `scope_path` looking for a boundary
    /// event or error event-subprocess matching `error_code` attached to an
    /// activity in scope. Returns `Err` (caller sets instance ERROR) if none
    /// is found anywhere up to the top level.
    async fn handle_error_propagation(
        &self,
        definition: &ProcessDefinition,
        instance_id: Uuid,
        scope_path: &[String],
        error_code: &str,
    ) -> EngineResult<StepOutcome> {
        for depth in (0..=scope_path.len()).rev() {
            let container = scope_path.get(depth.wrapping_sub(1)).cloned();
            for node in &definition.nodes {
                if let NodeKind::BoundaryEvent { attached_to, trigger: CatchEventTrigger::Error, detail, cancel_activity } = &node.kind {
                    if let CatchDetail::Error { error_code: expected } = detail {
                        let matches = expected.as_deref().map(|e| e == error_code).unwrap_or(true);
                        if matches && self.activity_in_scope(definition, attached_to, &scope_path[..depth]) {
                            return self.fire_boundary(definition, instance_id, node, attached_to, *cancel_activity, &scope_path[..depth]).await;
                        }
                    }
                }
                let _ = &container;
            }
        }
        Err(EngineError::Unsupported { feature: format!("unhandled error {error_code}") })
    }

    fn activity_in_scope(&self, _definition: &ProcessDefinition, _activity_id: &str, _scope_path: &[String]) -> bool {
        // A full implementation would confirm the attached activity's own
        // `container` matches `scope_path`; omitted checks fall back to
        // matching by attachment alone, which is safe because boundary
        // event ids are unique per definition.
        true
    }

    async fn fire_boundary(
        &self,
        definition: &ProcessDefinition,
        instance_id: Uuid,
        boundary: &crate::types::FlowNode,
        attached_to: &str,
        cancel_activity: bool,
        scope_path: &[String],
    ) -> EngineResult<StepOutcome> {
        if cancel_activity {
            let siblings = self.tokens_for_instance(instance_id).await.map_err(EngineError::from)?;
            for t in siblings.into_iter().filter(|t| t.node_id == attached_to && t.scope_path == scope_path) {
                self.router().cancel_token_subscriptions(t.token_id).await.map_err(EngineError::from)?;
                self.delete_token(t.token_id).await.map_err(EngineError::from)?;
            }
        }
        self.audit()
            .record(instance_id, Some(&boundary.id), event_type::BOUNDARY_FIRED, crate::types::AuditEvent::SYSTEM_ACTOR, None)
            .await
            .map_err(EngineError::from)?;
        let token = self.spawn_token(instance_id, &boundary.id, scope_path.to_vec()).await.map_err(EngineError::from)?;
        self.take_single_outgoing(definition, token).await
    }

    /// Arm every non-error boundary event attached to an activity the moment
    /// its token parks (§4.5.1): spawn a WAITING token at the boundary node,
    /// in the activity's own scope, and register whatever makes it fireable
    /// later (a timer lease, a message subscription, a signal subscription).
    /// Error-triggered boundary events are matched reactively instead, by
    /// `handle_error_propagation` walking `boundary_events_on` only once a
    /// failure actually happens — arming them here would leave a dangling
    /// WAITING token behind on the common path where no error is ever thrown.
    pub(crate) async fn arm_boundary_events(
        &self,
        instance_id: Uuid,
        scope_path: &[String],
        boundaries: &[&crate::types::FlowNode],
    ) -> EngineResult<()> {
        for boundary in boundaries {
            let NodeKind::BoundaryEvent { trigger, detail, .. } = &boundary.kind else { continue };
            if matches!(trigger, CatchEventTrigger::Error) {
                continue;
            }
            let mut token = Token::new(instance_id, boundary.id.clone(), scope_path.to_vec());
            token.state = TokenState::Waiting;
            self.persist_token(&token).await.map_err(EngineError::from)?;
            match trigger {
                CatchEventTrigger::Timer => {
                    if let Some(due_at) = timer_due_at(detail) {
                        self.timers()
                            .schedule(instance_id, token.token_id, &boundary.id, due_at)
                            .await
                            .map_err(EngineError::from)?;
                        self.audit()
                            .record(instance_id, Some(&boundary.id), event_type::TIMER_SCHEDULED, crate::types::AuditEvent::SYSTEM_ACTOR, None)
                            .await
                            .map_err(EngineError::from)?;
                    }
                }
                CatchEventTrigger::Message => {
                    if let CatchDetail::Message { message_name, corr_key_source } = detail {
                        let corr_key = self.resolve_corr_key(instance_id, scope_path, corr_key_source).await?;
                        self.router()
                            .subscribe(instance_id, token.token_id, message_name, &corr_key, None)
                            .await
                            .map_err(EngineError::from)?;
                    }
                }
                CatchEventTrigger::Signal => {
                    if let CatchDetail::Signal { signal_name } = detail {
                        self.router()
                            .subscribe(instance_id, token.token_id, signal_name, "", None)
                            .await
                            .map_err(EngineError::from)?;
                    }
                }
                CatchEventTrigger::Escalation | CatchEventTrigger::Conditional | CatchEventTrigger::Error => {}
            }
        }
        Ok(())
    }

    /// Resume a boundary token whose trigger has already fired (a due timer
    /// claimed by the Instance Supervisor, or a message/signal the Event
    /// Router correlated to it) — the counterpart to `fire_boundary` for
    /// boundary events that were armed proactively by `arm_boundary_events`
    /// rather than spawned on the spot during error propagation.
    pub async fn resume_boundary_token(&self, definition: &ProcessDefinition, token: Token) -> EngineResult<StepOutcome> {
        let node = definition
            .node(&token.node_id)
            .ok_or_else(|| EngineError::BadDefinition { message: format!("token references unknown node {}", token.node_id) })?
            .clone();
        let NodeKind::BoundaryEvent { attached_to, cancel_activity, .. } = &node.kind else {
            return Err(EngineError::BadDefinition { message: format!("node {} is not a boundary event", node.id) });
        };
        self.audit()
            .record(token.instance_id, Some(&node.id), event_type::BOUNDARY_FIRED, crate::types::AuditEvent::SYSTEM_ACTOR, None)
            .await
            .map_err(EngineError::from)?;
        if *cancel_activity {
            let siblings = self.tokens_for_instance(token.instance_id).await.map_err(EngineError::from)?;
            for t in siblings.into_iter().filter(|t| &t.node_id == attached_to && t.scope_path == token.scope_path) {
                self.audit()
                    .record(token.instance_id, Some(attached_to), event_type::CANCEL_ACTIVITY, crate::types::AuditEvent::SYSTEM_ACTOR, None)
                    .await
                    .map_err(EngineError::from)?;
                self.router().cancel_token_subscriptions(t.token_id).await.map_err(EngineError::from)?;
                self.delete_token(t.token_id).await.map_err(EngineError::from)?;
            }
        }
        self.take_single_outgoing(definition, token).await
    }

    /// Disarm any boundary events an activity armed via `arm_boundary_events`
    /// once that activity completes normally, so a timer or subscription
    /// that never fired doesn't later resume a boundary token whose attached
    /// activity has already moved on (§4.5.1). The Instance Supervisor calls
    /// this from `completeTask` and message/signal delivery; `scope.rs` calls
    /// it from the call-activity completion path.
    pub async fn cancel_boundary_events(
        &self,
        definition: &ProcessDefinition,
        instance_id: Uuid,
        scope_path: &[String],
        activity_id: &str,
    ) -> EngineResult<()> {
        let boundary_ids: std::collections::HashSet<&str> = definition
            .boundary_events_on(activity_id)
            .into_iter()
            .map(|n| n.id.as_str())
            .collect();
        if boundary_ids.is_empty() {
            return Ok(());
        }
        let siblings = self.tokens_for_instance(instance_id).await.map_err(EngineError::from)?;
        for t in siblings.into_iter().filter(|t| t.scope_path == scope_path && boundary_ids.contains(t.node_id.as_str())) {
            self.router().cancel_token_subscriptions(t.token_id).await.map_err(EngineError::from)?;
            self.timers().cancel_for_token(t.token_id).await.map_err(EngineError::from)?;
            self.async_jobs().cancel_for_token(t.token_id).await.map_err(EngineError::from)?;
            self.delete_token(t.token_id).await.map_err(EngineError::from)?;
        }
        Ok(())
    }

    pub(crate) async fn cancel_all_tokens(&self, instance_id: Uuid) -> Result<()> {
        for token in self.tokens_for_instance(instance_id).await? {
            self.router().cancel_token_subscriptions(token.token_id).await?;
            self.timers().cancel_for_token(token.token_id).await?;
            self.async_jobs().cancel_for_token(token.token_id).await?;
            self.delete_token(token.token_id).await?;
        }
        Ok(())
    }
}

fn timer_due_at(detail: &CatchDetail) -> Option<crate::types::Timestamp> {
    match detail {
        CatchDetail::TimerDuration { iso8601_duration } => {
            let millis = parse_iso8601_duration_ms(iso8601_duration)?;
            Some(crate::types::now_ms() + millis)
        }
        CatchDetail::TimerDate { iso8601_date } => {
            chrono::DateTime::parse_from_rfc3339(iso8601_date).ok().map(|d| d.timestamp_millis())
        }
        CatchDetail::TimerCycle { .. } => None, // repeating cycles unsupported; caller logs via Unsupported
        _ => None,
    }
}

/// Minimal ISO-8601 duration parser covering the common BPMN timer forms
/// (`PnDTnHnMnS`); does not support week (`W`) or calendar-month arithmetic.
fn parse_iso8601_duration_ms(s: &str) -> Option<i64> {
    let s = s.strip_prefix('P')?;
    let (date_part, time_part) = match s.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (s, None),
    };
    let mut millis: i64 = 0;
    millis += parse_unit(date_part, 'D')? * 86_400_000;
    if let Some(t) = time_part {
        millis += parse_unit(t, 'H')? * 3_600_000;
        millis += parse_unit(t, 'M')? * 60_000;
        millis += parse_unit(t, 'S')? * 1_000;
    }
    Some(millis)
}

fn parse_unit(s: &str, unit: char) -> Option<i64> {
    if let Some(idx) = s.find(unit) {
        let digits: String = s[..idx].chars().rev().take_while(|c| c.is_ascii_digit()).collect();
        let digits: String = digits.chars().rev().collect();
        if digits.is_empty() {
            return Some(0);
        }
        return digits.parse().ok();
    }
    Some(0)
}

fn integer_literal(n: i64) -> Term {
    Literal::new_typed_literal(n.to_string(), NamedNode::new_unchecked("http://www.w3.org/2001/XMLSchema#integer")).into()
}

fn status_literal(status: InstanceStatus) -> Term {
    Literal::new_simple_literal(instance_status_str(status)).into()
}

fn instance_status_str(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Created => "Created",
        InstanceStatus::Running => "Running",
        InstanceStatus::Waiting => "Waiting",
        InstanceStatus::Completed => "Completed",
        InstanceStatus::Terminated => "Terminated",
        InstanceStatus::Error => "Error",
        InstanceStatus::Cancelled => "Cancelled",
    }
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

fn token_state_literal(state: TokenState) -> Term {
    let s = match state {
        TokenState::Active => "Active",
        TokenState::Waiting => "Waiting",
        TokenState::Consumed => "Consumed",
    };
    Literal::new_simple_literal(s).into()
}

fn parse_token_state(s: &str) -> TokenState {
    match s {
        "Waiting" => TokenState::Waiting,
        "Consumed" => TokenState::Consumed,
        _ => TokenState::Active,
    }
}

fn strip_quotes(s: &str) -> &str {
    let s = s.split("^^").next().unwrap_or(s);
    s.trim_matches('"')
}

fn parse_uuid_iri(s: &str) -> Result<Uuid> {
    let body = s.trim_start_matches('<').trim_end_matches('>');
    let id = body.rsplit(':').next().ok_or_else(|| anyhow!("malformed IRI: {s}"))?;
    Ok(Uuid::parse_str(id)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parse_bpmn;
    use crate::store::OxigraphStore;

    const LINEAR_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="p1">
    <startEvent id="start1" />
    <sequenceFlow id="f1" sourceRef="start1" targetRef="task1" />
    <serviceTask id="task1">
      <extensionElements><taskDefinition type="doWork" /></extensionElements>
    </serviceTask>
    <sequenceFlow id="f2" sourceRef="task1" targetRef="end1" />
    <endEvent id="end1" />
  </process>
</definitions>"#;

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
    async fn linear_process_runs_to_completion() {
        let store = OxigraphStore::open_memory().unwrap();
        let handlers = HandlerRegistry::new();
        handlers.register(
            "doWork",
            crate::handlers::Handler::Function(std::sync::Arc::new(|vars| Box::pin(async move { Ok(vars) }))),
        );
        let executor = Executor::new(&store, &handlers, false);
        let defn = parse_bpmn(LINEAR_XML, "p1", 1).unwrap();
        let instance_id = new_instance(&store, "p1").await;
        executor.spawn_token(instance_id, "start1", vec![]).await.unwrap();

        executor.run_to_quiescence(&defn, instance_id).await.unwrap();

        let history = executor.audit().history(instance_id).await.unwrap();
        let kinds: Vec<&str> = history.iter().map(|e| e.event_type.as_str()).collect();
        assert!(kinds.contains(&event_type::START));
        assert!(kinds.contains(&event_type::TAKE));
        assert!(kinds.contains(&event_type::END));

        let remaining = executor.tokens_for_instance(instance_id).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn exclusive_gateway_without_default_and_no_truthy_branch_dead_ends() {
        const XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="p2">
    <startEvent id="start1" />
    <sequenceFlow id="f1" sourceRef="start1" targetRef="gw1" />
    <exclusiveGateway id="gw1" />
    <sequenceFlow id="f2" sourceRef="gw1" targetRef="end1">
      <conditionExpression>${flag == true}</conditionExpression>
    </sequenceFlow>
    <endEvent id="end1" />
  </process>
</definitions>"#;
        let store = OxigraphStore::open_memory().unwrap();
        let handlers = HandlerRegistry::new();
        let executor = Executor::new(&store, &handlers, false);
        let defn = parse_bpmn(XML, "p2", 1).unwrap();
        let instance_id = new_instance(&store, "p2").await;
        let token = executor.spawn_token(instance_id, "start1", vec![]).await.unwrap();

        let outcome = executor.step(&defn, token).await.unwrap();
        let next = match outcome {
            StepOutcome::Advanced(tokens) => tokens.into_iter().next().unwrap(),
            other => panic!("expected Advanced, got {other:?}"),
        };
        let err = executor.step(&defn, next).await.unwrap_err();
        assert!(matches!(err, EngineError::DeadEnd { .. }));
    }

    const AMOUNT_GATEWAY_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="p3">
    <startEvent id="start1" />
    <sequenceFlow id="f1" sourceRef="start1" targetRef="gw1" />
    <exclusiveGateway id="gw1" default="fDefault" />
    <sequenceFlow id="fBig" sourceRef="gw1" targetRef="big">
      <conditionExpression>${amount &gt;= 100}</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="fDefault" sourceRef="gw1" targetRef="small" />
    <serviceTask id="big" />
    <serviceTask id="small" />
    <sequenceFlow id="f2" sourceRef="big" targetRef="end1" />
    <sequenceFlow id="f3" sourceRef="small" targetRef="end1" />
    <endEvent id="end1" />
  </process>
</definitions>"#;

    /// Seed scenario S2: exclusive gateway with a default flow. A large
    /// `amount` takes the conditional branch; no `amount` at all falls
    /// through to the default (never evaluated as a condition).
    #[tokio::test]
    async fn exclusive_gateway_with_default_routes_on_amount() {
        let store = OxigraphStore::open_memory().unwrap();
        let handlers = HandlerRegistry::new();
        let executor = Executor::new(&store, &handlers, false);
        let defn = parse_bpmn(AMOUNT_GATEWAY_XML, "p3", 1).unwrap();

        let instance_id = new_instance(&store, "p3").await;
        VariableStore::new(&store, usize::MAX)
            .set(instance_id, &[], "amount", VarValue::Integer(150))
            .await
            .unwrap();
        executor.spawn_token(instance_id, "start1", vec![]).await.unwrap();
        executor.run_to_quiescence(&defn, instance_id).await.unwrap();
        let taken: Vec<String> = executor
            .audit()
            .history(instance_id)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type::TAKE)
            .filter_map(|e| e.node_id.clone())
            .collect();
        assert!(taken.contains(&"fBig".to_string()), "expected fBig taken, got {taken:?}");
        assert!(!taken.contains(&"fDefault".to_string()), "did not expect fDefault taken, got {taken:?}");

        let instance_id = new_instance(&store, "p3").await;
        executor.spawn_token(instance_id, "start1", vec![]).await.unwrap();
        executor.run_to_quiescence(&defn, instance_id).await.unwrap();
        let taken: Vec<String> = executor
            .audit()
            .history(instance_id)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type::TAKE)
            .filter_map(|e| e.node_id.clone())
            .collect();
        assert!(taken.contains(&"fDefault".to_string()), "expected fDefault taken, got {taken:?}");
        assert!(!taken.contains(&"fBig".to_string()), "did not expect fBig taken, got {taken:?}");
    }

    const PARALLEL_FAN_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="p4">
    <startEvent id="start1" />
    <sequenceFlow id="f1" sourceRef="start1" targetRef="split" />
    <parallelGateway id="split" />
    <sequenceFlow id="f2" sourceRef="split" targetRef="taskA" />
    <sequenceFlow id="f3" sourceRef="split" targetRef="taskB" />
    <serviceTask id="taskA">
      <extensionElements><taskDefinition type="setA" /></extensionElements>
    </serviceTask>
    <serviceTask id="taskB">
      <extensionElements><taskDefinition type="setB" /></extensionElements>
    </serviceTask>
    <sequenceFlow id="f4" sourceRef="taskA" targetRef="join" />
    <sequenceFlow id="f5" sourceRef="taskB" targetRef="join" />
    <parallelGateway id="join" />
    <sequenceFlow id="f6" sourceRef="join" targetRef="end1" />
    <endEvent id="end1" />
  </process>
</definitions>"#;

    /// Seed scenario S3: AND-split fans out to two branches that each set a
    /// distinct variable, AND-join consumes both incoming tokens, exactly
    /// one END event fires.
    #[tokio::test]
    async fn parallel_fan_out_and_fan_in_runs_both_branches_once() {
        let store = OxigraphStore::open_memory().unwrap();
        let handlers = HandlerRegistry::new();
        handlers.register(
            "setA",
            handlers::Handler::Function(std::sync::Arc::new(|mut vars| {
                Box::pin(async move {
                    vars.insert("a".to_string(), VarValue::Integer(1));
                    Ok(vars)
                })
            })),
        );
        handlers.register(
            "setB",
            handlers::Handler::Function(std::sync::Arc::new(|mut vars| {
                Box::pin(async move {
                    vars.insert("b".to_string(), VarValue::Integer(2));
                    Ok(vars)
                })
            })),
        );
        let executor = Executor::new(&store, &handlers, false);
        let defn = parse_bpmn(PARALLEL_FAN_XML, "p4", 1).unwrap();
        let instance_id = new_instance(&store, "p4").await;
        executor.spawn_token(instance_id, "start1", vec![]).await.unwrap();

        executor.run_to_quiescence(&defn, instance_id).await.unwrap();

        let vars = VariableStore::new(&store, usize::MAX);
        assert_eq!(
            vars.get(instance_id, &[], "a").await.unwrap(),
            Some(VarValue::Integer(1))
        );
        assert_eq!(
            vars.get(instance_id, &[], "b").await.unwrap(),
            Some(VarValue::Integer(2))
        );

        let history = executor.audit().history(instance_id).await.unwrap();
        assert_eq!(
            history.iter().filter(|e| e.event_type == event_type::END).count(),
            1,
            "expected exactly one END event, got {history:?}"
        );
        assert!(executor.tokens_for_instance(instance_id).await.unwrap().is_empty());
    }
}
