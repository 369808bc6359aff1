//! Instance Supervisor (design §4.9, "C9").
//!
//! Owns the one piece of state the rest of the engine deliberately has no
//! access to: the per-instance serialization lock named in §5's concurrency
//! model ("different instances run fully in parallel; within one instance,
//! steps are serialized"). Everything else here is a thin, lock-holding
//! wrapper around primitives `executor.rs`, `scope.rs`, `compiler.rs`, and
//! the typed stores already expose — the supervisor's job is sequencing,
//! not mechanism.
//!
//! Grounded on `bpmn-lite-core/src/vm.rs`'s `Vm` driver (the type that owns
//! a worker's scheduling loop and hands instruction pointers to
//! `executor.rs`'s `step`), generalized from "one VM owns N fibers" to "one
//! supervisor owns N instances, each single-threaded, running concurrently."

use crate::async_jobs::AsyncJobService;
use crate::audit::{event_type, AuditLog};
use crate::compiler;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::event_router::EventRouter;
use crate::executor::Executor;
use crate::handlers::HandlerRegistry;
use crate::scope;
use crate::store::{value_to_term, GraphStore, Solution};
use crate::timer::TimerService;
use crate::types::{
    now_ms, AuditEvent, DefinitionStatus, InstanceStatus, MessageSubscription, NodeKind,
    ProcessDefinition, TokenState, VarValue, Variables,
};
use crate::variables::VariableStore;
use crate::vocab;
use oxigraph::model::{Literal, NamedNode, Term};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// Drives process instances end to end: deployment, lifecycle operations,
/// and the two external re-entry points (timers, message/signal delivery)
/// that resume a parked token from outside the call that parked it.
pub struct InstanceSupervisor {
    store: Arc<dyn GraphStore>,
    handlers: HandlerRegistry,
    config: Arc<EngineConfig>,
    locks: StdMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl InstanceSupervisor {
    pub fn new(store: Arc<dyn GraphStore>, handlers: HandlerRegistry, config: Arc<EngineConfig>) -> Self {
        Self { store, handlers, config, locks: StdMutex::new(HashMap::new()) }
    }

    fn executor(&self) -> Executor<'_> {
        Executor::new(self.store.as_ref(), &self.handlers, self.config.script_tasks_enabled)
            .with_variable_max_bytes(self.config.variable_max_bytes)
    }

    /// The lock named in §5: held for the duration of any call that mutates
    /// one instance's tokens, so two external callers (an operator's
    /// `completeTask` and a timer firing at the same instant) can never step
    /// the same instance concurrently. A fresh `HashMap` entry, not a
    /// `DashMap`, because insertion itself only needs the brief
    /// `std::sync::Mutex` below — the returned `Arc` is what callers actually
    /// hold across the `.await`s that follow.
    fn lock_for(&self, instance_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(instance_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    // ─── §6.1 Control API: definitions ──────────────────────────

    /// Parses, verifies, and persists a new version of a definition. Version
    /// numbers are supervisor-assigned: one past whatever's on record for
    /// `definition_id`, so a redeploy never collides with or shadows an
    /// earlier version a running instance may still reference.
    pub async fn deploy_definition(&self, definition_id: &str, xml: &str) -> EngineResult<(String, u32)> {
        let existing = compiler::list_definitions(self.store.as_ref()).await.map_err(EngineError::from)?;
        let next_version = existing
            .iter()
            .filter(|(id, _, _)| id == definition_id)
            .map(|(_, v, _)| *v)
            .max()
            .unwrap_or(0)
            + 1;
        let defn = compiler::parse_bpmn(xml, definition_id, next_version).map_err(EngineError::from)?;
        compiler::verify_or_err(&defn).map_err(EngineError::from)?;
        compiler::persist_definition(self.store.as_ref(), &defn).await.map_err(EngineError::from)?;
        Ok((definition_id.to_string(), next_version))
    }

    pub async fn list_definitions(&self) -> EngineResult<Vec<(String, u32, DefinitionStatus)>> {
        compiler::list_definitions(self.store.as_ref()).await.map_err(EngineError::from)
    }

    pub async fn get_definition(&self, definition_id: &str, version: u32) -> EngineResult<Option<ProcessDefinition>> {
        compiler::load_definition(self.store.as_ref(), definition_id, version).await.map_err(EngineError::from)
    }

    pub async fn retire_definition(&self, definition_id: &str, version: u32) -> EngineResult<()> {
        compiler::retire_definition(self.store.as_ref(), definition_id, version).await.map_err(EngineError::from)
    }

    /// §6.1 `testTopic`: runs a handler against caller-supplied variables with
    /// no instance, token, or named-graph write involved at all —
    /// `HandlerRegistry::test` already is this operation.
    pub async fn test_topic(&self, topic: &str, input: Variables) -> EngineResult<Variables> {
        self.handlers.test(topic, input).await
    }

    // ─── §6.1 Control API: instance lifecycle ───────────────────

    /// §4.9 `start`: resolves the definition (latest Active version unless
    /// pinned), creates the instance row, seeds initial variables, spawns one
    /// token at the chosen start event, and runs to quiescence before
    /// returning — so a caller that gets an `instanceId` back knows the
    /// instance has already progressed as far as it can without external
    /// input.
    pub async fn start(
        &self,
        definition_id: &str,
        version: Option<u32>,
        initial_variables: Variables,
        start_event_id: Option<&str>,
    ) -> EngineResult<Uuid> {
        let version = match version {
            Some(v) => v,
            None => compiler::resolve_active_version(self.store.as_ref(), definition_id)
                .await
                .map_err(EngineError::from)?
                .ok_or_else(|| EngineError::NotFound { what: "active definition", id: definition_id.to_string() })?,
        };
        let defn = compiler::load_definition(self.store.as_ref(), definition_id, version)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::NotFound { what: "definition", id: format!("{definition_id}:{version}") })?;
        if defn.status == DefinitionStatus::Retired {
            return Err(EngineError::PreconditionFailed {
                message: format!("definition {definition_id} v{version} is retired"),
            });
        }

        let start_node_id = match start_event_id {
            Some(id) => {
                let node = defn
                    .node(id)
                    .ok_or_else(|| EngineError::BadDefinition { message: format!("start event {id} not found") })?;
                if !matches!(node.kind, NodeKind::StartEvent { .. }) {
                    return Err(EngineError::BadDefinition { message: format!("{id} is not a start event") });
                }
                id.to_string()
            }
            None => {
                let starts: Vec<_> = defn
                    .nodes
                    .iter()
                    .filter(|n| matches!(n.kind, NodeKind::StartEvent { .. }) && n.container.is_none())
                    .collect();
                match starts.as_slice() {
                    [one] => one.id.clone(),
                    [] => return Err(EngineError::BadDefinition { message: "process has no start event".into() }),
                    _ => {
                        return Err(EngineError::PreconditionFailed {
                            message: "process has multiple start events; startEventId is required".into(),
                        })
                    }
                }
            }
        };

        self.create_and_run(&defn, definition_id, version, &start_node_id, initial_variables).await
    }

    /// Shared instance-creation body behind both the operator-facing `start`
    /// and message-start-event instantiation: create the instance row, seed
    /// variables, spawn one token at `start_node_id`, and run to quiescence.
    async fn create_and_run(
        &self,
        defn: &ProcessDefinition,
        definition_id: &str,
        version: u32,
        start_node_id: &str,
        initial_variables: Variables,
    ) -> EngineResult<Uuid> {
        let instance_id = Uuid::now_v7();
        let now = now_ms();
        let subject = vocab::iri("inst", instance_id);
        let fields = vec![
            (vocab::pred::RDF_TYPE, Term::from(NamedNode::new_unchecked(vocab::class::PROCESS_INSTANCE))),
            (vocab::pred::DEFINITION_REF, Literal::new_simple_literal(definition_id).into()),
            (vocab::pred::DEFINITION_VERSION, integer_literal(version as i64)),
            (vocab::pred::STATUS, Literal::new_simple_literal("Running").into()),
            (vocab::pred::CREATED_AT, value_to_term(&VarValue::DateTime(now))),
            (vocab::pred::UPDATED_AT, value_to_term(&VarValue::DateTime(now))),
        ];
        self.store.put_subject(vocab::graph::INST, &subject, fields).await.map_err(EngineError::from)?;

        let guard = self.lock_for(instance_id);
        let _g = guard.lock().await;

        let vars = VariableStore::new(self.store.as_ref(), self.config.variable_max_bytes);
        for (name, value) in initial_variables {
            vars.set(instance_id, &[], &name, value).await?;
        }

        let executor = self.executor();
        executor.spawn_token(instance_id, start_node_id, vec![]).await.map_err(EngineError::from)?;
        executor.run_to_quiescence(defn, instance_id).await?;
        Ok(instance_id)
    }

    /// §4.9 `stop`: cancels every outstanding token and due timer, and sets
    /// the instance's terminal status. Idempotent — stopping an
    /// already-terminal instance is a no-op rather than an error, since a
    /// caller racing a natural completion shouldn't have to check first.
    pub async fn stop(&self, instance_id: Uuid, reason: &str) -> EngineResult<()> {
        let guard = self.lock_for(instance_id);
        let _g = guard.lock().await;

        let current = scope::instance_status(self.store.as_ref(), instance_id).await.map_err(EngineError::from)?;
        match current {
            None => return Err(EngineError::NotFound { what: "instance", id: instance_id.to_string() }),
            Some(s) if s.is_terminal() => return Ok(()),
            _ => {}
        }

        let executor = self.executor();
        let timers = TimerService::new(self.store.as_ref(), self.config.timer_lease_ttl_ms);
        for token in executor.tokens_for_instance(instance_id).await.map_err(EngineError::from)? {
            timers.cancel_for_token(token.token_id).await.map_err(EngineError::from)?;
        }
        executor.cancel_all_tokens(instance_id).await.map_err(EngineError::from)?;

        self.set_status(instance_id, InstanceStatus::Terminated).await?;
        AuditLog::new(self.store.as_ref())
            .record(
                instance_id,
                None,
                event_type::TERMINATE,
                AuditEvent::SYSTEM_ACTOR,
                Some(serde_json::json!({"reason": reason})),
            )
            .await
            .map_err(EngineError::from)?;
        Ok(())
    }

    async fn set_status(&self, instance_id: Uuid, status: InstanceStatus) -> EngineResult<()> {
        let subject = vocab::iri("inst", instance_id);
        self.store
            .replace_predicate(vocab::graph::INST, &subject, vocab::pred::STATUS, Some(status_term(status)))
            .await
            .map_err(EngineError::from)?;
        if status.is_terminal() {
            self.store
                .replace_predicate(
                    vocab::graph::INST,
                    &subject,
                    vocab::pred::COMPLETED_AT,
                    Some(value_to_term(&VarValue::DateTime(now_ms()))),
                )
                .await
                .map_err(EngineError::from)?;
        }
        Ok(())
    }

    pub async fn set_variable(&self, instance_id: Uuid, name: &str, value: VarValue) -> EngineResult<()> {
        let guard = self.lock_for(instance_id);
        let _g = guard.lock().await;
        VariableStore::new(self.store.as_ref(), self.config.variable_max_bytes)
            .set(instance_id, &[], name, value)
            .await
    }

    pub async fn get_variable(&self, instance_id: Uuid, name: &str) -> EngineResult<Option<VarValue>> {
        let guard = self.lock_for(instance_id);
        let _g = guard.lock().await;
        VariableStore::new(self.store.as_ref(), self.config.variable_max_bytes)
            .get(instance_id, &[], name)
            .await
            .map_err(EngineError::from)
    }

    /// §4.9 `throwError`: operator-supplied error injection, same
    /// propagation walk a `ScriptError`/`HandlerFatal` would trigger
    /// internally.
    pub async fn throw_error(&self, instance_id: Uuid, error_code: &str, message: &str) -> EngineResult<()> {
        let guard = self.lock_for(instance_id);
        let _g = guard.lock().await;
        let (_, _, defn) = self.instance_definition(instance_id).await?;
        let executor = self.executor();
        executor.throw_error(&defn, instance_id, error_code, message).await?;
        executor.run_to_quiescence(&defn, instance_id).await?;
        drop(_g);
        self.cascade_to_parent(instance_id).await
    }

    // ─── §6.1 Control API: user tasks ───────────────────────────

    pub async fn claim_task(&self, task_id: Uuid, assignee: &str) -> EngineResult<()> {
        let subject = vocab::iri("task", task_id);
        let query = format!(
            "SELECT ?inst ?status WHERE {{ <{subject}> <{inst_pred}> ?inst . <{subject}> <{status_pred}> ?status }}",
            inst_pred = vocab::pred::TASK_INSTANCE,
            status_pred = vocab::pred::TASK_STATUS,
        );
        let row = self.query_one(vocab::graph::TASKS, &query, "user task", &task_id.to_string()).await?;
        let instance_id = parse_uuid_iri(field(&row, "inst")?)?;
        let status = strip_quotes(field(&row, "status")?);

        let guard = self.lock_for(instance_id);
        let _g = guard.lock().await;
        if status != "Created" {
            return Err(EngineError::PreconditionFailed {
                message: format!("task {task_id} is not claimable (status {status})"),
            });
        }

        self.store
            .replace_predicate(vocab::graph::TASKS, &subject, vocab::pred::ASSIGNEE, Some(Literal::new_simple_literal(assignee).into()))
            .await
            .map_err(EngineError::from)?;
        self.store
            .replace_predicate(
                vocab::graph::TASKS,
                &subject,
                vocab::pred::CLAIMED_AT,
                Some(value_to_term(&VarValue::DateTime(now_ms()))),
            )
            .await
            .map_err(EngineError::from)?;
        self.store
            .replace_predicate(vocab::graph::TASKS, &subject, vocab::pred::TASK_STATUS, Some(Literal::new_simple_literal("Claimed").into()))
            .await
            .map_err(EngineError::from)?;
        AuditLog::new(self.store.as_ref())
            .record(instance_id, None, event_type::TASK_CLAIM, assignee, Some(serde_json::json!({"taskId": task_id.to_string()})))
            .await
            .map_err(EngineError::from)?;
        Ok(())
    }

    /// §4.9 `completeTask`: applies the submitted variables at the task's
    /// token scope, disarms any boundary events still armed on the activity,
    /// and resumes the waiting token along its one outgoing flow.
    pub async fn complete_task(&self, task_id: Uuid, variables: Variables) -> EngineResult<()> {
        let subject = vocab::iri("task", task_id);
        let query = format!(
            "SELECT ?inst ?node ?token ?status WHERE {{ <{subject}> <{inst_pred}> ?inst . <{subject}> <{node_pred}> ?node . <{subject}> <{token_pred}> ?token . <{subject}> <{status_pred}> ?status }}",
            inst_pred = vocab::pred::TASK_INSTANCE,
            node_pred = vocab::pred::TASK_NODE,
            token_pred = vocab::pred::TASK_TOKEN,
            status_pred = vocab::pred::TASK_STATUS,
        );
        let row = self.query_one(vocab::graph::TASKS, &query, "user task", &task_id.to_string()).await?;
        let instance_id = parse_uuid_iri(field(&row, "inst")?)?;
        let node_id = strip_quotes(field(&row, "node")?).to_string();
        let token_id = parse_uuid_iri(field(&row, "token")?)?;
        let status = strip_quotes(field(&row, "status")?).to_string();
        if status == "Completed" {
            return Err(EngineError::PreconditionFailed {
                message: format!("task {task_id} is already completed"),
            });
        }

        let guard = self.lock_for(instance_id);
        let _g = guard.lock().await;

        let (_, _, defn) = self.instance_definition(instance_id).await?;
        let executor = self.executor();
        let tokens = executor.tokens_for_instance(instance_id).await.map_err(EngineError::from)?;
        let mut token = tokens
            .into_iter()
            .find(|t| t.token_id == token_id)
            .ok_or_else(|| EngineError::NotFound { what: "waiting user-task token", id: token_id.to_string() })?;

        let vars = VariableStore::new(self.store.as_ref(), self.config.variable_max_bytes);
        for (name, value) in variables {
            vars.set(instance_id, &token.scope_path, &name, value).await?;
        }

        self.store
            .replace_predicate(vocab::graph::TASKS, &subject, vocab::pred::TASK_STATUS, Some(Literal::new_simple_literal("Completed").into()))
            .await
            .map_err(EngineError::from)?;
        self.store
            .replace_predicate(
                vocab::graph::TASKS,
                &subject,
                vocab::pred::TASK_COMPLETED_AT,
                Some(value_to_term(&VarValue::DateTime(now_ms()))),
            )
            .await
            .map_err(EngineError::from)?;
        AuditLog::new(self.store.as_ref())
            .record(instance_id, Some(&node_id), event_type::TASK_COMPLETE, AuditEvent::SYSTEM_ACTOR, Some(serde_json::json!({"taskId": task_id.to_string()})))
            .await
            .map_err(EngineError::from)?;

        executor.cancel_boundary_events(&defn, instance_id, &token.scope_path, &node_id).await?;
        token.state = TokenState::Active;
        executor.take_single_outgoing(&defn, token).await?;
        executor.run_to_quiescence(&defn, instance_id).await?;
        drop(_g);
        self.cascade_to_parent(instance_id).await
    }

    // ─── §6.2 timer sweep ────────────────────────────────────────

    /// §4.9 `run_due_timers`: claims whatever's due as of `now` and resumes
    /// each one's token — boundary-event jobs through the arm/resume/disarm
    /// path, everything else (plain `IntermediateCatchEvent`/event-based
    /// gateway waits) by just taking the node's one outgoing flow. Returns
    /// how many jobs were actually resumed.
    pub async fn run_due_timers(&self, now: i64) -> EngineResult<usize> {
        let worker_id = format!("worker-{}", Uuid::now_v7());
        let timers = TimerService::new(self.store.as_ref(), self.config.timer_lease_ttl_ms);
        let jobs = timers.claim_due(&worker_id, now).await.map_err(EngineError::from)?;

        let mut fired = 0usize;
        for job in jobs {
            let guard = self.lock_for(job.instance_id);
            let _g = guard.lock().await;

            let (_, _, defn) = self.instance_definition(job.instance_id).await?;
            let executor = self.executor();
            let Some(node) = defn.node(&job.target_node).cloned() else {
                timers.mark_fired(job.timer_id).await.map_err(EngineError::from)?;
                continue;
            };
            let tokens = executor.tokens_for_instance(job.instance_id).await.map_err(EngineError::from)?;
            let Some(token) = tokens.into_iter().find(|t| t.token_id == job.token_id) else {
                timers.mark_fired(job.timer_id).await.map_err(EngineError::from)?;
                continue;
            };

            AuditLog::new(self.store.as_ref())
                .record(job.instance_id, Some(&job.target_node), event_type::TIMER_FIRED, AuditEvent::SYSTEM_ACTOR, None)
                .await
                .map_err(EngineError::from)?;

            if matches!(node.kind, NodeKind::BoundaryEvent { .. }) {
                executor.resume_boundary_token(&defn, token).await?;
            } else {
                let mut token = token;
                token.state = TokenState::Active;
                executor.take_single_outgoing(&defn, token).await?;
            }
            timers.mark_fired(job.timer_id).await.map_err(EngineError::from)?;
            executor.run_to_quiescence(&defn, job.instance_id).await?;
            drop(_g);
            self.cascade_to_parent(job.instance_id).await?;
            fired += 1;
        }
        Ok(fired)
    }

    // ─── async HTTP handler sweep (§4.4) ──────────────────────────

    /// Claims whatever async-handler jobs are pending and resumes each one's
    /// parked token — the same claim/fire/cascade shape `run_due_timers`
    /// uses, since both are "a token waiting on something the poll loop
    /// drives to completion on its behalf." A handler invocation failure
    /// drops the job and escalates the error from the instance's root scope,
    /// same as any other service-task failure.
    pub async fn run_pending_async_handlers(&self, now: i64) -> EngineResult<usize> {
        let worker_id = format!("worker-{}", Uuid::now_v7());
        let jobs_service = AsyncJobService::new(self.store.as_ref(), self.config.timer_lease_ttl_ms);
        let jobs = jobs_service.claim_pending(&worker_id, now).await.map_err(EngineError::from)?;

        let mut resumed = 0usize;
        for job in jobs {
            let guard = self.lock_for(job.instance_id);
            let _g = guard.lock().await;

            let (_, _, defn) = self.instance_definition(job.instance_id).await?;
            let executor = self.executor();
            match executor.resume_async_handler_job(&defn, &job).await {
                Ok(_) => {
                    executor.run_to_quiescence(&defn, job.instance_id).await?;
                }
                Err(e) => {
                    jobs_service.mark_done(job.job_id).await.map_err(EngineError::from)?;
                    executor.escalate_failure(&defn, job.instance_id, None, &e).await?;
                }
            }
            drop(_g);
            self.cascade_to_parent(job.instance_id).await?;
            resumed += 1;
        }
        Ok(resumed)
    }

    // ─── message / signal delivery ──────────────────────────────

    /// Resolves one waiting subscription (if any) by FIFO and resumes its
    /// token. If nothing is waiting, falls back to the message-start-event
    /// instantiation path (§4.7). Returns whether the message was consumed
    /// by either path.
    pub async fn correlate_message(&self, message_name: &str, corr_key: &str) -> EngineResult<bool> {
        let router = EventRouter::new(self.store.as_ref());
        if let Some(sub) = router.correlate_message(message_name, corr_key).await.map_err(EngineError::from)? {
            self.resolve_subscription(sub).await?;
            return Ok(true);
        }
        self.instantiate_from_message(message_name).await
    }

    /// §4.7: an unmatched message to a registered message-start event
    /// creates a new instance of the defining process. Scans every deployed
    /// Active definition's top-level start events for one whose message
    /// name matches; the first hit (by definition id, then version) wins.
    /// The new instance starts with no variables — message correlation
    /// carries only a name and a correlation key, never a payload.
    async fn instantiate_from_message(&self, message_name: &str) -> EngineResult<bool> {
        for (definition_id, version, status) in compiler::list_definitions(self.store.as_ref()).await.map_err(EngineError::from)? {
            if status != DefinitionStatus::Active {
                continue;
            }
            let Some(defn) = compiler::load_definition(self.store.as_ref(), &definition_id, version).await.map_err(EngineError::from)? else {
                continue;
            };
            let matched = defn.nodes.iter().find(|n| {
                n.container.is_none()
                    && matches!(&n.kind, NodeKind::StartEvent { message_name: Some(name) } if name == message_name)
            });
            if let Some(node) = matched {
                let start_node_id = node.id.clone();
                self.create_and_run(&defn, &definition_id, version, &start_node_id, Variables::new()).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Resolves every waiter subscribed to `signal_name`, returning the
    /// count resumed.
    pub async fn broadcast_signal(&self, signal_name: &str) -> EngineResult<usize> {
        let router = EventRouter::new(self.store.as_ref());
        let subs = router.broadcast_signal(signal_name).await.map_err(EngineError::from)?;
        let n = subs.len();
        for sub in subs {
            self.resolve_subscription(sub).await?;
        }
        Ok(n)
    }

    async fn resolve_subscription(&self, sub: MessageSubscription) -> EngineResult<()> {
        let guard = self.lock_for(sub.instance_id);
        let _g = guard.lock().await;

        let (_, _, defn) = self.instance_definition(sub.instance_id).await?;
        let executor = self.executor();
        let tokens = executor.tokens_for_instance(sub.instance_id).await.map_err(EngineError::from)?;
        let Some(token) = tokens.into_iter().find(|t| t.token_id == sub.token_id) else {
            return Ok(());
        };

        if let Some(race_group) = &sub.race_group {
            EventRouter::new(self.store.as_ref())
                .cancel_race_group(race_group, sub.subscription_id)
                .await
                .map_err(EngineError::from)?;
        }

        let node_kind = defn.node(&token.node_id).map(|n| n.kind.clone());
        AuditLog::new(self.store.as_ref())
            .record(sub.instance_id, Some(&token.node_id), event_type::MESSAGE_CORRELATED, AuditEvent::SYSTEM_ACTOR, None)
            .await
            .map_err(EngineError::from)?;

        if matches!(node_kind, Some(NodeKind::BoundaryEvent { .. })) {
            executor.resume_boundary_token(&defn, token).await?;
        } else {
            let mut token = token;
            token.state = TokenState::Active;
            executor.take_single_outgoing(&defn, token).await?;
        }
        executor.run_to_quiescence(&defn, sub.instance_id).await?;
        drop(_g);
        self.cascade_to_parent(sub.instance_id).await
    }

    // ─── call-activity completion cascade ───────────────────────

    /// Whenever an instance reaches a terminal status from outside its own
    /// synchronous call-activity kickoff (§4.6's fast path handles the
    /// common case inline), the parent that's waiting on it needs resuming
    /// too — and that resume can itself complete a grandparent, and so on.
    /// `Pin<Box<..>>` because async fns can't recurse directly.
    fn cascade_to_parent(&self, instance_id: Uuid) -> Pin<Box<dyn Future<Output = EngineResult<()>> + Send + '_>> {
        Box::pin(async move {
            let Some(status) = scope::instance_status(self.store.as_ref(), instance_id).await.map_err(EngineError::from)? else {
                return Ok(());
            };
            if !status.is_terminal() {
                return Ok(());
            }
            let Some(link) = scope::parent_link(self.store.as_ref(), instance_id).await.map_err(EngineError::from)? else {
                return Ok(());
            };
            let guard = self.lock_for(link.parent_instance_id);
            let _g = guard.lock().await;
            let (_, _, parent_defn) = self.instance_definition(link.parent_instance_id).await?;
            let executor = self.executor();
            scope::complete_call_activity(
                &executor,
                &parent_defn,
                link.parent_instance_id,
                &link.parent_call_node,
                instance_id,
                status,
            )
            .await?;
            executor.run_to_quiescence(&parent_defn, link.parent_instance_id).await?;
            drop(_g);
            self.cascade_to_parent(link.parent_instance_id).await
        })
    }

    // ─── shared lookups ──────────────────────────────────────────

    async fn instance_definition(&self, instance_id: Uuid) -> EngineResult<(String, u32, ProcessDefinition)> {
        let query = format!(
            "SELECT ?id ?v WHERE {{ <{inst_iri}> <{def_ref}> ?id . <{inst_iri}> <{def_ver}> ?v }}",
            inst_iri = vocab::iri("inst", instance_id),
            def_ref = vocab::pred::DEFINITION_REF,
            def_ver = vocab::pred::DEFINITION_VERSION,
        );
        let row = self.query_one(vocab::graph::INST, &query, "instance", &instance_id.to_string()).await?;
        let id = strip_quotes(field(&row, "id")?).to_string();
        let version: u32 = strip_quotes(field(&row, "v")?)
            .parse()
            .map_err(|_| EngineError::StoreError(format!("instance {instance_id} has non-numeric definitionVersion")))?;
        let defn = compiler::load_definition(self.store.as_ref(), &id, version)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::NotFound { what: "definition", id: format!("{id}:{version}") })?;
        Ok((id, version, defn))
    }

    async fn query_one(&self, graph: &str, sparql: &str, what: &'static str, id: &str) -> EngineResult<Solution> {
        let results = self.store.query(graph, sparql).await.map_err(EngineError::from)?;
        results
            .as_solutions()
            .map_err(EngineError::from)?
            .first()
            .cloned()
            .ok_or_else(|| EngineError::NotFound { what, id: id.to_string() })
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
    Uuid::parse_str(id).map_err(|e| EngineError::StoreError(format!("malformed instance IRI {s}: {e}")))
}

fn integer_literal(n: i64) -> Term {
    Literal::new_typed_literal(n.to_string(), NamedNode::new_unchecked("http://www.w3.org/2001/XMLSchema#integer")).into()
}

fn status_term(status: InstanceStatus) -> Term {
    let s = match status {
        InstanceStatus::Created => "Created",
        InstanceStatus::Running => "Running",
        InstanceStatus::Waiting => "Waiting",
        InstanceStatus::Completed => "Completed",
        InstanceStatus::Terminated => "Terminated",
        InstanceStatus::Error => "Error",
        InstanceStatus::Cancelled => "Cancelled",
    };
    Literal::new_simple_literal(s).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::Handler;
    use crate::store::OxigraphStore;
    use std::sync::Arc as StdArc;

    fn supervisor() -> InstanceSupervisor {
        let store: Arc<dyn GraphStore> = StdArc::new(OxigraphStore::open_memory().unwrap());
        InstanceSupervisor::new(store, HandlerRegistry::new(), Arc::new(EngineConfig::default()))
    }

    const USER_TASK_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="approval">
    <startEvent id="start1" />
    <sequenceFlow id="f1" sourceRef="start1" targetRef="review" />
    <userTask id="review" />
    <sequenceFlow id="f2" sourceRef="review" targetRef="end1" />
    <endEvent id="end1" />
  </process>
</definitions>"#;

    #[tokio::test]
    async fn deploy_start_and_complete_task_runs_to_completion() {
        let sup = supervisor();
        let (definition_id, version) = sup.deploy_definition("approval", USER_TASK_XML).await.unwrap();
        assert_eq!(version, 1);

        let instance_id = sup.start(&definition_id, None, Variables::new(), None).await.unwrap();
        let status = scope::instance_status(sup.store.as_ref(), instance_id).await.unwrap().unwrap();
        assert_eq!(status, InstanceStatus::Waiting);

        let query = format!(
            "SELECT ?t WHERE {{ ?t <{inst_pred}> <{inst_iri}> }}",
            inst_pred = vocab::pred::TASK_INSTANCE,
            inst_iri = vocab::iri("inst", instance_id),
        );
        let results = sup.store.query(vocab::graph::TASKS, &query).await.unwrap();
        let row = results.as_solutions().unwrap().first().cloned().unwrap();
        let task_id = parse_uuid_iri(row.get("t").unwrap()).unwrap();

        let mut vars = Variables::new();
        vars.insert("decision".to_string(), VarValue::String("approved".to_string()));
        sup.complete_task(task_id, vars).await.unwrap();

        let status = scope::instance_status(sup.store.as_ref(), instance_id).await.unwrap().unwrap();
        assert_eq!(status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn stop_is_idempotent_on_a_terminal_instance() {
        const XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="linear">
    <startEvent id="start1" />
    <sequenceFlow id="f1" sourceRef="start1" targetRef="end1" />
    <endEvent id="end1" />
  </process>
</definitions>"#;
        let sup = supervisor();
        let (definition_id, _) = sup.deploy_definition("linear", XML).await.unwrap();
        let instance_id = sup.start(&definition_id, None, Variables::new(), None).await.unwrap();
        assert_eq!(
            scope::instance_status(sup.store.as_ref(), instance_id).await.unwrap().unwrap(),
            InstanceStatus::Completed
        );

        sup.stop(instance_id, "operator request").await.unwrap();
        assert_eq!(
            scope::instance_status(sup.store.as_ref(), instance_id).await.unwrap().unwrap(),
            InstanceStatus::Completed
        );
    }

    #[tokio::test]
    async fn retired_definition_rejects_new_instances() {
        const XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="retiree">
    <startEvent id="start1" />
    <sequenceFlow id="f1" sourceRef="start1" targetRef="end1" />
    <endEvent id="end1" />
  </process>
</definitions>"#;
        let sup = supervisor();
        let (definition_id, version) = sup.deploy_definition("retiree", XML).await.unwrap();
        sup.retire_definition(&definition_id, version).await.unwrap();

        let err = sup.start(&definition_id, Some(version), Variables::new(), None).await.unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn run_due_timers_resumes_a_boundary_timer_on_a_user_task() {
        const XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="escalated">
    <startEvent id="start1" />
    <sequenceFlow id="f1" sourceRef="start1" targetRef="review" />
    <userTask id="review" />
    <boundaryEvent id="timeout" attachedToRef="review" cancelActivity="true">
      <timerEventDefinition><timeDuration>PT1H</timeDuration></timerEventDefinition>
    </boundaryEvent>
    <sequenceFlow id="f2" sourceRef="review" targetRef="end1" />
    <sequenceFlow id="f3" sourceRef="timeout" targetRef="end2" />
    <endEvent id="end1" />
    <endEvent id="end2" />
  </process>
</definitions>"#;
        let sup = supervisor();
        let (definition_id, _) = sup.deploy_definition("escalated", XML).await.unwrap();
        let instance_id = sup.start(&definition_id, None, Variables::new(), None).await.unwrap();
        assert_eq!(
            scope::instance_status(sup.store.as_ref(), instance_id).await.unwrap().unwrap(),
            InstanceStatus::Waiting
        );

        let fired = sup.run_due_timers(now_ms() + 3_600_000 + 1).await.unwrap();
        assert_eq!(fired, 1);
        assert_eq!(
            scope::instance_status(sup.store.as_ref(), instance_id).await.unwrap().unwrap(),
            InstanceStatus::Completed
        );
    }

    /// Seed scenario S5: an interrupting boundary timer on a waiting activity
    /// fires and cancels it before the process reaches its own end — and the
    /// audit trail must show `BOUNDARY_FIRED` before `CANCEL_ACTIVITY`, not
    /// the other way around. (A boundary timer on a synchronously-completing
    /// `ServiceTask` can never observe this race: `executor.rs::step` never
    /// arms boundary events on a `ServiceTask` node since nothing parks there
    /// for a timer to preempt — the cancellable window only opens once a
    /// token enters `Waiting`, e.g. a `UserTask`/`ReceiveTask`.)
    #[tokio::test]
    async fn interrupting_boundary_timer_logs_boundary_fired_before_cancel_activity() {
        const XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="escalated2">
    <startEvent id="start1" />
    <sequenceFlow id="f1" sourceRef="start1" targetRef="review" />
    <userTask id="review" />
    <boundaryEvent id="timeout" attachedToRef="review" cancelActivity="true">
      <timerEventDefinition><timeDuration>PT0S</timeDuration></timerEventDefinition>
    </boundaryEvent>
    <sequenceFlow id="f2" sourceRef="review" targetRef="end1" />
    <sequenceFlow id="f3" sourceRef="timeout" targetRef="end2" />
    <endEvent id="end1" />
    <endEvent id="end2" />
  </process>
</definitions>"#;
        let sup = supervisor();
        let (definition_id, _) = sup.deploy_definition("escalated2", XML).await.unwrap();
        let instance_id = sup.start(&definition_id, None, Variables::new(), None).await.unwrap();

        let fired = sup.run_due_timers(now_ms() + 1).await.unwrap();
        assert_eq!(fired, 1);
        assert_eq!(
            scope::instance_status(sup.store.as_ref(), instance_id).await.unwrap().unwrap(),
            InstanceStatus::Completed
        );

        let history = AuditLog::new(sup.store.as_ref()).history(instance_id).await.unwrap();
        let boundary_fired_seq = history
            .iter()
            .find(|e| e.event_type == event_type::BOUNDARY_FIRED)
            .map(|e| e.seq)
            .expect("expected a BOUNDARY_FIRED event");
        let cancel_activity_seq = history
            .iter()
            .find(|e| e.event_type == event_type::CANCEL_ACTIVITY)
            .map(|e| e.seq)
            .expect("expected a CANCEL_ACTIVITY event");
        assert!(
            boundary_fired_seq < cancel_activity_seq,
            "expected BOUNDARY_FIRED ({boundary_fired_seq}) before CANCEL_ACTIVITY ({cancel_activity_seq})"
        );

        assert_eq!(
            history.iter().filter(|e| e.event_type == event_type::END).count(),
            1,
            "expected exactly one END event, got {history:?}"
        );
    }

    #[tokio::test]
    async fn test_topic_runs_a_handler_without_touching_any_instance() {
        let sup = supervisor();
        sup.handlers.register(
            "echo",
            Handler::Function(StdArc::new(|vars| Box::pin(async move { Ok(vars) }))),
        );
        let mut input = Variables::new();
        input.insert("x".to_string(), VarValue::Integer(1));
        let out = sup.test_topic("echo", input.clone()).await.unwrap();
        assert_eq!(out, input);
    }

    /// Invariant 6 (design §8): a call activity's parent-link row exists
    /// exactly while the child it names is alive and non-terminal. The
    /// child here parks on a user task so there's an observable window
    /// where the link holds; completing that task drives
    /// `cascade_to_parent` and the link's purpose is discharged.
    #[tokio::test]
    async fn call_activity_parent_link_exists_only_while_child_is_non_terminal() {
        const CHILD_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="childApproval">
    <startEvent id="cstart" />
    <sequenceFlow id="cf1" sourceRef="cstart" targetRef="review" />
    <userTask id="review" />
    <sequenceFlow id="cf2" sourceRef="review" targetRef="cend" />
    <endEvent id="cend" />
  </process>
</definitions>"#;
        const PARENT_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="parentFlow">
    <startEvent id="pstart" />
    <sequenceFlow id="pf1" sourceRef="pstart" targetRef="callChild" />
    <callActivity id="callChild" calledElement="childApproval" />
    <sequenceFlow id="pf2" sourceRef="callChild" targetRef="pend" />
    <endEvent id="pend" />
  </process>
</definitions>"#;
        let sup = supervisor();
        sup.deploy_definition("childApproval", CHILD_XML).await.unwrap();
        let (parent_def_id, _) = sup.deploy_definition("parentFlow", PARENT_XML).await.unwrap();
        let parent_id = sup.start(&parent_def_id, None, Variables::new(), None).await.unwrap();

        assert_eq!(
            scope::instance_status(sup.store.as_ref(), parent_id).await.unwrap().unwrap(),
            InstanceStatus::Waiting
        );

        let query = format!(
            "SELECT ?inst WHERE {{ ?inst <{rdf_type}> <{class}> . ?inst <{parent}> <{parent_iri}> }}",
            rdf_type = vocab::pred::RDF_TYPE,
            class = vocab::class::PROCESS_INSTANCE,
            parent = vocab::pred::PARENT_INSTANCE,
            parent_iri = vocab::iri("inst", parent_id),
        );
        let results = sup.store.query(vocab::graph::INST, &query).await.unwrap();
        let row = results.as_solutions().unwrap().first().cloned().unwrap();
        let child_id = parse_uuid_iri(row.get("inst").unwrap()).unwrap();

        let child_status = scope::instance_status(sup.store.as_ref(), child_id).await.unwrap().unwrap();
        assert!(!child_status.is_terminal(), "child should be Waiting on its user task, got {child_status:?}");
        let link = scope::parent_link(sup.store.as_ref(), child_id).await.unwrap().expect("non-terminal child must carry a parent link");
        assert_eq!(link.parent_instance_id, parent_id);
        assert_eq!(link.parent_call_node, "callChild");

        let task_query = format!(
            "SELECT ?t WHERE {{ ?t <{inst_pred}> <{inst_iri}> }}",
            inst_pred = vocab::pred::TASK_INSTANCE,
            inst_iri = vocab::iri("inst", child_id),
        );
        let task_results = sup.store.query(vocab::graph::TASKS, &task_query).await.unwrap();
        let task_row = task_results.as_solutions().unwrap().first().cloned().unwrap();
        let task_id = parse_uuid_iri(task_row.get("t").unwrap()).unwrap();
        sup.complete_task(task_id, Variables::new()).await.unwrap();

        assert_eq!(
            scope::instance_status(sup.store.as_ref(), child_id).await.unwrap().unwrap(),
            InstanceStatus::Completed
        );
        assert_eq!(
            scope::instance_status(sup.store.as_ref(), parent_id).await.unwrap().unwrap(),
            InstanceStatus::Completed
        );
    }

    /// "completeTask(t, v); completeTask(t, v)" round-trip property
    /// (design §8): the same task id can't be completed twice.
    #[tokio::test]
    async fn completing_a_task_twice_fails_preconditionfailed_on_the_second_call() {
        let sup = supervisor();
        let (definition_id, _) = sup.deploy_definition("approval", USER_TASK_XML).await.unwrap();
        let instance_id = sup.start(&definition_id, None, Variables::new(), None).await.unwrap();

        let query = format!(
            "SELECT ?t WHERE {{ ?t <{inst_pred}> <{inst_iri}> }}",
            inst_pred = vocab::pred::TASK_INSTANCE,
            inst_iri = vocab::iri("inst", instance_id),
        );
        let results = sup.store.query(vocab::graph::TASKS, &query).await.unwrap();
        let row = results.as_solutions().unwrap().first().cloned().unwrap();
        let task_id = parse_uuid_iri(row.get("t").unwrap()).unwrap();

        sup.complete_task(task_id, Variables::new()).await.unwrap();
        let err = sup.complete_task(task_id, Variables::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed { .. }), "expected the second completeTask to fail, got {err:?}");
    }
}
