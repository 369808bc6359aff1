//! Async HTTP handler suspension (design §4.4's fifth suspension point).
//!
//! A `ServiceTask`/`SendTask` whose `HttpHandlerSpec::async_execution` is set
//! doesn't await the remote call inline: `executor.rs` parks the token and
//! records a job here instead, in the same `tasks` named graph a waiting
//! `UserTask` or `MessageSubscription` lives in. The supervisor's poll loop
//! (grounded on `timer.rs`'s claim-and-fire sweep) claims pending jobs,
//! invokes the handler to completion, and resumes the token — the "named
//! callback" the handler's response is applied through.

use crate::store::GraphStore;
use crate::types::{AsyncHandlerJob, Timestamp};
use crate::vocab;
use anyhow::{anyhow, Result};
use oxigraph::model::{Literal, NamedNode, Term};
use uuid::Uuid;

pub struct AsyncJobService<'a> {
    store: &'a dyn GraphStore,
    lease_ttl_ms: u64,
}

impl<'a> AsyncJobService<'a> {
    pub fn new(store: &'a dyn GraphStore, lease_ttl_ms: u64) -> Self {
        Self { store, lease_ttl_ms }
    }

    /// Record a pending invocation for a token that just parked.
    pub async fn schedule(&self, instance_id: Uuid, token_id: Uuid, node_id: &str, topic: &str) -> Result<AsyncHandlerJob> {
        let job_id = Uuid::now_v7();
        let subject = vocab::iri("asyncjob", job_id);
        let fields = vec![
            (vocab::pred::RDF_TYPE, Term::from(NamedNode::new_unchecked(vocab::class::ASYNC_HANDLER_JOB))),
            (
                vocab::pred::ASYNC_JOB_INSTANCE,
                Term::from(NamedNode::new_unchecked(vocab::iri("inst", instance_id))),
            ),
            (
                vocab::pred::ASYNC_JOB_TOKEN,
                Term::from(NamedNode::new_unchecked(vocab::iri("token", token_id))),
            ),
            (vocab::pred::ASYNC_JOB_NODE, Literal::new_simple_literal(node_id).into()),
            (vocab::pred::ASYNC_JOB_TOPIC, Literal::new_simple_literal(topic).into()),
            (vocab::pred::ASYNC_JOB_STATUS, Literal::new_simple_literal("Pending").into()),
        ];
        self.store.put_subject(vocab::graph::TASKS, &subject, fields).await?;
        Ok(AsyncHandlerJob {
            job_id,
            instance_id,
            token_id,
            node_id: node_id.to_string(),
            topic: topic.to_string(),
            lease_holder: None,
        })
    }

    /// Claim every unleased (or lease-expired) pending job for `worker_id`,
    /// the same compare-and-set shape `timer.rs::try_claim` uses.
    pub async fn claim_pending(&self, worker_id: &str, now: Timestamp) -> Result<Vec<AsyncHandlerJob>> {
        let candidates = self.find_pending().await?;
        let mut claimed = Vec::new();
        for job in candidates {
            if self.try_claim(&job, worker_id, now).await? {
                let mut job = job;
                job.lease_holder = Some(worker_id.to_string());
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    async fn find_pending(&self) -> Result<Vec<AsyncHandlerJob>> {
        let query = format!(
            "SELECT ?j ?inst ?token ?node ?topic ?holder ?expires WHERE {{
                ?j <{status}> \"Pending\" .
                ?j <{inst}> ?inst . ?j <{token}> ?token . ?j <{node}> ?node . ?j <{topic}> ?topic .
                OPTIONAL {{ ?j <{holder}> ?holder }}
                OPTIONAL {{ ?j <{expires}> ?expires }}
             }}",
            status = vocab::pred::ASYNC_JOB_STATUS,
            inst = vocab::pred::ASYNC_JOB_INSTANCE,
            token = vocab::pred::ASYNC_JOB_TOKEN,
            node = vocab::pred::ASYNC_JOB_NODE,
            topic = vocab::pred::ASYNC_JOB_TOPIC,
            holder = vocab::pred::LEASE_HOLDER,
            expires = vocab::pred::LEASE_EXPIRES_AT,
        );
        let results = self.store.query(vocab::graph::TASKS, &query).await?;
        let mut out = Vec::new();
        for row in results.as_solutions()? {
            out.push(AsyncHandlerJob {
                job_id: parse_uuid_iri(row.get("j").ok_or_else(|| anyhow!("missing ?j"))?)?,
                instance_id: parse_uuid_iri(row.get("inst").ok_or_else(|| anyhow!("missing ?inst"))?)?,
                token_id: parse_uuid_iri(row.get("token").ok_or_else(|| anyhow!("missing ?token"))?)?,
                node_id: strip_quotes(row.get("node").ok_or_else(|| anyhow!("missing ?node"))?).to_string(),
                topic: strip_quotes(row.get("topic").ok_or_else(|| anyhow!("missing ?topic"))?).to_string(),
                lease_holder: None,
            });
        }
        Ok(out)
    }

    async fn try_claim(&self, job: &AsyncHandlerJob, worker_id: &str, now: Timestamp) -> Result<bool> {
        let subject = vocab::iri("asyncjob", job.job_id);
        let expires_at = now + self.lease_ttl_ms as i64;
        let update = format!(
            "DELETE {{ <{subject}> <{holder}> ?oldHolder . <{subject}> <{expires}> ?oldExpires }}
             INSERT {{ <{subject}> <{holder}> \"{worker_id}\" . <{subject}> <{expires}> \"{expires_iso}\"^^xsd:dateTime }}
             WHERE {{
                <{subject}> <{status}> \"Pending\" .
                OPTIONAL {{ <{subject}> <{holder}> ?oldHolder }}
                OPTIONAL {{ <{subject}> <{expires}> ?oldExpires }}
                FILTER(!BOUND(?oldHolder) || ?oldExpires < \"{now_iso}\"^^xsd:dateTime)
             }}",
            holder = vocab::pred::LEASE_HOLDER,
            expires = vocab::pred::LEASE_EXPIRES_AT,
            status = vocab::pred::ASYNC_JOB_STATUS,
            expires_iso = crate::types::to_iso8601(expires_at),
            now_iso = crate::types::to_iso8601(now),
        );
        self.store.update(vocab::graph::TASKS, &update).await?;
        let check = format!(
            "{{ <{subject}> <{holder}> \"{worker_id}\" }}",
            holder = vocab::pred::LEASE_HOLDER,
        );
        self.store.ask(vocab::graph::TASKS, &check).await
    }

    /// A claimed job's handler ran to completion (success or terminal
    /// failure, either way the token is no longer waiting on it).
    pub async fn mark_done(&self, job_id: Uuid) -> Result<()> {
        let subject = vocab::iri("asyncjob", job_id);
        self.store.delete_subject(vocab::graph::TASKS, &subject).await
    }

    /// Drop whatever pending job (if any) was scheduled for `token_id` — used
    /// when the token is cancelled (boundary interrupt, scope teardown)
    /// before its handler ever fires.
    pub async fn cancel_for_token(&self, token_id: Uuid) -> Result<()> {
        let query = format!(
            "SELECT ?j WHERE {{ ?j <{job_token}> <{token_iri}> }}",
            job_token = vocab::pred::ASYNC_JOB_TOKEN,
            token_iri = vocab::iri("token", token_id),
        );
        let results = self.store.query(vocab::graph::TASKS, &query).await?;
        for row in results.as_solutions()? {
            let subject = row.get("j").ok_or_else(|| anyhow!("missing ?j"))?;
            let body = subject.trim_start_matches('<').trim_end_matches('>');
            self.store.delete_subject(vocab::graph::TASKS, body).await?;
        }
        Ok(())
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
    use crate::store::OxigraphStore;

    #[tokio::test]
    async fn scheduled_job_is_claimable_once() {
        let store = OxigraphStore::open_memory().unwrap();
        let svc = AsyncJobService::new(&store, 60_000);
        let instance_id = Uuid::now_v7();
        let token_id = Uuid::now_v7();
        let job = svc.schedule(instance_id, token_id, "task1", "callRemote").await.unwrap();

        let claimed = svc.claim_pending("worker-a", 0).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job_id, job.job_id);

        let claimed_again = svc.claim_pending("worker-b", 0).await.unwrap();
        assert!(claimed_again.is_empty());

        svc.mark_done(job.job_id).await.unwrap();
        assert!(svc.find_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_for_token_drops_the_job() {
        let store = OxigraphStore::open_memory().unwrap();
        let svc = AsyncJobService::new(&store, 60_000);
        let token_id = Uuid::now_v7();
        svc.schedule(Uuid::now_v7(), token_id, "task1", "callRemote").await.unwrap();
        svc.cancel_for_token(token_id).await.unwrap();
        assert!(svc.find_pending().await.unwrap().is_empty());
    }
}
