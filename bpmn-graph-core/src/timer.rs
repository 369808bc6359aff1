//! Timer Service (design §4.8, "C8").
//!
//! Timer jobs live in the `timers` named graph. Claiming a due job is a
//! compare-and-set expressed as a single SPARQL `DELETE ... INSERT ... WHERE`
//! so that two workers racing the same poll never both win the lease —
//! oxigraph serializes the update under the graph's writer lock, and the
//! `WHERE` clause re-checks the claim predicate is still unset at the moment
//! of the write.

use crate::store::GraphStore;
use crate::types::{TimerJob, TimerStatus, Timestamp};
use crate::vocab;
use anyhow::{anyhow, Result};
use oxigraph::model::{Literal, NamedNode, Term};
use uuid::Uuid;

pub struct TimerService<'a> {
    store: &'a dyn GraphStore,
    lease_ttl_ms: u64,
}

impl<'a> TimerService<'a> {
    pub fn new(store: &'a dyn GraphStore, lease_ttl_ms: u64) -> Self {
        Self { store, lease_ttl_ms }
    }

    /// Schedule a new timer job, due at `due_at` (epoch ms).
    pub async fn schedule(
        &self,
        instance_id: Uuid,
        token_id: Uuid,
        target_node: &str,
        due_at: Timestamp,
    ) -> Result<TimerJob> {
        let timer_id = Uuid::now_v7();
        let subject = vocab::iri("timer", timer_id);
        let fields = vec![
            (
                vocab::pred::RDF_TYPE,
                Term::from(NamedNode::new_unchecked(vocab::class::TIMER_JOB)),
            ),
            (
                vocab::pred::TIMER_INSTANCE,
                Term::from(NamedNode::new_unchecked(vocab::iri("inst", instance_id))),
            ),
            (
                vocab::pred::TIMER_TOKEN,
                Term::from(NamedNode::new_unchecked(vocab::iri("token", token_id))),
            ),
            (
                vocab::pred::TIMER_TARGET_NODE,
                Literal::new_simple_literal(target_node).into(),
            ),
            (vocab::pred::DUE_AT, datetime_literal(due_at)),
            (vocab::pred::ATTEMPTS, integer_literal(0)),
            (vocab::pred::TIMER_STATUS, status_literal(TimerStatus::DuePending)),
        ];
        self.store.put_subject(vocab::graph::TIMERS, &subject, fields).await?;
        Ok(TimerJob {
            timer_id,
            instance_id,
            token_id,
            target_node: target_node.to_string(),
            due_at,
            lease_holder: None,
            lease_expires_at: None,
            attempts: 0,
            status: TimerStatus::DuePending,
        })
    }

    /// Attempt to claim every currently-due, unleased (or lease-expired)
    /// timer job for `worker_id` (§4.8: `dueAt <= now AND (leaseHolder null OR
    /// leaseExpiresAt < now)`). Returns the jobs this call actually won.
    pub async fn claim_due(&self, worker_id: &str, now: Timestamp) -> Result<Vec<TimerJob>> {
        let candidates = self.find_due(now).await?;
        let mut claimed = Vec::new();
        for job in candidates {
            if self.try_claim(&job, worker_id, now).await? {
                let mut job = job;
                job.lease_holder = Some(worker_id.to_string());
                job.lease_expires_at = Some(now + self.lease_ttl_ms as i64);
                job.status = TimerStatus::Leased;
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    async fn find_due(&self, now: Timestamp) -> Result<Vec<TimerJob>> {
        let query = format!(
            "SELECT ?t ?inst ?token ?node ?due ?holder ?expires ?attempts WHERE {{
                ?t <{status}> ?s . FILTER(?s = \"DuePending\" || ?s = \"Leased\")
                ?t <{due}> ?due . FILTER(?due <= \"{now_iso}\"^^xsd:dateTime)
                ?t <{inst}> ?inst . ?t <{token}> ?token . ?t <{node}> ?node . ?t <{attempts}> ?attempts .
                OPTIONAL {{ ?t <{holder}> ?holder }}
                OPTIONAL {{ ?t <{expires}> ?expires }}
                FILTER(!BOUND(?holder) || ?expires < \"{now_iso}\"^^xsd:dateTime)
             }}",
            status = vocab::pred::TIMER_STATUS,
            due = vocab::pred::DUE_AT,
            now_iso = crate::types::to_iso8601(now),
            inst = vocab::pred::TIMER_INSTANCE,
            token = vocab::pred::TIMER_TOKEN,
            node = vocab::pred::TIMER_TARGET_NODE,
            attempts = vocab::pred::ATTEMPTS,
            holder = vocab::pred::LEASE_HOLDER,
            expires = vocab::pred::LEASE_EXPIRES_AT,
        );
        let results = self.store.query(vocab::graph::TIMERS, &query).await?;
        let mut out = Vec::new();
        for row in results.as_solutions()? {
            out.push(TimerJob {
                timer_id: parse_uuid_iri(row.get("t").ok_or_else(|| anyhow!("missing ?t"))?)?,
                instance_id: parse_uuid_iri(row.get("inst").ok_or_else(|| anyhow!("missing ?inst"))?)?,
                token_id: parse_uuid_iri(row.get("token").ok_or_else(|| anyhow!("missing ?token"))?)?,
                target_node: strip_quotes(row.get("node").ok_or_else(|| anyhow!("missing ?node"))?).to_string(),
                due_at: now, // exact value not needed post-claim; refreshed from the subject if callers need it
                lease_holder: None,
                lease_expires_at: None,
                attempts: strip_quotes(row.get("attempts").ok_or_else(|| anyhow!("missing ?attempts"))?)
                    .parse()
                    .unwrap_or(0),
                status: TimerStatus::DuePending,
            });
        }
        Ok(out)
    }

    /// Compare-and-set the lease: succeeds only if, at write time, the job is
    /// still unleased or its lease has expired. The `WHERE` guard makes this
    /// atomic against a racing worker's identical update.
    async fn try_claim(&self, job: &TimerJob, worker_id: &str, now: Timestamp) -> Result<bool> {
        let subject = vocab::iri("timer", job.timer_id);
        let expires_at = now + self.lease_ttl_ms as i64;
        let update = format!(
            "DELETE {{ <{subject}> <{holder}> ?oldHolder . <{subject}> <{expires}> ?oldExpires . <{subject}> <{status}> ?oldStatus }}
             INSERT {{ <{subject}> <{holder}> \"{worker_id}\" . <{subject}> <{expires}> \"{expires_iso}\"^^xsd:dateTime . <{subject}> <{status}> \"Leased\" }}
             WHERE {{
                <{subject}> <{status}> ?oldStatus . FILTER(?oldStatus = \"DuePending\" || ?oldStatus = \"Leased\")
                OPTIONAL {{ <{subject}> <{holder}> ?oldHolder }}
                OPTIONAL {{ <{subject}> <{expires}> ?oldExpires }}
                FILTER(!BOUND(?oldHolder) || ?oldExpires < \"{now_iso}\"^^xsd:dateTime)
             }}",
            holder = vocab::pred::LEASE_HOLDER,
            expires = vocab::pred::LEASE_EXPIRES_AT,
            status = vocab::pred::TIMER_STATUS,
            expires_iso = crate::types::to_iso8601(expires_at),
            now_iso = crate::types::to_iso8601(now),
        );
        self.store.update(vocab::graph::TIMERS, &update).await?;
        // Confirm we actually hold the lease now (the WHERE clause may have
        // matched zero rows, in which case the INSERT was a no-op).
        let check = format!(
            "{{ <{subject}> <{holder}> \"{worker_id}\" }}",
            holder = vocab::pred::LEASE_HOLDER,
        );
        self.store.ask(vocab::graph::TIMERS, &check).await
    }

    /// Mark a claimed job fired (terminal success, §4.8).
    pub async fn mark_fired(&self, timer_id: Uuid) -> Result<()> {
        let subject = vocab::iri("timer", timer_id);
        let update = format!(
            "DELETE {{ <{subject}> <{status}> ?s }} INSERT {{ <{subject}> <{status}> \"Fired\" }} WHERE {{ <{subject}> <{status}> ?s }}",
            status = vocab::pred::TIMER_STATUS,
        );
        self.store.update(vocab::graph::TIMERS, &update).await
    }

    /// A claimed job's handler failed: clear the lease and bump the attempt
    /// counter so the next poll can retry it, up to `max_attempts` (§4.8).
    pub async fn release_for_retry(&self, timer_id: Uuid, max_attempts: u32) -> Result<()> {
        let subject = vocab::iri("timer", timer_id);
        let attempts_query = format!(
            "SELECT ?a WHERE {{ <{subject}> <{attempts}> ?a }}",
            attempts = vocab::pred::ATTEMPTS,
        );
        let results = self.store.query(vocab::graph::TIMERS, &attempts_query).await?;
        let current: u32 = results
            .as_solutions()?
            .first()
            .and_then(|r| r.get("a"))
            .map(|s| strip_quotes(s).parse().unwrap_or(0))
            .unwrap_or(0);
        let next = current + 1;
        let new_status = if next >= max_attempts { "Cancelled" } else { "DuePending" };
        let update = format!(
            "DELETE {{ <{subject}> <{holder}> ?h . <{subject}> <{expires}> ?e . <{subject}> <{status}> ?s . <{subject}> <{attempts}> ?a }}
             INSERT {{ <{subject}> <{status}> \"{new_status}\" . <{subject}> <{attempts}> {next} }}
             WHERE {{ <{subject}> <{status}> ?s . <{subject}> <{attempts}> ?a . OPTIONAL {{ <{subject}> <{holder}> ?h }} OPTIONAL {{ <{subject}> <{expires}> ?e }} }}",
            holder = vocab::pred::LEASE_HOLDER,
            expires = vocab::pred::LEASE_EXPIRES_AT,
            status = vocab::pred::TIMER_STATUS,
            attempts = vocab::pred::ATTEMPTS,
        );
        self.store.update(vocab::graph::TIMERS, &update).await
    }

    pub async fn cancel(&self, timer_id: Uuid) -> Result<()> {
        let subject = vocab::iri("timer", timer_id);
        let update = format!(
            "DELETE {{ <{subject}> <{status}> ?s }} INSERT {{ <{subject}> <{status}> \"Cancelled\" }} WHERE {{ <{subject}> <{status}> ?s }}",
            status = vocab::pred::TIMER_STATUS,
        );
        self.store.update(vocab::graph::TIMERS, &update).await
    }

    /// Cancel whatever timer job (if any) was scheduled against `token_id` —
    /// used when a boundary event's token is disarmed without ever firing
    /// (the attached activity completed first).
    pub async fn cancel_for_token(&self, token_id: Uuid) -> Result<()> {
        let query = format!(
            "SELECT ?t WHERE {{ ?t <{timer_token}> <{token_iri}> . ?t <{status}> ?s . FILTER(?s != \"Cancelled\" && ?s != \"Fired\") }}",
            timer_token = vocab::pred::TIMER_TOKEN,
            token_iri = vocab::iri("token", token_id),
            status = vocab::pred::TIMER_STATUS,
        );
        let results = self.store.query(vocab::graph::TIMERS, &query).await?;
        for row in results.as_solutions()? {
            let t = row.get("t").ok_or_else(|| anyhow!("missing ?t"))?;
            let body = t.trim_start_matches('<').trim_end_matches('>');
            let id = body.rsplit(':').next().ok_or_else(|| anyhow!("malformed IRI: {t}"))?;
            self.cancel(Uuid::parse_str(id)?).await?;
        }
        Ok(())
    }
}

fn integer_literal(n: i64) -> Term {
    Literal::new_typed_literal(n.to_string(), NamedNode::new_unchecked("http://www.w3.org/2001/XMLSchema#integer"))
        .into()
}

fn datetime_literal(ts: Timestamp) -> Term {
    Literal::new_typed_literal(
        crate::types::to_iso8601(ts),
        NamedNode::new_unchecked("http://www.w3.org/2001/XMLSchema#dateTime"),
    )
    .into()
}

fn status_literal(status: TimerStatus) -> Term {
    let s = match status {
        TimerStatus::DuePending => "DuePending",
        TimerStatus::Leased => "Leased",
        TimerStatus::Fired => "Fired",
        TimerStatus::Cancelled => "Cancelled",
    };
    Literal::new_simple_literal(s).into()
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
    async fn scheduled_timer_is_claimable_once_due() {
        let store = OxigraphStore::open_memory().unwrap();
        let svc = TimerService::new(&store, 60_000);
        let instance_id = Uuid::now_v7();
        let token_id = Uuid::now_v7();
        let job = svc.schedule(instance_id, token_id, "boundary1", 0).await.unwrap();

        let claimed = svc.claim_due("worker-a", 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].timer_id, job.timer_id);

        // A second worker racing the same poll must not also win the lease.
        let claimed_again = svc.claim_due("worker-b", 1).await.unwrap();
        assert!(claimed_again.is_empty());
    }
}
