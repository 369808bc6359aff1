//! Event Router (design §4.7, "C7").
//!
//! Message/signal correlation and event-based-gateway racing are expressed as
//! rows of `MessageSubscription` in the `tasks` named graph — the same graph
//! a waiting `UserTask` lives in, since both are "the token is parked, here
//! is what wakes it up." The router only resolves *which* waiting token a
//! message/signal/race resolves to; moving the token and applying variables
//! remains the executor's job (§4.5.4's scope-walk and §5's per-instance
//! serialization both live there).
//!
//! FIFO ordering for message correlation (§4.7: "resumes them in FIFO order")
//! falls out for free from `uuid::Uuid::now_v7` subscription ids: v7 UUIDs
//! are time-ordered, and their canonical hyphenated hex string sorts in the
//! same order as their creation time, so `ORDER BY ASC(STR(?sub))` is a FIFO
//! queue without a separate sequence counter.

use crate::store::GraphStore;
use crate::types::MessageSubscription;
use crate::vocab;
use anyhow::{anyhow, Result};
use oxigraph::model::{Literal, NamedNode, Term};
use uuid::Uuid;

pub struct EventRouter<'a> {
    store: &'a dyn GraphStore,
}

impl<'a> EventRouter<'a> {
    pub fn new(store: &'a dyn GraphStore) -> Self {
        Self { store }
    }

    /// Park a subscription for a waiting token (ReceiveTask, IntermediateCatchEvent,
    /// boundary event, or one arm of an EventBasedGateway race).
    pub async fn subscribe(
        &self,
        instance_id: Uuid,
        token_id: Uuid,
        name: &str,
        corr_key: &str,
        race_group: Option<&str>,
    ) -> Result<MessageSubscription> {
        let subscription_id = Uuid::now_v7();
        let subject = vocab::iri("subscription", subscription_id);
        let mut fields = vec![
            (
                vocab::pred::RDF_TYPE,
                Term::from(NamedNode::new_unchecked(vocab::class::MESSAGE_SUBSCRIPTION)),
            ),
            (
                vocab::pred::CORR_INSTANCE,
                Term::from(NamedNode::new_unchecked(vocab::iri("inst", instance_id))),
            ),
            (
                vocab::pred::TASK_TOKEN,
                Term::from(NamedNode::new_unchecked(vocab::iri("token", token_id))),
            ),
            (vocab::pred::CORR_NAME, Literal::new_simple_literal(name).into()),
            (vocab::pred::CORR_KEY, Literal::new_simple_literal(corr_key).into()),
        ];
        if let Some(group) = race_group {
            fields.push((vocab::pred::RACE_GROUP, Literal::new_simple_literal(group).into()));
        }
        self.store.put_subject(vocab::graph::TASKS, &subject, fields).await?;
        Ok(MessageSubscription {
            subscription_id,
            instance_id,
            token_id,
            name: name.to_string(),
            corr_key: corr_key.to_string(),
            race_group: race_group.map(str::to_string),
        })
    }

    pub async fn unsubscribe(&self, subscription_id: Uuid) -> Result<()> {
        let subject = vocab::iri("subscription", subscription_id);
        self.store.delete_subject(vocab::graph::TASKS, &subject).await
    }

    /// Resolve a named message with a correlation key to the oldest waiting
    /// subscription, if any, and remove it (a message is consumed at most
    /// once). Returns `None` if no token is waiting for it — the caller
    /// (supervisor's `correlate_message`) falls back from there to the
    /// message-start-event instantiation path.
    pub async fn correlate_message(
        &self,
        name: &str,
        corr_key: &str,
    ) -> Result<Option<MessageSubscription>> {
        let query = format!(
            "SELECT ?sub ?inst ?token WHERE {{
                ?sub <{ctype}> <{sub_class}> .
                ?sub <{cname}> \"{name}\" .
                ?sub <{ckey}> \"{corr_key}\" .
                ?sub <{cinst}> ?inst . ?sub <{ctoken}> ?token .
             }} ORDER BY ASC(STR(?sub)) LIMIT 1",
            ctype = vocab::pred::RDF_TYPE,
            sub_class = vocab::class::MESSAGE_SUBSCRIPTION,
            cname = vocab::pred::CORR_NAME,
            ckey = vocab::pred::CORR_KEY,
            cinst = vocab::pred::CORR_INSTANCE,
            ctoken = vocab::pred::TASK_TOKEN,
        );
        let results = self.store.query(vocab::graph::TASKS, &query).await?;
        let rows = results.as_solutions()?;
        let Some(row) = rows.first() else { return Ok(None) };
        let subscription_id = parse_uuid_iri(row.get("sub").ok_or_else(|| anyhow!("missing ?sub"))?)?;
        let instance_id = parse_uuid_iri(row.get("inst").ok_or_else(|| anyhow!("missing ?inst"))?)?;
        let token_id = parse_uuid_iri(row.get("token").ok_or_else(|| anyhow!("missing ?token"))?)?;
        self.unsubscribe(subscription_id).await?;
        Ok(Some(MessageSubscription {
            subscription_id,
            instance_id,
            token_id,
            name: name.to_string(),
            corr_key: corr_key.to_string(),
            race_group: None,
        }))
    }

    /// Fan-out broadcast: every subscription waiting on `signal_name`,
    /// regardless of instance, is resolved and removed (§4.7: "broadcast to
    /// all receive subscriptions matching the signal name across all running
    /// instances").
    pub async fn broadcast_signal(&self, signal_name: &str) -> Result<Vec<MessageSubscription>> {
        let query = format!(
            "SELECT ?sub ?inst ?token WHERE {{
                ?sub <{ctype}> <{sub_class}> .
                ?sub <{cname}> \"{signal_name}\" .
                ?sub <{cinst}> ?inst . ?sub <{ctoken}> ?token .
             }} ORDER BY ASC(STR(?sub))",
            ctype = vocab::pred::RDF_TYPE,
            sub_class = vocab::class::MESSAGE_SUBSCRIPTION,
            cname = vocab::pred::CORR_NAME,
            cinst = vocab::pred::CORR_INSTANCE,
            ctoken = vocab::pred::TASK_TOKEN,
        );
        let results = self.store.query(vocab::graph::TASKS, &query).await?;
        let mut matches = Vec::new();
        for row in results.as_solutions()? {
            let subscription_id = parse_uuid_iri(row.get("sub").ok_or_else(|| anyhow!("missing ?sub"))?)?;
            let instance_id = parse_uuid_iri(row.get("inst").ok_or_else(|| anyhow!("missing ?inst"))?)?;
            let token_id = parse_uuid_iri(row.get("token").ok_or_else(|| anyhow!("missing ?token"))?)?;
            self.unsubscribe(subscription_id).await?;
            matches.push(MessageSubscription {
                subscription_id,
                instance_id,
                token_id,
                name: signal_name.to_string(),
                corr_key: String::new(),
                race_group: None,
            });
        }
        Ok(matches)
    }

    /// The first subscription in a race group has fired; remove every other
    /// member so the losing branches of an EventBasedGateway never resolve
    /// (§4.7: "the first to fire cancels the rest").
    pub async fn cancel_race_group(&self, race_group: &str, winner: Uuid) -> Result<()> {
        let query = format!(
            "SELECT ?sub WHERE {{ ?sub <{group}> \"{race_group}\" }}",
            group = vocab::pred::RACE_GROUP,
        );
        let results = self.store.query(vocab::graph::TASKS, &query).await?;
        for row in results.as_solutions()? {
            let subscription_id = parse_uuid_iri(row.get("sub").ok_or_else(|| anyhow!("missing ?sub"))?)?;
            if subscription_id != winner {
                self.unsubscribe(subscription_id).await?;
            }
        }
        Ok(())
    }

    /// All subscriptions currently parked for a token (used when an
    /// interrupting boundary event or scope cancellation must tear down
    /// whatever the token was waiting on).
    pub async fn subscriptions_for_token(&self, token_id: Uuid) -> Result<Vec<MessageSubscription>> {
        let query = format!(
            "SELECT ?sub ?inst ?name ?key WHERE {{
                ?sub <{ctoken}> <{token_iri}> .
                ?sub <{cinst}> ?inst . ?sub <{cname}> ?name . ?sub <{ckey}> ?key .
             }}",
            ctoken = vocab::pred::TASK_TOKEN,
            token_iri = vocab::iri("token", token_id),
            cinst = vocab::pred::CORR_INSTANCE,
            cname = vocab::pred::CORR_NAME,
            ckey = vocab::pred::CORR_KEY,
        );
        let results = self.store.query(vocab::graph::TASKS, &query).await?;
        let mut out = Vec::new();
        for row in results.as_solutions()? {
            out.push(MessageSubscription {
                subscription_id: Uuid::nil(),
                instance_id: parse_uuid_iri(row.get("inst").ok_or_else(|| anyhow!("missing ?inst"))?)?,
                token_id,
                name: strip_quotes(row.get("name").ok_or_else(|| anyhow!("missing ?name"))?).to_string(),
                corr_key: strip_quotes(row.get("key").ok_or_else(|| anyhow!("missing ?key"))?).to_string(),
                race_group: None,
            });
        }
        Ok(out)
    }

    /// Cancel every subscription belonging to a token (boundary interrupt,
    /// scope teardown).
    pub async fn cancel_token_subscriptions(&self, token_id: Uuid) -> Result<()> {
        let query = format!(
            "SELECT ?sub WHERE {{ ?sub <{ctoken}> <{token_iri}> }}",
            ctoken = vocab::pred::TASK_TOKEN,
            token_iri = vocab::iri("token", token_id),
        );
        let results = self.store.query(vocab::graph::TASKS, &query).await?;
        for row in results.as_solutions()? {
            let subscription_id = parse_uuid_iri(row.get("sub").ok_or_else(|| anyhow!("missing ?sub"))?)?;
            self.unsubscribe(subscription_id).await?;
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
    async fn message_correlation_resolves_fifo() {
        let store = OxigraphStore::open_memory().unwrap();
        let router = EventRouter::new(&store);
        let instance_a = Uuid::now_v7();
        let instance_b = Uuid::now_v7();
        let first = router
            .subscribe(instance_a, Uuid::now_v7(), "orderShipped", "order-1", None)
            .await
            .unwrap();
        let _second = router
            .subscribe(instance_b, Uuid::now_v7(), "orderShipped", "order-1", None)
            .await
            .unwrap();

        let resolved = router.correlate_message("orderShipped", "order-1").await.unwrap().unwrap();
        assert_eq!(resolved.subscription_id, first.subscription_id);

        // Consumed once: a second correlation wakes the other waiter.
        let resolved2 = router.correlate_message("orderShipped", "order-1").await.unwrap();
        assert!(resolved2.is_some());
        assert!(router.correlate_message("orderShipped", "order-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn signal_broadcast_resolves_all_waiters() {
        let store = OxigraphStore::open_memory().unwrap();
        let router = EventRouter::new(&store);
        router.subscribe(Uuid::now_v7(), Uuid::now_v7(), "alarm", "", None).await.unwrap();
        router.subscribe(Uuid::now_v7(), Uuid::now_v7(), "alarm", "", None).await.unwrap();

        let resolved = router.broadcast_signal("alarm").await.unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(router.broadcast_signal("alarm").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn race_group_cancels_losers() {
        let store = OxigraphStore::open_memory().unwrap();
        let router = EventRouter::new(&store);
        let instance_id = Uuid::now_v7();
        let token_id = Uuid::now_v7();
        let winner = router
            .subscribe(instance_id, token_id, "pathA", "", Some("race-1"))
            .await
            .unwrap();
        router
            .subscribe(instance_id, token_id, "pathB", "", Some("race-1"))
            .await
            .unwrap();

        router.cancel_race_group("race-1", winner.subscription_id).await.unwrap();
        assert!(router.correlate_message("pathB", "").await.unwrap().is_none());
    }
}
