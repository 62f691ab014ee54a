//! The primary queue: priority classes drained in order, at-least-once
//! delivery with visibility timeouts, retry scheduling, and a dead-letter
//! queue.
//!
//! Drain order is strict (`urgent` before `normal` before `batch` before
//! `maintenance`); no starvation guarantee is made for lower classes under
//! sustained urgent load — operators scale consumers instead.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crucible_kv::Counters;
use crucible_retry::{next_delay, RetryPolicy};
use crucible_schemas::{Priority, TaskEnvelope};

use crate::{DeadLetter, NackOutcome, Reservation, ReservationToken, TaskQueue};

struct Inflight {
    envelope: TaskEnvelope,
    deadline: Instant,
}

struct QueueState {
    ready: BTreeMap<Priority, VecDeque<TaskEnvelope>>,
    /// Retry-scheduled envelopes, promoted back to `ready` when due.
    delayed: Vec<(Instant, TaskEnvelope)>,
    inflight: HashMap<u64, Inflight>,
    dead: Vec<DeadLetter>,
    next_token: u64,
}

pub struct PriorityQueue {
    state: Mutex<QueueState>,
    drain_order: Vec<Priority>,
    retry_policy: RetryPolicy,
    counters: Arc<Counters>,
}

impl PriorityQueue {
    pub fn new(
        drain_order: Vec<Priority>,
        retry_policy: RetryPolicy,
        counters: Arc<Counters>,
    ) -> Self {
        let mut ready = BTreeMap::new();
        for p in &drain_order {
            ready.insert(*p, VecDeque::new());
        }
        Self {
            state: Mutex::new(QueueState {
                ready,
                delayed: Vec::new(),
                inflight: HashMap::new(),
                dead: Vec::new(),
                next_token: 1,
            }),
            drain_order,
            retry_policy,
            counters,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Promote due retries and expired reservations back into `ready`.
    /// Runs at the top of every queue operation; no background task needed.
    fn settle(&self, st: &mut QueueState, now: Instant) {
        let mut due = Vec::new();
        st.delayed.retain(|(when, env)| {
            if *when <= now {
                due.push(env.clone());
                false
            } else {
                true
            }
        });
        for env in due {
            st.ready.entry(env.priority).or_default().push_back(env);
        }

        let expired: Vec<u64> = st
            .inflight
            .iter()
            .filter(|(_, inf)| now >= inf.deadline)
            .map(|(t, _)| *t)
            .collect();
        for token in expired {
            // Reservation lapsed without an ack or nack — the consumer is
            // presumed dead. Redeliver as-is.
            let inf = st.inflight.remove(&token).expect("token present");
            tracing::warn!(
                eval_id = %inf.envelope.eval_id,
                "reservation visibility expired; redelivering"
            );
            st.ready
                .entry(inf.envelope.priority)
                .or_default()
                .push_back(inf.envelope);
        }
    }
}

#[async_trait]
impl TaskQueue for PriorityQueue {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<()> {
        let mut st = self.lock();
        self.settle(&mut st, Instant::now());
        st.ready.entry(envelope.priority).or_default().push_back(envelope);
        Ok(())
    }

    async fn reserve(&self, overhead: Duration) -> Result<Option<Reservation>> {
        let now = Instant::now();
        let mut st = self.lock();
        self.settle(&mut st, now);

        for p in &self.drain_order {
            if let Some(envelope) = st.ready.get_mut(p).and_then(|q| q.pop_front()) {
                let token = ReservationToken(st.next_token);
                st.next_token += 1;
                let visibility = overhead + Duration::from_secs(envelope.timeout_seconds);
                st.inflight.insert(
                    token.0,
                    Inflight {
                        envelope: envelope.clone(),
                        deadline: now + visibility,
                    },
                );
                return Ok(Some(Reservation { token, envelope }));
            }
        }
        Ok(None)
    }

    async fn ack(&self, token: ReservationToken) -> Result<()> {
        let mut st = self.lock();
        // Unknown token = the reservation already expired and was
        // redelivered; nothing to do (at-least-once, not exactly-once).
        st.inflight.remove(&token.0);
        Ok(())
    }

    async fn nack(&self, token: ReservationToken, error: &str) -> Result<NackOutcome> {
        let now = Instant::now();
        let mut st = self.lock();

        let Some(mut inf) = st.inflight.remove(&token.0) else {
            // Same expired-token situation as ack.
            return Ok(NackOutcome::Requeued {
                delay: Duration::ZERO,
            });
        };

        inf.envelope.attempt += 1;
        if inf.envelope.attempt > self.retry_policy.max_retries {
            tracing::warn!(
                eval_id = %inf.envelope.eval_id,
                attempts = inf.envelope.attempt,
                error,
                "retries exhausted; dead-lettering"
            );
            self.counters.dead_lettered.incr();
            st.dead.push(DeadLetter {
                envelope: inf.envelope,
                last_error: error.to_string(),
                dead_lettered_at: Utc::now(),
            });
            return Ok(NackOutcome::DeadLettered);
        }

        let delay = next_delay(inf.envelope.attempt - 1, &self.retry_policy);
        st.delayed.push((now + delay, inf.envelope));
        Ok(NackOutcome::Requeued { delay })
    }

    async fn requeue(&self, token: ReservationToken, delay: Duration) -> Result<()> {
        let now = Instant::now();
        let mut st = self.lock();
        if let Some(inf) = st.inflight.remove(&token.0) {
            st.delayed.push((now + delay, inf.envelope));
        }
        Ok(())
    }

    async fn depth(&self) -> usize {
        let mut st = self.lock();
        self.settle(&mut st, Instant::now());
        st.ready.values().map(VecDeque::len).sum::<usize>() + st.delayed.len()
    }

    async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead.clone()
    }
}
