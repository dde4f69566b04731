//! Roster synchronization across workers.
//!
//! The cache holds the authoritative working copy of the roster. Every
//! operation runs under the roster-wide lease and a single deadline:
//!
//! 1. acquire the lease
//! 2. load and decode the cached snapshot (`RosterUninitialized` if absent)
//! 3. validate the request against that fresh copy
//! 4. apply the mutation to a clone, re-applying on a new clone until the
//!    mutation's convergence predicate holds or the attempt ceiling is hit
//! 5. write the snapshot with the next version and read the version back
//! 6. release the lease, on every path
//!
//! The durable store is only touched by `checkpoint_roster`, `shutdown` and
//! `bootstrap`, all under the same lease. At bootstrap the cache wins if it
//! holds a usable snapshot, then the durable store, then a fresh roster.

pub mod lease;
pub mod snapshot;

mod mutation;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::RosterCache;
use crate::catalog::TopicCatalog;
use crate::config::SyncConfig;
use crate::error::RosterError;
use crate::predictor::Predictor;
use crate::roster::{Prediction, ResponseBits, Roster};
use crate::store::DurableStore;

use self::lease::{LeaseError, LeaseProvider};
use self::mutation::{
    normalize_ids, student_id, AllMasteries, Enroll, MasteryOf, Mutation, RecordResponses, Unenroll,
    UnenrollEverywhere,
};
pub use self::snapshot::RosterSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    Cache,
    DurableStore,
    Fresh,
}

impl RecoverySource {
    pub const fn as_str(self) -> &'static str {
        match self {
            RecoverySource::Cache => "cache",
            RecoverySource::DurableStore => "durable_store",
            RecoverySource::Fresh => "fresh",
        }
    }
}

pub struct RosterCoordinator {
    config: SyncConfig,
    cache: Arc<dyn RosterCache>,
    store: Arc<dyn DurableStore>,
    lease: Arc<dyn LeaseProvider>,
    catalog: Arc<dyn TopicCatalog>,
    predictor: Arc<dyn Predictor>,
}

impl RosterCoordinator {
    pub fn new(
        config: SyncConfig,
        cache: Arc<dyn RosterCache>,
        store: Arc<dyn DurableStore>,
        lease: Arc<dyn LeaseProvider>,
        catalog: Arc<dyn TopicCatalog>,
        predictor: Arc<dyn Predictor>,
    ) -> Self {
        Self {
            config,
            cache,
            store,
            lease,
            catalog,
            predictor,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn enroll_students<S: AsRef<str>>(
        &self,
        topic: &str,
        students: &[S],
    ) -> Result<usize, RosterError> {
        self.mutate(Enroll {
            topic: topic.to_string(),
            students: normalize_ids(students),
        })
        .await
    }

    /// Students that are not enrolled are skipped, never an error.
    pub async fn unenroll_students<S: AsRef<str>>(
        &self,
        topic: &str,
        students: &[S],
    ) -> Result<usize, RosterError> {
        self.mutate(Unenroll {
            topic: topic.to_string(),
            students: normalize_ids(students),
        })
        .await
    }

    /// Removes the student from every topic. Irreversible: histories are
    /// discarded.
    pub async fn unenroll_student_everywhere(&self, student: &str) -> Result<usize, RosterError> {
        self.mutate(UnenrollEverywhere {
            student: student_id(student)?,
        })
        .await
    }

    /// Displayed mastery; `Untrained` maps to [`crate::roster::DEFAULT_MASTERY`].
    pub async fn get_mastery(&self, topic: &str, student: &str) -> Result<f64, RosterError> {
        self.get_prediction(topic, student)
            .await
            .map(Prediction::or_default)
    }

    /// Raw prediction, auto-enrolling the student when absent.
    pub async fn get_prediction(
        &self,
        topic: &str,
        student: &str,
    ) -> Result<Prediction, RosterError> {
        self.mutate(MasteryOf {
            topic: topic.to_string(),
            student: student_id(student)?,
        })
        .await
    }

    pub async fn get_all_masteries(
        &self,
        student: &str,
    ) -> Result<BTreeMap<String, f64>, RosterError> {
        let predictions = self
            .mutate(AllMasteries {
                student: student_id(student)?,
            })
            .await?;
        Ok(predictions
            .into_iter()
            .map(|(topic, prediction)| (topic, prediction.or_default()))
            .collect())
    }

    /// Every enrolled student's mastery, per topic. Read-only.
    pub async fn all_mastery_probabilities(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<String, f64>>, RosterError> {
        self.exclusive("all_mastery_probabilities", self.all_masteries_locked())
            .await
    }

    /// Current cached snapshot. Read-only.
    pub async fn current_snapshot(&self) -> Result<RosterSnapshot, RosterError> {
        self.exclusive("current_snapshot", self.load()).await
    }

    /// `responses` is a bit string such as `"1"` or `"0110"`.
    pub async fn record_response(
        &self,
        topic: &str,
        student: &str,
        responses: &str,
    ) -> Result<Prediction, RosterError> {
        let bits = ResponseBits::parse(responses)?;
        let mut outcome = self
            .mutate(RecordResponses {
                student: student_id(student)?,
                responses: BTreeMap::from([(topic.to_string(), bits)]),
            })
            .await?;
        Ok(outcome
            .remove(topic)
            .unwrap_or(Prediction::Untrained))
    }

    /// Every topic and encoding is checked before anything is recorded; one
    /// bad entry rejects the whole batch.
    pub async fn record_responses_multi_topic(
        &self,
        student: &str,
        responses: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, Prediction>, RosterError> {
        let student = student_id(student)?;
        let responses = responses
            .iter()
            .map(|(topic, raw)| Ok((topic.clone(), ResponseBits::parse(raw)?)))
            .collect::<Result<BTreeMap<_, _>, RosterError>>()?;

        if responses.is_empty() {
            return Ok(BTreeMap::new());
        }

        self.mutate(RecordResponses { student, responses })
        .await
    }

    /// Replaces the cached roster with an empty one built from the catalog.
    ///
    /// Irreversible: every enrollment and history is discarded, and the next
    /// checkpoint overwrites the durable copy with the empty roster.
    pub async fn reset_roster(&self) -> Result<RosterSnapshot, RosterError> {
        self.exclusive("reset_roster", self.reset_locked()).await
    }

    /// Copies the cached snapshot to the durable store. Returns its version.
    pub async fn checkpoint_roster(&self) -> Result<u64, RosterError> {
        self.exclusive("checkpoint_roster", self.checkpoint_locked())
            .await
    }

    /// Seeds the cache at startup: cache, else durable store, else fresh.
    pub async fn bootstrap(&self) -> Result<RecoverySource, RosterError> {
        self.exclusive("bootstrap", self.bootstrap_locked()).await
    }

    /// Final checkpoint before the process exits.
    pub async fn shutdown(&self) -> Result<u64, RosterError> {
        let version = self.checkpoint_roster().await?;
        info!(version, "roster saved on shutdown");
        Ok(version)
    }

    async fn mutate<M: Mutation>(&self, mutation: M) -> Result<M::Output, RosterError> {
        self.exclusive(mutation.name(), self.mutate_locked(&mutation))
            .await
    }

    async fn mutate_locked<M: Mutation>(&self, mutation: &M) -> Result<M::Output, RosterError> {
        let operation = mutation.name();
        let loaded = self.load().await?;
        let (working, output) = self.converge(mutation, &loaded.roster)?;
        let next = loaded.next(working);
        self.write_verified(operation, &next).await?;
        debug!(operation, version = next.version, "roster written");
        Ok(output)
    }

    async fn all_masteries_locked(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<String, f64>>, RosterError> {
        let snapshot = self.load().await?;
        let roster = &snapshot.roster;
        let mut all = BTreeMap::new();
        for topic in roster.skills() {
            let students: BTreeMap<String, f64> = roster
                .mastery_of_all_students(topic)?
                .into_iter()
                .map(|(student, prediction)| (student, prediction.or_default()))
                .collect();
            all.insert(topic.clone(), students);
        }
        Ok(all)
    }

    async fn reset_locked(&self) -> Result<RosterSnapshot, RosterError> {
        let previous = match self.cache.get(&self.config.cache_key).await? {
            Some(bytes) => RosterSnapshot::peek_version(&bytes).unwrap_or_else(|| {
                warn!("cached roster unreadable, restarting version counter");
                0
            }),
            None => 0,
        };

        let roster = Roster::from_catalog(self.catalog.as_ref());
        let snapshot = RosterSnapshot::with_version(previous.saturating_add(1), roster);
        self.cache
            .set(&self.config.cache_key, &snapshot.encode()?)
            .await?;

        warn!(
            version = snapshot.version,
            topics = snapshot.roster.skills().len(),
            "roster reset"
        );
        Ok(snapshot)
    }

    async fn checkpoint_locked(&self) -> Result<u64, RosterError> {
        let bytes = self
            .cache
            .get(&self.config.cache_key)
            .await?
            .ok_or(RosterError::RosterUninitialized)?;
        let snapshot = RosterSnapshot::decode(&bytes)?;

        self.store.write(&self.config.snapshot_name, &bytes).await?;

        info!(
            version = snapshot.version,
            name = %self.config.snapshot_name,
            "roster checkpoint saved"
        );
        Ok(snapshot.version)
    }

    async fn bootstrap_locked(&self) -> Result<RecoverySource, RosterError> {
        if let Some(bytes) = self.cache.get(&self.config.cache_key).await? {
            match RosterSnapshot::decode(&bytes) {
                Ok(snapshot) => {
                    info!(version = snapshot.version, "roster recovered from cache");
                    return Ok(RecoverySource::Cache);
                }
                Err(err) => {
                    warn!(error = %err, "cached roster unusable, falling back to durable store");
                }
            }
        }

        let (snapshot, source) = match self.store.read(&self.config.snapshot_name).await? {
            Some(bytes) => {
                let stored = RosterSnapshot::decode(&bytes)?;
                let mut roster = stored.roster.clone();
                if self.config.refresh_on_recovery {
                    let failures = roster.refresh_predictions(self.predictor.as_ref());
                    if failures > 0 {
                        warn!(failures, "some predictions kept from durable snapshot");
                    }
                }
                (stored.next(roster), RecoverySource::DurableStore)
            }
            None => (
                RosterSnapshot::initial(Roster::from_catalog(self.catalog.as_ref())),
                RecoverySource::Fresh,
            ),
        };

        self.write_verified("bootstrap", &snapshot).await?;
        info!(
            version = snapshot.version,
            source = source.as_str(),
            "roster cache seeded"
        );
        Ok(source)
    }

    fn converge<M: Mutation>(
        &self,
        mutation: &M,
        loaded: &Roster,
    ) -> Result<(Roster, M::Output), RosterError> {
        mutation.validate(loaded)?;

        let attempts = self.config.max_convergence_attempts;
        for attempt in 1..=attempts {
            let mut working = loaded.clone();
            let output = mutation.apply(&mut working, self.predictor.as_ref())?;
            if mutation.converged(loaded, &working) {
                return Ok((working, output));
            }
            warn!(
                operation = mutation.name(),
                attempt, "mutation not observable on working copy, re-applying"
            );
        }

        Err(RosterError::ConvergenceTimeout {
            operation: mutation.name(),
            attempts,
        })
    }

    async fn load(&self) -> Result<RosterSnapshot, RosterError> {
        let bytes = self
            .cache
            .get(&self.config.cache_key)
            .await?
            .ok_or(RosterError::RosterUninitialized)?;
        RosterSnapshot::decode(&bytes)
    }

    /// Unconditional overwrite, then read back until the cache reports the
    /// version just written.
    async fn write_verified(
        &self,
        operation: &'static str,
        snapshot: &RosterSnapshot,
    ) -> Result<(), RosterError> {
        let bytes = snapshot.encode()?;
        let attempts = self.config.max_convergence_attempts;

        for attempt in 1..=attempts {
            self.cache.set(&self.config.cache_key, &bytes).await?;
            let observed = self
                .cache
                .get(&self.config.cache_key)
                .await?
                .and_then(|stored| RosterSnapshot::peek_version(&stored));

            if observed == Some(snapshot.version) {
                return Ok(());
            }
            warn!(
                operation,
                attempt,
                expected = snapshot.version,
                observed = ?observed,
                "cache does not reflect roster write"
            );
        }

        Err(RosterError::ConvergenceTimeout {
            operation,
            attempts,
        })
    }

    async fn exclusive<T, F>(&self, operation: &'static str, body: F) -> Result<T, RosterError>
    where
        F: Future<Output = Result<T, RosterError>>,
    {
        let timeout = self.config.operation_timeout;
        let deadline = Instant::now() + timeout;
        let deadline_exceeded = || RosterError::DeadlineExceeded { operation, timeout };

        // not under timeout_at: a lock taken at the deadline must reach release
        let lease = match self.lease.acquire(deadline).await {
            Ok(lease) => lease,
            Err(LeaseError::Timeout) => return Err(deadline_exceeded()),
            Err(err) => return Err(err.into()),
        };
        debug!(
            operation,
            fencing_token = lease.fencing_token(),
            "roster lease acquired"
        );

        let outcome = if Instant::now() >= deadline {
            Err(deadline_exceeded())
        } else {
            match tokio::time::timeout_at(deadline, body).await {
                Ok(result) => result,
                Err(_) => Err(deadline_exceeded()),
            }
        };

        if let Err(err) = self.lease.release(lease).await {
            warn!(operation, error = %err, "roster lease release failed");
        }

        if let Err(err) = &outcome {
            debug!(operation, code = err.code(), error = %err, "roster operation failed");
        }
        outcome
    }
}
