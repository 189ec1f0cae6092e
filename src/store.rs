//! Durable job storage on top of sled
//!
//! Two trees back the store: `jobs` maps a job id to its CBOR-encoded record
//! and `unique` maps a `(kind, unique key)` pair to the id of the one job that
//! owns it. Both are only ever written together inside a sled transaction, so
//! the uniqueness index can never point at a job that was not committed.
use super::error::StoreError;
use super::job::{Job, JobArgs, JobId, JobState};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use std::path::Path;
use tracing::{debug, info};

pub(crate) const JOBS_TREE: &str = "jobs";
const UNIQUE_TREE: &str = "jobs_unique";

pub type TxResult<T> = Result<T, ConflictableTransactionError<StoreError>>;

/// Result of [`JobTx::insert_unique`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertResult {
    pub job: Job,
    /// Set when a job with the same unique key already existed. `job` is then
    /// the existing record, untouched.
    pub skipped_as_duplicate: bool,
}

#[derive(Clone)]
pub struct JobStore {
    db: sled::Db,
    jobs: sled::Tree,
    unique: sled::Tree,
}

impl JobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::new(sled::open(path)?)
    }

    /// An in-memory store that is removed when the last handle drops.
    pub fn temporary() -> Result<Self, StoreError> {
        Self::new(sled::Config::new().temporary(true).open()?)
    }

    pub fn new(db: sled::Db) -> Result<Self, StoreError> {
        let jobs = db.open_tree(JOBS_TREE)?;
        let unique = db.open_tree(UNIQUE_TREE)?;

        Ok(Self { db, jobs, unique })
    }

    /// Runs `f` in a serializable transaction over the job trees.
    ///
    /// Returning `Ok` commits and flushes to disk; returning an abort error
    /// discards every write `f` made. sled may run `f` more than once when it
    /// conflicts with a concurrent transaction, so `f` must not have side
    /// effects outside of `tx`.
    pub fn transaction<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: Fn(&JobTx<'_>) -> TxResult<R>,
    {
        let result = (&self.jobs, &self.unique)
            .transaction(|(jobs, unique)| f(&JobTx { jobs, unique }))
            .map_err(into_store_error)?;
        self.db.flush()?;

        Ok(result)
    }

    pub fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        self.jobs
            .get(id.as_bytes())?
            .map(|raw| Job::decode(&raw))
            .transpose()
    }

    pub fn find_unique<A: JobArgs>(&self, args: &A) -> Result<Option<Job>, StoreError> {
        match self.unique.get(unique_index_key::<A>(args))? {
            Some(raw_id) => self.get(&decode_id(&raw_id)?),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Moves the oldest pending job to running and returns it.
    ///
    /// Scans the jobs tree in id order and decodes every record on the way,
    /// finalized ones included, so a claim costs O(n) in the number of stored
    /// jobs.
    pub fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        for entry in self.jobs.iter() {
            let (_, raw) = entry?;
            let candidate = Job::decode(&raw)?;
            if candidate.state != JobState::Pending {
                continue;
            }

            // another worker may have claimed it since the scan read it
            let claimed = self.update(&candidate.id, |job| {
                (job.state == JobState::Pending).then(|| Job {
                    state: JobState::Running,
                    attempt: job.attempt + 1,
                    ..job
                })
            })?;
            if claimed.is_some() {
                return Ok(claimed);
            }
        }

        Ok(None)
    }

    pub fn complete(&self, id: &JobId) -> Result<Job, StoreError> {
        self.set_state(id, JobState::Completed)
    }

    /// Records a failed attempt. With `retry` the job goes back to pending,
    /// otherwise it is finalized as failed.
    pub fn fail(&self, id: &JobId, error: String, retry: bool) -> Result<Job, StoreError> {
        let next = if retry {
            JobState::Pending
        } else {
            JobState::Failed
        };
        self.update(id, |mut job| {
            job.errors.push(error.clone());
            job.finalize(next);
            Some(job)
        })?
        .ok_or_else(|| StoreError::MissingJob(id.to_string()))
    }

    /// Unconditionally moves a job to `state`.
    pub fn set_state(&self, id: &JobId, state: JobState) -> Result<Job, StoreError> {
        self.update(id, |mut job| {
            job.finalize(state);
            Some(job)
        })?
        .ok_or_else(|| StoreError::MissingJob(id.to_string()))
    }

    /// Returns jobs left running by a worker that died back to pending.
    /// Only safe while no worker is active.
    pub fn rescue_running(&self) -> Result<usize, StoreError> {
        let mut rescued = 0;
        for entry in self.jobs.iter() {
            let (_, raw) = entry?;
            let job = Job::decode(&raw)?;
            if job.state == JobState::Running {
                self.set_state(&job.id, JobState::Pending)?;
                rescued += 1;
            }
        }
        if rescued > 0 {
            info!(rescued, "returned orphaned running jobs to pending");
        }

        Ok(rescued)
    }

    /// Applies `f` to the stored job atomically. `f` returning `None` leaves
    /// the record as it is.
    fn update<F>(&self, id: &JobId, f: F) -> Result<Option<Job>, StoreError>
    where
        F: Fn(Job) -> Option<Job>,
    {
        let updated = self
            .jobs
            .transaction(|jobs| {
                let raw = jobs
                    .get(id.as_bytes())?
                    .ok_or_else(|| abort(StoreError::MissingJob(id.to_string())))?;
                let job = Job::decode(&raw).map_err(abort)?;

                match f(job) {
                    Some(next) => {
                        jobs.insert(id.as_bytes(), next.encode().map_err(abort)?)?;
                        Ok(Some(next))
                    }
                    None => Ok(None),
                }
            })
            .map_err(into_store_error)?;

        if let Some(job) = &updated {
            self.db.flush()?;
            debug!(job_id = %job.id, state = ?job.state, attempt = job.attempt, "job updated");
        }

        Ok(updated)
    }
}

/// The transactional view handed to [`JobStore::transaction`].
pub struct JobTx<'a> {
    jobs: &'a TransactionalTree,
    unique: &'a TransactionalTree,
}

impl JobTx<'_> {
    /// Inserts a job for `args` unless one with the same kind and unique key
    /// exists, in which case the existing job is returned instead.
    ///
    /// The lookup and the insert happen in the same transaction, so two
    /// callers racing on one key always end up sharing a single job.
    pub fn insert_unique<A: JobArgs>(&self, args: &A) -> TxResult<InsertResult> {
        let index_key = unique_index_key(args);

        if let Some(raw_id) = self.unique.get(&index_key)? {
            let id = decode_id(&raw_id).map_err(abort)?;
            let job = self
                .get(&id)?
                .ok_or_else(|| abort(StoreError::MissingJob(id.to_string())))?;

            return Ok(InsertResult {
                job,
                skipped_as_duplicate: true,
            });
        }

        let encoded_args = args.encode_args().map_err(abort)?;
        let job = Job::new(A::KIND, args.unique_key(), encoded_args);

        self.jobs
            .insert(job.id.as_bytes(), job.encode().map_err(abort)?)?;
        self.unique.insert(index_key, job.id.as_bytes())?;

        Ok(InsertResult {
            job,
            skipped_as_duplicate: false,
        })
    }

    pub fn get(&self, id: &JobId) -> TxResult<Option<Job>> {
        self.jobs
            .get(id.as_bytes())?
            .map(|raw| Job::decode(&raw).map_err(abort))
            .transpose()
    }
}

fn unique_index_key<A: JobArgs>(args: &A) -> Vec<u8> {
    let mut key = Vec::with_capacity(A::KIND.len() + 1 + 32);
    key.extend_from_slice(A::KIND.as_bytes());
    key.push(0);
    key.extend_from_slice(&args.unique_key());
    key
}

fn decode_id(raw: &[u8]) -> Result<JobId, StoreError> {
    JobId::from_slice(raw).ok_or_else(|| StoreError::MissingJob(format!("malformed id {raw:?}")))
}

fn abort(err: StoreError) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(err)
}

fn into_store_error(err: TransactionError<StoreError>) -> StoreError {
    match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => StoreError::Storage(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
    struct Ping {
        #[n(0)]
        key: String,
        #[n(1)]
        note: String,
    }

    impl JobArgs for Ping {
        const KIND: &'static str = "ping";

        fn unique_key(&self) -> Vec<u8> {
            self.key.as_bytes().to_vec()
        }
    }

    fn ping(key: &str, note: &str) -> Ping {
        Ping {
            key: key.into(),
            note: note.into(),
        }
    }

    #[test]
    fn inserts_once_per_unique_key() {
        let store = JobStore::temporary().unwrap();

        let first = store
            .transaction(|tx| tx.insert_unique(&ping("a", "one")))
            .unwrap();
        let second = store
            .transaction(|tx| tx.insert_unique(&ping("a", "two")))
            .unwrap();

        assert!(!first.skipped_as_duplicate);
        assert!(second.skipped_as_duplicate);
        assert_eq!(first.job, second.job);
        assert_eq!(second.job.decode_args::<Ping>().unwrap(), ping("a", "one"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn distinct_keys_get_distinct_jobs() {
        let store = JobStore::temporary().unwrap();

        for key in ["a", "b", "c"] {
            let res = store
                .transaction(|tx| tx.insert_unique(&ping(key, "same")))
                .unwrap();
            assert!(!res.skipped_as_duplicate);
        }

        assert_eq!(store.len(), 3);
        assert!(store.find_unique(&ping("b", "")).unwrap().is_some());
        assert!(store.find_unique(&ping("z", "")).unwrap().is_none());
    }

    #[test]
    fn aborted_transaction_leaves_nothing_behind() {
        let store = JobStore::temporary().unwrap();

        let res: Result<(), _> = store.transaction(|tx| {
            tx.insert_unique(&ping("a", "one"))?;
            Err(abort(StoreError::Encode("caller gave up".into())))
        });

        assert!(matches!(res, Err(StoreError::Encode(_))));
        assert!(store.is_empty());
        assert!(store.find_unique(&ping("a", "")).unwrap().is_none());
    }

    #[test]
    fn claim_complete_and_fail_lifecycle() {
        let store = JobStore::temporary().unwrap();
        let a = store
            .transaction(|tx| tx.insert_unique(&ping("a", "")))
            .unwrap()
            .job;
        let b = store
            .transaction(|tx| tx.insert_unique(&ping("b", "")))
            .unwrap()
            .job;

        let claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, a.id);
        assert_eq!(claimed.state, JobState::Running);
        assert_eq!(claimed.attempt, 1);

        let done = store.complete(&a.id).unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert!(done.finalized_at.is_some());

        let claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, b.id);
        let retried = store.fail(&b.id, "boom".into(), true).unwrap();
        assert_eq!(retried.state, JobState::Pending);
        assert_eq!(retried.errors, vec!["boom".to_string()]);

        store.claim_next().unwrap().unwrap();
        let failed = store.fail(&b.id, "boom again".into(), false).unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.attempt, 2);

        assert!(store.claim_next().unwrap().is_none());
    }

    #[test]
    fn rescues_orphaned_running_jobs() {
        let store = JobStore::temporary().unwrap();
        store
            .transaction(|tx| tx.insert_unique(&ping("a", "")))
            .unwrap();
        let claimed = store.claim_next().unwrap().unwrap();

        assert_eq!(store.rescue_running().unwrap(), 1);
        assert_eq!(store.get(&claimed.id).unwrap().unwrap().state, JobState::Pending);
    }

    #[test]
    fn concurrent_inserts_share_one_job() {
        let store = Arc::new(JobStore::temporary().unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .transaction(|tx| tx.insert_unique(&ping("race", "same")))
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<InsertResult> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| !r.skipped_as_duplicate).count(), 1);
        assert!(results.iter().all(|r| r.job.id == results[0].job.id));
        assert_eq!(store.len(), 1);
    }
}
