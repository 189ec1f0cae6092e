//! Service layer API for email submission
use super::email::{EmailCreateRequest, EmailCreateResponse, SendEmailArgs};
use super::error::ApiError;
use super::handler::RequestContext;
use super::job::JobState;
use super::store::{InsertResult, JobStore};
use tracing::{debug, info};

pub const QUEUED_MESSAGE: &str = "Email has been queued for sending.";
pub const PENDING_MESSAGE: &str = "Email was already queued and is pending send.";
pub const SENT_MESSAGE: &str = "Email has been sent.";
pub const FAILED_MESSAGE: &str = "Email could not be sent and will not be retried.";
pub const MISMATCH_MESSAGE: &str =
    "Incoming parameters don't match those of queued email. You may have a bug.";

/// How a submission relates to what the store already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// First time this account and idempotency key were seen.
    Queued,
    /// Same key, same email, not yet worked to completion.
    AlreadyQueued,
    AlreadySent,
    AlreadyFailed,
    /// Same key but a different email: the caller reused a key.
    Mismatch,
}

impl Outcome {
    pub fn classify(inserted: &InsertResult, existing: &SendEmailArgs, incoming: &SendEmailArgs) -> Self {
        if !inserted.skipped_as_duplicate {
            return Outcome::Queued;
        }
        if !existing.same_payload(incoming) {
            return Outcome::Mismatch;
        }

        match inserted.job.state {
            JobState::Completed => Outcome::AlreadySent,
            JobState::Failed => Outcome::AlreadyFailed,
            JobState::Pending | JobState::Running => Outcome::AlreadyQueued,
        }
    }

    pub fn into_response(self) -> Result<EmailCreateResponse, ApiError> {
        let message = match self {
            Outcome::Queued => QUEUED_MESSAGE,
            Outcome::AlreadyQueued => PENDING_MESSAGE,
            Outcome::AlreadySent => SENT_MESSAGE,
            Outcome::AlreadyFailed => FAILED_MESSAGE,
            Outcome::Mismatch => return Err(ApiError::bad_request(MISMATCH_MESSAGE)),
        };
        Ok(EmailCreateResponse::new(message))
    }
}

#[derive(Clone)]
pub struct EmailService {
    store: JobStore,
}

impl EmailService {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Admits an email for sending at most once per account and idempotency key.
    ///
    /// Store work runs on the blocking pool. If the caller goes away the
    /// transaction still either commits whole or not at all.
    pub async fn email_create(
        &self,
        ctx: RequestContext,
        req: EmailCreateRequest,
    ) -> anyhow::Result<EmailCreateResponse> {
        ctx.ensure_live()?;

        let service = self.clone();
        tokio::task::spawn_blocking(move || service.submit(&req)).await?
    }

    /// The synchronous core of [`EmailService::email_create`].
    pub fn submit(&self, req: &EmailCreateRequest) -> anyhow::Result<EmailCreateResponse> {
        let incoming = SendEmailArgs::from(req);

        // committed by the time this returns
        let inserted = self.store.transaction(|tx| tx.insert_unique(&incoming))?;

        let outcome = if inserted.skipped_as_duplicate {
            let existing: SendEmailArgs = inserted.job.decode_args()?;
            Outcome::classify(&inserted, &existing, &incoming)
        } else {
            Outcome::Queued
        };

        match outcome {
            Outcome::Queued => info!(job_id = %inserted.job.id, "email queued"),
            outcome => debug!(job_id = %inserted.job.id, ?outcome, "duplicate submission"),
        }

        Ok(outcome.into_response()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use uuid::Uuid;

    fn args(subject: &str) -> SendEmailArgs {
        SendEmailArgs {
            account_id: Uuid::nil(),
            body: "Hello".into(),
            email_recipient: "r@example.com".into(),
            email_sender: "s@example.com".into(),
            idempotency_key: Uuid::nil(),
            subject: subject.into(),
        }
    }

    fn duplicate_in(state: JobState) -> InsertResult {
        let mut job = Job::new("send_email", vec![], vec![]);
        job.state = state;
        InsertResult {
            job,
            skipped_as_duplicate: true,
        }
    }

    #[test]
    fn classifies_every_duplicate_state() {
        let a = args("Hi");
        let cases = [
            (JobState::Pending, Outcome::AlreadyQueued),
            (JobState::Running, Outcome::AlreadyQueued),
            (JobState::Completed, Outcome::AlreadySent),
            (JobState::Failed, Outcome::AlreadyFailed),
        ];

        for (state, expected) in cases {
            assert_eq!(Outcome::classify(&duplicate_in(state), &a, &a), expected);
        }
    }

    #[test]
    fn mismatch_wins_over_state() {
        let outcome = Outcome::classify(&duplicate_in(JobState::Completed), &args("Hi"), &args("Bye"));

        assert_eq!(outcome, Outcome::Mismatch);
        assert_eq!(
            outcome.into_response().unwrap_err(),
            ApiError::bad_request(MISMATCH_MESSAGE)
        );
    }
}
