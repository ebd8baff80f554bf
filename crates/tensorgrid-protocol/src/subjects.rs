//! Bus subject construction and parsing.
//!
//! Subjects are logical addresses, independent of the transport carrying
//! them. Dispatch and usage subjects embed the addressed entity so a
//! subscriber can filter by prefix.

/// Durable queue of job submissions.
pub const JOBS_SUBMITTED: &str = "jobs.submitted";

const DISPATCH_PREFIX: &str = "tasks.dispatch";
const STATUS_PREFIX: &str = "task.status";
const USAGE_PREFIX: &str = "billing.usage";

/// Subject a task descriptor is published to for one provider and job.
pub fn dispatch(provider_id: &str, job_id: &str) -> String {
    format!("{DISPATCH_PREFIX}.{provider_id}.{job_id}")
}

/// Prefix matching every dispatch addressed to a provider.
pub fn dispatch_scope(provider_id: &str) -> String {
    format!("{DISPATCH_PREFIX}.{provider_id}.")
}

/// Subject carrying status updates for a job.
pub fn status(job_id: &str) -> String {
    format!("{STATUS_PREFIX}.{job_id}")
}

/// Prefix matching status updates for every job.
pub fn status_scope() -> String {
    format!("{STATUS_PREFIX}.")
}

/// Subject carrying usage samples for a session.
pub fn usage(session_id: &str) -> String {
    format!("{USAGE_PREFIX}.{session_id}")
}

/// Prefix matching usage samples for every session.
pub fn usage_scope() -> String {
    format!("{USAGE_PREFIX}.")
}

/// Extract the job id from a status subject, if it is one.
pub fn parse_status(subject: &str) -> Option<&str> {
    subject
        .strip_prefix(STATUS_PREFIX)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|id| !id.is_empty())
}

/// Extract the session id from a usage subject, if it is one.
pub fn parse_usage(subject: &str) -> Option<&str> {
    subject
        .strip_prefix(USAGE_PREFIX)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|id| !id.is_empty())
}
