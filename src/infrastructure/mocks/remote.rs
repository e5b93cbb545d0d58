//! Scriptable remote service client for testing.

use crate::application::ports::RemoteServiceClient;
use crate::domain::remote::{
    AllocateQuotaRequest, AllocateQuotaResponse, CheckRequest, CheckResponse, RemoteError,
    ReportRequest,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Remote client double with call counters and scripted answers.
///
/// By default every check is allowed, every quota request is granted in
/// full and every report succeeds. Clones share state, so a test can keep
/// one clone for assertions and hand another to the code under test.
///
/// # Examples
///
/// ```
/// use service_control_adapter::infrastructure::mocks::MockRemoteClient;
/// use service_control_adapter::domain::remote::CheckResponse;
///
/// let client = MockRemoteClient::new();
/// client.set_check_response(Ok(CheckResponse::denied("API key not valid")));
/// assert_eq!(client.check_calls(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockRemoteClient {
    inner: Arc<MockInner>,
}

#[derive(Debug, Default)]
struct MockInner {
    check_calls: AtomicUsize,
    quota_calls: AtomicUsize,
    report_calls: AtomicUsize,
    check_response: Mutex<Option<Result<CheckResponse, RemoteError>>>,
    scripted_checks: Mutex<VecDeque<Result<CheckResponse, RemoteError>>>,
    quota_response: Mutex<Option<Result<AllocateQuotaResponse, RemoteError>>>,
    report_failures: AtomicUsize,
    delay: Mutex<Duration>,
    check_requests: Mutex<Vec<CheckRequest>>,
    quota_requests: Mutex<Vec<AllocateQuotaRequest>>,
    reports: Mutex<Vec<ReportRequest>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .expect("MockRemoteClient mutex poisoned - a test thread panicked while holding the lock")
}

impl MockRemoteClient {
    /// Create a client that allows and grants everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every check with `response` (after any scripted answers).
    pub fn set_check_response(&self, response: Result<CheckResponse, RemoteError>) {
        *lock(&self.inner.check_response) = Some(response);
    }

    /// Queue a one-shot check answer, used before the default one.
    pub fn push_check_response(&self, response: Result<CheckResponse, RemoteError>) {
        lock(&self.inner.scripted_checks).push_back(response);
    }

    /// Answer every quota allocation with `response` instead of granting in full.
    pub fn set_quota_response(&self, response: Result<AllocateQuotaResponse, RemoteError>) {
        *lock(&self.inner.quota_response) = Some(response);
    }

    /// Make the next `count` report calls fail.
    pub fn fail_reports(&self, count: usize) {
        self.inner.report_failures.store(count, Ordering::SeqCst);
    }

    /// Delay every call by `delay` (tokio time).
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.inner.delay) = delay;
    }

    /// Number of check calls received.
    pub fn check_calls(&self) -> usize {
        self.inner.check_calls.load(Ordering::SeqCst)
    }

    /// Number of quota allocation calls received.
    pub fn quota_calls(&self) -> usize {
        self.inner.quota_calls.load(Ordering::SeqCst)
    }

    /// Number of report calls received, failed ones included.
    pub fn report_calls(&self) -> usize {
        self.inner.report_calls.load(Ordering::SeqCst)
    }

    /// Every check request received, in order.
    pub fn check_requests(&self) -> Vec<CheckRequest> {
        lock(&self.inner.check_requests).clone()
    }

    /// Every quota request received, in order.
    pub fn quota_requests(&self) -> Vec<AllocateQuotaRequest> {
        lock(&self.inner.quota_requests).clone()
    }

    /// Every report request received, failed ones included.
    pub fn reports(&self) -> Vec<ReportRequest> {
        lock(&self.inner.reports).clone()
    }

    async fn pause(&self) {
        let delay = *lock(&self.inner.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RemoteServiceClient for MockRemoteClient {
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, RemoteError> {
        self.inner.check_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.check_requests).push(request);
        self.pause().await;

        if let Some(scripted) = lock(&self.inner.scripted_checks).pop_front() {
            return scripted;
        }
        lock(&self.inner.check_response)
            .clone()
            .unwrap_or_else(|| Ok(CheckResponse::allowed()))
    }

    async fn allocate_quota(
        &self,
        request: AllocateQuotaRequest,
    ) -> Result<AllocateQuotaResponse, RemoteError> {
        self.inner.quota_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.quota_requests).push(request.clone());
        self.pause().await;

        match lock(&self.inner.quota_response).clone() {
            Some(response) => response,
            None => Ok(AllocateQuotaResponse {
                granted: request.quotas,
                denials: Vec::new(),
            }),
        }
    }

    async fn report(&self, request: ReportRequest) -> Result<(), RemoteError> {
        self.inner.report_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.reports).push(request);
        self.pause().await;

        let failing = self
            .inner
            .report_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            Err(RemoteError::Unavailable("scripted report failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_request() -> CheckRequest {
        CheckRequest {
            service_name: "svc".to_string(),
            consumer_id: "api_key:k".to_string(),
            operation_name: "Get".to_string(),
        }
    }

    #[tokio::test]
    async fn test_scripted_then_default_check() {
        let client = MockRemoteClient::new();
        client.push_check_response(Err(RemoteError::Unavailable("down".to_string())));

        assert!(client.check(check_request()).await.is_err());
        assert_eq!(client.check(check_request()).await, Ok(CheckResponse::allowed()));
        assert_eq!(client.check_calls(), 2);
    }

    #[tokio::test]
    async fn test_report_failures_count_down() {
        let client = MockRemoteClient::new();
        client.fail_reports(2);
        let request = ReportRequest {
            service_name: "svc".to_string(),
            metric_value_sets: Vec::new(),
        };

        assert!(client.report(request.clone()).await.is_err());
        assert!(client.report(request.clone()).await.is_err());
        assert!(client.report(request).await.is_ok());
        assert_eq!(client.reports().len(), 3);
    }
}
