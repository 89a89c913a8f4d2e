use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tributary::processor::{ExecutionError, RecordApi, SUCCESS_MESSAGE};
use tributary::storage::Record;

#[derive(Debug, Clone, Copy)]
enum Script {
    /// Fail this many times with the status, then succeed
    FailTimes(usize, u16),
    FailAlways(u16),
    /// Answer 429 with a retry delay this many times, then succeed
    Throttle(usize, u64),
}

/// Downstream API double whose failures are scripted per email
#[derive(Default)]
pub struct ScriptedApi {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_times(self, email: &str, times: usize, status: u16) -> Self {
        self.scripts
            .lock()
            .insert(email.to_string(), Script::FailTimes(times, status));
        self
    }

    pub fn fail_always(self, email: &str, status: u16) -> Self {
        self.scripts
            .lock()
            .insert(email.to_string(), Script::FailAlways(status));
        self
    }

    pub fn throttle(self, email: &str, times: usize, retry_after: u64) -> Self {
        self.scripts
            .lock()
            .insert(email.to_string(), Script::Throttle(times, retry_after));
        self
    }

    pub fn calls_for(&self, email: &str) -> usize {
        self.calls.lock().get(email).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordApi for ScriptedApi {
    async fn submit(&self, record: &Record) -> Result<String, ExecutionError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut calls = self.calls.lock();
            let n = calls.entry(record.email.clone()).or_insert(0);
            *n += 1;
            *n
        };

        let script = self.scripts.lock().get(&record.email).copied();
        match script {
            Some(Script::FailTimes(times, status)) if attempt <= times => Err(ExecutionError::new(
                Some(status),
                format!("HTTP {} from downstream", status),
            )),
            Some(Script::FailAlways(status)) => Err(ExecutionError::new(
                Some(status),
                format!("HTTP {} from downstream", status),
            )),
            Some(Script::Throttle(times, secs)) if attempt <= times => {
                Err(ExecutionError::new(Some(429), "HTTP 429 from downstream").with_retry_after(secs))
            }
            _ => Ok(SUCCESS_MESSAGE.to_string()),
        }
    }
}
