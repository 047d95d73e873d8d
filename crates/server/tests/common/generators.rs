//! Scripted generators for exercising retry, failure and cancellation.

use async_trait::async_trait;
use quire_engine::{GenerationError, GenerationRequest, Generator};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Fails transiently `failures` times, then succeeds.
#[allow(dead_code)]
pub struct FlakyGenerator {
    failures: u32,
    calls: AtomicU32,
}

#[allow(dead_code)]
impl FlakyGenerator {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for FlakyGenerator {
    async fn invoke(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(GenerationError::Transient(format!(
                "upstream unavailable (call {call})"
            )));
        }
        Ok(format!("section for {}", request.document.name))
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

/// Always fails with a fatal error.
#[allow(dead_code)]
pub struct RejectingGenerator;

#[async_trait]
impl Generator for RejectingGenerator {
    async fn invoke(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
        Err(GenerationError::Fatal("input rejected by policy".to_string()))
    }

    fn name(&self) -> &'static str {
        "rejecting"
    }
}

/// Succeeds after a fixed delay.
#[allow(dead_code)]
pub struct SlowGenerator(pub Duration);

#[async_trait]
impl Generator for SlowGenerator {
    async fn invoke(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        tokio::time::sleep(self.0).await;
        Ok(format!("step {} of {}", request.step, request.total_steps))
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}
