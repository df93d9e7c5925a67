// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! Bounded exponential backoff for transient transport faults. The same policy
//! guards connection attempts and delivery acknowledgements.
//!
//! With the default policy an operation is tried once and then retried up to five
//! times, waiting 2, 4, 8, 16 and 32 seconds before each retry. Only errors for
//! which [`AmqpError::is_transient`] returns true are retried; anything else is
//! returned to the caller straight away.

use crate::errors::AmqpError;
use std::{future::Future, time::Duration};
use tokio::time::sleep;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub retries: u32,
    /// Delay before the first retry.
    pub first: Duration,
    /// Multiplicative growth factor between retries.
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries: 5,
            first: Duration::from_secs(2),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-indexed): `first × factor^(retry - 1)`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        Duration::from_secs_f64(self.first.as_secs_f64() * self.factor.powi(exp))
    }

    /// Runs `op` until it succeeds, fails with a non-transient error or the
    /// retries are exhausted. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, AmqpError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let mut retry = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && retry < self.retries => {
                    retry += 1;
                    let wait = self.delay(retry);
                    warn!(
                        error = err.to_string(),
                        retry,
                        wait_secs = wait.as_secs(),
                        "{} failed, retrying",
                        operation
                    );
                    sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
