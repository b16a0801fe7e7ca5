/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/migration/retry.rs
*
* Exponential backoff for cluster operations that may fail transiently, such as
* scaling an owner that is being updated concurrently.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::config::RetryPolicy;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Runs `operation` until it succeeds or `policy.attempts` is exhausted,
/// doubling the delay between attempts up to `policy.max_delay`.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => {
                error!(operation = %operation_name, attempt, error = %e, "Operation failed after max retries");
                return Err(e);
            }
            Err(e) => {
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = next_delay(delay, policy);
            }
        }
    }
}

/// Doubles `delay`, capped at the policy maximum.
fn next_delay(delay: Duration, policy: &RetryPolicy) -> Duration {
    delay.checked_mul(2).unwrap_or(policy.max_delay).min(policy.max_delay)
}
