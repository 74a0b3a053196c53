use redis::aio::MultiplexedConnection;

use crate::error::ApiError;

/// Checks an email-keyed rate limit stored in Redis.
///
/// Uses the INCR + EXPIRE strategy:
/// - Increments a counter for `key`
/// - On first increment, sets TTL to `window_secs`
/// - Fails with `too_many_attempts` once the counter exceeds `max_attempts`
///
/// Without a Redis connection every request is allowed. Redis errors count
/// as zero so an outage never locks users out.
pub async fn check_rate_limit(
    redis: Option<&MultiplexedConnection>,
    key: &str,
    max_attempts: u64,
    window_secs: u64,
) -> Result<(), ApiError> {
    let Some(redis) = redis else {
        return Ok(());
    };
    let mut redis = redis.clone();

    let count: u64 = redis::cmd("INCR")
        .arg(key)
        .query_async(&mut redis)
        .await
        .unwrap_or(0);

    if count == 1 {
        // Set TTL only on first increment to avoid resetting the window on each attempt
        let _: Result<(), _> = redis::cmd("EXPIRE")
            .arg(key)
            .arg(window_secs)
            .query_async(&mut redis)
            .await;
    }

    if count > max_attempts {
        tracing::info!("rate limit hit for {key}");
        return Err(ApiError::TooManyAttempts);
    }

    Ok(())
}
