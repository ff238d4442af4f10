pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

/// Re-runs a fallible async operation with doubling back-off. Only meant for
/// startup work such as the instrument download; order calls are never retried.
macro_rules! retry_operation {
    ($context:expr, $operation:expr) => {
        $crate::retry::retry_operation!(
            $context,
            $crate::retry::DEFAULT_ATTEMPTS,
            $crate::retry::DEFAULT_INITIAL_DELAY,
            $operation
        )
    };
    ($context:expr, $attempts:expr, $initial_delay:expr, $operation:expr) => {{
        let max_attempts: u32 = ($attempts).max(1);
        let mut delay: std::time::Duration = $initial_delay;
        let context_value: String = $context.into();
        let mut attempt = 1;

        loop {
            match ($operation).await {
                Ok(value) => {
                    if attempt > 1 {
                        log::info!("{} succeeded on attempt {}", context_value, attempt);
                    }
                    break Ok(value);
                }
                Err(err) if attempt >= max_attempts => {
                    log::error!(
                        "{} failed after {} attempts: {}",
                        context_value,
                        max_attempts,
                        err
                    );
                    break Err(err);
                }
                Err(err) => {
                    log::warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {:?}.",
                        attempt,
                        max_attempts,
                        context_value,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_operation;
