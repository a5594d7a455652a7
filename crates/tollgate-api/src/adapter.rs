//! Handler adapter: runs a protected operation under an idempotency claim.
//!
//! The adapter does bookkeeping only. On success it serializes the result,
//! records it with `complete`, and only then hands it back for the response.
//! On failure it releases the key so the same request can be retried.
//!
//! Admitted operations run on their own task, so a client disconnect does not
//! abandon a record in `PROCESSING`.

use std::fmt;
use std::future::Future;

use bytes::Bytes;
use serde::Serialize;
use tracing::Instrument;

use crate::error::ApiError;
use crate::gate::IdempotencyClaim;
use crate::metrics::record_execution;

/// Result of a successful protected operation.
#[derive(Debug, Clone)]
pub struct Executed<T> {
    /// Value returned by the operation.
    pub value: T,
    /// Canonical JSON encoding of `value`, as stored for replay.
    pub payload: Bytes,
}

/// Runs `operation`, resolving `claim` with its outcome.
///
/// Without a claim (unprotected or key-less request) the operation runs
/// inline with no store bookkeeping.
///
/// # Errors
///
/// Returns the operation's error (converted to [`ApiError`]) after releasing
/// the key, or an internal error if the operation panicked or its result
/// could not be serialized.
pub async fn execute<T, E, F>(
    claim: Option<IdempotencyClaim>,
    operation: F,
) -> Result<Executed<T>, ApiError>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Serialize + Send + 'static,
    E: Into<ApiError> + fmt::Display + Send + 'static,
{
    let Some(claim) = claim else {
        let value = operation.await.map_err(Into::into)?;
        let payload = encode(&value)?;
        return Ok(Executed { value, payload });
    };

    claim.hand_off();
    let task_claim = claim.clone();
    let task = tokio::spawn(
        async move { run_claimed(task_claim, operation).await }.instrument(tracing::Span::current()),
    );

    match task.await {
        Ok(result) => result,
        Err(join_error) => {
            tracing::error!(
                key = claim.key().fingerprint(),
                error = %join_error,
                "Protected operation aborted; releasing key"
            );
            claim.release().await;
            record_execution("aborted");
            Err(ApiError::internal("Operation aborted"))
        }
    }
}

async fn run_claimed<T, E, F>(claim: IdempotencyClaim, operation: F) -> Result<Executed<T>, ApiError>
where
    F: Future<Output = Result<T, E>>,
    T: Serialize,
    E: Into<ApiError> + fmt::Display,
{
    let value = match operation.await {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(
                key = claim.key().fingerprint(),
                error = %error,
                "Protected operation failed; releasing key"
            );
            claim.release().await;
            record_execution("failed");
            return Err(error.into());
        }
    };

    let payload = match encode(&value) {
        Ok(payload) => payload,
        Err(err) => {
            claim.release().await;
            record_execution("failed");
            return Err(err);
        }
    };

    // The operation already ran: a failed completion write is logged, not returned.
    if let Err(error) = claim.complete(payload.clone()).await {
        tracing::error!(
            key = claim.key().fingerprint(),
            error = %error,
            "Failed to record completed operation"
        );
    }
    record_execution("completed");
    tracing::debug!(key = claim.key().fingerprint(), "Protected operation completed");

    Ok(Executed { value, payload })
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, ApiError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| ApiError::internal(format!("failed to encode response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use axum::http::StatusCode;
    use tollgate_core::{IdempotencyStore, KeyStatus, MemoryIdempotencyStore, RecordKey};

    #[derive(Debug, Serialize)]
    struct Receipt {
        id: u32,
    }

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("boom")
        }
    }

    impl From<Boom> for ApiError {
        fn from(_: Boom) -> Self {
            Self::operation_failed("boom")
        }
    }

    async fn claimed(raw: &str) -> (Arc<dyn IdempotencyStore>, IdempotencyClaim) {
        let store: Arc<dyn IdempotencyStore> = Arc::new(MemoryIdempotencyStore::default());
        let record_key = RecordKey::unscoped(raw.parse().unwrap());
        assert!(store.begin_if_absent(&record_key).await.unwrap());
        let claim = IdempotencyClaim::new(record_key, Arc::clone(&store));
        (store, claim)
    }

    #[tokio::test]
    async fn success_completes_before_returning() {
        let (store, claim) = claimed("adapter-ok").await;
        let record_key = claim.record_key().clone();

        let executed = execute(Some(claim.clone()), async { Ok::<_, Boom>(Receipt { id: 7 }) })
            .await
            .unwrap();

        assert!(claim.is_handed_off());
        assert_eq!(executed.value.id, 7);
        assert_eq!(&executed.payload[..], b"{\"id\":7}");
        assert_eq!(
            store.status(&record_key).await.unwrap(),
            KeyStatus::Completed(executed.payload)
        );
    }

    #[tokio::test]
    async fn failure_releases_key() {
        let (store, claim) = claimed("adapter-fail").await;
        let record_key = claim.record_key().clone();

        let err = execute(Some(claim), async { Err::<Receipt, _>(Boom) })
            .await
            .unwrap_err();

        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(store.status(&record_key).await.unwrap(), KeyStatus::NotFound);
    }

    #[tokio::test]
    async fn panic_releases_key() {
        let (store, claim) = claimed("adapter-panic").await;
        let record_key = claim.record_key().clone();

        let err = execute(Some(claim), async {
            if true {
                panic!("operation panicked");
            }
            Ok::<Receipt, Boom>(Receipt { id: 0 })
        })
        .await
        .unwrap_err();

        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(store.status(&record_key).await.unwrap(), KeyStatus::NotFound);
    }

    #[tokio::test]
    async fn without_claim_runs_inline() {
        let executed = execute(None, async { Ok::<_, Boom>(Receipt { id: 1 }) })
            .await
            .unwrap();
        assert_eq!(&executed.payload[..], b"{\"id\":1}");
    }

    #[tokio::test]
    async fn dropped_caller_still_completes() {
        let (store, claim) = claimed("adapter-detached").await;
        let record_key = claim.record_key().clone();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let caller = tokio::spawn(execute(Some(claim), async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok::<_, Boom>(Receipt { id: 9 })
        }));
        started_rx.await.unwrap();
        caller.abort();
        let _ = caller.await;

        release_tx.send(()).unwrap();
        for _ in 0..100 {
            if matches!(store.status(&record_key).await.unwrap(), KeyStatus::Completed(_)) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("operation did not complete after caller was dropped");
    }
}
