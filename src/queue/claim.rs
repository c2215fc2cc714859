//! Slot claims for `next()`
//!
//! Acquiring a slot and popping its job are two coordinator calls. Both run in
//! a detached task, so neither a failed checkout nor a caller that goes away
//! between the two leaves an occurrence stranded in Pending.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::QueueInner;
use crate::coordinator::Checkout;
use crate::error::{QueueError, QueueResult};
use crate::models::AckToken;
use crate::utils::now_ms;

/// A slot that was acquired and checked out
#[derive(Debug)]
pub(crate) struct Claim {
    pub(crate) destination: String,
    pub(crate) token: String,
    pub(crate) checkout: Checkout,
}

/// Wait up to one block timeout for a slot and check it out.
///
/// `None` means no slot arrived in time. Dropping the returned future undoes
/// whatever the claim got as far as.
pub(crate) async fn claim_next(inner: &Arc<QueueInner>) -> QueueResult<Option<Claim>> {
    let (tx, rx) = oneshot::channel();
    let task_inner = Arc::clone(inner);

    tokio::spawn(async move {
        let result = claim(&task_inner).await;
        if let Err(Ok(Some(unclaimed))) = tx.send(result) {
            abandon(&task_inner, unclaimed).await;
        }
    });

    rx.await
        .map_err(|_| QueueError::sanity("slot claim task ended without a reply"))?
}

async fn claim(inner: &QueueInner) -> QueueResult<Option<Claim>> {
    let coordinator = &inner.coordinator;

    let Some(destination) = coordinator
        .acquire_slot(inner.config.block_timeout())
        .await?
    else {
        return Ok(None);
    };

    if !inner.active.load(Ordering::SeqCst) {
        coordinator.return_slot(&destination).await?;
        return Err(QueueError::NotActive);
    }

    let token = AckToken::mint_id();
    match coordinator
        .checkout(&destination, &inner.instance_id, &token, now_ms())
        .await
    {
        Ok(checkout) => Ok(Some(Claim {
            destination,
            token,
            checkout,
        })),
        Err(e) => {
            warn!(destination = %destination, error = %e, "Checkout failed, returning slot");
            if let Err(undo) = coordinator.return_slot(&destination).await {
                warn!(
                    destination = %destination,
                    error = %undo,
                    "Failed to return slot after checkout error"
                );
            }
            Err(e)
        }
    }
}

/// Undo a claim nobody is waiting for
async fn abandon(inner: &QueueInner, claim: Claim) {
    let Checkout::Dispatched(_) = claim.checkout else {
        return;
    };

    match inner
        .coordinator
        .requeue(&inner.instance_id, &claim.token, &claim.destination)
        .await
    {
        Ok(_) => debug!(destination = %claim.destination, "Unclaimed job requeued"),
        Err(e) => warn!(
            destination = %claim.destination,
            error = %e,
            "Failed to requeue unclaimed job, left for recovery"
        ),
    }
}
