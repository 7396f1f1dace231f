//! Purchase event source
//!
//! The vendor pushes `(response code, purchases)` through a synchronous
//! callback. [`PurchaseUpdateSink`] translates each callback into
//! [`PurchaseUpdate`]s and queues them on an unbounded channel;
//! [`PurchaseEventStream`] is the single consumer side.
//!
//! ```text
//! vendor callback ──▶ PurchaseUpdateSink ──mpsc──▶ PurchaseEventStream ──▶ event loop
//! ```
//!
//! No reordering or deduplication happens here.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::{Purchase, PurchaseUpdate, ResponseCode};

/// Create a connected sink/stream pair
pub fn purchase_event_channel() -> (PurchaseUpdateSink, PurchaseEventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PurchaseUpdateSink { tx }, PurchaseEventStream { rx })
}

/// Vendor-facing side of the event channel
#[derive(Debug, Clone)]
pub struct PurchaseUpdateSink {
    tx: mpsc::UnboundedSender<PurchaseUpdate>,
}

impl PurchaseUpdateSink {
    /// Handle one vendor callback.
    ///
    /// Returns the number of updates queued.
    pub fn on_purchases_updated(
        &self,
        code: ResponseCode,
        purchases: Option<Vec<Purchase>>,
    ) -> usize {
        let updates = translate(code, purchases);
        let count = updates.len();
        for update in updates {
            debug!(kind = update.label(), "Queueing purchase update");
            if self.tx.send(update).is_err() {
                warn!("Purchase update dropped: event stream is gone");
                return 0;
            }
        }
        count
    }

    /// Whether the consumer side has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Map a vendor callback onto updates
pub fn translate(code: ResponseCode, purchases: Option<Vec<Purchase>>) -> Vec<PurchaseUpdate> {
    match code {
        ResponseCode::Ok => match purchases {
            Some(list) if !list.is_empty() => list
                .into_iter()
                .map(|purchase| PurchaseUpdate::Success { purchase })
                .collect(),
            // OK with nothing attached is reported, not swallowed
            _ => vec![PurchaseUpdate::Failure {
                code: ResponseCode::Error,
            }],
        },
        ResponseCode::UserCanceled => vec![PurchaseUpdate::UserCancelled],
        other => vec![PurchaseUpdate::Failure { code: other }],
    }
}

/// Consumer side of the event channel
#[derive(Debug)]
pub struct PurchaseEventStream {
    rx: mpsc::UnboundedReceiver<PurchaseUpdate>,
}

impl PurchaseEventStream {
    /// Receive the next update; `None` once every sink is dropped
    pub async fn next_update(&mut self) -> Option<PurchaseUpdate> {
        self.rx.recv().await
    }
}

impl Stream for PurchaseEventStream {
    type Item = PurchaseUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PurchaseState;
    use futures::StreamExt;

    fn purchase(token: &str) -> Purchase {
        Purchase::new(token, ["test1"], PurchaseState::Purchased)
    }

    #[test]
    fn test_ok_with_purchases_yields_success_per_purchase() {
        let updates = translate(ResponseCode::Ok, Some(vec![purchase("a"), purchase("b")]));
        assert_eq!(updates.len(), 2);
        let tokens: Vec<_> = updates
            .iter()
            .map(|update| match update {
                PurchaseUpdate::Success { purchase } => purchase.token.as_str(),
                other => panic!("unexpected update: {other:?}"),
            })
            .collect();
        assert_eq!(tokens, vec!["a", "b"]);
    }

    #[test]
    fn test_ok_without_purchases_is_generic_failure() {
        for purchases in [None, Some(vec![])] {
            let updates = translate(ResponseCode::Ok, purchases);
            assert_eq!(
                updates,
                vec![PurchaseUpdate::Failure {
                    code: ResponseCode::Error
                }]
            );
        }
    }

    #[test]
    fn test_cancel_and_failure_codes() {
        assert_eq!(
            translate(ResponseCode::UserCanceled, Some(vec![purchase("x")])),
            vec![PurchaseUpdate::UserCancelled]
        );
        assert_eq!(
            translate(ResponseCode::ItemAlreadyOwned, None),
            vec![PurchaseUpdate::Failure {
                code: ResponseCode::ItemAlreadyOwned
            }]
        );
    }

    #[tokio::test]
    async fn test_stream_preserves_delivery_order() {
        let (sink, mut stream) = purchase_event_channel();

        sink.on_purchases_updated(ResponseCode::Ok, Some(vec![purchase("1")]));
        sink.on_purchases_updated(ResponseCode::UserCanceled, None);
        sink.on_purchases_updated(ResponseCode::Ok, Some(vec![purchase("1")]));

        assert!(matches!(stream.next().await, Some(PurchaseUpdate::Success { .. })));
        assert_eq!(stream.next().await, Some(PurchaseUpdate::UserCancelled));
        // Duplicates pass through untouched
        assert!(matches!(stream.next_update().await, Some(PurchaseUpdate::Success { .. })));

        drop(sink);
        assert_eq!(stream.next().await, None);
    }

    #[test]
    fn test_stream_wakes_on_callback() {
        let (sink, mut stream) = purchase_event_channel();
        let mut next = tokio_test::task::spawn(stream.next_update());
        tokio_test::assert_pending!(next.poll());

        sink.on_purchases_updated(ResponseCode::UserCanceled, None);
        assert!(next.is_woken());
        assert_eq!(
            tokio_test::assert_ready!(next.poll()),
            Some(PurchaseUpdate::UserCancelled)
        );
    }

    #[test]
    fn test_sink_reports_closed_stream() {
        let (sink, stream) = purchase_event_channel();
        drop(stream);
        assert!(sink.is_closed());
        assert_eq!(sink.on_purchases_updated(ResponseCode::Ok, Some(vec![purchase("z")])), 0);
    }
}
