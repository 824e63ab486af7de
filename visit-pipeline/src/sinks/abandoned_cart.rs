use std::sync::Arc;

use async_trait::async_trait;

use super::{check_backlog, publish_with_retry, SinkProcessor};
use crate::error::SinkError;
use crate::event::{LastAction, SourceRecord, VisitEvent};
use crate::retry::RetryPolicy;
use crate::stores::stream::{OutputMessage, OutputStream};

pub const NAME: &str = "abandoned_cart";

pub fn is_abandoned_cart(event: &VisitEvent) -> bool {
    event.last_action == LastAction::ShoppingCart
}

/// Republishes visits that ended on the shopping cart, with their original
/// payload and keyed by country.
///
/// Messages still unpublished after the retries go out first with the next
/// batch. The checkpoint is held back until they do, so a restart republishes
/// them instead of losing them.
pub struct AbandonedCartFilter {
    stream: Arc<dyn OutputStream>,
    retry_policy: RetryPolicy,
    max_pending: usize,
    pending: Vec<OutputMessage>,
}

impl AbandonedCartFilter {
    pub fn new(
        stream: Arc<dyn OutputStream>,
        retry_policy: RetryPolicy,
        max_pending: usize,
    ) -> Self {
        Self {
            stream,
            retry_policy,
            max_pending,
            pending: Vec::new(),
        }
    }
}

#[async_trait]
impl SinkProcessor for AbandonedCartFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn process(&mut self, records: &[SourceRecord]) -> Result<(), SinkError> {
        self.pending.extend(
            records
                .iter()
                .filter(|record| is_abandoned_cart(&record.event))
                .map(OutputMessage::from_record),
        );
        if self.pending.is_empty() {
            return Ok(());
        }

        let published = publish_with_retry(
            NAME,
            self.stream.as_ref(),
            &self.retry_policy,
            &mut self.pending,
        )
        .await;
        check_backlog(NAME, self.pending.len(), self.max_pending)?;
        published
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        publish_with_retry(
            NAME,
            self.stream.as_ref(),
            &self.retry_policy,
            &mut self.pending,
        )
        .await
    }

    fn can_advance(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::stores::stream::MemoryOutputStream;

    fn record(offset: i64, country: &str, action: LastAction) -> SourceRecord {
        let event = VisitEvent {
            country: country.to_string(),
            last_action: action,
            visit_date: DateTime::from_timestamp(1_700_000_000 + offset, 0).unwrap(),
            duration: 7,
        };
        SourceRecord::from_event(0, offset, event).unwrap()
    }

    fn filter(stream: Arc<MemoryOutputStream>) -> AbandonedCartFilter {
        AbandonedCartFilter::new(stream, RetryPolicy::immediate(3), 100)
    }

    #[tokio::test]
    async fn republishes_only_shopping_cart_visits() {
        let stream = Arc::new(MemoryOutputStream::new("abandoned_carts"));
        let mut filter = filter(stream.clone());

        let records: Vec<_> = LastAction::ALL
            .into_iter()
            .enumerate()
            .map(|(i, action)| record(i as i64, "USA", action))
            .chain([record(4, "India", LastAction::ShoppingCart)])
            .collect();
        filter.process(&records).await.unwrap();

        let messages = stream.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].key, "USA");
        assert_eq!(messages[1].key, "India");
        assert_eq!(
            stream.events(),
            vec![records[3].event.clone(), records[4].event.clone()]
        );
    }

    #[tokio::test]
    async fn payload_is_republished_as_read() {
        let stream = Arc::new(MemoryOutputStream::new("abandoned_carts"));
        let mut filter = filter(stream.clone());

        let mut cart = record(0, "USA", LastAction::ShoppingCart);
        let payload = serde_json::json!({
            "country": "USA",
            "last_action": "shoppingcart",
            "visit_date": 1_700_000_000_000_i64,
            "duration": 7,
            "referrer": "ads",
        });
        cart.payload = payload.to_string().into();
        filter.process(&[cart.clone()]).await.unwrap();

        assert_eq!(stream.messages()[0].payload.as_str(), &*cart.payload);
    }

    #[tokio::test]
    async fn non_matching_batches_have_no_side_effects() {
        let stream = Arc::new(MemoryOutputStream::new("abandoned_carts"));
        stream.set_unavailable(true);
        let mut filter = filter(stream.clone());

        filter
            .process(&[record(0, "USA", LastAction::Order)])
            .await
            .unwrap();
        assert!(stream.messages().is_empty());
        assert!(filter.can_advance());
    }

    #[tokio::test]
    async fn unpublished_carts_are_kept_until_the_stream_is_back() {
        let stream = Arc::new(MemoryOutputStream::new("abandoned_carts"));
        stream.set_unavailable(true);
        let mut filter = filter(stream.clone());

        let err = filter
            .process(&[record(0, "USA", LastAction::ShoppingCart)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SinkError::Unavailable {
                sink: NAME,
                attempts: 3,
                ..
            }
        ));
        assert!(!filter.can_advance());

        stream.set_unavailable(false);
        filter
            .process(&[record(1, "India", LastAction::ShoppingCart)])
            .await
            .unwrap();
        assert!(filter.can_advance());
        let countries: Vec<_> = stream.events().into_iter().map(|e| e.country).collect();
        assert_eq!(countries, vec!["USA", "India"]);
    }

    #[tokio::test]
    async fn flush_publishes_what_is_left() {
        let stream = Arc::new(MemoryOutputStream::new("abandoned_carts"));
        let mut filter = filter(stream.clone());

        stream.fail_next(3);
        assert!(filter
            .process(&[record(0, "USA", LastAction::ShoppingCart)])
            .await
            .is_err());
        filter.flush().await.unwrap();

        assert!(filter.can_advance());
        assert_eq!(stream.events().len(), 1);
    }

    #[tokio::test]
    async fn long_outage_overflows() {
        let stream = Arc::new(MemoryOutputStream::new("abandoned_carts"));
        stream.set_unavailable(true);
        let mut filter = AbandonedCartFilter::new(stream.clone(), RetryPolicy::immediate(1), 50);

        for offset in 0..50 {
            assert!(matches!(
                filter
                    .process(&[record(offset, "USA", LastAction::ShoppingCart)])
                    .await,
                Err(SinkError::Unavailable { .. })
            ));
        }
        assert!(matches!(
            filter
                .process(&[record(50, "USA", LastAction::ShoppingCart)])
                .await,
            Err(SinkError::Overflow {
                pending: 51,
                limit: 50,
                ..
            })
        ));
    }
}
