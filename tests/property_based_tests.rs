mod common;

use common::strategies::*;
use common::*;
use proptest::prelude::*;
use tasker_session_queue::constants::transport::MAX_MESSAGE_BODY_BYTES;
use tasker_session_queue::dispatch::SessionClosePolicy;
use tasker_session_queue::messaging::{EnvelopeError, MessageKind, TaskEnvelope, TaskType};
use tasker_session_queue::session::SessionStrategy;

proptest! {
    /// Property: valid envelopes survive the codec unchanged
    #[test]
    fn envelopes_round_trip_through_codec(tag in type_tag_strategy(), payload in claim_check_strategy()) {
        let envelope = TaskEnvelope::new(TaskType::new(tag).unwrap(), payload);
        let encoded = envelope.encode(MAX_MESSAGE_BODY_BYTES).unwrap();
        let decoded = TaskEnvelope::decode(&encoded.message_type, &encoded.body).unwrap();
        prop_assert_eq!(&decoded, &envelope);

        let kind = MessageKind::decode(&encoded.message_type, &encoded.body).unwrap();
        prop_assert_eq!(kind, MessageKind::Task(envelope));
    }

    /// Property: invalid tags are rejected on both the encode and decode side
    #[test]
    fn invalid_type_tags_are_rejected(tag in invalid_type_tag_strategy()) {
        prop_assert!(TaskType::new(tag.clone()).is_err());
        let decoded = TaskEnvelope::decode(&tag, br#"{"locator":"ref"}"#);
        prop_assert!(decoded.is_err());
    }

    /// Property: encoding either fits the limit or reports the real size
    #[test]
    fn encoded_bodies_respect_limit(payload in claim_check_strategy(), limit in 1usize..256) {
        let envelope = TaskEnvelope::new(TaskType::new("ship").unwrap(), payload);
        match envelope.encode(limit) {
            Ok(encoded) => prop_assert!(encoded.body.len() <= limit),
            Err(EnvelopeError::TooLarge { size_bytes, limit_bytes }) => {
                prop_assert!(size_bytes > limit_bytes);
                prop_assert_eq!(limit_bytes, limit);
            }
            Err(other) => prop_assert!(false, "unexpected error {:?}", other),
        }
    }

    /// Property: type tags serialize as plain strings and parse back
    #[test]
    fn type_tags_serde_round_trip(tag in type_tag_strategy()) {
        let type_tag = TaskType::new(tag.clone()).unwrap();
        let json = serde_json::to_string(&type_tag).unwrap();
        prop_assert_eq!(&json, &serde_json::to_string(&tag).unwrap());
        let parsed: TaskType = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(parsed, type_tag);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Property: every enqueued envelope is handled exactly once, in send
    /// order within its session, and every drained session is closed
    #[test]
    fn batches_are_delivered_once_in_order(batch_sizes in batch_sizes_strategy()) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (delivered, expected, sessions_closed) = runtime.block_on(async {
            let queue = TestQueue::new();
            let handler = RecordingHandler::new();
            let dispatcher = queue.dispatcher(
                registry_with(&["ship"], handler.clone()),
                SessionClosePolicy::CloseWhenDrained,
                1,
            );

            let mut expected = Vec::new();
            for (s, size) in batch_sizes.iter().enumerate() {
                let batch: Vec<_> = (0..*size)
                    .map(|i| {
                        let locator = format!("s{s}-{i}");
                        expected.push(locator.clone());
                        envelope("ship", &locator)
                    })
                    .collect();
                queue
                    .producer
                    .enqueue(QUEUE, SessionStrategy::time_boxed_seconds(60), &batch)
                    .await
                    .unwrap();
            }

            drain(&dispatcher).await;
            (handler.locators(), expected, dispatcher.stats().sessions_closed)
        });

        prop_assert_eq!(delivered, expected);
        prop_assert_eq!(sessions_closed, batch_sizes.len() as u64);
    }
}
