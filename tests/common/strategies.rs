use proptest::prelude::*;
use std::collections::BTreeMap;
use tasker_session_queue::messaging::ClaimCheck;

/// Strategy for generating valid task type tags
pub fn type_tag_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9_.:/-]{0,63}".prop_filter("Reserved prefix", |tag| {
        !tag.starts_with("tasker/")
    })
}

/// Strategy for generating tags that must be rejected
pub fn invalid_type_tag_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        "[0-9_.:/-][a-zA-Z0-9_]{0,16}",
        "[a-zA-Z][a-zA-Z0-9]{0,8}[ !@#$%^&*()+=]{1,3}[a-z]{0,4}",
        "[a-z]{129,160}",
        "[a-z_]{1,12}".prop_map(|suffix| format!("tasker/{suffix}")),
    ]
}

/// Strategy for generating claim-check payloads
pub fn claim_check_strategy() -> impl Strategy<Value = ClaimCheck> {
    (
        "[a-z0-9]{1,8}://[a-zA-Z0-9/._-]{1,64}",
        prop::collection::btree_map("[a-z_]{1,12}", "[a-zA-Z0-9 ._-]{0,24}", 0..4),
    )
        .prop_map(|(locator, attributes): (String, BTreeMap<String, String>)| ClaimCheck {
            locator,
            attributes,
        })
}

/// Strategy for generating per-session batch sizes
pub fn batch_sizes_strategy() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..=5, 1..=4)
}
