use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use proptest::prelude::*;
use tokio::sync::mpsc;

use order_chat::config::SyncConfig;
use order_chat::memory::MemoryStore;
use order_chat::model::{Actor, ChatId, Message, ReconnectState, SenderType};
use order_chat::sync::MessageSynchronizer;

// --- Backoff ---

proptest! {
    #[test]
    fn backoff_never_shrinks_and_respects_cap(
        base_ms in 1u64..10_000,
        cap_ms in 1u64..120_000,
        failures in 1usize..40,
    ) {
        let base = Duration::from_millis(base_ms);
        let cap = Duration::from_millis(cap_ms);
        let mut state = ReconnectState::new(base);
        let mut previous = Duration::ZERO;
        for _ in 0..failures {
            let delay = state.advance(base, cap);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= cap);
            previous = delay;
        }
        prop_assert_eq!(state.attempt as usize, failures);
    }

    #[test]
    fn first_delay_is_base_unless_capped(base_ms in 1u64..10_000, cap_ms in 1u64..120_000) {
        let base = Duration::from_millis(base_ms);
        let cap = Duration::from_millis(cap_ms);
        prop_assert_eq!(ReconnectState::delay_for(0, base, cap), base.min(cap));
    }
}

// --- Message merge ---

fn arb_message() -> impl Strategy<Value = Message> {
    (0u8..20, 0i64..1_000, any::<bool>(), any::<bool>()).prop_map(|(id, secs, admin, read)| {
        Message {
            id: format!("m-{id}"),
            text: format!("mensagem {id}"),
            sender_id: if admin { "admin-1" } else { "cust-1" }.to_string(),
            sender_type: if admin {
                SenderType::Admin
            } else {
                SenderType::User
            },
            // one timestamp per id, as the store would assign
            created_at: DateTime::<Utc>::UNIX_EPOCH + ChronoDuration::seconds(i64::from(id) * 10 + secs % 10),
            is_read: read,
            order_id: None,
            order_item_id: "item-1".into(),
            entry_id: None,
            client_ref: None,
            is_temporary: false,
        }
    })
}

fn synchronizer() -> MessageSynchronizer {
    let (tx, _rx) = mpsc::channel(1);
    MessageSynchronizer::new(
        ChatId::new("item-1"),
        Actor {
            user_id: "admin-1".into(),
            sender_type: SenderType::Admin,
        },
        Arc::new(MemoryStore::new()),
        SyncConfig {
            confirm_timeout: Duration::from_secs(10),
        },
        tx,
    )
}

proptest! {
    #[test]
    fn merged_list_is_sorted_and_unique(batch in prop::collection::vec(arb_message(), 0..60)) {
        let mut sync = synchronizer();
        for msg in batch.iter().cloned() {
            sync.apply_incoming(msg);
        }

        let messages = sync.messages();
        prop_assert!(messages.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        let ids: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        prop_assert_eq!(ids.len(), messages.len());

        let distinct: HashSet<&str> = batch.iter().map(|m| m.id.as_str()).collect();
        prop_assert_eq!(distinct.len(), messages.len());
    }

    #[test]
    fn redelivery_does_not_change_unread(batch in prop::collection::vec(arb_message(), 0..40)) {
        let mut sync = synchronizer();
        for msg in batch.iter().cloned() {
            sync.apply_incoming(msg);
        }
        let unread = sync.unread_count();
        for msg in batch.iter().cloned() {
            sync.apply_incoming(msg);
        }
        prop_assert_eq!(sync.unread_count(), unread);

        let expected = sync
            .messages()
            .iter()
            .filter(|m| m.sender_type == SenderType::User && !m.is_read)
            .count();
        prop_assert_eq!(unread, expected);
    }
}

// --- Local sends interleaved with echoes ---

#[derive(Debug, Clone)]
enum Step {
    Send,
    /// Echo the n-th pending send, stamped `offset_ms` from now
    Echo { nth: usize, offset_ms: i64 },
    Counterpart { offset_ms: i64 },
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Send),
        (0usize..8, -30_000i64..30_000).prop_map(|(nth, offset_ms)| Step::Echo { nth, offset_ms }),
        (-30_000i64..30_000).prop_map(|offset_ms| Step::Counterpart { offset_ms }),
    ]
}

proptest! {
    #[test]
    fn sends_echoes_and_replies_stay_sorted(steps in prop::collection::vec(arb_step(), 1..40)) {
        // sends spawn their store write; nothing needs to run for this check
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();

        let mut sync = synchronizer();
        let now = Utc::now();
        let mut pending: Vec<String> = Vec::new();
        let mut next_id = 0;
        for step in steps {
            match step {
                Step::Send => pending.push(sync.send_message("oi").unwrap()),
                Step::Echo { nth, offset_ms } => {
                    if pending.is_empty() {
                        continue;
                    }
                    let client_ref = pending.remove(nth % pending.len());
                    next_id += 1;
                    let echo = Message {
                        id: format!("srv-{next_id}"),
                        text: "oi".into(),
                        sender_id: "admin-1".into(),
                        sender_type: SenderType::Admin,
                        created_at: now + ChronoDuration::milliseconds(offset_ms),
                        is_read: false,
                        order_id: None,
                        order_item_id: "item-1".into(),
                        entry_id: None,
                        client_ref: Some(client_ref),
                        is_temporary: false,
                    };
                    sync.apply_incoming(echo);
                }
                Step::Counterpart { offset_ms } => {
                    next_id += 1;
                    let reply = Message {
                        id: format!("srv-{next_id}"),
                        text: "resposta".into(),
                        sender_id: "cust-1".into(),
                        sender_type: SenderType::User,
                        created_at: now + ChronoDuration::milliseconds(offset_ms),
                        is_read: false,
                        order_id: None,
                        order_item_id: "item-1".into(),
                        entry_id: None,
                        client_ref: None,
                        is_temporary: false,
                    };
                    sync.apply_incoming(reply);
                }
            }
            let messages = sync.messages();
            prop_assert!(messages.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        }

        let temporaries = sync.messages().iter().filter(|m| m.is_temporary).count();
        prop_assert_eq!(temporaries, pending.len());
        prop_assert_eq!(sync.pending_count(), pending.len());
    }
}
