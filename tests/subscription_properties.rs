//! Property tests for subscription lifecycle invariants.
//!
//! Random identity transition sequences are applied to identity-scoped and
//! public live queries while the store emits snapshots, some of them held
//! back and delivered late.

use authsync::{
    DeliveryMode, Identity, IdentityProvider, MemoryAuth, ProjectionStore, ProviderConfig,
    RecordData, StoreClient,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Clone, Debug)]
enum Step {
    SignIn(u8),
    SignOut,
    Write(u8),
    Flush,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0u8..4).prop_map(Step::SignIn),
        Just(Step::SignOut),
        (0u8..4).prop_map(Step::Write),
        Just(Step::Flush),
    ]
}

fn user_inbox(c: &StoreClient, identity: Option<&Identity>) -> authsync::Reference {
    c.collection(format!("users/{}/inbox", identity.map(|i| i.id.as_str()).unwrap_or("-")))
}

proptest! {
    #[test]
    fn prop_at_most_one_live_subscription(steps in proptest::collection::vec(step(), 1..60)) {
        let auth = MemoryAuth::new();
        let provider = IdentityProvider::start(&auth, &ProviderConfig::default());
        let inbox = ProjectionStore::<Vec<Value>>::collection(user_inbox).mount(&provider);

        let mut signed_in = false;
        for step in steps {
            match step {
                Step::SignIn(user) => {
                    auth.sign_in(format!("u{user}"));
                    signed_in = true;
                }
                Step::SignOut => {
                    auth.sign_out();
                    signed_in = false;
                }
                Step::Write(user) => {
                    auth.store()
                        .set(&format!("users/u{user}/inbox/m"), json!({"from": user}))
                        .unwrap();
                }
                Step::Flush => {
                    auth.store().flush();
                }
            }
            let listeners = auth.store().listener_count();
            prop_assert!(listeners <= 1);
            prop_assert_eq!(listeners == 1, signed_in);
            prop_assert_eq!(inbox.is_subscribed(), signed_in);
            if !signed_in {
                prop_assert!(inbox.value().is_empty());
            }
        }
    }

    #[test]
    fn prop_no_stale_delivery(steps in proptest::collection::vec(step(), 1..60)) {
        let auth = MemoryAuth::new();
        auth.store().set_mode(DeliveryMode::Deferred);
        let provider = IdentityProvider::start(&auth, &ProviderConfig::default());

        // Every record that reaches the decoder must belong to whoever is signed in.
        let current: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let stale = Arc::new(Mutex::new(0usize));
        let (owner, counter) = (Arc::clone(&current), Arc::clone(&stale));
        let _inbox = ProjectionStore::collection_decoded(user_inbox, move |data: RecordData| {
            if data.get("from").and_then(Value::as_u64) != *owner.lock() {
                *counter.lock() += 1;
            }
            Ok(Value::Object(data))
        })
        .mount(&provider);

        for step in steps {
            match step {
                Step::SignIn(user) => {
                    *current.lock() = Some(u64::from(user));
                    auth.sign_in(format!("u{user}"));
                }
                Step::SignOut => {
                    *current.lock() = None;
                    auth.sign_out();
                }
                Step::Write(user) => {
                    auth.store()
                        .set(&format!("users/u{user}/inbox/m"), json!({"from": user}))
                        .unwrap();
                }
                Step::Flush => {
                    auth.store().flush();
                }
            }
            prop_assert_eq!(*stale.lock(), 0);
        }
    }

    #[test]
    fn prop_public_query_subscribes_once(steps in proptest::collection::vec(step(), 1..40)) {
        let auth = MemoryAuth::new();
        let provider = IdentityProvider::start(&auth, &ProviderConfig::default());
        let feed = ProjectionStore::<Vec<Value>>::collection(|c: &StoreClient, _: Option<&Identity>| {
            c.collection("announcements")
        })
        .requires_identity(false)
        .mount(&provider);

        for step in steps {
            match step {
                Step::SignIn(user) => auth.sign_in(format!("u{user}")),
                Step::SignOut => auth.sign_out(),
                Step::Write(n) => auth.store()
                    .set(&format!("announcements/a{n}"), json!({"n": n}))
                    .unwrap(),
                Step::Flush => {
                    auth.store().flush();
                }
            }
            prop_assert!(feed.is_subscribed());
            prop_assert_eq!(auth.store().listen_count(), 1);
        }
    }
}

#[test]
fn test_identity_switch_waits_for_delivery_on_store_thread() {
    let auth = MemoryAuth::new();
    auth.store().set("users/alice/inbox/m", json!({"who": "alice"})).unwrap();
    auth.store().set("users/bob/inbox/m", json!({"who": "bob"})).unwrap();
    auth.store().set_mode(DeliveryMode::Deferred);
    let provider = IdentityProvider::start(&auth, &ProviderConfig::default());

    // Alice's snapshot stalls mid-decode until released.
    let (entered_tx, entered_rx) = crossbeam_channel::bounded::<()>(1);
    let (resume_tx, resume_rx) = crossbeam_channel::bounded::<()>(1);
    let armed = Arc::new(AtomicBool::new(true));
    let hold = Arc::clone(&armed);
    let inbox = ProjectionStore::collection_decoded(user_inbox, move |data: RecordData| {
        let from_alice = data.get("who").and_then(Value::as_str) == Some("alice");
        if from_alice && hold.swap(false, Ordering::SeqCst) {
            let _ = entered_tx.send(());
            let _ = resume_rx.recv();
        }
        Ok(Value::Object(data))
    })
    .mount(&provider);

    auth.sign_in("alice");
    let store = auth.store().clone();
    let delivering = thread::spawn(move || store.flush());
    entered_rx.recv().unwrap();

    auth.store().set_mode(DeliveryMode::Immediate);
    let switcher = auth.clone();
    let switching = thread::spawn(move || switcher.sign_in("bob"));
    thread::sleep(Duration::from_millis(50));
    resume_tx.send(()).unwrap();

    assert_eq!(delivering.join().unwrap(), 1);
    switching.join().unwrap();

    assert_eq!(*inbox.value(), vec![json!({"who": "bob"})]);
    assert!(!armed.load(Ordering::SeqCst));
    assert_eq!(auth.store().listener_count(), 1);
}
