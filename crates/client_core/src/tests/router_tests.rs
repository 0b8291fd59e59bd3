use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::testutil::next_matching;
use parking_lot::Mutex;

fn counter() -> (Arc<AtomicUsize>, impl Fn(&Envelope) + Send + Sync + 'static) {
    let calls = Arc::new(AtomicUsize::new(0));
    let handle = {
        let calls = Arc::clone(&calls);
        move |_: &Envelope| {
            calls.fetch_add(1, Ordering::SeqCst);
        }
    };
    (calls, handle)
}

#[test]
fn dispatch_by_type_field_calls_handler_once() {
    let router = MessageRouter::new();
    let mut events = router.subscribe();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        router
            .register_handler("im.message", move |envelope| {
                seen.lock().push(envelope.clone());
            })
            .expect("register");
    }

    let envelope = Envelope::typed("im.message").with("content", "hello");
    assert_eq!(router.dispatch(&envelope).expect("dispatch"), "im.message");

    assert_eq!(*seen.lock(), vec![envelope]);
    assert_eq!(
        events.try_recv().expect("event"),
        RouterEvent::Dispatched {
            type_key: "im.message".to_string()
        }
    );
    assert!(events.try_recv().is_err());
}

#[test]
fn legacy_module_action_pair_routes() {
    let router = MessageRouter::new();
    let (calls, handle) = counter();
    router.register_handler("contact.list", handle).expect("register");

    let envelope = Envelope::new()
        .with("module", "contact")
        .with("action", "list");
    assert_eq!(router.dispatch(&envelope).expect("dispatch"), "contact.list");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn envelope_without_type_reports_unknown() {
    let router = MessageRouter::new();
    let mut events = router.subscribe();
    let (calls, handle) = counter();
    router.register_handler("im.message", handle).expect("register");

    let err = router
        .dispatch(&Envelope::new().with("foo", "bar"))
        .expect_err("no type");
    assert_eq!(err, RouterError::MissingType("Missing message type".to_string()));
    assert_eq!(
        events.try_recv().expect("event"),
        RouterEvent::DispatchError {
            type_key: "unknown".to_string(),
            reason: "Missing message type".to_string(),
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn unhandled_type_is_reported_and_nothing_runs() {
    let router = MessageRouter::new();
    let mut events = router.subscribe();
    let (calls, handle) = counter();
    router.register_handler("im.message", handle).expect("register");

    let err = router
        .dispatch(&Envelope::typed("group.update"))
        .expect_err("no handler");
    assert_eq!(err, RouterError::NoHandler("group.update".to_string()));
    assert_eq!(
        events.try_recv().expect("event"),
        RouterEvent::DispatchError {
            type_key: "group.update".to_string(),
            reason: "No handler registered".to_string(),
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn registering_twice_replaces_the_handler() {
    let router = MessageRouter::new();
    let (first_calls, first) = counter();
    let (second_calls, second) = counter();
    router.register_handler("im.ack", first).expect("register");
    router.register_handler("im.ack", second).expect("register");

    router.dispatch(&Envelope::typed("im.ack")).expect("dispatch");
    assert_eq!(first_calls.load(Ordering::SeqCst), 0);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    assert_eq!(router.registered_types().len(), 1);
}

#[test]
fn unregister_removes_only_the_named_type() {
    let router = MessageRouter::new();
    let (_, ack) = counter();
    let (_, typing) = counter();
    router.register_handler("im.ack", ack).expect("register");
    router.register_handler("im.typing", typing).expect("register");

    assert!(router.unregister_handler("im.ack"));
    assert!(!router.unregister_handler("im.ack"));
    assert!(!router.is_registered("im.ack"));
    assert!(router.is_registered("im.typing"));
    assert!(matches!(
        router.dispatch(&Envelope::typed("im.ack")),
        Err(RouterError::NoHandler(_))
    ));
}

#[test]
fn empty_type_key_is_rejected() {
    let router = MessageRouter::new();
    let (_, handle) = counter();
    assert_eq!(
        router.register_handler("", handle),
        Err(RouterError::EmptyTypeKey)
    );
    assert!(router.registered_types().is_empty());
}

#[test]
fn handler_may_touch_the_registry_while_running() {
    let router = MessageRouter::new();
    let (late_calls, late) = counter();
    let late = Arc::new(Mutex::new(Some(late)));
    {
        let registry = Arc::downgrade(&router);
        let late = Arc::clone(&late);
        router
            .register_handler("group.list", move |_| {
                let Some(router) = registry.upgrade() else {
                    return;
                };
                if let Some(handle) = late.lock().take() {
                    router.register_handler("group.update", handle).expect("register");
                }
                router.unregister_handler("group.list");
            })
            .expect("register");
    }

    router.dispatch(&Envelope::typed("group.list")).expect("dispatch");
    assert!(!router.is_registered("group.list"));
    router.dispatch(&Envelope::typed("group.update")).expect("dispatch");
    assert_eq!(late_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn feed_dispatches_inbound_messages_in_order() {
    let (inbound, feed_rx) = mpsc::unbounded_channel();
    let router = MessageRouter::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let order = Arc::clone(&order);
        router
            .register_handler("im.message", move |envelope| {
                order.lock().push(envelope.i64_field("seq").expect("seq"));
            })
            .expect("register");
    }
    let mut events = router.subscribe();
    let feed = router.spawn_feed(feed_rx);

    for seq in 0..3 {
        inbound
            .send(Envelope::typed("im.message").with("seq", seq))
            .expect("feed alive");
    }

    for _ in 0..3 {
        next_matching(&mut events, |event| {
            matches!(event, RouterEvent::Dispatched { .. }).then_some(())
        })
        .await;
    }
    assert_eq!(*order.lock(), vec![0, 1, 2]);
    feed.abort();
}

#[tokio::test]
async fn feed_ends_when_the_inbound_side_is_dropped() {
    let (inbound, feed_rx) = mpsc::unbounded_channel::<Envelope>();
    let router = MessageRouter::new();
    let feed = router.spawn_feed(feed_rx);
    drop(inbound);
    feed.await.expect("feed task exits cleanly");
}
