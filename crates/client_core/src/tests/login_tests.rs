use serde_json::json;

use super::*;
use crate::testutil::FakeLink;

fn setup() -> (
    Arc<FakeLink>,
    Arc<SessionStore>,
    Arc<LoginFlow>,
    Arc<MessageRouter>,
) {
    let link = FakeLink::new(true);
    let session = Arc::new(SessionStore::new());
    let flow = LoginFlow::new(link.clone(), Arc::clone(&session));
    let router = MessageRouter::new();
    flow.register_handlers(&router).expect("register");
    (link, session, flow, router)
}

fn login_response(friends: usize) -> Envelope {
    let list: Vec<_> = (1..=friends)
        .map(|id| json!({"id": id, "name": format!("friend-{id}")}))
        .collect();
    Envelope::typed("0").with(
        "data",
        json!({
            "userId": 7,
            "userName": "Alice",
            "userPart": "R&D",
            "userEmail": "alice@example.com",
            "userImg": "alice.png",
            "friendCount": friends,
            "list": list,
        }),
    )
}

#[test]
fn login_sends_credentials_under_legacy_type() {
    let (link, _session, flow, _router) = setup();
    flow.login("alice", "secret").expect("login");

    let sent = link.sent_envelopes();
    assert_eq!(sent[0].type_key().unwrap(), "0");
    assert_eq!(
        sent[0].get("login"),
        Some(&json!({"account": "alice", "password": "secret"}))
    );
}

#[test]
fn login_requires_connection() {
    let (link, _session, flow, _router) = setup();
    link.set_connected(false);
    assert!(matches!(
        flow.login("alice", "secret"),
        Err(ServiceError::NotConnected)
    ));
}

#[test]
fn successful_login_starts_session_and_requests_first_friend_details() {
    let (link, session, flow, router) = setup();
    let mut events = flow.subscribe();

    router.dispatch(&login_response(7)).expect("dispatch");

    let current = session.current().expect("session");
    assert_eq!(current.user_id.as_str(), "7");
    assert_eq!(current.user_name, "Alice");
    assert_eq!(current.department, "R&D");
    assert!(matches!(events.try_recv().unwrap(), LoginEvent::LoggedIn(profile) if profile.list.len() == 7));

    let request = &link.sent_envelopes()[0];
    assert_eq!(request.type_key().unwrap(), "2");
    assert_eq!(request.get("friendIds"), Some(&json!([1, 2, 3, 4, 5])));
    assert_eq!(flow.friends().len(), 7);
}

#[test]
fn rejected_login_keeps_session_empty() {
    let (link, session, flow, router) = setup();
    let mut events = flow.subscribe();

    router
        .dispatch(&Envelope::typed("0").with("status", 1).with("desc", "bad password"))
        .unwrap();

    assert!(!session.is_active());
    assert_eq!(
        events.try_recv().unwrap(),
        LoginEvent::LoginFailed("bad password".to_string())
    );
    assert!(link.sent_frames().is_empty());
}

#[test]
fn friend_details_merge_into_known_friends_only() {
    let (_link, _session, flow, router) = setup();
    router.dispatch(&login_response(2)).unwrap();
    let mut events = flow.subscribe();

    router
        .dispatch(&Envelope::typed("2").with(
            "data",
            json!({"friendDetails": [
                {"id": 2, "part": "QA", "email": "f2@example.com", "img": "f2.png", "sign": "hi"},
                {"id": 99, "part": "Nobody"},
            ]}),
        ))
        .unwrap();

    match events.try_recv().unwrap() {
        LoginEvent::FriendDetailsLoaded(details) => {
            assert_eq!(details.len(), 1);
            assert_eq!(details[0].name, "friend-2");
            assert_eq!(details[0].part, "QA");
        }
        other => panic!("expected details, got {other:?}"),
    }
    let friends = flow.friends();
    assert_eq!(friends.len(), 2);
    assert_eq!(friends[1].email, "f2@example.com");
}

#[test]
fn logout_clears_session_once() {
    let (_link, session, flow, router) = setup();
    router.dispatch(&login_response(1)).unwrap();
    let mut events = flow.subscribe();

    flow.logout();
    flow.logout();
    assert!(!session.is_active());
    assert!(flow.friends().is_empty());
    assert_eq!(events.try_recv().unwrap(), LoginEvent::LoggedOut);
    assert!(events.try_recv().is_err());
}
