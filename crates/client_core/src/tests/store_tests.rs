use super::*;

use crate::test_support::{at, server_message};

fn store_for(user: i64) -> MessageStore {
    MessageStore::new(ConversationId(42), UserId(user))
}

fn echo_of(store: &MessageStore, local_id: ClientMessageId, id: i64, seconds: i64) -> MessagePayload {
    let local = store.get(local_id).expect("local entry");
    MessagePayload {
        id: MessageId(id),
        conversation_id: local.conversation_id,
        sender_id: local.sender_id,
        content: local.content.clone(),
        image_url: local.attachment_url.clone(),
        created_at: at(seconds),
        client_message_id: Some(local_id),
    }
}

fn server_ids(store: &MessageStore) -> Vec<i64> {
    store
        .list()
        .iter()
        .filter_map(|message| message.server_id().map(|id| id.0))
        .collect()
}

#[test]
fn seed_sorts_out_of_order_history() {
    let mut store = store_for(1);
    store.seed(vec![
        server_message(3, 42, 2, "third", 30),
        server_message(1, 42, 2, "first", 10),
        server_message(2, 42, 1, "second", 20),
    ]);
    assert_eq!(server_ids(&store), vec![1, 2, 3]);
    assert!(store.list().iter().all(Message::is_confirmed));
}

#[test]
fn seed_dedups_filters_and_keeps_ties_stable() {
    let mut store = store_for(1);
    store.seed(vec![
        server_message(5, 42, 2, "a", 10),
        server_message(4, 42, 2, "b", 10),
        server_message(5, 42, 2, "a again", 10),
        server_message(9, 7, 2, "elsewhere", 5),
    ]);
    assert_eq!(server_ids(&store), vec![5, 4]);
    assert_eq!(store.list()[0].content.as_deref(), Some("a"));
}

#[test]
fn empty_history_yields_empty_store() {
    let mut store = store_for(1);
    store
        .append_local(Some("draft".into()), None, at(0))
        .expect("append");
    store.seed(Vec::new());
    assert!(store.is_empty());
}

#[test]
fn distinct_reconciles_grow_the_store_in_order() {
    let mut store = store_for(1);
    store.seed(vec![
        server_message(1, 42, 2, "one", 10),
        server_message(2, 42, 2, "two", 20),
    ]);
    let incoming = [(7, 15), (8, 25), (6, 5)];
    for (id, seconds) in incoming {
        let outcome = store.reconcile(server_message(id, 42, 2, "live", seconds));
        assert_eq!(outcome, ReconcileOutcome::Inserted);
    }
    assert_eq!(store.len(), 2 + incoming.len());
    assert_eq!(server_ids(&store), vec![6, 1, 7, 2, 8]);
    let times: Vec<_> = store.list().iter().map(|m| m.created_at).collect();
    assert!(times.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn duplicate_reconcile_is_idempotent() {
    let mut store = store_for(1);
    let message = server_message(11, 42, 2, "hey", 10);
    assert_eq!(store.reconcile(message.clone()), ReconcileOutcome::Inserted);
    let snapshot = store.list().to_vec();
    assert_eq!(store.reconcile(message), ReconcileOutcome::Duplicate);
    assert_eq!(store.list(), snapshot.as_slice());
}

#[test]
fn foreign_conversation_is_ignored() {
    let mut store = store_for(1);
    let outcome = store.reconcile(server_message(1, 99, 2, "nope", 10));
    assert_eq!(outcome, ReconcileOutcome::Ignored);
    assert!(!outcome.changed());
    assert!(store.is_empty());
}

#[test]
fn local_message_is_confirmed_in_place() {
    let mut store = store_for(1);
    let local_id = store
        .append_local(Some("hello".into()), None, at(100))
        .expect("append");
    assert_eq!(store.len(), 1);
    assert_eq!(store.list()[0].state, DeliveryState::Pending);

    let echo = echo_of(&store, local_id, 501, 101);
    let outcome = store.reconcile(echo);
    assert_eq!(outcome, ReconcileOutcome::Confirmed { local_id });
    assert_eq!(store.len(), 1);

    let confirmed = &store.list()[0];
    assert_eq!(confirmed.state, DeliveryState::Confirmed);
    assert_eq!(confirmed.server_id(), Some(MessageId(501)));
    assert_eq!(confirmed.created_at, at(101));
    assert_eq!(confirmed.correlation_id, Some(local_id));
}

#[test]
fn two_clients_see_the_same_sequence() {
    let mut sender = store_for(1);
    let mut receiver = store_for(2);
    sender.seed(Vec::new());
    receiver.seed(Vec::new());

    let local_id = sender
        .append_local(Some("hi".into()), None, at(50))
        .expect("append");
    let echo = echo_of(&sender, local_id, 501, 51);

    assert!(sender.reconcile(echo.clone()).changed());
    assert_eq!(receiver.reconcile(echo), ReconcileOutcome::Inserted);

    for store in [&sender, &receiver] {
        assert_eq!(store.len(), 1);
        let message = &store.list()[0];
        assert_eq!(message.server_id(), Some(MessageId(501)));
        assert_eq!(message.content.as_deref(), Some("hi"));
        assert_eq!(message.sender_id, UserId(1));
        assert!(message.is_confirmed());
    }
}

#[test]
fn echo_without_correlation_falls_back_to_content_match() {
    let mut store = store_for(1);
    let first = store
        .append_local(Some("same".into()), None, at(10))
        .expect("first");
    let second = store
        .append_local(Some("same".into()), None, at(11))
        .expect("second");

    let outcome = store.reconcile(server_message(20, 42, 1, "same", 12));
    assert_eq!(outcome, ReconcileOutcome::Confirmed { local_id: first });
    assert_eq!(
        store.get(second).map(|m| m.state),
        Some(DeliveryState::Pending)
    );

    // Another user's identical text is a different message.
    let outcome = store.reconcile(server_message(21, 42, 2, "same", 13));
    assert_eq!(outcome, ReconcileOutcome::Inserted);
    assert_eq!(store.len(), 3);
}

#[test]
fn confirmation_repositions_by_server_time() {
    let mut store = store_for(1);
    store.seed(vec![server_message(1, 42, 2, "old", 10)]);
    let local_id = store
        .append_local(Some("mine".into()), None, at(30))
        .expect("append");
    store.reconcile(server_message(2, 42, 2, "theirs", 20));
    assert_eq!(store.list().last().and_then(Message::local_id), Some(local_id));

    let echo = echo_of(&store, local_id, 3, 15);
    store.reconcile(echo);
    assert_eq!(server_ids(&store), vec![1, 3, 2]);
}

#[test]
fn append_local_never_goes_before_the_tail() {
    let mut store = store_for(1);
    store.seed(vec![server_message(1, 42, 2, "future", 500)]);
    let local_id = store
        .append_local(Some("skewed clock".into()), None, at(100))
        .expect("append");
    let local = store.list().last().expect("tail");
    assert_eq!(local.local_id(), Some(local_id));
    assert_eq!(local.created_at, at(500));
}

#[test]
fn empty_messages_are_rejected() {
    let mut store = store_for(1);
    let err = store
        .append_local(Some("   ".into()), None, at(0))
        .err()
        .expect("rejected");
    assert!(matches!(err, ChatError::Validation(_)));
    assert!(store.is_empty());

    store
        .append_local(None, Some("https://cdn.example/cow.jpg".into()), at(0))
        .expect("attachment only");
    assert_eq!(store.len(), 1);
}

#[test]
fn failed_messages_can_be_requeued() {
    let mut store = store_for(1);
    let local_id = store
        .append_local(Some("retry me".into()), None, at(0))
        .expect("append");

    assert!(store.requeue(local_id).is_none());
    assert!(store.mark_failed(local_id));
    assert_eq!(store.get(local_id).map(|m| m.state), Some(DeliveryState::Failed));

    let resend = store.requeue(local_id).expect("requeued");
    assert_eq!(resend.state, DeliveryState::Pending);
    assert_eq!(resend.content.as_deref(), Some("retry me"));

    let echo = echo_of(&store, local_id, 9, 1);
    store.reconcile(echo);
    assert!(!store.mark_failed(local_id));
}

#[test]
fn reseed_keeps_unconfirmed_local_messages() {
    let mut store = store_for(1);
    let pending = store
        .append_local(Some("sent early".into()), None, at(40))
        .expect("append");
    store.reconcile(server_message(7, 42, 2, "live", 35));

    store.reseed(vec![
        server_message(2, 42, 2, "b", 20),
        server_message(1, 42, 2, "a", 10),
    ]);

    assert_eq!(server_ids(&store), vec![1, 2]);
    assert_eq!(store.len(), 3);
    assert_eq!(store.list().last().and_then(Message::local_id), Some(pending));
}
