use aegis_store::Store;

#[test]
fn user_upsert_is_idempotent() {
    let store = Store::open_in_memory().unwrap();
    let a = store.get_or_create_user("bob").unwrap();
    let b = store.get_or_create_user("bob").unwrap();
    assert_eq!(a.id, b.id);
}

#[test]
fn session_upsert_by_user_and_name() {
    let store = Store::open_in_memory().unwrap();
    let user = store.get_or_create_user("bob").unwrap();
    let s1 = store.get_or_create_session(user.id, "main").unwrap();
    let s2 = store.get_or_create_session(user.id, "main").unwrap();
    let other = store.get_or_create_session(user.id, "side").unwrap();
    assert_eq!(s1.id, s2.id);
    assert_ne!(s1.id, other.id);
}

#[test]
fn messages_list_in_append_order() {
    let store = Store::open_in_memory().unwrap();
    let user = store.get_or_create_user("bob").unwrap();
    let session = store.get_or_create_session(user.id, "main").unwrap();

    for i in 0..20 {
        let role = if i % 2 == 0 { "user" } else { "assistant" };
        store
            .append_message(session.id, role, &format!("m{i}"))
            .unwrap();
    }

    let messages = store.list_messages(session.id).unwrap();
    assert_eq!(messages.len(), 20);
    // rapid appends can share a timestamp; the id tiebreak must keep order
    for (i, m) in messages.iter().enumerate() {
        assert_eq!(m.content, format!("m{i}"));
    }
}

#[test]
fn delete_history_removes_session_and_orphaned_user() {
    let store = Store::open_in_memory().unwrap();
    let user = store.get_or_create_user("bob").unwrap();
    let main = store.get_or_create_session(user.id, "main").unwrap();
    store.get_or_create_session(user.id, "side").unwrap();
    store.append_message(main.id, "user", "hi").unwrap();
    store.append_message(main.id, "assistant", "hello").unwrap();

    let deleted = store.delete_history("bob", "main").unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(store.list_sessions("bob").unwrap(), vec!["side"]);
    // user still referenced by "side"
    assert!(store.find_user("bob").unwrap().is_some());

    store.delete_history("bob", "side").unwrap();
    assert!(store.find_user("bob").unwrap().is_none());
}

#[test]
fn delete_history_for_unknown_session_is_zero() {
    let store = Store::open_in_memory().unwrap();
    assert_eq!(store.delete_history("ghost", "main").unwrap(), 0);
}

#[test]
fn sessions_info_carries_last_message_snippet() {
    let store = Store::open_in_memory().unwrap();
    let user = store.get_or_create_user("bob").unwrap();
    let session = store.get_or_create_session(user.id, "main").unwrap();
    store.append_message(session.id, "user", "first").unwrap();
    let long = "y".repeat(80);
    store.append_message(session.id, "assistant", &long).unwrap();

    let info = store.list_sessions_info("bob").unwrap();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].name, "main");
    assert!(info[0].last_message.starts_with("yyy"));
    assert!(info[0].last_message.ends_with('…'));
}

#[test]
fn documents_round_trip() {
    let store = Store::open_in_memory().unwrap();
    store
        .add_document("bob", "/srv/uploads/bob/a.pdf", "a.pdf")
        .unwrap();
    store
        .add_document("bob", "/srv/uploads/bob/b.csv", "b.csv")
        .unwrap();

    let docs = store.list_documents("bob").unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].original_name, "a.pdf");
    assert_eq!(docs[1].original_name, "b.csv");
    assert!(store.list_documents("carol").unwrap().is_empty());
}

#[test]
fn store_survives_reopen_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aegis.db");

    {
        let store = Store::open(&path).unwrap();
        let user = store.get_or_create_user("bob").unwrap();
        let session = store.get_or_create_session(user.id, "main").unwrap();
        store.append_message(session.id, "user", "persisted").unwrap();
    }

    let store = Store::open(&path).unwrap();
    let user = store.get_or_create_user("bob").unwrap();
    let session = store.get_or_create_session(user.id, "main").unwrap();
    let messages = store.list_messages(session.id).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "persisted");
}
