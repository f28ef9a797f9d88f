use super::*;

fn ts(raw: &str) -> DateTime<Utc> {
    raw.parse().expect("timestamp")
}

fn user(id: &str, name: &str, updated_at: &str) -> User {
    let mut user = User::new(id);
    user.name = Some(name.to_string());
    user.updated_at = Some(ts(updated_at));
    user
}

#[test]
fn update_user_keeps_newest_snapshot() {
    let mut state = ClientState::new();
    assert_eq!(
        state.update_user(&user("bob", "Bob v2", "2024-01-02T00:00:00Z")),
        Applied::Changed
    );
    assert_eq!(
        state.update_user(&user("bob", "Bob v1", "2024-01-01T00:00:00Z")),
        Applied::Unchanged
    );
    assert_eq!(
        state.user(&UserId::new("bob")).and_then(|u| u.name.as_deref()),
        Some("Bob v2")
    );
}

#[test]
fn update_user_is_idempotent_for_identical_snapshots() {
    let mut state = ClientState::new();
    let bob = user("bob", "Bob", "2024-01-01T00:00:00Z");
    assert_eq!(state.update_user(&bob), Applied::Changed);
    assert_eq!(state.update_user(&bob), Applied::Unchanged);
}

#[test]
fn partial_snapshot_does_not_erase_known_fields() {
    let mut state = ClientState::new();
    state.update_user(&user("bob", "Bob", "2024-01-01T00:00:00Z"));
    let mut partial = User::new("bob");
    partial.online = true;
    state.update_user(&partial);

    let stored = state.user(&UserId::new("bob")).expect("bob");
    assert_eq!(stored.name.as_deref(), Some("Bob"));
    assert!(stored.online);
}

#[test]
fn presence_change_is_visible_through_every_referencing_channel() {
    let mut state = ClientState::new();
    let a = Cid::new("messaging", "a");
    let b = Cid::new("messaging", "b");
    let bob = User::new("bob");
    state.update_user_reference(&bob, &a);
    state.update_user_reference(&bob, &b);

    state.update_presence(&bob, Some(true), ts("2024-01-01T00:00:00Z"));

    let mut cids: Vec<_> = state.channels_referencing(&bob.id).cloned().collect();
    cids.sort();
    assert_eq!(cids, vec![a, b]);
    assert!(state.user(&bob.id).expect("bob").online);
}

#[test]
fn dropping_channel_prunes_only_orphaned_users() {
    let mut state = ClientState::new();
    let a = Cid::new("messaging", "a");
    let b = Cid::new("messaging", "b");
    state.set_me(&User::new("me"));
    state.update_user_reference(&User::new("me"), &a);
    state.update_user_reference(&User::new("bob"), &a);
    state.update_user_reference(&User::new("carol"), &a);
    state.update_user_reference(&User::new("carol"), &b);

    let pruned = state.drop_channel_references(&a);

    assert_eq!(pruned, vec![UserId::new("bob")]);
    assert!(state.user(&UserId::new("bob")).is_none());
    assert!(state.user(&UserId::new("carol")).is_some());
    assert!(state.user(&UserId::new("me")).is_some());
}

#[test]
fn set_me_reads_unread_counters_from_snapshot() {
    let mut state = ClientState::new();
    let mut me = User::new("me");
    me.extra
        .insert("total_unread_count".into(), serde_json::json!(4));
    me.extra.insert("unread_channels".into(), serde_json::json!(2));
    state.set_me(&me);

    assert_eq!(state.me_id(), Some(&UserId::new("me")));
    assert_eq!(state.total_unread_count(), 4);
    assert_eq!(state.unread_channels(), 2);
}

#[test]
fn set_me_ignores_counters_out_of_range() {
    let mut state = ClientState::new();
    let mut me = User::new("me");
    me.extra
        .insert("total_unread_count".into(), serde_json::json!(4));
    state.set_me(&me);

    me.extra.insert(
        "total_unread_count".into(),
        serde_json::json!(u64::from(u32::MAX) + 5),
    );
    me.extra.insert("unread_channels".into(), serde_json::json!(-3));
    state.set_me(&me);

    assert_eq!(state.total_unread_count(), 4);
    assert_eq!(state.unread_channels(), 0);
}
