use feedsync_sync::{ConflictResolver, Resolution};
use feedsync_types::Timestamp;

fn ts(wall: u64, logical: u32) -> Timestamp {
    Timestamp::new(wall, logical)
}

#[test]
fn anything_beats_an_empty_slot() {
    let resolver = ConflictResolver;
    assert_eq!(
        resolver.resolve(None, Timestamp::ZERO, false),
        Resolution::AcceptIncoming
    );
}

#[test]
fn strictly_newer_wins() {
    let resolver = ConflictResolver;
    assert_eq!(
        resolver.resolve(Some(ts(5, 0)), ts(6, 0), false),
        Resolution::AcceptIncoming
    );
    assert_eq!(
        resolver.resolve(Some(ts(5, 0)), ts(5, 1), false),
        Resolution::AcceptIncoming
    );
}

#[test]
fn ties_and_older_keep_current() {
    let resolver = ConflictResolver;
    assert_eq!(
        resolver.resolve(Some(ts(5, 1)), ts(5, 1), false),
        Resolution::KeepCurrent
    );
    assert_eq!(
        resolver.resolve(Some(ts(5, 1)), ts(5, 0), false),
        Resolution::KeepCurrent
    );
    assert_eq!(
        resolver.resolve(Some(ts(9, 0)), ts(2, 0), false),
        Resolution::KeepCurrent
    );
}

#[test]
fn own_confirmation_always_wins() {
    let resolver = ConflictResolver;
    assert_eq!(
        resolver.resolve(Some(ts(9, 0)), ts(2, 0), true),
        Resolution::AcceptIncoming
    );
    assert_eq!(
        resolver.resolve(Some(ts(9, 0)), ts(9, 0), true),
        Resolution::AcceptIncoming
    );
}
