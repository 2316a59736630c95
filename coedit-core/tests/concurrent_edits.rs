//! Concurrent inserts at the same visual index from different sites.

use coedit_core::{Delta, FixedClock, Position, PositionAllocator, SequenceDocument, SiteId};

fn site(n: u128, clock: u64) -> PositionAllocator {
    PositionAllocator::with_clock(SiteId::from_u128(n), FixedClock(clock))
}

fn hello(doc: &mut SequenceDocument, a: &mut PositionAllocator) -> Vec<Position> {
    "hello"
        .chars()
        .map(|c| doc.insert_at(a, None, c.to_string()).unwrap())
        .collect()
}

fn check_concurrent_after_h(clock_a: u64, clock_b: u64, clock_c: u64) {
    let mut origin = SequenceDocument::new();
    let mut a = site(1, clock_a);
    let positions = hello(&mut origin, &mut a);
    assert_eq!(origin.render(), "hello");

    // Site B and site C both start from "hello" and know nothing of each other.
    let mut replica_b = origin.clone();
    let mut replica_c = origin.clone();
    let mut b = site(2, clock_b);
    let mut c = site(3, clock_c);

    let x = replica_b.insert_at(&mut b, Some(&positions[0]), "X").unwrap();
    assert_eq!(replica_b.render(), "hXello");
    let y = replica_c.insert_at(&mut c, Some(&positions[0]), "Y").unwrap();
    assert_eq!(replica_c.render(), "hYello");

    let dx = Delta::Insert { position: x.clone(), grapheme: "X".into() };
    let dy = Delta::Insert { position: y.clone(), grapheme: "Y".into() };

    let mut first = origin.clone();
    first.apply_remote_delta(&dx);
    first.apply_remote_delta(&dy);

    let mut second = origin.clone();
    second.apply_remote_delta(&dy);
    second.apply_remote_delta(&dx);

    let rendered = first.render();
    assert_eq!(rendered, second.render());

    let expected = if x < y { "hXYello" } else { "hYXello" };
    assert_eq!(rendered, expected, "clocks a={clock_a} b={clock_b} c={clock_c}");
}

#[test]
fn test_concurrent_insert_same_clock() {
    check_concurrent_after_h(10, 10, 10);
}

#[test]
fn test_concurrent_insert_lagging_clocks() {
    check_concurrent_after_h(1_000, 10, 20);
}

#[test]
fn test_concurrent_insert_mixed_clocks() {
    check_concurrent_after_h(500, 10, 2_000);
    check_concurrent_after_h(500, 2_000, 10);
}

#[test]
fn test_concurrent_append_keeps_both() {
    let mut origin = SequenceDocument::new();
    let mut a = site(1, 1);
    hello(&mut origin, &mut a);

    let mut left = origin.clone();
    let mut right = origin.clone();
    let p = left.insert_at(&mut site(2, 1), None, "!").unwrap();
    let q = right.insert_at(&mut site(3, 1), None, "?").unwrap();

    left.apply_remote_delta(&Delta::Insert { position: q, grapheme: "?".into() });
    right.apply_remote_delta(&Delta::Insert { position: p, grapheme: "!".into() });

    assert_eq!(left.render(), right.render());
    assert!(left.render().starts_with("hello"));
    assert_eq!(left.len(), 7);
}

#[test]
fn test_concurrent_delete_same_character() {
    let mut origin = SequenceDocument::new();
    let mut a = site(1, 1);
    let positions = hello(&mut origin, &mut a);

    let delete = Delta::Delete { position: positions[1].clone() };
    let mut replica = origin.clone();
    replica.delete_at(&positions[1]).unwrap();

    // The other site's identical delete arrives afterwards: harmless no-op.
    replica.apply_remote_delta(&delete);
    assert_eq!(replica.render(), "hllo");
    assert!(replica.delete_at(&positions[1]).unwrap_err().is_not_found());
}
