// Fixture sanity checks for the sample feeds shipped under fixtures/feeds.

use clipcast_adapters::{load_feed_fixture, transform_items};

#[test]
fn sample_feeds_exist_and_decode() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/feeds");
    let feed = load_feed_fixture(root.join("sample_feed.json")).expect("sample feed");
    assert_eq!(feed.items.len(), 3);
    assert!(load_feed_fixture(root.join("empty_feed.json"))
        .expect("empty feed")
        .items
        .is_empty());

    let batch = transform_items(feed);
    assert!(batch
        .records
        .windows(2)
        .all(|w| w[0].posted_at <= w[1].posted_at));
}

#[test]
fn mixed_feed_keeps_every_valid_item() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/feeds");
    let batch = transform_items(load_feed_fixture(root.join("mixed_feed.json")).expect("mixed feed"));
    assert_eq!(batch.records.len(), 2);
    assert_eq!(batch.skipped.len(), 2);
}
