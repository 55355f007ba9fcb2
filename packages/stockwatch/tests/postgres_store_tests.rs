//! Postgres state store against a real database (needs Docker).
//!
//! Run with: cargo test -p stockwatch --test postgres_store_tests -- --ignored

mod common;

use chrono::Utc;
use common::{postgres_store, unique};
use std::sync::Arc;
use std::time::Duration;
use stockwatch::{EventKind, ProductState, StateStore, TrackingIdentity};

#[tokio::test]
#[ignore = "requires docker"]
async fn state_round_trip_and_clear() {
    let store = postgres_store().await;
    let identity = TrackingIdentity::new(format!("{}::#1384", unique("charizard")));

    assert!(store.get_state(&identity).await.unwrap().is_none());

    let state = ProductState {
        last_stock: Some(2),
        last_price_minor: Some(150_000),
        last_variant_tag: "1384".to_string(),
        last_event_kind: Some(EventKind::BackInStock),
        last_event_at: Some(Utc::now()),
        first_seen_at: Utc::now(),
    };
    store.set_state(&identity, &state).await.unwrap();

    let loaded = store.get_state(&identity).await.unwrap().unwrap();
    assert_eq!(loaded.last_stock, Some(2));
    assert_eq!(loaded.last_price_minor, Some(150_000));
    assert_eq!(loaded.last_variant_tag, "1384");
    assert_eq!(loaded.last_event_kind, Some(EventKind::BackInStock));

    // Overwrite keeps a single row per identity.
    let next = ProductState {
        last_stock: Some(0),
        ..state
    };
    store.set_state(&identity, &next).await.unwrap();
    assert_eq!(
        store.get_state(&identity).await.unwrap().unwrap().last_stock,
        Some(0)
    );

    assert!(store.clear_state(&identity).await.unwrap());
    assert!(!store.clear_state(&identity).await.unwrap());
    assert!(store.get_state(&identity).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn first_seen_state_has_no_event() {
    let store = postgres_store().await;
    let identity = TrackingIdentity::new(unique("plain"));

    let state = ProductState {
        last_stock: Some(1),
        last_price_minor: Some(20_000),
        last_variant_tag: String::new(),
        last_event_kind: None,
        last_event_at: None,
        first_seen_at: Utc::now(),
    };
    store.set_state(&identity, &state).await.unwrap();

    let loaded = store.get_state(&identity).await.unwrap().unwrap();
    assert!(loaded.last_event_kind.is_none());
    assert!(loaded.last_event_at.is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn concurrent_admission_has_one_winner() {
    let store = Arc::new(postgres_store().await);
    let key = unique("dedupe:event:race");

    let attempts = (0..16).map(|_| {
        let store = store.clone();
        let key = key.clone();
        tokio::spawn(async move { store.admit(&key, Duration::from_secs(60)).await.unwrap() })
    });

    let mut admitted = 0;
    for attempt in attempts.collect::<Vec<_>>() {
        if attempt.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn expired_claim_can_be_taken_again() {
    let store = postgres_store().await;
    let key = unique("dedupe:event:ttl");

    assert!(store.admit(&key, Duration::from_secs(1)).await.unwrap());
    assert!(!store.admit(&key, Duration::from_secs(1)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(store.admit(&key, Duration::from_secs(1)).await.unwrap());
    assert!(store.purge_expired().await.is_ok());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn page_hash_cache() {
    let store = postgres_store().await;
    let url = format!("https://shop.test/collections/{}?page=4", unique("pmcg"));

    assert!(store.page_hash(&url).await.unwrap().is_none());

    store
        .set_page_hash(&url, "abc", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(store.page_hash(&url).await.unwrap().as_deref(), Some("abc"));

    store
        .set_page_hash(&url, "def", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(store.page_hash(&url).await.unwrap().as_deref(), Some("def"));
}
