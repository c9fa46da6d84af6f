//! KvStore interface tests.
//!
//! These tests verify the contract of the KvStore trait.
//! Each storage implementation should run these tests.

use std::time::Duration;

use redbus::storage::{KvStore, StoreOp};

// =============================================================================
// Hashes and strings
// =============================================================================

pub async fn test_hash_set_if_absent_keeps_first<S: KvStore + ?Sized>(store: &S, prefix: &str) {
    let key = format!("{prefix}:hash");
    let write = |value: &str| StoreOp::HashSetIfAbsent {
        key: key.clone(),
        field: "m1".to_string(),
        value: value.as_bytes().to_vec(),
    };

    store.exec(vec![write("first")]).await.expect("exec should succeed");
    store.exec(vec![write("second")]).await.expect("exec should succeed");

    let stored = store.hash_get(&key, "m1").await.expect("hget should succeed");
    assert_eq!(stored.as_deref(), Some(b"first".as_slice()));
    assert_eq!(store.hash_len(&key).await.unwrap(), 1);
    assert_eq!(store.hash_values(&key).await.unwrap(), vec![b"first".to_vec()]);

    store
        .exec(vec![StoreOp::HashDelete {
            key: key.clone(),
            field: "m1".to_string(),
        }])
        .await
        .unwrap();
    assert!(!store.exists(&key).await.unwrap(), "empty hash should vanish");
}

pub async fn test_set_get_delete<S: KvStore + ?Sized>(store: &S, prefix: &str) {
    let key = format!("{prefix}:value");

    assert!(store.get(&key).await.unwrap().is_none());
    store
        .exec(vec![StoreOp::Set {
            key: key.clone(),
            value: b"v".to_vec(),
        }])
        .await
        .unwrap();
    assert_eq!(store.get(&key).await.unwrap(), Some(b"v".to_vec()));

    store
        .exec(vec![StoreOp::Delete {
            keys: vec![key.clone(), format!("{prefix}:never-existed")],
        }])
        .await
        .unwrap();
    assert!(store.get(&key).await.unwrap().is_none());
}

pub async fn test_incr<S: KvStore + ?Sized>(store: &S, prefix: &str) {
    let key = format!("{prefix}:counter");
    assert_eq!(store.incr(&key, 1).await.unwrap(), 1);
    assert_eq!(store.incr(&key, 5).await.unwrap(), 6);
    assert_eq!(store.get(&key).await.unwrap(), Some(b"6".to_vec()));
}

pub async fn test_ttl_expiry<S: KvStore + ?Sized>(store: &S, prefix: &str) {
    let key = format!("{prefix}:lease");
    store
        .exec(vec![StoreOp::SetWithTtl {
            key: key.clone(),
            value: b"claimed".to_vec(),
            ttl: Duration::from_millis(300),
        }])
        .await
        .unwrap();

    assert!(store.exists(&key).await.unwrap(), "key should exist before ttl");
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!store.exists(&key).await.unwrap(), "key should expire after ttl");
}

// =============================================================================
// Lists
// =============================================================================

pub async fn test_list_push_and_remove<S: KvStore + ?Sized>(store: &S, prefix: &str) {
    let key = format!("{prefix}:list");
    let head = |v: &str| StoreOp::ListPushHead {
        key: key.clone(),
        value: v.to_string(),
    };

    store
        .exec(vec![head("a"), head("b"), head("a")])
        .await
        .unwrap();
    store
        .exec(vec![StoreOp::ListPushTail {
            key: key.clone(),
            value: "z".to_string(),
        }])
        .await
        .unwrap();
    assert_eq!(store.list_range(&key).await.unwrap(), vec!["a", "b", "a", "z"]);

    // Negative count removes from the tail end
    store
        .exec(vec![StoreOp::ListRemove {
            key: key.clone(),
            count: -1,
            value: "a".to_string(),
        }])
        .await
        .unwrap();
    assert_eq!(store.list_range(&key).await.unwrap(), vec!["a", "b", "z"]);
    assert_eq!(store.list_len(&key).await.unwrap(), 3);
}

pub async fn test_blocking_move<S: KvStore + ?Sized>(store: &S, prefix: &str) {
    let ready = format!("{prefix}:ready");
    let claimed = format!("{prefix}:claimed");

    store
        .exec(vec![
            StoreOp::ListPushHead {
                key: ready.clone(),
                value: "old".to_string(),
            },
            StoreOp::ListPushHead {
                key: ready.clone(),
                value: "new".to_string(),
            },
        ])
        .await
        .unwrap();

    let moved = store
        .blocking_move(&ready, &claimed, Duration::from_secs(1))
        .await
        .expect("move should succeed");
    assert_eq!(moved.as_deref(), Some("old"), "tail is popped first");
    assert_eq!(store.list_range(&ready).await.unwrap(), vec!["new"]);
    assert_eq!(store.list_range(&claimed).await.unwrap(), vec!["old"]);
}

pub async fn test_blocking_move_times_out<S: KvStore + ?Sized>(store: &S, prefix: &str) {
    let started = std::time::Instant::now();
    let moved = store
        .blocking_move(
            &format!("{prefix}:empty"),
            &format!("{prefix}:dest"),
            Duration::from_secs(1),
        )
        .await
        .expect("move should succeed");

    assert!(moved.is_none());
    assert!(started.elapsed() >= Duration::from_millis(900));
}

// =============================================================================
// Sets and sorted sets
// =============================================================================

pub async fn test_set_union<S: KvStore + ?Sized>(store: &S, prefix: &str) {
    let a = format!("{prefix}:set:a");
    let b = format!("{prefix}:set:b");
    let add = |key: &str, member: &str| StoreOp::SetAdd {
        key: key.to_string(),
        member: member.to_string(),
    };

    store
        .exec(vec![add(&a, "x"), add(&a, "y"), add(&b, "y"), add(&b, "z")])
        .await
        .unwrap();

    let mut union = store
        .set_union(&[a.clone(), b.clone(), format!("{prefix}:set:none")])
        .await
        .unwrap();
    union.sort();
    assert_eq!(union, vec!["x", "y", "z"]);

    store
        .exec(vec![StoreOp::SetRemove {
            key: a.clone(),
            member: "x".to_string(),
        }])
        .await
        .unwrap();
    let mut members = store.set_members(&a).await.unwrap();
    members.sort();
    assert_eq!(members, vec!["y"]);
}

pub async fn test_sorted_range_by_score<S: KvStore + ?Sized>(store: &S, prefix: &str) {
    let key = format!("{prefix}:times");
    let add = |member: &str, score: i64| StoreOp::SortedSetAdd {
        key: key.clone(),
        score,
        member: member.to_string(),
    };

    store
        .exec(vec![add("late", 300), add("early", 100), add("future", 900)])
        .await
        .unwrap();

    let due = store.sorted_range_by_score(&key, 0, 500).await.unwrap();
    assert_eq!(
        due,
        vec![("early".to_string(), 100), ("late".to_string(), 300)]
    );

    store
        .exec(vec![StoreOp::SortedSetRemove {
            key: key.clone(),
            member: "early".to_string(),
        }])
        .await
        .unwrap();
    let due = store.sorted_range_by_score(&key, 0, 500).await.unwrap();
    assert_eq!(due, vec![("late".to_string(), 300)]);
}

// =============================================================================
// Scan and locks
// =============================================================================

pub async fn test_scan_keys<S: KvStore + ?Sized>(store: &S, prefix: &str) {
    let push = |key: String| StoreOp::ListPushHead {
        key,
        value: "1".to_string(),
    };
    store
        .exec(vec![
            push(format!("{prefix}:scan:orders:ids")),
            push(format!("{prefix}:scan:billing:ids")),
            push(format!("{prefix}:scan:billing:claimed")),
        ])
        .await
        .unwrap();

    let mut keys = store
        .scan_keys(&format!("{prefix}:scan:*:ids"))
        .await
        .unwrap();
    keys.sort();
    assert_eq!(
        keys,
        vec![
            format!("{prefix}:scan:billing:ids"),
            format!("{prefix}:scan:orders:ids"),
        ]
    );
}

pub async fn test_scan_keys_classes_and_escapes<S: KvStore + ?Sized>(store: &S, prefix: &str) {
    let push = |key: String| StoreOp::ListPushHead {
        key,
        value: "1".to_string(),
    };
    store
        .exec(vec![
            push(format!("{prefix}:cls:q1:ids")),
            push(format!("{prefix}:cls:q3:ids")),
            push(format!("{prefix}:cls:a[b]:ids")),
            push(format!("{prefix}:cls:ab:ids")),
        ])
        .await
        .unwrap();

    let keys = store
        .scan_keys(&format!("{prefix}:cls:q[12]:ids"))
        .await
        .unwrap();
    assert_eq!(keys, vec![format!("{prefix}:cls:q1:ids")]);

    let mut keys = store
        .scan_keys(&format!("{prefix}:cls:q[^12]:ids"))
        .await
        .unwrap();
    keys.sort();
    assert_eq!(keys, vec![format!("{prefix}:cls:q3:ids")]);

    let keys = store
        .scan_keys(&format!(r"{prefix}:cls:a\[b\]:ids"))
        .await
        .unwrap();
    assert_eq!(keys, vec![format!("{prefix}:cls:a[b]:ids")]);
}

pub async fn test_lock<S: KvStore + ?Sized>(store: &S, prefix: &str) {
    let key = format!("{prefix}:lock");
    let ttl = Duration::from_secs(5);

    assert!(store.try_lock(&key, "a", ttl).await.unwrap());
    assert!(!store.try_lock(&key, "b", ttl).await.unwrap());
    assert!(!store.unlock(&key, "b").await.unwrap(), "foreign token must not unlock");
    assert!(store.unlock(&key, "a").await.unwrap());
    assert!(store.try_lock(&key, "b", ttl).await.unwrap());
}

/// Run all KvStore interface tests against a store implementation.
#[macro_export]
macro_rules! run_kv_store_tests {
    ($store:expr, $prefix:expr) => {
        use $crate::storage::kv_store_tests::*;

        test_hash_set_if_absent_keeps_first($store, $prefix).await;
        println!("  test_hash_set_if_absent_keeps_first: PASSED");

        test_set_get_delete($store, $prefix).await;
        println!("  test_set_get_delete: PASSED");

        test_incr($store, $prefix).await;
        println!("  test_incr: PASSED");

        test_ttl_expiry($store, $prefix).await;
        println!("  test_ttl_expiry: PASSED");

        test_list_push_and_remove($store, $prefix).await;
        println!("  test_list_push_and_remove: PASSED");

        test_blocking_move($store, $prefix).await;
        println!("  test_blocking_move: PASSED");

        test_blocking_move_times_out($store, $prefix).await;
        println!("  test_blocking_move_times_out: PASSED");

        test_set_union($store, $prefix).await;
        println!("  test_set_union: PASSED");

        test_sorted_range_by_score($store, $prefix).await;
        println!("  test_sorted_range_by_score: PASSED");

        test_scan_keys($store, $prefix).await;
        println!("  test_scan_keys: PASSED");

        test_scan_keys_classes_and_escapes($store, $prefix).await;
        println!("  test_scan_keys_classes_and_escapes: PASSED");

        test_lock($store, $prefix).await;
        println!("  test_lock: PASSED");
    };
}
