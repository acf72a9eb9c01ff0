use std::sync::Arc;

use async_trait::async_trait;

use whirr_store_core::{Memory, MemKey, PendingReturns, Store, StoreError};
use whirr_store_memory::MemoryStore;
use whirr_types::{Call, ReturnAddress};

fn memory() -> Memory {
    Memory::new(Arc::new(MemoryStore::new()))
}

fn addr(root: &str, parent: &str, topic: &str) -> ReturnAddress {
    ReturnAddress::new(root, parent, topic)
}

async fn drain(mem: &Memory, call_hash: &str) -> Vec<ReturnAddress> {
    mem.with_pending_returns_remove::<_, StoreError, _, _>(
        call_hash,
        Vec::new(),
        |mut seen, batch| async move {
            seen.extend(batch);
            (seen, Ok(()))
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn first_pending_return_schedules() {
    let mem = memory();
    let first = mem
        .add_pending_return("child", &addr("r1", "p1", "t"))
        .await
        .unwrap();
    assert!(first);

    // A second parent under the same root piggybacks on the in-flight
    // child message.
    let second = mem
        .add_pending_return("child", &addr("r1", "p2", "t"))
        .await
        .unwrap();
    assert!(!second);
}

#[tokio::test]
async fn repeated_root_schedules_again() {
    let mem = memory();
    assert!(mem
        .add_pending_return("child", &addr("r1", "p1", "t"))
        .await
        .unwrap());
    // Same parent and topic under a different root: the in-flight
    // message belongs to the other root, so schedule again.
    assert!(mem
        .add_pending_return("child", &addr("r2", "p1", "t"))
        .await
        .unwrap());
    // But a different parent under that new root does not.
    assert!(!mem
        .add_pending_return("child", &addr("r2", "p9", "t"))
        .await
        .unwrap());
}

#[tokio::test]
async fn remove_dispatches_all_and_deletes() {
    let mem = memory();
    mem.add_pending_return("child", &addr("r1", "p1", "t"))
        .await
        .unwrap();
    mem.add_pending_return("child", &addr("r1", "p2", "t"))
        .await
        .unwrap();

    let mut seen = drain(&mem, "child").await;
    seen.sort();
    assert_eq!(seen, vec![addr("r1", "p1", "t"), addr("r1", "p2", "t")]);

    // Record is gone; a sibling drain sees exactly one empty batch.
    let batches = mem
        .with_pending_returns_remove::<_, StoreError, _, _>(
            "child",
            Vec::new(),
            |mut batches: Vec<usize>, batch| async move {
                batches.push(batch.len());
                (batches, Ok(()))
            },
        )
        .await
        .unwrap();
    assert_eq!(batches, vec![0]);
}

#[tokio::test]
async fn dispatch_error_leaves_record_in_place() {
    let mem = memory();
    mem.add_pending_return("child", &addr("r1", "p1", "t"))
        .await
        .unwrap();

    let res = mem
        .with_pending_returns_remove::<_, StoreError, _, _>("child", (), |st, _| async move {
            (st, Err(StoreError::Decode("enqueue blew up".into())))
        })
        .await;
    assert!(matches!(res, Err(StoreError::Decode(_))));

    // The record survived, so the addresses are still dispatchable.
    assert_eq!(drain(&mem, "child").await, vec![addr("r1", "p1", "t")]);
}

#[tokio::test]
async fn value_is_write_once() {
    let mem = memory();
    mem.set_value_new("h", b"first").await.unwrap();
    let err = mem.set_value_new("h", b"second").await.unwrap_err();
    assert!(matches!(err, StoreError::CompareMismatch));
    assert_eq!(mem.get_value("h").await.unwrap(), b"first");
}

#[tokio::test]
async fn call_round_trips_through_store() {
    let mem = memory();
    let call = Call {
        task_name: "fib".into(),
        payload: b"[10]".to_vec(),
        call_hash: "hash123".into(),
    };
    mem.set_call(&call).await.unwrap();
    assert_eq!(mem.get_call("hash123").await.unwrap(), call);
}

/// Store whose conditional ops always lose, to prove the retry cap.
struct AlwaysMismatch;

#[async_trait]
impl Store for AlwaysMismatch {
    async fn has(&self, _key: &MemKey) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn get(&self, _key: &MemKey) -> Result<Vec<u8>, StoreError> {
        PendingReturns::default().encode()
    }

    async fn set(&self, _key: &MemKey, _value: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete(&self, _key: &MemKey) -> Result<(), StoreError> {
        Ok(())
    }

    async fn set_new_value(&self, _key: &MemKey, _value: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::CompareMismatch)
    }

    async fn compare_and_set(
        &self,
        _key: &MemKey,
        _value: &[u8],
        _expected: &[u8],
    ) -> Result<(), StoreError> {
        Err(StoreError::CompareMismatch)
    }

    async fn compare_and_delete(
        &self,
        _key: &MemKey,
        _expected: &[u8],
    ) -> Result<(), StoreError> {
        Err(StoreError::CompareMismatch)
    }
}

#[tokio::test]
async fn cas_loop_is_capped() {
    let mem = Memory::new(Arc::new(AlwaysMismatch));
    let err = mem
        .add_pending_return("child", &addr("r", "p", "t"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::CasRetryExceeded(_)));
}
