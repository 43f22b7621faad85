//! End-to-end locking scenarios driving real threads through real
//! blocking: FIFO queue behavior, promotion ordering, atomic
//! acquire-and-release, escalation, and host-side abort cleanup.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use granlock::{
    LockEvent, LockManager, LockMode, LockObserver, RecordingObserver, ResourceName, Session,
    TransactionHandle, TxnId, ensure_sufficient_lock_held, handle_of,
};

fn session(n: u64) -> (Arc<Session>, Arc<dyn TransactionHandle>) {
    let session = Arc::new(Session::new(TxnId::new(n)));
    let handle = handle_of(&session);
    (session, handle)
}

/// Poll `condition` until it holds, panicking after a generous deadline.
/// Keeps the threaded tests deterministic without trusting sleeps.
fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn spawn_acquire(
    manager: &Arc<LockManager>,
    handle: &Arc<dyn TransactionHandle>,
    name: &ResourceName,
    mode: LockMode,
) -> JoinHandle<()> {
    let manager = Arc::clone(manager);
    let handle = Arc::clone(handle);
    let name = name.clone();
    thread::spawn(move || manager.acquire(&handle, &name, mode).unwrap())
}

#[test]
fn queue_head_x_blocks_compatible_tail() {
    let manager = Arc::new(LockManager::new());
    let (_, t1) = session(1);
    let (_, t2) = session(2);
    let (_, t3) = session(3);
    let a = ResourceName::root("a");

    manager.acquire(&t1, &a, LockMode::S).unwrap();

    let w2 = spawn_acquire(&manager, &t2, &a, LockMode::X);
    wait_until("t2 queued", || manager.queue_length(&a) == 1);

    let w3 = spawn_acquire(&manager, &t3, &a, LockMode::S);
    wait_until("t3 queued", || manager.queue_length(&a) == 2);

    // t3's S is compatible with t1's S, but it must not jump the queued X.
    assert_eq!(manager.get_lock_mode(t3.id(), &a), LockMode::NL);
    assert_eq!(manager.get_lock_mode(t2.id(), &a), LockMode::NL);

    manager.release(t1.id(), &a).unwrap();
    wait_until("t2 granted X", || {
        manager.get_lock_mode(t2.id(), &a) == LockMode::X
    });
    w2.join().unwrap();

    // The S behind the granted X is still incompatible and stays queued.
    assert_eq!(manager.get_lock_mode(t3.id(), &a), LockMode::NL);
    assert_eq!(manager.queue_length(&a), 1);

    manager.release(t2.id(), &a).unwrap();
    wait_until("t3 granted S", || {
        manager.get_lock_mode(t3.id(), &a) == LockMode::S
    });
    w3.join().unwrap();
    manager.assert_invariants();
}

#[test]
fn drained_queue_grants_compatible_run() {
    let manager = Arc::new(LockManager::new());
    let (_, t1) = session(1);
    let (_, t2) = session(2);
    let (_, t3) = session(3);
    let a = ResourceName::root("a");

    manager.acquire(&t1, &a, LockMode::X).unwrap();

    let w2 = spawn_acquire(&manager, &t2, &a, LockMode::S);
    wait_until("t2 queued", || manager.queue_length(&a) == 1);
    let w3 = spawn_acquire(&manager, &t3, &a, LockMode::S);
    wait_until("t3 queued", || manager.queue_length(&a) == 2);

    // One release drains both compatible readers, head first.
    manager.release(t1.id(), &a).unwrap();
    wait_until("both readers granted", || {
        manager.get_lock_mode(t2.id(), &a) == LockMode::S
            && manager.get_lock_mode(t3.id(), &a) == LockMode::S
    });
    assert_eq!(manager.queue_length(&a), 0);
    w2.join().unwrap();
    w3.join().unwrap();
    manager.assert_invariants();
}

#[test]
fn promotion_jumps_to_queue_front() {
    let manager = Arc::new(LockManager::new());
    let (_, t1) = session(1);
    let (_, t2) = session(2);
    let (_, t3) = session(3);
    let a = ResourceName::root("a");

    manager.acquire(&t1, &a, LockMode::S).unwrap();
    manager.acquire(&t2, &a, LockMode::S).unwrap();

    // t1's upgrade conflicts with t2's S and waits at the front.
    let promoter = {
        let manager = Arc::clone(&manager);
        let t1 = Arc::clone(&t1);
        let a = a.clone();
        thread::spawn(move || manager.promote(&t1, &a, LockMode::X).unwrap())
    };
    wait_until("promotion queued", || manager.queue_length(&a) == 1);

    // A later plain request lines up behind the promotion.
    let w3 = spawn_acquire(&manager, &t3, &a, LockMode::S);
    wait_until("t3 queued behind promotion", || {
        manager.queue_length(&a) == 2
    });

    manager.release(t2.id(), &a).unwrap();
    wait_until("t1 promoted", || {
        manager.get_lock_mode(t1.id(), &a) == LockMode::X
    });
    promoter.join().unwrap();
    assert_eq!(
        manager.get_lock_mode(t3.id(), &a),
        LockMode::NL,
        "reader keeps waiting behind the new X"
    );

    manager.release(t1.id(), &a).unwrap();
    wait_until("t3 granted", || {
        manager.get_lock_mode(t3.id(), &a) == LockMode::S
    });
    w3.join().unwrap();
    manager.assert_invariants();
}

#[test]
fn acquire_and_release_is_atomic_to_observers() {
    let manager = Arc::new(LockManager::new());
    let (_, t1) = session(1);
    let db = ResourceName::database();
    let table = db.child("t");
    let pages: Vec<ResourceName> = (0..4).map(|i| table.child(format!("p{i}"))).collect();

    manager.acquire(&t1, &db, LockMode::IX).unwrap();
    manager.acquire(&t1, &table, LockMode::IX).unwrap();
    for page in &pages {
        manager.acquire(&t1, page, LockMode::X).unwrap();
    }

    // A prober takes single snapshots of t1's lock set; it must only ever
    // see the fine-grained state or the coarsened state, nothing between.
    let prober = {
        let manager = Arc::clone(&manager);
        let txn = t1.id();
        thread::spawn(move || {
            for _ in 0..500 {
                let locks = manager.locks_of(txn);
                let modes: Vec<LockMode> = locks.iter().map(|l| l.mode).collect();
                let fine = modes
                    == [
                        LockMode::IX,
                        LockMode::IX,
                        LockMode::X,
                        LockMode::X,
                        LockMode::X,
                        LockMode::X,
                    ];
                let coarse = modes == [LockMode::IX, LockMode::X];
                assert!(fine || coarse, "observed intermediate state: {locks:?}");
                thread::yield_now();
            }
        })
    };

    let mut release = pages.clone();
    release.push(table.clone());
    manager
        .acquire_and_release(&t1, &table, LockMode::X, &release)
        .unwrap();

    prober.join().unwrap();
    assert_eq!(manager.get_lock_mode(t1.id(), &table), LockMode::X);
    for page in &pages {
        assert_eq!(manager.get_lock_mode(t1.id(), page), LockMode::NL);
    }
    manager.assert_invariants();
}

#[test]
fn blocked_acquire_and_release_keeps_old_locks_until_granted() {
    let manager = Arc::new(LockManager::new());
    let (_, t1) = session(1);
    let (_, t2) = session(2);
    let db = ResourceName::database();
    let table = db.child("t");
    let page = table.child("p");

    manager.acquire(&t1, &db, LockMode::IX).unwrap();
    manager.acquire(&t1, &table, LockMode::IX).unwrap();
    manager.acquire(&t1, &page, LockMode::X).unwrap();
    manager.acquire(&t2, &db, LockMode::IX).unwrap();
    manager.acquire(&t2, &table, LockMode::IX).unwrap();

    // t2's IX on the table blocks t1's X; the escalation parks at the
    // front of the queue with its releases still pending.
    let escalator = {
        let manager = Arc::clone(&manager);
        let t1 = Arc::clone(&t1);
        let table = table.clone();
        let release = vec![table.clone(), page.clone()];
        thread::spawn(move || {
            manager
                .acquire_and_release(&t1, &table, LockMode::X, &release)
                .unwrap();
        })
    };
    wait_until("escalation queued", || manager.queue_length(&table) == 1);

    // Nothing has been released while the request waits.
    assert_eq!(manager.get_lock_mode(t1.id(), &page), LockMode::X);
    assert_eq!(manager.get_lock_mode(t1.id(), &table), LockMode::IX);

    manager.release(t2.id(), &table).unwrap();
    wait_until("escalation granted", || {
        manager.get_lock_mode(t1.id(), &table) == LockMode::X
    });
    escalator.join().unwrap();
    assert_eq!(manager.get_lock_mode(t1.id(), &page), LockMode::NL);
    manager.assert_invariants();
}

#[test]
fn duplicate_queue_entries_drain_cleanly() {
    let manager = Arc::new(LockManager::new());
    let (_, t1) = session(1);
    let a = ResourceName::root("a");

    manager.acquire(&t1, &a, LockMode::X).unwrap();

    // The same transaction queues twice (nothing forbids it; the second
    // entry is pathological but must drain cleanly).
    let (_, t2a) = session(2);
    let (_, t2b) = session(2);
    let w1 = spawn_acquire(&manager, &t2a, &a, LockMode::S);
    wait_until("first entry queued", || manager.queue_length(&a) == 1);
    let w2 = spawn_acquire(&manager, &t2b, &a, LockMode::S);
    wait_until("second entry queued", || manager.queue_length(&a) == 2);

    manager.release(t1.id(), &a).unwrap();
    w1.join().unwrap();
    w2.join().unwrap();

    // Both entries drained; the transaction ends up with exactly one lock.
    assert_eq!(manager.locks_of(TxnId::new(2)).len(), 1);
    assert_eq!(manager.queue_length(&a), 0);
    manager.assert_invariants();
}

#[test]
fn release_all_cleans_up_and_wakes_waiters() {
    let manager = Arc::new(LockManager::new());
    let (_, t1) = session(1);
    let (_, t2) = session(2);
    let db = ResourceName::database();
    let table = db.child("t");

    manager.acquire(&t1, &db, LockMode::IX).unwrap();
    manager.acquire(&t1, &table, LockMode::X).unwrap();

    let waiter = spawn_acquire(&manager, &t2, &table, LockMode::S);
    wait_until("t2 queued", || manager.queue_length(&table) == 1);

    // Host-side abort of t1: everything goes, and t2 gets its lock.
    manager.release_all(t1.id());
    wait_until("t2 granted after abort", || {
        manager.get_lock_mode(t2.id(), &table) == LockMode::S
    });
    waiter.join().unwrap();
    assert!(manager.locks_of(t1.id()).is_empty());
    manager.assert_invariants();
}

#[test]
fn release_all_unblocks_the_aborted_transactions_own_request() {
    let manager = Arc::new(LockManager::new());
    let (_, t1) = session(1);
    let (_, t2) = session(2);
    let a = ResourceName::root("a");

    manager.acquire(&t2, &a, LockMode::X).unwrap();

    let waiter = spawn_acquire(&manager, &t1, &a, LockMode::S);
    wait_until("t1 queued", || manager.queue_length(&a) == 1);

    // Aborting t1 pulls its request off the queue and lets its thread go.
    manager.release_all(t1.id());
    waiter.join().unwrap();
    assert_eq!(manager.get_lock_mode(t1.id(), &a), LockMode::NL);
    assert_eq!(manager.queue_length(&a), 0);
    manager.assert_invariants();
}

#[test]
fn release_all_of_a_queued_writer_frees_the_reader_behind_it() {
    let manager = Arc::new(LockManager::new());
    let (_, t1) = session(1);
    let (_, t2) = session(2);
    let (_, t3) = session(3);
    let a = ResourceName::root("a");

    manager.acquire(&t1, &a, LockMode::S).unwrap();

    let writer = spawn_acquire(&manager, &t2, &a, LockMode::X);
    wait_until("t2 queued", || manager.queue_length(&a) == 1);
    let reader = spawn_acquire(&manager, &t3, &a, LockMode::S);
    wait_until("t3 queued behind the writer", || {
        manager.queue_length(&a) == 2
    });

    // Aborting the queued writer leaves t3 at the head, now compatible
    // with t1's S; it must be granted without anyone releasing anything.
    manager.release_all(t2.id());
    writer.join().unwrap();
    wait_until("t3 granted after the writer aborts", || {
        manager.get_lock_mode(t3.id(), &a) == LockMode::S
    });
    reader.join().unwrap();
    assert_eq!(manager.get_lock_mode(t1.id(), &a), LockMode::S);
    assert_eq!(manager.queue_length(&a), 0);
    manager.assert_invariants();
}

#[test]
fn contention_is_reported_to_the_observer() {
    let observer = Arc::new(RecordingObserver::new());
    let manager = Arc::new(LockManager::with_observer(
        Arc::clone(&observer) as Arc<dyn LockObserver>
    ));
    let (_, t1) = session(1);
    let (_, t2) = session(2);
    let a = ResourceName::root("a");

    manager.acquire(&t1, &a, LockMode::X).unwrap();
    let waiter = spawn_acquire(&manager, &t2, &a, LockMode::S);
    wait_until("t2 queued", || manager.queue_length(&a) == 1);

    let events = observer.snapshot();
    assert!(
        events.iter().any(|event| matches!(
            event,
            LockEvent::Contention { requester, holder: Some(holder), requested: LockMode::S, .. }
                if requester.get() == 2 && holder.get() == 1
        )),
        "expected a contention event, got {events:?}"
    );

    manager.release(t1.id(), &a).unwrap();
    waiter.join().unwrap();
}

#[test]
fn facade_blocks_like_the_manager_does() {
    let manager = Arc::new(LockManager::new());
    let (_, t1) = session(1);
    let (_, t2) = session(2);
    let table_name = ResourceName::database().child("t");

    // t1 writes a page of the table through the facade.
    let page_ctx = manager.context(&table_name).child("p");
    ensure_sufficient_lock_held(&t1, &page_ctx, LockMode::X).unwrap();

    // t2 wants the whole table shared; the facade's S(table) must wait
    // for t1's IX to go away.
    let reader = {
        let manager = Arc::clone(&manager);
        let t2 = Arc::clone(&t2);
        let table_name = table_name.clone();
        thread::spawn(move || {
            let table_ctx = manager.context(&table_name);
            ensure_sufficient_lock_held(&t2, &table_ctx, LockMode::S).unwrap();
        })
    };
    wait_until("t2 queued on the table", || {
        manager.queue_length(&table_name) == 1
    });

    manager.release_all(t1.id());
    wait_until("t2 granted", || {
        manager.get_lock_mode(t2.id(), &table_name) == LockMode::S
    });
    reader.join().unwrap();
    manager.assert_invariants();
}

#[test]
fn full_transaction_lifecycle_through_contexts() {
    let manager = Arc::new(LockManager::new());
    let (_, t1) = session(1);
    let db = manager.database_context();
    let orders = db.child("orders");

    // Scattered page writes, then coarsening, then teardown.
    for i in 0..3 {
        let page = orders.child(format!("p{i}"));
        ensure_sufficient_lock_held(&t1, &page, LockMode::X).unwrap();
    }
    assert_eq!(orders.child_lock_count(t1.id()), 3);

    orders.escalate(&t1).unwrap();
    assert_eq!(orders.explicit_lock_mode(t1.id()), LockMode::X);
    assert_eq!(orders.child_lock_count(t1.id()), 0);

    orders.release(t1.id()).unwrap();
    db.release(t1.id()).unwrap();
    assert_eq!(manager.lock_count(), 0);
    manager.assert_invariants();
}
