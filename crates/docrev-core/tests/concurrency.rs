use docrev_core::{
    Database, DatabaseOptions, MemoryAttachmentStore, MemoryStore, Properties, RevisionStore,
    UpdateDecision,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn seeded(store: &Arc<MemoryStore>) -> Database {
    let db = Database::new(
        Arc::clone(store) as Arc<dyn RevisionStore>,
        Arc::new(MemoryAttachmentStore::new()),
        DatabaseOptions::default(),
    );
    let Value::Object(props) = json!({"count": 0}) else {
        unreachable!()
    };
    db.document("counter")
        .unwrap()
        .put_properties(Some(props))
        .unwrap();
    db
}

fn increment(db: &Database, invocations: &AtomicUsize) {
    let doc = db.document("counter").unwrap();
    let saved = doc
        .update(|draft| {
            invocations.fetch_add(1, Ordering::SeqCst);
            let count = draft.property("count").and_then(Value::as_i64).unwrap_or(0);
            draft.set_property("count", count + 1);
            UpdateDecision::Save
        })
        .unwrap();
    assert!(saved.is_some());
}

#[test]
fn racing_updates_on_shared_document_lose_nothing() {
    const WRITERS: usize = 3;
    let store = Arc::new(MemoryStore::new());
    let db = seeded(&store);
    let invocations = AtomicUsize::new(0);
    let barrier = Barrier::new(WRITERS);

    thread::scope(|scope| {
        for _ in 0..WRITERS {
            scope.spawn(|| {
                barrier.wait();
                increment(&db, &invocations);
            });
        }
    });

    let doc = db.document("counter").unwrap();
    assert_eq!(doc.property("count").unwrap(), Some(json!(WRITERS)));
    assert_eq!(store.revision_count("counter"), WRITERS + 1);
    assert!(invocations.load(Ordering::SeqCst) >= WRITERS);
    assert_eq!(doc.conflicting_revisions().unwrap().len(), 1);
}

#[test]
fn racing_updates_through_separate_databases_converge() {
    const WRITERS: usize = 3;
    const ROUNDS: usize = 5;
    let store = Arc::new(MemoryStore::new());
    seeded(&store);
    let invocations = AtomicUsize::new(0);
    let barrier = Barrier::new(WRITERS);

    // Each writer has its own document instance and cache, so every
    // conflict it sees comes from a stale cached parent.
    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            Database::new(
                Arc::clone(&store) as Arc<dyn RevisionStore>,
                Arc::new(MemoryAttachmentStore::new()),
                DatabaseOptions::default(),
            )
        })
        .collect();
    // Held for the whole race so each cache stays warm between rounds.
    let docs: Vec<_> = handles
        .iter()
        .map(|db| db.document("counter").unwrap())
        .collect();
    for doc in &docs {
        doc.current_revision().unwrap();
    }

    thread::scope(|scope| {
        for db in &handles {
            let barrier = &barrier;
            let invocations = &invocations;
            scope.spawn(move || {
                for _ in 0..ROUNDS {
                    barrier.wait();
                    increment(db, invocations);
                }
            });
        }
    });

    let total = WRITERS * ROUNDS;
    let doc = &docs[0];
    doc.invalidate_current_revision();
    assert_eq!(doc.property("count").unwrap(), Some(json!(total)));
    assert_eq!(store.revision_count("counter"), total + 1);
    assert!(invocations.load(Ordering::SeqCst) >= total);
}

#[test]
fn cancel_after_n_invocations_bounds_the_loop() {
    let store = Arc::new(MemoryStore::new());
    let db = seeded(&store);
    let doc = db.document("counter").unwrap();

    let mut invocations = 0;
    let result = doc
        .update(|draft| {
            invocations += 1;
            if invocations > 3 {
                return UpdateDecision::Cancel;
            }
            // A competing writer always lands first.
            let mut rival = draft.document().new_revision().unwrap();
            rival.set_property("rival", invocations);
            rival.save().unwrap();
            draft.set_property("mine", true);
            UpdateDecision::Save
        })
        .unwrap();

    assert!(result.is_none());
    assert_eq!(invocations, 4);
    let current = doc.current_revision().unwrap().unwrap();
    assert_eq!(current.property("mine"), None);
    let mut expected = Properties::new();
    expected.insert("count".to_string(), json!(0));
    expected.insert("rival".to_string(), json!(3));
    assert_eq!(current.user_properties(), expected);
}
