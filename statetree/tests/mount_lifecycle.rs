//! Mounting, dynamic children, removal and re-rooting through the public
//! `Store` surface.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde_json::json;
use statetree::core::graph::DependencyGraph;
use statetree::test_support::{
    RecordingInstance, command, parent_of, permissive_store, recording_paths, state,
    state_with_defaults, store,
};
use statetree::{
    Action, ActionStatus, DiagnosticKind, HandlerOutput, LocationAddress, MountedNode,
    StateDefinition, StoreError, UpdateState,
};

fn paths(nodes: &[Arc<MountedNode>]) -> Vec<String> {
    nodes.iter().map(|node| node.path.clone()).collect()
}

/// Mounting a parent with a declared child nests the child's defaults.
#[test]
fn mount_nests_child_defaults_under_parent() {
    let store = store();
    let b = state_with_defaults("b", json!({"flag": true}));
    let a = StateDefinition::builder("a")
        .defaults(json!({"n": 0}))
        .child(b)
        .build();

    let mounted = store.mount(&[a]).expect("mount");
    assert_eq!(paths(&mounted), vec!["a", "a.b"]);
    assert_eq!(
        store.snapshot().to_json(),
        json!({"a": {"n": 0, "b": {"flag": true}}})
    );
}

#[test]
fn mount_order_is_independent_of_declaration_order() {
    let store = store();
    let leaf = state("leaf");
    let mid = parent_of("mid", &[leaf.clone()]);
    let top = parent_of("top", &[mid.clone()]);

    let mounted = store.mount(&[leaf, mid, top]).expect("mount");
    assert_eq!(paths(&mounted), vec!["top", "top.mid", "top.mid.leaf"]);
}

#[test]
fn cyclic_graph_is_rejected() {
    let graph = DependencyGraph::from_declarations([
        ("a", vec!["b"]),
        ("b", vec!["a"]),
    ])
    .expect("graph");
    assert!(matches!(
        graph.topological_sort(),
        Err(StoreError::Cycle(_))
    ));
}

#[test]
fn invalid_and_duplicate_names_abort_mount() {
    let store = store();
    let err = store.mount(&[state("has space")]).expect_err("invalid");
    assert!(err.is_validation());

    let err = store
        .mount(&[state("dup"), parent_of("p", &[state("dup")])])
        .expect_err("duplicate");
    assert!(matches!(err, StoreError::DuplicateName(name) if name == "dup"));
    assert!(store.nodes().is_empty());
    assert_eq!(store.snapshot().to_json(), json!({}));
}

#[test]
fn mounting_twice_is_idempotent() {
    let store = store();
    let a = state_with_defaults("a", json!({"n": 1}));
    store.mount(&[a.clone()]).expect("mount");
    let again = store.mount(&[a]).expect("mount again");
    assert!(again.is_empty());
    assert_eq!(store.nodes().len(), 1);
}

/// A definition only used as a dynamic child still mounts at its own root path.
#[test]
fn mount_after_add_child_uses_the_root_path() {
    let store = store();
    let list = state("list");
    let item = state_with_defaults("item", json!({"n": 1}));
    store.mount(&[list.clone()]).expect("mount");
    store.add_child(&list, &item, Some("first"), None).expect("first");

    let mounted = store.mount(&[item]).expect("mount item");
    assert_eq!(paths(&mounted), vec!["item"]);
    assert_eq!(
        store.snapshot().to_json(),
        json!({"list": {"first": {"n": 1}}, "item": {"n": 1}})
    );
}

#[test]
fn add_child_mounts_grandchildren_and_seeds_defaults() {
    let store = store();
    let list = state_with_defaults("list", json!({"title": "groceries"}));
    store.mount(&[list.clone()]).expect("mount");

    let note = state_with_defaults("note", json!({"text": ""}));
    let item = StateDefinition::builder("item")
        .defaults(json!({"done": false}))
        .child(note)
        .build();

    let added = store
        .add_child(&list, &item, Some("milk"), None)
        .expect("add child");
    assert_eq!(paths(&added), vec!["list.milk", "list.milk.note"]);
    assert_eq!(
        store.snapshot().to_json(),
        json!({"list": {"title": "groceries", "milk": {"done": false, "note": {"text": ""}}}})
    );
    assert!(added.iter().all(|node| node.context == "main"));
}

/// Re-adding at an occupied path is a diagnostic, not an error.
#[test]
fn add_child_at_occupied_path_is_skipped() {
    let store = store();
    let list = state("list");
    let item = state_with_defaults("item", json!({"n": 1}));
    store.mount(&[list.clone()]).expect("mount");
    store.add_child(&list, &item, None, None).expect("first");

    let again = store.add_child(&list, &item, None, None).expect("second");
    assert!(again.is_empty());
    let diagnostics = store.take_diagnostics();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].kind, DiagnosticKind::PathOccupied);
}

#[test]
fn add_child_reports_missing_parent() {
    let store = store();
    let err = store
        .add_child(&state("ghost"), &state("child"), None, None)
        .expect_err("missing parent");
    assert!(matches!(err, StoreError::NotFound(_)));

    let permissive = permissive_store();
    let added = permissive
        .add_child(&state("ghost"), &state("child"), None, None)
        .expect("tolerated");
    assert!(added.is_empty());
    assert_eq!(permissive.diagnostics()[0].kind, DiagnosticKind::ParentNotFound);
}

#[test]
fn add_child_in_location_requires_unique_parent_under_path() {
    let store = store();
    let board = state("board");
    let column = state("column");
    let card = state("card");
    store.mount(&[board.clone()]).expect("mount");
    store.add_child(&board, &column, Some("todo"), None).expect("todo");
    store.add_child(&board, &column, Some("done"), None).expect("done");

    let err = store
        .add_child_in_location(&column, &card, &LocationAddress::by_path("board"), None)
        .expect_err("two columns under board");
    assert!(matches!(err, StoreError::AmbiguousLocation(_)));

    let added = store
        .add_child_in_location(&column, &card, &LocationAddress::by_path("board.todo"), None)
        .expect("unique column");
    assert_eq!(paths(&added), vec!["board.todo.card"]);
}

#[test]
fn add_child_in_path_uses_exact_parent() {
    let store = store();
    let board = state("board");
    store.mount(&[board.clone()]).expect("mount");
    store
        .add_child(&board, &state("column"), Some("todo"), None)
        .expect("column");

    let added = store
        .add_child_in_path(&state("card"), &LocationAddress::by_path("board.todo"), Some("c1"))
        .expect("card");
    assert_eq!(paths(&added), vec!["board.todo.c1"]);

    let err = store
        .add_child_in_path(&state("card"), &LocationAddress::by_path("board.nope"), None)
        .expect_err("no parent");
    assert!(err.is_lookup());
}

#[test]
fn add_child_in_context_picks_parent_of_type() {
    let store = store();
    let editor = state("editor");
    store.mount(&[editor.clone()]).expect("mount");

    let added = store
        .add_child_in_context(
            &editor,
            &LocationAddress::by_context("main", "editor"),
            &state("line"),
            Some("line_1"),
            None,
        )
        .expect("line");
    assert_eq!(paths(&added), vec!["editor.line_1"]);

    let err = store
        .add_child_in_context(
            &editor,
            &LocationAddress::by_context("elsewhere", "editor"),
            &state("line"),
            None,
            None,
        )
        .expect_err("wrong context");
    assert!(matches!(err, StoreError::NotFound(_)));
}

/// Removing a node removes its descendants from the registry, the tree and
/// from dispatch.
#[tokio::test]
async fn remove_child_removes_descendants_everywhere() {
    let store = store();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let grandchild = StateDefinition::builder("grandchild")
        .on_type("ping", recording_paths(seen.clone()))
        .build();
    let child = StateDefinition::builder("child")
        .child(grandchild)
        .on_type("ping", recording_paths(seen.clone()))
        .build();
    let root = parent_of("root", &[child.clone()]);
    let sibling = StateDefinition::builder("sibling")
        .on_type("ping", recording_paths(seen.clone()))
        .build();
    store.mount(&[root, sibling]).expect("mount");

    let removed = store.remove_child(&child);
    assert_eq!(paths(&removed), vec!["root.child", "root.child.grandchild"]);
    assert_eq!(paths(&store.nodes()), vec!["root", "sibling"]);
    assert_eq!(store.snapshot().to_json(), json!({"root": {}, "sibling": {}}));

    let outcome = store.dispatch(command("ping")).expect("dispatch").await;
    assert_eq!(outcome.status, ActionStatus::Successful);
    assert_eq!(*seen.lock().expect("seen"), vec!["sibling".to_string()]);
}

#[test]
fn removing_missing_target_is_a_diagnostic() {
    let store = store();
    assert!(store.remove_child_by_name("nothing").is_empty());
    let removed = store
        .remove_state_in_path(&LocationAddress::by_path("a.b"))
        .expect("no-op");
    assert!(removed.is_empty());
    let kinds: Vec<_> = store.diagnostics().iter().map(|d| d.kind).collect();
    assert_eq!(
        kinds,
        vec![
            DiagnosticKind::RemovalTargetMissing,
            DiagnosticKind::RemovalTargetMissing
        ]
    );
}

/// `on_destroy` only fires when the last node sharing an instance goes away.
#[test]
fn teardown_hook_fires_for_last_instance_only() {
    let store = store();
    let shared = RecordingInstance::new();
    let tab = StateDefinition::builder("tab")
        .shared_instance(shared.clone())
        .build();
    let window = state("window");
    store.mount(&[window.clone()]).expect("mount");
    store.add_child(&window, &tab, Some("left"), None).expect("left");
    store.add_child(&window, &tab, Some("right"), None).expect("right");

    store
        .remove_state_in_path(&LocationAddress::by_path("window.left"))
        .expect("remove left");
    assert_eq!(shared.destroy_count(), 0);

    store
        .remove_state_in_path(&LocationAddress::by_path("window.right"))
        .expect("remove right");
    assert_eq!(shared.destroy_count(), 1);
    assert_eq!(store.snapshot().to_json(), json!({"window": {}}));
}

#[test]
fn remove_state_removes_every_node_of_definition() {
    let store = store();
    let window = state("window");
    let tab = state("tab");
    store.mount(&[window.clone()]).expect("mount");
    store.add_child(&window, &tab, Some("one"), None).expect("one");
    store.add_child(&window, &tab, Some("two"), None).expect("two");

    let removed = store.remove_state(&tab);
    assert_eq!(removed.len(), 2);
    assert_eq!(paths(&store.nodes()), vec!["window"]);
}

/// After a move, location-routed dispatch follows the new path.
#[tokio::test]
async fn move_subtree_readdresses_nodes_and_value() {
    let store = store();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let line = StateDefinition::builder("line")
        .defaults(json!({"text": "hello"}))
        .on_type("edit", recording_paths(seen.clone()))
        .build();
    let doc = parent_of("doc", &[line]);
    store.mount(&[doc]).expect("mount");

    store.move_subtree("doc.line", "doc.line_2").expect("move");
    assert_eq!(
        store.snapshot().to_json(),
        json!({"doc": {"line_2": {"text": "hello"}}})
    );

    store
        .dispatch_in_location(command("edit"), LocationAddress::by_path("doc.line_2"))
        .expect("dispatch")
        .await;
    assert_eq!(*seen.lock().expect("seen"), vec!["doc.line_2".to_string()]);

    let err = store.move_subtree("doc.line", "doc.other").expect_err("gone");
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[test]
fn location_helpers_find_nested_states() {
    let store = store();
    let cell = state("cell");
    let row = parent_of("row", &[cell]);
    let sheet = parent_of("sheet", &[row]);
    store.mount(&[sheet]).expect("mount");

    let found = store
        .state_in_path(&LocationAddress::by_path("sheet"), "cell")
        .expect("cell under sheet");
    assert_eq!(found.path(), "sheet.row.cell");

    let direct = store
        .state_at(&LocationAddress::by_path("sheet"), "row")
        .expect("row at sheet");
    assert_eq!(direct.path(), "sheet.row");
    assert!(store.state_at(&LocationAddress::by_path("sheet"), "cell").is_err());

    assert_eq!(
        store
            .location_path(&LocationAddress::by_path_tree("sheet", "cell"))
            .expect("tree search"),
        "sheet.row.cell"
    );
}

/// Structural changes are announced with the update marker.
#[tokio::test]
async fn structural_changes_dispatch_update_marker() {
    let store = store();
    let mut actions = store.actions();
    store.mount(&[state("a")]).expect("mount");

    let dispatched = actions.recv().await.expect("dispatched");
    assert_eq!(dispatched.envelope.action_type(), UpdateState::TYPE);
    assert_eq!(dispatched.status, ActionStatus::Dispatched);
    let settled = actions.recv().await.expect("settled");
    assert_eq!(settled.status, ActionStatus::Successful);
    assert!(store.diagnostics().is_empty());
}

fn counting_update_watcher(
    counter: Arc<AtomicUsize>,
    work: fn() -> BoxFuture<'static, ()>,
) -> Arc<StateDefinition> {
    StateDefinition::builder("watcher")
        .on::<UpdateState>(move |_, _| {
            let counter = counter.clone();
            Ok(HandlerOutput::future(async move {
                work().await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
        })
        .build()
}

/// Async work started by the update marker runs to completion on the runtime.
#[tokio::test]
async fn async_update_handlers_settle_on_the_runtime() {
    let store = store();
    let mut actions = store.actions();
    let counter = Arc::new(AtomicUsize::new(0));
    let watcher = counting_update_watcher(counter.clone(), || tokio::task::yield_now().boxed());

    store.mount(&[watcher]).expect("mount watcher");
    store.mount(&[state("other")]).expect("mount other");

    let mut settled = 0;
    while settled < 2 {
        let context = actions.recv().await.expect("action context");
        if context.envelope.action_type() == UpdateState::TYPE
            && context.status == ActionStatus::Successful
        {
            settled += 1;
        }
    }
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert!(store.diagnostics().is_empty());
}

#[test]
fn pending_update_work_without_runtime_is_reported() {
    let store = store();
    let counter = Arc::new(AtomicUsize::new(0));
    let watcher = counting_update_watcher(counter.clone(), || future::pending().boxed());

    store.mount(&[watcher]).expect("mount watcher");
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    let kinds: Vec<DiagnosticKind> = store.diagnostics().iter().map(|d| d.kind).collect();
    assert_eq!(kinds, vec![DiagnosticKind::UpdateDetached]);
}
