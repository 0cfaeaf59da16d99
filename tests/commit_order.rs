//! Properties of the commit stage's parent-before-child insert ordering,
//! checked both on the comparator and against the real store's
//! referential-integrity enforcement.

use chrono::Utc;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use uuid::Uuid;

use gantry::import::commit::order_for_insert;
use gantry::model::{Issue, IssueState, Priority, Project, StateKind};
use gantry::storage::{SqliteStorage, sqlite};

struct Fixture {
    storage: SqliteStorage,
    project_id: Uuid,
    state_id: Uuid,
}

fn store_fixture() -> Fixture {
    let mut storage = SqliteStorage::open_memory().unwrap();
    let workspace_id = Uuid::new_v4();
    storage.ensure_workspace(workspace_id, "ws").unwrap();

    let project = Project {
        id: Uuid::new_v4(),
        workspace_id,
        key: "SRC".to_string(),
        name: "Source".to_string(),
        description: String::new(),
        source_key: "SRC".to_string(),
        created_at: Utc::now(),
    };
    let state = IssueState {
        id: Uuid::new_v4(),
        project_id: project.id,
        name: "Open".to_string(),
        kind: StateKind::Unstarted,
        color: "#4c9aff".to_string(),
        source_id: "1".to_string(),
    };
    let (project_id, state_id) = (project.id, state.id);
    storage
        .with_transaction(|tx| {
            sqlite::insert_project(tx, &project)?;
            sqlite::insert_states(tx, std::slice::from_ref(&state))
        })
        .unwrap();

    Fixture {
        storage,
        project_id,
        state_id,
    }
}

fn issue(fixture: &Fixture, key: &str, id: Uuid, parent: Option<Uuid>) -> Issue {
    Issue {
        id,
        project_id: fixture.project_id,
        number: key.rsplit('-').next().and_then(|n| n.parse().ok()).unwrap_or(0),
        title: key.to_string(),
        description: String::new(),
        state_id: fixture.state_id,
        priority: Priority::None,
        parent_id: parent,
        sort_order: 0,
        created_by: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        source_key: key.to_string(),
    }
}

#[test]
fn store_rejects_child_inserted_before_parent() {
    let mut fixture = store_fixture();
    let parent_id = Uuid::new_v4();
    let child = issue(&fixture, "SRC-2", Uuid::new_v4(), Some(parent_id));
    let parent = issue(&fixture, "SRC-1", parent_id, None);

    let reversed = fixture
        .storage
        .with_transaction(|tx| sqlite::insert_issues(tx, &[child.clone(), parent.clone()]));
    assert!(
        reversed.is_err(),
        "inserting a child before its parent must violate the FK"
    );

    // Rolled back: the correct order still succeeds from a clean slate.
    fixture
        .storage
        .with_transaction(|tx| sqlite::insert_issues(tx, &[parent, child]))
        .unwrap();
    assert_eq!(fixture.storage.issue_count().unwrap(), 2);
}

#[test]
fn ordered_fixture_forest_commits() {
    let mut fixture = store_fixture();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let c = Uuid::new_v4();

    // Staged in an adversarial order; the comparator must repair it.
    let ordered = order_for_insert(vec![
        issue(&fixture, "SRC-3", c, Some(b)),
        issue(&fixture, "SRC-2", b, Some(a)),
        issue(&fixture, "SRC-1", a, None),
    ]);

    fixture
        .storage
        .with_transaction(|tx| sqlite::insert_issues(tx, &ordered))
        .unwrap();
    assert_eq!(fixture.storage.issue_count().unwrap(), 3);
}

proptest! {
    /// For any forest (each issue's parent appears earlier in the generation
    /// order, then the whole list is shuffled), the computed insert order
    /// places every parent strictly before its children.
    #[test]
    fn parents_always_precede_children(
        parent_slots in prop::collection::vec(prop::option::of(0usize..32), 1..32),
        seed in any::<u64>(),
    ) {
        let ids: Vec<Uuid> = (0..parent_slots.len()).map(|_| Uuid::new_v4()).collect();
        let fixture = store_fixture();

        let mut issues: Vec<Issue> = parent_slots
            .iter()
            .enumerate()
            .map(|(index, parent_slot)| {
                // Only allow earlier issues as parents, which guarantees an
                // acyclic forest.
                let parent = parent_slot
                    .filter(|&slot| slot < index)
                    .map(|slot| ids[slot]);
                issue(&fixture, &format!("SRC-{}", index + 1), ids[index], parent)
            })
            .collect();

        // Deterministic shuffle from the seed.
        let mut rng = StdRng::seed_from_u64(seed);
        issues.shuffle(&mut rng);

        let ordered = order_for_insert(issues);

        let mut seen = std::collections::HashSet::new();
        for item in &ordered {
            if let Some(parent) = item.parent_id {
                prop_assert!(
                    seen.contains(&parent),
                    "{} inserted before its parent", item.source_key
                );
            }
            seen.insert(item.id);
        }
    }
}
