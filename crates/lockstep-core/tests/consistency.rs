//! Drift detection and repair against real working trees.

mod support;

use std::fs;

use lockstep_core::artifact::Document;
use lockstep_core::consistency::{ConsistencyIssue, Field, RecordRef};
use lockstep_core::model::StoryState;
use lockstep_core::{RepairMode, Resolution, StateError};

use support::{commit_file, git, with_auth_epic};

#[test]
fn fresh_tree_is_consistent() {
    let (_dir, mut manager) = with_auth_epic();
    manager.create_story("5.1", 5, "Login", None, "").expect("create");
    let report = manager.check_consistency().expect("check");
    assert!(report.is_consistent(), "{:?}", report.issues);
}

#[test]
fn story_file_deleted_outside_the_api_is_repaired_in_one_commit() {
    let (dir, mut manager) = with_auth_epic();
    manager.create_story("5.1", 5, "Login", Some(8.0), "").expect("create");
    git(dir.path(), &["rm", "-q", "stories/epic-5/5.1.md"]);
    git(dir.path(), &["commit", "-q", "-m", "Drop login story by hand"]);

    let report = manager.check_consistency().expect("check");
    assert_eq!(
        report.issues,
        vec![ConsistencyIssue::FileDeletedManually {
            record: RecordRef::Story("5.1".to_string()),
            path: "stories/epic-5/5.1.md".to_string(),
        }]
    );

    let before = manager.repo().commit_count().expect("count");
    let outcome = manager
        .repair(&report, RepairMode::FileWins)
        .expect("repair");
    assert_eq!(outcome.applied.len(), 1);
    assert!(outcome.revision.is_some());
    assert_eq!(manager.repo().commit_count().expect("count"), before + 1);
    assert!(manager.story("5.1").expect("read").is_none());
    assert_eq!(manager.epic(5).expect("read").expect("epic").total_stories, 0);

    let again = manager.check_consistency().expect("second check");
    assert!(again.is_consistent(), "{:?}", again.issues);
}

#[test]
fn uncommitted_deletion_is_orphaned_and_not_auto_repaired() {
    let (dir, mut manager) = with_auth_epic();
    manager.create_story("5.1", 5, "Login", None, "").expect("create");
    fs::remove_file(dir.path().join("stories/epic-5/5.1.md")).expect("rm");

    let report = manager.check_consistency().expect("check");
    assert_eq!(report.count("uncommitted_changes"), 1);
    assert_eq!(report.count("orphaned_record"), 1);

    let err = manager
        .repair(&report, RepairMode::FileWins)
        .expect_err("dirty tree");
    assert!(matches!(err, StateError::DirtyWorkingTree { .. }));
    assert!(manager.story("5.1").expect("read").is_some());
}

#[test]
fn unregistered_story_file_is_registered_from_front_matter() {
    let (dir, mut manager) = with_auth_epic();
    commit_file(
        dir.path(),
        "stories/epic-5/5.3.md",
        "---\ntitle: Password reset\nstate: in_progress\n---\nbody\n",
        "Add password reset story by hand",
    );

    let report = manager.check_consistency().expect("check");
    assert_eq!(
        report.issues,
        vec![ConsistencyIssue::UnregisteredFile {
            path: "stories/epic-5/5.3.md".to_string(),
        }]
    );

    manager.repair(&report, RepairMode::FileWins).expect("repair");
    let story = manager.story("5.3").expect("read").expect("registered");
    assert_eq!(story.title, "Password reset");
    assert_eq!(story.state, StoryState::InProgress);
    assert_eq!(story.artifact_path.as_deref(), Some("stories/epic-5/5.3.md"));
    let epic = manager.epic(5).expect("read").expect("epic");
    assert_eq!(epic.in_progress_stories, 1);

    let again = manager.check_consistency().expect("second check");
    assert!(again.is_consistent(), "{:?}", again.issues);
}

#[test]
fn unregistered_epic_and_story_register_in_dependency_order() {
    let (dir, mut manager) = with_auth_epic();
    commit_file(
        dir.path(),
        "stories/epic-7/7.1.md",
        "# Export CSV\n",
        "Add export story",
    );
    commit_file(
        dir.path(),
        "epics/epic-7/epic-7.md",
        "---\ntitle: Reporting\n---\n",
        "Add reporting epic",
    );

    let report = manager.check_consistency().expect("check");
    assert_eq!(report.count("unregistered_file"), 2);
    manager.repair(&report, RepairMode::FileWins).expect("repair");

    let epic = manager.epic(7).expect("read").expect("epic");
    assert_eq!(epic.title, "Reporting");
    assert_eq!(epic.total_stories, 1);
    let story = manager.story("7.1").expect("read").expect("story");
    assert_eq!(story.title, "Export CSV");
    assert!(manager.check_consistency().expect("check").is_consistent());
}

#[test]
fn title_mismatch_file_wins_updates_the_store() {
    let (dir, mut manager) = with_auth_epic();
    manager.create_story("5.1", 5, "Login", None, "").expect("create");
    let path = "stories/epic-5/5.1.md";
    let mut doc = Document::parse(&fs::read_to_string(dir.path().join(path)).expect("read"))
        .expect("parse");
    doc.set_str("title", "Sign in");
    commit_file(dir.path(), path, &doc.render().expect("render"), "Rename login");

    let report = manager.check_consistency().expect("check");
    assert_eq!(
        report.issues,
        vec![ConsistencyIssue::FieldMismatch {
            record: RecordRef::Story("5.1".to_string()),
            path: path.to_string(),
            field: Field::Title,
            store_value: "Login".to_string(),
            file_value: "Sign in".to_string(),
        }]
    );
    manager.repair(&report, RepairMode::FileWins).expect("repair");
    assert_eq!(manager.story("5.1").expect("read").expect("story").title, "Sign in");
}

#[test]
fn interactive_store_wins_rewrites_front_matter_and_skip_leaves_issue() {
    let (dir, mut manager) = with_auth_epic();
    manager.create_story("5.1", 5, "Login", None, "").expect("create 5.1");
    manager.create_story("5.2", 5, "Logout", None, "").expect("create 5.2");
    for (path, state) in [("stories/epic-5/5.1.md", "done"), ("stories/epic-5/5.2.md", "review")] {
        let full = dir.path().join(path);
        let mut doc = Document::parse(&fs::read_to_string(&full).expect("read")).expect("parse");
        doc.set_str("state", state);
        fs::write(&full, doc.render().expect("render")).expect("write");
    }
    git(dir.path(), &["commit", "-q", "-am", "Edit states by hand"]);

    let report = manager.check_consistency().expect("check");
    assert_eq!(report.count("field_mismatch"), 2);

    let mut decide = |issue: &ConsistencyIssue| match issue {
        ConsistencyIssue::FieldMismatch {
            record: RecordRef::Story(id),
            ..
        } if id == "5.1" => Resolution::StoreWins,
        _ => Resolution::Skip,
    };
    let outcome = manager
        .repair(&report, RepairMode::Interactive(&mut decide))
        .expect("repair");
    assert_eq!(outcome.applied.len(), 1);
    assert_eq!(outcome.skipped.len(), 1);

    let text = fs::read_to_string(dir.path().join("stories/epic-5/5.1.md")).expect("read");
    assert_eq!(
        Document::parse(&text).expect("parse").story_state(),
        Some(StoryState::Todo)
    );
    let remaining = manager.check_consistency().expect("check");
    assert_eq!(remaining.count("field_mismatch"), 1);
}

#[test]
fn skipping_everything_makes_no_commit() {
    let (dir, mut manager) = with_auth_epic();
    manager.create_story("5.1", 5, "Login", None, "").expect("create");
    git(dir.path(), &["rm", "-q", "stories/epic-5/5.1.md"]);
    git(dir.path(), &["commit", "-q", "-m", "Drop story"]);

    let report = manager.check_consistency().expect("check");
    let before = manager.repo().commit_count().expect("count");
    let mut skip = |_: &ConsistencyIssue| Resolution::Skip;
    let outcome = manager
        .repair(&report, RepairMode::Interactive(&mut skip))
        .expect("repair");
    assert!(outcome.revision.is_none());
    assert_eq!(manager.repo().commit_count().expect("count"), before);
}

#[test]
fn deleted_epic_with_live_stories_keeps_its_row() {
    let (dir, mut manager) = with_auth_epic();
    manager.create_story("5.1", 5, "Login", None, "").expect("create");
    git(dir.path(), &["rm", "-q", "epics/epic-5/epic-5.md"]);
    git(dir.path(), &["commit", "-q", "-m", "Drop epic file"]);

    let report = manager.check_consistency().expect("check");
    assert_eq!(report.count("file_deleted_manually"), 1);
    manager.repair(&report, RepairMode::FileWins).expect("repair");

    let epic = manager.epic(5).expect("read").expect("epic kept");
    assert!(epic.artifact_path.is_none());
    assert!(manager.story("5.1").expect("read").is_some());
    assert!(manager.check_consistency().expect("check").is_consistent());
}

#[test]
fn hyphenated_state_spelling_matches_the_store() {
    let (dir, mut manager) = with_auth_epic();
    commit_file(
        dir.path(),
        "stories/epic-5/5.3.md",
        "---\ntitle: Password reset\nstate: in-progress\n---\n",
        "Add password reset story by hand",
    );

    let report = manager.check_consistency().expect("check");
    assert_eq!(report.count("unregistered_file"), 1);
    manager.repair(&report, RepairMode::FileWins).expect("repair");
    assert_eq!(
        manager.story("5.3").expect("read").expect("story").state,
        StoryState::InProgress
    );

    let before = manager.repo().commit_count().expect("count");
    let again = manager.check_consistency().expect("second check");
    assert!(again.is_consistent(), "{:?}", again.issues);
    let outcome = manager.repair(&again, RepairMode::FileWins).expect("repair");
    assert!(outcome.revision.is_none());
    assert_eq!(manager.repo().commit_count().expect("count"), before);
}

#[test]
fn unknown_file_state_is_skipped_without_blocking_other_repairs() {
    let (dir, mut manager) = with_auth_epic();
    manager.create_story("5.1", 5, "Login", None, "").expect("create");
    let path = "stories/epic-5/5.1.md";
    let mut doc = Document::parse(&fs::read_to_string(dir.path().join(path)).expect("read"))
        .expect("parse");
    doc.set_str("state", "blocked");
    commit_file(dir.path(), path, &doc.render().expect("render"), "Mark login blocked");
    commit_file(
        dir.path(),
        "stories/epic-5/5.4.md",
        "# Remember me\n",
        "Add remember-me story",
    );

    let report = manager.check_consistency().expect("check");
    assert_eq!(report.count("field_mismatch"), 1);
    assert_eq!(report.count("unregistered_file"), 1);

    let outcome = manager.repair(&report, RepairMode::FileWins).expect("repair");
    assert_eq!(
        outcome.skipped,
        vec![ConsistencyIssue::FieldMismatch {
            record: RecordRef::Story("5.1".to_string()),
            path: path.to_string(),
            field: Field::State,
            store_value: "todo".to_string(),
            file_value: "blocked".to_string(),
        }]
    );
    assert_eq!(outcome.applied.len(), 1);
    assert!(outcome.revision.is_some());
    assert_eq!(manager.story("5.4").expect("read").expect("registered").title, "Remember me");
    assert_eq!(manager.story("5.1").expect("read").expect("story").state, StoryState::Todo);

    let remaining = manager.check_consistency().expect("check");
    assert_eq!(remaining.count("field_mismatch"), 1);
    assert_eq!(remaining.issues.len(), 1);
}
