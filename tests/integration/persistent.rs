//! Persistence and crash-recovery scenarios backed by temporary
//! directories.

use wraith::{
    ArraySlotSpec, FieldKind, FieldSpec, GhostId, GhostKind, LayoutBuilder, Repository, StoreMode,
    WraithError,
};

fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

struct Event;

impl LayoutBuilder for Event {
    fn body_type(&self) -> u16 {
        3
    }
    fn version(&self) -> u16 {
        1
    }
    fn fields(&self) -> Vec<FieldSpec> {
        vec![
            FieldSpec {
                name: "sequence",
                kind: FieldKind::U64,
            },
            FieldSpec {
                name: "severity",
                kind: FieldKind::U8,
            },
        ]
    }
}

struct Journal;

impl LayoutBuilder for Journal {
    fn body_type(&self) -> u16 {
        4
    }
    fn version(&self) -> u16 {
        1
    }
    fn fields(&self) -> Vec<FieldSpec> {
        vec![FieldSpec {
            name: "sequence",
            kind: FieldKind::U64,
        }]
    }
    fn array_slots(&self) -> Vec<ArraySlotSpec> {
        vec![ArraySlotSpec {
            name: "payload",
            element_size: 1,
        }]
    }
}

fn open(dir: &std::path::Path) -> Repository {
    let repo = Repository::persistent(dir).unwrap();
    repo.register_layout(&Event).unwrap();
    repo
}

#[test]
fn commits_survive_reopen() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();

    let mut ids = Vec::new();
    {
        let repo = open(dir.path());
        assert_eq!(repo.mode(), StoreMode::Persistent);
        for sequence in 0..10u64 {
            let scope = repo.write().unwrap();
            let id = scope.create(GhostKind::Entity, 3).unwrap();
            scope
                .update(&id, |ghost| {
                    ghost.set_u64("sequence", sequence)?;
                    ghost.set_u8("severity", (sequence % 3) as u8)
                })
                .unwrap();
            scope.commit().unwrap();
            ids.push((id, sequence));
        }
    }

    let repo = open(dir.path());
    assert_eq!(repo.last_commit(), 10);
    let scope = repo.read().unwrap();
    for (id, sequence) in &ids {
        let ghost = scope.get(id).unwrap().unwrap();
        assert_eq!(ghost.get_u64("sequence").unwrap(), *sequence);
        assert_eq!(ghost.get_u8("severity").unwrap(), (*sequence % 3) as u8);
    }
}

#[test]
fn recovery_keeps_only_the_latest_version() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let repo = open(dir.path());
        let scope = repo.write().unwrap();
        let id = scope.create(GhostKind::Entity, 3).unwrap();
        scope
            .update(&id, |ghost| ghost.set_u64("sequence", 1))
            .unwrap();
        scope.commit().unwrap();

        let scope = repo.write().unwrap();
        scope
            .update(&id, |ghost| ghost.set_u64("sequence", 2))
            .unwrap();
        scope.commit().unwrap();
        id
    };

    let repo = open(dir.path());
    let scope = repo.read().unwrap();
    let ghost = scope.get(&id).unwrap().unwrap();
    assert_eq!(ghost.get_u64("sequence").unwrap(), 2);
}

#[test]
fn recovered_ghosts_can_be_updated_and_recommitted() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let repo = open(dir.path());
        let scope = repo.write().unwrap();
        let id = scope.create(GhostKind::Entity, 3).unwrap();
        scope.commit().unwrap();
        id
    };

    {
        let repo = open(dir.path());
        let scope = repo.write().unwrap();
        assert!(scope
            .update(&id, |ghost| ghost.set_u64("sequence", 42))
            .unwrap());
        scope.commit().unwrap();
    }

    let repo = open(dir.path());
    let scope = repo.read().unwrap();
    assert_eq!(
        scope.get(&id).unwrap().unwrap().get_u64("sequence").unwrap(),
        42
    );
}

#[test]
fn frame_spanning_segments_recovers_through_continuations() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    // A blob over half the first segment: its commit frame starts in the
    // space left behind the blob and must continue into the next segment.
    let payload = vec![0x5Au8; 600 * 1024];

    let id = {
        let repo = Repository::persistent(dir.path()).unwrap();
        repo.register_layout(&Journal).unwrap();
        let scope = repo.write().unwrap();
        let id = scope.create(GhostKind::Entity, 4).unwrap();
        scope
            .update(&id, |ghost| {
                ghost.set_u64("sequence", 1)?;
                ghost.set_array("payload", &payload)
            })
            .unwrap();
        scope.commit().unwrap();
        assert!(repo.segment_count() > 1);
        id
    };

    let repo = Repository::persistent(dir.path()).unwrap();
    repo.register_layout(&Journal).unwrap();
    let scope = repo.read().unwrap();
    let ghost = scope.get(&id).unwrap().unwrap();
    assert_eq!(ghost.get_u64("sequence").unwrap(), 1);
    let (_, bytes) = ghost.get_array("payload").unwrap();
    assert_eq!(bytes, payload.as_slice());
}

#[test]
fn unknown_identifier_after_reopen_is_absent_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    {
        let repo = open(dir.path());
        let scope = repo.write().unwrap();
        scope.create(GhostKind::Entity, 3).unwrap();
        scope.commit().unwrap();
    }
    let repo = open(dir.path());
    let scope = repo.read().unwrap();
    let stranger = GhostId::new(GhostKind::Entity, 3);
    assert!(scope.get(&stranger).unwrap().is_none());
}

#[test]
fn corrupted_frame_bytes_fail_recovery() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    {
        let repo = open(dir.path());
        let scope = repo.write().unwrap();
        let id = scope.create(GhostKind::Entity, 3).unwrap();
        scope
            .update(&id, |ghost| ghost.set_u64("sequence", 7))
            .unwrap();
        scope.commit().unwrap();
    }

    // Flip one byte inside the frame's record payload; the frame checksum
    // must catch it on reopen.
    let seg_path = dir.path().join("seg-00000000.wsg");
    let mut bytes = std::fs::read(&seg_path).unwrap();
    let at = 16 + 100;
    bytes[at] ^= 0xFF;
    std::fs::write(&seg_path, bytes).unwrap();

    assert!(matches!(
        Repository::persistent(dir.path()),
        Err(WraithError::Corruption(_))
    ));
}

#[test]
fn missing_segment_file_fails_recovery() {
    let dir = tempfile::tempdir().unwrap();
    {
        let repo = open(dir.path());
        let scope = repo.write().unwrap();
        scope.create(GhostKind::Entity, 3).unwrap();
        scope.commit().unwrap();
    }
    std::fs::remove_file(dir.path().join("seg-00000000.wsg")).unwrap();
    assert!(Repository::persistent(dir.path()).is_err());
}

#[test]
fn fresh_directory_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open(dir.path());
    assert_eq!(repo.last_commit(), 0);
    assert_eq!(repo.segment_count(), 1);
}
