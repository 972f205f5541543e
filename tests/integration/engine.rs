//! End-to-end engine scenarios on volatile repositories.

use wraith::{
    ArrayMapLarge, ArraySlotSpec, FieldKind, FieldSpec, Ghost, GhostHeader, GhostId, GhostKind,
    LayoutBuilder, Repository, Segment, WraithError,
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

struct Account;

impl LayoutBuilder for Account {
    fn body_type(&self) -> u16 {
        100
    }
    fn version(&self) -> u16 {
        1
    }
    fn fields(&self) -> Vec<FieldSpec> {
        vec![FieldSpec {
            name: "balance",
            kind: FieldKind::U64,
        }]
    }
    fn array_slots(&self) -> Vec<ArraySlotSpec> {
        vec![ArraySlotSpec {
            name: "label",
            element_size: 1,
        }]
    }
}

/// The canonical round trip: a 48-byte segment holding one 40-byte header
/// plus an 8-byte field at offset 40, read back bit-exact.
#[test]
fn header_and_field_round_trip_in_a_48_byte_segment() {
    let segment = Segment::volatile(0, 48);
    let id = GhostId::new(GhostKind::Entity, 100);
    let header = GhostHeader::new(id, 9, 1);

    let mut blob = [0u8; 48];
    header.write_to(&mut blob).unwrap();
    blob[40..48].copy_from_slice(&0xDEAD_BEEF_CAFE_F00Du64.to_be_bytes());

    let offset = segment.write(&blob).unwrap();
    assert_eq!(offset, 0);
    assert_eq!(segment.remaining(), 0);

    let stored = segment.read(0, 48).unwrap();
    assert_eq!(stored, &blob[..]);
    let decoded = GhostHeader::from_bytes(stored).unwrap();
    assert_eq!(decoded.id, id);
    assert_eq!(decoded.id.kind(), GhostKind::Entity);
    assert_eq!(decoded.id.type_id(), 100);
    assert_eq!(decoded.txn_id, 9);
    assert_eq!(
        u64::from_be_bytes(stored[40..48].try_into().unwrap()),
        0xDEAD_BEEF_CAFE_F00D
    );

    // The segment is now full; one more byte must fail and leave nothing
    // consumed.
    assert!(matches!(
        segment.write(&[0]),
        Err(WraithError::CapacityExceeded {
            requested: 1,
            available: 0,
        })
    ));
}

#[test]
fn ghost_lifecycle_through_scopes() {
    init_logging();
    let repo = Repository::volatile().unwrap();
    repo.register_layout(&Account).unwrap();

    let id = {
        let scope = repo.write().unwrap();
        let id = scope.create(GhostKind::Entity, 100).unwrap();
        scope
            .update(&id, |ghost| {
                ghost.set_u64("balance", 1_000)?;
                ghost.set_array("label", b"primary")
            })
            .unwrap();
        scope.commit().unwrap();
        id
    };

    // A later scope reads the committed state and layers its own change.
    let scope = repo.write().unwrap();
    let ghost = scope.get(&id).unwrap().unwrap();
    assert_eq!(ghost.get_u64("balance").unwrap(), 1_000);
    let (entry, label) = ghost.get_array("label").unwrap();
    assert_eq!(label, b"primary");
    assert_eq!(entry.element_size(), 1);

    scope
        .update(&id, |ghost| ghost.set_u64("balance", 500))
        .unwrap();
    scope.commit().unwrap();

    let scope = repo.read().unwrap();
    let ghost = scope.get(&id).unwrap().unwrap();
    assert_eq!(ghost.get_u64("balance").unwrap(), 500);
    let (_, label) = ghost.get_array("label").unwrap();
    assert_eq!(label, b"primary");
}

#[test]
fn mapped_volatile_repository_behaves_like_heap_backed() {
    let repo = Repository::mapped_volatile().unwrap();
    repo.register_layout(&Account).unwrap();

    let scope = repo.write().unwrap();
    let id = scope.create(GhostKind::Entity, 100).unwrap();
    scope
        .update(&id, |ghost| ghost.set_u64("balance", 77))
        .unwrap();
    scope.commit().unwrap();

    let scope = repo.read().unwrap();
    assert_eq!(
        scope.get(&id).unwrap().unwrap().get_u64("balance").unwrap(),
        77
    );
}

#[test]
fn many_ghosts_force_segment_growth() {
    init_logging();
    let repo = Repository::volatile().unwrap();
    repo.register_layout(&Account).unwrap();

    let mut ids = Vec::new();
    for batch in 0..20u64 {
        let scope = repo.write().unwrap();
        for _ in 0..50 {
            let id = scope.create(GhostKind::Entity, 100).unwrap();
            scope
                .update(&id, |ghost| {
                    ghost.set_u64("balance", batch)?;
                    // A large label pushes each blob over a kilobyte.
                    ghost.set_array("label", &vec![b'x'; 1500])
                })
                .unwrap();
            ids.push((id, batch));
        }
        scope.commit().unwrap();
    }
    assert!(repo.segment_count() > 1);

    let scope = repo.read().unwrap();
    for (id, batch) in &ids {
        let ghost = scope.get(id).unwrap().unwrap();
        assert_eq!(ghost.get_u64("balance").unwrap(), *batch);
    }
}

#[test]
fn identifiers_sort_by_kind_type_then_time() {
    let entity = GhostId::from_parts(GhostKind::Entity as u8, 5, 1_000, 1);
    let later_entity = GhostId::from_parts(GhostKind::Entity as u8, 5, 2_000, 0);
    let higher_type = GhostId::from_parts(GhostKind::Entity as u8, 6, 0, 0);
    let edge = GhostId::from_parts(GhostKind::Edge as u8, 0, 0, 0);

    let mut ids = vec![edge, higher_type, later_entity, entity];
    ids.sort();
    assert_eq!(ids, vec![entity, later_entity, higher_type, edge]);
}

#[test]
fn committed_blob_views_do_not_leak_writes_back() {
    let repo = Repository::volatile().unwrap();
    repo.register_layout(&Account).unwrap();

    let scope = repo.write().unwrap();
    let id = scope.create(GhostKind::Entity, 100).unwrap();
    scope.commit().unwrap();

    let scope = repo.write().unwrap();
    let mut view: Ghost = scope.get(&id).unwrap().unwrap();
    // Mutating a fetched view copies on write; the repository only sees
    // the change once it is put back and committed.
    view.set_u64("balance", 123).unwrap();
    assert!(view.mapped_range().is_none());
    drop(view);

    let fresh = scope.get(&id).unwrap().unwrap();
    assert_eq!(fresh.get_u64("balance").unwrap(), 0);
}

#[test]
fn array_map_entry_limits_hold_in_blobs() {
    assert!(ArrayMapLarge::new(8, ArrayMapLarge::MAX_COUNT, 0).is_ok());
    assert!(ArrayMapLarge::new(8, ArrayMapLarge::MAX_COUNT + 1, 0).is_err());
    let entry = ArrayMapLarge::new(4, 3, 41).unwrap();
    assert_eq!(entry.end_offset(), 53);
    assert_eq!(entry.end_offset_aligned4(), 56);
    assert_eq!(entry.end_offset_aligned8(), 56);
}
