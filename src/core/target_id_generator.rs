use crate::model::TargetId;

const RESERVED_BITS: i32 = 1;
const LOCAL_STORE_GENERATOR_ID: i32 = 0;
const SYNC_ENGINE_GENERATOR_ID: i32 = 1;

/// Monotonic target id allocator. The low bit encodes the owning subsystem,
/// so local-store ids (even) and sync-engine limbo ids (odd) never collide.
#[derive(Debug)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    fn new(generator_id: i32, after: TargetId) -> Self {
        debug_assert!(
            generator_id & !((1 << RESERVED_BITS) - 1) == 0,
            "generator id uses more than the reserved bits"
        );
        let mut next_id = (after & !((1 << RESERVED_BITS) - 1)) | generator_id;
        if next_id <= after {
            next_id += 1 << RESERVED_BITS;
        }
        Self { next_id }
    }

    /// Generator for the local store's user-listen targets (even ids).
    pub fn for_local_store(after: TargetId) -> Self {
        Self::new(LOCAL_STORE_GENERATOR_ID, after)
    }

    /// Generator for the sync engine's limbo-resolution targets (odd ids).
    pub fn for_sync_engine() -> Self {
        Self::new(SYNC_ENGINE_GENERATOR_ID, 0)
    }

    pub fn next_id(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 1 << RESERVED_BITS;
        id
    }
}
