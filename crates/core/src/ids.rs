#![forbid(unsafe_code)]

/// Identifier of a persistent entity. Every row in the store carries one.
pub type Id = i64;

/// Marks an identifier that has not been assigned yet.
pub const UNSET_ID: Id = -1;

/// The virtual root of the collection tree. No row exists for it.
pub const ROOT_COLLECTION: Id = 0;

/// Whether `id` refers to a persisted entity (the root does not).
pub fn is_valid(id: Id) -> bool {
    id > 0
}
