//! The process-wide unique-name table.
//!
//! Every symbolic reference in the bytecode and in environments is a dense
//! integer id into this table. Identifier lookup is case-insensitive: the
//! table is keyed by the lowercase projection of a name, while [`get`]
//! returns the spelling the name was first registered with.

use internment::Intern;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;

/// A dense identifier assigned by the name table.
pub type NameId = usize;

/// Reserved id meaning "no name"; used by anonymous `CALL`s.
pub const NO_NAME: NameId = 0;

struct Table {
    originals: Vec<Intern<String>>,
    lowered: Vec<Intern<String>>,
    index: HashMap<Intern<String>, NameId>,
}

static TABLE: Lazy<RwLock<Table>> = Lazy::new(|| {
    let empty = Intern::new(String::new());
    RwLock::new(Table {
        // slot 0 holds the reserved "no name" entry
        originals: vec![empty],
        lowered: vec![empty],
        index: HashMap::new(),
    })
});

/// Registers `s` and returns its id. Re-registering any spelling of an
/// already known name (case-insensitively) returns the existing id.
pub fn set(s: &str) -> NameId {
    let low = Intern::new(s.to_lowercase());
    if let Some(&id) = TABLE.read().index.get(&low) {
        return id;
    }
    let mut table = TABLE.write();
    // somebody may have registered it between the two locks
    if let Some(&id) = table.index.get(&low) {
        return id;
    }
    let id = table.originals.len();
    table.originals.push(Intern::new(s.to_string()));
    table.lowered.push(low);
    table.index.insert(low, id);
    id
}

/// Returns the original spelling of `id`, or the empty string for an id the
/// table has never issued.
pub fn get(id: NameId) -> Intern<String> {
    let table = TABLE.read();
    table
        .originals
        .get(id)
        .copied()
        .unwrap_or_else(|| Intern::new(String::new()))
}

/// Returns the cached lowercase projection of `id`.
pub fn lowercase(id: NameId) -> Intern<String> {
    let table = TABLE.read();
    table
        .lowered
        .get(id)
        .copied()
        .unwrap_or_else(|| Intern::new(String::new()))
}
