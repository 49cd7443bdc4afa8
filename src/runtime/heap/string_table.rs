use std::{collections::HashMap, sync::Arc};

use crate::runtime::ObjRef;

/// Canonical string instances, shared by `ldc` and `String.intern`.
#[derive(Debug, Default)]
pub(crate) struct StringTable {
    map: HashMap<Arc<str>, ObjRef>,
}

impl StringTable {
    pub(crate) fn get(&self, value: &str) -> Option<ObjRef> {
        self.map.get(value).copied()
    }

    pub(crate) fn insert(&mut self, value: Arc<str>, id: ObjRef) {
        self.map.entry(value).or_insert(id);
    }
}
