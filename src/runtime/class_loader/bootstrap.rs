use std::{
    collections::HashMap,
    fmt::{self, Debug, Display, Formatter},
    sync::Arc,
};

use crate::class::ClassFile;

/// Identifies one outstanding asynchronous operation, either a class lookup or a native body
/// waiting on the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsyncToken(pub(crate) u64);

impl AsyncToken {
    pub fn id(self) -> u64 {
        self.0
    }
}

impl Display for AsyncToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "async#{}", self.0)
    }
}

pub enum ClassLookup {
    Found(ClassFile),
    NotFound,
    /// The provider will answer later through [`crate::AsyncHandle::complete`] with the token
    /// it was given.
    Pending,
}

/// Supplies parsed classes to a loader. Searching the class path, reading archives and
/// decoding class bytes all happen behind this trait.
pub trait ClassProvider {
    fn find_class(&mut self, name: &str, token: AsyncToken) -> ClassLookup;
}

/// In-memory provider keyed by binary class name.
#[derive(Debug, Clone, Default)]
pub struct MapProvider {
    classes: HashMap<Arc<str>, ClassFile>,
}

impl MapProvider {
    pub fn new() -> Self {
        MapProvider::default()
    }

    /// Registers `class` under its own name. Classes without a name are ignored.
    pub fn insert(&mut self, class: ClassFile) -> &mut Self {
        if let Some(name) = class.name().cloned() {
            self.classes.insert(name, class);
        }
        self
    }

    pub fn with(mut self, class: ClassFile) -> Self {
        self.insert(class);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl ClassProvider for MapProvider {
    fn find_class(&mut self, name: &str, _token: AsyncToken) -> ClassLookup {
        match self.classes.get(name) {
            Some(class) => ClassLookup::Found(class.clone()),
            None => ClassLookup::NotFound,
        }
    }
}

/// Asks `primary` first and falls back to `secondary` for names it does not know.
pub(crate) struct Fallback {
    pub(crate) primary: Box<dyn ClassProvider>,
    pub(crate) secondary: MapProvider,
}

impl ClassProvider for Fallback {
    fn find_class(&mut self, name: &str, token: AsyncToken) -> ClassLookup {
        match self.primary.find_class(name, token) {
            ClassLookup::NotFound => self.secondary.find_class(name, token),
            found_or_pending => found_or_pending,
        }
    }
}

impl Debug for Fallback {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fallback")
            .field("secondary", &self.secondary.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::builder::ClassFileBuilder;

    #[test]
    fn test_fallback_prefers_primary() {
        let mut primary = MapProvider::new();
        primary.insert(ClassFileBuilder::new("a/A").source_file("Primary.java").build());
        let secondary = MapProvider::new()
            .with(ClassFileBuilder::new("a/A").build())
            .with(ClassFileBuilder::new("a/B").build());
        let mut fallback = Fallback {
            primary: Box::new(primary),
            secondary,
        };

        let ClassLookup::Found(a) = fallback.find_class("a/A", AsyncToken(0)) else {
            panic!("a/A must be found");
        };
        assert_eq!(a.source_file.as_deref(), Some("Primary.java"));
        assert!(matches!(
            fallback.find_class("a/B", AsyncToken(1)),
            ClassLookup::Found(_)
        ));
        assert!(matches!(
            fallback.find_class("a/C", AsyncToken(2)),
            ClassLookup::NotFound
        ));
    }
}
