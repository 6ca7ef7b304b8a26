//! MapDatabase - process-wide collection of maps plus the shared vocabulary.
//!
//! Each map sits behind its own `RwLock` (the per-Map lock of the locking
//! discipline); the database itself only guards the registry and the
//! current-map designation. Lock order is always database → map, and callers
//! that need two maps at once (merging) take them in ascending `MapId`
//! order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::vocabulary::Vocabulary;

use super::map::Map;
use super::types::MapId;

/// A map plus its lock and the logical-deletion flag.
pub struct SharedMap {
    id: MapId,
    erased: AtomicBool,
    inner: RwLock<Map>,
}

impl SharedMap {
    fn new(id: MapId) -> Self {
        Self {
            id,
            erased: AtomicBool::new(false),
            inner: RwLock::new(Map::new(id)),
        }
    }

    pub fn id(&self) -> MapId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Map> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Map> {
        self.inner.write()
    }

    pub fn is_erased(&self) -> bool {
        self.erased.load(Ordering::SeqCst)
    }

    pub fn set_erased(&self, erased: bool) {
        self.erased.store(erased, Ordering::SeqCst);
    }
}

pub struct MapDatabase {
    maps: RwLock<Vec<Arc<SharedMap>>>,
    current: RwLock<Option<Arc<SharedMap>>>,
    vocabulary: Arc<Vocabulary>,
}

impl MapDatabase {
    pub fn new(vocabulary: Arc<Vocabulary>) -> Self {
        Self {
            maps: RwLock::new(Vec::new()),
            current: RwLock::new(None),
            vocabulary,
        }
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary> {
        &self.vocabulary
    }

    /// Create and register a new empty map. It does not become current until
    /// Tracking designates it.
    pub fn create_map(&self) -> Arc<SharedMap> {
        let map = Arc::new(SharedMap::new(MapId::next()));
        self.maps.write().push(Arc::clone(&map));
        map
    }

    /// The map Tracking is actively extending, if any.
    pub fn current(&self) -> Option<Arc<SharedMap>> {
        self.current.read().clone()
    }

    pub fn set_current(&self, map: Arc<SharedMap>) {
        *self.current.write() = Some(map);
    }

    pub fn clear_current(&self) {
        *self.current.write() = None;
    }

    /// Snapshot of every registered map, erased ones included.
    pub fn all_maps(&self) -> Vec<Arc<SharedMap>> {
        self.maps.read().clone()
    }

    /// Snapshot of the non-erased maps.
    pub fn live_maps(&self) -> Vec<Arc<SharedMap>> {
        self.maps
            .read()
            .iter()
            .filter(|m| !m.is_erased())
            .cloned()
            .collect()
    }

    pub fn num_live_maps(&self) -> usize {
        self.maps.read().iter().filter(|m| !m.is_erased()).count()
    }

    /// Mark a map erased; if it was current, the designation is cleared.
    pub fn erase_map(&self, id: MapId) {
        if let Some(map) = self.maps.read().iter().find(|m| m.id() == id) {
            map.set_erased(true);
        }
        let mut current = self.current.write();
        if current.as_ref().map(|m| m.id()) == Some(id) {
            *current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, DESCRIPTOR_BYTES};

    fn database() -> MapDatabase {
        let vocab = Vocabulary::from_words(vec![
            Descriptor([0u8; DESCRIPTOR_BYTES]),
            Descriptor([0xff; DESCRIPTOR_BYTES]),
        ]);
        MapDatabase::new(Arc::new(vocab))
    }

    #[test]
    fn test_create_and_designate_current() {
        let db = database();
        assert!(db.current().is_none());
        assert_eq!(db.num_live_maps(), 0);

        let map = db.create_map();
        assert_eq!(db.num_live_maps(), 1);
        assert!(db.current().is_none());

        db.set_current(Arc::clone(&map));
        assert_eq!(db.current().unwrap().id(), map.id());
    }

    #[test]
    fn test_erase_clears_current() {
        let db = database();
        let map = db.create_map();
        db.set_current(Arc::clone(&map));

        db.erase_map(map.id());
        assert!(map.is_erased());
        assert!(db.current().is_none());
        assert_eq!(db.num_live_maps(), 0);
        // Erased maps stay enumerable until shutdown.
        assert_eq!(db.all_maps().len(), 1);
    }

    #[test]
    fn test_live_maps_excludes_erased() {
        let db = database();
        let a = db.create_map();
        let _b = db.create_map();
        db.erase_map(a.id());

        let live = db.live_maps();
        assert_eq!(live.len(), 1);
        assert_ne!(live[0].id(), a.id());
    }
}
