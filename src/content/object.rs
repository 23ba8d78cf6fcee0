use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::config::SortDir;

use super::albums::{Album, AlbumRef};
use super::playlists::Playlist;
use super::tracks::{Track, TrackRef};

/// Pixel size of cover pictures (no cover is larger than 300x300).
pub const IMG_SIZE: u32 = 300;

/// Domain key of an object, a 64-bit hash over identifying attributes.
pub type Key = u64;

/// Unique identifier of a content object. `0` is the root; `-1` appears
/// only in marshalled output as "no parent".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId(pub i64);

impl ObjId {
    pub const ROOT: ObjId = ObjId(0);
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ObjId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>().map(ObjId)
    }
}

/// FNV-1a 64-bit hash of a byte slice.
pub fn key_of_bytes(data: &[u8]) -> Key {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in data {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x1_0000_0000_01b3);
    }
    hash
}

/// FNV-1a 64-bit hash of a string.
pub fn key_of(s: &str) -> Key {
    key_of_bytes(s.as_bytes())
}

/// Sort fields for numeric attributes are zero-padded so that the string
/// comparators order them numerically ("0002" < "0010").
pub fn pad_track_no(n: u32) -> String {
    format!("{n:04}")
}

pub fn pad_disc_no(n: u32) -> String {
    format!("{n:03}")
}

pub fn pad_last_change(t: i64) -> String {
    format!("{t:020}")
}

pub fn pad_playlist_pos(pos: usize) -> String {
    format!("{pos:06}")
}

/// Attributes shared by every content object.
#[derive(Debug)]
pub struct ObjBase {
    pub id: ObjId,
    pub key: Key,
    pub name: String,
    /// Sort-field vector; ordering compares these strings level by level.
    pub sort_fields: Vec<String>,
    pub parent: Option<ObjId>,
}

impl ObjBase {
    pub fn new(id: ObjId, name: &str) -> ObjBase {
        ObjBase {
            id,
            key: key_of(name),
            name: name.to_string(),
            sort_fields: vec![name.to_lowercase()],
            parent: None,
        }
    }
}

#[derive(Default)]
struct OrderCache {
    ids: Vec<ObjId>,
    dirty: bool,
}

/// Child references of a container. Children can be looked up by object
/// id, by domain key, or by index in sort order. The ordered sequence is
/// rebuilt lazily after a mutation.
pub struct ChildSet {
    by_id: HashMap<ObjId, Key>,
    by_key: HashMap<Key, ObjId>,
    order: Mutex<OrderCache>,
    comparisons: Vec<SortDir>,
}

impl ChildSet {
    pub fn new() -> ChildSet {
        ChildSet {
            by_id: HashMap::new(),
            by_key: HashMap::new(),
            order: Mutex::new(OrderCache {
                ids: Vec::new(),
                dirty: true,
            }),
            comparisons: Vec::new(),
        }
    }

    pub fn add(&mut self, id: ObjId, key: Key) {
        self.by_id.insert(id, key);
        self.by_key.insert(key, id);
        self.invalidate();
    }

    pub fn remove(&mut self, id: ObjId) {
        if let Some(key) = self.by_id.remove(&id) {
            // only drop the key entry if it still points at this child
            if self.by_key.get(&key) == Some(&id) {
                self.by_key.remove(&key);
            }
        }
        self.invalidate();
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_key.clear();
        self.invalidate();
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains(&self, id: ObjId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn by_key(&self, key: Key) -> Option<ObjId> {
        self.by_key.get(&key).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = ObjId> + '_ {
        self.by_id.keys().copied()
    }

    pub fn key_for(&self, id: ObjId) -> Option<Key> {
        self.by_id.get(&id).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (ObjId, Key)> + '_ {
        self.by_id.iter().map(|(&id, &key)| (id, key))
    }

    pub fn set_comparisons(&mut self, comparisons: Vec<SortDir>) {
        self.comparisons = comparisons;
        self.invalidate();
    }

    /// Drops the cached order; the next indexed access rebuilds it.
    pub fn invalidate(&self) {
        let mut cache = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        cache.dirty = true;
    }

    /// Returns the child ids in sort order, rebuilding the cached sequence
    /// when a mutation has invalidated it. `fields_of` resolves the
    /// sort-field vector of a child object.
    pub fn ordered(&self, fields_of: impl Fn(ObjId) -> Vec<String>) -> Vec<ObjId> {
        let mut cache = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.dirty {
            let mut pairs: Vec<(ObjId, Vec<String>)> = self
                .by_id
                .keys()
                .map(|&id| (id, fields_of(id)))
                .collect();
            pairs.sort_by(|a, b| cmp_sort_fields(&a.1, &b.1, &self.comparisons));
            cache.ids = pairs.into_iter().map(|(id, _)| id).collect();
            cache.dirty = false;
        }
        cache.ids.clone()
    }
}

impl Default for ChildSet {
    fn default() -> Self {
        ChildSet::new()
    }
}

/// Compares two sort-field vectors as the lexicographic product of the
/// per-level comparisons. Missing fields compare as empty strings, missing
/// comparisons as ascending.
fn cmp_sort_fields(a: &[String], b: &[String], comparisons: &[SortDir]) -> Ordering {
    let levels = a.len().max(b.len());
    for i in 0..levels {
        let fa = a.get(i).map(String::as_str).unwrap_or("");
        let fb = b.get(i).map(String::as_str).unwrap_or("");
        let ord = fa.cmp(fb);
        if ord != Ordering::Equal {
            return match comparisons.get(i).copied().unwrap_or(SortDir::Asc) {
                SortDir::Asc => ord,
                SortDir::Desc => ord.reverse(),
            };
        }
    }
    Ordering::Equal
}

/// Kind of a generic container; selects the DIDL-Lite class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Plain,
    Genre,
    Artist,
    AlbumArtist,
}

/// Generic container object. Specialized containers (albums, folders,
/// playlists) embed this struct.
pub struct Container {
    pub base: ObjBase,
    pub kind: ContainerKind,
    /// ContainerUpdateIDValue of this container.
    pub upd_count: u32,
    pub children: ChildSet,
}

impl Container {
    pub fn new(id: ObjId, name: &str, kind: ContainerKind) -> Container {
        Container {
            base: ObjBase::new(id, name),
            kind,
            upd_count: 0,
            children: ChildSet::new(),
        }
    }
}

/// Folder container of the folder hierarchy.
pub struct Folder {
    pub ctr: Container,
    pub path: std::path::PathBuf,
}

/// A content object. Containers, items and references are the variants of
/// this sum; the generic container behavior lives in [`Container`].
pub enum Object {
    Container(Container),
    Album(Album),
    AlbumRef(AlbumRef),
    Folder(Folder),
    Playlist(Playlist),
    Track(Track),
    TrackRef(TrackRef),
}

impl Object {
    pub fn base(&self) -> &ObjBase {
        match self {
            Object::Container(c) => &c.base,
            Object::Album(a) => &a.ctr.base,
            Object::AlbumRef(r) => &r.ctr.base,
            Object::Folder(f) => &f.ctr.base,
            Object::Playlist(p) => &p.ctr.base,
            Object::Track(t) => &t.base,
            Object::TrackRef(r) => &r.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut ObjBase {
        match self {
            Object::Container(c) => &mut c.base,
            Object::Album(a) => &mut a.ctr.base,
            Object::AlbumRef(r) => &mut r.ctr.base,
            Object::Folder(f) => &mut f.ctr.base,
            Object::Playlist(p) => &mut p.ctr.base,
            Object::Track(t) => &mut t.base,
            Object::TrackRef(r) => &mut r.base,
        }
    }

    pub fn id(&self) -> ObjId {
        self.base().id
    }

    pub fn key(&self) -> Key {
        self.base().key
    }

    pub fn name(&self) -> &str {
        &self.base().name
    }

    pub fn parent(&self) -> Option<ObjId> {
        self.base().parent
    }

    pub fn set_parent(&mut self, parent: Option<ObjId>) {
        self.base_mut().parent = parent;
    }

    pub fn sort_fields(&self) -> &[String] {
        &self.base().sort_fields
    }

    pub fn is_container(&self) -> bool {
        !self.is_item()
    }

    pub fn is_item(&self) -> bool {
        matches!(self, Object::Track(_) | Object::TrackRef(_))
    }

    /// The embedded generic container, for any container-like variant.
    pub fn container(&self) -> Option<&Container> {
        match self {
            Object::Container(c) => Some(c),
            Object::Album(a) => Some(&a.ctr),
            Object::AlbumRef(r) => Some(&r.ctr),
            Object::Folder(f) => Some(&f.ctr),
            Object::Playlist(p) => Some(&p.ctr),
            Object::Track(_) | Object::TrackRef(_) => None,
        }
    }

    pub fn container_mut(&mut self) -> Option<&mut Container> {
        match self {
            Object::Container(c) => Some(c),
            Object::Album(a) => Some(&mut a.ctr),
            Object::AlbumRef(r) => Some(&mut r.ctr),
            Object::Folder(f) => Some(&mut f.ctr),
            Object::Playlist(p) => Some(&mut p.ctr),
            Object::Track(_) | Object::TrackRef(_) => None,
        }
    }

    pub fn as_track(&self) -> Option<&Track> {
        match self {
            Object::Track(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_album(&self) -> Option<&Album> {
        match self {
            Object::Album(a) => Some(a),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obj_id_parses() {
        assert_eq!("0".parse::<ObjId>().unwrap(), ObjId::ROOT);
        assert_eq!("42".parse::<ObjId>().unwrap(), ObjId(42));
        assert!("x".parse::<ObjId>().is_err());
    }

    #[test]
    fn keys_are_stable_and_distinct() {
        assert_eq!(key_of("Rock"), key_of("Rock"));
        assert_ne!(key_of("Rock"), key_of("Jazz"));
        assert_eq!(key_of_bytes(b"abc"), key_of("abc"));
    }

    #[test]
    fn padding_orders_numerics_lexicographically() {
        assert!(pad_track_no(2) < pad_track_no(10));
        assert!(pad_disc_no(1) < pad_disc_no(12));
        assert!(pad_last_change(99) < pad_last_change(100));
        assert_eq!(pad_track_no(1), "0001");
        assert_eq!(pad_disc_no(1), "001");
        assert_eq!(pad_last_change(100).len(), 20);
    }

    #[test]
    fn child_set_dedups_by_id_and_key() {
        let mut set = ChildSet::new();
        set.add(ObjId(1), 10);
        set.add(ObjId(1), 10);
        assert_eq!(set.len(), 1);
        assert_eq!(set.by_key(10), Some(ObjId(1)));
        set.remove(ObjId(1));
        assert!(set.is_empty());
        assert_eq!(set.by_key(10), None);
    }

    #[test]
    fn ordered_respects_comparison_vector() {
        let mut set = ChildSet::new();
        set.set_comparisons(vec![SortDir::Desc, SortDir::Asc]);
        set.add(ObjId(1), 1);
        set.add(ObjId(2), 2);
        set.add(ObjId(3), 3);
        let fields = |id: ObjId| match id {
            ObjId(1) => vec!["a".to_string(), "2".to_string()],
            ObjId(2) => vec!["b".to_string(), "1".to_string()],
            _ => vec!["a".to_string(), "1".to_string()],
        };
        // first level descending: "b" first; tie on "a" broken ascending
        assert_eq!(set.ordered(fields), vec![ObjId(2), ObjId(3), ObjId(1)]);
    }

    #[test]
    fn order_rebuilds_after_mutation() {
        let mut set = ChildSet::new();
        set.add(ObjId(1), 1);
        set.add(ObjId(2), 2);
        let fields = |id: ObjId| vec![format!("{}", id.0)];
        assert_eq!(set.ordered(fields), vec![ObjId(1), ObjId(2)]);
        set.remove(ObjId(1));
        assert_eq!(set.ordered(fields), vec![ObjId(2)]);
    }

    #[test]
    fn shorter_sort_vectors_compare_as_empty() {
        let a = vec!["x".to_string()];
        let b = vec!["x".to_string(), "1".to_string()];
        assert_eq!(
            cmp_sort_fields(&a, &b, &[SortDir::Asc]),
            Ordering::Less
        );
    }
}
