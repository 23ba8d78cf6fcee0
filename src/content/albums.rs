use tracing::warn;

use crate::config::SortField;

use super::object::{pad_last_change, Container, ContainerKind, ObjId, Object};
use super::{Content, UpdateRun};

/// An album object. For each music album exactly one album object exists;
/// it owns its tracks as children and is destroyed when the last track
/// goes. Occurrences in hierarchies are album references.
pub struct Album {
    pub ctr: Container,
    pub year: u32,
    pub compilation: bool,
    /// Album artists.
    pub artists: Vec<String>,
    pub composers: Vec<String>,
    /// Maximum last-change time over the album's tracks.
    pub last_change: i64,
    /// Non-owning back-references to the album references pointing here.
    pub refs: Vec<ObjId>,
}

/// A reference to an album object, placed inside a hierarchy. Its children
/// are the track references of that hierarchy branch.
pub struct AlbumRef {
    pub ctr: Container,
    pub album: ObjId,
    /// The sort specification this reference was created with; needed to
    /// rebuild the sort fields when the album's last-change time moves.
    pub sort_spec: Vec<SortField>,
}

impl Content {
    /// Looks up the album a track belongs to, creating it from the track's
    /// tags when it does not exist yet.
    pub(crate) fn album_for_track(
        &mut self,
        run: &mut UpdateRun,
        track_id: ObjId,
        album_key: u64,
    ) -> ObjId {
        if let Some(&id) = self.albums.get(&album_key) {
            return id;
        }

        let id = self.next_id();
        let album = {
            let Some(Object::Track(track)) = self.objects.get(&track_id) else {
                warn!("track {track_id} not found when creating its album");
                return id;
            };
            let mut ctr = Container::new(id, &track.tags.album, ContainerKind::Plain);
            ctr.base.key = album_key;
            Album {
                ctr,
                year: track.tags.year,
                compilation: track.tags.compilation,
                artists: track.tags.album_artists.clone(),
                composers: track.tags.composers.clone(),
                last_change: track.last_change,
                refs: Vec::new(),
            }
        };
        self.objects.insert(id, Object::Album(album));
        self.albums.insert(album_key, id);
        run.count += 1;
        id
    }

    /// Adds a track as album child and maintains the album's last-change
    /// time. When that time moves, the album references' last-change sort
    /// fields are rebuilt and their parents' order is invalidated, since
    /// their position may depend on it.
    pub(crate) fn album_add_track(&mut self, album_id: ObjId, track_id: ObjId) {
        let (track_key, track_last_change) = match self.objects.get(&track_id) {
            Some(Object::Track(t)) => (t.base.key, t.last_change),
            _ => {
                warn!("tried to add a non-track object to album {album_id}");
                return;
            }
        };

        let changed = {
            let Some(Object::Album(album)) = self.objects.get_mut(&album_id) else {
                return;
            };
            album.ctr.children.add(track_id, track_key);
            if track_last_change > album.last_change {
                album.last_change = track_last_change;
                true
            } else {
                false
            }
        };
        if let Some(track) = self.objects.get_mut(&track_id) {
            track.set_parent(Some(album_id));
        }
        self.trace_update(album_id);

        if changed {
            self.refresh_album_refs(album_id);
        }
    }

    /// Removes a track from its album and recomputes the album's
    /// last-change time from the remaining tracks.
    pub(crate) fn album_del_track(&mut self, album_id: ObjId, track_id: ObjId) {
        let remaining: Vec<ObjId> = {
            let Some(Object::Album(album)) = self.objects.get_mut(&album_id) else {
                return;
            };
            album.ctr.children.remove(track_id);
            album.ctr.children.ids().collect()
        };
        if let Some(track) = self.objects.get_mut(&track_id) {
            track.set_parent(None);
        }
        self.trace_update(album_id);

        let last_change = remaining
            .iter()
            .filter_map(|id| self.objects.get(id))
            .filter_map(Object::as_track)
            .map(|t| t.last_change)
            .max()
            .unwrap_or(0);
        let changed = {
            let Some(Object::Album(album)) = self.objects.get_mut(&album_id) else {
                return;
            };
            if album.last_change != last_change {
                album.last_change = last_change;
                true
            } else {
                false
            }
        };
        if changed {
            self.refresh_album_refs(album_id);
        }
    }

    /// Creates an album reference for the given album with the sort-field
    /// vector built from `sort`; an empty spec leaves the default
    /// (lowercased album title).
    pub(crate) fn new_album_ref(&mut self, album_id: ObjId, sort: &[SortField]) -> ObjId {
        let id = self.next_id();
        let ctr = {
            let Some(Object::Album(album)) = self.objects.get(&album_id) else {
                warn!("album {album_id} not found when creating album reference");
                return id;
            };
            let mut ctr = Container::new(id, &album.ctr.base.name, ContainerKind::Plain);
            ctr.base.key = album.ctr.base.key;
            if let Some(fields) = album_sort_fields(album, sort) {
                ctr.base.sort_fields = fields;
            }
            ctr
        };
        self.objects.insert(
            id,
            Object::AlbumRef(AlbumRef {
                ctr,
                album: album_id,
                sort_spec: sort.to_vec(),
            }),
        );
        if let Some(Object::Album(album)) = self.objects.get_mut(&album_id) {
            album.refs.push(id);
        }
        id
    }

    /// Rebuilds the sort fields of all references of an album after its
    /// last-change time moved and invalidates the order of their parents.
    fn refresh_album_refs(&mut self, album_id: ObjId) {
        let refs: Vec<ObjId> = match self.objects.get(&album_id) {
            Some(Object::Album(album)) => album.refs.clone(),
            _ => return,
        };
        for ref_id in refs {
            let fields = {
                let (Some(Object::Album(album)), Some(Object::AlbumRef(aref))) =
                    (self.objects.get(&album_id), self.objects.get(&ref_id))
                else {
                    continue;
                };
                album_sort_fields(album, &aref.sort_spec)
            };
            let parent = {
                let Some(Object::AlbumRef(aref)) = self.objects.get_mut(&ref_id) else {
                    continue;
                };
                if let Some(fields) = fields {
                    aref.ctr.base.sort_fields = fields;
                }
                aref.ctr.base.parent
            };
            if let Some(parent_id) = parent {
                if let Some(ctr) = self.objects.get(&parent_id).and_then(Object::container) {
                    ctr.children.invalidate();
                }
            }
        }
    }
}

/// Sort-field vector of an album reference; `None` when the spec is empty.
fn album_sort_fields(album: &Album, sort: &[SortField]) -> Option<Vec<String>> {
    if sort.is_empty() {
        return None;
    }
    Some(
        sort.iter()
            .map(|field| match field {
                SortField::Title => album.ctr.base.name.clone(),
                SortField::Year => album.year.to_string(),
                SortField::LastChange => pad_last_change(album.last_change),
                // track-only fields cannot be configured on album levels
                SortField::TrackNo | SortField::DiscNo => String::new(),
            })
            .collect(),
    )
}
