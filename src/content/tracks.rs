use image::imageops::FilterType;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

use crate::config::SortField;

use super::fileinfo::{read_metadata, FileInfo};
use super::object::{
    key_of_bytes, pad_disc_no, pad_last_change, pad_track_no, ObjBase, ObjId, Object, IMG_SIZE,
};
use super::{Content, UpdateRun};

/// Tags of a music file.
#[derive(Debug, Clone, Default)]
pub struct Tags {
    pub title: String,
    pub album: String,
    pub artists: Vec<String>,
    pub album_artists: Vec<String>,
    pub composers: Vec<String>,
    pub genres: Vec<String>,
    pub year: u32,
    pub track_no: u32,
    pub disc_no: u32,
    pub compilation: bool,
}

/// Everything needed to build a track node. Produced from a file by
/// metadata extraction; tests construct it directly.
#[derive(Debug, Clone)]
pub struct TrackMeta {
    /// Absolute file path, or the URL of an external track.
    pub path: String,
    pub mime_type: String,
    pub size: u64,
    pub last_change: i64,
    pub tags: Tags,
    pub picture: Option<Vec<u8>>,
}

/// A track object. For each music track exactly one track object exists;
/// its occurrences in hierarchies are track references.
pub struct Track {
    pub base: ObjBase,
    pub tags: Tags,
    /// Id of the cover picture in the picture store.
    pub pic_id: Option<u64>,
    pub mime_type: String,
    pub size: u64,
    pub last_change: i64,
    pub path: String,
    /// Non-owning back-references to the track references pointing here.
    pub refs: HashSet<ObjId>,
}

impl Track {
    /// Key of the album this track belongs to, hashed over album artists,
    /// title, year and the compilation flag.
    pub fn album_key(&self) -> u64 {
        album_key(&self.tags)
    }

    pub fn is_external(&self) -> bool {
        self.path.starts_with("http://") || self.path.starts_with("https://")
    }
}

pub fn album_key(tags: &Tags) -> u64 {
    key_of_bytes(
        format!(
            "{:?}{}{}{}",
            tags.album_artists, tags.album, tags.year, tags.compilation
        )
        .as_bytes(),
    )
}

/// A reference to a track object. One instance exists per hierarchy (or
/// playlist) occurrence of a track.
pub struct TrackRef {
    pub base: ObjBase,
    pub track: ObjId,
}

/// The picture store. Pictures are deduplicated by the hash of their
/// resized JPEG bytes; cover workers insert concurrently during one apply
/// phase, so the map has its own mutex.
pub struct Pictures {
    data: Mutex<HashMap<u64, Arc<Vec<u8>>>>,
}

impl Pictures {
    pub fn new() -> Pictures {
        Pictures {
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<Vec<u8>>> {
        self.lock().get(&id).cloned()
    }

    pub fn insert(&self, id: u64, bytes: Vec<u8>) {
        self.lock().entry(id).or_insert_with(|| Arc::new(bytes));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops every picture whose id is not in `keep`.
    pub fn retain(&self, keep: &HashSet<u64>) {
        self.lock().retain(|id, _| keep.contains(id));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<Vec<u8>>>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Pictures {
    fn default() -> Self {
        Pictures::new()
    }
}

/// Decodes an embedded picture, resizes it to fit [`IMG_SIZE`] pixels on
/// the longest axis, re-encodes it as JPEG and returns the picture id
/// (hash of the JPEG bytes) with the bytes. `None` if the image cannot be
/// processed; the track is then admitted without a picture.
pub fn process_cover(raw: &[u8]) -> Option<(u64, Vec<u8>)> {
    let img = match image::load_from_memory(raw) {
        Ok(img) => img,
        Err(e) => {
            warn!("could not decode cover picture: {e}");
            return None;
        }
    };
    let img = img.resize(IMG_SIZE, IMG_SIZE, FilterType::Triangle);
    let mut jpeg = Vec::new();
    if let Err(e) = img.write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg) {
        warn!("could not encode resized cover picture: {e}");
        return None;
    }
    let id = key_of_bytes(&jpeg);
    Some((id, jpeg))
}

impl Content {
    /// Adds the track file `fi` to the graph: node, album, and every
    /// configured hierarchy plus the folder hierarchy. A file whose
    /// metadata cannot be extracted is skipped.
    pub(crate) fn add_track_file(&mut self, run: &mut UpdateRun, fi: &FileInfo) {
        let (tags, picture) = match read_metadata(&fi.path, &self.cfg.content.separator) {
            Ok(res) => res,
            Err(e) => {
                warn!("skipping track: {e:#}");
                return;
            }
        };
        let mime_type = super::fileinfo::mime_for_path(&fi.path)
            .unwrap_or("application/octet-stream")
            .to_string();
        self.add_track(
            run,
            TrackMeta {
                path: fi.path.to_string_lossy().into_owned(),
                mime_type,
                size: fi.size,
                last_change: fi.last_change,
                tags,
                picture,
            },
        );
    }

    /// Adds a track to the graph and to all configured hierarchies and, if
    /// enabled, the folder hierarchy (never the playlist hierarchy). A
    /// node that a playlist entry created earlier in the same cycle is
    /// reused instead of duplicated.
    pub fn add_track(&mut self, run: &mut UpdateRun, meta: TrackMeta) -> ObjId {
        let track_id = match self.tracks.get(&meta.path) {
            Some(&id) => id,
            None => self.new_track_node(run, meta),
        };
        for index in 0..self.hier_ids.len() {
            self.add_track_to_hierarchy(run, index, track_id);
        }
        if self.folder_hier.is_some() {
            self.add_track_to_folder_hierarchy(run, track_id);
        }
        track_id
    }

    /// Creates the canonical track node: registers it in the object and
    /// track maps, spawns the cover-processing job, and attaches the track
    /// to its album (creating the album if needed).
    pub(crate) fn new_track_node(&mut self, run: &mut UpdateRun, meta: TrackMeta) -> ObjId {
        let id = self.next_id();
        let track = Track {
            base: ObjBase::new(id, &meta.tags.title),
            tags: meta.tags,
            pic_id: None,
            mime_type: meta.mime_type,
            size: meta.size,
            last_change: meta.last_change,
            path: meta.path.clone(),
            refs: HashSet::new(),
        };
        let album_tagged = !track.tags.album.is_empty();
        let album_key = track.album_key();

        self.tracks.insert(meta.path.clone(), id);
        self.objects.insert(id, Object::Track(track));
        run.count += 1;

        if let Some(raw) = meta.picture {
            let pictures = self.pictures.clone();
            let path = meta.path;
            run.covers.spawn_blocking(move || {
                let (pic_id, jpeg) = process_cover(&raw)?;
                pictures.insert(pic_id, jpeg);
                Some((path, pic_id))
            });
        }

        if album_tagged {
            let album_id = self.album_for_track(run, id, album_key);
            self.album_add_track(album_id, id);
            run.count += 1;
        }

        id
    }

    /// Creates a track node for an external track, i.e. one that lives
    /// somewhere in the WWW instead of the file system.
    pub(crate) fn new_external_track(
        &mut self,
        run: &mut UpdateRun,
        url: &str,
        title: &str,
    ) -> ObjId {
        let id = self.next_id();
        let track = Track {
            base: ObjBase::new(id, title),
            tags: Tags {
                title: title.to_string(),
                ..Tags::default()
            },
            pic_id: None,
            mime_type: super::fileinfo::mime_for_path(std::path::Path::new(url))
                .unwrap_or("audio/mpeg")
                .to_string(),
            size: 0,
            last_change: 0,
            path: url.to_string(),
            refs: HashSet::new(),
        };
        self.tracks.insert(url.to_string(), id);
        self.objects.insert(id, Object::Track(track));
        run.count += 1;
        id
    }

    /// Creates a track reference with the sort-field vector built from
    /// `sort`; an empty spec leaves the default (lowercased title).
    pub(crate) fn new_track_ref(&mut self, track_id: ObjId, sort: &[SortField]) -> ObjId {
        let id = self.next_id();
        let (name, fields) = {
            let Some(Object::Track(track)) = self.objects.get(&track_id) else {
                warn!("track {track_id} not found when creating track reference");
                return id;
            };
            let mut fields = Vec::new();
            for field in sort {
                fields.push(match field {
                    SortField::Title => track.tags.title.clone(),
                    SortField::TrackNo => pad_track_no(track.tags.track_no),
                    SortField::DiscNo => pad_disc_no(track.tags.disc_no),
                    SortField::Year => track.tags.year.to_string(),
                    SortField::LastChange => pad_last_change(track.last_change),
                });
            }
            (track.base.name.clone(), fields)
        };

        let mut base = ObjBase::new(id, &name);
        if !fields.is_empty() {
            base.sort_fields = fields;
        }
        self.objects.insert(
            id,
            Object::TrackRef(TrackRef {
                base,
                track: track_id,
            }),
        );
        if let Some(Object::Track(track)) = self.objects.get_mut(&track_id) {
            track.refs.insert(id);
        }
        id
    }

    /// Removes the track with the given path from the graph: from the
    /// canonical maps, from its album (destroying the album when its last
    /// track goes), and from every hierarchy, pruning branches that become
    /// empty.
    pub fn remove_track(&mut self, run: &mut UpdateRun, path: &str) {
        let Some(track_id) = self.tracks.remove(path) else {
            return;
        };
        let Some(Object::Track(track)) = self.objects.remove(&track_id) else {
            return;
        };
        run.count += 1;

        let album_key = track.album_key();
        if let Some(&album_id) = self.albums.get(&album_key) {
            self.album_del_track(album_id, track_id);
        }

        for ref_id in track.refs {
            self.prune_reference(run, ref_id);
        }

        // the album dies when both its tracks and its references are gone
        if let Some(&album_id) = self.albums.get(&album_key) {
            let dead = match self.objects.get(&album_id) {
                Some(Object::Album(album)) => {
                    album.ctr.children.is_empty() && album.refs.is_empty()
                }
                _ => false,
            };
            if dead {
                self.objects.remove(&album_id);
                self.albums.remove(&album_key);
                run.count += 1;
            }
        }
    }

    /// Removes a track reference and walks up the hierarchy, deleting
    /// ancestors that become empty. Hierarchy containers (children of the
    /// root) and playlists survive even when empty.
    fn prune_reference(&mut self, run: &mut UpdateRun, ref_id: ObjId) {
        let mut obj_id = ref_id;
        loop {
            let Some(parent_id) = self.objects.get(&obj_id).and_then(Object::parent) else {
                // detached reference, just drop it
                self.drop_object(run, obj_id);
                return;
            };
            let parent_is_root = self
                .objects
                .get(&parent_id)
                .map(|p| p.parent().is_none())
                .unwrap_or(true);
            if parent_is_root {
                return;
            }

            self.drop_object(run, obj_id);
            self.del_child(parent_id, obj_id);

            let keep = match self.objects.get(&parent_id) {
                Some(Object::Playlist(_)) => true,
                Some(obj) => obj
                    .container()
                    .map(|c| !c.children.is_empty())
                    .unwrap_or(true),
                None => true,
            };
            if keep {
                return;
            }
            obj_id = parent_id;
        }
    }

    /// Removes an object from the object map and from the kind-specific
    /// canonical maps, keeping back-references consistent.
    pub(crate) fn drop_object(&mut self, run: &mut UpdateRun, id: ObjId) {
        let Some(obj) = self.objects.remove(&id) else {
            return;
        };
        run.count += 1;
        match obj {
            Object::AlbumRef(aref) => {
                if let Some(Object::Album(album)) = self.objects.get_mut(&aref.album) {
                    album.refs.retain(|&r| r != id);
                }
            }
            Object::Folder(folder) => {
                self.folders.remove(&folder.path);
            }
            Object::TrackRef(tref) => {
                if let Some(Object::Track(track)) = self.objects.get_mut(&tref.track) {
                    track.refs.remove(&id);
                }
            }
            _ => {}
        }
    }
}
