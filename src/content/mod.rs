use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, trace};

pub mod albums;
pub mod fileinfo;
pub mod hierarchies;
pub mod marshal;
pub mod notifier;
pub mod object;
pub mod playlists;
pub mod scanner;
pub mod tracks;
pub mod updater;

use crate::config::Config;
use crate::error::AppError;

use fileinfo::{FileInfo, FileKind};
use marshal::{indices, BrowseMode, DIDL_END, DIDL_START};
use object::{Container, ContainerKind, ObjId, Object};
use tracks::Pictures;

/// Root folders for music and picture requests; both end with a slash.
pub const MUSIC_FOLDER: &str = "/music/";
pub const PICTURE_FOLDER: &str = "/pictures/";

/// Result of a Browse action.
#[derive(Debug)]
pub struct BrowseResult {
    /// DIDL-Lite payload, wrapped in the fixed envelope.
    pub didl: String,
    pub returned: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Running,
    Updating,
}

/// Content status, shown by the status report.
struct Status {
    phase: Phase,
    task: String,
    total: usize,
    done: usize,
}

/// Context of one apply phase: the number of node changes and the cover
/// workers spawned for the tracks added in this phase.
pub struct UpdateRun {
    count: u32,
    covers: JoinSet<Option<(String, u64)>>,
}

impl UpdateRun {
    pub fn count(&self) -> u32 {
        self.count
    }
}

/// The content graph: all content objects, the canonical entity maps and
/// the machinery to browse and update them.
pub struct Content {
    status: Status,
    pub(crate) objects: HashMap<ObjId, Object>,
    /// Track path (or URL) to track object.
    pub(crate) tracks: HashMap<String, ObjId>,
    /// Album key to album object.
    pub(crate) albums: HashMap<u64, ObjId>,
    /// Folder path to folder object.
    pub(crate) folders: HashMap<PathBuf, ObjId>,
    /// Playlist path to playlist object.
    pub(crate) playlists: HashMap<PathBuf, ObjId>,
    pub(crate) pictures: Arc<Pictures>,
    pub(crate) cfg: Arc<Config>,
    /// Hierarchy containers in configured order.
    pub(crate) hier_ids: Vec<ObjId>,
    pub(crate) playlist_hier: Option<ObjId>,
    pub(crate) folder_hier: Option<ObjId>,
    /// External, virtual music and picture URL prefixes.
    pub(crate) ext_music_path: String,
    pub(crate) ext_picture_path: String,
    /// Update counter deltas per container since the last apply phase.
    upd_counts: HashMap<ObjId, u32>,
    last_id: i64,
}

impl Content {
    /// Creates the content graph with the root object and one container
    /// per configured hierarchy (plus playlist and folder hierarchies when
    /// enabled).
    pub fn new(cfg: Arc<Config>, pictures: Arc<Pictures>, host: IpAddr) -> Content {
        trace!("creating content object ...");

        let ext_music_path = format!("http://{}:{}{}", host, cfg.upnp.port, MUSIC_FOLDER);
        let mut cnt = Content {
            status: Status {
                phase: Phase::Waiting,
                task: String::new(),
                total: 0,
                done: 0,
            },
            objects: HashMap::new(),
            tracks: HashMap::new(),
            albums: HashMap::new(),
            folders: HashMap::new(),
            playlists: HashMap::new(),
            pictures,
            cfg,
            hier_ids: Vec::new(),
            playlist_hier: None,
            folder_hier: None,
            ext_music_path,
            ext_picture_path: PICTURE_FOLDER.to_string(),
            upd_counts: HashMap::new(),
            last_id: 0,
        };
        cnt.make_tree();

        trace!("content object created");
        cnt
    }

    fn make_tree(&mut self) {
        self.objects.insert(
            ObjId::ROOT,
            Object::Container(Container::new(ObjId::ROOT, "root", ContainerKind::Plain)),
        );

        let cfg = self.cfg.clone();
        for (i, hier) in cfg.content.hierarchies.iter().enumerate() {
            let id = self.next_id();
            let mut ctr = Container::new(id, &hier.name, ContainerKind::Plain);
            ctr.base.sort_fields = vec![format!("{i:02}")];
            if let Some(first) = hier.levels.first() {
                ctr.children.set_comparisons(first.comparisons());
            }
            self.objects.insert(id, Object::Container(ctr));
            self.add_child(ObjId::ROOT, id);
            self.hier_ids.push(id);
        }

        let mut index = cfg.content.hierarchies.len();
        if cfg.content.show_playlists {
            let id = self.next_id();
            let mut ctr = Container::new(
                id,
                &cfg.content.playlist_hierarchy_name,
                ContainerKind::Plain,
            );
            ctr.base.sort_fields = vec![format!("{index:02}")];
            self.objects.insert(id, Object::Container(ctr));
            self.add_child(ObjId::ROOT, id);
            self.playlist_hier = Some(id);
            index += 1;
        }
        if cfg.content.show_folders {
            let id = self.next_id();
            let mut ctr =
                Container::new(id, &cfg.content.folder_hierarchy_name, ContainerKind::Plain);
            ctr.base.sort_fields = vec![format!("{index:02}")];
            self.objects.insert(id, Object::Container(ctr));
            self.add_child(ObjId::ROOT, id);
            self.folder_hier = Some(id);
        }
    }

    pub(crate) fn next_id(&mut self) -> ObjId {
        self.last_id += 1;
        ObjId(self.last_id)
    }

    /// Implements the Browse action of the ContentDirectory service.
    pub fn browse(
        &self,
        id: ObjId,
        mode: BrowseMode,
        start: u32,
        wanted: u32,
    ) -> Result<BrowseResult, AppError> {
        let obj = self.objects.get(&id).ok_or(AppError::NotFound)?;

        if mode == BrowseMode::DirectChildren && !obj.is_container() {
            return Err(AppError::InvalidArgument(format!(
                "object {id} is no container but browse mode is 'BrowseDirectChildren'"
            )));
        }

        let num_children = obj.container().map(|c| c.children.len()).unwrap_or(0);
        let (first, last) = indices(start, wanted, num_children);

        let mut didl = String::from(DIDL_START);
        self.marshal(id, mode, first, last, &mut didl);
        didl.push_str(DIDL_END);

        let (returned, total) = match mode {
            BrowseMode::Metadata => (1, 1),
            BrowseMode::DirectChildren => ((last - first) as u32, num_children as u32),
        };

        Ok(BrowseResult {
            didl,
            returned,
            total,
        })
    }

    /// Assembles the value for the state variable ContainerUpdateIDs: the
    /// update-count deltas of the last apply phase as a flat
    /// `id,count,id,count,...` list.
    pub fn container_update_ids(&self) -> String {
        let mut ids: Vec<_> = self.upd_counts.iter().collect();
        ids.sort_by_key(|(id, _)| **id);
        ids.iter()
            .map(|(id, count)| format!("{id},{count}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Resets the update counter of every container object and clears the
    /// delta map (part of the service-reset procedure).
    pub fn reset_ctr_upd_counts(&mut self) {
        for obj in self.objects.values_mut() {
            if let Some(ctr) = obj.container_mut() {
                ctr.upd_count = 0;
            }
        }
        self.upd_counts.clear();
    }

    /// Returns the picture with the given id, if present.
    pub fn picture(&self, id: u64) -> Option<Arc<Vec<u8>>> {
        self.pictures.get(id)
    }

    /// Path of the track with the given object id.
    pub fn track_path(&self, id: ObjId) -> Option<String> {
        self.objects
            .get(&id)
            .and_then(Object::as_track)
            .map(|t| t.path.clone())
    }

    /// All files (tracks and playlists) known to the graph whose path lies
    /// under one of `paths`. External tracks have no filesystem presence
    /// and are skipped.
    pub fn files_by_paths(&self, paths: &[PathBuf]) -> Vec<FileInfo> {
        let mut files = Vec::new();
        for (path, id) in &self.tracks {
            let Some(Object::Track(track)) = self.objects.get(id) else {
                continue;
            };
            if track.is_external() {
                continue;
            }
            let p = Path::new(path);
            if paths.iter().any(|q| p.starts_with(q)) {
                files.push(FileInfo::known(
                    p.to_path_buf(),
                    FileKind::Track,
                    track.last_change,
                ));
            }
        }
        for (path, id) in &self.playlists {
            let Some(Object::Playlist(pl)) = self.objects.get(id) else {
                continue;
            };
            if paths.iter().any(|q| path.starts_with(q)) {
                files.push(FileInfo::known(
                    path.clone(),
                    FileKind::Playlist,
                    pl.last_change,
                ));
            }
        }
        files
    }

    /// Starts an apply phase: clears the update-count delta map and
    /// returns the run context.
    pub fn begin_update(&mut self) -> UpdateRun {
        self.status.phase = Phase::Updating;
        self.status.task.clear();
        self.status.total = 0;
        self.status.done = 0;
        self.upd_counts.clear();
        UpdateRun {
            count: 0,
            covers: JoinSet::new(),
        }
    }

    /// Ends an apply phase: joins the cover workers, stores the resulting
    /// picture ids on their tracks, drops orphaned pictures and returns
    /// the number of node changes.
    pub async fn finish_update(&mut self, mut run: UpdateRun) -> u32 {
        while let Some(res) = run.covers.join_next().await {
            if let Ok(Some((path, pic_id))) = res {
                if let Some(&track_id) = self.tracks.get(&path) {
                    if let Some(Object::Track(track)) = self.objects.get_mut(&track_id) {
                        track.pic_id = Some(pic_id);
                    }
                }
            }
        }
        self.cleanup();
        self.status.phase = Phase::Running;
        run.count
    }

    /// Applies one update cycle: deletes strictly before adds, then the
    /// cover-worker join. Returns the number of changed objects.
    pub async fn update(&mut self, del: &[FileInfo], add: &[FileInfo]) -> u32 {
        trace!("updating content ...");
        let mut run = self.begin_update();
        self.status.task = "processing updates".to_string();
        self.status.total = del.len() + add.len();

        for fi in del {
            match fi.kind {
                FileKind::Playlist => {
                    if self.cfg.content.show_playlists {
                        self.remove_playlist(&mut run, &fi.path);
                    }
                }
                FileKind::Track => {
                    let path = fi.path.to_string_lossy().into_owned();
                    self.remove_track(&mut run, &path);
                }
            }
            self.status.done += 1;
        }

        for fi in add {
            match fi.kind {
                FileKind::Playlist => {
                    if self.cfg.content.show_playlists {
                        self.add_playlist_file(&mut run, fi);
                    }
                }
                FileKind::Track => self.add_track_file(&mut run, fi),
            }
            self.status.done += 1;
        }

        let count = self.finish_update(run).await;
        trace!("content updated, {count} object changes");
        count
    }

    /// Removes pictures no track cites anymore.
    fn cleanup(&mut self) {
        let keep: HashSet<u64> = self
            .tracks
            .values()
            .filter_map(|id| self.objects.get(id))
            .filter_map(Object::as_track)
            .filter_map(|t| t.pic_id)
            .collect();
        self.pictures.retain(&keep);
    }

    /// Adds `child_id` as child of `parent_id`, wires the parent pointer
    /// and registers the change for ContainerUpdateIDs. Albums get their
    /// specialized behavior.
    pub(crate) fn add_child(&mut self, parent_id: ObjId, child_id: ObjId) {
        if matches!(self.objects.get(&parent_id), Some(Object::Album(_))) {
            self.album_add_track(parent_id, child_id);
            return;
        }
        let Some(key) = self.objects.get(&child_id).map(Object::key) else {
            return;
        };
        match self.objects.get_mut(&parent_id).and_then(Object::container_mut) {
            Some(ctr) => ctr.children.add(child_id, key),
            None => {
                debug!("object {parent_id} is no container, cannot add child {child_id}");
                return;
            }
        }
        if let Some(child) = self.objects.get_mut(&child_id) {
            child.set_parent(Some(parent_id));
        }
        self.trace_update(parent_id);
    }

    /// Removes `child_id` from `parent_id` and clears its parent pointer.
    pub(crate) fn del_child(&mut self, parent_id: ObjId, child_id: ObjId) {
        if matches!(self.objects.get(&parent_id), Some(Object::Album(_))) {
            self.album_del_track(parent_id, child_id);
            return;
        }
        if let Some(ctr) = self.objects.get_mut(&parent_id).and_then(Object::container_mut) {
            ctr.children.remove(child_id);
        }
        if let Some(child) = self.objects.get_mut(&child_id) {
            child.set_parent(None);
        }
        self.trace_update(parent_id);
    }

    /// Increments the update counter of a container for the delta map and
    /// the container's own ContainerUpdateIDValue.
    pub(crate) fn trace_update(&mut self, id: ObjId) {
        *self.upd_counts.entry(id).or_insert(0) += 1;
        if let Some(ctr) = self.objects.get_mut(&id).and_then(Object::container_mut) {
            ctr.upd_count = ctr.upd_count.wrapping_add(1);
        }
    }

    /// Children of a container in sort order.
    pub(crate) fn children_in_order(&self, id: ObjId) -> Vec<ObjId> {
        let Some(ctr) = self.objects.get(&id).and_then(Object::container) else {
            return Vec::new();
        };
        ctr.children.ordered(|child_id| {
            self.objects
                .get(&child_id)
                .map(|o| o.sort_fields().to_vec())
                .unwrap_or_default()
        })
    }

    /// Ordered children of a container; empty for items and unknown ids.
    pub fn children(&self, id: ObjId) -> Vec<ObjId> {
        self.children_in_order(id)
    }

    pub fn num_children(&self, id: ObjId) -> usize {
        self.objects
            .get(&id)
            .and_then(Object::container)
            .map(|c| c.children.len())
            .unwrap_or(0)
    }

    pub fn name_of(&self, id: ObjId) -> Option<String> {
        self.objects.get(&id).map(|o| o.name().to_string())
    }

    pub fn sort_fields_of(&self, id: ObjId) -> Option<Vec<String>> {
        self.objects.get(&id).map(|o| o.sort_fields().to_vec())
    }

    pub fn upd_count_of(&self, id: ObjId) -> Option<u32> {
        self.objects
            .get(&id)
            .and_then(Object::container)
            .map(|c| c.upd_count)
    }

    pub fn track_by_path(&self, path: &str) -> Option<ObjId> {
        self.tracks.get(path).copied()
    }

    pub fn pic_id_of(&self, id: ObjId) -> Option<u64> {
        self.objects.get(&id).and_then(Object::as_track)?.pic_id
    }

    /// Checks the structural invariants of the graph; returns a
    /// description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (id, obj) in &self.objects {
            // parent/child consistency
            if let Some(parent_id) = obj.parent() {
                let Some(parent) = self.objects.get(&parent_id) else {
                    return Err(format!("object {id} has vanished parent {parent_id}"));
                };
                let Some(ctr) = parent.container() else {
                    return Err(format!("parent {parent_id} of {id} is no container"));
                };
                if ctr.children.key_for(*id).is_none() {
                    return Err(format!("object {id} missing in child table of {parent_id}"));
                }
            }

            // child table consistency: keys resolve back to children
            if let Some(ctr) = obj.container() {
                for (child_id, key) in ctr.children.entries() {
                    let Some(child) = self.objects.get(&child_id) else {
                        return Err(format!("container {id} references vanished child {child_id}"));
                    };
                    if child.key() != key {
                        return Err(format!(
                            "child {child_id} of {id} registered under wrong key"
                        ));
                    }
                    match ctr.children.by_key(key) {
                        Some(_) => {}
                        None => {
                            return Err(format!(
                                "key of child {child_id} not resolvable in container {id}"
                            ))
                        }
                    }
                }
            }

            // references target existing canonical entities
            match obj {
                Object::AlbumRef(aref) => {
                    let Some(Object::Album(album)) = self.objects.get(&aref.album) else {
                        return Err(format!("album reference {id} has no album"));
                    };
                    if album.ctr.base.key != obj.key() {
                        return Err(format!("album reference {id} differs in key from its album"));
                    }
                }
                Object::TrackRef(tref) => {
                    if !matches!(self.objects.get(&tref.track), Some(Object::Track(_))) {
                        return Err(format!("track reference {id} has no track"));
                    }
                }
                _ => {}
            }
        }

        // every track with an album tag is a child of its album
        for (path, id) in &self.tracks {
            let Some(Object::Track(track)) = self.objects.get(id) else {
                return Err(format!("track map entry '{path}' has no track object"));
            };
            if track.tags.album.is_empty() {
                continue;
            }
            let Some(album_id) = self.albums.get(&track.album_key()) else {
                return Err(format!("track '{path}' has no album in the album map"));
            };
            let is_child = self
                .objects
                .get(album_id)
                .and_then(Object::container)
                .map(|c| c.children.key_for(*id).is_some())
                .unwrap_or(false);
            if !is_child {
                return Err(format!("track '{path}' is not a child of its album"));
            }
        }

        Ok(())
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn num_albums(&self) -> usize {
        self.albums.len()
    }

    pub fn num_playlists(&self) -> usize {
        self.playlists.len()
    }

    /// Runs one of the diagnostics reports; `None` for an unknown command.
    pub fn report(&self, command: &str) -> Option<String> {
        match command {
            "status" => Some(self.write_status()),
            "albums-with-multiple-covers" => Some(self.albums_with_multiple_covers()),
            "inconsistent-albums" => Some(self.inconsistent_albums()),
            "tracks-without-album" => Some(self.tracks_without_album()),
            "tracks-without-cover" => Some(self.tracks_without_cover()),
            "albums-with-inconsistent-track-numbers" => {
                Some(self.albums_with_inconsistent_track_numbers())
            }
            _ => None,
        }
    }

    fn write_status(&self) -> String {
        let mut out = String::new();
        match self.status.phase {
            Phase::Waiting => out.push_str("Waiting ...\n"),
            Phase::Running => {
                out.push_str("Content:\n");
                let _ = writeln!(out, "    {:6} tracks", self.tracks.len());
                let _ = writeln!(out, "    {:6} albums", self.albums.len());
                let _ = writeln!(out, "    {:6} playlists", self.playlists.len());
                let _ = writeln!(out, "    {:6} pictures", self.pictures.len());
            }
            Phase::Updating => {
                out.push_str("Updating content ...\n");
                if self.status.total > 0 {
                    let _ = writeln!(
                        out,
                        "    {} {} files, {} done ({:.2}%)",
                        self.status.task,
                        self.status.total,
                        self.status.done,
                        100.0 * self.status.done as f64 / self.status.total as f64
                    );
                }
            }
        }
        out
    }

    fn report_header(title: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{title}:\n");
        let _ = writeln!(out, "{:<18} {:<30} {:<30}", "Genre", "AlbumArtist", "Album");
        let _ = writeln!(out, "{}", "-".repeat(80));
        out
    }

    fn album_row(&self, album_id: ObjId) -> String {
        let Some(Object::Album(album)) = self.objects.get(&album_id) else {
            return String::new();
        };
        let genre = album
            .ctr
            .children
            .ids()
            .filter_map(|id| self.objects.get(&id))
            .filter_map(Object::as_track)
            .find_map(|t| t.tags.genres.first().cloned())
            .unwrap_or_default();
        let artist = album.artists.first().cloned().unwrap_or_default();
        format!(
            "{:<18} {:<30} {:<30}\n",
            clip(&genre, 18),
            clip(&artist, 30),
            clip(&album.ctr.base.name, 30)
        )
    }

    /// Albums whose tracks do not all share the same cover picture.
    fn albums_with_multiple_covers(&self) -> String {
        let mut out = Self::report_header("Albums with multiple covers");
        for (&_key, &album_id) in &self.albums {
            let pics: HashSet<Option<u64>> = self
                .objects
                .get(&album_id)
                .and_then(Object::container)
                .map(|c| {
                    c.children
                        .ids()
                        .filter_map(|id| self.objects.get(&id))
                        .filter_map(Object::as_track)
                        .map(|t| t.pic_id)
                        .collect()
                })
                .unwrap_or_default();
            if pics.len() > 1 {
                out.push_str(&self.album_row(album_id));
            }
        }
        out
    }

    /// Tracks whose tags describe the same album (artists + title) with
    /// diverging year or compilation flag.
    fn inconsistent_albums(&self) -> String {
        let mut out = String::from("Potentially inconsistent albums:\n");
        let mut seen: HashMap<String, (u32, bool)> = HashMap::new();
        let mut reported: HashSet<String> = HashSet::new();

        for id in self.tracks.values() {
            let Some(Object::Track(track)) = self.objects.get(id) else {
                continue;
            };
            let key = format!("{:?}|{}", track.tags.album_artists, track.tags.album);
            match seen.get(&key) {
                None => {
                    seen.insert(key, (track.tags.year, track.tags.compilation));
                }
                Some(&(year, compilation)) => {
                    if (year != track.tags.year || compilation != track.tags.compilation)
                        && reported.insert(key)
                    {
                        let _ = write!(
                            out,
                            "albumArtists: '{:?}', album: '{}', track: '{}' - differences: ",
                            track.tags.album_artists, track.tags.album, track.tags.title
                        );
                        if year != track.tags.year {
                            out.push_str("years ");
                        }
                        if compilation != track.tags.compilation {
                            out.push_str("compilation flag ");
                        }
                        out.push('\n');
                    }
                }
            }
        }
        out
    }

    fn tracks_without_album(&self) -> String {
        let mut out = String::from("Tracks without album:\n");
        for id in self.tracks.values() {
            let Some(Object::Track(track)) = self.objects.get(id) else {
                continue;
            };
            if track.tags.album.is_empty() {
                let _ = writeln!(
                    out,
                    "genres: '{:?}', artists: '{:?}', track: '{}'",
                    track.tags.genres, track.tags.artists, track.tags.title
                );
            }
        }
        out
    }

    fn tracks_without_cover(&self) -> String {
        let mut out = String::from("Tracks without cover pictures:\n");
        for id in self.tracks.values() {
            let Some(Object::Track(track)) = self.objects.get(id) else {
                continue;
            };
            if track.pic_id.is_none() {
                let _ = writeln!(
                    out,
                    "genres: '{:?}', album: '{}', track: '{}'",
                    track.tags.genres, track.tags.album, track.tags.title
                );
            }
        }
        out
    }

    /// Albums with duplicate track numbers or gaps in the numbering.
    fn albums_with_inconsistent_track_numbers(&self) -> String {
        let mut out = Self::report_header("Albums with inconsistent track numbers");
        for &album_id in self.albums.values() {
            let numbers: Vec<u32> = self
                .objects
                .get(&album_id)
                .and_then(Object::container)
                .map(|c| {
                    c.children
                        .ids()
                        .filter_map(|id| self.objects.get(&id))
                        .filter_map(Object::as_track)
                        .map(|t| t.tags.track_no)
                        .collect()
                })
                .unwrap_or_default();
            if numbers.is_empty() {
                continue;
            }
            let unique: HashSet<u32> = numbers.iter().copied().collect();
            let duplicates = unique.len() != numbers.len();
            let gaps = (1..=numbers.len() as u32).any(|n| !unique.contains(&n));
            if duplicates || gaps {
                out.push_str(&self.album_row(album_id));
            }
        }
        out
    }
}

fn clip(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
