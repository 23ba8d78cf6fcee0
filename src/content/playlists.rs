use std::path::{Path, PathBuf};
use tracing::warn;

use super::fileinfo::FileInfo;
use super::object::{pad_playlist_pos, Container, ContainerKind, ObjId, Object};
use super::{Content, UpdateRun};

/// A playlist container. Its children are track references whose sort
/// field is the zero-padded playlist position, so the file order survives
/// sorting.
pub struct Playlist {
    pub ctr: Container,
    pub last_change: i64,
}

/// One parsed playlist entry: a location and, for extended M3U, a title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct M3uEntry {
    pub location: String,
    pub title: Option<String>,
}

/// Parses simple and extended M3U. Unknown directives are ignored; an
/// `#EXTINF` title applies to the following location line.
pub fn parse_m3u(text: &str) -> Vec<M3uEntry> {
    let mut entries = Vec::new();
    let mut title: Option<String> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(info) = line.strip_prefix("#EXTINF:") {
            title = info
                .splitn(2, ',')
                .nth(1)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
        } else if line.starts_with('#') {
            continue;
        } else {
            entries.push(M3uEntry {
                location: line.to_string(),
                title: title.take(),
            });
        }
    }

    entries
}

impl Content {
    /// Adds the playlist file `fi` to the graph and, when it has at least
    /// one valid entry, to the playlist hierarchy. Invalid entries are
    /// skipped without failing the playlist.
    pub(crate) fn add_playlist_file(&mut self, run: &mut UpdateRun, fi: &FileInfo) {
        let text = match std::fs::read_to_string(&fi.path) {
            Ok(text) => text,
            Err(e) => {
                warn!("cannot read playlist '{}': {e}", fi.path.display());
                return;
            }
        };
        let entries = parse_m3u(&text);
        self.add_playlist(run, &fi.path, fi.last_change, &entries);
    }

    /// Builds a playlist node from parsed entries.
    pub fn add_playlist(
        &mut self,
        run: &mut UpdateRun,
        path: &Path,
        last_change: i64,
        entries: &[M3uEntry],
    ) -> ObjId {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let pl_id = self.next_id();
        self.objects.insert(
            pl_id,
            Object::Playlist(Playlist {
                ctr: Container::new(pl_id, &name, ContainerKind::Plain),
                last_change,
            }),
        );
        self.playlists.insert(path.to_path_buf(), pl_id);
        run.count += 1;

        let playlist_dir = path.parent().unwrap_or_else(|| Path::new("/"));
        for (pos, entry) in entries.iter().enumerate() {
            let Some(track_id) = self.track_for_playlist_entry(run, playlist_dir, entry) else {
                continue;
            };
            let tref_id = self.new_track_ref(track_id, &[]);
            if let Some(obj) = self.objects.get_mut(&tref_id) {
                obj.base_mut().sort_fields = vec![pad_playlist_pos(pos)];
            }
            self.add_child(pl_id, tref_id);
            run.count += 1;
        }

        let has_children = self
            .objects
            .get(&pl_id)
            .and_then(Object::container)
            .map(|c| !c.children.is_empty())
            .unwrap_or(false);
        if has_children {
            if let Some(hier) = self.playlist_hier {
                self.add_child(hier, pl_id);
            }
        }

        pl_id
    }

    /// Resolves a playlist entry to a canonical track, creating the track
    /// when it is not known yet. Entries outside every music dir and
    /// entries whose file cannot be read are skipped.
    fn track_for_playlist_entry(
        &mut self,
        run: &mut UpdateRun,
        playlist_dir: &Path,
        entry: &M3uEntry,
    ) -> Option<ObjId> {
        let location = entry.location.trim();
        if location.is_empty() {
            return None;
        }

        if location.starts_with("http://") || location.starts_with("https://") {
            if let Some(&id) = self.tracks.get(location) {
                return Some(id);
            }
            let title = entry
                .title
                .clone()
                .unwrap_or_else(|| stem_of_url(location));
            return Some(self.new_external_track(run, location, &title));
        }

        let mut path = PathBuf::from(location);
        if path.is_relative() {
            path = playlist_dir.join(path);
        }
        if self.cfg.music_dir_of(&path).is_none() {
            warn!(
                "playlist entry '{}' is in no music directory, ignoring it",
                path.display()
            );
            return None;
        }

        let path_str = path.to_string_lossy().into_owned();
        if let Some(&id) = self.tracks.get(&path_str) {
            return Some(id);
        }

        let md = match std::fs::metadata(&path) {
            Ok(md) => md,
            Err(e) => {
                warn!("playlist entry '{}' cannot be read: {e}", path.display());
                return None;
            }
        };
        let fi = FileInfo::from_disk(&path, &md)?;
        let (tags, picture) =
            match super::fileinfo::read_metadata(&fi.path, &self.cfg.content.separator) {
                Ok(res) => res,
                Err(e) => {
                    warn!("skipping playlist entry: {e:#}");
                    return None;
                }
            };
        let mime_type = super::fileinfo::mime_for_path(&fi.path)
            .unwrap_or("application/octet-stream")
            .to_string();
        Some(self.new_track_node(
            run,
            super::tracks::TrackMeta {
                path: path_str,
                mime_type,
                size: fi.size,
                last_change: fi.last_change,
                tags,
                picture,
            },
        ))
    }

    /// Removes a playlist: detaches it from the hierarchy, removes its
    /// track references from the referenced tracks, and drops external
    /// tracks nothing references anymore.
    pub fn remove_playlist(&mut self, run: &mut UpdateRun, path: &Path) {
        let Some(pl_id) = self.playlists.remove(path) else {
            return;
        };
        run.count += 1;

        if let Some(parent_id) = self.objects.get(&pl_id).and_then(Object::parent) {
            self.del_child(parent_id, pl_id);
        }

        let child_ids: Vec<ObjId> = self
            .objects
            .get(&pl_id)
            .and_then(Object::container)
            .map(|c| c.children.ids().collect())
            .unwrap_or_default();
        for child_id in child_ids {
            let target = match self.objects.remove(&child_id) {
                Some(Object::TrackRef(tref)) => Some(tref.track),
                _ => None,
            };
            run.count += 1;
            let Some(track_id) = target else {
                continue;
            };
            let drop_track = match self.objects.get_mut(&track_id) {
                Some(Object::Track(track)) => {
                    track.refs.remove(&child_id);
                    if track.is_external() && track.refs.is_empty() {
                        Some(track.path.clone())
                    } else {
                        None
                    }
                }
                _ => None,
            };
            if let Some(url) = drop_track {
                self.objects.remove(&track_id);
                self.tracks.remove(&url);
                run.count += 1;
            }
        }

        self.objects.remove(&pl_id);
    }
}

fn stem_of_url(url: &str) -> String {
    let last = url.rsplit('/').next().unwrap_or(url);
    last.rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(last)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_m3u() {
        let text = "a.mp3\n\nsub/b.flac\n";
        let entries = parse_m3u(text);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].location, "a.mp3");
        assert_eq!(entries[0].title, None);
    }

    #[test]
    fn parses_extended_m3u() {
        let text = "#EXTM3U\n#EXTINF:123, Some Title\na.mp3\nhttp://radio.example/stream.mp3\n";
        let entries = parse_m3u(text);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title.as_deref(), Some("Some Title"));
        // the EXTINF title applies only to the following entry
        assert_eq!(entries[1].title, None);
        assert_eq!(entries[1].location, "http://radio.example/stream.mp3");
    }

    #[test]
    fn url_stem_fallback_title() {
        assert_eq!(stem_of_url("http://x.example/live/radio.mp3"), "radio");
        assert_eq!(stem_of_url("http://x.example/stream"), "stream");
    }
}
