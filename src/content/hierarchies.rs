use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::{Level, LevelType};

use super::object::{key_of, Container, ContainerKind, Folder, ObjId, Object};
use super::tracks::Track;
use super::{Content, UpdateRun};

impl Track {
    /// Tag values corresponding to a hierarchy level type.
    pub(crate) fn tags_by_level(&self, typ: LevelType) -> &[String] {
        match typ {
            LevelType::Genre => &self.tags.genres,
            LevelType::AlbumArtist => &self.tags.album_artists,
            LevelType::Artist => &self.tags.artists,
            LevelType::Album | LevelType::Track => &[],
        }
    }
}

impl Content {
    /// Inserts a track into the configured hierarchy with the given index,
    /// creating missing containers on the way.
    pub(crate) fn add_track_to_hierarchy(
        &mut self,
        run: &mut UpdateRun,
        index: usize,
        track_id: ObjId,
    ) {
        let cfg = self.cfg.clone();
        let Some(hier) = cfg.content.hierarchies.get(index) else {
            return;
        };
        let Some(&hier_ctr) = self.hier_ids.get(index) else {
            return;
        };
        self.insert_at_level(run, track_id, hier_ctr, &hier.levels, 0);
    }

    fn insert_at_level(
        &mut self,
        run: &mut UpdateRun,
        track_id: ObjId,
        ctr_id: ObjId,
        levels: &[Level],
        index: usize,
    ) {
        let Some(level) = levels.get(index) else {
            return;
        };
        match level.typ {
            LevelType::Genre | LevelType::AlbumArtist | LevelType::Artist => {
                let values: Vec<String> = match self.objects.get(&track_id) {
                    Some(Object::Track(track)) => track.tags_by_level(level.typ).to_vec(),
                    _ => return,
                };
                for value in values {
                    let child =
                        self.upper_container(run, ctr_id, &value, level.typ, levels.get(index + 1));
                    self.insert_at_level(run, track_id, child, levels, index + 1);
                }
            }

            LevelType::Album => {
                let album_key = match self.objects.get(&track_id) {
                    Some(Object::Track(track)) => track.album_key(),
                    _ => return,
                };
                let album_id = self.album_for_track(run, track_id, album_key);

                let existing = self
                    .objects
                    .get(&ctr_id)
                    .and_then(Object::container)
                    .and_then(|c| c.children.by_key(album_key));
                let aref_id = match existing {
                    Some(id) => id,
                    None => {
                        let id = self.new_album_ref(album_id, &level.sort_fields());
                        if let Some(next) = levels.get(index + 1) {
                            if let Some(ctr) =
                                self.objects.get_mut(&id).and_then(Object::container_mut)
                            {
                                ctr.children.set_comparisons(next.comparisons());
                            }
                        }
                        self.add_child(ctr_id, id);
                        run.count += 1;
                        id
                    }
                };

                let track_sort = levels
                    .get(index + 1)
                    .map(Level::sort_fields)
                    .unwrap_or_default();
                let tref_id = self.new_track_ref(track_id, &track_sort);
                run.count += 1;
                self.add_child(aref_id, tref_id);
            }

            LevelType::Track => {
                let tref_id = self.new_track_ref(track_id, &level.sort_fields());
                run.count += 1;
                self.add_child(ctr_id, tref_id);
            }
        }
    }

    /// Looks up or creates a genre/artist/albumartist container named by a
    /// tag value. The container's comparison vector comes from the next
    /// level's sort specification.
    fn upper_container(
        &mut self,
        run: &mut UpdateRun,
        parent_id: ObjId,
        value: &str,
        typ: LevelType,
        next: Option<&Level>,
    ) -> ObjId {
        let key = key_of(value);
        if let Some(existing) = self
            .objects
            .get(&parent_id)
            .and_then(Object::container)
            .and_then(|c| c.children.by_key(key))
        {
            return existing;
        }

        let id = self.next_id();
        let kind = match typ {
            LevelType::Genre => ContainerKind::Genre,
            LevelType::Artist => ContainerKind::Artist,
            LevelType::AlbumArtist => ContainerKind::AlbumArtist,
            LevelType::Album | LevelType::Track => ContainerKind::Plain,
        };
        let mut ctr = Container::new(id, value, kind);
        if let Some(next) = next {
            ctr.children.set_comparisons(next.comparisons());
        }
        self.objects.insert(id, Object::Container(ctr));
        self.add_child(parent_id, id);
        run.count += 1;
        id
    }

    /// Inserts a track into the folder hierarchy: a track reference sorted
    /// by file name, below the chain of folder containers between the
    /// music dir and the file. With several music dirs an extra container
    /// per music dir sits directly under the hierarchy root.
    pub(crate) fn add_track_to_folder_hierarchy(&mut self, run: &mut UpdateRun, track_id: ObjId) {
        let Some(folder_root) = self.folder_hier else {
            return;
        };
        let (track_path, file_name) = match self.objects.get(&track_id) {
            Some(Object::Track(track)) => {
                if track.is_external() {
                    return;
                }
                let path = PathBuf::from(&track.path);
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                (path, name)
            }
            _ => return,
        };
        let cfg = self.cfg.clone();
        let Some(music_dir) = cfg.music_dir_of(&track_path) else {
            warn!(
                "track '{}' is in no music dir, not adding it to the folder hierarchy",
                track_path.display()
            );
            return;
        };

        let mut anchor = folder_root;
        if cfg.content.music_dirs.len() > 1 {
            let name = music_dir.display().to_string();
            anchor = self.folder_container(run, folder_root, &name, music_dir);
        }

        // folder chain from the music dir down to the file's directory
        let mut dirs: Vec<PathBuf> = Vec::new();
        let mut dir = track_path.parent();
        while let Some(d) = dir {
            if d == music_dir.as_path() {
                break;
            }
            dirs.push(d.to_path_buf());
            dir = d.parent();
        }
        dirs.reverse();

        let mut current = anchor;
        for d in dirs {
            let name = d
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            current = self.folder_container(run, current, &name, &d);
        }

        let tref_id = self.new_track_ref(track_id, &[]);
        if let Some(obj) = self.objects.get_mut(&tref_id) {
            obj.base_mut().sort_fields = vec![file_name];
        }
        run.count += 1;
        self.add_child(current, tref_id);
    }

    /// Looks up or creates the folder container for a directory path.
    fn folder_container(
        &mut self,
        run: &mut UpdateRun,
        parent_id: ObjId,
        name: &str,
        path: &Path,
    ) -> ObjId {
        if let Some(&id) = self.folders.get(path) {
            return id;
        }
        let id = self.next_id();
        let folder = Folder {
            ctr: Container::new(id, name, ContainerKind::Plain),
            path: path.to_path_buf(),
        };
        self.objects.insert(id, Object::Folder(folder));
        self.folders.insert(path.to_path_buf(), id);
        self.add_child(parent_id, id);
        run.count += 1;
        id
    }
}
