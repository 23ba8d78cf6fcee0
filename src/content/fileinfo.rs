use anyhow::{anyhow, Context, Result};
use lofty::file::TaggedFileExt;
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::ItemKey;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::warn;

use super::tracks::Tags;
use crate::config::{AUDIO_MIME_TYPES, PLAYLIST_MIME_TYPES};

/// Kind of a file relevant for the content graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Track,
    Playlist,
}

/// A file either present on disk or known to the content graph, reduced to
/// what the updater diff needs.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,
    pub kind: FileKind,
    /// UNIX time of the last change.
    pub last_change: i64,
    pub size: u64,
}

impl FileInfo {
    /// File as known to the graph (no stat involved).
    pub fn known(path: PathBuf, kind: FileKind, last_change: i64) -> FileInfo {
        FileInfo {
            path,
            kind,
            last_change,
            size: 0,
        }
    }

    /// Classifies a file on disk; `None` if its mime type is not relevant.
    pub fn from_disk(path: &Path, md: &std::fs::Metadata) -> Option<FileInfo> {
        let kind = kind_for_path(path)?;
        Some(FileInfo {
            path: path.to_path_buf(),
            kind,
            last_change: unix_mtime(md),
            size: md.len(),
        })
    }
}

fn unix_mtime(md: &std::fs::Metadata) -> i64 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Mime type by file extension, restricted to the types the server
/// recognizes.
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "aac" => Some("audio/aac"),
        "flac" => Some("audio/flac"),
        "m4a" | "mp4" => Some("audio/mp4"),
        "mp3" => Some("audio/mpeg"),
        "oga" | "ogg" => Some("audio/ogg"),
        "opus" => Some("audio/opus"),
        "m3u" | "m3u8" => Some("audio/x-mpegurl"),
        "pls" => Some("audio/x-scpls"),
        _ => None,
    }
}

pub fn kind_for_path(path: &Path) -> Option<FileKind> {
    let mime = mime_for_path(path)?;
    if AUDIO_MIME_TYPES.contains(&mime) {
        Some(FileKind::Track)
    } else if PLAYLIST_MIME_TYPES.contains(&mime) {
        Some(FileKind::Playlist)
    } else {
        None
    }
}

pub fn is_valid_track_file(path: &Path) -> bool {
    kind_for_path(path) == Some(FileKind::Track)
}

pub fn is_valid_playlist_file(path: &Path) -> bool {
    kind_for_path(path) == Some(FileKind::Playlist)
}

/// Recursively collects all recognized files below `dirs` with a
/// depth-first walk. Hidden directories are skipped; unreadable entries
/// are logged and skipped, an unreadable root aborts the walk.
pub async fn files_from_dirs(dirs: &[PathBuf]) -> Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    for root in dirs {
        let mut pending = vec![root.clone()];
        // a root that cannot be read is a cycle-wide error
        tokio::fs::read_dir(root)
            .await
            .with_context(|| format!("cannot read music dir '{}'", root.display()))?;

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("cannot read directory '{}': {e}", dir.display());
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let md = match entry.metadata().await {
                    Ok(md) => md,
                    Err(e) => {
                        warn!("cannot stat '{}': {e}", path.display());
                        continue;
                    }
                };
                if md.is_dir() {
                    let hidden = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with('.'))
                        .unwrap_or(false);
                    if !hidden {
                        pending.push(path);
                    }
                } else if md.is_file() {
                    if let Some(fi) = FileInfo::from_disk(&path, &md) {
                        files.push(fi);
                    }
                }
            }
        }
    }

    Ok(files)
}

/// Sorts a file list by path, the precondition of [`diff`].
pub fn sort_by_path(files: &mut [FileInfo]) {
    files.sort_by(|a, b| a.path.cmp(&b.path));
}

/// Removes consecutive entries with equal paths; expects a sorted slice.
pub fn dedup_by_path(files: &mut Vec<FileInfo>) {
    files.dedup_by(|a, b| a.path == b.path);
}

/// Three-way diff between the files known to the graph (`cnt`) and the
/// files on disk (`disk`), both sorted by path. Returns the files to
/// delete from and to add to the graph; a file present on both sides with
/// a newer disk timestamp is replaced (delete + add).
pub fn diff(cnt: &[FileInfo], disk: &[FileInfo]) -> (Vec<FileInfo>, Vec<FileInfo>) {
    let mut del = Vec::new();
    let mut add = Vec::new();

    let (mut i, mut j) = (0, 0);
    while i < cnt.len() || j < disk.len() {
        if i >= cnt.len() {
            add.push(disk[j].clone());
            j += 1;
        } else if j >= disk.len() {
            del.push(cnt[i].clone());
            i += 1;
        } else {
            match cnt[i].path.cmp(&disk[j].path) {
                std::cmp::Ordering::Greater => {
                    add.push(disk[j].clone());
                    j += 1;
                }
                std::cmp::Ordering::Less => {
                    del.push(cnt[i].clone());
                    i += 1;
                }
                std::cmp::Ordering::Equal => {
                    if cnt[i].last_change < disk[j].last_change {
                        del.push(cnt[i].clone());
                        add.push(disk[j].clone());
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
    }

    (del, add)
}

/// Splits a tag that contains multiple entries separated by `sep` into the
/// trimmed entries; empty entries are dropped.
pub fn split_multi(tag: &str, sep: &str) -> Vec<String> {
    tag.split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads the tags and the embedded cover picture of a track file. A file
/// whose metadata cannot be extracted is skipped by the update.
pub fn read_metadata(path: &Path, separator: &str) -> Result<(Tags, Option<Vec<u8>>)> {
    let tagged = Probe::open(path)
        .with_context(|| format!("cannot retrieve metadata for '{}'", path.display()))?
        .read()
        .with_context(|| format!("cannot retrieve metadata for '{}'", path.display()))?;

    let tag = tagged
        .primary_tag()
        .or_else(|| tagged.first_tag())
        .ok_or_else(|| anyhow!("no tags found in '{}'", path.display()))?;

    let title = tag
        .title()
        .map(|t| t.to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string()
        });

    let mut tags = Tags {
        title,
        album: tag.album().map(|a| a.to_string()).unwrap_or_default(),
        artists: split_multi(tag.artist().as_deref().unwrap_or(""), separator),
        album_artists: split_multi(
            tag.get_string(&ItemKey::AlbumArtist).unwrap_or(""),
            separator,
        ),
        composers: split_multi(tag.get_string(&ItemKey::Composer).unwrap_or(""), separator),
        genres: split_multi(tag.genre().as_deref().unwrap_or(""), separator),
        year: tag.year().unwrap_or(0),
        track_no: tag.track().unwrap_or(0),
        disc_no: tag.disk().unwrap_or(0),
        compilation: tag
            .get_string(&ItemKey::FlagCompilation)
            .map(|v| v == "1")
            .unwrap_or(false),
    };
    // a non-compilation without album artists is attributed to its artists
    if !tags.compilation && tags.album_artists.is_empty() {
        tags.album_artists = tags.artists.clone();
    }

    let picture = tag.pictures().first().map(|p| p.data().to_vec());

    Ok((tags, picture))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fi(path: &str, last_change: i64) -> FileInfo {
        FileInfo::known(PathBuf::from(path), FileKind::Track, last_change)
    }

    #[test]
    fn mime_recognition() {
        assert_eq!(mime_for_path(Path::new("/m/a.flac")), Some("audio/flac"));
        assert_eq!(mime_for_path(Path::new("/m/a.MP3")), Some("audio/mpeg"));
        assert_eq!(mime_for_path(Path::new("/m/a.m3u")), Some("audio/x-mpegurl"));
        assert_eq!(mime_for_path(Path::new("/m/a.txt")), None);
        assert_eq!(mime_for_path(Path::new("/m/noext")), None);
        assert!(is_valid_track_file(Path::new("/m/a.opus")));
        assert!(is_valid_playlist_file(Path::new("/m/a.pls")));
        assert!(!is_valid_track_file(Path::new("/m/a.pls")));
    }

    #[test]
    fn diff_adds_and_deletes() {
        let cnt = vec![fi("/m/a.mp3", 1), fi("/m/b.mp3", 1)];
        let disk = vec![fi("/m/b.mp3", 1), fi("/m/c.mp3", 1)];
        let (del, add) = diff(&cnt, &disk);
        assert_eq!(del.len(), 1);
        assert_eq!(del[0].path, PathBuf::from("/m/a.mp3"));
        assert_eq!(add.len(), 1);
        assert_eq!(add[0].path, PathBuf::from("/m/c.mp3"));
    }

    #[test]
    fn diff_replaces_changed_file() {
        let cnt = vec![fi("/m/x.mp3", 100)];
        let disk = vec![fi("/m/x.mp3", 200)];
        let (del, add) = diff(&cnt, &disk);
        assert_eq!(del.len(), 1);
        assert_eq!(add.len(), 1);
        assert_eq!(del[0].last_change, 100);
        assert_eq!(add[0].last_change, 200);
    }

    #[test]
    fn diff_is_empty_without_changes() {
        let cnt = vec![fi("/m/a.mp3", 7)];
        let disk = vec![fi("/m/a.mp3", 7)];
        let (del, add) = diff(&cnt, &disk);
        assert!(del.is_empty());
        assert!(add.is_empty());
    }

    #[test]
    fn dedup_removes_double_paths() {
        let mut v = vec![fi("/m/a.mp3", 1), fi("/m/a.mp3", 2), fi("/m/b.mp3", 1)];
        dedup_by_path(&mut v);
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn split_multi_trims_and_drops_empty() {
        assert_eq!(split_multi("a; b ;c", ";"), vec!["a", "b", "c"]);
        assert_eq!(split_multi("", ";"), Vec::<String>::new());
        assert_eq!(split_multi(" solo ", ";"), vec!["solo"]);
    }

    #[tokio::test]
    async fn walk_skips_hidden_and_unrecognized() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mp3"), b"x").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"x").unwrap();
        let hidden = dir.path().join(".git");
        std::fs::create_dir(&hidden).unwrap();
        std::fs::write(hidden.join("c.mp3"), b"x").unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("d.flac"), b"x").unwrap();

        let mut files = files_from_dirs(&[dir.path().to_path_buf()]).await.unwrap();
        sort_by_path(&mut files);
        let names: Vec<_> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.mp3", "d.flac"]);
    }

    #[tokio::test]
    async fn walk_fails_on_missing_root() {
        let res = files_from_dirs(&[PathBuf::from("/nonexistent/music")]).await;
        assert!(res.is_err());
    }
}
