use anyhow::{anyhow, bail, Result};
use std::path::Path;
use uuid::Uuid;

use super::{Config, Hierarchy, LevelType, SortField, UpdateMode};

/// Allowed successors of a hierarchy level type.
fn allowed_successors(typ: LevelType) -> &'static [LevelType] {
    match typ {
        LevelType::Genre => &[
            LevelType::AlbumArtist,
            LevelType::Artist,
            LevelType::Album,
            LevelType::Track,
        ],
        LevelType::AlbumArtist => &[LevelType::Album],
        LevelType::Artist => &[LevelType::Track],
        LevelType::Album => &[LevelType::Track],
        LevelType::Track => &[],
    }
}

/// Allowed sort fields per level type. Levels not listed correspond to
/// single-value tags and accept no sort attributes.
fn allowed_sort_fields(typ: LevelType) -> &'static [SortField] {
    match typ {
        LevelType::Album => &[SortField::Title, SortField::Year, SortField::LastChange],
        LevelType::Track => &[
            SortField::Title,
            SortField::TrackNo,
            SortField::DiscNo,
            SortField::Year,
            SortField::LastChange,
        ],
        _ => &[],
    }
}

impl Config {
    /// Checks the configuration for completeness and consistency and fills
    /// in a generated UDN when none is configured. Errors here refuse
    /// startup.
    pub fn validate(&mut self) -> Result<()> {
        for dir in &self.content.music_dirs {
            validate_dir(dir, "music_dirs")?;
            if !dir.is_absolute() {
                bail!("music dir '{}' is not an absolute path", dir.display());
            }
        }
        if self.content.music_dirs.is_empty() {
            bail!("at least one music dir must be configured");
        }
        for (i, a) in self.content.music_dirs.iter().enumerate() {
            for b in self.content.music_dirs.iter().skip(i + 1) {
                if a.starts_with(b) || b.starts_with(a) {
                    bail!(
                        "music dirs '{}' and '{}' overlap",
                        a.display(),
                        b.display()
                    );
                }
            }
        }

        match self.content.update_mode {
            UpdateMode::Notify | UpdateMode::Scan => {}
        }
        if self.content.update_interval == 0 {
            bail!("update_interval must be > 0");
        }

        if self.content.hierarchies.is_empty() {
            bail!("at least one hierarchy must be defined");
        }
        for hier in &self.content.hierarchies {
            validate_hierarchy(hier)?;
        }
        if self.content.show_playlists && self.content.playlist_hierarchy_name.is_empty() {
            bail!("playlist_hierarchy_name must not be empty");
        }
        if self.content.show_folders && self.content.folder_hierarchy_name.is_empty() {
            bail!("folder_hierarchy_name must not be empty");
        }

        if self.upnp.port == 0 {
            bail!("port must be > 0");
        }
        if self.upnp.server_name.is_empty() {
            bail!("the server must have a name, but server_name is empty");
        }
        if self.upnp.udn.is_empty() {
            self.upnp.udn = Uuid::new_v4().to_string();
        } else {
            Uuid::parse_str(&self.upnp.udn)
                .map_err(|e| anyhow!("the server's UDN '{}' is not a valid UUID: {e}", self.upnp.udn))?;
        }
        if self.upnp.max_age == 0 {
            bail!("max_age must be > 0");
        }
        if self.upnp.status_file.as_os_str().is_empty() {
            bail!("status_file must not be empty");
        }

        if !self.log_dir.is_empty() {
            validate_dir(Path::new(&self.log_dir), "log_dir")?;
        }
        if !self.cache_dir.is_empty() {
            validate_dir(Path::new(&self.cache_dir), "cache_dir")?;
        }

        Ok(())
    }
}

fn validate_hierarchy(hier: &Hierarchy) -> Result<()> {
    if hier.name.is_empty() {
        bail!("not all hierarchies have a name");
    }
    if hier.levels.is_empty() {
        bail!("hierarchy '{}' does not have levels", hier.name);
    }

    for (i, level) in hier.levels.iter().enumerate() {
        if i == hier.levels.len() - 1 && level.typ != LevelType::Track {
            bail!("last level of hierarchy '{}' must be track", hier.name);
        }
        if let Some(next) = hier.levels.get(i + 1) {
            if !allowed_successors(level.typ).contains(&next.typ) {
                bail!(
                    "hierarchy '{}' must not contain '{:?}' as successor of '{:?}'",
                    hier.name,
                    next.typ,
                    level.typ
                );
            }
        }
        let allowed = allowed_sort_fields(level.typ);
        for entry in &level.sort {
            let (_, name) = super::split_sort(entry);
            let field = SortField::from_name(name)
                .ok_or_else(|| anyhow!("'{entry}' is no valid sort field"))?;
            if !allowed.contains(&field) {
                bail!(
                    "hierarchy level '{:?}' cannot be sorted by '{}'",
                    level.typ,
                    name
                );
            }
        }
    }

    Ok(())
}

fn validate_dir(dir: &Path, name: &str) -> Result<()> {
    if dir.as_os_str().is_empty() {
        bail!("no {name} maintained");
    }
    let md = std::fs::metadata(dir)
        .map_err(|e| anyhow!("cannot check if {name} '{}' exists: {e}", dir.display()))?;
    if !md.is_dir() {
        bail!("{name} '{}' is not a directory", dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn config_with(dir: &Path, hierarchies: &str) -> Config {
        let raw = format!(
            r#"{{
                "content": {{"music_dirs": ["{}"], "update_mode": "scan",
                            "update_interval": 60, "hierarchies": {hierarchies}}},
                "upnp": {{"port": 8008, "server_name": "t", "max_age": 1800,
                         "status_file": "/tmp/s.json"}}
            }}"#,
            dir.display()
        );
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn accepts_valid_hierarchy() {
        let dir = tempdir().unwrap();
        let mut cfg = config_with(
            dir.path(),
            r#"[{"name": "Genre", "levels": [
                {"type": "genre"},
                {"type": "album", "sort": ["+title"]},
                {"type": "track", "sort": ["+trackNo"]}]}]"#,
        );
        cfg.validate().unwrap();
        assert!(!cfg.upnp.udn.is_empty());
    }

    #[test]
    fn rejects_hierarchy_not_ending_in_track() {
        let dir = tempdir().unwrap();
        let mut cfg = config_with(
            dir.path(),
            r#"[{"name": "Bad", "levels": [{"type": "genre"}, {"type": "album"}]}]"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_invalid_successor() {
        let dir = tempdir().unwrap();
        let mut cfg = config_with(
            dir.path(),
            r#"[{"name": "Bad", "levels": [
                {"type": "albumartist"}, {"type": "track"}]}]"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_sort_field_on_genre_level() {
        let dir = tempdir().unwrap();
        let mut cfg = config_with(
            dir.path(),
            r#"[{"name": "Bad", "levels": [
                {"type": "genre", "sort": ["+title"]}, {"type": "track"}]}]"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_nested_music_dirs() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let raw = format!(
            r#"{{
                "content": {{"music_dirs": ["{}", "{}"], "update_mode": "scan",
                            "update_interval": 60,
                            "hierarchies": [{{"name": "H", "levels": [{{"type": "track"}}]}}]}},
                "upnp": {{"port": 8008, "server_name": "t", "max_age": 1800,
                         "status_file": "/tmp/s.json"}}
            }}"#,
            dir.path().display(),
            sub.display()
        );
        let mut cfg: Config = serde_json::from_str(&raw).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_udn() {
        let dir = tempdir().unwrap();
        let mut cfg = config_with(
            dir.path(),
            r#"[{"name": "H", "levels": [{"type": "track"}]}]"#,
        );
        cfg.upnp.udn = "not-a-uuid".to_string();
        assert!(cfg.validate().is_err());
    }
}
