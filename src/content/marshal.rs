use std::fmt::Write;

use super::albums::Album;
use super::object::{ContainerKind, ObjId, Object};
use super::tracks::Track;
use super::Content;

pub const DIDL_START: &str = "<DIDL-Lite xmlns:dc=\"http://purl.org/dc/elements/1.1/\" xmlns:upnp=\"urn:schemas-upnp-org:metadata-1-0/upnp/\" xmlns=\"urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/\" xmlns:dlna=\"urn:schemas-dlna-org:metadata-1-0/\">";
pub const DIDL_END: &str = "</DIDL-Lite>";

/// Values of the BrowseFlag argument of the ContentDirectory service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowseMode {
    Metadata,
    DirectChildren,
}

impl BrowseMode {
    pub fn parse(s: &str) -> Option<BrowseMode> {
        match s {
            "BrowseMetadata" => Some(BrowseMode::Metadata),
            "BrowseDirectChildren" => Some(BrowseMode::DirectChildren),
            _ => None,
        }
    }
}

/// XML escape helper.
pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Translates StartingIndex and RequestedCount into the `[first, last)`
/// child index range; a requested count of 0 means "all remaining".
pub fn indices(start: u32, wanted: u32, len: usize) -> (usize, usize) {
    let first = (start as usize).min(len);
    let last = if wanted == 0 {
        len
    } else {
        (first + wanted as usize).min(len)
    };
    (first, last)
}

impl Content {
    /// Marshals an object to its DIDL-Lite fragment. `BrowseMetadata`
    /// yields the element of the object itself, `BrowseDirectChildren` the
    /// concatenated metadata of the children in `[first, last)`.
    pub(crate) fn marshal(
        &self,
        id: ObjId,
        mode: BrowseMode,
        first: usize,
        last: usize,
        out: &mut String,
    ) {
        let Some(obj) = self.objects.get(&id) else {
            return;
        };
        match mode {
            BrowseMode::Metadata => self.marshal_metadata(obj, out),
            BrowseMode::DirectChildren => {
                for child in self
                    .children_in_order(id)
                    .into_iter()
                    .skip(first)
                    .take(last.saturating_sub(first))
                {
                    self.marshal(child, BrowseMode::Metadata, 0, 0, out);
                }
            }
        }
    }

    fn marshal_metadata(&self, obj: &Object, out: &mut String) {
        let parent_id = obj.parent().unwrap_or(ObjId(-1));
        match obj {
            Object::Container(ctr) => {
                self.open_container(obj, parent_id, out);
                match ctr.kind {
                    ContainerKind::Plain => {
                        write_titled_class(&ctr.base.name, "object.container", out);
                    }
                    ContainerKind::Genre => {
                        write_titled_class(
                            &ctr.base.name,
                            "object.container.genre.musicGenre",
                            out,
                        );
                        let _ = write!(
                            out,
                            "<upnp:genre>{}</upnp:genre>",
                            xml_escape(&ctr.base.name)
                        );
                    }
                    ContainerKind::Artist => {
                        write_titled_class(
                            &ctr.base.name,
                            "object.container.person.musicArtist",
                            out,
                        );
                        let _ = write!(
                            out,
                            "<upnp:artist>{}</upnp:artist>",
                            xml_escape(&ctr.base.name)
                        );
                    }
                    ContainerKind::AlbumArtist => {
                        write_titled_class(
                            &ctr.base.name,
                            "object.container.person.musicArtist",
                            out,
                        );
                        let _ = write!(
                            out,
                            "<upnp:artist role=\"albumArtist\">{}</upnp:artist>",
                            xml_escape(&ctr.base.name)
                        );
                    }
                }
                out.push_str("</container>");
            }

            Object::Folder(folder) => {
                self.open_container(obj, parent_id, out);
                write_titled_class(&folder.ctr.base.name, "object.container.storageFolder", out);
                out.push_str("</container>");
            }

            Object::Playlist(pl) => {
                self.open_container(obj, parent_id, out);
                write_titled_class(
                    &pl.ctr.base.name,
                    "object.container.playlistContainer",
                    out,
                );
                out.push_str("</container>");
            }

            Object::Album(album) => {
                self.open_container(obj, parent_id, out);
                self.inner_album(album, out);
                out.push_str("</container>");
            }

            Object::AlbumRef(aref) => {
                self.open_container(obj, parent_id, out);
                if let Some(Object::Album(album)) = self.objects.get(&aref.album) {
                    self.inner_album(album, out);
                }
                out.push_str("</container>");
            }

            Object::Track(track) => {
                let _ = write!(
                    out,
                    "<item id=\"{}\" parentID=\"{}\" restricted=\"1\">",
                    obj.id(),
                    parent_id
                );
                self.inner_track(track, out);
                out.push_str("</item>");
            }

            Object::TrackRef(tref) => {
                let _ = write!(
                    out,
                    "<item id=\"{}\" refID=\"{}\" parentID=\"{}\" restricted=\"1\">",
                    obj.id(),
                    tref.track,
                    parent_id
                );
                if let Some(Object::Track(track)) = self.objects.get(&tref.track) {
                    self.inner_track(track, out);
                }
                out.push_str("</item>");
            }
        }
    }

    fn open_container(&self, obj: &Object, parent_id: ObjId, out: &mut String) {
        let child_count = obj.container().map(|c| c.children.len()).unwrap_or(0);
        let _ = write!(
            out,
            "<container id=\"{}\" parentID=\"{}\" restricted=\"1\" searchable=\"0\" childCount=\"{}\">",
            obj.id(),
            parent_id,
            child_count
        );
    }

    fn inner_album(&self, album: &Album, out: &mut String) {
        let _ = write!(
            out,
            "<dc:title>{}</dc:title>",
            xml_escape(&album.ctr.base.name)
        );
        out.push_str("<upnp:class>object.container.album.musicAlbum</upnp:class>");

        // cover of the first track that has one
        let pic_id = album
            .ctr
            .children
            .ids()
            .filter_map(|id| self.objects.get(&id))
            .filter_map(Object::as_track)
            .find_map(|t| t.pic_id);
        if let Some(pic_id) = pic_id {
            let _ = write!(
                out,
                "<upnp:albumArtURI>{}{}.jpg</upnp:albumArtURI>",
                self.ext_picture_path, pic_id
            );
        }
        if album.year > 0 {
            let _ = write!(out, "<dc:date>{}-06-30</dc:date>", album.year);
        }
        for artist in album.artists.iter().filter(|a| !a.is_empty()) {
            let _ = write!(
                out,
                "<upnp:albumArtist>{}</upnp:albumArtist>",
                xml_escape(artist)
            );
            let _ = write!(
                out,
                "<upnp:artist role=\"albumArtist\">{}</upnp:artist>",
                xml_escape(artist)
            );
        }
        for composer in album.composers.iter().filter(|c| !c.is_empty()) {
            let _ = write!(
                out,
                "<upnp:artist role=\"Composer\">{}</upnp:artist>",
                xml_escape(composer)
            );
        }
    }

    fn inner_track(&self, track: &Track, out: &mut String) {
        let tags = &track.tags;
        let _ = write!(out, "<dc:title>{}</dc:title>", xml_escape(&tags.title));
        out.push_str("<upnp:class>object.item.audioItem.musicTrack</upnp:class>");

        if tags.year > 0 {
            let _ = write!(out, "<dc:date>{}-06-30</dc:date>", tags.year);
        }
        for artist in tags.artists.iter().filter(|a| !a.is_empty()) {
            let _ = write!(out, "<upnp:artist>{}</upnp:artist>", xml_escape(artist));
        }
        for artist in tags.album_artists.iter().filter(|a| !a.is_empty()) {
            let _ = write!(
                out,
                "<upnp:artist role=\"albumArtist\">{}</upnp:artist>",
                xml_escape(artist)
            );
            let _ = write!(
                out,
                "<upnp:albumArtist>{}</upnp:albumArtist>",
                xml_escape(artist)
            );
        }
        for composer in tags.composers.iter().filter(|c| !c.is_empty()) {
            let _ = write!(
                out,
                "<upnp:artist role=\"Composer\">{}</upnp:artist>",
                xml_escape(composer)
            );
        }
        for genre in tags.genres.iter().filter(|g| !g.is_empty()) {
            let _ = write!(out, "<upnp:genre>{}</upnp:genre>", xml_escape(genre));
        }
        if !tags.album.is_empty() {
            let _ = write!(out, "<upnp:album>{}</upnp:album>", xml_escape(&tags.album));
        }
        if tags.track_no > 0 {
            let _ = write!(
                out,
                "<upnp:originalTrackNumber>{}</upnp:originalTrackNumber>",
                tags.track_no
            );
        }
        if let Some(pic_id) = track.pic_id {
            let _ = write!(
                out,
                "<upnp:albumArtURI>{}{}.jpg</upnp:albumArtURI>",
                self.ext_picture_path, pic_id
            );
        }
        let url = if track.is_external() {
            track.path.clone()
        } else {
            format!("{}{}", self.ext_music_path, track.path.trim_start_matches('/'))
        };
        let _ = write!(
            out,
            "<res protocolInfo=\"http-get:*:{}:*\" size=\"{}\">{}</res>",
            xml_escape(&track.mime_type),
            track.size,
            xml_escape(&url)
        );
    }
}

fn write_titled_class(name: &str, class: &str, out: &mut String) {
    let _ = write!(out, "<dc:title>{}</dc:title>", xml_escape(name));
    let _ = write!(out, "<upnp:class>{class}</upnp:class>");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trips() {
        let raw = "AC/DC <& Friends> \"live\"";
        let escaped = xml_escape(raw);
        assert!(!escaped.contains('<'));
        assert!(!escaped.contains('"'));
        let decoded = escaped
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&amp;", "&");
        assert_eq!(decoded, raw);
    }

    #[test]
    fn indices_cover_edge_cases() {
        // requested count 0 means all remaining
        assert_eq!(indices(0, 0, 5), (0, 5));
        assert_eq!(indices(2, 0, 5), (2, 5));
        // range clamped to the number of children
        assert_eq!(indices(2, 10, 5), (2, 5));
        assert_eq!(indices(0, 3, 5), (0, 3));
        // start at the end yields an empty range
        assert_eq!(indices(5, 0, 5), (5, 5));
    }

    #[test]
    fn browse_mode_parses() {
        assert_eq!(BrowseMode::parse("BrowseMetadata"), Some(BrowseMode::Metadata));
        assert_eq!(
            BrowseMode::parse("BrowseDirectChildren"),
            Some(BrowseMode::DirectChildren)
        );
        assert_eq!(BrowseMode::parse("BrowseBoth"), None);
    }
}
