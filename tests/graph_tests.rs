//! End-to-end scenarios against the content graph: hierarchy insertion,
//! ordering, reference handling, cover deduplication and the
//! container-update-id protocol.

use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;

use tonika::config::Config;
use tonika::content::marshal::BrowseMode;
use tonika::content::object::ObjId;
use tonika::content::playlists::M3uEntry;
use tonika::content::tracks::{Pictures, Tags, TrackMeta};
use tonika::content::Content;

const HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn config(raw: &str) -> Arc<Config> {
    Arc::new(serde_json::from_str(raw).unwrap())
}

fn genre_album_track_config(music_dirs: &str, extra: &str) -> Arc<Config> {
    config(&format!(
        r#"{{
            "content": {{
                "music_dirs": {music_dirs},
                "update_mode": "scan",
                "update_interval": 60,
                "hierarchies": [
                    {{"name": "Genre", "levels": [
                        {{"type": "genre"}},
                        {{"type": "album", "sort": ["+year"]}},
                        {{"type": "track", "sort": ["+trackNo"]}}
                    ]}}
                ]{extra}
            }},
            "upnp": {{"port": 8008, "server_name": "test", "max_age": 1800,
                     "status_file": "/tmp/tonika-test-status.json"}}
        }}"#
    ))
}

fn content_with(cfg: Arc<Config>) -> Content {
    Content::new(cfg, Arc::new(Pictures::new()), HOST)
}

fn track_meta(path: &str, title: &str, tags: Tags) -> TrackMeta {
    TrackMeta {
        path: path.to_string(),
        mime_type: "audio/flac".to_string(),
        size: 1000,
        last_change: 100,
        tags: Tags {
            title: title.to_string(),
            ..tags
        },
        picture: None,
    }
}

fn rock_track(path: &str, title: &str, album: &str, track_no: u32) -> TrackMeta {
    track_meta(
        path,
        title,
        Tags {
            album: album.to_string(),
            artists: vec!["Artist".to_string()],
            album_artists: vec!["Artist".to_string()],
            genres: vec!["Rock".to_string()],
            year: 2001,
            track_no,
            ..Tags::default()
        },
    )
}

#[tokio::test]
async fn single_track_single_hierarchy() {
    let mut cnt = content_with(genre_album_track_config(r#"["/m"]"#, ""));

    let mut run = cnt.begin_update();
    cnt.add_track(&mut run, rock_track("/m/a.flac", "T1", "X", 1));
    assert!(run.count() > 0);
    cnt.finish_update(run).await;
    cnt.check_invariants().unwrap();

    let track_id = cnt.track_by_path("/m/a.flac").unwrap();
    assert_eq!(cnt.track_path(track_id).as_deref(), Some("/m/a.flac"));

    // root has exactly the one hierarchy child
    let hiers = cnt.children(ObjId::ROOT);
    assert_eq!(hiers.len(), 1);
    assert_eq!(cnt.name_of(hiers[0]).unwrap(), "Genre");

    // hierarchy -> genre container "Rock"
    let genres = cnt.children(hiers[0]);
    assert_eq!(genres.len(), 1);
    assert_eq!(cnt.name_of(genres[0]).unwrap(), "Rock");

    // genre -> album reference "X" with year sort field
    let albums = cnt.children(genres[0]);
    assert_eq!(albums.len(), 1);
    assert_eq!(cnt.name_of(albums[0]).unwrap(), "X");
    assert_eq!(cnt.sort_fields_of(albums[0]).unwrap(), vec!["2001"]);

    // album reference -> track reference "T1" with padded track number
    let tracks = cnt.children(albums[0]);
    assert_eq!(tracks.len(), 1);
    assert_eq!(cnt.name_of(tracks[0]).unwrap(), "T1");
    assert_eq!(cnt.sort_fields_of(tracks[0]).unwrap(), vec!["0001"]);

    let browse = cnt
        .browse(ObjId::ROOT, BrowseMode::DirectChildren, 0, 0)
        .unwrap();
    assert_eq!(browse.returned, 1);
    assert_eq!(browse.total, 1);
    assert!(browse.didl.contains("<dc:title>Genre</dc:title>"));
}

#[tokio::test]
async fn compilation_albums_split_by_album_artist() {
    let mut cnt = content_with(genre_album_track_config(r#"["/m"]"#, ""));

    let mut run = cnt.begin_update();
    for (path, artist) in [("/m/a.flac", "A"), ("/m/b.flac", "B")] {
        cnt.add_track(
            &mut run,
            track_meta(
                path,
                "T",
                Tags {
                    album: "Best".to_string(),
                    album_artists: vec![artist.to_string()],
                    genres: vec!["Pop".to_string()],
                    year: 1999,
                    compilation: true,
                    track_no: 1,
                    ..Tags::default()
                },
            ),
        );
    }
    cnt.finish_update(run).await;
    cnt.check_invariants().unwrap();

    // the album key depends on the album artists: two distinct albums
    assert_eq!(cnt.num_albums(), 2);

    let hier = cnt.children(ObjId::ROOT)[0];
    let pop = cnt.children(hier)[0];
    let refs = cnt.children(pop);
    assert_eq!(refs.len(), 2);
    for aref in refs {
        assert_eq!(cnt.name_of(aref).unwrap(), "Best");
    }
}

#[tokio::test]
async fn folder_hierarchy_with_two_music_dirs() {
    let cfg = genre_album_track_config(
        r#"["/m1", "/m2"]"#,
        r#", "show_folders": true, "folder_hierarchy_name": "Folders""#,
    );
    let mut cnt = content_with(cfg);

    let mut run = cnt.begin_update();
    cnt.add_track(&mut run, rock_track("/m1/jazz/a.mp3", "A", "X", 1));
    cnt.add_track(&mut run, rock_track("/m2/rock/b.mp3", "B", "Y", 1));
    cnt.finish_update(run).await;
    cnt.check_invariants().unwrap();

    let folders_root = cnt
        .children(ObjId::ROOT)
        .into_iter()
        .find(|&id| cnt.name_of(id).as_deref() == Some("Folders"))
        .unwrap();

    let roots = cnt.children(folders_root);
    assert_eq!(roots.len(), 2);
    let names: Vec<String> = roots.iter().map(|&id| cnt.name_of(id).unwrap()).collect();
    assert!(names.contains(&"/m1".to_string()));
    assert!(names.contains(&"/m2".to_string()));

    for &root in &roots {
        let subs = cnt.children(root);
        assert_eq!(subs.len(), 1);
        let leaves = cnt.children(subs[0]);
        assert_eq!(leaves.len(), 1);
        let sort = cnt.sort_fields_of(leaves[0]).unwrap();
        assert!(sort == vec!["a.mp3"] || sort == vec!["b.mp3"]);
    }
}

#[tokio::test]
async fn identical_covers_are_deduplicated() {
    let pictures = Arc::new(Pictures::new());
    let mut cnt = Content::new(
        genre_album_track_config(r#"["/m"]"#, ""),
        pictures.clone(),
        HOST,
    );

    // two tracks embedding byte-identical cover art
    let img = image::DynamicImage::new_rgb8(64, 64);
    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();

    let mut run = cnt.begin_update();
    for (path, title) in [("/m/a.flac", "A"), ("/m/b.flac", "B")] {
        let mut meta = rock_track(path, title, "X", 1);
        meta.picture = Some(png.clone());
        cnt.add_track(&mut run, meta);
    }
    cnt.finish_update(run).await;

    assert_eq!(pictures.len(), 1);
    let a = cnt.track_by_path("/m/a.flac").unwrap();
    let b = cnt.track_by_path("/m/b.flac").unwrap();
    assert_eq!(cnt.pic_id_of(a), cnt.pic_id_of(b));
    assert!(cnt.pic_id_of(a).is_some());
    assert!(cnt.picture(cnt.pic_id_of(a).unwrap()).is_some());
}

#[tokio::test]
async fn delete_and_re_add_restores_the_tree() {
    let mut cnt = content_with(genre_album_track_config(r#"["/m"]"#, ""));

    let mut run = cnt.begin_update();
    cnt.add_track(&mut run, rock_track("/m/a.flac", "T1", "X", 1));
    cnt.add_track(&mut run, rock_track("/m/b.flac", "T2", "X", 2));
    cnt.finish_update(run).await;
    let before = tree_snapshot(&cnt, ObjId::ROOT);

    let mut run = cnt.begin_update();
    cnt.remove_track(&mut run, "/m/b.flac");
    let removed = cnt.finish_update(run).await;
    assert!(removed > 0);
    cnt.check_invariants().unwrap();

    let mut run = cnt.begin_update();
    cnt.add_track(&mut run, rock_track("/m/b.flac", "T2", "X", 2));
    cnt.finish_update(run).await;
    cnt.check_invariants().unwrap();

    assert_eq!(tree_snapshot(&cnt, ObjId::ROOT), before);
}

#[tokio::test]
async fn removing_last_track_prunes_album_and_branches() {
    let mut cnt = content_with(genre_album_track_config(r#"["/m"]"#, ""));

    let mut run = cnt.begin_update();
    cnt.add_track(&mut run, rock_track("/m/a.flac", "T1", "X", 1));
    cnt.finish_update(run).await;
    assert_eq!(cnt.num_albums(), 1);

    let mut run = cnt.begin_update();
    cnt.remove_track(&mut run, "/m/a.flac");
    cnt.finish_update(run).await;
    cnt.check_invariants().unwrap();

    assert_eq!(cnt.num_tracks(), 0);
    assert_eq!(cnt.num_albums(), 0);
    // the empty genre container is pruned, the hierarchy container stays
    let hier = cnt.children(ObjId::ROOT)[0];
    assert_eq!(cnt.num_children(hier), 0);
}

#[tokio::test]
async fn track_order_follows_padded_numbers() {
    let mut cnt = content_with(genre_album_track_config(r#"["/m"]"#, ""));

    let mut run = cnt.begin_update();
    for (path, title, no) in [
        ("/m/c.flac", "C", 10),
        ("/m/a.flac", "A", 2),
        ("/m/b.flac", "B", 1),
    ] {
        cnt.add_track(&mut run, rock_track(path, title, "X", no));
    }
    cnt.finish_update(run).await;

    let hier = cnt.children(ObjId::ROOT)[0];
    let genre = cnt.children(hier)[0];
    let album = cnt.children(genre)[0];
    let titles: Vec<String> = cnt
        .children(album)
        .iter()
        .map(|&id| cnt.name_of(id).unwrap())
        .collect();
    // without padding the lexicographic order would be "10" < "2"
    assert_eq!(titles, vec!["B", "A", "C"]);
}

#[tokio::test]
async fn browse_slicing_edge_cases() {
    let mut cnt = content_with(genre_album_track_config(r#"["/m"]"#, ""));

    let mut run = cnt.begin_update();
    for i in 0..5 {
        cnt.add_track(
            &mut run,
            rock_track(&format!("/m/t{i}.flac"), &format!("T{i}"), "X", i + 1),
        );
    }
    cnt.finish_update(run).await;

    let hier = cnt.children(ObjId::ROOT)[0];
    let genre = cnt.children(hier)[0];
    let album = cnt.children(genre)[0];

    // requested count 0 returns all children from the start index
    let all = cnt
        .browse(album, BrowseMode::DirectChildren, 1, 0)
        .unwrap();
    assert_eq!(all.returned, 4);
    assert_eq!(all.total, 5);

    // start index == child count returns an empty result
    let empty = cnt
        .browse(album, BrowseMode::DirectChildren, 5, 0)
        .unwrap();
    assert_eq!(empty.returned, 0);
    assert_eq!(empty.total, 5);

    // a window in the middle
    let window = cnt
        .browse(album, BrowseMode::DirectChildren, 1, 2)
        .unwrap();
    assert_eq!(window.returned, 2);

    // browsing children of an item is an invalid argument
    let tref = cnt.children(album)[0];
    assert!(cnt.browse(tref, BrowseMode::DirectChildren, 0, 0).is_err());
    // unknown ids are not found
    assert!(cnt
        .browse(ObjId(99_999), BrowseMode::Metadata, 0, 0)
        .is_err());
}

#[tokio::test]
async fn marshalled_names_survive_entity_decoding() {
    let mut cnt = content_with(genre_album_track_config(r#"["/m"]"#, ""));

    let mut run = cnt.begin_update();
    cnt.add_track(
        &mut run,
        track_meta(
            "/m/a.flac",
            "Rock & Roll <\"live\">",
            Tags {
                album: "X & Y".to_string(),
                genres: vec!["Rock".to_string()],
                album_artists: vec!["A".to_string()],
                year: 2001,
                track_no: 1,
                ..Tags::default()
            },
        ),
    );
    cnt.finish_update(run).await;

    let track_id = cnt.track_by_path("/m/a.flac").unwrap();
    let didl = cnt
        .browse(track_id, BrowseMode::Metadata, 0, 0)
        .unwrap()
        .didl;
    assert!(!didl.contains("Rock & Roll"));
    let decoded = didl
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    assert!(decoded.contains("Rock & Roll <\"live\">"));
    assert!(decoded.contains("X & Y"));
}

#[tokio::test]
async fn track_didl_carries_resource_and_class() {
    let mut cnt = content_with(genre_album_track_config(r#"["/m"]"#, ""));

    let mut run = cnt.begin_update();
    cnt.add_track(&mut run, rock_track("/m/sub/a.flac", "T1", "X", 3));
    cnt.finish_update(run).await;

    let track_id = cnt.track_by_path("/m/sub/a.flac").unwrap();
    let didl = cnt
        .browse(track_id, BrowseMode::Metadata, 0, 0)
        .unwrap()
        .didl;
    assert!(didl.starts_with("<DIDL-Lite"));
    assert!(didl.contains("object.item.audioItem.musicTrack"));
    assert!(didl.contains("protocolInfo=\"http-get:*:audio/flac:*\""));
    assert!(didl.contains("http://127.0.0.1:8008/music/m/sub/a.flac"));
    assert!(didl.contains("<upnp:originalTrackNumber>3</upnp:originalTrackNumber>"));

    // the in-hierarchy occurrence is marshalled as a reference item
    let hier = cnt.children(ObjId::ROOT)[0];
    let genre = cnt.children(hier)[0];
    let album = cnt.children(genre)[0];
    let tref = cnt.children(album)[0];
    let ref_didl = cnt.browse(tref, BrowseMode::Metadata, 0, 0).unwrap().didl;
    assert!(ref_didl.contains(&format!("refID=\"{track_id}\"")));
}

#[tokio::test]
async fn container_update_ids_reflect_changes_and_reset() {
    let mut cnt = content_with(genre_album_track_config(r#"["/m"]"#, ""));
    let hier = cnt.children(ObjId::ROOT)[0];

    let mut run = cnt.begin_update();
    cnt.add_track(&mut run, rock_track("/m/a.flac", "T1", "X", 1));
    cnt.finish_update(run).await;

    let updates = cnt.container_update_ids();
    assert!(!updates.is_empty());
    // flat id,count list with the hierarchy container among the entries
    let parts: Vec<&str> = updates.split(',').collect();
    assert_eq!(parts.len() % 2, 0);
    assert!(parts.chunks(2).any(|c| c[0] == hier.to_string()));
    assert!(cnt.upd_count_of(hier).unwrap() > 0);

    // the service-reset procedure zeroes every container counter
    cnt.reset_ctr_upd_counts();
    assert_eq!(cnt.container_update_ids(), "");
    assert_eq!(cnt.upd_count_of(hier).unwrap(), 0);
    assert_eq!(cnt.upd_count_of(ObjId::ROOT).unwrap(), 0);

    // a fresh apply phase starts a fresh delta map
    let mut run = cnt.begin_update();
    cnt.add_track(&mut run, rock_track("/m/b.flac", "T2", "X", 2));
    cnt.finish_update(run).await;
    assert!(!cnt.container_update_ids().is_empty());
}

#[tokio::test]
async fn scan_of_unchanged_graph_is_empty() {
    use tonika::content::fileinfo::{diff, sort_by_path};

    let mut cnt = content_with(genre_album_track_config(r#"["/m"]"#, ""));
    let mut run = cnt.begin_update();
    cnt.add_track(&mut run, rock_track("/m/a.flac", "T1", "X", 1));
    cnt.finish_update(run).await;

    let mut content_side = cnt.files_by_paths(&[std::path::PathBuf::from("/m")]);
    sort_by_path(&mut content_side);
    // the disk reports exactly the same file with the same timestamp
    let disk_side = content_side.clone();
    let (del, add) = diff(&content_side, &disk_side);
    assert!(del.is_empty());
    assert!(add.is_empty());
}

#[tokio::test]
async fn playlists_preserve_file_order_and_drop_external_orphans() {
    let cfg = genre_album_track_config(
        r#"["/m"]"#,
        r#", "show_playlists": true, "playlist_hierarchy_name": "Playlists""#,
    );
    let mut cnt = content_with(cfg);

    // the playlist references one known local track and one external URL
    let mut run = cnt.begin_update();
    cnt.add_track(&mut run, rock_track("/m/a.flac", "Local", "X", 1));
    let entries = vec![
        M3uEntry {
            location: "http://radio.example/live.mp3".to_string(),
            title: Some("Radio".to_string()),
        },
        M3uEntry {
            location: "/m/a.flac".to_string(),
            title: None,
        },
        M3uEntry {
            location: "/elsewhere/b.flac".to_string(),
            title: None,
        },
    ];
    cnt.add_playlist(&mut run, Path::new("/m/lists/mix.m3u"), 50, &entries);
    cnt.finish_update(run).await;
    cnt.check_invariants().unwrap();

    assert_eq!(cnt.num_playlists(), 1);
    // the external track was created, the out-of-library entry skipped
    let ext = cnt.track_by_path("http://radio.example/live.mp3");
    assert!(ext.is_some());

    let playlists_root = cnt
        .children(ObjId::ROOT)
        .into_iter()
        .find(|&id| cnt.name_of(id).as_deref() == Some("Playlists"))
        .unwrap();
    let lists = cnt.children(playlists_root);
    assert_eq!(lists.len(), 1);
    assert_eq!(cnt.name_of(lists[0]).unwrap(), "mix");

    let items = cnt.children(lists[0]);
    assert_eq!(items.len(), 2);
    // playlist order, not title order: the radio stream comes first
    assert_eq!(cnt.name_of(items[0]).unwrap(), "Radio");
    assert_eq!(cnt.name_of(items[1]).unwrap(), "Local");
    assert_eq!(cnt.sort_fields_of(items[0]).unwrap(), vec!["000000"]);

    // deleting the playlist drops the now-unreferenced external track
    let mut run = cnt.begin_update();
    cnt.remove_playlist(&mut run, Path::new("/m/lists/mix.m3u"));
    cnt.finish_update(run).await;
    cnt.check_invariants().unwrap();

    assert_eq!(cnt.num_playlists(), 0);
    assert!(cnt.track_by_path("http://radio.example/live.mp3").is_none());
    // the local track stays
    assert!(cnt.track_by_path("/m/a.flac").is_some());
}

#[tokio::test]
async fn browse_works_through_the_shared_lock() {
    let cnt = Arc::new(RwLock::new(content_with(genre_album_track_config(
        r#"["/m"]"#,
        "",
    ))));

    {
        let mut guard = cnt.write().await;
        let mut run = guard.begin_update();
        guard.add_track(&mut run, rock_track("/m/a.flac", "T1", "X", 1));
        guard.finish_update(run).await;
    }

    let guard = cnt.read().await;
    let browse = guard
        .browse(ObjId::ROOT, BrowseMode::DirectChildren, 0, 0)
        .unwrap();
    assert_eq!(browse.returned, 1);
}

#[tokio::test]
async fn full_scan_skips_unreadable_tracks_and_builds_playlists() {
    use tonika::content::updater;
    use tonika::state::AppState;
    use tonika::upnp::StateVars;

    let dir = tempfile::tempdir().unwrap();
    // a file with an audio extension but no parseable tags is skipped
    std::fs::write(dir.path().join("bad.mp3"), b"not really audio").unwrap();
    std::fs::write(
        dir.path().join("list.m3u"),
        "#EXTM3U\n#EXTINF:-1, Stream\nhttp://radio.example/s.mp3\nbad.mp3\n",
    )
    .unwrap();

    let cfg = config(&format!(
        r#"{{
            "content": {{
                "music_dirs": ["{}"],
                "update_mode": "scan",
                "update_interval": 60,
                "hierarchies": [
                    {{"name": "Genre", "levels": [
                        {{"type": "genre"}},
                        {{"type": "track", "sort": ["+title"]}}
                    ]}}
                ],
                "show_playlists": true
            }},
            "upnp": {{"port": 8008, "server_name": "test", "max_age": 1800,
                     "status_file": "{}"}}
        }}"#,
        dir.path().display(),
        dir.path().join("status.json").display()
    ));
    let pictures = Arc::new(Pictures::new());
    let state = AppState {
        config: cfg.clone(),
        content: Arc::new(RwLock::new(Content::new(cfg.clone(), pictures.clone(), HOST))),
        pictures,
        vars: Arc::new(StateVars::load(&cfg)),
        host: HOST,
    };

    let (del, add) = updater::full_scan(&state).await.unwrap();
    assert!(del.is_empty());
    assert_eq!(add.len(), 2);

    let count = {
        let mut content = state.content.write().await;
        content.update(&del, &add).await
    };
    assert!(count > 0);

    {
        let content = state.content.read().await;
        content.check_invariants().unwrap();
        // only the external track exists, the unreadable file was skipped
        assert_eq!(content.num_tracks(), 1);
        assert!(content.track_by_path("http://radio.example/s.mp3").is_some());
        assert_eq!(content.num_playlists(), 1);
    }

    // a second scan re-offers only the unreadable file; nothing changes
    let (del2, add2) = updater::full_scan(&state).await.unwrap();
    assert!(del2.is_empty());
    assert_eq!(add2.len(), 1);
    let count2 = {
        let mut content = state.content.write().await;
        content.update(&del2, &add2).await
    };
    assert_eq!(count2, 0);
}

fn tree_snapshot(cnt: &Content, id: ObjId) -> Vec<String> {
    let mut out = Vec::new();
    snapshot_into(cnt, id, 0, &mut out);
    out
}

fn snapshot_into(cnt: &Content, id: ObjId, depth: usize, out: &mut Vec<String>) {
    for child in cnt.children(id) {
        out.push(format!(
            "{}{}|{:?}",
            " ".repeat(depth),
            cnt.name_of(child).unwrap_or_default(),
            cnt.sort_fields_of(child).unwrap_or_default()
        ));
        snapshot_into(cnt, child, depth + 1, out);
    }
}
