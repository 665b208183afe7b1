//! VODFS: a read-only [FUSE] filesystem that surfaces the catalog's movies
//! and series episodes under Plex-compliant paths, feeding reads through the
//! [`Materializer`] with progressive-read semantics.
//!
//! Nodes never walk a parent pointer: the tree below is rebuilt from a fresh
//! [`Catalog`] snapshot on every `lookup`/`readdir`, keyed by a flat
//! `ino -> Node` map plus a `parent -> children` index, so there is nothing
//! resembling a cyclic node graph to manage.
//!
//! [FUSE]: https://github.com/libfuse/libfuse

use std::{
    collections::HashMap,
    ffi::OsStr,
    hash::{Hash, Hasher},
    path::Path,
    time::{Duration, Instant, SystemTime},
};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry, ReplyOpen,
    Request,
};
use libc::{EIO, ENOENT};

use crate::{
    catalog::{Catalog, Store},
    materializer::Materializer,
};

/// Root inode, per FUSE convention.
const ROOT_INO: u64 = 1;
/// Entry/attribute cache TTL: short, so catalog refreshes are visible
/// quickly.
const ATTR_TTL: Duration = Duration::from_secs(1);
/// How long [`Filesystem::read`] polls the progressive path before falling
/// back to waiting on full materialization.
const PROGRESSIVE_POLL_BUDGET: Duration = Duration::from_secs(2);
const PROGRESSIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Placeholder size reported by `getattr` before a cache file exists, chosen
/// non-zero so naive directory scanners don't skip the entry.
const PLACEHOLDER_SIZE: u64 = 1;

/// Which catalog entity a node's stable key identifies, folded into one
/// 64-bit inode via [`stable_ino`].
#[derive(Debug, Clone)]
enum Node {
    Root,
    MoviesDir,
    TvDir,
    MovieDir,
    SeriesDir,
    SeasonDir,
    MovieFile { asset_id: String, stream_url: String },
    EpisodeFile { asset_id: String, stream_url: String },
}

impl Node {
    fn file_type(&self) -> FileType {
        match self {
            Node::MovieFile { .. } | Node::EpisodeFile { .. } => FileType::RegularFile,
            _ => FileType::Directory,
        }
    }
}

/// Replaces `/` with `" - "`, strips NUL bytes, and falls back to `"_"` for
/// an empty result, matching Plex's naming rule.
#[must_use]
fn plex_sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != '\0')
        .collect::<String>()
        .replace('/', " - ");
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Builds the `Title (Year)` (or just `Title` when `year` is absent) display
/// name Plex expects for a movie folder/file or a series folder.
#[must_use]
fn title_year_name(title: &str, year: Option<u16>) -> String {
    let title = plex_sanitize(title);
    match year {
        Some(y) => format!("{title} ({y})"),
        None => title,
    }
}

/// Extensions the materializer may produce directly from the source URL
/// without going through the HLS-to-MP4 pipeline.
const PRESERVED_EXTENSIONS: [&str; 7] = ["mp4", "m4v", "mkv", "webm", "mov", "avi", "ts"];

/// Picks the file extension for a materialized asset: the source URL's
/// extension when it is one we pass straight through, otherwise `mp4`
/// (since `.m3u8` and unrecognized extensions are written as MP4 by the HLS
/// pipeline).
#[must_use]
fn ext_for_url(stream_url: &str) -> &'static str {
    let ext = Path::new(stream_url)
        .extension()
        .and_then(OsStr::to_str)
        .unwrap_or_default()
        .to_ascii_lowercase();
    match PRESERVED_EXTENSIONS.iter().find(|e| **e == ext) {
        Some(e) => e,
        None => "mp4",
    }
}

/// `"Season NN"`, zero-padded to two digits (three for triple-digit
/// seasons, matching Plex's own behavior).
#[must_use]
fn season_dir_name(number: u32) -> String {
    format!("Season {number:02}")
}

/// `"<Show (Year)> - sNNeMM - <Episode>.<ext>"`.
#[must_use]
fn episode_file_name(show_display: &str, season_num: u32, episode_num: u32, title: &str, ext: &str) -> String {
    format!(
        "{show_display} - s{season_num:02}e{episode_num:02} - {}.{ext}",
        plex_sanitize(title)
    )
}

/// Disambiguates entries that share the same display name by appending
/// `" [<id>]"` to every entry past (and including) the first collision, so
/// distinct ids sharing a `Title (Year)` still get distinct paths.
fn disambiguate(entries: &mut [(String, String)]) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for (name, _) in entries.iter() {
        *counts.entry(name.clone()).or_insert(0) += 1;
    }
    for (name, id) in entries.iter_mut() {
        if counts.get(name.as_str()).copied().unwrap_or(0) > 1 {
            *name = format!("{name} [{id}]");
        }
    }
}

/// Hashes `key` into a stable, non-reserved 64-bit inode. Deterministic
/// across runs (the same logical entry keeps its inode across catalog
/// refreshes) because [`std::collections::hash_map::DefaultHasher`] uses
/// fixed keys, not per-process randomization.
#[must_use]
fn stable_ino(key: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    let v = hasher.finish();
    if v <= ROOT_INO {
        v + 2
    } else {
        v
    }
}

/// The in-memory tree built fresh from a [`Catalog`] snapshot on every
/// directory/lookup operation.
struct Tree {
    nodes: HashMap<u64, Node>,
    children: HashMap<u64, Vec<(u64, String)>>,
}

impl Tree {
    fn build(catalog: &Catalog) -> Self {
        let mut nodes = HashMap::new();
        let mut children: HashMap<u64, Vec<(u64, String)>> = HashMap::new();

        nodes.insert(ROOT_INO, Node::Root);
        let movies_ino = stable_ino("dir:movies");
        let tv_ino = stable_ino("dir:tv");
        nodes.insert(movies_ino, Node::MoviesDir);
        nodes.insert(tv_ino, Node::TvDir);
        children
            .entry(ROOT_INO)
            .or_default()
            .extend([(movies_ino, "Movies".to_string()), (tv_ino, "TV".to_string())]);

        let mut movie_names: Vec<(String, String)> = catalog
            .movies
            .iter()
            .map(|m| (title_year_name(&m.title, m.year), m.id.clone()))
            .collect();
        disambiguate(&mut movie_names);

        for (movie, (display, _id)) in catalog.movies.iter().zip(movie_names.iter()) {
            let dir_ino = stable_ino(&format!("movie:{}", movie.id));
            nodes.insert(dir_ino, Node::MovieDir);
            children
                .entry(movies_ino)
                .or_default()
                .push((dir_ino, display.clone()));

            let ext = ext_for_url(&movie.stream_url);
            let file_name = format!("{display}.{ext}");
            let file_ino = stable_ino(&format!("file:movie:{}", movie.id));
            nodes.insert(
                file_ino,
                Node::MovieFile {
                    asset_id: movie.id.clone(),
                    stream_url: movie.stream_url.clone(),
                },
            );
            children.entry(dir_ino).or_default().push((file_ino, file_name));
        }

        let mut series_names: Vec<(String, String)> = catalog
            .series
            .iter()
            .map(|s| (title_year_name(&s.title, s.year), s.id.clone()))
            .collect();
        disambiguate(&mut series_names);

        for (series, (display, _id)) in catalog.series.iter().zip(series_names.iter()) {
            let series_ino = stable_ino(&format!("series:{}", series.id));
            nodes.insert(series_ino, Node::SeriesDir);
            children
                .entry(tv_ino)
                .or_default()
                .push((series_ino, display.clone()));

            for season in &series.seasons {
                let season_ino = stable_ino(&format!("season:{}:{}", series.id, season.number));
                nodes.insert(season_ino, Node::SeasonDir);
                let season_name = season_dir_name(season.number);
                children
                    .entry(series_ino)
                    .or_default()
                    .push((season_ino, season_name));

                for ep in &season.episodes {
                    let ext = ext_for_url(&ep.stream_url);
                    let ep_ino = stable_ino(&format!("file:ep:{}", ep.id));
                    let ep_name =
                        episode_file_name(display, season.number, ep.episode_num, &ep.title, ext);
                    nodes.insert(
                        ep_ino,
                        Node::EpisodeFile {
                            asset_id: ep.id.clone(),
                            stream_url: ep.stream_url.clone(),
                        },
                    );
                    children.entry(season_ino).or_default().push((ep_ino, ep_name));
                }
            }
        }

        Self { nodes, children }
    }

    fn lookup_child(&self, parent: u64, name: &str) -> Option<u64> {
        self.children
            .get(&parent)?
            .iter()
            .find(|(_, n)| n == name)
            .map(|(ino, _)| *ino)
    }
}

/// The VODFS filesystem. Cheap to construct; all FUSE-visible state is
/// recomputed from `catalog` on demand.
pub struct VodFs {
    catalog: Store,
    materializer: Materializer,
    rt: tokio::runtime::Handle,
    uid: u32,
    gid: u32,
}

impl VodFs {
    /// Creates a new VODFS view over `catalog`, materializing reads through
    /// `materializer`. Must be constructed from within a Tokio runtime
    /// (its `Handle` is captured for the blocking calls FUSE's sync trait
    /// requires).
    #[must_use]
    pub fn new(catalog: Store, materializer: Materializer) -> Self {
        Self {
            catalog,
            materializer,
            rt: tokio::runtime::Handle::current(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn tree(&self) -> Tree {
        Tree::build(&self.catalog.snapshot())
    }

    fn attr_for(&self, ino: u64, node: &Node) -> FileAttr {
        let now = SystemTime::now();
        let size = match node {
            Node::MovieFile { asset_id, .. } | Node::EpisodeFile { asset_id, .. } => {
                self.known_size(asset_id).unwrap_or(PLACEHOLDER_SIZE)
            }
            _ => 0,
        };
        let kind = node.file_type();
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            perm: if kind == FileType::Directory { 0o555 } else { 0o444 },
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    /// Reports the real size of a materialized (or in-flight) cache file.
    /// Never triggers materialization itself.
    fn known_size(&self, asset_id: &str) -> Option<u64> {
        let final_path = self.materializer.final_path(asset_id);
        if let Ok(meta) = std::fs::metadata(&final_path) {
            if meta.len() > 0 {
                return Some(meta.len());
            }
        }
        let partial_path = self.materializer.partial_path(asset_id);
        std::fs::metadata(&partial_path).ok().map(|m| m.len())
    }
}

impl Filesystem for VodFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };
        let tree = self.tree();
        let Some(ino) = tree.lookup_child(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        let Some(node) = tree.nodes.get(&ino) else {
            reply.error(ENOENT);
            return;
        };
        let attr = self.attr_for(ino, node);
        reply.entry(&ATTR_TTL, &attr, 0);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let tree = self.tree();
        let Some(node) = tree.nodes.get(&ino) else {
            reply.error(ENOENT);
            return;
        };
        let attr = self.attr_for(ino, node);
        reply.attr(&ATTR_TTL, &attr);
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // Direct-I/O: never let the kernel reuse a page-cache copy of a
        // replaced cache file.
        reply.opened(0, fuser::consts::FOPEN_DIRECT_IO as u32);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let tree = self.tree();
        let (asset_id, stream_url) = match tree.nodes.get(&ino) {
            Some(Node::MovieFile { asset_id, stream_url })
            | Some(Node::EpisodeFile { asset_id, stream_url }) => {
                (asset_id.clone(), stream_url.clone())
            }
            _ => {
                reply.error(ENOENT);
                return;
            }
        };

        let offset = offset.max(0) as u64;
        let materializer = self.materializer.clone();
        let data = self.rt.block_on(async move {
            progressive_read(&materializer, &asset_id, &stream_url, offset, size as usize).await
        });

        match data {
            Ok(bytes) => reply.data(&bytes),
            Err(_) => reply.error(EIO),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let tree = self.tree();
        if !tree.nodes.contains_key(&ino) {
            reply.error(ENOENT);
            return;
        }

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ROOT_INO, FileType::Directory, "..".to_string()),
        ];
        if let Some(children) = tree.children.get(&ino) {
            for (child_ino, name) in children {
                let kind = tree
                    .nodes
                    .get(child_ino)
                    .map(Node::file_type)
                    .unwrap_or(FileType::RegularFile);
                entries.push((*child_ino, kind, name.clone()));
            }
        }

        for (i, (child_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(child_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }
}

/// Implements the progressive-read policy: start materialization without
/// waiting for it, poll the partial/final file for
/// up to [`PROGRESSIVE_POLL_BUDGET`], serve from whichever has enough bytes,
/// and otherwise fall back to waiting for full materialization.
async fn progressive_read(
    materializer: &Materializer,
    asset_id: &str,
    stream_url: &str,
    offset: u64,
    size: usize,
) -> std::io::Result<Vec<u8>> {
    let materializer_for_task = materializer.clone();
    let asset_id_owned = asset_id.to_string();
    let stream_url_owned = stream_url.to_string();
    let handle = tokio::spawn(async move {
        materializer_for_task
            .materialize(&asset_id_owned, &stream_url_owned)
            .await
    });

    let final_path = materializer.final_path(asset_id);
    let partial_path = materializer.partial_path(asset_id);
    let deadline = Instant::now() + PROGRESSIVE_POLL_BUDGET;

    loop {
        if let Some(data) = try_read_available(&final_path, offset, size).await {
            handle.abort();
            return Ok(data);
        }
        if let Some(data) = try_read_available(&partial_path, offset, size).await {
            handle.abort();
            return Ok(data);
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(PROGRESSIVE_POLL_INTERVAL).await;
    }

    match handle.await {
        Ok(Ok(path)) => read_at(&path, offset, size)
            .await
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read")),
        _ => Err(std::io::Error::new(std::io::ErrorKind::Other, "materialization failed")),
    }
}

/// Re-opens `path` (so a newly grown `.partial` is picked up) and returns up
/// to `size` bytes starting at `offset`, iff the file is currently large
/// enough to satisfy at least one byte of the request.
async fn try_read_available(path: &Path, offset: u64, size: usize) -> Option<Vec<u8>> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    if meta.len() <= offset {
        return None;
    }
    read_at(path, offset, size).await
}

async fn read_at(path: &Path, offset: u64, size: usize) -> Option<Vec<u8>> {
    use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
    let mut file = tokio::fs::File::open(path).await.ok()?;
    file.seek(std::io::SeekFrom::Start(offset)).await.ok()?;
    let meta = file.metadata().await.ok()?;
    let available = meta.len().saturating_sub(offset);
    let to_read = (size as u64).min(available) as usize;
    let mut buf = vec![0u8; to_read];
    file.read_exact(&mut buf).await.ok()?;
    Some(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::{Episode, Movie, Season, Series};

    #[test]
    fn plex_sanitize_rules() {
        assert_eq!(plex_sanitize("Tom/Jerry"), "Tom - Jerry");
        assert_eq!(plex_sanitize("a\0b"), "ab");
        assert_eq!(plex_sanitize(""), "_");
        assert_eq!(plex_sanitize("\0"), "_");
    }

    #[test]
    fn title_year_formatting() {
        assert_eq!(title_year_name("Up", Some(2009)), "Up (2009)");
        assert_eq!(title_year_name("Up", None), "Up");
    }

    #[test]
    fn extension_selection() {
        assert_eq!(ext_for_url("http://x/a.mkv"), "mkv");
        assert_eq!(ext_for_url("http://x/a.m3u8"), "mp4");
        assert_eq!(ext_for_url("http://x/a"), "mp4");
        assert_eq!(ext_for_url("http://x/a.MP4"), "mp4");
    }

    #[test]
    fn season_and_episode_naming() {
        assert_eq!(season_dir_name(1), "Season 01");
        assert_eq!(
            episode_file_name("Show (2020)", 1, 2, "Pilot", "mp4"),
            "Show (2020) - s01e02 - Pilot.mp4"
        );
    }

    #[test]
    fn disambiguates_collisions_only() {
        let mut entries = vec![
            ("Up (2009)".to_string(), "id1".to_string()),
            ("Up (2009)".to_string(), "id2".to_string()),
            ("Unique (2001)".to_string(), "id3".to_string()),
        ];
        disambiguate(&mut entries);
        assert_eq!(entries[0].0, "Up (2009) [id1]");
        assert_eq!(entries[1].0, "Up (2009) [id2]");
        assert_eq!(entries[2].0, "Unique (2001)");
    }

    #[test]
    fn stable_ino_is_deterministic_and_avoids_root() {
        assert_eq!(stable_ino("movie:1"), stable_ino("movie:1"));
        assert_ne!(stable_ino("movie:1"), stable_ino("movie:2"));
        assert!(stable_ino("movie:1") != ROOT_INO);
    }

    #[test]
    fn tree_builds_plex_skeleton() {
        let mut catalog = Catalog::default();
        catalog.movies.push(Movie {
            id: "m1".into(),
            title: "Up".into(),
            year: Some(2009),
            stream_url: "http://x/up.mp4".into(),
            artwork_url: None,
        });
        catalog.series.push(Series {
            id: "s1".into(),
            title: "Show".into(),
            year: Some(2020),
            seasons: vec![Season {
                number: 1,
                episodes: vec![Episode {
                    id: "e1".into(),
                    season_num: 1,
                    episode_num: 1,
                    title: "Pilot".into(),
                    stream_url: "http://x/e1.mkv".into(),
                }],
            }],
            artwork_url: None,
        });

        let tree = Tree::build(&catalog);
        let movies_ino = stable_ino("dir:movies");
        let tv_ino = stable_ino("dir:tv");
        assert!(tree.lookup_child(ROOT_INO, "Movies") == Some(movies_ino));
        assert!(tree.lookup_child(ROOT_INO, "TV") == Some(tv_ino));

        let movie_dir = tree.lookup_child(movies_ino, "Up (2009)").unwrap();
        assert!(tree.lookup_child(movie_dir, "Up (2009).mp4").is_some());

        let series_dir = tree.lookup_child(tv_ino, "Show (2020)").unwrap();
        let season_dir = tree.lookup_child(series_dir, "Season 01").unwrap();
        assert!(tree
            .lookup_child(season_dir, "Show (2020) - s01e01 - Pilot.mkv")
            .is_some());
    }
}
