//! Address model for the federation.
//!
//! A [`NodePath`] names one entry anywhere in the federation: a [`MountPoint`]
//! identifying the file system level plus a [`NodeName`] inside that level.
//! Addresses use the syntax `scheme:...:location!/entry!/entry`, outermost
//! scheme first, with one `scheme:` prefix and one `!/entry` suffix per
//! nested archive.
//!
//! Parsing is pure: nothing here touches storage.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use crate::error::{FsError, FsResult};

/// Separator between an archive file's address and an entry inside it.
pub const ARCHIVE_SEPARATOR: &str = "!/";

fn invalid(address: &str, reason: impl Into<String>) -> FsError {
    FsError::InvalidAddress {
        address: address.to_string(),
        reason: reason.into(),
    }
}

/// Resolves `.` and `..` segments and drops empty ones.
///
/// Fails if a `..` would climb above the first segment.
fn normalize_segments<'a>(address: &str, raw: impl Iterator<Item = &'a str>) -> FsResult<Vec<&'a str>> {
    let mut out: Vec<&str> = Vec::new();
    for seg in raw {
        match seg {
            "" | "." => {}
            ".." => {
                if out.pop().is_none() {
                    return Err(invalid(address, "path escapes its root"));
                }
            }
            s => out.push(s),
        }
    }
    Ok(out)
}

/// A normalized, relative entry name inside one file system level.
///
/// The empty name denotes the root directory of the level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeName(String);

impl NodeName {
    /// The root directory of a file system level.
    pub const ROOT: NodeName = NodeName(String::new());

    /// Parses and normalizes a relative entry name.
    pub fn new(name: &str) -> FsResult<Self> {
        if name.starts_with('/') {
            return Err(invalid(name, "entry names must be relative"));
        }
        if name.contains(ARCHIVE_SEPARATOR) {
            return Err(invalid(name, "entry names must not contain '!/'"));
        }
        let segments = normalize_segments(name, name.split('/'))?;
        Ok(NodeName(segments.join("/")))
    }

    /// Returns the canonical text of this name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this is the root directory name.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the `/`-separated segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// The last segment, or the empty string for the root.
    pub fn base_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// The enclosing directory name; `None` for the root.
    pub fn parent(&self) -> Option<NodeName> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(idx) => Some(NodeName(self.0[..idx].to_string())),
            None => Some(NodeName::ROOT),
        }
    }

    /// Appends a relative name, normalizing the result.
    pub fn join(&self, child: &str) -> FsResult<NodeName> {
        if self.is_root() {
            NodeName::new(child)
        } else {
            NodeName::new(&format!("{}/{}", self.0, child))
        }
    }

    /// Returns true if `self` lies strictly below `dir`.
    pub fn is_within(&self, dir: &NodeName) -> bool {
        if dir.is_root() {
            return !self.is_root();
        }
        self.0.len() > dir.0.len()
            && self.0.starts_with(dir.as_str())
            && self.0.as_bytes()[dir.0.len()] == b'/'
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeName {
    type Err = FsError;

    fn from_str(s: &str) -> FsResult<Self> {
        NodeName::new(s)
    }
}

/// Splits `scheme:rest`, validating and lower-casing the scheme.
fn split_scheme(address: &str) -> FsResult<(String, &str)> {
    let Some((scheme, rest)) = address.split_once(':') else {
        return Err(invalid(address, "missing scheme"));
    };
    let mut chars = scheme.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !valid {
        return Err(invalid(address, format!("invalid scheme {:?}", scheme)));
    }
    if rest.is_empty() {
        return Err(invalid(address, "missing location"));
    }
    Ok((scheme.to_ascii_lowercase(), rest))
}

/// Identifies one file system level in the federation.
///
/// A hierarchical mount point (`file:/tmp/x/`) names a directory of a
/// non-archive file system and has no parent. A nested mount point
/// (`pack:file:/tmp/x/a.pack!/`) names the archive whose content is the
/// parent entry.
#[derive(Debug, Clone)]
pub struct MountPoint {
    scheme: String,
    uri: String,
    kind: MountKind,
}

#[derive(Debug, Clone)]
enum MountKind {
    Hierarchical { dir: String },
    Nested { parent: Box<NodePath> },
}

impl MountPoint {
    /// A hierarchical mount point for an absolute directory path.
    pub fn hierarchical(scheme: &str, dir: &str) -> FsResult<Self> {
        let address = format!("{}:{}", scheme, dir);
        let (scheme, path) = split_scheme(&address)?;
        if !path.starts_with('/') {
            return Err(invalid(&address, "hierarchical locations must be absolute"));
        }
        let segments = normalize_segments(&address, path.split('/'))?;
        let dir = if segments.is_empty() {
            "/".to_string()
        } else {
            format!("/{}/", segments.join("/"))
        };
        Ok(MountPoint {
            uri: format!("{}:{}", scheme, dir),
            scheme,
            kind: MountKind::Hierarchical { dir },
        })
    }

    /// A mount point for the archive stored in `parent`.
    pub fn nested(scheme: &str, parent: NodePath) -> FsResult<Self> {
        let address = format!("{}:{}{}", scheme, parent, ARCHIVE_SEPARATOR);
        let (scheme, _) = split_scheme(&address)?;
        if parent.name().is_root() {
            return Err(invalid(&address, "an archive must be stored in a file entry"));
        }
        Ok(MountPoint {
            uri: format!("{}:{}{}", scheme, parent, ARCHIVE_SEPARATOR),
            scheme,
            kind: MountKind::Nested {
                parent: Box::new(parent),
            },
        })
    }

    /// Parses a mount point address; it must denote a level root.
    pub fn parse(address: &str) -> FsResult<Self> {
        let path = NodePath::parse(address)?;
        if !path.name().is_root() {
            return Err(invalid(address, "mount point addresses must end with '/' or '!/'"));
        }
        Ok(path.mount_point)
    }

    /// The driver scheme of this level.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The entry whose content is this archive, if nested.
    pub fn parent(&self) -> Option<&NodePath> {
        match &self.kind {
            MountKind::Hierarchical { .. } => None,
            MountKind::Nested { parent } => Some(parent),
        }
    }

    /// The mount point of the parent entry, if nested.
    pub fn parent_mount_point(&self) -> Option<&MountPoint> {
        self.parent().map(NodePath::mount_point)
    }

    /// Number of enclosing archive levels; hierarchical roots have depth 0.
    pub fn depth(&self) -> usize {
        match &self.kind {
            MountKind::Hierarchical { .. } => 0,
            MountKind::Nested { parent } => parent.mount_point().depth() + 1,
        }
    }

    /// The host directory of a hierarchical mount point.
    pub fn host_dir(&self) -> Option<PathBuf> {
        match &self.kind {
            MountKind::Hierarchical { dir } => Some(PathBuf::from(dir)),
            MountKind::Nested { .. } => None,
        }
    }

    /// Returns true if this mount point is nested, directly or not, in `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &MountPoint) -> bool {
        let mut current = self.parent_mount_point();
        while let Some(mp) = current {
            if mp == ancestor {
                return true;
            }
            current = mp.parent_mount_point();
        }
        false
    }

    /// Resolves a name in this level to a canonical node path.
    pub fn resolve(&self, name: &NodeName) -> FsResult<NodePath> {
        match &self.kind {
            MountKind::Nested { .. } => Ok(NodePath {
                mount_point: self.clone(),
                name: name.clone(),
            }),
            // A multi-segment name moves the split point into a deeper directory.
            MountKind::Hierarchical { .. } => NodePath::parse(&format!("{}{}", self.uri, name)),
        }
    }

    /// The canonical address text.
    pub fn as_str(&self) -> &str {
        &self.uri
    }
}

impl PartialEq for MountPoint {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

impl Eq for MountPoint {}

impl Hash for MountPoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
    }
}

impl PartialOrd for MountPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MountPoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.uri.cmp(&other.uri)
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

impl FromStr for MountPoint {
    type Err = FsError;

    fn from_str(s: &str) -> FsResult<Self> {
        MountPoint::parse(s)
    }
}

/// The fully qualified address of one entry in the federation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePath {
    mount_point: MountPoint,
    name: NodeName,
}

impl NodePath {
    /// Binds a name to a mount point.
    ///
    /// In a hierarchical level a multi-segment name moves the split point
    /// into its directory, so paths with the same address compare equal.
    pub fn new(mount_point: MountPoint, name: NodeName) -> FsResult<Self> {
        mount_point.resolve(&name)
    }

    /// Parses and canonicalizes a federated address.
    pub fn parse(address: &str) -> FsResult<Self> {
        if let Some(idx) = address.rfind(ARCHIVE_SEPARATOR) {
            let outer = &address[..idx];
            let name = NodeName::new(&address[idx + ARCHIVE_SEPARATOR.len()..])?;
            let (scheme, inner) = split_scheme(outer)?;
            let parent = NodePath::parse(inner)?;
            let mount_point = MountPoint::nested(&scheme, parent)?;
            return Ok(NodePath { mount_point, name });
        }

        let (scheme, path) = split_scheme(address)?;
        if !path.starts_with('/') {
            return Err(invalid(address, "hierarchical locations must be absolute"));
        }
        let directory_form = path.ends_with('/') || path.ends_with("/.") || path.ends_with("/..");
        let mut segments = normalize_segments(address, path.split('/'))?;
        let base = if directory_form { None } else { segments.pop() };
        let dir = if segments.is_empty() {
            "/".to_string()
        } else {
            format!("/{}/", segments.join("/"))
        };
        let mount_point = MountPoint::hierarchical(&scheme, &dir)?;
        let name = match base {
            Some(b) => NodeName::new(b)?,
            None => NodeName::ROOT,
        };
        Ok(NodePath { mount_point, name })
    }

    /// The file system level containing this entry.
    pub fn mount_point(&self) -> &MountPoint {
        &self.mount_point
    }

    /// The entry name inside its level.
    pub fn name(&self) -> &NodeName {
        &self.name
    }

    /// Resolves a relative name below this path.
    pub fn join(&self, child: &str) -> FsResult<NodePath> {
        self.mount_point.resolve(&self.name.join(child)?)
    }

    /// Canonical form; parsing the display form again yields an equal value.
    pub fn canonicalize(&self) -> FsResult<NodePath> {
        NodePath::parse(&self.to_string())
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.mount_point, self.name)
    }
}

impl FromStr for NodePath {
    type Err = FsError;

    fn from_str(s: &str) -> FsResult<Self> {
        NodePath::parse(s)
    }
}

/// Maps host paths onto federated addresses by archive file extension.
#[derive(Debug, Clone, Default)]
pub struct ArchiveDetector {
    extensions: Vec<(String, String)>,
}

impl ArchiveDetector {
    /// Creates a detector with no archive extensions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Treats files ending in `.{extension}` as archives of `scheme`.
    pub fn with_extension(mut self, extension: &str, scheme: &str) -> Self {
        self.extensions
            .push((extension.to_ascii_lowercase(), scheme.to_ascii_lowercase()));
        self
    }

    /// Returns the archive scheme for a file name, if it has a known extension.
    pub fn detect(&self, file_name: &str) -> Option<&str> {
        let (stem, ext) = file_name.rsplit_once('.')?;
        if stem.is_empty() {
            return None;
        }
        let ext = ext.to_ascii_lowercase();
        self.extensions
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, s)| s.as_str())
    }

    /// Converts an absolute host path into a federated node path.
    ///
    /// Every path component with an archive extension opens a new level, so
    /// `/t/a.pack/in.pack/c.txt` becomes `pack:pack:file:/t/a.pack!/in.pack!/c.txt`.
    pub fn resolve(&self, host_path: &Path) -> FsResult<NodePath> {
        let shown = host_path.display().to_string();
        if !host_path.is_absolute() {
            return Err(invalid(&shown, "host paths must be absolute"));
        }
        let mut raw = Vec::new();
        for component in host_path.components() {
            match component {
                Component::Normal(s) => match s.to_str() {
                    Some(s) => raw.push(s),
                    None => return Err(invalid(&shown, "host path is not valid UTF-8")),
                },
                Component::CurDir => raw.push("."),
                Component::ParentDir => raw.push(".."),
                Component::RootDir | Component::Prefix(_) => {}
            }
        }
        let segments = normalize_segments(&shown, raw.into_iter())?;

        let mut base = "file:/".to_string();
        let mut pending: Vec<&str> = Vec::new();
        for seg in segments {
            pending.push(seg);
            if let Some(scheme) = self.detect(seg) {
                base = format!("{}:{}{}{}", scheme, base, pending.join("/"), ARCHIVE_SEPARATOR);
                pending.clear();
            }
        }
        NodePath::parse(&format!("{}{}", base, pending.join("/")))
    }
}
