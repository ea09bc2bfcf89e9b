//! Wiki tree organization library.
//! Overlays a persistent, user-editable hierarchy on top of a flat catalog of Markdown
//! files: pinning, named groups, nested sub-pages and drag-and-drop reordering.
//! The engine modules (`classify`, `hierarchy`, `moves`, `groups`, `toggles`, `validate`)
//! are pure functions from `(catalog, config, args)` to a new config; scanning and
//! persistence live behind the `storage` traits.

pub mod core {
    use indexmap::{IndexMap, IndexSet};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::{fmt, path::PathBuf, str::FromStr};

    /* ------------------------------ Catalog ------------------------------ */

    /// A heading node of a document outline.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HeadingNode {
        pub text: String,
        /// 1..=6 for ATX headings.
        pub level: u8,
        #[serde(default)]
        pub children: Vec<HeadingNode>,
    }

    /// One discovered Markdown document. Rebuilt on every scan; never mutated by the engine.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct FileDescriptor {
        /// Stable id: the filesystem path.
        pub path: String,
        pub filename: String,
        /// First H1, or the filename stem.
        pub title: String,
        #[serde(default)]
        pub headings: Vec<HeadingNode>,
        #[serde(default)]
        pub link_count: usize,
    }

    impl FileDescriptor {
        pub fn new(path: impl Into<String>, title: impl Into<String>) -> Self {
            let path = path.into();
            let filename = path.rsplit(['/', '\\']).next().unwrap_or_default().to_string();
            Self {
                path,
                filename,
                title: title.into(),
                headings: vec![],
                link_count: 0,
            }
        }
    }

    /* --------------------------- Palette & icons --------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct UnknownName(pub String);

    impl fmt::Display for UnknownName {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "unknown name {:?}", self.0)
        }
    }

    impl std::error::Error for UnknownName {}

    /// Declares a closed catalog of kebab-case names stored as plain JSON strings.
    macro_rules! name_catalog {
        ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
            pub enum $name {
                $($variant),+
            }

            impl $name {
                pub const ALL: &'static [$name] = &[$($name::$variant),+];

                pub fn as_str(self) -> &'static str {
                    match self {
                        $($name::$variant => $text),+
                    }
                }
            }

            impl FromStr for $name {
                type Err = UnknownName;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    match s {
                        $($text => Ok($name::$variant),)+
                        other => Err(UnknownName(other.to_string())),
                    }
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }

            impl Serialize for $name {
                fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                    s.serialize_str(self.as_str())
                }
            }

            impl<'de> Deserialize<'de> for $name {
                fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                    let raw = String::deserialize(d)?;
                    raw.parse().map_err(serde::de::Error::custom)
                }
            }
        };
    }

    name_catalog! {
        /// Fixed highlight palette for files and groups.
        Color {
            Red => "red",
            Orange => "orange",
            Yellow => "yellow",
            Green => "green",
            Blue => "blue",
            Purple => "purple",
            Pink => "pink",
            Gray => "gray",
        }
    }

    name_catalog! {
        /// Fixed icon catalog for files and groups.
        Icon {
            File => "file",
            Book => "book",
            Bookmark => "bookmark",
            Star => "star",
            Heart => "heart",
            Flag => "flag",
            Folder => "folder",
            Code => "code",
            Lightbulb => "lightbulb",
            Archive => "archive",
            Calendar => "calendar",
            Tag => "tag",
        }
    }

    /// Accepts any string and keeps it only if it names a catalog entry.
    fn lenient<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: FromStr,
    {
        let raw = Option::<String>::deserialize(d)?;
        Ok(raw.and_then(|name| match name.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(name = %name, "dropping unknown palette/icon name");
                None
            }
        }))
    }

    /// Ranks are JSON numbers; whole values are written without a fraction.
    mod rank {
        use serde::Serializer;

        pub fn serialize<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
            if value.fract() == 0.0 && value.abs() < 9.0e15 {
                s.serialize_i64(*value as i64)
            } else {
                s.serialize_f64(*value)
            }
        }

        pub fn serialize_opt<S: Serializer>(value: &Option<f64>, s: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serialize(v, s),
                None => s.serialize_none(),
            }
        }
    }

    fn is_false(b: &bool) -> bool {
        !*b
    }

    /* ------------------------------- Overlay ------------------------------- */

    /// Persisted per-file metadata layered over the catalog.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct FileOverlay {
        /// Rank inside the file's current bucket; absent sorts last.
        #[serde(
            default,
            serialize_with = "rank::serialize_opt",
            skip_serializing_if = "Option::is_none"
        )]
        pub order: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub group_id: Option<String>,
        /// Path of the parent file when nested.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub parent_id: Option<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        pub pinned: bool,
        #[serde(default, skip_serializing_if = "is_false")]
        pub favorite: bool,
        #[serde(default, skip_serializing_if = "is_false")]
        pub hidden: bool,
        #[serde(
            default,
            deserialize_with = "lenient",
            skip_serializing_if = "Option::is_none"
        )]
        pub color: Option<Color>,
        #[serde(
            default,
            deserialize_with = "lenient",
            skip_serializing_if = "Option::is_none"
        )]
        pub icon: Option<Icon>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub custom_title: Option<String>,
    }

    impl FileOverlay {
        pub fn rank(&self) -> f64 {
            self.order.unwrap_or(f64::INFINITY)
        }
    }

    /* -------------------------------- Groups -------------------------------- */

    /// A named group. Membership is derived from `FileOverlay::group_id`.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Group {
        pub id: String,
        pub name: String,
        #[serde(
            default,
            deserialize_with = "lenient",
            skip_serializing_if = "Option::is_none"
        )]
        pub icon: Option<Icon>,
        #[serde(
            default,
            deserialize_with = "lenient",
            skip_serializing_if = "Option::is_none"
        )]
        pub color: Option<Color>,
        #[serde(default, serialize_with = "rank::serialize")]
        pub order: f64,
    }

    /* -------------------------------- Config -------------------------------- */

    /// The organization overlay for one working directory.
    ///
    /// The overlay booleans are the only source of truth for pinned/favorite/hidden;
    /// the section lists of the persisted document are derived on save and folded
    /// back in on load.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(from = "ConfigDocument", into = "ConfigDocument")]
    pub struct OrganizationConfig {
        pub files: IndexMap<String, FileOverlay>,
        pub groups: Vec<Group>,
        pub expanded_groups: IndexSet<String>,
        /// Epoch milliseconds of the last persisted mutation.
        pub last_modified: i64,
    }

    impl OrganizationConfig {
        pub fn overlay(&self, path: &str) -> Option<&FileOverlay> {
            self.files.get(path)
        }

        /// Overlay for `path`, created on first use.
        pub fn overlay_mut(&mut self, path: &str) -> &mut FileOverlay {
            self.files.entry(path.to_string()).or_default()
        }

        pub fn rank(&self, path: &str) -> f64 {
            self.overlay(path).map_or(f64::INFINITY, FileOverlay::rank)
        }

        pub fn is_pinned(&self, path: &str) -> bool {
            self.overlay(path).is_some_and(|o| o.pinned)
        }

        pub fn is_favorite(&self, path: &str) -> bool {
            self.overlay(path).is_some_and(|o| o.favorite)
        }

        pub fn is_hidden(&self, path: &str) -> bool {
            self.overlay(path).is_some_and(|o| o.hidden)
        }

        pub fn group(&self, id: &str) -> Option<&Group> {
            self.groups.iter().find(|g| g.id == id)
        }

        pub fn group_mut(&mut self, id: &str) -> Option<&mut Group> {
            self.groups.iter_mut().find(|g| g.id == id)
        }

        /// Groups sorted by their `order`; equal ranks keep document order.
        pub fn groups_in_order(&self) -> Vec<&Group> {
            let mut groups: Vec<&Group> = self.groups.iter().collect();
            groups.sort_by(|a, b| a.order.total_cmp(&b.order));
            groups
        }

        /// Paths whose overlay belongs to `group_id` (whether or not they are nested/hidden).
        pub fn members_of(&self, group_id: &str) -> Vec<&str> {
            self.files
                .iter()
                .filter(|(_, o)| o.group_id.as_deref() == Some(group_id))
                .map(|(p, _)| p.as_str())
                .collect()
        }

        pub fn pinned_files(&self) -> Vec<&str> {
            self.flagged(|o| o.pinned)
        }

        pub fn favorites(&self) -> Vec<&str> {
            self.flagged(|o| o.favorite)
        }

        pub fn hidden_files(&self) -> Vec<&str> {
            self.flagged(|o| o.hidden)
        }

        fn flagged(&self, pred: impl Fn(&FileOverlay) -> bool) -> Vec<&str> {
            self.files
                .iter()
                .filter(|(_, o)| pred(o))
                .map(|(p, _)| p.as_str())
                .collect()
        }
    }

    /* ---------------------------- Wire document ---------------------------- */

    /// Persisted JSON shape, including the redundant section lists.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ConfigDocument {
        #[serde(default)]
        pub files: IndexMap<String, FileOverlay>,
        #[serde(default)]
        pub groups: Vec<Group>,
        #[serde(default)]
        pub pinned_files: Vec<String>,
        #[serde(default)]
        pub favorites: Vec<String>,
        #[serde(default)]
        pub hidden_files: Vec<String>,
        #[serde(default)]
        pub expanded_groups: Vec<String>,
        #[serde(default)]
        pub last_modified: i64,
    }

    impl From<ConfigDocument> for OrganizationConfig {
        fn from(doc: ConfigDocument) -> Self {
            let mut config = OrganizationConfig {
                files: doc.files,
                groups: doc.groups,
                expanded_groups: doc.expanded_groups.into_iter().collect(),
                last_modified: doc.last_modified,
            };
            // Either storage location marks the flag.
            for path in doc.pinned_files {
                config.overlay_mut(&path).pinned = true;
            }
            for path in doc.favorites {
                config.overlay_mut(&path).favorite = true;
            }
            for path in doc.hidden_files {
                config.overlay_mut(&path).hidden = true;
            }
            config
        }
    }

    impl From<OrganizationConfig> for ConfigDocument {
        fn from(config: OrganizationConfig) -> Self {
            let owned = |xs: Vec<&str>| xs.into_iter().map(str::to_string).collect::<Vec<_>>();
            let pinned_files = owned(config.pinned_files());
            let favorites = owned(config.favorites());
            let hidden_files = owned(config.hidden_files());
            ConfigDocument {
                files: config.files,
                groups: config.groups,
                pinned_files,
                favorites,
                hidden_files,
                expanded_groups: config.expanded_groups.into_iter().collect(),
                last_modified: config.last_modified,
            }
        }
    }

    /* ---------------------------- Errors (edges) ---------------------------- */

    /// Failures of the scanning and persistence collaborators. The engine itself
    /// has no error path.
    #[derive(Debug, thiserror::Error)]
    pub enum OrganizeError {
        #[error("{0:?} is not a directory")]
        NotADirectory(PathBuf),
        #[error("scanning {path:?}: {source}")]
        Scan {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("reading {path:?}: {source}")]
        Read {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("writing {path:?}: {source}")]
        Write {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("malformed config {path:?}: {source}")]
        Json {
            path: PathBuf,
            #[source]
            source: serde_json::Error,
        },
    }

}

pub mod validate {
    //! Config normalization. Never fails: degraded input is repaired or ignored.

    use super::core::*;
    use std::collections::HashSet;

    fn non_empty(value: Option<String>) -> Option<String> {
        value.filter(|v| !v.trim().is_empty())
    }

    /// Repair a loaded config: empty references become absent, self-parenting is
    /// dropped, expansion state of deleted groups is forgotten and groups are kept
    /// in rank order. Unresolvable `group_id`/`parent_id` values are kept; readers
    /// treat them as absent.
    pub fn normalize(config: &OrganizationConfig) -> OrganizationConfig {
        let mut next = config.clone();
        for (path, overlay) in next.files.iter_mut() {
            overlay.group_id = non_empty(overlay.group_id.take());
            overlay.custom_title = non_empty(overlay.custom_title.take());
            overlay.parent_id = non_empty(overlay.parent_id.take());
            if overlay.parent_id.as_deref() == Some(path.as_str()) {
                tracing::warn!(path = %path, "file was nested under itself; moving to top level");
                overlay.parent_id = None;
            }
        }
        let known: HashSet<String> = next.groups.iter().map(|g| g.id.clone()).collect();
        next.expanded_groups.retain(|id| known.contains(id));
        next.groups.sort_by(|a, b| a.order.total_cmp(&b.order));
        next
    }

    /// Drop overlays for paths that are no longer in the catalog.
    pub fn prune(catalog: &[FileDescriptor], config: &OrganizationConfig) -> OrganizationConfig {
        let present: HashSet<&str> = catalog.iter().map(|f| f.path.as_str()).collect();
        let mut next = config.clone();
        next.files.retain(|path, _| present.contains(path.as_str()));
        let dropped = config.files.len() - next.files.len();
        if dropped > 0 {
            tracing::debug!(dropped, "pruned overlays of missing files");
        }
        next
    }

}

pub mod classify {
    //! Partition the catalog into top-level buckets.

    use super::core::*;
    use indexmap::IndexMap;
    use std::{
        cmp::Ordering,
        collections::{HashMap, HashSet},
    };

    /// One of the mutually exclusive top-level renderings of a file.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
    #[serde(tag = "kind", content = "id", rename_all = "camelCase")]
    pub enum Bucket {
        Pinned,
        Group(String),
        Ungrouped,
    }

    /// Where a file is rendered.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Placement {
        Hidden,
        /// Only reachable through the parent's child list.
        Nested(String),
        Top(Bucket),
    }

    /// Path lookup over a catalog slice.
    pub struct CatalogIndex<'a> {
        by_path: HashMap<&'a str, &'a FileDescriptor>,
    }

    impl<'a> CatalogIndex<'a> {
        pub fn new(catalog: &'a [FileDescriptor]) -> Self {
            let mut by_path = HashMap::with_capacity(catalog.len());
            for file in catalog {
                by_path.entry(file.path.as_str()).or_insert(file);
            }
            Self { by_path }
        }

        pub fn get(&self, path: &str) -> Option<&'a FileDescriptor> {
            self.by_path.get(path).copied()
        }

        pub fn contains(&self, path: &str) -> bool {
            self.by_path.contains_key(path)
        }

        fn raw_parent<'c>(&self, path: &str, config: &'c OrganizationConfig) -> Option<&'c str> {
            let parent = config.overlay(path)?.parent_id.as_deref()?;
            (!parent.is_empty() && parent != path && self.contains(parent)).then_some(parent)
        }

        /// The parent a file is nested under. Dangling references and files on a
        /// parent cycle have none.
        pub fn parent_of<'c>(&self, path: &str, config: &'c OrganizationConfig) -> Option<&'c str> {
            let parent = self.raw_parent(path, config)?;
            let mut seen = HashSet::from([parent]);
            let mut current = parent;
            while let Some(next) = self.raw_parent(current, config) {
                if next == path {
                    tracing::warn!(path, "parent cycle; showing at top level");
                    return None;
                }
                if !seen.insert(next) {
                    break;
                }
                current = next;
            }
            Some(parent)
        }

        pub fn placement(&self, path: &str, config: &OrganizationConfig) -> Placement {
            if config.is_hidden(path) {
                return Placement::Hidden;
            }
            if let Some(parent) = self.parent_of(path, config) {
                return Placement::Nested(parent.to_string());
            }
            if config.is_pinned(path) {
                return Placement::Top(Bucket::Pinned);
            }
            match config.overlay(path).and_then(|o| o.group_id.as_deref()) {
                Some(id) if config.group(id).is_some() => Placement::Top(Bucket::Group(id.to_string())),
                _ => Placement::Top(Bucket::Ungrouped),
            }
        }

        pub fn bucket_of(&self, path: &str, config: &OrganizationConfig) -> Option<Bucket> {
            match self.placement(path, config) {
                Placement::Top(bucket) => Some(bucket),
                Placement::Hidden | Placement::Nested(_) => None,
            }
        }
    }

    /// Approximates a locale comparison: case-folded first, then exact.
    pub fn compare_titles(a: &str, b: &str) -> Ordering {
        a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b))
    }

    /// Rank ascending (absent last), then title, then path.
    pub fn compare_files(a: &FileDescriptor, b: &FileDescriptor, config: &OrganizationConfig) -> Ordering {
        config
            .rank(&a.path)
            .total_cmp(&config.rank(&b.path))
            .then_with(|| compare_titles(&a.title, &b.title))
            .then_with(|| a.path.cmp(&b.path))
    }

    pub fn sort_files(files: &mut [&FileDescriptor], config: &OrganizationConfig) {
        files.sort_by(|a, b| compare_files(a, b, config));
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Classification<'a> {
        pub pinned: Vec<&'a FileDescriptor>,
        /// Every known group in rank order, including empty ones.
        pub groups: IndexMap<String, Vec<&'a FileDescriptor>>,
        pub ungrouped: Vec<&'a FileDescriptor>,
        /// Hidden files, listed separately for a "show hidden" view.
        pub hidden: Vec<&'a FileDescriptor>,
    }

    impl<'a> Classification<'a> {
        pub fn bucket(&self, bucket: &Bucket) -> &[&'a FileDescriptor] {
            match bucket {
                Bucket::Pinned => &self.pinned,
                Bucket::Ungrouped => &self.ungrouped,
                Bucket::Group(id) => self.groups.get(id).map(Vec::as_slice).unwrap_or(&[]),
            }
        }

        /// Whether `path` is rendered at top level.
        pub fn is_top_level(&self, path: &str) -> bool {
            self.pinned
                .iter()
                .chain(self.ungrouped.iter())
                .chain(self.groups.values().flatten())
                .any(|f| f.path == path)
        }
    }

    pub fn classify<'a>(catalog: &'a [FileDescriptor], config: &OrganizationConfig) -> Classification<'a> {
        let index = CatalogIndex::new(catalog);
        let mut out = Classification::default();
        for group in config.groups_in_order() {
            out.groups.entry(group.id.clone()).or_default();
        }

        for file in catalog {
            match index.placement(&file.path, config) {
                Placement::Hidden => out.hidden.push(file),
                Placement::Nested(_) => {}
                Placement::Top(Bucket::Pinned) => out.pinned.push(file),
                Placement::Top(Bucket::Ungrouped) => out.ungrouped.push(file),
                Placement::Top(Bucket::Group(id)) => out.groups.entry(id).or_default().push(file),
            }
        }

        sort_files(&mut out.pinned, config);
        sort_files(&mut out.ungrouped, config);
        sort_files(&mut out.hidden, config);
        for files in out.groups.values_mut() {
            sort_files(files, config);
        }
        out
    }

    /// Favorited, non-hidden files in title order.
    pub fn favorites<'a>(catalog: &'a [FileDescriptor], config: &OrganizationConfig) -> Vec<&'a FileDescriptor> {
        let mut out: Vec<&FileDescriptor> = catalog
            .iter()
            .filter(|f| config.is_favorite(&f.path) && !config.is_hidden(&f.path))
            .collect();
        out.sort_by(|a, b| compare_titles(&a.title, &b.title).then_with(|| a.path.cmp(&b.path)));
        out
    }

    /// The custom title when set, otherwise the catalog title.
    pub fn display_title<'a>(file: &'a FileDescriptor, config: &'a OrganizationConfig) -> &'a str {
        config
            .overlay(&file.path)
            .and_then(|o| o.custom_title.as_deref())
            .filter(|t| !t.is_empty())
            .unwrap_or(&file.title)
    }

}

pub mod hierarchy {
    //! Nested sub-pages via `FileOverlay::parent_id`.

    use super::classify::{Bucket, CatalogIndex, classify, sort_files};
    use super::core::*;
    use std::collections::{HashMap, HashSet};

    /// Non-hidden children per parent path, each list in bucket sort order.
    /// Built in one pass so tree walks do not rescan the catalog per node.
    pub struct ChildMap<'a> {
        by_parent: HashMap<&'a str, Vec<&'a FileDescriptor>>,
    }

    impl<'a> ChildMap<'a> {
        pub fn new(catalog: &'a [FileDescriptor], config: &OrganizationConfig) -> Self {
            let index = CatalogIndex::new(catalog);
            let mut by_parent: HashMap<&'a str, Vec<&'a FileDescriptor>> = HashMap::new();
            for file in catalog {
                if config.is_hidden(&file.path) {
                    continue;
                }
                if let Some(parent) = index.parent_of(&file.path, config).and_then(|p| index.get(p)) {
                    by_parent.entry(parent.path.as_str()).or_default().push(file);
                }
            }
            for list in by_parent.values_mut() {
                sort_files(list, config);
            }
            Self { by_parent }
        }

        pub fn children(&self, parent: &str) -> &[&'a FileDescriptor] {
            self.by_parent.get(parent).map(Vec::as_slice).unwrap_or(&[])
        }
    }

    /// Direct, non-hidden children of `parent`, in bucket sort order.
    pub fn children<'a>(
        parent: &str,
        catalog: &'a [FileDescriptor],
        config: &OrganizationConfig,
    ) -> Vec<&'a FileDescriptor> {
        ChildMap::new(catalog, config).children(parent).to_vec()
    }

    /// All descendants of `root` in depth-first order. A revisited id ends that branch.
    pub fn descendants<'a>(
        root: &str,
        catalog: &'a [FileDescriptor],
        config: &OrganizationConfig,
    ) -> Vec<&'a FileDescriptor> {
        let map = ChildMap::new(catalog, config);
        let mut visited = HashSet::from([root]);
        let mut out = Vec::new();
        let mut stack: Vec<&FileDescriptor> = map.children(root).iter().rev().copied().collect();
        while let Some(file) = stack.pop() {
            if !visited.insert(file.path.as_str()) {
                continue;
            }
            out.push(file);
            stack.extend(map.children(&file.path).iter().rev().copied());
        }
        out
    }

    /// Whether `ancestor` appears on the parent chain of `path`.
    pub fn is_ancestor(
        ancestor: &str,
        path: &str,
        catalog: &[FileDescriptor],
        config: &OrganizationConfig,
    ) -> bool {
        let index = CatalogIndex::new(catalog);
        let mut visited = HashSet::new();
        let mut current = path;
        while let Some(parent) = index.parent_of(current, config) {
            if parent == ancestor {
                return true;
            }
            if !visited.insert(parent) {
                tracing::warn!(path = %path, "parent chain contains a cycle");
                return false;
            }
            current = parent;
        }
        false
    }

    /// A rendered node with its nested children.
    #[derive(Debug, Clone, PartialEq, serde::Serialize)]
    pub struct TreeNode<'a> {
        pub file: &'a FileDescriptor,
        pub children: Vec<TreeNode<'a>>,
    }

    fn build<'a>(file: &'a FileDescriptor, map: &ChildMap<'a>, visited: &mut HashSet<&'a str>) -> TreeNode<'a> {
        visited.insert(&file.path);
        let mut children = Vec::new();
        for &child in map.children(&file.path) {
            if visited.contains(child.path.as_str()) {
                continue;
            }
            children.push(build(child, map, visited));
        }
        TreeNode { file, children }
    }

    fn subtrees_in<'a>(roots: &[&'a FileDescriptor], map: &ChildMap<'a>) -> Vec<TreeNode<'a>> {
        let mut visited = HashSet::new();
        roots.iter().map(|&f| build(f, map, &mut visited)).collect()
    }

    /// Expand a list of top-level files into their nested subtrees.
    pub fn subtrees<'a>(
        roots: &[&'a FileDescriptor],
        catalog: &'a [FileDescriptor],
        config: &OrganizationConfig,
    ) -> Vec<TreeNode<'a>> {
        subtrees_in(roots, &ChildMap::new(catalog, config))
    }

    /// The whole organized tree: every top-level bucket with nested subtrees.
    #[derive(Debug, Clone, PartialEq, serde::Serialize)]
    pub struct OrganizedTree<'a> {
        pub pinned: Vec<TreeNode<'a>>,
        pub groups: Vec<(&'a Group, Vec<TreeNode<'a>>)>,
        pub ungrouped: Vec<TreeNode<'a>>,
    }

    pub fn organized_tree<'a>(catalog: &'a [FileDescriptor], config: &'a OrganizationConfig) -> OrganizedTree<'a> {
        let classes = classify(catalog, config);
        let map = ChildMap::new(catalog, config);
        let groups = config
            .groups_in_order()
            .into_iter()
            .map(|g| (g, subtrees_in(classes.bucket(&Bucket::Group(g.id.clone())), &map)))
            .collect();
        OrganizedTree {
            pinned: subtrees_in(&classes.pinned, &map),
            groups,
            ungrouped: subtrees_in(&classes.ungrouped, &map),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn paths(files: &[&FileDescriptor]) -> Vec<String> {
            files.iter().map(|f| f.path.clone()).collect()
        }

        fn catalog() -> Vec<FileDescriptor> {
            ["a", "b", "c", "d"]
                .into_iter()
                .map(|n| FileDescriptor::new(format!("{n}.md"), n.to_uppercase()))
                .collect()
        }

        #[test]
        fn children_are_sorted_and_skip_hidden() {
            let catalog = catalog();
            let mut config = OrganizationConfig::default();
            for path in ["b.md", "c.md", "d.md"] {
                config.overlay_mut(path).parent_id = Some("a.md".into());
            }
            config.overlay_mut("c.md").order = Some(0.0);
            config.overlay_mut("d.md").hidden = true;

            assert_eq!(paths(&children("a.md", &catalog, &config)), ["c.md", "b.md"]);
            assert!(children("b.md", &catalog, &config).is_empty());
        }

        #[test]
        fn descendants_walk_depth_first() {
            let catalog = catalog();
            let mut config = OrganizationConfig::default();
            config.overlay_mut("b.md").parent_id = Some("a.md".into());
            config.overlay_mut("c.md").parent_id = Some("b.md".into());
            config.overlay_mut("d.md").parent_id = Some("a.md".into());

            assert_eq!(paths(&descendants("a.md", &catalog, &config)), ["b.md", "c.md", "d.md"]);
            assert!(is_ancestor("a.md", "c.md", &catalog, &config));
            assert!(!is_ancestor("d.md", "c.md", &catalog, &config));
        }

        #[test]
        fn cycle_members_surface_at_top_level() {
            let catalog = catalog();
            let mut config = OrganizationConfig::default();
            config.overlay_mut("a.md").parent_id = Some("b.md".into());
            config.overlay_mut("b.md").parent_id = Some("a.md".into());
            config.overlay_mut("c.md").parent_id = Some("a.md".into());

            assert_eq!(paths(&children("a.md", &catalog, &config)), ["c.md"]);
            assert_eq!(paths(&descendants("b.md", &catalog, &config)), Vec::<String>::new());
            assert!(!is_ancestor("b.md", "a.md", &catalog, &config));
            assert!(is_ancestor("a.md", "c.md", &catalog, &config));

            let tree = organized_tree(&catalog, &config);
            let top: Vec<&str> = tree.ungrouped.iter().map(|n| n.file.path.as_str()).collect();
            assert_eq!(top, ["a.md", "b.md", "d.md"]);
            assert_eq!(tree.ungrouped[0].children[0].file.path, "c.md");
        }

        #[test]
        fn child_map_matches_per_parent_queries() {
            let catalog: Vec<FileDescriptor> = (0..300)
                .map(|i| FileDescriptor::new(format!("f{i:03}.md"), format!("F{i:03}")))
                .collect();
            let mut config = OrganizationConfig::default();
            // f000 holds f001..f099 directly; every later file hangs under the one before it.
            for i in 1..100 {
                config.overlay_mut(&format!("f{i:03}.md")).parent_id = Some("f000.md".into());
            }
            for i in 100..300 {
                config.overlay_mut(&format!("f{i:03}.md")).parent_id = Some(format!("f{:03}.md", i - 1));
            }
            config.overlay_mut("f050.md").hidden = true;
            config.overlay_mut("f007.md").order = Some(0.0);

            let map = ChildMap::new(&catalog, &config);
            let direct = map.children("f000.md");
            assert_eq!(direct.len(), 98);
            assert_eq!(direct[0].path, "f007.md");
            assert_eq!(paths(direct), paths(&children("f000.md", &catalog, &config)));
            assert!(map.children("f299.md").is_empty());

            let all = descendants("f000.md", &catalog, &config);
            assert_eq!(all.len(), 298);
            assert_eq!(all.last().map(|f| f.path.as_str()), Some("f299.md"));

            let tree = organized_tree(&catalog, &config);
            assert_eq!(tree.ungrouped.len(), 1);
            assert_eq!(tree.ungrouped[0].children.len(), 98);
        }

        #[test]
        fn organized_tree_nests_under_buckets() {
            let catalog = catalog();
            let mut config = OrganizationConfig::default();
            config.overlay_mut("a.md").pinned = true;
            config.overlay_mut("b.md").parent_id = Some("a.md".into());

            let tree = organized_tree(&catalog, &config);
            assert_eq!(tree.pinned.len(), 1);
            assert_eq!(tree.pinned[0].children[0].file.path, "b.md");
            assert_eq!(tree.ungrouped.len(), 2);
        }
    }
}

pub mod moves {
    //! Drag-and-drop resolution.
    //!
    //! Dropping `active` onto `target` resolves, first match wins, to:
    //! 1. [`MoveIntent::JoinGroup`] when `target` is a group id;
    //! 2. [`MoveIntent::Reorder`] when both files sit in the same top-level bucket;
    //! 3. [`MoveIntent::Nest`] otherwise.
    //!
    //! Self-drops and ids missing from the catalog resolve to an empty patch, so a
    //! host can forward every drop-end event unchecked.

    use super::classify::{Bucket, CatalogIndex, classify};
    use super::core::*;
    use super::hierarchy::is_ancestor;
    use indexmap::IndexMap;
    use serde::Serialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "kind", rename_all = "camelCase")]
    pub enum MoveIntent {
        /// Leave pin/parent and become the first member of a group.
        JoinGroup { group_id: String },
        /// Take the slot of `target` inside `bucket`; every member gets a dense rank.
        Reorder { bucket: Bucket, target: String },
        /// Become a child of `parent`.
        Nest { parent: String },
    }

    /// Replacement overlays produced by a move. Apply it to the config the move was
    /// resolved against.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct ConfigPatch {
        pub intent: Option<MoveIntent>,
        pub files: IndexMap<String, FileOverlay>,
    }

    impl ConfigPatch {
        pub fn is_empty(&self) -> bool {
            self.files.is_empty()
        }

        pub fn apply(&self, config: &OrganizationConfig) -> OrganizationConfig {
            let mut next = config.clone();
            for (path, overlay) in &self.files {
                next.files.insert(path.clone(), overlay.clone());
            }
            next
        }

        fn single(intent: MoveIntent, path: &str, overlay: FileOverlay) -> Self {
            let mut files = IndexMap::new();
            files.insert(path.to_string(), overlay);
            Self {
                intent: Some(intent),
                files,
            }
        }
    }

    /// Remove the item at `from` and reinsert it at `to`. Out-of-range indices are ignored.
    pub fn array_move<T>(items: &mut Vec<T>, from: usize, to: usize) {
        if from >= items.len() || to >= items.len() || from == to {
            return;
        }
        let item = items.remove(from);
        items.insert(to, item);
    }

    /// Decide what a drop of `active` onto `target` would do, without doing it.
    pub fn plan_move(
        active: &str,
        target: &str,
        catalog: &[FileDescriptor],
        config: &OrganizationConfig,
    ) -> Option<MoveIntent> {
        if active == target {
            return None;
        }
        let index = CatalogIndex::new(catalog);
        if !index.contains(active) {
            return None;
        }
        if config.group(target).is_some() {
            return Some(MoveIntent::JoinGroup {
                group_id: target.to_string(),
            });
        }
        if !index.contains(target) {
            return None;
        }
        match (index.bucket_of(active, config), index.bucket_of(target, config)) {
            (Some(a), Some(b)) if a == b => Some(MoveIntent::Reorder {
                bucket: a,
                target: target.to_string(),
            }),
            _ => Some(MoveIntent::Nest {
                parent: target.to_string(),
            }),
        }
    }

    /// Carry out `intent` for `active`. Intents that no longer fit the current
    /// config yield an empty patch.
    pub fn apply_intent(
        active: &str,
        intent: &MoveIntent,
        catalog: &[FileDescriptor],
        config: &OrganizationConfig,
    ) -> ConfigPatch {
        let index = CatalogIndex::new(catalog);
        if !index.contains(active) {
            return ConfigPatch::default();
        }
        let current = || config.overlay(active).cloned().unwrap_or_default();

        match intent {
            MoveIntent::JoinGroup { group_id } => {
                if config.group(group_id).is_none() {
                    return ConfigPatch::default();
                }
                let mut overlay = current();
                overlay.group_id = Some(group_id.clone());
                overlay.parent_id = None;
                overlay.pinned = false;
                overlay.order = Some(0.0);
                ConfigPatch::single(intent.clone(), active, overlay)
            }
            MoveIntent::Reorder { bucket, target } => {
                let in_bucket = |path: &str| index.bucket_of(path, config).as_ref() == Some(bucket);
                if active == target || !in_bucket(active) || !in_bucket(target) {
                    return ConfigPatch::default();
                }
                let classes = classify(catalog, config);
                let mut ordered: Vec<&str> = classes
                    .bucket(bucket)
                    .iter()
                    .map(|f| f.path.as_str())
                    .collect();
                let from = ordered.iter().position(|p| *p == active);
                let to = ordered.iter().position(|p| *p == target.as_str());
                let (Some(from), Some(to)) = (from, to) else {
                    return ConfigPatch::default();
                };
                array_move(&mut ordered, from, to);

                let mut files = IndexMap::with_capacity(ordered.len());
                for (rank, path) in ordered.into_iter().enumerate() {
                    let mut overlay = config.overlay(path).cloned().unwrap_or_default();
                    overlay.order = Some(rank as f64);
                    files.insert(path.to_string(), overlay);
                }
                ConfigPatch {
                    intent: Some(intent.clone()),
                    files,
                }
            }
            MoveIntent::Nest { parent } => {
                if parent == active || !index.contains(parent) {
                    return ConfigPatch::default();
                }
                if is_ancestor(active, parent, catalog, config) {
                    tracing::warn!(active, parent = %parent, "refusing to nest a file under its own descendant");
                    return ConfigPatch::default();
                }
                let mut overlay = current();
                overlay.parent_id = Some(parent.clone());
                overlay.group_id = None;
                overlay.order = Some(0.0);
                ConfigPatch::single(intent.clone(), active, overlay)
            }
        }
    }

    /// Resolve a drop-end event into a patch.
    pub fn resolve_move(
        active: &str,
        target: &str,
        catalog: &[FileDescriptor],
        config: &OrganizationConfig,
    ) -> ConfigPatch {
        let Some(intent) = plan_move(active, target, catalog, config) else {
            tracing::debug!(active, target, "ignoring drop");
            return ConfigPatch::default();
        };
        tracing::debug!(active, target, ?intent, "resolved drop");
        apply_intent(active, &intent, catalog, config)
    }

    /// Bring a nested file back to the top level of its bucket.
    pub fn unnest(path: &str, config: &OrganizationConfig) -> ConfigPatch {
        match config.overlay(path) {
            Some(o) if o.parent_id.is_some() => {
                let mut overlay = o.clone();
                overlay.parent_id = None;
                ConfigPatch {
                    intent: None,
                    files: IndexMap::from([(path.to_string(), overlay)]),
                }
            }
            _ => ConfigPatch::default(),
        }
    }

    /// Take a file out of its group; it becomes ungrouped.
    pub fn ungroup(path: &str, config: &OrganizationConfig) -> ConfigPatch {
        match config.overlay(path) {
            Some(o) if o.group_id.is_some() => {
                let mut overlay = o.clone();
                overlay.group_id = None;
                ConfigPatch {
                    intent: None,
                    files: IndexMap::from([(path.to_string(), overlay)]),
                }
            }
            _ => ConfigPatch::default(),
        }
    }

}

pub mod groups {
    //! Named groups. Every operation returns a new config; the input is left untouched.

    use super::core::*;
    use super::moves::array_move;
    use chrono::Utc;

    /// Create a group at the end of the group list. The id is time based.
    pub fn create_group(
        config: &OrganizationConfig,
        name: &str,
        icon: Option<Icon>,
        color: Option<Color>,
    ) -> (OrganizationConfig, Group) {
        create_group_at(config, name, icon, color, Utc::now().timestamp_millis())
    }

    /// As [`create_group`], with the clock reading supplied by the caller.
    pub fn create_group_at(
        config: &OrganizationConfig,
        name: &str,
        icon: Option<Icon>,
        color: Option<Color>,
        now_millis: i64,
    ) -> (OrganizationConfig, Group) {
        let mut id = format!("group-{now_millis}");
        let mut suffix = 1;
        while config.group(&id).is_some() {
            id = format!("group-{now_millis}-{suffix}");
            suffix += 1;
        }
        let group = Group {
            id,
            name: name.trim().to_string(),
            icon,
            color,
            order: config.groups.len() as f64,
        };
        let mut next = config.clone();
        next.groups.push(group.clone());
        tracing::debug!(id = %group.id, name = %group.name, "created group");
        (next, group)
    }

    fn with_group(config: &OrganizationConfig, id: &str, f: impl FnOnce(&mut Group)) -> OrganizationConfig {
        let mut next = config.clone();
        match next.group_mut(id) {
            Some(group) => f(group),
            None => tracing::debug!(id, "no such group"),
        }
        next
    }

    pub fn rename_group(config: &OrganizationConfig, id: &str, name: &str) -> OrganizationConfig {
        with_group(config, id, |g| g.name = name.trim().to_string())
    }

    pub fn recolor_group(config: &OrganizationConfig, id: &str, color: Option<Color>) -> OrganizationConfig {
        with_group(config, id, |g| g.color = color)
    }

    pub fn reicon_group(config: &OrganizationConfig, id: &str, icon: Option<Icon>) -> OrganizationConfig {
        with_group(config, id, |g| g.icon = icon)
    }

    /// Remove a group. Its members become ungrouped; no file is hidden or dropped.
    pub fn delete_group(config: &OrganizationConfig, id: &str) -> OrganizationConfig {
        let mut next = config.clone();
        next.groups.retain(|g| g.id != id);
        next.expanded_groups.shift_remove(id);
        let mut released = 0usize;
        for overlay in next.files.values_mut() {
            if overlay.group_id.as_deref() == Some(id) {
                overlay.group_id = None;
                released += 1;
            }
        }
        tracing::debug!(id, released, "deleted group");
        next
    }

    /// Move group `active` into the slot of group `target`; group ranks become dense.
    pub fn move_group(config: &OrganizationConfig, active: &str, target: &str) -> OrganizationConfig {
        let mut ids: Vec<String> = config.groups_in_order().into_iter().map(|g| g.id.clone()).collect();
        let from = ids.iter().position(|id| id == active);
        let to = ids.iter().position(|id| id == target);
        let (Some(from), Some(to)) = (from, to) else {
            return config.clone();
        };
        array_move(&mut ids, from, to);

        let mut next = config.clone();
        for (rank, id) in ids.iter().enumerate() {
            if let Some(group) = next.group_mut(id) {
                group.order = rank as f64;
            }
        }
        next.groups.sort_by(|a, b| a.order.total_cmp(&b.order));
        next
    }

    pub fn set_group_expanded(config: &OrganizationConfig, id: &str, expanded: bool) -> OrganizationConfig {
        let mut next = config.clone();
        if expanded {
            if config.group(id).is_some() {
                next.expanded_groups.insert(id.to_string());
            }
        } else {
            next.expanded_groups.shift_remove(id);
        }
        next
    }

    pub fn toggle_group_expanded(config: &OrganizationConfig, id: &str) -> OrganizationConfig {
        let expanded = config.expanded_groups.contains(id);
        set_group_expanded(config, id, !expanded)
    }

}

pub mod toggles {
    //! Idempotent per-file field setters. None of them touch `order`, `group_id` or
    //! `parent_id`; each creates the overlay on first use.

    use super::core::*;

    fn with_overlay(config: &OrganizationConfig, path: &str, f: impl FnOnce(&mut FileOverlay)) -> OrganizationConfig {
        let mut next = config.clone();
        f(next.overlay_mut(path));
        next
    }

    pub fn pin(config: &OrganizationConfig, path: &str) -> OrganizationConfig {
        with_overlay(config, path, |o| o.pinned = true)
    }

    pub fn unpin(config: &OrganizationConfig, path: &str) -> OrganizationConfig {
        with_overlay(config, path, |o| o.pinned = false)
    }

    pub fn favorite(config: &OrganizationConfig, path: &str) -> OrganizationConfig {
        with_overlay(config, path, |o| o.favorite = true)
    }

    pub fn unfavorite(config: &OrganizationConfig, path: &str) -> OrganizationConfig {
        with_overlay(config, path, |o| o.favorite = false)
    }

    pub fn hide(config: &OrganizationConfig, path: &str) -> OrganizationConfig {
        with_overlay(config, path, |o| o.hidden = true)
    }

    pub fn unhide(config: &OrganizationConfig, path: &str) -> OrganizationConfig {
        with_overlay(config, path, |o| o.hidden = false)
    }

    pub fn set_color(config: &OrganizationConfig, path: &str, color: Option<Color>) -> OrganizationConfig {
        with_overlay(config, path, |o| o.color = color)
    }

    pub fn set_icon(config: &OrganizationConfig, path: &str, icon: Option<Icon>) -> OrganizationConfig {
        with_overlay(config, path, |o| o.icon = icon)
    }

    /// Display-title override; blank clears it. The document itself is not renamed.
    pub fn set_custom_title(config: &OrganizationConfig, path: &str, title: Option<&str>) -> OrganizationConfig {
        let title = title.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string);
        with_overlay(config, path, |o| o.custom_title = title)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn pin_then_unpin_restores_state() {
            let config = OrganizationConfig::default();
            let pinned = pin(&config, "a.md");
            assert!(pinned.is_pinned("a.md"));
            assert_eq!(pinned.pinned_files(), ["a.md"]);

            let restored = unpin(&pinned, "a.md");
            assert_eq!(restored.is_pinned("a.md"), config.is_pinned("a.md"));
            assert_eq!(restored.pinned_files(), config.pinned_files());
        }

        #[test]
        fn setters_are_idempotent_and_keep_placement() {
            let mut config = OrganizationConfig::default();
            {
                let overlay = config.overlay_mut("a.md");
                overlay.order = Some(3.0);
                overlay.group_id = Some("g".into());
                overlay.parent_id = Some("p.md".into());
            }
            let once = hide(&favorite(&config, "a.md"), "a.md");
            let twice = hide(&favorite(&once, "a.md"), "a.md");
            assert_eq!(once, twice);

            let overlay = twice.overlay("a.md").expect("overlay");
            assert_eq!(overlay.order, Some(3.0));
            assert_eq!(overlay.group_id.as_deref(), Some("g"));
            assert_eq!(overlay.parent_id.as_deref(), Some("p.md"));
            assert_eq!(twice.favorites(), ["a.md"]);
            assert_eq!(twice.hidden_files(), ["a.md"]);

            let shown = unhide(&unfavorite(&twice, "a.md"), "a.md");
            assert!(shown.favorites().is_empty());
            assert!(shown.hidden_files().is_empty());
        }

        #[test]
        fn decorations_and_titles() {
            let config = OrganizationConfig::default();
            let next = set_color(&config, "a.md", Some(Color::Purple));
            let next = set_icon(&next, "a.md", Some(Icon::Code));
            let next = set_custom_title(&next, "a.md", Some("  Readme  "));
            let overlay = next.overlay("a.md").expect("overlay");
            assert_eq!(overlay.color, Some(Color::Purple));
            assert_eq!(overlay.icon, Some(Icon::Code));
            assert_eq!(overlay.custom_title.as_deref(), Some("Readme"));

            let cleared = set_custom_title(&next, "a.md", Some("   "));
            assert_eq!(cleared.overlay("a.md").and_then(|o| o.custom_title.clone()), None);
        }
    }
}

pub mod storage {
    use super::core::{FileDescriptor, OrganizationConfig, OrganizeError};
    use std::path::Path;

    /// Enumerates the Markdown documents under a working directory.
    pub trait CatalogProvider {
        fn scan(&self, dir: &Path) -> Result<Vec<FileDescriptor>, OrganizeError>;
    }

    /// Durable load/save of the organization document of a working directory.
    pub trait ConfigStore {
        /// `None` when nothing was saved for `dir` yet.
        fn load(&self, dir: &Path) -> Result<Option<OrganizationConfig>, OrganizeError>;

        fn save(&self, dir: &Path, config: &OrganizationConfig) -> Result<(), OrganizeError>;
    }
}

pub mod catalog {
    //! Markdown catalog built on `nom`.
    //!
    //! Per file we only need a cheap outline: the title (first H1, else the file stem),
    //! the ATX heading forest and a count of outbound links. Fenced code blocks and a
    //! leading YAML front matter block are skipped.

    use super::core::*;
    use super::storage::CatalogProvider;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_until, take_while_m_n, take_while1},
        character::complete::{char, space1},
        sequence::{delimited, preceded, terminated},
    };
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    const SKIPPED_DIRS: &[&str] = &["node_modules", "target"];

    /* ------------------------------- Parsers ------------------------------- */

    /// `## Title ##` → `(2, "Title")`.
    fn atx_heading(line: &str) -> IResult<&str, (u8, &str)> {
        let (rest, hashes) = preceded(
            take_while_m_n(0, 3, |c: char| c == ' '),
            take_while_m_n(1, 6, |c: char| c == '#'),
        )(line)?;
        let (rest, _) = space1(rest)?;
        let text = rest.trim_end();
        // A closing `#` run only counts when it stands alone: `# C#` keeps its hash.
        let unclosed = text.trim_end_matches('#');
        let text = if unclosed.is_empty() || unclosed.ends_with([' ', '\t']) {
            unclosed.trim_end()
        } else {
            text
        };
        Ok(("", (hashes.len() as u8, text)))
    }

    fn inline_link(i: &str) -> IResult<&str, &str> {
        preceded(
            delimited(char('['), take_until("]"), char(']')),
            delimited(char('('), take_until(")"), char(')')),
        )(i)
    }

    fn wiki_link(i: &str) -> IResult<&str, &str> {
        delimited(tag("[["), take_until("]]"), tag("]]"))(i)
    }

    fn image(i: &str) -> IResult<&str, &str> {
        preceded(char('!'), inline_link)(i)
    }

    /// `` `code` `` or ``` ``co`de`` ```: a backtick run closed by the same run.
    fn code_span(i: &str) -> IResult<&str, &str> {
        let (rest, ticks) = take_while1(|c: char| c == '`')(i)?;
        terminated(take_until(ticks), tag(ticks))(rest)
    }

    /// Count `[text](target)` and `[[page]]` links; images and code spans do not count.
    pub fn count_links(line: &str) -> usize {
        let mut rest = line;
        let mut count = 0;
        while !rest.is_empty() {
            if rest.starts_with('`') {
                rest = match code_span(rest) {
                    Ok((r, _)) => r,
                    Err(_) => rest.trim_start_matches('`'),
                };
                continue;
            }
            if let Ok((r, _)) = image(rest) {
                rest = r;
                continue;
            }
            if let Ok((r, _)) = alt((wiki_link, inline_link))(rest) {
                count += 1;
                rest = r;
                continue;
            }
            let mut chars = rest.chars();
            chars.next();
            rest = chars.as_str();
        }
        count
    }

    /// Stack-build the heading forest from `(level, text)` pairs in document order.
    pub fn heading_forest(flat: Vec<(u8, String)>) -> Vec<HeadingNode> {
        fn attach(node: HeadingNode, stack: &mut [HeadingNode], roots: &mut Vec<HeadingNode>) {
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => roots.push(node),
            }
        }

        let mut roots = Vec::new();
        let mut stack: Vec<HeadingNode> = Vec::new();
        for (level, text) in flat {
            while stack.last().is_some_and(|top| top.level >= level) {
                if let Some(done) = stack.pop() {
                    attach(done, &mut stack, &mut roots);
                }
            }
            stack.push(HeadingNode {
                text,
                level,
                children: vec![],
            });
        }
        while let Some(done) = stack.pop() {
            attach(done, &mut stack, &mut roots);
        }
        roots
    }

    fn skip_front_matter(text: &str) -> &str {
        let Some(body) = text.strip_prefix("---\n").or_else(|| text.strip_prefix("---\r\n")) else {
            return text;
        };
        let mut offset = 0;
        for line in body.split_inclusive('\n') {
            offset += line.len();
            if line.trim_end() == "---" {
                return &body[offset..];
            }
        }
        text
    }

    /// Describe one Markdown document.
    pub fn describe(path: &Path, text: &str) -> FileDescriptor {
        let mut flat = Vec::new();
        let mut link_count = 0;
        let mut in_fence = false;

        for line in skip_front_matter(text).lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
                in_fence = !in_fence;
                continue;
            }
            if in_fence {
                continue;
            }
            if let Ok((_, (level, heading))) = atx_heading(line) {
                flat.push((level, heading.to_string()));
            }
            link_count += count_links(line);
        }

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let title = flat
            .iter()
            .find(|(level, text)| *level == 1 && !text.is_empty())
            .map(|(_, text)| text.clone())
            .unwrap_or(stem);

        FileDescriptor {
            path: path.to_string_lossy().into_owned(),
            filename: path
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            title,
            headings: heading_forest(flat),
            link_count,
        }
    }

    /* -------------------------------- Scanner -------------------------------- */

    fn is_markdown(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("markdown"))
    }

    fn visit_dir(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), OrganizeError> {
        let scan_err = |source: std::io::Error| OrganizeError::Scan {
            path: dir.to_path_buf(),
            source,
        };
        for entry in fs::read_dir(dir).map_err(scan_err)? {
            let entry = entry.map_err(scan_err)?;
            let file_type = entry.file_type().map_err(scan_err)?;
            if file_type.is_symlink() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if file_type.is_dir() {
                if !SKIPPED_DIRS.contains(&name.as_str()) {
                    visit_dir(&path, out)?;
                }
            } else if file_type.is_file() && is_markdown(&path) {
                out.push(path);
            }
        }
        Ok(())
    }

    /// Recursive scan of `*.md` / `*.markdown` files, ordered by path.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MarkdownCatalog;

    impl CatalogProvider for MarkdownCatalog {
        fn scan(&self, dir: &Path) -> Result<Vec<FileDescriptor>, OrganizeError> {
            if !dir.is_dir() {
                return Err(OrganizeError::NotADirectory(dir.to_path_buf()));
            }
            let mut paths = Vec::new();
            visit_dir(dir, &mut paths)?;
            paths.sort();

            let mut out = Vec::with_capacity(paths.len());
            for path in paths {
                match fs::read_to_string(&path) {
                    Ok(text) => out.push(describe(&path, &text)),
                    Err(err) => tracing::warn!(path = ?path, %err, "skipping unreadable file"),
                }
            }
            tracing::debug!(dir = ?dir, files = out.len(), "scanned catalog");
            Ok(out)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn headings_and_title() {
            let text = "---\ntitle: ignored\n---\nintro\n# Guide\n## Install ##\n### Linux\n## Usage\n```\n# not a heading\n```\n#tag\n";
            let file = describe(Path::new("docs/guide.md"), text);
            assert_eq!(file.title, "Guide");
            assert_eq!(file.filename, "guide.md");
            assert_eq!(file.headings.len(), 1);
            let guide = &file.headings[0];
            let sections: Vec<&str> = guide.children.iter().map(|h| h.text.as_str()).collect();
            assert_eq!(sections, ["Install", "Usage"]);
            assert_eq!(guide.children[0].children[0].text, "Linux");
        }

        #[test]
        fn title_falls_back_to_stem() {
            let file = describe(Path::new("notes/todo-list.md"), "## Only a subheading\n");
            assert_eq!(file.title, "todo-list");
        }

        #[test]
        fn links_are_counted() {
            assert_eq!(count_links("see [a](a.md) and [[Wiki Page]] or ![img](x.png)"), 2);
            assert_eq!(count_links("[not a link] (nope)"), 0);
            assert_eq!(count_links("[x](y)[z](w)"), 2);
        }

        #[test]
        fn code_spans_hide_links() {
            assert_eq!(count_links("`[x](y)` but [a](b.md)"), 1);
            assert_eq!(count_links("``[[a `b` c]]`` and [[Page]]"), 1);
            assert_eq!(count_links("stray ` then [a](b.md)"), 1);
        }

        #[test]
        fn closing_hashes_need_a_space() {
            assert_eq!(describe(Path::new("x.md"), "# C#\n").title, "C#");
            assert_eq!(describe(Path::new("x.md"), "# C# ##\n").title, "C#");
            assert_eq!(describe(Path::new("x.md"), "# Title #\n").title, "Title");
            let file = describe(Path::new("x.md"), "# #\n## F#\n");
            assert_eq!(file.title, "x");
            assert_eq!(file.headings[0].text, "");
            assert_eq!(file.headings[0].children[0].text, "F#");
        }

        #[test]
        fn heading_forest_handles_level_jumps() {
            let forest = heading_forest(vec![
                (2, "a".into()),
                (4, "b".into()),
                (1, "c".into()),
                (2, "d".into()),
            ]);
            assert_eq!(forest.len(), 2);
            assert_eq!(forest[0].children[0].text, "b");
            assert_eq!(forest[1].children[0].text, "d");
        }

        #[test]
        fn scan_finds_markdown_recursively() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path();
            fs::create_dir_all(root.join("sub")).expect("mkdir sub");
            fs::create_dir_all(root.join(".git")).expect("mkdir .git");
            fs::create_dir_all(root.join("node_modules")).expect("mkdir node_modules");
            fs::write(root.join("b.md"), "# Bee\n[x](a.md)\n").expect("write b");
            fs::write(root.join("sub/a.markdown"), "plain").expect("write a");
            fs::write(root.join(".git/c.md"), "# C").expect("write c");
            fs::write(root.join("node_modules/d.md"), "# D").expect("write d");
            fs::write(root.join("notes.txt"), "# T").expect("write txt");

            let files = MarkdownCatalog.scan(root).expect("scan");
            let titles: Vec<&str> = files.iter().map(|f| f.title.as_str()).collect();
            assert_eq!(titles, ["Bee", "a"]);
            assert_eq!(files[0].link_count, 1);
        }

        #[test]
        fn scan_rejects_files() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let file = tmp.path().join("x.md");
            fs::write(&file, "# X").expect("write");
            assert!(matches!(
                MarkdownCatalog.scan(&file),
                Err(OrganizeError::NotADirectory(_))
            ));
        }
    }
}

pub mod store {
    //! JSON `ConfigStore`: one document per working directory.

    use super::core::*;
    use super::storage::ConfigStore;
    use std::{
        fs, io,
        path::{Path, PathBuf},
    };

    pub const CONFIG_FILE_NAME: &str = ".wikitree.json";

    #[derive(Debug, Clone)]
    pub struct JsonConfigStore {
        file_name: String,
    }

    impl Default for JsonConfigStore {
        fn default() -> Self {
            Self::new(CONFIG_FILE_NAME)
        }
    }

    impl JsonConfigStore {
        pub fn new(file_name: impl Into<String>) -> Self {
            Self {
                file_name: file_name.into(),
            }
        }

        pub fn path_for(&self, dir: &Path) -> PathBuf {
            dir.join(&self.file_name)
        }
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(tmp, path)
    }

    impl ConfigStore for JsonConfigStore {
        fn load(&self, dir: &Path) -> Result<Option<OrganizationConfig>, OrganizeError> {
            let path = self.path_for(dir);
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(source) => return Err(OrganizeError::Read { path, source }),
            };
            let config = serde_json::from_str(&text).map_err(|source| OrganizeError::Json {
                path: path.clone(),
                source,
            })?;
            tracing::debug!(path = ?path, "loaded organization config");
            Ok(Some(config))
        }

        fn save(&self, dir: &Path, config: &OrganizationConfig) -> Result<(), OrganizeError> {
            let path = self.path_for(dir);
            let bytes = serde_json::to_vec_pretty(config).map_err(|source| OrganizeError::Json {
                path: path.clone(),
                source,
            })?;
            write_atomic(&path, &bytes).map_err(|source| OrganizeError::Write {
                path: path.clone(),
                source,
            })?;
            tracing::debug!(path = ?path, "saved organization config");
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn missing_document_loads_as_none() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let loaded = JsonConfigStore::default().load(tmp.path()).expect("load");
            assert!(loaded.is_none());
        }

        #[test]
        fn save_then_load() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = JsonConfigStore::default();
            let mut config = OrganizationConfig::default();
            config.overlay_mut("a.md").pinned = true;
            config.overlay_mut("a.md").order = Some(0.0);
            config.last_modified = 99;

            store.save(tmp.path(), &config).expect("save");
            let raw = fs::read_to_string(store.path_for(tmp.path())).expect("read raw");
            let json: serde_json::Value = serde_json::from_str(&raw).expect("json");
            assert_eq!(json["pinnedFiles"], serde_json::json!(["a.md"]));
            assert_eq!(json["files"]["a.md"]["order"], serde_json::json!(0));

            let loaded = store.load(tmp.path()).expect("load").expect("some");
            assert_eq!(loaded, config);
        }

        #[test]
        fn malformed_document_is_an_error() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = JsonConfigStore::default();
            fs::write(store.path_for(tmp.path()), "{ nope").expect("write");
            assert!(matches!(
                store.load(tmp.path()),
                Err(OrganizeError::Json { .. })
            ));
        }
    }
}

pub mod workspace {
    //! Caller-side façade: holds the current catalog and config of one working
    //! directory and persists after every mutation.
    //!
    //! The config is replaced wholesale only after a successful save, so a failed
    //! save leaves the in-memory state as it was.

    use super::classify::{Classification, classify};
    use super::core::*;
    use super::groups;
    use super::hierarchy::{OrganizedTree, children, organized_tree};
    use super::moves::{ConfigPatch, MoveIntent, apply_intent, resolve_move};
    use super::storage::{CatalogProvider, ConfigStore};
    use super::validate::{normalize, prune};
    use chrono::Utc;
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    pub struct Workspace<C, S> {
        dir: PathBuf,
        provider: C,
        store: S,
        catalog: Vec<FileDescriptor>,
        config: OrganizationConfig,
    }

    impl<C: CatalogProvider, S: ConfigStore> Workspace<C, S> {
        /// Scan `dir` and load its config; a directory without one starts empty.
        ///
        /// `dir` is canonicalized first. Catalog paths are the overlay keys, so every
        /// spelling of the same directory has to yield the same ones.
        pub fn open(dir: impl Into<PathBuf>, provider: C, store: S) -> Result<Self, OrganizeError> {
            let dir = dir.into();
            let dir = fs::canonicalize(&dir).map_err(|source| OrganizeError::Scan { path: dir, source })?;
            let catalog = provider.scan(&dir)?;
            let config = store
                .load(&dir)?
                .map(|loaded| normalize(&loaded))
                .unwrap_or_default();
            tracing::debug!(dir = ?dir, files = catalog.len(), groups = config.groups.len(), "opened workspace");
            Ok(Self {
                dir,
                provider,
                store,
                catalog,
                config,
            })
        }

        pub fn dir(&self) -> &Path {
            &self.dir
        }

        pub fn catalog(&self) -> &[FileDescriptor] {
            &self.catalog
        }

        pub fn config(&self) -> &OrganizationConfig {
            &self.config
        }

        pub fn rescan(&mut self) -> Result<(), OrganizeError> {
            self.catalog = self.provider.scan(&self.dir)?;
            Ok(())
        }

        pub fn classify(&self) -> Classification<'_> {
            classify(&self.catalog, &self.config)
        }

        pub fn children(&self, path: &str) -> Vec<&FileDescriptor> {
            children(path, &self.catalog, &self.config)
        }

        pub fn tree(&self) -> OrganizedTree<'_> {
            organized_tree(&self.catalog, &self.config)
        }

        /// Stamp, persist and adopt `next`.
        pub fn commit(&mut self, mut next: OrganizationConfig) -> Result<(), OrganizeError> {
            next.last_modified = Utc::now().timestamp_millis();
            self.store.save(&self.dir, &next)?;
            self.config = next;
            Ok(())
        }

        /// Apply a pure config transformation and persist the result.
        pub fn update(
            &mut self,
            f: impl FnOnce(&OrganizationConfig) -> OrganizationConfig,
        ) -> Result<(), OrganizeError> {
            let next = f(&self.config);
            self.commit(next)
        }

        fn commit_patch(&mut self, patch: ConfigPatch) -> Result<Option<MoveIntent>, OrganizeError> {
            if patch.is_empty() {
                return Ok(None);
            }
            let next = patch.apply(&self.config);
            self.commit(next)?;
            Ok(patch.intent)
        }

        /// Handle a drop-end event. Returns what the drop did, `None` for a no-op.
        pub fn drop_on(&mut self, active: &str, target: &str) -> Result<Option<MoveIntent>, OrganizeError> {
            let patch = resolve_move(active, target, &self.catalog, &self.config);
            self.commit_patch(patch)
        }

        /// Carry out an explicitly chosen intent.
        pub fn perform(&mut self, active: &str, intent: &MoveIntent) -> Result<Option<MoveIntent>, OrganizeError> {
            let patch = apply_intent(active, intent, &self.catalog, &self.config);
            self.commit_patch(patch)
        }

        pub fn create_group(
            &mut self,
            name: &str,
            icon: Option<Icon>,
            color: Option<Color>,
        ) -> Result<Group, OrganizeError> {
            let (next, group) = groups::create_group(&self.config, name, icon, color);
            self.commit(next)?;
            Ok(group)
        }

        /// Forget overlays of files that are gone from the catalog.
        pub fn prune(&mut self) -> Result<usize, OrganizeError> {
            let next = prune(&self.catalog, &self.config);
            let dropped = self.config.files.len() - next.files.len();
            self.commit(next)?;
            Ok(dropped)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::catalog::MarkdownCatalog;
        use crate::store::JsonConfigStore;
        use crate::toggles::pin;
        use std::cell::RefCell;

        struct StaticCatalog(Vec<FileDescriptor>);

        impl CatalogProvider for StaticCatalog {
            fn scan(&self, _dir: &Path) -> Result<Vec<FileDescriptor>, OrganizeError> {
                Ok(self.0.clone())
            }
        }

        #[derive(Default)]
        struct MemoryStore {
            saved: RefCell<Option<OrganizationConfig>>,
            saves: RefCell<usize>,
            fail: bool,
        }

        impl ConfigStore for MemoryStore {
            fn load(&self, _dir: &Path) -> Result<Option<OrganizationConfig>, OrganizeError> {
                Ok(self.saved.borrow().clone())
            }

            fn save(&self, dir: &Path, config: &OrganizationConfig) -> Result<(), OrganizeError> {
                if self.fail {
                    return Err(OrganizeError::Write {
                        path: dir.to_path_buf(),
                        source: std::io::Error::other("disk full"),
                    });
                }
                *self.saved.borrow_mut() = Some(config.clone());
                *self.saves.borrow_mut() += 1;
                Ok(())
            }
        }

        fn files() -> StaticCatalog {
            StaticCatalog(vec![
                FileDescriptor::new("a.md", "A"),
                FileDescriptor::new("b.md", "B"),
            ])
        }

        #[test]
        fn every_mutation_is_saved() {
            let mut ws = Workspace::open(std::env::temp_dir(), files(), MemoryStore::default()).expect("open");
            assert_eq!(ws.config(), &OrganizationConfig::default());

            ws.update(|c| pin(c, "a.md")).expect("pin");
            let intent = ws.drop_on("b.md", "a.md").expect("drop");
            assert_eq!(
                intent,
                Some(MoveIntent::Nest {
                    parent: "a.md".into()
                })
            );
            assert_eq!(ws.drop_on("b.md", "b.md").expect("self drop"), None);

            assert_eq!(*ws.store.saves.borrow(), 2);
            assert_eq!(ws.store.saved.borrow().as_ref(), Some(ws.config()));
            assert!(ws.config().last_modified > 0);
            assert_eq!(ws.children("a.md").len(), 1);
        }

        #[test]
        fn failed_save_keeps_previous_config() {
            let store = MemoryStore {
                fail: true,
                ..MemoryStore::default()
            };
            let mut ws = Workspace::open(std::env::temp_dir(), files(), store).expect("open");
            assert!(ws.update(|c| pin(c, "a.md")).is_err());
            assert!(!ws.config().is_pinned("a.md"));
        }

        #[test]
        fn groups_and_prune_through_workspace() {
            let mut ws = Workspace::open(std::env::temp_dir(), files(), MemoryStore::default()).expect("open");
            let group = ws.create_group("Docs", None, None).expect("create");
            ws.drop_on("a.md", &group.id).expect("join");
            assert_eq!(ws.classify().groups[&group.id].len(), 1);

            ws.update(|c| pin(c, "gone.md")).expect("pin ghost");
            assert_eq!(ws.prune().expect("prune"), 1);
            assert!(ws.config().overlay("gone.md").is_none());
        }

        #[test]
        fn reopening_from_disk_restores_organization() {
            let tmp = tempfile::tempdir().expect("tempdir");
            fs::write(tmp.path().join("a.md"), "# A").expect("write a");
            fs::write(tmp.path().join("b.md"), "# B").expect("write b");

            let mut ws = Workspace::open(tmp.path(), MarkdownCatalog, JsonConfigStore::default()).expect("open");
            let b = ws.catalog()[1].path.clone();
            ws.update(|c| pin(c, &b)).expect("pin");
            drop(ws);

            let ws = Workspace::open(tmp.path(), MarkdownCatalog, JsonConfigStore::default()).expect("reopen");
            let classes = ws.classify();
            assert_eq!(classes.pinned.len(), 1);
            assert_eq!(classes.pinned[0].title, "B");
            assert_eq!(classes.ungrouped[0].title, "A");
        }

        #[test]
        fn any_spelling_of_the_directory_keeps_the_keys() {
            let tmp = tempfile::tempdir().expect("tempdir");
            fs::create_dir(tmp.path().join("sub")).expect("mkdir sub");
            fs::write(tmp.path().join("a.md"), "# A").expect("write a");

            let mut ws = Workspace::open(tmp.path(), MarkdownCatalog, JsonConfigStore::default()).expect("open");
            let key = ws.catalog()[0].path.clone();
            ws.update(|c| pin(c, &key)).expect("pin");
            drop(ws);

            for spelling in [tmp.path().join("."), tmp.path().join("sub/..")] {
                let ws = Workspace::open(&spelling, MarkdownCatalog, JsonConfigStore::default()).expect("reopen");
                assert_eq!(ws.dir(), fs::canonicalize(tmp.path()).expect("canonical").as_path());
                assert_eq!(ws.catalog()[0].path, key);
                assert_eq!(ws.classify().pinned.len(), 1);
            }
        }

        #[test]
        fn missing_directory_fails_to_open() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let gone = tmp.path().join("gone");
            assert!(matches!(
                Workspace::open(&gone, MarkdownCatalog, JsonConfigStore::default()),
                Err(OrganizeError::Scan { .. })
            ));
        }
    }
}

pub use classify::{Bucket, Classification, classify};
pub use crate::core::{Color, FileDescriptor, FileOverlay, Group, Icon, OrganizationConfig, OrganizeError};
pub use hierarchy::children;
pub use moves::{ConfigPatch, MoveIntent, resolve_move};
pub use workspace::Workspace;
