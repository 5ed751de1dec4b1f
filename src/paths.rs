//! Path registry: logical asset categories mapped to source globs and
//! destination directories, plus glob resolution against the filesystem.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use walkdir::WalkDir;

use crate::error::{BuildError, Result};

/// Output root, relative to the project root
pub const OUTPUT_ROOT: &str = "dist";

/// Archive root, kept outside the output root so archiving never feeds back into itself
pub const ARCHIVE_ROOT: &str = "compressed";

/// Asset category a stage reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Html,
    Css,
    Sass,
    Scripts,
    Images,
    Fonts,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Html => "html",
            Category::Css => "css",
            Category::Sass => "sass",
            Category::Scripts => "scripts",
            Category::Images => "images",
            Category::Fonts => "fonts",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Globs watched in watch mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WatchCategory {
    Html,
    Css,
    Sass,
    Scripts,
    Output,
}

/// Source glob and destination directory, both relative to the project root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSpec {
    pub source_glob: String,
    pub destination: PathBuf,
}

impl PathSpec {
    pub fn new(source_glob: &str, destination: &str) -> Self {
        Self {
            source_glob: source_glob.to_string(),
            destination: PathBuf::from(destination),
        }
    }
}

/// Registered entry: either a real path pair or a recognized placeholder
#[derive(Debug, Clone)]
enum Entry {
    Set(PathSpec),
    Unset { destination: PathBuf },
}

/// Static category table rooted at a project directory
#[derive(Debug, Clone)]
pub struct PathRegistry {
    root: PathBuf,
    entries: BTreeMap<Category, Entry>,
    watch: BTreeMap<WatchCategory, String>,
}

impl PathRegistry {
    /// Empty registry for a project root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: BTreeMap::new(),
            watch: BTreeMap::new(),
        }
    }

    /// The default project layout
    pub fn standard(root: impl Into<PathBuf>) -> Self {
        let mut registry = Self::new(root);
        let table = [
            (Category::Html, PathSpec::new("src/index.html", "dist")),
            (Category::Css, PathSpec::new("src/css/*.css", "dist/style")),
            (Category::Sass, PathSpec::new("src/style/main.scss", "dist/style")),
            (Category::Scripts, PathSpec::new("src/js/*.js", "dist/scripts")),
            (
                Category::Images,
                PathSpec::new("src/images/*.{jpg,jpeg,png,gif,svg}", "dist/images"),
            ),
        ];
        for (category, spec) in table {
            registry.entries.insert(category, Entry::Set(spec));
        }
        registry.entries.insert(
            Category::Fonts,
            Entry::Unset {
                destination: PathBuf::from("dist/fonts"),
            },
        );

        registry.watch.insert(WatchCategory::Html, "src/*.html".into());
        registry.watch.insert(WatchCategory::Css, "src/css/*.css".into());
        registry
            .watch
            .insert(WatchCategory::Sass, "src/style/**/*.scss".into());
        registry
            .watch
            .insert(WatchCategory::Scripts, "src/js/**/*.js".into());
        registry
            .watch
            .insert(WatchCategory::Output, "dist/**/*.*".into());
        registry
    }

    /// Register a category, rejecting destinations outside the output root
    pub fn register(&mut self, category: Category, spec: PathSpec) -> Result<()> {
        check_destination(&spec.destination)?;
        self.entries.insert(category, Entry::Set(spec));
        Ok(())
    }

    /// Register a recognized category whose sources are not configured yet
    pub fn register_placeholder(&mut self, category: Category, destination: &str) -> Result<()> {
        let destination = PathBuf::from(destination);
        check_destination(&destination)?;
        self.entries.insert(category, Entry::Unset { destination });
        Ok(())
    }

    pub fn register_watch(&mut self, category: WatchCategory, pattern: &str) {
        self.watch.insert(category, pattern.to_string());
    }

    /// Look up the path pair for a category
    pub fn lookup(&self, category: Category) -> Result<&PathSpec> {
        match self.entries.get(&category) {
            Some(Entry::Set(spec)) => Ok(spec),
            Some(Entry::Unset { destination }) => Err(BuildError::config(format!(
                "no source paths configured for {category} (destination {})",
                destination.display()
            ))),
            None => Err(BuildError::config(format!(
                "unknown path category: {category}"
            ))),
        }
    }

    pub fn watch_glob(&self, category: WatchCategory) -> Option<&str> {
        self.watch.get(&category).map(String::as_str)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn output_root(&self) -> PathBuf {
        self.root.join(OUTPUT_ROOT)
    }

    pub fn archive_root(&self) -> PathBuf {
        self.root.join(ARCHIVE_ROOT)
    }

    /// Absolute destination directory of a path pair
    pub fn destination(&self, spec: &PathSpec) -> PathBuf {
        self.root.join(&spec.destination)
    }

    /// Resolve a glob relative to the project root
    pub fn resolve(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        resolve(&self.root, pattern)
    }

    /// Directory beneath which a glob's matches keep their relative structure
    pub fn glob_base(&self, pattern: &str) -> PathBuf {
        self.root.join(literal_prefix(pattern))
    }

    /// Test an absolute or root-relative path against a glob
    pub fn matches(&self, pattern: &str, path: &Path) -> Result<bool> {
        Ok(self.matcher(pattern)?.is_match(path))
    }

    /// Precompiled glob for repeated matching
    pub fn matcher(&self, pattern: &str) -> Result<PathMatcher> {
        Ok(PathMatcher {
            root: self.root.clone(),
            matcher: compile(pattern)?,
        })
    }
}

/// A compiled glob anchored at the project root
#[derive(Debug, Clone)]
pub struct PathMatcher {
    root: PathBuf,
    matcher: GlobMatcher,
}

impl PathMatcher {
    pub fn is_match(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        self.matcher.is_match(slash_path(relative))
    }
}

fn check_destination(destination: &Path) -> Result<()> {
    let escapes = destination
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes || !destination.starts_with(OUTPUT_ROOT) {
        return Err(BuildError::config(format!(
            "destination {} must be inside the output root {OUTPUT_ROOT}",
            destination.display()
        )));
    }
    Ok(())
}

fn compile(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|source| BuildError::Glob {
            pattern: pattern.to_string(),
            source,
        })
}

#[inline]
fn is_glob_component(component: &str) -> bool {
    component.contains(['*', '?', '[', '{'])
}

/// Leading directory components of a pattern that contain no glob syntax
fn literal_prefix(pattern: &str) -> PathBuf {
    let components: Vec<&str> = pattern.split('/').collect();
    let literal = components
        .iter()
        .take(components.len().saturating_sub(1))
        .take_while(|c| !is_glob_component(c))
        .copied()
        .collect::<Vec<_>>();
    literal.iter().collect()
}

/// Relative path with `/` separators, as matched by globs
pub fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk failure below `base`, reported against the entry that failed
pub(crate) fn walk_error(base: &Path, error: walkdir::Error) -> BuildError {
    let path = error.path().unwrap_or(base).to_path_buf();
    BuildError::io(path, error.into())
}

/// Resolve a glob to the files it matches right now, sorted by path.
///
/// A missing base directory is an empty match, not an error. An unreadable
/// entry beneath it is.
pub fn resolve(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    if !is_glob_component(pattern) {
        let path = root.join(pattern);
        return Ok(if path.is_file() { vec![path] } else { Vec::new() });
    }

    let matcher = compile(pattern)?;
    let base = literal_prefix(pattern);
    let walk_root = root.join(&base);
    if !walk_root.is_dir() {
        return Ok(Vec::new());
    }

    let mut walker = WalkDir::new(&walk_root).follow_links(true).sort_by_file_name();
    if !pattern.contains("**") {
        let depth = pattern.split('/').count() - base.components().count();
        walker = walker.max_depth(depth);
    }

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| walk_error(&walk_root, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if matcher.is_match(slash_path(relative)) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}
