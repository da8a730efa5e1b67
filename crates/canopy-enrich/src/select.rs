use canopy_core::{ChangeSet, FileChange, FileStatus};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::sync::OnceLock;

const NOISE_PATTERNS: &[&str] = &[
    "**/*.lock",
    "**/package-lock.json",
    "**/pnpm-lock.yaml",
    "**/go.sum",
    "**/target/**",
    "**/dist/**",
    "**/build/**",
    "**/out/**",
    "**/node_modules/**",
    "**/.next/**",
    "**/coverage/**",
    "**/__pycache__/**",
    "**/*.min.js",
    "**/*.map",
    "**/*.{png,jpg,jpeg,gif,ico,webp,bmp,svgz,pdf}",
    "**/*.{zip,gz,tgz,tar,xz,7z,jar,wasm}",
    "**/*.{woff,woff2,ttf,otf,eot}",
    "**/*.{so,dylib,dll,exe,bin,o,a,class,pyc}",
    "**/__snapshots__/**",
    "**/*.snap",
    "**/*.snap.new",
];

const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "mjs", "py", "go", "java", "kt", "swift", "c", "h", "cc",
    "cpp", "hpp", "cs", "rb", "php", "scala", "zig", "sh", "sql", "vue", "svelte", "lua", "ex",
];

const DOC_EXTENSIONS: &[&str] = &["md", "mdx", "rst", "txt", "adoc"];

fn noise_set() -> &'static GlobSet {
    static SET: OnceLock<GlobSet> = OnceLock::new();
    SET.get_or_init(|| {
        let mut builder = GlobSetBuilder::new();
        for pattern in NOISE_PATTERNS {
            if let Ok(glob) = Glob::new(pattern) {
                builder.add(glob);
            }
        }
        builder.build().unwrap_or_else(|_| GlobSet::empty())
    })
}

/// Lockfiles, build output, binary assets and snapshot fixtures say nothing
/// about intent and are never shown to the completion service.
pub fn is_noise(path: &str) -> bool {
    noise_set().is_match(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathKind {
    Other,
    Docs,
    Test,
    Source,
}

impl PathKind {
    pub fn weight(self) -> f64 {
        match self {
            PathKind::Source => 3.0,
            PathKind::Test => 2.0,
            PathKind::Docs => 1.0,
            PathKind::Other => 0.5,
        }
    }
}

pub fn classify_path(path: &str) -> PathKind {
    let lower = path.to_ascii_lowercase();
    let file_name = lower.rsplit('/').next().unwrap_or(&lower);
    let extension = file_name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");

    let in_test_dir = lower
        .split('/')
        .any(|segment| matches!(segment, "test" | "tests" | "spec" | "__tests__" | "testdata"));
    let test_name = file_name.starts_with("test_")
        || file_name.contains("_test.")
        || file_name.contains(".test.")
        || file_name.contains(".spec.");
    if (in_test_dir || test_name) && SOURCE_EXTENSIONS.contains(&extension) {
        return PathKind::Test;
    }
    if SOURCE_EXTENSIONS.contains(&extension) {
        return PathKind::Source;
    }
    if DOC_EXTENSIONS.contains(&extension) || lower.starts_with("docs/") || lower.contains("/docs/")
    {
        return PathKind::Docs;
    }
    PathKind::Other
}

/// Coarse recency buckets: under 5 minutes, an hour, a day, a week.
pub fn recency_score(mtime: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(mtime) = mtime else {
        return 0.0;
    };
    let age = now.signed_duration_since(mtime).num_seconds().max(0);
    match age {
        0..=299 => 4.0,
        300..=3_599 => 3.0,
        3_600..=86_399 => 2.0,
        86_400..=604_799 => 1.0,
        _ => 0.0,
    }
}

pub fn magnitude_score(file: &FileChange) -> f64 {
    (1.0 + file.line_delta() as f64).ln()
}

#[derive(Debug, Clone)]
pub struct RankedFile<'a> {
    pub change: &'a FileChange,
    pub kind: PathKind,
    pub score: f64,
}

/// Drops noise and ignored entries, then orders the rest by recency,
/// magnitude and path kind, highest first. Ties keep path order.
pub fn rank_files(changes: &ChangeSet, now: DateTime<Utc>) -> Vec<RankedFile<'_>> {
    let mut ranked: Vec<RankedFile<'_>> = changes
        .files
        .iter()
        .filter(|file| file.status != FileStatus::Ignored && !is_noise(&file.path))
        .map(|file| {
            let kind = classify_path(&file.path);
            let score = recency_score(file.mtime, now) + magnitude_score(file) + kind.weight();
            RankedFile {
                change: file,
                kind,
                score,
            }
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.change.path.cmp(&b.change.path))
    });
    ranked
}
