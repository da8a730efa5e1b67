use crate::select::{rank_files, RankedFile};
use crate::EnrichConfig;
use canopy_core::{ChangeSet, FileChange, FileStatus, StatusProvider};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::fmt::Write as _;
use std::sync::OnceLock;
use tracing::debug;

/// JSON schema handed to the completion service alongside the prompt.
pub const DESCRIPTION_SCHEMA: &str = r#"{"type":"object","properties":{"description":{"type":"string"}},"required":["description"],"additionalProperties":false}"#;

const SKELETON_MAX_LINES: usize = 12;
const MAX_NEW_FILE_BYTES: u64 = 256 * 1024;
const MIN_RICH_BLOCK_CHARS: usize = 24;

/// Builds the full prompt for one change set. Rich content is fetched per
/// file (diff or skeleton); failures to read a file just demote it to the
/// light tier.
pub async fn build_prompt(
    changes: &ChangeSet,
    status: &dyn StatusProvider,
    config: &EnrichConfig,
    now: DateTime<Utc>,
) -> String {
    let ranked = rank_files(changes, now);
    let mut rich = Vec::new();
    let mut demoted = Vec::new();
    for file in ranked.iter().take(config.max_rich_files) {
        match rich_content(changes, file, status).await {
            Some(body) if !body.trim().is_empty() => rich.push((file.change, body)),
            _ => demoted.push(file.change),
        }
    }
    let light: Vec<&FileChange> = demoted
        .into_iter()
        .chain(
            ranked
                .iter()
                .skip(config.max_rich_files)
                .map(|file| file.change),
        )
        .collect();

    let context = assemble_context(changes, &rich, &light, config);
    render_prompt(&context, config.max_words)
}

async fn rich_content(
    changes: &ChangeSet,
    file: &RankedFile<'_>,
    status: &dyn StatusProvider,
) -> Option<String> {
    let change = file.change;
    if change.status.is_new_file() {
        let path = changes.root.join(&change.path);
        let meta = tokio::fs::metadata(&path).await.ok()?;
        if !meta.is_file() || meta.len() > MAX_NEW_FILE_BYTES {
            return None;
        }
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        return Some(skeleton(&content));
    }
    match status.file_diff(&changes.root, &change.path).await {
        Ok(diff) => Some(minimal_diff(&diff)),
        Err(err) => {
            debug!(event = "enrich_diff_unavailable", file = %change.path, error = %err);
            None
        }
    }
}

/// Builds the bounded context section: a header, rich blocks within the rich
/// budget, one-line summaries within the light budget, and a bare file list
/// when nothing else survived.
pub fn assemble_context(
    changes: &ChangeSet,
    rich: &[(&FileChange, String)],
    light: &[&FileChange],
    config: &EnrichConfig,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Changed files: {} (+{} -{})",
        changes.changed_files, changes.insertions, changes.deletions
    );

    let rich_section = render_rich(rich, config.rich_budget_chars);
    let light_section = render_light(light, config.max_light_files, config.light_budget_chars);

    if rich_section.is_empty() && light_section.is_empty() {
        out.push_str("Files:\n");
        out.push_str(&fallback_file_list(changes, config.light_budget_chars));
        return out;
    }
    if !rich_section.is_empty() {
        out.push_str("\n## Key changes\n");
        out.push_str(&rich_section);
    }
    if !light_section.is_empty() {
        out.push_str("\n## Other changes\n");
        out.push_str(&light_section);
    }
    out
}

fn render_rich(rich: &[(&FileChange, String)], budget: usize) -> String {
    let mut out = String::new();
    for (change, body) in rich {
        let remaining = budget.saturating_sub(out.chars().count());
        if remaining < MIN_RICH_BLOCK_CHARS {
            break;
        }
        let mut block = format!("### {}\n{}\n", file_label(change), body.trim_end());
        if block.chars().count() > remaining {
            block = truncate_chars(&block, remaining - 1);
            block.push('\n');
        }
        out.push_str(&block);
    }
    out
}

fn render_light(light: &[&FileChange], max_files: usize, budget: usize) -> String {
    let mut out = String::new();
    let mut shown = 0;
    for change in light.iter().take(max_files) {
        let line = format!("{}\n", file_label(change));
        if out.chars().count() + line.chars().count() > budget {
            break;
        }
        out.push_str(&line);
        shown += 1;
    }
    let hidden = light.len() - shown;
    if shown > 0 && hidden > 0 {
        let _ = writeln!(out, "... and {hidden} more");
    }
    out
}

fn fallback_file_list(changes: &ChangeSet, budget: usize) -> String {
    let names: Vec<&str> = changes.files.iter().map(|file| file.path.as_str()).collect();
    let list = names.join(", ");
    format!("{}\n", truncate_chars(&list, budget.max(1)))
}

fn file_label(change: &FileChange) -> String {
    match (change.insertions, change.deletions) {
        (Some(ins), Some(del)) => format!(
            "{} {} (+{} -{})",
            change.status.code(),
            change.path,
            ins,
            del
        ),
        _ if change.status == FileStatus::Untracked => {
            format!("{} {} (new)", change.status.code(), change.path)
        }
        _ => format!("{} {}", change.status.code(), change.path),
    }
}

fn render_prompt(context: &str, max_words: usize) -> String {
    format!(
        "You summarize work in progress inside a git worktree.\n\
         Describe what the pending changes below are doing in at most {max_words} words.\n\
         Start with a single emoji that fits the kind of work, then the description.\n\
         Respond with JSON only, exactly: {{\"description\": \"<text>\"}}\n\n\
         {context}"
    )
}

/// Keeps only hunk headers and added/removed lines of a unified diff.
pub fn minimal_diff(diff: &str) -> String {
    diff.lines()
        .filter(|line| {
            if line.starts_with("+++") || line.starts_with("---") {
                return false;
            }
            line.starts_with("@@") || line.starts_with('+') || line.starts_with('-')
        })
        .map(|line| {
            if line.starts_with("@@") {
                hunk_header(line)
            } else {
                line.trim_end().to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `@@ -10,2 +10,3 @@ fn name()` keeps only the trailing context label, if any.
fn hunk_header(line: &str) -> String {
    match line.splitn(3, "@@").nth(2).map(str::trim) {
        Some(label) if !label.is_empty() => format!("@@ {label}"),
        _ => "@@".to_string(),
    }
}

fn declaration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^\s*(?:export\s+)?(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:default\s+)?(?:(?:fn|struct|enum|trait|impl|mod|type|class|def|function|interface|const|static)\b|macro_rules!)",
        )
        .expect("valid regex")
    })
}

/// Structural outline of a new file: declaration lines only, capped.
pub fn skeleton(content: &str) -> String {
    let mut lines: Vec<String> = content
        .lines()
        .filter(|line| declaration_pattern().is_match(line))
        .map(|line| line.trim_end().trim_end_matches('{').trim_end().to_string())
        .take(SKELETON_MAX_LINES)
        .collect();
    if lines.is_empty() {
        lines = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .take(3)
            .map(str::to_string)
            .collect();
    }
    lines.join("\n")
}

pub(crate) fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out = text
        .chars()
        .take(limit.saturating_sub(3))
        .collect::<String>();
    out.push_str("...");
    out
}
