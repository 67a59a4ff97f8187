//! Locating the artifact a one-shot worker reports in its output.
//!
//! Worker binaries announce where they wrote their result in a handful of
//! different phrasings. Parsing is best-effort: callers fall back to the
//! path they asked for when nothing matches.

use std::sync::LazyLock;

use regex::Regex;

/// Extensions recognised when a bare absolute path is printed.
pub const ARTIFACT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif", "mp4", "webm"];

/// Announcement phrases, tried in order.
static ANNOUNCEMENT_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)saved image to:?\s*(\S+)",
        r"(?i)output:\s*(\S+)",
        r"(?i)writing to:?\s*(\S+)",
        r"(?i)generated:\s*(\S+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static BARE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    let exts = ARTIFACT_EXTENSIONS.join("|");
    Regex::new(&format!(r"(?im)(?:^|[\s'\x22=(])(/[^\s'\x22]+\.(?:{exts}))\b"))
        .expect("valid regex")
});

/// Candidate artifact paths found in a worker's output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactHints {
    /// First phrase announcement. Every stream is searched for phrases
    /// before any bare path is considered.
    pub announced: Option<String>,
    /// Bare absolute paths with an artifact extension, in order of
    /// appearance across the streams.
    pub bare: Vec<String>,
}

impl ArtifactHints {
    /// The announced path, else the first bare path.
    pub fn best(&self) -> Option<&str> {
        self.announced
            .as_deref()
            .or_else(|| self.bare.first().map(String::as_str))
    }
}

/// Scan captured output streams (typically stdout then stderr) for
/// artifact paths.
///
/// Phrases are tried in order across all streams. Trailing punctuation
/// and quotes are stripped from captured paths.
pub fn scan_output(streams: &[&str]) -> ArtifactHints {
    let announced = ANNOUNCEMENT_RES.iter().find_map(|re| {
        streams.iter().find_map(|output| {
            re.captures_iter(output)
                .map(|caps| clean_path(&caps[1]).to_string())
                .find(|path| !path.is_empty())
        })
    });

    let bare = streams
        .iter()
        .flat_map(|output| BARE_PATH_RE.captures_iter(output))
        .map(|caps| clean_path(&caps[1]).to_string())
        .collect();

    ArtifactHints { announced, bare }
}

fn clean_path(raw: &str) -> &str {
    raw.trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim_end_matches(['.', ',', ';', ':'])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
