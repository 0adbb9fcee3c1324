use crate::config::{normalize_lexically, NotebookMode};
use crate::errors::RcaError;
use crate::runtime::FileSystem;
use serde_json::Value;
use std::path::PathBuf;

pub const DEFAULT_MAX_READ_BYTES: usize = 2_097_152;
pub const NOTE_NOTEBOOK: &str = "Converted from .ipynb";
pub const NOTE_TRUNCATED: &str = "Truncated large input for performance";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContents {
    pub text: String,
    pub note: Option<String>,
    pub path: PathBuf,
    /// Size of the file on disk, before conversion or truncation.
    pub size: usize,
    pub truncated: bool,
}

pub trait FileReader {
    fn read(
        &self,
        path: &str,
        max_bytes: usize,
        mode: NotebookMode,
    ) -> Result<FileContents, RcaError>;
}

/// Reads through the runtime [`FileSystem`] seam.
pub struct FsFileReader<'a> {
    fs: &'a dyn FileSystem,
    cwd: PathBuf,
    home: Option<PathBuf>,
}

impl<'a> FsFileReader<'a> {
    pub fn new(fs: &'a dyn FileSystem, cwd: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            cwd: cwd.into(),
            home: dirs::home_dir(),
        }
    }

    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let expanded = match (raw.strip_prefix('~'), &self.home) {
            (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with(['/', '\\']) => {
                home.join(rest.trim_start_matches(['/', '\\']))
            }
            _ => PathBuf::from(raw),
        };
        let absolute = if expanded.is_absolute() {
            expanded
        } else {
            self.cwd.join(expanded)
        };
        normalize_lexically(&absolute)
    }
}

impl FileReader for FsFileReader<'_> {
    fn read(
        &self,
        path: &str,
        max_bytes: usize,
        mode: NotebookMode,
    ) -> Result<FileContents, RcaError> {
        let resolved = self.resolve(path);
        let bytes = self.fs.read_bytes(&resolved)?;
        let size = bytes.len();
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        let mut notes = Vec::new();

        let is_notebook = resolved
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("ipynb"));
        if is_notebook && mode == NotebookMode::Cells {
            if let Some(flattened) = flatten_notebook(&text).filter(|t| !t.is_empty()) {
                text = flattened;
                notes.push(NOTE_NOTEBOOK);
            }
        }

        let truncated = clamp_utf8(&mut text, max_bytes);
        if truncated {
            notes.push(NOTE_TRUNCATED);
        }

        Ok(FileContents {
            text,
            note: (!notes.is_empty()).then(|| notes.join("; ")),
            path: resolved,
            size,
            truncated,
        })
    }
}

/// Cell sources tagged by kind; `None` when the text is not a notebook.
pub fn flatten_notebook(raw: &str) -> Option<String> {
    let notebook: Value = serde_json::from_str(raw).ok()?;
    let cells = notebook.get("cells")?.as_array()?;
    let pieces = cells
        .iter()
        .filter_map(|cell| {
            let source = match cell.get("source")? {
                Value::String(s) => s.clone(),
                Value::Array(parts) => parts.iter().filter_map(Value::as_str).collect(),
                _ => return None,
            };
            let tag = match cell.get("cell_type").and_then(Value::as_str) {
                Some("markdown") => "md",
                _ => "code",
            };
            Some(format!("\n# [{tag}]\n{source}"))
        })
        .collect::<Vec<_>>();
    Some(pieces.join("\n").trim().to_string())
}

/// Cuts `text` to at most `limit` bytes on a char boundary. Zero means no limit.
pub fn clamp_utf8(text: &mut String, limit: usize) -> bool {
    if limit == 0 || text.len() <= limit {
        return false;
    }
    let mut cut = limit;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    true
}
