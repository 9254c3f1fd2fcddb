use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    timeline::{self, CueSheet},
    Result,
};

const TIMELINE_EXTENSIONS: [&str; 2] = ["tsv", "txt"];

/// All loaded cue sheets plus the one matching the piece currently playing.
#[derive(Debug, Default)]
pub struct CueLibrary {
    sheets: Vec<CueSheet>,
    active: Option<usize>,
}

impl CueLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sheets(sheets: Vec<CueSheet>) -> Self {
        Self {
            sheets,
            active: None,
        }
    }

    /// Loads every timeline file in `dir`. Files that fail to parse are skipped
    /// with a warning.
    pub fn load_all(dir: impl AsRef<Path>) -> Result<Self> {
        Self::load_all_with(dir, false)
    }

    /// Like [`CueLibrary::load_all`], optionally rewriting each file in
    /// normalized form first.
    pub fn load_all_with(dir: impl AsRef<Path>, normalize: bool) -> Result<Self> {
        let dir = dir.as_ref();
        let mut library = Self::new();
        for path in timeline_files(dir)? {
            match load_file(&path, normalize) {
                Ok(sheet) => {
                    tracing::debug!(
                        path = %path.display(),
                        events = sheet.event_count(),
                        "loaded cue sheet"
                    );
                    library.sheets.push(sheet);
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping cue sheet");
                }
            }
        }
        tracing::info!(dir = %dir.display(), sheets = library.len(), "cue library loaded");
        Ok(library)
    }

    pub fn sheets(&self) -> &[CueSheet] {
        &self.sheets
    }

    pub fn len(&self) -> usize {
        self.sheets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sheets.is_empty()
    }

    /// Selects the first sheet, in load order, matching the new track.
    pub fn on_track_changed(&mut self, artist: &str, title: &str) -> Option<&CueSheet> {
        let selected = self
            .sheets
            .iter()
            .position(|sheet| sheet.matches(artist, title));

        if selected != self.active {
            match selected.map(|index| &self.sheets[index]) {
                Some(sheet) => tracing::info!(sheet = sheet.name(), artist, title, "cue sheet selected"),
                None => tracing::info!(artist, title, "no cue sheet for track"),
            }
        }
        self.active = selected;
        self.active_sheet()
    }

    pub fn active_sheet(&self) -> Option<&CueSheet> {
        self.active.and_then(|index| self.sheets.get(index))
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }
}

/// Recognized timeline files in `dir`, sorted by file name.
pub fn timeline_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let recognized = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                TIMELINE_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            });
        if recognized && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Loads one timeline file, rewriting it in normalized form when requested.
/// Invalid files are left untouched.
pub fn load_file(path: &Path, normalize: bool) -> Result<CueSheet> {
    if normalize && timeline::normalize_file(path)? {
        tracing::info!(path = %path.display(), "normalized timeline");
    }
    CueSheet::load(path)
}
