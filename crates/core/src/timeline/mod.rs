//! Cue timelines: tab-separated per-song files mapping beat times to OSC
//! messages.
//!
//! ```text
//! Match Song    <title>  <title>...
//! Match Artist  <artist> <artist>...
//! <header line>
//! <beat or bar.beat>  <fraction>  <address> <value> <type>  ...
//! ```
//!
//! Lines starting with `#` are comments. Data rows between two non-data
//! lines form a block; blocks only matter when the file is rewritten in
//! normalized form. At runtime every row is merged into one sorted list of
//! [`CueInstant`]s.

use std::{collections::HashSet, fmt, fs, path::Path};

use rosc::{OscMessage, OscType};
use serde::{Deserialize, Serialize};

use crate::{BeatCueError, Result};

const BEATS_PER_BAR: i64 = 4;
const MATCH_SONG: &str = "Match Song";
const MATCH_ARTIST: &str = "Match Artist";

/// Type tag of a cue payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Int,
    Float,
    Str,
}

impl ValueKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "i" => Some(Self::Int),
            "f" => Some(Self::Float),
            "s" => Some(Self::Str),
            _ => None,
        }
    }

    pub fn tag(self) -> char {
        match self {
            Self::Int => 'i',
            Self::Float => 'f',
            Self::Str => 's',
        }
    }
}

/// Payload of a cue, validated against its type tag at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CueValue {
    Int(i32),
    Float(f32),
    Str(String),
}

impl CueValue {
    pub fn parse(kind: ValueKind, raw: &str) -> std::result::Result<Self, String> {
        match kind {
            ValueKind::Int => raw
                .trim()
                .parse()
                .map(Self::Int)
                .map_err(|_| format!("`{raw}` is not an integer")),
            ValueKind::Float => raw
                .trim()
                .parse()
                .map(Self::Float)
                .map_err(|_| format!("`{raw}` is not a float")),
            ValueKind::Str => Ok(Self::Str(raw.to_string())),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Str(_) => ValueKind::Str,
        }
    }

    pub fn to_osc(&self) -> OscType {
        match self {
            Self::Int(value) => OscType::Int(*value),
            Self::Float(value) => OscType::Float(*value),
            Self::Str(value) => OscType::String(value.clone()),
        }
    }
}

impl fmt::Display for CueValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Str(value) => f.write_str(value),
        }
    }
}

/// A single outbound message anchored to an absolute beat time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CueEvent {
    pub beat_time: f64,
    pub address: String,
    pub value: CueValue,
}

impl CueEvent {
    pub fn new(beat_time: f64, address: impl Into<String>, value: CueValue) -> Self {
        Self {
            beat_time,
            address: address.into(),
            value,
        }
    }

    pub fn to_message(&self) -> OscMessage {
        OscMessage {
            addr: self.address.clone(),
            args: vec![self.value.to_osc()],
        }
    }
}

/// All cues sharing one beat time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CueInstant {
    pub beat_time: f64,
    pub events: Vec<CueEvent>,
}

/// One song's timeline plus the metadata that selects it.
#[derive(Debug, Clone)]
pub struct CueSheet {
    name: String,
    match_titles: Vec<String>,
    match_artists: Vec<String>,
    title_keys: HashSet<String>,
    artist_keys: HashSet<String>,
    instants: Vec<CueInstant>,
}

impl CueSheet {
    /// Parses timeline text.
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_named(String::new(), text)
    }

    pub fn parse_named(name: impl Into<String>, text: &str) -> Result<Self> {
        let document = Document::parse(text)?;
        Ok(Self::from_document(name.into(), document))
    }

    /// Reads and parses a timeline file. The sheet is named after the file stem.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Self::parse_named(sheet_name(path), &text)
    }

    fn from_document(name: String, document: Document) -> Self {
        let instants = merge_rows(document.rows());
        let title_keys = match_keys(&document.match_titles);
        let artist_keys = match_keys(&document.match_artists);
        Self {
            name,
            match_titles: document.match_titles,
            match_artists: document.match_artists,
            title_keys,
            artist_keys,
            instants,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn match_titles(&self) -> &[String] {
        &self.match_titles
    }

    pub fn match_artists(&self) -> &[String] {
        &self.match_artists
    }

    /// Sorted instants, one per distinct beat time.
    pub fn instants(&self) -> &[CueInstant] {
        &self.instants
    }

    pub fn event_count(&self) -> usize {
        self.instants.iter().map(|instant| instant.events.len()).sum()
    }

    /// Case and punctuation insensitive membership test against the declared
    /// artists and titles.
    pub fn matches(&self, artist: &str, title: &str) -> bool {
        self.artist_keys.contains(&normalize_key(artist))
            && self.title_keys.contains(&normalize_key(title))
    }

    /// Instants with `start <= beat_time <= end`.
    pub fn instants_between(&self, start: f64, end: f64) -> &[CueInstant] {
        let lo = self.instants.partition_point(|i| i.beat_time < start);
        let hi = self.instants.partition_point(|i| i.beat_time <= end);
        self.instants.get(lo..hi).unwrap_or(&[])
    }

    /// Instants with `after < beat_time <= through`.
    pub fn instants_after(&self, after: f64, through: f64) -> &[CueInstant] {
        let lo = self.instants.partition_point(|i| i.beat_time <= after);
        let hi = self.instants.partition_point(|i| i.beat_time <= through);
        self.instants.get(lo..hi).unwrap_or(&[])
    }

    /// Events in `[start, end]`, in ascending beat time.
    pub fn query(&self, start: f64, end: f64) -> impl Iterator<Item = &CueEvent> {
        self.instants_between(start, end)
            .iter()
            .flat_map(|instant| instant.events.iter())
    }
}

/// Rewrites timeline text in normalized form: each block sorted by beat time
/// with co-timed rows merged, comments and header lines kept in place, times
/// written as whole beat plus fraction. Loading the output yields the same
/// instants as loading the input.
pub fn normalize(text: &str) -> Result<String> {
    Ok(Document::parse(text)?.render())
}

/// Normalizes a timeline file in place. Returns whether the file changed.
pub fn normalize_file(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let original = fs::read_to_string(path)?;
    let normalized = normalize(&original)?;
    if normalized == original {
        return Ok(false);
    }
    fs::write(path, normalized)?;
    tracing::debug!(path = %path.display(), "rewrote timeline in normalized form");
    Ok(true)
}

fn sheet_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Lower-cased alphanumeric characters only.
pub fn normalize_key(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn match_keys(entries: &[String]) -> HashSet<String> {
    entries
        .iter()
        .map(|entry| normalize_key(entry))
        .filter(|key| !key.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
struct Row {
    beat_time: f64,
    events: Vec<CueEvent>,
}

#[derive(Debug)]
enum Element {
    Verbatim(String),
    Block(Vec<Row>),
}

#[derive(Debug, Default)]
struct Document {
    match_titles: Vec<String>,
    match_artists: Vec<String>,
    elements: Vec<Element>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    MatchSong,
    MatchArtist,
    Header,
    Rows,
}

impl Document {
    fn parse(text: &str) -> Result<Self> {
        let mut document = Document::default();
        let mut block = Vec::new();
        let mut stage = Stage::MatchSong;
        let mut line_count = 0;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            line_count = line_no;

            if raw.starts_with('#') {
                document.flush(&mut block);
                let comment = raw.strip_suffix('\r').unwrap_or(raw);
                document.elements.push(Element::Verbatim(comment.to_string()));
                continue;
            }

            let cleaned = raw.replace('"', "");
            let line = cleaned.trim_end();
            if line.trim().is_empty() {
                continue;
            }

            match stage {
                Stage::MatchSong => {
                    document.match_titles = parse_match_line(line, MATCH_SONG, line_no)?;
                    stage = Stage::MatchArtist;
                }
                Stage::MatchArtist => {
                    document.match_artists = parse_match_line(line, MATCH_ARTIST, line_no)?;
                    stage = Stage::Header;
                }
                Stage::Header => stage = Stage::Rows,
                Stage::Rows => {
                    block.push(parse_row(line, line_no)?);
                    continue;
                }
            }
            document.elements.push(Element::Verbatim(line.to_string()));
        }
        document.flush(&mut block);

        let missing = match stage {
            Stage::MatchSong => Some(format!("missing `{MATCH_SONG}` line")),
            Stage::MatchArtist => Some(format!("missing `{MATCH_ARTIST}` line")),
            Stage::Header => Some("missing header line".to_string()),
            Stage::Rows => None,
        };
        match missing {
            Some(message) => Err(BeatCueError::parse(line_count + 1, message)),
            None => Ok(document),
        }
    }

    fn flush(&mut self, block: &mut Vec<Row>) {
        if !block.is_empty() {
            self.elements.push(Element::Block(std::mem::take(block)));
        }
    }

    fn rows(&self) -> impl Iterator<Item = &Row> {
        self.elements.iter().flat_map(|element| match element {
            Element::Block(rows) => rows.as_slice(),
            Element::Verbatim(_) => &[][..],
        })
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for element in &self.elements {
            match element {
                Element::Verbatim(line) => {
                    out.push_str(line);
                    out.push('\n');
                }
                Element::Block(rows) => {
                    for instant in merge_rows(rows.iter()) {
                        render_instant(&mut out, &instant);
                    }
                }
            }
        }
        out
    }
}

fn render_instant(out: &mut String, instant: &CueInstant) {
    let whole = instant.beat_time.trunc();
    let fraction = instant.beat_time - whole;
    out.push_str(&format!("{}\t{}", whole as i64, fraction));
    for event in &instant.events {
        out.push_str(&format!(
            "\t{}\t{}\t{}",
            event.address,
            event.value,
            event.value.kind().tag()
        ));
    }
    out.push('\n');
}

/// Stable merge of rows into strictly ascending instants. Rows with equal
/// beat times keep their relative order.
fn merge_rows<'a>(rows: impl Iterator<Item = &'a Row>) -> Vec<CueInstant> {
    let mut rows: Vec<&Row> = rows.collect();
    rows.sort_by(|a, b| a.beat_time.total_cmp(&b.beat_time));

    let mut instants: Vec<CueInstant> = Vec::with_capacity(rows.len());
    for row in rows {
        match instants.last_mut() {
            Some(last) if last.beat_time == row.beat_time => {
                last.events.extend(row.events.iter().cloned());
            }
            _ => instants.push(CueInstant {
                beat_time: row.beat_time,
                events: row.events.clone(),
            }),
        }
    }
    instants
}

fn parse_match_line(line: &str, expected: &str, line_no: usize) -> Result<Vec<String>> {
    let mut cells = line.split('\t');
    if cells.next().map(str::trim) != Some(expected) {
        return Err(BeatCueError::parse(
            line_no,
            format!("expected `{expected}` line"),
        ));
    }
    Ok(cells
        .map(str::trim)
        .filter(|cell| !cell.is_empty())
        .map(str::to_string)
        .collect())
}

fn parse_row(line: &str, line_no: usize) -> Result<Row> {
    let cells: Vec<&str> = line.split('\t').collect();
    if cells.len() < 5 || (cells.len() - 2) % 3 != 0 {
        return Err(BeatCueError::parse(
            line_no,
            format!(
                "expected beat, fraction and address/value/type triples, found {} cells",
                cells.len()
            ),
        ));
    }

    let beat_time = parse_beat_time(cells[0], cells[1], line_no)?;
    let events = cells[2..]
        .chunks_exact(3)
        .map(|triple| parse_event(beat_time, triple, line_no))
        .collect::<Result<Vec<_>>>()?;
    Ok(Row { beat_time, events })
}

fn parse_event(beat_time: f64, triple: &[&str], line_no: usize) -> Result<CueEvent> {
    let (address, raw, tag) = (triple[0].trim(), triple[1], triple[2].trim());
    if address.is_empty() {
        return Err(BeatCueError::parse(line_no, "empty address"));
    }
    let kind = ValueKind::from_tag(tag)
        .ok_or_else(|| BeatCueError::parse(line_no, format!("unknown type tag `{tag}`")))?;
    let value = CueValue::parse(kind, raw).map_err(|message| BeatCueError::parse(line_no, message))?;
    Ok(CueEvent::new(beat_time, address, value))
}

/// `beat` is a plain beat number or a 1-indexed `bar.beat` pair in 4/4.
/// 2^53: every whole beat below this is exact and fits the normalized form.
const MAX_BEAT_TIME: f64 = 9_007_199_254_740_992.0;

fn parse_beat_time(beat: &str, fraction: &str, line_no: usize) -> Result<f64> {
    let beat = beat.trim();
    let base = match beat.split_once('.') {
        Some((bar, beat_in_bar)) => {
            let bar: i64 = parse_number(bar, line_no)?;
            let beat_in_bar: i64 = parse_number(beat_in_bar, line_no)?;
            bar.checked_sub(1)
                .and_then(|bar| bar.checked_mul(BEATS_PER_BAR))
                .and_then(|beats| beats.checked_add(beat_in_bar))
                .ok_or_else(|| BeatCueError::parse(line_no, "beat time is out of range"))?
                as f64
        }
        None => parse_number(beat, line_no)?,
    };

    let fraction = fraction.trim();
    let fraction = if fraction.is_empty() {
        0.0
    } else {
        parse_number::<f64>(fraction, line_no)?
    };

    let beat_time = base + fraction;
    if !beat_time.is_finite() {
        return Err(BeatCueError::parse(line_no, "beat time is not finite"));
    }
    if beat_time.abs() >= MAX_BEAT_TIME {
        return Err(BeatCueError::parse(line_no, "beat time is out of range"));
    }
    Ok(beat_time)
}

fn parse_number<T: std::str::FromStr>(text: &str, line_no: usize) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| BeatCueError::parse(line_no, format!("`{text}` is not a number")))
}
