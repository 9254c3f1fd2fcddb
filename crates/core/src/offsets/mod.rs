//! Versioned memory layouts of the DJ software the live source reads from.
//!
//! The database is a text file of blank-line separated blocks. Each block is
//! a version string followed by ten pointer chains in a fixed order (see
//! [`MemoryLayout`]). `#` lines are comments. A pointer chain is a list of
//! whitespace separated hex numbers; every number but the last is an offset
//! to dereference, the last is added to the final address.

use std::{collections::BTreeMap, fs, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{BeatCueError, Result};

const CHAINS_PER_LAYOUT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerChain {
    pub offsets: Vec<usize>,
    pub final_offset: usize,
}

impl FromStr for PointerChain {
    type Err = BeatCueError;

    fn from_str(s: &str) -> Result<Self> {
        let mut numbers = s
            .split_whitespace()
            .map(|token| {
                let digits = token.trim_start_matches("0x").trim_start_matches("0X");
                usize::from_str_radix(digits, 16)
                    .map_err(|_| BeatCueError::Config(format!("`{token}` is not a hex offset")))
            })
            .collect::<Result<Vec<_>>>()?;
        let final_offset = numbers
            .pop()
            .ok_or_else(|| BeatCueError::Config("empty pointer chain".to_string()))?;
        Ok(Self {
            offsets: numbers,
            final_offset,
        })
    }
}

/// Pointer chains for every value the live source reads, for one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLayout {
    pub version: String,
    pub deck1_bar: PointerChain,
    pub deck1_beat: PointerChain,
    pub deck2_bar: PointerChain,
    pub deck2_beat: PointerChain,
    pub master_tempo: PointerChain,
    pub master_deck: PointerChain,
    pub deck1_artist: PointerChain,
    pub deck1_title: PointerChain,
    pub deck2_artist: PointerChain,
    pub deck2_title: PointerChain,
}

impl MemoryLayout {
    fn from_block(block: &[&str]) -> Result<Self> {
        let (version, chains) = match block.split_first() {
            Some((version, chains)) if chains.len() == CHAINS_PER_LAYOUT => (version, chains),
            _ => {
                return Err(BeatCueError::Config(format!(
                    "layout block `{}` has {} pointer chains, expected {CHAINS_PER_LAYOUT}",
                    block.first().unwrap_or(&""),
                    block.len().saturating_sub(1)
                )))
            }
        };
        let chain = |index: usize| -> Result<PointerChain> {
            chains[index].parse().map_err(|err| {
                BeatCueError::Config(format!("version {version}, chain {}: {err}", index + 1))
            })
        };
        Ok(Self {
            version: version.trim().to_string(),
            deck1_bar: chain(0)?,
            deck1_beat: chain(1)?,
            deck2_bar: chain(2)?,
            deck2_beat: chain(3)?,
            master_tempo: chain(4)?,
            master_deck: chain(5)?,
            deck1_artist: chain(6)?,
            deck1_title: chain(7)?,
            deck2_artist: chain(8)?,
            deck2_title: chain(9)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct OffsetDatabase {
    layouts: BTreeMap<String, MemoryLayout>,
}

impl OffsetDatabase {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            BeatCueError::Config(format!("cannot read offsets {}: {err}", path.display()))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut layouts = BTreeMap::new();
        let mut block: Vec<&str> = Vec::new();
        for line in text.lines().chain(std::iter::once("")) {
            if line.trim().is_empty() {
                if !block.is_empty() {
                    let layout = MemoryLayout::from_block(&block)?;
                    layouts.insert(layout.version.clone(), layout);
                    block.clear();
                }
            } else if !line.starts_with('#') {
                block.push(line);
            }
        }
        if layouts.is_empty() {
            return Err(BeatCueError::Config("offset database has no layouts".to_string()));
        }
        Ok(Self { layouts })
    }

    pub fn get(&self, version: &str) -> Result<&MemoryLayout> {
        self.layouts
            .get(version)
            .ok_or_else(|| BeatCueError::Config(format!("unsupported version `{version}`")))
    }

    /// The layout with the greatest version string.
    pub fn latest(&self) -> Option<&MemoryLayout> {
        self.layouts.values().next_back()
    }

    /// Resolves an explicit version, or the latest one when none is given.
    pub fn resolve(&self, version: Option<&str>) -> Result<&MemoryLayout> {
        match version {
            Some(version) => self.get(version),
            None => self
                .latest()
                .ok_or_else(|| BeatCueError::Config("offset database is empty".to_string())),
        }
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.layouts.keys().map(String::as_str)
    }
}
