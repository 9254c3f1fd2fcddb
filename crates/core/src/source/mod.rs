//! Providers of live performance samples.
//!
//! Everything that touches another process is confined to the
//! [`MemoryReader`] trait; the rest of this module turns raw reads into
//! plain [`BeatSample`] values.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::{
    clock::{BeatSample, Deck, DeckSample, TrackIdentity},
    offsets::{MemoryLayout, PointerChain},
    BeatCueError, Result,
};

const BEATS_PER_BAR: i64 = 4;
const TEXT_FIELD_LEN: usize = 100;

/// Produces a fresh snapshot of the performance on every poll.
pub trait Source {
    fn poll(&mut self) -> Result<BeatSample>;
}

impl<S: Source + ?Sized> Source for Box<S> {
    fn poll(&mut self) -> Result<BeatSample> {
        (**self).poll()
    }
}

/// Reuses the last good sample while the wrapped source fails. Before the
/// first good sample, failures propagate.
#[derive(Debug)]
pub struct StaleTolerant<S> {
    inner: S,
    last_good: Option<BeatSample>,
    stale: bool,
}

impl<S: Source> StaleTolerant<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            last_good: None,
            stale: false,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

impl<S: Source> Source for StaleTolerant<S> {
    fn poll(&mut self) -> Result<BeatSample> {
        match self.inner.poll() {
            Ok(sample) => {
                if self.stale {
                    tracing::info!("source recovered");
                    self.stale = false;
                }
                self.last_good = Some(sample.clone());
                Ok(sample)
            }
            Err(err) => match &self.last_good {
                Some(sample) => {
                    if !self.stale {
                        tracing::warn!(error = %err, "source read failed, reusing last sample");
                        self.stale = true;
                    }
                    Ok(sample.clone())
                }
                None => Err(err),
            },
        }
    }
}

/// A single deck playing at constant tempo, for running without a live
/// performance.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    tempo: f64,
    track: TrackIdentity,
    started: Instant,
}

impl SimulatedSource {
    pub fn new(tempo: f64, track: TrackIdentity) -> Self {
        Self {
            tempo,
            track,
            started: Instant::now(),
        }
    }

    /// Sample as it looks `elapsed` after the simulated track started. Beat
    /// numbers are 1-based.
    pub fn sample_at(&self, elapsed: Duration) -> BeatSample {
        let beats = if self.tempo > 0.0 {
            (elapsed.as_secs_f64() * self.tempo / 60.0).floor() as i64
        } else {
            0
        };
        BeatSample {
            tempo: self.tempo,
            active_deck: Deck::One,
            decks: [
                DeckSample {
                    beat_number: beats + 1,
                    track: self.track.clone(),
                },
                DeckSample::default(),
            ],
        }
    }
}

impl Source for SimulatedSource {
    fn poll(&mut self) -> Result<BeatSample> {
        Ok(self.sample_at(self.started.elapsed()))
    }
}

/// Replays a fixed list of samples and failures. The last sample repeats once
/// the script is exhausted.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: VecDeque<std::result::Result<BeatSample, String>>,
    last: Option<BeatSample>,
}

impl ScriptedSource {
    pub fn new(samples: impl IntoIterator<Item = BeatSample>) -> Self {
        Self {
            script: samples.into_iter().map(Ok).collect(),
            last: None,
        }
    }

    pub fn push(&mut self, sample: BeatSample) {
        self.script.push_back(Ok(sample));
    }

    pub fn push_failure(&mut self, reason: impl Into<String>) {
        self.script.push_back(Err(reason.into()));
    }
}

impl Source for ScriptedSource {
    fn poll(&mut self) -> Result<BeatSample> {
        match self.script.pop_front() {
            Some(Ok(sample)) => {
                self.last = Some(sample.clone());
                Ok(sample)
            }
            Some(Err(reason)) => Err(BeatCueError::SourceUnavailable(reason)),
            None => self
                .last
                .clone()
                .ok_or_else(|| BeatCueError::SourceUnavailable("empty script".to_string())),
        }
    }
}

/// Raw reads from another process's address space.
pub trait MemoryReader {
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<()>;
}

/// Reads a [`BeatSample`] by walking the pointer chains of a
/// [`MemoryLayout`] from the target module's base address.
#[derive(Debug)]
pub struct PointerSource<R> {
    reader: R,
    base: usize,
    layout: MemoryLayout,
}

impl<R: MemoryReader> PointerSource<R> {
    pub fn new(reader: R, base: usize, layout: MemoryLayout) -> Self {
        tracing::info!(version = %layout.version, base, "attached to live source");
        Self {
            reader,
            base,
            layout,
        }
    }

    fn resolve(&self, chain: &PointerChain) -> Result<usize> {
        let mut address = self.base;
        for &offset in &chain.offsets {
            let mut buf = [0u8; std::mem::size_of::<u64>()];
            self.reader.read(offset_address(address, offset)?, &mut buf)?;
            address = u64::from_le_bytes(buf) as usize;
        }
        offset_address(address, chain.final_offset)
    }

    fn read_array<const N: usize>(&self, chain: &PointerChain) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.reader.read(self.resolve(chain)?, &mut buf)?;
        Ok(buf)
    }

    fn read_i32(&self, chain: &PointerChain) -> Result<i32> {
        self.read_array(chain).map(i32::from_le_bytes)
    }

    fn read_text(&self, chain: &PointerChain) -> Result<String> {
        let buf: [u8; TEXT_FIELD_LEN] = self.read_array(chain)?;
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
    }

    fn read_deck(&self, bar: &PointerChain, beat: &PointerChain, artist: &PointerChain, title: &PointerChain) -> Result<DeckSample> {
        let bar = i64::from(self.read_i32(bar)?);
        let beat = i64::from(self.read_i32(beat)?);
        Ok(DeckSample {
            beat_number: bar * BEATS_PER_BAR + beat,
            track: TrackIdentity::new(self.read_text(artist)?, self.read_text(title)?),
        })
    }
}

impl<R: MemoryReader> Source for PointerSource<R> {
    fn poll(&mut self) -> Result<BeatSample> {
        let layout = &self.layout;
        let tempo = f32::from_le_bytes(self.read_array(&layout.master_tempo)?);
        let [index] = self.read_array::<1>(&layout.master_deck)?;
        let active_deck = Deck::from_index(index).ok_or_else(|| {
            BeatCueError::SourceUnavailable(format!("master deck index {index} out of range"))
        })?;
        let deck1 = self.read_deck(
            &layout.deck1_bar,
            &layout.deck1_beat,
            &layout.deck1_artist,
            &layout.deck1_title,
        )?;
        let deck2 = self.read_deck(
            &layout.deck2_bar,
            &layout.deck2_beat,
            &layout.deck2_artist,
            &layout.deck2_title,
        )?;
        Ok(BeatSample {
            tempo: f64::from(tempo),
            active_deck,
            decks: [deck1, deck2],
        })
    }
}

fn offset_address(address: usize, offset: usize) -> Result<usize> {
    address
        .checked_add(offset)
        .ok_or_else(|| BeatCueError::SourceUnavailable(format!("address overflow at {address:#x}+{offset:#x}")))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::offsets::OffsetDatabase;

    fn sample(beat: i64) -> BeatSample {
        BeatSample {
            tempo: 120.0,
            active_deck: Deck::One,
            decks: [
                DeckSample {
                    beat_number: beat,
                    track: TrackIdentity::default(),
                },
                DeckSample::default(),
            ],
        }
    }

    #[test]
    fn stale_tolerant_reuses_last_good_sample() {
        let mut script = ScriptedSource::new([sample(1)]);
        script.push_failure("read failed");
        script.push(sample(2));
        let mut source = StaleTolerant::new(script);

        assert_eq!(source.poll().unwrap(), sample(1));
        assert_eq!(source.poll().unwrap(), sample(1));
        assert!(source.is_stale());
        assert_eq!(source.poll().unwrap(), sample(2));
        assert!(!source.is_stale());
    }

    #[test]
    fn stale_tolerant_propagates_initial_failure() {
        let mut script = ScriptedSource::default();
        script.push_failure("process not found");
        let mut source = StaleTolerant::new(script);
        assert!(matches!(source.poll(), Err(BeatCueError::SourceUnavailable(_))));
    }

    #[test]
    fn scripted_source_repeats_last_sample() {
        let mut source = ScriptedSource::new([sample(3)]);
        source.poll().unwrap();
        assert_eq!(source.poll().unwrap(), sample(3));
    }

    #[test]
    fn simulated_source_counts_beats() {
        let source = SimulatedSource::new(120.0, TrackIdentity::new("Air", "Sexy Boy"));
        assert_eq!(source.sample_at(Duration::ZERO).active().beat_number, 1);
        assert_eq!(source.sample_at(Duration::from_millis(1_600)).active().beat_number, 4);
        assert_eq!(source.sample_at(Duration::ZERO).active().track.title, "Sexy Boy");
    }

    /// Sparse fake address space.
    #[derive(Default)]
    struct FakeMemory {
        bytes: BTreeMap<usize, u8>,
    }

    impl FakeMemory {
        fn write(&mut self, address: usize, data: &[u8]) {
            for (i, byte) in data.iter().enumerate() {
                self.bytes.insert(address + i, *byte);
            }
        }
    }

    impl MemoryReader for FakeMemory {
        fn read(&self, address: usize, buf: &mut [u8]) -> Result<()> {
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = *self.bytes.get(&(address + i)).ok_or_else(|| {
                    BeatCueError::SourceUnavailable(format!("unmapped {:#x}", address + i))
                })?;
            }
            Ok(())
        }
    }

    #[test]
    fn pointer_source_walks_chains() {
        let layout = OffsetDatabase::parse(crate::offsets::tests::DATABASE)
            .unwrap()
            .get("6.8.4")
            .unwrap()
            .clone();
        let base = 0x1000;
        let mut memory = FakeMemory::default();

        // base+0x10 -> deck 1 struct at 0x2000, whose +0x20 -> 0x3000.
        memory.write(base + 0x10, &0x2000u64.to_le_bytes());
        memory.write(0x2000 + 0x20, &0x3000u64.to_le_bytes());
        memory.write(0x2000 + 0x28, &0x4000u64.to_le_bytes());
        memory.write(0x3000, &3i32.to_le_bytes());
        memory.write(0x3004, &2i32.to_le_bytes());
        memory.write(0x4000, &7i32.to_le_bytes());
        memory.write(0x4004, &1i32.to_le_bytes());

        memory.write(base + 0x30, &0x5000u64.to_le_bytes());
        memory.write(0x5008, &126.5f32.to_le_bytes());
        memory.write(base + 0x40, &0x6000u64.to_le_bytes());
        memory.write(0x6001, &[1]);

        memory.write(base + 0x50, &0x7000u64.to_le_bytes());
        memory.write(base + 0x58, &0x8000u64.to_le_bytes());
        for (address, text) in [
            (0x7000, "Daft Punk"),
            (0x7064, "One More Time"),
            (0x8000, "Air"),
            (0x8064, "Sexy Boy"),
        ] {
            let mut field = [0u8; TEXT_FIELD_LEN];
            field[..text.len()].copy_from_slice(text.as_bytes());
            memory.write(address, &field);
        }

        let mut source = PointerSource::new(memory, base, layout);
        let sample = source.poll().unwrap();
        assert_eq!(sample.tempo, 126.5);
        assert_eq!(sample.active_deck, Deck::Two);
        assert_eq!(sample.deck(Deck::One).beat_number, 14);
        assert_eq!(sample.deck(Deck::Two).beat_number, 29);
        assert_eq!(sample.deck(Deck::One).track, TrackIdentity::new("Daft Punk", "One More Time"));
        assert_eq!(sample.active().track.title, "Sexy Boy");
    }

    #[test]
    fn pointer_source_reports_unreadable_memory() {
        let layout = OffsetDatabase::parse(crate::offsets::tests::DATABASE)
            .unwrap()
            .latest()
            .unwrap()
            .clone();
        let mut source = PointerSource::new(FakeMemory::default(), 0x1000, layout);
        assert!(matches!(source.poll(), Err(BeatCueError::SourceUnavailable(_))));
    }
}
