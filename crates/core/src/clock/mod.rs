//! Beat tracking on top of a coarse, periodically polled performance state.
//!
//! The source only exposes integer beat counters and a tempo. [`BeatClock`]
//! interpolates between counter changes so downstream consumers see a
//! continuously advancing beat position.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const SECONDS_PER_MINUTE: f64 = 60.0;
const MICROS_PER_MINUTE: f64 = 60_000_000.0;

/// One of the two playback decks exposed by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Deck {
    One,
    Two,
}

impl Deck {
    pub const ALL: [Deck; 2] = [Deck::One, Deck::Two];

    /// Maps the source's zero-based master deck index.
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Deck::One),
            1 => Some(Deck::Two),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Deck::One => 0,
            Deck::Two => 1,
        }
    }

    /// One-based deck number as printed on the hardware.
    pub fn number(self) -> u8 {
        self.index() as u8 + 1
    }
}

/// Artist and title of the piece loaded on a deck.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackIdentity {
    pub artist: String,
    pub title: String,
}

impl TrackIdentity {
    pub fn new(artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            artist: artist.into(),
            title: title.into(),
        }
    }
}

/// Per-deck part of a [`BeatSample`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeckSample {
    pub beat_number: i64,
    pub track: TrackIdentity,
}

/// Snapshot produced by a [`Source`](crate::Source) on every poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatSample {
    pub tempo: f64,
    pub active_deck: Deck,
    pub decks: [DeckSample; 2],
}

impl BeatSample {
    pub fn deck(&self, deck: Deck) -> &DeckSample {
        &self.decks[deck.index()]
    }

    pub fn active(&self) -> &DeckSample {
        self.deck(self.active_deck)
    }
}

/// Interpolated position maintained by [`BeatClock`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BeatPosition {
    pub integer_beat: i64,
    /// Progress towards the next beat, in `[0, 1)`.
    pub fraction: f64,
    pub tempo: f64,
    pub latency_offset_micros: f64,
}

impl BeatPosition {
    /// Latency offset expressed in beats at the current tempo.
    pub fn offset_beats(&self) -> f64 {
        if self.tempo > 0.0 {
            self.latency_offset_micros * self.tempo / MICROS_PER_MINUTE
        } else {
            0.0
        }
    }

    /// Fraction with the latency offset applied, always in `[0, 1)`.
    pub fn corrected_fraction(&self) -> f64 {
        (self.fraction + self.offset_beats()).rem_euclid(1.0)
    }

    /// Absolute beat position: integer beat plus corrected fraction.
    pub fn absolute(&self) -> f64 {
        self.integer_beat as f64 + self.corrected_fraction()
    }
}

/// Discrete changes detected while sampling.
#[derive(Debug, Clone, PartialEq)]
pub enum BeatEvent {
    /// The master deck changed; the clock was re-anchored on its beat counter.
    SourceSwitched { deck: Deck, beat: i64 },
    /// The active beat counter changed (by any amount).
    NewBeat(i64),
    TempoChanged(f64),
    TrackChanged { deck: Deck, track: TrackIdentity },
}

/// Turns discrete beat counters into a continuously advancing beat position.
#[derive(Debug, Default)]
pub struct BeatClock {
    position: BeatPosition,
    active_deck: Option<Deck>,
    last_tempo: Option<f64>,
    tracks: [Option<TrackIdentity>; 2],
    holding: bool,
}

impl BeatClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a fresh sample and the wall-clock time elapsed since the previous
    /// one. Returns the discrete changes observed.
    pub fn sample(&mut self, sample: &BeatSample, elapsed: Duration) -> Vec<BeatEvent> {
        let mut events = Vec::new();

        for deck in Deck::ALL {
            let track = &sample.deck(deck).track;
            let slot = &mut self.tracks[deck.index()];
            if slot.as_ref() != Some(track) {
                *slot = Some(track.clone());
                tracing::info!(
                    deck = deck.number(),
                    artist = %track.artist,
                    title = %track.title,
                    "track changed"
                );
                events.push(BeatEvent::TrackChanged {
                    deck,
                    track: track.clone(),
                });
            }
        }

        let tempo_changed = self
            .last_tempo
            .map_or(true, |last| last.to_bits() != sample.tempo.to_bits());
        self.position.tempo = sample.tempo;

        let beat = sample.active().beat_number;
        match self.active_deck {
            None => {
                self.anchor(sample.active_deck, beat);
                events.push(BeatEvent::NewBeat(beat));
            }
            Some(previous) if previous != sample.active_deck => {
                tracing::info!(deck = sample.active_deck.number(), beat, "master deck switched");
                self.anchor(sample.active_deck, beat);
                events.push(BeatEvent::SourceSwitched {
                    deck: sample.active_deck,
                    beat,
                });
            }
            Some(_) if beat != self.position.integer_beat => {
                self.anchor(sample.active_deck, beat);
                events.push(BeatEvent::NewBeat(beat));
            }
            Some(_) => self.advance(elapsed),
        }

        if tempo_changed {
            self.last_tempo = Some(sample.tempo);
            tracing::info!(tempo = sample.tempo, "tempo changed");
            events.push(BeatEvent::TempoChanged(sample.tempo));
        }

        events
    }

    fn anchor(&mut self, deck: Deck, beat: i64) {
        self.active_deck = Some(deck);
        self.position.integer_beat = beat;
        self.position.fraction = 0.0;
    }

    fn advance(&mut self, elapsed: Duration) {
        let tempo = self.position.tempo;
        if !(tempo > 0.0) {
            if !self.holding {
                tracing::warn!(tempo, "non-positive tempo, holding beat fraction");
                self.holding = true;
            }
            return;
        }
        self.holding = false;
        let advanced = self.position.fraction + self.delta_beats(elapsed);
        self.position.fraction = advanced % 1.0;
    }

    /// Number of beats covered by `elapsed` at the current tempo. Zero when the
    /// tempo is not positive.
    pub fn delta_beats(&self, elapsed: Duration) -> f64 {
        let tempo = self.position.tempo;
        if tempo > 0.0 {
            elapsed.as_secs_f64() * tempo / SECONDS_PER_MINUTE
        } else {
            0.0
        }
    }

    pub fn position(&self) -> BeatPosition {
        self.position
    }

    /// Absolute beat position including the latency correction.
    pub fn current_position(&self) -> f64 {
        self.position.absolute()
    }

    /// Beat fraction including the latency correction.
    pub fn beat_fraction(&self) -> f64 {
        self.position.corrected_fraction()
    }

    pub fn tempo(&self) -> f64 {
        self.position.tempo
    }

    pub fn active_deck(&self) -> Option<Deck> {
        self.active_deck
    }

    pub fn latency_offset_micros(&self) -> f64 {
        self.position.latency_offset_micros
    }

    /// Shifts the latency correction. Positive values move the reported
    /// position ahead of the source.
    pub fn nudge_latency_millis(&mut self, millis: f64) {
        self.position.latency_offset_micros += millis * 1000.0;
        tracing::info!(
            offset_ms = self.position.latency_offset_micros / 1000.0,
            "latency offset adjusted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_micros(8_333);

    fn sample(tempo: f64, deck: Deck, beats: [i64; 2]) -> BeatSample {
        BeatSample {
            tempo,
            active_deck: deck,
            decks: [
                DeckSample {
                    beat_number: beats[0],
                    track: TrackIdentity::new("Daft Punk", "One More Time"),
                },
                DeckSample {
                    beat_number: beats[1],
                    track: TrackIdentity::new("Air", "La Femme d'Argent"),
                },
            ],
        }
    }

    #[test]
    fn first_sample_anchors_the_clock() {
        let mut clock = BeatClock::new();
        let events = clock.sample(&sample(128.0, Deck::One, [17, 3]), Duration::ZERO);

        assert!(events.contains(&BeatEvent::NewBeat(17)));
        assert!(events.contains(&BeatEvent::TempoChanged(128.0)));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, BeatEvent::TrackChanged { .. }))
                .count(),
            2
        );
        assert_eq!(clock.position().integer_beat, 17);
        assert_eq!(clock.position().fraction, 0.0);
        assert_eq!(clock.active_deck(), Some(Deck::One));
    }

    #[test]
    fn fraction_wraps_after_one_beat_of_ticks() {
        let mut clock = BeatClock::new();
        let s = sample(120.0, Deck::One, [1, 1]);
        clock.sample(&s, Duration::ZERO);

        let tick = Duration::from_secs_f64(1.0 / 120.0);
        // `tick` is truncated to whole nanoseconds, a little under 1/120 s.
        assert!((clock.delta_beats(tick) - 1.0 / 60.0).abs() < 1e-8);

        for _ in 0..60 {
            let events = clock.sample(&s, tick);
            assert!(events.is_empty());
        }
        let fraction = clock.position().fraction;
        assert!(fraction < 1e-6 || fraction > 1.0 - 1e-6, "fraction {fraction}");
    }

    #[test]
    fn position_is_non_decreasing_between_beats() {
        let mut clock = BeatClock::new();
        let s = sample(97.5, Deck::Two, [0, 42]);
        clock.sample(&s, Duration::ZERO);

        let mut last = clock.current_position();
        for i in 0..200 {
            clock.sample(&s, TICK * (i % 3));
            let now = clock.current_position();
            let wrapped = now < last && last - now > 0.5;
            assert!(now >= last || wrapped, "{now} < {last}");
            last = now;
        }
    }

    #[test]
    fn deck_switch_resets_fraction() {
        let mut clock = BeatClock::new();
        let on_one = sample(120.0, Deck::One, [10, 200]);
        clock.sample(&on_one, Duration::ZERO);
        clock.sample(&on_one, Duration::from_millis(300));
        assert!(clock.position().fraction > 0.5);

        let on_two = sample(120.0, Deck::Two, [10, 200]);
        let events = clock.sample(&on_two, Duration::from_millis(5));
        assert_eq!(
            events,
            vec![BeatEvent::SourceSwitched {
                deck: Deck::Two,
                beat: 200
            }]
        );
        assert_eq!(clock.position().fraction, 0.0);
        assert_eq!(clock.position().integer_beat, 200);
    }

    #[test]
    fn any_counter_change_is_a_new_beat() {
        let mut clock = BeatClock::new();
        clock.sample(&sample(120.0, Deck::One, [8, 0]), Duration::ZERO);
        clock.sample(&sample(120.0, Deck::One, [8, 0]), Duration::from_millis(100));

        let events = clock.sample(&sample(120.0, Deck::One, [64, 0]), TICK);
        assert_eq!(events, vec![BeatEvent::NewBeat(64)]);
        assert_eq!(clock.position().fraction, 0.0);

        let events = clock.sample(&sample(120.0, Deck::One, [60, 0]), TICK);
        assert_eq!(events, vec![BeatEvent::NewBeat(60)]);
    }

    #[test]
    fn non_positive_tempo_holds_fraction() {
        let mut clock = BeatClock::new();
        let s = sample(0.0, Deck::One, [5, 0]);
        clock.sample(&s, Duration::ZERO);
        clock.sample(&s, Duration::from_millis(250));
        assert_eq!(clock.position().fraction, 0.0);
        assert_eq!(clock.delta_beats(Duration::from_secs(1)), 0.0);

        let s = sample(-10.0, Deck::One, [5, 0]);
        let events = clock.sample(&s, Duration::from_millis(250));
        assert_eq!(events, vec![BeatEvent::TempoChanged(-10.0)]);
        assert_eq!(clock.current_position(), 5.0);
    }

    #[test]
    fn negative_latency_offset_stays_within_the_beat() {
        let mut clock = BeatClock::new();
        clock.sample(&sample(120.0, Deck::One, [4, 0]), Duration::ZERO);
        clock.nudge_latency_millis(-1.0);

        assert_eq!(clock.latency_offset_micros(), -1000.0);
        let position = clock.current_position();
        assert!((position - 4.998).abs() < 1e-9, "{position}");
        assert!((clock.beat_fraction() - 0.998).abs() < 1e-9);
    }

    #[test]
    fn latency_offset_survives_beat_changes() {
        let mut clock = BeatClock::new();
        clock.sample(&sample(120.0, Deck::One, [4, 0]), Duration::ZERO);
        clock.nudge_latency_millis(2.0);
        clock.sample(&sample(120.0, Deck::One, [5, 0]), TICK);
        clock.sample(&sample(120.0, Deck::Two, [5, 9]), TICK);

        assert_eq!(clock.latency_offset_micros(), 2000.0);
        assert!((clock.current_position() - 9.004).abs() < 1e-9);
    }

    #[test]
    fn reports_track_changes_per_deck() {
        let mut clock = BeatClock::new();
        let mut s = sample(120.0, Deck::One, [1, 1]);
        clock.sample(&s, Duration::ZERO);

        s.decks[1].track = TrackIdentity::new("Moderat", "Bad Kingdom");
        let events = clock.sample(&s, TICK);
        assert_eq!(
            events,
            vec![BeatEvent::TrackChanged {
                deck: Deck::Two,
                track: TrackIdentity::new("Moderat", "Bad Kingdom"),
            }]
        );
    }

    #[test]
    fn deck_index_mapping() {
        assert_eq!(Deck::from_index(0), Some(Deck::One));
        assert_eq!(Deck::from_index(1), Some(Deck::Two));
        assert_eq!(Deck::from_index(2), None);
        assert_eq!(Deck::Two.number(), 2);
    }
}
