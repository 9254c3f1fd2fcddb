//! The polling loop tying source, clock, cue library, scheduler and sink
//! together.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, TryRecvError};
use rosc::OscType;

use crate::{
    clock::{BeatClock, BeatEvent, Deck},
    config::EngineConfig,
    library::CueLibrary,
    scheduler::CueScheduler,
    sink::{OutboundBatch, Sink},
    source::Source,
    Result,
};

const BEAT_ADDRESS: &str = "/beat";
const BPM_ADDRESS: &str = "/bpm";
const FALLBACK_TICK: Duration = Duration::from_micros(8_333);

/// Runtime control messages, fed to the loop from the console or signals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Shift the latency correction by the given number of milliseconds.
    NudgeLatency { millis: f64 },
    Stop,
}

/// What a single iteration produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub position: f64,
    pub fired: usize,
    pub sent: usize,
}

pub struct Engine<S, K> {
    source: S,
    sink: K,
    clock: BeatClock,
    library: CueLibrary,
    scheduler: CueScheduler,
    telemetry: bool,
    tick_interval: Duration,
    send_failing: bool,
}

impl<S: Source, K: Sink> Engine<S, K> {
    pub fn new(source: S, sink: K, library: CueLibrary, config: &EngineConfig) -> Self {
        Self {
            source,
            sink,
            clock: BeatClock::new(),
            library,
            scheduler: CueScheduler::new(),
            telemetry: config.telemetry,
            tick_interval: Duration::try_from_secs_f64(1.0 / config.tick_rate_hz)
                .unwrap_or(FALLBACK_TICK),
            send_failing: false,
        }
    }

    pub fn clock(&self) -> &BeatClock {
        &self.clock
    }

    pub fn library(&self) -> &CueLibrary {
        &self.library
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Applies a control command. Returns false when the loop should stop.
    pub fn apply_command(&mut self, command: Command) -> bool {
        match command {
            Command::NudgeLatency { millis } => {
                self.clock.nudge_latency_millis(millis);
                true
            }
            Command::Stop => false,
        }
    }

    /// One iteration: poll, advance the clock, fire cues, send the batch.
    /// Only a failed poll is returned as an error; send failures are logged.
    pub fn step(&mut self, elapsed: Duration) -> Result<TickReport> {
        let sample = self.source.poll()?;
        let events = self.clock.sample(&sample, elapsed);

        let mut telemetry = OutboundBatch::new();
        let mut reselect = false;
        for event in events {
            match event {
                BeatEvent::SourceSwitched { .. } => {
                    self.scheduler.rebase();
                    reselect = true;
                }
                BeatEvent::TrackChanged { deck, track } => {
                    reselect |= self.clock.active_deck() == Some(deck);
                    telemetry.push(deck_address(deck, "artist"), vec![OscType::String(track.artist)]);
                    telemetry.push(deck_address(deck, "track"), vec![OscType::String(track.title)]);
                }
                BeatEvent::TempoChanged(tempo) => {
                    telemetry.push(BPM_ADDRESS, vec![OscType::Float(tempo as f32)]);
                }
                BeatEvent::NewBeat(_) => {}
            }
        }

        if reselect {
            let previous = self.library.active_index();
            let track = &sample.active().track;
            self.library.on_track_changed(&track.artist, &track.title);
            if self.library.active_index() != previous {
                self.scheduler.rebase();
            }
        }

        let position = self.clock.current_position();
        let delta = self.clock.delta_beats(elapsed);
        let mut batch = self
            .scheduler
            .tick(self.library.active_sheet(), position, delta);
        let fired = batch.len();

        if self.telemetry {
            batch.extend(telemetry);
            batch.push(BEAT_ADDRESS, vec![OscType::Float(self.clock.beat_fraction() as f32)]);
        }

        match self.sink.send(&batch) {
            Ok(()) if self.send_failing => {
                tracing::info!("output recovered");
                self.send_failing = false;
            }
            Ok(()) => {}
            Err(err) => {
                if !self.send_failing {
                    tracing::warn!(error = %err, "dropping outbound batch");
                    self.send_failing = true;
                } else {
                    tracing::debug!(error = %err, "dropping outbound batch");
                }
            }
        }

        Ok(TickReport {
            position,
            fired,
            sent: batch.len(),
        })
    }

    /// Runs until `stop` is set or a [`Command::Stop`] arrives. A failure of
    /// the first poll aborts; later poll failures skip the iteration.
    pub fn run(&mut self, commands: &Receiver<Command>, stop: &AtomicBool) -> Result<()> {
        self.step(Duration::ZERO)?;
        tracing::info!(
            tick_hz = 1.0 / self.tick_interval.as_secs_f64(),
            sheets = self.library.len(),
            "entering polling loop"
        );

        let mut last = Instant::now();
        let mut poll_failing = false;
        while !stop.load(Ordering::Relaxed) {
            if !self.drain_commands(commands) {
                break;
            }

            let now = Instant::now();
            let elapsed = now.duration_since(last);
            last = now;

            match self.step(elapsed) {
                Ok(_) => poll_failing = false,
                Err(err) => {
                    if !poll_failing {
                        tracing::warn!(error = %err, "source poll failed");
                    }
                    poll_failing = true;
                }
            }

            let spent = now.elapsed();
            if spent < self.tick_interval {
                thread::sleep(self.tick_interval - spent);
            }
        }

        tracing::info!("polling loop stopped");
        Ok(())
    }

    fn drain_commands(&mut self, commands: &Receiver<Command>) -> bool {
        loop {
            match commands.try_recv() {
                Ok(command) => {
                    if !self.apply_command(command) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return true,
            }
        }
    }
}

fn deck_address(deck: Deck, field: &str) -> String {
    format!("/deck{}/{field}", deck.number())
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;

    use super::*;
    use crate::{
        clock::{BeatSample, DeckSample, TrackIdentity},
        source::ScriptedSource,
        timeline::CueSheet,
        BeatCueError,
    };

    #[derive(Debug, Default)]
    struct RecordingSink {
        batches: Vec<OutboundBatch>,
        fail: bool,
    }

    impl Sink for RecordingSink {
        fn send(&mut self, batch: &OutboundBatch) -> Result<()> {
            if self.fail {
                return Err(BeatCueError::Transmit("unreachable".to_string()));
            }
            self.batches.push(batch.clone());
            Ok(())
        }
    }

    impl RecordingSink {
        fn addresses(&self) -> Vec<String> {
            self.batches
                .iter()
                .flat_map(|b| b.messages())
                .map(|m| m.addr.clone())
                .collect()
        }
    }

    fn sample(deck: Deck, beats: [i64; 2]) -> BeatSample {
        BeatSample {
            tempo: 120.0,
            active_deck: deck,
            decks: [
                DeckSample {
                    beat_number: beats[0],
                    track: TrackIdentity::new("Daft Punk", "One More Time"),
                },
                DeckSample {
                    beat_number: beats[1],
                    track: TrackIdentity::new("Air", "Sexy Boy"),
                },
            ],
        }
    }

    fn library() -> CueLibrary {
        let daft = CueSheet::parse_named(
            "daft",
            "Match Song\tOne More Time\nMatch Artist\tDaft Punk\nheader\n\
             1\t0.5\t/daft/half\t1\ti\n2\t0\t/daft/two\t2\ti\n",
        )
        .unwrap();
        let air = CueSheet::parse_named(
            "air",
            "Match Song\tSexy Boy\nMatch Artist\tAir\nheader\n10\t0.25\t/air/cue\t0.5\tf\n",
        )
        .unwrap();
        CueLibrary::from_sheets(vec![daft, air])
    }

    fn engine(source: ScriptedSource, telemetry: bool) -> Engine<ScriptedSource, RecordingSink> {
        let config = EngineConfig {
            telemetry,
            ..EngineConfig::default()
        };
        Engine::new(source, RecordingSink::default(), library(), &config)
    }

    #[test]
    fn fires_cues_as_the_beat_advances() {
        let source = ScriptedSource::new([
            sample(Deck::One, [1, 0]),
            sample(Deck::One, [1, 0]),
            sample(Deck::One, [2, 0]),
        ]);
        let mut engine = engine(source, false);

        assert_eq!(engine.step(Duration::ZERO).unwrap().fired, 0);
        assert_eq!(engine.library().active_sheet().map(CueSheet::name), Some("daft"));

        let report = engine.step(Duration::from_millis(250)).unwrap();
        assert_eq!(report.fired, 1);
        assert!((report.position - 1.5).abs() < 1e-9);

        assert_eq!(engine.step(Duration::from_millis(10)).unwrap().fired, 1);
        assert_eq!(engine.step(Duration::from_millis(10)).unwrap().fired, 0);
        assert_eq!(engine.sink().addresses(), vec!["/daft/half", "/daft/two"]);
    }

    #[test]
    fn deck_switch_selects_the_other_sheet() {
        let source = ScriptedSource::new([
            sample(Deck::One, [1, 10]),
            sample(Deck::Two, [1, 10]),
            sample(Deck::Two, [1, 10]),
        ]);
        let mut engine = engine(source, false);
        engine.step(Duration::ZERO).unwrap();
        engine.step(Duration::from_millis(10)).unwrap();
        assert_eq!(engine.library().active_sheet().map(CueSheet::name), Some("air"));

        engine.step(Duration::from_millis(125)).unwrap();
        assert_eq!(engine.sink().addresses(), vec!["/air/cue"]);
    }

    #[test]
    fn telemetry_rides_along_in_the_same_bundle() {
        let mut engine = engine(ScriptedSource::new([sample(Deck::One, [1, 0])]), true);
        engine.step(Duration::ZERO).unwrap();

        let first = &engine.sink().batches[0];
        let addresses: Vec<&str> = first.messages().iter().map(|m| m.addr.as_str()).collect();
        assert_eq!(
            addresses,
            vec!["/deck1/artist", "/deck1/track", "/deck2/artist", "/deck2/track", "/bpm", "/beat"]
        );

        engine.step(Duration::from_millis(250)).unwrap();
        let second = &engine.sink().batches[1];
        assert_eq!(second.messages()[0].addr, "/daft/half");
        assert_eq!(second.messages()[1].addr, "/beat");
        assert_eq!(second.messages()[1].args, vec![OscType::Float(0.5)]);
    }

    #[test]
    fn send_failures_do_not_stop_the_loop() {
        let mut engine = engine(ScriptedSource::new([sample(Deck::One, [1, 0])]), true);
        engine.sink.fail = true;
        let report = engine.step(Duration::ZERO).unwrap();
        assert!(report.sent > 0);
        assert!(engine.step(Duration::from_millis(8)).is_ok());
    }

    #[test]
    fn latency_commands_shift_the_position() {
        let mut engine = engine(ScriptedSource::new([sample(Deck::One, [4, 0])]), false);
        engine.step(Duration::ZERO).unwrap();
        assert!(engine.apply_command(Command::NudgeLatency { millis: 1.0 }));
        assert!(engine.apply_command(Command::NudgeLatency { millis: 1.0 }));
        assert_eq!(engine.clock().latency_offset_micros(), 2000.0);
        assert!(!engine.apply_command(Command::Stop));
    }

    #[test]
    fn run_stops_on_command() {
        let mut engine = engine(ScriptedSource::new([sample(Deck::One, [1, 0])]), false);
        let (tx, rx) = unbounded();
        tx.send(Command::NudgeLatency { millis: -1.0 }).unwrap();
        tx.send(Command::Stop).unwrap();

        engine.run(&rx, &AtomicBool::new(false)).unwrap();
        assert_eq!(engine.clock().latency_offset_micros(), -1000.0);
    }

    #[test]
    fn run_fails_when_the_source_is_unavailable_at_startup() {
        let mut source = ScriptedSource::default();
        source.push_failure("process not found");
        let mut engine = engine(source, false);
        let (_tx, rx) = unbounded();

        let err = engine.run(&rx, &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, BeatCueError::SourceUnavailable(_)));
    }

    #[test]
    fn run_honours_the_stop_flag() {
        let mut engine = engine(ScriptedSource::new([sample(Deck::One, [1, 0])]), false);
        let (_tx, rx) = unbounded();
        engine.run(&rx, &AtomicBool::new(true)).unwrap();
        assert_eq!(engine.clock().position().integer_beat, 1);
    }
}
