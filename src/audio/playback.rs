//! Playback of a captured take against a live note sink.

use super::engine::NoteSink;
use crate::midi::NoteEvent;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cue {
    On { note: u8, velocity: f32 },
    Off { note: u8 },
}

/// Builds the timeline: (ms, cue), note-offs before note-ons at equal times.
fn schedule(events: &[NoteEvent]) -> Vec<(u64, Cue)> {
    let mut cues: Vec<(u64, Cue)> = Vec::with_capacity(events.len() * 2);
    for event in events.iter().filter(|e| e.is_terminated()) {
        cues.push((
            event.onset_ms,
            Cue::On {
                note: event.note_number,
                velocity: event.velocity_on,
            },
        ));
        cues.push((event.end_ms(), Cue::Off { note: event.note_number }));
    }
    cues.sort_by_key(|(ms, cue)| (*ms, matches!(cue, Cue::On { .. })));
    cues
}

/// A take being played on its own timer thread.
///
/// The thread sleeps on a stop channel between cues, so [`Playback::stop`]
/// interrupts it at once and no cue fires after `stop` returns.
pub struct Playback {
    sink: Arc<dyn NoteSink>,
    stop_tx: Sender<()>,
    finished: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Playback {
    /// Starts playing `events` on `sink`. Unterminated notes are skipped.
    pub fn start(events: &[NoteEvent], sink: Arc<dyn NoteSink>) -> Self {
        let cues = schedule(events);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let finished = Arc::new(AtomicBool::new(false));

        let thread = {
            let sink = Arc::clone(&sink);
            let finished = Arc::clone(&finished);
            std::thread::spawn(move || {
                run(&cues, sink.as_ref(), &stop_rx);
                finished.store(true, Ordering::Release);
            })
        };

        tracing::debug!("playback started");
        Self {
            sink,
            stop_tx,
            finished,
            thread: Some(thread),
        }
    }

    /// True once every cue has fired or playback was stopped.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Blocks until the take has played to the end.
    pub fn wait(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Cancels pending cues and silences the sink.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.stop_tx.try_send(());
        let _ = thread.join();
        self.sink.all_notes_off();
        tracing::debug!("playback stopped");
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.halt();
    }
}

fn run(cues: &[(u64, Cue)], sink: &dyn NoteSink, stop_rx: &Receiver<()>) {
    let mut now_ms = 0u64;
    for &(at_ms, cue) in cues {
        let delay = Duration::from_millis(at_ms - now_ms);
        if !delay.is_zero() {
            match stop_rx.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {}
                // Stopped, or the owner is gone
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        } else if stop_rx.try_recv().is_ok() {
            return;
        }
        now_ms = at_ms;

        match cue {
            Cue::On { note, velocity } => sink.note_on(note, velocity),
            Cue::Off { note } => sink.note_off(note),
        }
    }
}
