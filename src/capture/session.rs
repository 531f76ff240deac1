//! Live capture sessions on a MIDI input port.
//!
//! The device callback runs on midir's thread. It only timestamps the
//! message, pushes it onto a channel and pokes the monitor; the event buffer
//! itself is owned by the session and filled when the session polls or
//! stops.

use super::message::MidiMessage;
use super::recorder::Recorder;
use crate::audio::{NoteSink, Patch};
use crate::error::{Error, Result};
use crate::midi::{NoteEvent, Take};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use midir::{MidiInput, MidiInputConnection, MidiInputPort};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Client name shown to the platform MIDI subsystem.
const CLIENT_NAME: &str = "miditake";

/// A visible MIDI input port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDevice {
    pub index: usize,
    pub name: String,
}

/// Lists every MIDI input port currently visible.
///
/// # Errors
///
/// Returns [`Error::DeviceUnavailable`] if the MIDI subsystem cannot be
/// opened.
pub fn list_inputs() -> Result<Vec<InputDevice>> {
    let midi_in =
        MidiInput::new(CLIENT_NAME).map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
    Ok(midi_in
        .ports()
        .iter()
        .enumerate()
        .filter_map(|(index, port)| {
            midi_in
                .port_name(port)
                .ok()
                .map(|name| InputDevice { index, name })
        })
        .collect())
}

/// Finds a port by exact name, falling back to its index.
fn resolve_port(midi_in: &MidiInput, device: &str) -> Result<(MidiInputPort, String)> {
    let ports = midi_in.ports();
    if ports.is_empty() {
        return Err(Error::DeviceUnavailable("no MIDI input ports found".to_string()));
    }

    let named = ports
        .iter()
        .find(|port| midi_in.port_name(port).map(|n| n == device).unwrap_or(false));
    let port = match named {
        Some(port) => port,
        None => device
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|index| ports.get(index))
            .ok_or_else(|| Error::DeviceUnavailable(format!("MIDI input '{device}' not found")))?,
    };

    let name = midi_in
        .port_name(port)
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
    Ok((port.clone(), name))
}

/// True while a port named `device` is visible.
fn port_present(device: &str) -> bool {
    MidiInput::new(CLIENT_NAME)
        .map(|midi_in| {
            midi_in
                .ports()
                .iter()
                .any(|port| midi_in.port_name(port).map(|n| n == device).unwrap_or(false))
        })
        .unwrap_or(false)
}

/// A timestamped note message, in milliseconds since capture start.
#[derive(Debug, Clone, Copy, PartialEq)]
enum CaptureMessage {
    NoteOn { note: u8, velocity: f32, at_ms: u64 },
    NoteOff { note: u8, at_ms: u64 },
}

/// State shared with the input callback.
struct Listener {
    t0: Instant,
    events: Sender<CaptureMessage>,
    monitor: Option<Arc<dyn NoteSink>>,
    active: AtomicBool,
}

impl Listener {
    fn elapsed_ms(&self) -> u64 {
        self.t0.elapsed().as_millis() as u64
    }

    fn handle(&self, bytes: &[u8]) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let at_ms = self.elapsed_ms();

        let message = match MidiMessage::parse(bytes) {
            Some(MidiMessage::NoteOn { note, velocity, .. }) => {
                let velocity = velocity as f32 / 127.0;
                if let Some(monitor) = &self.monitor {
                    monitor.note_on(note, velocity);
                }
                CaptureMessage::NoteOn {
                    note,
                    velocity,
                    at_ms,
                }
            }
            Some(MidiMessage::NoteOff { note, .. }) => {
                if let Some(monitor) = &self.monitor {
                    monitor.note_off(note);
                }
                CaptureMessage::NoteOff { note, at_ms }
            }
            Some(MidiMessage::Other) | None => return,
        };

        // The session may already be gone; nothing to record then
        let _ = self.events.send(message);
    }
}

/// Feeds raw MIDI bytes into a session as if they came from a device.
///
/// Used for on-screen keyboards and for sessions without hardware.
#[derive(Clone)]
pub struct CaptureInput {
    listener: Arc<Listener>,
}

impl CaptureInput {
    pub fn send(&self, bytes: &[u8]) {
        self.listener.handle(bytes);
    }

    /// Convenience for a note-on with a 0-127 velocity on channel 1.
    pub fn note_on(&self, note: u8, velocity: u8) {
        self.send(&[0x90, note & 0x7F, velocity & 0x7F]);
    }

    pub fn note_off(&self, note: u8) {
        self.send(&[0x80, note & 0x7F, 0]);
    }
}

/// Polls for the device and flags the session when it disappears.
struct Watchdog {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl Watchdog {
    fn spawn<F>(
        device: String,
        poll: Duration,
        is_present: F,
        listener: Arc<Listener>,
        lost: Arc<AtomicBool>,
    ) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let thread = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(poll) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return,
            }

            if !is_present() {
                listener.active.store(false, Ordering::Release);
                lost.store(true, Ordering::Release);
                if let Some(monitor) = &listener.monitor {
                    monitor.all_notes_off();
                }
                tracing::warn!(%device, "MIDI input disappeared, capture stopped");
                return;
            }
        });
        Self { stop, thread }
    }

    fn shutdown(self) {
        let _ = self.stop.try_send(());
        let _ = self.thread.join();
    }
}

/// An in-progress recording.
///
/// Call [`CaptureSession::stop`] to end the recording and get the take.
/// Dropping a session discards what it captured.
pub struct CaptureSession {
    name: String,
    patch: Patch,
    listener: Arc<Listener>,
    events: Receiver<CaptureMessage>,
    recorder: Recorder,
    connection: Option<MidiInputConnection<()>>,
    watchdog: Option<Watchdog>,
    device_lost: Arc<AtomicBool>,
}

impl CaptureSession {
    /// Starts capturing from a hardware input selected by name or index.
    ///
    /// `monitor` receives every note as it arrives, typically an
    /// [`crate::audio::EngineHandle`]. The port list is checked every
    /// `device_poll` for disconnection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] if there are no inputs, the
    /// selected one is missing, or the port cannot be opened.
    pub fn start(
        device: &str,
        name: &str,
        patch: Patch,
        monitor: Option<Arc<dyn NoteSink>>,
        device_poll: Duration,
    ) -> Result<Self> {
        let midi_in =
            MidiInput::new(CLIENT_NAME).map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        let (port, port_name) = resolve_port(&midi_in, device)?;

        let mut session = Self::new_session(name, patch, monitor);
        let listener = Arc::clone(&session.listener);
        let connection = midi_in
            .connect(
                &port,
                "miditake-capture",
                move |_stamp, message, _| listener.handle(message),
                (),
            )
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        session.connection = Some(connection);
        let watched = port_name.clone();
        session.watch(port_name.clone(), device_poll, move || port_present(&watched));

        tracing::info!(device = %port_name, take = %name, %patch, "capture started");
        Ok(session)
    }

    /// Starts a session with no hardware port; feed it through
    /// [`CaptureSession::input`].
    pub fn detached(name: &str, patch: Patch, monitor: Option<Arc<dyn NoteSink>>) -> Self {
        tracing::info!(take = %name, %patch, "detached capture started");
        Self::new_session(name, patch, monitor)
    }

    fn new_session(name: &str, patch: Patch, monitor: Option<Arc<dyn NoteSink>>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            name: name.to_string(),
            patch,
            listener: Arc::new(Listener {
                t0: Instant::now(),
                events: tx,
                monitor,
                active: AtomicBool::new(true),
            }),
            events: rx,
            recorder: Recorder::new(),
            connection: None,
            watchdog: None,
            device_lost: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stops capture once `is_present` reports the device gone.
    fn watch<F>(&mut self, device: String, poll: Duration, is_present: F)
    where
        F: Fn() -> bool + Send + 'static,
    {
        self.watchdog = Some(Watchdog::spawn(
            device,
            poll,
            is_present,
            Arc::clone(&self.listener),
            Arc::clone(&self.device_lost),
        ));
    }

    /// Returns a handle that injects raw MIDI bytes.
    pub fn input(&self) -> CaptureInput {
        CaptureInput {
            listener: Arc::clone(&self.listener),
        }
    }

    /// Milliseconds since the session started.
    pub fn elapsed_ms(&self) -> u64 {
        self.listener.elapsed_ms()
    }

    /// True once the watchdog has seen the input port disappear.
    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    /// Applies everything received so far and returns the events.
    pub fn poll(&mut self) -> &[NoteEvent] {
        self.drain();
        self.recorder.events()
    }

    fn drain(&mut self) {
        for message in self.events.try_iter() {
            match message {
                CaptureMessage::NoteOn {
                    note,
                    velocity,
                    at_ms,
                } => self.recorder.note_on(note, velocity, at_ms),
                CaptureMessage::NoteOff { note, at_ms } => {
                    self.recorder.note_off(note, at_ms);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.listener.active.store(false, Ordering::Release);
        if let Some(connection) = self.connection.take() {
            let _ = connection.close();
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.shutdown();
        }
    }

    /// Stops listening and returns the finished take.
    ///
    /// Notes still held keep a duration of 0. If the device was lost the
    /// partial take is returned with `interrupted` set.
    pub fn stop(mut self) -> Take {
        self.shutdown();
        self.drain();
        if let Some(monitor) = &self.listener.monitor {
            monitor.all_notes_off();
        }

        let recorder = std::mem::take(&mut self.recorder);
        let held = recorder.open_count();
        let mut take = Take::from_events(&self.name, self.patch, recorder.into_events());
        take.interrupted = self.is_device_lost();

        tracing::info!(
            take = %take.name,
            events = take.len(),
            held,
            interrupted = take.interrupted,
            "capture stopped"
        );
        take
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
