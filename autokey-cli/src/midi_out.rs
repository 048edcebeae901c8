//! MIDI output for the console host: a midir port behind the core's
//! [`MidiSink`], driven from its own thread so key callbacks never block on
//! the Note-On/Note-Off gap.

use anyhow::{anyhow, Context, Result};
use autokey_core::error::DetectorError;
use autokey_core::midi::{MidiController, MidiSink};
use autokey_core::worker::WorkerThread;
use autokey_core::KeyScale;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{error, info, warn};
use midir::{MidiOutput, MidiOutputConnection};
use std::time::Duration;

const CLIENT_NAME: &str = "autokey";

/// How long `spawn` waits for the MIDI thread to open its port.
const OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// Names of every MIDI output port on the system.
pub fn list_output_ports() -> Result<Vec<String>> {
    let midi_out = MidiOutput::new(CLIENT_NAME).context("Failed to initialise MIDI output")?;
    Ok(midi_out
        .ports()
        .iter()
        .filter_map(|port| midi_out.port_name(port).ok())
        .collect())
}

pub struct MidirSink {
    connection: MidiOutputConnection,
}

impl MidirSink {
    /// Connects to the first output port whose name contains `port_match`.
    pub fn connect(port_match: &str) -> Result<(Self, String)> {
        let midi_out = MidiOutput::new(CLIENT_NAME).context("Failed to initialise MIDI output")?;
        let ports = midi_out.ports();
        let (port, name) = ports
            .iter()
            .find_map(|port| {
                let name = midi_out.port_name(port).ok()?;
                name.contains(port_match).then_some((port, name))
            })
            .ok_or_else(|| anyhow!("no MIDI output port matching '{port_match}'"))?;
        let connection = midi_out
            .connect(port, "autokey-out")
            .map_err(|e| anyhow!("Failed to connect to MIDI port '{name}': {e}"))?;
        Ok((Self { connection }, name))
    }
}

impl MidiSink for MidirSink {
    fn send(&mut self, bytes: &[u8]) -> autokey_core::Result<()> {
        self.connection
            .send(bytes)
            .map_err(|e| DetectorError::Midi(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum MidiCommand {
    Key(KeyScale),
    DetectionActive(bool),
    Shutdown,
}

/// Cloneable sender half; dropping commands when the thread falls behind.
#[derive(Clone)]
pub struct MidiHandle {
    tx: Sender<MidiCommand>,
}

impl MidiHandle {
    pub fn send(&self, command: MidiCommand) {
        match self.tx.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(command)) => warn!("MIDI thread busy; dropped {command:?}"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

pub struct MidiWorker {
    handle: MidiHandle,
    worker: WorkerThread,
}

impl MidiWorker {
    /// Opens the port on a dedicated thread. Returns the open error when no
    /// port could be reached.
    pub fn spawn(port_match: String) -> Result<Self> {
        let (tx, rx) = bounded::<MidiCommand>(64);
        let (ready_tx, ready_rx) = bounded::<std::result::Result<String, String>>(1);

        let worker = WorkerThread::spawn("autokey-midi", move || {
            let sink = match MidirSink::connect(&port_match) {
                Ok((sink, name)) => {
                    let _ = ready_tx.send(Ok(name));
                    sink
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("{e:#}")));
                    return;
                }
            };
            run_midi_thread(MidiController::new(sink), rx);
        })?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(name)) => {
                info!("Connected to MIDI output: {name}");
                Ok(Self {
                    handle: MidiHandle { tx },
                    worker,
                })
            }
            Ok(Err(message)) => {
                worker.join_within(OPEN_TIMEOUT);
                Err(anyhow!(message))
            }
            Err(_) => Err(anyhow!("MIDI output did not open within {OPEN_TIMEOUT:?}")),
        }
    }

    pub fn handle(&self) -> MidiHandle {
        self.handle.clone()
    }

    pub fn shutdown(self) {
        let _ = self.handle.tx.send(MidiCommand::Shutdown);
        self.worker.join_within(OPEN_TIMEOUT);
    }
}

fn run_midi_thread<S: MidiSink>(mut midi: MidiController<S>, rx: Receiver<MidiCommand>) {
    while let Ok(command) = rx.recv() {
        let result = match command {
            MidiCommand::Key(key) => midi.send_key_scale(&key),
            MidiCommand::DetectionActive(active) => midi.set_detection_active(active),
            MidiCommand::Shutdown => break,
        };
        if let Err(e) = result {
            error!("MIDI send failed: {e}");
        }
    }
    info!("MIDI output closed");
}
