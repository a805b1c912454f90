//! Energy-based speech detection used to start calls hands-free.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{oneshot, watch};

use crate::config::SpeechConfig;
use crate::media::{MediaDevices, MicrophoneCapture};
use crate::peer::TaskHandle;
use crate::room::RoomStatus;

/// Root mean square of a frame of normalized samples.
pub fn calculate_rms(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let mut sum1 = 0.0;
    let mut sum2 = 0.0;
    let mut sum3 = 0.0;
    let mut sum4 = 0.0;

    let mut i = 0;
    while i + 3 < data.len() {
        sum1 += data[i] * data[i];
        sum2 += data[i + 1] * data[i + 1];
        sum3 += data[i + 2] * data[i + 2];
        sum4 += data[i + 3] * data[i + 3];
        i += 4;
    }
    for sample in &data[i..] {
        sum1 += sample * sample;
    }

    let mean_of_squares = (sum1 + sum2 + sum3 + sum4) / data.len() as f32;
    mean_of_squares.sqrt()
}

/// Counts consecutive loud frames.
#[derive(Debug, Clone)]
pub struct SpeechDetector {
    threshold: f32,
    required_frames: u32,
    streak: u32,
}

impl SpeechDetector {
    pub fn new(config: &SpeechConfig) -> Self {
        Self {
            threshold: config.rms_threshold,
            required_frames: config.required_frames.max(1),
            streak: 0,
        }
    }

    /// Feed one frame. Returns true once enough consecutive frames were loud.
    pub fn push_frame(&mut self, frame: &[f32]) -> bool {
        if calculate_rms(frame) >= self.threshold {
            self.streak += 1;
        } else {
            self.streak = 0;
        }
        self.streak >= self.required_frames
    }
}

/// Listens to the microphone while the room is idle.
pub struct SpeechActivityMonitor {
    devices: Arc<dyn MediaDevices>,
    config: SpeechConfig,
}

/// A running monitor. Dropping it stops the monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    task: TaskHandle,
}

impl MonitorHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop listening and wait until the microphone is released.
    pub async fn stop(self) {
        self.task.cancel().await;
    }
}

impl SpeechActivityMonitor {
    pub fn new(devices: Arc<dyn MediaDevices>, config: SpeechConfig) -> Self {
        Self { devices, config }
    }

    /// Start listening. `on_speech` fires once on sustained speech, after the
    /// microphone has been released. The monitor exits without firing as soon
    /// as `room_status` leaves Idle.
    pub fn spawn(
        &self,
        room_status: watch::Receiver<RoomStatus>,
        on_speech: oneshot::Sender<()>,
    ) -> MonitorHandle {
        let devices = self.devices.clone();
        let config = self.config.clone();
        MonitorHandle {
            task: TaskHandle::spawn(run(devices, config, room_status, on_speech)),
        }
    }
}

async fn run(
    devices: Arc<dyn MediaDevices>,
    config: SpeechConfig,
    mut room_status: watch::Receiver<RoomStatus>,
    on_speech: oneshot::Sender<()>,
) {
    if *room_status.borrow_and_update() != RoomStatus::Idle {
        return;
    }
    let MicrophoneCapture { track, mut frames } = match devices.open_microphone().await {
        Ok(capture) => capture,
        Err(e) => {
            warn!("Speech monitor unavailable: {e}");
            return;
        }
    };
    let track = scopeguard::guard(track, |track| {
        track.stop();
        debug!("Speech monitor released microphone {}", track.id());
    });
    let mut detector = SpeechDetector::new(&config);
    debug!("Speech monitor listening on {}", track.id());

    loop {
        tokio::select! {
            changed = room_status.changed() => {
                if changed.is_err() || *room_status.borrow_and_update() != RoomStatus::Idle {
                    debug!("Room left idle; speech monitor stopping");
                    return;
                }
            }
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    debug!("Microphone capture ended");
                    return;
                };
                if detector.push_frame(&frame) {
                    drop(track);
                    info!("Sustained speech detected; starting call");
                    let _ = on_speech.send(());
                    return;
                }
            }
        }
    }
}
