//! Tracker sidecar process reader.
//!
//! The detector/tracker runs as a child process that owns video acquisition
//! and writes one JSON batch per processed frame to stdout. Batches are parsed
//! on a background thread and forwarded over a small bounded channel so a slow
//! consumer backpressures the child instead of buffering without limit.

use std::{
    io::{BufRead, BufReader, Read},
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, warn};

use crate::{
    source::Acquire,
    types::{IngestError, ObservationBatch, parse_batch_line},
};

/// Environment variable carrying the video source URI to the sidecar.
pub const VIDEO_SOURCE_ENV: &str = "ZC_VIDEO_SOURCE";

/// How to launch the tracker sidecar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackerCommand {
    /// Shell command line, run through `sh -c`.
    pub command_line: String,
    /// Exported to the child as [`VIDEO_SOURCE_ENV`] when set.
    pub video_source: Option<String>,
}

impl TrackerCommand {
    fn to_command(&self) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.command_line);
        if let Some(source) = &self.video_source {
            cmd.env(VIDEO_SOURCE_ENV, source);
        }
        cmd
    }
}

/// [`Acquire`] implementation that launches a fresh sidecar per connection.
pub struct TrackerSource {
    command: TrackerCommand,
    queue_size: usize,
}

impl TrackerSource {
    pub fn new(command: TrackerCommand, queue_size: usize) -> Self {
        Self {
            command,
            queue_size,
        }
    }
}

impl Acquire for TrackerSource {
    fn connect(&mut self) -> Result<BatchStream, IngestError> {
        spawn_tracker_reader(&self.command, self.queue_size)
    }

    fn label(&self) -> String {
        match &self.command.video_source {
            Some(source) => format!("tracker({source})"),
            None => "tracker".to_string(),
        }
    }
}

/// Receiving end of a running reader.
///
/// Dropping the stream kills the child process, if any.
pub struct BatchStream {
    rx: Receiver<Result<ObservationBatch, IngestError>>,
    child: Option<Arc<Mutex<Child>>>,
}

impl BatchStream {
    /// Wrap a bare receiver, for readers that do not own a process.
    pub fn from_receiver(rx: Receiver<Result<ObservationBatch, IngestError>>) -> Self {
        Self { rx, child: None }
    }

    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Result<ObservationBatch, IngestError>, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        if let Some(child) = self.child.take() {
            kill_child(&child);
        }
    }
}

/// Spawn the tracker command and start forwarding its batches.
pub fn spawn_tracker_reader(
    command: &TrackerCommand,
    queue_size: usize,
) -> Result<BatchStream, IngestError> {
    let (tx, rx) = bounded(queue_size.max(1));

    let mut cmd = command.to_command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|source| IngestError::Spawn {
        command: command.command_line.clone(),
        source,
    })?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| IngestError::Other(anyhow::anyhow!("failed to capture tracker stdout")))?;
    debug!(pid = child.id(), command = %command.command_line, "tracker sidecar started");

    let child = Arc::new(Mutex::new(child));
    let reader_child = child.clone();
    thread::Builder::new()
        .name("tracker-reader".into())
        .spawn(move || {
            if let Err(err) = read_loop(stdout, Duration::ZERO, tx.clone()) {
                let _ = tx.send(Err(err));
            }
            kill_child(&reader_child);
        })
        .map_err(IngestError::Read)?;

    Ok(BatchStream {
        rx,
        child: Some(child),
    })
}

/// Forward every parseable line of `source` until EOF or until the receiver
/// goes away, sleeping `pace` after each batch. Malformed lines are logged and
/// skipped.
pub(crate) fn read_loop(
    source: impl Read,
    pace: Duration,
    tx: Sender<Result<ObservationBatch, IngestError>>,
) -> Result<(), IngestError> {
    let mut reader = BufReader::new(source);
    let mut raw = Vec::new();
    let mut line_number: u64 = 0;

    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            return Ok(());
        }
        line_number += 1;

        let line = match std::str::from_utf8(&raw) {
            Ok(line) => line,
            Err(err) => {
                warn!(line = line_number, "skipping non UTF-8 tracker output: {err}");
                continue;
            }
        };

        match parse_batch_line(line) {
            Ok(Some(batch)) => {
                if tx.send(Ok(batch)).is_err() {
                    return Ok(());
                }
                if !pace.is_zero() {
                    thread::sleep(pace);
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(line = line_number, "skipping malformed tracker output: {err}");
            }
        }
    }
}

fn kill_child(child: &Arc<Mutex<Child>>) {
    if let Ok(mut child) = child.lock() {
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
        }
        let _ = child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_loop_skips_bad_lines() {
        let input = concat!(
            "{\"detections\": [{\"track_id\": 1, \"bbox\": [0, 0, 2, 2]}]}\n",
            "garbage\n",
            "\n",
            "{\"frame\": 2, \"detections\": []}\n",
        );
        let (tx, rx) = bounded(8);
        read_loop(input.as_bytes(), Duration::ZERO, tx).unwrap();

        let batches: Vec<_> = rx.try_iter().map(|r| r.unwrap()).collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].detections[0].track_id, 1);
        assert_eq!(batches[1].frame, Some(2));
    }

    #[test]
    fn read_loop_skips_invalid_utf8() {
        let mut input = b"{\"frame\": 1}\n".to_vec();
        input.extend_from_slice(b"\xff\xfe garbage\n");
        input.extend_from_slice(b"{\"frame\": 2}\n");
        let (tx, rx) = bounded(8);
        read_loop(input.as_slice(), Duration::ZERO, tx).unwrap();

        let frames: Vec<_> = rx.try_iter().map(|r| r.unwrap().frame).collect();
        assert_eq!(frames, vec![Some(1), Some(2)]);
    }

    #[test]
    fn read_loop_stops_when_receiver_dropped() {
        let input = "{}\n{}\n{}\n";
        let (tx, rx) = bounded(1);
        drop(rx);
        assert!(read_loop(input.as_bytes(), Duration::ZERO, tx).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn sidecar_batches_arrive_then_channel_closes() {
        let command = TrackerCommand {
            command_line: "printf '{\"frame\":1,\"detections\":[]}\\n{\"frame\":2,\"detections\":[]}\\n'"
                .to_string(),
            video_source: None,
        };
        let stream = spawn_tracker_reader(&command, 4).unwrap();
        let first = stream
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(first.frame, Some(1));
        let second = stream
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(second.frame, Some(2));
        assert!(matches!(
            stream.recv_timeout(Duration::from_secs(5)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn sidecar_survives_invalid_utf8() {
        let command = TrackerCommand {
            command_line: "printf '\\377\\n{\"frame\":7,\"detections\":[]}\\n'".to_string(),
            video_source: None,
        };
        let stream = spawn_tracker_reader(&command, 4).unwrap();
        let batch = stream
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(batch.frame, Some(7));
        assert!(matches!(
            stream.recv_timeout(Duration::from_secs(5)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn sidecar_receives_video_source() {
        let command = TrackerCommand {
            command_line: format!(
                "printf '{{\"frame\":%s,\"detections\":[]}}\\n' \"${VIDEO_SOURCE_ENV}\""
            ),
            video_source: Some("9".to_string()),
        };
        let stream = spawn_tracker_reader(&command, 4).unwrap();
        let batch = stream
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(batch.frame, Some(9));
    }
}
