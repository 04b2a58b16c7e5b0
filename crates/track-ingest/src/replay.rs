//! Replay of recorded tracker output.
//!
//! A replay file holds the same JSON lines the sidecar writes. The reader ends
//! the stream at EOF, which the adapter reports as end of stream.

use std::{
    fs::File,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use crossbeam_channel::bounded;

use crate::{
    sidecar::{BatchStream, read_loop},
    source::Acquire,
    types::IngestError,
};

/// Finite [`Acquire`] implementation over a recorded file.
pub struct ReplaySource {
    path: PathBuf,
    pace: Duration,
    queue_size: usize,
}

impl ReplaySource {
    pub fn new(path: impl Into<PathBuf>, pace: Duration, queue_size: usize) -> Self {
        Self {
            path: path.into(),
            pace,
            queue_size,
        }
    }
}

impl Acquire for ReplaySource {
    fn connect(&mut self) -> Result<BatchStream, IngestError> {
        spawn_replay_reader(&self.path, self.pace, self.queue_size)
    }

    fn label(&self) -> String {
        format!("replay({})", self.path.display())
    }

    fn is_finite(&self) -> bool {
        true
    }
}

/// Spawns a background thread replaying `path`, sleeping `pace` after each
/// batch. A zero pace replays as fast as the consumer drains.
pub fn spawn_replay_reader(
    path: impl AsRef<Path>,
    pace: Duration,
    queue_size: usize,
) -> Result<BatchStream, IngestError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| IngestError::Open {
        path: path.display().to_string(),
        source,
    })?;

    let (tx, rx) = bounded(queue_size.max(1));
    thread::Builder::new()
        .name("replay-reader".into())
        .spawn(move || {
            if let Err(err) = read_loop(file, pace, tx.clone()) {
                let _ = tx.send(Err(err));
            }
        })
        .map_err(IngestError::Read)?;

    Ok(BatchStream::from_receiver(rx))
}
