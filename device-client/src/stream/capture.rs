use crate::video::{render_payload, CameraDevice, CaptureResult, Frame, SyntheticCamera};
use anyhow::{Context, Result};
use common::model::{resolve_model, TomlModelStore};
use std::io::{self, Write};
use std::path::Path;
use tracing::{debug, info};

/// Entry point of the `produce` subcommand. Runs until stdout is closed or the
/// process is killed.
pub fn run_producer(home: &Path, model: &str, camera_fps: u32) -> Result<()> {
    let stdout = io::stdout();
    let written = produce_into(home, model, camera_fps, stdout.lock(), None)?;
    info!("⏹️  Producer for '{}' finished after {} frames", model, written);
    Ok(())
}

/// Resolves `model`, deploys it on the camera and writes up to `limit` frames
/// to `out`.
pub fn produce_into<W: Write>(
    home: &Path,
    model: &str,
    camera_fps: u32,
    out: W,
    limit: Option<usize>,
) -> Result<u64> {
    let store = TomlModelStore::open(home).context("Failed to open model store")?;
    let config = resolve_model(&store, model)?;

    let mut camera = SyntheticCamera::new(camera_fps);
    camera.deploy(&config)?;
    info!("🎥 Producer capturing '{}' (pid {})", model, std::process::id());

    let frames = camera.frames()?;
    Ok(write_frames(frames, out, limit)?)
}

/// One JSON line per frame. A closed pipe ends the loop without error.
pub fn write_frames<I, W>(frames: I, mut out: W, limit: Option<usize>) -> CaptureResult<u64>
where
    I: Iterator<Item = CaptureResult<Frame>>,
    W: Write,
{
    let mut written = 0;
    for frame in frames.take(limit.unwrap_or(usize::MAX)) {
        let payload = render_payload(&frame?)?;
        let line = serde_json::to_string(&payload)?;
        match writeln!(out, "{}", line).and_then(|_| out.flush()) {
            Ok(()) => written += 1,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("Frame pipe closed by reader");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(written)
}
