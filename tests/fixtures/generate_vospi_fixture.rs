//! Generates a synthetic Lepton 3 capture for replay testing.
//!
//! Run with: `cargo run --bin generate_vospi_fixture [output_dir]`
//!
//! Writes `packets.bin` and `metadata.json` into `output_dir` (default
//! `tests/fixtures/lepton3_synthetic`). The stream mimics a camera coming
//! up: blank packets while it warms up, padding between segments, two
//! complete frames, a desync (error flagged packet) and a third frame:
//!
//! - Frame 1: `Coordinates` pattern, every pixel `(y << 8) | x`
//! - Frame 2: `Gradient` pattern
//! - Segments 1-2 of a `Checkerboard` frame, then an error packet
//! - Frame 3: `Checkerboard` pattern

use std::path::PathBuf;

use anyhow::{Context, Result};
use lepton_vospi::capture::{write_capture, CaptureMetadata};
use lepton_vospi::packet::PACKET_SIZE;
use lepton_vospi::replay::CaptureFrames;
use lepton_vospi::test_utils::{StreamBuilder, TestPattern};
use lepton_vospi::transport::DEFAULT_SPEED_HZ;

/// Packets per recorded transfer, as in the default session config
const PACKETS_PER_TRANSFER: usize = 200;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let output_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .join("tests")
                .join("fixtures")
                .join("lepton3_synthetic")
        });
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let stream = StreamBuilder::new()
        .blank(8)
        .padding(25)
        .frame(TestPattern::Coordinates)
        .padding(40)
        .frame(TestPattern::Gradient)
        .padding(40)
        .segments(TestPattern::Checkerboard, 1..=2)
        .fatal(17)
        .padding(60)
        .frame(TestPattern::Checkerboard)
        .padding(100)
        .build();

    let transfers: Vec<Vec<u8>> = stream
        .chunks(PACKETS_PER_TRANSFER * PACKET_SIZE)
        .map(<[u8]>::to_vec)
        .collect();
    log::info!(
        "Generated {} packets in {} transfers",
        stream.len() / PACKET_SIZE,
        transfers.len()
    );

    let metadata = CaptureMetadata {
        bus_speed_hz: DEFAULT_SPEED_HZ,
        total_frames: 3,
        description: "Synthetic Lepton 3 stream: 3 frames, blanks, padding and one desync"
            .to_string(),
        ..Default::default()
    };
    let result = write_capture(&output_dir, &transfers, metadata).context("writing capture")?;
    log::info!(
        "Wrote {} and {}",
        result.packets_path.display(),
        result.metadata_path.display()
    );

    // Sanity check: the fixture must decode to exactly the three frames
    let decoded = CaptureFrames::new(&output_dir)
        .context("reloading capture")?
        .count();
    anyhow::ensure!(decoded == 3, "fixture decodes to {} frames, expected 3", decoded);
    log::info!("Verified: {} frames decode", decoded);

    Ok(())
}
