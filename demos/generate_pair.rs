//! Render/capture pair generator
//!
//! Writes a white-noise render signal and a capture signal made of a delayed,
//! attenuated copy of the render plus a 440 Hz near-end tone in the middle
//! third. The pair can be fed straight to the comparator binary.
//!
//! ## How to Run
//!
//! ```sh
//! cargo run --example generate_pair --release -- output_pair
//! cargo run --release -- output_pair/render.wav output_pair/capture.wav
//! ```

use std::path::PathBuf;

use aec_comparator::{wav, PcmSignal, SAMPLE_RATE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DURATION_S: u32 = 6;
const ECHO_DELAY_SAMPLES: usize = 320;
const ECHO_GAIN: f32 = 0.5;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let output_dir = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "output_pair".to_string()),
    );
    std::fs::create_dir_all(&output_dir)?;

    let total_samples = (SAMPLE_RATE * DURATION_S) as usize;
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let render: Vec<f32> = (0..total_samples)
        .map(|_| rng.gen_range(-0.3..0.3))
        .collect();

    // Reflections spaced 20 samples apart after the direct path.
    let rir = [1.0, 0.0, -0.25, 0.0, 0.12, 0.05];
    let mut capture = vec![0.0f32; total_samples];
    for (i, sample) in capture.iter_mut().enumerate() {
        for (j, &coeff) in rir.iter().enumerate() {
            let lag = ECHO_DELAY_SAMPLES + j * 20;
            if i >= lag {
                *sample += ECHO_GAIN * coeff * render[i - lag];
            }
        }
    }

    let near_start = total_samples / 3;
    let near_end = 2 * total_samples / 3;
    for (i, sample) in capture.iter_mut().enumerate().take(near_end).skip(near_start) {
        let t = i as f32 / SAMPLE_RATE as f32;
        *sample += 0.3 * (2.0 * std::f32::consts::PI * 440.0 * t).sin();
    }

    let render_path = output_dir.join("render.wav");
    let capture_path = output_dir.join("capture.wav");
    wav::encode(&render_path, &to_pcm(&render))?;
    wav::encode(&capture_path, &to_pcm(&capture))?;

    println!("render:  {}", render_path.display());
    println!("capture: {}", capture_path.display());
    println!(
        "echo delay: {} samples ({} blocks)",
        ECHO_DELAY_SAMPLES,
        ECHO_DELAY_SAMPLES / aec_comparator::BLOCK_SIZE
    );
    Ok(())
}

fn to_pcm(signal: &[f32]) -> PcmSignal {
    signal
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect::<Vec<_>>()
        .into()
}
