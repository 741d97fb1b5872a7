//! Gain and mixing stage of the ducking graph.
//!
//! Each source is scaled by its gain, summed, normalized by the square root
//! of the source count and passed through a soft knee so peaks round off
//! instead of clipping hard.

/// Level above which the soft knee starts compressing.
const KNEE: f32 = 0.9;

/// Scale a frame by `gain` in place.
pub fn apply_gain(frame: &mut [f32], gain: f32) {
    if gain == 1.0 {
        return;
    }
    for sample in frame {
        *sample *= gain;
    }
}

/// Soft-clip a sample into (-1, 1). Values inside the knee pass unchanged.
pub fn soft_clip(sample: f32) -> f32 {
    let magnitude = sample.abs();
    if magnitude <= KNEE {
        return sample;
    }
    let headroom = 1.0 - KNEE;
    let shaped = KNEE + headroom * ((magnitude - KNEE) / headroom).tanh();
    shaped.copysign(sample)
}

/// Mix `(frame, gain)` sources into one frame as long as the longest input.
pub fn mix_sources(sources: &[(&[f32], f32)]) -> Vec<f32> {
    let len = sources.iter().map(|(frame, _)| frame.len()).max().unwrap_or(0);
    let mut output = vec![0.0f32; len];

    for (frame, gain) in sources {
        for (out, &sample) in output.iter_mut().zip(frame.iter()) {
            *out += sample * gain;
        }
    }

    if sources.len() > 1 {
        let scale = 1.0 / (sources.len() as f32).sqrt();
        apply_gain(&mut output, scale);
    }

    for sample in &mut output {
        *sample = soft_clip(*sample);
    }
    output
}
