//! Sample-rate conversion for captured audio.
//!
//! Device capture rates vary (44.1 kHz and 48 kHz are the usual suspects)
//! while the wire format is fixed at 16 kHz. Conversion is a windowed
//! average: each output sample is the mean of the input samples that fall
//! into its window. No state is carried between calls, so a multi-minute
//! session cannot drift.

/// Resample mono `input` from `input_rate` to `output_rate`.
///
/// Output length is `round(len / (input_rate / output_rate))`. Output sample
/// `i` averages the input window `[round(i * ratio), round((i + 1) * ratio))`;
/// an empty window (only possible when upsampling) falls back to the nearest
/// input sample.
pub fn resample(input: &[f32], input_rate: u32, output_rate: u32) -> Vec<f32> {
    if input_rate == output_rate || input.is_empty() || output_rate == 0 {
        return input.to_vec();
    }

    let ratio = input_rate as f64 / output_rate as f64;
    let out_len = (input.len() as f64 / ratio).round() as usize;
    let last = input.len() - 1;

    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let start = ((i as f64 * ratio).round() as usize).min(input.len());
        let end = (((i + 1) as f64 * ratio).round() as usize).min(input.len());

        if end > start {
            let window = &input[start..end];
            output.push(window.iter().sum::<f32>() / window.len() as f32);
        } else {
            output.push(input[start.min(last)]);
        }
    }
    output
}

/// Down-mix interleaved multi-channel audio to mono by averaging channels.
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected_len(len: usize, from: u32, to: u32) -> usize {
        (len as f64 / (from as f64 / to as f64)).round() as usize
    }

    #[test]
    fn test_equal_rates_pass_through() {
        let input = vec![0.1, -0.2, 0.3];
        assert_eq!(resample(&input, 16_000, 16_000), input);
    }

    #[test]
    fn test_output_length_for_common_device_rates() {
        for &(from, len) in &[(48_000u32, 4096usize), (44_100, 4096), (22_050, 1000), (32_000, 7)] {
            let input = vec![0.25f32; len];
            let out = resample(&input, from, 16_000);
            let want = expected_len(len, from, 16_000);
            assert!(
                (out.len() as i64 - want as i64).abs() <= 1,
                "{from} Hz x {len}: got {} want {want}",
                out.len()
            );
        }
    }

    #[test]
    fn test_integer_ratio_averages_windows() {
        // 3:1 decimation: each output is the mean of three inputs.
        let input = [0.0, 0.3, 0.6, 1.0, 1.0, 1.0, -0.3, -0.3, -0.3];
        let out = resample(&input, 48_000, 16_000);
        assert_eq!(out.len(), 3);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert!((out[1] - 1.0).abs() < 1e-6);
        assert!((out[2] + 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_resample_is_deterministic() {
        let input: Vec<f32> = (0..4096).map(|i| ((i as f32) * 0.01).sin()).collect();
        let a = resample(&input, 44_100, 16_000);
        let b = resample(&input, 44_100, 16_000);
        assert_eq!(a, b);
    }

    #[test]
    fn test_upsampling_falls_back_to_nearest_sample() {
        let input = [0.5, -0.5];
        let out = resample(&input, 8_000, 16_000);
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|s| *s == 0.5 || *s == -0.5));
    }

    #[test]
    fn test_empty_input() {
        assert!(resample(&[], 48_000, 16_000).is_empty());
    }

    #[test]
    fn test_downmix_stereo() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(downmix_to_mono(&stereo, 2), vec![0.5, 0.5, 0.0]);
        assert_eq!(downmix_to_mono(&stereo, 1), stereo.to_vec());
    }
}
