/// Linear-interpolation resampler for normalizing incoming streams to the
/// 16 kHz inference rate.
///
/// Network sources deliver arbitrary rates (44.1 kHz RTMP, 48 kHz SRT);
/// linear interpolation keeps the hot ingestion path allocation-light and
/// is adequate for speech content.
pub struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> crate::Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(crate::Error::Config(format!(
                "invalid resample rates: {} -> {}",
                from_rate, to_rate
            )));
        }
        Ok(Self { from_rate, to_rate })
    }

    /// Resample mono samples. A no-op copy when the rates match.
    pub fn resample(&self, input: &[f32]) -> Vec<f32> {
        if self.from_rate == self.to_rate || input.is_empty() {
            return input.to_vec();
        }

        let ratio = self.from_rate as f64 / self.to_rate as f64;
        let output_len = (input.len() as f64 / ratio).round() as usize;
        let mut output = Vec::with_capacity(output_len);

        for i in 0..output_len {
            let position = i as f64 * ratio;
            let index = position as usize;
            let fraction = (position - index as f64) as f32;

            let a = input[index.min(input.len() - 1)];
            let b = input[(index + 1).min(input.len() - 1)];
            output.push(a + (b - a) * fraction);
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_rate_is_identity() {
        let resampler = LinearResampler::new(16_000, 16_000).unwrap();
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resampler.resample(&input), input);
    }

    #[test]
    fn test_three_to_one_downsample_length() {
        let resampler = LinearResampler::new(48_000, 16_000).unwrap();
        let input = vec![0.0; 48_000];
        assert_eq!(resampler.resample(&input).len(), 16_000);
    }

    #[test]
    fn test_fractional_ratio_length() {
        let resampler = LinearResampler::new(44_100, 16_000).unwrap();
        let input = vec![0.0; 44_100];
        let output = resampler.resample(&input);
        // One second in is one second out, within a sample.
        assert!((output.len() as i64 - 16_000).abs() <= 1);
    }

    #[test]
    fn test_upsample_interpolates_between_samples() {
        let resampler = LinearResampler::new(8_000, 16_000).unwrap();
        let output = resampler.resample(&[0.0, 1.0]);
        assert_eq!(output.len(), 4);
        assert!((output[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(LinearResampler::new(0, 16_000).is_err());
    }
}
