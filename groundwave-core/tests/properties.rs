//! Property tests for the ordering and roundtrip guarantees.

use num_complex::Complex32;
use proptest::prelude::*;

use groundwave_core::config::{ConfigChange, ConfigPatch, SourceConfig};
use groundwave_core::decode::hdlc::{hdlc_encode, HdlcDeframer};
use groundwave_core::fabric::{IqBroadcaster, TapId};
use groundwave_core::signal_processing::resample::{output_len, resample};
use groundwave_core::IqBlock;

proptest! {
    /// Any payload survives HDLC encode/deframe byte-identically.
    #[test]
    fn hdlc_roundtrip(payload in proptest::collection::vec(any::<u8>(), 3..256)) {
        let bits = hdlc_encode(&payload, 4);
        let mut deframer = HdlcDeframer::new();
        let frames = deframer.push(bits);
        prop_assert_eq!(frames, vec![payload]);
    }

    /// A consumer's received blocks are always an order-preserving
    /// subsequence of what the source published.
    #[test]
    fn fabric_delivery_is_a_subsequence(
        total in 1usize..64,
        capacity in 1usize..8,
        drain_every in 1usize..8,
    ) {
        let fabric = IqBroadcaster::new("prop");
        let (rx, _drops) = fabric.subscribe(TapId::Spectrum, capacity);

        let mut received: Vec<i64> = Vec::new();
        for tag in 0..total as i64 {
            let block = IqBlock::new(vec![Complex32::new(0.0, 0.0); 1], tag, 48_000);
            fabric.publish(&block);
            if tag as usize % drain_every == 0 {
                while let Ok(block) = rx.try_recv() {
                    received.push(block.center_freq);
                }
            }
        }
        while let Ok(block) = rx.try_recv() {
            received.push(block.center_freq);
        }

        // Strictly increasing tags: order preserved, gaps allowed.
        prop_assert!(received.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(received.iter().all(|&tag| tag >= 0 && tag < total as i64));
    }

    /// Applying the same patch twice is a no-op after the first.
    #[test]
    fn config_patch_idempotent(
        center in proptest::option::of(1_000_000i64..2_000_000_000),
        rate in proptest::option::of(240_000u32..3_200_000),
        fft in proptest::option::of(8usize..17),
    ) {
        let patch = ConfigPatch {
            center_freq: center,
            sample_rate: rate,
            fft_size: fft.map(|exp| 1usize << exp),
            ..Default::default()
        };
        let mut config = SourceConfig::default();
        let _ = config.apply(&patch);
        let after_first = config.clone();
        prop_assert_eq!(config.apply(&patch), ConfigChange::None);
        prop_assert_eq!(config, after_first);
    }

    /// The FFT resampler always yields exactly the requested length.
    #[test]
    fn resample_length_exact(
        len in 2usize..4096,
        out in 1usize..4096,
    ) {
        let input: Vec<f32> = (0..len).map(|i| (i as f32 * 0.01).sin()).collect();
        prop_assert_eq!(resample(&input, out).len(), out);
    }
}

#[test]
fn output_len_matches_rate_ratio() {
    assert_eq!(output_len(48_000, 48_000.0, 44_100.0), 44_100);
    assert_eq!(output_len(4096, 2_048_000.0, 44_100.0), 88);
}
