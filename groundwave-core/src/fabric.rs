//! IQ broadcast fabric: duplicates each source's block stream into
//! independent bounded queues without ever blocking the source.
//!
//! Publish walks a copy-on-write tap table and `try_send`s to every
//! consumer. A full queue drops the block for that consumer only and
//! bumps its drop counter; order is preserved per tap, so drops create
//! gaps, never reorderings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use tracing::debug;

use crate::block::IqBlock;

/// Identity of one consumer queue on a source's fabric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TapId {
    Spectrum,
    Demodulator { session_id: String, vfo: u8 },
    Decoder { session_id: String, vfo: u8 },
}

/// Queue depth sized for ~0.5 s of blocks at the 15 blocks/s cadence.
/// Latency, not throughput, is the axis being optimized.
pub const DEFAULT_TAP_CAPACITY: usize = 8;

/// How often a tap's drops are logged (once per N dropped blocks).
const DROP_LOG_EVERY: u64 = 64;

struct Tap {
    id: TapId,
    tx: Sender<IqBlock>,
    drops: Arc<AtomicU64>,
}

/// Per-source broadcast fan-out with a copy-on-write tap table.
pub struct IqBroadcaster {
    source_id: String,
    taps: RwLock<Arc<Vec<Tap>>>,
}

impl IqBroadcaster {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            taps: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Register a consumer queue. Replaces any existing tap with the
    /// same id; the swap is atomic with respect to publication.
    pub fn subscribe(&self, id: TapId, capacity: usize) -> (Receiver<IqBlock>, Arc<AtomicU64>) {
        let (tx, rx) = bounded(capacity.max(1));
        let drops = Arc::new(AtomicU64::new(0));
        let tap = Tap {
            id: id.clone(),
            tx,
            drops: Arc::clone(&drops),
        };

        let mut guard = self.taps.write();
        let mut next: Vec<Tap> = guard
            .iter()
            .filter(|t| t.id != id)
            .map(|t| Tap {
                id: t.id.clone(),
                tx: t.tx.clone(),
                drops: Arc::clone(&t.drops),
            })
            .collect();
        next.push(tap);
        *guard = Arc::new(next);
        (rx, drops)
    }

    /// Remove a consumer queue. The receiver observes disconnection.
    pub fn unsubscribe(&self, id: &TapId) {
        let mut guard = self.taps.write();
        let next: Vec<Tap> = guard
            .iter()
            .filter(|t| &t.id != id)
            .map(|t| Tap {
                id: t.id.clone(),
                tx: t.tx.clone(),
                drops: Arc::clone(&t.drops),
            })
            .collect();
        *guard = Arc::new(next);
    }

    /// Publish one block to every tap. Never blocks; returns the number
    /// of consumers that received the block.
    pub fn publish(&self, block: &IqBlock) -> usize {
        let taps = Arc::clone(&self.taps.read());
        let mut delivered = 0;
        for tap in taps.iter() {
            match tap.tx.try_send(block.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    let dropped = tap.drops.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped % DROP_LOG_EVERY == 1 {
                        debug!(
                            source = %self.source_id,
                            tap = ?tap.id,
                            dropped,
                            "consumer queue full, dropping block"
                        );
                    }
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        delivered
    }

    pub fn tap_count(&self) -> usize {
        self.taps.read().len()
    }

    pub fn drop_count(&self, id: &TapId) -> Option<u64> {
        self.taps
            .read()
            .iter()
            .find(|t| &t.id == id)
            .map(|t| t.drops.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex32;

    fn block(tag: f32) -> IqBlock {
        IqBlock::new(vec![Complex32::new(tag, 0.0); 4], 100_000_000, 2_048_000)
    }

    #[test]
    fn test_publish_reaches_all_taps() {
        let fabric = IqBroadcaster::new("sdr-0");
        let (rx_spec, _) = fabric.subscribe(TapId::Spectrum, 4);
        let (rx_demod, _) = fabric.subscribe(
            TapId::Demodulator {
                session_id: "a".into(),
                vfo: 1,
            },
            4,
        );

        assert_eq!(fabric.publish(&block(1.0)), 2);
        assert_eq!(rx_spec.try_recv().unwrap().samples[0].re, 1.0);
        assert_eq!(rx_demod.try_recv().unwrap().samples[0].re, 1.0);
    }

    #[test]
    fn test_full_tap_drops_and_counts_exactly_once() {
        let fabric = IqBroadcaster::new("sdr-0");
        let (rx, drops) = fabric.subscribe(TapId::Spectrum, 2);

        fabric.publish(&block(1.0));
        fabric.publish(&block(2.0));
        fabric.publish(&block(3.0)); // full: dropped
        assert_eq!(drops.load(Ordering::Relaxed), 1);

        // Other taps are unaffected by one full queue.
        let (rx2, _) = fabric.subscribe(
            TapId::Demodulator {
                session_id: "b".into(),
                vfo: 2,
            },
            4,
        );
        assert_eq!(fabric.publish(&block(4.0)), 1);
        assert_eq!(drops.load(Ordering::Relaxed), 2);
        assert_eq!(rx2.try_recv().unwrap().samples[0].re, 4.0);

        // Receiver sees blocks in order with a gap, never reordered.
        assert_eq!(rx.try_recv().unwrap().samples[0].re, 1.0);
        assert_eq!(rx.try_recv().unwrap().samples[0].re, 2.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_disconnects_receiver() {
        let fabric = IqBroadcaster::new("sdr-0");
        let id = TapId::Decoder {
            session_id: "a".into(),
            vfo: 1,
        };
        let (rx, _) = fabric.subscribe(id.clone(), 4);
        fabric.unsubscribe(&id);
        assert_eq!(fabric.tap_count(), 0);
        fabric.publish(&block(1.0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_resubscribe_replaces_tap() {
        let fabric = IqBroadcaster::new("sdr-0");
        let (old_rx, _) = fabric.subscribe(TapId::Spectrum, 4);
        let (new_rx, _) = fabric.subscribe(TapId::Spectrum, 4);
        assert_eq!(fabric.tap_count(), 1);
        fabric.publish(&block(7.0));
        assert!(old_rx.try_recv().is_err());
        assert_eq!(new_rx.try_recv().unwrap().samples[0].re, 7.0);
    }

    #[test]
    fn test_consumers_share_sample_storage() {
        let fabric = IqBroadcaster::new("sdr-0");
        let (rx1, _) = fabric.subscribe(TapId::Spectrum, 4);
        let (rx2, _) = fabric.subscribe(
            TapId::Demodulator {
                session_id: "a".into(),
                vfo: 1,
            },
            4,
        );
        fabric.publish(&block(1.0));
        let a = rx1.try_recv().unwrap();
        let b = rx2.try_recv().unwrap();
        assert!(Arc::ptr_eq(&a.samples, &b.samples));
    }
}
