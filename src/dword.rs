//! Pseudo-dword access.
//!
//! SLMP has no command for reading or writing a 32-bit value at a device
//! number, so a dword at `D100` is emulated as two consecutive words: the low
//! 16 bits at `D100` and the high 16 bits at `D101`. The splitter turns dword
//! items into word pairs before encoding and the combiner reassembles them
//! after decoding. Both directions are pure.
//!
//! ```
//! use voltage_slmp::device::DeviceCode;
//! use voltage_slmp::dword::{DwordItem, PseudoDwordSplitter};
//!
//! let splitter = PseudoDwordSplitter::default();
//! let pairs = splitter.split(&[DwordItem::new(DeviceCode::D, 100, 0x1234_5678)]).unwrap();
//! assert_eq!(pairs[0].low.value, 0x5678);
//! assert_eq!(pairs[0].high.address, 101);
//! assert_eq!(splitter.combine(&pairs).unwrap()[0].value, 0x1234_5678);
//!
//! // D65535 has no room for the high word
//! assert!(splitter.split(&[DwordItem::new(DeviceCode::D, 65535, 1)]).is_err());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::device::{DeviceAddress, DeviceCode, DeviceRanges};
use crate::error::{SlmpError, SlmpResult, Violation};

/// A single 16-bit device value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WordItem {
    pub device: DeviceCode,
    pub address: u32,
    pub value: u16,
}

impl WordItem {
    pub fn new(device: DeviceCode, address: u32, value: u16) -> Self {
        Self {
            device,
            address,
            value,
        }
    }
}

/// Low and high words backing one pseudo-dword.
///
/// `high.address` is always `low.address + 1` on the same device for pairs
/// produced by [`PseudoDwordSplitter::split`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordPair {
    pub low: WordItem,
    pub high: WordItem,
}

/// A 32-bit value at a device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DwordItem {
    pub device: DeviceCode,
    pub address: u32,
    pub value: u32,
}

impl DwordItem {
    pub fn new(device: DeviceCode, address: u32, value: u32) -> Self {
        Self {
            device,
            address,
            value,
        }
    }
}

/// Counters kept by the splitter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SplitterStats {
    pub total_conversions: u64,
    pub words_generated: u64,
    pub total_combinations: u64,
    pub dwords_generated: u64,
    pub average_conversion_time: Duration,
    pub average_combination_time: Duration,
}

/// Splits dwords into word pairs and combines them back
#[derive(Debug, Default)]
pub struct PseudoDwordSplitter {
    ranges: DeviceRanges,
    conversions: AtomicU64,
    words_generated: AtomicU64,
    conversion_nanos: AtomicU64,
    combinations: AtomicU64,
    dwords_generated: AtomicU64,
    combination_nanos: AtomicU64,
}

impl PseudoDwordSplitter {
    /// Splitter that checks addresses against `ranges`
    pub fn new(ranges: DeviceRanges) -> Self {
        Self {
            ranges,
            ..Default::default()
        }
    }

    /// Device ranges used for boundary checks
    pub fn ranges(&self) -> &DeviceRanges {
        &self.ranges
    }

    /// Check that every dword start address leaves room for its high word.
    ///
    /// Returns all violations at once.
    pub fn validate_addresses<'a, I>(&self, addresses: I) -> SlmpResult<()>
    where
        I: IntoIterator<Item = &'a DeviceAddress>,
    {
        let violations: Vec<Violation> = addresses
            .into_iter()
            .filter_map(|a| self.check_pair(a.device, a.address))
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(SlmpError::validation(violations))
        }
    }

    /// Split dword items into word pairs, low word first
    pub fn split(&self, items: &[DwordItem]) -> SlmpResult<Vec<WordPair>> {
        let started = Instant::now();
        let violations: Vec<Violation> = items
            .iter()
            .filter_map(|item| self.check_pair(item.device, item.address))
            .collect();
        if !violations.is_empty() {
            return Err(SlmpError::validation(violations));
        }

        let pairs: Vec<WordPair> = items
            .iter()
            .map(|item| WordPair {
                low: WordItem::new(item.device, item.address, (item.value & 0xFFFF) as u16),
                high: WordItem::new(item.device, item.address + 1, (item.value >> 16) as u16),
            })
            .collect();

        self.conversions.fetch_add(1, Ordering::Relaxed);
        self.words_generated
            .fetch_add(pairs.len() as u64 * 2, Ordering::Relaxed);
        self.conversion_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        Ok(pairs)
    }

    /// Word addresses to read for a list of dword addresses, in pair order
    /// (`[low0, high0, low1, high1, ...]`).
    pub fn split_addresses(&self, addresses: &[DeviceAddress]) -> SlmpResult<Vec<DeviceAddress>> {
        self.validate_addresses(addresses)?;
        Ok(addresses
            .iter()
            .flat_map(|a| [*a, DeviceAddress::new(a.device, a.address + 1)])
            .collect())
    }

    /// Recombine word pairs into dwords
    ///
    /// Pairs whose high word is not on the same device at `low + 1` are
    /// rejected; every malformed pair is listed.
    pub fn combine(&self, pairs: &[WordPair]) -> SlmpResult<Vec<DwordItem>> {
        let started = Instant::now();
        let violations: Vec<Violation> = pairs
            .iter()
            .filter(|p| p.low.device != p.high.device || p.low.address.checked_add(1) != Some(p.high.address))
            .map(|p| {
                Violation::at(
                    p.low.device,
                    p.low.address,
                    format!(
                        "high word {}{} is not adjacent to the low word",
                        p.high.device,
                        p.high.device.format_address(p.high.address)
                    ),
                )
            })
            .collect();
        if !violations.is_empty() {
            return Err(SlmpError::validation(violations));
        }

        let items: Vec<DwordItem> = pairs
            .iter()
            .map(|p| DwordItem::new(p.low.device, p.low.address, combine_words(p.low.value, p.high.value)))
            .collect();

        self.combinations.fetch_add(1, Ordering::Relaxed);
        self.dwords_generated
            .fetch_add(items.len() as u64, Ordering::Relaxed);
        self.combination_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        Ok(items)
    }

    /// Combine words read as `[low0, high0, low1, high1, ...]` for `addresses`
    pub fn combine_words(&self, addresses: &[DeviceAddress], words: &[u16]) -> SlmpResult<Vec<u32>> {
        if words.len() != addresses.len() * 2 {
            return Err(SlmpError::internal(format!(
                "Expected {} words for {} dwords, got {}",
                addresses.len() * 2,
                addresses.len(),
                words.len()
            )));
        }
        let pairs: Vec<WordPair> = addresses
            .iter()
            .zip(words.chunks_exact(2))
            .map(|(a, w)| WordPair {
                low: WordItem::new(a.device, a.address, w[0]),
                high: WordItem::new(a.device, a.address + 1, w[1]),
            })
            .collect();
        Ok(self.combine(&pairs)?.into_iter().map(|d| d.value).collect())
    }

    /// Snapshot of conversion counters
    pub fn stats(&self) -> SplitterStats {
        let conversions = self.conversions.load(Ordering::Relaxed);
        let combinations = self.combinations.load(Ordering::Relaxed);
        SplitterStats {
            total_conversions: conversions,
            words_generated: self.words_generated.load(Ordering::Relaxed),
            total_combinations: combinations,
            dwords_generated: self.dwords_generated.load(Ordering::Relaxed),
            average_conversion_time: average(self.conversion_nanos.load(Ordering::Relaxed), conversions),
            average_combination_time: average(self.combination_nanos.load(Ordering::Relaxed), combinations),
        }
    }

    fn check_pair(&self, device: DeviceCode, address: u32) -> Option<Violation> {
        self.ranges.check_range(device, address, 2).map(|_| {
            Violation::at(
                device,
                address,
                format!(
                    "dword needs {}{} for its high word, beyond maximum address {}{}",
                    device,
                    device.format_address(address.saturating_add(1)),
                    device,
                    device.format_address(self.ranges.max_address(device))
                ),
            )
        })
    }
}

/// `low | high << 16`
pub fn combine_words(low: u16, high: u16) -> u32 {
    low as u32 | (high as u32) << 16
}

fn average(total_nanos: u64, count: u64) -> Duration {
    if count == 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(total_nanos / count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_combine_round_trip() {
        let splitter = PseudoDwordSplitter::default();
        let items = vec![
            DwordItem::new(DeviceCode::D, 0, 0),
            DwordItem::new(DeviceCode::D, 100, 0xDEAD_BEEF),
            DwordItem::new(DeviceCode::W, 0x1FE, u32::MAX),
            DwordItem::new(DeviceCode::R, 65534, 0x0001_0000),
        ];
        let pairs = splitter.split(&items).unwrap();
        assert_eq!(pairs.len(), 4);
        for pair in &pairs {
            assert_eq!(pair.high.address, pair.low.address + 1);
        }
        assert_eq!(splitter.combine(&pairs).unwrap(), items);

        let stats = splitter.stats();
        assert_eq!(stats.total_conversions, 1);
        assert_eq!(stats.words_generated, 8);
        assert_eq!(stats.dwords_generated, 4);
    }

    #[test]
    fn test_boundary_rejection_lists_every_item() {
        let splitter = PseudoDwordSplitter::default();
        let err = splitter
            .split(&[
                DwordItem::new(DeviceCode::D, 65535, 7),
                DwordItem::new(DeviceCode::D, 10, 7),
                DwordItem::new(DeviceCode::W, 0xFFFF, 7),
            ])
            .unwrap_err();

        let violations = err.violations();
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].device, Some(DeviceCode::D));
        assert_eq!(violations[0].address, Some(65535));
        assert_eq!(violations[1].device, Some(DeviceCode::W));
        assert!(err.to_string().contains("D65535"));
        assert_eq!(splitter.stats().total_conversions, 0);
    }

    #[test]
    fn test_configured_ranges_apply() {
        let ranges = DeviceRanges::default().with_max_address(DeviceCode::D, 12287);
        let splitter = PseudoDwordSplitter::new(ranges);
        assert!(splitter.split(&[DwordItem::new(DeviceCode::D, 12286, 1)]).is_ok());
        assert!(splitter.split(&[DwordItem::new(DeviceCode::D, 12287, 1)]).is_err());
    }

    #[test]
    fn test_combine_rejects_non_adjacent_pairs() {
        let splitter = PseudoDwordSplitter::default();
        let pair = WordPair {
            low: WordItem::new(DeviceCode::D, 10, 1),
            high: WordItem::new(DeviceCode::D, 12, 2),
        };
        let other_device = WordPair {
            low: WordItem::new(DeviceCode::D, 10, 1),
            high: WordItem::new(DeviceCode::W, 11, 2),
        };
        let err = splitter.combine(&[pair, other_device]).unwrap_err();
        assert!(matches!(err, SlmpError::Validation { .. }));
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn test_split_addresses_and_combine_words() {
        let splitter = PseudoDwordSplitter::default();
        let addrs = [DeviceAddress::new(DeviceCode::D, 200), DeviceAddress::new(DeviceCode::D, 300)];
        let words = splitter.split_addresses(&addrs).unwrap();
        assert_eq!(
            words,
            vec![
                DeviceAddress::new(DeviceCode::D, 200),
                DeviceAddress::new(DeviceCode::D, 201),
                DeviceAddress::new(DeviceCode::D, 300),
                DeviceAddress::new(DeviceCode::D, 301),
            ]
        );
        let values = splitter.combine_words(&addrs, &[0x5678, 0x1234, 1, 0]).unwrap();
        assert_eq!(values, vec![0x1234_5678, 1]);
        assert!(splitter.combine_words(&addrs, &[1, 2, 3]).is_err());
    }
}
