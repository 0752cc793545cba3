//! Spilling accumulator.
//!
//! Records are collected into a key-ordered table where values of equal keys are joined with a single space.
//! The table is spilled to a sorted partition when available system memory drops below a floor or when it holds
//! more distinct keys than a configured limit.
//!
//! Available memory is polled every `check_every` inserts rather than on every insert. A larger interval lowers
//! the polling overhead but lets the table grow further past the floor before the next check; tune it together
//! with the floor.

use std::collections::BTreeMap;

use bytesize::ByteSize;
use log;
use sysinfo::System;

use crate::partition::{ChunkError, PartitionFile, PartitionId, PartitionWriter};
use crate::record::Record;

/// Default available memory floor: 500 MB.
pub const DEFAULT_MIN_AVAILABLE_BYTES: u64 = 500 * bytesize::MB;
/// Default number of inserts between two memory checks.
pub const DEFAULT_CHECK_EVERY: usize = 10_000;

/// Source of the currently available system memory.
pub trait MemoryProbe: Send {
    /// Returns available memory in bytes.
    fn available_bytes(&mut self) -> u64;
}

/// Memory probe backed by the operating system.
pub struct SystemMemory {
    sys: System,
}

impl SystemMemory {
    pub fn new() -> Self {
        SystemMemory { sys: System::new() }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        SystemMemory::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn available_bytes(&mut self) -> u64 {
        self.sys.refresh_memory();
        self.sys.available_memory()
    }
}

/// Memory probe reporting a fixed amount.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub u64);

impl MemoryProbe for FixedMemory {
    fn available_bytes(&mut self) -> u64 {
        self.0
    }
}

/// Spill triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillPolicy {
    /// Spill once available memory drops below this many bytes.
    pub min_available_bytes: u64,
    /// Spill once the table holds more distinct keys than this.
    pub record_limit: Option<usize>,
    /// Number of inserts between two memory checks.
    pub check_every: usize,
}

impl SpillPolicy {
    pub fn new(min_available_bytes: u64) -> Self {
        SpillPolicy {
            min_available_bytes,
            ..SpillPolicy::default()
        }
    }

    pub fn with_record_limit(mut self, record_limit: usize) -> Self {
        self.record_limit = Some(record_limit);
        return self;
    }

    pub fn with_check_every(mut self, check_every: usize) -> Self {
        self.check_every = check_every.max(1);
        return self;
    }
}

impl Default for SpillPolicy {
    fn default() -> Self {
        SpillPolicy {
            min_available_bytes: DEFAULT_MIN_AVAILABLE_BYTES,
            record_limit: None,
            check_every: DEFAULT_CHECK_EVERY,
        }
    }
}

/// Key-ordered in-memory table that spills to sorted partitions.
pub struct SpillingAccumulator<M: MemoryProbe = SystemMemory> {
    table: BTreeMap<String, String>,
    policy: SpillPolicy,
    probe: M,
    inserts: u64,
    inserts_since_check: usize,
    last_available: Option<u64>,
    memory_low: bool,
}

impl SpillingAccumulator<SystemMemory> {
    /// Creates an accumulator checking the operating system's available memory.
    pub fn new(policy: SpillPolicy) -> Self {
        SpillingAccumulator::with_probe(policy, SystemMemory::new())
    }
}

impl<M: MemoryProbe> SpillingAccumulator<M> {
    pub fn with_probe(policy: SpillPolicy, probe: M) -> Self {
        SpillingAccumulator {
            table: BTreeMap::new(),
            policy,
            probe,
            inserts: 0,
            inserts_since_check: 0,
            last_available: None,
            memory_low: false,
        }
    }

    /// Appends `value` to the entry of `key`, creating the entry if needed.
    /// Empty values only register the key.
    pub fn insert(&mut self, key: String, value: String) {
        self.inserts += 1;
        self.inserts_since_check += 1;

        match self.table.get_mut(&key) {
            Some(existing) => {
                if !value.is_empty() {
                    if !existing.is_empty() {
                        existing.push(' ');
                    }
                    existing.push_str(&value);
                }
            }
            None => {
                self.table.insert(key, value);
            }
        }
    }

    pub fn insert_record(&mut self, record: Record) {
        self.insert(record.key, record.value)
    }

    /// Number of distinct keys held.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Total number of inserts since creation.
    pub fn inserts(&self) -> u64 {
        self.inserts
    }

    /// Available memory observed at the most recent check.
    pub fn last_available(&self) -> Option<u64> {
        self.last_available
    }

    /// Checks the spill triggers. Memory is only polled every `check_every` inserts.
    pub fn should_spill(&mut self) -> bool {
        if let Some(limit) = self.policy.record_limit {
            if self.table.len() > limit {
                return true;
            }
        }

        if self.inserts_since_check >= self.policy.check_every {
            self.inserts_since_check = 0;
            let available = self.probe.available_bytes();
            self.last_available = Some(available);
            self.memory_low = available < self.policy.min_available_bytes;
            if self.memory_low {
                log::info!(
                    "available memory {} below floor {}, spilling {} keys",
                    ByteSize(available),
                    ByteSize(self.policy.min_available_bytes),
                    self.table.len()
                );
            }
        }

        return self.memory_low && !self.table.is_empty();
    }

    /// Takes the table content in key order, leaving the table empty.
    pub fn drain_sorted(&mut self) -> impl Iterator<Item = Record> {
        self.memory_low = false;
        std::mem::take(&mut self.table)
            .into_iter()
            .map(|(key, value)| Record { key, value })
    }

    /// Writes the table, in key order, as a new partition and clears it.
    /// Returns [`None`] when the table is empty.
    pub fn spill<C: PartitionFile>(
        &mut self,
        writer: &mut PartitionWriter,
    ) -> Result<Option<(PartitionId, std::path::PathBuf)>, ChunkError> {
        if self.table.is_empty() {
            return Ok(None);
        }

        let keys = self.table.len();
        let spilled = writer.write::<C>(self.drain_sorted())?;
        log::debug!("spilled {} keys into partition {}", keys, spilled.0);

        return Ok(Some(spilled));
    }
}

#[cfg(test)]
mod test {
    use rand::seq::SliceRandom;
    use rstest::*;

    use super::{FixedMemory, MemoryProbe, SpillPolicy, SpillingAccumulator};
    use crate::partition::{ChunkError, LineChunk, PartitionFile, PartitionWriter};
    use crate::record::Record;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    /// Probe reporting plenty of memory until told otherwise.
    struct SteppedMemory {
        readings: Vec<u64>,
    }

    impl MemoryProbe for SteppedMemory {
        fn available_bytes(&mut self) -> u64 {
            if self.readings.len() > 1 {
                self.readings.remove(0)
            } else {
                self.readings[0]
            }
        }
    }

    fn plenty() -> FixedMemory {
        FixedMemory(u64::MAX)
    }

    fn read(path: &std::path::Path) -> Vec<Record> {
        let records: Result<Vec<Record>, ChunkError> = LineChunk::open(path, None).unwrap().collect();
        records.unwrap()
    }

    #[rstest]
    fn test_single_spill_with_record_limit(tmp_dir: tempfile::TempDir) {
        let mut acc = SpillingAccumulator::with_probe(SpillPolicy::default().with_record_limit(2), plenty());
        let mut writer = PartitionWriter::new(tmp_dir.path(), "test", None);
        let mut spills = Vec::new();

        for (key, value) in [("bob", "hi"), ("amy", "yo"), ("bob", "there")] {
            acc.insert(key.to_string(), value.to_string());
            if acc.should_spill() {
                spills.extend(acc.spill::<LineChunk>(&mut writer).unwrap());
            }
        }
        spills.extend(acc.spill::<LineChunk>(&mut writer).unwrap());

        assert_eq!(spills.len(), 1);
        assert_eq!(
            read(&spills[0].1),
            vec![Record::new("amy", "yo"), Record::new("bob", "hi there")]
        );
    }

    #[rstest]
    fn test_record_limit_exceeded(tmp_dir: tempfile::TempDir) {
        let mut acc = SpillingAccumulator::with_probe(SpillPolicy::default().with_record_limit(1), plenty());
        let mut writer = PartitionWriter::new(tmp_dir.path(), "test", None);

        acc.insert("bob".into(), "hi".into());
        assert!(!acc.should_spill());
        acc.insert("amy".into(), "yo".into());
        assert!(acc.should_spill());

        let (_, path) = acc.spill::<LineChunk>(&mut writer).unwrap().unwrap();
        assert!(acc.is_empty());
        assert_eq!(read(&path), vec![Record::new("amy", "yo"), Record::new("bob", "hi")]);
    }

    #[test]
    fn test_memory_floor_polled_periodically() {
        let probe = SteppedMemory {
            readings: vec![1_000, 10],
        };
        let mut acc = SpillingAccumulator::with_probe(SpillPolicy::new(100).with_check_every(3), probe);

        let mut decisions = Vec::new();
        for i in 0..6 {
            acc.insert(format!("key{}", i), String::new());
            decisions.push(acc.should_spill());
        }

        assert_eq!(decisions, vec![false, false, false, false, false, true]);
        assert_eq!(acc.last_available(), Some(10));
    }

    #[test]
    fn test_low_memory_persists_until_spill() {
        let mut acc = SpillingAccumulator::with_probe(SpillPolicy::new(100).with_check_every(1), FixedMemory(10));
        acc.insert("amy".into(), "yo".into());
        assert!(acc.should_spill());

        let drained: Vec<Record> = acc.drain_sorted().collect();
        assert_eq!(drained, vec![Record::new("amy", "yo")]);
        // an empty table never asks to spill
        assert!(!acc.should_spill());
    }

    #[test]
    fn test_empty_values_only_register_keys() {
        let mut acc = SpillingAccumulator::with_probe(SpillPolicy::default(), plenty());
        acc.insert("amy".into(), String::new());
        acc.insert("amy".into(), "1".into());
        acc.insert("amy".into(), String::new());
        acc.insert("bob".into(), String::new());

        let drained: Vec<Record> = acc.drain_sorted().collect();
        assert_eq!(drained, vec![Record::new("amy", "1"), Record::key_only("bob")]);
        assert_eq!(acc.inserts(), 4);
    }

    #[rstest]
    fn test_spill_keeps_every_record(tmp_dir: tempfile::TempDir) {
        let mut input = Vec::from_iter((0..50).map(|i| format!("user{:02}", i % 17)));
        input.shuffle(&mut rand::thread_rng());

        let mut acc = SpillingAccumulator::with_probe(SpillPolicy::default().with_record_limit(4), plenty());
        let mut writer = PartitionWriter::new(tmp_dir.path(), "test", None);
        let mut paths = Vec::new();
        for key in input.iter() {
            acc.insert(key.clone(), "x".into());
            if acc.should_spill() {
                paths.extend(acc.spill::<LineChunk>(&mut writer).unwrap().map(|(_, path)| path));
            }
        }
        paths.extend(acc.spill::<LineChunk>(&mut writer).unwrap().map(|(_, path)| path));

        let mut total = 0;
        for path in paths.iter() {
            let records = read(path);
            assert!(records.windows(2).all(|w| w[0].key < w[1].key));
            total += records.iter().map(|r| r.value.split(' ').count()).sum::<usize>();
        }
        assert_eq!(total, input.len());
    }
}
