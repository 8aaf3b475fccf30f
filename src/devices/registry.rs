//! Canonical device registry with per-field last-writer-wins

use std::collections::HashMap;

use indexmap::IndexMap;

use super::clock::{Clock, Stamp};
use super::store::{DeviceRecord, DeviceStore, MemoryStore, StoredRegistry, Tombstone};
use super::types::{
    Device, DeviceField, DeviceId, DeviceStatus, FieldChange, FieldValue, RegistryDelta,
    SyncDigest, WakeAddress,
};
use crate::peer::PeerId;
use crate::{Error, Result};

/// Log length that triggers compaction back to one entry per live field
const LOG_COMPACT_THRESHOLD: usize = 4096;

/// Registry of known devices
///
/// Holds devices in insertion order, a stamp per (device, field), tombstones
/// for deleted ids and a log of every effective change used to answer resync
/// requests.
pub struct Registry {
    records: IndexMap<DeviceId, DeviceRecord>,
    tombstones: HashMap<DeviceId, Stamp>,
    log: Vec<FieldChange>,
    clock: Clock,
    store: Box<dyn DeviceStore>,
    next_seq: u64,
    dirty: bool,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("peer", self.clock.peer())
            .field("devices", &self.records.len())
            .field("tombstones", &self.tombstones.len())
            .field("log", &self.log.len())
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Load the registry from durable storage
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub fn open(store: Box<dyn DeviceStore>, mut clock: Clock) -> Result<Self> {
        let stored = store.load()?;

        let mut records = IndexMap::with_capacity(stored.devices.len());
        for (seq, mut record) in (0u64..).zip(stored.devices) {
            for (_, stamp) in record.clocks.iter() {
                clock.observe(stamp);
            }
            record.seq = seq;
            records.insert(record.device.id.clone(), record);
        }

        let tombstones: HashMap<DeviceId, Stamp> = stored
            .tombstones
            .into_iter()
            .map(|t| {
                clock.observe(&t.stamp);
                (t.device_id, t.stamp)
            })
            .collect();

        let next_seq = records.len() as u64;
        let mut registry = Self {
            records,
            tombstones,
            log: Vec::new(),
            clock,
            store,
            next_seq,
            dirty: false,
        };
        registry.compact_log();
        Ok(registry)
    }

    /// Empty registry backed by memory with a logical clock
    #[must_use]
    pub fn ephemeral(peer: PeerId) -> Self {
        Self {
            records: IndexMap::new(),
            tombstones: HashMap::new(),
            log: Vec::new(),
            clock: Clock::logical(peer),
            store: Box::new(MemoryStore::new()),
            next_seq: 0,
            dirty: false,
        }
    }

    /// Peer that stamps local writes
    #[must_use]
    pub const fn local_peer(&self) -> &PeerId {
        self.clock.peer()
    }

    /// Get a device by ID
    #[must_use]
    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.records.get(id).map(|r| &r.device)
    }

    /// All devices in insertion order
    #[must_use]
    pub fn all(&self) -> Vec<&Device> {
        self.records.values().map(|r| &r.device).collect()
    }

    /// Records with clocks and insertion sequence, in insertion order
    pub fn records(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.records.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether the id was deleted
    #[must_use]
    pub fn is_removed(&self, id: &DeviceId) -> bool {
        self.tombstones.contains_key(id)
    }

    /// Whether there are changes not yet flushed to storage
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Create a device
    ///
    /// # Errors
    ///
    /// Returns `InvalidChange` if the name is blank or the address is invalid
    pub fn add(&mut self, name: &str, address: WakeAddress) -> Result<(DeviceId, RegistryDelta)> {
        let id = DeviceId::generate();
        let stamp = self.clock.tick();

        let changes: Vec<FieldChange> = [
            FieldValue::Name(name.trim().to_string()),
            FieldValue::Address(address),
            FieldValue::Pinned(false),
            FieldValue::Status(DeviceStatus::Unknown),
        ]
        .into_iter()
        .map(|value| FieldChange {
            device_id: id.clone(),
            value,
            stamp: stamp.clone(),
        })
        .collect();

        for change in &changes {
            change.validate()?;
        }

        let mut delta = RegistryDelta::default();
        for change in changes {
            if self.apply_change(&change) {
                delta.changes.push(change);
            }
        }

        tracing::info!(device_id = %id, name, "device added");
        Ok((id, delta))
    }

    /// Set one field of a device the user owns
    ///
    /// `Removed` deletes the device. Status is owned by the status checker.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id, `ReadOnlyField` for status and
    /// `InvalidChange` if validation fails; state is untouched on error
    pub fn mutate(&mut self, id: &DeviceId, value: FieldValue) -> Result<RegistryDelta> {
        if !self.records.contains_key(id) {
            return Err(Error::NotFound(id.to_string()));
        }
        if value.field() == DeviceField::Status {
            return Err(Error::ReadOnlyField(DeviceField::Status));
        }
        self.write(id, value)
    }

    /// Delete a device
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id
    pub fn remove(&mut self, id: &DeviceId) -> Result<RegistryDelta> {
        self.mutate(id, FieldValue::Removed)
    }

    /// Record the result of a status check
    ///
    /// Returns an empty delta when the status did not change.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id
    pub fn set_status(&mut self, id: &DeviceId, status: DeviceStatus) -> Result<RegistryDelta> {
        let current = self
            .records
            .get(id)
            .map(|r| r.device.status)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if current == status {
            return Ok(RegistryDelta::default());
        }
        self.write(id, FieldValue::Status(status))
    }

    fn write(&mut self, id: &DeviceId, value: FieldValue) -> Result<RegistryDelta> {
        let change = FieldChange {
            device_id: id.clone(),
            value,
            stamp: self.clock.tick(),
        };
        change.validate()?;

        let mut delta = RegistryDelta::default();
        if self.apply_change(&change) {
            tracing::debug!(
                device_id = %id,
                field = %change.value.field(),
                stamp = %change.stamp,
                "device mutated"
            );
            delta.changes.push(change);
        }
        Ok(delta)
    }

    /// Apply changes received from a peer
    ///
    /// Returns the effective delta: changes that were strictly newer than
    /// the local stamp for their (device, field). Malformed changes are
    /// dropped with a diagnostic.
    pub fn apply(&mut self, delta: &RegistryDelta) -> RegistryDelta {
        let mut effective = RegistryDelta::default();
        for change in delta {
            if let Err(e) = change.validate() {
                tracing::warn!(
                    device_id = %change.device_id,
                    stamp = %change.stamp,
                    error = %e,
                    "dropping malformed change"
                );
                continue;
            }
            self.clock.observe(&change.stamp);
            if self.apply_change(change) {
                effective.changes.push(change.clone());
            }
        }

        if !effective.is_empty() {
            tracing::debug!(
                received = delta.len(),
                applied = effective.len(),
                "applied remote delta"
            );
        }
        effective
    }

    fn apply_change(&mut self, change: &FieldChange) -> bool {
        let id = &change.device_id;

        // Deletion is final; later edits to a removed id are ignored
        if self.tombstones.contains_key(id) {
            return false;
        }

        let field = change.value.field();
        if field == DeviceField::Removed {
            self.tombstones.insert(id.clone(), change.stamp.clone());
            self.records.shift_remove(id);
            self.log.retain(|c| &c.device_id != id);
            self.record_change(change);
            return true;
        }

        if !self.records.contains_key(id) {
            let record = DeviceRecord {
                device: Device::placeholder(id.clone()),
                clocks: super::store::FieldClocks::default(),
                seq: self.next_seq,
            };
            self.next_seq += 1;
            self.records.insert(id.clone(), record);
        }

        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        let Some(slot) = record.clocks.slot_mut(field) else {
            return false;
        };
        if change.stamp <= *slot {
            return false;
        }
        slot.clone_from(&change.stamp);
        record.device.assign(&change.value);

        self.record_change(change);
        true
    }

    fn record_change(&mut self, change: &FieldChange) {
        self.log.push(change.clone());
        self.dirty = true;
        if self.log.len() > LOG_COMPACT_THRESHOLD {
            self.compact_log();
        }
    }

    /// Rebuild the log from current state, one entry per live field
    fn compact_log(&mut self) {
        let mut log: Vec<FieldChange> = Vec::with_capacity(self.records.len() * 4);
        for record in self.records.values() {
            let device = &record.device;
            for (field, stamp) in record.clocks.iter() {
                if stamp.is_epoch() {
                    continue;
                }
                let value = match field {
                    DeviceField::Name => FieldValue::Name(device.name.clone()),
                    DeviceField::Address => FieldValue::Address(device.address.clone()),
                    DeviceField::Pinned => FieldValue::Pinned(device.is_pinned),
                    DeviceField::Status => FieldValue::Status(device.status),
                    DeviceField::Removed => continue,
                };
                log.push(FieldChange {
                    device_id: device.id.clone(),
                    value,
                    stamp: stamp.clone(),
                });
            }
        }
        for (device_id, stamp) in &self.tombstones {
            log.push(FieldChange {
                device_id: device_id.clone(),
                value: FieldValue::Removed,
                stamp: stamp.clone(),
            });
        }
        log.sort_by(|a, b| a.stamp.cmp(&b.stamp));
        self.log = log;
    }

    /// Latest stamp held for every device and field
    #[must_use]
    pub fn digest(&self) -> SyncDigest {
        let mut digest = SyncDigest::default();
        for record in self.records.values() {
            for (field, stamp) in record.clocks.iter() {
                if !stamp.is_epoch() {
                    digest.record(&record.device.id, field, stamp.clone());
                }
            }
        }
        for (device_id, stamp) in &self.tombstones {
            digest.record(device_id, DeviceField::Removed, stamp.clone());
        }
        digest
    }

    /// Every logged change the digest holder has not seen, oldest first
    #[must_use]
    pub fn changes_since(&self, digest: &SyncDigest) -> RegistryDelta {
        let mut changes: Vec<FieldChange> = self
            .log
            .iter()
            .filter(|c| !digest.is_removed(&c.device_id))
            .filter(|c| {
                digest
                    .get(&c.device_id, c.value.field())
                    .is_none_or(|seen| c.stamp > *seen)
            })
            .cloned()
            .collect();
        changes.sort_by(|a, b| a.stamp.cmp(&b.stamp));
        RegistryDelta::new(changes)
    }

    /// Persist if anything changed since the last flush
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the write; the registry stays dirty
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.store.save(&self.to_stored())?;
        self.dirty = false;
        Ok(())
    }

    fn to_stored(&self) -> StoredRegistry {
        let mut tombstones: Vec<Tombstone> = self
            .tombstones
            .iter()
            .map(|(device_id, stamp)| Tombstone {
                device_id: device_id.clone(),
                stamp: stamp.clone(),
            })
            .collect();
        tombstones.sort_by(|a, b| a.stamp.cmp(&b.stamp));

        StoredRegistry {
            devices: self.records.values().cloned().collect(),
            tombstones,
        }
    }
}
