//! Device registry types

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::clock::Stamp;
use crate::{Error, Result};

/// Default wake-on-LAN UDP port
pub const DEFAULT_WAKE_PORT: u16 = 9;

/// How far past local wall time a change stamp may be (one day)
pub const MAX_STAMP_SKEW_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Stable device identifier, assigned at creation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generate a fresh identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reachability of a device as last observed by a status check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Unknown,
    Online,
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Network identity used to wake and probe a device
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WakeAddress {
    /// MAC address, normalized to `aa:bb:cc:dd:ee:ff`
    pub mac: String,
    /// Host or broadcast address the magic packet is sent to
    pub host: String,
    /// UDP port for the magic packet
    #[serde(default = "default_wake_port")]
    pub port: u16,
}

const fn default_wake_port() -> u16 {
    DEFAULT_WAKE_PORT
}

impl WakeAddress {
    /// Build a validated address
    ///
    /// # Errors
    ///
    /// Returns `InvalidChange` if the MAC is malformed or the host is empty
    pub fn new(mac: &str, host: &str, port: u16) -> Result<Self> {
        let address = Self {
            mac: normalize_mac(mac)
                .ok_or_else(|| Error::InvalidChange(format!("malformed MAC address '{mac}'")))?,
            host: host.trim().to_string(),
            port,
        };
        address.validate()?;
        Ok(address)
    }

    /// Check the address is usable by the wake capability
    ///
    /// # Errors
    ///
    /// Returns `InvalidChange` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if normalize_mac(&self.mac).as_deref() != Some(self.mac.as_str()) {
            return Err(Error::InvalidChange(format!(
                "malformed MAC address '{}'",
                self.mac
            )));
        }
        if self.host.is_empty() {
            return Err(Error::InvalidChange("empty host".to_string()));
        }
        Ok(())
    }
}

/// Normalize a MAC written with `:` or `-` separators
///
/// Returns `None` unless the input is exactly six hex octets
#[must_use]
pub fn normalize_mac(raw: &str) -> Option<String> {
    let octets: Vec<&str> = raw.trim().split([':', '-']).collect();
    if octets.len() != 6 {
        return None;
    }
    let valid = octets
        .iter()
        .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    valid.then(|| octets.join(":").to_ascii_lowercase())
}

/// A device known to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub address: WakeAddress,
    pub is_pinned: bool,
    pub status: DeviceStatus,
}

impl Device {
    /// Empty device created when a peer sends changes for an id we have not seen
    #[must_use]
    pub fn placeholder(id: DeviceId) -> Self {
        Self {
            id,
            name: String::new(),
            address: WakeAddress::default(),
            is_pinned: false,
            status: DeviceStatus::Unknown,
        }
    }

    pub(crate) fn assign(&mut self, value: &FieldValue) {
        match value {
            FieldValue::Name(name) => self.name.clone_from(name),
            FieldValue::Address(address) => self.address = address.clone(),
            FieldValue::Pinned(pinned) => self.is_pinned = *pinned,
            FieldValue::Status(status) => self.status = *status,
            FieldValue::Removed => {}
        }
    }
}

/// Field of a device tracked by its own clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceField {
    Name,
    Address,
    Pinned,
    Status,
    Removed,
}

impl fmt::Display for DeviceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name => write!(f, "name"),
            Self::Address => write!(f, "address"),
            Self::Pinned => write!(f, "pinned"),
            Self::Status => write!(f, "status"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// New value for a single field; `Removed` is the deletion tombstone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Name(String),
    Address(WakeAddress),
    Pinned(bool),
    Status(DeviceStatus),
    Removed,
}

impl FieldValue {
    #[must_use]
    pub const fn field(&self) -> DeviceField {
        match self {
            Self::Name(_) => DeviceField::Name,
            Self::Address(_) => DeviceField::Address,
            Self::Pinned(_) => DeviceField::Pinned,
            Self::Status(_) => DeviceField::Status,
            Self::Removed => DeviceField::Removed,
        }
    }
}

/// One timestamped field-level change to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub device_id: DeviceId,
    pub value: FieldValue,
    pub stamp: Stamp,
}

impl FieldChange {
    /// Reject changes that must never reach the registry
    ///
    /// # Errors
    ///
    /// Returns `InvalidChange` describing the problem
    pub fn validate(&self) -> Result<()> {
        if self.device_id.as_str().trim().is_empty() {
            return Err(Error::InvalidChange("empty device id".to_string()));
        }
        // A far-future stamp would pin every clock that observes it
        let horizon = chrono::Utc::now()
            .timestamp_millis()
            .saturating_add(MAX_STAMP_SKEW_MILLIS);
        if self.stamp.millis < 0 || self.stamp.millis > horizon {
            return Err(Error::InvalidChange(format!(
                "stamp {} outside the accepted clock range",
                self.stamp
            )));
        }
        match &self.value {
            FieldValue::Name(name) if name.trim().is_empty() => {
                Err(Error::InvalidChange("empty device name".to_string()))
            }
            FieldValue::Address(address) => address.validate(),
            _ => Ok(()),
        }
    }
}

/// Ordered set of field changes produced by a mutation or a sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDelta {
    pub changes: Vec<FieldChange>,
}

impl RegistryDelta {
    #[must_use]
    pub const fn new(changes: Vec<FieldChange>) -> Self {
        Self { changes }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FieldChange> {
        self.changes.iter()
    }

    pub fn extend(&mut self, other: Self) {
        self.changes.extend(other.changes);
    }
}

impl<'a> IntoIterator for &'a RegistryDelta {
    type Item = &'a FieldChange;
    type IntoIter = std::slice::Iter<'a, FieldChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

/// Latest stamp held per device and field, exchanged during resync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDigest {
    pub devices: BTreeMap<DeviceId, BTreeMap<DeviceField, Stamp>>,
}

impl SyncDigest {
    #[must_use]
    pub fn get(&self, device_id: &DeviceId, field: DeviceField) -> Option<&Stamp> {
        self.devices.get(device_id).and_then(|f| f.get(&field))
    }

    pub fn record(&mut self, device_id: &DeviceId, field: DeviceField, stamp: Stamp) {
        self.devices
            .entry(device_id.clone())
            .or_default()
            .insert(field, stamp);
    }

    /// Whether the holder of this digest has deleted the device
    #[must_use]
    pub fn is_removed(&self, device_id: &DeviceId) -> bool {
        self.get(device_id, DeviceField::Removed).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_mac_separators_and_case() {
        assert_eq!(
            normalize_mac("AA-BB-CC-dd-ee-0F").as_deref(),
            Some("aa:bb:cc:dd:ee:0f")
        );
        assert_eq!(normalize_mac("aa:bb:cc:dd:ee").as_deref(), None);
        assert_eq!(normalize_mac("aa:bb:cc:dd:ee:zz").as_deref(), None);
        assert_eq!(normalize_mac("aabbccddeeff").as_deref(), None);
    }

    #[test]
    fn wake_address_rejects_empty_host() {
        assert!(WakeAddress::new("aa:bb:cc:dd:ee:ff", "  ", 9).is_err());
        let ok = WakeAddress::new("AA:BB:CC:DD:EE:FF", "192.168.1.255", 9).unwrap();
        assert_eq!(ok.mac, "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn field_value_wire_shape() {
        let json = serde_json::to_value(FieldValue::Pinned(true)).unwrap();
        assert_eq!(json, serde_json::json!({"field": "pinned", "value": true}));

        let removed: FieldValue = serde_json::from_str(r#"{"field":"removed"}"#).unwrap();
        assert_eq!(removed, FieldValue::Removed);
    }

    #[test]
    fn unknown_field_fails_to_decode() {
        let res = serde_json::from_str::<FieldValue>(r#"{"field":"color","value":"red"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn validate_rejects_blank_name() {
        let change = FieldChange {
            device_id: DeviceId::from("d1"),
            value: FieldValue::Name("   ".to_string()),
            stamp: Stamp::new(1, "p"),
        };
        assert!(change.validate().is_err());
    }

    #[test]
    fn validate_rejects_stamps_from_the_far_future() {
        let change = |millis| FieldChange {
            device_id: DeviceId::from("d1"),
            value: FieldValue::Pinned(true),
            stamp: Stamp::new(millis, "p"),
        };
        assert!(change(i64::MAX).validate().is_err());
        assert!(change(-1).validate().is_err());

        let tomorrow = chrono::Utc::now().timestamp_millis() + MAX_STAMP_SKEW_MILLIS / 2;
        assert!(change(tomorrow).validate().is_ok());
    }
}
