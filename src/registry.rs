//! Device registry
//!
//! The table of peripherals found by the most recent scan. Handles are
//! indices into that table and are only valid until the next scan starts.
//! A scan holds the table lock from the moment it clears the table until it
//! finishes, so two scans never interleave their results.

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};

use crate::transport::TransportFamily;

/// One discovered device. `address` is whatever the family needs to open
/// it again (a BLE address, a device node path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Peripheral<A> {
    pub id: usize,
    pub name: String,
    pub rssi: Option<i16>,
    pub family: TransportFamily,
    #[serde(skip)]
    pub address: A,
}

/// Which discovered devices a client is interested in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryFilter {
    /// Exact names.
    pub names: Vec<String>,
    pub name_prefixes: Vec<String>,
    /// Case-insensitive fragments applied when no name or prefix is given.
    pub keywords: Vec<String>,
}

impl DiscoveryFilter {
    pub fn with_keywords(keywords: &[String]) -> Self {
        Self {
            keywords: keywords.to_vec(),
            ..Self::default()
        }
    }

    pub fn is_explicit(&self) -> bool {
        !self.names.is_empty() || !self.name_prefixes.is_empty()
    }

    pub fn matches(&self, name: Option<&str>) -> bool {
        let name = match name {
            Some(name) => name,
            None => return false,
        };
        if self.is_explicit() {
            return self.names.iter().any(|n| n == name)
                || self.name_prefixes.iter().any(|p| name.starts_with(p.as_str()));
        }
        let lower = name.to_lowercase();
        self.keywords
            .iter()
            .any(|keyword| lower.contains(&keyword.to_lowercase()))
    }
}

pub struct DeviceRegistry<A> {
    family: TransportFamily,
    table: Mutex<Vec<Peripheral<A>>>,
}

impl<A: Clone> DeviceRegistry<A> {
    pub fn new(family: TransportFamily) -> Self {
        Self {
            family,
            table: Mutex::new(Vec::new()),
        }
    }

    pub fn family(&self) -> TransportFamily {
        self.family
    }

    /// Wait for any running scan to finish, then start a new one. The
    /// previous handles are invalid from here on.
    pub async fn begin_scan(&self) -> ScanGuard<'_, A> {
        let mut table = self.table.lock().await;
        table.clear();
        ScanGuard {
            family: self.family,
            table,
        }
    }

    /// Look a handle up in the current table.
    pub async fn resolve(&self, id: usize) -> Option<Peripheral<A>> {
        self.table.lock().await.get(id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Peripheral<A>> {
        self.table.lock().await.clone()
    }
}

/// Exclusive access to the table for the duration of one scan.
pub struct ScanGuard<'a, A> {
    family: TransportFamily,
    table: MutexGuard<'a, Vec<Peripheral<A>>>,
}

impl<A: Clone> ScanGuard<'_, A> {
    /// Record a device and return it with its handle assigned.
    pub fn add(&mut self, name: Option<String>, rssi: Option<i16>, address: A) -> Peripheral<A> {
        let peripheral = Peripheral {
            id: self.table.len(),
            name: name.unwrap_or_else(|| "Unknown".to_string()),
            rssi,
            family: self.family,
            address,
        };
        self.table.push(peripheral.clone());
        peripheral
    }

    pub fn found(&self) -> &[Peripheral<A>] {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn keywords() -> Vec<String> {
        ["lego", "micro:bit", "hub"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_filter_uses_keywords() {
        let filter = DiscoveryFilter::with_keywords(&keywords());
        assert!(filter.matches(Some("LEGO Move Hub")));
        assert!(filter.matches(Some("BBC micro:bit [zogat]")));
        assert!(!filter.matches(Some("Heart Rate Monitor")));
        assert!(!filter.matches(None));
    }

    #[test]
    fn test_explicit_filter_overrides_keywords() {
        let filter = DiscoveryFilter {
            names: vec!["Pybricks Hub".into()],
            name_prefixes: vec!["BBC".into()],
            keywords: keywords(),
        };
        assert!(filter.matches(Some("Pybricks Hub")));
        assert!(filter.matches(Some("BBC micro:bit")));
        assert!(!filter.matches(Some("LEGO Move Hub")));
    }

    #[tokio::test]
    async fn test_scan_replaces_previous_handles() {
        let registry: DeviceRegistry<String> = DeviceRegistry::new(TransportFamily::Ble);
        {
            let mut scan = registry.begin_scan().await;
            assert_eq!(scan.add(Some("A".into()), Some(-40), "aa".into()).id, 0);
            assert_eq!(scan.add(None, None, "bb".into()).id, 1);
        }
        assert_eq!(registry.resolve(1).await.unwrap().name, "Unknown");

        {
            let mut scan = registry.begin_scan().await;
            assert!(scan.found().is_empty());
            scan.add(Some("C".into()), None, "cc".into());
        }
        assert_eq!(registry.resolve(0).await.unwrap().address, "cc");
        assert!(registry.resolve(1).await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_scans_do_not_interleave() {
        let registry = Arc::new(DeviceRegistry::<String>::new(TransportFamily::Ble));

        let mut tasks = Vec::new();
        for scan_id in 0..2 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let mut scan = registry.begin_scan().await;
                for n in 0..5 {
                    scan.add(Some(format!("scan{}-{}", scan_id, n)), None, String::new());
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                scan.found()
                    .iter()
                    .map(|p| p.name.clone())
                    .collect::<Vec<_>>()
            }));
        }

        for task in tasks {
            let names = task.await.unwrap();
            assert_eq!(names.len(), 5);
            let prefix = &names[0][..5];
            assert!(names.iter().all(|n| n.starts_with(prefix)));
        }
    }

    #[test]
    fn test_peripheral_serializes_without_address() {
        let p = Peripheral {
            id: 3,
            name: "NXT".into(),
            rssi: Some(-50),
            family: TransportFamily::ClassicBluetooth,
            address: "/dev/rfcomm0".to_string(),
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["family"], "classic-bluetooth");
        assert!(json.get("address").is_none());
    }
}
