//! Cross-adapter discovery scanner.
//!
//! Each discovering adapter runs one scan task that periodically walks all
//! other adapters of the session and reports them as devices, using the
//! first registered LE advertisement or plain BR/EDR discoverability.

use std::sync::Weak;
use uuid::Uuid;

use crate::{
    adapter::{Adapter, DiscoveryTransport},
    adv::AdvData,
    device::DeviceProfile,
    session::SessionInner,
    UuidExt,
};

/// Runs the scan loop for the given adapter until cancelled.
pub(crate) async fn run(session: Weak<SessionInner>, adapter_id: u16) {
    loop {
        let Some(session) = session.upgrade() else { return };
        let interval = session.scan_interval;
        scan_once(&session, adapter_id).await;
        drop(session);
        tokio::time::sleep(interval).await;
    }
}

async fn scan_once(session: &std::sync::Arc<SessionInner>, adapter_id: u16) {
    let Ok(adapter) = session.adapter(adapter_id) else { return };
    log::info!("Scanning for devices on adapter {}", adapter_id);
    let filter = adapter.discovery_filter();
    let scan_le = matches!(filter.transport, DiscoveryTransport::Auto | DiscoveryTransport::Le);
    let scan_br = matches!(filter.transport, DiscoveryTransport::Auto | DiscoveryTransport::BrEdr);

    for peer in session.all_adapters() {
        if peer.id() == adapter_id {
            continue;
        }
        if !peer.is_powered() {
            continue;
        }
        // The peer is discoverable either when BR/EDR advertising is enabled
        // explicitly or when its own scan filter makes it so while scanning.
        let peer_discoverable =
            peer.is_discoverable() || (peer.is_discovering() && peer.discovery_filter().discoverable);

        let advertisement = if scan_le { peer.first_advertisement() } else { None };
        let profile = match advertisement {
            Some(advertisement) => {
                let data = advertisement.data();
                // The advertisement's discoverable property is optional, but
                // when present it overrides the adapter's state.
                if !data.discoverable.unwrap_or(peer_discoverable) {
                    continue;
                }
                Some(le_profile(&data, &peer))
            }
            None if scan_br && peer_discoverable => Some(br_edr_profile(&peer)),
            None => None,
        };

        if let Some(profile) = profile {
            if let Err(err) = adapter.add_device(peer.id(), peer.address(), profile).await {
                log::warn!("Cannot report device {} on adapter {}: {}", peer.address(), adapter_id, err);
            }
        }
    }
}

/// Builds an LE device profile from an advertisement, with adapter fallbacks.
fn le_profile(data: &AdvData, peer: &Adapter) -> DeviceProfile {
    DeviceProfile {
        name: data.local_name.clone().unwrap_or_else(|| peer.name()),
        class: peer.class(),
        appearance: data.appearance.unwrap_or(0),
        is_le: true,
        is_br_edr: false,
        uuids: data.service_uuids.iter().filter_map(|s| Uuid::parse_bluetooth(s).ok()).collect(),
        service_data: data
            .service_data
            .iter()
            .filter_map(|(uuid, value)| {
                Uuid::parse_bluetooth(uuid).ok().map(|uuid| (uuid.to_string(), value.clone()))
            })
            .collect(),
        manufacturer_data: data.manufacturer_data.clone(),
        tx_power: data.tx_power,
    }
}

/// Builds a plain BR/EDR device profile from the adapter itself.
fn br_edr_profile(peer: &Adapter) -> DeviceProfile {
    DeviceProfile {
        name: peer.name(),
        class: peer.class(),
        is_br_edr: true,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Address;
    use std::{collections::HashMap, sync::Weak};

    fn test_adapter() -> std::sync::Arc<Adapter> {
        Adapter::new(Weak::new(), 0, Address::new([0, 0, 0, 0x22, 0x22, 0x22]))
    }

    #[test]
    fn le_profile_uses_advertisement_fields() {
        let peer = test_adapter();
        let data = AdvData {
            local_name: Some("BLE-Device".to_string()),
            appearance: Some(0x00a0),
            service_uuids: vec!["0xFFF1".to_string()],
            service_data: HashMap::from([("0xfff1".to_string(), vec![0xde, 0xad, 0xbe, 0xef])]),
            tx_power: Some(7),
            ..Default::default()
        };
        let profile = le_profile(&data, &peer);
        assert_eq!(profile.name, "BLE-Device");
        assert_eq!(profile.appearance, 0x00a0);
        assert!(profile.is_le);
        assert!(!profile.is_br_edr);
        assert_eq!(profile.uuids, vec![Uuid::parse_bluetooth("0xFFF1").unwrap()]);
        assert_eq!(
            profile.service_data.get("0000fff1-0000-1000-8000-00805f9b34fb"),
            Some(&vec![0xde, 0xad, 0xbe, 0xef])
        );
        assert_eq!(profile.tx_power, Some(7));
    }

    #[test]
    fn le_profile_falls_back_to_adapter() {
        let peer = test_adapter();
        let profile = le_profile(&AdvData::default(), &peer);
        assert_eq!(profile.name, peer.name());
        assert_eq!(profile.appearance, 0);
        assert!(profile.uuids.is_empty());
        assert!(profile.service_data.is_empty());
        assert!(profile.manufacturer_data.is_empty());
        assert_eq!(profile.tx_power, None);
    }

    #[test]
    fn br_edr_profile_reports_adapter_identity() {
        let peer = test_adapter();
        let profile = br_edr_profile(&peer);
        assert_eq!(profile.name, peer.name());
        assert!(profile.is_br_edr);
        assert!(!profile.is_le);
    }
}
