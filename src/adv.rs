//! Bluetooth LE advertising.

use dbus::{
    arg::{PropMap, RefArg, Variant},
    Path,
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken, MethodErr};
use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
};

use crate::{
    adapter::Adapter,
    method_call,
    proxy::{string_bytes_map, u16_bytes_map, RemoteProperties},
    task::TaskSlot,
};

pub(crate) const MANAGER_INTERFACE: &str = "org.bluez.LEAdvertisingManager1";
pub(crate) const ADVERTISEMENT_INTERFACE: &str = "org.bluez.LEAdvertisement1";

/// Number of supported advertisement instances per adapter.
pub(crate) const SUPPORTED_ADVERTISEMENT_INSTANCES: usize = 15;

/// LE advertisement registered by a bus client, mirrored locally.
pub(crate) struct AdvertisementClient {
    pub props: RemoteProperties,
    pub lost_task: TaskSlot,
}

impl fmt::Debug for AdvertisementClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "advertisement[{} {}]", &self.props.dest, &self.props.path)
    }
}

impl AdvertisementClient {
    pub fn local_name(&self) -> Option<String> {
        self.props.get("LocalName")
    }

    pub fn appearance(&self) -> Option<u16> {
        self.props.get("Appearance")
    }

    pub fn service_uuids(&self) -> Vec<String> {
        self.props.get_or("ServiceUUIDs", Vec::new())
    }

    pub fn service_data(&self) -> HashMap<String, Vec<u8>> {
        self.props.with_value("ServiceData", string_bytes_map).unwrap_or_default()
    }

    pub fn manufacturer_data(&self) -> HashMap<u16, Vec<u8>> {
        self.props.with_value("ManufacturerData", u16_bytes_map).unwrap_or_default()
    }

    pub fn tx_power(&self) -> Option<i16> {
        self.props.get("TxPower")
    }

    /// The advertisement's own discoverable flag, if it exposes one.
    pub fn discoverable(&self) -> Option<bool> {
        self.props.get("Discoverable")
    }

    /// Snapshot of the broadcast payload fields used by the scanner.
    pub fn data(&self) -> AdvData {
        AdvData {
            local_name: self.local_name(),
            appearance: self.appearance(),
            service_uuids: self.service_uuids(),
            service_data: self.service_data(),
            manufacturer_data: self.manufacturer_data(),
            tx_power: self.tx_power(),
            discoverable: self.discoverable(),
        }
    }
}

/// Broadcast payload of an advertisement at one point in time.
#[derive(Clone, Debug, Default)]
pub(crate) struct AdvData {
    pub local_name: Option<String>,
    pub appearance: Option<u16>,
    pub service_uuids: Vec<String>,
    pub service_data: HashMap<String, Vec<u8>>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub tx_power: Option<i16>,
    pub discoverable: Option<bool>,
}

/// Registers the `org.bluez.LEAdvertisingManager1` interface served on every
/// adapter object.
pub(crate) fn register_manager_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Adapter>> {
    cr.register(MANAGER_INTERFACE, |ib: &mut IfaceBuilder<Arc<Adapter>>| {
        cr_property!(ib, "ActiveInstances", adapter => {
            Some(adapter.advertisement_slots_active() as u8)
        });
        cr_property!(ib, "SupportedInstances", adapter => {
            Some(adapter.advertisement_slots_available() as u8)
        });
        cr_property!(ib, "SupportedIncludes", _adapter => {
            Some(vec!["tx-power".to_string(), "appearance".to_string(), "local-name".to_string()])
        });
        cr_property!(ib, "SupportedSecondaryChannels", _adapter => {
            Some(vec!["1M".to_string()])
        });
        cr_property!(ib, "SupportedCapabilities", _adapter => {
            let mut caps = PropMap::new();
            caps.insert("MaxAdvLen".to_string(), Variant(Box::new(31u8) as Box<dyn RefArg>));
            caps.insert("MaxScanRespLen".to_string(), Variant(Box::new(31u8) as Box<dyn RefArg>));
            Some(caps)
        });
        cr_property!(ib, "SupportedFeatures", _adapter => {
            Some(Vec::<String>::new())
        });
        ib.method_with_cr_async(
            "RegisterAdvertisement",
            ("advertisement", "options"),
            (),
            |ctx, cr, (path, _options): (Path<'static>, PropMap)| {
                let sender = ctx.message().sender().map(|s| s.to_string());
                method_call(ctx, cr, |adapter: Arc<Adapter>| async move {
                    let sender = sender.ok_or_else(|| MethodErr::failed("message sender missing"))?;
                    adapter.add_le_advertisement(&sender, path).await?;
                    Ok(())
                })
            },
        );
        ib.method_with_cr_async(
            "UnregisterAdvertisement",
            ("advertisement",),
            (),
            |ctx, cr, (path,): (Path<'static>,)| {
                let sender = ctx.message().sender().map(|s| s.to_string());
                method_call(ctx, cr, |adapter: Arc<Adapter>| async move {
                    let sender = sender.ok_or_else(|| MethodErr::failed("message sender missing"))?;
                    adapter.del_le_advertisement(&sender, &path)?;
                    Ok(())
                })
            },
        );
    })
}
