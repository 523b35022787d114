//! Bluetooth device and its pairing and connection engine.
//!
//! A device object is one adapter's view of a peer adapter. Every device has
//! a mirror on the adapter it represents; pairing and connection state is
//! kept symmetric between the two sides.

use dbus::{
    arg::{PropMap, RefArg, Variant},
    Path,
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as SyncMutex, Weak,
    },
    time::Duration,
};
use uuid::Uuid;

use crate::{
    adapter::Adapter,
    emit_properties_changed,
    gatt::link::{self, LinkKind},
    method_call,
    root::AgentCapability,
    session::SessionInner,
    task::TaskSlot,
    Address, Error, ErrorKind, Result,
};

pub(crate) const INTERFACE: &str = "org.bluez.Device1";

const PAIRING_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECTING_TIMEOUT: Duration = Duration::from_secs(60);

/// Observable properties of a discovered peer, used to create or refresh a
/// device entry.
#[derive(Clone, Debug, Default)]
pub(crate) struct DeviceProfile {
    pub name: String,
    pub class: u32,
    pub appearance: u16,
    pub is_le: bool,
    pub is_br_edr: bool,
    pub uuids: Vec<Uuid>,
    pub service_data: HashMap<String, Vec<u8>>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub tx_power: Option<i16>,
}

struct DeviceState {
    name: String,
    alias: Option<String>,
    class: u32,
    appearance: u16,
    is_le: bool,
    is_br_edr: bool,
    uuids: Vec<Uuid>,
    service_data: HashMap<String, Vec<u8>>,
    manufacturer_data: HashMap<u16, Vec<u8>>,
    tx_power: Option<i16>,
    paired: bool,
    bonded: bool,
    trusted: bool,
    blocked: bool,
    connected: bool,
    services_resolved: bool,
}

/// One adapter's view of a peer adapter.
pub struct Device {
    weak_self: Weak<Device>,
    session: Weak<SessionInner>,
    /// The adapter owning this device entry.
    adapter_id: u16,
    /// The adapter this device represents.
    peer_adapter_id: u16,
    address: Address,
    dbus_path: Path<'static>,
    state: SyncMutex<DeviceState>,
    pairing_task: TaskSlot,
    pairing_deadline: TaskSlot,
    pairing_timed_out: AtomicBool,
    connecting_task: TaskSlot,
    connecting_deadline: TaskSlot,
    connecting_timed_out: AtomicBool,
    links: SyncMutex<Vec<(Path<'static>, LinkKind)>>,
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "device[{}]", self.address)
    }
}

impl Device {
    pub(crate) fn new(
        session: Weak<SessionInner>, adapter_id: u16, peer_adapter_id: u16, address: Address,
        profile: DeviceProfile,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            session,
            adapter_id,
            peer_adapter_id,
            address,
            dbus_path: Self::dbus_path_for(adapter_id, address),
            state: SyncMutex::new(DeviceState {
                name: profile.name,
                alias: None,
                class: profile.class,
                appearance: profile.appearance,
                is_le: profile.is_le,
                is_br_edr: profile.is_br_edr,
                uuids: profile.uuids,
                service_data: profile.service_data,
                manufacturer_data: profile.manufacturer_data,
                tx_power: profile.tx_power,
                paired: false,
                bonded: false,
                trusted: false,
                blocked: false,
                connected: false,
                services_resolved: false,
            }),
            pairing_task: TaskSlot::new(),
            pairing_deadline: TaskSlot::new(),
            pairing_timed_out: AtomicBool::new(false),
            connecting_task: TaskSlot::new(),
            connecting_deadline: TaskSlot::new(),
            connecting_timed_out: AtomicBool::new(false),
            links: SyncMutex::new(Vec::new()),
        })
    }

    pub(crate) fn dbus_path_for(adapter_id: u16, address: Address) -> Path<'static> {
        Path::new(format!("{}hci{}/{}", crate::adapter::PREFIX, adapter_id, address.to_path_component())).unwrap()
    }

    pub(crate) fn dbus_path(&self) -> &Path<'static> {
        &self.dbus_path
    }

    pub(crate) fn address(&self) -> Address {
        self.address
    }

    fn session(&self) -> Result<Arc<SessionInner>> {
        self.session
            .upgrade()
            .ok_or_else(|| Error::with_message(ErrorKind::Failed, "session is shutting down"))
    }

    fn emit_device_properties(&self, changed: PropMap) {
        if let Ok(session) = self.session() {
            emit_properties_changed(&session.connection, &self.dbus_path, INTERFACE, changed);
        }
    }

    fn emit_device_property<T: RefArg + 'static>(&self, name: &str, value: T) {
        let mut changed = PropMap::new();
        changed.insert(name.to_string(), Variant(Box::new(value)));
        self.emit_device_properties(changed);
    }

    /// The displayed name: the alias when set, the reported name otherwise.
    fn name(&self) -> String {
        let state = self.state.lock().unwrap();
        state.alias.clone().unwrap_or_else(|| state.name.clone())
    }

    fn is_trusted(&self) -> bool {
        self.state.lock().unwrap().trusted
    }

    fn is_br_edr(&self) -> bool {
        self.state.lock().unwrap().is_br_edr
    }

    fn uuid_strings(&self) -> Vec<String> {
        self.state.lock().unwrap().uuids.iter().map(|uuid| uuid.to_string()).collect()
    }

    fn service_data_map(&self) -> PropMap {
        let state = self.state.lock().unwrap();
        state
            .service_data
            .iter()
            .map(|(uuid, data)| (uuid.clone(), Variant(Box::new(data.clone()) as Box<dyn RefArg>)))
            .collect()
    }

    fn manufacturer_data_map(&self) -> HashMap<u16, Variant<Box<dyn RefArg>>> {
        let state = self.state.lock().unwrap();
        state
            .manufacturer_data
            .iter()
            .map(|(id, data)| (*id, Variant(Box::new(data.clone()) as Box<dyn RefArg>)))
            .collect()
    }

    /// Merges a freshly discovered profile into this entry.
    ///
    /// Only fields that actually differ emit change signals, unless duplicate
    /// reporting is requested, in which case the advertisement data fields
    /// are always re-signaled. Returns the names of the signaled properties.
    pub(crate) fn merge_profile(&self, profile: &DeviceProfile, report_duplicates: bool) -> Vec<&'static str> {
        let mut changed = PropMap::new();
        let mut names = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.name != profile.name {
                state.name = profile.name.clone();
                changed.insert("Name".to_string(), Variant(Box::new(profile.name.clone()) as Box<dyn RefArg>));
                names.push("Name");
            }
            if state.appearance != profile.appearance {
                state.appearance = profile.appearance;
                changed.insert("Appearance".to_string(), Variant(Box::new(profile.appearance) as Box<dyn RefArg>));
                names.push("Appearance");
            }
            if state.uuids != profile.uuids {
                state.uuids = profile.uuids.clone();
                let uuids: Vec<String> = profile.uuids.iter().map(|uuid| uuid.to_string()).collect();
                changed.insert("UUIDs".to_string(), Variant(Box::new(uuids) as Box<dyn RefArg>));
                names.push("UUIDs");
            }
            if state.service_data != profile.service_data || report_duplicates {
                state.service_data = profile.service_data.clone();
                let map: PropMap = state
                    .service_data
                    .iter()
                    .map(|(uuid, data)| (uuid.clone(), Variant(Box::new(data.clone()) as Box<dyn RefArg>)))
                    .collect();
                changed.insert("ServiceData".to_string(), Variant(Box::new(map) as Box<dyn RefArg>));
                names.push("ServiceData");
            }
            if state.manufacturer_data != profile.manufacturer_data
                || (report_duplicates && !profile.manufacturer_data.is_empty())
            {
                state.manufacturer_data = profile.manufacturer_data.clone();
                let map: HashMap<u16, Variant<Box<dyn RefArg>>> = state
                    .manufacturer_data
                    .iter()
                    .map(|(id, data)| (*id, Variant(Box::new(data.clone()) as Box<dyn RefArg>)))
                    .collect();
                changed.insert("ManufacturerData".to_string(), Variant(Box::new(map) as Box<dyn RefArg>));
                names.push("ManufacturerData");
            }
            if state.tx_power != profile.tx_power {
                state.tx_power = profile.tx_power;
                if let Some(tx_power) = profile.tx_power {
                    changed.insert("TxPower".to_string(), Variant(Box::new(tx_power) as Box<dyn RefArg>));
                    names.push("TxPower");
                }
            }
        }
        if !changed.is_empty() {
            self.emit_device_properties(changed);
        }
        names
    }

    fn set_paired_and_bonded(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.paired = true;
            state.bonded = true;
        }
        let mut changed = PropMap::new();
        changed.insert("Paired".to_string(), Variant(Box::new(true) as Box<dyn RefArg>));
        changed.insert("Bonded".to_string(), Variant(Box::new(true) as Box<dyn RefArg>));
        self.emit_device_properties(changed);
    }

    fn set_connected(&self, connected: bool) {
        self.state.lock().unwrap().connected = connected;
        self.emit_device_property("Connected", connected);
    }

    fn set_services_resolved(&self, resolved: bool) {
        self.state.lock().unwrap().services_resolved = resolved;
        self.emit_device_property("ServicesResolved", resolved);
    }

    // =======================================================================
    // Mirror bookkeeping
    // =======================================================================

    /// Resolves the mirror device on the represented adapter, creating and
    /// exporting it when absent.
    async fn ensure_mirror(&self) -> Result<Arc<Device>> {
        let session = self.session()?;
        let local = session.adapter(self.adapter_id)?;
        let peer = session.adapter(self.peer_adapter_id)?;
        let profile = DeviceProfile { name: local.name(), class: local.class(), ..Default::default() };
        peer.add_device(self.adapter_id, local.address(), profile).await
    }

    /// Resolves the mirror device without creating it.
    fn find_mirror(&self) -> Option<Arc<Device>> {
        let session = self.session.upgrade()?;
        let local = session.adapter(self.adapter_id).ok()?;
        let peer = session.adapter(self.peer_adapter_id).ok()?;
        peer.find_device(&Self::dbus_path_for(peer.id(), local.address()))
    }

    // =======================================================================
    // Pairing
    // =======================================================================

    async fn pair_task(self: Arc<Self>) -> Result<()> {
        let session = self.session()?;
        log::info!("Pairing {:?} with adapter {}", self, self.adapter_id);
        let agent = session
            .root
            .default_agent()
            .ok_or_else(|| Error::with_message(ErrorKind::Failed, "no default agent"))?;
        if agent.capability != AgentCapability::NoInputNoOutput {
            // Anything that needs user interaction has no automated follow-up.
            return Err(Error::with_message(
                ErrorKind::NotSupported,
                format!("pairing with {} capability is not implemented", agent.capability),
            ));
        }
        let mirror = self.ensure_mirror().await?;
        mirror.set_paired_and_bonded();
        self.set_paired_and_bonded();
        Ok(())
    }

    pub(crate) async fn pair(&self) -> Result<()> {
        if self.state.lock().unwrap().paired {
            return Err(Error::new(ErrorKind::AlreadyExists));
        }
        if !self.pairing_task.is_done() {
            return Err(Error::new(ErrorKind::InProgress));
        }

        let this = self
            .weak_self
            .upgrade()
            .ok_or_else(|| Error::with_message(ErrorKind::Failed, "device is gone"))?;
        let work = tokio::spawn(async move { this.pair_task().await });
        self.pairing_task.set_abort(work.abort_handle());
        self.pairing_timed_out.store(false, Ordering::SeqCst);

        let abort = work.abort_handle();
        let weak = self.weak_self.clone();
        let address = self.address;
        self.pairing_deadline.set(tokio::spawn(async move {
            tokio::time::sleep(PAIRING_TIMEOUT).await;
            log::info!("Pairing with device {} timed out", address);
            if let Some(device) = weak.upgrade() {
                device.pairing_timed_out.store(true, Ordering::SeqCst);
            }
            abort.abort();
        }));

        let result = match work.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => {
                // A deadline abort is a timeout; anything else was an
                // explicit CancelPairing.
                if self.pairing_timed_out.load(Ordering::SeqCst) {
                    Err(Error::with_message(ErrorKind::Failed, "pairing timed out"))
                } else {
                    Err(Error::with_message(ErrorKind::Canceled, "pairing canceled"))
                }
            }
            Err(err) => Err(err.into()),
        };
        self.pairing_deadline.cancel();
        result
    }

    pub(crate) fn cancel_pairing(&self) {
        if !self.pairing_task.is_done() {
            log::info!("Canceling pairing with {:?}", self);
        }
        self.pairing_task.cancel();
        self.pairing_deadline.cancel();
    }

    // =======================================================================
    // Connection
    // =======================================================================

    async fn connect_task(self: Arc<Self>, _profile_uuid: Option<String>) -> Result<()> {
        let session = self.session()?;
        let peer = session.adapter(self.peer_adapter_id)?;
        log::info!("Connecting {:?} with adapter {}", self, self.adapter_id);
        let mirror = self.ensure_mirror().await?;

        if self.is_br_edr() && !mirror.is_trusted() {
            let agent = session
                .root
                .default_agent()
                .ok_or_else(|| Error::with_message(ErrorKind::Failed, "no default agent"))?;
            agent.request_authorization(session.connection.clone(), self.dbus_path.clone()).await?;
        }

        let links = link::create_links(&session, &self, &peer).await?;
        *self.links.lock().unwrap() = links;

        mirror.set_connected(true);
        self.set_connected(true);
        self.set_services_resolved(true);
        Ok(())
    }

    pub(crate) async fn connect(&self, profile_uuid: Option<String>) -> Result<()> {
        if self.state.lock().unwrap().connected {
            return Err(Error::new(ErrorKind::AlreadyConnected));
        }
        if !self.connecting_task.is_done() {
            return Err(Error::new(ErrorKind::InProgress));
        }

        if self.is_br_edr() && !self.state.lock().unwrap().paired {
            self.pair().await?;
        }
        self.ensure_mirror().await?;

        let this = self
            .weak_self
            .upgrade()
            .ok_or_else(|| Error::with_message(ErrorKind::Failed, "device is gone"))?;
        let work = tokio::spawn(async move { this.connect_task(profile_uuid).await });
        self.connecting_task.set_abort(work.abort_handle());
        self.connecting_timed_out.store(false, Ordering::SeqCst);

        let abort = work.abort_handle();
        let weak = self.weak_self.clone();
        let address = self.address;
        self.connecting_deadline.set(tokio::spawn(async move {
            tokio::time::sleep(CONNECTING_TIMEOUT).await;
            log::info!("Connecting with device {} timed out", address);
            if let Some(device) = weak.upgrade() {
                device.connecting_timed_out.store(true, Ordering::SeqCst);
            }
            abort.abort();
        }));

        let result = match work.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => {
                // A deadline abort is a timeout; anything else was an
                // explicit Disconnect.
                if self.connecting_timed_out.load(Ordering::SeqCst) {
                    Err(Error::with_message(ErrorKind::Failed, "connecting timed out"))
                } else {
                    Err(Error::with_message(ErrorKind::Canceled, "connection canceled"))
                }
            }
            Err(err) => Err(err.into()),
        };
        self.connecting_deadline.cancel();
        result
    }

    pub(crate) async fn disconnect(&self, _profile_uuid: Option<String>) -> Result<()> {
        let was_connecting = !self.connecting_task.is_done();
        self.connecting_task.cancel();
        self.connecting_deadline.cancel();
        if !self.state.lock().unwrap().connected {
            // Canceling a pending connect is a successful disconnect.
            if was_connecting {
                log::info!("Canceled connecting with {:?}", self);
                return Ok(());
            }
            return Err(Error::new(ErrorKind::NotConnected));
        }
        log::info!("Disconnecting {:?}", self);
        self.remove_links().await;
        if let Some(mirror) = self.find_mirror() {
            mirror.set_connected(false);
        }
        self.set_services_resolved(false);
        self.set_connected(false);
        Ok(())
    }

    async fn remove_links(&self) {
        let links = std::mem::take(&mut *self.links.lock().unwrap());
        if links.is_empty() {
            return;
        }
        if let Ok(session) = self.session() {
            link::remove_links(&session, links).await;
        }
    }

    /// Cleans up before the device object is removed from its adapter.
    ///
    /// The mirror stays in place but is driven to disconnected.
    pub(crate) async fn teardown(&self) {
        self.cancel_pairing();
        self.connecting_task.cancel();
        self.connecting_deadline.cancel();
        self.remove_links().await;
        if self.state.lock().unwrap().connected {
            if let Some(mirror) = self.find_mirror() {
                mirror.set_connected(false);
            }
            self.state.lock().unwrap().connected = false;
        }
    }

    // =======================================================================
    // D-Bus interface
    // =======================================================================

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            cr_property!(ib, "Address", device => {
                Some(device.address.to_string())
            });
            cr_property!(ib, "AddressType", _device => {
                Some("public".to_string())
            });
            cr_property!(ib, "Name", device => {
                Some(device.state.lock().unwrap().name.clone())
            });
            ib.property("Alias")
                .get(|_ctx, device| Ok(device.name()))
                .set(|ctx, device, alias: String| {
                    log::trace!("{}: {}.Alias <- {}", ctx.path(), INTERFACE, &alias);
                    device.state.lock().unwrap().alias = Some(alias.clone());
                    Ok(Some(alias))
                });
            cr_property!(ib, "Class", device => {
                Some(device.state.lock().unwrap().class)
            });
            cr_property!(ib, "Appearance", device => {
                Some(device.state.lock().unwrap().appearance)
            });
            cr_property!(ib, "UUIDs", device => {
                Some(device.uuid_strings())
            });
            cr_property!(ib, "Paired", device => {
                Some(device.state.lock().unwrap().paired)
            });
            cr_property!(ib, "Bonded", device => {
                Some(device.state.lock().unwrap().bonded)
            });
            ib.property("Trusted")
                .get(|_ctx, device| Ok(device.is_trusted()))
                .set(|ctx, device, trusted: bool| {
                    log::trace!("{}: {}.Trusted <- {}", ctx.path(), INTERFACE, trusted);
                    device.state.lock().unwrap().trusted = trusted;
                    Ok(Some(trusted))
                });
            ib.property("Blocked")
                .get(|_ctx, device| Ok(device.state.lock().unwrap().blocked))
                .set(|ctx, device, blocked: bool| {
                    log::trace!("{}: {}.Blocked <- {}", ctx.path(), INTERFACE, blocked);
                    device.state.lock().unwrap().blocked = blocked;
                    Ok(Some(blocked))
                });
            cr_property!(ib, "Connected", device => {
                Some(device.state.lock().unwrap().connected)
            });
            cr_property!(ib, "Adapter", device => {
                Some(Adapter::dbus_path_for(device.adapter_id))
            });
            cr_property!(ib, "ServiceData", device => {
                Some(device.service_data_map())
            });
            cr_property!(ib, "ManufacturerData", device => {
                Some(device.manufacturer_data_map())
            });
            cr_property!(ib, "TxPower", device => {
                device.state.lock().unwrap().tx_power
            });
            cr_property!(ib, "ServicesResolved", device => {
                Some(device.state.lock().unwrap().services_resolved)
            });
            ib.method_with_cr_async("Connect", (), (), |ctx, cr, ()| {
                method_call(ctx, cr, |device: Arc<Self>| async move {
                    device.connect(None).await?;
                    Ok(())
                })
            });
            ib.method_with_cr_async("Disconnect", (), (), |ctx, cr, ()| {
                method_call(ctx, cr, |device: Arc<Self>| async move {
                    device.disconnect(None).await?;
                    Ok(())
                })
            });
            ib.method_with_cr_async("ConnectProfile", ("uuid",), (), |ctx, cr, (uuid,): (String,)| {
                method_call(ctx, cr, |device: Arc<Self>| async move {
                    device.connect(Some(uuid)).await?;
                    Ok(())
                })
            });
            ib.method_with_cr_async("DisconnectProfile", ("uuid",), (), |ctx, cr, (uuid,): (String,)| {
                method_call(ctx, cr, |device: Arc<Self>| async move {
                    device.disconnect(Some(uuid)).await?;
                    Ok(())
                })
            });
            ib.method_with_cr_async("Pair", (), (), |ctx, cr, ()| {
                method_call(ctx, cr, |device: Arc<Self>| async move {
                    device.pair().await?;
                    Ok(())
                })
            });
            ib.method_with_cr_async("CancelPairing", (), (), |ctx, cr, ()| {
                method_call(ctx, cr, |device: Arc<Self>| async move {
                    device.cancel_pairing();
                    Ok(())
                })
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device(profile: DeviceProfile) -> Arc<Device> {
        Device::new(Weak::new(), 1, 0, Address::new([0, 0, 0, 0x11, 0x11, 0x11]), profile)
    }

    fn base_profile() -> DeviceProfile {
        DeviceProfile {
            name: "BLE-Device".to_string(),
            appearance: 0x00a0,
            is_le: true,
            uuids: vec![Uuid::parse_str("0000fff1-0000-1000-8000-00805f9b34fb").unwrap()],
            service_data: HashMap::from([(
                "0000fff1-0000-1000-8000-00805f9b34fb".to_string(),
                vec![0xde, 0xad],
            )]),
            ..Default::default()
        }
    }

    #[test]
    fn device_path_encodes_adapter_and_address() {
        let device = test_device(base_profile());
        assert_eq!(device.dbus_path().to_string(), "/org/bluez/hci1/dev_00_00_00_11_11_11");
    }

    #[test]
    fn merge_emits_only_differences() {
        let device = test_device(base_profile());
        assert!(device.merge_profile(&base_profile(), false).is_empty());

        let mut updated = base_profile();
        updated.name = "BLE-Device-42".to_string();
        assert_eq!(device.merge_profile(&updated, false), vec!["Name"]);
        assert_eq!(device.name(), "BLE-Device-42");

        let mut updated = base_profile();
        updated.name = "BLE-Device-42".to_string();
        updated.appearance = 0x00c0;
        assert_eq!(device.merge_profile(&updated, false), vec!["Appearance"]);
    }

    #[test]
    fn merge_reports_duplicates_when_requested() {
        let device = test_device(base_profile());
        let changed = device.merge_profile(&base_profile(), true);
        assert_eq!(changed, vec!["ServiceData"]);
    }

    #[test]
    fn mirror_state_flags() {
        let device = test_device(base_profile());
        device.set_paired_and_bonded();
        let state = device.state.lock().unwrap();
        assert!(state.paired);
        assert!(state.bonded);
    }
}
