//! Virtual Bluetooth adapter.

use dbus::{
    arg::{prop_cast, PropMap, RefArg},
    Path,
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken, MethodErr};
use rand::seq::SliceRandom;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt::{Debug, Formatter},
    sync::{Arc, Mutex as SyncMutex, Weak},
    time::Duration,
};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::{
    adv::{self, AdvertisementClient, SUPPORTED_ADVERTISEMENT_INSTANCES},
    device::{Device, DeviceProfile},
    emit_properties_changed, emit_property_changed,
    gatt::application::GattApplication,
    media::MediaEndpointClient,
    method_call,
    proxy::RemoteProperties,
    scanner,
    session::SessionInner,
    task::TaskSlot,
    Address, Error, ErrorKind, Result, UuidExt,
};

pub(crate) const INTERFACE: &str = "org.bluez.Adapter1";
pub(crate) const PREFIX: &str = "/org/bluez/";

/// Factory device names a new adapter picks from.
const TEST_NAMES: &[&str] = &[
    "Alligator's Android",
    "Bobcat's Bluetooth",
    "Eagle's Earbuds",
    "Lion's Laptop",
    "MacBook Pro",
    "ThinkPad",
];

const DEFAULT_DISCOVERABLE_TIMEOUT: u32 = 180;

/// Transport parameter determines the type of scan.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Display, EnumString)]
pub(crate) enum DiscoveryTransport {
    /// interleaved scan
    #[default]
    #[strum(serialize = "auto")]
    Auto,
    /// BR/EDR inquiry
    #[strum(serialize = "bredr")]
    BrEdr,
    /// LE scan only
    #[strum(serialize = "le")]
    Le,
}

/// Per-adapter device discovery filter.
#[derive(Clone, Debug, Default)]
pub(crate) struct DiscoveryFilter {
    /// Filter by service UUIDs, empty means match any UUID.
    pub uuids: HashSet<Uuid>,
    /// Transport parameter determines the type of scan.
    pub transport: DiscoveryTransport,
    /// Disables duplicate detection of advertisement data.
    pub duplicate_data: bool,
    /// Make adapter discoverable while discovering.
    pub discoverable: bool,
    /// Discover only devices where the pattern matches the address or name prefix.
    pub pattern: Option<String>,
}

impl DiscoveryFilter {
    /// Merges recognized keys from a `SetDiscoveryFilter` dictionary.
    ///
    /// Unknown keys are ignored.
    pub fn merge_from_dict(&mut self, dict: &PropMap) -> Result<()> {
        if let Some(uuids) = prop_cast::<Vec<String>>(dict, "UUIDs") {
            self.uuids = uuids.iter().map(|s| Uuid::parse_bluetooth(s)).collect::<Result<HashSet<_>>>()?;
        }
        if let Some(transport) = prop_cast::<String>(dict, "Transport") {
            self.transport = transport.parse().map_err(|_| {
                Error::with_message(ErrorKind::InvalidArguments, format!("unknown transport {transport}"))
            })?;
        }
        if let Some(duplicate_data) = prop_cast::<bool>(dict, "DuplicateData") {
            self.duplicate_data = *duplicate_data;
        }
        if let Some(discoverable) = prop_cast::<bool>(dict, "Discoverable") {
            self.discoverable = *discoverable;
        }
        if let Some(pattern) = prop_cast::<String>(dict, "Pattern") {
            self.pattern = Some(pattern.clone());
        }
        Ok(())
    }
}

/// GATT attribute handle space of one adapter.
///
/// Handles are allocated from a monotonically increasing counter that skips
/// values claimed explicitly by a registered application.
pub(crate) struct HandleAllocator {
    used: HashSet<u16>,
    counter: u16,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self { used: HashSet::new(), counter: 0 }
    }

    /// Allocates the next free handle.
    pub fn next(&mut self) -> u16 {
        loop {
            self.counter = self.counter.wrapping_add(1);
            if self.counter != 0 && !self.used.contains(&self.counter) {
                self.used.insert(self.counter);
                return self.counter;
            }
        }
    }

    /// Claims an explicitly requested handle.
    pub fn reserve(&mut self, handle: u16) -> Result<()> {
        if !self.used.insert(handle) {
            return Err(Error::with_message(ErrorKind::AlreadyExists, format!("Handle {handle} already exists")));
        }
        Ok(())
    }

    /// Returns a handle to the free set.
    pub fn release(&mut self, handle: u16) {
        self.used.remove(&handle);
    }
}

struct AdapterState {
    name: String,
    alias: Option<String>,
    class: u32,
    powered: bool,
    discoverable: bool,
    discoverable_timeout: u32,
    pairable: bool,
    pairable_timeout: u32,
    discovering: bool,
    uuids: BTreeSet<Uuid>,
    filter: DiscoveryFilter,
}

type ClientKey = (String, Path<'static>);

/// A virtual Bluetooth controller, the analog of a physical `hciN`.
pub struct Adapter {
    weak_self: Weak<Adapter>,
    session: Weak<SessionInner>,
    id: u16,
    address: Address,
    dbus_path: Path<'static>,
    state: SyncMutex<AdapterState>,
    pub(crate) devices: SyncMutex<HashMap<Path<'static>, Arc<Device>>>,
    advertisements: SyncMutex<Vec<(ClientKey, Arc<AdvertisementClient>)>>,
    gatt_apps: SyncMutex<Vec<(ClientKey, Arc<GattApplication>)>>,
    media_endpoints: SyncMutex<Vec<(ClientKey, Arc<MediaEndpointClient>)>>,
    pub(crate) handles: SyncMutex<HandleAllocator>,
    discoverable_task: TaskSlot,
    pairable_task: TaskSlot,
    discovering_task: TaskSlot,
}

impl Debug for Adapter {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Adapter {{ id: {}, address: {} }}", self.id, self.address)
    }
}

impl Adapter {
    pub(crate) fn new(session: Weak<SessionInner>, id: u16, address: Address) -> Arc<Self> {
        let name = TEST_NAMES.choose(&mut rand::thread_rng()).map(|s| s.to_string()).unwrap_or_default();
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            session,
            id,
            address,
            dbus_path: Self::dbus_path_for(id),
            state: SyncMutex::new(AdapterState {
                name,
                alias: None,
                class: 0,
                powered: false,
                discoverable: false,
                discoverable_timeout: DEFAULT_DISCOVERABLE_TIMEOUT,
                pairable: false,
                pairable_timeout: 0,
                discovering: false,
                uuids: BTreeSet::new(),
                filter: DiscoveryFilter::default(),
            }),
            devices: SyncMutex::new(HashMap::new()),
            advertisements: SyncMutex::new(Vec::new()),
            gatt_apps: SyncMutex::new(Vec::new()),
            media_endpoints: SyncMutex::new(Vec::new()),
            handles: SyncMutex::new(HandleAllocator::new()),
            discoverable_task: TaskSlot::new(),
            pairable_task: TaskSlot::new(),
            discovering_task: TaskSlot::new(),
        })
    }

    pub(crate) fn dbus_path_for(id: u16) -> Path<'static> {
        Path::new(format!("{PREFIX}hci{id}")).unwrap()
    }

    pub(crate) fn dbus_path(&self) -> &Path<'static> {
        &self.dbus_path
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn address(&self) -> Address {
        self.address
    }

    fn session(&self) -> Result<Arc<SessionInner>> {
        self.session
            .upgrade()
            .ok_or_else(|| Error::with_message(ErrorKind::Failed, "session is shutting down"))
    }

    fn emit_adapter_property<T: RefArg + 'static>(&self, name: &str, value: T) {
        if let Ok(session) = self.session() {
            emit_property_changed(&session.connection, &self.dbus_path, INTERFACE, name, value);
        }
    }

    /// The displayed name: the alias when set, the factory name otherwise.
    pub(crate) fn name(&self) -> String {
        let state = self.state.lock().unwrap();
        state.alias.clone().unwrap_or_else(|| state.name.clone())
    }

    pub(crate) fn factory_name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    pub(crate) fn class(&self) -> u32 {
        self.state.lock().unwrap().class
    }

    pub(crate) fn is_powered(&self) -> bool {
        self.state.lock().unwrap().powered
    }

    pub(crate) fn is_discoverable(&self) -> bool {
        self.state.lock().unwrap().discoverable
    }

    pub(crate) fn is_pairable(&self) -> bool {
        self.state.lock().unwrap().pairable
    }

    pub(crate) fn is_discovering(&self) -> bool {
        self.state.lock().unwrap().discovering
    }

    pub(crate) fn discovery_filter(&self) -> DiscoveryFilter {
        self.state.lock().unwrap().filter.clone()
    }

    fn uuid_strings(&self) -> Vec<String> {
        self.state.lock().unwrap().uuids.iter().map(|uuid| uuid.to_string()).collect()
    }

    pub(crate) fn set_powered(&self, powered: bool) {
        self.state.lock().unwrap().powered = powered;
        self.emit_adapter_property("Powered", powered);
    }

    // =======================================================================
    // Timed discoverable and pairable flags
    // =======================================================================

    /// Applies the discoverable flag and manages its timer without emitting.
    pub(crate) fn apply_discoverable(&self, enabled: bool) {
        let timeout = {
            let mut state = self.state.lock().unwrap();
            state.discoverable = enabled;
            state.discoverable_timeout
        };
        self.discoverable_task.cancel();
        if enabled && timeout != 0 {
            log::info!("Setting adapter {} as discoverable for {} seconds", self.id, timeout);
            let weak = self.weak_self.clone();
            self.discoverable_task.set(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(timeout.into())).await;
                if let Some(adapter) = weak.upgrade() {
                    adapter.set_discoverable(false);
                }
            }));
        }
    }

    /// Writes the discoverable flag as if set externally, emitting the change.
    pub(crate) fn set_discoverable(&self, enabled: bool) {
        self.apply_discoverable(enabled);
        self.emit_adapter_property("Discoverable", enabled);
    }

    fn apply_discoverable_timeout(&self, timeout: u32) {
        let rearm = {
            let mut state = self.state.lock().unwrap();
            state.discoverable_timeout = timeout;
            state.discoverable
        };
        if rearm {
            self.apply_discoverable(true);
        }
    }

    /// Applies the pairable flag and manages its timer without emitting.
    pub(crate) fn apply_pairable(&self, enabled: bool) {
        let timeout = {
            let mut state = self.state.lock().unwrap();
            state.pairable = enabled;
            state.pairable_timeout
        };
        self.pairable_task.cancel();
        if enabled && timeout != 0 {
            log::info!("Setting adapter {} as pairable for {} seconds", self.id, timeout);
            let weak = self.weak_self.clone();
            self.pairable_task.set(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(timeout.into())).await;
                if let Some(adapter) = weak.upgrade() {
                    adapter.set_pairable(false);
                }
            }));
        }
    }

    /// Writes the pairable flag as if set externally, emitting the change.
    pub(crate) fn set_pairable(&self, enabled: bool) {
        self.apply_pairable(enabled);
        self.emit_adapter_property("Pairable", enabled);
    }

    fn apply_pairable_timeout(&self, timeout: u32) {
        let rearm = {
            let mut state = self.state.lock().unwrap();
            state.pairable_timeout = timeout;
            state.pairable
        };
        if rearm {
            self.apply_pairable(true);
        }
    }

    // =======================================================================
    // Discovery
    // =======================================================================

    fn start_discovery(&self, client: String) -> Result<()> {
        let session = self.session()?;
        log::info!("Starting discovery on adapter {}", self.id);
        let lost_rx = session.client_lost(&client);
        let weak_session = Arc::downgrade(&session);
        let weak = self.weak_self.clone();
        let id = self.id;
        self.discovering_task.set(tokio::spawn(async move {
            tokio::select! {
                _ = scanner::run(weak_session, id) => {}
                _ = lost_rx => {
                    log::debug!("Client {} lost, stopping discovery on adapter {}", client, id);
                    if let Some(adapter) = weak.upgrade() {
                        adapter.state.lock().unwrap().discovering = false;
                        adapter.emit_adapter_property("Discovering", false);
                    }
                }
            }
        }));
        self.state.lock().unwrap().discovering = true;
        self.emit_adapter_property("Discovering", true);
        Ok(())
    }

    fn stop_discovery(&self) {
        log::info!("Stopping discovery on adapter {}", self.id);
        self.discovering_task.cancel();
        self.state.lock().unwrap().discovering = false;
        self.emit_adapter_property("Discovering", false);
    }

    fn set_discovery_filter(&self, dict: &PropMap) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.filter.merge_from_dict(dict)
    }

    // =======================================================================
    // Devices
    // =======================================================================

    /// Reports a device on this adapter, merging into an existing entry.
    pub(crate) async fn add_device(&self, peer_id: u16, address: Address, profile: DeviceProfile) -> Result<Arc<Device>> {
        let path = Device::dbus_path_for(self.id, address);
        let session = self.session()?;
        let mut cr = session.crossroads.lock().await;
        let mut devices = self.devices.lock().unwrap();
        if let Some(existing) = devices.get(&path).cloned() {
            drop(devices);
            drop(cr);
            log::debug!("Updating device {} in adapter {}", address, self.id);
            existing.merge_profile(&profile, self.discovery_filter().duplicate_data);
            return Ok(existing);
        }
        log::info!("Adding device {} to adapter {}", address, self.id);
        let device = Device::new(self.session.clone(), self.id, peer_id, address, profile);
        cr.insert(path.clone(), &[session.device_token], device.clone());
        devices.insert(path, device.clone());
        Ok(device)
    }

    pub(crate) fn find_device(&self, path: &Path<'static>) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().get(path).cloned()
    }

    /// Removes a device object. An unknown path is a no-op.
    pub(crate) async fn remove_device(&self, path: &Path<'static>) -> Result<()> {
        let device = self.devices.lock().unwrap().remove(path);
        let Some(device) = device else { return Ok(()) };
        log::info!("Removing device {} from adapter {}", device.address(), self.id);
        device.teardown().await;
        let session = self.session()?;
        let mut cr = session.crossroads.lock().await;
        let _: Option<Arc<Device>> = cr.remove(path);
        Ok(())
    }

    // =======================================================================
    // LE advertisements
    // =======================================================================

    pub(crate) fn advertisement_slots_active(&self) -> usize {
        self.advertisements.lock().unwrap().len()
    }

    pub(crate) fn advertisement_slots_available(&self) -> usize {
        SUPPORTED_ADVERTISEMENT_INSTANCES - self.advertisement_slots_active()
    }

    /// The first registered advertisement, if any.
    pub(crate) fn first_advertisement(&self) -> Option<Arc<AdvertisementClient>> {
        self.advertisements.lock().unwrap().first().map(|(_, adv)| adv.clone())
    }

    fn emit_advertisement_instances(&self) {
        if let Ok(session) = self.session() {
            let mut changed = PropMap::new();
            changed.insert(
                "ActiveInstances".to_string(),
                dbus::arg::Variant(Box::new(self.advertisement_slots_active() as u8) as Box<dyn RefArg>),
            );
            changed.insert(
                "SupportedInstances".to_string(),
                dbus::arg::Variant(Box::new(self.advertisement_slots_available() as u8) as Box<dyn RefArg>),
            );
            emit_properties_changed(&session.connection, &self.dbus_path, adv::MANAGER_INTERFACE, changed);
        }
    }

    pub(crate) async fn add_le_advertisement(&self, client: &str, path: Path<'static>) -> Result<()> {
        {
            let advs = self.advertisements.lock().unwrap();
            if advs.len() >= SUPPORTED_ADVERTISEMENT_INSTANCES {
                return Err(Error::with_message(ErrorKind::NotPermitted, "advertisement instances exhausted"));
            }
            if advs.iter().any(|((c, p), _)| c == client && *p == path) {
                return Err(Error::new(ErrorKind::AlreadyExists));
            }
        }
        let session = self.session()?;
        let props =
            RemoteProperties::new(session.connection.clone(), client, path.clone(), adv::ADVERTISEMENT_INTERFACE)
                .await?;
        let advertisement = Arc::new(AdvertisementClient { props, lost_task: TaskSlot::new() });
        log::info!("Adding LE advertisement {}", &path);
        {
            let mut advs = self.advertisements.lock().unwrap();
            if advs.len() >= SUPPORTED_ADVERTISEMENT_INSTANCES {
                return Err(Error::with_message(ErrorKind::NotPermitted, "advertisement instances exhausted"));
            }
            advs.push(((client.to_string(), path.clone()), advertisement.clone()));
        }

        let lost_rx = session.client_lost(client);
        let weak = self.weak_self.clone();
        let client = client.to_string();
        advertisement.lost_task.set(tokio::spawn(async move {
            if lost_rx.await.is_ok() {
                log::debug!("Client {} lost, removing LE advertisement {}", &client, &path);
                if let Some(adapter) = weak.upgrade() {
                    let _ = adapter.del_le_advertisement(&client, &path);
                }
            }
        }));

        self.emit_advertisement_instances();
        Ok(())
    }

    pub(crate) fn del_le_advertisement(&self, client: &str, path: &Path<'static>) -> Result<()> {
        let advertisement = {
            let mut advs = self.advertisements.lock().unwrap();
            let pos = advs
                .iter()
                .position(|((c, p), _)| c == client && p == path)
                .ok_or_else(|| Error::with_message(ErrorKind::DoesNotExist, "Does Not Exist"))?;
            advs.remove(pos).1
        };
        log::info!("Removing LE advertisement {}", path);
        advertisement.lost_task.cancel();
        self.emit_advertisement_instances();
        Ok(())
    }

    // =======================================================================
    // GATT applications
    // =======================================================================

    /// UUIDs of all primary services across the registered applications.
    pub(crate) fn update_uuids(&self) {
        let mut uuids: BTreeSet<Uuid> = BTreeSet::new();
        for (_, app) in self.gatt_apps.lock().unwrap().iter() {
            uuids.extend(app.primary_service_uuids());
        }
        let changed = {
            let mut state = self.state.lock().unwrap();
            if state.uuids != uuids {
                state.uuids = uuids;
                true
            } else {
                false
            }
        };
        if changed {
            self.emit_adapter_property("UUIDs", self.uuid_strings());
        }
    }

    pub(crate) fn gatt_applications(&self) -> Vec<Arc<GattApplication>> {
        self.gatt_apps.lock().unwrap().iter().map(|(_, app)| app.clone()).collect()
    }

    pub(crate) async fn add_gatt_application(&self, client: &str, path: Path<'static>) -> Result<()> {
        if self.gatt_apps.lock().unwrap().iter().any(|((c, p), _)| c == client && *p == path) {
            return Err(Error::new(ErrorKind::AlreadyExists));
        }
        let session = self.session()?;
        let app = Arc::new(GattApplication::new(session.connection.clone(), client, path.clone()).await?);
        app.assign_handles(self).await?;

        log::info!("Adding GATT application {}", &path);
        self.gatt_apps.lock().unwrap().push(((client.to_string(), path.clone()), app.clone()));
        self.update_uuids();

        // Either losing the client or any object disappearing from its tree
        // tears down the registration.
        let lost_rx = session.client_lost(client);
        let removed = app.object_removed.clone();
        let weak = self.weak_self.clone();
        let client = client.to_string();
        app.lost_task.set(tokio::spawn(async move {
            tokio::select! {
                _ = lost_rx => {
                    log::debug!("Client {} lost, removing GATT application {}", &client, &path);
                }
                _ = removed.notified() => {
                    log::debug!("Object removed, removing GATT application {}", &path);
                }
            }
            if let Some(adapter) = weak.upgrade() {
                let _ = adapter.del_gatt_application(&client, &path);
            }
        }));
        Ok(())
    }

    pub(crate) fn del_gatt_application(&self, client: &str, path: &Path<'static>) -> Result<()> {
        let app = {
            let mut apps = self.gatt_apps.lock().unwrap();
            let pos = apps
                .iter()
                .position(|((c, p), _)| c == client && p == path)
                .ok_or_else(|| Error::with_message(ErrorKind::DoesNotExist, "Does Not Exist"))?;
            apps.remove(pos).1
        };
        log::info!("Removing GATT application {}", path);
        app.lost_task.cancel();
        let mut handles = self.handles.lock().unwrap();
        for handle in app.assigned_handles() {
            handles.release(handle);
        }
        drop(handles);
        self.update_uuids();
        Ok(())
    }

    // =======================================================================
    // Media endpoints
    // =======================================================================

    pub(crate) async fn add_media_endpoint(&self, client: &str, path: Path<'static>) -> Result<()> {
        if self.media_endpoints.lock().unwrap().iter().any(|((c, p), _)| c == client && *p == path) {
            return Err(Error::new(ErrorKind::AlreadyExists));
        }
        let session = self.session()?;
        let props =
            RemoteProperties::new(session.connection.clone(), client, path.clone(), crate::media::ENDPOINT_INTERFACE)
                .await?;
        let endpoint = Arc::new(MediaEndpointClient { props, lost_task: TaskSlot::new() });
        log::info!("Registering {:?}", &endpoint);
        self.media_endpoints.lock().unwrap().push(((client.to_string(), path.clone()), endpoint.clone()));

        let lost_rx = session.client_lost(client);
        let weak = self.weak_self.clone();
        let client = client.to_string();
        endpoint.lost_task.set(tokio::spawn(async move {
            if lost_rx.await.is_ok() {
                log::debug!("Client {} lost, removing media endpoint {}", &client, &path);
                if let Some(adapter) = weak.upgrade() {
                    let _ = adapter.del_media_endpoint(&client, &path);
                }
            }
        }));
        Ok(())
    }

    pub(crate) fn del_media_endpoint(&self, client: &str, path: &Path<'static>) -> Result<()> {
        let endpoint = {
            let mut endpoints = self.media_endpoints.lock().unwrap();
            let pos = endpoints
                .iter()
                .position(|((c, p), _)| c == client && p == path)
                .ok_or_else(|| Error::with_message(ErrorKind::DoesNotExist, "Does Not Exist"))?;
            endpoints.remove(pos).1
        };
        log::info!("Removing {:?}", &endpoint);
        endpoint.lost_task.cancel();
        Ok(())
    }

    // =======================================================================
    // Lifecycle
    // =======================================================================

    /// Cleans up devices and registrations before the adapter is removed.
    pub(crate) async fn shutdown(&self) {
        self.discovering_task.cancel();
        self.discoverable_task.cancel();
        self.pairable_task.cancel();
        let device_paths: Vec<_> = self.devices.lock().unwrap().keys().cloned().collect();
        for path in device_paths {
            let _ = self.remove_device(&path).await;
        }
        for (_, advertisement) in self.advertisements.lock().unwrap().drain(..) {
            advertisement.lost_task.cancel();
        }
        for (_, app) in self.gatt_apps.lock().unwrap().drain(..) {
            app.lost_task.cancel();
        }
        for (_, endpoint) in self.media_endpoints.lock().unwrap().drain(..) {
            endpoint.lost_task.cancel();
        }
    }

    // =======================================================================
    // D-Bus interface
    // =======================================================================

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            cr_property!(ib, "Address", adapter => {
                Some(adapter.address.to_string())
            });
            cr_property!(ib, "AddressType", _adapter => {
                Some("public".to_string())
            });
            cr_property!(ib, "Name", adapter => {
                Some(adapter.factory_name())
            });
            ib.property("Alias")
                .get(|_ctx, adapter| Ok(adapter.name()))
                .set(|ctx, adapter, alias: String| {
                    log::trace!("{}: {}.Alias <- {}", ctx.path(), INTERFACE, &alias);
                    adapter.state.lock().unwrap().alias = Some(alias.clone());
                    Ok(Some(alias))
                });
            cr_property!(ib, "Class", adapter => {
                Some(adapter.class())
            });
            ib.property("Powered")
                .get(|_ctx, adapter| Ok(adapter.is_powered()))
                .set(|ctx, adapter, powered: bool| {
                    log::trace!("{}: {}.Powered <- {}", ctx.path(), INTERFACE, powered);
                    adapter.state.lock().unwrap().powered = powered;
                    Ok(Some(powered))
                });
            ib.property("Discoverable")
                .get(|_ctx, adapter| Ok(adapter.is_discoverable()))
                .set(|ctx, adapter, discoverable: bool| {
                    log::trace!("{}: {}.Discoverable <- {}", ctx.path(), INTERFACE, discoverable);
                    adapter.apply_discoverable(discoverable);
                    Ok(Some(discoverable))
                });
            ib.property("DiscoverableTimeout")
                .get(|_ctx, adapter| Ok(adapter.state.lock().unwrap().discoverable_timeout))
                .set(|ctx, adapter, timeout: u32| {
                    log::trace!("{}: {}.DiscoverableTimeout <- {}", ctx.path(), INTERFACE, timeout);
                    adapter.apply_discoverable_timeout(timeout);
                    Ok(Some(timeout))
                });
            ib.property("Pairable")
                .get(|_ctx, adapter| Ok(adapter.is_pairable()))
                .set(|ctx, adapter, pairable: bool| {
                    log::trace!("{}: {}.Pairable <- {}", ctx.path(), INTERFACE, pairable);
                    adapter.apply_pairable(pairable);
                    Ok(Some(pairable))
                });
            ib.property("PairableTimeout")
                .get(|_ctx, adapter| Ok(adapter.state.lock().unwrap().pairable_timeout))
                .set(|ctx, adapter, timeout: u32| {
                    log::trace!("{}: {}.PairableTimeout <- {}", ctx.path(), INTERFACE, timeout);
                    adapter.apply_pairable_timeout(timeout);
                    Ok(Some(timeout))
                });
            cr_property!(ib, "Discovering", adapter => {
                Some(adapter.is_discovering())
            });
            cr_property!(ib, "UUIDs", adapter => {
                Some(adapter.uuid_strings())
            });
            ib.method_with_cr_async("StartDiscovery", (), (), |ctx, cr, ()| {
                let sender = ctx.message().sender().map(|s| s.to_string());
                method_call(ctx, cr, |adapter: Arc<Self>| async move {
                    let sender = sender.ok_or_else(|| MethodErr::failed("message sender missing"))?;
                    adapter.start_discovery(sender)?;
                    Ok(())
                })
            });
            ib.method_with_cr_async("StopDiscovery", (), (), |ctx, cr, ()| {
                method_call(ctx, cr, |adapter: Arc<Self>| async move {
                    adapter.stop_discovery();
                    Ok(())
                })
            });
            ib.method_with_cr_async(
                "SetDiscoveryFilter",
                ("properties",),
                (),
                |ctx, cr, (properties,): (PropMap,)| {
                    method_call(ctx, cr, |adapter: Arc<Self>| async move {
                        adapter.set_discovery_filter(&properties)?;
                        Ok(())
                    })
                },
            );
            ib.method_with_cr_async("RemoveDevice", ("device",), (), |ctx, cr, (device,): (Path<'static>,)| {
                method_call(ctx, cr, |adapter: Arc<Self>| async move {
                    adapter.remove_device(&device).await?;
                    Ok(())
                })
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbus::arg::Variant;

    #[test]
    fn handle_allocator_skips_reserved() {
        let mut alloc = HandleAllocator::new();
        assert_eq!(alloc.next(), 1);
        alloc.reserve(2).unwrap();
        assert_eq!(alloc.next(), 3);
        let err = alloc.reserve(1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
        alloc.release(2);
        alloc.reserve(2).unwrap();
    }

    #[test]
    fn handle_allocator_unique_across_sequences() {
        let mut alloc = HandleAllocator::new();
        let mut seen = HashSet::new();
        alloc.reserve(5).unwrap();
        seen.insert(5);
        for _ in 0..10 {
            assert!(seen.insert(alloc.next()), "duplicate handle assigned");
        }
    }

    #[test]
    fn discovery_filter_merges_known_keys() {
        let mut dict = PropMap::new();
        dict.insert("Transport".to_string(), Variant(Box::new("le".to_string()) as Box<dyn RefArg>));
        dict.insert("DuplicateData".to_string(), Variant(Box::new(true) as Box<dyn RefArg>));
        dict.insert("Discoverable".to_string(), Variant(Box::new(true) as Box<dyn RefArg>));
        dict.insert("UUIDs".to_string(), Variant(Box::new(vec!["0xF100".to_string()]) as Box<dyn RefArg>));
        dict.insert("Pattern".to_string(), Variant(Box::new("BLE".to_string()) as Box<dyn RefArg>));
        dict.insert("Bogus".to_string(), Variant(Box::new(42u32) as Box<dyn RefArg>));

        let mut filter = DiscoveryFilter::default();
        filter.merge_from_dict(&dict).unwrap();
        assert_eq!(filter.transport, DiscoveryTransport::Le);
        assert!(filter.duplicate_data);
        assert!(filter.discoverable);
        assert_eq!(filter.pattern.as_deref(), Some("BLE"));
        assert!(filter.uuids.contains(&Uuid::parse_bluetooth("0xF100").unwrap()));
    }

    #[test]
    fn discovery_filter_rejects_bad_transport() {
        let mut dict = PropMap::new();
        dict.insert("Transport".to_string(), Variant(Box::new("warp".to_string()) as Box<dyn RefArg>));
        let mut filter = DiscoveryFilter::default();
        let err = filter.merge_from_dict(&dict).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArguments);
    }

    #[tokio::test(start_paused = true)]
    async fn discoverable_timer_expires() {
        let adapter = Adapter::new(Weak::new(), 0, Address::new([0, 0, 0, 1, 1, 1]));
        adapter.apply_discoverable_timeout(1);
        adapter.apply_discoverable(true);
        assert!(adapter.is_discoverable());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!adapter.is_discoverable());
    }

    #[tokio::test(start_paused = true)]
    async fn discoverable_untimed_stays_on() {
        let adapter = Adapter::new(Weak::new(), 0, Address::new([0, 0, 0, 1, 1, 1]));
        adapter.apply_discoverable_timeout(0);
        adapter.apply_discoverable(true);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(adapter.is_discoverable());
    }

    #[tokio::test(start_paused = true)]
    async fn discoverable_timeout_rearms_running_timer() {
        let adapter = Adapter::new(Weak::new(), 0, Address::new([0, 0, 0, 1, 1, 1]));
        adapter.apply_discoverable_timeout(600);
        adapter.apply_discoverable(true);
        tokio::time::sleep(Duration::from_secs(2)).await;
        // Re-arming with a shorter timeout replaces the pending timer.
        adapter.apply_discoverable_timeout(1);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!adapter.is_discoverable());
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_discoverable_cancels_timer() {
        let adapter = Adapter::new(Weak::new(), 0, Address::new([0, 0, 0, 1, 1, 1]));
        adapter.apply_discoverable_timeout(1);
        adapter.apply_discoverable(true);
        adapter.apply_discoverable(false);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!adapter.is_discoverable());
    }
}
