//! Bus session hosting the mock service.

use dbus::{
    nonblock::stdintf::org_freedesktop_dbus::RequestNameReply,
    message::MatchRule,
    nonblock::{MsgMatch, SyncConnection},
    Path,
};
use dbus_crossroads::{Crossroads, IfaceToken};
use dbus_tokio::connection;
use futures::{channel::oneshot, lock::Mutex, StreamExt};
use std::{
    collections::{BTreeMap, HashMap},
    fmt::{Debug, Formatter},
    sync::{Arc, Mutex as SyncMutex, Weak},
    time::Duration,
};
use tokio::task::{spawn_blocking, JoinHandle};

use crate::{
    adapter::Adapter,
    device::Device,
    gatt::link::{CharacteristicLink, DescriptorLink, ServiceLink},
    media,
    root::Root,
    task::TaskSet,
    Address, Error, ErrorKind, Result, SERVICE_NAME,
};

/// Message bus to host the service on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BusKind {
    /// The system bus.
    System,
    /// The session bus.
    Session,
}

/// Shared state of the mock service.
pub(crate) struct SessionInner {
    pub connection: Arc<SyncConnection>,
    pub crossroads: Mutex<Crossroads>,
    pub adapter_token: IfaceToken<Arc<Adapter>>,
    pub adv_manager_token: IfaceToken<Arc<Adapter>>,
    pub gatt_manager_token: IfaceToken<Arc<Adapter>>,
    pub media_token: IfaceToken<Arc<Adapter>>,
    pub device_token: IfaceToken<Arc<Device>>,
    pub service_link_token: IfaceToken<Arc<ServiceLink>>,
    pub characteristic_link_token: IfaceToken<Arc<CharacteristicLink>>,
    pub descriptor_link_token: IfaceToken<Arc<DescriptorLink>>,
    pub root: Arc<Root>,
    pub adapters: SyncMutex<BTreeMap<u16, Arc<Adapter>>>,
    pub scan_interval: Duration,
    pub tasks: TaskSet,
    clients: Arc<SyncMutex<HashMap<String, Vec<oneshot::Sender<()>>>>>,
    dbus_task: JoinHandle<connection::IOResourceError>,
    _name_owner_watch: MsgMatch,
}

impl SessionInner {
    /// Resolves an adapter by index.
    pub fn adapter(&self, id: u16) -> Result<Arc<Adapter>> {
        self.adapters
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::with_message(ErrorKind::DoesNotExist, format!("adapter hci{id} is gone")))
    }

    /// All adapters in index order.
    pub fn all_adapters(&self) -> Vec<Arc<Adapter>> {
        self.adapters.lock().unwrap().values().cloned().collect()
    }

    /// Resolves once the given bus client loses its name.
    ///
    /// The returned channel fires exactly once; dropping it unsubscribes.
    pub fn client_lost(&self, client: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.clients.lock().unwrap().entry(client.to_string()).or_default().push(tx);
        rx
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.dbus_task.abort();
        self.tasks.shutdown();
    }
}

/// A mock Bluetooth daemon session.
///
/// Connects to the chosen message bus, claims `org.bluez` and serves the
/// BlueZ object tree for the adapters added to it.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Session {{ {} }}", self.inner.connection.unique_name())
    }
}

impl Session {
    /// Connects to the bus, claims `org.bluez` and exports the service root.
    pub async fn new(bus: BusKind, scan_interval: Duration) -> Result<Self> {
        let (resource, connection) = spawn_blocking(move || match bus {
            BusKind::System => connection::new_system_sync(),
            BusKind::Session => connection::new_session_sync(),
        })
        .await??;
        let dbus_task = tokio::spawn(resource);
        log::trace!("Connected to D-Bus with unique name {}", &connection.unique_name());

        let mut crossroads = Crossroads::new();
        crossroads.set_async_support(Some((
            connection.clone(),
            Box::new(|x| {
                tokio::spawn(x);
            }),
        )));
        crossroads.set_object_manager_support(Some(connection.clone()));

        let adapter_token = Adapter::register_interface(&mut crossroads);
        let adv_manager_token = crate::adv::register_manager_interface(&mut crossroads);
        let gatt_manager_token = crate::gatt::register_manager_interface(&mut crossroads);
        let media_token = media::register_interface(&mut crossroads);
        let agent_manager_token = Root::register_interface(&mut crossroads);
        let device_token = Device::register_interface(&mut crossroads);
        let service_link_token = ServiceLink::register_interface(&mut crossroads);
        let characteristic_link_token = CharacteristicLink::register_interface(&mut crossroads);
        let descriptor_link_token = DescriptorLink::register_interface(&mut crossroads);

        let clients: Arc<SyncMutex<HashMap<String, Vec<oneshot::Sender<()>>>>> = Arc::new(SyncMutex::new(HashMap::new()));
        let clients_cb = clients.clone();
        let rule = MatchRule::new_signal("org.freedesktop.DBus", "NameOwnerChanged")
            .with_sender("org.freedesktop.DBus");
        let name_owner_watch = connection.add_match(rule).await?.msg_cb(move |msg| {
            if let (Some(name), Some(old), Some(new)) = msg.get3::<String, String, String>() {
                if !old.is_empty() && new.is_empty() {
                    let watchers = clients_cb.lock().unwrap().remove(&name).unwrap_or_default();
                    if !watchers.is_empty() {
                        log::debug!("Client {} lost, notifying {} watchers", &name, watchers.len());
                    }
                    for tx in watchers {
                        let _ = tx.send(());
                    }
                }
            }
            true
        });

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| SessionInner {
            connection: connection.clone(),
            crossroads: Mutex::new(crossroads),
            adapter_token,
            adv_manager_token,
            gatt_manager_token,
            media_token,
            device_token,
            service_link_token,
            characteristic_link_token,
            descriptor_link_token,
            root: Root::new(weak.clone()),
            adapters: SyncMutex::new(BTreeMap::new()),
            scan_interval,
            tasks: TaskSet::new(),
            clients,
            dbus_task,
            _name_owner_watch: name_owner_watch,
        });

        {
            let mut cr = inner.crossroads.lock().await;
            let om = cr.object_manager::<()>();
            cr.insert(Path::new("/").unwrap(), &[om], ());
            cr.insert(Path::new(Root::PATH).unwrap(), &[agent_manager_token], inner.root.clone());
        }

        let mc_callback = connection.add_match(MatchRule::new_method_call()).await?;
        let mc_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let (_mc_callback, mut mc_stream) = mc_callback.msg_stream();
            while let Some(msg) = mc_stream.next().await {
                let mc_inner = match mc_inner.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                let mut crossroads = mc_inner.crossroads.lock().await;
                let _ = crossroads.handle_message(msg, &*mc_inner.connection);
            }
        });

        match connection.request_name(SERVICE_NAME, false, false, true).await? {
            RequestNameReply::PrimaryOwner => {}
            _ => {
                return Err(Error::with_message(
                    ErrorKind::Failed,
                    format!("cannot acquire bus name {SERVICE_NAME}"),
                ))
            }
        }
        log::info!("Serving {} on the {:?} bus", SERVICE_NAME, bus);

        Ok(Self { inner })
    }

    /// Adds a virtual adapter with the given index and address.
    pub async fn add_adapter(&self, id: u16, address: Address) -> Result<()> {
        let adapter = Adapter::new(Arc::downgrade(&self.inner), id, address);
        {
            let mut adapters = self.inner.adapters.lock().unwrap();
            if adapters.contains_key(&id) {
                return Err(Error::with_message(ErrorKind::AlreadyExists, format!("adapter hci{id}")));
            }
            adapters.insert(id, adapter.clone());
        }
        log::info!("Adding adapter {} with address {}", id, address);
        let mut cr = self.inner.crossroads.lock().await;
        cr.insert(
            adapter.dbus_path().clone(),
            &[
                self.inner.adapter_token,
                self.inner.adv_manager_token,
                self.inner.gatt_manager_token,
                self.inner.media_token,
            ],
            adapter.clone(),
        );
        Ok(())
    }

    /// Removes an adapter, cleaning up its devices and registrations first.
    pub async fn remove_adapter(&self, id: u16) -> Result<()> {
        let adapter = self.inner.adapter(id)?;
        log::info!("Removing adapter {}", id);
        adapter.shutdown().await;
        self.inner.adapters.lock().unwrap().remove(&id);
        let mut cr = self.inner.crossroads.lock().await;
        let _: Option<Arc<Adapter>> = cr.remove(adapter.dbus_path());
        Ok(())
    }

    /// Powers every adapter on or off.
    pub async fn set_all_powered(&self, powered: bool) {
        for adapter in self.inner.all_adapters() {
            adapter.set_powered(powered);
        }
    }
}
