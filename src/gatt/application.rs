//! GATT applications registered by bus clients.
//!
//! A registered application is an object-manager subtree on the client,
//! mirrored locally as typed service, characteristic and descriptor proxies
//! with cached properties.

use dbus::{
    arg::{OwnedFd, PropMap},
    message::{MatchRule, SignalArgs},
    nonblock::{
        stdintf::org_freedesktop_dbus::{ObjectManager, ObjectManagerInterfacesRemoved},
        MsgMatch, Proxy, SyncConnection,
    },
    Path,
};
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex as SyncMutex},
};
use tokio::sync::Notify;
use uuid::Uuid;

use super::{CHARACTERISTIC_INTERFACE, DESCRIPTOR_INTERFACE, SERVICE_INTERFACE};
use crate::{
    adapter::Adapter,
    proxy::{arg_as_bytes, RemoteProperties},
    task::TaskSlot,
    Error, ErrorKind, Result, UuidExt, TIMEOUT,
};

/// GATT service on a client, with cached properties.
pub(crate) struct GattServiceClient {
    pub props: RemoteProperties,
}

impl GattServiceClient {
    pub fn uuid(&self) -> Option<Uuid> {
        self.props.get::<String>("UUID").and_then(|s| Uuid::parse_bluetooth(&s).ok())
    }

    pub fn primary(&self) -> bool {
        self.props.get_or("Primary", false)
    }

    pub fn handle(&self) -> Option<u16> {
        self.props.get("Handle")
    }
}

/// GATT characteristic on a client, with cached properties and forwarded
/// method calls.
pub(crate) struct GattCharacteristicClient {
    pub props: RemoteProperties,
}

impl GattCharacteristicClient {
    pub fn uuid(&self) -> Option<Uuid> {
        self.props.get::<String>("UUID").and_then(|s| Uuid::parse_bluetooth(&s).ok())
    }

    pub fn handle(&self) -> Option<u16> {
        self.props.get("Handle")
    }

    pub fn flags(&self) -> Vec<String> {
        self.props.get_or("Flags", Vec::new())
    }

    /// Path of the service owning this characteristic on the client.
    pub fn service_path(&self) -> Option<Path<'static>> {
        self.props
            .with_value("Service", |v| v.as_str().map(|s| s.to_string()))
            .flatten()
            .and_then(|s| Path::new(s).ok())
    }

    pub fn value(&self) -> Vec<u8> {
        self.props.with_value("Value", arg_as_bytes).flatten().unwrap_or_default()
    }

    pub fn notifying(&self) -> bool {
        self.props.get_or("Notifying", false)
    }

    pub fn mtu(&self) -> Option<u16> {
        self.props.get("MTU")
    }

    pub fn write_acquired(&self) -> Option<bool> {
        self.props.get("WriteAcquired")
    }

    pub fn notify_acquired(&self) -> Option<bool> {
        self.props.get("NotifyAcquired")
    }

    pub async fn read_value(&self, options: PropMap) -> Result<Vec<u8>> {
        let (value,): (Vec<u8>,) =
            self.props.proxy().method_call(CHARACTERISTIC_INTERFACE, "ReadValue", (options,)).await?;
        Ok(value)
    }

    pub async fn write_value(&self, value: Vec<u8>, options: PropMap) -> Result<()> {
        self.props.proxy().method_call::<(), _, _, _>(CHARACTERISTIC_INTERFACE, "WriteValue", (value, options)).await?;
        Ok(())
    }

    pub async fn start_notify(&self) -> Result<()> {
        self.props.proxy().method_call::<(), _, _, _>(CHARACTERISTIC_INTERFACE, "StartNotify", ()).await?;
        Ok(())
    }

    pub async fn stop_notify(&self) -> Result<()> {
        self.props.proxy().method_call::<(), _, _, _>(CHARACTERISTIC_INTERFACE, "StopNotify", ()).await?;
        Ok(())
    }

    pub async fn confirm(&self) -> Result<()> {
        self.props.proxy().method_call::<(), _, _, _>(CHARACTERISTIC_INTERFACE, "Confirm", ()).await?;
        Ok(())
    }

    pub async fn acquire_write(&self, options: PropMap) -> Result<(OwnedFd, u16)> {
        Ok(self.props.proxy().method_call(CHARACTERISTIC_INTERFACE, "AcquireWrite", (options,)).await?)
    }

    pub async fn acquire_notify(&self, options: PropMap) -> Result<(OwnedFd, u16)> {
        Ok(self.props.proxy().method_call(CHARACTERISTIC_INTERFACE, "AcquireNotify", (options,)).await?)
    }
}

/// GATT characteristic descriptor on a client, with cached properties.
pub(crate) struct GattDescriptorClient {
    pub props: RemoteProperties,
}

impl GattDescriptorClient {
    pub fn uuid(&self) -> Option<Uuid> {
        self.props.get::<String>("UUID").and_then(|s| Uuid::parse_bluetooth(&s).ok())
    }

    pub fn handle(&self) -> Option<u16> {
        self.props.get("Handle")
    }

    pub fn flags(&self) -> Vec<String> {
        self.props.get_or("Flags", Vec::new())
    }

    /// Path of the characteristic owning this descriptor on the client.
    pub fn characteristic_path(&self) -> Option<Path<'static>> {
        self.props
            .with_value("Characteristic", |v| v.as_str().map(|s| s.to_string()))
            .flatten()
            .and_then(|s| Path::new(s).ok())
    }

    pub fn value(&self) -> Vec<u8> {
        self.props.with_value("Value", arg_as_bytes).flatten().unwrap_or_default()
    }

    pub async fn read_value(&self, options: PropMap) -> Result<Vec<u8>> {
        let (value,): (Vec<u8>,) =
            self.props.proxy().method_call(DESCRIPTOR_INTERFACE, "ReadValue", (options,)).await?;
        Ok(value)
    }

    pub async fn write_value(&self, value: Vec<u8>, options: PropMap) -> Result<()> {
        self.props.proxy().method_call::<(), _, _, _>(DESCRIPTOR_INTERFACE, "WriteValue", (value, options)).await?;
        Ok(())
    }
}

/// A node of a registered application tree.
#[derive(Clone)]
pub(crate) enum GattNode {
    Service(Arc<GattServiceClient>),
    Characteristic(Arc<GattCharacteristicClient>),
    Descriptor(Arc<GattDescriptorClient>),
}

impl GattNode {
    fn props(&self) -> &RemoteProperties {
        match self {
            Self::Service(s) => &s.props,
            Self::Characteristic(c) => &c.props,
            Self::Descriptor(d) => &d.props,
        }
    }

    /// Cached handle: `Some(0)` asks for assignment, [None] means the server
    /// does not expose the property at all.
    fn handle(&self) -> Option<u16> {
        self.props().get("Handle")
    }

    async fn set_handle_remote(&self, handle: u16) -> Result<()> {
        self.props().set_remote("Handle", handle).await
    }

    fn cache_handle(&self, handle: u16) {
        self.props().cache("Handle", Box::new(handle));
    }
}

/// A client's registered GATT application.
pub(crate) struct GattApplication {
    pub client: String,
    pub path: Path<'static>,
    objects: Arc<SyncMutex<BTreeMap<Path<'static>, GattNode>>>,
    /// Set once any object disappears from the client's tree.
    pub object_removed: Arc<Notify>,
    pub lost_task: TaskSlot,
    assigned: SyncMutex<Vec<u16>>,
    removed_watch: SyncMutex<Option<MsgMatch>>,
    connection: Arc<SyncConnection>,
}

impl fmt::Debug for GattApplication {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "application[{} {}]", &self.client, &self.path)
    }
}

impl GattApplication {
    /// Walks the client's object tree and mirrors the GATT nodes it contains.
    ///
    /// Interfaces other than service, characteristic and descriptor are
    /// ignored.
    pub async fn new(connection: Arc<SyncConnection>, client: &str, path: Path<'static>) -> Result<Self> {
        let proxy = Proxy::new(client.to_string(), path.clone(), TIMEOUT, connection.clone());
        let managed = proxy.get_managed_objects().await.map_err(|err| {
            Error::with_message(ErrorKind::Failed, format!("cannot fetch object tree of {}: {}", &path, err))
        })?;

        let mut objects = BTreeMap::new();
        for (obj_path, interfaces) in managed.into_iter().collect::<BTreeMap<_, _>>() {
            let node = if interfaces.contains_key(SERVICE_INTERFACE) {
                let props =
                    RemoteProperties::new(connection.clone(), client, obj_path.clone(), SERVICE_INTERFACE).await?;
                GattNode::Service(Arc::new(GattServiceClient { props }))
            } else if interfaces.contains_key(CHARACTERISTIC_INTERFACE) {
                let props =
                    RemoteProperties::new(connection.clone(), client, obj_path.clone(), CHARACTERISTIC_INTERFACE)
                        .await?;
                GattNode::Characteristic(Arc::new(GattCharacteristicClient { props }))
            } else if interfaces.contains_key(DESCRIPTOR_INTERFACE) {
                let props =
                    RemoteProperties::new(connection.clone(), client, obj_path.clone(), DESCRIPTOR_INTERFACE)
                        .await?;
                GattNode::Descriptor(Arc::new(GattDescriptorClient { props }))
            } else {
                continue;
            };
            objects.insert(obj_path, node);
        }

        let objects = Arc::new(SyncMutex::new(objects));
        let object_removed = Arc::new(Notify::new());

        let rule = MatchRule::new_signal(
            ObjectManagerInterfacesRemoved::INTERFACE,
            ObjectManagerInterfacesRemoved::NAME,
        )
        .with_sender(client.to_string())
        .with_path(path.clone());
        let cb_objects = objects.clone();
        let cb_removed = object_removed.clone();
        let removed_watch = connection.add_match(rule).await?.msg_cb(move |msg| {
            if let Some(removed) = ObjectManagerInterfacesRemoved::from_message(&msg) {
                if cb_objects.lock().unwrap().remove(&removed.object).is_some() {
                    cb_removed.notify_one();
                }
            }
            true
        });

        Ok(Self {
            client: client.to_string(),
            path,
            objects,
            object_removed,
            lost_task: TaskSlot::new(),
            assigned: SyncMutex::new(Vec::new()),
            removed_watch: SyncMutex::new(Some(removed_watch)),
            connection,
        })
    }

    /// Assigns handles to the application's nodes from the adapter's space.
    ///
    /// A cached handle of `0` is replaced by a fresh assignment that is
    /// written back to the server; an absent handle is assigned locally only;
    /// an explicit handle colliding with an already assigned one fails with
    /// `AlreadyExists` after rolling back every allocation made here.
    pub async fn assign_handles(&self, adapter: &Adapter) -> Result<()> {
        let nodes: Vec<GattNode> = self.objects.lock().unwrap().values().cloned().collect();
        let mut assigned = Vec::new();
        for node in &nodes {
            let result = match node.handle() {
                Some(0) => {
                    let handle = adapter.handles.lock().unwrap().next();
                    assigned.push(handle);
                    node.set_handle_remote(handle).await
                }
                None => {
                    let handle = adapter.handles.lock().unwrap().next();
                    assigned.push(handle);
                    node.cache_handle(handle);
                    Ok(())
                }
                Some(handle) => adapter.handles.lock().unwrap().reserve(handle).map(|()| assigned.push(handle)),
            };
            if let Err(err) = result {
                let mut handles = adapter.handles.lock().unwrap();
                for handle in assigned {
                    handles.release(handle);
                }
                return Err(err);
            }
        }
        *self.assigned.lock().unwrap() = assigned;
        Ok(())
    }

    /// Handles claimed by this application, for release on unregister.
    pub fn assigned_handles(&self) -> Vec<u16> {
        self.assigned.lock().unwrap().clone()
    }

    /// UUIDs of the application's primary services.
    pub fn primary_service_uuids(&self) -> Vec<Uuid> {
        self.objects
            .lock()
            .unwrap()
            .values()
            .filter_map(|node| match node {
                GattNode::Service(service) if service.primary() => service.uuid(),
                _ => None,
            })
            .collect()
    }

    pub fn services(&self) -> Vec<(Path<'static>, Arc<GattServiceClient>)> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(path, node)| match node {
                GattNode::Service(service) => Some((path.clone(), service.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn characteristics(&self) -> Vec<(Path<'static>, Arc<GattCharacteristicClient>)> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(path, node)| match node {
                GattNode::Characteristic(characteristic) => Some((path.clone(), characteristic.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn descriptors(&self) -> Vec<(Path<'static>, Arc<GattDescriptorClient>)> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(path, node)| match node {
                GattNode::Descriptor(descriptor) => Some((path.clone(), descriptor.clone())),
                _ => None,
            })
            .collect()
    }
}

impl Drop for GattApplication {
    fn drop(&mut self) {
        if let Some(watch) = self.removed_watch.lock().unwrap().take() {
            let connection = self.connection.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = connection.remove_match(watch.token()).await;
                });
            }
        }
    }
}
