//! GATT link objects.
//!
//! When a device connects, the GATT applications registered on the adapter it
//! represents are re-exported as a tree of link objects under the device
//! path. Links forward reads, writes and notification sessions to the
//! client that registered the application, switching to file-descriptor
//! backed sockets when the client offers them.

use dbus::{
    arg::{OwnedFd, PropMap, RefArg, Variant},
    message::{MatchRule, SignalArgs},
    nonblock::{stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged, MsgMatch, SyncConnection},
    Path,
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use std::{
    collections::HashMap,
    os::unix::io::FromRawFd,
    sync::{Arc, Mutex as SyncMutex},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    sync::Mutex,
};

use super::{
    application::{GattCharacteristicClient, GattDescriptorClient, GattServiceClient},
    CHARACTERISTIC_INTERFACE, DESCRIPTOR_INTERFACE, SERVICE_INTERFACE,
};
use crate::{
    adapter::Adapter, device::Device, emit_property_changed, method_call, parent_path, session::SessionInner,
    task::TaskSlot, Result,
};

/// Default GATT exchange MTU.
const DEFAULT_MTU: u16 = 512;

/// Kind tag of an exported link object, for typed removal.
#[derive(Clone, Copy, Debug)]
pub(crate) enum LinkKind {
    Service,
    Characteristic,
    Descriptor,
}

fn stream_from_fd(fd: OwnedFd) -> Result<UnixStream> {
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd.into_fd()) };
    stream.set_nonblocking(true)?;
    Ok(UnixStream::from_std(stream)?)
}

// ===========================================================================
// Service link
// ===========================================================================

/// Server-side proxy of a registered GATT service under a connected device.
pub(crate) struct ServiceLink {
    pub client: Arc<GattServiceClient>,
}

impl ServiceLink {
    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(SERVICE_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            cr_property!(ib, "UUID", link => {
                link.client.uuid().map(|uuid| uuid.to_string())
            });
            cr_property!(ib, "Primary", link => {
                Some(link.client.primary())
            });
            ib.property("Device").get(|ctx, _| Ok(parent_path(ctx.path())));
            cr_property!(ib, "Includes", _link => {
                Some(Vec::<Path<'static>>::new())
            });
            cr_property!(ib, "Handle", link => {
                Some(link.client.handle().unwrap_or_default())
            });
        })
    }
}

// ===========================================================================
// Characteristic link
// ===========================================================================

/// Server-side proxy of a registered GATT characteristic.
///
/// Holds the negotiated MTU and the optional write and notify sockets
/// acquired from the registering client.
pub(crate) struct CharacteristicLink {
    weak_self: std::sync::Weak<CharacteristicLink>,
    connection: Arc<SyncConnection>,
    pub client: Arc<GattCharacteristicClient>,
    device_path: Path<'static>,
    path: Path<'static>,
    mtu: SyncMutex<u16>,
    write_stream: Mutex<Option<UnixStream>>,
    notify_task: TaskSlot,
    value_forward: SyncMutex<Option<MsgMatch>>,
}

impl CharacteristicLink {
    fn new(
        connection: Arc<SyncConnection>, client: Arc<GattCharacteristicClient>, device_path: Path<'static>,
        path: Path<'static>,
    ) -> Arc<Self> {
        let mtu = client.mtu().unwrap_or(DEFAULT_MTU);
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            connection,
            client,
            device_path,
            path,
            mtu: SyncMutex::new(mtu),
            write_stream: Mutex::new(None),
            notify_task: TaskSlot::new(),
            value_forward: SyncMutex::new(None),
        })
    }

    fn mtu(&self) -> u16 {
        *self.mtu.lock().unwrap()
    }

    fn acquire_options(&self) -> PropMap {
        let mut options = PropMap::new();
        options.insert("device".to_string(), Variant(Box::new(self.device_path.clone()) as Box<dyn RefArg>));
        options.insert("mtu".to_string(), Variant(Box::new(self.mtu()) as Box<dyn RefArg>));
        options.insert("link".to_string(), Variant(Box::new("LE".to_string()) as Box<dyn RefArg>));
        options
    }

    async fn write_value(&self, value: Vec<u8>, options: PropMap) -> Result<()> {
        match self.client.write_acquired() {
            // The client does not support socket writes at all.
            None => self.client.write_value(value, options).await,
            Some(_) => {
                let mut stream = self.write_stream.lock().await;
                if stream.is_none() {
                    let (fd, mtu) = self.client.acquire_write(self.acquire_options()).await?;
                    *self.mtu.lock().unwrap() = mtu;
                    *stream = Some(stream_from_fd(fd)?);
                    log::debug!("Acquired write socket for {} with MTU {}", &self.path, mtu);
                }
                if let Some(stream) = stream.as_mut() {
                    stream.write_all(&value).await?;
                }
                Ok(())
            }
        }
    }

    /// Re-emits the registering client's `Value` changes on the link path so
    /// that notifications reach clients watching the device tree.
    async fn start_value_forward(&self) -> Result<()> {
        if self.value_forward.lock().unwrap().is_some() {
            return Ok(());
        }
        let rule = MatchRule::new_signal(PropertiesPropertiesChanged::INTERFACE, PropertiesPropertiesChanged::NAME)
            .with_sender(self.client.props.dest.clone())
            .with_path(self.client.props.path.clone());
        let link_path = self.path.clone();
        let emit_connection = self.connection.clone();
        let watch = self.connection.add_match(rule).await?.msg_cb(move |msg| {
            if let Some(ppc) = PropertiesPropertiesChanged::from_message(&msg) {
                if ppc.interface_name == CHARACTERISTIC_INTERFACE {
                    if let Some(value) = ppc.changed_properties.get("Value") {
                        emit_property_changed(
                            &emit_connection,
                            &link_path,
                            CHARACTERISTIC_INTERFACE,
                            "Value",
                            value.0.box_clone(),
                        );
                    }
                }
            }
            true
        });
        *self.value_forward.lock().unwrap() = Some(watch);
        Ok(())
    }

    fn stop_value_forward(&self) {
        if let Some(watch) = self.value_forward.lock().unwrap().take() {
            let connection = self.connection.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = connection.remove_match(watch.token()).await;
                });
            }
        }
    }

    async fn start_notify(&self) -> Result<()> {
        match self.client.notify_acquired() {
            None => {
                self.client.start_notify().await?;
                self.start_value_forward().await
            }
            Some(true) => Ok(()),
            Some(false) => {
                let (fd, mtu) = self.client.acquire_notify(self.acquire_options()).await?;
                *self.mtu.lock().unwrap() = mtu;
                let stream = stream_from_fd(fd)?;
                log::debug!("Acquired notify socket for {} with MTU {}", &self.path, mtu);
                let this = self
                    .weak_self
                    .upgrade()
                    .ok_or_else(|| crate::Error::with_message(crate::ErrorKind::Failed, "link is gone"))?;
                self.notify_task.set(tokio::spawn(async move {
                    this.notify_reader(stream, mtu).await;
                }));
                Ok(())
            }
        }
    }

    /// Reads notification payloads from the socket until EOF.
    ///
    /// Each payload becomes the cached value, is signaled on the link path
    /// and confirmed to the remote characteristic.
    async fn notify_reader(self: Arc<Self>, mut stream: UnixStream, mtu: u16) {
        let mut buf = vec![0u8; mtu.max(1) as usize];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let value = buf[..n].to_vec();
                    self.client.props.cache("Value", Box::new(value.clone()));
                    emit_property_changed(&self.connection, &self.path, CHARACTERISTIC_INTERFACE, "Value", value);
                    if let Err(err) = self.client.confirm().await {
                        log::warn!("Confirm on {} failed: {}", &self.path, err);
                    }
                }
            }
        }
        log::debug!("Notify socket for {} closed", &self.path);
    }

    async fn stop_notify(&self) -> Result<()> {
        match self.client.notify_acquired() {
            None => {
                self.stop_value_forward();
                self.client.stop_notify().await
            }
            Some(true) => {
                self.notify_task.cancel();
                Ok(())
            }
            Some(false) => Ok(()),
        }
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(CHARACTERISTIC_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            cr_property!(ib, "UUID", link => {
                link.client.uuid().map(|uuid| uuid.to_string())
            });
            ib.property("Service").get(|ctx, _| Ok(parent_path(ctx.path())));
            cr_property!(ib, "Value", link => {
                Some(link.client.value())
            });
            cr_property!(ib, "Notifying", link => {
                Some(link.client.notifying())
            });
            cr_property!(ib, "Flags", link => {
                Some(link.client.flags())
            });
            cr_property!(ib, "WriteAcquired", link => {
                Some(link.client.write_acquired().unwrap_or(false))
            });
            cr_property!(ib, "NotifyAcquired", link => {
                Some(link.client.notify_acquired().unwrap_or(false))
            });
            cr_property!(ib, "MTU", link => {
                Some(link.mtu())
            });
            cr_property!(ib, "Handle", link => {
                Some(link.client.handle().unwrap_or_default())
            });
            ib.method_with_cr_async("ReadValue", ("options",), ("value",), |ctx, cr, (options,): (PropMap,)| {
                method_call(ctx, cr, |link: Arc<Self>| async move {
                    let value = link.client.read_value(options).await?;
                    Ok((value,))
                })
            });
            ib.method_with_cr_async(
                "WriteValue",
                ("value", "options"),
                (),
                |ctx, cr, (value, options): (Vec<u8>, PropMap)| {
                    method_call(ctx, cr, |link: Arc<Self>| async move {
                        link.write_value(value, options).await?;
                        Ok(())
                    })
                },
            );
            ib.method_with_cr_async("StartNotify", (), (), |ctx, cr, ()| {
                method_call(ctx, cr, |link: Arc<Self>| async move {
                    link.start_notify().await?;
                    Ok(())
                })
            });
            ib.method_with_cr_async("StopNotify", (), (), |ctx, cr, ()| {
                method_call(ctx, cr, |link: Arc<Self>| async move {
                    link.stop_notify().await?;
                    Ok(())
                })
            });
            ib.method_with_cr_async("Confirm", (), (), |ctx, cr, ()| {
                method_call(ctx, cr, |link: Arc<Self>| async move {
                    link.client.confirm().await?;
                    Ok(())
                })
            });
            ib.method_with_cr_async(
                "AcquireWrite",
                ("options",),
                ("fd", "mtu"),
                |ctx, cr, (options,): (PropMap,)| {
                    method_call(ctx, cr, |link: Arc<Self>| async move {
                        let (fd, mtu) = link.client.acquire_write(options).await?;
                        Ok((fd, mtu))
                    })
                },
            );
            ib.method_with_cr_async(
                "AcquireNotify",
                ("options",),
                ("fd", "mtu"),
                |ctx, cr, (options,): (PropMap,)| {
                    method_call(ctx, cr, |link: Arc<Self>| async move {
                        let (fd, mtu) = link.client.acquire_notify(options).await?;
                        Ok((fd, mtu))
                    })
                },
            );
        })
    }
}

impl Drop for CharacteristicLink {
    fn drop(&mut self) {
        self.stop_value_forward();
        self.notify_task.cancel();
    }
}

// ===========================================================================
// Descriptor link
// ===========================================================================

/// Server-side proxy of a registered GATT descriptor.
pub(crate) struct DescriptorLink {
    pub client: Arc<GattDescriptorClient>,
}

impl DescriptorLink {
    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(DESCRIPTOR_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            cr_property!(ib, "UUID", link => {
                link.client.uuid().map(|uuid| uuid.to_string())
            });
            ib.property("Characteristic").get(|ctx, _| Ok(parent_path(ctx.path())));
            cr_property!(ib, "Value", link => {
                Some(link.client.value())
            });
            cr_property!(ib, "Flags", link => {
                Some(link.client.flags())
            });
            cr_property!(ib, "Handle", link => {
                Some(link.client.handle().unwrap_or_default())
            });
            ib.method_with_cr_async("ReadValue", ("options",), ("value",), |ctx, cr, (options,): (PropMap,)| {
                method_call(ctx, cr, |link: Arc<Self>| async move {
                    let value = link.client.read_value(options).await?;
                    Ok((value,))
                })
            });
            ib.method_with_cr_async(
                "WriteValue",
                ("value", "options"),
                (),
                |ctx, cr, (value, options): (Vec<u8>, PropMap)| {
                    method_call(ctx, cr, |link: Arc<Self>| async move {
                        link.client.write_value(value, options).await?;
                        Ok(())
                    })
                },
            );
        })
    }
}

// ===========================================================================
// Link tree construction
// ===========================================================================

/// Exports the GATT applications of the represented adapter as link objects
/// under the connected device.
///
/// Link paths are stable derivations of handle values:
/// `.../dev_.../serviceHHHH/charHHHH/descHHHH` with lowercase zero-padded
/// hexadecimal handles.
pub(crate) async fn create_links(
    session: &Arc<SessionInner>, device: &Device, peer: &Adapter,
) -> Result<Vec<(Path<'static>, LinkKind)>> {
    let device_path = device.dbus_path().clone();
    let mut created = Vec::new();
    let mut cr = session.crossroads.lock().await;
    for app in peer.gatt_applications() {
        let mut service_paths: HashMap<Path<'static>, Path<'static>> = HashMap::new();
        for (client_path, service) in app.services() {
            let Some(handle) = service.handle() else { continue };
            let path = Path::new(format!("{}/service{:04x}", &device_path, handle)).unwrap();
            log::debug!("Exporting service link {}", &path);
            cr.insert(path.clone(), &[session.service_link_token], Arc::new(ServiceLink { client: service }));
            service_paths.insert(client_path, path.clone());
            created.push((path, LinkKind::Service));
        }
        let mut characteristic_paths: HashMap<Path<'static>, Path<'static>> = HashMap::new();
        for (client_path, characteristic) in app.characteristics() {
            let Some(handle) = characteristic.handle() else { continue };
            let Some(parent) = characteristic.service_path().and_then(|p| service_paths.get(&p).cloned()) else {
                continue;
            };
            let path = Path::new(format!("{}/char{:04x}", &parent, handle)).unwrap();
            log::debug!("Exporting characteristic link {}", &path);
            let link = CharacteristicLink::new(
                session.connection.clone(),
                characteristic,
                device_path.clone(),
                path.clone(),
            );
            cr.insert(path.clone(), &[session.characteristic_link_token], link);
            characteristic_paths.insert(client_path, path.clone());
            created.push((path, LinkKind::Characteristic));
        }
        for (_client_path, descriptor) in app.descriptors() {
            let Some(handle) = descriptor.handle() else { continue };
            let Some(parent) =
                descriptor.characteristic_path().and_then(|p| characteristic_paths.get(&p).cloned())
            else {
                continue;
            };
            let path = Path::new(format!("{}/desc{:04x}", &parent, handle)).unwrap();
            log::debug!("Exporting descriptor link {}", &path);
            cr.insert(path.clone(), &[session.descriptor_link_token], Arc::new(DescriptorLink { client: descriptor }));
            created.push((path, LinkKind::Descriptor));
        }
    }
    Ok(created)
}

/// Removes previously exported link objects, children first.
pub(crate) async fn remove_links(session: &Arc<SessionInner>, links: Vec<(Path<'static>, LinkKind)>) {
    if links.is_empty() {
        return;
    }
    let mut cr = session.crossroads.lock().await;
    for (path, kind) in links.into_iter().rev() {
        log::debug!("Removing link {}", &path);
        match kind {
            LinkKind::Service => {
                let _: Option<Arc<ServiceLink>> = cr.remove(&path);
            }
            LinkKind::Characteristic => {
                let _: Option<Arc<CharacteristicLink>> = cr.remove(&path);
            }
            LinkKind::Descriptor => {
                let _: Option<Arc<DescriptorLink>> = cr.remove(&path);
            }
        }
    }
}
