//! Media manager.

use dbus::{arg::PropMap, Path};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken, MethodErr};
use std::{fmt, sync::Arc};
use uuid::Uuid;

use crate::{adapter::Adapter, method_call, proxy::RemoteProperties, task::TaskSlot, UuidExt};

pub(crate) const INTERFACE: &str = "org.bluez.Media1";
pub(crate) const ENDPOINT_INTERFACE: &str = "org.bluez.MediaEndpoint1";

/// Media endpoint registered by a bus client, mirrored locally.
pub(crate) struct MediaEndpointClient {
    pub props: RemoteProperties,
    pub lost_task: TaskSlot,
}

impl fmt::Debug for MediaEndpointClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "endpoint[{} {}]", &self.props.dest, &self.props.path)
    }
}

/// Registers the `org.bluez.Media1` interface served on every adapter object.
pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Adapter>> {
    cr.register(INTERFACE, |ib: &mut IfaceBuilder<Arc<Adapter>>| {
        cr_property!(ib, "SupportedUUIDs", _adapter => {
            Some(vec![Uuid::from_u16(0x110a).to_string(), Uuid::from_u16(0x110b).to_string()])
        });
        cr_property!(ib, "SupportedFeatures", _adapter => {
            Some(Vec::<String>::new())
        });
        ib.method_with_cr_async(
            "RegisterEndpoint",
            ("endpoint", "properties"),
            (),
            |ctx, cr, (path, _properties): (Path<'static>, PropMap)| {
                let sender = ctx.message().sender().map(|s| s.to_string());
                method_call(ctx, cr, |adapter: Arc<Adapter>| async move {
                    let sender = sender.ok_or_else(|| MethodErr::failed("message sender missing"))?;
                    adapter.add_media_endpoint(&sender, path).await?;
                    Ok(())
                })
            },
        );
        ib.method_with_cr_async(
            "UnregisterEndpoint",
            ("endpoint",),
            (),
            |ctx, cr, (path,): (Path<'static>,)| {
                let sender = ctx.message().sender().map(|s| s.to_string());
                method_call(ctx, cr, |adapter: Arc<Adapter>| async move {
                    let sender = sender.ok_or_else(|| MethodErr::failed("message sender missing"))?;
                    adapter.del_media_endpoint(&sender, &path)?;
                    Ok(())
                })
            },
        );
        ib.method_with_cr_async(
            "RegisterApplication",
            ("application", "options"),
            (),
            |ctx, cr, (path, _options): (Path<'static>, PropMap)| {
                let sender = ctx.message().sender().map(|s| s.to_string());
                method_call(ctx, cr, |_adapter: Arc<Adapter>| async move {
                    // Media applications are accepted but otherwise ignored.
                    log::debug!("Client {:?} registered media application {}", sender, path);
                    Ok(())
                })
            },
        );
        ib.method_with_cr_async(
            "UnregisterApplication",
            ("application",),
            (),
            |ctx, cr, (path,): (Path<'static>,)| {
                let sender = ctx.message().sender().map(|s| s.to_string());
                method_call(ctx, cr, |_adapter: Arc<Adapter>| async move {
                    log::debug!("Client {:?} unregistered media application {}", sender, path);
                    Ok(())
                })
            },
        );
    })
}
