//! GATT registration and relay.

use dbus::{arg::PropMap, Path};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken, MethodErr};
use std::sync::Arc;

use crate::{adapter::Adapter, method_call};

pub(crate) mod application;
pub(crate) mod link;

pub(crate) const MANAGER_INTERFACE: &str = "org.bluez.GattManager1";
pub(crate) const SERVICE_INTERFACE: &str = "org.bluez.GattService1";
pub(crate) const CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";
pub(crate) const DESCRIPTOR_INTERFACE: &str = "org.bluez.GattDescriptor1";

/// Registers the `org.bluez.GattManager1` interface served on every adapter
/// object.
pub(crate) fn register_manager_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Adapter>> {
    cr.register(MANAGER_INTERFACE, |ib: &mut IfaceBuilder<Arc<Adapter>>| {
        ib.method_with_cr_async(
            "RegisterApplication",
            ("application", "options"),
            (),
            |ctx, cr, (path, _options): (Path<'static>, PropMap)| {
                let sender = ctx.message().sender().map(|s| s.to_string());
                method_call(ctx, cr, |adapter: Arc<Adapter>| async move {
                    let sender = sender.ok_or_else(|| MethodErr::failed("message sender missing"))?;
                    adapter.add_gatt_application(&sender, path).await?;
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
                method_call(ctx, cr, |adapter: Arc<Adapter>| async move {
                    let sender = sender.ok_or_else(|| MethodErr::failed("message sender missing"))?;
                    adapter.del_gatt_application(&sender, &path)?;
                    Ok(())
                })
            },
        );
    })
}
