//! Property caches for objects served by bus clients.
//!
//! Every object a client registers with the mock (agents, advertisements,
//! GATT nodes, media endpoints) is mirrored locally: all properties are
//! fetched once at registration time and updated from PropertiesChanged
//! signals afterwards, so the engine can read them synchronously.

use dbus::{
    arg::{prop_cast, ArgType, PropMap, RefArg, Variant},
    message::{MatchRule, SignalArgs},
    nonblock::{
        stdintf::org_freedesktop_dbus::{Properties, PropertiesPropertiesChanged},
        MsgMatch, Proxy, SyncConnection,
    },
    Path,
};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use crate::{Error, ErrorKind, Result, TIMEOUT};

/// Local mirror of the properties of one remote interface.
pub(crate) struct RemoteProperties {
    connection: Arc<SyncConnection>,
    /// Unique bus name of the owning client.
    pub dest: String,
    /// Object path on the owning client.
    pub path: Path<'static>,
    interface: &'static str,
    values: Arc<Mutex<PropMap>>,
    watch: Mutex<Option<MsgMatch>>,
}

impl fmt::Debug for RemoteProperties {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RemoteProperties {{ {} {} {} }}", &self.dest, &self.path, self.interface)
    }
}

impl RemoteProperties {
    /// Fetches all properties of the remote object and subscribes to changes.
    ///
    /// Fails with [ErrorKind::Failed] when the initial fetch is not possible,
    /// aborting the registration that requested the mirror.
    pub async fn new(
        connection: Arc<SyncConnection>, dest: &str, path: Path<'static>, interface: &'static str,
    ) -> Result<Self> {
        let proxy = Proxy::new(dest.to_string(), path.clone(), TIMEOUT, connection.clone());
        let all = proxy.get_all(interface).await.map_err(|err| {
            Error::with_message(ErrorKind::Failed, format!("cannot fetch properties of {}: {}", &path, err))
        })?;
        log::trace!("{} {}: fetched {} properties of {}", dest, &path, all.len(), interface);
        let values = Arc::new(Mutex::new(all));

        let rule = MatchRule::new_signal(PropertiesPropertiesChanged::INTERFACE, PropertiesPropertiesChanged::NAME)
            .with_sender(dest.to_string())
            .with_path(path.clone());
        let cache = values.clone();
        let iface = interface;
        let watch = connection.add_match(rule).await?.msg_cb(move |msg| {
            if let Some(ppc) = PropertiesPropertiesChanged::from_message(&msg) {
                if ppc.interface_name == iface {
                    let mut values = cache.lock().unwrap();
                    for (name, value) in ppc.changed_properties {
                        values.insert(name, value);
                    }
                    for name in ppc.invalidated_properties {
                        values.remove(&name);
                    }
                }
            }
            true
        });

        Ok(Self {
            connection,
            dest: dest.to_string(),
            path,
            interface,
            values,
            watch: Mutex::new(Some(watch)),
        })
    }

    /// Proxy for calling methods on the mirrored object.
    pub fn proxy(&self) -> Proxy<'_, Arc<SyncConnection>> {
        Proxy::new(self.dest.clone(), self.path.clone(), TIMEOUT, self.connection.clone())
    }

    /// Cached property value.
    pub fn get<T>(&self, name: &str) -> Option<T>
    where
        T: Clone + 'static,
    {
        let values = self.values.lock().unwrap();
        prop_cast::<T>(&values, name).cloned()
    }

    /// Cached property value or the default when absent.
    pub fn get_or<T>(&self, name: &str, default: T) -> T
    where
        T: Clone + 'static,
    {
        self.get(name).unwrap_or(default)
    }

    /// Runs a closure over the raw cached value of a property.
    pub fn with_value<R>(&self, name: &str, f: impl FnOnce(&dyn RefArg) -> R) -> Option<R> {
        let values = self.values.lock().unwrap();
        values.get(name).map(|v| f(&v.0))
    }

    /// Updates the local cache only, without touching the remote object.
    pub fn cache(&self, name: &str, value: Box<dyn RefArg>) {
        let mut values = self.values.lock().unwrap();
        values.insert(name.to_string(), Variant(value));
    }

    /// Writes a property on the remote object and mirrors it locally.
    pub async fn set_remote<T>(&self, name: &str, value: T) -> Result<()>
    where
        T: dbus::arg::Arg + dbus::arg::Append + RefArg + Clone + 'static,
    {
        log::trace!("{} {}: {}.{} := {:?}", &self.dest, &self.path, self.interface, name, &value);
        self.proxy().set(self.interface, name, value.clone()).await?;
        self.cache(name, Box::new(value));
        Ok(())
    }
}

impl Drop for RemoteProperties {
    fn drop(&mut self) {
        if let Some(watch) = self.watch.lock().unwrap().take() {
            let connection = self.connection.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = connection.remove_match(watch.token()).await;
                });
            }
        }
    }
}

/// Unwraps a variant to its inner value.
fn unwrap_variant(v: &dyn RefArg) -> Box<dyn RefArg> {
    if v.arg_type() == ArgType::Variant {
        if let Some(mut iter) = v.as_iter() {
            if let Some(inner) = iter.next() {
                return inner.box_clone();
            }
        }
    }
    v.box_clone()
}

/// Reads a byte array from a (possibly variant-wrapped) argument.
pub(crate) fn arg_as_bytes(v: &dyn RefArg) -> Option<Vec<u8>> {
    let v = unwrap_variant(v);
    if let Some(bytes) = dbus::arg::cast::<Vec<u8>>(&v) {
        return Some(bytes.clone());
    }
    let mut out = Vec::new();
    for item in v.as_iter()? {
        out.push(item.as_u64()? as u8);
    }
    Some(out)
}

/// Decodes an `a{sv}` dictionary of byte arrays, e.g. service data.
pub(crate) fn string_bytes_map(v: &dyn RefArg) -> HashMap<String, Vec<u8>> {
    let mut map = HashMap::new();
    if let Some(mut iter) = v.as_iter() {
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            if let (Some(key), Some(value)) = (key.as_str(), arg_as_bytes(value)) {
                map.insert(key.to_string(), value);
            }
        }
    }
    map
}

/// Decodes an `a{qv}` dictionary of byte arrays, e.g. manufacturer data.
pub(crate) fn u16_bytes_map(v: &dyn RefArg) -> HashMap<u16, Vec<u8>> {
    let mut map = HashMap::new();
    if let Some(mut iter) = v.as_iter() {
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            if let (Some(key), Some(value)) = (key.as_u64(), arg_as_bytes(value)) {
                map.insert(key as u16, value);
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_from_plain_and_variant_args() {
        let plain: Box<dyn RefArg> = Box::new(vec![1u8, 2, 3]);
        assert_eq!(arg_as_bytes(&*plain), Some(vec![1, 2, 3]));

        let wrapped: Box<dyn RefArg> = Box::new(Variant(Box::new(vec![4u8, 5]) as Box<dyn RefArg>));
        assert_eq!(arg_as_bytes(&*wrapped), Some(vec![4, 5]));
    }

    #[test]
    fn string_bytes_map_decodes_dict() {
        let mut dict: HashMap<String, Variant<Box<dyn RefArg>>> = HashMap::new();
        dict.insert("0000fff1".to_string(), Variant(Box::new(vec![0xdeu8, 0xad])));
        let boxed: Box<dyn RefArg> = Box::new(dict);
        let map = string_bytes_map(&*boxed);
        assert_eq!(map.get("0000fff1"), Some(&vec![0xde, 0xad]));
    }
}
