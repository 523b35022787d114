//! # BlueZoo — BlueZ D-Bus daemon mock
//!
//! This crate claims the well-known bus name `org.bluez` and serves the same
//! object hierarchy, interfaces, methods, properties and signals as the real
//! Linux Bluetooth daemon, so that unaltered Bluetooth clients can be driven
//! against it without any hardware.
//!
//! A [Session] hosts any number of virtual adapters. Adapters discover each
//! other through a periodic scanner, exchange LE advertisements, pair and
//! connect. GATT applications registered by one client are relayed to devices
//! connected from another adapter, including file-descriptor backed write and
//! notify sockets.
//!
//! There is no radio, baseband or HCI behavior and no persistent storage of
//! pairings; authentication is a yes/no gate driven by the registered agent's
//! capability.

#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("BlueZoo only supports the Linux operating system.");

use dbus::{
    arg::{AppendAll, PropMap, RefArg, Variant},
    channel::Sender,
    message::SignalArgs,
    nonblock::{stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged, SyncConnection},
    Path,
};
use dbus_crossroads::{Context, Crossroads};
use futures::Future;
use macaddr::MacAddr6;
use std::{
    fmt::{self, Debug, Display, Formatter},
    marker::PhantomData,
    ops::{Deref, DerefMut},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use strum::{EnumString, IntoStaticStr};
use tokio::task::JoinError;

pub(crate) const SERVICE_NAME: &str = "org.bluez";
pub(crate) const ERR_PREFIX: &str = "org.bluez.Error.";
pub(crate) const TIMEOUT: Duration = Duration::from_secs(120);

macro_rules! cr_property {
    ($ib:expr, $dbus_name:expr, $obj:ident => $get:block) => {
        $ib.property($dbus_name).get(|ctx, $obj| {
            let value = $get;
            log::trace!("{}: {}.{} = {:?}", ctx.path(), ctx.interface(), &$dbus_name, &value);
            match value {
                Some(v) => Ok(v),
                None => Err(dbus_crossroads::MethodErr::no_property($dbus_name)),
            }
        })
    };
}

mod adapter;
mod adv;
mod device;
mod gatt;
mod media;
mod proxy;
mod root;
mod scanner;
mod session;
mod task;
mod uuid_ext;

pub use crate::session::{BusKind, Session};
pub use uuid_ext::UuidExt;

#[doc(no_inline)]
pub use uuid::Uuid;

/// Bluetooth error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed error message.
    pub message: String,
}

/// Bluetooth error kind.
///
/// The variant name is the `org.bluez.Error.*` suffix used on the bus.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, EnumString, IntoStaticStr)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bluetooth device already connected
    AlreadyConnected,
    /// Bluetooth object already exists
    AlreadyExists,
    /// Bluetooth authentication canceled
    AuthenticationCanceled,
    /// Bluetooth authentication failed
    AuthenticationFailed,
    /// Bluetooth authentication rejected
    AuthenticationRejected,
    /// Bluetooth authentication timeout
    AuthenticationTimeout,
    /// Bluetooth operation canceled
    Canceled,
    /// Bluetooth connection attempt failed
    ConnectionAttemptFailed,
    /// Bluetooth object does not exist
    DoesNotExist,
    /// Bluetooth operation failed
    Failed,
    /// Bluetooth operation in progress
    InProgress,
    /// invalid arguments for Bluetooth operation
    InvalidArguments,
    /// the data provided is of invalid length
    InvalidLength,
    /// invalid offset for Bluetooth GATT property
    InvalidOffset,
    /// invalid value length for Bluetooth GATT property
    InvalidValueLength,
    /// Bluetooth operation not available
    NotAvailable,
    /// Bluetooth operation not authorized
    NotAuthorized,
    /// Bluetooth device not connected
    NotConnected,
    /// Bluetooth operation not permitted
    NotPermitted,
    /// Bluetooth device not ready
    NotReady,
    /// Bluetooth operation not supported
    NotSupported,
    /// Bluetooth request rejected
    Rejected,
    /// invalid Bluetooth address: {0}
    #[strum(disabled)]
    InvalidAddress(String),
    /// internal error: {0}
    #[strum(disabled)]
    Internal(InternalErrorKind),
}

/// Internal Bluetooth error kind.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq)]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// invalid UUID: {0}
    InvalidUuid(String),
    /// invalid value
    InvalidValue,
    /// key {0} is missing
    MissingKey(String),
    /// join error
    JoinError,
    /// IO error {0:?}
    Io(std::io::ErrorKind),
    /// D-Bus error {0}
    DBus(String),
    /// lost connection to D-Bus
    DBusConnectionLost,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl ErrorKind {
    /// The `org.bluez.Error.*` suffix of this error kind.
    fn wire_name(&self) -> &'static str {
        match self {
            Self::InvalidAddress(_) => "InvalidArguments",
            Self::Internal(_) => "Failed",
            other => other.into(),
        }
    }
}

impl From<dbus::Error> for Error {
    fn from(err: dbus::Error) -> Self {
        log::trace!("DBus error {}: {}", err.name().unwrap_or_default(), err.message().unwrap_or_default());
        let kind = match err
            .name()
            .and_then(|name| name.strip_prefix(ERR_PREFIX))
            .and_then(|s| ErrorKind::from_str(s).ok())
        {
            Some(kind) => kind,
            _ => ErrorKind::Internal(InternalErrorKind::DBus(err.name().unwrap_or_default().to_string())),
        };
        Self { kind, message: err.message().unwrap_or_default().to_string() }
    }
}

impl From<Error> for dbus::MethodErr {
    fn from(err: Error) -> Self {
        Self::from((format!("{}{}", ERR_PREFIX, err.kind.wire_name()), &err.to_string()))
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        if err.is_cancelled() {
            Self::new(ErrorKind::Canceled)
        } else {
            Self { kind: ErrorKind::Internal(InternalErrorKind::JoinError), message: err.to_string() }
        }
    }
}

impl From<strum::ParseError> for Error {
    fn from(_: strum::ParseError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::InvalidValue), message: String::new() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::Io(err.kind())), message: err.to_string() }
    }
}

impl From<InvalidAddress> for Error {
    fn from(err: InvalidAddress) -> Self {
        Self::new(ErrorKind::InvalidAddress(err.0))
    }
}

/// Bluetooth result.
pub type Result<T> = std::result::Result<T, Error>;

/// Bluetooth address.
///
/// Displays in canonical colon-hexadecimal notation with uppercase digits.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates a new Bluetooth address with the specified value.
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Object path component of this address, e.g. `dev_00_11_22_33_44_55`.
    pub(crate) fn to_path_component(self) -> String {
        format!(
            "dev_{:02X}_{:02X}_{:02X}_{:02X}_{:02X}_{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Deref for Address {
    type Target = [u8; 6];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Address {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<MacAddr6> for Address {
    fn from(addr: MacAddr6) -> Self {
        Self(addr.into_array())
    }
}

impl From<Address> for MacAddr6 {
    fn from(addr: Address) -> Self {
        addr.0.into()
    }
}

impl From<[u8; 6]> for Address {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<Address> for [u8; 6] {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Invalid Bluetooth address error.
#[derive(Debug, Clone)]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "invalid Bluetooth address: {}", &self.0)
    }
}

impl std::error::Error for InvalidAddress {}

impl FromStr for Address {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> std::result::Result<Self, InvalidAddress> {
        let fields = s
            .split(':')
            .map(|octet| {
                if octet.len() != 2 {
                    Err(InvalidAddress(s.to_string()))
                } else {
                    u8::from_str_radix(octet, 16).map_err(|_| InvalidAddress(s.to_string()))
                }
            })
            .collect::<std::result::Result<Vec<_>, InvalidAddress>>()?;
        Ok(Self(fields.try_into().map_err(|_| InvalidAddress(s.to_string()))?))
    }
}

/// Result of calling one of our D-Bus methods.
pub(crate) type DbusResult<T> = std::result::Result<T, dbus::MethodErr>;

/// Call method on Arc D-Bus object we are serving.
pub(crate) fn method_call<
    T: Send + Sync + 'static,
    R: AppendAll + fmt::Debug,
    F: Future<Output = DbusResult<R>> + Send + 'static,
>(
    mut ctx: Context, cr: &mut Crossroads, f: impl FnOnce(Arc<T>) -> F,
) -> impl Future<Output = PhantomData<R>> {
    let data_ref: &mut Arc<T> = cr.data_mut(ctx.path()).unwrap();
    let data: Arc<T> = data_ref.clone();
    async move {
        if log::log_enabled!(log::Level::Trace) {
            let mut args = Vec::new();
            let mut arg_iter = ctx.message().iter_init();
            while let Some(value) = arg_iter.get_refarg() {
                args.push(format!("{value:?}"));
                arg_iter.next();
            }
            log::trace!(
                "{}: {}.{} ({})",
                ctx.path(),
                ctx.interface().map(|i| i.to_string()).unwrap_or_default(),
                ctx.method(),
                args.join(", ")
            );
        }
        let result = f(data).await;
        log::trace!(
            "{}: {}.{} (...) -> {:?}",
            ctx.path(),
            ctx.interface().map(|i| i.to_string()).unwrap_or_default(),
            ctx.method(),
            &result
        );
        ctx.reply(result)
    }
}

/// Returns the parent path of the specified D-Bus path.
pub(crate) fn parent_path<'a>(path: &Path<'a>) -> Path<'a> {
    let mut comps: Vec<_> = path.split('/').collect();
    comps.pop();
    if comps.is_empty() {
        Path::new("/").unwrap()
    } else {
        Path::new(comps.join("/")).unwrap()
    }
}

/// Emits a PropertiesChanged signal for the specified served object.
pub(crate) fn emit_properties_changed(
    connection: &SyncConnection, path: &Path<'static>, interface: &str, changed: PropMap,
) {
    let ppc = PropertiesPropertiesChanged {
        interface_name: interface.to_string(),
        changed_properties: changed,
        invalidated_properties: Vec::new(),
    };
    log::trace!("{}: {} {:?}", path, interface, &ppc.changed_properties);
    let msg = ppc.to_emit_message(path);
    let _ = connection.send(msg);
}

/// Emits a PropertiesChanged signal for a single property.
pub(crate) fn emit_property_changed<T: RefArg + 'static>(
    connection: &SyncConnection, path: &Path<'static>, interface: &str, name: &str, value: T,
) {
    let mut changed = PropMap::new();
    changed.insert(name.to_string(), Variant(Box::new(value)));
    emit_properties_changed(connection, path, interface, changed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parse_canonical() {
        let addr: Address = "00:11:22:aa:bb:cc".parse().unwrap();
        assert_eq!(addr, Address::new([0x00, 0x11, 0x22, 0xaa, 0xbb, 0xcc]));
        assert_eq!(addr.to_string(), "00:11:22:AA:BB:CC");
        let round: Address = addr.to_string().parse().unwrap();
        assert_eq!(round, addr);
    }

    #[test]
    fn address_parse_rejects_malformed() {
        for s in ["", "00:11:22:33:44", "00:11:22:33:44:55:66", "0:11:22:33:44:55", "g0:11:22:33:44:55", "001122334455"] {
            assert!(s.parse::<Address>().is_err(), "accepted {s:?}");
        }
    }

    #[test]
    fn address_path_component() {
        let addr: Address = "00:00:00:11:11:11".parse().unwrap();
        assert_eq!(addr.to_path_component(), "dev_00_00_00_11_11_11");
    }

    #[test]
    fn error_wire_names() {
        assert_eq!(ErrorKind::NotPermitted.wire_name(), "NotPermitted");
        assert_eq!(ErrorKind::DoesNotExist.wire_name(), "DoesNotExist");
        assert_eq!(ErrorKind::InvalidAddress("x".into()).wire_name(), "InvalidArguments");
        let err: Error = dbus::Error::new_custom("org.bluez.Error.AlreadyExists", "dup").into();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
    }
}
