//! Service root: agent manager at `/org/bluez`.

use dbus::Path;
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken, MethodErr};
use std::{
    fmt,
    str::FromStr,
    sync::{Arc, Mutex as SyncMutex, Weak},
};
use strum::{Display, EnumString};

use crate::{method_call, session::SessionInner, task::TaskSlot, Error, ErrorKind, Result, TIMEOUT};

pub(crate) const MANAGER_INTERFACE: &str = "org.bluez.AgentManager1";
pub(crate) const AGENT_INTERFACE: &str = "org.bluez.Agent1";

/// Agent input and output capability.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Display, EnumString)]
pub enum AgentCapability {
    /// Can display but not receive input.
    DisplayOnly,
    /// Can display and answer yes/no questions.
    DisplayYesNo,
    /// Keyboard input only.
    KeyboardOnly,
    /// No user interface at all.
    NoInputNoOutput,
    /// Full keyboard and display.
    #[default]
    KeyboardDisplay,
}

/// Pairing agent registered by a bus client.
#[derive(Debug)]
pub(crate) struct AgentClient {
    /// Unique bus name of the owning client.
    pub client: String,
    /// Agent object path on the owning client.
    pub path: Path<'static>,
    pub capability: AgentCapability,
    pub lost_task: TaskSlot,
}

impl fmt::Display for AgentClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "agent[{} {} {}]", &self.client, &self.path, self.capability)
    }
}

impl AgentClient {
    /// Asks the agent to authorize an incoming connection from the device.
    pub async fn request_authorization(
        &self, connection: Arc<dbus::nonblock::SyncConnection>, device: Path<'static>,
    ) -> Result<()> {
        let proxy = dbus::nonblock::Proxy::new(self.client.clone(), self.path.clone(), TIMEOUT, connection);
        log::debug!("Requesting authorization for {} from {}", &device, self);
        proxy.method_call(AGENT_INTERFACE, "RequestAuthorization", (device,)).await.map_err(Error::from)
    }
}

/// Insertion-ordered registry of agents, at most one per bus client.
#[derive(Default)]
pub(crate) struct AgentRegistry {
    agents: Vec<Arc<AgentClient>>,
    default: Option<String>,
}

impl AgentRegistry {
    /// Registers an agent; the first one becomes default.
    pub fn register(&mut self, agent: Arc<AgentClient>) -> Result<()> {
        if self.agents.iter().any(|a| a.client == agent.client) {
            return Err(Error::with_message(ErrorKind::AlreadyExists, "Already Exists"));
        }
        if self.default.is_none() {
            log::info!("Setting {} as default agent", &agent);
            self.default = Some(agent.client.clone());
        }
        self.agents.push(agent);
        Ok(())
    }

    /// Removes the agent matching (client, path).
    ///
    /// If it was the default, the most recently registered remaining agent is
    /// promoted. Returns the removed agent and whether any agents remain.
    pub fn unregister(&mut self, client: &str, path: &Path) -> Result<(Arc<AgentClient>, bool)> {
        let pos = self
            .agents
            .iter()
            .position(|a| a.client == client && a.path == *path)
            .ok_or_else(|| Error::with_message(ErrorKind::DoesNotExist, "Does Not Exist"))?;
        let agent = self.agents.remove(pos);
        if self.default.as_deref() == Some(client) {
            self.default = self.agents.last().map(|a| a.client.clone());
            if let Some(promoted) = self.default_agent() {
                log::info!("Setting {} as default agent", &promoted);
            }
        }
        Ok((agent, !self.agents.is_empty()))
    }

    /// Makes the agent matching (client, path) the default.
    pub fn request_default(&mut self, client: &str, path: &Path) -> Result<()> {
        let agent = self
            .agents
            .iter()
            .find(|a| a.client == client && a.path == *path)
            .ok_or_else(|| Error::with_message(ErrorKind::DoesNotExist, "Does Not Exist"))?;
        log::info!("Setting {} as default agent", agent);
        self.default = Some(agent.client.clone());
        Ok(())
    }

    /// The current default agent.
    pub fn default_agent(&self) -> Option<Arc<AgentClient>> {
        let default = self.default.as_deref()?;
        self.agents.iter().find(|a| a.client == default).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// The `/org/bluez` object serving `org.bluez.AgentManager1`.
pub struct Root {
    weak_self: Weak<Root>,
    session: Weak<SessionInner>,
    registry: SyncMutex<AgentRegistry>,
}

impl Root {
    pub(crate) const PATH: &'static str = "/org/bluez";

    pub(crate) fn new(session: Weak<SessionInner>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            session,
            registry: SyncMutex::new(AgentRegistry::default()),
        })
    }

    fn session(&self) -> Result<Arc<SessionInner>> {
        self.session.upgrade().ok_or_else(|| Error::new(ErrorKind::Failed))
    }

    /// The current default agent.
    pub(crate) fn default_agent(&self) -> Option<Arc<AgentClient>> {
        self.registry.lock().unwrap().default_agent()
    }

    async fn register_agent(&self, client: String, path: Path<'static>, capability: String) -> Result<()> {
        let session = self.session()?;
        let capability = if capability.is_empty() {
            AgentCapability::default()
        } else {
            AgentCapability::from_str(&capability)
                .map_err(|_| Error::with_message(ErrorKind::InvalidArguments, format!("unknown capability {capability}")))?
        };

        let agent = Arc::new(AgentClient {
            client: client.clone(),
            path: path.clone(),
            capability,
            lost_task: TaskSlot::new(),
        });
        log::info!("Registering {}", &agent);
        self.registry.lock().unwrap().register(agent.clone())?;

        let lost_rx = session.client_lost(&client);
        let weak = self.weak_self.clone();
        agent.lost_task.set(tokio::spawn(async move {
            if lost_rx.await.is_ok() {
                log::debug!("Client {} lost, unregistering its agent", &client);
                if let Some(root) = weak.upgrade() {
                    let _ = root.unregister_agent(&client, &path).await;
                }
            }
        }));

        // With at least one agent registered, the adapters become pairable.
        for adapter in session.all_adapters() {
            if !adapter.is_pairable() {
                session.tasks.spawn(async move {
                    adapter.set_pairable(true);
                });
            }
        }
        Ok(())
    }

    async fn unregister_agent(&self, client: &str, path: &Path<'static>) -> Result<()> {
        let session = self.session()?;
        let (agent, any_left) = self.registry.lock().unwrap().unregister(client, path)?;
        log::info!("Unregistering {}", &agent);
        agent.lost_task.cancel();

        if !any_left {
            // Without agents the adapters cannot be pairable.
            for adapter in session.all_adapters() {
                session.tasks.spawn(async move {
                    adapter.set_pairable(false);
                });
            }
        }
        Ok(())
    }

    fn request_default_agent(&self, client: &str, path: &Path<'static>) -> Result<()> {
        self.registry.lock().unwrap().request_default(client, path)
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(MANAGER_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            ib.method_with_cr_async(
                "RegisterAgent",
                ("agent", "capability"),
                (),
                |ctx, cr, (path, capability): (Path<'static>, String)| {
                    let sender = ctx.message().sender().map(|s| s.to_string());
                    method_call(ctx, cr, |root: Arc<Self>| async move {
                        let sender = sender.ok_or_else(|| MethodErr::failed("message sender missing"))?;
                        root.register_agent(sender, path, capability).await?;
                        Ok(())
                    })
                },
            );
            ib.method_with_cr_async(
                "UnregisterAgent",
                ("agent",),
                (),
                |ctx, cr, (path,): (Path<'static>,)| {
                    let sender = ctx.message().sender().map(|s| s.to_string());
                    method_call(ctx, cr, |root: Arc<Self>| async move {
                        let sender = sender.ok_or_else(|| MethodErr::failed("message sender missing"))?;
                        root.unregister_agent(&sender, &path).await?;
                        Ok(())
                    })
                },
            );
            ib.method_with_cr_async(
                "RequestDefaultAgent",
                ("agent",),
                (),
                |ctx, cr, (path,): (Path<'static>,)| {
                    let sender = ctx.message().sender().map(|s| s.to_string());
                    method_call(ctx, cr, |root: Arc<Self>| async move {
                        let sender = sender.ok_or_else(|| MethodErr::failed("message sender missing"))?;
                        root.request_default_agent(&sender, &path)?;
                        Ok(())
                    })
                },
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent(client: &str, path: &str, capability: AgentCapability) -> Arc<AgentClient> {
        Arc::new(AgentClient {
            client: client.to_string(),
            path: Path::new(path).unwrap().into_static(),
            capability,
            lost_task: TaskSlot::new(),
        })
    }

    #[test]
    fn capability_parsing() {
        assert_eq!("NoInputNoOutput".parse::<AgentCapability>().unwrap(), AgentCapability::NoInputNoOutput);
        assert_eq!(AgentCapability::default(), AgentCapability::KeyboardDisplay);
        assert!("Bogus".parse::<AgentCapability>().is_err());
    }

    #[test]
    fn first_agent_becomes_default() {
        let mut reg = AgentRegistry::default();
        reg.register(test_agent(":1.1", "/agent", AgentCapability::NoInputNoOutput)).unwrap();
        reg.register(test_agent(":1.2", "/agent", AgentCapability::KeyboardDisplay)).unwrap();
        assert_eq!(reg.default_agent().unwrap().client, ":1.1");
    }

    #[test]
    fn one_agent_per_client() {
        let mut reg = AgentRegistry::default();
        reg.register(test_agent(":1.1", "/agent0", AgentCapability::NoInputNoOutput)).unwrap();
        let err = reg.register(test_agent(":1.1", "/agent1", AgentCapability::DisplayOnly)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
    }

    #[test]
    fn default_promotion_on_unregister() {
        let mut reg = AgentRegistry::default();
        reg.register(test_agent(":1.1", "/agent", AgentCapability::NoInputNoOutput)).unwrap();
        reg.register(test_agent(":1.2", "/agent", AgentCapability::NoInputNoOutput)).unwrap();
        reg.register(test_agent(":1.3", "/agent", AgentCapability::NoInputNoOutput)).unwrap();

        let (_, any_left) = reg.unregister(":1.1", &Path::new("/agent").unwrap()).unwrap();
        assert!(any_left);
        // The most recently registered agent is promoted.
        assert_eq!(reg.default_agent().unwrap().client, ":1.3");

        reg.unregister(":1.3", &Path::new("/agent").unwrap()).unwrap();
        assert_eq!(reg.default_agent().unwrap().client, ":1.2");
        let (_, any_left) = reg.unregister(":1.2", &Path::new("/agent").unwrap()).unwrap();
        assert!(!any_left);
        assert!(reg.default_agent().is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn unknown_agent_is_rejected() {
        let mut reg = AgentRegistry::default();
        reg.register(test_agent(":1.1", "/agent", AgentCapability::NoInputNoOutput)).unwrap();
        let err = reg.unregister(":1.1", &Path::new("/other").unwrap()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DoesNotExist);
        let err = reg.request_default(":1.9", &Path::new("/agent").unwrap()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DoesNotExist);
    }
}
