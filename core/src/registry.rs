//! Device registry: discovery bookkeeping
//!
//! Advertisements from the platform scanner are parsed and deduplicated by address.
//! The first sighting of an address creates a [`NodeSession`]; later sightings only
//! refresh its liveness and RSSI.

use crate::config::SdkConfig;
use crate::feature::FeatureRegistry;
use crate::listener::ListenerList;
use crate::protocol::parse;
use crate::session::NodeSession;
use crate::transport::{Advertisement, AdvertisementScanner, BleTransport};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub trait DiscoveryListener: Send + Sync {
    fn on_discovery_change(&self, registry: &DeviceRegistry, enabled: bool);

    fn on_node_discovered(&self, registry: &DeviceRegistry, node: &NodeSession);
}

#[derive(Default)]
struct DiscoveryState {
    active: bool,
    generation: u64,
    pump: Option<JoinHandle<()>>,
    timeout: Option<JoinHandle<()>>,
}

struct RegistryInner {
    me: Weak<RegistryInner>,
    scanner: Arc<dyn AdvertisementScanner>,
    transport: Arc<dyn BleTransport>,
    features: Arc<FeatureRegistry>,
    config: SdkConfig,
    nodes: Mutex<Vec<NodeSession>>,
    discovery: Mutex<DiscoveryState>,
    listeners: ListenerList<dyn DiscoveryListener>,
}

/// Known devices and the discovery loop; clones share the same registry
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new(
        scanner: Arc<dyn AdvertisementScanner>,
        transport: Arc<dyn BleTransport>,
        features: Arc<FeatureRegistry>,
        config: SdkConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| RegistryInner {
            me: me.clone(),
            scanner,
            transport,
            features,
            config,
            nodes: Mutex::new(Vec::new()),
            discovery: Mutex::new(DiscoveryState::default()),
            listeners: ListenerList::new(),
        });
        Self { inner }
    }

    pub fn config(&self) -> &SdkConfig {
        &self.inner.config
    }

    pub fn feature_registry(&self) -> &FeatureRegistry {
        &self.inner.features
    }

    pub fn is_discovering(&self) -> bool {
        self.inner.discovery.lock().active
    }

    /// Start scanning; stops by itself after `timeout` (`None` or zero: until stopped).
    ///
    /// False if a discovery is already running or the scanner refused to start.
    pub fn start_discovery(&self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.filter(|t| !t.is_zero());
        {
            let mut discovery = self.inner.discovery.lock();
            if discovery.active {
                return false;
            }
            let (sink, mut advertisements) = mpsc::unbounded_channel::<Advertisement>();
            if let Err(e) = self.inner.scanner.start_scan(sink) {
                warn!("Scanner refused to start: {}", e);
                return false;
            }
            discovery.active = true;
            discovery.generation += 1;
            let generation = discovery.generation;

            let registry = Weak::clone(&self.inner.me);
            discovery.pump = Some(tokio::spawn(async move {
                while let Some(advertisement) = advertisements.recv().await {
                    let Some(inner) = registry.upgrade() else {
                        break;
                    };
                    DeviceRegistry { inner }.handle_advertisement(advertisement);
                }
            }));

            discovery.timeout = timeout.map(|timeout| {
                let registry = Weak::clone(&self.inner.me);
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(inner) = registry.upgrade() {
                        DeviceRegistry { inner }.stop_generation(Some(generation));
                    }
                })
            });
        }
        info!("Discovery started (timeout {:?})", timeout);
        self.announce_discovery(true);
        true
    }

    /// Stop scanning; false if no discovery was running
    pub fn stop_discovery(&self) -> bool {
        self.stop_generation(None)
    }

    fn stop_generation(&self, generation: Option<u64>) -> bool {
        {
            let mut discovery = self.inner.discovery.lock();
            if !discovery.active || generation.is_some_and(|g| g != discovery.generation) {
                return false;
            }
            discovery.active = false;
            if let Some(task) = discovery.timeout.take() {
                if generation.is_none() {
                    task.abort();
                }
            }
            if let Some(task) = discovery.pump.take() {
                task.abort();
            }
            self.inner.scanner.stop_scan();
        }
        info!("Discovery stopped");
        self.announce_discovery(false);
        true
    }

    /// Stop discovery and forget every device that is not bonded
    pub fn reset_discovery(&self) {
        self.stop_discovery();
        let removed: Vec<NodeSession> = {
            let mut nodes = self.inner.nodes.lock();
            let (kept, removed): (Vec<NodeSession>, Vec<NodeSession>) =
                nodes.drain(..).partition(NodeSession::is_bonded);
            *nodes = kept;
            removed
        };
        for node in &removed {
            node.disconnect();
        }
        debug!("Reset discovery, dropped {} devices", removed.len());
    }

    /// Handle one received advertisement; returns the session if the address is new
    pub fn handle_advertisement(&self, advertisement: Advertisement) -> Option<NodeSession> {
        let descriptor = match parse(&advertisement.data) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!("Ignoring advertisement from {}: {}", advertisement.address, e);
                return None;
            }
        };

        // the lookup and the insert share one lock so racing sightings build one session
        let mut nodes = self.inner.nodes.lock();
        let known = nodes
            .iter()
            .find(|n| n.tag() == advertisement.address)
            .cloned();
        if let Some(node) = known {
            drop(nodes);
            node.update_rssi(advertisement.rssi);
            return None;
        }
        let features = self.inner.features.build_for_device(&descriptor);
        let node = NodeSession::new(
            advertisement.address,
            descriptor,
            features,
            Arc::clone(&self.inner.transport),
            self.inner.config.clone(),
        );
        nodes.push(node.clone());
        drop(nodes);

        node.update_rssi(advertisement.rssi);
        info!("Discovered {}", node);
        self.announce_node(node.clone());
        Some(node)
    }

    /// Track a session; false if one with the same address is already known
    pub fn add_node(&self, node: NodeSession) -> bool {
        {
            let mut nodes = self.inner.nodes.lock();
            if nodes.iter().any(|n| n.tag() == node.tag()) {
                return false;
            }
            nodes.push(node.clone());
        }
        self.announce_node(node);
        true
    }

    pub fn remove_node(&self, tag: &str) -> Option<NodeSession> {
        let mut nodes = self.inner.nodes.lock();
        let index = nodes.iter().position(|n| n.tag() == tag)?;
        Some(nodes.remove(index))
    }

    pub fn nodes(&self) -> Vec<NodeSession> {
        self.inner.nodes.lock().clone()
    }

    pub fn node_with_tag(&self, tag: &str) -> Option<NodeSession> {
        self.inner
            .nodes
            .lock()
            .iter()
            .find(|n| n.tag() == tag)
            .cloned()
    }

    pub fn node_with_name(&self, name: &str) -> Option<NodeSession> {
        self.inner
            .nodes
            .lock()
            .iter()
            .find(|n| n.name() == Some(name))
            .cloned()
    }

    pub fn add_listener(&self, listener: &Arc<dyn DiscoveryListener>) -> bool {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DiscoveryListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    fn handle(&self) -> Option<DeviceRegistry> {
        self.inner.me.upgrade().map(|inner| DeviceRegistry { inner })
    }

    fn announce_node(&self, node: NodeSession) {
        if let Some(registry) = self.handle() {
            self.inner
                .listeners
                .dispatch(move |l| l.on_node_discovered(&registry, &node));
        }
    }

    fn announce_discovery(&self, enabled: bool) {
        if let Some(registry) = self.handle() {
            self.inner
                .listeners
                .dispatch(move |l| l.on_discovery_change(&registry, enabled));
        }
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("nodes", &self.inner.nodes.lock().len())
            .field("discovering", &self.is_discovering())
            .finish()
    }
}
