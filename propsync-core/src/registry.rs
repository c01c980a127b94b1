//! Property registry.
//!
//! A registry owns the declared property table for one shared segment name.
//! The master creates the segment and listens for slaves; a slave connects to
//! the master and attaches the segment read-only once the connection is up.
//!
//! Both sides must declare the same properties in the same order. The
//! segment fingerprint catches mismatches before any slot is trusted.

use crate::config::Config;
use crate::error::{PropertyError, RegistryError, SegmentError};
use crate::flags::PropertyFlags;
use crate::link::{Link, MasterLink, SlaveLink};
use crate::property::{Client, ErasedProperty, Property, Role, Server};
use crate::segment::{Fingerprint, Layout, Segment};
use crate::value::PropertyValue;
use parking_lot::RwLock;
use propsync_protocol::{PropertyId, Request, INVALID_PROPERTY_ID};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// State shared between the registry, its properties and its link.
pub(crate) struct Shared {
    name: String,
    is_server: bool,
    layout: OnceLock<Layout>,
    table: OnceLock<Vec<Arc<dyn ErasedProperty>>>,
    segment: RwLock<Option<Segment>>,
    link: OnceLock<Arc<dyn Link>>,
    closed: AtomicBool,
}

impl Shared {
    fn new(name: &str, is_server: bool) -> Self {
        Self {
            name: name.to_string(),
            is_server,
            layout: OnceLock::new(),
            table: OnceLock::new(),
            segment: RwLock::new(None),
            link: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn install(&self, table: Vec<Arc<dyn ErasedProperty>>) -> Layout {
        let layout = Layout::new(table.iter().map(|p| p.wire_size()));
        let _ = self.layout.set(layout.clone());
        let _ = self.table.set(table);
        layout
    }

    fn table(&self) -> &[Arc<dyn ErasedProperty>] {
        self.table.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn property_count(&self) -> usize {
        self.table().len()
    }

    pub(crate) fn link(&self) -> Option<&Arc<dyn Link>> {
        self.link.get()
    }

    pub(crate) fn property(&self, id: PropertyId) -> Result<&Arc<dyn ErasedProperty>, PropertyError> {
        let table = self.table();
        table.get(usize::from(id)).ok_or(PropertyError::InvalidId {
            id,
            count: table.len(),
        })
    }

    /// Reads a property's slot, if a segment is mapped.
    pub(crate) fn read_slot(&self, id: PropertyId) -> Option<u64> {
        let offset = self.layout.get()?.offset(id)?;
        self.segment.read().as_ref()?.read_slot(offset)
    }

    /// Writes a property's slot. Only succeeds on the master.
    pub(crate) fn write_slot(&self, id: PropertyId, value: u64) -> bool {
        let Some(offset) = self.layout.get().and_then(|l| l.offset(id)) else {
            return false;
        };
        self.segment
            .read()
            .as_ref()
            .map_or(false, |segment| segment.write_slot(offset, value))
    }

    pub(crate) fn request_received(
        &self,
        id: PropertyId,
        request: Request,
    ) -> Result<(), PropertyError> {
        tracing::debug!("{}: {:?} for property {}", self.name, request.op_code(), id);
        self.property(id)?.request_received(request)
    }

    pub(crate) fn change_notification_received(&self, id: PropertyId) -> Result<(), PropertyError> {
        tracing::debug!("{}: property {} changed", self.name, id);
        self.property(id)?.change_notification_received()
    }

    /// Maps the master's segment and resubscribes properties that need it.
    ///
    /// On a fingerprint mismatch the master is told the slave is
    /// incompatible and every read falls back to local values.
    pub(crate) fn attach_shared_memory(&self) -> Result<(), RegistryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::ShutDown);
        }
        let Some(layout) = self.layout.get() else {
            return Err(RegistryError::ShutDown);
        };

        match Segment::open(&self.name, layout) {
            Ok(segment) => {
                *self.segment.write() = Some(segment);
            }
            Err(e) => {
                self.detach_shared_memory();
                let err = RegistryError::from(e);
                if err.is_incompatible() {
                    tracing::error!("Refusing to attach {}: {}", self.name, err);
                    if let Some(link) = self.link() {
                        link.send_request(0, &Request::ReportIncompatible);
                    }
                } else {
                    tracing::warn!("Cannot attach {}: {}", self.name, err);
                }
                return Err(err);
            }
        }

        tracing::info!("Attached shared segment {}", self.name);
        for property in self.table() {
            property.on_connected_client();
        }
        Ok(())
    }

    /// Unmaps the segment; reads fall back to local values.
    pub(crate) fn detach_shared_memory(&self) {
        if self.is_server {
            return;
        }
        if self.segment.write().take().is_some() {
            tracing::info!("Detached shared segment {}", self.name);
        }
    }

    fn is_attached(&self) -> bool {
        self.segment.read().is_some()
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(link) = self.link() {
            link.shutdown();
        }
        self.segment.write().take();
        tracing::info!("Registry {} shut down", self.name);
    }
}

/// Collects property declarations for a registry.
///
/// Ids are assigned in declaration order, starting at 0.
pub struct Declarations<R: Role> {
    shared: Weak<Shared>,
    table: Vec<Arc<dyn ErasedProperty>>,
    _role: PhantomData<R>,
}

impl<R: Role> Declarations<R> {
    fn collect<P>(
        shared: &Arc<Shared>,
        declare: impl FnOnce(&mut Self) -> P,
    ) -> Result<(P, Vec<Arc<dyn ErasedProperty>>), RegistryError> {
        let mut declarations = Self {
            shared: Arc::downgrade(shared),
            table: Vec::new(),
            _role: PhantomData,
        };
        let properties = declare(&mut declarations);
        if declarations.table.len() >= usize::from(INVALID_PROPERTY_ID) {
            return Err(RegistryError::TooManyProperties(declarations.table.len()));
        }
        Ok((properties, declarations.table))
    }

    /// Declares a property with no flags.
    pub fn declare<V: PropertyValue>(&mut self, initial: V) -> Property<V, R> {
        self.declare_with_flags(initial, PropertyFlags::empty())
    }

    /// Declares a property. Values that do not fit a shared slot always
    /// use a local copy.
    pub fn declare_with_flags<V: PropertyValue>(
        &mut self,
        initial: V,
        mut flags: PropertyFlags,
    ) -> Property<V, R> {
        if !V::fits_slot() {
            flags |= PropertyFlags::USE_LOCAL_COPY;
        }
        let id = PropertyId::try_from(self.table.len()).unwrap_or(INVALID_PROPERTY_ID);
        let property = Property::new(id, initial, flags, self.shared.clone());
        self.table.push(R::erase(property.clone()));
        property
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Creates the master's segment. The caller holds the endpoint, so a segment
/// already under this name was left by a master that died.
fn create_segment(name: &str, layout: &Layout) -> Result<Segment, SegmentError> {
    match Segment::create(name, layout) {
        Err(SegmentError::AlreadyExists(_)) => {
            tracing::warn!("Removing stale shared segment {}", name);
            Segment::remove_stale(name)?;
            Segment::create(name, layout)
        }
        other => other,
    }
}

/// A process's property registry.
///
/// `P` is whatever the declaration closure returned, typically a struct of
/// [`Property`] handles.
pub struct Registry<R: Role, P> {
    shared: Arc<Shared>,
    properties: P,
    fingerprint: Fingerprint,
    _role: PhantomData<R>,
}

impl<P> Registry<Server, P> {
    /// Declares the properties, publishes the shared segment and starts
    /// listening for slaves.
    ///
    /// Must be called within a tokio runtime.
    pub fn create(
        config: &Config,
        declare: impl FnOnce(&mut Declarations<Server>) -> P,
    ) -> Result<Self, RegistryError> {
        let shared = Arc::new(Shared::new(&config.segment_name, true));
        let (properties, table) = Declarations::collect(&shared, declare)?;

        let layout = shared.install(table);

        // Claim the endpoint first: a second master must fail before it can
        // touch the live master's segment.
        let link = MasterLink::bind(&shared, config)?;

        let segment = create_segment(&config.segment_name, &layout)?;
        for property in shared.table() {
            if let (Some(value), Some(offset)) = (property.slot_value(), layout.offset(property.id()))
            {
                segment.write_slot(offset, value);
            }
        }
        *shared.segment.write() = Some(segment);

        let _ = shared.link.set(link.clone());
        link.start();

        tracing::info!(
            "Master registry {} published ({} properties, {} bytes)",
            config.segment_name,
            layout.property_count(),
            layout.size()
        );
        Ok(Self {
            shared,
            properties,
            fingerprint: layout.fingerprint(),
            _role: PhantomData,
        })
    }

    /// Number of connected slaves.
    pub fn client_count(&self) -> usize {
        self.shared.link().map_or(0, |link| link.peer_count())
    }
}

impl<P> Registry<Client, P> {
    /// Declares the properties and connects to the master.
    ///
    /// Not reaching the master is not an error: with auto-connect enabled
    /// the link keeps retrying, and reads return local values meanwhile.
    /// Must be called within a tokio runtime.
    pub fn create(
        config: &Config,
        declare: impl FnOnce(&mut Declarations<Client>) -> P,
    ) -> Result<Self, RegistryError> {
        let shared = Arc::new(Shared::new(&config.segment_name, false));
        let (properties, table) = Declarations::collect(&shared, declare)?;
        let layout = shared.install(table);

        let link = SlaveLink::new(&shared, config);
        let _ = shared.link.set(link.clone());

        let endpoint = config.endpoint();
        if !link.connect(endpoint.clone(), config.transport.auto_connect, config.framing()) {
            tracing::info!("Master {} not reachable yet", endpoint);
        }

        Ok(Self {
            shared,
            properties,
            fingerprint: layout.fingerprint(),
            _role: PhantomData,
        })
    }

    /// Maps the master's segment again.
    pub fn attach_shared_memory(&self) -> Result<(), RegistryError> {
        self.shared.attach_shared_memory()
    }

    pub fn detach_shared_memory(&self) {
        self.shared.detach_shared_memory();
    }

    /// Reconnects to the master, retrying with backoff until it succeeds.
    pub fn reconnect(&self) -> bool {
        self.shared.link().map_or(false, |link| link.reconnect())
    }
}

impl<R: Role, P> Registry<R, P> {
    pub fn properties(&self) -> &P {
        &self.properties
    }

    /// Segment and endpoint name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_server(&self) -> bool {
        R::IS_SERVER
    }

    pub fn property_count(&self) -> usize {
        self.shared.property_count()
    }

    /// Fingerprint of the locally declared layout.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Dispatches a request to the addressed property.
    pub fn request_received(&self, id: PropertyId, request: Request) -> Result<(), PropertyError> {
        self.shared.request_received(id, request)
    }

    pub fn change_notification_received(&self, id: PropertyId) -> Result<(), PropertyError> {
        self.shared.change_notification_received(id)
    }

    /// Whether a shared segment is mapped.
    pub fn is_attached(&self) -> bool {
        self.shared.is_attached()
    }

    /// Whether the link is up: listening on the master, connected on a slave.
    pub fn is_connected(&self) -> bool {
        self.shared.link().map_or(false, |link| link.is_connected())
    }

    /// Stops the link and unmaps the segment. The master also removes it.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl<R: Role, P> Drop for Registry<R, P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
