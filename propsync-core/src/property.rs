//! Typed properties.
//!
//! A [`Property`] is a cheap handle to one declared value. Its role parameter
//! decides who holds write authority: [`Server`] properties apply changes and
//! publish them, [`Client`] properties forward every write to the master and
//! read the master's shared slot when one is attached.

use crate::error::PropertyError;
use crate::flags::PropertyFlags;
use crate::registry::Shared;
use crate::signal::{Signal, Subscription};
use crate::value::{encode_value, PropertyValue};
use bytes::Bytes;
use parking_lot::Mutex;
use propsync_protocol::{OpCode, PropertyId, Request};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock, Weak};

mod sealed {
    pub trait Sealed {}
}

/// Selects the write authority of a property set.
pub trait Role: sealed::Sealed + Send + Sync + Sized + 'static {
    const IS_SERVER: bool;
    const NAME: &'static str;

    #[doc(hidden)]
    fn erase<V: PropertyValue>(property: Property<V, Self>) -> Arc<dyn ErasedProperty>;
}

/// Master role: owns the values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Server;

/// Slave role: forwards writes to the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Client;

impl sealed::Sealed for Server {}
impl sealed::Sealed for Client {}

impl Role for Server {
    const IS_SERVER: bool = true;
    const NAME: &'static str = "server";

    fn erase<V: PropertyValue>(property: Property<V, Self>) -> Arc<dyn ErasedProperty> {
        Arc::new(property)
    }
}

impl Role for Client {
    const IS_SERVER: bool = false;
    const NAME: &'static str = "client";

    fn erase<V: PropertyValue>(property: Property<V, Self>) -> Arc<dyn ErasedProperty> {
        Arc::new(property)
    }
}

/// Intercepts `set` on a server property.
///
/// The behavior decides whether to apply the value, usually by calling
/// [`Property::do_set`] with the original or a transformed value.
pub trait SetBehavior<V: PropertyValue>: Send + Sync + 'static {
    fn set(&self, property: &Property<V, Server>, value: V) -> bool;
}

impl<V, F> SetBehavior<V> for F
where
    V: PropertyValue,
    F: Fn(&Property<V, Server>, V) -> bool + Send + Sync + 'static,
{
    fn set(&self, property: &Property<V, Server>, value: V) -> bool {
        self(property, value)
    }
}

struct PropertyInner<V: PropertyValue> {
    id: PropertyId,
    flags: AtomicU16,
    value: Mutex<V>,
    /// Serializes read-modify-write sequences. Never held while callbacks run.
    apply: Mutex<()>,
    changes: Arc<Signal<V>>,
    messages: Arc<Signal<str>>,
    set_behavior: OnceLock<Arc<dyn SetBehavior<V>>>,
    shared: Weak<Shared>,
}

/// Handle to a declared property.
pub struct Property<V: PropertyValue, R: Role> {
    inner: Arc<PropertyInner<V>>,
    _role: PhantomData<R>,
}

impl<V: PropertyValue, R: Role> Clone for Property<V, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _role: PhantomData,
        }
    }
}

impl<V: PropertyValue, R: Role> Property<V, R> {
    pub(crate) fn new(id: PropertyId, initial: V, flags: PropertyFlags, shared: Weak<Shared>) -> Self {
        Self {
            inner: Arc::new(PropertyInner {
                id,
                flags: AtomicU16::new(flags.bits()),
                value: Mutex::new(initial),
                apply: Mutex::new(()),
                changes: Signal::new(),
                messages: Signal::new(),
                set_behavior: OnceLock::new(),
                shared,
            }),
            _role: PhantomData,
        }
    }

    pub fn id(&self) -> PropertyId {
        self.inner.id
    }

    pub fn flags(&self) -> PropertyFlags {
        PropertyFlags::from_bits_retain(self.inner.flags.load(Ordering::Acquire))
    }

    pub fn test_flag(&self, flag: PropertyFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn set_flag(&self, flag: PropertyFlags) {
        self.inner.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: PropertyFlags) {
        self.inner.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// The process-local copy of the value.
    pub fn local_value(&self) -> V {
        self.inner.value.lock().clone()
    }

    /// Subscribes to value changes.
    ///
    /// On a client property the first subscriber also asks the master to
    /// start sending change notifications.
    pub fn send_changes<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        let first = self.inner.changes.is_empty();
        let subscription = self.inner.changes.connect(callback);
        if !R::IS_SERVER && first {
            self.forward(&Request::SubscribeChanges);
        }
        subscription
    }

    /// Subscribes to text messages addressed to this property.
    pub fn send_messages<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.messages.connect(callback)
    }

    /// Sends a text message to the other side: every client when called on
    /// the master, the master when called on a slave.
    pub fn send_message(&self, text: &str) -> bool {
        self.forward(&Request::Message(text.to_string()))
    }

    fn shared(&self) -> Option<Arc<Shared>> {
        self.inner.shared.upgrade()
    }

    fn forward(&self, request: &Request) -> bool {
        let Some(link) = self.shared().and_then(|shared| shared.link().cloned()) else {
            tracing::debug!(
                "Property {}: {:?} not sent, registry has no link",
                self.id(),
                request.op_code()
            );
            return false;
        };
        // The transport logs why a send failed.
        link.send_request(self.id(), request)
    }

    fn decode_operand(&self, bytes: &Bytes) -> Result<V, PropertyError> {
        V::decode(bytes).ok_or(PropertyError::InvalidPayload {
            id: self.id(),
            expected: V::WIRE_SIZE,
            actual: bytes.len(),
        })
    }
}

impl<V: PropertyValue> Property<V, Server> {
    /// The authoritative value.
    pub fn get(&self) -> V {
        self.local_value()
    }

    /// Sets the initial value without notifying anyone.
    pub fn init(&self, value: V) {
        let slot = value.to_slot();
        *self.inner.value.lock() = value;
        if let (Some(slot), Some(shared)) = (slot, self.shared()) {
            if !self.test_flag(PropertyFlags::USE_LOCAL_COPY) {
                shared.write_slot(self.id(), slot);
            }
        }
    }

    /// Installs the set interceptor. Only the first call takes effect.
    pub fn set_set_behavior(&self, behavior: impl SetBehavior<V>) -> bool {
        let installed = self.inner.set_behavior.set(Arc::new(behavior)).is_ok();
        if !installed {
            tracing::warn!("Property {}: set behavior already installed", self.id());
        }
        installed
    }

    /// Sets the value through the set behavior, if any.
    pub fn set(&self, value: V) -> bool {
        match self.inner.set_behavior.get().cloned() {
            Some(behavior) => behavior.set(self, value),
            None => self.do_set(value),
        }
    }

    /// Applies the value, publishes it and notifies local subscribers.
    ///
    /// Returns false when the value is unchanged and
    /// [`NOTIFY_EVEN_IF_UNCHANGED`](PropertyFlags::NOTIFY_EVEN_IF_UNCHANGED)
    /// is clear.
    pub fn do_set(&self, value: V) -> bool {
        let guard = self.inner.apply.lock();
        let changed = self.store(&value);
        drop(guard);

        if changed {
            self.inner.changes.emit(&value);
        }
        changed
    }

    /// Updates and publishes the value. Caller holds the apply lock.
    fn store(&self, value: &V) -> bool {
        {
            let mut current = self.inner.value.lock();
            if *current == *value && !self.test_flag(PropertyFlags::NOTIFY_EVEN_IF_UNCHANGED) {
                return false;
            }
            *current = value.clone();
        }
        self.publish(value);
        true
    }

    fn publish(&self, value: &V) {
        let Some(shared) = self.shared() else {
            return;
        };
        let flags = self.flags();
        let local_copy = flags.contains(PropertyFlags::USE_LOCAL_COPY);

        if !local_copy {
            if let Some(slot) = value.to_slot() {
                shared.write_slot(self.id(), slot);
            }
        }
        if flags.contains(PropertyFlags::SUPPRESS_CLIENT_NOTIFICATION) {
            return;
        }
        if let Some(link) = shared.link() {
            if local_copy {
                link.send_request(self.id(), &Request::Set(encode_value(value)));
            } else {
                link.send_change_notification(self.id(), flags);
            }
        }
    }

    /// Read-modify-write. Without a set behavior the read and the write are
    /// one step under the apply lock; a set behavior runs after the lock is
    /// released, like every callback.
    fn apply_op(&self, op: OpCode, f: impl FnOnce(&V) -> Option<V>) -> Result<bool, PropertyError> {
        let unsupported = || {
            let err = PropertyError::UnsupportedOperation { id: self.id(), op };
            tracing::error!("{}", err);
            err
        };

        let guard = self.inner.apply.lock();
        let next = f(&self.get()).ok_or_else(unsupported)?;
        if self.inner.set_behavior.get().is_some() {
            drop(guard);
            return Ok(self.set(next));
        }

        let changed = self.store(&next);
        drop(guard);
        if changed {
            self.inner.changes.emit(&next);
        }
        Ok(changed)
    }

    pub fn add(&self, operand: V) -> Result<bool, PropertyError> {
        self.apply_op(OpCode::Add, |v| v.op_add(&operand))
    }

    pub fn multiply(&self, operand: V) -> Result<bool, PropertyError> {
        self.apply_op(OpCode::Multiply, |v| v.op_mul(&operand))
    }

    pub fn divide(&self, operand: V) -> Result<bool, PropertyError> {
        self.apply_op(OpCode::Divide, |v| v.op_div(&operand))
    }

    pub fn and(&self, operand: V) -> Result<bool, PropertyError> {
        self.apply_op(OpCode::And, |v| v.op_and(&operand))
    }

    pub fn or(&self, operand: V) -> Result<bool, PropertyError> {
        self.apply_op(OpCode::Or, |v| v.op_or(&operand))
    }

    pub fn xor(&self, operand: V) -> Result<bool, PropertyError> {
        self.apply_op(OpCode::Xor, |v| v.op_xor(&operand))
    }

    pub fn invert(&self) -> Result<bool, PropertyError> {
        self.apply_op(OpCode::Invert, |v| v.op_invert())
    }
}

impl<V: PropertyValue> Property<V, Client> {
    /// The master's value: the shared slot while attached, the local copy
    /// otherwise or when the property uses a local copy.
    pub fn get(&self) -> V {
        if !self.test_flag(PropertyFlags::USE_LOCAL_COPY) {
            let shared = self
                .shared()
                .and_then(|shared| shared.read_slot(self.id()))
                .and_then(V::from_slot);
            if let Some(value) = shared {
                return value;
            }
        }
        self.local_value()
    }

    /// Sets the local value. Only meaningful before the registry attaches.
    pub fn init(&self, value: V) {
        *self.inner.value.lock() = value;
    }

    pub fn set(&self, value: V) -> bool {
        self.forward(&Request::Set(encode_value(&value)))
    }

    pub fn add(&self, operand: V) -> bool {
        self.forward(&Request::Add(encode_value(&operand)))
    }

    pub fn multiply(&self, operand: V) -> bool {
        self.forward(&Request::Multiply(encode_value(&operand)))
    }

    pub fn divide(&self, operand: V) -> bool {
        self.forward(&Request::Divide(encode_value(&operand)))
    }

    pub fn and(&self, operand: V) -> bool {
        self.forward(&Request::And(encode_value(&operand)))
    }

    pub fn or(&self, operand: V) -> bool {
        self.forward(&Request::Or(encode_value(&operand)))
    }

    pub fn xor(&self, operand: V) -> bool {
        self.forward(&Request::Xor(encode_value(&operand)))
    }

    pub fn invert(&self) -> bool {
        self.forward(&Request::Invert)
    }

    fn update_local(&self, value: V) {
        *self.inner.value.lock() = value.clone();
        self.inner.changes.emit(&value);
    }
}

impl<V: PropertyValue, R: Role> fmt::Debug for Property<V, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("id", &self.id())
            .field("role", &R::NAME)
            .field("flags", &self.flags())
            .field("value", &*self.inner.value.lock())
            .finish()
    }
}

/// Type-erased view the registry dispatches through.
#[doc(hidden)]
pub trait ErasedProperty: Send + Sync {
    fn id(&self) -> PropertyId;

    fn flags(&self) -> PropertyFlags;

    fn wire_size(&self) -> usize;

    /// Local value as a slot word, for properties that live in the segment.
    fn slot_value(&self) -> Option<u64>;

    fn encoded_value(&self) -> Bytes;

    fn request_received(&self, request: Request) -> Result<(), PropertyError>;

    fn change_notification_received(&self) -> Result<(), PropertyError>;

    /// Called after a slave attaches to the master's segment.
    fn on_connected_client(&self);
}

fn slot_value<V: PropertyValue, R: Role>(property: &Property<V, R>) -> Option<u64> {
    if property.test_flag(PropertyFlags::USE_LOCAL_COPY) {
        return None;
    }
    property.local_value().to_slot()
}

impl<V: PropertyValue> ErasedProperty for Property<V, Server> {
    fn id(&self) -> PropertyId {
        Property::id(self)
    }

    fn flags(&self) -> PropertyFlags {
        Property::flags(self)
    }

    fn wire_size(&self) -> usize {
        V::WIRE_SIZE
    }

    fn slot_value(&self) -> Option<u64> {
        slot_value(self)
    }

    fn encoded_value(&self) -> Bytes {
        encode_value(&self.get())
    }

    fn request_received(&self, request: Request) -> Result<(), PropertyError> {
        let id = Property::id(self);
        match request {
            Request::Set(b) => {
                self.set(self.decode_operand(&b)?);
                Ok(())
            }
            Request::Add(b) => self.add(self.decode_operand(&b)?).map(drop),
            Request::Multiply(b) => self.multiply(self.decode_operand(&b)?).map(drop),
            Request::Divide(b) => self.divide(self.decode_operand(&b)?).map(drop),
            Request::And(b) => self.and(self.decode_operand(&b)?).map(drop),
            Request::Or(b) => self.or(self.decode_operand(&b)?).map(drop),
            Request::Xor(b) => self.xor(self.decode_operand(&b)?).map(drop),
            Request::Invert => self.invert().map(drop),
            Request::Message(text) => {
                self.inner.messages.emit(&text);
                Ok(())
            }
            Request::SubscribeChanges => Err(PropertyError::UnexpectedOperation {
                id,
                op: OpCode::HandlesChangeNotifications,
                role: Server::NAME,
            }),
            Request::ReportIncompatible => Err(PropertyError::IncompatibleClient(id)),
        }
    }

    fn change_notification_received(&self) -> Result<(), PropertyError> {
        Err(PropertyError::UnexpectedNotification(Property::id(self)))
    }

    fn on_connected_client(&self) {}
}

impl<V: PropertyValue> ErasedProperty for Property<V, Client> {
    fn id(&self) -> PropertyId {
        Property::id(self)
    }

    fn flags(&self) -> PropertyFlags {
        Property::flags(self)
    }

    fn wire_size(&self) -> usize {
        V::WIRE_SIZE
    }

    fn slot_value(&self) -> Option<u64> {
        slot_value(self)
    }

    fn encoded_value(&self) -> Bytes {
        encode_value(&self.get())
    }

    fn request_received(&self, request: Request) -> Result<(), PropertyError> {
        match request {
            Request::Set(b) => {
                let value = self.decode_operand(&b)?;
                self.update_local(value);
                Ok(())
            }
            Request::Message(text) => {
                self.inner.messages.emit(&text);
                Ok(())
            }
            other => Err(PropertyError::UnexpectedOperation {
                id: Property::id(self),
                op: other.op_code(),
                role: Client::NAME,
            }),
        }
    }

    fn change_notification_received(&self) -> Result<(), PropertyError> {
        self.update_local(self.get());
        Ok(())
    }

    fn on_connected_client(&self) {
        if !self.inner.changes.is_empty() || self.test_flag(PropertyFlags::USE_LOCAL_COPY) {
            self.forward(&Request::SubscribeChanges);
        }
    }
}
