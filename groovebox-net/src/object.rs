//! Replicated object base, object table and client factories.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use groovebox_types::ObjId;

use crate::client::{ClientCore, ServerLink};
use crate::error::{HandlerError, MessageError, ObjectError};
use crate::message::Message;
use crate::protocol::ClientId;
use crate::server::ServerCore;

/// Identity and liveness shared by every replicated object.
#[derive(Debug)]
pub struct ObjectBase {
    id: ObjId,
    valid: AtomicBool,
}

impl ObjectBase {
    pub fn new(id: ObjId) -> Self {
        Self {
            id,
            valid: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> ObjId {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Fail fast on a handle whose object is gone.
    pub fn check_valid(&self) -> Result<(), ObjectError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(ObjectError::ObjectWasDeleted)
        }
    }
}

/// Authoritative object living in the server context.
pub trait ServerObject: Send + Sync + 'static {
    fn base(&self) -> &ObjectBase;

    /// Replication type name; selects the client factory.
    fn factory(&self) -> &'static str;

    /// Write the full state carried by the create-object message.
    fn serialize(&self, msg: &mut Message) -> Result<(), MessageError>;

    /// Handle a request from `client`.
    fn process_message(
        &self,
        server: &mut ServerCore,
        client: ClientId,
        msg: &Message,
    ) -> Result<(), HandlerError>;

    fn on_delete(&self, _server: &mut ServerCore) {}

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn obj_id(&self) -> ObjId {
        self.base().id()
    }
}

/// Client replica of a server object.
pub trait ClientObject: Send + Sync + 'static {
    fn base(&self) -> &ObjectBase;

    fn factory(&self) -> &'static str;

    /// Apply a confirmation broadcast by the server.
    fn process_message(&self, client: &mut ClientCore, msg: &Message) -> Result<(), HandlerError>;

    /// Called once when the server deletes the object or the session ends.
    fn invalidate(&self) {
        self.base().invalidate();
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn obj_id(&self) -> ObjId {
        self.base().id()
    }
}

/// Canonical id to object map of one context.
pub struct ObjectTable<O: ?Sized> {
    objects: BTreeMap<ObjId, Arc<O>>,
}

impl<O: ?Sized> Default for ObjectTable<O> {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
        }
    }
}

impl<O: ?Sized> ObjectTable<O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ObjId) -> Result<Arc<O>, ObjectError> {
        self.objects
            .get(&id)
            .cloned()
            .ok_or(ObjectError::NoSuchObject(id))
    }

    pub fn insert(&mut self, id: ObjId, object: Arc<O>) -> Result<(), ObjectError> {
        if self.objects.contains_key(&id) {
            return Err(ObjectError::DuplicateObjectId(id));
        }
        self.objects.insert(id, object);
        Ok(())
    }

    pub fn remove(&mut self, id: ObjId) -> Result<Arc<O>, ObjectError> {
        self.objects.remove(&id).ok_or(ObjectError::NoSuchObject(id))
    }

    pub fn contains(&self, id: ObjId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Objects in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<O>> {
        self.objects.values()
    }

    pub fn drain(&mut self) -> Vec<Arc<O>> {
        std::mem::take(&mut self.objects).into_values().collect()
    }
}

/// Server-side object id reservation. Ids are never reused within a session.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: i32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(next: i32) -> Self {
        Self { next: next.max(0) }
    }

    pub fn reserve(&mut self) -> Result<ObjId, ObjectError> {
        let id = self.next;
        if id < 0 {
            return Err(ObjectError::ObjIdOverflow);
        }
        // i32::MIN marks exhaustion so ids never wrap negative.
        self.next = id.checked_add(1).unwrap_or(i32::MIN);
        Ok(ObjId::new(id))
    }
}

pub type CreateFn =
    fn(ObjId, &Message, ServerLink) -> Result<Arc<dyn ClientObject>, HandlerError>;

/// Builds replicas of one replication type.
#[derive(Clone, Copy)]
pub struct ClientFactory {
    pub type_name: &'static str,
    pub create: CreateFn,
}

/// Explicit type name to factory table, built once at startup.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: HashMap<&'static str, ClientFactory>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A second registration under the same name replaces the first.
    pub fn register(&mut self, factory: ClientFactory) -> &mut Self {
        self.factories.insert(factory.type_name, factory);
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn create(
        &self,
        type_name: &str,
        id: ObjId,
        msg: &Message,
        link: ServerLink,
    ) -> Result<Arc<dyn ClientObject>, HandlerError> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| ObjectError::NoSuchFactory(type_name.to_string()))?;
        (factory.create)(id, msg, link)
    }
}

/// Downcast a shared object to its concrete type.
pub fn downcast<T: Send + Sync + 'static>(object: Arc<dyn Any + Send + Sync>) -> Option<Arc<T>> {
    object.downcast::<T>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_never_reissued() {
        let mut ids = IdAllocator::new();
        let a = ids.reserve().unwrap();
        let b = ids.reserve().unwrap();
        assert_ne!(a, b);
        assert_eq!(b.get(), a.get() + 1);
    }

    #[test]
    fn ids_overflow_before_going_negative() {
        let mut ids = IdAllocator::starting_at(i32::MAX - 1);
        assert_eq!(ids.reserve().unwrap().get(), i32::MAX - 1);
        assert_eq!(ids.reserve().unwrap().get(), i32::MAX);
        assert_eq!(ids.reserve(), Err(ObjectError::ObjIdOverflow));
        assert_eq!(ids.reserve(), Err(ObjectError::ObjIdOverflow));
    }

    #[test]
    fn table_rejects_duplicates_and_missing() {
        let mut table: ObjectTable<str> = ObjectTable::new();
        let id = ObjId::new(4);
        table.insert(id, Arc::from("kick")).unwrap();
        assert_eq!(
            table.insert(id, Arc::from("snare")),
            Err(ObjectError::DuplicateObjectId(id))
        );
        assert_eq!(&*table.get(id).unwrap(), "kick");
        assert_eq!(
            table.get(ObjId::new(5)).unwrap_err(),
            ObjectError::NoSuchObject(ObjId::new(5))
        );
        table.remove(id).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn base_fails_fast_after_invalidate() {
        let base = ObjectBase::new(ObjId::new(1));
        assert!(base.check_valid().is_ok());
        base.invalidate();
        assert_eq!(base.check_valid(), Err(ObjectError::ObjectWasDeleted));
    }

    #[test]
    fn unknown_factory() {
        let registry = FactoryRegistry::new();
        assert!(!registry.contains("Nope"));
    }
}
