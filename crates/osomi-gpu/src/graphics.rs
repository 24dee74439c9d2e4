//! The graphics object registry.
//!
//! [`Graphics`] is the factory for every GPU resource. It assigns ids, stores
//! the objects, keeps per-kind indices, counts references and tears the whole
//! set down on shutdown.

use hashbrown::HashMap;
use osomi_core::{Bitset, BlockAllocator, BlockHandle};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::backend::{GraphicsBackend, SurfaceTarget};
use crate::error::{GpuError, Result};
use crate::id::IdAllocator;
use crate::memory::{GpuMemoryAllocator, DEFAULT_BLOCK_SIZE};
use crate::object::{
    DestroyOutcome, GraphicsObject, Handle, ObjectId, ObjectKind, Resource, ResourceInfo,
    TypedResource,
};

/// Optional device capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphicsFeature {
    Raytracing,
    Vr,
}

impl GraphicsFeature {
    pub const COUNT: usize = 2;
    pub const ALL: [Self; Self::COUNT] = [Self::Raytracing, Self::Vr];

    /// Bit index in the feature set.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Registry configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphicsConfig {
    /// Bytes per chunk of object storage.
    pub heap_size: usize,
    /// Largest assignable object id.
    pub max_id: u32,
    /// Frames in flight.
    pub buffering: u32,
    /// Size of pooled GPU memory blocks.
    pub default_block_size: u64,
    /// Features the device must support.
    pub features: Vec<GraphicsFeature>,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            heap_size: 64 << 20,
            max_id: 0x00FF_FFFF,
            buffering: 3,
            default_block_size: DEFAULT_BLOCK_SIZE,
            features: Vec::new(),
        }
    }
}

impl GraphicsConfig {
    /// Set the object storage chunk size.
    pub fn with_heap_size(mut self, heap_size: usize) -> Self {
        self.heap_size = heap_size;
        self
    }

    /// Set the largest assignable id.
    pub fn with_max_id(mut self, max_id: u32) -> Self {
        self.max_id = max_id;
        self
    }

    /// Set the number of frames in flight.
    pub fn with_buffering(mut self, buffering: u32) -> Self {
        self.buffering = buffering;
        self
    }

    /// Set the pooled GPU memory block size.
    pub fn with_default_block_size(mut self, size: u64) -> Self {
        self.default_block_size = size;
        self
    }

    /// Require a device feature.
    pub fn with_feature(mut self, feature: GraphicsFeature) -> Self {
        if !self.features.contains(&feature) {
            self.features.push(feature);
        }
        self
    }
}

/// Object storage plus its id and kind indices.
struct ObjectRegistry {
    objects: BlockAllocator<GraphicsObject>,
    by_kind: HashMap<ObjectKind, Vec<ObjectId>>,
    by_id: HashMap<ObjectId, BlockHandle>,
    ids: IdAllocator,
}

impl ObjectRegistry {
    fn new(heap_size: usize, max_id: u32) -> Self {
        Self {
            objects: BlockAllocator::new(heap_size),
            by_kind: HashMap::new(),
            by_id: HashMap::new(),
            ids: IdAllocator::new(max_id),
        }
    }

    fn get(&self, id: ObjectId) -> Option<&GraphicsObject> {
        self.by_id.get(&id).and_then(|&handle| self.objects.get(handle))
    }

    fn get_mut(&mut self, id: ObjectId) -> Option<&mut GraphicsObject> {
        let handle = *self.by_id.get(&id)?;
        self.objects.get_mut(handle)
    }

    fn get_typed<T: TypedResource>(&self, handle: Handle<T>) -> Option<&GraphicsObject> {
        self.get(handle.id()).filter(|object| object.kind() == T::KIND)
    }

    fn retain(&mut self, id: ObjectId) -> bool {
        match self.get_mut(id) {
            Some(object) => {
                object.retain();
                true
            }
            None => false,
        }
    }

    /// Store an object and index it. An id already in its bucket is refused
    /// and the object handed back.
    fn register(&mut self, object: GraphicsObject) -> std::result::Result<(), GraphicsObject> {
        let bucket = self.by_kind.entry(object.kind()).or_default();
        if bucket.contains(&object.id()) || self.by_id.contains_key(&object.id()) {
            warn!(
                id = %object.id(),
                kind = %object.kind(),
                "object is already registered"
            );
            return Err(object);
        }

        bucket.push(object.id());
        let id = object.id();
        let handle = self.objects.alloc(object);
        self.by_id.insert(id, handle);
        Ok(())
    }

    /// Remove an object from storage and both indices and free its id.
    fn unregister(&mut self, id: ObjectId) -> Option<GraphicsObject> {
        let mut handle = self.by_id.remove(&id);
        let object = self.objects.dealloc(&mut handle)?;

        if let Some(bucket) = self.by_kind.get_mut(&object.kind()) {
            if let Some(pos) = bucket.iter().position(|&other| other == id) {
                bucket.remove(pos);
            }
        }
        self.ids.release(id);
        Some(object)
    }

    fn ids_of(&self, kind: ObjectKind) -> &[ObjectId] {
        self.by_kind.get(&kind).map_or(&[], Vec::as_slice)
    }
}

/// What a [`ResourceInfo::init`] call gets to work with.
pub struct InitContext<'a> {
    id: ObjectId,
    name: &'a str,
    registry: &'a mut ObjectRegistry,
    /// Backend to create native handles with.
    pub backend: &'a mut dyn GraphicsBackend,
    /// Allocator for the resource's GPU memory.
    pub memory: &'a mut GpuMemoryAllocator,
}

impl<'a> InitContext<'a> {
    /// Id the new object will get.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Name of the new object.
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Whether `handle` refers to a live object of its kind.
    pub fn contains<T: TypedResource>(&self, handle: Handle<T>) -> bool {
        self.registry.get_typed(handle).is_some()
    }

    /// Read another live resource.
    pub fn get<T: TypedResource>(&self, handle: Handle<T>) -> Option<&T> {
        self.registry.get_typed(handle)?.downcast_ref()
    }

    /// Add a holder to another live object.
    pub fn retain<T: TypedResource>(&mut self, handle: Handle<T>) -> Option<Handle<T>> {
        self.registry.get_typed(handle)?;
        self.registry.retain(handle.id()).then_some(handle)
    }
}

/// Registry and factory of GPU resources.
pub struct Graphics<B: GraphicsBackend> {
    config: GraphicsConfig,
    registry: ObjectRegistry,
    memory: GpuMemoryAllocator,
    features: Bitset,
    frame: u64,
    in_frame: bool,
    has_surface: bool,
    shut_down: bool,
    backend: B,
}

impl<B: GraphicsBackend> Graphics<B> {
    /// Create a registry on top of `backend`.
    pub fn new(config: GraphicsConfig, backend: B) -> Result<Self> {
        if config.buffering == 0 {
            return Err(GpuError::InvalidState("Buffering must be at least 1".to_string()));
        }

        let mut features = Bitset::new(GraphicsFeature::COUNT);
        for feature in GraphicsFeature::ALL {
            features.set(feature.index(), backend.supports(feature));
        }
        if let Some(missing) = config
            .features
            .iter()
            .find(|f| !features.get(f.index()))
        {
            return Err(GpuError::InvalidState(format!(
                "Required feature {missing:?} is not supported"
            )));
        }

        let memory = GpuMemoryAllocator::new(&backend, config.default_block_size);
        let registry = ObjectRegistry::new(config.heap_size, config.max_id);

        info!(
            max_id = config.max_id,
            buffering = config.buffering,
            features = %features,
            "graphics initialized"
        );

        Ok(Self {
            config,
            registry,
            memory,
            features,
            frame: 0,
            in_frame: false,
            has_surface: false,
            shut_down: false,
            backend,
        })
    }

    /// Configuration the registry was built with.
    pub fn config(&self) -> &GraphicsConfig {
        &self.config
    }

    /// The GPU backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the GPU backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// GPU memory allocator statistics.
    pub fn memory(&self) -> &GpuMemoryAllocator {
        &self.memory
    }

    /// Whether the device supports `feature`.
    pub fn supports(&self, feature: GraphicsFeature) -> bool {
        self.features.get(feature.index())
    }

    /// Create a resource and register it under the lowest free id.
    ///
    /// When the initializer fails the id is returned to the pool and nothing
    /// is registered.
    pub fn create<I: ResourceInfo>(
        &mut self,
        name: impl Into<String>,
        info: I,
    ) -> Result<Handle<I::Resource>> {
        let name = name.into();
        let kind = <I::Resource as TypedResource>::KIND;

        if self.shut_down {
            return Err(GpuError::InvalidState(format!(
                "Can't create {kind} \"{name}\" after shutdown"
            )));
        }

        let Some(id) = self.registry.ids.reserve() else {
            error!(%kind, %name, "no free object id");
            return Err(GpuError::IdSpaceExhausted {
                max_id: self.registry.ids.max_id(),
            });
        };

        let mut ctx = InitContext {
            id,
            name: &name,
            registry: &mut self.registry,
            backend: &mut self.backend,
            memory: &mut self.memory,
        };

        let resource = match info.init(&mut ctx) {
            Ok(resource) => resource,
            Err(source) => {
                self.registry.ids.release(id);
                error!(%kind, %name, error = %source, "resource init failed");
                return Err(GpuError::ResourceInit {
                    kind,
                    name,
                    source: Box::new(source),
                });
            }
        };

        debug!(%id, %kind, "created {name}");

        let object = GraphicsObject::new(id, kind, name, Box::new(resource));
        if let Err(object) = self.registry.register(object) {
            let name = object.name().to_string();
            self.registry.ids.release(id);
            self.release_resource(object.into_resource());
            return Err(GpuError::InvalidState(format!(
                "{kind} \"{name}\" was registered twice"
            )));
        }

        Ok(Handle::new(id))
    }

    /// Drop one holder of a typed object.
    ///
    /// On [`DestroyOutcome::Freed`] the caller's handle is cleared.
    pub fn destroy<T: TypedResource>(&mut self, handle: &mut Option<Handle<T>>) -> DestroyOutcome {
        let Some(h) = *handle else {
            return DestroyOutcome::NotFound;
        };
        if self.registry.get_typed(h).is_none() {
            return DestroyOutcome::NotFound;
        }

        let outcome = self.destroy_id(h.id());
        if outcome.is_freed() {
            *handle = None;
        }
        outcome
    }

    /// Drop one holder of any object.
    pub fn destroy_id(&mut self, id: ObjectId) -> DestroyOutcome {
        let Some(object) = self.registry.get_mut(id) else {
            return DestroyOutcome::NotFound;
        };

        if !object.release_ref() {
            debug!(%id, refs = object.ref_count(), "released reference to {}", object.name());
            return DestroyOutcome::StillReferenced;
        }

        let Some(object) = self.registry.unregister(id) else {
            return DestroyOutcome::NotFound;
        };
        debug!(%id, kind = %object.kind(), "destroyed {}", object.name());

        self.release_resource(object.into_resource());
        DestroyOutcome::Freed
    }

    /// Add a holder to a typed object.
    pub fn retain<T: TypedResource>(&mut self, handle: Handle<T>) -> Option<Handle<T>> {
        self.registry.get_typed(handle)?;
        self.registry.retain(handle.id()).then_some(handle)
    }

    /// Add a holder to any object.
    pub fn retain_id(&mut self, id: ObjectId) -> bool {
        self.registry.retain(id)
    }

    /// Ids of all live objects of type `T`, in creation order.
    pub fn get_all<T: TypedResource>(&self) -> &[ObjectId] {
        self.registry.ids_of(T::KIND)
    }

    /// Ids of all live objects of `kind`, in creation order.
    pub fn ids_of(&self, kind: ObjectKind) -> &[ObjectId] {
        self.registry.ids_of(kind)
    }

    /// Registry record for `id`.
    pub fn object(&self, id: ObjectId) -> Option<&GraphicsObject> {
        self.registry.get(id)
    }

    /// The resource behind a handle.
    pub fn resource<T: TypedResource>(&self, handle: Handle<T>) -> Option<&T> {
        self.registry.get_typed(handle)?.downcast_ref()
    }

    /// Mutable access to the resource behind `handle`.
    pub fn resource_mut<T: TypedResource>(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.registry
            .get_mut(handle.id())
            .filter(|object| object.kind() == T::KIND)?
            .downcast_mut()
    }

    /// Whether an object with `id` is live.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.registry.by_id.contains_key(&id)
    }

    /// Whether `handle` points at a live object of kind `T`.
    pub fn contains_handle<T: TypedResource>(&self, handle: Handle<T>) -> bool {
        self.registry.get_typed(handle).is_some()
    }

    /// First live object of type `T` called `name`.
    pub fn find_by_name<T: TypedResource>(&self, name: &str) -> Option<Handle<T>> {
        self.get_all::<T>()
            .iter()
            .copied()
            .find(|&id| self.registry.get(id).is_some_and(|o| o.name() == name))
            .map(Handle::new)
    }

    /// Mark an object as used in the current frame.
    pub fn use_object(&mut self, id: ObjectId) -> bool {
        let frame = self.frame;
        match self.registry.get_mut(id) {
            Some(object) => {
                object.mark_used(frame);
                true
            }
            None => false,
        }
    }

    /// Typed form of [`Self::use_object`].
    pub fn use_handle<T: TypedResource>(&mut self, handle: Handle<T>) -> bool {
        self.contains_handle(handle) && self.use_object(handle.id())
    }

    /// Number of live objects.
    pub fn object_count(&self) -> usize {
        self.registry.objects.len()
    }

    /// One bit per id, set for live ids and the reserved id 0.
    pub fn id_bitmap(&self) -> &Bitset {
        self.registry.ids.bitmap()
    }

    /// Start a frame.
    pub fn begin(&mut self) -> Result<()> {
        if self.in_frame {
            return Err(GpuError::InvalidState("begin called twice".to_string()));
        }
        self.in_frame = true;
        Ok(())
    }

    /// Finish the current frame.
    pub fn end(&mut self) -> Result<()> {
        if !self.in_frame {
            return Err(GpuError::InvalidState("end called without begin".to_string()));
        }
        self.in_frame = false;
        self.frame += 1;
        Ok(())
    }

    /// Number of completed frames.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Frames in flight.
    pub fn buffering(&self) -> u32 {
        self.config.buffering
    }

    /// Index of the per-frame resources the current frame uses.
    pub fn current_buffer(&self) -> u32 {
        (self.frame % u64::from(self.config.buffering)) as u32
    }

    /// Wait for the device to finish all submitted work.
    pub fn finish(&self) -> Result<()> {
        self.backend.wait_idle()
    }

    /// Create the presentation surface, replacing any existing one.
    pub fn init_surface(&mut self, target: &SurfaceTarget) -> Result<()> {
        self.destroy_surface();
        self.backend.init_surface(target)?;
        self.has_surface = true;
        debug!(width = target.width, height = target.height, "surface created");
        Ok(())
    }

    /// Destroy the presentation surface, if any.
    pub fn destroy_surface(&mut self) {
        if std::mem::take(&mut self.has_surface) {
            self.backend.destroy_surface();
            debug!("surface destroyed");
        }
    }

    /// Whether a surface is attached.
    pub fn has_surface(&self) -> bool {
        self.has_surface
    }

    /// Log every live object, grouped by kind.
    pub fn log_objects(&self) {
        for kind in ObjectKind::ALL {
            let ids = self.ids_of(kind);
            if ids.is_empty() {
                continue;
            }
            debug!(%kind, count = ids.len(), "live objects");
            for object in ids.iter().filter_map(|&id| self.registry.get(id)) {
                debug!(
                    id = %object.id(),
                    refs = object.ref_count(),
                    last_used = ?object.last_used_frame(),
                    "  {}",
                    object.name()
                );
            }
        }
    }

    /// Release every object regardless of holders, then all GPU memory and
    /// the surface. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Err(e) = self.backend.wait_idle() {
            warn!(error = %e, "wait_idle failed during shutdown");
        }

        let objects = self.registry.objects.clear();
        let released = objects.len();
        self.registry.by_kind.clear();
        self.registry.by_id.clear();
        self.registry.ids = IdAllocator::new(self.config.max_id);

        for object in objects {
            let mut resource = object.into_resource();
            if let Err(e) = resource.release(&mut self.backend, &mut self.memory) {
                error!(error = %e, ?resource, "failed to release resource");
            }
        }

        self.memory.shutdown(&mut self.backend);
        self.destroy_surface();

        info!(objects = released, frames = self.frame, "graphics shut down");
    }

    /// Release a resource that left the registry, then drop the holders it
    /// had on other objects.
    fn release_resource(&mut self, mut resource: Box<dyn Resource>) {
        let dependencies = resource.dependencies();
        if let Err(e) = resource.release(&mut self.backend, &mut self.memory) {
            error!(error = %e, ?resource, "failed to release resource");
        }
        for id in dependencies {
            self.destroy_id(id);
        }
    }
}

impl<B: GraphicsBackend> Drop for Graphics<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
