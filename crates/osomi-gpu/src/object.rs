//! Identity records for GPU-resident objects.
//!
//! Every texture, buffer, sampler and shader the registry hands out is wrapped
//! in a [`GraphicsObject`] carrying its id, kind, name and ref-count. The
//! concrete resource sits behind `Box<dyn Resource>` and is reached again
//! through a typed [`Handle`].

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::backend::GraphicsBackend;
use crate::error::Result;
use crate::graphics::InitContext;
use crate::memory::GpuMemoryAllocator;

/// Identifier of a live object; 0 is never handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u32);

impl ObjectId {
    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw id value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Resource type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    Texture,
    Sampler,
    ShaderStage,
    Shader,
}

impl ObjectKind {
    /// Every kind, in listing order.
    pub const ALL: [Self; 5] = [
        Self::Buffer,
        Self::Texture,
        Self::Sampler,
        Self::ShaderStage,
        Self::Shader,
    ];

    /// Lowercase name used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Buffer => "buffer",
            Self::Texture => "texture",
            Self::Sampler => "sampler",
            Self::ShaderStage => "shader stage",
            Self::Shader => "shader",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed reference to a registered object.
///
/// Handles are plain ids; they do not keep the object alive. Use
/// `Graphics::retain` to add a holder.
pub struct Handle<T> {
    id: ObjectId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) const fn new(id: ObjectId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Id of the referenced object.
    #[inline]
    pub const fn id(self) -> ObjectId {
        self.id
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle<{}>({})", std::any::type_name::<T>(), self.id)
    }
}

/// Upcast to [`Any`] for downcasting boxed resources.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A GPU resource owned by the registry.
pub trait Resource: AsAny + fmt::Debug {
    /// Destroy native handles and return GPU memory.
    ///
    /// Called exactly once, when the last holder lets go or at shutdown.
    fn release(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        memory: &mut GpuMemoryAllocator,
    ) -> Result<()>;

    /// Objects this resource holds a reference to. Each is released after
    /// the resource itself.
    fn dependencies(&self) -> Vec<ObjectId> {
        Vec::new()
    }
}

/// A resource with a fixed kind tag.
pub trait TypedResource: Resource + Sized + 'static {
    const KIND: ObjectKind;
}

/// Creation parameters for a resource.
pub trait ResourceInfo {
    type Resource: TypedResource;

    /// Build the resource. On error everything acquired so far must already
    /// have been released.
    fn init(self, ctx: &mut InitContext<'_>) -> Result<Self::Resource>;
}

/// Result of a destroy request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// The last holder let go; the object is gone.
    Freed,
    /// Other holders remain; only the ref-count dropped.
    StillReferenced,
    /// No live object of the requested kind has that id.
    NotFound,
}

impl DestroyOutcome {
    /// True for [`DestroyOutcome::Freed`].
    #[inline]
    pub const fn is_freed(self) -> bool {
        matches!(self, Self::Freed)
    }
}

/// Registry record of one live object.
pub struct GraphicsObject {
    id: ObjectId,
    kind: ObjectKind,
    name: String,
    ref_count: i32,
    last_used_frame: Option<u64>,
    resource: Box<dyn Resource>,
}

impl GraphicsObject {
    pub(crate) fn new(
        id: ObjectId,
        kind: ObjectKind,
        name: String,
        resource: Box<dyn Resource>,
    ) -> Self {
        Self {
            id,
            kind,
            name,
            ref_count: 1,
            last_used_frame: None,
            resource,
        }
    }

    /// Registry id.
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Kind tag of the resource.
    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Debug name given at creation.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of holders.
    #[inline]
    pub fn ref_count(&self) -> i32 {
        self.ref_count
    }

    /// Frame the object was last marked as used in.
    #[inline]
    pub fn last_used_frame(&self) -> Option<u64> {
        self.last_used_frame
    }

    /// The type-erased resource.
    pub fn resource(&self) -> &dyn Resource {
        &*self.resource
    }

    /// The resource as `T`, if it is one.
    pub fn downcast_ref<T: TypedResource>(&self) -> Option<&T> {
        let resource: &dyn Resource = &*self.resource;
        resource.as_any().downcast_ref()
    }

    /// Mutable access to the resource as `T`.
    pub fn downcast_mut<T: TypedResource>(&mut self) -> Option<&mut T> {
        let resource: &mut dyn Resource = &mut *self.resource;
        resource.as_any_mut().downcast_mut()
    }

    pub(crate) fn retain(&mut self) {
        self.ref_count += 1;
    }

    /// Drop one holder. True when none are left.
    pub(crate) fn release_ref(&mut self) -> bool {
        self.ref_count -= 1;
        self.ref_count <= 0
    }

    pub(crate) fn mark_used(&mut self, frame: u64) {
        self.last_used_frame = Some(frame);
    }

    pub(crate) fn into_resource(self) -> Box<dyn Resource> {
        self.resource
    }
}

impl fmt::Debug for GraphicsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsObject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("ref_count", &self.ref_count)
            .field("last_used_frame", &self.last_used_frame)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Dummy(u32);

    impl Resource for Dummy {
        fn release(
            &mut self,
            _: &mut dyn GraphicsBackend,
            _: &mut GpuMemoryAllocator,
        ) -> Result<()> {
            Ok(())
        }
    }

    impl TypedResource for Dummy {
        const KIND: ObjectKind = ObjectKind::Buffer;
    }

    #[derive(Debug)]
    struct Other;

    impl Resource for Other {
        fn release(
            &mut self,
            _: &mut dyn GraphicsBackend,
            _: &mut GpuMemoryAllocator,
        ) -> Result<()> {
            Ok(())
        }
    }

    impl TypedResource for Other {
        const KIND: ObjectKind = ObjectKind::Sampler;
    }

    fn object() -> GraphicsObject {
        GraphicsObject::new(
            ObjectId::new(7),
            ObjectKind::Buffer,
            "dummy".into(),
            Box::new(Dummy(3)),
        )
    }

    #[test]
    fn downcast_reaches_the_boxed_resource() {
        let mut obj = object();
        assert_eq!(obj.downcast_ref::<Dummy>(), Some(&Dummy(3)));
        assert!(obj.downcast_ref::<Other>().is_none());

        obj.downcast_mut::<Dummy>().unwrap().0 = 9;
        assert_eq!(obj.downcast_ref::<Dummy>(), Some(&Dummy(9)));
    }

    #[test]
    fn ref_count_reaches_zero_after_matching_releases() {
        let mut obj = object();
        assert_eq!(obj.ref_count(), 1);
        obj.retain();
        assert!(!obj.release_ref());
        assert!(obj.release_ref());
    }

    #[test]
    fn handles_compare_by_id() {
        let a = Handle::<Dummy>::new(ObjectId::new(4));
        let b = a;
        assert_eq!(a, b);
        assert_eq!(b.id().raw(), 4);
        assert_ne!(a, Handle::new(ObjectId::new(5)));
    }

    #[test]
    fn kinds_display_readable_names() {
        assert_eq!(ObjectKind::ShaderStage.to_string(), "shader stage");
        assert_eq!(ObjectId::new(12).to_string(), "#12");
        assert_eq!(ObjectKind::ALL.len(), 5);
    }
}
