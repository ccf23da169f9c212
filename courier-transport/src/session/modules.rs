//! Ordered module chain for inbound request dispatch.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{MessageCodec, PacketRegistry, RequestPacket, ResponsePacket};

use super::Session;

/// Boxed error type surfaced by handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Mutable dispatch context for one inbound request.
///
/// Handlers that claim the request call [`RequestContext::respond`]; the
/// first one to do so short-circuits the chain.
pub struct RequestContext {
    /// The decoded request.
    pub request: RequestPacket,
    /// `origin` header of the carrying packet: the requesting user, empty
    /// for pre-authentication traffic.
    pub origin: String,
    /// Whether some handler claimed this request.
    pub handled: bool,
    /// The response to send back, if any handler produced one.
    pub response: Option<ResponsePacket>,
}

impl RequestContext {
    pub(crate) fn new(request: RequestPacket, origin: String) -> Self {
        Self {
            request,
            origin,
            handled: false,
            response: None,
        }
    }

    /// Claim the request and set its response.
    pub fn respond(&mut self, response: ResponsePacket) {
        self.response = Some(response);
        self.handled = true;
    }
}

/// A pluggable handler attached to a session.
///
/// Modules see every inbound request in insertion order until one claims
/// it. `register_packets` runs while the session is being built, which is
/// the only window where the packet registry is still mutable.
#[async_trait]
pub trait SessionModule<C: MessageCodec>: Any + Send + Sync {
    /// Register application packet types this module understands.
    fn register_packets(&self, registry: &mut PacketRegistry<C>) {
        let _ = registry;
    }

    /// Inspect (and possibly claim) an inbound request.
    async fn handle_request(
        &self,
        session: &Session<C>,
        context: &mut RequestContext,
    ) -> Result<(), BoxError>;

    /// Called once when the owning session is disposed, in insertion
    /// order.
    fn dispose(&self) {}
}

/// Insertion-ordered module collection with O(1) lookup by type.
pub struct ModuleRegistry<C: MessageCodec> {
    modules: Vec<Arc<dyn SessionModule<C>>>,
    by_type: HashMap<TypeId, usize>,
}

impl<C: MessageCodec> ModuleRegistry<C> {
    pub(crate) fn new() -> Self {
        Self {
            modules: Vec::new(),
            by_type: HashMap::new(),
        }
    }

    /// Append a module. Each module type may appear once.
    pub(crate) fn add<M: SessionModule<C>>(&mut self, module: M) {
        let type_id = TypeId::of::<M>();
        assert!(
            !self.by_type.contains_key(&type_id),
            "module type registered twice"
        );
        self.by_type.insert(type_id, self.modules.len());
        self.modules.push(Arc::new(module));
    }

    /// Look up an attached module by its concrete type.
    pub fn get<M: SessionModule<C>>(&self) -> Option<&M> {
        let index = *self.by_type.get(&TypeId::of::<M>())?;
        let module: &dyn Any = self.modules[index].as_ref();
        module.downcast_ref::<M>()
    }

    /// Number of attached modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether no modules are attached.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<dyn SessionModule<C>>> {
        self.modules.iter()
    }

    pub(crate) fn dispose_all(&self) {
        for module in &self.modules {
            module.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::JsonCodec;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct EchoModule {
        disposed: AtomicBool,
    }

    #[async_trait]
    impl SessionModule<JsonCodec> for EchoModule {
        async fn handle_request(
            &self,
            _session: &Session<JsonCodec>,
            context: &mut RequestContext,
        ) -> Result<(), BoxError> {
            context.respond(ResponsePacket::ok(&context.request.clone()));
            Ok(())
        }

        fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct PassModule;

    #[async_trait]
    impl SessionModule<JsonCodec> for PassModule {
        async fn handle_request(
            &self,
            _session: &Session<JsonCodec>,
            _context: &mut RequestContext,
        ) -> Result<(), BoxError> {
            Ok(())
        }
    }

    #[test]
    fn lookup_by_type() {
        let mut registry = ModuleRegistry::<JsonCodec>::new();
        registry.add(PassModule);
        registry.add(EchoModule::default());

        assert_eq!(registry.len(), 2);
        assert!(registry.get::<EchoModule>().is_some());
        assert!(registry.get::<PassModule>().is_some());
    }

    #[test]
    fn iteration_preserves_insertion_order() {
        let mut registry = ModuleRegistry::<JsonCodec>::new();
        registry.add(PassModule);
        registry.add(EchoModule::default());

        let count = registry.iter().count();
        assert_eq!(count, 2);
        // PassModule was inserted first.
        let first: &dyn Any = registry
            .iter()
            .next()
            .expect("two modules")
            .as_ref();
        assert!(first.downcast_ref::<PassModule>().is_some());
    }

    #[test]
    fn dispose_reaches_every_module() {
        let mut registry = ModuleRegistry::<JsonCodec>::new();
        registry.add(EchoModule::default());
        registry.dispose_all();
        let module = registry.get::<EchoModule>().expect("present");
        assert!(module.disposed.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_module_type_panics() {
        let mut registry = ModuleRegistry::<JsonCodec>::new();
        registry.add(PassModule);
        registry.add(PassModule);
    }

    #[test]
    fn context_respond_claims_the_request() {
        let request = RequestPacket::new("probe");
        let mut context = RequestContext::new(request, "userA".to_string());
        assert!(!context.handled);

        let response = ResponsePacket::ok(&context.request.clone());
        context.respond(response);
        assert!(context.handled);
        assert!(context.response.is_some());
    }
}
