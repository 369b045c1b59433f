use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TalkError {
    #[error("talk protocol already registered")]
    AlreadyRegistered,
}

/// A user sub-protocol riding on the talk channel.
///
/// Handlers run synchronously inside ingress processing, one datagram at a
/// time, and must not block.
pub trait TalkHandler: Send + Sync {
    fn handle(&self, request: &[u8]) -> Vec<u8>;
}

/// Registration table of talk sub-protocols, addressed by an opaque
/// byte-string id. At most one handler per id.
#[derive(Default)]
pub struct TalkRegistry {
    handlers: RwLock<FxHashMap<Vec<u8>, Arc<dyn TalkHandler>>>,
}

impl TalkRegistry {
    pub fn register(
        &self,
        protocol: Vec<u8>,
        handler: Arc<dyn TalkHandler>,
    ) -> Result<(), TalkError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&protocol) {
            return Err(TalkError::AlreadyRegistered);
        }
        handlers.insert(protocol, handler);
        Ok(())
    }

    /// Dispatches a talk request. An unknown protocol id yields an empty
    /// response: protocol-level OK, application-level empty.
    pub fn handle(&self, protocol: &[u8], request: &[u8]) -> Vec<u8> {
        let handler = self.handlers.read().get(protocol).cloned();
        match handler {
            Some(handler) => handler.handle(request),
            None => Vec::new(),
        }
    }

    pub fn is_registered(&self, protocol: &[u8]) -> bool {
        self.handlers.read().contains_key(protocol)
    }
}

impl std::fmt::Debug for TalkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self
            .handlers
            .read()
            .keys()
            .map(|id| String::from_utf8_lossy(id).into_owned())
            .collect();
        f.debug_struct("TalkRegistry").field("protocols", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl TalkHandler for Echo {
        fn handle(&self, request: &[u8]) -> Vec<u8> {
            request.to_vec()
        }
    }

    #[test]
    fn dispatches_to_the_registered_handler() {
        let registry = TalkRegistry::default();
        registry.register(b"echo".to_vec(), Arc::new(Echo)).unwrap();

        assert_eq!(registry.handle(b"echo", b"hello"), b"hello".to_vec());
    }

    #[test]
    fn unknown_protocol_yields_empty_response() {
        let registry = TalkRegistry::default();
        assert_eq!(registry.handle(b"nope", b"hello"), Vec::<u8>::new());
    }

    #[test]
    fn second_registration_is_rejected() {
        let registry = TalkRegistry::default();
        registry.register(b"p".to_vec(), Arc::new(Echo)).unwrap();
        assert_eq!(
            registry.register(b"p".to_vec(), Arc::new(Echo)),
            Err(TalkError::AlreadyRegistered)
        );
    }
}
