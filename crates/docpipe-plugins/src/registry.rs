//! Id-to-instance registries.
//!
//! Tuples address fetchers and emitters by opaque id strings; the registries
//! resolve those ids at the two points where the pipeline touches the outside
//! world (worker fetch, batched emit).

use std::collections::HashMap;
use std::sync::Arc;

use crate::emitter::Emitter;
use crate::fetcher::Fetcher;

#[derive(Default, Clone)]
pub struct FetcherRegistry {
    fetchers: HashMap<String, Arc<dyn Fetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fetcher: Arc<dyn Fetcher>) -> &mut Self {
        self.fetchers.insert(fetcher.id().to_string(), fetcher);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Fetcher>> {
        self.fetchers.get(id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }
}

#[derive(Default, Clone)]
pub struct EmitterRegistry {
    emitters: HashMap<String, Arc<dyn Emitter>>,
}

impl EmitterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, emitter: Arc<dyn Emitter>) -> &mut Self {
        self.emitters.insert(emitter.id().to_string(), emitter);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Emitter>> {
        self.emitters.get(id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.emitters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::StdoutEmitter;
    use crate::fetcher::FileSystemFetcher;

    #[test]
    fn lookup_by_id() {
        let mut fetchers = FetcherRegistry::new();
        fetchers.register(Arc::new(FileSystemFetcher::new("fs", "/tmp")));
        assert!(fetchers.get("fs").is_some());
        assert!(fetchers.get("s3").is_none());

        let mut emitters = EmitterRegistry::new();
        emitters.register(Arc::new(StdoutEmitter::new("stdout")));
        assert!(emitters.get("stdout").is_some());
        assert!(emitters.get("index").is_none());
    }

    #[test]
    fn later_registration_wins() {
        let mut fetchers = FetcherRegistry::new();
        fetchers.register(Arc::new(FileSystemFetcher::new("fs", "/a")));
        fetchers.register(Arc::new(FileSystemFetcher::new("fs", "/b")));
        assert!(fetchers.get("fs").is_some());
    }
}
