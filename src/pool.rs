use serde::Serialize;

use crate::error::ConfigError;

/// An immutable ordered sequence with a wrapping cursor.
#[derive(Debug, Clone)]
pub struct RoundRobin<T> {
    items: Vec<T>,
    cursor: usize,
}

impl<T> RoundRobin<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Returns the current item and advances by one, wrapping at the end.
    pub fn next_item(&mut self) -> Option<&T> {
        if self.items.is_empty() {
            return None;
        }
        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.items.len();
        self.items.get(index)
    }
}

pub type NodePool = RoundRobin<String>;
pub type ProxyPool = RoundRobin<String>;

/// The node and optional proxy used for one transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub node: String,
    pub proxy: Option<String>,
}

/// Node and proxy pools rotating independently, one step per attempt.
#[derive(Debug, Clone)]
pub struct Routes {
    nodes: NodePool,
    proxies: ProxyPool,
}

impl Routes {
    pub fn new(nodes: Vec<String>, proxies: Vec<String>) -> Result<Self, ConfigError> {
        if nodes.is_empty() {
            return Err(ConfigError::EmptyNodes);
        }
        Ok(Self {
            nodes: RoundRobin::new(nodes),
            proxies: RoundRobin::new(proxies),
        })
    }

    pub fn nodes(&self) -> &[String] {
        self.nodes.items()
    }

    pub fn proxies(&self) -> &[String] {
        self.proxies.items()
    }

    /// An empty proxy pool means direct connections.
    pub fn next_route(&mut self) -> Route {
        let node = self.nodes.next_item().cloned().unwrap_or_default();
        let proxy = self.proxies.next_item().cloned();
        Route { node, proxy }
    }
}
