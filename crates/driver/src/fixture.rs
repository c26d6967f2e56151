//! Test fixture access
//!
//! Processors that need pre-provisioned data (user accounts, documents) pull
//! it from a [`FixtureSource`]. A source that runs dry yields `None` and the
//! processor records [`EventResult::skipped`](crate::engine::EventResult::skipped)
//! instead of failing.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

/// Supplies fixture items to processors
#[async_trait]
pub trait FixtureSource<T>: Send + Sync + 'static {
    /// Next item, or `None` when no fixture data is available
    async fn fetch(&self) -> Option<T>;
}

/// Cycles through a fixed list of items
#[derive(Debug)]
pub struct VecFixtureSource<T> {
    items: Vec<T>,
    cursor: AtomicUsize,
}

impl<T> VecFixtureSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl<T> FixtureSource<T> for VecFixtureSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn fetch(&self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.items.len();
        self.items.get(index).cloned()
    }
}
