//! Client for a running serf agent, driven through the `serf` CLI.

pub mod serf;
pub mod tags;

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
pub(crate) mod testing;

pub use serf::{MemberFilter, MemberInfo, QueryOptions, SerfClient, SerfError};
pub use tags::TagCache;

impl SerfClient {
    /// Load a [`TagCache`] for the local node.
    pub async fn tags(&self) -> Result<TagCache, SerfError> {
        TagCache::load(self.clone()).await
    }
}
