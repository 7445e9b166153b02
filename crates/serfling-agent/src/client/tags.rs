//! Cached view of the local node's tags.

use std::collections::BTreeMap;

use super::serf::{SerfClient, SerfError};

/// Tags of the local node, loaded once and kept in sync with writes.
///
/// Changes made by other clients are only seen after [`TagCache::reload`].
#[derive(Debug, Clone)]
pub struct TagCache {
    client: SerfClient,
    tags: BTreeMap<String, String>,
}

impl TagCache {
    pub async fn load(client: SerfClient) -> Result<Self, SerfError> {
        let tags = client.get_tags().await?;
        Ok(Self { client, tags })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Set `key` to `value`, or delete it when `value` is `None`.
    ///
    /// Setting the cached value again does not call serf.
    pub async fn set(&mut self, key: &str, value: Option<&str>) -> Result<(), SerfError> {
        let Some(value) = value else {
            return self.delete(key).await;
        };
        if self.get(key) == Some(value) {
            return Ok(());
        }
        self.client.set_tag(key, value).await?;
        self.tags.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub async fn update<'a, I>(&mut self, tags: I) -> Result<(), SerfError>
    where
        I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
    {
        for (key, value) in tags {
            self.set(key, value).await?;
        }
        Ok(())
    }

    pub async fn delete(&mut self, key: &str) -> Result<(), SerfError> {
        self.client.delete_tag(key).await?;
        self.tags.remove(key);
        Ok(())
    }

    pub async fn reload(&mut self) -> Result<(), SerfError> {
        self.tags = self.client.get_tags().await?;
        Ok(())
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.tags.clone()
    }
}
