use crate::operations::run_blocking;
use crate::{CatalogStore, ItemRecord, Result};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct ReadItemsOperation {
    catalog_store: Arc<CatalogStore>,
    timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadItemOperationOutcome {
    Found(ItemRecord),
    NotFound,
}

impl ReadItemsOperation {
    pub fn new(catalog_store: Arc<CatalogStore>, timeout: Duration) -> Self {
        Self {
            catalog_store,
            timeout,
        }
    }

    pub async fn list(&self) -> Result<Vec<ItemRecord>> {
        let store = self.catalog_store.clone();
        run_blocking(self.timeout, move || store.list_items()).await
    }

    pub async fn search(&self, keyword: &str) -> Result<Vec<ItemRecord>> {
        let store = self.catalog_store.clone();
        let keyword = keyword.to_string();
        run_blocking(self.timeout, move || store.search_items(&keyword)).await
    }

    pub async fn get(&self, id: i64) -> Result<ReadItemOperationOutcome> {
        let store = self.catalog_store.clone();
        let item = run_blocking(self.timeout, move || store.get_item(id)).await?;

        Ok(match item {
            Some(item) => ReadItemOperationOutcome::Found(item),
            None => ReadItemOperationOutcome::NotFound,
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let store = self.catalog_store.clone();
        run_blocking(self.timeout, move || store.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CatalogStoreOptions;

    #[tokio::test]
    async fn test_list_search_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            CatalogStore::open(&dir.path().join("db.sqlite3"), &CatalogStoreOptions::default())
                .unwrap(),
        );
        store.create_item("Book", "Fiction", "default.jpg").unwrap();
        store.create_item("Lamp", "Home", "default.jpg").unwrap();

        let operation = ReadItemsOperation::new(store, Duration::from_secs(5));
        operation.ping().await.unwrap();

        let all = operation.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(operation.search("").await.unwrap(), all);
        assert_eq!(operation.search("am").await.unwrap(), vec![all[1].clone()]);

        assert_eq!(
            operation.get(all[0].id).await.unwrap(),
            ReadItemOperationOutcome::Found(all[0].clone())
        );
        assert_eq!(
            operation.get(9999).await.unwrap(),
            ReadItemOperationOutcome::NotFound
        );
    }
}
