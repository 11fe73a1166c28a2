use crate::error::{IndexerError, IndexerResult};
use crate::node::NodeClient;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Chain modules enabled on the node, fetched once per process.
pub struct ModuleRegistry {
    node: Arc<dyn NodeClient>,
    modules: OnceCell<Arc<Vec<String>>>,
}

impl ModuleRegistry {
    pub fn new(node: Arc<dyn NodeClient>) -> Self {
        Self {
            node,
            modules: OnceCell::new(),
        }
    }

    pub async fn enabled_modules(&self) -> IndexerResult<Arc<Vec<String>>> {
        self.modules
            .get_or_try_init(|| async {
                let modules = self.node.get_registered_modules().await?;
                tracing::info!(?modules, "registered chain modules");
                Ok::<_, IndexerError>(Arc::new(modules))
            })
            .await
            .map(Arc::clone)
    }

    pub async fn is_enabled(&self, module: &str) -> IndexerResult<bool> {
        Ok(self
            .enabled_modules()
            .await?
            .iter()
            .any(|name| name == module))
    }
}
