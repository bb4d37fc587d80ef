//! Lazily loaded, shared, read-only model handles.

use std::fmt;
use std::sync::{Arc, OnceLock};

type Loader<T> = Box<dyn Fn() -> Result<T, String> + Send + Sync>;

/// A model that is loaded on first use and shared by every worker after that.
///
/// Concurrent first calls block on a single load. A failed load is sticky:
/// every later `get` reports the same error without retrying.
pub struct ModelHandle<T> {
    name: &'static str,
    cell: OnceLock<Result<Arc<T>, String>>,
    loader: Loader<T>,
}

impl<T> ModelHandle<T> {
    pub fn lazy<E, F>(name: &'static str, loader: F) -> Self
    where
        E: fmt::Display,
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        Self {
            name,
            cell: OnceLock::new(),
            loader: Box::new(move || loader().map_err(|e| e.to_string())),
        }
    }

    /// A handle around an already constructed model.
    pub fn ready(name: &'static str, model: T) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Ok(Arc::new(model)));
        Self {
            name,
            cell,
            loader: Box::new(|| Err("model was provided pre-loaded".into())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self) -> Result<Arc<T>, String> {
        self.cell
            .get_or_init(|| {
                tracing::info!(model = self.name, "loading model");
                let loaded = (self.loader)().map(Arc::new);
                if let Err(e) = &loaded {
                    tracing::error!(model = self.name, error = %e, "model load failed");
                }
                loaded
            })
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}
