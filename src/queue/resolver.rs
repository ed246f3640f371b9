use std::collections::HashMap;
use std::sync::Arc;
use crate::core::{ErrorCategory, ItemCallbacks, ItemError, RegistrarFactory, UploadItem};

/// Error code stored on items whose callbacks could not be rebuilt.
pub const CALLBACK_UNRESOLVED: &str = "callback_unresolved";

/// Rebuilds item callbacks from persisted fields after a restart.
///
/// One strategy per context type. Items whose type has no strategy, or whose
/// context id is missing, fail instead of uploading a file nobody can register.
#[derive(Default, Clone)]
pub struct CallbackResolver {
    strategies: HashMap<String, Arc<dyn RegistrarFactory>>,
}

impl CallbackResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy<F>(mut self, context_type: impl Into<String>, factory: F) -> Self
    where
        F: RegistrarFactory + 'static,
    {
        self.register(context_type, factory);
        self
    }

    pub fn register<F>(&mut self, context_type: impl Into<String>, factory: F)
    where
        F: RegistrarFactory + 'static,
    {
        self.strategies.insert(context_type.into(), Arc::new(factory));
    }

    pub fn context_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn resolve(&self, item: &UploadItem) -> Result<ItemCallbacks, ItemError> {
        if item.context_id.is_empty() {
            return Err(unresolved(format!(
                "Upload {} has no context id, manual retry required",
                item.filename
            )));
        }

        let factory = self.strategies.get(&item.context_type).ok_or_else(|| {
            unresolved(format!(
                "No registration strategy for context type '{}', manual retry required",
                item.context_type
            ))
        })?;

        Ok(factory.build(&item.context_id, item.set_id.as_deref()))
    }
}

fn unresolved(message: String) -> ItemError {
    ItemError::new(ErrorCategory::Unknown, message).with_code(CALLBACK_UNRESOLVED)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use async_trait::async_trait;
    use crate::core::{
        FileInput, MediaRecord, MediaRegistrar, RegistrationContext, TransferError,
        TransferResponse, UploadRequest,
    };
    use super::*;

    struct NoopRegistrar;

    #[async_trait]
    impl MediaRegistrar for NoopRegistrar {
        async fn register(
            &self,
            _response: &TransferResponse,
            _file: &FileInput,
            _context: &RegistrationContext,
        ) -> Result<MediaRecord, TransferError> {
            Ok(MediaRecord::from_value(serde_json::json!({ "id": "m-1" })))
        }
    }

    fn item(context_type: &str, context_id: &str) -> UploadItem {
        let file = FileInput::new("a.jpg", "image/jpeg", vec![0u8; 4]);
        let request = UploadRequest::new(context_type, context_id).with_set("set-1");
        UploadItem::new(&file, &request, 0)
    }

    #[test]
    fn test_resolves_known_context_type() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let resolver = CallbackResolver::new().with_strategy("collection", {
            let seen = seen.clone();
            move |context_id: &str, set_id: Option<&str>| {
                seen.lock().unwrap().push((context_id.to_string(), set_id.map(str::to_string)));
                ItemCallbacks::new(Arc::new(NoopRegistrar))
            }
        });

        assert!(resolver.resolve(&item("collection", "col-9")).is_ok());
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[("col-9".to_string(), Some("set-1".to_string()))]
        );
    }

    #[test]
    fn test_unknown_context_type_fails_closed() {
        let resolver = CallbackResolver::new()
            .with_strategy("collection", |_: &str, _: Option<&str>| ItemCallbacks::new(Arc::new(NoopRegistrar)));

        let error = resolver.resolve(&item("proofing", "p-1")).err().unwrap();
        assert_eq!(error.code.as_deref(), Some(CALLBACK_UNRESOLVED));
        assert_eq!(error.category, ErrorCategory::Unknown);
        assert!(error.message.contains("manual retry required"));

        let error = resolver.resolve(&item("collection", "")).err().unwrap();
        assert_eq!(error.code.as_deref(), Some(CALLBACK_UNRESOLVED));
    }

    #[test]
    fn test_context_types_are_sorted() {
        let resolver = CallbackResolver::new()
            .with_strategy("selection", |_: &str, _: Option<&str>| ItemCallbacks::new(Arc::new(NoopRegistrar)))
            .with_strategy("collection", |_: &str, _: Option<&str>| ItemCallbacks::new(Arc::new(NoopRegistrar)));

        assert_eq!(resolver.context_types(), vec!["collection", "selection"]);
    }
}
