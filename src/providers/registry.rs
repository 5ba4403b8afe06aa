//! # 适配器注册表
//!
//! 按供应商类型分发到对应适配器。

use std::collections::HashMap;
use std::sync::Arc;

use super::claude::ClaudeAdapter;
use super::gemini::GeminiAdapter;
use super::openai::OpenAiAdapter;
use super::traits::ProviderAdapter;
use crate::channel::VendorType;
use crate::config::{ClaudeSettings, GeminiSettings};
use crate::error::Result;

/// 供应商类型到适配器的映射
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<VendorType, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    /// 注册全部内置适配器
    pub fn new(claude: ClaudeSettings, gemini: GeminiSettings) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(OpenAiAdapter::openai()));
        registry.register(Arc::new(OpenAiAdapter::volcengine()));
        registry.register(Arc::new(ClaudeAdapter::new(claude)));
        registry.register(Arc::new(GeminiAdapter::new(gemini)));
        registry
    }

    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// 注册或替换适配器
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.vendor(), adapter);
    }

    pub fn get(&self, vendor: VendorType) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&vendor).cloned().ok_or_else(|| {
            crate::internal_error!("no adapter registered for vendor {}", vendor.as_str())
        })
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new(ClaudeSettings::default(), GeminiSettings::default())
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut vendors: Vec<&str> = self.adapters.keys().map(|v| v.as_str()).collect();
        vendors.sort_unstable();
        f.debug_struct("AdapterRegistry")
            .field("vendors", &vendors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_vendor_has_an_adapter() {
        let registry = AdapterRegistry::default();
        assert_eq!(registry.len(), 4);
        for vendor in [
            VendorType::OpenAi,
            VendorType::Claude,
            VendorType::Gemini,
            VendorType::VolcEngine,
        ] {
            assert_eq!(registry.get(vendor).unwrap().vendor(), vendor);
        }
    }

    #[test]
    fn missing_vendor_is_internal_error() {
        let registry = AdapterRegistry::empty();
        assert!(registry.is_empty());
        let Err(err) = registry.get(VendorType::Claude) else {
            panic!("empty registry returned an adapter");
        };
        assert_eq!(err.to_http_response_parts().0.as_u16(), 500);
    }
}
