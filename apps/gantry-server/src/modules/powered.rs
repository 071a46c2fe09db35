use std::sync::Arc;

use serde_json::json;

use gantry::{AppContext, Extension, Kernel};

/// Stamps an `X-Powered-By` header on every response. Applications
/// override the header name or value under `gantry:extension:powered`.
struct PoweredExtension;

impl Extension for PoweredExtension {
    fn default_config(&self) -> Option<(&'static str, serde_json::Value)> {
        Some((
            "powered",
            json!({"header": "X-Powered-By", "value": "gantry"}),
        ))
    }

    fn load(&self, app: &mut AppContext) -> anyhow::Result<()> {
        let header = app
            .config
            .get_str("gantry:extension:powered:header")
            .unwrap_or_else(|| "X-Powered-By".to_string());
        let value = app
            .config
            .get_str("gantry:extension:powered:value")
            .unwrap_or_else(|| "gantry".to_string());
        app.add_response_header(&header, &value)
    }
}

pub fn register(kernel: &mut Kernel) {
    kernel
        .library_mut()
        .register_extension_package("powered", Arc::new(PoweredExtension));
}
