//! Greeting service mounted by the demo binary

use serde_json::json;

use crate::rpc::{MethodRegistry, RegistryError, RpcMethods};

#[derive(Debug, Default)]
pub struct HelloService;

impl HelloService {
    pub fn hello(&self, name: &str) -> String {
        let name = if name.is_empty() { "there" } else { name };
        format!("Hello {name}")
    }
}

impl RpcMethods for HelloService {
    fn register(registry: &mut MethodRegistry<Self>) -> Result<(), RegistryError> {
        registry.register("hello", |service: &HelloService, params| {
            params.expect_len(1)?;
            let name: String = params.get(0)?;
            Ok(json!(service.hello(&name)))
        })
    }
}
