use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::XgressError;
use crate::xgress::handlers::BindHandler;
use crate::xgress::options::OptionsData;
use crate::xgress::payload::Address;

/// Accepts inbound circuits for a hosted service
#[async_trait]
pub trait Listener: Send + Sync {
    async fn listen(&self, address: &str, bind_handler: Arc<dyn BindHandler>) -> anyhow::Result<()>;
}

/// Opens outbound circuits to a destination
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, destination: &str, circuit_id: &str, address: &Address, bind_handler: Arc<dyn BindHandler>) -> anyhow::Result<()>;
}

/// A transport binding, creating listeners and dialers from binding-specific configuration
pub trait Factory: Send + Sync {
    fn create_listener(&self, options_data: &OptionsData) -> anyhow::Result<Box<dyn Listener>>;
    fn create_dialer(&self, options_data: &OptionsData) -> anyhow::Result<Box<dyn Dialer>>;
}

/// The transport bindings known to a process, by name. This is populated once at startup and
///  then shared (typically in an `Arc`) with everything that needs binding lookup.
#[derive(Default)]
pub struct Registry {
    factories: FxHashMap<String, Arc<dyn Factory>>,
}
impl Registry {
    pub fn new() -> Registry {
        Default::default()
    }

    pub fn register(&mut self, name: &str, factory: Arc<dyn Factory>) {
        if self.factories.insert(name.to_string(), factory).is_some() {
            warn!("replacing previously registered binding {:?}", name);
        }
        else {
            debug!("registered binding {:?}", name);
        }
    }

    pub fn factory(&self, name: &str) -> anyhow::Result<Arc<dyn Factory>> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory.clone()),
            None => bail!(XgressError::BindingNotFound(name.to_string())),
        }
    }

    pub fn binding_names(&self) -> Vec<&str> {
        let mut result = self.factories.keys()
            .map(|s| s.as_str())
            .collect::<Vec<_>>();
        result.sort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xgress::xgress::Xgress;
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingListener {
        name: &'static str,
        addresses: Arc<Mutex<Vec<String>>>,
    }
    #[async_trait]
    impl Listener for RecordingListener {
        async fn listen(&self, address: &str, _bind_handler: Arc<dyn BindHandler>) -> anyhow::Result<()> {
            self.addresses.lock().unwrap()
                .push(format!("{}:{}", self.name, address));
            Ok(())
        }
    }

    struct RejectingDialer {}
    #[async_trait]
    impl Dialer for RejectingDialer {
        async fn dial(&self, destination: &str, _circuit_id: &str, _address: &Address, _bind_handler: Arc<dyn BindHandler>) -> anyhow::Result<()> {
            bail!("cannot reach {}", destination)
        }
    }

    struct TestFactory {
        name: &'static str,
        addresses: Arc<Mutex<Vec<String>>>,
    }
    impl Factory for TestFactory {
        fn create_listener(&self, _options_data: &OptionsData) -> anyhow::Result<Box<dyn Listener>> {
            Ok(Box::new(RecordingListener { name: self.name, addresses: self.addresses.clone() }))
        }

        fn create_dialer(&self, options_data: &OptionsData) -> anyhow::Result<Box<dyn Dialer>> {
            if options_data.get("invalid").is_some() {
                bail!("invalid dialer configuration");
            }
            Ok(Box::new(RejectingDialer {}))
        }
    }

    struct NoopBindHandler {}
    #[async_trait]
    impl BindHandler for NoopBindHandler {
        async fn handle_xgress_bind(&self, _x: &Xgress) {}
    }

    fn registry(addresses: &Arc<Mutex<Vec<String>>>) -> Registry {
        let mut registry = Registry::new();
        registry.register("tcp", Arc::new(TestFactory { name: "tcp", addresses: addresses.clone() }));
        registry.register("udp", Arc::new(TestFactory { name: "udp", addresses: addresses.clone() }));
        registry
    }

    #[rstest]
    #[case::tcp("tcp", "tcp:0.0.0.0:7000")]
    #[case::udp("udp", "udp:0.0.0.0:7000")]
    fn test_lookup(#[case] name: &str, #[case] expected: &str) {
        let addresses = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(&addresses);

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let listener = registry.factory(name).unwrap()
                .create_listener(&json!({})).unwrap();
            listener.listen("0.0.0.0:7000", Arc::new(NoopBindHandler {})).await.unwrap();
        });

        assert_eq!(addresses.lock().unwrap().as_slice(), &[expected.to_string()]);
    }

    #[rstest]
    #[case::unknown("quic")]
    #[case::empty("")]
    #[case::case_sensitive("TCP")]
    fn test_lookup_not_found(#[case] name: &str) {
        let addresses = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(&addresses);

        let err = registry.factory(name).err().unwrap();
        assert_eq!(err.downcast_ref::<XgressError>(), Some(&XgressError::BindingNotFound(name.to_string())));
        assert_eq!(err.to_string(), format!("binding not found: {}", name));
    }

    #[test]
    fn test_factory_errors_propagate() {
        let addresses = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(&addresses);
        let factory = registry.factory("tcp").unwrap();

        assert!(factory.create_dialer(&json!({"invalid": true})).is_err());

        let dialer = factory.create_dialer(&json!({})).unwrap();
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let result = rt.block_on(dialer.dial("service-host", "c1", &Address::from("a1"), Arc::new(NoopBindHandler {})));
        assert_eq!(result.unwrap_err().to_string(), "cannot reach service-host");
    }

    #[test]
    fn test_register_replaces() {
        let addresses = Arc::new(Mutex::new(Vec::new()));
        let mut registry = registry(&addresses);
        assert_eq!(registry.binding_names(), vec!["tcp", "udp"]);

        registry.register("tcp", Arc::new(TestFactory { name: "tcp2", addresses: addresses.clone() }));
        assert_eq!(registry.binding_names(), vec!["tcp", "udp"]);

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            registry.factory("tcp").unwrap()
                .create_listener(&json!({})).unwrap()
                .listen("x", Arc::new(NoopBindHandler {})).await.unwrap();
        });
        assert_eq!(addresses.lock().unwrap().as_slice(), &["tcp2:x".to_string()]);
    }
}
