//! Service implementations and the directory the server dispatches from.
//!
//! A [`ServiceImpl`] is an explicit method table: each entry is keyed by the
//! method name and its ordered parameter type names, so overloads are told
//! apart the same way a request names them. A [`ServiceContainer`] supplies
//! the implementations to expose, each tagged with the one interface it
//! serves, and [`ServiceDirectory::discover`] turns that into the immutable
//! interface-name map shared by every connection.

use crate::error::{Result, RpcError};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Business method body. Errors are reported to the caller as invocation
/// failures.
pub type MethodHandler = Arc<dyn Fn(Vec<Value>) -> std::result::Result<Value, String> + Send + Sync>;

/// Method name plus ordered parameter type names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodSignature {
    pub name: String,
    pub parameter_types: Vec<String>,
}

impl std::fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.parameter_types.join(", "))
    }
}

/// A local implementation exposed over RPC.
pub struct ServiceImpl {
    interfaces: Vec<String>,
    methods: HashMap<MethodSignature, MethodHandler>,
}

impl ServiceImpl {
    pub fn builder() -> ServiceImplBuilder {
        ServiceImplBuilder::default()
    }

    /// Interfaces this implementation declares it serves.
    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn signatures(&self) -> impl Iterator<Item = &MethodSignature> {
        self.methods.keys()
    }

    /// Pick the handler for a call.
    ///
    /// With parameter types the match is exact and the argument count must
    /// equal the number of types. Without them the method is resolved by name
    /// and argument count, provided exactly one overload fits.
    pub fn resolve(
        &self,
        method_name: &str,
        parameter_types: &[String],
        arity: usize,
    ) -> Option<&MethodHandler> {
        if !parameter_types.is_empty() {
            if parameter_types.len() != arity {
                return None;
            }
            let key = MethodSignature {
                name: method_name.to_string(),
                parameter_types: parameter_types.to_vec(),
            };
            return self.methods.get(&key);
        }

        let mut candidates = self
            .methods
            .iter()
            .filter(|(sig, _)| sig.name == method_name && sig.parameter_types.len() == arity);
        match (candidates.next(), candidates.next()) {
            (Some((_, handler)), None) => Some(handler),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ServiceImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut signatures: Vec<String> = self.methods.keys().map(|s| s.to_string()).collect();
        signatures.sort();
        f.debug_struct("ServiceImpl")
            .field("interfaces", &self.interfaces)
            .field("methods", &signatures)
            .finish()
    }
}

/// Builder for [`ServiceImpl`].
#[derive(Default)]
pub struct ServiceImplBuilder {
    interfaces: Vec<String>,
    methods: HashMap<MethodSignature, MethodHandler>,
}

impl ServiceImplBuilder {
    /// Declare an interface served by this implementation.
    pub fn implements(mut self, interface_name: impl Into<String>) -> Self {
        self.interfaces.push(interface_name.into());
        self
    }

    /// Add a method. A later method with the same signature replaces the
    /// earlier one.
    pub fn method<I, S, F>(mut self, name: impl Into<String>, parameter_types: I, handler: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Vec<Value>) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        let signature = MethodSignature {
            name: name.into(),
            parameter_types: parameter_types.into_iter().map(Into::into).collect(),
        };
        self.methods.insert(signature, Arc::new(handler));
        self
    }

    pub fn build(self) -> ServiceImpl {
        ServiceImpl {
            interfaces: self.interfaces,
            methods: self.methods,
        }
    }
}

/// Source of the implementations a server exposes.
pub trait ServiceContainer: Send + Sync {
    /// Every implementation marked for export, keyed by bean name.
    fn tagged_instances(&self) -> BTreeMap<String, Arc<ServiceImpl>>;

    /// The single interface an implementation targets, if it can be resolved.
    fn target_interface(&self, service: &ServiceImpl) -> Option<String>;
}

/// Container holding an explicit list of named implementations.
///
/// The target interface is the one interface an implementation declares;
/// implementations declaring none or several cannot be resolved.
#[derive(Debug, Default)]
pub struct StaticContainer {
    beans: BTreeMap<String, Arc<ServiceImpl>>,
}

impl StaticContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, bean_name: impl Into<String>, service: ServiceImpl) -> Self {
        self.insert(bean_name, service);
        self
    }

    pub fn insert(&mut self, bean_name: impl Into<String>, service: ServiceImpl) {
        self.beans.insert(bean_name.into(), Arc::new(service));
    }
}

impl ServiceContainer for StaticContainer {
    fn tagged_instances(&self) -> BTreeMap<String, Arc<ServiceImpl>> {
        self.beans.clone()
    }

    fn target_interface(&self, service: &ServiceImpl) -> Option<String> {
        match service.interfaces() {
            [single] => Some(single.clone()),
            _ => None,
        }
    }
}

/// Interface name to implementation. Built once, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ServiceDirectory {
    services: Arc<BTreeMap<String, Arc<ServiceImpl>>>,
}

impl ServiceDirectory {
    /// Build the directory from a container.
    ///
    /// Fails with `AmbiguousOrMissingInterfaceTag` when an implementation has
    /// no single target interface, or when two implementations claim the
    /// same interface.
    pub fn discover(container: &dyn ServiceContainer) -> Result<Self> {
        info!("Discovering exported services");
        let mut services = BTreeMap::new();

        for (bean, service) in container.tagged_instances() {
            let interface = container.target_interface(&service).ok_or_else(|| {
                RpcError::AmbiguousOrMissingInterfaceTag {
                    bean: bean.clone(),
                    message: format!("declares interfaces {:?}", service.interfaces()),
                }
            })?;

            if services.contains_key(&interface) {
                return Err(RpcError::AmbiguousOrMissingInterfaceTag {
                    bean,
                    message: format!("interface {} is already served by another bean", interface),
                });
            }

            debug!("Bean {} serves {}", bean, interface);
            services.insert(interface, service);
        }

        info!(
            "Discovered {} service(s): {:?}",
            services.len(),
            services.keys().collect::<Vec<_>>()
        );
        Ok(Self {
            services: Arc::new(services),
        })
    }

    pub fn get(&self, interface_name: &str) -> Option<&Arc<ServiceImpl>> {
        self.services.get(interface_name)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Resolve a call to its handler.
    pub fn lookup(
        &self,
        interface_name: &str,
        method_name: &str,
        parameter_types: &[String],
        arity: usize,
    ) -> Result<MethodHandler> {
        let service = self.get(interface_name).ok_or_else(|| RpcError::ServiceNotFound {
            interface: interface_name.to_string(),
        })?;

        service
            .resolve(method_name, parameter_types, arity)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound {
                interface: interface_name.to_string(),
                method: method_name.to_string(),
                parameter_types: parameter_types.to_vec(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn greeter() -> ServiceImpl {
        ServiceImpl::builder()
            .implements("Greeter")
            .method("echo", ["string"], |args| Ok(args[0].clone()))
            .method("greet", ["string"], |args| {
                Ok(json!(format!("hello {}", args[0].as_str().unwrap_or_default())))
            })
            .method("greet", ["string", "string"], |args| {
                Ok(json!(format!(
                    "{} {}",
                    args[1].as_str().unwrap_or_default(),
                    args[0].as_str().unwrap_or_default()
                )))
            })
            .build()
    }

    #[test]
    fn test_resolve_exact_overload() {
        let service = greeter();
        let types = vec!["string".to_string(), "string".to_string()];
        let handler = service.resolve("greet", &types, 2).unwrap();
        assert_eq!(handler(vec![json!("bob"), json!("hi")]).unwrap(), json!("hi bob"));
    }

    #[test]
    fn test_resolve_by_arity_without_types() {
        let service = greeter();
        let handler = service.resolve("greet", &[], 1).unwrap();
        assert_eq!(handler(vec![json!("bob")]).unwrap(), json!("hello bob"));
        assert!(service.resolve("greet", &[], 3).is_none());
    }

    #[test]
    fn test_resolve_wrong_types_is_none() {
        let service = greeter();
        assert!(service.resolve("echo", &["i64".to_string()], 1).is_none());
    }

    #[test]
    fn test_resolve_types_without_matching_arguments_is_none() {
        let service = greeter();
        let types = vec!["string".to_string()];
        assert!(service.resolve("echo", &types, 0).is_none());
        assert!(service.resolve("echo", &types, 2).is_none());
        assert!(service.resolve("echo", &types, 1).is_some());
    }

    #[test]
    fn test_discover_maps_interface_to_bean() {
        let container = StaticContainer::new().with("greeterImpl", greeter());
        let directory = ServiceDirectory::discover(&container).unwrap();

        assert_eq!(directory.len(), 1);
        assert_eq!(directory.interfaces().collect::<Vec<_>>(), vec!["Greeter"]);
        assert!(directory.get("Greeter").is_some());
    }

    #[test]
    fn test_discover_rejects_untagged_and_multi_interface_beans() {
        let untagged = StaticContainer::new().with(
            "orphan",
            ServiceImpl::builder().method("noop", Vec::<String>::new(), |_| Ok(Value::Null)).build(),
        );
        assert!(matches!(
            ServiceDirectory::discover(&untagged),
            Err(RpcError::AmbiguousOrMissingInterfaceTag { .. })
        ));

        let multi = StaticContainer::new().with(
            "both",
            ServiceImpl::builder().implements("A").implements("B").build(),
        );
        match ServiceDirectory::discover(&multi).unwrap_err() {
            RpcError::AmbiguousOrMissingInterfaceTag { bean, .. } => assert_eq!(bean, "both"),
            other => panic!("Expected AmbiguousOrMissingInterfaceTag, got: {:?}", other),
        }
    }

    #[test]
    fn test_discover_rejects_duplicate_interface() {
        let container = StaticContainer::new()
            .with("first", greeter())
            .with("second", greeter());
        assert!(matches!(
            ServiceDirectory::discover(&container),
            Err(RpcError::AmbiguousOrMissingInterfaceTag { .. })
        ));
    }

    #[test]
    fn test_lookup_errors() {
        let container = StaticContainer::new().with("greeterImpl", greeter());
        let directory = ServiceDirectory::discover(&container).unwrap();

        assert!(matches!(
            directory.lookup("Missing", "echo", &[], 1),
            Err(RpcError::ServiceNotFound { .. })
        ));
        assert!(matches!(
            directory.lookup("Greeter", "shout", &[], 1),
            Err(RpcError::MethodNotFound { .. })
        ));
        assert!(directory.lookup("Greeter", "echo", &[], 1).is_ok());
    }
}
