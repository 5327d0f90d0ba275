use super::{ConnectorSettings, DataConnector, HttpPollConnector, JsonlReplayConnector};
use crate::error::{ConfigurationError, ConnectorError, CoreError};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

/// A connector type the registry can instantiate from settings
pub trait BuildConnector: DataConnector + Sized + 'static {
    fn build(settings: &ConnectorSettings) -> Result<Self, ConnectorError>;
}

type Factory = fn(&ConnectorSettings) -> Result<Arc<dyn DataConnector>, ConnectorError>;

struct Entry {
    type_id: TypeId,
    type_name: &'static str,
    factory: Factory,
}

fn instantiate<C: BuildConnector>(settings: &ConnectorSettings) -> Result<Arc<dyn DataConnector>, ConnectorError> {
    Ok(Arc::new(C::build(settings)?))
}

/// Connector kinds by name
///
/// Filled in once at startup and then shared read-only.
#[derive(Default)]
pub struct ConnectorRegistry {
    entries: HashMap<String, Entry>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every connector kind shipped in this crate
    pub fn with_builtin() -> Result<Self, ConfigurationError> {
        let mut registry = Self::new();
        registry.register::<HttpPollConnector>(HttpPollConnector::KIND)?;
        registry.register::<JsonlReplayConnector>(JsonlReplayConnector::KIND)?;
        Ok(registry)
    }

    /// Bind `name` to `C`; registering the same pair twice is a no-op
    pub fn register<C: BuildConnector>(&mut self, name: &str) -> Result<(), ConfigurationError> {
        let type_id = TypeId::of::<C>();
        if let Some(existing) = self.entries.get(name) {
            if existing.type_id == type_id {
                return Ok(());
            }
            log::error!(
                "❌ Connector '{}' already bound to {}, refusing {}",
                name,
                existing.type_name,
                std::any::type_name::<C>()
            );
            return Err(ConfigurationError::DuplicateConnector(name.to_string()));
        }

        self.entries.insert(
            name.to_string(),
            Entry {
                type_id,
                type_name: std::any::type_name::<C>(),
                factory: instantiate::<C>,
            },
        );
        log::debug!("📇 Registered connector kind '{}'", name);
        Ok(())
    }

    /// Instantiate the connector kind named by `settings.kind`
    pub fn build(&self, settings: &ConnectorSettings) -> Result<Arc<dyn DataConnector>, CoreError> {
        let entry = self
            .entries
            .get(&settings.kind)
            .ok_or_else(|| ConfigurationError::UnknownConnectorKind(settings.kind.clone()))?;
        Ok((entry.factory)(settings)?)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorMode;
    use crate::event::StandardEvent;
    use async_trait::async_trait;

    struct Null;

    #[async_trait]
    impl DataConnector for Null {
        fn name(&self) -> &str {
            "null"
        }

        fn mode(&self) -> ConnectorMode {
            ConnectorMode::Poll
        }

        async fn connect(&self) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn poll(&self) -> Result<Vec<StandardEvent>, ConnectorError> {
            Ok(Vec::new())
        }
    }

    impl BuildConnector for Null {
        fn build(_settings: &ConnectorSettings) -> Result<Self, ConnectorError> {
            Ok(Null)
        }
    }

    #[test]
    fn test_duplicate_name_rules() {
        let mut registry = ConnectorRegistry::with_builtin().unwrap();
        registry.register::<Null>("null").unwrap();
        registry.register::<Null>("null").unwrap();
        assert_eq!(registry.len(), 3);

        let err = registry.register::<HttpPollConnector>("null").unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateConnector(name) if name == "null"));
        assert_eq!(registry.names(), vec!["http_poll", "jsonl_replay", "null"]);
    }

    #[test]
    fn test_build_by_kind() {
        let mut registry = ConnectorRegistry::new();
        registry.register::<Null>("null").unwrap();

        let connector = registry.build(&ConnectorSettings::new("n1", "null")).unwrap();
        assert_eq!(connector.name(), "null");

        let unknown = registry.build(&ConnectorSettings::new("x", "websocket"));
        assert!(matches!(
            unknown,
            Err(CoreError::Configuration(ConfigurationError::UnknownConnectorKind(_)))
        ));
        assert!(!registry.contains("websocket"));
    }
}
