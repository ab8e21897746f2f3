//! Name → module factories, used to build pipelines from configuration.
//!
//! A factory receives the module's parameter table (everything in the
//! `[[pipelines.<phase>]]` entry except `module`) and returns a ready
//! [`Module`]. Names are matched case-insensitively.

use crate::module::{DocumentModule, Module, PerDocument};
use crate::modules::{
    ConcatOutputs, Filter, OrderBy, ReadFiles, SetContent, SetDestination, SetDestinationParams,
    SetMetadata, WriteFiles,
};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown module `{0}`")]
    UnknownModule(String),
    #[error("invalid parameters for `{module}`: {message}")]
    InvalidParameters { module: String, message: String },
    #[error("module `{0}` is already registered")]
    Duplicate(String),
}

pub type ModuleFactory =
    Arc<dyn Fn(&toml::Table) -> Result<Arc<dyn Module>, RegistryError> + Send + Sync>;

struct Entry {
    name: String,
    factory: ModuleFactory,
}

/// Module factories keyed by lowercase name.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: BTreeMap<String, Entry>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in module.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        let builtins: [(&str, ModuleFactory); 8] = [
            ("ReadFiles", collection::<ReadFiles>("ReadFiles")),
            ("WriteFiles", per_document::<WriteFiles>("WriteFiles")),
            ("SetMetadata", per_document::<SetMetadata>("SetMetadata")),
            ("Filter", per_document::<Filter>("Filter")),
            ("SetContent", per_document::<SetContent>("SetContent")),
            ("OrderBy", collection::<OrderBy>("OrderBy")),
            ("ConcatOutputs", collection::<ConcatOutputs>("ConcatOutputs")),
            (
                "SetDestination",
                Arc::new(|params: &toml::Table| -> Result<Arc<dyn Module>, RegistryError> {
                    let parsed: SetDestinationParams = parse_params("SetDestination", params)?;
                    let module = SetDestination::from_params(parsed).map_err(|message| {
                        RegistryError::InvalidParameters {
                            module: "SetDestination".into(),
                            message,
                        }
                    })?;
                    Ok(Arc::new(PerDocument(module)) as Arc<dyn Module>)
                }),
            ),
        ];
        for (name, factory) in builtins {
            registry.entries.insert(
                name.to_lowercase(),
                Entry {
                    name: name.to_string(),
                    factory,
                },
            );
        }
        registry
    }

    /// Add a factory. Fails when the name (case-insensitively) is taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&toml::Table) -> Result<Arc<dyn Module>, RegistryError>
            + Send
            + Sync
            + 'static,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let key = name.to_lowercase();
        if self.entries.contains_key(&key) {
            return Err(RegistryError::Duplicate(name));
        }
        self.entries.insert(
            key,
            Entry {
                name,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    pub fn create(&self, name: &str, params: &toml::Table) -> Result<Arc<dyn Module>, RegistryError> {
        let entry = self
            .entries
            .get(&name.to_lowercase())
            .ok_or_else(|| RegistryError::UnknownModule(name.to_string()))?;
        (entry.factory)(params)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_lowercase())
    }

    /// Registered names as given at registration, sorted case-insensitively.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|e| e.name.as_str())
    }
}

fn parse_params<T: DeserializeOwned>(module: &str, params: &toml::Table) -> Result<T, RegistryError> {
    toml::Value::Table(params.clone())
        .try_into()
        .map_err(|e: toml::de::Error| RegistryError::InvalidParameters {
            module: module.to_string(),
            message: e.message().to_string(),
        })
}

fn collection<M>(name: &'static str) -> ModuleFactory
where
    M: Module + DeserializeOwned + 'static,
{
    Arc::new(move |params: &toml::Table| -> Result<Arc<dyn Module>, RegistryError> {
        let module: M = parse_params(name, params)?;
        Ok(Arc::new(module) as Arc<dyn Module>)
    })
}

fn per_document<M>(name: &'static str) -> ModuleFactory
where
    M: DocumentModule + DeserializeOwned + 'static,
{
    Arc::new(move |params: &toml::Table| -> Result<Arc<dyn Module>, RegistryError> {
        let module: M = parse_params(name, params)?;
        Ok(Arc::new(PerDocument(module)) as Arc<dyn Module>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(src: &str) -> toml::Table {
        toml::from_str(src).unwrap()
    }

    #[test]
    fn standard_registry_knows_builtins() {
        let registry = ModuleRegistry::standard();
        assert_eq!(registry.names().count(), 8);
        assert!(registry.contains("readfiles"));
        assert!(registry.contains("SETCONTENT"));
        assert!(!registry.contains("Markdown"));
    }

    #[test]
    fn create_parses_parameters() {
        let registry = ModuleRegistry::standard();
        let module = registry
            .create("OrderBy", &table("key = \"date\"\ndescending = true"))
            .unwrap();
        assert_eq!(module.name(), "OrderBy");
        assert_eq!(module.cache_key().as_deref(), Some("date:true"));
    }

    #[test]
    fn per_document_modules_are_wrapped() {
        let registry = ModuleRegistry::standard();
        let module = registry
            .create("SetMetadata", &table("key = \"layout\"\nvalue = \"post\""))
            .unwrap();
        assert_eq!(module.name(), "SetMetadata");
        assert!(module.cache_key().is_some());
    }

    #[test]
    fn bad_parameters_name_the_module() {
        let registry = ModuleRegistry::standard();
        let err = registry
            .create("Filter", &table("key = \"draft\"\ncolour = \"red\""))
            .err()
            .unwrap();
        match err {
            RegistryError::InvalidParameters { module, .. } => assert_eq!(module, "Filter"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn set_destination_needs_one_rule() {
        let registry = ModuleRegistry::standard();
        assert!(registry.create("SetDestination", &table("extension = \"html\"")).is_ok());
        assert!(matches!(
            registry.create("SetDestination", &toml::Table::new()),
            Err(RegistryError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn unknown_and_duplicate_names() {
        let mut registry = ModuleRegistry::standard();
        assert!(matches!(
            registry.create("Nope", &toml::Table::new()),
            Err(RegistryError::UnknownModule(_))
        ));
        let err = registry
            .register("filter", |_: &toml::Table| {
                Ok(Arc::new(PerDocument(Filter::new("x"))) as Arc<dyn Module>)
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(_)));
    }
}
