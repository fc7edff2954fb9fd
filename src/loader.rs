//! Holds rewritten class bytes and feeds them to a class-loading domain in
//! dependency order.
//!
//! The host runtime is abstracted behind two traits: [`ClassHost`] is the
//! target domain classes are defined into, [`ResourceStore`] is the ambient
//! source for anything not declared here. Binary names are dotted at this
//! boundary (`pkg.Outer$Inner`); the slash form stays inside the engine.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use crate::class_reader::ClassReader;
use crate::deps::DependencyTree;
use crate::error::InstrumentationError;
use crate::instrument::{HandlerInstrumentation, Instrumentor};
use crate::names;
use crate::spec::{HandlerSpec, NullGuard};

/// Names under this prefix are never instrumented and always resolve via the
/// ambient loader; a user-level domain cannot define them.
pub use crate::names::SYSTEM_PREFIX;

/// A class-loading domain classes can be defined into.
pub trait ClassHost {
    fn is_defined(&self, binary_name: &str) -> bool;
    fn define(&mut self, binary_name: &str, bytes: &[u8]) -> Result<(), InstrumentationError>;
}

/// Ambient source of class bytes, addressed by dotted binary name.
pub trait ResourceStore: Send + Sync {
    fn class_bytes(&self, binary_name: &str) -> Option<Vec<u8>>;
}

/// In-memory resource store.
#[derive(Debug, Default)]
pub struct MapResources {
    classes: HashMap<String, Vec<u8>>,
}

impl MapResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, binary_name: &str, bytes: Vec<u8>) -> &mut Self {
        self.classes.insert(binary_name.to_string(), bytes);
        self
    }
}

impl ResourceStore for MapResources {
    fn class_bytes(&self, binary_name: &str) -> Option<Vec<u8>> {
        self.classes.get(binary_name).cloned()
    }
}

/// Classpath-style resource store: `pkg.Outer$Inner` resolves to
/// `<root>/pkg/Outer$Inner.class` under the first root that has it.
#[derive(Debug, Default)]
pub struct DirResources {
    roots: Vec<PathBuf>,
}

impl DirResources {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
        }
    }
}

impl ResourceStore for DirResources {
    fn class_bytes(&self, binary_name: &str) -> Option<Vec<u8>> {
        let relative = names::to_path(binary_name);
        self.roots
            .iter()
            .find_map(|root| std::fs::read(root.join(&relative)).ok())
    }
}

/// An in-memory class-loading domain. Stands in for a real VM in tests and
/// embeddings that only need define-once semantics.
#[derive(Debug, Default)]
pub struct MapHost {
    defined: HashMap<String, Vec<u8>>,
    define_order: Vec<String>,
}

impl MapHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_order(&self) -> &[String] {
        &self.define_order
    }

    pub fn bytes(&self, binary_name: &str) -> Option<&[u8]> {
        self.defined.get(binary_name).map(Vec::as_slice)
    }
}

impl ClassHost for MapHost {
    fn is_defined(&self, binary_name: &str) -> bool {
        self.defined.contains_key(binary_name)
    }

    fn define(&mut self, binary_name: &str, bytes: &[u8]) -> Result<(), InstrumentationError> {
        self.defined
            .insert(binary_name.to_string(), bytes.to_vec());
        self.define_order.push(binary_name.to_string());
        Ok(())
    }
}

/// Retains rewritten bytes and defines them, with their dependencies, into a
/// target domain.
pub struct Loader {
    dependencies: DependencyTree,
    declared: HashMap<String, Vec<u8>>,
    resources: Box<dyn ResourceStore>,
    reload: bool,
}

impl Loader {
    pub fn new(resources: Box<dyn ResourceStore>) -> Self {
        Self::with_reload(resources, false)
    }

    /// In reload mode the loader's own declared bytes shadow any ambient
    /// source and an already-defined declared class is skipped instead of
    /// being a fatal error.
    pub fn with_reload(resources: Box<dyn ResourceStore>, reload: bool) -> Self {
        Self {
            dependencies: DependencyTree::new(),
            declared: HashMap::new(),
            resources,
            reload,
        }
    }

    /// Install rewritten bytes under a binary name. The class skeleton is
    /// decoded to record its load-order relationships.
    pub fn declare(&mut self, binary_name: &str, bytes: Vec<u8>) -> Result<(), InstrumentationError> {
        let node = ClassReader::new(&bytes).to_codeless_node().map_err(|source| {
            InstrumentationError::Decode {
                class: binary_name.to_string(),
                source,
            }
        })?;
        self.dependencies.add(&node);
        self.declared.insert(binary_name.to_string(), bytes);
        Ok(())
    }

    pub fn is_declared(&self, binary_name: &str) -> bool {
        self.declared.contains_key(binary_name)
    }

    /// Declared or ambient bytes for a binary name.
    pub fn bytes(&self, binary_name: &str) -> Option<Vec<u8>> {
        self.declared
            .get(binary_name)
            .cloned()
            .or_else(|| self.resources.class_bytes(binary_name))
    }

    /// Analyze the named handler interface and rewrite its handlees: the
    /// classes its `Instruments` annotation declares plus `extra_handlees`.
    /// `spawner` overrides the interface's `SpawnsWith` annotation.
    pub fn instrument_for(
        &mut self,
        handler_name: &str,
        guard: NullGuard,
        spawner: Option<&str>,
        extra_handlees: &[String],
    ) -> Result<(), InstrumentationError> {
        let bytes = self.resources.class_bytes(handler_name).ok_or_else(|| {
            InstrumentationError::Configuration(format!(
                "unresolvable handler interface {handler_name}"
            ))
        })?;
        let handler = ClassReader::new(&bytes)
            .to_codeless_node()
            .map_err(|source| InstrumentationError::Decode {
                class: handler_name.to_string(),
                source,
            })?;
        let spec = HandlerSpec::analyze(&handler, guard, spawner, None)?;
        debug!(
            handler = handler_name,
            annotated = spec.instruments.len(),
            explicit = extra_handlees.len(),
            "instrumenting handlees"
        );
        let annotated = spec.instruments.clone();
        let instrumentation = HandlerInstrumentation::new(spec);
        let mut driver = Instrumentor::new(
            &instrumentation,
            &mut self.dependencies,
            &mut self.declared,
        );
        driver.transform_named(self.resources.as_ref(), &annotated)?;
        driver.transform_named(self.resources.as_ref(), extra_handlees)?;
        Ok(())
    }

    /// Define the named classes (empty = everything declared) and their
    /// dependencies into `host`, dependencies first.
    pub fn load_into(
        &self,
        host: &mut dyn ClassHost,
        binary_names: &[String],
    ) -> Result<(), InstrumentationError> {
        for name in self.dependencies.classes_to_load(binary_names) {
            if name.starts_with(SYSTEM_PREFIX) {
                continue;
            }
            if host.is_defined(&name) {
                if self.declared.contains_key(&name) && !self.reload {
                    return Err(InstrumentationError::Host(format!(
                        "class {name} was already defined, it must not be redeclared"
                    )));
                }
                continue;
            }
            let bytes = self.bytes(&name).ok_or_else(|| {
                InstrumentationError::Host(format!("no bytes for required class {name}"))
            })?;
            debug!(class = %name, "defining");
            host.define(&name, &bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ClassBuilder;
    use crate::class_writer::ClassWriter;

    fn class_bytes(binary_name: &str) -> Vec<u8> {
        let node = ClassBuilder::new(&names::to_internal(binary_name), "java/lang/Object").build();
        ClassWriter::to_bytes(&node).unwrap()
    }

    #[test]
    fn defines_declared_classes_outer_first() {
        let mut loader = Loader::new(Box::new(MapResources::new()));
        loader
            .declare("pkg.Outer$Inner", class_bytes("pkg.Outer$Inner"))
            .unwrap();
        loader.declare("pkg.Outer", class_bytes("pkg.Outer")).unwrap();

        let mut host = MapHost::new();
        loader.load_into(&mut host, &[]).unwrap();
        assert_eq!(host.define_order(), ["pkg.Outer", "pkg.Outer$Inner"]);
    }

    #[test]
    fn missing_dependency_bytes_come_from_resources() {
        let mut resources = MapResources::new();
        resources.insert("pkg.Outer", class_bytes("pkg.Outer"));
        let mut loader = Loader::new(Box::new(resources));
        loader
            .declare("pkg.Outer$Inner", class_bytes("pkg.Outer$Inner"))
            .unwrap();

        let mut host = MapHost::new();
        loader.load_into(&mut host, &[]).unwrap();
        assert!(host.is_defined("pkg.Outer"));
        assert!(host.is_defined("pkg.Outer$Inner"));
    }

    #[test]
    fn redefining_a_declared_class_is_fatal_without_reload() {
        let mut loader = Loader::new(Box::new(MapResources::new()));
        loader.declare("pkg.A", class_bytes("pkg.A")).unwrap();

        let mut host = MapHost::new();
        host.define("pkg.A", &class_bytes("pkg.A")).unwrap();
        let error = loader.load_into(&mut host, &[]).unwrap_err();
        assert!(matches!(error, InstrumentationError::Host(_)));
    }

    #[test]
    fn reload_mode_skips_already_defined_classes() {
        let mut loader = Loader::with_reload(Box::new(MapResources::new()), true);
        loader.declare("pkg.A", class_bytes("pkg.A")).unwrap();

        let mut host = MapHost::new();
        host.define("pkg.A", &class_bytes("pkg.A")).unwrap();
        loader.load_into(&mut host, &[]).unwrap();
        assert_eq!(host.define_order().len(), 1);
    }

    #[test]
    fn reload_mode_prefers_declared_bytes_over_ambient() {
        let mut resources = MapResources::new();
        resources.insert("pkg.A", vec![1, 2, 3]);
        let mut loader = Loader::with_reload(Box::new(resources), true);
        let rewritten = class_bytes("pkg.A");
        loader.declare("pkg.A", rewritten.clone()).unwrap();

        let mut host = MapHost::new();
        loader.load_into(&mut host, &[]).unwrap();
        assert_eq!(host.bytes("pkg.A"), Some(rewritten.as_slice()));
    }

    #[test]
    fn system_prefix_is_never_defined() {
        let tree = ClassBuilder::new("pkg/Uses", "java/lang/Object").build();
        let mut loader = Loader::new(Box::new(MapResources::new()));
        loader
            .declare("pkg.Uses", ClassWriter::to_bytes(&tree).unwrap())
            .unwrap();
        let mut host = MapHost::new();
        loader
            .load_into(&mut host, &["java.lang.String".to_string(), "pkg.Uses".to_string()])
            .unwrap();
        assert!(!host.is_defined("java.lang.String"));
        assert!(host.is_defined("pkg.Uses"));
    }

    #[test]
    fn missing_required_bytes_is_a_host_error() {
        let loader = Loader::new(Box::new(MapResources::new()));
        let mut host = MapHost::new();
        let error = loader
            .load_into(&mut host, &["pkg.Gone".to_string()])
            .unwrap_err();
        assert!(matches!(error, InstrumentationError::Host(_)));
    }

    #[test]
    fn directory_store_resolves_class_paths() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("pkg")).unwrap();
        std::fs::write(root.join("pkg/A.class"), class_bytes("pkg.A")).unwrap();

        let store = DirResources::new([root]);
        assert!(store.class_bytes("pkg.A").is_some());
        assert!(store.class_bytes("pkg.Missing").is_none());
    }
}
