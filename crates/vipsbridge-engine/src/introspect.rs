//! Operation introspection
//!
//! The argument table of an operation is discovered once, by instantiating
//! a throwaway instance and walking its properties, and then cached by name.
//! The native type system is immutable after initialization, so a descriptor
//! never goes stale.
//!
//! Positional order is the contract: required, non-deprecated inputs sorted
//! by ascending priority.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use vipsbridge_sdk::{ArgumentFlags, ArgumentInfo, NativeApi, TypeId, TypeKind};

use crate::error::{Result, VipsError};
use crate::handle::ObjectHandle;

/// One construct argument of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentSpec {
    pub name: String,
    pub type_id: TypeId,
    pub type_name: String,
    pub kind: TypeKind,
    pub is_required: bool,
    pub is_construct: bool,
    pub is_input: bool,
    pub is_output: bool,
    pub is_deprecated: bool,
    pub is_modify: bool,
    pub priority: i32,
    pub blurb: String,
}

impl ArgumentSpec {
    fn from_info(info: ArgumentInfo, type_name: String, kind: TypeKind) -> Self {
        let flags = info.flags;
        Self {
            name: info.name,
            type_id: info.type_id,
            type_name,
            kind,
            is_required: flags.contains(ArgumentFlags::REQUIRED),
            is_construct: flags.contains(ArgumentFlags::CONSTRUCT),
            is_input: flags.contains(ArgumentFlags::INPUT),
            is_output: flags.contains(ArgumentFlags::OUTPUT),
            is_deprecated: flags.contains(ArgumentFlags::DEPRECATED),
            is_modify: flags.contains(ArgumentFlags::MODIFY),
            priority: info.priority,
            blurb: info.blurb,
        }
    }

    /// Matched by position
    pub fn is_positional(&self) -> bool {
        self.is_required && self.is_input && !self.is_deprecated
    }

    /// Whether the argument holds an image (or images)
    pub fn is_image(&self) -> bool {
        matches!(self.kind, TypeKind::Object | TypeKind::ArrayImage)
    }
}

/// Immutable argument table of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    name: String,
    #[serde(default)]
    description: String,
    args: Vec<ArgumentSpec>,
    required_inputs: Vec<usize>,
    optional_inputs: Vec<usize>,
    required_outputs: Vec<usize>,
    optional_outputs: Vec<usize>,
}

impl OperationDescriptor {
    /// Partition construct arguments in declaration order
    pub fn new(name: impl Into<String>, args: Vec<ArgumentSpec>) -> Self {
        let indices = |pred: &dyn Fn(&ArgumentSpec) -> bool| -> Vec<usize> {
            args.iter()
                .enumerate()
                .filter(|(_, a)| pred(a))
                .map(|(i, _)| i)
                .collect()
        };

        let mut required_inputs = indices(&|a| a.is_positional());
        // stable: equal priorities keep declaration order
        required_inputs.sort_by_key(|&i| args[i].priority);

        let optional_inputs = indices(&|a| a.is_input && !a.is_required && !a.is_deprecated);
        let required_outputs = indices(&|a| a.is_output && a.is_required && !a.is_deprecated);
        let optional_outputs = indices(&|a| a.is_output && !a.is_required && !a.is_deprecated);

        Self {
            name: name.into(),
            description: String::new(),
            args,
            required_inputs,
            optional_inputs,
            required_outputs,
            optional_outputs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach the class description reported by the native side
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// One-line summary, used as the doc line of generated wrappers
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Every construct argument, in declaration order
    pub fn args(&self) -> &[ArgumentSpec] {
        &self.args
    }

    /// Positional arguments, in positional order
    pub fn required_inputs(&self) -> impl Iterator<Item = &ArgumentSpec> + '_ {
        self.required_inputs.iter().map(move |&i| &self.args[i])
    }

    pub fn optional_inputs(&self) -> impl Iterator<Item = &ArgumentSpec> + '_ {
        self.optional_inputs.iter().map(move |&i| &self.args[i])
    }

    pub fn required_outputs(&self) -> impl Iterator<Item = &ArgumentSpec> + '_ {
        self.required_outputs.iter().map(move |&i| &self.args[i])
    }

    pub fn optional_outputs(&self) -> impl Iterator<Item = &ArgumentSpec> + '_ {
        self.optional_outputs.iter().map(move |&i| &self.args[i])
    }

    pub fn required_input_count(&self) -> usize {
        self.required_inputs.len()
    }

    /// Input addressable by name: optional inputs, plus deprecated inputs
    /// that are not required
    pub fn named_input(&self, name: &str) -> Option<&ArgumentSpec> {
        self.args
            .iter()
            .find(|a| a.name == name && a.is_input && !a.is_required)
    }

    /// Output with this name (required or optional, not deprecated)
    pub fn output(&self, name: &str) -> Option<&ArgumentSpec> {
        self.args
            .iter()
            .find(|a| a.name == name && a.is_output && !a.is_deprecated)
    }

    /// Whether an output is optional and must be requested to be harvested
    pub fn is_optional_output(&self, name: &str) -> bool {
        self.optional_outputs().any(|a| a.name == name)
    }

    /// Any construct argument with this name
    pub fn arg(&self, name: &str) -> Option<&ArgumentSpec> {
        self.args.iter().find(|a| a.name == name)
    }

    /// Index of the positional argument the image-modifying `MODIFY`
    /// argument occupies, if any
    pub fn modify_position(&self) -> Option<usize> {
        self.required_inputs().position(|a| a.is_modify)
    }
}

// ============================================================================
// Introspector
// ============================================================================

/// Process-wide descriptor cache, keyed by operation name.
#[derive(Debug, Default)]
pub struct Introspector {
    cache: DashMap<String, Arc<OperationDescriptor>>,
}

impl Introspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor for `name`, walking the native argument table on first use.
    ///
    /// Two threads asking for the same new name may both walk; the first
    /// insert wins and both get the same descriptor.
    pub fn describe(&self, api: &Arc<dyn NativeApi>, name: &str) -> Result<Arc<OperationDescriptor>> {
        if let Some(found) = self.cache.get(name) {
            return Ok(found.clone());
        }

        let Some(ptr) = api.operation_new(name) else {
            api.error_clear();
            return Err(VipsError::OperationNotFound(name.to_string()));
        };
        let instance = ObjectHandle::new_owned(api.clone(), ptr);

        let description = api.object_description(ptr);
        let mut infos = Vec::new();
        api.argument_map(ptr, &mut |info| infos.push(info));

        let mut specs = Vec::with_capacity(infos.len());
        for info in infos {
            if !info.flags.contains(ArgumentFlags::CONSTRUCT) {
                continue;
            }
            let type_name = api.type_name(info.type_id);
            let kind = api.type_kind(info.type_id);
            let spec = ArgumentSpec::from_info(info, type_name, kind);
            if spec.is_deprecated {
                tracing::debug!(operation = name, argument = %spec.name, "deprecated argument");
            }
            specs.push(spec);
        }
        instance.release();

        let descriptor = Arc::new(OperationDescriptor::new(name, specs).with_description(description));
        tracing::trace!(
            operation = name,
            required_inputs = descriptor.required_input_count(),
            "operation described"
        );
        Ok(self
            .cache
            .entry(name.to_string())
            .or_insert(descriptor)
            .clone())
    }

    /// Cached descriptor, without touching the native side
    pub fn cached(&self, name: &str) -> Option<Arc<OperationDescriptor>> {
        self.cache.get(name).map(|d| d.clone())
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// All cached descriptors, sorted by name
    pub fn snapshot(&self) -> Vec<OperationDescriptor> {
        let mut all: Vec<OperationDescriptor> =
            self.cache.iter().map(|e| e.value().as_ref().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Snapshot as pretty-printed JSON
    pub fn snapshot_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| VipsError::Config(format!("snapshot: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vipsbridge_sim::{OperationDefinition, SimLibrary};

    fn api() -> (Arc<SimLibrary>, Arc<dyn NativeApi>) {
        let sim = Arc::new(SimLibrary::new());
        let api: Arc<dyn NativeApi> = sim.clone();
        (sim, api)
    }

    fn names<'a>(it: impl Iterator<Item = &'a ArgumentSpec>) -> Vec<&'a str> {
        it.map(|a| a.name.as_str()).collect()
    }

    #[test]
    fn test_partitions() {
        let (_sim, api) = api();
        let intro = Introspector::new();
        let d = intro.describe(&api, "min").unwrap();

        assert_eq!(names(d.required_inputs()), vec!["in"]);
        assert_eq!(names(d.optional_inputs()), vec!["size"]);
        assert_eq!(names(d.required_outputs()), vec!["out"]);
        assert_eq!(names(d.optional_outputs()), vec!["x", "y", "out_array", "x_array"]);
        assert!(d.arg("nickname").is_none());
    }

    #[test]
    fn test_positional_order_by_priority() {
        let (_sim, api) = api();
        let intro = Introspector::new();
        // declared out, width, height; positional order follows priority
        let d = intro.describe(&api, "black").unwrap();
        assert_eq!(names(d.required_inputs()), vec!["width", "height"]);

        let d = intro.describe(&api, "linear").unwrap();
        assert_eq!(names(d.required_inputs()), vec!["in", "a", "b"]);
    }

    #[test]
    fn test_deprecated_excluded_but_addressable() {
        let (_sim, api) = api();
        let intro = Introspector::new();
        let d = intro.describe(&api, "invert").unwrap();
        assert!(d.optional_inputs().all(|a| a.name != "deprecated_flag"));
        assert!(d.named_input("deprecated_flag").is_some());
    }

    #[test]
    fn test_equal_priorities_keep_declaration_order() {
        let (sim, api) = api();
        sim.register_operation(
            OperationDefinition::new("tie")
                .required_input("b", "gint", 1)
                .required_input("a", "gint", 1)
                .required_output("out", "gint", 2)
                .build(|ctx| {
                    let v = ctx.int("a")? + ctx.int("b")?;
                    ctx.set_int("out", v);
                    Ok(())
                }),
        )
        .unwrap();
        let d = Introspector::new().describe(&api, "tie").unwrap();
        assert_eq!(names(d.required_inputs()), vec!["b", "a"]);
    }

    #[test]
    fn test_cached_after_first_walk() {
        let (sim, api) = api();
        let intro = Introspector::new();
        let first = intro.describe(&api, "add").unwrap();
        let calls = sim.native_calls();
        let second = intro.describe(&api, "add").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(sim.native_calls(), calls);
        assert_eq!(sim.live_objects(), 0);
    }

    #[test]
    fn test_unknown_operation() {
        let (sim, api) = api();
        let err = Introspector::new().describe(&api, "unknown_op_xyz").unwrap_err();
        assert!(matches!(err, VipsError::OperationNotFound(ref n) if n == "unknown_op_xyz"));
        assert!(api.error_buffer().is_empty());
        assert_eq!(sim.live_objects(), 0);
    }

    #[test]
    fn test_concurrent_first_lookup() {
        let (_sim, api) = api();
        let intro = Arc::new(Introspector::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let intro = intro.clone();
                let api = api.clone();
                std::thread::spawn(move || intro.describe(&api, "getpoint").unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(intro.cached_count(), 1);
        let cached = intro.cached("getpoint").unwrap();
        assert!(results.iter().all(|d| **d == *cached));
    }

    #[test]
    fn test_snapshot_json() {
        let (_sim, api) = api();
        let intro = Introspector::new();
        intro.describe(&api, "extract_band").unwrap();
        intro.describe(&api, "avg").unwrap();

        let snapshot = intro.snapshot();
        assert_eq!(snapshot[0].name(), "avg");
        assert_eq!(snapshot[0].description(), "find image average");
        assert_eq!(snapshot[1].description(), "extract band from an image");
        let json = intro.snapshot_json().unwrap();
        let back: Vec<OperationDescriptor> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
