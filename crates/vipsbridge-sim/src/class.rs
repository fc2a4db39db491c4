//! Operation classes
//!
//! An operation class is an argument table plus a build function. Classes
//! are declared with [`OperationDefinition`] using type *names*, and resolved
//! against the library's type registry when registered.

use std::collections::HashMap;
use std::sync::Arc;

use vipsbridge_sdk::{ArgumentFlags, ArgumentInfo, NativeError, NativeResult, ProgressSignal, TypeKind};

use crate::image::ImageData;
use crate::object::{ObjectBody, ObjectEntry, Payload};
use crate::types::TypeRegistry;

/// Build function of an operation class.
pub type BuildFn = Arc<dyn Fn(&mut BuildContext<'_>) -> Result<(), String> + Send + Sync>;

const REQUIRED_INPUT: ArgumentFlags = ArgumentFlags::REQUIRED
    .union(ArgumentFlags::CONSTRUCT)
    .union(ArgumentFlags::INPUT)
    .union(ArgumentFlags::SET_ONCE);
const OPTIONAL_INPUT: ArgumentFlags = ArgumentFlags::CONSTRUCT
    .union(ArgumentFlags::INPUT)
    .union(ArgumentFlags::SET_ONCE);
const REQUIRED_OUTPUT: ArgumentFlags = ArgumentFlags::REQUIRED
    .union(ArgumentFlags::CONSTRUCT)
    .union(ArgumentFlags::OUTPUT)
    .union(ArgumentFlags::SET_ONCE);
const OPTIONAL_OUTPUT: ArgumentFlags = ArgumentFlags::CONSTRUCT
    .union(ArgumentFlags::OUTPUT)
    .union(ArgumentFlags::SET_ONCE);

#[derive(Debug, Clone)]
struct ArgDecl {
    name: String,
    type_name: String,
    flags: ArgumentFlags,
    priority: i32,
    blurb: String,
}

/// Unresolved declaration of an operation class.
///
/// ```ignore
/// let def = OperationDefinition::new("invert")
///     .required_input("in", "VipsImage", 1)
///     .required_output("out", "VipsImage", 2)
///     .build(|ctx| { /* ... */ Ok(()) });
/// sim.register_operation(def)?;
/// ```
pub struct OperationDefinition {
    name: String,
    description: String,
    args: Vec<ArgDecl>,
    cacheable: bool,
    build: Option<BuildFn>,
}

impl OperationDefinition {
    /// Start declaring an operation called `name`
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            args: Vec::new(),
            cacheable: true,
            build: None,
        }
    }

    /// One-line description
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    fn arg(mut self, name: &str, type_name: &str, flags: ArgumentFlags, priority: i32) -> Self {
        self.args.push(ArgDecl {
            name: name.to_string(),
            type_name: type_name.to_string(),
            flags,
            priority,
            blurb: format!("{} argument of {}", name, self.name),
        });
        self
    }

    /// Required input, positional in `priority` order
    pub fn required_input(self, name: &str, type_name: &str, priority: i32) -> Self {
        self.arg(name, type_name, REQUIRED_INPUT, priority)
    }

    /// Optional input, addressable by name only
    pub fn optional_input(self, name: &str, type_name: &str, priority: i32) -> Self {
        self.arg(name, type_name, OPTIONAL_INPUT, priority)
    }

    /// Required output, always harvested
    pub fn required_output(self, name: &str, type_name: &str, priority: i32) -> Self {
        self.arg(name, type_name, REQUIRED_OUTPUT, priority)
    }

    /// Optional output, harvested only on request
    pub fn optional_output(self, name: &str, type_name: &str, priority: i32) -> Self {
        self.arg(name, type_name, OPTIONAL_OUTPUT, priority)
    }

    /// Required image input that is modified in place
    pub fn modify(self, name: &str, priority: i32) -> Self {
        self.arg(name, "VipsImage", REQUIRED_INPUT | ArgumentFlags::MODIFY, priority)
    }

    /// Input kept only for compatibility
    pub fn deprecated_input(self, name: &str, type_name: &str, required: bool, priority: i32) -> Self {
        let base = if required { REQUIRED_INPUT } else { OPTIONAL_INPUT };
        self.arg(name, type_name, base | ArgumentFlags::DEPRECATED, priority)
    }

    /// Never serve this operation from the operation cache
    pub fn nocache(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// Attach the build function
    pub fn build(
        mut self,
        f: impl Fn(&mut BuildContext<'_>) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.build = Some(Arc::new(f));
        self
    }

    /// Name being declared
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn resolve(self, types: &TypeRegistry) -> NativeResult<OperationClass> {
        let build = self
            .build
            .ok_or_else(|| NativeError::Backend(format!("{}: no build function", self.name)))?;

        let mut args = Vec::with_capacity(self.args.len());
        for (offset, decl) in self.args.into_iter().enumerate() {
            let type_id = types.from_name(&decl.type_name).ok_or_else(|| {
                NativeError::Backend(format!("{}: unknown type {}", self.name, decl.type_name))
            })?;
            args.push(ClassArg {
                kind: types.kind(type_id),
                info: ArgumentInfo {
                    name: decl.name,
                    type_id,
                    flags: decl.flags,
                    priority: decl.priority,
                    offset: 16 + 8 * offset as u32,
                    blurb: decl.blurb,
                },
            });
        }

        let cacheable = self.cacheable
            && !args
                .iter()
                .any(|a| a.info.flags.contains(ArgumentFlags::MODIFY));

        Ok(OperationClass {
            name: self.name,
            description: self.description,
            args,
            cacheable,
            build,
        })
    }
}

pub(crate) struct ClassArg {
    pub info: ArgumentInfo,
    pub kind: TypeKind,
}

impl ClassArg {
    pub fn is_input(&self) -> bool {
        self.info.flags.contains(ArgumentFlags::INPUT)
    }

    pub fn is_output(&self) -> bool {
        self.info.flags.contains(ArgumentFlags::OUTPUT)
    }

    pub fn is_required(&self) -> bool {
        self.info.flags.contains(ArgumentFlags::REQUIRED)
    }
}

/// A resolved, registered operation class.
pub(crate) struct OperationClass {
    pub name: String,
    pub description: String,
    pub args: Vec<ClassArg>,
    pub cacheable: bool,
    pub build: BuildFn,
}

impl OperationClass {
    pub fn arg(&self, name: &str) -> Option<&ClassArg> {
        self.args.iter().find(|a| a.info.name == name)
    }
}

// ============================================================================
// Build context
// ============================================================================

pub(crate) enum Output {
    Image(ImageData),
    Value(Payload),
}

/// What a build function sees: its inputs, the images they refer to, and a
/// place to put outputs.
pub struct BuildContext<'a> {
    op_name: &'a str,
    inputs: &'a HashMap<String, Payload>,
    objects: &'a mut HashMap<usize, ObjectEntry>,
    pub(crate) outputs: Vec<(String, Output)>,
    pub(crate) warnings: Vec<String>,
}

impl<'a> BuildContext<'a> {
    pub(crate) fn new(
        op_name: &'a str,
        inputs: &'a HashMap<String, Payload>,
        objects: &'a mut HashMap<usize, ObjectEntry>,
    ) -> Self {
        Self {
            op_name,
            inputs,
            objects,
            outputs: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Name of the operation being built
    pub fn name(&self) -> &str {
        self.op_name
    }

    /// Whether an input was set by the caller
    pub fn has(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }

    fn payload(&self, name: &str) -> Result<&Payload, String> {
        self.inputs
            .get(name)
            .ok_or_else(|| format!("parameter {} not set", name))
    }

    fn image_at(&self, addr: usize) -> Result<&ImageData, String> {
        match self.objects.get(&addr).map(|e| &e.body) {
            Some(ObjectBody::Image(image)) => Ok(&image.data),
            _ => Err(format!("{:#x} is not an image", addr)),
        }
    }

    /// Image input
    pub fn image(&self, name: &str) -> Result<&ImageData, String> {
        match self.payload(name)? {
            Payload::Object(addr) => self.image_at(*addr),
            _ => Err(format!("parameter {} is not an image", name)),
        }
    }

    /// Image array input
    pub fn images(&self, name: &str) -> Result<Vec<&ImageData>, String> {
        match self.payload(name)? {
            Payload::Images(addrs) => addrs.iter().map(|a| self.image_at(*a)).collect(),
            Payload::Object(addr) => Ok(vec![self.image_at(*addr)?]),
            _ => Err(format!("parameter {} is not an image array", name)),
        }
    }

    /// Image input that the operation may modify in place
    pub fn image_mut(&mut self, name: &str) -> Result<&mut ImageData, String> {
        let addr = match self.payload(name)? {
            Payload::Object(addr) => *addr,
            _ => return Err(format!("parameter {} is not an image", name)),
        };
        match self.objects.get_mut(&addr).map(|e| &mut e.body) {
            Some(ObjectBody::Image(image)) => Ok(&mut image.data),
            _ => Err(format!("{:#x} is not an image", addr)),
        }
    }

    /// Progress signal attached to an image input, if any
    pub fn progress(&self, name: &str) -> Option<Arc<ProgressSignal>> {
        match self.inputs.get(name)? {
            Payload::Object(addr) => match &self.objects.get(addr)?.body {
                ObjectBody::Image(image) => image.progress.clone(),
                _ => None,
            },
            _ => None,
        }
    }

    /// Report progress for `row` of `height` and stop if killed
    pub fn tick(signal: &Option<Arc<ProgressSignal>>, row: i32, height: i32) -> Result<(), String> {
        if let Some(signal) = signal {
            let percent = ((row + 1) as i64 * 100 / height.max(1) as i64) as u32;
            if !signal.report(percent, 0) {
                return Err("killed for image".to_string());
            }
        }
        Ok(())
    }

    /// Integer input
    pub fn int(&self, name: &str) -> Result<i32, String> {
        match self.payload(name)? {
            Payload::Int(v) | Payload::Enum(v) => Ok(*v),
            other => Err(format!("parameter {} is not an int: {:?}", name, other)),
        }
    }

    /// Integer input with a default
    pub fn int_or(&self, name: &str, default: i32) -> Result<i32, String> {
        if self.has(name) {
            self.int(name)
        } else {
            Ok(default)
        }
    }

    /// Double input
    pub fn double(&self, name: &str) -> Result<f64, String> {
        match self.payload(name)? {
            Payload::Double(v) => Ok(*v),
            Payload::Int(v) => Ok(*v as f64),
            other => Err(format!("parameter {} is not a double: {:?}", name, other)),
        }
    }

    /// Double array input
    pub fn doubles(&self, name: &str) -> Result<Vec<f64>, String> {
        match self.payload(name)? {
            Payload::Doubles(v) => Ok(v.clone()),
            Payload::Double(v) => Ok(vec![*v]),
            other => Err(format!("parameter {} is not a double array: {:?}", name, other)),
        }
    }

    /// Boolean input with a default
    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool, String> {
        match self.inputs.get(name) {
            None => Ok(default),
            Some(Payload::Bool(v)) => Ok(*v),
            Some(other) => Err(format!("parameter {} is not a bool: {:?}", name, other)),
        }
    }

    /// String input
    pub fn string(&self, name: &str) -> Result<String, String> {
        match self.payload(name)? {
            Payload::Str(v) => Ok(v.clone()),
            other => Err(format!("parameter {} is not a string: {:?}", name, other)),
        }
    }

    /// String input with a default
    pub fn string_or(&self, name: &str, default: &str) -> Result<String, String> {
        if self.has(name) {
            self.string(name)
        } else {
            Ok(default.to_string())
        }
    }

    /// Flags input with a default
    pub fn flags_or(&self, name: &str, default: u32) -> Result<u32, String> {
        match self.inputs.get(name) {
            None => Ok(default),
            Some(Payload::Flags(v)) => Ok(*v),
            Some(other) => Err(format!("parameter {} is not flags: {:?}", name, other)),
        }
    }

    /// Set an image output
    pub fn set_image(&mut self, name: &str, image: ImageData) {
        self.outputs.push((name.to_string(), Output::Image(image)));
    }

    /// Set a double output
    pub fn set_double(&mut self, name: &str, v: f64) {
        self.outputs.push((name.to_string(), Output::Value(Payload::Double(v))));
    }

    /// Set an int output
    pub fn set_int(&mut self, name: &str, v: i32) {
        self.outputs.push((name.to_string(), Output::Value(Payload::Int(v))));
    }

    /// Set a double array output
    pub fn set_doubles(&mut self, name: &str, v: Vec<f64>) {
        self.outputs.push((name.to_string(), Output::Value(Payload::Doubles(v))));
    }

    /// Set an int array output
    pub fn set_ints(&mut self, name: &str, v: Vec<i32>) {
        self.outputs.push((name.to_string(), Output::Value(Payload::Ints(v))));
    }

    /// Set a flags output
    pub fn set_flags(&mut self, name: &str, v: u32) {
        self.outputs.push((name.to_string(), Output::Value(Payload::Flags(v))));
    }

    /// Set a blob output
    pub fn set_blob(&mut self, name: &str, v: Vec<u8>) {
        self.outputs
            .push((name.to_string(), Output::Value(Payload::Blob(Arc::new(v)))));
    }

    /// Emit a non-fatal warning through the log channel
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}
