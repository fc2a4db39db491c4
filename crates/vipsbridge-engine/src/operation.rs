//! Generic operation invoker
//!
//! [`Operation::call`] runs any native operation by name:
//!
//! 1. resolve the cached descriptor
//! 2. validate positional count, named options and value shapes, resolving
//!    enum nicknames through the type system (no object is touched)
//! 3. instantiate, write positional then named inputs
//! 4. build through the native operation cache
//! 5. harvest required outputs, then requested optional outputs
//! 6. drop the build's output references and the operation itself
//!
//! The native cache may hand back an operation built earlier with the same
//! inputs, so every harvested object is treated as shared and adopted with
//! its own reference.

use vipsbridge_sdk::ObjectPtr;

use crate::error::{Result, VipsError};
use crate::handle::ObjectHandle;
use crate::image::Image;
use crate::introspect::{ArgumentSpec, OperationDescriptor};
use crate::runtime::Vips;
use crate::value::{accepts, resolve_nick, Value, ValueBox};

// ============================================================================
// Named options
// ============================================================================

/// A named option: a value for an optional input, or a request to compute
/// an optional output.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Value(Value),
    Request,
}

/// Ordered bag of named options.
///
/// ```ignore
/// let opts = VOption::new().set("n", 2).request("x");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VOption {
    entries: Vec<(String, OptionValue)>,
}

impl VOption {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry; a replaced entry keeps its position
    pub fn insert(&mut self, name: impl Into<String>, value: OptionValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Builder form of [`insert`](Self::insert) with a value
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, OptionValue::Value(value.into()));
        self
    }

    /// Builder form of [`insert`](Self::insert) with an output request
    pub fn request(mut self, name: impl Into<String>) -> Self {
        self.insert(name, OptionValue::Request);
        self
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<OptionValue> {
        let index = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outputs of a call: one value, or an ordered tuple when there are zero or
/// several outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    Single(Value),
    Tuple(Vec<Value>),
}

impl CallResult {
    fn from_outputs(mut outputs: Vec<Value>) -> Self {
        if outputs.len() == 1 {
            if let Some(v) = outputs.pop() {
                return CallResult::Single(v);
            }
        }
        CallResult::Tuple(outputs)
    }

    pub fn len(&self) -> usize {
        match self {
            CallResult::Single(_) => 1,
            CallResult::Tuple(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All outputs in harvest order
    pub fn into_values(self) -> Vec<Value> {
        match self {
            CallResult::Single(v) => vec![v],
            CallResult::Tuple(v) => v,
        }
    }

    /// First output
    pub fn into_value(self) -> Result<Value> {
        self.into_values()
            .into_iter()
            .next()
            .ok_or_else(|| VipsError::argument_type("result", "a value", "no outputs"))
    }

    /// First output as an image
    pub fn into_image(self) -> Result<Image> {
        self.into_value()?.into_image()
    }

    /// First output as a double
    pub fn into_double(self) -> Result<f64> {
        let value = self.into_value()?;
        value
            .as_double()
            .ok_or_else(|| VipsError::argument_type("result", "double", value.type_name()))
    }
}

// ============================================================================
// Invoker
// ============================================================================

/// A named input ready to be written
struct Write<'a> {
    spec: &'a ArgumentSpec,
    value: Value,
}

/// Call-by-name dispatcher.
pub struct Operation;

impl Operation {
    /// Run the operation `name` with positional `args` and named `options`.
    ///
    /// Argument count, unknown or ambiguous names and value shapes are all
    /// checked before the operation is instantiated. Operations that modify
    /// an image argument in place are rejected here; they run through
    /// [`MutableImage::call`](crate::MutableImage::call).
    pub fn call(vips: &Vips, name: &str, args: &[Value], options: &VOption) -> Result<CallResult> {
        Self::invoke(vips, name, args, options, false)
    }

    /// [`call`](Self::call) for a mutation scope: `MODIFY` arguments are
    /// written as given and edited in place
    pub(crate) fn call_in_place(
        vips: &Vips,
        name: &str,
        args: &[Value],
        options: &VOption,
    ) -> Result<CallResult> {
        Self::invoke(vips, name, args, options, true)
    }

    fn invoke(
        vips: &Vips,
        name: &str,
        args: &[Value],
        options: &VOption,
        in_place: bool,
    ) -> Result<CallResult> {
        let descriptor = vips.introspector().describe(vips.api(), name)?;
        tracing::trace!(operation = name, args = args.len(), options = options.len(), "call");

        if args.len() != descriptor.required_input_count() {
            return Err(VipsError::ArgumentCount {
                operation: name.to_string(),
                expected: descriptor.required_input_count(),
                got: args.len(),
            });
        }

        let positional = Self::check_positional(vips, &descriptor, args, in_place)?;
        let (named, requested) = Self::check_named(vips, &descriptor, options)?;

        // constants standing in for images become images shaped like the
        // first image argument
        let mut writes = Vec::with_capacity(positional.len());
        for Write { spec, value } in positional {
            let value = if spec.is_image() && value.is_constant() {
                let template = Self::first_image(args).ok_or_else(|| {
                    VipsError::argument_type(&spec.name, "image", value.type_name())
                })?;
                Value::Image(match_image(vips, template, &value.constants())?)
            } else {
                value
            };
            writes.push(Write { spec, value });
        }
        writes.extend(named);

        let api = vips.api();
        let Some(ptr) = api.operation_new(name) else {
            return Err(VipsError::NativeOperation(vips.take_error(name)));
        };
        let op = ObjectHandle::new_owned(api.clone(), ptr);

        for write in &writes {
            Self::write(vips, ptr, write.spec, &write.value)?;
        }

        tracing::debug!(operation = name, "build");
        let Some(built) = api.cache_operation_build(ptr) else {
            let message = vips.take_error(name);
            api.object_unref_outputs(ptr);
            op.release();
            tracing::debug!(operation = name, %message, "build failed");
            return Err(VipsError::NativeOperation(message));
        };
        let built = ObjectHandle::new_owned(api.clone(), built);
        op.release();

        let harvest = Self::harvest(vips, &descriptor, &built, &requested);
        if let Some(ptr) = built.ptr() {
            api.object_unref_outputs(ptr);
        }
        built.release();
        Ok(CallResult::from_outputs(harvest?))
    }

    fn check_positional<'d>(
        vips: &Vips,
        descriptor: &'d OperationDescriptor,
        args: &[Value],
        in_place: bool,
    ) -> Result<Vec<Write<'d>>> {
        let mut out = Vec::with_capacity(args.len());
        for (spec, value) in descriptor.required_inputs().zip(args) {
            if spec.is_modify && !in_place {
                return Err(VipsError::argument_type(
                    &spec.name,
                    "an image opened with Image::mutate",
                    "an immutable image",
                ));
            }
            let value = if spec.is_image() && value.is_constant() {
                value.clone()
            } else {
                Self::prepare(vips, spec, value)?
            };
            out.push(Write { spec, value });
        }
        Ok(out)
    }

    /// Check `value` against `spec` and resolve enum nicknames
    fn prepare(vips: &Vips, spec: &ArgumentSpec, value: &Value) -> Result<Value> {
        if !accepts(spec.kind, value) {
            return Err(VipsError::argument_type(
                &spec.name,
                &spec.type_name,
                value.type_name(),
            ));
        }
        let resolved = resolve_nick(vips.api().as_ref(), spec.type_id, spec.kind, value)
            .map_err(|e| Self::rename(e, spec))?;
        Ok(resolved.unwrap_or_else(|| value.clone()))
    }

    /// Point a slot-level type error at the argument it was raised for
    fn rename(err: VipsError, spec: &ArgumentSpec) -> VipsError {
        match err {
            VipsError::ArgumentType { expected, got, .. } => VipsError::ArgumentType {
                argument: spec.name.clone(),
                expected,
                got,
            },
            other => other,
        }
    }

    /// Resolve named options to input writes and output requests
    fn check_named<'d>(
        vips: &Vips,
        descriptor: &'d OperationDescriptor,
        options: &VOption,
    ) -> Result<(Vec<Write<'d>>, Vec<&'d str>)> {
        let mut writes = Vec::new();
        let mut requested = Vec::new();

        for (key, option) in options.iter() {
            let input = descriptor.named_input(key);
            let output = descriptor.output(key);
            let unknown = || VipsError::UnknownArgument {
                operation: descriptor.name().to_string(),
                argument: key.to_string(),
            };

            if input.is_some() && output.is_some() {
                return Err(VipsError::AmbiguousArgument {
                    operation: descriptor.name().to_string(),
                    argument: key.to_string(),
                });
            }

            match (option, input, output) {
                (OptionValue::Value(value), Some(spec), None) => {
                    let value = Self::prepare(vips, spec, value)?;
                    writes.push(Write { spec, value });
                }
                (OptionValue::Request, None, Some(spec)) => requested.push(spec.name.as_str()),
                // `{"x": true}` requests an output, `false` leaves it alone
                (OptionValue::Value(Value::Bool(want)), None, Some(spec)) => {
                    if *want {
                        requested.push(spec.name.as_str());
                    }
                }
                (OptionValue::Value(value), None, Some(spec)) => {
                    return Err(VipsError::argument_type(
                        &spec.name,
                        "an output request",
                        value.type_name(),
                    ));
                }
                (OptionValue::Request, Some(spec), None) => {
                    return Err(VipsError::argument_type(
                        &spec.name,
                        &spec.type_name,
                        "an output request",
                    ));
                }
                _ => return Err(unknown()),
            }
        }
        Ok((writes, requested))
    }

    fn first_image(args: &[Value]) -> Option<&Image> {
        args.iter().find_map(|v| match v {
            Value::Image(i) => Some(i),
            Value::ImageArray(images) => images.first(),
            _ => None,
        })
    }

    fn write(vips: &Vips, op: ObjectPtr, spec: &ArgumentSpec, value: &Value) -> Result<()> {
        let mut slot = ValueBox::init_with_kind(vips, spec.type_id, spec.kind);
        slot.set(value).map_err(|e| Self::rename(e, spec))?;
        vips.api().set_property(op, &spec.name, slot.ptr())?;
        Ok(())
    }

    fn read(vips: &Vips, op: ObjectPtr, spec: &ArgumentSpec) -> Result<Value> {
        let slot = ValueBox::init_with_kind(vips, spec.type_id, spec.kind);
        vips.api().get_property(op, &spec.name, slot.ptr())?;
        slot.get()
    }

    fn harvest(
        vips: &Vips,
        descriptor: &OperationDescriptor,
        built: &ObjectHandle,
        requested: &[&str],
    ) -> Result<Vec<Value>> {
        let ptr = built.get()?;
        let mut outputs = Vec::new();
        for spec in descriptor.required_outputs() {
            outputs.push(Self::read(vips, ptr, spec)?);
        }
        for spec in descriptor
            .optional_outputs()
            .filter(|s| requested.contains(&s.name.as_str()))
        {
            outputs.push(Self::read(vips, ptr, spec)?);
        }
        Ok(outputs)
    }
}

/// Constant image with the size of `template`: one band per constant, or
/// as many bands as `template` when there is a single constant.
pub fn match_image(vips: &Vips, template: &Image, constants: &[f64]) -> Result<Image> {
    let width = template.width()?;
    let height = template.height()?;
    let bands = if constants.len() == 1 {
        template.bands()?
    } else {
        1
    };

    let black = Operation::call(
        vips,
        "black",
        &[Value::from(width), Value::from(height)],
        &VOption::new().set("bands", bands),
    )?
    .into_image()?;

    Operation::call(
        vips,
        "linear",
        &[
            Value::Image(black),
            Value::DoubleArray(vec![1.0]),
            Value::DoubleArray(constants.to_vec()),
        ],
        &VOption::new(),
    )?
    .into_image()
}
