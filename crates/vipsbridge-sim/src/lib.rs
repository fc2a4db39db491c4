//! vipsbridge-sim - in-process reference image library
//!
//! [`SimLibrary`] implements [`NativeApi`] entirely in Rust. It has the same
//! observable object model as the real library: a reference-counted object
//! table, typed value slots, introspectable operation classes, a global error
//! buffer, an operation cache keyed by argument signature, post-close signals,
//! progress polling and a log channel.
//!
//! It exists so that the binding's marshaling and lifetime logic can be
//! exercised without a system libvips. It counts every call that touches
//! objects, values or global state so tests can assert that a failed call
//! never reached the native side; read-only type-system lookups are counted
//! separately.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vipsbridge_sim::SimLibrary;
//!
//! let sim = Arc::new(SimLibrary::new());
//! let before = sim.native_calls();
//! // ... drive the engine ...
//! assert_eq!(sim.live_objects(), 0);
//! ```

mod cache;
mod class;
mod image;
mod object;
mod ops;
mod types;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use vipsbridge_sdk::{
    ArgumentFlags, ArgumentInfo, BandFormat, LogHandler, LogLevel, NativeApi, NativeError,
    NativeResult, ObjectPtr, PostCloseFn, ProgressSignal, TypeId, TypeKind, ValuePtr,
};

pub use class::{BuildContext, BuildFn, OperationDefinition};
pub use image::ImageData;
pub use types::ids;

use class::{OperationClass, Output};
use object::{ImageObject, ObjectBody, OperationObject, Payload, State, ValueSlot};
use types::TypeRegistry;

/// Version reported by [`NativeApi::version`]
pub const VERSION: (i32, i32, i32) = (8, 15, 0);

/// Header fields every image answers from its own geometry
const BUILTIN_FIELDS: [&str; 4] = ["width", "height", "bands", "format"];

/// The reference library.
pub struct SimLibrary {
    state: Mutex<State>,
    classes: RwLock<HashMap<String, Arc<OperationClass>>>,
    types: TypeRegistry,
    log_handler: RwLock<Option<LogHandler>>,
    calls: AtomicU64,
    queries: AtomicU64,
}

impl Default for SimLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl SimLibrary {
    /// Create a library with the built-in operations registered
    pub fn new() -> Self {
        let lib = Self {
            state: Mutex::new(State::new()),
            classes: RwLock::new(HashMap::new()),
            types: TypeRegistry::new(),
            log_handler: RwLock::new(None),
            calls: AtomicU64::new(0),
            queries: AtomicU64::new(0),
        };
        for def in ops::builtin_operations() {
            // built-in declarations only use registered type names
            if let Err(e) = lib.register_operation(def) {
                tracing::error!(error = %e, "failed to register built-in operation");
            }
        }
        lib
    }

    /// Register (or replace) an operation class
    pub fn register_operation(&self, def: OperationDefinition) -> NativeResult<()> {
        let class = def.resolve(&self.types)?;
        tracing::debug!(operation = %class.name, args = class.args.len(), "registered operation");
        self.classes.write().insert(class.name.clone(), Arc::new(class));
        Ok(())
    }

    /// Number of `NativeApi` calls that touched objects, values or global
    /// state
    pub fn native_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether a log handler is installed
    pub fn has_log_handler(&self) -> bool {
        self.log_handler.read().is_some()
    }

    /// Number of type-system lookups (type names, kinds, enum nicks)
    pub fn type_queries(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    /// Objects currently alive (images and operations)
    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Value slots currently allocated
    pub fn live_values(&self) -> usize {
        self.state.lock().values.len()
    }

    /// Operations currently held by the operation cache
    pub fn cache_len(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Operation cache hits since creation
    pub fn cache_hits(&self) -> u64 {
        self.state.lock().cache.hits
    }

    /// Operation cache limits as `(max, max_mem, max_files)`
    pub fn cache_limits(&self) -> (i32, u64, i32) {
        let state = self.state.lock();
        (state.cache.max, state.cache.max_mem, state.cache.max_files)
    }

    /// Worker thread count last set through `concurrency_set`
    pub fn concurrency(&self) -> i32 {
        self.state.lock().concurrency
    }

    /// Copy of the pixels of a live image
    pub fn image_data(&self, image: ObjectPtr) -> Option<ImageData> {
        self.state
            .lock()
            .image(image.addr())
            .ok()
            .map(|i| i.data.clone())
    }

    /// How many times `image_invalidate_all` reached this image
    pub fn invalidations(&self, image: ObjectPtr) -> u32 {
        self.state
            .lock()
            .image(image.addr())
            .map(|i| i.invalidations)
            .unwrap_or(0)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn query(&self) {
        self.queries.fetch_add(1, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }

    fn class(&self, name: &str) -> Option<Arc<OperationClass>> {
        self.classes.read().get(name).cloned()
    }

    /// Run post-close callbacks collected under the lock
    fn finish(&self, fired: Vec<PostCloseFn>) {
        for callback in fired {
            callback();
        }
    }

    fn log(&self, level: LogLevel, domain: &str, message: &str) {
        let handler = self.log_handler.read().clone();
        match handler {
            Some(handler) => handler(level, domain, message),
            None => match level {
                LogLevel::Error | LogLevel::Critical => tracing::error!(domain, "{}", message),
                LogLevel::Warning => tracing::warn!(domain, "{}", message),
                LogLevel::Message | LogLevel::Info => tracing::info!(domain, "{}", message),
                LogLevel::Debug => tracing::debug!(domain, "{}", message),
            },
        }
    }

    fn set_payload(&self, value: ValuePtr, payload: Payload) {
        let mut fired = Vec::new();
        self.lock().store(value.addr(), payload, &mut fired);
        self.finish(fired);
    }

    fn payload(&self, value: ValuePtr) -> Payload {
        self.lock()
            .slot(value.addr())
            .map(|s| s.payload.clone())
            .unwrap_or(Payload::Empty)
    }

    fn alloc_value(&self, state: &mut State, type_id: TypeId, payload: Payload) -> ValuePtr {
        let addr = state.alloc_addr();
        state.ref_payload(&payload);
        state.values.insert(
            addr,
            ValueSlot {
                type_id,
                kind: self.types.kind(type_id),
                payload,
            },
        );
        // allocator addresses start well above zero
        ValuePtr::new(addr).unwrap_or_else(|| unreachable!())
    }

    fn builtin_field(&self, data: &ImageData, name: &str) -> Option<(TypeId, Payload)> {
        match name {
            "width" => Some((ids::INT, Payload::Int(data.width))),
            "height" => Some((ids::INT, Payload::Int(data.height))),
            "bands" => Some((ids::INT, Payload::Int(data.bands))),
            "format" => Some((ids::BAND_FORMAT, Payload::Enum(data.format as i32))),
            _ => None,
        }
    }

    /// Signature used as the operation cache key
    fn cache_key(class: &OperationClass, props: &HashMap<String, Payload>) -> String {
        let mut key = format!("{}(", class.name);
        for arg in class.args.iter().filter(|a| a.is_input()) {
            if let Some(payload) = props.get(&arg.info.name) {
                key.push_str(&format!("{}={:?};", arg.info.name, payload));
            }
        }
        key.push(')');
        key
    }

    /// Give the caller one share on every output of a built operation
    fn hand_out_outputs(state: &mut State, op: usize) {
        let outputs = match state.operation_mut(op) {
            Ok(operation) => {
                operation.output_shares += 1;
                operation.output_objects()
            }
            Err(_) => return,
        };
        for addr in outputs {
            state.ref_object(addr);
        }
    }

    fn build(&self, op: usize) -> Result<usize, String> {
        let mut state = self.lock();
        let mut fired = Vec::new();
        let mut messages: Vec<(LogLevel, String, String)> = Vec::new();

        let (class, props, built) = match state.operation(op) {
            Ok(o) => (o.class.clone(), o.props.clone(), o.built),
            Err(e) => return Err(e.to_string()),
        };

        if built {
            state.ref_object(op);
            Self::hand_out_outputs(&mut state, op);
            return Ok(op);
        }

        for arg in class.args.iter().filter(|a| a.is_input() && a.is_required()) {
            if !props.contains_key(&arg.info.name) {
                let message = format!("parameter {} not set", arg.info.name);
                state.append_error(&class.name, &message);
                return Err(message);
            }
        }

        let key = class.cacheable.then(|| Self::cache_key(&class, &props));
        if let Some(key) = &key {
            if let Some(cached) = state.cache.lookup(key) {
                if state.cache.trace {
                    messages.push((LogLevel::Info, "vips".to_string(), format!("vips cache*: {}", key)));
                }
                state.ref_object(cached);
                Self::hand_out_outputs(&mut state, cached);
                drop(state);
                for (level, domain, message) in messages {
                    self.log(level, &domain, &message);
                }
                return Ok(cached);
            }
            if state.cache.trace {
                messages.push((LogLevel::Info, "vips".to_string(), format!("vips cache-: {}", key)));
            }
        }

        let result = {
            let mut ctx = BuildContext::new(&class.name, &props, &mut state.objects);
            let result = (class.build)(&mut ctx);
            for warning in ctx.warnings.drain(..) {
                messages.push((LogLevel::Warning, class.name.clone(), warning));
            }
            result.map(|_| std::mem::take(&mut ctx.outputs))
        };

        let outcome = match result {
            Err(message) => {
                state.append_error(&class.name, &message);
                Err(message)
            }
            Ok(outputs) => {
                for (name, output) in outputs {
                    let payload = match output {
                        Output::Image(data) => {
                            let addr = state.insert_object(ids::IMAGE, ObjectBody::Image(ImageObject::new(data)));
                            Payload::Object(addr)
                        }
                        Output::Value(payload) => {
                            state.ref_payload(&payload);
                            payload
                        }
                    };
                    let old = state
                        .operation_mut(op)
                        .ok()
                        .and_then(|o| o.props.insert(name, payload));
                    if let Some(old) = old {
                        state.unref_payload(&old, &mut fired);
                    }
                }
                if let Ok(operation) = state.operation_mut(op) {
                    operation.built = true;
                }

                // returned reference
                state.ref_object(op);
                Self::hand_out_outputs(&mut state, op);

                if let Some(key) = key {
                    let deps = class
                        .args
                        .iter()
                        .filter(|a| a.is_input())
                        .filter_map(|a| props.get(&a.info.name))
                        .flat_map(Payload::object_refs)
                        .collect();
                    state.ref_object(op);
                    for evicted in state.cache.insert(key, op, deps) {
                        state.unref_object(evicted, &mut fired);
                    }
                }
                Ok(op)
            }
        };

        drop(state);
        for (level, domain, message) in messages {
            self.log(level, &domain, &message);
        }
        self.finish(fired);
        outcome
    }
}

fn ptr(addr: usize) -> Option<ObjectPtr> {
    ObjectPtr::new(addr)
}

impl NativeApi for SimLibrary {
    // ========================================================================
    // Type System
    // ========================================================================

    fn type_from_name(&self, name: &str) -> Option<TypeId> {
        self.query();
        self.types.from_name(name)
    }

    fn type_name(&self, ty: TypeId) -> String {
        self.query();
        self.types.name(ty)
    }

    fn type_kind(&self, ty: TypeId) -> TypeKind {
        self.query();
        self.types.kind(ty)
    }

    fn type_is_a(&self, ty: TypeId, parent: TypeId) -> bool {
        self.query();
        self.types.is_a(ty, parent)
    }

    fn image_type(&self) -> TypeId {
        self.query();
        ids::IMAGE
    }

    fn enum_from_nick(&self, ty: TypeId, nick: &str) -> NativeResult<i32> {
        self.query();
        self.types.from_nick(ty, nick)
    }

    fn enum_nick(&self, ty: TypeId, value: i32) -> Option<String> {
        self.query();
        self.types.nick(ty, value)
    }

    // ========================================================================
    // Objects
    // ========================================================================

    fn operation_new(&self, name: &str) -> Option<ObjectPtr> {
        self.enter();
        let Some(class) = self.class(name) else {
            self.lock()
                .append_error("VipsOperation", &format!("class \"{}\" not found", name));
            return None;
        };
        let addr = self
            .lock()
            .insert_object(ids::OPERATION, ObjectBody::Operation(OperationObject::new(class)));
        ptr(addr)
    }

    fn object_ref(&self, obj: ObjectPtr) {
        self.enter();
        self.lock().ref_object(obj.addr());
    }

    fn object_unref(&self, obj: ObjectPtr) {
        self.enter();
        let mut fired = Vec::new();
        self.lock().unref_object(obj.addr(), &mut fired);
        self.finish(fired);
    }

    fn object_ref_count(&self, obj: ObjectPtr) -> u32 {
        self.enter();
        self.lock().entry(obj.addr()).map(|e| e.refs).unwrap_or(0)
    }

    fn object_type(&self, obj: ObjectPtr) -> TypeId {
        self.enter();
        self.lock()
            .entry(obj.addr())
            .map(|e| e.type_id)
            .unwrap_or(TypeId::INVALID)
    }

    fn object_description(&self, obj: ObjectPtr) -> String {
        self.enter();
        match self.lock().operation(obj.addr()) {
            Ok(o) => o.class.description.clone(),
            Err(_) => String::new(),
        }
    }

    fn argument_map(&self, op: ObjectPtr, visit: &mut dyn FnMut(ArgumentInfo)) {
        self.enter();
        let class = match self.lock().operation(op.addr()) {
            Ok(o) => o.class.clone(),
            Err(_) => return,
        };
        for arg in &class.args {
            visit(arg.info.clone());
        }
        // every object also carries plain, non-construct properties
        visit(ArgumentInfo {
            name: "nickname".to_string(),
            type_id: ids::STRING,
            flags: ArgumentFlags::SET_ONCE,
            priority: 0,
            offset: 8,
            blurb: "Class nickname".to_string(),
        });
    }

    fn set_property(&self, obj: ObjectPtr, name: &str, value: ValuePtr) -> NativeResult<()> {
        self.enter();
        let mut fired = Vec::new();
        let result = {
            let mut state = self.lock();
            let class = state.operation(obj.addr())?.class.clone();
            let arg = class.arg(name).ok_or_else(|| NativeError::UnknownProperty {
                type_name: class.name.clone(),
                name: name.to_string(),
            })?;
            let slot = state.slot(value.addr())?;
            if slot.kind != arg.kind {
                return Err(NativeError::TypeMismatch {
                    expected: self.types.name(arg.info.type_id),
                    got: self.types.name(slot.type_id),
                });
            }
            let payload = slot.payload.clone();
            state.ref_payload(&payload);
            let old = state.operation_mut(obj.addr())?.props.insert(name.to_string(), payload);
            if let Some(old) = old {
                state.unref_payload(&old, &mut fired);
            }
            Ok(())
        };
        self.finish(fired);
        result
    }

    fn get_property(&self, obj: ObjectPtr, name: &str, value: ValuePtr) -> NativeResult<()> {
        self.enter();
        let mut fired = Vec::new();
        {
            let mut state = self.lock();
            let operation = state.operation(obj.addr())?;
            let arg = operation.class.arg(name).ok_or_else(|| NativeError::UnknownProperty {
                type_name: operation.class.name.clone(),
                name: name.to_string(),
            })?;
            let payload = operation
                .props
                .get(name)
                .cloned()
                .unwrap_or_else(|| Payload::default_for(arg.kind));
            let slot_kind = state.slot(value.addr())?.kind;
            if slot_kind != arg.kind {
                return Err(NativeError::TypeMismatch {
                    expected: arg.kind.name().to_string(),
                    got: slot_kind.name().to_string(),
                });
            }
            state.store(value.addr(), payload, &mut fired);
        }
        self.finish(fired);
        Ok(())
    }

    fn cache_operation_build(&self, op: ObjectPtr) -> Option<ObjectPtr> {
        self.enter();
        match self.build(op.addr()) {
            Ok(addr) => ptr(addr),
            Err(message) => {
                tracing::debug!(op = ?op, %message, "build failed");
                None
            }
        }
    }

    fn object_unref_outputs(&self, op: ObjectPtr) {
        self.enter();
        let mut fired = Vec::new();
        {
            let mut state = self.lock();
            let outputs = match state.operation_mut(op.addr()) {
                Ok(operation) if operation.output_shares > 0 => {
                    operation.output_shares -= 1;
                    operation.output_objects()
                }
                _ => Vec::new(),
            };
            for addr in outputs {
                state.unref_object(addr, &mut fired);
            }
        }
        self.finish(fired);
    }

    // ========================================================================
    // Values
    // ========================================================================

    fn value_init(&self, ty: TypeId) -> ValuePtr {
        self.enter();
        let payload = Payload::default_for(self.types.kind(ty));
        let mut state = self.lock();
        self.alloc_value(&mut state, ty, payload)
    }

    fn value_type(&self, value: ValuePtr) -> TypeId {
        self.enter();
        self.lock()
            .slot(value.addr())
            .map(|s| s.type_id)
            .unwrap_or(TypeId::INVALID)
    }

    fn value_unset(&self, value: ValuePtr) {
        self.enter();
        let mut fired = Vec::new();
        {
            let mut state = self.lock();
            if let Some(slot) = state.values.remove(&value.addr()) {
                state.unref_payload(&slot.payload, &mut fired);
            }
        }
        self.finish(fired);
    }

    fn value_set_bool(&self, value: ValuePtr, v: bool) {
        self.enter();
        self.set_payload(value, Payload::Bool(v));
    }

    fn value_get_bool(&self, value: ValuePtr) -> bool {
        self.enter();
        matches!(self.payload(value), Payload::Bool(true))
    }

    fn value_set_int(&self, value: ValuePtr, v: i32) {
        self.enter();
        self.set_payload(value, Payload::Int(v));
    }

    fn value_get_int(&self, value: ValuePtr) -> i32 {
        self.enter();
        match self.payload(value) {
            Payload::Int(v) => v,
            _ => 0,
        }
    }

    fn value_set_uint64(&self, value: ValuePtr, v: u64) {
        self.enter();
        self.set_payload(value, Payload::UInt64(v));
    }

    fn value_get_uint64(&self, value: ValuePtr) -> u64 {
        self.enter();
        match self.payload(value) {
            Payload::UInt64(v) => v,
            _ => 0,
        }
    }

    fn value_set_double(&self, value: ValuePtr, v: f64) {
        self.enter();
        self.set_payload(value, Payload::Double(v));
    }

    fn value_get_double(&self, value: ValuePtr) -> f64 {
        self.enter();
        match self.payload(value) {
            Payload::Double(v) => v,
            _ => 0.0,
        }
    }

    fn value_set_string(&self, value: ValuePtr, v: &str) {
        self.enter();
        self.set_payload(value, Payload::Str(v.to_string()));
    }

    fn value_get_string(&self, value: ValuePtr) -> Option<String> {
        self.enter();
        match self.payload(value) {
            Payload::Str(v) => Some(v),
            _ => None,
        }
    }

    fn value_set_enum(&self, value: ValuePtr, v: i32) {
        self.enter();
        self.set_payload(value, Payload::Enum(v));
    }

    fn value_get_enum(&self, value: ValuePtr) -> i32 {
        self.enter();
        match self.payload(value) {
            Payload::Enum(v) => v,
            _ => 0,
        }
    }

    fn value_set_flags(&self, value: ValuePtr, v: u32) {
        self.enter();
        self.set_payload(value, Payload::Flags(v));
    }

    fn value_get_flags(&self, value: ValuePtr) -> u32 {
        self.enter();
        match self.payload(value) {
            Payload::Flags(v) => v,
            _ => 0,
        }
    }

    fn value_set_array_double(&self, value: ValuePtr, v: &[f64]) {
        self.enter();
        self.set_payload(value, Payload::Doubles(v.to_vec()));
    }

    fn value_get_array_double(&self, value: ValuePtr) -> Vec<f64> {
        self.enter();
        match self.payload(value) {
            Payload::Doubles(v) => v,
            _ => Vec::new(),
        }
    }

    fn value_set_array_int(&self, value: ValuePtr, v: &[i32]) {
        self.enter();
        self.set_payload(value, Payload::Ints(v.to_vec()));
    }

    fn value_get_array_int(&self, value: ValuePtr) -> Vec<i32> {
        self.enter();
        match self.payload(value) {
            Payload::Ints(v) => v,
            _ => Vec::new(),
        }
    }

    fn value_set_blob(&self, value: ValuePtr, v: Vec<u8>) {
        self.enter();
        self.set_payload(value, Payload::Blob(Arc::new(v)));
    }

    fn value_get_blob(&self, value: ValuePtr) -> Vec<u8> {
        self.enter();
        match self.payload(value) {
            Payload::Blob(v) => v.as_ref().clone(),
            _ => Vec::new(),
        }
    }

    fn value_set_object(&self, value: ValuePtr, v: Option<ObjectPtr>) {
        self.enter();
        let payload = match v {
            Some(obj) => Payload::Object(obj.addr()),
            None => Payload::Empty,
        };
        self.set_payload(value, payload);
    }

    fn value_get_object(&self, value: ValuePtr) -> Option<ObjectPtr> {
        self.enter();
        match self.payload(value) {
            Payload::Object(addr) => ptr(addr),
            _ => None,
        }
    }

    fn value_set_array_image(&self, value: ValuePtr, v: &[ObjectPtr]) {
        self.enter();
        self.set_payload(value, Payload::Images(v.iter().map(|p| p.addr()).collect()));
    }

    fn value_get_array_image(&self, value: ValuePtr) -> Vec<ObjectPtr> {
        self.enter();
        match self.payload(value) {
            Payload::Images(addrs) => addrs.into_iter().filter_map(ptr).collect(),
            Payload::Object(addr) => ptr(addr).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    // ========================================================================
    // Error Buffer
    // ========================================================================

    fn error_buffer(&self) -> String {
        self.enter();
        self.lock().error.clone()
    }

    fn error_clear(&self) {
        self.enter();
        self.lock().error.clear();
    }

    // ========================================================================
    // Images
    // ========================================================================

    fn image_new_from_memory(
        &self,
        data: &[u8],
        width: i32,
        height: i32,
        bands: i32,
        format: BandFormat,
    ) -> Option<ObjectPtr> {
        self.enter();
        let mut state = self.lock();
        match ImageData::from_bytes(data, width, height, bands, format) {
            Ok(image) => ptr(state.insert_object(ids::IMAGE, ObjectBody::Image(ImageObject::new(image)))),
            Err(message) => {
                state.append_error("vips_image_new_from_memory", &message);
                None
            }
        }
    }

    fn image_write_to_memory(&self, image: ObjectPtr) -> Option<Vec<u8>> {
        self.enter();
        let mut state = self.lock();
        match state.image(image.addr()) {
            Ok(i) => Some(i.data.to_bytes()),
            Err(e) => {
                state.append_error("vips_image_write_to_memory", &e.to_string());
                None
            }
        }
    }

    fn image_copy_memory(&self, image: ObjectPtr) -> Option<ObjectPtr> {
        self.enter();
        let mut state = self.lock();
        let (data, header) = match state.image(image.addr()) {
            Ok(i) => (i.data.clone(), i.header.clone()),
            Err(e) => {
                state.append_error("vips_image_copy_memory", &e.to_string());
                return None;
            }
        };
        for (_, payload) in header.values() {
            state.ref_payload(payload);
        }
        let mut copy = ImageObject::new(data);
        copy.header = header;
        ptr(state.insert_object(ids::IMAGE, ObjectBody::Image(copy)))
    }

    fn image_invalidate_all(&self, image: ObjectPtr) {
        self.enter();
        let mut fired = Vec::new();
        {
            let mut state = self.lock();
            if let Ok(i) = state.image_mut(image.addr()) {
                i.invalidations += 1;
            }
            for op in state.cache.drop_referencing(image.addr()) {
                state.unref_object(op, &mut fired);
            }
        }
        self.finish(fired);
    }

    fn image_get_typeof(&self, image: ObjectPtr, name: &str) -> Option<TypeId> {
        self.enter();
        let state = self.lock();
        let image = state.image(image.addr()).ok()?;
        self.builtin_field(&image.data, name)
            .map(|(ty, _)| ty)
            .or_else(|| image.header.get(name).map(|(ty, _)| *ty))
    }

    fn image_get(&self, image: ObjectPtr, name: &str) -> Option<ValuePtr> {
        self.enter();
        let mut state = self.lock();
        let (type_id, payload) = {
            let image = state.image(image.addr()).ok()?;
            self.builtin_field(&image.data, name)
                .or_else(|| image.header.get(name).cloned())?
        };
        Some(self.alloc_value(&mut state, type_id, payload))
    }

    fn image_set(&self, image: ObjectPtr, name: &str, value: ValuePtr) {
        self.enter();
        if BUILTIN_FIELDS.contains(&name) {
            self.log(
                LogLevel::Warning,
                "vips_image_set",
                &format!("field \"{}\" is read-only", name),
            );
            return;
        }
        let mut fired = Vec::new();
        {
            let mut state = self.lock();
            let Ok(slot) = state.slot(value.addr()) else {
                return;
            };
            let field = (slot.type_id, slot.payload.clone());
            state.ref_payload(&field.1);
            let old = match state.image_mut(image.addr()) {
                Ok(i) => i.header.insert(name.to_string(), field),
                Err(_) => {
                    state.unref_payload(&field.1, &mut fired);
                    None
                }
            };
            if let Some((_, old)) = old {
                state.unref_payload(&old, &mut fired);
            }
        }
        self.finish(fired);
    }

    fn image_remove(&self, image: ObjectPtr, name: &str) -> bool {
        self.enter();
        let mut fired = Vec::new();
        let removed = {
            let mut state = self.lock();
            let old = state
                .image_mut(image.addr())
                .ok()
                .and_then(|i| i.header.remove(name));
            match old {
                Some((_, payload)) => {
                    state.unref_payload(&payload, &mut fired);
                    true
                }
                None => false,
            }
        };
        self.finish(fired);
        removed
    }

    fn image_get_fields(&self, image: ObjectPtr) -> Vec<String> {
        self.enter();
        let state = self.lock();
        match state.image(image.addr()) {
            Ok(i) => BUILTIN_FIELDS
                .iter()
                .map(|f| f.to_string())
                .chain(i.header.keys().cloned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn foreign_find_load(&self, filename: &str) -> Option<String> {
        self.enter();
        let path = Path::new(filename);
        if !path.is_file() {
            self.lock()
                .append_error("VipsForeignLoad", &format!("file \"{}\" does not exist", filename));
            return None;
        }
        if filename.to_ascii_lowercase().ends_with(".csv") {
            return Some("csvload".to_string());
        }
        self.lock().append_error(
            "VipsForeignLoad",
            &format!("\"{}\" is not a known file format", filename),
        );
        None
    }

    fn foreign_find_save(&self, filename: &str) -> Option<String> {
        self.enter();
        if filename.to_ascii_lowercase().ends_with(".csv") {
            return Some("csvsave".to_string());
        }
        self.lock().append_error(
            "VipsForeignSave",
            &format!("\"{}\" is not a known file format", filename),
        );
        None
    }

    // ========================================================================
    // Signals
    // ========================================================================

    fn connect_postclose(&self, obj: ObjectPtr, callback: PostCloseFn) -> NativeResult<()> {
        self.enter();
        let mut state = self.lock();
        match state.objects.get_mut(&obj.addr()) {
            Some(entry) => {
                entry.postclose.push(callback);
                Ok(())
            }
            None => Err(NativeError::InvalidPointer(obj.addr())),
        }
    }

    fn attach_progress(&self, image: ObjectPtr, signal: Arc<ProgressSignal>) {
        self.enter();
        if let Ok(i) = self.lock().image_mut(image.addr()) {
            i.progress = Some(signal);
        }
    }

    fn set_log_handler(&self, handler: Option<LogHandler>) {
        self.enter();
        *self.log_handler.write() = handler;
    }

    // ========================================================================
    // Global State
    // ========================================================================

    fn cache_set_max(&self, max: i32) {
        self.enter();
        let mut fired = Vec::new();
        {
            let mut state = self.lock();
            for op in state.cache.set_max(max) {
                state.unref_object(op, &mut fired);
            }
        }
        self.finish(fired);
    }

    fn cache_set_max_mem(&self, max_mem: u64) {
        self.enter();
        self.lock().cache.max_mem = max_mem;
    }

    fn cache_set_max_files(&self, max_files: i32) {
        self.enter();
        self.lock().cache.max_files = max_files;
    }

    fn cache_set_trace(&self, trace: bool) {
        self.enter();
        self.lock().cache.trace = trace;
    }

    fn concurrency_set(&self, concurrency: i32) {
        self.enter();
        self.lock().concurrency = concurrency;
    }

    fn version(&self) -> (i32, i32, i32) {
        self.enter();
        VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(sim: &SimLibrary, w: i32, h: i32, fill: u8) -> ObjectPtr {
        let bytes = vec![fill; (w * h) as usize];
        sim.image_new_from_memory(&bytes, w, h, 1, BandFormat::UChar)
            .unwrap()
    }

    fn set_object(sim: &SimLibrary, op: ObjectPtr, name: &str, obj: ObjectPtr) {
        let v = sim.value_init(ids::IMAGE);
        sim.value_set_object(v, Some(obj));
        sim.set_property(op, name, v).unwrap();
        sim.value_unset(v);
    }

    fn get_object(sim: &SimLibrary, op: ObjectPtr, name: &str) -> ObjectPtr {
        let v = sim.value_init(ids::IMAGE);
        sim.get_property(op, name, v).unwrap();
        let obj = sim.value_get_object(v).unwrap();
        sim.object_ref(obj);
        sim.value_unset(v);
        obj
    }

    #[test]
    fn test_argument_map_includes_non_construct() {
        let sim = SimLibrary::new();
        let op = sim.operation_new("add").unwrap();
        let mut names = Vec::new();
        sim.argument_map(op, &mut |arg| names.push((arg.name, arg.flags.contains(ArgumentFlags::CONSTRUCT))));
        assert_eq!(
            names,
            vec![
                ("left".to_string(), true),
                ("right".to_string(), true),
                ("out".to_string(), true),
                ("nickname".to_string(), false),
            ]
        );
        sim.object_unref(op);
        assert_eq!(sim.live_objects(), 0);
    }

    #[test]
    fn test_unknown_operation_sets_error() {
        let sim = SimLibrary::new();
        assert!(sim.operation_new("nope").is_none());
        assert!(sim.error_buffer().contains("nope"));
        sim.error_clear();
        assert!(sim.error_buffer().is_empty());
    }

    #[test]
    fn test_build_add_and_release_everything() {
        let sim = SimLibrary::new();
        sim.cache_set_max(0);
        let a = image(&sim, 2, 2, 10);
        let b = image(&sim, 2, 2, 5);

        let op = sim.operation_new("add").unwrap();
        set_object(&sim, op, "left", a);
        set_object(&sim, op, "right", b);
        let built = sim.cache_operation_build(op).unwrap();
        let out = get_object(&sim, built, "out");
        sim.object_unref_outputs(built);
        sim.object_unref(built);
        sim.object_unref(op);

        let data = sim.image_data(out).unwrap();
        assert_eq!(data.pixels, vec![15.0; 4]);
        assert_eq!(data.format, BandFormat::UShort);
        assert_eq!(sim.object_ref_count(out), 1);

        for obj in [a, b, out] {
            sim.object_unref(obj);
        }
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(sim.live_values(), 0);
    }

    #[test]
    fn test_missing_required_input_fails_build() {
        let sim = SimLibrary::new();
        let op = sim.operation_new("avg").unwrap();
        assert!(sim.cache_operation_build(op).is_none());
        assert_eq!(sim.error_buffer(), "avg: parameter in not set\n");
        sim.object_unref(op);
    }

    #[test]
    fn test_cache_hit_returns_same_operation() {
        let sim = SimLibrary::new();
        let a = image(&sim, 1, 1, 3);
        let mut results = Vec::new();
        for _ in 0..2 {
            let op = sim.operation_new("invert").unwrap();
            set_object(&sim, op, "in", a);
            let built = sim.cache_operation_build(op).unwrap();
            sim.object_unref_outputs(built);
            results.push(built);
            sim.object_unref(built);
            sim.object_unref(op);
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(sim.cache_hits(), 1);

        sim.cache_set_max(0);
        sim.object_unref(a);
        assert_eq!(sim.live_objects(), 0);
    }

    #[test]
    fn test_postclose_runs_once_after_last_unref() {
        let sim = SimLibrary::new();
        let img = image(&sim, 1, 1, 0);
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        sim.connect_postclose(img, Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        sim.object_ref(img);
        sim.object_unref(img);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sim.object_unref(img);
        sim.object_unref(img);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_header_fields() {
        let sim = SimLibrary::new();
        let img = image(&sim, 3, 2, 0);
        let v = sim.value_init(ids::STRING);
        sim.value_set_string(v, "hello");
        sim.image_set(img, "comment", v);
        sim.value_unset(v);

        assert_eq!(sim.image_get_typeof(img, "comment"), Some(ids::STRING));
        assert_eq!(sim.image_get_typeof(img, "width"), Some(ids::INT));
        let got = sim.image_get(img, "comment").unwrap();
        assert_eq!(sim.value_get_string(got).as_deref(), Some("hello"));
        sim.value_unset(got);

        assert!(sim.image_get_fields(img).contains(&"comment".to_string()));
        assert!(sim.image_remove(img, "comment"));
        assert!(!sim.image_remove(img, "comment"));
        sim.object_unref(img);
        assert_eq!(sim.live_values(), 0);
    }

    #[test]
    fn test_modify_operation_writes_in_place() {
        let sim = SimLibrary::new();
        let img = image(&sim, 4, 4, 0);
        let op = sim.operation_new("draw_rect").unwrap();
        set_object(&sim, op, "image", img);
        let ink = sim.value_init(ids::ARRAY_DOUBLE);
        sim.value_set_array_double(ink, &[255.0]);
        sim.set_property(op, "ink", ink).unwrap();
        sim.value_unset(ink);
        for (name, v) in [("left", 1), ("top", 1), ("width", 2), ("height", 2)] {
            let slot = sim.value_init(ids::INT);
            sim.value_set_int(slot, v);
            sim.set_property(op, name, slot).unwrap();
            sim.value_unset(slot);
        }
        let built = sim.cache_operation_build(op).unwrap();
        sim.object_unref_outputs(built);
        sim.object_unref(built);
        sim.object_unref(op);

        let data = sim.image_data(img).unwrap();
        assert_eq!(data.get(1, 1, 0), 255.0);
        assert_eq!(data.get(0, 0, 0), 0.0);
        assert_eq!(sim.cache_len(), 0);
        sim.object_unref(img);
    }

    #[test]
    fn test_progress_kill_stops_build() {
        let sim = SimLibrary::new();
        let img = image(&sim, 2, 8, 1);
        let signal = Arc::new(ProgressSignal::new());
        signal.request_kill();
        sim.attach_progress(img, signal.clone());

        let op = sim.operation_new("avg").unwrap();
        set_object(&sim, op, "in", img);
        assert!(sim.cache_operation_build(op).is_none());
        assert!(sim.error_buffer().contains("killed"));
        sim.object_unref(op);
        sim.object_unref(img);
    }

    #[test]
    fn test_log_handler_receives_warnings() {
        let sim = SimLibrary::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        sim.set_log_handler(Some(Arc::new(move |level: LogLevel, domain: &str, msg: &str| {
            s.lock().push((level, domain.to_string(), msg.to_string()));
        })));

        let img = image(&sim, 1, 1, 0);
        let v = sim.value_init(ids::INT);
        sim.image_set(img, "width", v);
        sim.value_unset(v);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, LogLevel::Warning);
        drop(seen);
        sim.object_unref(img);
    }

    #[test]
    fn test_native_calls_counted() {
        let sim = SimLibrary::new();
        let before = sim.native_calls();
        let queries = sim.type_queries();
        sim.version();
        sim.image_type();
        sim.type_kind(ids::INT);
        assert_eq!(sim.native_calls(), before + 1);
        assert_eq!(sim.type_queries(), queries + 2);
    }
}
