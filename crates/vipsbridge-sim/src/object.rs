//! Object table, value slots and reference counting
//!
//! Every native object lives in one table keyed by a synthetic address.
//! Payloads that point at objects (object values, image arrays, operation
//! properties, header fields) own one reference per pointer, so freeing a
//! payload may cascade. Cascades run on an explicit worklist and collect
//! post-close callbacks instead of running them, so that callbacks always
//! execute after the state lock has been released.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use vipsbridge_sdk::{
    NativeError, NativeResult, PostCloseFn, ProgressSignal, TypeId, TypeKind,
};

use crate::cache::OperationCache;
use crate::class::OperationClass;
use crate::image::ImageData;

const FIRST_ADDR: usize = 0x10_0000;
const ADDR_STRIDE: usize = 0x40;

/// Contents of a value slot or property.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Payload {
    Empty,
    Bool(bool),
    Int(i32),
    UInt64(u64),
    Double(f64),
    Str(String),
    Enum(i32),
    Flags(u32),
    Doubles(Vec<f64>),
    Ints(Vec<i32>),
    Blob(Arc<Vec<u8>>),
    Object(usize),
    Images(Vec<usize>),
}

impl Payload {
    /// Zero value for a freshly initialized slot
    pub fn default_for(kind: TypeKind) -> Self {
        match kind {
            TypeKind::Bool => Payload::Bool(false),
            TypeKind::Int => Payload::Int(0),
            TypeKind::UInt64 => Payload::UInt64(0),
            TypeKind::Double => Payload::Double(0.0),
            TypeKind::Enum => Payload::Enum(0),
            TypeKind::Flags => Payload::Flags(0),
            TypeKind::ArrayDouble => Payload::Doubles(Vec::new()),
            TypeKind::ArrayInt => Payload::Ints(Vec::new()),
            TypeKind::ArrayImage => Payload::Images(Vec::new()),
            _ => Payload::Empty,
        }
    }

    /// Objects this payload holds a reference on
    pub fn object_refs(&self) -> Vec<usize> {
        match self {
            Payload::Object(addr) => vec![*addr],
            Payload::Images(addrs) => addrs.clone(),
            _ => Vec::new(),
        }
    }
}

pub(crate) struct ValueSlot {
    pub type_id: TypeId,
    pub kind: TypeKind,
    pub payload: Payload,
}

pub(crate) struct ImageObject {
    pub data: ImageData,
    pub header: BTreeMap<String, (TypeId, Payload)>,
    pub progress: Option<Arc<ProgressSignal>>,
    pub invalidations: u32,
}

impl ImageObject {
    pub fn new(data: ImageData) -> Self {
        Self {
            data,
            header: BTreeMap::new(),
            progress: None,
            invalidations: 0,
        }
    }
}

pub(crate) struct OperationObject {
    pub class: Arc<OperationClass>,
    pub props: HashMap<String, Payload>,
    pub built: bool,
    /// Builds whose caller share on the outputs is still outstanding
    pub output_shares: u32,
}

impl OperationObject {
    pub fn new(class: Arc<OperationClass>) -> Self {
        Self {
            class,
            props: HashMap::new(),
            built: false,
            output_shares: 0,
        }
    }

    /// Objects referenced by output properties
    pub fn output_objects(&self) -> Vec<usize> {
        self.class
            .args
            .iter()
            .filter(|a| a.is_output())
            .filter_map(|a| self.props.get(&a.info.name))
            .flat_map(Payload::object_refs)
            .collect()
    }
}

pub(crate) enum ObjectBody {
    Image(ImageObject),
    Operation(OperationObject),
}

pub(crate) struct ObjectEntry {
    pub type_id: TypeId,
    pub refs: u32,
    pub body: ObjectBody,
    pub postclose: Vec<PostCloseFn>,
}

impl ObjectEntry {
    fn held_refs(&self) -> Vec<usize> {
        match &self.body {
            ObjectBody::Image(image) => image
                .header
                .values()
                .flat_map(|(_, p)| p.object_refs())
                .collect(),
            ObjectBody::Operation(op) => op.props.values().flat_map(Payload::object_refs).collect(),
        }
    }
}

/// Mutable state of the library, guarded by one lock.
pub(crate) struct State {
    next_addr: usize,
    pub objects: HashMap<usize, ObjectEntry>,
    pub values: HashMap<usize, ValueSlot>,
    pub error: String,
    pub cache: OperationCache,
    pub concurrency: i32,
}

impl State {
    pub fn new() -> Self {
        Self {
            next_addr: FIRST_ADDR,
            objects: HashMap::new(),
            values: HashMap::new(),
            error: String::new(),
            cache: OperationCache::new(),
            concurrency: 0,
        }
    }

    pub fn alloc_addr(&mut self) -> usize {
        let addr = self.next_addr;
        self.next_addr += ADDR_STRIDE;
        addr
    }

    /// Insert an object with a reference count of one
    pub fn insert_object(&mut self, type_id: TypeId, body: ObjectBody) -> usize {
        let addr = self.alloc_addr();
        self.objects.insert(
            addr,
            ObjectEntry {
                type_id,
                refs: 1,
                body,
                postclose: Vec::new(),
            },
        );
        addr
    }

    pub fn ref_object(&mut self, addr: usize) {
        if let Some(entry) = self.objects.get_mut(&addr) {
            entry.refs += 1;
        }
    }

    /// Drop one reference, cascading through anything freed
    pub fn unref_object(&mut self, addr: usize, fired: &mut Vec<PostCloseFn>) {
        let mut work = vec![addr];
        while let Some(addr) = work.pop() {
            let Some(entry) = self.objects.get_mut(&addr) else {
                continue;
            };
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs > 0 {
                continue;
            }
            if let Some(mut entry) = self.objects.remove(&addr) {
                work.extend(entry.held_refs());
                fired.append(&mut entry.postclose);
            }
        }
    }

    pub fn ref_payload(&mut self, payload: &Payload) {
        for addr in payload.object_refs() {
            self.ref_object(addr);
        }
    }

    pub fn unref_payload(&mut self, payload: &Payload, fired: &mut Vec<PostCloseFn>) {
        for addr in payload.object_refs() {
            self.unref_object(addr, fired);
        }
    }

    pub fn entry(&self, addr: usize) -> NativeResult<&ObjectEntry> {
        self.objects
            .get(&addr)
            .ok_or(NativeError::InvalidPointer(addr))
    }

    pub fn image(&self, addr: usize) -> NativeResult<&ImageObject> {
        match &self.entry(addr)?.body {
            ObjectBody::Image(image) => Ok(image),
            ObjectBody::Operation(_) => Err(NativeError::TypeMismatch {
                expected: "VipsImage".to_string(),
                got: "VipsOperation".to_string(),
            }),
        }
    }

    pub fn image_mut(&mut self, addr: usize) -> NativeResult<&mut ImageObject> {
        match self.objects.get_mut(&addr).map(|e| &mut e.body) {
            Some(ObjectBody::Image(image)) => Ok(image),
            Some(ObjectBody::Operation(_)) => Err(NativeError::TypeMismatch {
                expected: "VipsImage".to_string(),
                got: "VipsOperation".to_string(),
            }),
            None => Err(NativeError::InvalidPointer(addr)),
        }
    }

    pub fn operation(&self, addr: usize) -> NativeResult<&OperationObject> {
        match &self.entry(addr)?.body {
            ObjectBody::Operation(op) => Ok(op),
            ObjectBody::Image(_) => Err(NativeError::TypeMismatch {
                expected: "VipsOperation".to_string(),
                got: "VipsImage".to_string(),
            }),
        }
    }

    pub fn operation_mut(&mut self, addr: usize) -> NativeResult<&mut OperationObject> {
        match self.objects.get_mut(&addr).map(|e| &mut e.body) {
            Some(ObjectBody::Operation(op)) => Ok(op),
            Some(ObjectBody::Image(_)) => Err(NativeError::TypeMismatch {
                expected: "VipsOperation".to_string(),
                got: "VipsImage".to_string(),
            }),
            None => Err(NativeError::InvalidPointer(addr)),
        }
    }

    pub fn slot(&self, addr: usize) -> NativeResult<&ValueSlot> {
        self.values
            .get(&addr)
            .ok_or(NativeError::InvalidPointer(addr))
    }

    /// Replace a slot's payload, moving object references across
    pub fn store(&mut self, addr: usize, payload: Payload, fired: &mut Vec<PostCloseFn>) {
        self.ref_payload(&payload);
        let old = match self.values.get_mut(&addr) {
            Some(slot) => std::mem::replace(&mut slot.payload, payload),
            None => {
                self.unref_payload(&payload, fired);
                return;
            }
        };
        self.unref_payload(&old, fired);
    }

    /// Append a line to the error buffer, `domain: message` style
    pub fn append_error(&mut self, domain: &str, message: &str) {
        self.error.push_str(domain);
        self.error.push_str(": ");
        self.error.push_str(message);
        self.error.push('\n');
    }
}
