//! Host functions: Rust callables importable by guest modules
//!
//! A [`HostFunction`] pairs an explicit [`FunctionType`] with a callable over
//! [`Value`]s. [`HostFunction::wrap`] derives the type from a typed closure:
//!
//! ```
//! use wasmite::host::HostFunction;
//! use wasmite::module::{FunctionType, ValueType};
//!
//! let add = HostFunction::wrap(|a: i32, b: i32| a.wrapping_add(b));
//! assert_eq!(
//!     add.ty(),
//!     &FunctionType::new(vec![ValueType::I32, ValueType::I32], vec![ValueType::I32])
//! );
//! ```

use std::fmt;
use std::rc::Rc;

use crate::error::Error;
use crate::module::{FunctionType, ValueType};
use crate::runtime::{SharedMemory, Value};

/// Failure raised by a host callable
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HostError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        HostError {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(message: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        HostError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// What a host callable can see of its caller
pub struct HostContext {
    memory: Option<SharedMemory>,
}

impl HostContext {
    pub(crate) fn new(memory: Option<SharedMemory>) -> Self {
        HostContext { memory }
    }

    /// Linear memory of the calling instance, if it has one
    pub fn memory(&self) -> Option<&SharedMemory> {
        self.memory.as_ref()
    }

    fn require_memory(&self) -> Result<&SharedMemory, HostError> {
        self.memory.as_ref().ok_or_else(|| HostError::new("caller has no memory"))
    }

    pub fn read_bytes(&self, address: u32, len: usize) -> Result<Vec<u8>, HostError> {
        self.require_memory()?
            .borrow()
            .read_bytes(address, len)
            .map_err(|kind| HostError::with_source(format!("reading {len} bytes at {address}"), kind))
    }

    pub fn write_bytes(&self, address: u32, bytes: &[u8]) -> Result<(), HostError> {
        self.require_memory()?
            .borrow_mut()
            .write_bytes(address, bytes)
            .map_err(|kind| HostError::with_source(format!("writing {} bytes at {address}", bytes.len()), kind))
    }
}

type Callback = dyn Fn(&mut HostContext, &[Value]) -> Result<Vec<Value>, HostError>;

#[derive(Clone)]
pub struct HostFunction {
    ty: FunctionType,
    callback: Rc<Callback>,
    /// `module.name` once registered with a store
    name: Option<Rc<str>>,
}

impl HostFunction {
    /// A host function with an explicit signature
    pub fn new<F>(ty: FunctionType, callback: F) -> Self
    where
        F: Fn(&mut HostContext, &[Value]) -> Result<Vec<Value>, HostError> + 'static,
    {
        HostFunction {
            ty,
            callback: Rc::new(callback),
            name: None,
        }
    }

    /// A host function whose signature is taken from the closure's parameter and result types
    pub fn wrap<Params, Results>(callable: impl IntoHostFunction<Params, Results>) -> Self {
        callable.into_host_function()
    }

    pub fn ty(&self) -> &FunctionType {
        &self.ty
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unregistered>")
    }

    pub(crate) fn named(mut self, name: String) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Call on behalf of a guest whose linear memory is `memory`
    pub(crate) fn invoke(&self, memory: Option<SharedMemory>, args: &[Value]) -> Result<Vec<Value>, Error> {
        self.call(&mut HostContext::new(memory), args).map_err(|source| Error::Host {
            function: self.name().to_string(),
            source,
        })
    }

    /// Run the callable and check its results against the declared result types
    pub(crate) fn call(&self, ctx: &mut HostContext, args: &[Value]) -> Result<Vec<Value>, HostError> {
        let results = (self.callback)(ctx, args)?;
        let types: Vec<ValueType> = results.iter().map(Value::typ).collect();
        if types != self.ty.return_types {
            return Err(HostError::new(format!(
                "returned ({}), declared {}",
                types.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
                self.ty
            )));
        }
        Ok(results)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({} {})", self.name(), self.ty)
    }
}

/// Rust types that map onto a WebAssembly value type
pub trait WasmType: Copy + 'static {
    const TYPE: ValueType;
    fn from_value(value: Value) -> Option<Self>;
    fn into_value(self) -> Value;
}

macro_rules! wasm_type {
    ($ty:ty, $variant:ident) => {
        impl WasmType for $ty {
            const TYPE: ValueType = ValueType::$variant;

            fn from_value(value: Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn into_value(self) -> Value {
                Value::$variant(self)
            }
        }
    };
}

wasm_type!(i32, I32);
wasm_type!(i64, I64);
wasm_type!(f32, F32);
wasm_type!(f64, F64);

/// Return types a wrapped closure may have
pub trait HostResults {
    fn types() -> Vec<ValueType>;
    fn into_results(self) -> Result<Vec<Value>, HostError>;
}

impl HostResults for () {
    fn types() -> Vec<ValueType> {
        Vec::new()
    }

    fn into_results(self) -> Result<Vec<Value>, HostError> {
        Ok(Vec::new())
    }
}

macro_rules! host_result {
    ($ty:ty) => {
        impl HostResults for $ty {
            fn types() -> Vec<ValueType> {
                vec![<$ty as WasmType>::TYPE]
            }

            fn into_results(self) -> Result<Vec<Value>, HostError> {
                Ok(vec![self.into_value()])
            }
        }
    };
}

host_result!(i32);
host_result!(i64);
host_result!(f32);
host_result!(f64);

impl<T: HostResults> HostResults for Result<T, HostError> {
    fn types() -> Vec<ValueType> {
        T::types()
    }

    fn into_results(self) -> Result<Vec<Value>, HostError> {
        self?.into_results()
    }
}

pub trait IntoHostFunction<Params, Results> {
    fn into_host_function(self) -> HostFunction;
}

macro_rules! into_host_function {
    ($($param:ident),*) => {
        #[allow(non_snake_case)]
        impl<F, R, $($param,)*> IntoHostFunction<($($param,)*), R> for F
        where
            F: Fn($($param),*) -> R + 'static,
            R: HostResults,
            $($param: WasmType,)*
        {
            fn into_host_function(self) -> HostFunction {
                let ty = FunctionType::new(vec![$($param::TYPE),*], R::types());
                HostFunction::new(ty, move |_ctx, args| {
                    #[allow(unused_mut, unused_variables)]
                    let mut args = args.iter().copied();
                    $(
                        let $param = args
                            .next()
                            .and_then($param::from_value)
                            .ok_or_else(|| HostError::new("argument type mismatch"))?;
                    )*
                    (self)($($param),*).into_results()
                })
            }
        }
    };
}

into_host_function!();
into_host_function!(A1);
into_host_function!(A1, A2);
into_host_function!(A1, A2, A3);
into_host_function!(A1, A2, A3, A4);
into_host_function!(A1, A2, A3, A4, A5);
into_host_function!(A1, A2, A3, A4, A5, A6);
