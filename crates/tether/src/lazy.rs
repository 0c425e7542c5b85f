//! Promise-style chaining over values that only exist as futures.
//!
//! A [`Lazy`] wraps a future and lets callers read properties and call
//! functions on its eventual value, each step producing another `Lazy`.
//! Nothing runs until the final value is awaited, and every step runs at most
//! once however many times it is awaited.
//!
//! ```ignore
//! let answer = Lazy::new(fetch_config()).get("limits").get("max").call(vec![]).await?;
//! ```

use std::collections::BTreeMap;
use std::future::{Future, IntoFuture};
use std::sync::Arc;

use futures::future::{BoxFuture, Shared, try_join_all};
use futures::FutureExt;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LazyError {
    #[error("{0} is not supported on a lazy value")]
    Unsupported(String),

    #[error("{on} has no property '{property}'")]
    MissingProperty { property: String, on: String },

    #[error("{0} is not callable")]
    NotCallable(String),

    #[error("{0}")]
    Failed(String),
}

/// Value that can be navigated through a [`Lazy`].
pub trait Object: Clone + Send + Sync + 'static {
    /// Read `property`. Functions come back bound to `self`.
    fn get(&self, property: &str) -> Result<Self, LazyError>;

    fn invoke(&self, args: Vec<Self>) -> BoxFuture<'static, Result<Self, LazyError>>;
}

/// A memoized, not-yet-started computation of a `T`.
pub struct Lazy<T> {
    future: Shared<BoxFuture<'static, Result<T, LazyError>>>,
}

impl<T> Clone for Lazy<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            future: self.future.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Lazy<T>
where
    T: Clone + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lazy")
            .field("value", &self.future.peek())
            .finish()
    }
}

impl<T> Lazy<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, LazyError>> + Send + 'static,
    {
        Self {
            future: future.boxed().shared(),
        }
    }

    pub fn ready(value: T) -> Self {
        Self::new(futures::future::ready(Ok(value)))
    }

    /// Whether some awaiter already drove the computation to completion.
    pub fn is_settled(&self) -> bool {
        self.future.peek().is_some()
    }

    pub fn map<U, F>(&self, f: F) -> Lazy<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, LazyError> + Send + 'static,
    {
        let upstream = self.future.clone();
        Lazy::new(async move { f(upstream.await?) })
    }

    pub fn and_then<U, F, Fut>(&self, f: F) -> Lazy<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, LazyError>> + Send + 'static,
    {
        let upstream = self.future.clone();
        Lazy::new(async move { f(upstream.await?).await })
    }

    /// Assignment through a lazy value is never allowed.
    pub fn set(&self, property: &str, _value: impl Into<Lazy<T>>) -> Result<(), LazyError> {
        Err(LazyError::Unsupported(format!("assigning '{property}'")))
    }
}

impl<T: Object> Lazy<T> {
    pub fn get(&self, property: &str) -> Lazy<T> {
        let property = property.to_string();
        self.and_then(move |value| async move { value.get(&property) })
    }

    /// Call the eventual value, awaiting any lazy arguments first.
    pub fn call(&self, args: Vec<Lazy<T>>) -> Lazy<T> {
        self.and_then(move |callee| async move {
            let args = try_join_all(args.into_iter().map(|arg| arg.future)).await?;
            callee.invoke(args).await
        })
    }
}

impl<T> From<T> for Lazy<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn from(value: T) -> Self {
        Self::ready(value)
    }
}

impl<T> IntoFuture for Lazy<T>
where
    T: Clone,
{
    type Output = Result<T, LazyError>;
    type IntoFuture = Shared<BoxFuture<'static, Result<T, LazyError>>>;

    fn into_future(self) -> Self::IntoFuture {
        self.future
    }
}

type NativeFn = dyn Fn(Option<DynValue>, Vec<DynValue>) -> BoxFuture<'static, Result<DynValue, LazyError>>
    + Send
    + Sync;

/// Function value, optionally bound to the object it was read from.
#[derive(Clone)]
pub struct DynFunction {
    call: Arc<NativeFn>,
    this: Option<Box<DynValue>>,
}

impl DynFunction {
    fn bind(&self, this: &DynValue) -> Self {
        Self {
            call: Arc::clone(&self.call),
            this: Some(Box::new(this.clone())),
        }
    }
}

/// Dynamically typed value for building navigable object graphs.
#[derive(Clone, Default)]
pub enum DynValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<DynValue>),
    Object(Arc<BTreeMap<String, DynValue>>),
    Function(DynFunction),
}

impl DynValue {
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, DynValue)>,
    {
        Self::Object(Arc::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// Synchronous function. Receives the bound receiver, if any.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Option<&DynValue>, &[DynValue]) -> Result<DynValue, LazyError> + Send + Sync + 'static,
    {
        Self::async_function(move |this, args| {
            let result = f(this.as_ref(), &args);
            async move { result }
        })
    }

    pub fn async_function<F, Fut>(f: F) -> Self
    where
        F: Fn(Option<DynValue>, Vec<DynValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DynValue, LazyError>> + Send + 'static,
    {
        Self::Function(DynFunction {
            call: Arc::new(move |this, args| f(this, args).boxed()),
            this: None,
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Object(_) => "object",
            Self::Function(_) => "function",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    fn missing(&self, property: &str) -> LazyError {
        LazyError::MissingProperty {
            property: property.to_string(),
            on: self.type_name().to_string(),
        }
    }
}

impl Object for DynValue {
    fn get(&self, property: &str) -> Result<Self, LazyError> {
        match self {
            Self::Object(fields) => match fields.get(property) {
                Some(Self::Function(f)) => Ok(Self::Function(f.bind(self))),
                Some(value) => Ok(value.clone()),
                None => Err(self.missing(property)),
            },
            Self::List(items) if property == "length" => Ok(Self::Number(items.len() as f64)),
            Self::List(items) => property
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned())
                .ok_or_else(|| self.missing(property)),
            Self::String(s) if property == "length" => Ok(Self::Number(s.chars().count() as f64)),
            _ => Err(self.missing(property)),
        }
    }

    fn invoke(&self, args: Vec<Self>) -> BoxFuture<'static, Result<Self, LazyError>> {
        match self {
            Self::Function(f) => (f.call)(f.this.as_deref().cloned(), args),
            other => {
                let err = LazyError::NotCallable(other.type_name().to_string());
                futures::future::ready(Err(err)).boxed()
            }
        }
    }
}

impl std::fmt::Debug for DynValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Object(fields) => f.debug_map().entries(fields.iter()).finish(),
            Self::Function(func) => match &func.this {
                Some(_) => f.write_str("<bound function>"),
                None => f.write_str("<function>"),
            },
        }
    }
}

impl PartialEq for DynValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => Arc::ptr_eq(&a.call, &b.call),
            _ => false,
        }
    }
}

impl From<f64> for DynValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for DynValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for DynValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for DynValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<serde_json::Value> for DynValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => n.as_f64().map_or(Self::Null, Self::Number),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(fields) => Self::object(fields.into_iter().map(|(k, v)| (k, Self::from(v)))),
        }
    }
}
