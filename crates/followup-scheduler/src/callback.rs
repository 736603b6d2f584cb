//! Callbacks as data.
//!
//! A deferred job or a validation predicate is persisted as a [`CallbackRef`]:
//! a plain, serializable description of *what* to call. At execution time the
//! descriptor is resolved through a [`CallbackRegistry`] that the host process
//! populated at startup. Closures carry no stable name and are rejected at
//! encode time.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use followup_core::{FollowupError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resolved, invokable callback.
pub type CallbackFn = Arc<dyn Fn(&Value) -> std::result::Result<Value, String> + Send + Sync>;

/// Produces a live instance of a registered class.
pub type ComponentFactory = Arc<dyn Fn() -> Arc<dyn Component> + Send + Sync>;

/// A live object whose methods can be named in an instance-method descriptor.
pub trait Component: Send + Sync {
    fn class_name(&self) -> &str;

    fn responds_to(&self, method: &str) -> bool;

    fn invoke(&self, method: &str, args: &Value) -> std::result::Result<Value, String>;
}

/// Something a caller wants run later.
#[derive(Clone)]
pub enum Callable {
    /// Free function registered by name.
    Function(String),
    /// Static method `Class::method`.
    Static { class: String, method: String },
    /// Method on a live instance. Only the class name survives encoding.
    Bound {
        instance: Arc<dyn Component>,
        method: String,
    },
    /// Anonymous closure. Never persistable.
    Closure(CallbackFn),
}

impl Callable {
    pub fn function(name: impl Into<String>) -> Self {
        Callable::Function(name.into())
    }

    pub fn method(class: impl Into<String>, method: impl Into<String>) -> Self {
        Callable::Static {
            class: class.into(),
            method: method.into(),
        }
    }

    pub fn bound(instance: Arc<dyn Component>, method: impl Into<String>) -> Self {
        Callable::Bound {
            instance,
            method: method.into(),
        }
    }

    pub fn closure<F>(f: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        Callable::Closure(Arc::new(f))
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Function(name) => write!(f, "Function({name})"),
            Callable::Static { class, method } => write!(f, "Static({class}::{method})"),
            Callable::Bound { instance, method } => {
                write!(f, "Bound({}->{method})", instance.class_name())
            }
            Callable::Closure(_) => f.write_str("Closure"),
        }
    }
}

/// Persisted callback descriptor.
///
/// ```json
/// {"type":"static_method","class":"Mailer","method":"is_subscribed"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallbackRef {
    Function { name: String },
    StaticMethod { class: String, method: String },
    InstanceMethod { class: String, method: String },
}

impl CallbackRef {
    /// Reduce a callable to its descriptor.
    pub fn encode(callable: &Callable) -> Result<Self> {
        let desc = match callable {
            Callable::Function(name) => CallbackRef::Function { name: name.clone() },
            Callable::Static { class, method } => CallbackRef::StaticMethod {
                class: class.clone(),
                method: method.clone(),
            },
            Callable::Bound { instance, method } => CallbackRef::InstanceMethod {
                class: instance.class_name().to_string(),
                method: method.clone(),
            },
            Callable::Closure(_) => {
                return Err(FollowupError::NotEncodable(
                    "closures cannot be persisted".into(),
                ));
            }
        };
        desc.check_names()?;
        Ok(desc)
    }

    fn check_names(&self) -> Result<()> {
        let blank = match self {
            CallbackRef::Function { name } => name.trim().is_empty(),
            CallbackRef::StaticMethod { class, method }
            | CallbackRef::InstanceMethod { class, method } => {
                class.trim().is_empty() || method.trim().is_empty()
            }
        };
        if blank {
            return Err(FollowupError::NotEncodable(format!("blank name in {self}")));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl fmt::Display for CallbackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackRef::Function { name } => write!(f, "{name}()"),
            CallbackRef::StaticMethod { class, method } => write!(f, "{class}::{method}()"),
            CallbackRef::InstanceMethod { class, method } => write!(f, "{class}->{method}()"),
        }
    }
}

/// Registration record for one class.
#[derive(Default)]
pub struct ClassDef {
    static_methods: HashMap<String, CallbackFn>,
    singleton: Option<ComponentFactory>,
    constructor: Option<ComponentFactory>,
}

impl ClassDef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn static_method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.static_methods.insert(name.to_string(), Arc::new(f));
        self
    }

    /// Accessor returning the shared instance. Preferred over the constructor.
    pub fn singleton<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Arc<dyn Component> + Send + Sync + 'static,
    {
        self.singleton = Some(Arc::new(f));
        self
    }

    /// Shorthand for a singleton that hands out one fixed instance.
    pub fn shared(self, instance: Arc<dyn Component>) -> Self {
        self.singleton(move || instance.clone())
    }

    /// Zero-argument constructor, used when no singleton is registered.
    pub fn constructor<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Arc<dyn Component> + Send + Sync + 'static,
    {
        self.constructor = Some(Arc::new(f));
        self
    }
}

/// Name → code table consulted when a descriptor is executed.
#[derive(Default)]
pub struct CallbackRegistry {
    functions: RwLock<HashMap<String, CallbackFn>>,
    classes: RwLock<HashMap<String, ClassDef>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function<F>(&self, name: &str, f: F)
    where
        F: Fn(&Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        tracing::debug!("🔗 Registered callback function '{name}'");
        self.functions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::new(f));
    }

    pub fn register_class(&self, name: &str, def: ClassDef) {
        tracing::debug!("🔗 Registered callback class '{name}'");
        self.classes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), def);
    }

    pub fn unregister_function(&self, name: &str) -> bool {
        self.functions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn unregister_class(&self, name: &str) -> bool {
        self.classes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    /// Whether the descriptor currently resolves.
    pub fn contains(&self, desc: &CallbackRef) -> bool {
        self.resolve(desc).is_ok()
    }

    /// Turn a descriptor back into something invokable.
    pub fn resolve(&self, desc: &CallbackRef) -> Result<CallbackFn> {
        match desc {
            CallbackRef::Function { name } => self
                .functions
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(name)
                .cloned()
                .ok_or_else(|| FollowupError::UnresolvableSymbol(format!("function '{name}'"))),

            CallbackRef::StaticMethod { class, method } => {
                let classes = self.classes.read().unwrap_or_else(|e| e.into_inner());
                let def = classes
                    .get(class)
                    .ok_or_else(|| FollowupError::UnresolvableSymbol(format!("class '{class}'")))?;
                def.static_methods.get(method).cloned().ok_or_else(|| {
                    FollowupError::UnresolvableSymbol(format!("method '{class}::{method}'"))
                })
            }

            CallbackRef::InstanceMethod { class, method } => {
                let factory = {
                    let classes = self.classes.read().unwrap_or_else(|e| e.into_inner());
                    let def = classes.get(class).ok_or_else(|| {
                        FollowupError::UnresolvableSymbol(format!("class '{class}'"))
                    })?;
                    def.singleton
                        .clone()
                        .or_else(|| def.constructor.clone())
                        .ok_or_else(|| {
                            FollowupError::UnresolvableSymbol(format!(
                                "class '{class}' has no singleton or constructor"
                            ))
                        })?
                };
                // factory runs outside the lock; it may touch the registry itself
                let instance = factory();
                if !instance.responds_to(method) {
                    return Err(FollowupError::UnresolvableSymbol(format!(
                        "method '{class}->{method}'"
                    )));
                }
                let method = method.clone();
                Ok(Arc::new(move |args: &Value| instance.invoke(&method, args)))
            }
        }
    }

    /// Resolve and call in one step.
    pub fn invoke(&self, desc: &CallbackRef, args: &Value) -> Result<std::result::Result<Value, String>> {
        let f = self.resolve(desc)?;
        Ok(f(args))
    }
}
