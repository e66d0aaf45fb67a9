//! Object registry: (interface, object path) -> dispatch tables.
//!
//! Every object gets a numeric index when its path is first registered.
//! Further interfaces registered on the same path share that index.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use saftbus_serial::{Signature, Value};

use crate::call::{INTROSPECTABLE_INTERFACE, OWNED_INTERFACE, PROPERTIES_CHANGED, PROPERTIES_INTERFACE};
use crate::control::IndexTable;
use crate::error::{CallError, ErrorKind};
use crate::service::{CallContext, Service};

pub type MethodHandler = Rc<dyn Fn(&mut CallContext, &[Value]) -> Result<Vec<Value>, CallError>>;
pub type PropertyGetter = Rc<dyn Fn() -> Result<Value, CallError>>;
pub type PropertySetter = Rc<dyn Fn(&mut CallContext, Value) -> Result<(), CallError>>;
pub type ObjectHook = Rc<dyn Fn(&Service)>;

#[derive(Clone)]
struct MethodEntry {
    in_sig: String,
    out_sig: String,
    handler: MethodHandler,
}

#[derive(Clone)]
pub(crate) struct PropertyEntry {
    pub(crate) signature: String,
    pub(crate) getter: PropertyGetter,
    pub(crate) setter: Option<PropertySetter>,
}

/// Methods, properties and signals of one interface.
#[derive(Clone)]
pub struct Vtable {
    interface: String,
    methods: BTreeMap<String, MethodEntry>,
    properties: BTreeMap<String, PropertyEntry>,
    signals: BTreeMap<String, String>,
    owner_only: BTreeSet<String>,
}

impl Vtable {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            methods: BTreeMap::new(),
            properties: BTreeMap::new(),
            signals: BTreeMap::new(),
            owner_only: BTreeSet::new(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Add a method. `in_sig` and `out_sig` are concatenated argument
    /// signatures (`"sat"`), used for argument checks and introspection.
    pub fn method(
        mut self,
        name: impl Into<String>,
        in_sig: &str,
        out_sig: &str,
        handler: impl Fn(&mut CallContext, &[Value]) -> Result<Vec<Value>, CallError> + 'static,
    ) -> Self {
        self.methods.insert(
            name.into(),
            MethodEntry {
                in_sig: in_sig.to_string(),
                out_sig: out_sig.to_string(),
                handler: Rc::new(handler),
            },
        );
        self
    }

    /// Only the object's owner may call `name` (a method, or a property setter).
    pub fn owner_only(mut self, name: impl Into<String>) -> Self {
        self.owner_only.insert(name.into());
        self
    }

    /// Add a read-only property.
    pub fn property(
        mut self,
        name: impl Into<String>,
        signature: &str,
        getter: impl Fn() -> Result<Value, CallError> + 'static,
    ) -> Self {
        self.properties.insert(
            name.into(),
            PropertyEntry {
                signature: signature.to_string(),
                getter: Rc::new(getter),
                setter: None,
            },
        );
        self
    }

    pub fn writable_property(
        mut self,
        name: impl Into<String>,
        signature: &str,
        getter: impl Fn() -> Result<Value, CallError> + 'static,
        setter: impl Fn(&mut CallContext, Value) -> Result<(), CallError> + 'static,
    ) -> Self {
        self.properties.insert(
            name.into(),
            PropertyEntry {
                signature: signature.to_string(),
                getter: Rc::new(getter),
                setter: Some(Rc::new(setter)),
            },
        );
        self
    }

    /// Declare a signal for introspection.
    pub fn signal(mut self, name: impl Into<String>, signature: &str) -> Self {
        self.signals.insert(name.into(), signature.to_string());
        self
    }

    fn write_xml(&self, out: &mut String) {
        out.push_str(&format!("  <interface name=\"{}\">\n", self.interface));
        for (name, method) in &self.methods {
            out.push_str(&format!("    <method name=\"{name}\">\n"));
            write_args(out, &method.in_sig, Some("in"));
            write_args(out, &method.out_sig, Some("out"));
            out.push_str("    </method>\n");
        }
        for (name, sig) in &self.signals {
            out.push_str(&format!("    <signal name=\"{name}\">\n"));
            write_args(out, sig, None);
            out.push_str("    </signal>\n");
        }
        for (name, prop) in &self.properties {
            let access = if prop.setter.is_some() { "readwrite" } else { "read" };
            out.push_str(&format!(
                "    <property name=\"{name}\" type=\"{}\" access=\"{access}\"/>\n",
                prop.signature
            ));
        }
        out.push_str("  </interface>\n");
    }
}

fn write_args(out: &mut String, signature: &str, direction: Option<&str>) {
    let Ok(parts) = Signature::parse_list(signature) else {
        return;
    };
    for (i, sig) in parts.iter().enumerate() {
        match direction {
            Some(dir) => {
                out.push_str(&format!("      <arg name=\"arg{i}\" type=\"{sig}\" direction=\"{dir}\"/>\n"));
            }
            None => {
                out.push_str(&format!("      <arg name=\"arg{i}\" type=\"{sig}\"/>\n"));
            }
        }
    }
}

/// Everything needed to register one object.
#[derive(Clone)]
pub struct ObjectSpec {
    pub(crate) path: String,
    pub(crate) vtables: Vec<Vtable>,
    pub(crate) ownable: bool,
    pub(crate) on_owner_quit: Option<ObjectHook>,
    pub(crate) on_removed: Option<ObjectHook>,
}

impl ObjectSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            vtables: Vec::new(),
            ownable: false,
            on_owner_quit: None,
            on_removed: None,
        }
    }

    pub fn interface(mut self, vtable: Vtable) -> Self {
        self.vtables.push(vtable);
        self
    }

    /// Expose `de.gsi.saftlib.Owned` on this object.
    pub fn ownable(mut self) -> Self {
        self.ownable = true;
        self
    }

    /// Runs when the owning connection goes away without disowning.
    pub fn on_owner_quit(mut self, hook: impl Fn(&Service) + 'static) -> Self {
        self.on_owner_quit = Some(Rc::new(hook));
        self
    }

    /// Runs after the object was removed from the registry.
    pub fn on_removed(mut self, hook: impl Fn(&Service) + 'static) -> Self {
        self.on_removed = Some(Rc::new(hook));
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

struct ObjectEntry {
    index: u32,
    interfaces: BTreeMap<String, Vtable>,
    ownable: bool,
    on_owner_quit: Option<ObjectHook>,
    on_removed: Option<ObjectHook>,
}

/// What [`Registry::remove`] hands back so the caller can notify.
pub(crate) struct RemovedObject {
    pub(crate) index: u32,
    pub(crate) interfaces: Vec<String>,
    pub(crate) ownable: bool,
    pub(crate) on_removed: Option<ObjectHook>,
}

/// A method ready to run, cloned out of the registry.
pub(crate) struct ResolvedMethod {
    pub(crate) handler: MethodHandler,
    pub(crate) in_sig: String,
    pub(crate) owner_only: bool,
}

#[derive(Default)]
pub struct Registry {
    objects: BTreeMap<String, ObjectEntry>,
    object_counter: u32,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `spec`, returning the object's index.
    ///
    /// Fails with `DuplicateObject` if any (interface, path) pair already
    /// exists, and with `InvalidArgs` for a malformed path or a vtable using
    /// a reserved interface name.
    pub fn register(&mut self, spec: ObjectSpec) -> Result<u32, CallError> {
        validate_path(&spec.path)?;
        let mut seen = BTreeSet::new();
        for vtable in &spec.vtables {
            let iface = vtable.interface.as_str();
            if is_standard_interface(iface) {
                return Err(CallError::invalid_args(format!(
                    "interface {iface} is provided by the bus"
                )));
            }
            let taken = self
                .objects
                .get(&spec.path)
                .is_some_and(|entry| entry.interfaces.contains_key(iface));
            if taken || !seen.insert(iface) {
                return Err(CallError::new(
                    ErrorKind::DuplicateObject,
                    format!("{iface} already registered at {}", spec.path),
                ));
            }
        }

        let ObjectSpec {
            path,
            vtables,
            ownable,
            on_owner_quit,
            on_removed,
        } = spec;
        if !self.objects.contains_key(&path) {
            self.object_counter += 1;
        }
        let next_index = self.object_counter;
        let entry = self.objects.entry(path).or_insert_with(|| ObjectEntry {
            index: next_index,
            interfaces: BTreeMap::new(),
            ownable: false,
            on_owner_quit: None,
            on_removed: None,
        });
        for vtable in vtables {
            entry.interfaces.insert(vtable.interface.clone(), vtable);
        }
        entry.ownable |= ownable;
        if on_owner_quit.is_some() {
            entry.on_owner_quit = on_owner_quit;
        }
        if on_removed.is_some() {
            entry.on_removed = on_removed;
        }
        Ok(entry.index)
    }

    pub(crate) fn remove(&mut self, path: &str) -> Option<RemovedObject> {
        let entry = self.objects.remove(path)?;
        Some(RemovedObject {
            index: entry.index,
            interfaces: entry.interfaces.into_keys().collect(),
            ownable: entry.ownable,
            on_removed: entry.on_removed,
        })
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.contains_key(path)
    }

    /// Whether `interface` is served at `path`, counting the standard facets.
    pub fn has_interface(&self, path: &str, interface: &str) -> bool {
        self.objects.get(path).is_some_and(|entry| {
            entry.interfaces.contains_key(interface)
                || interface == PROPERTIES_INTERFACE
                || interface == INTROSPECTABLE_INTERFACE
                || (interface == OWNED_INTERFACE && entry.ownable)
        })
    }

    pub fn is_ownable(&self, path: &str) -> bool {
        self.objects.get(path).is_some_and(|entry| entry.ownable)
    }

    pub fn index_of(&self, path: &str) -> Option<u32> {
        self.objects.get(path).map(|entry| entry.index)
    }

    /// Application interfaces registered at `path`.
    pub fn interfaces(&self, path: &str) -> Vec<String> {
        self.objects
            .get(path)
            .map(|entry| entry.interfaces.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    /// Paths equal to `prefix` or below it.
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        let nested = format!("{}/", prefix.trim_end_matches('/'));
        self.objects
            .keys()
            .filter(|p| p.as_str() == prefix || p.starts_with(&nested))
            .cloned()
            .collect()
    }

    pub fn object_counter(&self) -> u32 {
        self.object_counter
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub(crate) fn owner_quit_hook(&self, path: &str) -> Option<ObjectHook> {
        self.objects.get(path).and_then(|entry| entry.on_owner_quit.clone())
    }

    fn vtable(&self, path: &str, interface: &str) -> Result<&Vtable, CallError> {
        let entry = self
            .objects
            .get(path)
            .ok_or_else(|| no_such_object(path, interface))?;
        entry
            .interfaces
            .get(interface)
            .ok_or_else(|| no_such_object(path, interface))
    }

    pub(crate) fn resolve_method(
        &self,
        path: &str,
        interface: &str,
        method: &str,
    ) -> Result<ResolvedMethod, CallError> {
        let vtable = self.vtable(path, interface)?;
        let entry = vtable.methods.get(method).ok_or_else(|| {
            CallError::new(
                ErrorKind::NoSuchMethod,
                format!("no method {interface}.{method} at {path}"),
            )
        })?;
        Ok(ResolvedMethod {
            handler: Rc::clone(&entry.handler),
            in_sig: entry.in_sig.clone(),
            owner_only: vtable.owner_only.contains(method),
        })
    }

    /// Property entry plus whether its setter is owner-only.
    pub(crate) fn resolve_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<(PropertyEntry, bool), CallError> {
        let vtable = self.vtable(path, interface)?;
        let entry = vtable.properties.get(name).ok_or_else(|| {
            CallError::new(
                ErrorKind::NoSuchProperty,
                format!("no property {interface}.{name} at {path}"),
            )
        })?;
        Ok((entry.clone(), vtable.owner_only.contains(name)))
    }

    pub(crate) fn property_getters(
        &self,
        path: &str,
        interface: &str,
    ) -> Result<Vec<(String, PropertyGetter)>, CallError> {
        let vtable = self.vtable(path, interface)?;
        Ok(vtable
            .properties
            .iter()
            .map(|(name, entry)| (name.clone(), Rc::clone(&entry.getter)))
            .collect())
    }

    /// interface -> path -> index, for STATUS and GET_STATE.
    pub fn index_table(&self) -> IndexTable {
        let mut table = IndexTable::new();
        for (path, entry) in &self.objects {
            for iface in entry.interfaces.keys() {
                table
                    .entry(iface.clone())
                    .or_default()
                    .insert(path.clone(), entry.index);
            }
        }
        table
    }

    /// D-Bus style introspection XML for `path`.
    pub fn introspect(&self, path: &str) -> Result<String, CallError> {
        let entry = self
            .objects
            .get(path)
            .ok_or_else(|| no_such_object(path, INTROSPECTABLE_INTERFACE))?;

        let mut out = String::from(
            "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \
             \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n",
        );
        out.push_str(&format!("<node name=\"{path}\">\n"));
        for vtable in entry.interfaces.values() {
            vtable.write_xml(&mut out);
        }
        for vtable in standard_vtables(entry.ownable) {
            vtable.write_xml(&mut out);
        }
        for child in self.children(path) {
            out.push_str(&format!("  <node name=\"{child}\"/>\n"));
        }
        out.push_str("</node>\n");
        Ok(out)
    }

    /// Names of the direct child nodes of `path`.
    fn children(&self, path: &str) -> BTreeSet<String> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.objects
            .keys()
            .filter_map(|p| p.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Descriptions of the facets the bus serves itself, for introspection only.
fn standard_vtables(ownable: bool) -> Vec<Vtable> {
    let unused =
        |_: &mut CallContext, _: &[Value]| -> Result<Vec<Value>, CallError> { Ok(Vec::new()) };
    let mut tables = vec![
        Vtable::new(PROPERTIES_INTERFACE)
            .method("Get", "ss", "v", unused)
            .method("Set", "ssv", "", unused)
            .method("GetAll", "s", "a{sv}", unused)
            .signal(PROPERTIES_CHANGED, "sa{sv}as"),
        Vtable::new(INTROSPECTABLE_INTERFACE).method("Introspect", "", "s", unused),
    ];
    if ownable {
        tables.push(
            Vtable::new(OWNED_INTERFACE)
                .method("Own", "", "", unused)
                .method("Disown", "", "", unused)
                .property("Owner", "s", || Ok(Value::Str(String::new())))
                .signal("Destroyed", ""),
        );
    }
    tables
}

fn is_standard_interface(iface: &str) -> bool {
    iface == PROPERTIES_INTERFACE || iface == INTROSPECTABLE_INTERFACE || iface == OWNED_INTERFACE
}

fn validate_path(path: &str) -> Result<(), CallError> {
    let valid = path == "/"
        || (path.starts_with('/')
            && !path.ends_with('/')
            && path[1..].split('/').all(|segment| {
                !segment.is_empty()
                    && segment
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
            }));
    if valid {
        Ok(())
    } else {
        Err(CallError::invalid_args(format!("invalid object path '{path}'")))
    }
}

fn no_such_object(path: &str, interface: &str) -> CallError {
    CallError::new(
        ErrorKind::NoSuchObject,
        format!("no object {path} with interface {interface}"),
    )
}
